// Validated anchor reports

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::geometry::AnchorId;

/// Kind of frame an anchor timestamped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameType {
    /// Periodic reference broadcast used for clock synchronization
    Sync,
    /// Blink from the tag being located
    Tag,
}

impl FromStr for FrameType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sync" => Ok(FrameType::Sync),
            "tag" => Ok(FrameType::Tag),
            other => Err(format!("unknown frame_type '{}'", other)),
        }
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameType::Sync => write!(f, "sync"),
            FrameType::Tag => write!(f, "tag"),
        }
    }
}

/// One timestamp report as produced by anchor hardware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawReport {
    pub anchor_id: AnchorId,
    /// Wrapping hardware counter value
    pub timestamp: u64,
    pub frame_type: FrameType,
    /// Wrapping frame sequence number
    pub sequence: u32,
}

/// A report whose counters have been unwrapped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinearizedReport {
    pub anchor_id: AnchorId,
    pub timestamp: u64,
    pub frame_type: FrameType,
    pub sequence: u64,
}

/// Solved tag position for one sequence number
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PositionEstimate {
    pub x: f64,
    pub y: f64,
    pub sequence: u64,
    /// RMS of the range-difference residuals (m)
    pub rms_residual: f64,
    pub dop: f64,
    pub iterations: usize,
    /// Anchors whose timestamps had no clock model applied
    pub uncorrected_anchors: usize,
}
