// Anchor clock synchronization tracking
//
// Every anchor timestamps the periodic Sync broadcast. Frame k is emitted at
// reference time k * tau, so the anchor's clock error at frame k is
// E_k = T_k - k * tau (minus the time of flight from the sync source, when known).
// Two consecutive errors give a linear offset/drift model per anchor.

use std::collections::HashMap;

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{PositionError, Result};
use crate::geometry::{AnchorGeometry, AnchorId};
use crate::report::LinearizedReport;

/// Clock model parameters shared by all anchors.
#[derive(Debug, Clone)]
pub struct ClockConfig {
    /// Nominal sync-frame emission interval in anchor ticks
    pub sync_interval_ticks: f64,
    /// Time of flight from the sync source to each anchor, in ticks
    pub sync_delays: HashMap<AnchorId, f64>,
}

impl ClockConfig {
    pub fn new(sync_interval_ticks: f64) -> Self {
        ClockConfig {
            sync_interval_ticks,
            sync_delays: HashMap::new(),
        }
    }

    /// Compensate sync-frame propagation from a source at a known position.
    pub fn with_sync_source(mut self, geometry: &AnchorGeometry, source: [f64; 2], tick_seconds: f64) -> Self {
        self.sync_delays = geometry
            .anchors()
            .iter()
            .zip(geometry.flight_times(source))
            .map(|(a, seconds)| (a.id.clone(), seconds / tick_seconds))
            .collect();
        self
    }

    fn sync_delay(&self, anchor_id: &str) -> f64 {
        self.sync_delays.get(anchor_id).copied().unwrap_or(0.0)
    }
}

/// A linearized Sync frame observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SyncSample {
    pub sequence: u64,
    pub timestamp: u64,
}

/// Linear clock error model of one anchor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClockModel {
    pub anchor_id: AnchorId,
    /// Clock error at the reference Sync frame (ticks)
    pub offset: f64,
    /// Clock error rate (ticks per tick)
    pub drift: f64,
    /// Linearized sequence of the Sync frame the model was computed at
    pub updated_at: u64,
    /// Linearized timestamp of that Sync frame (ticks)
    pub reference_timestamp: u64,
}

impl ClockModel {
    /// Clock error E_k of an anchor at a Sync frame.
    pub fn clock_error(sample: &SyncSample, sync_interval_ticks: f64, sync_delay: f64) -> f64 {
        sample.timestamp as f64 - sample.sequence as f64 * sync_interval_ticks - sync_delay
    }

    /// Forward-difference model from two consecutive Sync frames.
    pub fn from_sync_pair(
        anchor_id: &str,
        previous: &SyncSample,
        latest: &SyncSample,
        sync_interval_ticks: f64,
        sync_delay: f64,
    ) -> Result<Self> {
        if latest.sequence == previous.sequence {
            return Err(PositionError::ClockModelDivisionFault {
                anchor_id: anchor_id.to_string(),
                sequence: latest.sequence,
            });
        }

        let e_prev = Self::clock_error(previous, sync_interval_ticks, sync_delay);
        let e_latest = Self::clock_error(latest, sync_interval_ticks, sync_delay);
        let delta_k = latest.sequence as f64 - previous.sequence as f64;
        let drift = (e_latest - e_prev) / (delta_k * sync_interval_ticks);

        if !drift.is_finite() || !e_latest.is_finite() {
            return Err(PositionError::ClockModelDivisionFault {
                anchor_id: anchor_id.to_string(),
                sequence: latest.sequence,
            });
        }

        Ok(ClockModel {
            anchor_id: anchor_id.to_string(),
            offset: e_latest,
            drift,
            updated_at: latest.sequence,
            reference_timestamp: latest.timestamp,
        })
    }

    /// Map an anchor timestamp (ticks) onto the shared reference time (ticks).
    ///
    /// corrected = T - (offset + drift * (T - T_ref))
    pub fn correct(&self, timestamp: u64) -> f64 {
        // Work relative to T_ref so large counter values keep their precision
        let dt = (timestamp as i128 - self.reference_timestamp as i128) as f64;
        let reference = self.reference_timestamp as f64 - self.offset;
        reference + dt - self.drift * dt
    }
}

/// Result of feeding a Sync frame to the tracker.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    /// First Sync frame for the anchor: stored, no model yet
    InsufficientHistory,
    /// Model created or replaced
    Updated(ClockModel),
}

/// A tag timestamp after clock correction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CorrectedTime {
    /// Corrected time in ticks
    pub ticks: f64,
    /// False when no model existed and the timestamp passed through unchanged
    pub model_applied: bool,
}

#[derive(Debug, Clone)]
struct AnchorClock {
    previous: Option<SyncSample>,
    latest: SyncSample,
    model: Option<ClockModel>,
}

/// Snapshot of one anchor's clock state.
#[derive(Debug, Clone, Serialize)]
pub struct AnchorClockState {
    pub anchor_id: AnchorId,
    /// Latest two Sync frames, oldest first
    pub sync_history: Vec<SyncSample>,
    pub model: Option<ClockModel>,
}

/// Clock model store: one live model per anchor.
#[derive(Debug)]
pub struct ClockTracker {
    config: ClockConfig,
    anchors: HashMap<AnchorId, AnchorClock>,
}

impl ClockTracker {
    pub fn new(config: ClockConfig) -> Self {
        ClockTracker {
            config,
            anchors: HashMap::new(),
        }
    }

    /// Feed a linearized Sync report.
    ///
    /// On error the store is left exactly as it was.
    pub fn update(&mut self, report: &LinearizedReport) -> Result<SyncOutcome> {
        let sample = SyncSample {
            sequence: report.sequence,
            timestamp: report.timestamp,
        };
        let anchor_id = report.anchor_id.as_str();

        let Some(state) = self.anchors.get_mut(anchor_id) else {
            debug!(anchor_id, sequence = sample.sequence, "First sync frame, waiting for a second");
            self.anchors.insert(
                anchor_id.to_string(),
                AnchorClock {
                    previous: None,
                    latest: sample,
                    model: None,
                },
            );
            return Ok(SyncOutcome::InsufficientHistory);
        };

        let model = ClockModel::from_sync_pair(
            anchor_id,
            &state.latest,
            &sample,
            self.config.sync_interval_ticks,
            self.config.sync_delay(anchor_id),
        )
        .inspect_err(|e| warn!(anchor_id, "Skipping clock model update: {}", e))?;

        debug!(
            anchor_id,
            sequence = model.updated_at,
            offset = model.offset,
            drift = model.drift,
            "Clock model updated"
        );

        state.previous = Some(state.latest);
        state.latest = sample;
        state.model = Some(model.clone());
        Ok(SyncOutcome::Updated(model))
    }

    pub fn model(&self, anchor_id: &str) -> Option<&ClockModel> {
        self.anchors.get(anchor_id).and_then(|s| s.model.as_ref())
    }

    /// Correct a linearized tag timestamp with the anchor's current model.
    ///
    /// Without a model the timestamp passes through uncorrected.
    pub fn correct(&self, anchor_id: &str, timestamp: u64) -> Result<CorrectedTime> {
        let corrected = match self.model(anchor_id) {
            Some(model) => CorrectedTime {
                ticks: model.correct(timestamp),
                model_applied: true,
            },
            None => {
                debug!(anchor_id, "No clock model yet, using uncorrected timestamp");
                CorrectedTime {
                    ticks: timestamp as f64,
                    model_applied: false,
                }
            }
        };

        if !corrected.ticks.is_finite() {
            return Err(PositionError::NonFiniteCorrectedTime {
                anchor_id: anchor_id.to_string(),
            });
        }
        Ok(corrected)
    }

    /// Drop an anchor's sync history and model.
    pub fn reset(&mut self, anchor_id: &str) -> bool {
        self.anchors.remove(anchor_id).is_some()
    }

    pub fn num_models(&self) -> usize {
        self.anchors.values().filter(|s| s.model.is_some()).count()
    }

    pub fn snapshot(&self) -> Vec<AnchorClockState> {
        let mut states: Vec<AnchorClockState> = self
            .anchors
            .iter()
            .map(|(id, s)| AnchorClockState {
                anchor_id: id.clone(),
                sync_history: s.previous.iter().copied().chain(std::iter::once(s.latest)).collect(),
                model: s.model.clone(),
            })
            .collect();
        states.sort_by(|a, b| a.anchor_id.cmp(&b.anchor_id));
        states
    }
}
