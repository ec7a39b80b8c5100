// Counter rollover linearization
//
// Anchor hardware timestamps (40-bit) and frame sequence numbers (8-bit) wrap.
// Each counter is unwrapped per key into a monotonically non-decreasing u64.

use std::collections::HashMap;

use tracing::error;

use crate::error::{PositionError, Result};
use crate::geometry::AnchorId;
use crate::report::{FrameType, LinearizedReport, RawReport};

/// Unwrap `current_raw` against the previous linearized value of the same counter.
///
/// At most one rollover can be inferred from the values alone; detecting
/// multiple wraps needs elapsed time, see [`Counter::peek`].
pub fn linearize(current_raw: u64, previous_linearized: u64, modulus: u64) -> u64 {
    let previous_raw = previous_linearized % modulus;
    let base = previous_linearized - previous_raw;
    if current_raw >= previous_raw {
        base + current_raw
    } else {
        base + modulus + current_raw
    }
}

/// Unwrap `raw` to whichever wrap of the counter lies nearest `reference`.
///
/// Used for values that may predate the reference, such as a tag timestamp
/// resubmitted after newer reports were committed.
pub fn linearize_nearest(raw: u64, reference: u64, modulus: u64) -> u64 {
    let half = modulus / 2;
    let candidate = reference - reference % modulus + raw;
    if candidate > reference + half && candidate >= modulus {
        candidate - modulus
    } else if candidate + half < reference {
        candidate + modulus
    } else {
        candidate
    }
}

/// Rollover state of a single wrapping counter.
#[derive(Debug, Clone)]
pub struct Counter {
    modulus: u64,
    /// Seconds needed for the counter to traverse its modulus, if known
    wrap_period: Option<f64>,
    /// Last committed (linearized value, host receipt time)
    last: Option<(u64, f64)>,
}

impl Counter {
    pub fn new(modulus: u64, wrap_period: Option<f64>) -> Self {
        Counter {
            modulus,
            wrap_period,
            last: None,
        }
    }

    /// Last committed linearized value.
    pub fn last(&self) -> Option<u64> {
        self.last.map(|(v, _)| v)
    }

    /// Counter whose history starts at `reference`, committed at `now`.
    pub fn with_reference(mut self, reference: u64, now: f64) -> Self {
        self.last = Some((reference, now));
        self
    }

    fn check_raw(&self, key: &str, raw: u64) -> Result<()> {
        if raw >= self.modulus {
            return Err(PositionError::MalformedReport(format!(
                "{}: raw value {} exceeds counter modulus {}",
                key, raw, self.modulus
            )));
        }
        Ok(())
    }

    fn check_elapsed(&self, key: &str, seen_at: f64, now: f64) -> Result<()> {
        if let Some(period) = self.wrap_period {
            let elapsed = (now - seen_at).max(0.0);
            if elapsed > period {
                return Err(PositionError::RolloverAmbiguity {
                    key: key.to_string(),
                    elapsed,
                    period,
                });
            }
        }
        Ok(())
    }

    /// Compute the linearized value for `raw` without touching state.
    ///
    /// `key` only labels errors.
    pub fn peek(&self, key: &str, raw: u64, now: f64) -> Result<u64> {
        self.check_raw(key, raw)?;
        let Some((previous, seen_at)) = self.last else {
            return Ok(raw);
        };
        self.check_elapsed(key, seen_at, now)?;
        Ok(linearize(raw, previous, self.modulus))
    }

    /// Like [`peek`](Self::peek), but `raw` may lie before the last committed
    /// value as well as after it.
    pub fn peek_nearest(&self, key: &str, raw: u64, now: f64) -> Result<u64> {
        self.check_raw(key, raw)?;
        let Some((previous, seen_at)) = self.last else {
            return Ok(raw);
        };
        self.check_elapsed(key, seen_at, now)?;
        Ok(linearize_nearest(raw, previous, self.modulus))
    }

    pub fn commit(&mut self, linearized: u64, now: f64) {
        self.last = Some((linearized, now));
    }
}

/// Wrap parameters for the linearizer store.
#[derive(Debug, Clone)]
pub struct LinearizerConfig {
    pub timestamp_modulus: u64,
    pub sequence_modulus: u64,
    /// Wrap period of the timestamp counter (s)
    pub timestamp_period: Option<f64>,
    /// Wrap period of the Sync sequence counter (s)
    pub sync_sequence_period: Option<f64>,
    /// Wrap period of the Tag sequence counter (s)
    pub tag_sequence_period: Option<f64>,
}

/// Keyed rollover state: timestamps per anchor, sequences per (anchor, frame type).
#[derive(Debug)]
pub struct CounterTracker {
    config: LinearizerConfig,
    timestamps: HashMap<AnchorId, Counter>,
    sequences: HashMap<(AnchorId, FrameType), Counter>,
}

impl CounterTracker {
    pub fn new(config: LinearizerConfig) -> Self {
        CounterTracker {
            config,
            timestamps: HashMap::new(),
            sequences: HashMap::new(),
        }
    }

    fn timestamp_counter(&self, anchor_id: &str) -> Counter {
        self.timestamps
            .get(anchor_id)
            .cloned()
            .unwrap_or_else(|| Counter::new(self.config.timestamp_modulus, self.config.timestamp_period))
    }

    fn sequence_counter(&self, anchor_id: &str, frame_type: FrameType) -> Counter {
        let period = match frame_type {
            FrameType::Sync => self.config.sync_sequence_period,
            FrameType::Tag => self.config.tag_sequence_period,
        };
        self.sequences
            .get(&(anchor_id.to_string(), frame_type))
            .cloned()
            .unwrap_or_else(|| Counter::new(self.config.sequence_modulus, period))
    }

    /// Newest committed sequence of `frame_type` among anchors other than `anchor_id`.
    fn newest_sequence(&self, anchor_id: &str, frame_type: FrameType) -> Option<u64> {
        self.sequences
            .iter()
            .filter(|((id, ft), _)| *ft == frame_type && id != anchor_id)
            .filter_map(|(_, counter)| counter.last())
            .max()
    }

    fn log_ambiguity(result: &Result<u64>, anchor_id: &str, counter: &str) {
        if let Err(PositionError::RolloverAmbiguity { elapsed, period, .. }) = result {
            error!(
                anchor_id,
                counter,
                elapsed,
                period,
                "Counter may have wrapped more than once; reports stay rejected until the anchor is reset"
            );
        }
    }

    /// Linearize a timestamp for `anchor_id` without committing it.
    pub fn peek_timestamp(&self, anchor_id: &str, raw: u64, now: f64) -> Result<u64> {
        let key = format!("{}/timestamp", anchor_id);
        let result = self.timestamp_counter(anchor_id).peek(&key, raw, now);
        Self::log_ambiguity(&result, anchor_id, "timestamp");
        result
    }

    /// Linearize a timestamp that may predate the anchor's last committed one.
    pub fn nearest_timestamp(&self, anchor_id: &str, raw: u64, now: f64) -> Result<u64> {
        let key = format!("{}/timestamp", anchor_id);
        let result = self.timestamp_counter(anchor_id).peek_nearest(&key, raw, now);
        Self::log_ambiguity(&result, anchor_id, "timestamp");
        result
    }

    /// Linearize both counters of `report` without committing anything.
    ///
    /// An anchor without sequence history of this frame type joins at the
    /// wrap nearest the newest sequence seen from the other anchors.
    pub fn peek(&self, report: &RawReport, now: f64) -> Result<LinearizedReport> {
        let timestamp = self.peek_timestamp(&report.anchor_id, report.timestamp, now)?;

        let key = format!("{}/{}-sequence", report.anchor_id, report.frame_type);
        let counter = self.sequence_counter(&report.anchor_id, report.frame_type);
        let raw = report.sequence as u64;
        let sequence = match (counter.last(), self.newest_sequence(&report.anchor_id, report.frame_type)) {
            (None, Some(reference)) => counter.with_reference(reference, now).peek_nearest(&key, raw, now),
            _ => counter.peek(&key, raw, now),
        };
        Self::log_ambiguity(&sequence, &report.anchor_id, "sequence");

        Ok(LinearizedReport {
            anchor_id: report.anchor_id.clone(),
            timestamp,
            frame_type: report.frame_type,
            sequence: sequence?,
        })
    }

    /// Store the linearized values of a report previously returned by [`peek`](Self::peek).
    pub fn commit(&mut self, report: &LinearizedReport, now: f64) {
        let mut ts = self.timestamp_counter(&report.anchor_id);
        ts.commit(report.timestamp, now);
        self.timestamps.insert(report.anchor_id.clone(), ts);

        let mut seq = self.sequence_counter(&report.anchor_id, report.frame_type);
        seq.commit(report.sequence, now);
        self.sequences
            .insert((report.anchor_id.clone(), report.frame_type), seq);
    }

    /// Peek and commit in one step.
    pub fn linearize(&mut self, report: &RawReport, now: f64) -> Result<LinearizedReport> {
        let linearized = self.peek(report, now)?;
        self.commit(&linearized, now);
        Ok(linearized)
    }

    /// Forget all counter history of an anchor. Returns false if there was none.
    pub fn reset(&mut self, anchor_id: &str) -> bool {
        let had_timestamp = self.timestamps.remove(anchor_id).is_some();
        let before = self.sequences.len();
        self.sequences.retain(|(id, _), _| id != anchor_id);
        had_timestamp || self.sequences.len() != before
    }

    /// Last committed linearized timestamp of an anchor.
    pub fn last_timestamp(&self, anchor_id: &str) -> Option<u64> {
        self.timestamps.get(anchor_id).and_then(|c| c.last())
    }
}
