// Quorum aggregation of tag frames
//
// Tag timestamps are grouped by linearized tag sequence number until every
// configured anchor has reported once. A complete batch is released exactly
// once; incomplete ones are evicted by sequence horizon or age.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::debug;

use crate::error::{PositionError, Result};
use crate::geometry::AnchorId;

/// Retention policy for incomplete batches.
#[derive(Debug, Clone)]
pub struct QuorumConfig {
    /// Batches more than this many sequence numbers behind the newest are dropped
    pub sequence_horizon: u64,
    /// Batches older than this (s) are dropped by [`QuorumTracker::expire`]
    pub max_age: f64,
}

/// Tag timestamps for one sequence number
#[derive(Debug, Clone, PartialEq)]
pub struct QuorumBatch {
    pub sequence: u64,
    /// Host time the first report for this sequence arrived
    pub first_seen: f64,
    /// Linearized tag timestamp per anchor
    pub entries: HashMap<AnchorId, u64>,
}

impl QuorumBatch {
    pub fn new(sequence: u64, first_seen: f64) -> Self {
        QuorumBatch {
            sequence,
            first_seen,
            entries: HashMap::new(),
        }
    }
}

/// What happened to a tag report.
#[derive(Debug, Clone, PartialEq)]
pub enum TagOutcome {
    /// Stored; `count` distinct anchors so far
    Collecting { sequence: u64, count: usize },
    /// This report completed the quorum
    Complete(QuorumBatch),
    /// Sequence is behind the retention horizon
    Stale,
    /// Sequence already completed and was emitted
    AlreadyEmitted,
}

/// Quorum aggregator keyed by tag sequence number.
#[derive(Debug)]
pub struct QuorumTracker {
    anchors: Vec<AnchorId>,
    config: QuorumConfig,
    batches: BTreeMap<u64, QuorumBatch>,
    /// Sequences already emitted, kept within the horizon
    completed: BTreeSet<u64>,
    newest: Option<u64>,
    pub evicted: usize,
}

impl QuorumTracker {
    pub fn new(anchors: Vec<AnchorId>, config: QuorumConfig) -> Self {
        QuorumTracker {
            anchors,
            config,
            batches: BTreeMap::new(),
            completed: BTreeSet::new(),
            newest: None,
            evicted: 0,
        }
    }

    /// Number of anchors needed for quorum.
    pub fn required(&self) -> usize {
        self.anchors.len()
    }

    /// Number of incomplete batches held.
    pub fn pending(&self) -> usize {
        self.batches.len()
    }

    fn cutoff(&self) -> u64 {
        self.newest
            .map(|n| n.saturating_sub(self.config.sequence_horizon))
            .unwrap_or(0)
    }

    /// Add one anchor's tag timestamp for `sequence`.
    pub fn add(&mut self, anchor_id: &str, sequence: u64, timestamp: u64, now: f64) -> Result<TagOutcome> {
        if !self.anchors.iter().any(|a| a == anchor_id) {
            return Err(PositionError::MalformedReport(format!(
                "unknown anchor '{}'",
                anchor_id
            )));
        }

        if sequence < self.cutoff() {
            debug!(anchor_id, sequence, "Dropping tag report behind quorum horizon");
            return Ok(TagOutcome::Stale);
        }
        if self.completed.contains(&sequence) {
            debug!(anchor_id, sequence, "Dropping tag report for already emitted sequence");
            return Ok(TagOutcome::AlreadyEmitted);
        }

        self.newest = Some(self.newest.map_or(sequence, |n| n.max(sequence)));

        let batch = self
            .batches
            .entry(sequence)
            .or_insert_with(|| QuorumBatch::new(sequence, now));
        batch.entries.insert(anchor_id.to_string(), timestamp);
        let count = batch.entries.len();

        let outcome = if count >= self.anchors.len() {
            let batch = self
                .batches
                .remove(&sequence)
                .unwrap_or_else(|| QuorumBatch::new(sequence, now));
            self.completed.insert(sequence);
            TagOutcome::Complete(batch)
        } else {
            TagOutcome::Collecting { sequence, count }
        };

        self.prune();
        Ok(outcome)
    }

    /// Drop batches and tombstones behind the sequence horizon.
    fn prune(&mut self) {
        let cutoff = self.cutoff();
        let keep = self.batches.split_off(&cutoff);
        let dropped = std::mem::replace(&mut self.batches, keep);
        if !dropped.is_empty() {
            debug!(count = dropped.len(), cutoff, "Evicted incomplete quorum batches");
            self.evicted += dropped.len();
        }
        self.completed = self.completed.split_off(&cutoff);
    }

    /// Remove an anchor's entries from incomplete batches; batches left empty
    /// are dropped. Returns how many entries were removed.
    pub fn forget_anchor(&mut self, anchor_id: &str) -> usize {
        let mut removed = 0;
        for batch in self.batches.values_mut() {
            if batch.entries.remove(anchor_id).is_some() {
                removed += 1;
            }
        }
        self.batches.retain(|_, b| !b.entries.is_empty());
        removed
    }

    /// Drop incomplete batches older than the configured age. Returns how many.
    pub fn expire(&mut self, now: f64) -> usize {
        let max_age = self.config.max_age;
        let before = self.batches.len();
        self.batches.retain(|_, b| now - b.first_seen <= max_age);
        let expired = before - self.batches.len();
        if expired > 0 {
            debug!(expired, "Expired incomplete quorum batches");
            self.evicted += expired;
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> QuorumTracker {
        QuorumTracker::new(
            vec!["a1".into(), "a2".into(), "a3".into(), "a4".into()],
            QuorumConfig {
                sequence_horizon: 10,
                max_age: 2.0,
            },
        )
    }

    #[test]
    fn test_quorum_emits_exactly_once() {
        let mut q = tracker();
        for (i, anchor) in ["a1", "a2", "a3"].iter().enumerate() {
            let outcome = q.add(anchor, 7, 100 + i as u64, 0.0).unwrap();
            assert_eq!(outcome, TagOutcome::Collecting { sequence: 7, count: i + 1 });
        }

        let batch = match q.add("a4", 7, 103, 0.1).unwrap() {
            TagOutcome::Complete(batch) => batch,
            other => panic!("expected complete, got {:?}", other),
        };
        assert_eq!(batch.sequence, 7);
        assert_eq!(batch.entries.len(), 4);
        assert_eq!(batch.entries["a4"], 103);
        assert_eq!(q.pending(), 0);

        // Late duplicate does not re-emit
        assert_eq!(q.add("a4", 7, 104, 0.2).unwrap(), TagOutcome::AlreadyEmitted);
        assert_eq!(q.pending(), 0);
    }

    #[test]
    fn test_duplicate_anchor_overwrites() {
        let mut q = tracker();
        q.add("a1", 3, 10, 0.0).unwrap();
        q.add("a2", 3, 20, 0.0).unwrap();
        assert_eq!(
            q.add("a2", 3, 25, 0.0).unwrap(),
            TagOutcome::Collecting { sequence: 3, count: 2 }
        );
        q.add("a3", 3, 30, 0.0).unwrap();
        match q.add("a4", 3, 40, 0.0).unwrap() {
            TagOutcome::Complete(batch) => assert_eq!(batch.entries["a2"], 25),
            other => panic!("expected complete, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_anchor_rejected() {
        let mut q = tracker();
        let err = q.add("a9", 1, 10, 0.0).unwrap_err();
        assert_eq!(err.reason_code(), "MalformedReport");
        assert_eq!(q.pending(), 0);
    }

    #[test]
    fn test_sequence_horizon_eviction() {
        let mut q = tracker();
        q.add("a1", 1, 10, 0.0).unwrap();
        q.add("a1", 5, 10, 0.0).unwrap();
        assert_eq!(q.pending(), 2);

        // Newest 20 puts the cutoff at 10
        q.add("a1", 20, 10, 0.0).unwrap();
        assert_eq!(q.pending(), 1);
        assert_eq!(q.evicted, 2);

        assert_eq!(q.add("a2", 5, 10, 0.0).unwrap(), TagOutcome::Stale);
    }

    #[test]
    fn test_age_expiry() {
        let mut q = tracker();
        q.add("a1", 1, 10, 0.0).unwrap();
        q.add("a1", 2, 10, 1.5).unwrap();
        assert_eq!(q.expire(3.0), 1);
        assert_eq!(q.pending(), 1);
        assert_eq!(q.expire(10.0), 1);
        assert_eq!(q.pending(), 0);
    }

    #[test]
    fn test_interleaved_sequences() {
        let mut q = tracker();
        let mut completed = Vec::new();
        for anchor in ["a1", "a2", "a3", "a4"] {
            for seq in [11, 12] {
                if let TagOutcome::Complete(b) = q.add(anchor, seq, seq, 0.0).unwrap() {
                    completed.push(b.sequence);
                }
            }
        }
        assert_eq!(completed, vec![11, 12]);
    }

    #[test]
    fn test_forget_anchor() {
        let mut q = tracker();
        q.add("a1", 1, 10, 0.0).unwrap();
        q.add("a2", 1, 11, 0.0).unwrap();
        q.add("a2", 2, 12, 0.0).unwrap();
        assert_eq!(q.forget_anchor("a2"), 2);
        assert_eq!(q.pending(), 1);
        assert_eq!(
            q.add("a3", 1, 13, 0.0).unwrap(),
            TagOutcome::Collecting { sequence: 1, count: 2 }
        );
    }
}
