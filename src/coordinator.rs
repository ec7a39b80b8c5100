// Coordinator - top level glue between linearizers, clock sync, quorum aggregation and the solver
//
// One instance owns every keyed store. Lock order is always
// counters -> clock_tracker -> quorum -> latest_tags.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::clocktrack::{AnchorClockState, ClockModel, ClockTracker, SyncOutcome};
use crate::config::EngineConfig;
use crate::error::{PositionError, Result};
use crate::geometry::{AnchorGeometry, AnchorId};
use crate::net::messages::PositionRequest;
use crate::output::OutputHandler;
use crate::quorum::{QuorumBatch, QuorumTracker, TagOutcome};
use crate::report::{FrameType, LinearizedReport, PositionEstimate, RawReport};
use crate::rollover::CounterTracker;
use crate::solver::{self, SolverConfig};

/// Result of ingesting one report
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    /// First Sync frame from the anchor; no clock model yet
    SyncStored,
    /// Sync frame produced a new clock model
    ClockUpdated(ClockModel),
    /// Tag frame stored, quorum not reached
    TagCollecting { sequence: u64, count: usize },
    /// Tag frame dropped: sequence behind the horizon or already emitted
    TagDropped,
    /// Tag frame completed the quorum and the batch was solved
    Position(PositionEstimate),
}

/// Counters for status logging and the state snapshot
#[derive(Debug, Clone, Default, Serialize)]
pub struct Stats {
    pub sync_reports: usize,
    pub tag_reports: usize,
    pub rejected_reports: usize,
    pub clock_updates: usize,
    pub batches_completed: usize,
    pub positions: usize,
    pub solver_failures: usize,
}

/// Current engine state: latest two Sync reports, latest Tag report and
/// clock model per anchor
#[derive(Debug, Clone, Serialize)]
pub struct EngineSnapshot {
    pub anchors: AnchorGeometry,
    pub clocks: Vec<AnchorClockState>,
    pub latest_tags: Vec<LinearizedReport>,
    pub pending_batches: usize,
    pub evicted_batches: usize,
    pub stats: Stats,
}

/// Coordinator for the positioning engine
pub struct Coordinator {
    geometry: Arc<AnchorGeometry>,
    tick_seconds: f64,
    solver: SolverConfig,
    counters: Arc<RwLock<CounterTracker>>,
    clock_tracker: Arc<RwLock<ClockTracker>>,
    quorum: Arc<RwLock<QuorumTracker>>,
    latest_tags: Arc<RwLock<HashMap<AnchorId, LinearizedReport>>>,
    outputs: Arc<RwLock<Vec<Box<dyn OutputHandler>>>>,
    stats: Arc<RwLock<Stats>>,

    /// Work directory for state.json. None = no file writes.
    work_dir: Option<String>,
    /// Status log interval in seconds. <= 0 = disabled.
    status_interval_secs: i32,
}

/// Host time in seconds since the Unix epoch.
pub fn unix_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

impl Coordinator {
    /// Create a coordinator without status logging or state files (for tests).
    pub fn new(config: EngineConfig) -> Self {
        Self::new_with_status(config, None, -1)
    }

    pub fn new_with_status(config: EngineConfig, work_dir: Option<String>, status_interval: i32) -> Self {
        let anchor_ids = config.geometry.ids().map(str::to_string).collect();
        Coordinator {
            geometry: Arc::new(config.geometry),
            tick_seconds: config.tick_seconds,
            solver: config.solver,
            counters: Arc::new(RwLock::new(CounterTracker::new(config.linearizer))),
            clock_tracker: Arc::new(RwLock::new(ClockTracker::new(config.clock))),
            quorum: Arc::new(RwLock::new(QuorumTracker::new(anchor_ids, config.quorum))),
            latest_tags: Arc::new(RwLock::new(HashMap::new())),
            outputs: Arc::new(RwLock::new(Vec::new())),
            stats: Arc::new(RwLock::new(Stats::default())),
            work_dir,
            status_interval_secs: status_interval,
        }
    }

    pub fn geometry(&self) -> &AnchorGeometry {
        &self.geometry
    }

    /// Add an output handler
    pub async fn add_output(&self, output: Box<dyn OutputHandler>) {
        self.outputs.write().await.push(output);
    }

    /// Ingest one validated report received at host time `now` (s).
    ///
    /// A rejected report leaves all state untouched. Solver faults on a
    /// completed batch are returned as errors, but the batch stays consumed.
    pub async fn ingest(&self, report: RawReport, now: f64) -> Result<IngestOutcome> {
        let result = match report.frame_type {
            FrameType::Sync => self.ingest_sync(&report, now).await,
            FrameType::Tag => self.ingest_tag(&report, now).await,
        };

        if let Err(e) = &result {
            if !e.is_solver_fault() && !matches!(e, PositionError::NonFiniteCorrectedTime { .. }) {
                self.stats.write().await.rejected_reports += 1;
                warn!(anchor_id = %report.anchor_id, frame_type = %report.frame_type, "Rejected report: {}", e);
            }
        }
        result
    }

    fn check_anchor(&self, anchor_id: &str) -> Result<()> {
        if self.geometry.contains(anchor_id) {
            Ok(())
        } else {
            Err(PositionError::MalformedReport(format!("unknown anchor '{}'", anchor_id)))
        }
    }

    async fn ingest_sync(&self, report: &RawReport, now: f64) -> Result<IngestOutcome> {
        self.check_anchor(&report.anchor_id)?;

        let outcome = {
            let mut counters = self.counters.write().await;
            let linearized = counters.peek(report, now)?;
            let outcome = self.clock_tracker.write().await.update(&linearized)?;
            counters.commit(&linearized, now);
            outcome
        };

        let mut stats = self.stats.write().await;
        stats.sync_reports += 1;
        Ok(match outcome {
            SyncOutcome::InsufficientHistory => IngestOutcome::SyncStored,
            SyncOutcome::Updated(model) => {
                stats.clock_updates += 1;
                IngestOutcome::ClockUpdated(model)
            }
        })
    }

    async fn ingest_tag(&self, report: &RawReport, now: f64) -> Result<IngestOutcome> {
        self.check_anchor(&report.anchor_id)?;

        let outcome = {
            let mut counters = self.counters.write().await;
            let linearized = counters.peek(report, now)?;
            let outcome = {
                let mut quorum = self.quorum.write().await;
                quorum.expire(now);
                quorum.add(&linearized.anchor_id, linearized.sequence, linearized.timestamp, now)?
            };
            counters.commit(&linearized, now);
            self.latest_tags
                .write()
                .await
                .insert(linearized.anchor_id.clone(), linearized);
            outcome
        };

        self.stats.write().await.tag_reports += 1;

        match outcome {
            TagOutcome::Collecting { sequence, count } => Ok(IngestOutcome::TagCollecting { sequence, count }),
            TagOutcome::Stale | TagOutcome::AlreadyEmitted => Ok(IngestOutcome::TagDropped),
            TagOutcome::Complete(batch) => {
                self.stats.write().await.batches_completed += 1;
                let estimate = self.resolve_batch(&batch).await?;
                self.forward_position(&estimate).await;
                Ok(IngestOutcome::Position(estimate))
            }
        }
    }

    /// Correct and solve a complete quorum batch.
    async fn resolve_batch(&self, batch: &QuorumBatch) -> Result<PositionEstimate> {
        let corrected = {
            let clocks = self.clock_tracker.read().await;
            let mut corrected = Vec::with_capacity(self.geometry.len());
            for anchor in self.geometry.anchors() {
                let timestamp = batch.entries.get(&anchor.id).ok_or_else(|| {
                    PositionError::MalformedReport(format!(
                        "batch {} has no timestamp for anchor '{}'",
                        batch.sequence, anchor.id
                    ))
                })?;
                corrected.push(clocks.correct(&anchor.id, *timestamp)?);
            }
            corrected
        };

        let uncorrected = corrected.iter().filter(|c| !c.model_applied).count();
        let ticks: Vec<f64> = corrected.iter().map(|c| c.ticks).collect();
        self.solve_corrected(batch.sequence, &ticks, uncorrected).await
    }

    /// Solve from corrected times in ticks, one per anchor in geometry order.
    async fn solve_corrected(&self, sequence: u64, ticks: &[f64], uncorrected: usize) -> Result<PositionEstimate> {
        // Rebase on the reference anchor before converting to seconds to keep precision
        let reference = ticks[0];
        let mut times = Vec::with_capacity(ticks.len());
        for (anchor, t) in self.geometry.anchors().iter().zip(ticks) {
            let seconds = (t - reference) * self.tick_seconds;
            if !seconds.is_finite() {
                return Err(PositionError::NonFiniteCorrectedTime {
                    anchor_id: anchor.id.clone(),
                });
            }
            times.push(seconds);
        }

        let positions: Vec<[f64; 2]> = self.geometry.anchors().iter().map(|a| a.position).collect();
        match solver::solve(&positions, &times, &self.solver) {
            Ok(solution) => {
                debug!(
                    sequence,
                    x = solution.position[0],
                    y = solution.position[1],
                    iterations = solution.iterations,
                    "Solved position"
                );
                self.stats.write().await.positions += 1;
                Ok(PositionEstimate {
                    x: solution.position[0],
                    y: solution.position[1],
                    sequence,
                    rms_residual: solution.rms_residual,
                    dop: solution.dop,
                    iterations: solution.iterations,
                    uncorrected_anchors: uncorrected,
                })
            }
            Err(e) => {
                warn!(sequence, "Solver failed: {}", e);
                self.stats.write().await.solver_failures += 1;
                Err(e)
            }
        }
    }

    async fn forward_position(&self, estimate: &PositionEstimate) {
        let mut outputs = self.outputs.write().await;
        for output in outputs.iter_mut() {
            output.handle_position(estimate);
        }
    }

    /// Solve a position from caller-supplied raw tag timestamps.
    ///
    /// Timestamps are linearized to the counter wrap nearest each anchor's last
    /// committed timestamp, since they usually belong to reports already
    /// ingested. Nothing is committed.
    pub async fn calculate_position(&self, request: &PositionRequest, now: f64) -> Result<PositionEstimate> {
        if let Some(unknown) = request.timestamps.keys().find(|id| !self.geometry.contains(id)) {
            return Err(PositionError::MalformedReport(format!("unknown anchor '{}'", unknown)));
        }

        let corrected = {
            let counters = self.counters.read().await;
            let clocks = self.clock_tracker.read().await;
            let mut corrected = Vec::with_capacity(self.geometry.len());
            for anchor in self.geometry.anchors() {
                let raw = request.timestamps.get(&anchor.id).ok_or_else(|| {
                    PositionError::MalformedReport(format!("missing timestamp for anchor '{}'", anchor.id))
                })?;
                let linearized = counters.nearest_timestamp(&anchor.id, *raw, now)?;
                corrected.push(clocks.correct(&anchor.id, linearized)?);
            }
            corrected
        };

        debug!(tag_id = %request.tag_id, sequence = request.sequence_number, "Position request");
        let uncorrected = corrected.iter().filter(|c| !c.model_applied).count();
        let ticks: Vec<f64> = corrected.iter().map(|c| c.ticks).collect();
        self.solve_corrected(request.sequence_number, &ticks, uncorrected).await
    }

    /// Forget all counter, clock and pending quorum state of one anchor.
    ///
    /// The recovery path after a `RolloverAmbiguity`: the anchor's next report
    /// starts fresh and its clock model is rebuilt from the next two Sync frames.
    pub async fn reset_anchor(&self, anchor_id: &str) -> Result<()> {
        self.check_anchor(anchor_id)?;

        let mut counters = self.counters.write().await;
        let mut clocks = self.clock_tracker.write().await;
        let mut quorum = self.quorum.write().await;
        let mut latest_tags = self.latest_tags.write().await;

        counters.reset(anchor_id);
        clocks.reset(anchor_id);
        let dropped = quorum.forget_anchor(anchor_id);
        latest_tags.remove(anchor_id);
        info!(anchor_id, dropped_tag_entries = dropped, "Anchor state reset");
        Ok(())
    }

    pub async fn snapshot(&self) -> EngineSnapshot {
        let clocks = self.clock_tracker.read().await.snapshot();
        let (pending_batches, evicted_batches) = {
            let quorum = self.quorum.read().await;
            (quorum.pending(), quorum.evicted)
        };
        let mut latest_tags: Vec<LinearizedReport> = self.latest_tags.read().await.values().cloned().collect();
        latest_tags.sort_by(|a, b| a.anchor_id.cmp(&b.anchor_id));

        EngineSnapshot {
            anchors: (*self.geometry).clone(),
            clocks,
            latest_tags,
            pending_batches,
            evicted_batches,
            stats: self.stats.read().await.clone(),
        }
    }

    pub async fn stats(&self) -> Stats {
        self.stats.read().await.clone()
    }

    /// Create the work directory. Call once at startup.
    pub async fn init_work_dir(&self) {
        let Some(work_dir) = &self.work_dir else {
            return;
        };
        if let Err(e) = tokio::fs::create_dir_all(work_dir).await {
            warn!("Failed to create work_dir {}: {}", work_dir, e);
        }
    }

    /// Write state.json atomically (tmp file then rename).
    pub async fn write_state(&self) {
        let Some(work_dir) = &self.work_dir else {
            return;
        };
        let dir = Path::new(work_dir);
        let snapshot = self.snapshot().await;
        let json = match serde_json::to_string_pretty(&snapshot) {
            Ok(json) => json,
            Err(e) => {
                warn!("write_state: failed to serialize snapshot: {}", e);
                return;
            }
        };

        let tmp = dir.join("state.json.tmp");
        let path = dir.join("state.json");
        if let Err(e) = tokio::fs::write(&tmp, json).await {
            warn!("write_state: failed to write {}: {}", tmp.display(), e);
        } else if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            warn!("write_state: failed to rename {} -> {}: {}", tmp.display(), path.display(), e);
        }
    }

    async fn log_status(&self) {
        let snapshot = self.snapshot().await;
        let models = snapshot.clocks.iter().filter(|c| c.model.is_some()).count();
        info!(
            "Status: ({}/{} anchors synced) ({} pending {} evicted batches) ({} positions {} solver failures {} rejected)",
            models,
            snapshot.anchors.len(),
            snapshot.pending_batches,
            snapshot.evicted_batches,
            snapshot.stats.positions,
            snapshot.stats.solver_failures,
            snapshot.stats.rejected_reports,
        );
    }

    /// Run periodic tasks: quorum expiry, status log, write_state when enabled.
    pub async fn run(&self) {
        let mut ticker = tokio::time::interval(Duration::from_millis(500));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let status_secs = self.status_interval_secs;
        let mut next_status = if status_secs > 0 {
            Some(tokio::time::Instant::now() + Duration::from_secs(status_secs as u64))
        } else {
            None
        };
        let write_interval_secs = 5u64;
        let mut next_write_state = self
            .work_dir
            .as_ref()
            .map(|_| tokio::time::Instant::now() + Duration::from_secs(1));

        loop {
            ticker.tick().await;

            self.quorum.write().await.expire(unix_now());

            if let Some(ref mut next) = next_status {
                if tokio::time::Instant::now() >= *next {
                    *next += Duration::from_secs(status_secs as u64);
                    self.log_status().await;
                }
            }
            if let Some(ref mut next) = next_write_state {
                if tokio::time::Instant::now() >= *next {
                    *next += Duration::from_secs(write_interval_secs);
                    self.write_state().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::C;
    use crate::geometry::distance;
    use std::collections::BTreeMap;

    const TICK: f64 = 1e-9;
    const TAU: f64 = 1_000_000.0;

    fn engine() -> Coordinator {
        Coordinator::new(EngineConfig::new(AnchorGeometry::reference_deployment(), TICK, TAU))
    }

    fn raw(anchor: &str, timestamp: u64, frame_type: FrameType, sequence: u32) -> RawReport {
        RawReport {
            anchor_id: anchor.to_string(),
            timestamp,
            frame_type,
            sequence,
        }
    }

    /// Raw tag timestamps at each anchor for a tag at `tag` that blinked at
    /// reference tick `emit`, given per-anchor clock offset and drift.
    fn tag_timestamps(geometry: &AnchorGeometry, tag: [f64; 2], emit: f64, clocks: &[(f64, f64)]) -> Vec<u64> {
        geometry
            .anchors()
            .iter()
            .zip(clocks)
            .map(|(a, (offset, drift))| {
                let arrival = emit + distance(a.position, tag) / C / TICK;
                (arrival * (1.0 + drift) + offset).round() as u64
            })
            .collect()
    }

    #[tokio::test]
    async fn test_unknown_anchor_rejected() {
        let coordinator = engine();
        let err = coordinator
            .ingest(raw("anchor9", 1, FrameType::Sync, 1), 0.0)
            .await
            .unwrap_err();
        assert_eq!(err.reason_code(), "MalformedReport");
        assert_eq!(coordinator.stats().await.rejected_reports, 1);
    }

    #[tokio::test]
    async fn test_sync_builds_clock_model() {
        let coordinator = engine();
        let first = coordinator.ingest(raw("anchor1", 1_000, FrameType::Sync, 1), 0.0).await.unwrap();
        assert_eq!(first, IngestOutcome::SyncStored);

        let second = coordinator
            .ingest(raw("anchor1", 1_000 + 1_000_050, FrameType::Sync, 2), 0.001)
            .await
            .unwrap();
        match second {
            IngestOutcome::ClockUpdated(model) => {
                assert_eq!(model.offset, 1_000.0 + 1_000_050.0 - 2.0 * TAU);
                assert!((model.drift - 50.0 / TAU).abs() < 1e-15);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_zero_sequence_delta_leaves_state() {
        let coordinator = engine();
        coordinator.ingest(raw("anchor1", 1_000, FrameType::Sync, 1), 0.0).await.unwrap();
        let err = coordinator
            .ingest(raw("anchor1", 2_000, FrameType::Sync, 1), 0.001)
            .await
            .unwrap_err();
        assert_eq!(err.reason_code(), "ClockModelDivisionFault");

        // Timestamp counter was not advanced by the rejected report
        let snapshot = coordinator.snapshot().await;
        assert_eq!(snapshot.clocks[0].sync_history.len(), 1);
        assert_eq!(coordinator.counters.read().await.last_timestamp("anchor1"), Some(1_000));
    }

    #[tokio::test]
    async fn test_end_to_end_position() {
        let coordinator = engine();
        let geometry = coordinator.geometry().clone();
        // (offset ticks, drift) per anchor
        let clocks = [(5_000.0, 2e-6), (-3_000.0, -1e-6), (12_345.0, 0.0), (777.0, 4e-6)];

        // Sync frames k = 10, 11 emitted at k * tau from a source with no delay model
        for (k, now) in [(10u32, 0.0), (11u32, 0.001)] {
            for (anchor, (offset, drift)) in geometry.anchors().iter().zip(&clocks) {
                let reference = k as f64 * TAU;
                let ts = (reference * (1.0 + drift) + offset).round() as u64;
                coordinator
                    .ingest(raw(&anchor.id, ts, FrameType::Sync, k), now)
                    .await
                    .unwrap();
            }
        }

        let tag = [0.8, 1.3];
        let emit = 11.5 * TAU;
        let timestamps = tag_timestamps(&geometry, tag, emit, &clocks);

        let mut result = None;
        for (i, (anchor, ts)) in geometry.anchors().iter().zip(&timestamps).enumerate() {
            let outcome = coordinator
                .ingest(raw(&anchor.id, *ts, FrameType::Tag, 1), 0.002)
                .await
                .unwrap();
            if i < 3 {
                assert_eq!(outcome, IngestOutcome::TagCollecting { sequence: 1, count: i + 1 });
            } else {
                result = Some(outcome);
            }
        }

        let estimate = match result {
            Some(IngestOutcome::Position(estimate)) => estimate,
            other => panic!("expected position, got {:?}", other),
        };
        assert_eq!(estimate.uncorrected_anchors, 0);
        // Integer tick rounding limits accuracy to about 0.3 m per tick at 1 ns
        assert!(
            distance([estimate.x, estimate.y], tag) < 1.0,
            "estimate ({}, {})",
            estimate.x,
            estimate.y
        );

        // Duplicate report for the emitted sequence is dropped
        let dup = coordinator
            .ingest(raw("anchor1", timestamps[0], FrameType::Tag, 1), 0.003)
            .await
            .unwrap();
        assert_eq!(dup, IngestOutcome::TagDropped);
        assert_eq!(coordinator.stats().await.batches_completed, 1);
    }

    #[tokio::test]
    async fn test_calculate_position_request() {
        let coordinator = engine();
        let geometry = coordinator.geometry().clone();
        let clocks = [(0.0, 0.0); 4];
        let tag = [2.2, 0.6];
        let timestamps = tag_timestamps(&geometry, tag, 1e9, &clocks);

        let request = PositionRequest {
            tag_id: "tag1".to_string(),
            timestamps: geometry
                .ids()
                .map(str::to_string)
                .zip(timestamps.iter().copied())
                .collect::<BTreeMap<_, _>>(),
            sequence_number: 4,
        };
        let estimate = coordinator.calculate_position(&request, 0.0).await.unwrap();
        assert_eq!(estimate.uncorrected_anchors, 4);
        assert!(distance([estimate.x, estimate.y], tag) < 1.0);

        // Nothing was committed
        assert!(coordinator.snapshot().await.latest_tags.is_empty());
        assert!(coordinator.counters.read().await.last_timestamp("anchor1").is_none());
    }

    #[tokio::test]
    async fn test_calculate_position_missing_anchor() {
        let coordinator = engine();
        let request = PositionRequest {
            tag_id: "tag1".to_string(),
            timestamps: BTreeMap::from([("anchor1".to_string(), 1), ("anchor2".to_string(), 2)]),
            sequence_number: 1,
        };
        let err = coordinator.calculate_position(&request, 0.0).await.unwrap_err();
        assert_eq!(err.reason_code(), "MalformedReport");
    }

    #[tokio::test]
    async fn test_reference_config_builds_clock_model() {
        let coordinator = Coordinator::new(EngineConfig::reference());
        let first = coordinator.ingest(raw("anchor1", 1_100, FrameType::Sync, 1), 100.0).await.unwrap();
        assert_eq!(first, IngestOutcome::SyncStored);
        for (k, now) in [(2u32, 100.1), (3u32, 100.2)] {
            let outcome = coordinator
                .ingest(raw("anchor1", 1_000 + 100 * k as u64 + 2, FrameType::Sync, k), now)
                .await
                .unwrap();
            assert!(matches!(outcome, IngestOutcome::ClockUpdated(_)), "k={} gave {:?}", k, outcome);
        }
    }

    #[tokio::test]
    async fn test_calculate_position_after_newer_reports() {
        let coordinator = engine();
        let geometry = coordinator.geometry().clone();
        let tag = [1.1, 0.4];
        let timestamps = tag_timestamps(&geometry, tag, 1e9, &[(0.0, 0.0); 4]);
        for (anchor, ts) in geometry.anchors().iter().zip(&timestamps) {
            coordinator.ingest(raw(&anchor.id, *ts, FrameType::Tag, 1), 0.0).await.unwrap();
        }
        // anchor1 moves on before the request arrives
        coordinator
            .ingest(raw("anchor1", timestamps[0] + 1_000_000, FrameType::Sync, 1), 0.01)
            .await
            .unwrap();

        let request = PositionRequest {
            tag_id: "tag1".to_string(),
            timestamps: geometry
                .ids()
                .map(str::to_string)
                .zip(timestamps.iter().copied())
                .collect::<BTreeMap<_, _>>(),
            sequence_number: 1,
        };
        let estimate = coordinator.calculate_position(&request, 0.02).await.unwrap();
        assert!(
            distance([estimate.x, estimate.y], tag) < 1.0,
            "estimate ({}, {})",
            estimate.x,
            estimate.y
        );
    }

    #[tokio::test]
    async fn test_reset_anchor_after_ambiguity() {
        let coordinator = engine();
        coordinator.ingest(raw("anchor2", 10, FrameType::Tag, 1), 0.0).await.unwrap();
        coordinator.ingest(raw("anchor1", 10, FrameType::Tag, 1), 0.0).await.unwrap();
        assert!(coordinator.ingest(raw("anchor2", 20, FrameType::Tag, 2), 5_000.0).await.is_err());
        let err = coordinator
            .ingest(raw("anchor2", 30, FrameType::Sync, 1), 5_000.1)
            .await
            .unwrap_err();
        assert_eq!(err.reason_code(), "RolloverAmbiguity");

        coordinator.reset_anchor("anchor2").await.unwrap();
        assert_eq!(coordinator.snapshot().await.latest_tags.len(), 1);

        coordinator.ingest(raw("anchor2", 40, FrameType::Tag, 2), 5_000.2).await.unwrap();
        let outcome = coordinator.ingest(raw("anchor2", 50, FrameType::Sync, 1), 5_000.3).await.unwrap();
        assert_eq!(outcome, IngestOutcome::SyncStored);

        let err = coordinator.reset_anchor("anchor9").await.unwrap_err();
        assert_eq!(err.reason_code(), "MalformedReport");
    }

    #[tokio::test]
    async fn test_rollover_ambiguity_rejects_report() {
        let coordinator = engine();
        coordinator.ingest(raw("anchor2", 10, FrameType::Tag, 1), 0.0).await.unwrap();
        // 2^40 ns is about 1100 s
        let err = coordinator
            .ingest(raw("anchor2", 20, FrameType::Tag, 2), 5_000.0)
            .await
            .unwrap_err();
        assert_eq!(err.reason_code(), "RolloverAmbiguity");
        assert_eq!(coordinator.snapshot().await.latest_tags[0].timestamp, 10);
    }

    #[tokio::test]
    async fn test_outputs_receive_positions() {
        use std::sync::Mutex;

        struct Collect(Arc<Mutex<Vec<u64>>>);
        impl OutputHandler for Collect {
            fn handle_position(&mut self, estimate: &PositionEstimate) {
                self.0.lock().unwrap().push(estimate.sequence);
            }
        }

        let coordinator = engine();
        let seen = Arc::new(Mutex::new(Vec::new()));
        coordinator.add_output(Box::new(Collect(seen.clone()))).await;

        let geometry = coordinator.geometry().clone();
        let timestamps = tag_timestamps(&geometry, [1.0, 1.0], 5e8, &[(0.0, 0.0); 4]);
        for (anchor, ts) in geometry.anchors().iter().zip(&timestamps) {
            coordinator.ingest(raw(&anchor.id, *ts, FrameType::Tag, 9), 0.0).await.unwrap();
        }
        assert_eq!(*seen.lock().unwrap(), vec![9]);
    }

    #[tokio::test]
    async fn test_concurrent_tag_reports_complete_once() {
        let coordinator = Arc::new(engine());
        let geometry = coordinator.geometry().clone();
        let timestamps = tag_timestamps(&geometry, [1.2, 0.9], 2e8, &[(0.0, 0.0); 4]);

        let mut handles = Vec::new();
        for round in 0..3 {
            for (anchor, ts) in geometry.anchors().iter().zip(&timestamps) {
                let coordinator = coordinator.clone();
                let report = raw(&anchor.id, *ts, FrameType::Tag, 3);
                handles.push(tokio::spawn(async move {
                    coordinator.ingest(report, round as f64 * 0.001).await
                }));
            }
        }

        let mut positions = 0;
        for handle in handles {
            if let Ok(IngestOutcome::Position(_)) = handle.await.unwrap() {
                positions += 1;
            }
        }
        assert_eq!(positions, 1);
    }
}
