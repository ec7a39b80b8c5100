use clap::Parser;

use crate::clocktrack::ClockConfig;
use crate::constants::{
    QUORUM_MAX_AGE, QUORUM_SEQUENCE_HORIZON, SEQUENCE_MODULUS, SOLVER_MAX_ITERATIONS, SOLVER_MAX_RMS_RESIDUAL,
    SYNC_INTERVAL_TICKS, TICK_SECONDS, TIMESTAMP_MODULUS,
};
use crate::geometry::{parse_anchor, parse_point, Anchor, AnchorGeometry};
use crate::quorum::QuorumConfig;
use crate::rollover::LinearizerConfig;
use crate::solver::SolverConfig;

/// UWB TDOA Server Configuration
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Listen on [host:]port for the HTTP API.
    #[arg(long, value_name = "ADDR", default_value = "0.0.0.0:5000")]
    pub http_listen: String,

    /// Anchor as ID=X,Y in meters; repeat once per anchor. The first is the time reference.
    /// Defaults to the 3 m x 2 m reference rectangle.
    #[arg(long = "anchor", value_name = "ID=X,Y", value_parser = parse_anchor)]
    pub anchors: Vec<Anchor>,

    /// Length of one anchor counter tick in seconds.
    #[arg(long, default_value_t = TICK_SECONDS)]
    pub tick_seconds: f64,

    /// Nominal sync-frame interval in anchor ticks.
    #[arg(long, default_value_t = SYNC_INTERVAL_TICKS)]
    pub sync_interval_ticks: f64,

    /// Host-time interval between Sync frames in seconds, used to detect ambiguous sync sequence wraps.
    #[arg(long, value_name = "SECONDS")]
    pub sync_interval: Option<f64>,

    /// Position X,Y of the sync-frame transmitter, to compensate its time of flight.
    #[arg(long, value_name = "X,Y", value_parser = parse_point, allow_hyphen_values = true)]
    pub sync_source: Option<[f64; 2]>,

    /// Modulus of the frame sequence counter.
    #[arg(long, default_value_t = SEQUENCE_MODULUS)]
    pub sequence_modulus: u64,

    /// Nominal tag blink interval in seconds, used to detect ambiguous tag sequence wraps.
    #[arg(long, value_name = "SECONDS")]
    pub tag_interval: Option<f64>,

    /// Incomplete quorum batches further than this many sequence numbers behind are dropped.
    #[arg(long, default_value_t = QUORUM_SEQUENCE_HORIZON)]
    pub quorum_horizon: u64,

    /// Incomplete quorum batches older than this many seconds are dropped.
    #[arg(long, default_value_t = QUORUM_MAX_AGE)]
    pub quorum_max_age: f64,

    /// Solver iteration budget.
    #[arg(long, default_value_t = SOLVER_MAX_ITERATIONS)]
    pub solver_max_iterations: usize,

    /// Reject solutions whose RMS range-difference residual exceeds this (m).
    #[arg(long, default_value_t = SOLVER_MAX_RMS_RESIDUAL)]
    pub solver_max_rms: f64,

    /// Listen on a [host:]port and stream solved positions as JSON lines to clients that connect.
    #[arg(long, value_name = "ADDR")]
    pub position_listen: Vec<String>,

    /// Directory for the state snapshot (state.json), also served under /state/.
    #[arg(long, value_name = "DIR")]
    pub work_dir: Option<String>,

    /// Status logging interval in seconds, -1 to disable
    #[arg(long, default_value_t = 15)]
    pub status_interval: i32,

    /// Verbose logging (DEBUG level)
    #[arg(long, short, default_value_t = false)]
    pub verbose: bool,
}

impl Config {
    /// Build the engine configuration, validating the anchor geometry.
    pub fn engine_config(&self) -> Result<EngineConfig, String> {
        let geometry = if self.anchors.is_empty() {
            AnchorGeometry::reference_deployment()
        } else {
            AnchorGeometry::new(self.anchors.clone())?
        };

        if !(self.tick_seconds > 0.0 && self.tick_seconds.is_finite()) {
            return Err(format!("tick_seconds must be positive, got {}", self.tick_seconds));
        }
        if !(self.sync_interval_ticks > 0.0 && self.sync_interval_ticks.is_finite()) {
            return Err(format!(
                "sync_interval_ticks must be positive, got {}",
                self.sync_interval_ticks
            ));
        }
        if self.sequence_modulus < 2 {
            return Err(format!("sequence_modulus must be at least 2, got {}", self.sequence_modulus));
        }

        let mut config = EngineConfig::new(geometry, self.tick_seconds, self.sync_interval_ticks);
        config.linearizer.sequence_modulus = self.sequence_modulus;
        config.linearizer.sync_sequence_period = self.sync_interval.map(|t| self.sequence_modulus as f64 * t);
        config.linearizer.tag_sequence_period = self.tag_interval.map(|t| self.sequence_modulus as f64 * t);
        if let Some(source) = self.sync_source {
            config.clock = config
                .clock
                .with_sync_source(&config.geometry, source, self.tick_seconds);
        }
        config.quorum = QuorumConfig {
            sequence_horizon: self.quorum_horizon,
            max_age: self.quorum_max_age,
        };
        config.solver.max_iterations = self.solver_max_iterations;
        config.solver.max_rms_residual = self.solver_max_rms;
        Ok(config)
    }
}

/// Everything the positioning engine needs, independent of the command line.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub geometry: AnchorGeometry,
    pub tick_seconds: f64,
    pub linearizer: LinearizerConfig,
    pub clock: ClockConfig,
    pub quorum: QuorumConfig,
    pub solver: SolverConfig,
}

impl EngineConfig {
    /// Defaults for a geometry, tick length and sync interval.
    ///
    /// Sequence wraps are only time-checked once a host-time frame interval
    /// is known; the tick-based sync interval says nothing about it.
    pub fn new(geometry: AnchorGeometry, tick_seconds: f64, sync_interval_ticks: f64) -> Self {
        EngineConfig {
            geometry,
            tick_seconds,
            linearizer: LinearizerConfig {
                timestamp_modulus: TIMESTAMP_MODULUS,
                sequence_modulus: SEQUENCE_MODULUS,
                timestamp_period: Some(TIMESTAMP_MODULUS as f64 * tick_seconds),
                sync_sequence_period: None,
                tag_sequence_period: None,
            },
            clock: ClockConfig::new(sync_interval_ticks),
            quorum: QuorumConfig {
                sequence_horizon: QUORUM_SEQUENCE_HORIZON,
                max_age: QUORUM_MAX_AGE,
            },
            solver: SolverConfig::default(),
        }
    }

    /// Reference deployment: 3 m x 2 m rectangle, DW1000 ticks, 100-tick sync interval.
    pub fn reference() -> Self {
        Self::new(AnchorGeometry::reference_deployment(), TICK_SECONDS, SYNC_INTERVAL_TICKS)
    }
}
