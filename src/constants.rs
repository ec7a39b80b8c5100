// Shared constants for the positioning engine

/// Propagation speed of the UWB signal (m/s).
pub const C: f64 = 299792458.0;

/// Width of the anchor hardware timestamp counter (DW1000: 40 bits).
pub const TIMESTAMP_BITS: u32 = 40;

/// Modulus of the anchor hardware timestamp counter.
pub const TIMESTAMP_MODULUS: u64 = 1 << TIMESTAMP_BITS;

/// Default modulus of the frame sequence counter (one byte).
pub const SEQUENCE_MODULUS: u64 = 256;

/// Default tick length in seconds: 1 / (128 * 499.2 MHz), about 15.65 ps.
pub const TICK_SECONDS: f64 = 1.0 / (128.0 * 499.2e6);

/// Default nominal sync-frame interval in anchor ticks.
pub const SYNC_INTERVAL_TICKS: f64 = 100.0;

/// Default number of tag sequence numbers an incomplete batch may lag the newest one.
pub const QUORUM_SEQUENCE_HORIZON: u64 = 64;

/// Default wall-clock lifetime of an incomplete quorum batch (s).
pub const QUORUM_MAX_AGE: f64 = 5.0;

/// Solver iteration budget.
pub const SOLVER_MAX_ITERATIONS: usize = 100;

/// Solver stops once the residual norm (m) falls below this.
pub const SOLVER_RESIDUAL_TOLERANCE: f64 = 1e-9;

/// Solver stops once the gradient norm J^T r falls below this.
pub const SOLVER_GRADIENT_TOLERANCE: f64 = 1e-12;

/// Solver stops once an accepted step is shorter than this (m).
pub const SOLVER_STEP_TOLERANCE: f64 = 1e-10;

/// Solutions with a larger RMS range-difference residual (m) are rejected.
pub const SOLVER_MAX_RMS_RESIDUAL: f64 = 5.0;

/// Solutions further than this from the anchor centroid (m) are rejected.
pub const SOLVER_MAX_RANGE: f64 = 1000.0;

/// Estimates closer than this to an anchor (m) are degenerate.
pub const MIN_ANCHOR_RANGE: f64 = 1e-9;

/// Position feed heartbeat interval (s).
pub const HEARTBEAT_INTERVAL_SECS: u64 = 30;
