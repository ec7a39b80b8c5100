use tokio::sync::broadcast;
use tracing::info;

use crate::report::PositionEstimate;

/// Trait for output handlers
pub trait OutputHandler: Send + Sync {
    /// Handle a new position estimate
    fn handle_position(&mut self, estimate: &PositionEstimate);
}

/// Logs every position at INFO level
pub struct LogOutput;

impl OutputHandler for LogOutput {
    fn handle_position(&mut self, estimate: &PositionEstimate) {
        info!(
            sequence = estimate.sequence,
            x = estimate.x,
            y = estimate.y,
            rms = estimate.rms_residual,
            "Position"
        );
    }
}

/// JSON lines output, one object per position, for the TCP position feed
pub struct JsonLinesOutput {
    tx: Option<broadcast::Sender<Vec<u8>>>,
}

impl JsonLinesOutput {
    pub fn new(tx: Option<broadcast::Sender<Vec<u8>>>) -> Self {
        JsonLinesOutput { tx }
    }

    pub fn format_json(estimate: &PositionEstimate) -> String {
        let mut line = serde_json::to_string(estimate).unwrap_or_default();
        line.push('\n');
        line
    }
}

impl OutputHandler for JsonLinesOutput {
    fn handle_position(&mut self, estimate: &PositionEstimate) {
        let line = Self::format_json(estimate);
        if let Some(tx) = &self.tx {
            // No subscribers is not an error
            let _ = tx.send(line.into_bytes());
        }
    }
}
