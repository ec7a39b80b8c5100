// Network layer module
// HTTP API for anchors and callers, TCP feed of solved positions

pub mod http;
pub mod messages;
pub mod output_tcp;

pub use messages::{PositionRequest, TimestampPayload};
