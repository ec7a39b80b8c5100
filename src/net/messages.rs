// JSON message type definitions
// Request/response payloads of the HTTP API and their boundary validation

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PositionError;
use crate::report::{FrameType, PositionEstimate, RawReport};

/// Timestamp report as posted by anchors.
///
/// Every field is optional here so a missing or null field becomes a
/// MalformedReport instead of a deserializer error.
#[derive(Debug, Default, Deserialize)]
pub struct TimestampPayload {
    #[serde(default)]
    pub anchor_id: Option<Value>,
    #[serde(default)]
    pub timestamp: Option<Value>,
    #[serde(default)]
    pub frame_type: Option<Value>,
    #[serde(default)]
    pub sequence_number: Option<Value>,
}

fn malformed(msg: impl Into<String>) -> PositionError {
    PositionError::MalformedReport(msg.into())
}

fn required<'a>(field: &'a Option<Value>, name: &str) -> Result<&'a Value, PositionError> {
    match field {
        None | Some(Value::Null) => Err(malformed(format!("missing field '{}'", name))),
        Some(v) => Ok(v),
    }
}

fn non_negative_integer(value: &Value, name: &str) -> Result<u64, PositionError> {
    value
        .as_u64()
        .ok_or_else(|| malformed(format!("'{}' must be a non-negative integer, got {}", name, value)))
}

fn anchor_string(value: &Value) -> Result<String, PositionError> {
    match value.as_str() {
        Some(s) if !s.is_empty() => Ok(s.to_string()),
        Some(_) => Err(malformed("'anchor_id' must not be empty")),
        None => Err(malformed(format!("'anchor_id' must be a string, got {}", value))),
    }
}

impl TryFrom<TimestampPayload> for RawReport {
    type Error = PositionError;

    fn try_from(payload: TimestampPayload) -> Result<Self, Self::Error> {
        let anchor_id = anchor_string(required(&payload.anchor_id, "anchor_id")?)?;
        let timestamp = non_negative_integer(required(&payload.timestamp, "timestamp")?, "timestamp")?;

        let frame_type = required(&payload.frame_type, "frame_type")?;
        let frame_type: FrameType = frame_type
            .as_str()
            .ok_or_else(|| malformed(format!("'frame_type' must be a string, got {}", frame_type)))?
            .parse()
            .map_err(malformed)?;

        let sequence = non_negative_integer(
            required(&payload.sequence_number, "sequence_number")?,
            "sequence_number",
        )?;
        let sequence = u32::try_from(sequence)
            .map_err(|_| malformed(format!("'sequence_number' {} out of range", sequence)))?;

        Ok(RawReport {
            anchor_id,
            timestamp,
            frame_type,
            sequence,
        })
    }
}

/// Position calculation request as posted by the aggregator role.
#[derive(Debug, Default, Deserialize)]
pub struct PositionRequestPayload {
    #[serde(default)]
    pub tag_id: Option<Value>,
    #[serde(default)]
    pub timestamps: Option<Value>,
    #[serde(default)]
    pub sequence_number: Option<Value>,
}

/// Validated position request
#[derive(Debug, Clone, PartialEq)]
pub struct PositionRequest {
    pub tag_id: String,
    /// Raw tag timestamp per anchor
    pub timestamps: BTreeMap<String, u64>,
    pub sequence_number: u64,
}

impl TryFrom<PositionRequestPayload> for PositionRequest {
    type Error = PositionError;

    fn try_from(payload: PositionRequestPayload) -> Result<Self, Self::Error> {
        let tag_id = required(&payload.tag_id, "tag_id")?;
        let tag_id = tag_id
            .as_str()
            .ok_or_else(|| malformed(format!("'tag_id' must be a string, got {}", tag_id)))?
            .to_string();

        let timestamps = required(&payload.timestamps, "timestamps")?
            .as_object()
            .ok_or_else(|| malformed("'timestamps' must be an object of anchor -> integer"))?
            .iter()
            .map(|(anchor, v)| {
                let ts = non_negative_integer(v, &format!("timestamps.{}", anchor))?;
                Ok((anchor.clone(), ts))
            })
            .collect::<Result<BTreeMap<_, _>, PositionError>>()?;

        let sequence_number = non_negative_integer(
            required(&payload.sequence_number, "sequence_number")?,
            "sequence_number",
        )?;

        Ok(PositionRequest {
            tag_id,
            timestamps,
            sequence_number,
        })
    }
}

/// Acknowledgement of a timestamp report
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TimestampResponse {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<PositionMessage>,
}

/// Position as returned to callers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PositionMessage {
    pub x: f64,
    pub y: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
}

impl PositionMessage {
    pub fn from_estimate(estimate: &PositionEstimate, with_sequence: bool) -> Self {
        PositionMessage {
            x: estimate.x,
            y: estimate.y,
            sequence: with_sequence.then_some(estimate.sequence),
        }
    }
}

/// Structured failure with a stable reason code
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorMessage {
    pub error: String,
    pub message: String,
}

impl From<&PositionError> for ErrorMessage {
    fn from(e: &PositionError) -> Self {
        ErrorMessage {
            error: e.reason_code().to_string(),
            message: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(v: Value) -> TimestampPayload {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn test_valid_timestamp_payload() {
        let report = RawReport::try_from(payload(json!({
            "anchor_id": "anchor1",
            "timestamp": 1927794957827u64,
            "frame_type": "sync",
            "sequence_number": 12
        })))
        .unwrap();
        assert_eq!(report.anchor_id, "anchor1");
        assert_eq!(report.timestamp, 1927794957827);
        assert_eq!(report.frame_type, FrameType::Sync);
        assert_eq!(report.sequence, 12);
    }

    #[test]
    fn test_missing_or_null_fields_rejected() {
        let cases = [
            json!({"timestamp": 1, "frame_type": "tag", "sequence_number": 1}),
            json!({"anchor_id": "a", "timestamp": null, "frame_type": "tag", "sequence_number": 1}),
            json!({"anchor_id": "a", "timestamp": 1, "sequence_number": 1}),
            json!({"anchor_id": "a", "timestamp": 1, "frame_type": "tag"}),
        ];
        for case in cases {
            let err = RawReport::try_from(payload(case.clone())).unwrap_err();
            assert_eq!(err.reason_code(), "MalformedReport", "case {}", case);
        }
    }

    #[test]
    fn test_invalid_field_values_rejected() {
        let cases = [
            json!({"anchor_id": 5, "timestamp": 1, "frame_type": "tag", "sequence_number": 1}),
            json!({"anchor_id": "a", "timestamp": -1, "frame_type": "tag", "sequence_number": 1}),
            json!({"anchor_id": "a", "timestamp": 1.5, "frame_type": "tag", "sequence_number": 1}),
            json!({"anchor_id": "a", "timestamp": 1, "frame_type": "beacon", "sequence_number": 1}),
            json!({"anchor_id": "a", "timestamp": 1, "frame_type": "tag", "sequence_number": "1"}),
        ];
        for case in cases {
            assert!(RawReport::try_from(payload(case.clone())).is_err(), "case {}", case);
        }
    }

    #[test]
    fn test_position_request() {
        let p: PositionRequestPayload = serde_json::from_value(json!({
            "tag_id": "tag7",
            "timestamps": {"anchor1": 10, "anchor2": 20},
            "sequence_number": 3
        }))
        .unwrap();
        let req = PositionRequest::try_from(p).unwrap();
        assert_eq!(req.tag_id, "tag7");
        assert_eq!(req.timestamps["anchor2"], 20);

        let p: PositionRequestPayload = serde_json::from_value(json!({
            "tag_id": "tag7",
            "timestamps": {"anchor1": "x"},
            "sequence_number": 3
        }))
        .unwrap();
        assert_eq!(PositionRequest::try_from(p).unwrap_err().reason_code(), "MalformedReport");
    }

    #[test]
    fn test_error_message() {
        let e = PositionError::ConvergenceFailure { iterations: 5 };
        let msg = ErrorMessage::from(&e);
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"error": "ConvergenceFailure", "message": "solver did not converge after 5 iterations"})
        );
    }
}
