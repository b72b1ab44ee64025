//! OCPP-J message framing.
//!
//! OCPP-J frames are JSON arrays:
//!
//! - `CALL`       `[2, uniqueId, action, payload]`
//! - `CALLRESULT` `[3, uniqueId, payload]`
//! - `CALLERROR`  `[4, uniqueId, errorCode, errorDescription, errorDetails]`
//!
//! This framing is version-agnostic; it says nothing about what `action`
//! or `payload` mean, only how the envelope is shaped.

use serde_json::Value;
use std::fmt;

const MSG_TYPE_CALL: u64 = 2;
const MSG_TYPE_CALL_RESULT: u64 = 3;
const MSG_TYPE_CALL_ERROR: u64 = 4;

/// Maximum length of a `uniqueId`, per the OCPP-J spec.
pub const MAX_UNIQUE_ID_LEN: usize = 36;

#[derive(Debug, Clone, PartialEq)]
pub enum OcppFrame {
    Call {
        unique_id: String,
        action: String,
        payload: Value,
    },
    CallResult {
        unique_id: String,
        payload: Value,
    },
    CallError {
        unique_id: String,
        error_code: String,
        error_description: String,
        error_details: Value,
    },
}

impl OcppFrame {
    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        let arr: Vec<Value> = serde_json::from_str(text)
            .map_err(|e| DecodeError::MalformedFrame(format!("invalid JSON: {e}")))?;

        let msg_type = arr
            .first()
            .and_then(Value::as_u64)
            .ok_or_else(|| DecodeError::MalformedFrame("missing message-type tag".into()))?;

        match msg_type {
            MSG_TYPE_CALL => Self::decode_call(&arr),
            MSG_TYPE_CALL_RESULT => Self::decode_call_result(&arr),
            MSG_TYPE_CALL_ERROR => Self::decode_call_error(&arr),
            other => Err(DecodeError::MalformedFrame(format!(
                "unknown message type: {other}"
            ))),
        }
    }

    fn decode_call(arr: &[Value]) -> Result<Self, DecodeError> {
        if arr.len() != 4 {
            return Err(DecodeError::MalformedFrame(format!(
                "CALL requires 4 elements, got {}",
                arr.len()
            )));
        }
        let unique_id = field_str(arr, 1, "uniqueId")?;
        let action = field_str(arr, 2, "action")?;
        if crate::messages::InboundAction::from_wire(&action).is_none() {
            return Err(DecodeError::UnknownAction { unique_id, action });
        }
        let payload = arr[3].clone();
        Ok(Self::Call {
            unique_id,
            action,
            payload,
        })
    }

    fn decode_call_result(arr: &[Value]) -> Result<Self, DecodeError> {
        if arr.len() != 3 {
            return Err(DecodeError::MalformedFrame(format!(
                "CALLRESULT requires 3 elements, got {}",
                arr.len()
            )));
        }
        let unique_id = field_str(arr, 1, "uniqueId")?;
        Ok(Self::CallResult {
            unique_id,
            payload: arr[2].clone(),
        })
    }

    fn decode_call_error(arr: &[Value]) -> Result<Self, DecodeError> {
        if arr.len() != 5 {
            return Err(DecodeError::MalformedFrame(format!(
                "CALLERROR requires 5 elements, got {}",
                arr.len()
            )));
        }
        let unique_id = field_str(arr, 1, "uniqueId")?;
        let error_code = field_str(arr, 2, "errorCode")?;
        let error_description = field_str(arr, 3, "errorDescription")?;
        Ok(Self::CallError {
            unique_id,
            error_code,
            error_description,
            error_details: arr[4].clone(),
        })
    }

    pub fn encode(&self) -> String {
        let arr = match self {
            Self::Call {
                unique_id,
                action,
                payload,
            } => Value::Array(vec![
                Value::from(MSG_TYPE_CALL),
                Value::String(unique_id.clone()),
                Value::String(action.clone()),
                payload.clone(),
            ]),
            Self::CallResult { unique_id, payload } => Value::Array(vec![
                Value::from(MSG_TYPE_CALL_RESULT),
                Value::String(unique_id.clone()),
                payload.clone(),
            ]),
            Self::CallError {
                unique_id,
                error_code,
                error_description,
                error_details,
            } => Value::Array(vec![
                Value::from(MSG_TYPE_CALL_ERROR),
                Value::String(unique_id.clone()),
                Value::String(error_code.clone()),
                Value::String(error_description.clone()),
                error_details.clone(),
            ]),
        };
        // Array of JSON-representable values never fails to serialize.
        serde_json::to_string(&arr).expect("OcppFrame always serializes")
    }

    pub fn unique_id(&self) -> &str {
        match self {
            Self::Call { unique_id, .. }
            | Self::CallResult { unique_id, .. }
            | Self::CallError { unique_id, .. } => unique_id,
        }
    }

    pub fn error_response(
        unique_id: impl Into<String>,
        error_code: impl Into<String>,
        error_description: impl Into<String>,
    ) -> Self {
        Self::CallError {
            unique_id: unique_id.into(),
            error_code: error_code.into(),
            error_description: error_description.into(),
            error_details: Value::Object(Default::default()),
        }
    }

    pub fn is_call(&self) -> bool {
        matches!(self, Self::Call { .. })
    }
}

fn field_str(arr: &[Value], idx: usize, name: &str) -> Result<String, DecodeError> {
    arr[idx]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| DecodeError::MalformedFrame(format!("{name} must be a string")))
}

#[derive(Debug, Clone, PartialEq)]
pub enum DecodeError {
    MalformedFrame(String),
    UnknownAction { unique_id: String, action: String },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedFrame(msg) => write!(f, "malformed frame: {msg}"),
            Self::UnknownAction { action, .. } => write!(f, "unknown action: {action}"),
        }
    }
}

impl std::error::Error for DecodeError {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decode_call() {
        let text = r#"[2,"abc123","Reset",{"type":"Soft"}]"#;
        let frame = OcppFrame::decode(text).unwrap();
        match frame {
            OcppFrame::Call {
                unique_id,
                action,
                payload,
            } => {
                assert_eq!(unique_id, "abc123");
                assert_eq!(action, "Reset");
                assert_eq!(payload["type"], "Soft");
            }
            _ => panic!("expected Call"),
        }
    }

    #[test]
    fn decode_call_rejects_unknown_action() {
        let text = r#"[2,"abc123","FooBarBaz",{}]"#;
        assert!(matches!(
            OcppFrame::decode(text),
            Err(DecodeError::UnknownAction { unique_id, action })
                if unique_id == "abc123" && action == "FooBarBaz"
        ));
    }

    #[test]
    fn decode_call_result() {
        let text = r#"[3,"abc123",{"status":"Accepted"}]"#;
        let frame = OcppFrame::decode(text).unwrap();
        assert!(matches!(frame, OcppFrame::CallResult { .. }));
    }

    #[test]
    fn decode_call_error() {
        let text = r#"[4,"abc123","NotImplemented","unsupported action",{}]"#;
        let frame = OcppFrame::decode(text).unwrap();
        match frame {
            OcppFrame::CallError {
                error_code,
                error_description,
                ..
            } => {
                assert_eq!(error_code, "NotImplemented");
                assert_eq!(error_description, "unsupported action");
            }
            _ => panic!("expected CallError"),
        }
    }

    #[test]
    fn rejects_wrong_arity() {
        let text = r#"[2,"abc123","BootNotification"]"#;
        assert!(matches!(
            OcppFrame::decode(text),
            Err(DecodeError::MalformedFrame(_))
        ));
    }

    #[test]
    fn rejects_non_array() {
        assert!(OcppFrame::decode(r#"{"foo":"bar"}"#).is_err());
    }

    #[test]
    fn roundtrip_call() {
        let frame = OcppFrame::Call {
            unique_id: "1".into(),
            action: "Reset".into(),
            payload: json!({}),
        };
        let decoded = OcppFrame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn roundtrip_call_result() {
        let frame = OcppFrame::CallResult {
            unique_id: "2".into(),
            payload: json!({"currentTime": "2024-01-01T00:00:00.000Z"}),
        };
        let decoded = OcppFrame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn roundtrip_call_error() {
        let frame = OcppFrame::error_response("3", "GenericError", "boom");
        let decoded = OcppFrame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded, frame);
    }
}
