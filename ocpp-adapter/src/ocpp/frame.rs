//! OCPP-J message framing
//!
//! OCPP uses JSON arrays over WebSocket:
//! - CALL: [2, messageId, action, payload]
//! - CALLRESULT: [3, messageId, payload]
//! - CALLERROR: [4, messageId, errorCode, errorDescription, errorDetails]
//! - CALLRESULTERROR: [5, messageId, errorCode, errorDescription, errorDetails]
//!
//! In overlay-network mode every array carries one trailing routing object
//! `{"destination": ..., "networkPath": [...]}`.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use super::types::{Destination, NetworkPath, RequestId};

/// OCPP message type identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Call = 2,
    CallResult = 3,
    CallError = 4,
    CallResultError = 5,
}

/// OCPP error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    FormatViolation,
    GenericError,
    InternalError,
    MessageTypeNotSupported,
    NotImplemented,
    NotSupported,
    OccurrenceConstraintViolation,
    PropertyConstraintViolation,
    ProtocolError,
    RpcFrameworkError,
    SecurityError,
    TypeConstraintViolation,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl ErrorCode {
    /// Parse a wire error code; unknown codes degrade to `GenericError`
    pub fn from_wire(code: &str) -> Self {
        serde_json::from_value(Value::String(code.to_string())).unwrap_or(ErrorCode::GenericError)
    }
}

/// Errors while parsing or rendering a frame
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid message format: {reason}")]
    InvalidFormat {
        message_type: Option<i64>,
        message_id: Option<RequestId>,
        reason: String,
    },

    #[error("Unknown message type: {message_type}")]
    UnknownMessageType {
        message_id: Option<RequestId>,
        message_type: i64,
    },
}

impl FrameError {
    fn invalid(message_type: i64, message_id: Option<RequestId>, reason: impl Into<String>) -> Self {
        FrameError::InvalidFormat {
            message_type: Some(message_type),
            message_id,
            reason: reason.into(),
        }
    }

    /// Request id of the broken frame, if it could be read
    pub fn message_id(&self) -> Option<&RequestId> {
        match self {
            FrameError::Json(_) => None,
            FrameError::InvalidFormat { message_id, .. } => message_id.as_ref(),
            FrameError::UnknownMessageType { message_id, .. } => message_id.as_ref(),
        }
    }

    /// Id of our call a broken CALLRESULT or CALLERROR was answering
    pub fn answered_call(&self) -> Option<&RequestId> {
        match self {
            FrameError::InvalidFormat {
                message_type: Some(3 | 4),
                message_id,
                ..
            } => message_id.as_ref(),
            _ => None,
        }
    }

    /// Error code for a CALLERROR answering the broken frame.
    ///
    /// `None` when the frame was itself a reply: replies are never answered.
    pub fn reply_code(&self) -> Option<ErrorCode> {
        match self {
            FrameError::Json(_) => Some(ErrorCode::RpcFrameworkError),
            FrameError::InvalidFormat { message_type: None, .. } => Some(ErrorCode::RpcFrameworkError),
            FrameError::InvalidFormat { message_type: Some(2), .. } => Some(ErrorCode::FormatViolation),
            FrameError::InvalidFormat { .. } => None,
            FrameError::UnknownMessageType { .. } => Some(ErrorCode::MessageTypeNotSupported),
        }
    }
}

/// Routing header used in overlay-network mode
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Routing {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination: Option<Destination>,
    #[serde(default, skip_serializing_if = "NetworkPath::is_empty")]
    pub network_path: NetworkPath,
}

/// OCPP CALL message (request)
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub message_id: RequestId,
    pub action: String,
    pub payload: Value,
    pub routing: Option<Routing>,
}

/// OCPP CALLRESULT message (success response)
#[derive(Debug, Clone, PartialEq)]
pub struct CallResult {
    pub message_id: RequestId,
    pub payload: Value,
    pub routing: Option<Routing>,
}

/// OCPP CALLERROR / CALLRESULTERROR body
#[derive(Debug, Clone, PartialEq)]
pub struct CallError {
    pub message_id: RequestId,
    pub error_code: ErrorCode,
    pub error_description: String,
    pub error_details: Value,
    pub routing: Option<Routing>,
}

impl CallError {
    /// Create a new error with empty details
    pub fn new(
        message_id: RequestId,
        error_code: ErrorCode,
        error_description: impl Into<String>,
    ) -> Self {
        Self {
            message_id,
            error_code,
            error_description: error_description.into(),
            error_details: Value::Object(Map::new()),
            routing: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.error_details = details;
        self
    }

    pub fn with_routing(mut self, routing: Option<Routing>) -> Self {
        self.routing = routing;
        self
    }
}

/// Parsed OCPP message (any type)
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Call(Call),
    CallResult(CallResult),
    CallError(CallError),
    CallResultError(CallError),
}

impl Frame {
    /// Parse an OCPP frame from JSON bytes
    pub fn parse(bytes: &[u8]) -> Result<Self, FrameError> {
        let array: Vec<Value> = serde_json::from_slice(bytes)?;

        let msg_type = array
            .first()
            .and_then(Value::as_i64)
            .ok_or_else(|| FrameError::InvalidFormat {
                message_type: None,
                message_id: None,
                reason: "first element must be the message type id".to_string(),
            })?;

        let message_id = array.get(1).and_then(Value::as_str).map(RequestId::from);

        match msg_type {
            2 => {
                let message_id = message_id
                    .ok_or_else(|| FrameError::invalid(2, None, "missing message id"))?;
                let (fields, routing) = split_routing(&array, 4, 2, &message_id)?;

                let action = fields[2]
                    .as_str()
                    .ok_or_else(|| FrameError::invalid(2, Some(message_id.clone()), "action must be a string"))?
                    .to_string();

                Ok(Frame::Call(Call {
                    message_id,
                    action,
                    payload: fields[3].clone(),
                    routing,
                }))
            }
            3 => {
                let message_id = message_id
                    .ok_or_else(|| FrameError::invalid(3, None, "missing message id"))?;
                let (fields, routing) = split_routing(&array, 3, 3, &message_id)?;

                Ok(Frame::CallResult(CallResult {
                    message_id,
                    payload: fields[2].clone(),
                    routing,
                }))
            }
            4 | 5 => {
                let message_id = message_id
                    .ok_or_else(|| FrameError::invalid(msg_type, None, "missing message id"))?;
                let (fields, routing) = split_routing(&array, 5, msg_type, &message_id)?;

                let error_code = fields[2]
                    .as_str()
                    .map(ErrorCode::from_wire)
                    .ok_or_else(|| FrameError::invalid(msg_type, Some(message_id.clone()), "error code must be a string"))?;

                let error = CallError {
                    message_id,
                    error_code,
                    error_description: fields[3].as_str().unwrap_or("").to_string(),
                    error_details: fields[4].clone(),
                    routing,
                };

                if msg_type == 4 {
                    Ok(Frame::CallError(error))
                } else {
                    Ok(Frame::CallResultError(error))
                }
            }
            _ => Err(FrameError::UnknownMessageType {
                message_id,
                message_type: msg_type,
            }),
        }
    }

    /// Get the message ID
    pub fn message_id(&self) -> &RequestId {
        match self {
            Frame::Call(c) => &c.message_id,
            Frame::CallResult(r) => &r.message_id,
            Frame::CallError(e) | Frame::CallResultError(e) => &e.message_id,
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Frame::Call(_) => MessageType::Call,
            Frame::CallResult(_) => MessageType::CallResult,
            Frame::CallError(_) => MessageType::CallError,
            Frame::CallResultError(_) => MessageType::CallResultError,
        }
    }

    /// Render as the JSON array sent on the wire
    pub fn to_value(&self) -> Result<Value, FrameError> {
        let (mut array, routing) = match self {
            Frame::Call(c) => (
                vec![
                    Value::from(MessageType::Call as i32),
                    Value::from(c.message_id.as_str()),
                    Value::from(c.action.as_str()),
                    c.payload.clone(),
                ],
                &c.routing,
            ),
            Frame::CallResult(r) => (
                vec![
                    Value::from(MessageType::CallResult as i32),
                    Value::from(r.message_id.as_str()),
                    r.payload.clone(),
                ],
                &r.routing,
            ),
            Frame::CallError(e) | Frame::CallResultError(e) => (
                vec![
                    Value::from(self.message_type() as i32),
                    Value::from(e.message_id.as_str()),
                    Value::from(e.error_code.to_string()),
                    Value::from(e.error_description.as_str()),
                    e.error_details.clone(),
                ],
                &e.routing,
            ),
        };

        if let Some(routing) = routing {
            array.push(serde_json::to_value(routing)?);
        }

        Ok(Value::Array(array))
    }

    /// Serialize to the text sent in a WebSocket frame
    pub fn to_text(&self) -> Result<String, FrameError> {
        Ok(serde_json::to_string(&self.to_value()?)?)
    }
}

/// Split a frame array into its standard fields and optional routing object
fn split_routing<'a>(
    array: &'a [Value],
    len: usize,
    msg_type: i64,
    message_id: &RequestId,
) -> Result<(&'a [Value], Option<Routing>), FrameError> {
    if array.len() == len {
        return Ok((array, None));
    }

    if array.len() == len + 1 {
        let routing: Routing = serde_json::from_value(array[len].clone()).map_err(|e| {
            FrameError::invalid(msg_type, Some(message_id.clone()), format!("invalid routing header: {}", e))
        })?;
        return Ok((&array[..len], Some(routing)));
    }

    Err(FrameError::invalid(
        msg_type,
        Some(message_id.clone()),
        format!("expected {} elements, got {}", len, array.len()),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_call_serialization() {
        let frame = Frame::Call(Call {
            message_id: RequestId::from("msg-1"),
            action: "Heartbeat".to_string(),
            payload: json!({}),
            routing: None,
        });
        let text = frame.to_text().unwrap();

        assert_eq!(text, r#"[2,"msg-1","Heartbeat",{}]"#);
    }

    #[test]
    fn test_call_parsing() {
        let json = r#"[2, "msg-123", "Heartbeat", {}]"#;
        let msg = Frame::parse(json.as_bytes()).unwrap();

        match msg {
            Frame::Call(call) => {
                assert_eq!(call.message_id.as_str(), "msg-123");
                assert_eq!(call.action, "Heartbeat");
                assert!(call.routing.is_none());
            }
            _ => panic!("Expected Call"),
        }
    }

    #[test]
    fn test_call_result_parsing() {
        let json = r#"[3, "msg-123", {"currentTime": "2026-01-20T12:00:00Z"}]"#;
        let msg = Frame::parse(json.as_bytes()).unwrap();

        match msg {
            Frame::CallResult(result) => {
                assert_eq!(result.message_id.as_str(), "msg-123");
                assert_eq!(result.payload["currentTime"], "2026-01-20T12:00:00Z");
            }
            _ => panic!("Expected CallResult"),
        }
    }

    #[test]
    fn test_call_error_parsing() {
        let json = r#"[4, "msg-123", "NotImplemented", "Action not supported", {}]"#;
        let msg = Frame::parse(json.as_bytes()).unwrap();

        match msg {
            Frame::CallError(error) => {
                assert_eq!(error.message_id.as_str(), "msg-123");
                assert_eq!(error.error_code, ErrorCode::NotImplemented);
            }
            _ => panic!("Expected CallError"),
        }
    }

    #[test]
    fn test_call_result_error_parsing() {
        let json = r#"[5, "msg-9", "SecurityError", "bad signature", {"hint": 1}]"#;
        match Frame::parse(json.as_bytes()).unwrap() {
            Frame::CallResultError(error) => {
                assert_eq!(error.error_code, ErrorCode::SecurityError);
                assert_eq!(error.error_details, json!({"hint": 1}));
            }
            other => panic!("Expected CallResultError, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_error_code_degrades() {
        let json = r#"[4, "msg-1", "SomethingNew", "", {}]"#;
        match Frame::parse(json.as_bytes()).unwrap() {
            Frame::CallError(error) => assert_eq!(error.error_code, ErrorCode::GenericError),
            _ => panic!("Expected CallError"),
        }
    }

    #[test]
    fn test_overlay_routing_round_trip() {
        let frame = Frame::Call(Call {
            message_id: RequestId::from("r-1"),
            action: "Reset".to_string(),
            payload: json!({"type": "OnIdle"}),
            routing: Some(Routing {
                destination: Some(Destination::node("CS001")),
                network_path: NetworkPath::from_source("CSMS").append("NN1"),
            }),
        });

        let text = frame.to_text().unwrap();
        assert!(text.ends_with(r#"{"destination":"CS001","networkPath":["CSMS","NN1"]}]"#));
        assert_eq!(Frame::parse(text.as_bytes()).unwrap(), frame);
    }

    #[test]
    fn test_broken_reply_names_the_call_it_answers() {
        let err = Frame::parse(br#"[3,"abc"]"#).unwrap_err();
        assert_eq!(err.answered_call().map(RequestId::as_str), Some("abc"));
        assert_eq!(err.reply_code(), None);

        let err = Frame::parse(br#"[4,"abc",17,"",{}]"#).unwrap_err();
        assert_eq!(err.answered_call().map(RequestId::as_str), Some("abc"));

        let err = Frame::parse(br#"[5,"abc"]"#).unwrap_err();
        assert!(err.answered_call().is_none());
        let err = Frame::parse(br#"[2,"abc","Reset"]"#).unwrap_err();
        assert!(err.answered_call().is_none());
    }

    #[test]
    fn test_malformed_frames() {
        let err = Frame::parse(b"not json").unwrap_err();
        assert_eq!(err.reply_code(), Some(ErrorCode::RpcFrameworkError));
        assert!(err.message_id().is_none());

        let err = Frame::parse(br#"[2, "id-7", "Reset"]"#).unwrap_err();
        assert_eq!(err.reply_code(), Some(ErrorCode::FormatViolation));
        assert_eq!(err.message_id().map(RequestId::as_str), Some("id-7"));

        let err = Frame::parse(br#"[3, "id-8"]"#).unwrap_err();
        assert_eq!(err.reply_code(), None);

        let err = Frame::parse(br#"[9, "id-9", {}]"#).unwrap_err();
        assert_eq!(err.reply_code(), Some(ErrorCode::MessageTypeNotSupported));
    }
}
