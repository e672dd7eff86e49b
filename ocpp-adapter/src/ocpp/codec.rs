//! Payload codec shared by every OCPP message
//!
//! A message type only supplies its serde field set and a small descriptor
//! (`OcppRequest::ACTION`, the response type, optional `validate`). Encoding,
//! decoding, custom serializer/parser hooks and the canonical form used for
//! signatures are implemented once here.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::engine::panic_message;

use super::types::{Destination, EventTrackingId, NetworkPath, RequestId};

/// Errors while encoding or decoding a payload
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("payload must be a JSON object, got {0}")]
    NotAnObject(&'static str),

    #[error("invalid payload: {0}")]
    Formation(String),

    #[error("'{field}' {reason}")]
    Constraint { field: &'static str, reason: String },

    #[error("custom {hook} hook panicked: {message}")]
    HookPanicked { hook: &'static str, message: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A request or response payload
pub trait OcppPayload: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Check documented bounds the serde field set cannot express
    fn validate(&self) -> Result<(), CodecError> {
        Ok(())
    }
}

/// Descriptor of a request type: its action name and response type
pub trait OcppRequest: OcppPayload {
    const ACTION: &'static str;
    type Response: OcppPayload;
}

/// Hook overriding the default JSON emitted for `T`
pub type CustomSerializer<T> = Arc<dyn Fn(&T, Value) -> Value + Send + Sync>;

/// Hook adjusting a decoded `T` using the raw JSON it came from
pub type CustomParser<T> = Arc<dyn Fn(&Value, T) -> T + Send + Sync>;

/// Per-type custom serializer and parser registry
#[derive(Default)]
pub struct CustomHooks {
    serializers: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
    parsers: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl CustomHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a serializer for `T`, replacing any previous one
    pub fn with_serializer<T, F>(mut self, f: F) -> Self
    where
        T: OcppPayload,
        F: Fn(&T, Value) -> Value + Send + Sync + 'static,
    {
        let hook: CustomSerializer<T> = Arc::new(f);
        self.serializers.insert(TypeId::of::<T>(), Box::new(hook));
        self
    }

    /// Register a parser for `T`, replacing any previous one
    pub fn with_parser<T, F>(mut self, f: F) -> Self
    where
        T: OcppPayload,
        F: Fn(&Value, T) -> T + Send + Sync + 'static,
    {
        let hook: CustomParser<T> = Arc::new(f);
        self.parsers.insert(TypeId::of::<T>(), Box::new(hook));
        self
    }

    pub fn serializer<T: OcppPayload>(&self) -> Option<&CustomSerializer<T>> {
        self.serializers
            .get(&TypeId::of::<T>())
            .and_then(|hook| hook.downcast_ref::<CustomSerializer<T>>())
    }

    pub fn parser<T: OcppPayload>(&self) -> Option<&CustomParser<T>> {
        self.parsers
            .get(&TypeId::of::<T>())
            .and_then(|hook| hook.downcast_ref::<CustomParser<T>>())
    }
}

/// Exchange metadata available while decoding
#[derive(Debug, Clone)]
pub struct DecodeContext {
    pub request_id: RequestId,
    pub destination: Option<Destination>,
    pub network_path: NetworkPath,
    pub timestamp: DateTime<Utc>,
    pub timeout: Option<Duration>,
    pub event_tracking_id: EventTrackingId,
}

impl DecodeContext {
    pub fn new(request_id: RequestId) -> Self {
        Self {
            request_id,
            destination: None,
            network_path: NetworkPath::new(),
            timestamp: Utc::now(),
            timeout: None,
            event_tracking_id: EventTrackingId::new(),
        }
    }
}

/// A decoded payload together with the context it arrived in
#[derive(Debug, Clone)]
pub struct Decoded<T> {
    pub context: DecodeContext,
    pub payload: T,
}

/// Encode a payload to its JSON object form.
///
/// Output is deterministic: object keys are sorted, absent optionals are
/// omitted and an empty `signatures` array is dropped even if a custom
/// serializer produced one.
pub fn encode<T: OcppPayload>(
    value: &T,
    serializer: Option<&CustomSerializer<T>>,
) -> Result<Value, CodecError> {
    let mut json = serde_json::to_value(value)?;

    if let Some(serializer) = serializer {
        json = catch_unwind(AssertUnwindSafe(|| serializer(value, json)))
            .map_err(|panic| CodecError::HookPanicked {
                hook: "serializer",
                message: panic_message(&*panic),
            })?;
    }

    let kind = json_kind(&json);
    let object = json.as_object_mut().ok_or(CodecError::NotAnObject(kind))?;

    let empty_signatures = object
        .get("signatures")
        .and_then(Value::as_array)
        .map_or(false, Vec::is_empty);
    if empty_signatures {
        object.remove("signatures");
    }

    Ok(json)
}

/// Decode a payload, never panicking on malformed input
pub fn try_decode<T: OcppPayload>(
    json: &Value,
    context: DecodeContext,
    parser: Option<&CustomParser<T>>,
) -> Result<Decoded<T>, CodecError> {
    let mut payload = parse::<T>(json)?;

    if let Some(parser) = parser {
        payload = catch_unwind(AssertUnwindSafe(|| parser(json, payload)))
            .map_err(|panic| CodecError::HookPanicked {
                hook: "parser",
                message: panic_message(&*panic),
            })?;
    }

    Ok(Decoded { context, payload })
}

/// Strict decode for call sites that already validated the frame
pub fn parse<T: OcppPayload>(json: &Value) -> Result<T, CodecError> {
    if !json.is_object() {
        return Err(CodecError::NotAnObject(json_kind(json)));
    }

    let payload: T =
        serde_json::from_value(json.clone()).map_err(|e| CodecError::Formation(e.to_string()))?;
    payload.validate()?;
    Ok(payload)
}

/// Bytes covered by the signature block: the payload without `signatures`
pub fn canonical_bytes(json: &Value) -> Result<Vec<u8>, CodecError> {
    let mut object = json
        .as_object()
        .cloned()
        .ok_or_else(|| CodecError::NotAnObject(json_kind(json)))?;
    object.remove("signatures");
    Ok(serde_json::to_vec(&object)?)
}

/// Enforce a documented maximum string length
pub fn check_max_len(field: &'static str, value: &str, max: usize) -> Result<(), CodecError> {
    let len = value.chars().count();
    if len > max {
        return Err(CodecError::Constraint {
            field,
            reason: format!("exceeds maximum length of {} (got {})", max, len),
        });
    }
    Ok(())
}

fn json_kind(json: &Value) -> &'static str {
    match json {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocpp::messages::{GetVariablesRequest, ResetRequest, ResetResponse};
    use crate::ocpp::types::*;
    use serde_json::json;

    #[test]
    fn test_encode_omits_absent_members() {
        let request = ResetRequest::new(ResetType::OnIdle);
        let json = encode(&request, None).unwrap();
        assert_eq!(json, json!({"type": "OnIdle"}));
    }

    #[test]
    fn test_encode_is_deterministic() {
        let mut response = ResetResponse::new(ResetStatus::Accepted);
        response.status_info = Some(StatusInfo::new("Idle"));
        response.ext.custom_data = Some(CustomData::vendor("EK").with("zeta", json!(1)));

        let a = serde_json::to_string(&encode(&response, None).unwrap()).unwrap();
        let b = serde_json::to_string(&encode(&response.clone(), None).unwrap()).unwrap();
        assert_eq!(a, b);
        assert_eq!(
            a,
            r#"{"customData":{"vendorId":"EK","zeta":1},"status":"Accepted","statusInfo":{"reasonCode":"Idle"}}"#
        );
    }

    #[test]
    fn test_custom_serializer_overrides_output() {
        let hooks = CustomHooks::new().with_serializer::<ResetRequest, _>(|_, mut json| {
            json["signatures"] = json!([]);
            json["extra"] = json!("x");
            json
        });

        let json = encode(&ResetRequest::new(ResetType::Immediate), hooks.serializer()).unwrap();
        assert_eq!(json, json!({"type": "Immediate", "extra": "x"}));
        assert!(hooks.serializer::<ResetResponse>().is_none());
    }

    #[test]
    fn test_missing_field_names_the_field() {
        let err = try_decode::<ResetRequest>(&json!({"evseId": 1}), DecodeContext::new("r".into()), None)
            .unwrap_err();
        assert!(err.to_string().contains("type"), "{}", err);
    }

    #[test]
    fn test_unknown_enum_value_fails() {
        let err = parse::<ResetRequest>(&json!({"type": "Sometime"})).unwrap_err();
        assert!(matches!(err, CodecError::Formation(_)));
    }

    #[test]
    fn test_unknown_fields_are_ignored() {
        let request = parse::<ResetRequest>(&json!({"type": "OnIdle", "futureField": true})).unwrap();
        assert_eq!(request.reset_type, ResetType::OnIdle);
    }

    #[test]
    fn test_non_object_payload_fails() {
        let err = parse::<ResetRequest>(&json!(["OnIdle"])).unwrap_err();
        assert!(matches!(err, CodecError::NotAnObject("array")));
    }

    #[test]
    fn test_custom_parser_runs_and_panics_are_contained() {
        let hooks = CustomHooks::new().with_parser::<ResetRequest, _>(|json, mut request| {
            if json.get("legacyEvse").is_some() {
                request.evse_id = Some(99);
            }
            request
        });
        let decoded = try_decode(
            &json!({"type": "OnIdle", "legacyEvse": true}),
            DecodeContext::new("r".into()),
            hooks.parser::<ResetRequest>(),
        )
        .unwrap();
        assert_eq!(decoded.payload.evse_id, Some(99));

        let hooks = CustomHooks::new()
            .with_parser::<ResetRequest, _>(|_, _| panic!("broken parser"));
        let err = try_decode(
            &json!({"type": "OnIdle"}),
            DecodeContext::new("r".into()),
            hooks.parser::<ResetRequest>(),
        )
        .unwrap_err();
        assert!(matches!(
            &err,
            CodecError::HookPanicked { hook: "parser", message } if message == "broken parser"
        ));
    }

    #[test]
    fn test_panicking_serializer_keeps_its_message() {
        let hooks = CustomHooks::new()
            .with_serializer::<ResetRequest, _>(|_, _| panic!("serializer exploded on {}", "Reset"));
        let err = encode(&ResetRequest::new(ResetType::Immediate), hooks.serializer()).unwrap_err();
        assert!(err.to_string().contains("serializer exploded on Reset"), "{}", err);
    }

    #[test]
    fn test_canonical_bytes_exclude_signatures() {
        let signed = json!({"b": 1, "a": 2, "signatures": [{"keyId": "k", "value": "v"}]});
        let unsigned = json!({"a": 2, "b": 1});
        assert_eq!(canonical_bytes(&signed).unwrap(), canonical_bytes(&unsigned).unwrap());
        assert_eq!(canonical_bytes(&unsigned).unwrap(), br#"{"a":2,"b":1}"#.to_vec());
    }

    #[test]
    fn test_decode_context_is_carried() {
        let mut context = DecodeContext::new("req-42".into());
        context.network_path = NetworkPath::from_source("CS1");
        let decoded = try_decode::<GetVariablesRequest>(
            &json!({"getVariableData": [{"component": {"name": "OCPPCommCtrlr"}, "variable": {"name": "HeartbeatInterval"}}]}),
            context,
            None,
        )
        .unwrap();
        assert_eq!(decoded.context.request_id.as_str(), "req-42");
        assert_eq!(decoded.context.network_path.source(), Some("CS1"));
        assert_eq!(decoded.payload.get_variable_data.len(), 1);
    }
}
