//! JSON-RPC 2.0 envelope types.

use std::borrow::Cow;

use peermcp_core::{McpError, McpResult};
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::value::RawValue;
use serde_json::Value;

/// The JSON-RPC version string. Used as a static reference to avoid allocations.
pub const JSONRPC_VERSION: &str = "2.0";

/// Serializes the jsonrpc version field.
fn serialize_jsonrpc_version<S>(value: &Cow<'static, str>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(value)
}

/// Deserializes the jsonrpc version field, returning a borrowed reference for "2.0".
fn deserialize_jsonrpc_version<'de, D>(deserializer: D) -> Result<Cow<'static, str>, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    if s == JSONRPC_VERSION {
        Ok(Cow::Borrowed(JSONRPC_VERSION))
    } else {
        Ok(Cow::Owned(s))
    }
}

fn version() -> Cow<'static, str> {
    Cow::Borrowed(JSONRPC_VERSION)
}

/// JSON-RPC request ID: a string or an integer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// Integer ID.
    Number(i64),
    /// String ID.
    String(String),
}

impl From<i64> for RequestId {
    fn from(id: i64) -> Self {
        RequestId::Number(id)
    }
}

impl From<String> for RequestId {
    fn from(id: String) -> Self {
        RequestId::String(id)
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        RequestId::String(id.to_owned())
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::String(s) => write!(f, "{s}"),
        }
    }
}

/// JSON-RPC 2.0 request.
///
/// Parameters are carried as raw bytes and decoded by the handler that owns
/// the method's schema, so classification never pays for a full parse.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// Protocol version (always "2.0").
    #[serde(
        serialize_with = "serialize_jsonrpc_version",
        deserialize_with = "deserialize_jsonrpc_version"
    )]
    pub jsonrpc: Cow<'static, str>,
    /// Request ID.
    pub id: RequestId,
    /// Method name.
    pub method: String,
    /// Raw request parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Box<RawValue>>,
}

impl JsonRpcRequest {
    /// Creates a new request.
    #[must_use]
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Box<RawValue>>) -> Self {
        Self {
            jsonrpc: version(),
            id: id.into(),
            method: method.into(),
            params,
        }
    }

    /// Returns true if the envelope is a well-formed request.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.jsonrpc == JSONRPC_VERSION && !self.method.is_empty()
    }
}

/// JSON-RPC 2.0 notification (a request without an ID).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    /// Protocol version (always "2.0").
    #[serde(
        serialize_with = "serialize_jsonrpc_version",
        deserialize_with = "deserialize_jsonrpc_version"
    )]
    pub jsonrpc: Cow<'static, str>,
    /// Method name.
    pub method: String,
    /// Raw notification parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Box<RawValue>>,
}

impl JsonRpcNotification {
    /// Creates a new notification.
    #[must_use]
    pub fn new(method: impl Into<String>, params: Option<Box<RawValue>>) -> Self {
        Self {
            jsonrpc: version(),
            method: method.into(),
            params,
        }
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    /// Error code.
    pub code: i32,
    /// Error message.
    pub message: String,
    /// Additional error data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl From<&McpError> for JsonRpcError {
    fn from(err: &McpError) -> Self {
        Self {
            code: err.code.json_rpc_code(),
            message: err.message.clone(),
            data: err.data.clone(),
        }
    }
}

/// JSON-RPC 2.0 response. Exactly one of `result` or `error` is present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    /// Protocol version (always "2.0").
    #[serde(
        serialize_with = "serialize_jsonrpc_version",
        deserialize_with = "deserialize_jsonrpc_version"
    )]
    pub jsonrpc: Cow<'static, str>,
    /// Request ID this is responding to.
    pub id: RequestId,
    /// Raw result (present on success).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Box<RawValue>>,
    /// Error (present on failure).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// Creates a success response.
    #[must_use]
    pub fn success(id: RequestId, result: Box<RawValue>) -> Self {
        Self {
            jsonrpc: version(),
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Creates an error response.
    #[must_use]
    pub fn error(id: RequestId, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: version(),
            id,
            result: None,
            error: Some(error),
        }
    }

    /// Returns true if this is an error response.
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// A classified JSON-RPC message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcMessage {
    /// A request (id + method).
    Request(JsonRpcRequest),
    /// A notification (method, no id).
    Notification(JsonRpcNotification),
    /// A response (id, no method).
    Response(JsonRpcResponse),
}

/// Classifies a message by probing for `id` and `method` presence, then
/// parses only the matching envelope shape:
///
/// - id absent, method present: notification
/// - id present, method present: request
/// - id present, method absent: response
pub fn classify(bytes: &[u8]) -> McpResult<JsonRpcMessage> {
    #[derive(Deserialize)]
    struct Probe {
        #[serde(default)]
        id: Option<IgnoredAny>,
        #[serde(default)]
        method: Option<IgnoredAny>,
    }

    let probe: Probe = serde_json::from_slice(bytes)?;
    match (probe.id.is_some(), probe.method.is_some()) {
        (false, true) => Ok(JsonRpcMessage::Notification(serde_json::from_slice(bytes)?)),
        (true, true) => Ok(JsonRpcMessage::Request(serde_json::from_slice(bytes)?)),
        (true, false) => Ok(JsonRpcMessage::Response(serde_json::from_slice(bytes)?)),
        (false, false) => Err(McpError::invalid_request(
            "message has neither id nor method",
        )),
    }
}

/// Serializes a typed value into a raw params/result payload.
pub fn to_raw<T: Serialize>(value: &T) -> McpResult<Box<RawValue>> {
    let s = serde_json::to_string(value)?;
    Ok(RawValue::from_string(s)?)
}

/// Decodes a raw payload into its typed shape. A missing payload is a parse
/// error; use [`from_raw_or_default`] for methods whose params are optional.
pub fn from_raw<T: DeserializeOwned>(raw: Option<&RawValue>) -> McpResult<T> {
    match raw {
        Some(raw) => Ok(serde_json::from_str(raw.get())?),
        None => Err(McpError::parse_error("json unmarshal: missing params")),
    }
}

/// Decodes a raw payload, falling back to the type's default when absent.
pub fn from_raw_or_default<T: DeserializeOwned + Default>(raw: Option<&RawValue>) -> McpResult<T> {
    match raw {
        Some(raw) => Ok(serde_json::from_str(raw.get())?),
        None => Ok(T::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serialization() {
        let req = JsonRpcRequest::new(1i64, "tools/list", None);
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"jsonrpc\":\"2.0\""));
        assert!(json.contains("\"method\":\"tools/list\""));
        assert!(json.contains("\"id\":1"));
    }

    #[test]
    fn classify_request() {
        let msg = classify(br#"{"jsonrpc":"2.0","id":"1","method":"ping"}"#).unwrap();
        assert!(matches!(msg, JsonRpcMessage::Request(_)));
    }

    #[test]
    fn classify_notification() {
        let msg =
            classify(br#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#).unwrap();
        assert!(matches!(msg, JsonRpcMessage::Notification(_)));
    }

    #[test]
    fn classify_response() {
        let msg = classify(br#"{"jsonrpc":"2.0","id":7,"result":{}}"#).unwrap();
        let JsonRpcMessage::Response(resp) = msg else {
            panic!("expected response");
        };
        assert_eq!(resp.id, RequestId::Number(7));
        assert!(!resp.is_error());
    }

    #[test]
    fn classify_rejects_bare_object() {
        assert!(classify(br#"{"jsonrpc":"2.0"}"#).is_err());
    }

    #[test]
    fn envelope_round_trip() {
        let cases: &[&str] = &[
            r#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":"t"}}"#,
            r#"{"jsonrpc":"2.0","method":"notifications/progress","params":{"progressToken":"p","progress":0.5}}"#,
            r#"{"jsonrpc":"2.0","id":"9","result":{"tools":[]}}"#,
            r#"{"jsonrpc":"2.0","id":2,"error":{"code":-32601,"message":"nope"}}"#,
        ];
        for case in cases {
            let msg = classify(case.as_bytes()).unwrap();
            let encoded = serde_json::to_string(&msg).unwrap();
            let value: Value = serde_json::from_str(&encoded).unwrap();
            let original: Value = serde_json::from_str(case).unwrap();
            assert_eq!(value, original);
        }
    }

    #[test]
    fn invalid_request_detected() {
        let req = JsonRpcRequest {
            jsonrpc: Cow::Borrowed("1.0"),
            id: RequestId::Number(1),
            method: "ping".into(),
            params: None,
        };
        assert!(!req.is_valid());

        let req = JsonRpcRequest::new(1i64, "", None);
        assert!(!req.is_valid());
    }

    #[test]
    fn raw_round_trip() {
        #[derive(Serialize, serde::Deserialize, Default, PartialEq, Debug)]
        struct P {
            x: i32,
        }
        let raw = to_raw(&P { x: 3 }).unwrap();
        let back: P = from_raw(Some(&raw)).unwrap();
        assert_eq!(back, P { x: 3 });

        let missing: P = from_raw_or_default(None).unwrap();
        assert_eq!(missing, P::default());
        assert!(from_raw::<P>(None).is_err());
    }
}
