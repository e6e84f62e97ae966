//! JSON-RPC 2.0 message model for the MCP protocol.
//!
//! Every value exchanged over a transport is a [`Message`], one of four shapes:
//!
//! - **Request**: expects a reply (has a non-null `id`)
//! - **Notification**: one-way (no `id`)
//! - **Response**: successful reply carrying `result`
//! - **Error**: failed reply carrying an `error` object
//!
//! # MCP-Specific Constraints
//!
//! - Request IDs must be strings or integers (never `null`)
//! - A reply echoes the `id` of the request it answers
//! - Exactly one of `result` / `error` is present on a reply

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Map, Value};

use crate::error::{McpError, ProtocolError};

/// The JSON-RPC version tag carried by every message.
pub const JSONRPC_VERSION: &str = "2.0";

/// The MCP protocol version this implementation speaks.
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

/// Name reported in `clientInfo` / `serverInfo`.
pub const IMPLEMENTATION_NAME: &str = "mcp-link";

/// Method names used by the protocol.
pub mod methods {
    /// Capability negotiation request.
    pub const INITIALIZE: &str = "initialize";
    /// Sent by the client once `initialize` succeeded.
    pub const INITIALIZED: &str = "notifications/initialized";
    /// List published resources.
    pub const RESOURCES_LIST: &str = "resources/list";
    /// List resource templates.
    pub const RESOURCES_TEMPLATES_LIST: &str = "resources/templates/list";
    /// Read one resource by URI.
    pub const RESOURCES_READ: &str = "resources/read";
    /// Subscribe to resource updates.
    pub const RESOURCES_SUBSCRIBE: &str = "resources/subscribe";
    /// Cancel a resource subscription.
    pub const RESOURCES_UNSUBSCRIBE: &str = "resources/unsubscribe";
    /// List registered tools.
    pub const TOOLS_LIST: &str = "tools/list";
    /// Invoke a tool.
    pub const TOOLS_CALL: &str = "tools/call";
    /// List prompts.
    pub const PROMPTS_LIST: &str = "prompts/list";
    /// Render one prompt.
    pub const PROMPTS_GET: &str = "prompts/get";
    /// Liveness check.
    pub const PING: &str = "ping";
    /// Ask the server to stop its accept loop.
    pub const SHUTDOWN: &str = "shutdown";
    /// Cancellation notice.
    pub const CANCELLED: &str = "notifications/cancelled";
    /// Progress notice.
    pub const PROGRESS: &str = "notifications/progress";
}

/// A JSON-RPC 2.0 request ID.
///
/// MCP ids are strings or integers, never `null`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// Numeric request ID.
    Number(i64),
    /// String request ID.
    String(String),
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s}"),
        }
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

impl From<i32> for RequestId {
    fn from(n: i32) -> Self {
        Self::Number(i64::from(n))
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

/// JSON-RPC 2.0 and MCP error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Invalid JSON was received.
    ParseError,
    /// The JSON sent is not a valid message.
    InvalidRequest,
    /// The method does not exist or is not available.
    MethodNotFound,
    /// Invalid method parameters.
    InvalidParams,
    /// Internal JSON-RPC error.
    InternalError,
    /// Authentication was required and failed.
    Unauthorized,
    /// No resource is published under the URI.
    ResourceNotFound,
    /// No tool is registered under the name.
    ToolNotFound,
    /// The tool rejected its input.
    InvalidToolInput,
    /// The resource exists but may not be read.
    ResourceAccessDenied,
    /// Any other server-defined code.
    ServerError(i32),
}

impl ErrorCode {
    /// Returns the numeric code for this error.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::ParseError => -32700,
            Self::InvalidRequest => -32600,
            Self::MethodNotFound => -32601,
            Self::InvalidParams => -32602,
            Self::InternalError => -32603,
            Self::Unauthorized => -32000,
            Self::ResourceNotFound => -32001,
            Self::ToolNotFound => -32002,
            Self::InvalidToolInput => -32003,
            Self::ResourceAccessDenied => -32004,
            Self::ServerError(code) => code,
        }
    }

    /// Maps a numeric code back to its variant.
    #[must_use]
    pub const fn from_code(code: i32) -> Self {
        match code {
            -32700 => Self::ParseError,
            -32600 => Self::InvalidRequest,
            -32601 => Self::MethodNotFound,
            -32602 => Self::InvalidParams,
            -32603 => Self::InternalError,
            -32000 => Self::Unauthorized,
            -32001 => Self::ResourceNotFound,
            -32002 => Self::ToolNotFound,
            -32003 => Self::InvalidToolInput,
            -32004 => Self::ResourceAccessDenied,
            other => Self::ServerError(other),
        }
    }

    /// Returns the default message for this error code.
    #[must_use]
    pub const fn default_message(self) -> &'static str {
        match self {
            Self::ParseError => "Parse error",
            Self::InvalidRequest => "Invalid Request",
            Self::MethodNotFound => "Method not found",
            Self::InvalidParams => "Invalid params",
            Self::InternalError => "Internal error",
            Self::Unauthorized => "Unauthorized",
            Self::ResourceNotFound => "Resource not found",
            Self::ToolNotFound => "Tool not found",
            Self::InvalidToolInput => "Invalid tool input",
            Self::ResourceAccessDenied => "Resource access denied",
            Self::ServerError(_) => "Server error",
        }
    }
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    /// The error code.
    pub code: i32,

    /// A short description of the error.
    pub message: String,

    /// Additional information about the error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorObject {
    /// Creates a new error from an error code.
    #[must_use]
    pub fn from_code(code: ErrorCode) -> Self {
        Self {
            code: code.code(),
            message: code.default_message().to_string(),
            data: None,
        }
    }

    /// Creates a new error with a custom message.
    #[must_use]
    pub fn with_message(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.code(),
            message: message.into(),
            data: None,
        }
    }

    /// Adds additional data to the error.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Returns the typed error code.
    #[must_use]
    pub const fn kind(&self) -> ErrorCode {
        ErrorCode::from_code(self.code)
    }
}

/// A request expecting a reply.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// Unique request identifier.
    pub id: RequestId,
    /// The method to invoke.
    pub method: String,
    /// Optional parameters for the method.
    pub params: Option<Value>,
}

impl Request {
    /// Creates a request, normalising `params` for well-known methods.
    ///
    /// See [`normalize_params`].
    #[must_use]
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        let method = method.into();
        let params = normalize_params(&method, params);
        Self {
            id: id.into(),
            method,
            params,
        }
    }

    /// Returns a string parameter by name.
    #[must_use]
    pub fn param_str(&self, name: &str) -> Option<&str> {
        self.params.as_ref()?.get(name)?.as_str()
    }
}

/// A one-way message.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    /// The notification method.
    pub method: String,
    /// Optional parameters for the notification.
    pub params: Option<Value>,
}

impl Notification {
    /// Creates a new notification.
    #[must_use]
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            method: method.into(),
            params: params.filter(|p| !p.is_null()),
        }
    }
}

/// A successful reply.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// The request ID this response corresponds to.
    pub id: RequestId,
    /// The result of the method call.
    pub result: Value,
}

/// A failed reply.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorResponse {
    /// The request ID this error corresponds to (`None` when it could not be
    /// determined, e.g. for parse errors).
    pub id: Option<RequestId>,
    /// The error details.
    pub error: ErrorObject,
}

impl ErrorResponse {
    /// Creates a new error response.
    #[must_use]
    #[allow(clippy::missing_const_for_fn)] // ErrorObject contains String
    pub fn new(id: Option<RequestId>, error: ErrorObject) -> Self {
        Self { id, error }
    }

    /// Creates an error response for a known request.
    #[must_use]
    pub fn for_request(id: RequestId, code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(Some(id), ErrorObject::with_message(code, message))
    }

    /// Creates a parse error response (ID cannot be determined).
    #[must_use]
    pub fn parse_error() -> Self {
        Self::new(None, ErrorObject::from_code(ErrorCode::ParseError))
    }

    /// Creates an invalid request error response.
    #[must_use]
    pub fn invalid_request(id: Option<RequestId>, message: impl Into<String>) -> Self {
        Self::new(
            id,
            ErrorObject::with_message(ErrorCode::InvalidRequest, message),
        )
    }

    /// Creates a method not found error response.
    #[must_use]
    pub fn method_not_found(id: RequestId, method: &str) -> Self {
        Self::for_request(
            id,
            ErrorCode::MethodNotFound,
            format!("Method not found: {method}"),
        )
    }

    /// Creates an invalid params error response.
    #[must_use]
    pub fn invalid_params(id: RequestId, message: impl Into<String>) -> Self {
        Self::for_request(id, ErrorCode::InvalidParams, message)
    }

    /// Creates an internal error response.
    #[must_use]
    pub fn internal_error(id: RequestId, message: impl Into<String>) -> Self {
        Self::for_request(id, ErrorCode::InternalError, message)
    }
}

/// Any JSON-RPC 2.0 message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// A request expecting a reply.
    Request(Request),
    /// A one-way notification.
    Notification(Notification),
    /// A successful reply.
    Response(Response),
    /// A failed reply.
    Error(ErrorResponse),
}

impl Message {
    /// Creates a request message.
    #[must_use]
    pub fn request(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self::Request(Request::new(id, method, params))
    }

    /// Creates a notification message.
    #[must_use]
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self::Notification(Notification::new(method, params))
    }

    /// Creates a successful response message.
    #[must_use]
    pub fn response(id: RequestId, result: Value) -> Self {
        Self::Response(Response { id, result })
    }

    /// Creates an error response message.
    #[must_use]
    pub fn error(id: Option<RequestId>, error: ErrorObject) -> Self {
        Self::Error(ErrorResponse::new(id, error))
    }

    /// Returns the message id (requests and replies).
    #[must_use]
    pub const fn id(&self) -> Option<&RequestId> {
        match self {
            Self::Request(req) => Some(&req.id),
            Self::Response(resp) => Some(&resp.id),
            Self::Error(err) => err.id.as_ref(),
            Self::Notification(_) => None,
        }
    }

    /// Returns the method name (requests and notifications).
    #[must_use]
    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request(req) => Some(&req.method),
            Self::Notification(notif) => Some(&notif.method),
            Self::Response(_) | Self::Error(_) => None,
        }
    }

    /// Returns a short name for the message shape.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Request(_) => "request",
            Self::Notification(_) => "notification",
            Self::Response(_) => "response",
            Self::Error(_) => "error",
        }
    }

    /// Returns `true` for error responses.
    #[must_use]
    pub const fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    /// Returns `true` for replies (successful or not).
    #[must_use]
    pub const fn is_reply(&self) -> bool {
        matches!(self, Self::Response(_) | Self::Error(_))
    }

    /// Checks the runtime constraints the type system cannot express:
    /// method names must be non-empty, and string ids must not be empty.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        let id_ok = |id: &RequestId| !matches!(id, RequestId::String(s) if s.is_empty());
        match self {
            Self::Request(req) => !req.method.is_empty() && id_ok(&req.id),
            Self::Notification(notif) => !notif.method.is_empty(),
            Self::Response(resp) => id_ok(&resp.id),
            Self::Error(err) => err.id.as_ref().map_or(true, id_ok),
        }
    }

    /// Converts a reply into its result, mapping error responses to
    /// [`McpError::Rpc`].
    ///
    /// # Errors
    ///
    /// Returns the peer's error, or a protocol error if this is not a reply.
    pub fn into_result(self) -> Result<Value, McpError> {
        match self {
            Self::Response(resp) => Ok(resp.result),
            Self::Error(err) => Err(McpError::Rpc {
                code: err.error.code,
                message: err.error.message,
                data: err.error.data,
            }),
            other => Err(ProtocolError::UnexpectedMessage { kind: other.kind() }.into()),
        }
    }

    /// Serialises the message to a single-line JSON document.
    ///
    /// # Errors
    ///
    /// Returns an error if serialisation fails.
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses a message from a JSON document.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Json`] for invalid JSON and
    /// [`ProtocolError::MalformedMessage`] for JSON that is not a message.
    pub fn parse(json: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(json)?;
        Self::from_value(value)
    }

    /// Interprets an already-decoded JSON value as a message.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::MalformedMessage`] when the value has no
    /// recognised shape.
    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let Value::Object(mut obj) = value else {
            return Err(ProtocolError::malformed("top-level value is not an object"));
        };

        let id = match obj.remove("id") {
            None => None,
            Some(Value::Null) => Some(None),
            Some(raw) => Some(Some(parse_id(raw)?)),
        };
        let known_id = id.clone().flatten();
        let malformed = |reason: &str| ProtocolError::MalformedMessage {
            reason: reason.to_string(),
            id: known_id.clone(),
        };

        match obj.get("jsonrpc").and_then(Value::as_str) {
            Some(JSONRPC_VERSION) => {}
            Some(_) => return Err(malformed("jsonrpc field must be \"2.0\"")),
            None => return Err(malformed("missing jsonrpc field")),
        }

        if let Some(method) = obj.remove("method") {
            let Value::String(method) = method else {
                return Err(malformed("method must be a string"));
            };
            if method.is_empty() {
                return Err(malformed("method field cannot be empty"));
            }
            let params = obj.remove("params").filter(|p| !p.is_null());
            return match id {
                None => Ok(Self::Notification(Notification { method, params })),
                Some(None) => Err(malformed("request id must not be null")),
                Some(Some(id)) => Ok(Self::Request(Request { id, method, params })),
            };
        }

        match (obj.remove("result"), obj.remove("error")) {
            (Some(_), Some(_)) => Err(malformed("reply carries both result and error")),
            (Some(result), None) => match id {
                Some(Some(id)) => Ok(Self::Response(Response { id, result })),
                _ => Err(malformed("response is missing its id")),
            },
            (None, Some(error)) => {
                let error: ErrorObject = serde_json::from_value(error)
                    .map_err(|e| malformed(&format!("invalid error object: {e}")))?;
                Ok(Self::Error(ErrorResponse {
                    id: id.flatten(),
                    error,
                }))
            }
            (None, None) => Err(malformed("message has neither method nor result/error")),
        }
    }
}

fn parse_id(raw: Value) -> Result<RequestId, ProtocolError> {
    match raw {
        Value::String(s) => Ok(RequestId::String(s)),
        Value::Number(n) => n
            .as_i64()
            .map(RequestId::Number)
            .ok_or_else(|| ProtocolError::malformed("request id must be an integer or string")),
        _ => Err(ProtocolError::malformed(
            "request id must be an integer or string",
        )),
    }
}

impl From<ErrorResponse> for Message {
    fn from(err: ErrorResponse) -> Self {
        Self::Error(err)
    }
}

impl From<Response> for Message {
    fn from(resp: Response) -> Self {
        Self::Response(resp)
    }
}

/// Wire layout shared by all four shapes.
#[derive(Serialize)]
struct Envelope<'a> {
    jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    method: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a ErrorObject>,
    // Outer `None` omits the key, `Some(None)` writes `null`.
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<Option<&'a RequestId>>,
}

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut envelope = Envelope {
            jsonrpc: JSONRPC_VERSION,
            method: None,
            params: None,
            result: None,
            error: None,
            id: None,
        };
        match self {
            Self::Request(req) => {
                envelope.method = Some(req.method.as_str());
                envelope.params = req.params.as_ref();
                envelope.id = Some(Some(&req.id));
            }
            Self::Notification(notif) => {
                envelope.method = Some(notif.method.as_str());
                envelope.params = notif.params.as_ref();
            }
            Self::Response(resp) => {
                envelope.result = Some(&resp.result);
                envelope.id = Some(Some(&resp.id));
            }
            Self::Error(err) => {
                envelope.error = Some(&err.error);
                envelope.id = Some(err.id.as_ref());
            }
        }
        envelope.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Message {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_value(value).map_err(D::Error::custom)
    }
}

/// Parses a JSON string into a message.
///
/// # Errors
///
/// See [`Message::parse`].
pub fn parse_message(json: &str) -> Result<Message, ProtocolError> {
    Message::parse(json)
}

/// Normalises host-native parameter shapes into the object shape peers expect.
///
/// - `initialize`: fills `protocolVersion`, `capabilities` and `clientInfo`
///   when absent.
/// - `resources/read`: a bare string becomes `{"uri": ...}`.
/// - `tools/call`: a `[name, arguments]` pair becomes an object, missing
///   `arguments` become `{}`, and arguments given as JSON text are decoded.
///
/// All other methods pass through untouched (apart from `null` → absent).
#[must_use]
pub fn normalize_params(method: &str, params: Option<Value>) -> Option<Value> {
    let params = params.filter(|p| !p.is_null());
    match method {
        methods::INITIALIZE => Some(normalize_initialize(params)),
        methods::RESOURCES_READ => params.map(|p| match p {
            Value::String(uri) => json!({ "uri": uri }),
            other => other,
        }),
        methods::TOOLS_CALL => params.map(normalize_tool_call),
        _ => params,
    }
}

fn normalize_initialize(params: Option<Value>) -> Value {
    let mut obj = match params {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    };
    obj.entry("protocolVersion")
        .or_insert_with(|| json!(MCP_PROTOCOL_VERSION));
    obj.entry("capabilities").or_insert_with(|| json!({}));
    obj.entry("clientInfo").or_insert_with(|| {
        json!({
            "name": IMPLEMENTATION_NAME,
            "version": env!("CARGO_PKG_VERSION"),
        })
    });
    Value::Object(obj)
}

fn normalize_tool_call(params: Value) -> Value {
    let mut obj = match params {
        Value::Array(mut items) if matches!(items.first(), Some(Value::String(_))) => {
            let arguments = if items.len() > 1 {
                items.swap_remove(1)
            } else {
                Value::Null
            };
            let mut map = Map::new();
            map.insert("name".to_string(), items.swap_remove(0));
            map.insert("arguments".to_string(), arguments);
            map
        }
        Value::Object(map) => map,
        other => return other,
    };

    let arguments = match obj.remove("arguments") {
        None | Some(Value::Null) => json!({}),
        Some(Value::String(text)) => match serde_json::from_str::<Value>(&text) {
            Ok(parsed @ Value::Object(_)) => parsed,
            _ => Value::String(text),
        },
        Some(other) => other,
    };
    obj.insert("arguments".to_string(), arguments);
    Value::Object(obj)
}
