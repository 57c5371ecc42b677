// JSON wire protocol: request envelope, broker replies, and push frames.
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Protocol revision reported by `version` and in the greeting frame.
pub const PROTO_VERSION: &str = "v9";

// Command names as they appear on the wire.
pub const CMD_VERSION: &str = "version";
pub const CMD_CLIENT_ID: &str = "_uid";
pub const CMD_READ_KEY: &str = "kget";
pub const CMD_READ_BULK: &str = "kget-bulk";
pub const CMD_READ_PREFIX: &str = "kget-all";
pub const CMD_WRITE_KEY: &str = "kset";
pub const CMD_WRITE_BULK: &str = "kset-bulk";
pub const CMD_REMOVE_KEY: &str = "kdel";
pub const CMD_LIST_KEYS: &str = "klist";
pub const CMD_SUBSCRIBE_KEY: &str = "ksub";
pub const CMD_UNSUBSCRIBE_KEY: &str = "kunsub";
pub const CMD_SUBSCRIBE_PREFIX: &str = "ksub-prefix";
pub const CMD_UNSUBSCRIBE_PREFIX: &str = "kunsub-prefix";
pub const CMD_AUTH_REQUEST: &str = "klogin";
pub const CMD_AUTH_CHALLENGE: &str = "kauth";

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Error codes carried in the `error` field of failure replies.
///
/// The string forms are part of the protocol; clients match on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrCode {
    #[serde(rename = "server error")]
    ServerError,
    #[serde(rename = "invalid message format")]
    InvalidFmt,
    #[serde(rename = "required parameter missing")]
    MissingParam,
    #[serde(rename = "unknown command")]
    UnknownCmd,
    #[serde(rename = "authentication not initialized")]
    AuthNotInit,
    #[serde(rename = "authentication failed")]
    AuthFailed,
    #[serde(rename = "authentication required")]
    AuthRequired,
}

impl std::fmt::Display for ErrCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            ErrCode::ServerError => "server error",
            ErrCode::InvalidFmt => "invalid message format",
            ErrCode::MissingParam => "required parameter missing",
            ErrCode::UnknownCmd => "unknown command",
            ErrCode::AuthNotInit => "authentication not initialized",
            ErrCode::AuthFailed => "authentication failed",
            ErrCode::AuthRequired => "authentication required",
        };
        f.write_str(text)
    }
}

/// Client-to-broker command envelope.
///
/// ```
/// use keybus_wire::{Request, CMD_READ_KEY};
///
/// let req: Request = serde_json::from_str(
///     r#"{"command":"kget","request_id":"r1","data":{"key":"k"}}"#,
/// ).expect("decode");
/// assert_eq!(req.command, CMD_READ_KEY);
/// assert_eq!(req.request_id, "r1");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub command: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub request_id: String,
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl Request {
    pub fn new(command: impl Into<String>, data: Map<String, Value>) -> Self {
        Self {
            command: command.into(),
            request_id: String::new(),
            data,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }
}

/// Successful terminal reply to a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    #[serde(rename = "type")]
    pub msg_type: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Response {
    pub fn ok(request_id: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            msg_type: "response".to_string(),
            ok: true,
            request_id: request_id.into(),
            data,
        }
    }
}

/// Failure terminal reply. Carries no `type` tag, only `ok: false`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReply {
    pub ok: bool,
    pub error: ErrCode,
    pub details: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub request_id: String,
}

impl ErrorReply {
    pub fn new(error: ErrCode, details: impl Into<String>, request_id: impl Into<String>) -> Self {
        Self {
            ok: false,
            error,
            details: details.into(),
            request_id: request_id.into(),
        }
    }
}

/// Unsolicited change notification. Never carries a request id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Push {
    #[serde(rename = "type")]
    pub msg_type: String,
    pub key: String,
    pub new_value: String,
}

impl Push {
    pub fn new(key: impl Into<String>, new_value: impl Into<String>) -> Self {
        Self {
            msg_type: "push".to_string(),
            key: key.into(),
            new_value: new_value.into(),
        }
    }
}

/// One-shot greeting sent right after registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hello {
    #[serde(rename = "type")]
    pub msg_type: String,
    pub version: String,
}

impl Hello {
    pub fn current() -> Self {
        Self {
            msg_type: "hello".to_string(),
            version: PROTO_VERSION.to_string(),
        }
    }
}

/// Any frame a broker can send, discriminated for client-side routing.
#[derive(Debug, Clone)]
pub enum ServerFrame {
    Hello(Hello),
    Response(Response),
    Error(ErrorReply),
    Push(Push),
}

/// Serialize a message into a single text frame payload.
pub fn encode<T: Serialize>(msg: &T) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(msg)?))
}

/// Classify and decode one broker-to-client frame.
///
/// Pushes and greetings are tagged by `type`; terminal replies are told
/// apart by the `ok` flag since error frames carry no tag.
pub fn decode_server_frame(input: &[u8]) -> Result<ServerFrame> {
    let value: Value = serde_json::from_slice(input)?;
    match value.get("type").and_then(Value::as_str) {
        Some("push") => Ok(ServerFrame::Push(serde_json::from_value(value)?)),
        Some("hello") => Ok(ServerFrame::Hello(serde_json::from_value(value)?)),
        _ => {
            if value.get("ok").and_then(Value::as_bool) == Some(false) {
                Ok(ServerFrame::Error(serde_json::from_value(value)?))
            } else {
                Ok(ServerFrame::Response(serde_json::from_value(value)?))
            }
        }
    }
}
