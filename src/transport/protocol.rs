//! Bridge protocol message types.
//!
//! Newline-delimited JSON protocol for host ↔ worker communication.
//! Each frame is a single JSON object followed by `\n`.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

/// Id of the unsolicited readiness response a worker sends after connecting.
pub const INITIALIZED_ID: &str = "INITIALIZED";

/// Id of the response reporting a frame that could not be parsed as a request.
pub const INVALID_MESSAGE_ID: &str = "INVALID_MESSAGE";

/// Content of the readiness response.
pub const READY_CONTENT: &str = "Initialized runtime-bridge worker";

/// Liveness token returned for `ping`.
pub const PONG: &str = "pong";

/// Content of the error response for an unrecognized request `type`.
pub const INVALID_TYPE_CONTENT: &str = "Invalid message type";

const RESERVED_IDS: [&str; 2] = [INITIALIZED_ID, INVALID_MESSAGE_ID];

/// Returned when a caller tries to use one of the sentinel ids for a request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("request id '{0}' is reserved")]
pub struct ReservedId(pub String);

/// Correlation id linking a request to its response.
///
/// Opaque on the wire. Ids produced by [`RequestId::generate`] are UUID v4
/// strings and can never collide with the sentinel ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Build a caller-chosen id, rejecting the reserved sentinels.
    pub fn new(id: impl Into<String>) -> Result<Self, ReservedId> {
        let id = id.into();
        if RESERVED_IDS.contains(&id.as_str()) {
            return Err(ReservedId(id));
        }
        Ok(Self(id))
    }

    fn sentinel(id: &str) -> Self {
        Self(id.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_reserved(&self) -> bool {
        RESERVED_IDS.contains(&self.0.as_str())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What the worker is asked to do.
///
/// Closed set; any other `type` on the wire decodes to `Unknown` so the worker
/// can answer it with an error against the original id.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    /// Health check.
    Ping,
    /// Load and run the code unit named by `content`.
    #[serde(alias = "import")]
    Execute,
    #[serde(other)]
    #[default]
    Unknown,
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ping => "ping",
            Self::Execute => "execute",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Request sent from host to worker.
///
/// Only `id` is required. A missing or non-string `type` decodes to
/// `Unknown` so the reply still reaches the caller under its own id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    /// Port the worker is connected to. Diagnostic only.
    #[serde(default, deserialize_with = "lenient_port")]
    pub port: u16,
    #[serde(rename = "type", default, deserialize_with = "lenient_kind")]
    pub kind: RequestKind,
    #[serde(default, deserialize_with = "content_as_string")]
    pub content: String,
}

impl Request {
    pub fn new(id: RequestId, port: u16, kind: RequestKind, content: impl Into<String>) -> Self {
        Self {
            id,
            port,
            kind,
            content: content.into(),
        }
    }

    pub fn ping(id: RequestId, port: u16) -> Self {
        Self::new(id, port, RequestKind::Ping, String::new())
    }

    pub fn execute(id: RequestId, port: u16, specifier: impl Into<String>) -> Self {
        Self::new(id, port, RequestKind::Execute, specifier)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Success,
    Error,
}

/// Response sent from worker to host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub id: RequestId,
    pub status: Status,
    /// Success payload or error description. Non-string JSON from other
    /// worker implementations is kept in its serialized form.
    #[serde(deserialize_with = "content_as_string")]
    pub content: String,
}

impl Response {
    pub fn success(id: RequestId, content: impl Into<String>) -> Self {
        Self {
            id,
            status: Status::Success,
            content: content.into(),
        }
    }

    pub fn error(id: RequestId, content: impl Into<String>) -> Self {
        Self {
            id,
            status: Status::Error,
            content: content.into(),
        }
    }

    /// The unsolicited first message of every worker connection.
    pub fn ready() -> Self {
        Self::success(RequestId::sentinel(INITIALIZED_ID), READY_CONTENT)
    }

    /// Report for a frame that is not a valid request. Carries the raw input.
    pub fn malformed(raw: impl Into<String>) -> Self {
        Self::error(RequestId::sentinel(INVALID_MESSAGE_ID), raw)
    }

    pub fn pong(id: RequestId) -> Self {
        Self::success(id, PONG)
    }

    pub fn invalid_type(id: RequestId) -> Self {
        Self::error(id, INVALID_TYPE_CONTENT)
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }

    pub fn is_ready(&self) -> bool {
        self.id.as_str() == INITIALIZED_ID
    }

    pub fn is_malformed_report(&self) -> bool {
        self.id.as_str() == INVALID_MESSAGE_ID
    }
}

fn content_as_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Null => Ok(String::new()),
        other => Ok(other.to_string()),
    }
}

fn lenient_kind<'de, D>(deserializer: D) -> Result<RequestKind, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        value @ serde_json::Value::String(_) => {
            Ok(serde_json::from_value(value).unwrap_or_default())
        }
        _ => Ok(RequestKind::Unknown),
    }
}

fn lenient_port<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(value
        .as_u64()
        .and_then(|n| u16::try_from(n).ok())
        .unwrap_or_default())
}
