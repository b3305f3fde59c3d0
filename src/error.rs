//! Host-side error type.
//!
//! Worker-side failures never surface as errors: they become `error`
//! responses on the wire (see `loader::ExecError`).

use std::time::Duration;

use crate::transport::protocol::{RequestId, ReservedId};

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// No response arrived before the caller's deadline. A late response for
    /// this id is dropped.
    #[error("request {id} timed out after {after:?}")]
    Timeout { id: RequestId, after: Duration },

    /// The worker disconnected while the request was outstanding.
    #[error("connection to worker lost")]
    ConnectionLost,

    /// The worker answered with `status = error`.
    #[error("execution failed: {0}")]
    Execution(String),

    #[error("no worker connection became ready within {0:?}")]
    NoWorkerAvailable(Duration),

    /// The worker answered with something the caller did not ask for.
    #[error("unexpected response: {0}")]
    Protocol(String),

    #[error("request id {0} is already outstanding")]
    DuplicateId(RequestId),

    #[error(transparent)]
    ReservedId(#[from] ReservedId),

    #[error("failed to spawn worker: {0}")]
    Spawn(String),

    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),

    #[error("session manager is shut down")]
    Closed,
}

impl BridgeError {
    /// Whether the failure ended the connection rather than just this request.
    pub const fn is_connection_fatal(&self) -> bool {
        matches!(self, Self::ConnectionLost | Self::Io(_) | Self::Closed)
    }
}
