//! runtime-bridge library
//!
//! A host process hands code units to pooled worker processes over TCP,
//! using newline-delimited JSON with id correlation:
//! - Line codec and message types (`transport`)
//! - Worker endpoint that loads and runs units concurrently (`worker`, `loader`)
//! - Host session manager with timeouts and connection-loss handling (`session`, `process`)

pub mod config;
pub mod error;
pub mod loader;
pub mod process;
pub mod session;
pub mod transport;
pub mod worker;

pub use error::BridgeError;
pub use session::{SessionManager, WorkerConnection};
pub use worker::WorkerSession;
