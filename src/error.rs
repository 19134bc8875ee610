//! Error taxonomy for the transport/engine/profile stack.
//!
//! No `anyhow`/`thiserror` — hand-rolled enums with manual `Display`, matching
//! the rest of this codebase's error style.

use std::fmt;

/// Errors surfaced by the line transport and protocol engine (C1/C2).
#[derive(Debug, Clone)]
pub enum EngineError {
    /// The serial device is not open (never connected, or already disconnected).
    TransportClosed,
    /// A read or write to the serial device failed.
    TransportIO(String),
    /// No complete reply/URC arrived before the deadline.
    Timeout,
    /// A command transaction was already in flight and the caller's deadline
    /// elapsed before the send lock became available.
    Busy,
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::TransportClosed => write!(f, "transport closed"),
            EngineError::TransportIO(e) => write!(f, "transport I/O error: {e}"),
            EngineError::Timeout => write!(f, "timed out waiting for reply"),
            EngineError::Busy => write!(f, "another command is already in flight"),
        }
    }
}

impl std::error::Error for EngineError {}

/// Errors surfaced by device-profile bring-up and operations (C5/C6/C7).
#[derive(Debug, Clone)]
pub enum ProfileError {
    /// Propagated from the engine/transport.
    Engine(EngineError),
    /// A named bring-up stage failed. `cause` is a human-readable reason —
    /// a timeout and an `ERROR` reply are both reported this way at this
    /// layer.
    Stage { stage: &'static str, cause: String },
    /// An operation was attempted while the session was not in a state that
    /// supports it (e.g. `send` before `connect` completed).
    ProtocolState(String),
}

impl fmt::Display for ProfileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProfileError::Engine(e) => write!(f, "{e}"),
            ProfileError::Stage { stage, cause } => write!(f, "stage '{stage}' failed: {cause}"),
            ProfileError::ProtocolState(msg) => write!(f, "protocol state error: {msg}"),
        }
    }
}

impl std::error::Error for ProfileError {}

impl From<EngineError> for ProfileError {
    fn from(e: EngineError) -> Self {
        ProfileError::Engine(e)
    }
}

impl ProfileError {
    /// Wrap an engine error (timeout or `ERROR` reply) as a stage failure.
    pub fn stage(stage: &'static str, cause: impl Into<String>) -> Self {
        ProfileError::Stage {
            stage,
            cause: cause.into(),
        }
    }
}
