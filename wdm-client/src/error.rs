//! Client errors.

use thiserror::Error;
use wdm_core::{CounterError, HandlerError, LogError, OffloadError};
use wdm_types::WdmError;

use crate::config::ConfigError;
use crate::transport::TransportError;

/// Errors surfaced by the engines and the node.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Transport error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Encoding or decoding failed.
    #[error("wire error: {0}")]
    Wire(#[from] WdmError),

    /// Event log error.
    #[error("event log error: {0}")]
    Log(#[from] LogError),

    /// Subscription handler error.
    #[error("subscription error: {0}")]
    Handler(#[from] HandlerError),

    /// Offload session error.
    #[error("offload error: {0}")]
    Offload(#[from] OffloadError),

    /// Counter storage error.
    #[error("counter error: {0}")]
    Counter(#[from] CounterError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A fixed-size pool is exhausted.
    #[error("no memory: {0}")]
    NoMemory(&'static str),

    /// Operation not allowed in the current state.
    #[error("incorrect state: {0}")]
    IncorrectState(String),

    /// Caller passed an unknown or stale handle.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}
