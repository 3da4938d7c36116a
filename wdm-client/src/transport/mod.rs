//! Transport abstraction for WDM.
//!
//! This module provides a pluggable transport layer that abstracts the
//! underlying message layer (a real network stack, or a mock for testing).
//!
//! # Design
//!
//! The transport trait is async and connection-oriented:
//! - `connect()` opens a connection to a peer node
//! - `send()` transmits encoded [`Envelope`](wdm_types::Envelope) bytes
//! - `recv()` receives envelope bytes
//! - `close()` gracefully terminates
//!
//! Exchange ids, retransmission and acknowledgements of the message layer
//! are the transport's business; the engines above only see whole envelopes.

mod mock;

pub use mock::MockTransport;

use async_trait::async_trait;
use thiserror::Error;
use wdm_types::NodeId;

/// Largest envelope a transport must carry.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Not connected.
    #[error("not connected")]
    NotConnected,

    /// Connection closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Send failed.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Receive failed.
    #[error("receive failed: {0}")]
    ReceiveFailed(String),
}

/// Transport trait for sending and receiving WDM envelopes.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect to the node `peer`.
    async fn connect(&self, peer: NodeId) -> Result<(), TransportError>;

    /// Send one encoded envelope.
    async fn send(&self, data: &[u8]) -> Result<(), TransportError>;

    /// Receive one encoded envelope.
    ///
    /// Blocks until data is available or connection closes.
    async fn recv(&self) -> Result<Vec<u8>, TransportError>;

    /// Check if currently connected.
    fn is_connected(&self) -> bool;

    /// Close the connection gracefully.
    async fn close(&self) -> Result<(), TransportError>;
}
