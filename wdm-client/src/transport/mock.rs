//! Mock transport for testing.
//!
//! Captures sent envelopes and plays back queued ones. A responder closure
//! can stand in for the peer: every envelope sent is handed to it and the
//! envelopes it returns are queued for `recv()`.

use super::{Transport, TransportError, MAX_MESSAGE_SIZE};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use wdm_types::{Envelope, NodeId, WdmError};

type Responder = Box<dyn FnMut(&Envelope) -> Vec<Envelope> + Send>;

/// Mock transport for testing.
///
/// Clones share the same state.
#[derive(Default, Clone)]
pub struct MockTransport {
    inner: Arc<Mutex<MockTransportInner>>,
}

#[derive(Default)]
struct MockTransportInner {
    connected: bool,
    peer: Option<NodeId>,
    sent_messages: Vec<Vec<u8>>,
    receive_queue: VecDeque<Vec<u8>>,
    responder: Option<Responder>,
    fail_next_connect: Option<String>,
    fail_next_send: Option<String>,
    fail_next_recv: Option<String>,
}

impl MockTransport {
    /// Create a new mock transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every sent envelope with whatever `responder` returns.
    pub fn with_responder<F>(self, responder: F) -> Self
    where
        F: FnMut(&Envelope) -> Vec<Envelope> + Send + 'static,
    {
        self.lock().responder = Some(Box::new(responder));
        self
    }

    /// Queue raw bytes to be returned by the next `recv()` call.
    pub fn queue_response(&self, data: Vec<u8>) {
        self.lock().receive_queue.push_back(data);
    }

    /// Queue an envelope to be returned by the next `recv()` call.
    pub fn queue_envelope(&self, envelope: &Envelope) -> Result<(), WdmError> {
        let bytes = envelope.to_bytes()?;
        self.queue_response(bytes);
        Ok(())
    }

    /// Get all messages that were sent.
    pub fn sent_messages(&self) -> Vec<Vec<u8>> {
        self.lock().sent_messages.clone()
    }

    /// Get all sent messages that decode as envelopes.
    pub fn sent_envelopes(&self) -> Vec<Envelope> {
        self.lock()
            .sent_messages
            .iter()
            .filter_map(|bytes| Envelope::from_bytes(bytes).ok())
            .collect()
    }

    /// Get the last message that was sent.
    pub fn last_sent(&self) -> Option<Vec<u8>> {
        self.lock().sent_messages.last().cloned()
    }

    /// Get the peer that was connected to.
    pub fn connected_peer(&self) -> Option<NodeId> {
        self.lock().peer
    }

    /// Cause the next connect() to fail with the given error.
    pub fn fail_next_connect(&self, error: &str) {
        self.lock().fail_next_connect = Some(error.to_string());
    }

    /// Cause the next send() to fail with the given error.
    pub fn fail_next_send(&self, error: &str) {
        self.lock().fail_next_send = Some(error.to_string());
    }

    /// Cause the next recv() to fail with the given error.
    pub fn fail_next_recv(&self, error: &str) {
        self.lock().fail_next_recv = Some(error.to_string());
    }

    /// Clear all state (messages, queue, connection, responder).
    pub fn reset(&self) {
        *self.lock() = MockTransportInner::default();
    }

    fn lock(&self) -> MutexGuard<'_, MockTransportInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("MockTransport")
            .field("connected", &inner.connected)
            .field("peer", &inner.peer)
            .field("sent", &inner.sent_messages.len())
            .field("queued", &inner.receive_queue.len())
            .field("responder", &inner.responder.is_some())
            .finish()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, peer: NodeId) -> Result<(), TransportError> {
        let mut inner = self.lock();

        // Check for forced failure
        if let Some(error) = inner.fail_next_connect.take() {
            return Err(TransportError::ConnectionFailed(error));
        }

        inner.connected = true;
        inner.peer = Some(peer);
        Ok(())
    }

    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        let mut inner = self.lock();

        if !inner.connected {
            return Err(TransportError::NotConnected);
        }
        if data.len() > MAX_MESSAGE_SIZE {
            return Err(TransportError::SendFailed(format!(
                "message of {} bytes exceeds {}",
                data.len(),
                MAX_MESSAGE_SIZE
            )));
        }

        // Check for forced failure
        if let Some(error) = inner.fail_next_send.take() {
            return Err(TransportError::SendFailed(error));
        }

        inner.sent_messages.push(data.to_vec());

        let MockTransportInner {
            responder,
            receive_queue,
            ..
        } = &mut *inner;
        if let (Some(responder), Ok(envelope)) = (responder.as_mut(), Envelope::from_bytes(data)) {
            for reply in responder(&envelope) {
                if let Ok(bytes) = reply.to_bytes() {
                    receive_queue.push_back(bytes);
                }
            }
        }
        Ok(())
    }

    async fn recv(&self) -> Result<Vec<u8>, TransportError> {
        let mut inner = self.lock();

        if !inner.connected {
            return Err(TransportError::NotConnected);
        }

        // Check for forced failure
        if let Some(error) = inner.fail_next_recv.take() {
            return Err(TransportError::ReceiveFailed(error));
        }

        inner
            .receive_queue
            .pop_front()
            .ok_or(TransportError::ConnectionClosed)
    }

    fn is_connected(&self) -> bool {
        self.lock().connected
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.lock().connected = false;
        Ok(())
    }
}
