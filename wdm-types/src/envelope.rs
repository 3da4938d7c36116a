//! Envelope - the wire format wrapper for all WDM messages.

use serde::{Deserialize, Serialize};

use crate::{ExchangeId, Message, NodeId, WdmError};

/// Current envelope protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// The envelope wraps every protocol message with routing metadata.
///
/// The exchange id ties a response to the request that opened the exchange;
/// the transport only ever looks at `destination`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Protocol version (currently 1)
    pub version: u8,
    /// Exchange this message belongs to
    pub exchange_id: ExchangeId,
    /// Sending node
    pub source: NodeId,
    /// Receiving node
    pub destination: NodeId,
    /// The message itself
    pub message: Message,
}

impl Envelope {
    /// Create a new envelope for sending.
    pub fn new(
        exchange_id: ExchangeId,
        source: NodeId,
        destination: NodeId,
        message: Message,
    ) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            exchange_id,
            source,
            destination,
            message,
        }
    }

    /// Build the reply to this envelope on the same exchange.
    pub fn reply(&self, message: Message) -> Self {
        Self::new(self.exchange_id, self.destination, self.source, message)
    }

    /// Serialize to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, WdmError> {
        rmp_serde::to_vec(self).map_err(WdmError::Serialization)
    }

    /// Deserialize from MessagePack bytes, rejecting unknown versions.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WdmError> {
        let envelope: Envelope =
            rmp_serde::from_slice(bytes).map_err(WdmError::Deserialization)?;
        if envelope.version != PROTOCOL_VERSION {
            return Err(WdmError::UnsupportedVersion(envelope.version));
        }
        Ok(envelope)
    }
}
