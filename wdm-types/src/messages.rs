//! Protocol messages for WDM subscriptions and BDX event offload.
//!
//! These are the payloads that get wrapped in an [`Envelope`](crate::Envelope).

use serde::{Deserialize, Serialize};

use crate::{EventId, EventRecord, Importance, StatusReport, SubscriptionId, WdmError};

/// All possible protocol messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Subscriber asks for trait data and events
    SubscribeRequest(SubscribeRequest),
    /// Publisher confirms an established subscription
    SubscribeResponse(SubscribeResponse),
    /// Publisher delivers trait data and/or events
    Notify(Notify),
    /// Either side ends a subscription
    CancelRequest(CancelRequest),
    /// Generic response carrying a profile/status pair
    StatusReport(StatusReport),
    /// Sender proposes an upload
    SendInit(SendInit),
    /// Receiver accepts an upload
    SendAccept(SendAccept),
    /// Receiver rejects an upload
    SendReject(SendReject),
    /// Receiver asks for the next block
    BlockQuery(BlockQuery),
    /// One block of upload data
    Block(Block),
    /// Final block of upload data
    BlockEof(BlockEof),
    /// Receiver confirms the final block
    BlockEofAck(BlockEofAck),
    /// Either side aborts the transfer
    TransferError(TransferError),
}

impl Message {
    /// Serialize to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, WdmError> {
        rmp_serde::to_vec(self).map_err(WdmError::Serialization)
    }

    /// Deserialize from MessagePack bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WdmError> {
        rmp_serde::from_slice(bytes).map_err(WdmError::Deserialization)
    }

    /// Short name of the message type, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::SubscribeRequest(_) => "SubscribeRequest",
            Message::SubscribeResponse(_) => "SubscribeResponse",
            Message::Notify(_) => "Notify",
            Message::CancelRequest(_) => "CancelRequest",
            Message::StatusReport(_) => "StatusReport",
            Message::SendInit(_) => "SendInit",
            Message::SendAccept(_) => "SendAccept",
            Message::SendReject(_) => "SendReject",
            Message::BlockQuery(_) => "BlockQuery",
            Message::Block(_) => "Block",
            Message::BlockEof(_) => "BlockEof",
            Message::BlockEofAck(_) => "BlockEofAck",
            Message::TransferError(_) => "TransferError",
        }
    }

    /// Check if this message belongs to the bulk transfer protocol.
    pub fn is_bdx(&self) -> bool {
        matches!(
            self,
            Message::SendInit(_)
                | Message::SendAccept(_)
                | Message::SendReject(_)
                | Message::BlockQuery(_)
                | Message::Block(_)
                | Message::BlockEof(_)
                | Message::BlockEofAck(_)
                | Message::TransferError(_)
        )
    }
}

/// One trait instance on the publisher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TraitInstance {
    /// Trait profile id
    pub profile_id: u32,
    /// Resource that hosts the instance
    pub resource_id: u64,
    /// Instance number within the resource
    pub instance_id: u64,
}

impl TraitInstance {
    /// Create a trait instance reference.
    pub fn new(profile_id: u32, resource_id: u64, instance_id: u64) -> Self {
        Self {
            profile_id,
            resource_id,
            instance_id,
        }
    }
}

/// Inclusive range of schema versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SchemaVersionRange {
    /// Lowest acceptable version
    pub min: u16,
    /// Highest acceptable version
    pub max: u16,
}

impl SchemaVersionRange {
    /// Create a range; `min` and `max` are swapped if given out of order.
    pub fn new(min: u16, max: u16) -> Self {
        if min <= max {
            Self { min, max }
        } else {
            Self { min: max, max: min }
        }
    }

    /// A range holding a single version.
    pub fn exactly(version: u16) -> Self {
        Self::new(version, version)
    }

    /// Check whether `version` is in range.
    pub fn contains(&self, version: u16) -> bool {
        self.min <= version && version <= self.max
    }

    /// Overlap of two ranges, if any.
    pub fn intersect(&self, other: &SchemaVersionRange) -> Option<SchemaVersionRange> {
        let min = self.min.max(other.min);
        let max = self.max.min(other.max);
        (min <= max).then_some(SchemaVersionRange { min, max })
    }
}

/// One requested trait path with the versions the subscriber understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraitPathRequest {
    /// Trait instance of interest
    pub instance: TraitInstance,
    /// Schema versions the subscriber can decode
    pub versions: SchemaVersionRange,
}

/// Subscribe to trait data and events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeRequest {
    /// Trait paths of interest
    pub paths: Vec<TraitPathRequest>,
    /// Last event the subscriber already holds, per importance
    pub last_observed: Vec<(Importance, EventId)>,
    /// Requested liveness timeout in seconds
    pub liveness_timeout_secs: Option<u32>,
}

/// Publisher's answer to an accepted subscribe request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeResponse {
    /// Publisher-assigned id
    pub subscription_id: SubscriptionId,
    /// Liveness timeout the publisher will enforce, in seconds
    pub liveness_timeout_secs: Option<u32>,
}

/// Current value of one trait instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataElement {
    /// Trait instance the data belongs to
    pub instance: TraitInstance,
    /// Data version of the instance
    pub version: u64,
    /// Schema version the payload is encoded with
    pub schema_version: u16,
    /// Schema-encoded trait data
    pub payload: Vec<u8>,
}

/// Trait data and events delivered to a subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notify {
    /// Subscription this notify belongs to
    pub subscription_id: SubscriptionId,
    /// Changed trait instances
    pub data: Vec<DataElement>,
    /// New events, oldest first within each importance
    pub events: Vec<EventRecord>,
}

/// End a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelRequest {
    /// Subscription to end
    pub subscription_id: SubscriptionId,
    /// Why the sender ends it
    pub reason: StatusReport,
}

/// Propose an upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendInit {
    /// Name the collector files the upload under
    pub file_designator: String,
    /// Largest block the sender will produce
    pub max_block_size: u32,
}

/// Accept an upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendAccept {
    /// Largest block the receiver will take
    pub max_block_size: u32,
}

/// Reject an upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendReject {
    /// Why the receiver refuses
    pub status: StatusReport,
}

/// Ask for the block with the given counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockQuery {
    /// Counter of the requested block
    pub block_counter: u32,
}

/// One block of upload data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Counter from the matching query
    pub block_counter: u32,
    /// Block bytes
    pub data: Vec<u8>,
}

/// The last block of upload data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockEof {
    /// Counter from the matching query
    pub block_counter: u32,
    /// Block bytes
    pub data: Vec<u8>,
}

/// Receiver confirms the last block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockEofAck {
    /// Counter of the final block
    pub block_counter: u32,
}

/// Abort the transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferError {
    /// Why the transfer ends
    pub status: StatusReport,
}
