//! Event records as delivered to subscribers and collectors.

use serde::{Deserialize, Serialize};

use crate::{EventId, Importance, WdmError};

/// Schema of an event: which trait profile and structure it encodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventSchema {
    /// Profile (trait) that defines the event.
    pub profile_id: u32,
    /// Structure type within the profile.
    pub structure_type: u32,
    /// Importance the event is logged at.
    pub importance: Importance,
    /// Version of the data schema the payload was encoded with.
    pub data_schema_version: u16,
}

impl EventSchema {
    /// Create a schema at data schema version 1.
    pub fn new(profile_id: u32, structure_type: u32, importance: Importance) -> Self {
        Self {
            profile_id,
            structure_type,
            importance,
            data_schema_version: 1,
        }
    }

    /// Set the data schema version.
    pub fn with_version(mut self, version: u16) -> Self {
        self.data_schema_version = version;
        self
    }
}

/// Reference from one event to an earlier, related event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelatedEvent {
    /// Importance of the related event.
    pub importance: Importance,
    /// Id of the related event.
    pub event_id: EventId,
}

/// A fully decoded event.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Importance the event was logged at.
    pub importance: Importance,
    /// Id vended by the tier of `importance`.
    pub event_id: EventId,
    /// Monotonic device time in milliseconds.
    pub system_time_ms: u64,
    /// Wall-clock time in milliseconds since the Unix epoch, once synchronized.
    pub utc_time_ms: Option<u64>,
    /// Node that produced the event.
    pub source_id: u64,
    /// Resource (trait instance owner) the event is about.
    pub resource_id: u64,
    /// Earlier event this one belongs with.
    pub related: Option<RelatedEvent>,
    /// Whether the event asked for immediate delivery.
    pub urgent: bool,
    /// Profile that defines the event.
    pub profile_id: u32,
    /// Structure type within the profile.
    pub structure_type: u32,
    /// Version of the data schema of `payload`.
    pub data_schema_version: u16,
    /// Schema-encoded payload.
    pub payload: Vec<u8>,
}

impl EventRecord {
    /// Serialize to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, WdmError> {
        rmp_serde::to_vec(self).map_err(WdmError::Serialization)
    }

    /// Deserialize from MessagePack bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WdmError> {
        rmp_serde::from_slice(bytes).map_err(WdmError::Deserialization)
    }

    /// Decode a payload that was written with MessagePack.
    pub fn decode_payload<T: serde::de::DeserializeOwned>(&self) -> Result<T, WdmError> {
        rmp_serde::from_slice(&self.payload).map_err(WdmError::Deserialization)
    }
}

impl std::fmt::Debug for EventRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRecord")
            .field("importance", &self.importance)
            .field("event_id", &self.event_id)
            .field("system_time_ms", &self.system_time_ms)
            .field("utc_time_ms", &self.utc_time_ms)
            .field("source_id", &self.source_id)
            .field("resource_id", &self.resource_id)
            .field("related", &self.related)
            .field("urgent", &self.urgent)
            .field("profile_id", &self.profile_id)
            .field("structure_type", &self.structure_type)
            .field("payload", &format!("[{} bytes]", self.payload.len()))
            .finish()
    }
}
