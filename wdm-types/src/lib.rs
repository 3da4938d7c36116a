//! # wdm-types
//!
//! Wire format types for the WDM publish/subscribe protocol and the bulk
//! event offload (BDX) protocol.
//!
//! This crate provides the foundational types used across all wdm crates:
//! - [`EventId`], [`Importance`], [`NodeId`], [`SubscriptionId`], [`ExchangeId`] - Identity and ordering types
//! - [`EventRecord`], [`EventSchema`] - Decoded events as stored and transmitted
//! - [`Envelope`] - Message wrapper with exchange and routing metadata
//! - [`Message`] - Protocol messages (SubscribeRequest, Notify, BDX blocks, etc.)
//! - [`StatusReport`] and the [`status`] codes
//! - [`WdmError`] - Error types

#![warn(missing_docs)]
#![warn(clippy::all)]

mod envelope;
mod error;
mod event;
mod ids;
mod messages;
pub mod status;

pub use envelope::{Envelope, PROTOCOL_VERSION};
pub use error::WdmError;
pub use event::{EventRecord, EventSchema, RelatedEvent};
pub use ids::{EventId, ExchangeId, Importance, NodeId, SubscriptionId};
pub use messages::{
    Block, BlockEof, BlockEofAck, BlockQuery, CancelRequest, DataElement, Message, Notify,
    SchemaVersionRange, SendAccept, SendInit, SendReject, SubscribeRequest, SubscribeResponse,
    TraitInstance, TraitPathRequest, TransferError,
};
pub use status::StatusReport;
