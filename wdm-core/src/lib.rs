//! # wdm-core
//!
//! Pure logic for the device side of WDM (no I/O, instant tests).
//!
//! This crate implements the event log and the protocol state machines
//! without any network or disk I/O:
//! - [`ring`] / [`tier`] / [`log`] - importance-tiered event storage with
//!   eviction by promotion
//! - [`counter`] - event id counters, volatile or persisted in epochs
//! - [`cursor`] - per-importance "next event" positions of log consumers
//! - [`subscription`] - publisher-side subscription handler
//! - [`transfer`] / [`offload`] - BDX sender and checkpointed offload
//! - [`timer`] / [`exchange`] - timers, clocks and exchange id allocation
//!
//! ## Design Philosophy
//!
//! State machines take input and return the actions to perform instead of
//! performing them. The actual I/O (transport, timers, files) is done by
//! `wdm-client`, which interprets those actions.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod counter;
pub mod cursor;
pub mod exchange;
pub mod log;
pub mod offload;
pub mod ring;
pub mod subscription;
pub mod tier;
pub mod timer;
pub mod transfer;

pub use counter::{CounterError, CounterStore, EventCounter, MemoryCounterStore, DEFAULT_EPOCH};
pub use cursor::EventCursors;
pub use exchange::ExchangeAllocator;
pub use log::{
    CounterSpec, EventBatch, EventLog, FetchOutcome, LogError, LogOptions, LogSettings,
    LoggingState, TierConfig,
};
pub use offload::{FilledBlock, OffloadError, OffloadSession, OffloadState};
pub use ring::{ByteRing, FrameWriter};
pub use subscription::{
    HandlerAction, HandlerContext, HandlerError, HandlerEvent, HandlerState, ParsedRequest,
    SubscriptionHandle, SubscriptionHandler, TerminationReason, TraitDataSource,
};
pub use tier::{StoredEvent, TierBuffer};
pub use timer::{Clock, ManualClock, SystemClock, TimerId, TimerService, Timers};
pub use transfer::{FailureReason, TransferAction, TransferEvent, TransferState};
