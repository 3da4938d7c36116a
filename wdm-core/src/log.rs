//! The importance-tiered event log.
//!
//! Tiers are kept in an arena ordered from least to most important, each
//! linked to the next. Appending to a full tier evicts its oldest event: in
//! every tier but the last the evicted event is promoted into the next tier
//! (possibly evicting there in turn), the last tier drops it and counts the
//! loss. An event too large for the next tier is dropped where it is, and an
//! event too large for its own tier is refused before anything is evicted.
//!
//! Promotion gives an event a new sequence number in its new tier but keeps
//! its id. [`EventLog::fetch_events`] matches promoted events against the
//! cursor of the tier they were first logged in, so a consumer takes each
//! event once however far it travels.
//!
//! The log also owns the flush/upload state machine that lets exactly one
//! consumer class drain it at a time:
//!
//! ```text
//! Idle ──flush timer / begin_upload──▶ InProgress ──upload_complete──▶ Holdoff
//!  ▲                                                                      │
//!  └──────────────────────────── holdoff timer ───────────────────────────┘
//! ```
//!
//! Any state moves to `Shutdown`, after which nothing can be logged.

use std::io::{self, Write};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};
use wdm_types::{EventId, EventRecord, EventSchema, Importance, RelatedEvent, WdmError};

use crate::counter::{CounterError, CounterStore, EventCounter};
use crate::cursor::EventCursors;
use crate::ring::FrameWriter;
use crate::tier::{AppendFailure, EventMeta, StoredEvent, TierBuffer};
use crate::timer::{Clock, TimerId, TimerService};

/// Errors from event log operations.
#[derive(Debug, Error)]
pub enum LogError {
    /// An event or record does not fit into an empty buffer
    #[error("buffer too small: event does not fit in {capacity} bytes")]
    BufferTooSmall {
        /// Capacity of the buffer that was too small
        capacity: usize,
    },

    /// Operation not allowed in the current logging state
    #[error("incorrect state: {0:?}")]
    IncorrectState(LoggingState),

    /// No tier is configured for the importance
    #[error("no tier for importance {0}")]
    NoTier(Importance),

    /// Invalid tier layout
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The event id counter failed
    #[error("counter error: {0}")]
    Counter(#[from] CounterError),

    /// Encoding or decoding failed
    #[error("wire error: {0}")]
    Wire(#[from] WdmError),

    /// The payload writer failed
    #[error("payload writer failed: {0}")]
    Payload(#[source] io::Error),

    /// Stored data could not be parsed
    #[error("corrupt frame: {0}")]
    Corrupt(String),
}

/// Flush/upload state of the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoggingState {
    /// Nothing is draining the log.
    #[default]
    Idle,
    /// A consumer is draining the log.
    InProgress,
    /// Recently drained; scheduled flushes wait for the holdoff timer.
    Holdoff,
    /// The log accepts nothing more.
    Shutdown,
}

/// How a tier's event id counter is created.
pub enum CounterSpec {
    /// In-memory counter starting after `last`.
    Volatile {
        /// Last id considered vended
        last: u64,
    },
    /// Counter persisted in `store` under `key`.
    Persisted {
        /// Backing store
        store: Box<dyn CounterStore>,
        /// Key within the store
        key: String,
        /// Ids reserved per store write
        epoch: u64,
    },
}

impl std::fmt::Debug for CounterSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CounterSpec::Volatile { last } => write!(f, "Volatile({last})"),
            CounterSpec::Persisted { key, epoch, .. } => write!(f, "Persisted({key}, {epoch})"),
        }
    }
}

/// Layout of one tier.
#[derive(Debug)]
pub struct TierConfig {
    /// Importance band stored in the tier
    pub importance: Importance,
    /// Storage in bytes
    pub capacity: usize,
    /// Id counter
    pub counter: CounterSpec,
}

impl TierConfig {
    /// Tier with an in-memory counter.
    pub fn volatile(importance: Importance, capacity: usize) -> Self {
        Self {
            importance,
            capacity,
            counter: CounterSpec::Volatile { last: 0 },
        }
    }

    /// Tier with a persisted counter keyed by the importance name.
    pub fn persisted(
        importance: Importance,
        capacity: usize,
        store: Box<dyn CounterStore>,
        epoch: u64,
    ) -> Self {
        Self {
            importance,
            capacity,
            counter: CounterSpec::Persisted {
                store,
                key: format!("event_id.{}", importance.as_str()),
                epoch,
            },
        }
    }
}

/// Log-wide settings.
#[derive(Debug, Clone)]
pub struct LogSettings {
    /// Events less important than this are discarded.
    pub logging_threshold: Importance,
    /// Bytes logged since the last flush that make a flush due.
    pub flush_threshold_bytes: u64,
    /// Quiet period after an upload completes.
    pub holdoff: Duration,
    /// Node id used as default source and resource.
    pub node_id: u64,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            logging_threshold: Importance::Debug,
            flush_threshold_bytes: 2048,
            holdoff: Duration::from_secs(5),
            node_id: 0,
        }
    }
}

/// Per-event overrides for [`EventLog::log_event`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogOptions {
    /// Device time of the event; defaults to the log clock.
    pub timestamp_ms: Option<u64>,
    /// Wall-clock time; defaults to the log clock, if it knows.
    pub utc_time_ms: Option<u64>,
    /// Ask for immediate delivery.
    pub urgent: bool,
    /// Earlier event this one belongs with.
    pub related: Option<RelatedEvent>,
    /// Producing node; defaults to the local node.
    pub source_id: Option<u64>,
    /// Resource the event is about; defaults to the local node.
    pub resource_id: Option<u64>,
}

impl LogOptions {
    /// Default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the event urgent.
    pub fn urgent(mut self) -> Self {
        self.urgent = true;
        self
    }

    /// Override the device timestamp.
    pub fn at(mut self, timestamp_ms: u64) -> Self {
        self.timestamp_ms = Some(timestamp_ms);
        self
    }

    /// Link to a related event.
    pub fn related_to(mut self, importance: Importance, event_id: EventId) -> Self {
        self.related = Some(RelatedEvent {
            importance,
            event_id,
        });
        self
    }

    /// Override the resource id.
    pub fn resource(mut self, resource_id: u64) -> Self {
        self.resource_id = Some(resource_id);
        self
    }

    /// Override the source id.
    pub fn source(mut self, source_id: u64) -> Self {
        self.source_id = Some(source_id);
        self
    }
}

/// Result of a fetch that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Every retained event from the cursor on was delivered.
    Exhausted,
    /// The destination filled up; fetch again with the updated cursor.
    DestinationFull,
}

/// Byte-budgeted destination for fetched events.
///
/// Records are stored as a little-endian `u32` length followed by the
/// MessagePack-encoded [`EventRecord`].
#[derive(Debug, Clone)]
pub struct EventBatch {
    budget: usize,
    bytes: Vec<u8>,
    count: usize,
}

impl EventBatch {
    /// Create an empty batch that holds at most `budget` bytes.
    pub fn new(budget: usize) -> Self {
        Self {
            budget,
            bytes: Vec::new(),
            count: 0,
        }
    }

    /// Append a record. Returns `false` if it does not fit.
    pub fn push(&mut self, record: &EventRecord) -> Result<bool, LogError> {
        let encoded = record.to_bytes()?;
        let needed = 4 + encoded.len();
        if self.bytes.len() + needed > self.budget {
            if self.bytes.is_empty() {
                return Err(LogError::BufferTooSmall {
                    capacity: self.budget,
                });
            }
            return Ok(false);
        }
        self.bytes
            .extend_from_slice(&(encoded.len() as u32).to_le_bytes());
        self.bytes.extend_from_slice(&encoded);
        self.count += 1;
        Ok(true)
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.count
    }

    /// Check if the batch holds no records.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Bytes still available.
    pub fn remaining(&self) -> usize {
        self.budget.saturating_sub(self.bytes.len())
    }

    /// Encoded contents.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Take the encoded contents.
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Decode the records in this batch.
    pub fn records(&self) -> Result<Vec<EventRecord>, WdmError> {
        Self::decode(&self.bytes)
    }

    /// Decode records from bytes produced by a batch.
    pub fn decode(mut bytes: &[u8]) -> Result<Vec<EventRecord>, WdmError> {
        let mut records = Vec::new();
        while !bytes.is_empty() {
            if bytes.len() < 4 {
                return Err(WdmError::InvalidData("truncated record length".into()));
            }
            let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
            let rest = &bytes[4..];
            if rest.len() < len {
                return Err(WdmError::InvalidData(format!(
                    "record of {} bytes truncated to {}",
                    len,
                    rest.len()
                )));
            }
            records.push(EventRecord::from_bytes(&rest[..len])?);
            bytes = &rest[len..];
        }
        Ok(records)
    }
}

/// The event log: a chain of importance tiers plus flush bookkeeping.
pub struct EventLog {
    tiers: Vec<TierBuffer>,
    state: LoggingState,
    throttled: bool,
    settings: LogSettings,
    clock: Box<dyn Clock>,
    bytes_written: u64,
    bytes_at_last_flush: u64,
    urgent_pending: bool,
    flush_armed: bool,
}

impl EventLog {
    /// Build a log from tier layouts, least important first after sorting.
    pub fn new(
        tiers: Vec<TierConfig>,
        settings: LogSettings,
        clock: Box<dyn Clock>,
    ) -> Result<Self, LogError> {
        if tiers.is_empty() {
            return Err(LogError::InvalidConfig("at least one tier is required".into()));
        }
        let mut tiers = tiers;
        tiers.sort_by_key(|t| t.importance);
        for pair in tiers.windows(2) {
            if pair[0].importance == pair[1].importance {
                return Err(LogError::InvalidConfig(format!(
                    "duplicate tier for importance {}",
                    pair[0].importance
                )));
            }
        }

        let mut buffers = Vec::with_capacity(tiers.len());
        for config in tiers {
            if config.capacity == 0 {
                return Err(LogError::InvalidConfig(format!(
                    "tier {} has zero capacity",
                    config.importance
                )));
            }
            let counter = match config.counter {
                CounterSpec::Volatile { last } => EventCounter::volatile(last),
                CounterSpec::Persisted { store, key, epoch } => {
                    EventCounter::persisted(store, key, epoch)?
                }
            };
            buffers.push(TierBuffer::new(config.importance, config.capacity, counter));
        }
        let count = buffers.len();
        for (i, tier) in buffers.iter_mut().enumerate() {
            tier.set_next((i + 1 < count).then_some(i + 1));
        }

        info!(
            tiers = count,
            threshold = %settings.logging_threshold,
            "event log ready"
        );
        Ok(Self {
            tiers: buffers,
            state: LoggingState::Idle,
            throttled: false,
            settings,
            clock,
            bytes_written: 0,
            bytes_at_last_flush: 0,
            urgent_pending: false,
            flush_armed: false,
        })
    }

    /// Log an event whose payload is streamed by `writer`.
    ///
    /// `writer` may be called more than once: if the tier was full, the
    /// oldest event is evicted and the write is retried. Returns
    /// `EventId(0)` when the event is below the logging threshold.
    pub fn log_event<F>(
        &mut self,
        schema: &EventSchema,
        options: &LogOptions,
        mut writer: F,
    ) -> Result<EventId, LogError>
    where
        F: FnMut(&mut FrameWriter<'_>) -> io::Result<()>,
    {
        if self.state == LoggingState::Shutdown {
            return Err(LogError::IncorrectState(self.state));
        }
        if schema.importance < self.settings.logging_threshold {
            return Ok(EventId::zero());
        }
        let index = self.tier_index(schema.importance)?;

        let meta = EventMeta {
            importance: schema.importance,
            event_id: None,
            system_time_ms: options
                .timestamp_ms
                .unwrap_or_else(|| self.clock.system_time_ms()),
            utc_time_ms: options.utc_time_ms.or_else(|| self.clock.utc_time_ms()),
            source_id: options.source_id.unwrap_or(self.settings.node_id),
            resource_id: options.resource_id.unwrap_or(self.settings.node_id),
            related: options.related,
            urgent: options.urgent,
            profile_id: schema.profile_id,
            structure_type: schema.structure_type,
            data_schema_version: schema.data_schema_version,
        };

        let before = self.tiers[index].bytes_used();
        let id = self.append(index, &meta, &mut writer)?;
        let after = self.tiers[index].bytes_used();
        self.bytes_written += after.saturating_sub(before) as u64;
        if options.urgent {
            self.urgent_pending = true;
        }
        debug!(
            importance = %schema.importance,
            event_id = %id,
            urgent = options.urgent,
            "logged event"
        );
        Ok(id)
    }

    /// Log an event whose payload is `value` encoded as MessagePack.
    pub fn log_payload<T: Serialize>(
        &mut self,
        schema: &EventSchema,
        options: &LogOptions,
        value: &T,
    ) -> Result<EventId, LogError> {
        let encoded = rmp_serde::to_vec(value).map_err(WdmError::Serialization)?;
        self.log_event(schema, options, |w| w.write_all(&encoded))
    }

    /// Copy events of one tier into `dest`, starting at `cursor`.
    ///
    /// Events that were already evicted are skipped. On return `cursor`
    /// names the next event not yet copied.
    pub fn fetch_events_since(
        &self,
        dest: &mut EventBatch,
        importance: Importance,
        cursor: &mut EventId,
    ) -> Result<FetchOutcome, LogError> {
        let tier = self.tier(importance)?;
        let start = (*cursor).max(tier.first_event_id());
        *cursor = start;

        for stored in tier.scan_from(start) {
            let StoredEvent { seq, record } = stored?;
            if !dest.push(&record)? {
                *cursor = seq;
                return Ok(FetchOutcome::DestinationFull);
            }
            *cursor = seq.next();
        }
        *cursor = (*cursor).max(tier.last_event_id().next());
        Ok(FetchOutcome::Exhausted)
    }

    /// Copy events of one tier into `dest`, resuming from `cursors`.
    ///
    /// Evicted events the tier's cursor passes over are remembered, and an
    /// event promoted here from a less important tier is skipped if it was
    /// already taken there. On `BufferTooSmall` the tier's cursor names the
    /// event that did not fit.
    pub fn fetch_events(
        &self,
        dest: &mut EventBatch,
        importance: Importance,
        cursors: &mut EventCursors,
    ) -> Result<FetchOutcome, LogError> {
        let tier = self.tier(importance)?;
        let first = tier.first_event_id();
        if cursors.get(importance) < first {
            cursors.skip_to(importance, first);
        }

        for stored in tier.scan_from(cursors.get(importance)) {
            let StoredEvent { seq, record } = stored?;
            let origin = self
                .origin_of(record.importance)
                .filter(|origin| *origin != importance);
            if let Some(origin) = origin {
                if cursors.was_taken(origin, record.event_id) {
                    cursors.set(importance, seq.next());
                    continue;
                }
            }

            match dest.push(&record) {
                Ok(true) => {}
                Ok(false) => {
                    cursors.set(importance, seq);
                    return Ok(FetchOutcome::DestinationFull);
                }
                Err(e) => {
                    cursors.set(importance, seq);
                    return Err(e);
                }
            }
            if let Some(origin) = origin {
                cursors.mark_taken(origin, record.event_id);
            }
            cursors.set(importance, seq.next());
        }
        cursors.advance_to(importance, tier.last_event_id().next());
        Ok(FetchOutcome::Exhausted)
    }

    /// Decoded events of one tier from `cursor` on, without a byte budget.
    pub fn events_since(
        &self,
        importance: Importance,
        cursor: EventId,
    ) -> Result<Vec<StoredEvent>, LogError> {
        let tier = self.tier(importance)?;
        tier.scan_from(cursor.max(tier.first_event_id())).collect()
    }

    /// Arm the flush timer if the log is idle and a flush is due.
    ///
    /// A flush is due when forced, when an urgent event is pending, or when
    /// enough bytes were logged since the last flush. An armed flush timer is
    /// left alone. Returns whether the timer was armed by this call.
    pub fn schedule_flush_if_needed(&mut self, timers: &mut dyn TimerService, forced: bool) -> bool {
        if self.state != LoggingState::Idle || self.flush_armed {
            return false;
        }
        let pending = self.bytes_written - self.bytes_at_last_flush;
        if forced || self.urgent_pending || pending >= self.settings.flush_threshold_bytes {
            timers.arm(TimerId::Flush, Duration::ZERO);
            self.flush_armed = true;
            debug!(forced, urgent = self.urgent_pending, pending, "flush scheduled");
            return true;
        }
        false
    }

    /// The flush timer fired. Returns `true` if the log moved to
    /// `InProgress` and an upload should start.
    pub fn on_flush_timer(&mut self) -> bool {
        self.flush_armed = false;
        if self.state != LoggingState::Idle {
            return false;
        }
        self.claim();
        true
    }

    /// Claim the log for an upload.
    ///
    /// Allowed from `Idle`, `Holdoff` and `InProgress` (already claimed by a
    /// flush timer).
    pub fn begin_upload(&mut self) -> Result<(), LogError> {
        if self.state == LoggingState::Shutdown {
            return Err(LogError::IncorrectState(self.state));
        }
        if self.state != LoggingState::InProgress {
            self.claim();
        }
        Ok(())
    }

    /// The upload that claimed the log finished, successfully or not.
    pub fn upload_complete(&mut self, timers: &mut dyn TimerService) {
        if self.state != LoggingState::InProgress {
            return;
        }
        self.state = LoggingState::Holdoff;
        timers.arm(TimerId::Holdoff, self.settings.holdoff);
        info!(holdoff_ms = self.settings.holdoff.as_millis() as u64, "upload complete");
    }

    /// The holdoff timer fired; go idle and re-check whether a flush is due.
    pub fn on_holdoff_timer(&mut self, timers: &mut dyn TimerService) {
        if self.state != LoggingState::Holdoff {
            return;
        }
        self.state = LoggingState::Idle;
        self.schedule_flush_if_needed(timers, false);
    }

    /// Stop accepting events and cancel the log's timers.
    pub fn shutdown(&mut self, timers: &mut dyn TimerService) {
        timers.cancel(TimerId::Flush);
        timers.cancel(TimerId::Holdoff);
        self.flush_armed = false;
        self.state = LoggingState::Shutdown;
        info!("event log shut down");
    }

    /// Mark the log as overrun by its consumer.
    pub fn throttle(&mut self) {
        if !self.throttled {
            warn!("event log throttled");
        }
        self.throttled = true;
    }

    /// Clear the overrun mark.
    pub fn unthrottle(&mut self) {
        if self.throttled {
            info!("event log unthrottled");
        }
        self.throttled = false;
    }

    /// Check if the log is throttled. Advisory only: logging never blocks.
    pub fn is_throttled(&self) -> bool {
        self.throttled
    }

    /// Current flush/upload state.
    pub fn state(&self) -> LoggingState {
        self.state
    }

    /// Oldest retained sequence number of a tier.
    pub fn first_event_id(&self, importance: Importance) -> Result<EventId, LogError> {
        Ok(self.tier(importance)?.first_event_id())
    }

    /// Last sequence number vended by a tier.
    pub fn last_event_id(&self, importance: Importance) -> Result<EventId, LogError> {
        Ok(self.tier(importance)?.last_event_id())
    }

    /// Events lost by a tier.
    pub fn dropped_events(&self, importance: Importance) -> Result<u64, LogError> {
        Ok(self.tier(importance)?.dropped_events())
    }

    /// Total bytes appended by [`log_event`](Self::log_event).
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Check if a tier holds events at or after `cursor`.
    pub fn has_events_after(&self, importance: Importance, cursor: EventId) -> bool {
        self.tier(importance)
            .map(|tier| tier.has_events_from(cursor))
            .unwrap_or(false)
    }

    /// Importance of every tier, least important first.
    pub fn tier_importances(&self) -> Vec<Importance> {
        self.tiers.iter().map(|t| t.importance()).collect()
    }

    /// The tier with exactly this importance.
    pub fn tier(&self, importance: Importance) -> Result<&TierBuffer, LogError> {
        self.tiers
            .iter()
            .find(|t| t.importance() == importance)
            .ok_or(LogError::NoTier(importance))
    }

    fn claim(&mut self) {
        self.state = LoggingState::InProgress;
        self.bytes_at_last_flush = self.bytes_written;
        self.urgent_pending = false;
        info!("event log upload in progress");
    }

    /// Importance of the tier an event of `importance` is first logged in.
    fn origin_of(&self, importance: Importance) -> Option<Importance> {
        self.tier_index(importance)
            .ok()
            .map(|index| self.tiers[index].importance())
    }

    /// Least important tier that can hold `importance`.
    fn tier_index(&self, importance: Importance) -> Result<usize, LogError> {
        self.tiers
            .iter()
            .position(|t| t.importance() >= importance)
            .ok_or(LogError::NoTier(importance))
    }

    /// Append to tier `index`, evicting until the event fits.
    ///
    /// An event that could not fit even in the empty tier fails before
    /// anything is evicted.
    fn append<F>(&mut self, index: usize, meta: &EventMeta, writer: &mut F) -> Result<EventId, LogError>
    where
        F: FnMut(&mut FrameWriter<'_>) -> io::Result<()>,
    {
        let mut measured = false;
        loop {
            match self.tiers[index].try_append(meta, writer) {
                Ok(seq) => return Ok(seq),
                Err(AppendFailure::Full) => {
                    if !measured {
                        self.tiers[index].ensure_fits(meta, writer)?;
                        measured = true;
                    }
                    self.evict_oldest(index)?;
                }
                Err(AppendFailure::Fatal(e)) => return Err(e),
            }
        }
    }

    /// Make room in tier `index` by promoting or dropping its oldest event.
    fn evict_oldest(&mut self, index: usize) -> Result<(), LogError> {
        let Some(next) = self.tiers[index].next() else {
            let tier = &mut self.tiers[index];
            if let Some(event_id) = tier.drop_oldest()? {
                warn!(
                    tier = %tier.importance(),
                    event_id = %event_id,
                    dropped = tier.dropped_events(),
                    "dropped oldest event"
                );
            }
            return Ok(());
        };

        let Some(oldest) = self.tiers[index].oldest()? else {
            return Ok(());
        };
        let meta = EventMeta::promoted(&oldest.record);
        let payload = oldest.record.payload;
        let promoted = self.append(next, &meta, &mut |w: &mut FrameWriter<'_>| {
            w.write_all(&payload)
        });
        let seq = match promoted {
            Ok(seq) => seq,
            Err(LogError::BufferTooSmall { capacity }) => {
                let tier = &mut self.tiers[index];
                tier.drop_oldest()?;
                warn!(
                    tier = %tier.importance(),
                    event_id = %oldest.record.event_id,
                    next_capacity = capacity,
                    dropped = tier.dropped_events(),
                    "oldest event does not fit the next tier, dropped"
                );
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        self.tiers[index].discard_oldest()?;
        debug!(
            from = %self.tiers[index].importance(),
            to = %self.tiers[next].importance(),
            event_id = %meta.event_id.unwrap_or_default(),
            seq = %seq,
            "promoted event"
        );
        Ok(())
    }
}

impl std::fmt::Debug for EventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLog")
            .field("tiers", &self.tiers)
            .field("state", &self.state)
            .field("throttled", &self.throttled)
            .field("bytes_written", &self.bytes_written)
            .finish()
    }
}
