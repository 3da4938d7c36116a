//! Checkpointed offload of the event log.
//!
//! An [`OffloadSession`] decides which events go into each block of an
//! upload and remembers, per importance, what the collector has taken. Two
//! cursor sets are kept:
//!
//! - `scheduled`: next event to put into a block in the current attempt
//! - `transmitted`: next event after everything a finished attempt delivered
//!
//! An attempt starts from `transmitted` and only moves it forward when the
//! collector acknowledges the final block, so a failed attempt is retried
//! from the same place and a finished one is never repeated.

use thiserror::Error;
use tracing::{debug, info, warn};
use wdm_types::Importance;

use crate::cursor::EventCursors;
use crate::log::{EventBatch, EventLog, FetchOutcome, LogError};
use crate::timer::TimerService;

/// Lifecycle of the offload session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OffloadState {
    /// Not bound to a transfer engine.
    #[default]
    Uninitialized,
    /// Ready to start an upload.
    Initialized,
    /// An upload attempt is running.
    InProgress,
}

/// Errors from offload session operations.
#[derive(Debug, Error)]
pub enum OffloadError {
    /// Operation not allowed in the current state
    #[error("incorrect offload state: {0:?}")]
    IncorrectState(OffloadState),

    /// The event log refused the operation
    #[error("event log error: {0}")]
    Log(#[from] LogError),
}

/// One filled block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilledBlock {
    /// Encoded event batch
    pub data: Vec<u8>,
    /// Every tier is exhausted; this is the final block
    pub last: bool,
    /// Number of events in `data`
    pub events: usize,
}

/// Offload progress across upload attempts.
#[derive(Debug, Clone, Default)]
pub struct OffloadSession {
    state: OffloadState,
    scheduled: EventCursors,
    transmitted: EventCursors,
    tiers: Vec<Importance>,
    tier: usize,
    first_block: bool,
    attempts: u32,
    throttled: bool,
}

impl OffloadSession {
    /// Create an uninitialized session.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind the session. Starts a new session: attempts are counted from here.
    pub fn init(&mut self) -> Result<(), OffloadError> {
        if self.state == OffloadState::InProgress {
            return Err(OffloadError::IncorrectState(self.state));
        }
        self.state = OffloadState::Initialized;
        self.attempts = 0;
        Ok(())
    }

    /// Start an upload attempt from the last transmitted position.
    pub fn start(&mut self, log: &mut EventLog) -> Result<(), OffloadError> {
        if self.state != OffloadState::Initialized {
            return Err(OffloadError::IncorrectState(self.state));
        }
        log.begin_upload()?;

        self.scheduled = self.transmitted;
        self.tiers = log.tier_importances();
        self.tier = 0;
        self.first_block = true;
        self.attempts = self.attempts.saturating_add(1);
        self.state = OffloadState::InProgress;
        info!(attempt = self.attempts, "offload started");
        Ok(())
    }

    /// Fill the next block with at most `max_size` bytes of events, walking
    /// tiers from least to most important.
    pub fn fill_block(
        &mut self,
        log: &mut EventLog,
        max_size: usize,
    ) -> Result<FilledBlock, OffloadError> {
        if self.state != OffloadState::InProgress {
            return Err(OffloadError::IncorrectState(self.state));
        }
        if self.first_block {
            self.first_block = false;
            self.throttle_if_needed(log);
        }

        let mut batch = EventBatch::new(max_size);
        let mut last = false;
        loop {
            let Some(&importance) = self.tiers.get(self.tier) else {
                last = true;
                break;
            };
            match log.fetch_events(&mut batch, importance, &mut self.scheduled) {
                Ok(FetchOutcome::Exhausted) => self.tier += 1,
                Ok(FetchOutcome::DestinationFull) => break,
                Err(LogError::BufferTooSmall { capacity }) => {
                    let event = self.scheduled.get(importance);
                    warn!(
                        %importance,
                        %event,
                        capacity,
                        "event larger than a block, skipping"
                    );
                    self.scheduled.set(importance, event.next());
                }
                Err(e) => return Err(e.into()),
            }
        }

        debug!(events = batch.len(), last, "block filled");
        Ok(FilledBlock {
            events: batch.len(),
            last,
            data: batch.into_bytes(),
        })
    }

    /// Throttle the log if the next event of the current tier was evicted
    /// before this retry could send it. Returns whether it throttled.
    pub fn throttle_if_needed(&mut self, log: &mut EventLog) -> bool {
        if self.attempts <= 1 {
            return false;
        }
        let Some(&importance) = self.tiers.get(self.tier) else {
            return false;
        };
        let Ok(first) = log.first_event_id(importance) else {
            return false;
        };
        let missed = self.scheduled.missed(importance, first);
        if missed == 0 {
            return false;
        }
        warn!(
            %importance,
            missed,
            attempt = self.attempts,
            "offload fell behind eviction"
        );
        log.throttle();
        self.throttled = true;
        true
    }

    /// The collector acknowledged the final block.
    pub fn on_done(&mut self, log: &mut EventLog, timers: &mut dyn TimerService) {
        if self.state != OffloadState::InProgress {
            return;
        }
        self.transmitted = self.scheduled;
        info!(attempt = self.attempts, "offload done");
        self.finish(log, timers);
        self.attempts = 0;
    }

    /// The attempt failed; forget what it scheduled.
    pub fn on_failure(&mut self, log: &mut EventLog, timers: &mut dyn TimerService) {
        if self.state != OffloadState::InProgress {
            return;
        }
        self.scheduled = self.transmitted;
        info!(attempt = self.attempts, "offload rolled back");
        self.finish(log, timers);
    }

    /// Roll back any running attempt and unbind.
    pub fn shutdown(&mut self, log: &mut EventLog, timers: &mut dyn TimerService) {
        self.on_failure(log, timers);
        self.state = OffloadState::Uninitialized;
    }

    /// Current state.
    pub fn state(&self) -> OffloadState {
        self.state
    }

    /// Attempts since the last success or `init`.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Positions acknowledged by the collector.
    pub fn transmitted(&self) -> &EventCursors {
        &self.transmitted
    }

    /// Positions scheduled by the running attempt.
    pub fn scheduled(&self) -> &EventCursors {
        &self.scheduled
    }

    /// Check if this session throttled the log.
    pub fn is_throttled(&self) -> bool {
        self.throttled
    }

    fn finish(&mut self, log: &mut EventLog, timers: &mut dyn TimerService) {
        if self.throttled {
            log.unthrottle();
            self.throttled = false;
        }
        log.upload_complete(timers);
        self.state = OffloadState::Initialized;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::{LogOptions, LogSettings, TierConfig};
    use crate::timer::{ManualClock, Timers};
    use std::io::Write;
    use wdm_types::{EventId, EventRecord, EventSchema};

    fn log_with(tiers: Vec<TierConfig>) -> EventLog {
        EventLog::new(tiers, LogSettings::default(), Box::new(ManualClock::new(0))).unwrap()
    }

    fn two_tiers() -> EventLog {
        log_with(vec![
            TierConfig::volatile(Importance::Debug, 4096),
            TierConfig::volatile(Importance::Production, 4096),
        ])
    }

    fn emit(log: &mut EventLog, importance: Importance) -> EventId {
        log.log_event(
            &EventSchema::new(0x0A01, 7, importance),
            &LogOptions::new(),
            |w| w.write_all(&[9, 9]),
        )
        .unwrap()
    }

    fn drain(session: &mut OffloadSession, log: &mut EventLog, block: usize) -> Vec<EventRecord> {
        let mut records = Vec::new();
        loop {
            let filled = session.fill_block(log, block).unwrap();
            records.extend(EventBatch::decode(&filled.data).unwrap());
            if filled.last {
                return records;
            }
        }
    }

    fn ids(records: &[EventRecord]) -> Vec<(Importance, u64)> {
        records
            .iter()
            .map(|r| (r.importance, r.event_id.value()))
            .collect()
    }

    fn ready() -> OffloadSession {
        let mut session = OffloadSession::new();
        session.init().unwrap();
        session
    }

    #[test]
    fn start_requires_init() {
        let mut log = two_tiers();
        let mut session = OffloadSession::new();
        assert!(matches!(
            session.start(&mut log),
            Err(OffloadError::IncorrectState(OffloadState::Uninitialized))
        ));
    }

    #[test]
    fn blocks_walk_tiers_in_importance_order() {
        let mut log = two_tiers();
        let mut timers = Timers::new();
        emit(&mut log, Importance::Production);
        emit(&mut log, Importance::Debug);
        emit(&mut log, Importance::Debug);

        let mut session = ready();
        session.start(&mut log).unwrap();
        let records = drain(&mut session, &mut log, 4096);
        assert_eq!(
            ids(&records),
            vec![
                (Importance::Debug, 1),
                (Importance::Debug, 2),
                (Importance::Production, 1)
            ]
        );

        session.on_done(&mut log, &mut timers);
        assert_eq!(session.state(), OffloadState::Initialized);
        assert_eq!(session.transmitted().get(Importance::Debug), EventId::new(3));
        assert_eq!(
            session.transmitted().get(Importance::Production),
            EventId::new(2)
        );
    }

    #[test]
    fn small_blocks_deliver_each_event_once() {
        let mut log = two_tiers();
        for _ in 0..6 {
            emit(&mut log, Importance::Debug);
            emit(&mut log, Importance::Production);
        }

        let mut session = ready();
        session.start(&mut log).unwrap();
        let records = drain(&mut session, &mut log, 100);

        let mut expected: Vec<(Importance, u64)> =
            (1..=6).map(|id| (Importance::Debug, id)).collect();
        expected.extend((1..=6).map(|id| (Importance::Production, id)));
        assert_eq!(ids(&records), expected);
    }

    #[test]
    fn finished_attempt_is_not_repeated() {
        let mut log = two_tiers();
        let mut timers = Timers::new();
        emit(&mut log, Importance::Debug);

        let mut session = ready();
        session.start(&mut log).unwrap();
        drain(&mut session, &mut log, 4096);
        session.on_done(&mut log, &mut timers);

        let fresh = emit(&mut log, Importance::Debug);
        session.start(&mut log).unwrap();
        let records = drain(&mut session, &mut log, 4096);
        assert_eq!(ids(&records), vec![(Importance::Debug, fresh.value())]);
    }

    #[test]
    fn promoted_events_are_not_uploaded_again() {
        let frame = {
            let mut sample = log_with(vec![TierConfig::volatile(Importance::Debug, 1024)]);
            emit(&mut sample, Importance::Debug);
            sample.tier(Importance::Debug).unwrap().bytes_used()
        };
        let mut log = log_with(vec![
            TierConfig::volatile(Importance::Debug, 3 * frame),
            TierConfig::volatile(Importance::Info, 4096),
        ]);
        let mut timers = Timers::new();
        for _ in 0..3 {
            emit(&mut log, Importance::Debug);
        }

        let mut session = ready();
        session.start(&mut log).unwrap();
        let first = drain(&mut session, &mut log, 4096);
        assert_eq!(
            ids(&first),
            (1..=3).map(|id| (Importance::Debug, id)).collect::<Vec<_>>()
        );
        session.on_done(&mut log, &mut timers);

        for _ in 0..3 {
            emit(&mut log, Importance::Debug);
        }
        assert_eq!(log.tier(Importance::Info).unwrap().event_count(), 3);
        session.start(&mut log).unwrap();
        let second = drain(&mut session, &mut log, 4096);
        assert_eq!(
            ids(&second),
            (4..=6).map(|id| (Importance::Debug, id)).collect::<Vec<_>>()
        );
    }

    #[test]
    fn failed_attempt_is_retried_from_last_transmitted() {
        let mut log = two_tiers();
        let mut timers = Timers::new();
        for _ in 0..4 {
            emit(&mut log, Importance::Debug);
        }

        let mut session = ready();
        session.start(&mut log).unwrap();
        let partial = session.fill_block(&mut log, 80).unwrap();
        assert!(!partial.last);
        assert!(partial.events > 0);
        session.on_failure(&mut log, &mut timers);
        assert_eq!(session.scheduled(), session.transmitted());

        session.start(&mut log).unwrap();
        assert_eq!(session.attempts(), 2);
        let records = drain(&mut session, &mut log, 4096);
        assert_eq!(
            ids(&records),
            (1..=4).map(|id| (Importance::Debug, id)).collect::<Vec<_>>()
        );
    }

    #[test]
    fn retry_after_eviction_throttles_until_done() {
        let mut log = log_with(vec![TierConfig::volatile(Importance::Debug, 200)]);
        let mut timers = Timers::new();
        emit(&mut log, Importance::Debug);
        emit(&mut log, Importance::Debug);

        let mut session = ready();
        session.start(&mut log).unwrap();
        session.on_failure(&mut log, &mut timers);

        for _ in 0..10 {
            emit(&mut log, Importance::Debug);
        }
        assert!(log.first_event_id(Importance::Debug).unwrap() > EventId::new(1));

        session.start(&mut log).unwrap();
        let records = drain(&mut session, &mut log, 4096);
        assert!(log.is_throttled());
        assert!(session.is_throttled());
        assert_eq!(
            records.first().map(|r| r.event_id),
            Some(log.first_event_id(Importance::Debug).unwrap())
        );

        session.on_done(&mut log, &mut timers);
        assert!(!log.is_throttled());
    }

    #[test]
    fn first_attempt_never_throttles() {
        let mut log = log_with(vec![TierConfig::volatile(Importance::Debug, 200)]);
        for _ in 0..10 {
            emit(&mut log, Importance::Debug);
        }

        let mut session = ready();
        session.start(&mut log).unwrap();
        drain(&mut session, &mut log, 4096);
        assert!(!log.is_throttled());
    }

    #[test]
    fn start_claims_log() {
        use crate::log::LoggingState;

        let mut log = two_tiers();
        let mut timers = Timers::new();
        let mut session = ready();

        session.start(&mut log).unwrap();
        assert_eq!(log.state(), LoggingState::InProgress);
        session.on_done(&mut log, &mut timers);
        assert_eq!(log.state(), LoggingState::Holdoff);

        // A retry may start during holdoff.
        session.start(&mut log).unwrap();
        assert_eq!(log.state(), LoggingState::InProgress);
    }

    #[test]
    fn shutdown_rolls_back_and_unbinds() {
        let mut log = two_tiers();
        let mut timers = Timers::new();
        emit(&mut log, Importance::Debug);

        let mut session = ready();
        session.start(&mut log).unwrap();
        session.fill_block(&mut log, 4096).unwrap();
        session.shutdown(&mut log, &mut timers);

        assert_eq!(session.state(), OffloadState::Uninitialized);
        assert!(session.transmitted().get(Importance::Debug).is_zero());
    }
}
