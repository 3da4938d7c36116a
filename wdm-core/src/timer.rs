//! Timers and clocks.
//!
//! Components never sleep. They ask a [`TimerService`] to arm or cancel a
//! named one-shot timer and get called back by whoever owns the service when
//! it expires. [`Timers`] is a deadline table driven by explicit
//! [`advance`](Timers::advance) calls, so tests control time exactly and the
//! async node runner only has to sleep until [`Timers::next_deadline`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::subscription::SubscriptionHandle;

/// Name of a one-shot timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimerId {
    /// Event log flush is due.
    Flush,
    /// Event log holdoff after an upload has elapsed.
    Holdoff,
    /// Subscription liveness expired.
    Liveness(SubscriptionHandle),
    /// Peer did not answer an outstanding Notify in time.
    ResponseTimeout(SubscriptionHandle),
    /// Collector did not answer the running transfer in time.
    TransferTimeout,
}

/// Arms and cancels one-shot timers.
pub trait TimerService {
    /// Arm `id` to fire after `after`, replacing any earlier deadline.
    fn arm(&mut self, id: TimerId, after: Duration);

    /// Cancel `id`. Cancelling an idle timer is a no-op.
    fn cancel(&mut self, id: TimerId);
}

/// Deadline table over a manually advanced clock.
#[derive(Debug, Default)]
pub struct Timers {
    now: Duration,
    deadlines: HashMap<TimerId, Duration>,
}

impl Timers {
    /// Create an empty table at time zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Time elapsed since creation.
    pub fn now(&self) -> Duration {
        self.now
    }

    /// Check if `id` is armed.
    pub fn is_armed(&self, id: TimerId) -> bool {
        self.deadlines.contains_key(&id)
    }

    /// Number of armed timers.
    pub fn armed_count(&self) -> usize {
        self.deadlines.len()
    }

    /// Time until the earliest deadline, if any timer is armed.
    pub fn next_deadline(&self) -> Option<Duration> {
        self.deadlines
            .values()
            .min()
            .map(|deadline| deadline.saturating_sub(self.now))
    }

    /// Move time forward and return the timers that expired, earliest first.
    ///
    /// Expired timers are disarmed before they are returned.
    pub fn advance(&mut self, by: Duration) -> Vec<TimerId> {
        self.now += by;
        let now = self.now;

        let mut expired: Vec<(Duration, TimerId)> = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, deadline)| (*deadline, *id))
            .collect();
        expired.sort();

        for (_, id) in &expired {
            self.deadlines.remove(id);
        }
        expired.into_iter().map(|(_, id)| id).collect()
    }
}

impl TimerService for Timers {
    fn arm(&mut self, id: TimerId, after: Duration) {
        self.deadlines.insert(id, self.now + after);
    }

    fn cancel(&mut self, id: TimerId) {
        self.deadlines.remove(&id);
    }
}

/// Source of event timestamps.
pub trait Clock: Send {
    /// Monotonic device time in milliseconds.
    fn system_time_ms(&self) -> u64;

    /// Wall-clock milliseconds since the Unix epoch, when known.
    fn utc_time_ms(&self) -> Option<u64>;
}

/// Clock backed by the operating system.
#[derive(Debug, Clone)]
pub struct SystemClock {
    started: Instant,
}

impl SystemClock {
    /// Create a clock whose system time starts at zero now.
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn system_time_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    fn utc_time_ms(&self) -> Option<u64> {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .ok()
            .map(|d| d.as_millis() as u64)
    }
}

/// Clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now_ms: Arc<AtomicU64>,
}

impl ManualClock {
    /// Create a clock at `start_ms`.
    pub fn new(start_ms: u64) -> Self {
        Self {
            now_ms: Arc::new(AtomicU64::new(start_ms)),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        self.now_ms
            .fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    /// Set the clock.
    pub fn set(&self, now_ms: u64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn system_time_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }

    fn utc_time_ms(&self) -> Option<u64> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timers_fire_in_deadline_order() {
        let mut timers = Timers::new();
        timers.arm(TimerId::Holdoff, Duration::from_millis(30));
        timers.arm(TimerId::Flush, Duration::from_millis(10));

        assert_eq!(timers.next_deadline(), Some(Duration::from_millis(10)));
        let fired = timers.advance(Duration::from_millis(50));
        assert_eq!(fired, vec![TimerId::Flush, TimerId::Holdoff]);
        assert_eq!(timers.armed_count(), 0);
    }

    #[test]
    fn timers_do_not_fire_early() {
        let mut timers = Timers::new();
        timers.arm(TimerId::Flush, Duration::from_millis(10));

        assert!(timers.advance(Duration::from_millis(9)).is_empty());
        assert_eq!(timers.next_deadline(), Some(Duration::from_millis(1)));
        assert_eq!(timers.advance(Duration::from_millis(1)), vec![TimerId::Flush]);
    }

    #[test]
    fn rearm_replaces_deadline() {
        let mut timers = Timers::new();
        timers.arm(TimerId::Flush, Duration::from_millis(10));
        timers.advance(Duration::from_millis(5));
        timers.arm(TimerId::Flush, Duration::from_millis(10));

        assert!(timers.advance(Duration::from_millis(5)).is_empty());
        assert_eq!(timers.advance(Duration::from_millis(5)), vec![TimerId::Flush]);
    }

    #[test]
    fn cancel_disarms() {
        let mut timers = Timers::new();
        timers.arm(TimerId::Holdoff, Duration::from_millis(1));
        timers.cancel(TimerId::Holdoff);
        timers.cancel(TimerId::Flush);

        assert!(!timers.is_armed(TimerId::Holdoff));
        assert!(timers.advance(Duration::from_secs(1)).is_empty());
        assert_eq!(timers.next_deadline(), None);
    }

    #[test]
    fn manual_clock_clones_share_time() {
        let clock = ManualClock::new(100);
        let view = clock.clone();
        clock.advance(Duration::from_millis(25));
        assert_eq!(view.system_time_ms(), 125);
        assert_eq!(view.utc_time_ms(), None);
    }
}
