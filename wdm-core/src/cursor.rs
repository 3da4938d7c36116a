//! Per-importance event cursors.
//!
//! A cursor names the next event a consumer has not yet taken from a tier.
//! Consumers keep one per importance: subscriptions track what the peer has
//! acknowledged, the offload session tracks what was scheduled and what was
//! transmitted.
//!
//! Cursors only ever move forward; a cursor that falls behind the oldest
//! retained event of its tier means the consumer missed evicted events.
//!
//! Evicted events are usually promoted, not lost, so a cursor also remembers
//! the ranges it passed over without taking them. A promoted event met in a
//! more important tier is taken if it falls in such a range or past the
//! cursor, and skipped otherwise.

use wdm_types::{EventId, Importance};

/// Passed-over ranges remembered per importance.
const MAX_GAPS: usize = 4;

/// Half-open id ranges passed over without being taken, oldest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct Gaps {
    ranges: [(u64, u64); MAX_GAPS],
    len: usize,
}

impl Gaps {
    fn position(&self, id: u64) -> Option<usize> {
        self.ranges[..self.len]
            .iter()
            .position(|&(start, end)| start <= id && id < end)
    }

    fn add(&mut self, start: u64, end: u64) {
        if start >= end {
            return;
        }
        if let Some(last) = self.ranges[..self.len].last_mut() {
            if start <= last.1 {
                last.1 = last.1.max(end);
                return;
            }
        }
        if self.len == MAX_GAPS {
            // Merging may hand out the ids between the two oldest ranges again.
            self.ranges[0].1 = self.ranges[1].1;
            self.ranges.copy_within(2.., 1);
            self.len -= 1;
        }
        self.ranges[self.len] = (start, end);
        self.len += 1;
    }

    fn remove(&mut self, id: u64) {
        let Some(i) = self.position(id) else {
            return;
        };
        let (start, end) = self.ranges[i];
        if id == start {
            self.ranges[i].0 += 1;
        } else if id + 1 == end {
            self.ranges[i].1 -= 1;
        } else if self.len < MAX_GAPS {
            self.ranges.copy_within(i + 1..self.len, i + 2);
            self.ranges[i] = (start, id);
            self.ranges[i + 1] = (id + 1, end);
            self.len += 1;
            return;
        } else {
            // No room to split; the id stays open.
            return;
        }
        if self.ranges[i].0 >= self.ranges[i].1 {
            self.ranges.copy_within(i + 1..self.len, i);
            self.len -= 1;
        }
    }
}

/// One "next event" cursor per importance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventCursors {
    next: [EventId; Importance::COUNT],
    gaps: [Gaps; Importance::COUNT],
}

impl EventCursors {
    /// All cursors at the start of their tier.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cursors that resume after the last events a peer reports holding.
    ///
    /// Importances the peer does not mention stay at zero.
    pub fn after_observed(observed: &[(Importance, EventId)]) -> Self {
        let mut cursors = Self::new();
        for (importance, last) in observed {
            cursors.advance_to(*importance, last.next());
        }
        cursors
    }

    /// Next event to take at `importance`.
    pub fn get(&self, importance: Importance) -> EventId {
        self.next[importance.index()]
    }

    /// Set the cursor, even backwards. Used for rollback.
    pub fn set(&mut self, importance: Importance, next: EventId) {
        self.next[importance.index()] = next;
    }

    /// Move the cursor forward to `next`; earlier values are ignored.
    pub fn advance_to(&mut self, importance: Importance, next: EventId) {
        let slot = &mut self.next[importance.index()];
        if next > *slot {
            *slot = next;
        }
    }

    /// Move the cursor forward to `to`, remembering the events passed over.
    pub fn skip_to(&mut self, importance: Importance, to: EventId) {
        let from = self.get(importance).value().max(1);
        self.gaps[importance.index()].add(from, to.value());
        self.advance_to(importance, to);
    }

    /// Check if event `id` of the tier at `importance` was already taken,
    /// from that tier or after promotion.
    pub fn was_taken(&self, importance: Importance, id: EventId) -> bool {
        id < self.get(importance) && self.gaps[importance.index()].position(id.value()).is_none()
    }

    /// Record that event `id` of the tier at `importance` was taken from a
    /// more important tier it was promoted into.
    ///
    /// Promotion is oldest first, so past the cursor everything before `id`
    /// has left the tier too; the cursor jumps over it.
    pub fn mark_taken(&mut self, importance: Importance, id: EventId) {
        if id >= self.get(importance) {
            self.skip_to(importance, id);
            self.set(importance, id.next());
        } else {
            self.gaps[importance.index()].remove(id.value());
        }
    }

    /// Last event taken at `importance`, in the form peers report it.
    pub fn last_taken(&self, importance: Importance) -> EventId {
        self.get(importance).prev()
    }

    /// Number of events at `importance` that were evicted before being
    /// taken, given the tier's oldest retained event.
    pub fn missed(&self, importance: Importance, first_retained: EventId) -> u64 {
        first_retained
            .value()
            .saturating_sub(self.get(importance).value().max(1))
    }

    /// Check if the cursor points before the oldest retained event.
    pub fn is_behind(&self, importance: Importance, first_retained: EventId) -> bool {
        self.missed(importance, first_retained) > 0
    }

    /// Cursors by importance, least important first.
    pub fn iter(&self) -> impl Iterator<Item = (Importance, EventId)> + '_ {
        Importance::ALL.iter().map(move |imp| (*imp, self.get(*imp)))
    }

    /// Non-zero cursors as `(importance, last taken)` pairs.
    pub fn to_observed(&self) -> Vec<(Importance, EventId)> {
        self.iter()
            .filter(|(_, next)| next.value() > 1)
            .map(|(imp, next)| (imp, next.prev()))
            .collect()
    }
}
