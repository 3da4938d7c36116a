//! Event id counters, volatile or persisted.
//!
//! A persisted counter reserves ids in epochs: the store always holds a value
//! strictly greater than every id handed out, so after a restart the counter
//! resumes above anything vended before, at the cost of skipping the unused
//! rest of the last epoch. The store is written before the id that crosses
//! into a new epoch is returned.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::debug;

/// Default number of ids reserved per store write.
pub const DEFAULT_EPOCH: u64 = 0x100;

/// Errors from persisted counter storage.
#[derive(Debug, Error)]
pub enum CounterError {
    /// The backing store could not be read
    #[error("failed to load counter '{key}': {reason}")]
    Load {
        /// Counter key
        key: String,
        /// Store-specific description
        reason: String,
    },

    /// The backing store could not be written
    #[error("failed to store counter '{key}': {reason}")]
    Store {
        /// Counter key
        key: String,
        /// Store-specific description
        reason: String,
    },

    /// Epoch of zero would never reserve anything
    #[error("counter epoch must be at least 1")]
    ZeroEpoch,
}

/// Durable key/value storage for counter values.
pub trait CounterStore: Send {
    /// Load the stored value for `key`, if any.
    fn load(&self, key: &str) -> Result<Option<u64>, CounterError>;

    /// Durably store `value` under `key`.
    fn store(&mut self, key: &str, value: u64) -> Result<(), CounterError>;
}

/// In-memory store. Clones share the same map, which lets tests "restart"
/// a counter against the state a previous instance left behind.
#[derive(Debug, Clone, Default)]
pub struct MemoryCounterStore {
    values: Arc<Mutex<HashMap<String, u64>>>,
}

impl MemoryCounterStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current stored value for `key`.
    pub fn get(&self, key: &str) -> Option<u64> {
        self.values.lock().ok()?.get(key).copied()
    }
}

impl CounterStore for MemoryCounterStore {
    fn load(&self, key: &str) -> Result<Option<u64>, CounterError> {
        let values = self.values.lock().map_err(|e| CounterError::Load {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        Ok(values.get(key).copied())
    }

    fn store(&mut self, key: &str, value: u64) -> Result<(), CounterError> {
        let mut values = self.values.lock().map_err(|e| CounterError::Store {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        values.insert(key.to_string(), value);
        Ok(())
    }
}

enum Backing {
    Volatile,
    Persisted {
        store: Box<dyn CounterStore>,
        key: String,
        epoch: u64,
        reserved_until: u64,
    },
}

/// Monotonic id source for one tier.
pub struct EventCounter {
    last: u64,
    backing: Backing,
}

impl EventCounter {
    /// Counter that lives only in memory; the first id is `last + 1`.
    pub fn volatile(last: u64) -> Self {
        Self {
            last,
            backing: Backing::Volatile,
        }
    }

    /// Counter backed by `store` under `key`, reserving `epoch` ids per write.
    ///
    /// Opening reserves a fresh epoch immediately, so the counter never
    /// vends an id the store does not cover.
    pub fn persisted(
        mut store: Box<dyn CounterStore>,
        key: impl Into<String>,
        epoch: u64,
    ) -> Result<Self, CounterError> {
        if epoch == 0 {
            return Err(CounterError::ZeroEpoch);
        }
        let key = key.into();
        let last = store.load(&key)?.unwrap_or(0);
        let reserved_until = last.saturating_add(epoch);
        store.store(&key, reserved_until)?;
        debug!(key = %key, last, reserved_until, "opened persisted counter");

        Ok(Self {
            last,
            backing: Backing::Persisted {
                store,
                key,
                epoch,
                reserved_until,
            },
        })
    }

    /// Last id handed out (0 if none).
    pub fn last(&self) -> u64 {
        self.last
    }

    /// The id the next [`advance`](Self::advance) will return.
    pub fn peek_next(&self) -> u64 {
        self.last.saturating_add(1)
    }

    /// Hand out the next id, persisting a new epoch first if needed.
    pub fn advance(&mut self) -> Result<u64, CounterError> {
        let next = self.peek_next();
        if let Backing::Persisted {
            store,
            key,
            epoch,
            reserved_until,
        } = &mut self.backing
        {
            if next >= *reserved_until {
                let until = next.saturating_add(*epoch);
                store.store(key, until)?;
                *reserved_until = until;
            }
        }
        self.last = next;
        Ok(next)
    }

    /// Check if the counter is backed by durable storage.
    pub fn is_persisted(&self) -> bool {
        matches!(self.backing, Backing::Persisted { .. })
    }
}

impl std::fmt::Debug for EventCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventCounter")
            .field("last", &self.last)
            .field("persisted", &self.is_persisted())
            .finish()
    }
}
