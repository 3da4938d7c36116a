//! Allocation of locally initiated exchange ids.

use std::collections::HashSet;

use wdm_types::ExchangeId;

/// Hands out exchange ids for exchanges this node initiates.
///
/// Ids in use are never handed out twice; zero is never used so that a
/// default id cannot be mistaken for a live exchange.
#[derive(Debug, Clone)]
pub struct ExchangeAllocator {
    next: ExchangeId,
    open: HashSet<ExchangeId>,
}

impl ExchangeAllocator {
    /// Create an allocator whose first id is `first` (or 1 if `first` is 0).
    pub fn new(first: u32) -> Self {
        Self {
            next: ExchangeId::new(first),
            open: HashSet::new(),
        }
    }

    /// Open a new exchange.
    pub fn open(&mut self) -> ExchangeId {
        loop {
            let candidate = self.next;
            self.next = self.next.next();
            if candidate.value() != 0 && self.open.insert(candidate) {
                return candidate;
            }
        }
    }

    /// Close an exchange. Returns `false` if it was not open.
    pub fn close(&mut self, id: ExchangeId) -> bool {
        self.open.remove(&id)
    }

    /// Check if an exchange is open.
    pub fn is_open(&self, id: ExchangeId) -> bool {
        self.open.contains(&id)
    }

    /// Number of open exchanges.
    pub fn open_count(&self) -> usize {
        self.open.len()
    }
}

impl Default for ExchangeAllocator {
    fn default() -> Self {
        Self::new(1)
    }
}
