//! Identity and ordering types for WDM.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::WdmError;

/// Importance of an event, ordered from least to most important.
///
/// Importance decides which tier buffer an event is logged into and how long
/// it survives: evicted events are promoted towards more important tiers and
/// only the most important tier ever drops data.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Importance {
    /// Developer diagnostics.
    #[default]
    Debug = 0,
    /// Informational events useful in the field.
    Info = 1,
    /// Events required to operate the product.
    Production = 2,
    /// Events that must survive as long as possible.
    ProductionCritical = 3,
}

impl Importance {
    /// Number of importance levels.
    pub const COUNT: usize = 4;

    /// All importance levels, least important first.
    pub const ALL: [Importance; Importance::COUNT] = [
        Importance::Debug,
        Importance::Info,
        Importance::Production,
        Importance::ProductionCritical,
    ];

    /// Position of this importance in [`Importance::ALL`].
    pub fn index(self) -> usize {
        self as usize
    }

    /// The next more important level, if any.
    pub fn more_important(self) -> Option<Importance> {
        Self::ALL.get(self.index() + 1).copied()
    }

    /// Canonical lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            Importance::Debug => "debug",
            Importance::Info => "info",
            Importance::Production => "production",
            Importance::ProductionCritical => "production_critical",
        }
    }
}

impl TryFrom<u8> for Importance {
    type Error = WdmError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::ALL
            .get(value as usize)
            .copied()
            .ok_or(WdmError::InvalidImportance(value))
    }
}

impl fmt::Display for Importance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifier of an event within its importance.
///
/// Event ids are vended by the tier buffer of the event's importance and are
/// strictly increasing. `EventId(0)` means "no event".
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct EventId(u64);

impl EventId {
    /// Create an EventId with the given value.
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the numeric value of this EventId.
    pub fn value(&self) -> u64 {
        self.0
    }

    /// The "no event" id.
    pub fn zero() -> Self {
        Self(0)
    }

    /// Check whether this is the "no event" id.
    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// The following id.
    pub fn next(&self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// The preceding id, saturating at zero.
    pub fn prev(&self) -> Self {
        Self(self.0.saturating_sub(1))
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventId({})", self.0)
    }
}

/// A 64-bit node identifier (device, phone, or collector service).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct NodeId(u64);

impl NodeId {
    /// Create a NodeId from its numeric value.
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the numeric value of this NodeId.
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016X}", self.0)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({:016X})", self.0)
    }
}

/// Publisher-assigned identifier of a subscription.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    /// Create a new random SubscriptionId.
    pub fn random() -> Self {
        let mut bytes = [0u8; 8];
        getrandom::getrandom(&mut bytes).expect("getrandom failed");
        Self(u64::from_le_bytes(bytes))
    }

    /// Create a SubscriptionId from its numeric value.
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the numeric value of this SubscriptionId.
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl fmt::Debug for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubscriptionId({:016x})", self.0)
    }
}

/// Identifier of one request/response exchange.
///
/// Responses carry the exchange id of the request they answer, which is how
/// late responses for an abandoned exchange are recognised and dropped.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct ExchangeId(u32);

impl ExchangeId {
    /// Create an ExchangeId with the given value.
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    /// Get the numeric value of this ExchangeId.
    pub fn value(&self) -> u32 {
        self.0
    }

    /// The following id, wrapping around.
    pub fn next(&self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ExchangeId({})", self.0)
    }
}
