//! # wdm-client
//!
//! Device runtime for the WDM event log.
//!
//! `wdm-core` holds the pure state machines; this crate executes their
//! actions: it routes envelopes, fires timers, persists counters and talks to
//! peers through a [`Transport`].
//!
//! - [`SubscriptionEngine`]: pool of subscription handlers with
//!   reentrancy-safe application callbacks
//! - [`BulkOffloadClient`]: uploads the event log to a collector over BDX,
//!   resuming without gaps or duplicates
//! - [`WdmNode`]: owns both plus the log and the timers; the one work queue
//!   of a device
//!
//! ## Example
//!
//! ```ignore
//! use wdm_client::{Config, MockTransport, WdmNode};
//!
//! let config = Config::from_file("wdm.toml".as_ref())?;
//! let mut node = WdmNode::from_config(&config)?;
//! node.log_payload(&schema, &LogOptions::new(), &reading)?;
//!
//! let transport = MockTransport::new();
//! let outcome = node.upload(&transport, collector).await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod catalog;
pub mod config;
pub mod engine;
pub mod error;
pub mod node;
pub mod offload;
pub mod store;
pub mod transport;

pub use catalog::TraitCatalog;
pub use config::{Config, ConfigError};
pub use engine::{AutoAccept, EngineSettings, SubscriptionDelegate, SubscriptionEngine};
pub use error::ClientError;
pub use node::WdmNode;
pub use offload::{BulkOffloadClient, OffloadOutcome, OffloadSettings};
pub use store::FileCounterStore;
pub use transport::{MockTransport, Transport, TransportError, MAX_MESSAGE_SIZE};

use tracing_subscriber::EnvFilter;

/// Install a fmt subscriber filtered by `RUST_LOG` (default `info`).
///
/// Does nothing if a global subscriber is already set.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}
