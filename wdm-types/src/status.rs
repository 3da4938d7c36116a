//! Status reports and the profile/status code pairs they carry.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Common profile: generic success and failure codes.
pub const PROFILE_COMMON: u32 = 0x0000_0000;
/// Bulk data transfer profile.
pub const PROFILE_BDX: u32 = 0x0000_0008;
/// Data management (subscribe/notify) profile.
pub const PROFILE_WDM: u32 = 0x0000_000B;

/// Operation completed.
pub const COMMON_SUCCESS: u16 = 0x0000;
/// Request was malformed.
pub const COMMON_BAD_REQUEST: u16 = 0x0010;
/// Message type not supported in the current state.
pub const COMMON_UNSUPPORTED_MESSAGE: u16 = 0x0011;
/// Responder is out of resources.
pub const COMMON_OUT_OF_MEMORY: u16 = 0x0013;
/// Responder is busy; retry later.
pub const COMMON_BUSY: u16 = 0x0014;
/// Internal failure on the responder.
pub const COMMON_INTERNAL_ERROR: u16 = 0x0050;

/// Subscription was canceled by one of the parties.
pub const WDM_SUBSCRIPTION_CANCELED: u16 = 0x0011;
/// Subscription liveness timer expired.
pub const WDM_SUBSCRIPTION_TIMEOUT: u16 = 0x0012;
/// Requested trait path is unknown.
pub const WDM_INVALID_PATH: u16 = 0x0013;
/// Requested schema version range is not supported.
pub const WDM_UNSUPPORTED_VERSION: u16 = 0x0014;
/// Subscription pool is exhausted.
pub const WDM_OUT_OF_RESOURCES: u16 = 0x0015;
/// Unknown subscription id.
pub const WDM_INVALID_SUBSCRIPTION: u16 = 0x0016;

/// Transfer rejected: collector refuses the upload.
pub const BDX_TRANSFER_REJECTED: u16 = 0x0020;
/// Block counter out of sequence.
pub const BDX_BAD_BLOCK_COUNTER: u16 = 0x0021;
/// Transfer aborted by the sender.
pub const BDX_TRANSFER_ABORTED: u16 = 0x0022;
/// Generic transfer failure.
pub const BDX_TRANSFER_FAILED: u16 = 0x001F;

/// A profile + status code pair, as sent in StatusReport messages.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StatusReport {
    /// Profile that defines `status_code`.
    pub profile_id: u32,
    /// Status code within the profile.
    pub status_code: u16,
}

impl StatusReport {
    /// Create a status report.
    pub fn new(profile_id: u32, status_code: u16) -> Self {
        Self {
            profile_id,
            status_code,
        }
    }

    /// The common success report.
    pub fn success() -> Self {
        Self::new(PROFILE_COMMON, COMMON_SUCCESS)
    }

    /// Check if this report signals success.
    pub fn is_success(&self) -> bool {
        self.profile_id == PROFILE_COMMON && self.status_code == COMMON_SUCCESS
    }
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08X}:{:04X}", self.profile_id, self.status_code)
    }
}

impl fmt::Debug for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StatusReport({})", self)
    }
}
