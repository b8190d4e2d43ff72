//! Graceful shutdown negotiation
//!
//! Instead of letting the orchestrator tear pods down, the controller
//! proposes a shutdown to the instance, listens for its answer, and only
//! forces the STOPPING transition once the negotiated window has run out.
//! Pod deletion itself is triggered elsewhere, by observing the STOPPING
//! transition on the state channel.

pub mod manager;

use std::time::Duration;

use thiserror::Error;

use crate::store::StoreError;

pub use manager::ShutdownManager;

/// Delay granted by default when the proposer does not specify one.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(600);
/// Backstop for instances that manage their own shutdown timing.
pub const SELF_MANAGED_SAFETY_TIMEOUT: Duration = Duration::from_secs(1800);
/// An instance that stays silent this long is treated as not running the
/// negotiation protocol and shut down immediately.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);
/// Time between the final-shutdown signal and the forced STOPPING write.
pub const CLEANUP_GRACE_PERIOD: Duration = Duration::from_secs(5);
/// Default cadence of the timeout sweep.
pub const CHECK_INTERVAL: Duration = Duration::from_secs(5);
/// Shorter window used when tearing down a disabled fleet.
pub const FLEET_DISABLED_MAX_DELAY: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum ShutdownError {
    #[error("instance {uid} already has a shutdown negotiation in flight")]
    AlreadyNegotiating { uid: String },

    #[error("instance {uid} is already terminal")]
    InstanceTerminal { uid: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}
