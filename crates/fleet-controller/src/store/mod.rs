//! Instance store access
//!
//! The external key-value store is the source of truth for instance state.
//! The controller consumes it through the [`InstanceStore`] trait so the
//! reconciler, scaling executor and shutdown manager never depend on a
//! concrete backend. [`redis::RedisInstanceStore`] is the production
//! implementation; [`memory::MemoryInstanceStore`] backs tests.

pub mod memory;
pub mod redis;

use api_types::Instance;
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),

    #[error("malformed instance record at `{key}`: {message}")]
    MalformedRecord { key: String, message: String },
}

/// Hash key holding one instance record.
pub fn instance_key(uid: &str, fleet: &str) -> String {
    format!("instance:{uid}:{fleet}")
}

/// Hash key holding per-fleet flags (currently only `enabled`).
pub fn fleet_key(fleet: &str) -> String {
    format!("fleet:{fleet}")
}

/// Field on the fleet flag record controlling whether the fleet runs.
pub const ENABLED_FIELD: &str = "enabled";

/// Access to per-instance state records and pub/sub notifications.
///
/// `write_instance` performs an atomic full-record write and enforces the
/// terminal-state guard: once a record holds `STOPPING` or `STOPPED` a
/// write moving it back to an earlier state is rejected. The rejected write
/// returns `Ok(false)` rather than an error so callers can log and move on.
#[async_trait]
pub trait InstanceStore: Send + Sync {
    async fn get_instances(&self, fleet: &str) -> Result<Vec<Instance>, StoreError>;

    async fn get_instance(&self, uid: &str, fleet: &str) -> Result<Option<Instance>, StoreError>;

    /// Returns `true` if the record was written, `false` if the
    /// terminal-state guard rejected it.
    async fn write_instance(&self, instance: &Instance) -> Result<bool, StoreError>;

    async fn remove_instance(&self, uid: &str, fleet: &str) -> Result<(), StoreError>;

    async fn get_flag(&self, key: &str, field: &str) -> Result<Option<String>, StoreError>;

    async fn publish(&self, channel: &str, message: &str) -> Result<(), StoreError>;

    /// Subscribe to a pub/sub channel. Messages arrive on the returned
    /// receiver until the subscription task is dropped.
    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>, StoreError>;
}
