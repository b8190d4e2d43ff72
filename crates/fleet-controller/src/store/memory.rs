//! In-memory instance store
//!
//! A `DashMap`-backed implementation of [`InstanceStore`] with
//! `tokio::sync::broadcast` standing in for the store's pub/sub. It
//! enforces the same terminal-state write guard as the production backend
//! and is the store used throughout the test suites.

use std::collections::HashMap;

use api_types::Instance;
use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tracing::debug;

use super::instance_key;
use super::InstanceStore;
use super::StoreError;

const CHANNEL_CAPACITY: usize = 64;

#[derive(Default)]
pub struct MemoryInstanceStore {
    records: DashMap<String, Instance>,
    flags: DashMap<String, HashMap<String, String>>,
    channels: DashMap<String, broadcast::Sender<String>>,
}

impl MemoryInstanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a flag field directly; the production store has this done by
    /// external tooling.
    pub fn set_flag(&self, key: &str, field: &str, value: &str) {
        self.flags
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl InstanceStore for MemoryInstanceStore {
    async fn get_instances(&self, fleet: &str) -> Result<Vec<Instance>, StoreError> {
        Ok(self
            .records
            .iter()
            .filter(|entry| entry.value().fleet == fleet)
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn get_instance(&self, uid: &str, fleet: &str) -> Result<Option<Instance>, StoreError> {
        Ok(self
            .records
            .get(&instance_key(uid, fleet))
            .map(|entry| entry.value().clone()))
    }

    async fn write_instance(&self, instance: &Instance) -> Result<bool, StoreError> {
        let key = instance_key(&instance.uid, &instance.fleet);
        match self.records.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                let current = occupied.get().state;
                if !current.allows_transition_to(instance.state) {
                    debug!(
                        uid = %instance.uid,
                        current = %current,
                        attempted = %instance.state,
                        "rejected downgrade of terminal instance state"
                    );
                    return Ok(false);
                }
                occupied.insert(instance.clone());
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(instance.clone());
            }
        }
        Ok(true)
    }

    async fn remove_instance(&self, uid: &str, fleet: &str) -> Result<(), StoreError> {
        self.records.remove(&instance_key(uid, fleet));
        Ok(())
    }

    async fn get_flag(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .flags
            .get(key)
            .and_then(|fields| fields.get(field).cloned()))
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<(), StoreError> {
        // A send error only means nobody is subscribed yet.
        let _ = self.sender(channel).send(message.to_string());
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>, StoreError> {
        let mut source = self.sender(channel).subscribe();
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(message) => {
                        if tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "in-memory subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(rx)
    }
}
