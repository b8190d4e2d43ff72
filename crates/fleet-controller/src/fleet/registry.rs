//! Fleet registry
//!
//! Name-keyed map of fleet wrappers. Lookups return `Arc` handles and
//! listings are snapshots, so iteration never observes concurrent mutation.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

use crate::k8s::fleet::Fleet;

use super::settings::SettingsError;
use super::wrapper::FleetWrapper;

#[derive(Default)]
pub struct FleetRegistry {
    fleets: DashMap<String, Arc<FleetWrapper>>,
}

impl FleetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Arc<FleetWrapper>> {
        self.fleets.get(name).map(|entry| Arc::clone(entry.value()))
    }

    /// Resolve the wrapper for a fleet, constructing and registering it on
    /// first sight. Registration is on-demand so fleets created after the
    /// controller started are picked up by their first reconcile pass.
    pub fn get_or_create(&self, fleet: &Fleet) -> Result<Arc<FleetWrapper>, SettingsError> {
        let name = fleet.metadata.name.clone().unwrap_or_default();
        if let Some(existing) = self.get(&name) {
            return Ok(existing);
        }
        let wrapper = Arc::new(FleetWrapper::from_fleet(fleet)?);
        info!(fleet = %name, kind = %wrapper.kind(), "registered fleet");
        self.fleets.insert(name, Arc::clone(&wrapper));
        Ok(wrapper)
    }

    pub fn remove(&self, name: &str) -> Option<Arc<FleetWrapper>> {
        self.fleets.remove(name).map(|(_, wrapper)| wrapper)
    }

    /// Snapshot of all registered wrappers.
    pub fn list(&self) -> Vec<Arc<FleetWrapper>> {
        self.fleets
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }
}
