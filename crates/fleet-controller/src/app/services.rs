use std::sync::Arc;

use crate::fleet::FleetRegistry;
use crate::k8s::discovery::InstanceDiscovery;
use crate::k8s::watcher::FleetWatcher;
use crate::k8s::workloads::WorkloadApi;
use crate::reconcile::FleetReconciler;
use crate::reconcile::ReconciliationQueue;
use crate::shutdown::ShutdownManager;
use crate::store::InstanceStore;

/// Application dependencies - simple struct with Arc-wrapped services
pub struct ApplicationServices {
    pub store: Arc<dyn InstanceStore>,
    pub workloads: Arc<dyn WorkloadApi>,
    pub registry: Arc<FleetRegistry>,
    pub queue: Arc<ReconciliationQueue>,
    pub reconciler: Arc<FleetReconciler>,
    pub shutdown_manager: Arc<ShutdownManager>,
    pub fleet_watcher: Arc<FleetWatcher>,
    pub discovery: Arc<InstanceDiscovery>,
}
