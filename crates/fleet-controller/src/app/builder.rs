use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;

use crate::app::Application;
use crate::app::ApplicationServices;
use crate::config::DaemonArgs;
use crate::fleet::FleetRegistry;
use crate::k8s;
use crate::k8s::discovery::InstanceDiscovery;
use crate::k8s::watcher::FleetWatcher;
use crate::k8s::workloads::KubeWorkloads;
use crate::reconcile::FleetReconciler;
use crate::reconcile::ReconciliationQueue;
use crate::shutdown::ShutdownManager;
use crate::store::redis::RedisInstanceStore;
use crate::store::InstanceStore;

/// Application builder
pub struct ApplicationBuilder {
    daemon_args: DaemonArgs,
}

impl ApplicationBuilder {
    /// Create new application builder
    pub fn new(daemon_args: DaemonArgs) -> Self {
        Self { daemon_args }
    }

    /// Build complete application, constructing every service once and
    /// wiring dependencies explicitly.
    pub async fn build(self) -> Result<Application> {
        tracing::info!("Building application components...");

        let client = k8s::build_client(self.daemon_args.kubeconfig.clone())
            .await
            .map_err(|e| anyhow::anyhow!("{e:?}"))
            .context("failed to build Kubernetes client")?;

        let store: Arc<dyn InstanceStore> = Arc::new(
            RedisInstanceStore::connect(&self.daemon_args.store_url)
                .await
                .context("failed to connect to the instance store")?,
        );

        let workloads = Arc::new(KubeWorkloads::new(client.clone()));
        let registry = Arc::new(FleetRegistry::new());
        let queue = Arc::new(ReconciliationQueue::new());
        let shutdown_manager = Arc::new(ShutdownManager::new(Arc::clone(&store)));

        let reconciler = Arc::new(FleetReconciler::new(
            workloads.clone(),
            Arc::clone(&store),
            Arc::clone(&registry),
            Arc::clone(&shutdown_manager),
            self.daemon_args.requeue_interval(),
            self.daemon_args.error_requeue_interval(),
        ));

        let fleet_watcher = Arc::new(FleetWatcher::new(
            client.clone(),
            self.daemon_args.namespace.clone(),
            Arc::clone(&queue),
            Arc::clone(&registry),
        ));
        let discovery = Arc::new(InstanceDiscovery::new(
            client,
            self.daemon_args.namespace.clone(),
            Arc::clone(&store),
            Arc::clone(&registry),
        ));

        let services = ApplicationServices {
            store,
            workloads,
            registry,
            queue,
            reconciler,
            shutdown_manager,
            fleet_watcher,
            discovery,
        };

        Ok(Application::new(services, self.daemon_args))
    }
}
