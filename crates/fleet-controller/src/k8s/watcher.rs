//! Fleet resource watcher
//!
//! Receives fleet resource changes from the orchestrator and enqueues
//! reconciliation requests. The queue deduplicates, so event bursts for
//! one fleet collapse into a single in-flight request. Reconnects with a
//! backoff pause if the watch stream drops.

use std::sync::Arc;
use std::time::Duration;

use error_stack::Report;
use futures::StreamExt;
use kube::runtime::watcher;
use kube::runtime::watcher::Event;
use kube::Api;
use kube::Client;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::fleet::FleetRegistry;
use crate::reconcile::ReconcileRequest;
use crate::reconcile::ReconciliationQueue;

use super::fleet::Fleet;
use super::types::KubernetesError;

pub struct FleetWatcher {
    client: Client,
    namespace: Option<String>,
    queue: Arc<ReconciliationQueue>,
    registry: Arc<FleetRegistry>,
}

impl FleetWatcher {
    pub fn new(
        client: Client,
        namespace: Option<String>,
        queue: Arc<ReconciliationQueue>,
        registry: Arc<FleetRegistry>,
    ) -> Self {
        Self {
            client,
            namespace,
            queue,
            registry,
        }
    }

    #[tracing::instrument(skip(self, cancel), fields(namespace = ?self.namespace))]
    pub async fn run(&self, cancel: CancellationToken) {
        info!("starting fleet watcher");
        loop {
            select! {
                _ = cancel.cancelled() => {
                    info!("fleet watcher cancelled");
                    break;
                }
                result = self.watch_fleets() => {
                    match result {
                        Ok(()) => warn!("fleet watch stream ended unexpectedly, restarting"),
                        Err(e) => {
                            error!("fleet watch failed: {e:?}");
                            tokio::time::sleep(Duration::from_secs(5)).await;
                        }
                    }
                }
            }
        }
    }

    async fn watch_fleets(&self) -> Result<(), Report<KubernetesError>> {
        let api: Api<Fleet> = match &self.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };

        let mut stream = watcher(api, watcher::Config::default()).boxed();
        while let Some(event) = stream.next().await {
            match event {
                Ok(Event::Applied(fleet)) => {
                    let request = ReconcileRequest::for_fleet(&fleet);
                    info!(fleet = %request.name, "fleet changed");
                    self.queue.enqueue(request);
                }
                Ok(Event::Deleted(fleet)) => {
                    let name = fleet.metadata.name.unwrap_or_default();
                    info!(fleet = %name, "fleet deleted");
                    // Instance pods are garbage-collected via owner
                    // references; only the in-memory wrapper goes here.
                    self.registry.remove(&name);
                }
                Ok(Event::Restarted(fleets)) => {
                    for fleet in fleets {
                        self.queue.enqueue(ReconcileRequest::for_fleet(&fleet));
                    }
                }
                Err(e) => {
                    return Err(Report::new(KubernetesError::WatchFailed {
                        message: format!("watch stream error: {e}"),
                    }));
                }
            }
        }
        Ok(())
    }
}
