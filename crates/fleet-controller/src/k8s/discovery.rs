//! Instance discovery
//!
//! Watches pods carrying the discovery label and maintains the per-instance
//! records in the store: a record is created once the pod is IP-addressable
//! and running, and removed when the backing pod is deleted or finished.
//! The store's terminal-state guard keeps a re-observed pod from
//! resurrecting a record that already reached STOPPING.

use std::sync::Arc;
use std::time::Duration;

use api_types::Instance;
use api_types::InstanceState;
use error_stack::Report;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::watcher;
use kube::runtime::watcher::Event;
use kube::Api;
use kube::Client;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::fleet::DeploymentType;
use crate::fleet::FleetRegistry;
use crate::store::InstanceStore;

use super::types::KubernetesError;
use super::DEPLOYMENT_TYPE_LABEL;
use super::DISCOVERY_LABEL;
use super::FLEET_LABEL;

pub struct InstanceDiscovery {
    client: Client,
    namespace: Option<String>,
    store: Arc<dyn InstanceStore>,
    registry: Arc<FleetRegistry>,
}

impl InstanceDiscovery {
    pub fn new(
        client: Client,
        namespace: Option<String>,
        store: Arc<dyn InstanceStore>,
        registry: Arc<FleetRegistry>,
    ) -> Self {
        Self {
            client,
            namespace,
            store,
            registry,
        }
    }

    #[tracing::instrument(skip(self, cancel), fields(namespace = ?self.namespace))]
    pub async fn run(&self, cancel: CancellationToken) {
        info!("starting instance discovery");
        loop {
            select! {
                _ = cancel.cancelled() => {
                    info!("instance discovery cancelled");
                    break;
                }
                result = self.watch_pods() => {
                    match result {
                        Ok(()) => warn!("pod watch stream ended unexpectedly, restarting"),
                        Err(e) => {
                            error!("pod watch failed: {e:?}");
                            tokio::time::sleep(Duration::from_secs(5)).await;
                        }
                    }
                }
            }
        }
    }

    async fn watch_pods(&self) -> Result<(), Report<KubernetesError>> {
        let api: Api<Pod> = match &self.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };
        let config = watcher::Config::default().labels(&format!("{DISCOVERY_LABEL}=true"));

        let mut stream = watcher(api, config).boxed();
        while let Some(event) = stream.next().await {
            match event {
                Ok(Event::Applied(pod)) => self.handle_pod_applied(pod).await,
                Ok(Event::Deleted(pod)) => self.handle_pod_deleted(pod).await,
                Ok(Event::Restarted(pods)) => {
                    for pod in pods {
                        self.handle_pod_applied(pod).await;
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

    async fn handle_pod_applied(&self, pod: Pod) {
        let Some(identity) = PodIdentity::from_pod(&pod) else {
            return;
        };

        if pod.metadata.deletion_timestamp.is_some() {
            self.remove_record(&identity).await;
            return;
        }

        let status = pod.status.as_ref();
        let phase = status.and_then(|s| s.phase.as_deref());
        match phase {
            Some("Succeeded") | Some("Failed") => {
                self.remove_record(&identity).await;
                return;
            }
            Some("Running") => {}
            _ => return,
        }
        let Some(ip) = status.and_then(|s| s.pod_ip.clone()) else {
            // Not IP-addressable yet.
            return;
        };

        let deployment_type = match DeploymentType::parse(&identity.type_label) {
            Ok(deployment_type) => deployment_type,
            Err(e) => {
                warn!(pod = %identity.pod_name, error = %e, "ignoring pod with invalid type label");
                return;
            }
        };

        match self.store.get_instance(&identity.uid, &identity.fleet).await {
            Ok(Some(_)) => return,
            Ok(None) => {}
            Err(e) => {
                warn!(pod = %identity.pod_name, error = %e, "instance lookup failed");
                return;
            }
        }

        let short_uid = &identity.uid[..identity.uid.len().min(5)];
        let mut instance = Instance::new(
            identity.uid.clone(),
            format!("{}-{short_uid}", identity.fleet),
            identity.pod_name.clone(),
            ip,
            identity.fleet.clone(),
            deployment_type.instance_kind(),
        );
        instance.state = match self.registry.get(&identity.fleet) {
            Some(wrapper) if wrapper.require_startup_confirmation() => InstanceState::Starting,
            _ => InstanceState::Running,
        };
        instance.created_at_ms = pod
            .metadata
            .creation_timestamp
            .as_ref()
            .map(|time| time.0.timestamp_millis().max(0) as u64)
            .unwrap_or(0);

        match self.store.write_instance(&instance).await {
            Ok(true) => info!(
                instance = %instance.name,
                uid = %instance.uid,
                fleet = %instance.fleet,
                state = %instance.state,
                "discovered instance"
            ),
            Ok(false) => {
                // A terminal record for this uid still exists; leave it.
            }
            Err(e) => warn!(pod = %identity.pod_name, error = %e, "instance registration failed"),
        }
    }

    async fn handle_pod_deleted(&self, pod: Pod) {
        let Some(identity) = PodIdentity::from_pod(&pod) else {
            return;
        };
        self.remove_record(&identity).await;
    }

    async fn remove_record(&self, identity: &PodIdentity) {
        match self
            .store
            .remove_instance(&identity.uid, &identity.fleet)
            .await
        {
            Ok(()) => info!(
                pod = %identity.pod_name,
                uid = %identity.uid,
                fleet = %identity.fleet,
                "removed instance record"
            ),
            Err(e) => warn!(pod = %identity.pod_name, error = %e, "instance removal failed"),
        }
    }
}

/// The labels and metadata that make a pod a fleet instance.
struct PodIdentity {
    uid: String,
    pod_name: String,
    fleet: String,
    type_label: String,
}

impl PodIdentity {
    fn from_pod(pod: &Pod) -> Option<Self> {
        let labels = pod.metadata.labels.as_ref()?;
        if labels.get(DISCOVERY_LABEL).map(String::as_str) != Some("true") {
            return None;
        }
        Some(Self {
            uid: pod.metadata.uid.clone()?,
            pod_name: pod.metadata.name.clone()?,
            fleet: labels.get(FLEET_LABEL)?.clone(),
            type_label: labels.get(DEPLOYMENT_TYPE_LABEL)?.clone(),
        })
    }
}
