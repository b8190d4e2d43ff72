//! Workload API
//!
//! The narrow interface the reconciler uses to talk to the orchestrator:
//! fetch the fleet resource, create or delete instance pods, and count the
//! live pods a fleet owns. [`KubeWorkloads`] is the production
//! implementation; tests inject a mock.

use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::DeleteParams;
use kube::api::ListParams;
use kube::api::PostParams;
use kube::Api;
use kube::Client;
use tracing::info;

use super::fleet::Fleet;
use super::pod_builder::build_instance_pod;
use super::types::KubernetesError;
use super::FLEET_LABEL;

#[async_trait]
pub trait WorkloadApi: Send + Sync {
    async fn get_fleet(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Fleet>, Report<KubernetesError>>;

    /// Create one instance pod for the fleet and return its name.
    async fn create_instance_pod(&self, fleet: &Fleet)
        -> Result<String, Report<KubernetesError>>;

    async fn delete_pod(
        &self,
        namespace: &str,
        pod_name: &str,
    ) -> Result<(), Report<KubernetesError>>;

    /// Count pods owned by the fleet that are not already terminating or
    /// finished.
    async fn count_live_pods(
        &self,
        namespace: &str,
        fleet_name: &str,
    ) -> Result<u32, Report<KubernetesError>>;
}

pub struct KubeWorkloads {
    client: Client,
}

impl KubeWorkloads {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl WorkloadApi for KubeWorkloads {
    async fn get_fleet(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Fleet>, Report<KubernetesError>> {
        let api: Api<Fleet> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name)
            .await
            .change_context(KubernetesError::ApiFailure {
                message: format!("failed to fetch fleet {namespace}/{name}"),
            })
    }

    async fn create_instance_pod(
        &self,
        fleet: &Fleet,
    ) -> Result<String, Report<KubernetesError>> {
        let namespace = fleet
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string());
        let pod = build_instance_pod(fleet)?;
        let pod_name = pod.metadata.name.clone().unwrap_or_default();
        self.pods(&namespace)
            .create(&PostParams::default(), &pod)
            .await
            .change_context(KubernetesError::ApiFailure {
                message: format!("failed to create pod {namespace}/{pod_name}"),
            })?;
        info!(pod = %pod_name, namespace = %namespace, "created instance pod");
        Ok(pod_name)
    }

    async fn delete_pod(
        &self,
        namespace: &str,
        pod_name: &str,
    ) -> Result<(), Report<KubernetesError>> {
        self.pods(namespace)
            .delete(pod_name, &DeleteParams::default())
            .await
            .change_context(KubernetesError::ApiFailure {
                message: format!("failed to delete pod {namespace}/{pod_name}"),
            })?;
        info!(pod = %pod_name, namespace = %namespace, "deleted instance pod");
        Ok(())
    }

    async fn count_live_pods(
        &self,
        namespace: &str,
        fleet_name: &str,
    ) -> Result<u32, Report<KubernetesError>> {
        let params = ListParams::default().labels(&format!("{FLEET_LABEL}={fleet_name}"));
        let pods = self
            .pods(namespace)
            .list(&params)
            .await
            .change_context(KubernetesError::ApiFailure {
                message: format!("failed to list pods for fleet {namespace}/{fleet_name}"),
            })?;
        let live = pods
            .items
            .iter()
            .filter(|pod| pod.metadata.deletion_timestamp.is_none())
            .filter(|pod| {
                let phase = pod
                    .status
                    .as_ref()
                    .and_then(|status| status.phase.as_deref());
                !matches!(phase, Some("Succeeded") | Some("Failed"))
            })
            .count();
        Ok(live as u32)
    }
}
