//! Kubernetes integration
//!
//! The fleet resource is a CRD; a watcher feeds resource changes into the
//! reconciliation queue, a second watcher discovers instance pods, and the
//! [`workloads::WorkloadApi`] trait is the narrow seam through which the
//! reconciler creates and deletes instance workloads.

pub mod discovery;
pub mod fleet;
#[cfg(test)]
pub mod mock;
pub mod pod_builder;
pub mod types;
pub mod watcher;
pub mod workloads;

use std::path::PathBuf;

use error_stack::Report;
use error_stack::ResultExt;
use kube::config::KubeConfigOptions;
use kube::config::Kubeconfig;
use kube::Client;

use types::KubernetesError;

/// Pods carrying this label are discovered as fleet instances.
pub const DISCOVERY_LABEL: &str = "gamefleet.io/enable-discovery";
/// Label carrying the fleet's deployment type on instance pods.
pub const DEPLOYMENT_TYPE_LABEL: &str = "gamefleet.io/deployment-type";
/// Label tying an instance pod back to its fleet.
pub const FLEET_LABEL: &str = "app";

/// Build a Kubernetes client from an explicit kubeconfig path, or fall
/// back to in-cluster / `~/.kube/config` configuration.
pub async fn build_client(
    kubeconfig: Option<PathBuf>,
) -> Result<Client, Report<KubernetesError>> {
    match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(&path).change_context(
                KubernetesError::ConnectionFailed {
                    message: format!("Failed to read kubeconfig file: {}", path.display()),
                },
            )?;
            let config =
                kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await
                    .change_context(KubernetesError::ConnectionFailed {
                        message: format!(
                            "Failed to create config from kubeconfig: {}",
                            path.display()
                        ),
                    })?;
            Client::try_from(config).change_context(KubernetesError::ConnectionFailed {
                message: "Failed to create Kubernetes client from custom kubeconfig".to_string(),
            })
        }
        None => Client::try_default()
            .await
            .change_context(KubernetesError::ConnectionFailed {
                message: "Failed to create Kubernetes client".to_string(),
            }),
    }
}
