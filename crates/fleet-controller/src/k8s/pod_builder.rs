//! Instance pod assembly
//!
//! Builds the workload pod for one fleet instance from the fleet spec.
//! Pods are created directly (never through a Deployment) so the
//! controller keeps absolute control over which instance is removed, and
//! carry an owner reference so the orchestrator garbage-collects them when
//! the fleet resource goes away.

use std::collections::BTreeMap;

use error_stack::Report;
use k8s_openapi::api::core::v1::ConfigMapVolumeSource;
use k8s_openapi::api::core::v1::Container;
use k8s_openapi::api::core::v1::ContainerPort;
use k8s_openapi::api::core::v1::EnvVar;
use k8s_openapi::api::core::v1::PersistentVolumeClaimVolumeSource;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::core::v1::PodSpec;
use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::api::core::v1::Volume;
use k8s_openapi::api::core::v1::VolumeMount;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::Resource;
use uuid::Uuid;

use crate::fleet::DeploymentType;

use super::fleet::Fleet;
use super::types::KubernetesError;
use super::DEPLOYMENT_TYPE_LABEL;
use super::DISCOVERY_LABEL;
use super::FLEET_LABEL;

/// Build the pod for a new instance of `fleet`.
pub fn build_instance_pod(fleet: &Fleet) -> Result<Pod, Report<KubernetesError>> {
    let name = fleet.metadata.name.clone().ok_or_else(|| {
        Report::new(KubernetesError::InvalidResource {
            message: "fleet resource has no name".to_string(),
        })
    })?;
    let namespace = fleet
        .metadata
        .namespace
        .clone()
        .unwrap_or_else(|| "default".to_string());
    let uid = fleet.metadata.uid.clone().ok_or_else(|| {
        Report::new(KubernetesError::InvalidResource {
            message: format!("fleet {name} has no uid; cannot set owner reference"),
        })
    })?;
    let deployment_type = DeploymentType::parse(&fleet.spec.deployment_type).map_err(|e| {
        Report::new(KubernetesError::InvalidResource {
            message: e.to_string(),
        })
    })?;

    let pod_name = format!("{name}-{}", random_suffix());

    let mut labels = BTreeMap::new();
    labels.insert(FLEET_LABEL.to_string(), name.clone());
    labels.insert(DISCOVERY_LABEL.to_string(), "true".to_string());
    labels.insert(
        DEPLOYMENT_TYPE_LABEL.to_string(),
        fleet.spec.deployment_type.to_lowercase(),
    );

    let owner = OwnerReference {
        api_version: Fleet::api_version(&()).to_string(),
        kind: Fleet::kind(&()).to_string(),
        name: name.clone(),
        uid,
        controller: Some(true),
        block_owner_deletion: Some(true),
    };

    let container = Container {
        name: "server".to_string(),
        image: Some(fleet.spec.image.clone()),
        command: fleet.spec.command.clone(),
        env: build_env(fleet),
        resources: build_resources(fleet),
        ports: build_ports(fleet),
        volume_mounts: Some(build_volume_mounts(fleet)),
        ..Default::default()
    };

    let pod_spec = PodSpec {
        containers: vec![container],
        volumes: Some(build_volumes(fleet, &name, deployment_type)),
        restart_policy: Some("Never".to_string()),
        service_account_name: fleet
            .spec
            .service_account_name
            .clone()
            .filter(|sa| !sa.is_empty()),
        ..Default::default()
    };

    Ok(Pod {
        metadata: ObjectMeta {
            name: Some(pod_name),
            namespace: Some(namespace),
            labels: Some(labels),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: Some(pod_spec),
        status: None,
    })
}

fn random_suffix() -> String {
    Uuid::new_v4().simple().to_string()[..5].to_string()
}

fn build_env(fleet: &Fleet) -> Option<Vec<EnvVar>> {
    fleet.spec.env.as_ref().map(|env| {
        env.iter()
            .map(|(name, value)| EnvVar {
                name: name.clone(),
                value: Some(value.clone()),
                value_from: None,
            })
            .collect()
    })
}

fn build_resources(fleet: &Fleet) -> Option<ResourceRequirements> {
    let quantities = |map: &BTreeMap<String, String>| {
        map.iter()
            .map(|(k, v)| (k.clone(), Quantity(v.clone())))
            .collect::<BTreeMap<_, _>>()
    };
    fleet.spec.resources.as_ref().map(|spec| ResourceRequirements {
        requests: spec.requests.as_ref().map(quantities),
        limits: spec.limits.as_ref().map(quantities),
        ..Default::default()
    })
}

fn build_ports(fleet: &Fleet) -> Option<Vec<ContainerPort>> {
    let mut ports = Vec::new();
    if let Some(port) = fleet.spec.port {
        ports.push(ContainerPort {
            name: Some("game".to_string()),
            container_port: port,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        });
    }
    if let Some(additional) = &fleet.spec.additional_ports {
        for extra in additional {
            ports.push(ContainerPort {
                name: Some(extra.name.clone()),
                container_port: extra.port,
                protocol: Some(extra.protocol.clone().unwrap_or_else(|| "TCP".to_string())),
                ..Default::default()
            });
        }
    }
    if ports.is_empty() {
        None
    } else {
        Some(ports)
    }
}

fn build_volume_mounts(fleet: &Fleet) -> Vec<VolumeMount> {
    let mut mounts = Vec::new();
    if let Some(mount_path) = fleet
        .spec
        .volume
        .as_ref()
        .and_then(|v| v.mount_path.clone())
    {
        mounts.push(VolumeMount {
            name: "data".to_string(),
            mount_path,
            ..Default::default()
        });
    }
    mounts.push(VolumeMount {
        name: "entrypoint".to_string(),
        mount_path: "/entrypoint".to_string(),
        ..Default::default()
    });
    mounts
}

fn build_volumes(fleet: &Fleet, name: &str, deployment_type: DeploymentType) -> Vec<Volume> {
    let mut volumes = Vec::new();
    if fleet.spec.volume.is_some() {
        if let Some(claim_name) = pvc_name(name, deployment_type) {
            volumes.push(Volume {
                name: "data".to_string(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name,
                    read_only: None,
                }),
                ..Default::default()
            });
        }
    }
    volumes.push(Volume {
        name: "entrypoint".to_string(),
        config_map: Some(ConfigMapVolumeSource {
            name: Some(format!("{name}-entrypoint")),
            default_mode: Some(0o755),
            ..Default::default()
        }),
        ..Default::default()
    });
    volumes
}

fn pvc_name(name: &str, deployment_type: DeploymentType) -> Option<String> {
    match deployment_type {
        DeploymentType::Scalable => Some(format!("fleet-scalable-{name}")),
        DeploymentType::Persistent => Some(format!("fleet-persistent-{name}")),
        DeploymentType::Proxy => Some("fleet-proxy".to_string()),
        DeploymentType::Process => None,
    }
}

#[cfg(test)]
mod tests {
    use crate::k8s::fleet::FleetSpec;
    use crate::k8s::fleet::VolumeSpec;

    use super::*;

    fn fleet() -> Fleet {
        let mut fleet = Fleet::new(
            "lobby",
            FleetSpec {
                deployment_type: "scalable".to_string(),
                image: "ghcr.io/example/lobby:1.4".to_string(),
                port: Some(25565),
                ..Default::default()
            },
        );
        fleet.metadata.namespace = Some("games".to_string());
        fleet.metadata.uid = Some("fleet-uid-1".to_string());
        fleet
    }

    #[test]
    fn pod_carries_labels_and_owner_reference() {
        let pod = build_instance_pod(&fleet()).unwrap();
        let labels = pod.metadata.labels.unwrap();
        assert_eq!(labels.get(FLEET_LABEL).unwrap(), "lobby");
        assert_eq!(labels.get(DISCOVERY_LABEL).unwrap(), "true");
        assert_eq!(labels.get(DEPLOYMENT_TYPE_LABEL).unwrap(), "scalable");

        let owner = &pod.metadata.owner_references.unwrap()[0];
        assert_eq!(owner.kind, "Fleet");
        assert_eq!(owner.name, "lobby");
        assert_eq!(owner.controller, Some(true));

        assert!(pod.metadata.name.unwrap().starts_with("lobby-"));
    }

    #[test]
    fn volume_spec_mounts_the_fleet_claim() {
        let mut resource = fleet();
        resource.spec.volume = Some(VolumeSpec {
            mount_path: Some("/world".to_string()),
            storage_class: None,
            size: None,
        });
        let pod = build_instance_pod(&resource).unwrap();
        let spec = pod.spec.unwrap();
        let volumes = spec.volumes.unwrap();
        let data = volumes.iter().find(|v| v.name == "data").unwrap();
        assert_eq!(
            data.persistent_volume_claim.as_ref().unwrap().claim_name,
            "fleet-scalable-lobby"
        );
        let mounts = spec.containers[0].volume_mounts.as_ref().unwrap();
        assert!(mounts.iter().any(|m| m.mount_path == "/world"));
    }

    #[test]
    fn fleet_without_uid_is_rejected() {
        let mut resource = fleet();
        resource.metadata.uid = None;
        assert!(build_instance_pod(&resource).is_err());
    }

    #[test]
    fn process_fleet_gets_no_data_volume() {
        let mut resource = fleet();
        resource.spec.deployment_type = "process".to_string();
        resource.spec.volume = Some(VolumeSpec {
            mount_path: Some("/scratch".to_string()),
            storage_class: None,
            size: None,
        });
        let pod = build_instance_pod(&resource).unwrap();
        let volumes = pod.spec.unwrap().volumes.unwrap();
        assert!(volumes.iter().all(|v| v.name != "data"));
    }
}
