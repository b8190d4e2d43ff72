//! The Fleet custom resource
//!
//! A fleet declares the instance workload (image, command, ports, volume)
//! plus the scaling and queuing sub-specs the controller consumes.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;

#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "gamefleet.io",
    version = "v1alpha1",
    kind = "Fleet",
    namespaced,
    plural = "fleets",
    shortname = "flt"
)]
#[serde(rename_all = "camelCase")]
pub struct FleetSpec {
    /// One of `proxy`, `scalable`, `persistent`, `process`.
    pub deployment_type: String,
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
    /// Primary game port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_ports: Option<Vec<AdditionalPort>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<VolumeSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scaling: Option<ScalingSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queuing: Option<QueuingSpec>,
    /// Instances older than this are gracefully recycled, e.g. "2h30m".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_instance_age: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AdditionalPort {
    pub name: String,
    pub port: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScalingSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_players: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_instances: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_instances: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_up_threshold: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_down_threshold: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_up_cooldown: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_down_cooldown: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_up_limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_down_limit: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct QueuingSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_server: Option<String>,
    /// When set, discovered instances start in STARTING until the server
    /// confirms readiness itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub require_startup_confirmation: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_strategy: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_full_spec() {
        let json = r#"{
            "deploymentType": "scalable",
            "image": "ghcr.io/example/lobby:1.4",
            "command": ["/entrypoint/run.sh"],
            "port": 25565,
            "additionalPorts": [{"name": "metrics", "port": 9090, "protocol": "TCP"}],
            "env": {"WORLD": "lobby"},
            "scaling": {
                "strategy": "threshold",
                "minInstances": 2,
                "maxInstances": 8,
                "scaleUpThreshold": 12.5,
                "scaleDownThreshold": 3,
                "scaleUpLimit": 2
            },
            "queuing": {"queueStrategy": "fill", "requireStartupConfirmation": true},
            "maxInstanceAge": "6h"
        }"#;

        let spec: FleetSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.deployment_type, "scalable");
        let scaling = spec.scaling.unwrap();
        assert_eq!(scaling.min_instances, Some(2));
        assert_eq!(scaling.scale_up_threshold, Some(12.5));
        assert_eq!(scaling.scale_down_threshold, Some(3.0));
        assert_eq!(
            spec.queuing.unwrap().require_startup_confirmation,
            Some(true)
        );
        assert_eq!(spec.max_instance_age.as_deref(), Some("6h"));
    }

    #[test]
    fn minimal_spec_has_no_scaling() {
        let json = r#"{"deploymentType": "process", "image": "worker:1"}"#;
        let spec: FleetSpec = serde_json::from_str(json).unwrap();
        assert!(spec.scaling.is_none());
        assert!(spec.queuing.is_none());
    }
}
