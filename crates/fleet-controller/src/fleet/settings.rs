//! Scaling settings and spec field parsing
//!
//! Settings are loaded from the fleet resource spec with the same defaults
//! the system has always shipped. Unknown enum values are errors, not
//! defaults: silently guessing scaling parameters is unsafe, so a fleet
//! with a malformed spec is skipped.

use std::time::Duration;

use thiserror::Error;

use crate::k8s::fleet::ScalingSpec;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SettingsError {
    #[error("unknown deployment type `{0}`")]
    UnknownDeploymentType(String),

    #[error("unknown scale strategy `{0}`")]
    UnknownScaleStrategy(String),

    #[error("unknown queue strategy `{0}`")]
    UnknownQueueStrategy(String),

    #[error("invalid maxInstanceAge `{value}`: {message}")]
    InvalidMaxInstanceAge { value: String, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum DeploymentType {
    #[display("PROXY")]
    Proxy,
    #[display("SCALABLE")]
    Scalable,
    /// Holds a per-fleet volume claim exclusively; replacements cannot
    /// start while a draining holder still owns it.
    #[display("PERSISTENT")]
    Persistent,
    #[display("PROCESS")]
    Process,
}

impl DeploymentType {
    /// The instance kind this deployment type produces. Decided once per
    /// wrapper or discovered pod; never re-inferred at call time.
    pub fn instance_kind(self) -> api_types::InstanceKind {
        match self {
            Self::Proxy | Self::Scalable | Self::Persistent => api_types::InstanceKind::Game,
            Self::Process => api_types::InstanceKind::Generic,
        }
    }

    pub fn parse(value: &str) -> Result<Self, SettingsError> {
        match value.to_ascii_lowercase().as_str() {
            "proxy" => Ok(Self::Proxy),
            "scalable" => Ok(Self::Scalable),
            "persistent" => Ok(Self::Persistent),
            "process" => Ok(Self::Process),
            other => Err(SettingsError::UnknownDeploymentType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScaleStrategy {
    #[default]
    Threshold,
    /// Parsed but never scales; trend analysis is not implemented.
    Trend,
}

impl ScaleStrategy {
    pub fn parse(value: Option<&str>) -> Result<Self, SettingsError> {
        match value {
            None => Ok(Self::Threshold),
            Some(v) => match v.to_ascii_lowercase().as_str() {
                "threshold" => Ok(Self::Threshold),
                "trend" => Ok(Self::Trend),
                other => Err(SettingsError::UnknownScaleStrategy(other.to_string())),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueStrategy {
    Spread,
    #[default]
    Fill,
    DynamicFill,
}

impl QueueStrategy {
    pub fn parse(value: Option<&str>) -> Result<Self, SettingsError> {
        match value {
            None => Ok(Self::Fill),
            Some(v) => match v.to_ascii_lowercase().as_str() {
                "spread" => Ok(Self::Spread),
                "fill" => Ok(Self::Fill),
                "dynamic_fill" => Ok(Self::DynamicFill),
                other => Err(SettingsError::UnknownQueueStrategy(other.to_string())),
            },
        }
    }
}

/// Scaling parameters cached on the fleet wrapper and refreshed whenever
/// the resource is updated.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScalingSettings {
    pub strategy: ScaleStrategy,
    pub max_players: u32,
    pub min_instances: u32,
    pub max_instances: u32,
    /// Occupancy per active instance at or above which the fleet grows.
    pub scale_up_threshold: f64,
    /// Occupancy per running instance strictly below which it shrinks.
    pub scale_down_threshold: f64,
    pub scale_up_cooldown: Duration,
    pub scale_down_cooldown: Duration,
    /// Maximum instances added by one decision.
    pub scale_up_limit: u32,
    /// Maximum instances removed by one decision.
    pub scale_down_limit: u32,
}

impl ScalingSettings {
    /// Parse from the resource's scaling sub-spec. A missing sub-spec
    /// yields the single-instance defaults used by non-scaling fleets.
    pub fn from_spec(spec: Option<&ScalingSpec>) -> Result<Self, SettingsError> {
        let Some(spec) = spec else {
            return Ok(Self {
                strategy: ScaleStrategy::Threshold,
                max_players: 100,
                min_instances: 1,
                max_instances: 1,
                scale_up_threshold: 80.0,
                scale_down_threshold: 20.0,
                scale_up_cooldown: Duration::from_secs(60),
                scale_down_cooldown: Duration::from_secs(60),
                scale_up_limit: 1,
                scale_down_limit: 1,
            });
        };

        Ok(Self {
            strategy: ScaleStrategy::parse(spec.strategy.as_deref())?,
            max_players: spec.max_players.unwrap_or(100),
            min_instances: spec.min_instances.unwrap_or(1),
            max_instances: spec.max_instances.unwrap_or(u32::MAX),
            scale_up_threshold: spec.scale_up_threshold.unwrap_or(80.0),
            scale_down_threshold: spec.scale_down_threshold.unwrap_or(20.0),
            scale_up_cooldown: Duration::from_secs(spec.scale_up_cooldown.unwrap_or(60)),
            scale_down_cooldown: Duration::from_secs(spec.scale_down_cooldown.unwrap_or(60)),
            scale_up_limit: spec.scale_up_limit.unwrap_or(1),
            scale_down_limit: spec.scale_down_limit.unwrap_or(1),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_scaling_spec_uses_single_instance_defaults() {
        let settings = ScalingSettings::from_spec(None).unwrap();
        assert_eq!(settings.min_instances, 1);
        assert_eq!(settings.max_instances, 1);
        assert_eq!(settings.scale_up_threshold, 80.0);
        assert_eq!(settings.scale_up_cooldown, Duration::from_secs(60));
    }

    #[test]
    fn partial_spec_fills_defaults() {
        let spec = ScalingSpec {
            strategy: Some("threshold".into()),
            min_instances: Some(2),
            max_instances: Some(10),
            scale_up_threshold: Some(8.0),
            ..ScalingSpec::default()
        };
        let settings = ScalingSettings::from_spec(Some(&spec)).unwrap();
        assert_eq!(settings.min_instances, 2);
        assert_eq!(settings.max_instances, 10);
        assert_eq!(settings.scale_up_threshold, 8.0);
        assert_eq!(settings.scale_down_threshold, 20.0);
        assert_eq!(settings.scale_up_limit, 1);
    }

    #[test]
    fn unknown_strategy_is_an_error() {
        assert_eq!(
            ScaleStrategy::parse(Some("psychic")),
            Err(SettingsError::UnknownScaleStrategy("psychic".into()))
        );
        assert_eq!(ScaleStrategy::parse(None), Ok(ScaleStrategy::Threshold));
    }

    #[test]
    fn unknown_deployment_type_is_an_error() {
        assert!(DeploymentType::parse("scalable").is_ok());
        assert!(matches!(
            DeploymentType::parse("cronjob"),
            Err(SettingsError::UnknownDeploymentType(_))
        ));
    }
}
