//! Per-fleet runtime wrapper
//!
//! Caches what the controller needs between reconciliation passes: parsed
//! settings, the enabled flag, scale cooldown timestamps and the latest
//! instance snapshot. The snapshot is always replaced whole from the store,
//! never patched, and readers get their own copy.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;
use std::time::Duration;

use api_types::Instance;
use api_types::InstanceKind;
use tokio::time::Instant;

use crate::k8s::fleet::Fleet;
use crate::util::duration::parse_duration;

use super::settings::DeploymentType;
use super::settings::QueueStrategy;
use super::settings::ScalingSettings;
use super::settings::SettingsError;

/// Spec-derived fields refreshed whenever the fleet resource is updated.
#[derive(Debug, Clone)]
struct CachedSpec {
    settings: ScalingSettings,
    queue_strategy: QueueStrategy,
    max_instance_age: Option<Duration>,
    require_startup_confirmation: bool,
}

impl CachedSpec {
    fn parse(fleet: &Fleet) -> Result<Self, SettingsError> {
        let spec = &fleet.spec;
        let settings = ScalingSettings::from_spec(spec.scaling.as_ref())?;
        let queuing = spec.queuing.as_ref();
        let queue_strategy =
            QueueStrategy::parse(queuing.and_then(|q| q.queue_strategy.as_deref()))?;
        let max_instance_age = spec
            .max_instance_age
            .as_deref()
            .filter(|raw| !raw.trim().is_empty())
            .map(|raw| {
                parse_duration(raw).map_err(|e| SettingsError::InvalidMaxInstanceAge {
                    value: raw.to_string(),
                    message: e.to_string(),
                })
            })
            .transpose()?;
        let require_startup_confirmation = queuing
            .and_then(|q| q.require_startup_confirmation)
            .unwrap_or(false);
        Ok(Self {
            settings,
            queue_strategy,
            max_instance_age,
            require_startup_confirmation,
        })
    }
}

#[derive(Debug, Default)]
struct Cooldowns {
    last_scale_up: Option<Instant>,
    last_scale_down: Option<Instant>,
}

pub struct FleetWrapper {
    name: String,
    namespace: String,
    kind: InstanceKind,
    deployment_type: DeploymentType,
    exclusive_volume: bool,
    spec: RwLock<CachedSpec>,
    enabled: AtomicBool,
    cooldowns: Mutex<Cooldowns>,
    instances: RwLock<Arc<Vec<Instance>>>,
}

impl FleetWrapper {
    /// Construct from a fleet resource. The instance kind and deployment
    /// type are decided here, once, and never re-inferred at call time.
    pub fn from_fleet(fleet: &Fleet) -> Result<Self, SettingsError> {
        let name = fleet.metadata.name.clone().unwrap_or_default();
        let namespace = fleet
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string());
        let deployment_type = DeploymentType::parse(&fleet.spec.deployment_type)?;
        let kind = deployment_type.instance_kind();
        let exclusive_volume =
            deployment_type == DeploymentType::Persistent && fleet.spec.volume.is_some();
        let cached = CachedSpec::parse(fleet)?;

        Ok(Self {
            name,
            namespace,
            kind,
            deployment_type,
            exclusive_volume,
            spec: RwLock::new(cached),
            enabled: AtomicBool::new(true),
            cooldowns: Mutex::new(Cooldowns::default()),
            instances: RwLock::new(Arc::new(Vec::new())),
        })
    }

    /// Refresh cached settings from an updated fleet resource.
    pub fn update_resource(&self, fleet: &Fleet) -> Result<(), SettingsError> {
        let cached = CachedSpec::parse(fleet)?;
        *self.spec.write().expect("fleet spec lock poisoned") = cached;
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn kind(&self) -> InstanceKind {
        self.kind
    }

    pub fn deployment_type(&self) -> DeploymentType {
        self.deployment_type
    }

    /// Whether this fleet holds its volume claim exclusively, which blocks
    /// scaling while an instance is still draining.
    pub fn exclusive_volume(&self) -> bool {
        self.exclusive_volume
    }

    pub fn settings(&self) -> ScalingSettings {
        self.spec.read().expect("fleet spec lock poisoned").settings
    }

    pub fn queue_strategy(&self) -> QueueStrategy {
        self.spec
            .read()
            .expect("fleet spec lock poisoned")
            .queue_strategy
    }

    pub fn max_instance_age(&self) -> Option<Duration> {
        self.spec
            .read()
            .expect("fleet spec lock poisoned")
            .max_instance_age
    }

    pub fn require_startup_confirmation(&self) -> bool {
        self.spec
            .read()
            .expect("fleet spec lock poisoned")
            .require_startup_confirmation
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn is_on_scale_up_cooldown(&self, now: Instant) -> bool {
        let cooldowns = self.cooldowns.lock().expect("cooldown lock poisoned");
        cooldowns
            .last_scale_up
            .is_some_and(|last| now.duration_since(last) < self.settings().scale_up_cooldown)
    }

    pub fn is_on_scale_down_cooldown(&self, now: Instant) -> bool {
        let cooldowns = self.cooldowns.lock().expect("cooldown lock poisoned");
        cooldowns
            .last_scale_down
            .is_some_and(|last| now.duration_since(last) < self.settings().scale_down_cooldown)
    }

    pub fn mark_scale_up(&self, now: Instant) {
        self.cooldowns
            .lock()
            .expect("cooldown lock poisoned")
            .last_scale_up = Some(now);
    }

    pub fn mark_scale_down(&self, now: Instant) {
        self.cooldowns
            .lock()
            .expect("cooldown lock poisoned")
            .last_scale_down = Some(now);
    }

    /// Replace the instance snapshot with a fresh fetch from the store.
    pub fn set_instances(&self, instances: Vec<Instance>) {
        *self.instances.write().expect("instances lock poisoned") = Arc::new(instances);
    }

    /// Immutable snapshot of the instances seen on the last refresh.
    pub fn instances(&self) -> Arc<Vec<Instance>> {
        Arc::clone(&self.instances.read().expect("instances lock poisoned"))
    }
}
