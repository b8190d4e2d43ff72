//! One reconciliation pass per fleet resource
//!
//! Fetch the resource, resolve the wrapper, sync the enabled flag, refresh
//! the instance snapshot, run the decision engine and execute the outcome.
//! Scale-up creates workload pods directly; scale-down only ever proposes
//! negotiated shutdowns. Every failure inside a pass is converted into a
//! longer requeue, never propagated, so one broken fleet cannot stop the
//! loop.

use std::sync::Arc;
use std::time::Duration;

use api_types::InstanceKind;
use error_stack::Report;
use thiserror::Error;
use tokio::time::Instant;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::fleet::FleetRegistry;
use crate::fleet::FleetWrapper;
use crate::k8s::fleet::Fleet;
use crate::k8s::types::KubernetesError;
use crate::k8s::workloads::WorkloadApi;
use crate::scaling::DecisionEngine;
use crate::scaling::FleetConditions;
use crate::scaling::ScaleAction;
use crate::scaling::ScalingDecision;
use crate::shutdown::ShutdownError;
use crate::shutdown::ShutdownManager;
use crate::shutdown::DEFAULT_MAX_DELAY;
use crate::shutdown::FLEET_DISABLED_MAX_DELAY;
use crate::store::fleet_key;
use crate::store::InstanceStore;
use crate::store::StoreError;
use crate::store::ENABLED_FIELD;

use super::queue::ReconcileRequest;

/// What the worker loop should do with the request after a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Terminal for this request; do not requeue.
    Done,
    RequeueAfter(Duration),
}

#[derive(Debug, Error)]
enum ReconcileError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("kubernetes failure: {0}")]
    Kubernetes(Report<KubernetesError>),
}

impl From<Report<KubernetesError>> for ReconcileError {
    fn from(report: Report<KubernetesError>) -> Self {
        Self::Kubernetes(report)
    }
}

pub struct FleetReconciler {
    workloads: Arc<dyn WorkloadApi>,
    store: Arc<dyn InstanceStore>,
    registry: Arc<FleetRegistry>,
    shutdown: Arc<ShutdownManager>,
    requeue_interval: Duration,
    error_requeue_interval: Duration,
}

impl FleetReconciler {
    pub fn new(
        workloads: Arc<dyn WorkloadApi>,
        store: Arc<dyn InstanceStore>,
        registry: Arc<FleetRegistry>,
        shutdown: Arc<ShutdownManager>,
        requeue_interval: Duration,
        error_requeue_interval: Duration,
    ) -> Self {
        Self {
            workloads,
            store,
            registry,
            shutdown,
            requeue_interval,
            error_requeue_interval,
        }
    }

    /// Run one pass. Transient failures become a longer requeue.
    pub async fn reconcile(&self, request: &ReconcileRequest) -> ReconcileOutcome {
        match self.reconcile_inner(request).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(
                    namespace = %request.namespace,
                    fleet = %request.name,
                    error = %e,
                    "reconciliation pass failed"
                );
                ReconcileOutcome::RequeueAfter(self.error_requeue_interval)
            }
        }
    }

    async fn reconcile_inner(
        &self,
        request: &ReconcileRequest,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let Some(fleet) = self
            .workloads
            .get_fleet(&request.namespace, &request.name)
            .await?
        else {
            info!(fleet = %request.name, "fleet resource gone, dropping from registry");
            self.registry.remove(&request.name);
            return Ok(ReconcileOutcome::Done);
        };

        let wrapper = match self.resolve_wrapper(&fleet, &request.name) {
            Some(wrapper) => wrapper,
            // Malformed spec: skipping is safer than guessing scaling
            // parameters. Terminal until the resource changes again.
            None => return Ok(ReconcileOutcome::Done),
        };

        let enabled = self
            .store
            .get_flag(&fleet_key(&request.name), ENABLED_FIELD)
            .await?
            .map(|raw| raw.parse().unwrap_or(false))
            .unwrap_or(true);
        let was_enabled = wrapper.is_enabled();
        wrapper.set_enabled(enabled);

        if was_enabled && !enabled {
            info!(fleet = %request.name, "fleet disabled, draining all instances");
            self.drain_all_instances(&wrapper).await?;
            return Ok(ReconcileOutcome::RequeueAfter(self.requeue_interval));
        }
        if !enabled {
            return Ok(ReconcileOutcome::RequeueAfter(self.requeue_interval));
        }

        // Only game fleets expose an occupancy signal to scale on.
        if wrapper.kind() != InstanceKind::Game {
            return Ok(ReconcileOutcome::Done);
        }

        let instances = self.store.get_instances(&request.name).await?;
        wrapper.set_instances(instances.clone());

        let pod_count = self
            .workloads
            .count_live_pods(&request.namespace, &request.name)
            .await?;

        let now = Instant::now();
        let conditions = FleetConditions {
            live_pod_count: pod_count,
            exclusive_volume: wrapper.exclusive_volume(),
            on_scale_up_cooldown: wrapper.is_on_scale_up_cooldown(now),
            on_scale_down_cooldown: wrapper.is_on_scale_down_cooldown(now),
        };
        let decision = DecisionEngine::decide(
            &instances,
            &wrapper.settings(),
            &conditions,
            &self.shutdown.pending_uids(),
        );

        if decision.action != ScaleAction::NoChange {
            info!(
                fleet = %request.name,
                action = %decision.action,
                current = decision.current_replicas,
                target = decision.target_replicas,
                "executing scaling decision"
            );
            self.execute(&fleet, &wrapper, &decision).await?;
        }

        // Continuous convergence: check again shortly even when idle.
        Ok(ReconcileOutcome::RequeueAfter(self.requeue_interval))
    }

    fn resolve_wrapper(&self, fleet: &Fleet, name: &str) -> Option<Arc<FleetWrapper>> {
        match self.registry.get(name) {
            Some(wrapper) => {
                if let Err(e) = wrapper.update_resource(fleet) {
                    error!(fleet = %name, error = %e, "fleet spec became invalid, skipping");
                    return None;
                }
                Some(wrapper)
            }
            None => match self.registry.get_or_create(fleet) {
                Ok(wrapper) => Some(wrapper),
                Err(e) => {
                    error!(fleet = %name, error = %e, "cannot build wrapper for fleet, skipping");
                    None
                }
            },
        }
    }

    async fn drain_all_instances(&self, wrapper: &FleetWrapper) -> Result<(), ReconcileError> {
        let instances = self.store.get_instances(wrapper.name()).await?;
        wrapper.set_instances(instances.clone());
        for instance in &instances {
            if instance.state.is_terminating() || self.shutdown.is_pending(&instance.uid) {
                continue;
            }
            match self
                .shutdown
                .propose_shutdown(instance, "fleet_disabled", FLEET_DISABLED_MAX_DELAY)
                .await
            {
                Ok(token) => {
                    info!(instance = %instance.name, token = %token, "proposed teardown shutdown")
                }
                Err(ShutdownError::Store(e)) => return Err(e.into()),
                Err(e) => warn!(instance = %instance.name, error = %e, "teardown proposal skipped"),
            }
        }
        Ok(())
    }

    async fn execute(
        &self,
        fleet: &Fleet,
        wrapper: &FleetWrapper,
        decision: &ScalingDecision,
    ) -> Result<(), ReconcileError> {
        match decision.action {
            ScaleAction::Up => {
                let to_create = decision.target_replicas - decision.current_replicas;
                for _ in 0..to_create {
                    match self.workloads.create_instance_pod(fleet).await {
                        Ok(pod_name) => info!(fleet = %wrapper.name(), pod = %pod_name, "created instance workload"),
                        Err(e) => {
                            warn!(fleet = %wrapper.name(), error = %e, "instance workload creation failed")
                        }
                    }
                }
                wrapper.mark_scale_up(Instant::now());
            }
            ScaleAction::Down => {
                for victim in &decision.instances_to_remove {
                    match self
                        .shutdown
                        .propose_shutdown(victim, "scale_down", DEFAULT_MAX_DELAY)
                        .await
                    {
                        Ok(token) => {
                            info!(instance = %victim.name, token = %token, "proposed scale-down shutdown")
                        }
                        Err(ShutdownError::Store(e)) => return Err(e.into()),
                        Err(e) => {
                            warn!(instance = %victim.name, error = %e, "scale-down proposal skipped")
                        }
                    }
                }
                wrapper.mark_scale_down(Instant::now());
            }
            ScaleAction::NoChange => {}
        }
        Ok(())
    }
}
