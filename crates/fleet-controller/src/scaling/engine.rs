//! Decision engine for threshold scaling
//!
//! Pure and deterministic given its inputs: time only enters through the
//! pre-computed cooldown flags, so every branch is reachable from a plain
//! unit test.

use std::collections::HashSet;

use api_types::Instance;
use api_types::InstanceState;
use tracing::debug;

use crate::fleet::ScaleStrategy;
use crate::fleet::ScalingSettings;

use super::ScaleAction;
use super::ScalingDecision;

/// Per-pass fleet conditions the engine cannot derive from the instance
/// snapshot alone.
#[derive(Debug, Clone, Copy, Default)]
pub struct FleetConditions {
    /// Live workload pods counted at the orchestrator. Pods that exist but
    /// have not yet registered as instances count as provisioned capacity.
    pub live_pod_count: u32,
    /// The fleet holds its volume claim exclusively; a replacement cannot
    /// start while a draining instance still owns it.
    pub exclusive_volume: bool,
    pub on_scale_up_cooldown: bool,
    pub on_scale_down_cooldown: bool,
}

/// Engine producing scaling decisions from instance state and settings.
pub struct DecisionEngine;

impl DecisionEngine {
    pub fn decide(
        instances: &[Instance],
        settings: &ScalingSettings,
        conditions: &FleetConditions,
        negotiating: &HashSet<String>,
    ) -> ScalingDecision {
        let active = count(instances, |s| {
            matches!(s, InstanceState::Running | InstanceState::Starting)
        });
        let running_only = count(instances, |s| s == InstanceState::Running);
        let total_non_terminating = count(instances, |s| !s.is_terminating());
        let players: u32 = instances
            .iter()
            .filter(|i| i.state.counts_as_capacity())
            .map(|i| i.occupancy() as u32)
            .sum();
        let current = total_non_terminating.max(conditions.live_pod_count);

        if settings.strategy == ScaleStrategy::Trend {
            // Trend analysis is an unimplemented strategy variant.
            return ScalingDecision::no_change(current);
        }

        let below_min = active < settings.min_instances;
        let any_starting = instances.iter().any(|i| i.state == InstanceState::Starting);
        let any_draining = instances.iter().any(|i| i.state == InstanceState::Draining);

        let preliminary = if below_min {
            // Recovery to the floor outranks everything else.
            ScaleAction::Up
        } else if conditions.exclusive_volume && any_draining {
            debug!("holding scale while an exclusive volume is still draining");
            ScaleAction::NoChange
        } else if active == 0 {
            ScaleAction::NoChange
        } else {
            let per_active = players as f64 / active as f64;
            if per_active >= settings.scale_up_threshold {
                ScaleAction::Up
            } else if any_starting {
                // Provisioned capacity is still booting; never shrink yet.
                ScaleAction::NoChange
            } else if (players as f64 / running_only as f64) < settings.scale_down_threshold {
                ScaleAction::Down
            } else {
                ScaleAction::NoChange
            }
        };

        let gated = match preliminary {
            ScaleAction::Up if total_non_terminating >= settings.max_instances => {
                debug!(
                    total_non_terminating,
                    max = settings.max_instances,
                    "scale-up blocked at max instances"
                );
                ScaleAction::NoChange
            }
            ScaleAction::Up if !below_min && conditions.on_scale_up_cooldown => {
                debug!("scale-up blocked by cooldown");
                ScaleAction::NoChange
            }
            ScaleAction::Down if active <= settings.min_instances => {
                debug!(
                    active,
                    min = settings.min_instances,
                    "scale-down blocked at min instances"
                );
                ScaleAction::NoChange
            }
            ScaleAction::Down if conditions.on_scale_down_cooldown => {
                debug!("scale-down blocked by cooldown");
                ScaleAction::NoChange
            }
            action => action,
        };

        match gated {
            ScaleAction::Up => {
                let target = if below_min {
                    settings.min_instances
                } else {
                    let mut active_so_far = active;
                    let mut added = 0;
                    while added < settings.scale_up_limit
                        && players as f64 / active_so_far as f64 >= settings.scale_up_threshold
                    {
                        active_so_far += 1;
                        added += 1;
                    }
                    (total_non_terminating + added).max(settings.min_instances)
                };
                if target <= current {
                    ScalingDecision::no_change(current)
                } else {
                    ScalingDecision::scale_up(current, target)
                }
            }
            ScaleAction::Down => {
                let mut active_so_far = active;
                let mut removed = 0;
                while removed < settings.scale_down_limit
                    && active_so_far > 1
                    && (players as f64 / active_so_far as f64) < settings.scale_down_threshold
                {
                    active_so_far -= 1;
                    removed += 1;
                }
                let target = total_non_terminating
                    .saturating_sub(removed)
                    .max(settings.min_instances);
                if target >= current {
                    return ScalingDecision::no_change(current);
                }
                let victims =
                    select_for_scale_down(instances, negotiating, (current - target) as usize);
                if victims.is_empty() {
                    ScalingDecision::no_change(current)
                } else {
                    ScalingDecision::scale_down(current, target, victims)
                }
            }
            ScaleAction::NoChange => ScalingDecision::no_change(current),
        }
    }
}

fn count(instances: &[Instance], predicate: impl Fn(InstanceState) -> bool) -> u32 {
    instances.iter().filter(|i| predicate(i.state)).count() as u32
}

/// Pick removal victims: RUNNING only (never BLOCKED, STARTING, or an
/// instance already negotiating a shutdown), fewest players first. The sort
/// is stable, so ties keep input order.
fn select_for_scale_down(
    instances: &[Instance],
    negotiating: &HashSet<String>,
    need: usize,
) -> Vec<Instance> {
    let mut candidates: Vec<&Instance> = instances
        .iter()
        .filter(|i| i.state == InstanceState::Running && !negotiating.contains(&i.uid))
        .collect();
    candidates.sort_by_key(|i| i.occupancy());
    candidates.into_iter().take(need).cloned().collect()
}
