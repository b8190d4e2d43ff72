//! Scaling decisions
//!
//! The decision engine turns an instance snapshot and fleet settings into a
//! concrete action. Decisions are produced fresh per reconciliation pass
//! and name the exact instances to remove, because the orchestrator's own
//! replica rebalancing cannot pick which instance goes.

pub mod engine;

pub use engine::DecisionEngine;
pub use engine::FleetConditions;

use api_types::Instance;

#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum ScaleAction {
    #[display("UP")]
    Up,
    #[display("DOWN")]
    Down,
    #[display("NO_CHANGE")]
    NoChange,
}

/// Immutable outcome of one engine run.
#[derive(Debug, Clone)]
pub struct ScalingDecision {
    pub action: ScaleAction,
    pub current_replicas: u32,
    pub target_replicas: u32,
    /// Instances selected for removal, lowest occupancy first. Empty
    /// unless `action` is [`ScaleAction::Down`].
    pub instances_to_remove: Vec<Instance>,
}

impl ScalingDecision {
    pub fn no_change(current_replicas: u32) -> Self {
        Self {
            action: ScaleAction::NoChange,
            current_replicas,
            target_replicas: current_replicas,
            instances_to_remove: Vec::new(),
        }
    }

    pub fn scale_up(current_replicas: u32, target_replicas: u32) -> Self {
        Self {
            action: ScaleAction::Up,
            current_replicas,
            target_replicas,
            instances_to_remove: Vec::new(),
        }
    }

    pub fn scale_down(
        current_replicas: u32,
        target_replicas: u32,
        instances_to_remove: Vec<Instance>,
    ) -> Self {
        Self {
            action: ScaleAction::Down,
            current_replicas,
            target_replicas,
            instances_to_remove,
        }
    }
}
