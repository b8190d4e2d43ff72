//! Shared type definitions for the fleet controller
//!
//! This crate contains the instance model and the wire messages exchanged
//! with game-server instances over the store's pub/sub channels. It is
//! consumed by the controller daemon and by in-process agents embedded in
//! game servers.

use std::collections::BTreeSet;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

/// Channel on which the controller proposes graceful shutdowns.
pub const SHUTDOWN_PROPOSE_CHANNEL: &str = "shutdown:propose";
/// Channel on which instances answer shutdown proposals.
pub const SHUTDOWN_RESPONSE_CHANNEL: &str = "shutdown:response";
/// Channel carrying the final-shutdown signal (the bare token).
pub const SHUTDOWN_FINAL_CHANNEL: &str = "shutdown:final";
/// Channel carrying `ip:STATE` instance state transitions.
pub const INSTANCE_STATE_CHANNEL: &str = "instance:state";
/// Channel carrying fleet names whose enabled flag was toggled.
pub const FLEET_TOGGLE_CHANNEL: &str = "fleet:toggle";

/// Errors produced when decoding wire messages.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("invalid message format: `{0}`")]
    InvalidFormat(String),

    #[error("unknown instance state: `{0}`")]
    UnknownState(String),

    #[error("unknown shutdown response kind: `{0}`")]
    UnknownResponseKind(String),

    #[error("invalid numeric field `{field}`: `{value}`")]
    InvalidNumber { field: &'static str, value: String },
}

/// Lifecycle state of a game-server instance, ordered by termination
/// proximity.
///
/// `Blocked` means the instance declared itself busy (e.g. a match in
/// progress) and still counts as capacity. `Draining` means a shutdown has
/// been accepted and the instance no longer counts toward capacity or the
/// replica total.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, derive_more::Display,
)]
pub enum InstanceState {
    #[display("STARTING")]
    Starting,
    #[display("RUNNING")]
    Running,
    #[display("BLOCKED")]
    Blocked,
    #[display("DRAINING")]
    Draining,
    #[display("STOPPING")]
    Stopping,
    #[display("STOPPED")]
    Stopped,
}

impl InstanceState {
    /// States that can never be left for an earlier one.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopping | Self::Stopped)
    }

    /// Whether the instance is on its way out (excluded from capacity and
    /// replica accounting).
    pub fn is_terminating(self) -> bool {
        matches!(self, Self::Draining | Self::Stopping | Self::Stopped)
    }

    /// Whether the instance counts toward fleet capacity.
    pub fn counts_as_capacity(self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Blocked)
    }

    /// Transition guard: once an instance reaches a terminal state no
    /// writer may move it back to an earlier one.
    pub fn allows_transition_to(self, next: InstanceState) -> bool {
        if self == Self::Stopped {
            return next == Self::Stopped;
        }
        if self == Self::Stopping {
            return matches!(next, Self::Stopping | Self::Stopped);
        }
        true
    }
}

impl FromStr for InstanceState {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "STARTING" => Ok(Self::Starting),
            "RUNNING" => Ok(Self::Running),
            "BLOCKED" => Ok(Self::Blocked),
            "DRAINING" => Ok(Self::Draining),
            "STOPPING" => Ok(Self::Stopping),
            "STOPPED" => Ok(Self::Stopped),
            other => Err(WireError::UnknownState(other.to_string())),
        }
    }
}

/// Kind of workload an instance runs, decided once when the fleet wrapper
/// is constructed and carried explicitly from then on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, derive_more::Display)]
pub enum InstanceKind {
    /// Plain process workload with no occupancy signal.
    #[display("GENERIC")]
    Generic,
    /// Game-server workload reporting per-player occupancy.
    #[display("GAME")]
    Game,
}

/// One running game-server instance.
///
/// The store owns the authoritative record; the controller holds transient
/// copies that are re-fetched whole on every reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    /// Pod UID, unique for the lifetime of the backing pod.
    pub uid: String,
    /// Short display name derived from the fleet name and UID.
    pub name: String,
    /// Name of the backing pod.
    pub pod_name: String,
    /// Pod IP, used to address wire messages to the instance.
    pub ip: String,
    /// Name of the owning fleet.
    pub fleet: String,
    pub state: InstanceState,
    pub kind: InstanceKind,
    /// Connected players; `None` for generic instances.
    pub players: Option<BTreeSet<Uuid>>,
    /// Epoch milliseconds at which the backing pod was created.
    pub created_at_ms: u64,
    /// Shutdown negotiation deadline, present while a shutdown is pending.
    pub block_until_ms: Option<u64>,
    pub shutdown_reason: Option<String>,
    pub shutdown_token: Option<String>,
}

impl Instance {
    pub fn new(
        uid: impl Into<String>,
        name: impl Into<String>,
        pod_name: impl Into<String>,
        ip: impl Into<String>,
        fleet: impl Into<String>,
        kind: InstanceKind,
    ) -> Self {
        Self {
            uid: uid.into(),
            name: name.into(),
            pod_name: pod_name.into(),
            ip: ip.into(),
            fleet: fleet.into(),
            state: InstanceState::Starting,
            kind,
            players: match kind {
                InstanceKind::Game => Some(BTreeSet::new()),
                InstanceKind::Generic => None,
            },
            created_at_ms: 0,
            block_until_ms: None,
            shutdown_reason: None,
            shutdown_token: None,
        }
    }

    /// Number of players (work units) currently on the instance.
    pub fn occupancy(&self) -> usize {
        self.players.as_ref().map_or(0, BTreeSet::len)
    }

    /// Clears negotiation metadata after a cancelled or completed shutdown.
    pub fn clear_shutdown_meta(&mut self) {
        self.block_until_ms = None;
        self.shutdown_reason = None;
        self.shutdown_token = None;
    }
}

/// Proposal sent from the controller to an instance asking it to shut
/// down gracefully.
///
/// Wire format: `targetIp:token:reason:maxDelaySeconds`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownProposal {
    /// Pod IP of the addressed instance; listeners filter on it.
    pub target_ip: String,
    pub token: String,
    pub reason: String,
    pub max_delay_seconds: u64,
}

impl ShutdownProposal {
    pub fn encode(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.target_ip, self.token, self.reason, self.max_delay_seconds
        )
    }

    pub fn decode(message: &str) -> Result<Self, WireError> {
        let parts: Vec<&str> = message.splitn(4, ':').collect();
        let [target_ip, token, reason, delay] = parts[..] else {
            return Err(WireError::InvalidFormat(message.to_string()));
        };
        let max_delay_seconds = delay.parse().map_err(|_| WireError::InvalidNumber {
            field: "maxDelaySeconds",
            value: delay.to_string(),
        })?;
        Ok(Self {
            target_ip: target_ip.to_string(),
            token: token.to_string(),
            reason: reason.to_string(),
            max_delay_seconds,
        })
    }
}

/// How an instance answered a shutdown proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum ResponseKind {
    /// Shut down whenever convenient; the zero-occupancy fast path applies.
    #[display("ACCEPT")]
    Accept,
    /// Request additional time, clamped to the proposed maximum.
    #[display("DELAY")]
    Delay,
    /// The instance times its own STOPPING transition; the controller only
    /// keeps a safety timeout.
    #[display("SELF_MANAGED")]
    SelfManaged,
}

impl FromStr for ResponseKind {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACCEPT" => Ok(Self::Accept),
            "DELAY" => Ok(Self::Delay),
            "SELF_MANAGED" => Ok(Self::SelfManaged),
            other => Err(WireError::UnknownResponseKind(other.to_string())),
        }
    }
}

/// Response from an instance to a shutdown proposal.
///
/// Wire format: `token:kind[:requestedSeconds[:reason]]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownResponse {
    pub token: String,
    pub kind: ResponseKind,
    /// Only meaningful for [`ResponseKind::Delay`].
    pub requested_seconds: Option<u64>,
    pub reason: Option<String>,
}

impl ShutdownResponse {
    pub fn encode(&self) -> String {
        let mut out = format!("{}:{}", self.token, self.kind);
        match (self.requested_seconds, self.reason.as_deref()) {
            (Some(secs), Some(reason)) => {
                out.push_str(&format!(":{secs}:{reason}"));
            }
            (Some(secs), None) => out.push_str(&format!(":{secs}")),
            (None, Some(reason)) => out.push_str(&format!("::{reason}")),
            (None, None) => {}
        }
        out
    }

    pub fn decode(message: &str) -> Result<Self, WireError> {
        let parts: Vec<&str> = message.splitn(4, ':').collect();
        if parts.len() < 2 {
            return Err(WireError::InvalidFormat(message.to_string()));
        }
        let token = parts[0].to_string();
        let kind = parts[1].parse()?;
        let requested_seconds = match parts.get(2) {
            Some(s) if !s.is_empty() => {
                Some(s.parse().map_err(|_| WireError::InvalidNumber {
                    field: "requestedSeconds",
                    value: s.to_string(),
                })?)
            }
            _ => None,
        };
        let reason = parts.get(3).map(|s| s.to_string());
        Ok(Self {
            token,
            kind,
            requested_seconds,
            reason,
        })
    }
}

/// Instance state transition as published by instances.
///
/// Wire format: `ip:STATE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceStateChange {
    pub ip: String,
    pub state: InstanceState,
}

impl InstanceStateChange {
    pub fn encode(&self) -> String {
        format!("{}:{}", self.ip, self.state)
    }

    pub fn decode(message: &str) -> Result<Self, WireError> {
        let (ip, state) = message
            .split_once(':')
            .ok_or_else(|| WireError::InvalidFormat(message.to_string()))?;
        Ok(Self {
            ip: ip.to_string(),
            state: state.parse()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_reject_downgrades() {
        assert!(!InstanceState::Stopped.allows_transition_to(InstanceState::Running));
        assert!(!InstanceState::Stopping.allows_transition_to(InstanceState::Running));
        assert!(!InstanceState::Stopping.allows_transition_to(InstanceState::Draining));
        assert!(InstanceState::Stopping.allows_transition_to(InstanceState::Stopped));
        assert!(InstanceState::Draining.allows_transition_to(InstanceState::Running));
        assert!(InstanceState::Running.allows_transition_to(InstanceState::Draining));
    }

    #[test]
    fn draining_is_excluded_from_capacity() {
        assert!(InstanceState::Blocked.counts_as_capacity());
        assert!(InstanceState::Starting.counts_as_capacity());
        assert!(!InstanceState::Draining.counts_as_capacity());
        assert!(InstanceState::Draining.is_terminating());
        assert!(!InstanceState::Draining.is_terminal());
    }

    #[test]
    fn decode_proposal() {
        let proposal = ShutdownProposal::decode("10.0.3.7:tok-123:scale_down:600").unwrap();
        assert_eq!(proposal.target_ip, "10.0.3.7");
        assert_eq!(proposal.token, "tok-123");
        assert_eq!(proposal.reason, "scale_down");
        assert_eq!(proposal.max_delay_seconds, 600);
    }

    #[test]
    fn decode_proposal_rejects_missing_fields() {
        assert!(ShutdownProposal::decode("10.0.3.7:tok-123:scale_down").is_err());
        assert!(ShutdownProposal::decode("10.0.3.7:tok:reason:not-a-number").is_err());
    }

    #[test]
    fn decode_response_variants() {
        let accept = ShutdownResponse::decode("tok:ACCEPT").unwrap();
        assert_eq!(accept.kind, ResponseKind::Accept);
        assert_eq!(accept.requested_seconds, None);

        let delay = ShutdownResponse::decode("tok:DELAY:120:match running").unwrap();
        assert_eq!(delay.kind, ResponseKind::Delay);
        assert_eq!(delay.requested_seconds, Some(120));
        assert_eq!(delay.reason.as_deref(), Some("match running"));

        let self_managed = ShutdownResponse::decode("tok:SELF_MANAGED::saving world").unwrap();
        assert_eq!(self_managed.kind, ResponseKind::SelfManaged);
        assert_eq!(self_managed.requested_seconds, None);
        assert_eq!(self_managed.reason.as_deref(), Some("saving world"));
    }

    #[test]
    fn decode_response_rejects_garbage() {
        assert!(ShutdownResponse::decode("just-a-token").is_err());
        assert!(ShutdownResponse::decode("tok:MAYBE").is_err());
        assert!(ShutdownResponse::decode("tok:DELAY:soon").is_err());
    }

    #[test]
    fn encode_response_reason_without_delay_keeps_field_positions() {
        let response = ShutdownResponse {
            token: "tok".into(),
            kind: ResponseKind::SelfManaged,
            requested_seconds: None,
            reason: Some("world save".into()),
        };
        assert_eq!(response.encode(), "tok:SELF_MANAGED::world save");
        assert_eq!(ShutdownResponse::decode(&response.encode()).unwrap(), response);
    }

    #[test]
    fn decode_state_change() {
        let change = InstanceStateChange::decode("10.1.2.3:STOPPING").unwrap();
        assert_eq!(change.state, InstanceState::Stopping);
        assert!(InstanceStateChange::decode("10.1.2.3:GONE").is_err());
        assert!(InstanceStateChange::decode("no-colon").is_err());
    }
}
