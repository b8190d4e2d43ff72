//! Shutdown negotiation state machine
//!
//! One [`PendingShutdown`] per negotiating instance, keyed by token. The
//! uid index is the atomic claim that enforces at most one non-finalized
//! negotiation per instance. Entries are mutated under the map guard and
//! all store I/O happens after the guard is dropped.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use api_types::Instance;
use api_types::InstanceState;
use api_types::InstanceStateChange;
use api_types::ResponseKind;
use api_types::ShutdownProposal;
use api_types::ShutdownResponse;
use api_types::INSTANCE_STATE_CHANNEL;
use api_types::SHUTDOWN_FINAL_CHANNEL;
use api_types::SHUTDOWN_PROPOSE_CHANNEL;
use dashmap::DashMap;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;
use uuid::Uuid;

use crate::store::InstanceStore;
use crate::store::StoreError;
use crate::util::epoch_ms;

use super::ShutdownError;
use super::CLEANUP_GRACE_PERIOD;
use super::RESPONSE_TIMEOUT;
use super::SELF_MANAGED_SAFETY_TIMEOUT;

#[derive(Debug)]
struct PendingShutdown {
    instance_uid: String,
    fleet: String,
    proposed_at: Instant,
    proposed_at_ms: u64,
    max_delay: Duration,
    deadline: Instant,
    has_responded: bool,
    response_kind: Option<ResponseKind>,
    final_shutdown_sent: bool,
}

/// What `handle_response` needs to persist once the map guard is released.
enum Persist {
    Nothing,
    BlockUntil { uid: String, fleet: String, at_ms: u64 },
}

pub struct ShutdownManager {
    store: Arc<dyn InstanceStore>,
    pending: DashMap<String, PendingShutdown>,
    /// instance uid -> token; the entry claim that keeps negotiations
    /// unique per instance.
    uid_index: DashMap<String, String>,
}

impl ShutdownManager {
    pub fn new(store: Arc<dyn InstanceStore>) -> Self {
        Self {
            store,
            pending: DashMap::new(),
            uid_index: DashMap::new(),
        }
    }

    /// Propose a graceful shutdown to an instance and return the token
    /// correlating the negotiation.
    pub async fn propose_shutdown(
        &self,
        instance: &Instance,
        reason: &str,
        max_delay: Duration,
    ) -> Result<String, ShutdownError> {
        let token = Uuid::new_v4().to_string();

        match self.uid_index.entry(instance.uid.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(ShutdownError::AlreadyNegotiating {
                    uid: instance.uid.clone(),
                });
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(token.clone());
            }
        }

        let proposed_at = Instant::now();
        let proposed_at_ms = epoch_ms();
        let block_until_ms = proposed_at_ms + max_delay.as_millis() as u64;

        // DRAINING stops new players being routed here while staying
        // distinct from BLOCKED, which the instance sets itself.
        let mut record = instance.clone();
        record.state = InstanceState::Draining;
        record.block_until_ms = Some(block_until_ms);
        record.shutdown_reason = Some(reason.to_string());
        record.shutdown_token = Some(token.clone());

        let written = match self.store.write_instance(&record).await {
            Ok(written) => written,
            Err(e) => {
                self.uid_index.remove(&instance.uid);
                return Err(e.into());
            }
        };
        if !written {
            self.uid_index.remove(&instance.uid);
            return Err(ShutdownError::InstanceTerminal {
                uid: instance.uid.clone(),
            });
        }

        self.pending.insert(
            token.clone(),
            PendingShutdown {
                instance_uid: instance.uid.clone(),
                fleet: instance.fleet.clone(),
                proposed_at,
                proposed_at_ms,
                max_delay,
                deadline: proposed_at + max_delay,
                has_responded: false,
                response_kind: None,
                final_shutdown_sent: false,
            },
        );

        let proposal = ShutdownProposal {
            target_ip: instance.ip.clone(),
            token: token.clone(),
            reason: reason.to_string(),
            max_delay_seconds: max_delay.as_secs(),
        };
        self.store
            .publish(SHUTDOWN_PROPOSE_CHANNEL, &proposal.encode())
            .await?;

        info!(
            instance = %instance.name,
            uid = %instance.uid,
            ip = %instance.ip,
            token = %token,
            reason,
            max_delay_secs = max_delay.as_secs(),
            "proposed shutdown"
        );
        Ok(token)
    }

    /// Apply an instance's response. Idempotent: a second response for an
    /// already-answered token is ignored.
    pub async fn handle_response(&self, response: &ShutdownResponse) -> Result<(), StoreError> {
        let persist = {
            let Some(mut entry) = self.pending.get_mut(&response.token) else {
                // The negotiation may have been finalized or cancelled.
                warn!(token = %response.token, "shutdown response for unknown token");
                return Ok(());
            };
            if entry.has_responded {
                info!(token = %response.token, "ignoring duplicate shutdown response");
                return Ok(());
            }
            entry.has_responded = true;
            entry.response_kind = Some(response.kind);
            let uid = entry.instance_uid.clone();
            let fleet = entry.fleet.clone();

            match response.kind {
                ResponseKind::Accept => {
                    info!(uid = %uid, token = %response.token, "instance accepted shutdown");
                    Persist::Nothing
                }
                ResponseKind::Delay => {
                    let requested = response.requested_seconds.unwrap_or(0);
                    let granted = requested.min(entry.max_delay.as_secs());
                    // The grant counts from the original proposal, not
                    // from when the response happened to arrive.
                    entry.deadline = entry.proposed_at + Duration::from_secs(granted);
                    let at_ms = entry.proposed_at_ms + granted * 1000;
                    info!(
                        uid = %uid,
                        token = %response.token,
                        requested,
                        granted,
                        reason = response.reason.as_deref().unwrap_or(""),
                        "instance requested shutdown delay"
                    );
                    Persist::BlockUntil { uid, fleet, at_ms }
                }
                ResponseKind::SelfManaged => {
                    entry.deadline = Instant::now() + SELF_MANAGED_SAFETY_TIMEOUT;
                    let at_ms = epoch_ms() + SELF_MANAGED_SAFETY_TIMEOUT.as_millis() as u64;
                    info!(
                        uid = %uid,
                        token = %response.token,
                        safety_timeout_secs = SELF_MANAGED_SAFETY_TIMEOUT.as_secs(),
                        "instance will self-manage its shutdown"
                    );
                    Persist::BlockUntil { uid, fleet, at_ms }
                }
            }
        };

        if let Persist::BlockUntil { uid, fleet, at_ms } = persist {
            if let Some(mut record) = self.store.get_instance(&uid, &fleet).await? {
                record.block_until_ms = Some(at_ms);
                self.store.write_instance(&record).await?;
            }
        }
        Ok(())
    }

    /// Sweep pending negotiations and issue final shutdowns where due.
    /// Returns the UIDs finalized by this sweep.
    pub async fn check_timeouts_and_finalize(&self) -> Result<Vec<String>, StoreError> {
        let now = Instant::now();
        let tokens: Vec<String> = self
            .pending
            .iter()
            .filter(|entry| !entry.final_shutdown_sent)
            .map(|entry| entry.key().clone())
            .collect();

        let mut finalized = Vec::new();
        for token in tokens {
            let Some((uid, fleet, proposed_at, deadline, has_responded, kind)) =
                self.pending.get(&token).map(|entry| {
                    (
                        entry.instance_uid.clone(),
                        entry.fleet.clone(),
                        entry.proposed_at,
                        entry.deadline,
                        entry.has_responded,
                        entry.response_kind,
                    )
                })
            else {
                continue;
            };

            let Some(instance) = self.store.get_instance(&uid, &fleet).await? else {
                debug!(uid = %uid, token = %token, "negotiating instance disappeared");
                self.remove_pending(&token);
                continue;
            };

            let mut reason = None;
            if !has_responded && now.duration_since(proposed_at) >= RESPONSE_TIMEOUT {
                reason = Some("no_response_timeout");
            }
            if now >= deadline {
                reason = Some("deadline_reached");
            }
            if reason.is_none() && has_responded && instance.occupancy() == 0 {
                // Zero-occupancy fast path. Never applies to SELF_MANAGED:
                // the instance's own readiness report is authoritative.
                match kind {
                    Some(ResponseKind::Accept) => reason = Some("zero_occupancy"),
                    Some(ResponseKind::Delay) | Some(ResponseKind::SelfManaged) | None => {}
                }
            }

            let Some(reason) = reason else { continue };

            let marked = self
                .pending
                .get_mut(&token)
                .map(|mut entry| {
                    if entry.final_shutdown_sent {
                        false
                    } else {
                        entry.final_shutdown_sent = true;
                        true
                    }
                })
                .unwrap_or(false);
            if !marked {
                continue;
            }

            self.store.publish(SHUTDOWN_FINAL_CHANNEL, &token).await?;
            info!(
                instance = %instance.name,
                uid = %uid,
                token = %token,
                reason,
                "issued final shutdown"
            );
            self.spawn_forced_stop(instance);
            finalized.push(uid);
        }
        Ok(finalized)
    }

    /// After the cleanup grace period, force the instance to STOPPING
    /// unless it already got there on its own.
    fn spawn_forced_stop(&self, instance: Instance) {
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            tokio::time::sleep(CLEANUP_GRACE_PERIOD).await;
            match store.get_instance(&instance.uid, &instance.fleet).await {
                Ok(Some(mut current)) => {
                    if current.state.is_terminal() {
                        debug!(
                            uid = %current.uid,
                            state = %current.state,
                            "instance stopped itself, skipping forced transition"
                        );
                        return;
                    }
                    current.state = InstanceState::Stopping;
                    match store.write_instance(&current).await {
                        Ok(true) => {
                            info!(uid = %current.uid, "grace period expired, forced STOPPING");
                            // The state listener reacts to this transition
                            // by deleting the backing pod.
                            let change = InstanceStateChange {
                                ip: current.ip.clone(),
                                state: InstanceState::Stopping,
                            };
                            if let Err(e) = store
                                .publish(INSTANCE_STATE_CHANNEL, &change.encode())
                                .await
                            {
                                warn!(uid = %current.uid, error = %e, "state change publish failed");
                            }
                        }
                        Ok(false) => {
                            debug!(uid = %current.uid, "instance reached terminal state first")
                        }
                        Err(e) => warn!(uid = %current.uid, error = %e, "forced stop write failed"),
                    }
                }
                Ok(None) => debug!(uid = %instance.uid, "instance gone before forced stop"),
                Err(e) => warn!(uid = %instance.uid, error = %e, "forced stop lookup failed"),
            }
        });
    }

    /// Cancel a negotiation that has not yet finalized, reverting the
    /// instance to RUNNING. Returns `false` when finalization already won
    /// the race.
    pub async fn cancel_shutdown(&self, token: &str) -> Result<bool, StoreError> {
        let Some((_, pending)) = self
            .pending
            .remove_if(token, |_, entry| !entry.final_shutdown_sent)
        else {
            return Ok(false);
        };
        self.uid_index.remove(&pending.instance_uid);

        if let Some(mut record) = self
            .store
            .get_instance(&pending.instance_uid, &pending.fleet)
            .await?
        {
            record.state = InstanceState::Running;
            record.clear_shutdown_meta();
            if self.store.write_instance(&record).await? {
                info!(uid = %pending.instance_uid, token, "cancelled shutdown");
            } else {
                warn!(uid = %pending.instance_uid, token, "cancel raced a terminal transition");
            }
        }
        Ok(true)
    }

    /// Drop negotiations whose instance is gone or fully stopped.
    pub async fn cleanup_completed(&self) -> Result<(), StoreError> {
        let tokens: Vec<String> = self
            .pending
            .iter()
            .filter(|entry| entry.final_shutdown_sent)
            .map(|entry| entry.key().clone())
            .collect();
        for token in tokens {
            let Some((uid, fleet)) = self
                .pending
                .get(&token)
                .map(|entry| (entry.instance_uid.clone(), entry.fleet.clone()))
            else {
                continue;
            };
            let done = match self.store.get_instance(&uid, &fleet).await? {
                None => true,
                Some(instance) => instance.state == InstanceState::Stopped,
            };
            if done {
                self.remove_pending(&token);
            }
        }
        Ok(())
    }

    pub fn is_pending(&self, uid: &str) -> bool {
        self.uid_index.contains_key(uid)
    }

    /// UIDs with a negotiation in flight; the scaling engine excludes
    /// these from victim selection.
    pub fn pending_uids(&self) -> HashSet<String> {
        self.uid_index
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    fn remove_pending(&self, token: &str) {
        if let Some((_, pending)) = self.pending.remove(token) {
            self.uid_index.remove(&pending.instance_uid);
        }
    }

    /// Periodic sweep loop; runs until cancelled.
    pub async fn run(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("shutdown negotiation sweep cancelled");
                    break;
                }
                _ = ticker.tick() => {
                    match self.check_timeouts_and_finalize().await {
                        Ok(finalized) if !finalized.is_empty() => {
                            info!(count = finalized.len(), "issued final shutdowns");
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "shutdown timeout sweep failed"),
                    }
                    if let Err(e) = self.cleanup_completed().await {
                        error!(error = %e, "shutdown cleanup failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use api_types::InstanceKind;
    use uuid::Uuid;

    use crate::store::memory::MemoryInstanceStore;

    use super::*;

    fn game_instance(uid: &str, players: usize) -> Instance {
        let mut instance = Instance::new(
            uid,
            format!("lobby-{uid}"),
            format!("pod-{uid}"),
            "10.0.0.9",
            "lobby",
            InstanceKind::Game,
        );
        instance.state = InstanceState::Running;
        instance.players = Some((0..players).map(|_| Uuid::new_v4()).collect());
        instance
    }

    async fn seeded(players: usize) -> (Arc<MemoryInstanceStore>, Arc<ShutdownManager>, Instance) {
        let store = Arc::new(MemoryInstanceStore::new());
        let instance = game_instance("u1", players);
        store.write_instance(&instance).await.unwrap();
        let manager = Arc::new(ShutdownManager::new(store.clone() as Arc<dyn InstanceStore>));
        (store, manager, instance)
    }

    async fn settle() {
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn propose_marks_instance_draining_and_publishes() {
        let (store, manager, instance) = seeded(3).await;
        let mut proposals = store.subscribe(SHUTDOWN_PROPOSE_CHANNEL).await.unwrap();

        let token = manager
            .propose_shutdown(&instance, "scale_down", Duration::from_secs(600))
            .await
            .unwrap();

        let record = store.get_instance("u1", "lobby").await.unwrap().unwrap();
        assert_eq!(record.state, InstanceState::Draining);
        assert_eq!(record.shutdown_token.as_deref(), Some(token.as_str()));
        assert_eq!(record.shutdown_reason.as_deref(), Some("scale_down"));
        assert!(record.block_until_ms.is_some());
        assert!(manager.is_pending("u1"));

        let wire = proposals.recv().await.unwrap();
        let proposal = ShutdownProposal::decode(&wire).unwrap();
        assert_eq!(proposal.token, token);
        assert_eq!(proposal.target_ip, "10.0.0.9");
        assert_eq!(proposal.max_delay_seconds, 600);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn second_proposal_for_same_instance_is_rejected() {
        let (_store, manager, instance) = seeded(0).await;
        manager
            .propose_shutdown(&instance, "scale_down", Duration::from_secs(600))
            .await
            .unwrap();
        let err = manager
            .propose_shutdown(&instance, "max_instance_age", Duration::from_secs(600))
            .await
            .unwrap_err();
        assert!(matches!(err, ShutdownError::AlreadyNegotiating { .. }));
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn proposal_for_terminal_instance_is_rejected() {
        let (store, manager, mut instance) = seeded(0).await;
        instance.state = InstanceState::Stopping;
        store.write_instance(&instance).await.unwrap();

        let err = manager
            .propose_shutdown(&instance, "scale_down", Duration::from_secs(600))
            .await
            .unwrap_err();
        assert!(matches!(err, ShutdownError::InstanceTerminal { .. }));
        assert!(!manager.is_pending("u1"));
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn unresponsive_instance_is_finalized_after_response_timeout() {
        let (store, manager, instance) = seeded(2).await;
        let mut finals = store.subscribe(SHUTDOWN_FINAL_CHANNEL).await.unwrap();
        let token = manager
            .propose_shutdown(&instance, "scale_down", Duration::from_secs(600))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(manager.check_timeouts_and_finalize().await.unwrap().is_empty());

        tokio::time::advance(Duration::from_secs(2)).await;
        let finalized = manager.check_timeouts_and_finalize().await.unwrap();
        assert_eq!(finalized, vec!["u1".to_string()]);
        assert_eq!(finals.recv().await.unwrap(), token);

        // Forced STOPPING lands after the cleanup grace period.
        settle().await;
        tokio::time::advance(CLEANUP_GRACE_PERIOD + Duration::from_secs(1)).await;
        settle().await;
        let record = store.get_instance("u1", "lobby").await.unwrap().unwrap();
        assert_eq!(record.state, InstanceState::Stopping);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn accept_with_zero_occupancy_finalizes_immediately() {
        let (_store, manager, instance) = seeded(0).await;
        let token = manager
            .propose_shutdown(&instance, "scale_down", Duration::from_secs(600))
            .await
            .unwrap();
        manager
            .handle_response(&ShutdownResponse {
                token,
                kind: ResponseKind::Accept,
                requested_seconds: None,
                reason: None,
            })
            .await
            .unwrap();

        let finalized = manager.check_timeouts_and_finalize().await.unwrap();
        assert_eq!(finalized, vec!["u1".to_string()]);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn accept_with_players_waits_for_deadline() {
        let (_store, manager, instance) = seeded(4).await;
        let token = manager
            .propose_shutdown(&instance, "scale_down", Duration::from_secs(600))
            .await
            .unwrap();
        manager
            .handle_response(&ShutdownResponse {
                token,
                kind: ResponseKind::Accept,
                requested_seconds: None,
                reason: None,
            })
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(300)).await;
        assert!(manager.check_timeouts_and_finalize().await.unwrap().is_empty());

        tokio::time::advance(Duration::from_secs(301)).await;
        assert_eq!(
            manager.check_timeouts_and_finalize().await.unwrap(),
            vec!["u1".to_string()]
        );
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn delay_is_clamped_to_the_original_maximum() {
        let (store, manager, instance) = seeded(4).await;
        let token = manager
            .propose_shutdown(&instance, "scale_down", Duration::from_secs(600))
            .await
            .unwrap();
        let original_deadline = store
            .get_instance("u1", "lobby")
            .await
            .unwrap()
            .unwrap()
            .block_until_ms
            .unwrap();

        manager
            .handle_response(&ShutdownResponse {
                token,
                kind: ResponseKind::Delay,
                requested_seconds: Some(2000),
                reason: Some("long match".into()),
            })
            .await
            .unwrap();

        let persisted = store
            .get_instance("u1", "lobby")
            .await
            .unwrap()
            .unwrap()
            .block_until_ms
            .unwrap();
        assert_eq!(persisted, original_deadline);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn delay_counts_from_the_proposal_time() {
        let (store, manager, instance) = seeded(4).await;
        let token = manager
            .propose_shutdown(&instance, "scale_down", Duration::from_secs(600))
            .await
            .unwrap();
        let proposal_deadline = store
            .get_instance("u1", "lobby")
            .await
            .unwrap()
            .unwrap()
            .block_until_ms
            .unwrap();

        manager
            .handle_response(&ShutdownResponse {
                token,
                kind: ResponseKind::Delay,
                requested_seconds: Some(120),
                reason: None,
            })
            .await
            .unwrap();

        let persisted = store
            .get_instance("u1", "lobby")
            .await
            .unwrap()
            .unwrap()
            .block_until_ms
            .unwrap();
        assert_eq!(persisted, proposal_deadline - 480_000);

        // Granted 120 s from the proposal: due after it elapses.
        tokio::time::advance(Duration::from_secs(121)).await;
        assert_eq!(
            manager.check_timeouts_and_finalize().await.unwrap(),
            vec!["u1".to_string()]
        );
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn duplicate_responses_are_ignored() {
        let (store, manager, instance) = seeded(0).await;
        let token = manager
            .propose_shutdown(&instance, "scale_down", Duration::from_secs(600))
            .await
            .unwrap();
        manager
            .handle_response(&ShutdownResponse {
                token: token.clone(),
                kind: ResponseKind::Accept,
                requested_seconds: None,
                reason: None,
            })
            .await
            .unwrap();
        let deadline_after_accept = store
            .get_instance("u1", "lobby")
            .await
            .unwrap()
            .unwrap()
            .block_until_ms;

        // A late DELAY must not overwrite the recorded ACCEPT.
        manager
            .handle_response(&ShutdownResponse {
                token,
                kind: ResponseKind::Delay,
                requested_seconds: Some(30),
                reason: None,
            })
            .await
            .unwrap();

        let deadline_after_dup = store
            .get_instance("u1", "lobby")
            .await
            .unwrap()
            .unwrap()
            .block_until_ms;
        assert_eq!(deadline_after_accept, deadline_after_dup);
        // Still finalizes via the ACCEPT zero-occupancy fast path.
        assert_eq!(
            manager.check_timeouts_and_finalize().await.unwrap(),
            vec!["u1".to_string()]
        );
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn unknown_token_is_ignored() {
        let (_store, manager, _instance) = seeded(0).await;
        manager
            .handle_response(&ShutdownResponse {
                token: "no-such-token".into(),
                kind: ResponseKind::Accept,
                requested_seconds: None,
                reason: None,
            })
            .await
            .unwrap();
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn self_managed_disables_the_fast_path_and_extends_the_deadline() {
        let (_store, manager, instance) = seeded(0).await;
        let token = manager
            .propose_shutdown(&instance, "scale_down", Duration::from_secs(600))
            .await
            .unwrap();
        manager
            .handle_response(&ShutdownResponse {
                token,
                kind: ResponseKind::SelfManaged,
                requested_seconds: None,
                reason: Some("saving world".into()),
            })
            .await
            .unwrap();

        // Zero occupancy alone must not finalize a self-managed shutdown.
        assert!(manager.check_timeouts_and_finalize().await.unwrap().is_empty());

        // Nor does the original proposal deadline.
        tokio::time::advance(Duration::from_secs(601)).await;
        assert!(manager.check_timeouts_and_finalize().await.unwrap().is_empty());

        // The safety timeout is the backstop.
        tokio::time::advance(Duration::from_secs(1200)).await;
        assert_eq!(
            manager.check_timeouts_and_finalize().await.unwrap(),
            vec!["u1".to_string()]
        );
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn self_managed_stop_is_not_clobbered_and_gets_cleaned_up() {
        let (store, manager, instance) = seeded(0).await;
        manager
            .propose_shutdown(&instance, "scale_down", Duration::from_secs(600))
            .await
            .unwrap();

        // The instance transitions itself before any finalization.
        let mut record = store.get_instance("u1", "lobby").await.unwrap().unwrap();
        record.state = InstanceState::Stopping;
        store.write_instance(&record).await.unwrap();
        record.state = InstanceState::Stopped;
        store.write_instance(&record).await.unwrap();

        // Deadline passes; finalization fires but the forced stop must not
        // downgrade the already-stopped record.
        tokio::time::advance(Duration::from_secs(601)).await;
        manager.check_timeouts_and_finalize().await.unwrap();
        settle().await;
        tokio::time::advance(CLEANUP_GRACE_PERIOD + Duration::from_secs(1)).await;
        settle().await;
        let current = store.get_instance("u1", "lobby").await.unwrap().unwrap();
        assert_eq!(current.state, InstanceState::Stopped);

        manager.cleanup_completed().await.unwrap();
        assert!(!manager.is_pending("u1"));
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn cancel_reverts_the_instance_to_running() {
        let (store, manager, instance) = seeded(0).await;
        let token = manager
            .propose_shutdown(&instance, "scale_down", Duration::from_secs(600))
            .await
            .unwrap();

        assert!(manager.cancel_shutdown(&token).await.unwrap());
        let record = store.get_instance("u1", "lobby").await.unwrap().unwrap();
        assert_eq!(record.state, InstanceState::Running);
        assert_eq!(record.shutdown_token, None);
        assert_eq!(record.block_until_ms, None);
        assert!(!manager.is_pending("u1"));
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn cancel_loses_the_race_once_finalization_started() {
        let (_store, manager, instance) = seeded(2).await;
        let token = manager
            .propose_shutdown(&instance, "scale_down", Duration::from_secs(600))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(11)).await;
        manager.check_timeouts_and_finalize().await.unwrap();

        assert!(!manager.cancel_shutdown(&token).await.unwrap());
        assert!(manager.is_pending("u1"));
    }
}
