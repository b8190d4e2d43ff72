use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use api_types::InstanceState;
use api_types::InstanceStateChange;
use api_types::ShutdownResponse;
use api_types::FLEET_TOGGLE_CHANNEL;
use api_types::INSTANCE_STATE_CHANNEL;
use api_types::SHUTDOWN_RESPONSE_CHANNEL;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::app::core::Application;
use crate::reconcile;
use crate::reconcile::ReconcileRequest;
use crate::reconcile::ResourceKind;
use crate::shutdown::DEFAULT_MAX_DELAY;
use crate::util::epoch_ms;

/// Task manager, responsible for starting and managing all background tasks
pub struct Tasks {
    pub tasks: Vec<JoinHandle<()>>,
    cancellation_token: CancellationToken,
}

impl Default for Tasks {
    fn default() -> Self {
        Self::new()
    }
}

impl Tasks {
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Start all background tasks
    pub fn spawn_all_tasks(&mut self, app: &Application) -> Result<()> {
        // Fleet resource watcher feeding the reconciliation queue
        let fleet_watcher_task = {
            let watcher = app.services().fleet_watcher.clone();
            let token = self.cancellation_token.clone();
            tokio::spawn(async move {
                tracing::info!("Starting fleet watcher task");
                watcher.run(token).await;
                tracing::info!("Fleet watcher task completed");
            })
        };
        self.tasks.push(fleet_watcher_task);

        // Instance pod discovery
        let discovery_task = {
            let discovery = app.services().discovery.clone();
            let token = self.cancellation_token.clone();
            tokio::spawn(async move {
                tracing::info!("Starting instance discovery task");
                discovery.run(token).await;
                tracing::info!("Instance discovery task completed");
            })
        };
        self.tasks.push(discovery_task);

        // The reconciliation worker draining the queue
        let worker_task = {
            let queue = app.services().queue.clone();
            let reconciler = app.services().reconciler.clone();
            let token = self.cancellation_token.clone();
            tokio::spawn(async move {
                reconcile::run_worker(queue, reconciler, token).await;
            })
        };
        self.tasks.push(worker_task);

        // Shutdown negotiation timeout sweep
        let sweep_task = {
            let manager = app.services().shutdown_manager.clone();
            let interval = app.daemon_args().shutdown_check_interval();
            let token = self.cancellation_token.clone();
            tokio::spawn(async move {
                tracing::info!("Starting shutdown sweep task");
                manager.run(interval, token).await;
                tracing::info!("Shutdown sweep task completed");
            })
        };
        self.tasks.push(sweep_task);

        self.tasks.push(self.spawn_response_listener_task(app));
        self.tasks.push(self.spawn_state_listener_task(app));
        self.tasks.push(self.spawn_toggle_listener_task(app));
        self.tasks.push(self.spawn_age_checker_task(app));

        Ok(())
    }

    /// wait for tasks to complete or receive shutdown signal
    pub async fn wait_for_completion(&mut self) -> Result<()> {
        let signal_handler = {
            #[cfg(unix)]
            {
                use tokio::signal::unix::signal;
                use tokio::signal::unix::SignalKind;
                let mut sigterm = signal(SignalKind::terminate())?;
                let mut sigint = signal(SignalKind::interrupt())?;

                tokio::spawn(async move {
                    tokio::select! {
                        _ = sigterm.recv() => {
                            tracing::info!("Received SIGTERM, initiating graceful shutdown");
                        }
                        _ = sigint.recv() => {
                            tracing::info!("Received SIGINT, initiating graceful shutdown");
                        }
                    }
                })
            }
            #[cfg(not(unix))]
            {
                tokio::spawn(async {
                    tokio::signal::ctrl_c()
                        .await
                        .expect("Failed to install Ctrl+C handler");
                    tracing::info!("Received Ctrl+C, initiating graceful shutdown");
                })
            }
        };

        tokio::select! {
            _ = signal_handler => {
                tracing::info!("Shutdown signal received, cancelling all tasks");
                self.cancellation_token.cancel();
                self.wait_for_tasks_with_timeout(Duration::from_secs(30)).await;
            }
            result = futures::future::select_all(&mut self.tasks) => {
                let (result, _index, _remaining) = result;
                if let Err(e) = result {
                    tracing::error!("Task completed with error: {e}");
                    return Err(e.into());
                }
                tracing::warn!("Task completed unexpectedly");
            }
        }

        Ok(())
    }

    async fn wait_for_tasks_with_timeout(&mut self, timeout: Duration) {
        tokio::time::timeout(timeout, async {
            for task in &mut self.tasks {
                if let Err(e) = task.await {
                    tracing::error!("Task failed during shutdown: {e}");
                }
            }
        })
        .await
        .unwrap_or_else(|_| {
            tracing::warn!("Task shutdown timed out after {:?}", timeout);
        });
    }

    /// Forward shutdown responses from the store channel to the manager.
    fn spawn_response_listener_task(&self, app: &Application) -> JoinHandle<()> {
        let store = app.services().store.clone();
        let manager = app.services().shutdown_manager.clone();
        let token = self.cancellation_token.clone();

        tokio::spawn(async move {
            tracing::info!("Starting shutdown response listener");
            let mut messages = match store.subscribe(SHUTDOWN_RESPONSE_CHANNEL).await {
                Ok(messages) => messages,
                Err(e) => {
                    tracing::error!(error = %e, "cannot subscribe to shutdown responses");
                    return;
                }
            };
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        tracing::info!("Shutdown response listener cancelled");
                        break;
                    }
                    message = messages.recv() => {
                        let Some(message) = message else { break };
                        match ShutdownResponse::decode(&message) {
                            Ok(response) => {
                                if let Err(e) = manager.handle_response(&response).await {
                                    tracing::error!(error = %e, "failed to handle shutdown response");
                                }
                            }
                            Err(e) => {
                                tracing::error!(error = %e, message, "malformed shutdown response")
                            }
                        }
                    }
                }
            }
        })
    }

    /// Apply instance state transitions published on the store channel and
    /// delete the backing pod when STOPPING is observed.
    fn spawn_state_listener_task(&self, app: &Application) -> JoinHandle<()> {
        let store = app.services().store.clone();
        let registry = app.services().registry.clone();
        let workloads = app.services().workloads.clone();
        let token = self.cancellation_token.clone();

        tokio::spawn(async move {
            tracing::info!("Starting instance state listener");
            let mut messages = match store.subscribe(INSTANCE_STATE_CHANNEL).await {
                Ok(messages) => messages,
                Err(e) => {
                    tracing::error!(error = %e, "cannot subscribe to instance state changes");
                    return;
                }
            };
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        tracing::info!("Instance state listener cancelled");
                        break;
                    }
                    message = messages.recv() => {
                        let Some(message) = message else { break };
                        let change = match InstanceStateChange::decode(&message) {
                            Ok(change) => change,
                            Err(e) => {
                                tracing::error!(error = %e, message, "malformed state change");
                                continue;
                            }
                        };
                        for wrapper in registry.list() {
                            let instances = match store.get_instances(wrapper.name()).await {
                                Ok(instances) => instances,
                                Err(e) => {
                                    tracing::error!(fleet = %wrapper.name(), error = %e, "instance fetch failed");
                                    continue;
                                }
                            };
                            let Some(record) = instances.into_iter().find(|i| i.ip == change.ip)
                            else {
                                continue;
                            };

                            let mut updated = record.clone();
                            updated.state = change.state;
                            match store.write_instance(&updated).await {
                                Ok(true) => tracing::info!(
                                    instance = %record.name,
                                    state = %change.state,
                                    "applied instance state transition"
                                ),
                                Ok(false) => tracing::debug!(
                                    instance = %record.name,
                                    state = %change.state,
                                    "state transition rejected by terminal guard"
                                ),
                                Err(e) => {
                                    tracing::error!(instance = %record.name, error = %e, "state write failed")
                                }
                            }

                            if change.state == InstanceState::Stopping {
                                if let Err(e) = workloads
                                    .delete_pod(wrapper.namespace(), &record.pod_name)
                                    .await
                                {
                                    tracing::error!(
                                        pod = %record.pod_name,
                                        error = %e,
                                        "pod deletion after STOPPING failed"
                                    );
                                }
                            }
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Enqueue a reconcile when a fleet's enabled flag is toggled.
    fn spawn_toggle_listener_task(&self, app: &Application) -> JoinHandle<()> {
        let store = app.services().store.clone();
        let registry = app.services().registry.clone();
        let queue = app.services().queue.clone();
        let token = self.cancellation_token.clone();

        tokio::spawn(async move {
            tracing::info!("Starting fleet toggle listener");
            let mut messages = match store.subscribe(FLEET_TOGGLE_CHANNEL).await {
                Ok(messages) => messages,
                Err(e) => {
                    tracing::error!(error = %e, "cannot subscribe to fleet toggles");
                    return;
                }
            };
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        tracing::info!("Fleet toggle listener cancelled");
                        break;
                    }
                    message = messages.recv() => {
                        let Some(fleet_name) = message else { break };
                        match registry.get(&fleet_name) {
                            Some(wrapper) => {
                                queue.enqueue(ReconcileRequest::new(
                                    wrapper.namespace(),
                                    &fleet_name,
                                    ResourceKind::Fleet,
                                ));
                            }
                            None => tracing::debug!(
                                fleet = %fleet_name,
                                "toggle for unknown fleet, watcher will pick it up"
                            ),
                        }
                    }
                }
            }
        })
    }

    /// Propose shutdown for instances past the fleet's maxInstanceAge.
    fn spawn_age_checker_task(&self, app: &Application) -> JoinHandle<()> {
        let registry = app.services().registry.clone();
        let manager = app.services().shutdown_manager.clone();
        let interval = app.daemon_args().age_check_interval();
        let token = self.cancellation_token.clone();

        tokio::spawn(async move {
            tracing::info!("Starting instance age checker");
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        tracing::info!("Instance age checker cancelled");
                        break;
                    }
                    _ = ticker.tick() => {
                        let now_ms = epoch_ms();
                        for wrapper in registry.list() {
                            let Some(max_age) = wrapper.max_instance_age() else {
                                continue;
                            };
                            let max_age_ms = max_age.as_millis() as u64;
                            for instance in wrapper.instances().iter() {
                                if instance.state.is_terminating()
                                    || manager.is_pending(&instance.uid)
                                    || instance.created_at_ms == 0
                                {
                                    continue;
                                }
                                let age_ms = now_ms.saturating_sub(instance.created_at_ms);
                                if age_ms < max_age_ms {
                                    continue;
                                }
                                tracing::info!(
                                    instance = %instance.name,
                                    fleet = %wrapper.name(),
                                    age_secs = age_ms / 1000,
                                    "instance exceeded max age, proposing shutdown"
                                );
                                if let Err(e) = manager
                                    .propose_shutdown(instance, "max_instance_age", DEFAULT_MAX_DELAY)
                                    .await
                                {
                                    tracing::warn!(
                                        instance = %instance.name,
                                        error = %e,
                                        "age-based shutdown proposal failed"
                                    );
                                }
                            }
                        }
                    }
                }
            }
        })
    }
}
