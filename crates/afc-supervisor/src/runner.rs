// SPDX-License-Identifier: MIT OR Apache-2.0
//! Per-agent cycle driver.
//!
//! A runner owns the current incarnation of exactly one agent and its cycle
//! timing. Successful cycles emit a heartbeat on the `orch` topic and a
//! best-effort ledger append; failures go to the supervisor's health queue.
//! The runner never transitions its own state — the supervisor does.

use afc_bus::Bus;
use afc_core::{MonotonicStamper, TOPIC_ORCH, heartbeat, now_ts};
use afc_ledger::Ledger;
use afc_registry::{Agent, AgentRegistry, RegistryError};
use afc_telemetry::CycleMetrics;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::cancel::CancelToken;

/// Supervisor-driven runner state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    /// Waiting on the promotion gate.
    Pending,
    /// Cycle loop active.
    Running,
    /// Between cancellation and the fresh incarnation.
    Restarting,
    /// Implementation swapped for a stub.
    Quarantined,
    /// Paused by the regression guard.
    Paused,
}

impl RunnerState {
    /// Wire name of the state.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Restarting => "restarting",
            Self::Quarantined => "quarantined",
            Self::Paused => "paused",
        }
    }
}

/// A failure reported to the supervisor's health queue.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthReport {
    /// Agent that failed.
    pub agent: String,
    /// Whether the cycle or the envelope handler raised.
    pub code: afc_core::ErrorCode,
    /// Rendered error.
    pub error: String,
    /// Seconds since the Unix epoch.
    pub ts: f64,
}

/// Mutable runner bookkeeping, read by the supervisor under one lock.
#[derive(Debug, Clone)]
pub struct RunnerStats {
    /// Current state-machine position.
    pub state: RunnerState,
    /// Timestamp of the last observed heartbeat.
    pub last_beat: f64,
    /// Consecutive errors in the current incarnation.
    pub error_count: u32,
    /// Total restarts across the runner's lifetime.
    pub restart_count: u32,
    /// Consecutive restarts without an intervening healthy beat.
    pub restart_streak: u32,
    /// When the regression guard paused this runner.
    pub paused_at: Option<f64>,
    /// Earliest timestamp at which a resume may happen (0 = none due).
    pub next_resume_ts: f64,
}

impl RunnerStats {
    fn new() -> Self {
        Self {
            state: RunnerState::Pending,
            last_beat: now_ts(),
            error_count: 0,
            restart_count: 0,
            restart_streak: 0,
            paused_at: None,
            next_resume_ts: 0.0,
        }
    }
}

/// Shared services every runner loop needs.
#[derive(Clone)]
pub struct RunnerDeps {
    /// Envelope bus for heartbeats.
    pub bus: Arc<Bus>,
    /// Audit ledger (best-effort lane).
    pub ledger: Ledger,
    /// Cycle metrics collector.
    pub metrics: CycleMetrics,
    /// Health queue consumed by the supervisor.
    pub health_tx: mpsc::UnboundedSender<HealthReport>,
    /// Per-sender monotonic timestamps.
    pub stamper: Arc<MonotonicStamper>,
}

/// Periodic cycle driver for one agent.
pub struct Runner {
    name: String,
    period: Duration,
    capabilities: BTreeSet<String>,
    registry: Arc<AgentRegistry>,
    deps: RunnerDeps,
    stats: Arc<Mutex<RunnerStats>>,
    cancel: CancelToken,
    task: Option<JoinHandle<()>>,
}

impl Runner {
    /// Create a runner for a registered agent.
    ///
    /// `period` is the agent's cycle period unless the settings override it.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        period: Duration,
        capabilities: BTreeSet<String>,
        registry: Arc<AgentRegistry>,
        deps: RunnerDeps,
    ) -> Self {
        Self {
            name: name.into(),
            period,
            capabilities,
            registry,
            deps,
            stats: Arc::new(Mutex::new(RunnerStats::new())),
            cancel: CancelToken::new(),
            task: None,
        }
    }

    /// Agent name this runner drives.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Capability tags of the driven agent.
    #[must_use]
    pub fn capabilities(&self) -> &BTreeSet<String> {
        &self.capabilities
    }

    /// Cycle period.
    #[must_use]
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Snapshot of the runner's bookkeeping.
    #[must_use]
    pub fn stats(&self) -> RunnerStats {
        self.stats.lock().expect("runner stats poisoned").clone()
    }

    /// Handle the supervisor uses to mutate bookkeeping.
    #[must_use]
    pub fn stats_handle(&self) -> Arc<Mutex<RunnerStats>> {
        Arc::clone(&self.stats)
    }

    /// Returns `true` while the loop task is alive.
    #[must_use]
    pub fn is_task_alive(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Instantiate the current implementation and start the cycle loop.
    ///
    /// # Errors
    ///
    /// [`RegistryError::Unknown`] when the agent is no longer registered.
    pub fn start(&mut self) -> Result<(), RegistryError> {
        let agent = self.registry.instantiate(&self.name)?;
        {
            let mut stats = self.stats.lock().expect("runner stats poisoned");
            stats.state = RunnerState::Running;
            stats.last_beat = now_ts();
        }
        self.cancel = CancelToken::new();
        self.spawn(agent);
        Ok(())
    }

    fn spawn(&mut self, agent: Box<dyn Agent>) {
        let name = self.name.clone();
        let period = self.period;
        let deps = self.deps.clone();
        let cancel = self.cancel.clone();
        // Each incarnation gets its own subscription to the agent's topic.
        let inbox = self.deps.bus.subscribe_channel(&self.name);
        self.task = Some(tokio::spawn(run_loop(
            name, agent, period, deps, inbox, cancel,
        )));
    }

    /// Cancel the current cycle, close the old incarnation, and resume the
    /// loop with a fresh one from the registry.
    ///
    /// A quarantine swap performed in the registry becomes effective here:
    /// the fresh incarnation is whatever the registry now holds.
    ///
    /// # Errors
    ///
    /// [`RegistryError::Unknown`] when the agent was deregistered.
    pub async fn restart(&mut self) -> Result<(), RegistryError> {
        {
            let mut stats = self.stats.lock().expect("runner stats poisoned");
            stats.state = RunnerState::Restarting;
        }
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        let agent = self.registry.instantiate(&self.name)?;
        {
            let mut stats = self.stats.lock().expect("runner stats poisoned");
            stats.error_count = 0;
            stats.restart_count += 1;
            stats.restart_streak += 1;
            stats.last_beat = now_ts();
            stats.state = if self
                .registry
                .metadata(&self.name)
                .is_some_and(|m| m.is_quarantined())
            {
                RunnerState::Quarantined
            } else {
                RunnerState::Running
            };
        }
        self.cancel = CancelToken::new();
        self.spawn(agent);
        Ok(())
    }

    /// Cancel the cycle loop and mark the runner paused.
    pub async fn pause(&mut self, at: f64) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        let mut stats = self.stats.lock().expect("runner stats poisoned");
        stats.state = RunnerState::Paused;
        stats.paused_at = Some(at);
    }

    /// Spawn a fresh loop after a pause and clear `paused_at`.
    ///
    /// # Errors
    ///
    /// [`RegistryError::Unknown`] when the agent was deregistered.
    pub fn resume(&mut self) -> Result<(), RegistryError> {
        {
            let mut stats = self.stats.lock().expect("runner stats poisoned");
            stats.paused_at = None;
            stats.next_resume_ts = 0.0;
        }
        self.start()
    }

    /// Stop the loop for shutdown.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    /// Drive exactly one cycle inline. Test hook; a no-op returning `false`
    /// while the loop task is running.
    pub async fn maybe_step(&mut self) -> bool {
        if self.is_task_alive() {
            return false;
        }
        let Ok(mut agent) = self.registry.instantiate(&self.name) else {
            return false;
        };
        run_cycle_once(&self.name, agent.as_mut(), &self.deps).await;
        agent.close().await;
        true
    }
}

/// One cycle with full bookkeeping; shared by the loop and `maybe_step`.
async fn run_cycle_once(name: &str, agent: &mut dyn Agent, deps: &RunnerDeps) {
    let t0 = Instant::now();
    match agent.run_cycle().await {
        Ok(()) => {
            let ts = deps.stamper.stamp(name);
            let beat = heartbeat(name, ts);
            deps.ledger.append_best_effort(&beat);
            if let Err(e) = deps.bus.publish(TOPIC_ORCH, &beat) {
                warn!(target: "afc.runner", agent = name, error = %e, "heartbeat publish failed");
            }
            deps.metrics.observe(name, t0.elapsed(), true);
        }
        Err(e) => {
            warn!(target: "afc.runner", agent = name, error = %e, "cycle failed");
            let _ = deps.health_tx.send(HealthReport {
                agent: name.to_string(),
                code: afc_core::ErrorCode::CycleFailure,
                error: e.to_string(),
                ts: now_ts(),
            });
            deps.metrics.observe(name, t0.elapsed(), false);
        }
    }
}

/// Dispatch one routed envelope; handler failures are caught and counted,
/// never propagated to the publisher.
async fn handle_envelope(
    name: &str,
    agent: &mut dyn Agent,
    deps: &RunnerDeps,
    env: afc_core::Envelope,
) {
    if let Err(e) = agent.handle(env).await {
        warn!(target: "afc.runner", agent = name, error = %e, "handler failed");
        let _ = deps.health_tx.send(HealthReport {
            agent: name.to_string(),
            code: afc_core::ErrorCode::HandlerFailure,
            error: e.to_string(),
            ts: now_ts(),
        });
    }
}

async fn run_loop(
    name: String,
    mut agent: Box<dyn Agent>,
    period: Duration,
    deps: RunnerDeps,
    mut inbox: mpsc::UnboundedReceiver<afc_core::Envelope>,
    cancel: CancelToken,
) {
    let mut inbox_open = true;
    while !cancel.is_cancelled() {
        run_cycle_once(&name, agent.as_mut(), &deps).await;
        if period.is_zero() {
            // A zero period still yields so peers are never starved.
            while let Ok(env) = inbox.try_recv() {
                handle_envelope(&name, agent.as_mut(), &deps, env).await;
            }
            tokio::task::yield_now().await;
        } else {
            let sleep = tokio::time::sleep(period);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        agent.close().await;
                        return;
                    }
                    maybe_env = inbox.recv(), if inbox_open => match maybe_env {
                        Some(env) => {
                            handle_envelope(&name, agent.as_mut(), &deps, env).await;
                        }
                        None => inbox_open = false,
                    },
                    () = &mut sleep => break,
                }
            }
        }
    }
    agent.close().await;
}
