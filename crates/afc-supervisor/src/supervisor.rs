// SPDX-License-Identifier: MIT OR Apache-2.0
//! Liveness monitoring, restart policy, quarantine, promotion gating, and
//! the regression guard.
//!
//! A single supervisor task owns every runner transition. Runners talk back
//! through two queues — heartbeats on the `orch` topic and cycle failures
//! on the health queue — so no component holds a back-pointer into another.

use afc_bus::Bus;
use afc_core::{
    Envelope, LifecycleEvent, LifecycleKind, MonotonicStamper, ORCHESTRATOR, TOPIC_ORCH,
    TOPIC_SYSTEM, now_ts,
};
use afc_config::Settings;
use afc_ledger::{Ledger, LedgerError};
use afc_registry::AgentRegistry;
use afc_stake::StakeRegistry;
use afc_telemetry::CycleMetrics;
use rand::Rng;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::cancel::CancelToken;
use crate::guard::{GuardDecision, RegressionGuard};
use crate::runner::{HealthReport, Runner, RunnerDeps, RunnerState};

/// Capability tag whose carriers the regression guard pauses.
pub const SELF_IMPROVEMENT: &str = "self-improvement";

/// Source of the scalar metric the regression guard samples.
pub type MetricSource = Arc<dyn Fn() -> Option<f64> + Send + Sync>;

/// Operator alert callback.
pub type AlertHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Errors that escape the supervisor loops.
///
/// Everything recoverable is handled internally; only ledger loss
/// propagates, and the process must treat it as fatal.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// The audit ledger failed.
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Compute the restart backoff delay for a runner.
///
/// The base is uniform over `range`; once `streak` reaches `exp_after` the
/// delay doubles per additional consecutive restart.
pub fn restart_delay<R: Rng>(
    streak: u32,
    exp_after: u32,
    range: (f64, f64),
    rng: &mut R,
) -> Duration {
    let base = rng.gen_range(range.0..=range.1);
    let factor = if streak >= exp_after {
        2f64.powi((streak - exp_after + 1).min(16) as i32)
    } else {
        1.0
    };
    Duration::from_secs_f64(base * factor)
}

/// What one liveness scan did.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ScanReport {
    /// Runners started by the promotion gate.
    pub promoted: Vec<String>,
    /// Restarted runners with the backoff delay applied, in seconds.
    pub restarted: Vec<(String, f64)>,
    /// Agents swapped for stubs this scan.
    pub quarantined: Vec<String>,
}

/// Owns all runners and enacts restart, quarantine, promotion, and
/// regression policy.
pub struct Supervisor {
    settings: Settings,
    bus: Arc<Bus>,
    ledger: Ledger,
    registry: Arc<AgentRegistry>,
    stake: Arc<StakeRegistry>,
    stamper: Arc<MonotonicStamper>,
    deps: RunnerDeps,
    runners: tokio::sync::Mutex<BTreeMap<String, Runner>>,
    health_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<HealthReport>>,
    orch_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Envelope>>,
    guard: Mutex<RegressionGuard>,
    metric_source: MetricSource,
    alert_hook: Option<AlertHook>,
}

impl Supervisor {
    /// Build a supervisor over the shared service bundle.
    #[must_use]
    pub fn new(
        settings: Settings,
        bus: Arc<Bus>,
        ledger: Ledger,
        registry: Arc<AgentRegistry>,
        stake: Arc<StakeRegistry>,
        metrics: CycleMetrics,
        metric_source: MetricSource,
        alert_hook: Option<AlertHook>,
    ) -> Self {
        let (health_tx, health_rx) = mpsc::unbounded_channel();
        let orch_rx = bus.subscribe_channel(TOPIC_ORCH);
        let stamper = Arc::new(MonotonicStamper::new());
        let deps = RunnerDeps {
            bus: Arc::clone(&bus),
            ledger: ledger.clone(),
            metrics,
            health_tx,
            stamper: Arc::clone(&stamper),
        };
        let guard = RegressionGuard::new(settings.regression_window, settings.regression_decline);
        Self {
            settings,
            bus,
            ledger,
            registry,
            stake,
            stamper,
            deps,
            runners: tokio::sync::Mutex::new(BTreeMap::new()),
            health_rx: tokio::sync::Mutex::new(health_rx),
            orch_rx: tokio::sync::Mutex::new(orch_rx),
            guard: Mutex::new(guard),
            metric_source,
            alert_hook,
        }
    }

    /// Create a pending runner for a registered agent.
    ///
    /// The runner stays in `Pending` until the promotion gate admits it on
    /// a scan.
    pub async fn add_runner(&self, name: &str) {
        let capabilities = self
            .registry
            .metadata(name)
            .map(|m| m.capabilities)
            .unwrap_or_default();
        let period = match self.settings.heartbeat_interval {
            Some(secs) => Duration::from_secs_f64(secs),
            None => self
                .registry
                .instantiate(name)
                .map(|agent| agent.cycle_period())
                .unwrap_or(Duration::from_secs(1)),
        };
        let runner = Runner::new(
            name,
            period,
            capabilities,
            Arc::clone(&self.registry),
            self.deps.clone(),
        );
        self.runners.lock().await.insert(name.to_string(), runner);
    }

    /// Publish a lifecycle event on `system` and append it to the ledger.
    ///
    /// # Errors
    ///
    /// [`LedgerError`] when the authoritative append fails.
    pub async fn emit_event(&self, event: &LifecycleEvent) -> Result<(), LedgerError> {
        let env = event.envelope(self.stamper.stamp(ORCHESTRATOR));
        if let Err(e) = self.bus.publish(TOPIC_SYSTEM, &env) {
            warn!(target: "afc.supervisor", error = %e, "lifecycle publish failed");
        }
        self.ledger.append_envelope(&env).await?;
        Ok(())
    }

    fn alert(&self, message: &str) {
        if let Some(hook) = &self.alert_hook {
            hook(message);
        }
    }

    /// Recompute the ledger Merkle root; on mismatch, slash the named agent
    /// by 10% and keep running.
    ///
    /// # Errors
    ///
    /// [`LedgerError`] when the root cannot be computed at all.
    pub async fn verify_ledger(&self, expected: &str, agent: &str) -> Result<bool, LedgerError> {
        let actual = self.ledger.merkle_root().await?;
        if actual == expected {
            return Ok(true);
        }
        warn!(target: "afc.supervisor", agent, "merkle root mismatch");
        self.stake.burn(agent, 0.10);
        self.alert(&format!("merkle root mismatch attributed to {agent}"));
        Ok(false)
    }

    /// Drain pending heartbeats, updating beat times and clearing error
    /// streaks.
    async fn drain_heartbeats(&self) {
        let mut orch_rx = self.orch_rx.lock().await;
        let runners = self.runners.lock().await;
        while let Ok(env) = orch_rx.try_recv() {
            if !afc_core::is_heartbeat(&env) {
                continue;
            }
            if let Some(runner) = runners.get(&env.sender) {
                let stats = runner.stats_handle();
                let mut stats = stats.lock().expect("runner stats poisoned");
                stats.last_beat = env.ts;
                stats.error_count = 0;
                stats.restart_streak = 0;
            }
        }
    }

    /// Drain the health queue, counting errors and enacting quarantine.
    async fn drain_health(&self, report: &mut ScanReport) -> Result<(), SupervisorError> {
        let reports: Vec<HealthReport> = {
            let mut health_rx = self.health_rx.lock().await;
            let mut out = Vec::new();
            while let Ok(r) = health_rx.try_recv() {
                out.push(r);
            }
            out
        };

        for health in reports {
            let cumulative = self.registry.record_error(&health.agent);
            {
                let runners = self.runners.lock().await;
                if let Some(runner) = runners.get(&health.agent) {
                    let stats = runner.stats_handle();
                    stats.lock().expect("runner stats poisoned").error_count += 1;
                }
            }

            let already_quarantined = self
                .registry
                .metadata(&health.agent)
                .is_some_and(|m| m.is_quarantined());
            if cumulative >= self.settings.quarantine_threshold && !already_quarantined {
                if let Ok(meta) = self.registry.quarantine(&health.agent) {
                    warn!(
                        target: "afc.supervisor",
                        agent = %health.agent,
                        errors = cumulative,
                        "quarantining agent"
                    );
                    self.emit_event(&LifecycleEvent::new(
                        LifecycleKind::Quarantine,
                        &health.agent,
                    ))
                    .await?;
                    self.alert(&format!(
                        "{} quarantined at version {}",
                        health.agent, meta.version
                    ));
                    let mut runners = self.runners.lock().await;
                    if let Some(runner) = runners.get_mut(&health.agent)
                        && runner.is_task_alive()
                        && runner.restart().await.is_ok()
                    {
                        report.quarantined.push(health.agent.clone());
                    }
                }
            }
        }
        Ok(())
    }

    /// One full scan: heartbeats, health, promotion gate, liveness.
    ///
    /// # Errors
    ///
    /// [`SupervisorError::Ledger`] — process-fatal.
    pub async fn scan_once(&self) -> Result<ScanReport, SupervisorError> {
        let mut report = ScanReport::default();
        self.drain_heartbeats().await;
        self.drain_health(&mut report).await?;

        let now = now_ts();
        let names: Vec<String> = self.runners.lock().await.keys().cloned().collect();
        for name in names {
            let (state, error_count, restart_streak, last_beat, period, task_alive) = {
                let runners = self.runners.lock().await;
                let Some(runner) = runners.get(&name) else {
                    continue;
                };
                let stats = runner.stats();
                (
                    stats.state,
                    stats.error_count,
                    stats.restart_streak,
                    stats.last_beat,
                    runner.period(),
                    runner.is_task_alive(),
                )
            };

            match state {
                RunnerState::Pending => {
                    let proposal = format!("promote:{name}");
                    if self.stake.accepted(&proposal) {
                        let mut runners = self.runners.lock().await;
                        if let Some(runner) = runners.get_mut(&name) {
                            match runner.start() {
                                Ok(()) => {
                                    info!(target: "afc.supervisor", agent = %name, "promoted");
                                    report.promoted.push(name.clone());
                                }
                                Err(e) => {
                                    warn!(target: "afc.supervisor", agent = %name, error = %e, "start failed");
                                }
                            }
                        }
                    } else {
                        info!(target: "afc.supervisor", agent = %name, "awaiting promotion");
                    }
                }
                RunnerState::Running | RunnerState::Quarantined => {
                    let beat_stale = now - last_beat > period.as_secs_f64() * 5.0;
                    let unresponsive = !task_alive
                        || error_count >= self.settings.err_threshold
                        || beat_stale;
                    if !unresponsive {
                        continue;
                    }
                    let delay = restart_delay(
                        restart_streak,
                        self.settings.backoff_exp_after,
                        self.settings.restart_delay_range,
                        &mut rand::thread_rng(),
                    );
                    warn!(
                        target: "afc.supervisor",
                        agent = %name,
                        error_count,
                        restart_streak,
                        delay_ms = delay.as_millis() as u64,
                        "runner unresponsive, restarting"
                    );
                    tokio::time::sleep(delay).await;
                    let restarted = {
                        let mut runners = self.runners.lock().await;
                        match runners.get_mut(&name) {
                            Some(runner) => runner.restart().await.is_ok(),
                            None => false,
                        }
                    };
                    if restarted {
                        self.emit_event(&LifecycleEvent::new(LifecycleKind::Restart, &name))
                            .await?;
                        self.alert(&format!("{name} restarted"));
                        report.restarted.push((name.clone(), delay.as_secs_f64()));
                    }
                }
                RunnerState::Restarting | RunnerState::Paused => {}
            }
        }
        Ok(report)
    }

    /// Sample the regression metric once and enact the guard's decision.
    ///
    /// # Errors
    ///
    /// [`SupervisorError::Ledger`] — process-fatal.
    pub async fn guard_once(&self) -> Result<GuardDecision, SupervisorError> {
        let Some(sample) = (self.metric_source)() else {
            return Ok(GuardDecision::Hold);
        };
        let decision = self
            .guard
            .lock()
            .expect("guard lock poisoned")
            .observe(sample);
        match decision {
            GuardDecision::Hold => {}
            GuardDecision::Pause { plateau } => {
                warn!(
                    target: "afc.supervisor",
                    sample,
                    plateau,
                    "best score regressed, pausing self-improvement"
                );
                self.alert("regression detected, pausing self-improvement agents");
                self.pause_self_improvers().await?;
            }
            GuardDecision::Resume => {
                info!(target: "afc.supervisor", sample, "metric recovered, resuming");
                self.resume_self_improvers().await?;
            }
        }
        Ok(decision)
    }

    async fn pause_self_improvers(&self) -> Result<(), SupervisorError> {
        let now = now_ts();
        let next_resume = now + self.settings.regression_interval.as_secs_f64();
        let names: Vec<String> = {
            let runners = self.runners.lock().await;
            runners
                .values()
                .filter(|r| r.capabilities().contains(SELF_IMPROVEMENT))
                .filter(|r| r.stats().state == RunnerState::Running)
                .map(|r| r.name().to_string())
                .collect()
        };
        for name in names {
            {
                let mut runners = self.runners.lock().await;
                if let Some(runner) = runners.get_mut(&name) {
                    runner.pause(now).await;
                    runner
                        .stats_handle()
                        .lock()
                        .expect("runner stats poisoned")
                        .next_resume_ts = next_resume;
                }
            }
            self.emit_event(&LifecycleEvent::new(LifecycleKind::Pause, &name))
                .await?;
        }
        Ok(())
    }

    async fn resume_self_improvers(&self) -> Result<(), SupervisorError> {
        let names: Vec<String> = {
            let runners = self.runners.lock().await;
            runners
                .values()
                .filter(|r| r.stats().state == RunnerState::Paused)
                .map(|r| r.name().to_string())
                .collect()
        };
        for name in names {
            let resumed = {
                let mut runners = self.runners.lock().await;
                runners
                    .get_mut(&name)
                    .is_some_and(|runner| runner.resume().is_ok())
            };
            if resumed {
                self.emit_event(&LifecycleEvent::new(LifecycleKind::Resume, &name))
                    .await?;
            }
        }
        Ok(())
    }

    /// Scan loop. Returns only on cancellation or a fatal ledger error.
    ///
    /// # Errors
    ///
    /// [`SupervisorError::Ledger`] — process-fatal.
    pub async fn run(&self, cancel: CancelToken) -> Result<(), SupervisorError> {
        loop {
            tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                () = tokio::time::sleep(self.settings.scan_interval) => {}
            }
            self.scan_once().await?;
        }
    }

    /// Regression-guard loop. Returns only on cancellation or a fatal
    /// ledger error.
    ///
    /// # Errors
    ///
    /// [`SupervisorError::Ledger`] — process-fatal.
    pub async fn run_guard(&self, cancel: CancelToken) -> Result<(), SupervisorError> {
        loop {
            tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                () = tokio::time::sleep(self.settings.regression_interval) => {}
            }
            self.guard_once().await?;
        }
    }

    /// Stop every runner loop for shutdown.
    pub async fn stop_all(&self) {
        let mut runners = self.runners.lock().await;
        for runner in runners.values_mut() {
            runner.stop().await;
        }
    }

    /// Snapshot of one runner's bookkeeping, for operators and tests.
    pub async fn runner_stats(&self, name: &str) -> Option<crate::runner::RunnerStats> {
        self.runners.lock().await.get(name).map(Runner::stats)
    }
}
