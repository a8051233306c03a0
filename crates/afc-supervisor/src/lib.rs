// SPDX-License-Identifier: MIT OR Apache-2.0
//! afc-supervisor
//!
//! Runner loops, the supervising policy engine, and the orchestrator
//! service bundle.
//!
//! The [`Orchestrator`] wires the bus, ledger, registry, stake registry,
//! and archive together and passes them explicitly to everything it owns;
//! there is no process-level singleton. Its `run_forever` drives the
//! supervisor scan loop, the regression guard, Merkle-root publication, and
//! hot-directory rescans until shutdown — or until the ledger fails, the
//! one error treated as fatal.

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Cancellation token for supervisor-owned loops.
pub mod cancel;
/// Regression-guard decline detector.
pub mod guard;
/// Per-agent cycle driver.
pub mod runner;
/// Liveness, restart, quarantine, promotion, and regression policy.
pub mod supervisor;

pub use cancel::CancelToken;
pub use guard::{GuardDecision, RegressionGuard};
pub use runner::{HealthReport, Runner, RunnerDeps, RunnerState, RunnerStats};
pub use supervisor::{
    AlertHook, MetricSource, SELF_IMPROVEMENT, ScanReport, Supervisor, SupervisorError,
    restart_delay,
};

use afc_archive::{Archive, ArchiveError};
use afc_bus::{BrokerBridge, Bus};
use afc_config::Settings;
use afc_core::{Envelope, LifecycleEvent, LifecycleKind, ORCHESTRATOR, Payload, TOPIC_SYSTEM, now_ts};
use afc_ledger::{Ledger, LedgerError};
use afc_registry::{
    AgentCatalog, AgentFactory, AgentMetadata, AgentRegistry, HotDirScanner, PluginError,
    PluginVerifier, RegistryError,
};
use afc_stake::StakeRegistry;
use afc_telemetry::CycleMetrics;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Errors surfaced by the orchestrator's public operations.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// The audit ledger failed; process-fatal.
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// Registry operation failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Plugin verifier configuration failed.
    #[error(transparent)]
    Plugin(#[from] PluginError),

    /// Archive operation failed.
    #[error(transparent)]
    Archive(#[from] ArchiveError),

    /// A supervisor loop failed fatally.
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    /// The per-process experiment cap was reached.
    #[error("max concurrent experiments exceeded ({max})")]
    ExperimentCap {
        /// Configured cap.
        max: usize,
    },

    /// A blocking experiment task panicked.
    #[error("experiment task failed: {detail}")]
    ExperimentFailed {
        /// Join error detail.
        detail: String,
    },
}

/// Orchestrator-owned service bundle and lifecycle driver.
pub struct Orchestrator {
    settings: Settings,
    bus: Arc<Bus>,
    ledger: Ledger,
    registry: Arc<AgentRegistry>,
    stake: Arc<StakeRegistry>,
    archive: Arc<Archive>,
    metrics: CycleMetrics,
    supervisor: Arc<Supervisor>,
    cancel: CancelToken,
    experiments: Mutex<BTreeSet<String>>,
    scanner: Mutex<Option<Arc<HotDirScanner>>>,
}

impl Orchestrator {
    /// Build the full service bundle from settings.
    ///
    /// # Errors
    ///
    /// Ledger or archive open failures.
    pub fn new(settings: Settings) -> Result<Self, OrchestratorError> {
        Self::with_hooks(settings, None, None)
    }

    /// Build with an explicit regression-metric source and alert hook.
    ///
    /// The default metric source samples the archive's best score.
    ///
    /// # Errors
    ///
    /// Ledger or archive open failures.
    pub fn with_hooks(
        settings: Settings,
        metric_source: Option<MetricSource>,
        alert_hook: Option<AlertHook>,
    ) -> Result<Self, OrchestratorError> {
        afc_telemetry::init(settings.json_logs);

        let mut bus = Bus::new().with_max_payload(settings.max_payload_bytes);
        if let Some(url) = &settings.broker_url {
            bus = bus.with_broker(BrokerBridge::connect(url.clone()));
        }
        let bus = Arc::new(bus);

        let ledger = Ledger::open(&settings.ledger_path)?;
        let archive = Arc::new(Archive::open(&settings.archive_path)?);
        let registry = Arc::new(AgentRegistry::new());
        let stake = Arc::new(StakeRegistry::new());
        let metrics = CycleMetrics::new();

        let metric_source = metric_source.unwrap_or_else(|| {
            let archive = Arc::clone(&archive);
            Arc::new(move || archive.best_score())
        });
        let supervisor = Arc::new(Supervisor::new(
            settings.clone(),
            Arc::clone(&bus),
            ledger.clone(),
            Arc::clone(&registry),
            Arc::clone(&stake),
            metrics.clone(),
            metric_source,
            alert_hook,
        ));

        Ok(Self {
            settings,
            bus,
            ledger,
            registry,
            stake,
            archive,
            metrics,
            supervisor,
            cancel: CancelToken::new(),
            experiments: Mutex::new(BTreeSet::new()),
            scanner: Mutex::new(None),
        })
    }

    /// The envelope bus.
    #[must_use]
    pub fn bus(&self) -> &Arc<Bus> {
        &self.bus
    }

    /// The audit ledger handle.
    #[must_use]
    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// The agent registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    /// The stake registry.
    #[must_use]
    pub fn stake(&self) -> &Arc<StakeRegistry> {
        &self.stake
    }

    /// The lineage archive.
    #[must_use]
    pub fn archive(&self) -> &Arc<Archive> {
        &self.archive
    }

    /// The cycle metrics collector.
    #[must_use]
    pub fn metrics(&self) -> &CycleMetrics {
        &self.metrics
    }

    /// The supervisor policy engine.
    #[must_use]
    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    /// Attach the hot-directory plugin scanner driven by the rescan loop.
    ///
    /// Honours `AGENT_HOT_DIR` (no directory configured → no scanner,
    /// returns `false`) and `ALLOW_INSECURE` (signature enforcement is
    /// skipped for local development). An immediate first scan runs before
    /// the rescan cadence takes over.
    ///
    /// # Errors
    ///
    /// Invalid key material when signatures are enforced.
    pub fn attach_hot_dir(
        &self,
        pubkey_b64: Option<&str>,
        pinned: BTreeMap<String, String>,
        catalog: AgentCatalog,
    ) -> Result<bool, OrchestratorError> {
        let Some(dir) = &self.settings.hot_dir else {
            return Ok(false);
        };
        let verifier = if self.settings.allow_insecure {
            PluginVerifier::insecure()
        } else {
            let key = pubkey_b64.ok_or_else(|| PluginError::BadKeyMaterial {
                detail: "no public key configured".into(),
            })?;
            PluginVerifier::new(key)?.with_pinned(pinned)
        };
        let scanner = Arc::new(HotDirScanner::new(dir, verifier, catalog));
        scanner.scan(&self.registry);
        *self.scanner.lock().expect("scanner lock poisoned") = Some(scanner);
        Ok(true)
    }

    /// Register an agent, grant initial stake, gate its promotion, and
    /// create its pending runner.
    ///
    /// # Errors
    ///
    /// Duplicate registration, or a ledger failure while recording the
    /// `register` event.
    pub async fn add_agent(
        &self,
        meta: AgentMetadata,
        factory: AgentFactory,
    ) -> Result<(), OrchestratorError> {
        let name = meta.name.clone();
        let capabilities: Vec<String> = meta.capabilities.iter().cloned().collect();
        self.registry.register(meta, factory, false)?;

        self.stake.set_stake(&name, 1.0);
        let proposal = format!("promote:{name}");
        self.stake
            .set_threshold(&proposal, self.settings.promotion_threshold);
        self.stake.support(&proposal, &name);

        self.supervisor.add_runner(&name).await;
        self.supervisor
            .emit_event(
                &LifecycleEvent::new(LifecycleKind::Register, &name)
                    .with_capabilities(capabilities),
            )
            .await?;
        info!(target: "afc.orchestrator", agent = %name, "agent added");
        Ok(())
    }

    /// Run a CPU-bound experiment on the blocking pool and record its
    /// result in the archive.
    ///
    /// Experiments are capped per process by `MAX_EXPERIMENTS`, counted by
    /// distinct experiment id.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::ExperimentCap`] at the cap; archive failures.
    pub async fn run_experiment<F>(
        &self,
        experiment_id: &str,
        scenario: &str,
        run: F,
    ) -> Result<u64, OrchestratorError>
    where
        F: FnOnce() -> (serde_json::Value, f64) + Send + 'static,
    {
        {
            let mut experiments = self.experiments.lock().expect("experiments lock poisoned");
            if !experiments.contains(experiment_id) {
                if experiments.len() >= self.settings.max_experiments {
                    return Err(OrchestratorError::ExperimentCap {
                        max: self.settings.max_experiments,
                    });
                }
                experiments.insert(experiment_id.to_string());
            }
        }

        let (payload, score) = tokio::task::spawn_blocking(run).await.map_err(|e| {
            OrchestratorError::ExperimentFailed {
                detail: e.to_string(),
            }
        })?;
        let entry = self.archive.add(
            None,
            serde_json::json!({
                "experiment_id": experiment_id,
                "scenario": scenario,
                "result": payload,
            }),
            score,
        )?;
        Ok(entry)
    }

    /// Verify the ledger's Merkle root, slashing `agent` by 10% on
    /// mismatch. Returns `true` when the roots agree.
    ///
    /// # Errors
    ///
    /// [`LedgerError`] when the root cannot be computed.
    pub async fn verify_ledger(
        &self,
        expected: &str,
        agent: &str,
    ) -> Result<bool, OrchestratorError> {
        Ok(self.supervisor.verify_ledger(expected, agent).await?)
    }

    /// Request shutdown of every loop started by `run_forever`.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Run until shutdown.
    ///
    /// # Errors
    ///
    /// Only [`OrchestratorError::Ledger`]-class failures escape; every
    /// other error is handled internally.
    pub async fn run_forever(&self) -> Result<(), OrchestratorError> {
        apply_address_space_cap(self.settings.address_space_limit);

        let (fatal_tx, mut fatal_rx) = mpsc::channel::<SupervisorError>(1);

        let scan = {
            let supervisor = Arc::clone(&self.supervisor);
            let cancel = self.cancel.clone();
            let fatal = fatal_tx.clone();
            tokio::spawn(async move {
                if let Err(e) = supervisor.run(cancel).await {
                    let _ = fatal.send(e).await;
                }
            })
        };
        let regression = {
            let supervisor = Arc::clone(&self.supervisor);
            let cancel = self.cancel.clone();
            let fatal = fatal_tx.clone();
            tokio::spawn(async move {
                if let Err(e) = supervisor.run_guard(cancel).await {
                    let _ = fatal.send(e).await;
                }
            })
        };
        let ledger_roots = {
            let ledger = self.ledger.clone();
            let bus = Arc::clone(&self.bus);
            let interval = self.settings.merkle_interval;
            let cancel = self.cancel.clone();
            let fatal = fatal_tx.clone();
            tokio::spawn(async move {
                if let Err(e) = publish_roots(ledger, bus, interval, cancel, "merkle_root").await {
                    let _ = fatal.send(SupervisorError::Ledger(e)).await;
                }
            })
        };
        let archive_roots = {
            let archive = Arc::clone(&self.archive);
            let ledger = self.ledger.clone();
            let bus = Arc::clone(&self.bus);
            let interval = self.settings.archive_root_interval;
            let cancel = self.cancel.clone();
            let fatal = fatal_tx.clone();
            tokio::spawn(async move {
                if let Err(e) =
                    publish_archive_roots(archive, ledger, bus, interval, cancel).await
                {
                    let _ = fatal.send(SupervisorError::Ledger(e)).await;
                }
            })
        };
        let rescan = {
            let scanner = self.scanner.lock().expect("scanner lock poisoned").clone();
            let registry = Arc::clone(&self.registry);
            let interval = self.settings.rescan_interval;
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                let Some(scanner) = scanner else { return };
                loop {
                    tokio::select! {
                        () = cancel.cancelled() => return,
                        () = tokio::time::sleep(interval) => {}
                    }
                    let report = scanner.scan(&registry);
                    if !report.loaded.is_empty() {
                        info!(target: "afc.orchestrator", loaded = report.loaded.len(), "hot-dir scan loaded agents");
                    }
                }
            })
        };
        drop(fatal_tx);

        let result = tokio::select! {
            () = self.cancel.cancelled() => Ok(()),
            fatal = fatal_rx.recv() => match fatal {
                Some(e) => Err(OrchestratorError::from(e)),
                None => Ok(()),
            },
        };

        // Orderly teardown regardless of why we are leaving.
        self.cancel.cancel();
        for task in [scan, regression, ledger_roots, archive_roots, rescan] {
            let _ = task.await;
        }
        self.supervisor.stop_all().await;
        if self.settings.broker_url.is_some() {
            self.bus.close();
        }
        result
    }
}

/// Apply the optional per-process address-space cap.
///
/// Unsupported hosts are tolerated silently apart from a debug line.
fn apply_address_space_cap(limit: Option<u64>) {
    let Some(limit) = limit else { return };
    match rlimit::Resource::AS.set(limit, limit) {
        Ok(()) => debug!(target: "afc.orchestrator", limit, "address-space cap applied"),
        Err(e) => debug!(target: "afc.orchestrator", error = %e, "address-space cap unsupported"),
    }
}

/// Periodically publish the ledger Merkle root as a system envelope.
async fn publish_roots(
    ledger: Ledger,
    bus: Arc<Bus>,
    interval: std::time::Duration,
    cancel: CancelToken,
    key: &'static str,
) -> Result<(), LedgerError> {
    loop {
        tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            () = tokio::time::sleep(interval) => {}
        }
        let root = ledger.merkle_root().await?;
        let mut payload = Payload::new();
        payload.insert(key, root);
        let env = Envelope::new(ORCHESTRATOR, TOPIC_SYSTEM)
            .with_payload(payload)
            .with_ts(now_ts());
        if let Err(e) = bus.publish(TOPIC_SYSTEM, &env) {
            warn!(target: "afc.orchestrator", error = %e, "root publish failed");
        }
        ledger.append_envelope(&env).await?;
    }
}

/// Periodically publish the archive root as a system envelope.
async fn publish_archive_roots(
    archive: Arc<Archive>,
    ledger: Ledger,
    bus: Arc<Bus>,
    interval: std::time::Duration,
    cancel: CancelToken,
) -> Result<(), LedgerError> {
    loop {
        tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            () = tokio::time::sleep(interval) => {}
        }
        let root = archive.merkle_root();
        let mut payload = Payload::new();
        payload.insert("archive_root", root);
        let env = Envelope::new(ORCHESTRATOR, TOPIC_SYSTEM)
            .with_payload(payload)
            .with_ts(now_ts());
        if let Err(e) = bus.publish(TOPIC_SYSTEM, &env) {
            warn!(target: "afc.orchestrator", error = %e, "archive root publish failed");
        }
        ledger.append_envelope(&env).await?;
    }
}
