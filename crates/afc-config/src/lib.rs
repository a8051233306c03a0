// SPDX-License-Identifier: MIT OR Apache-2.0
//! afc-config
//!
//! Environment-driven runtime settings for the Alpha-Factory core.
//!
//! [`Settings`] collects every supervision, admission, and transport knob in
//! one place. [`Settings::from_env`] reads the documented environment
//! variables; unparseable values fall back to their defaults with a warning
//! so a typo never takes the orchestrator down.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

/// Default serialised-payload cap in bytes (1 MiB).
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 1024 * 1024;

/// Default per-process address-space cap in bytes (8 GiB).
pub const DEFAULT_ADDRESS_SPACE_LIMIT: u64 = 8 * 1024 * 1024 * 1024;

/// Runtime settings for the orchestration core.
///
/// Fields without an environment variable are programmatic knobs with fixed
/// defaults, exposed mainly so tests can compress timescales.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// `AGENT_ERR_THRESHOLD` — consecutive-error count that marks a runner
    /// unresponsive and, cumulatively, quarantines the agent. Default 3.
    pub err_threshold: u32,

    /// `AGENT_QUARANTINE_THRESHOLD` — cumulative error count after which an
    /// agent is swapped for a stub. Default 3.
    pub quarantine_threshold: u32,

    /// `AGENT_BACKOFF_EXP_AFTER` — restart streak after which the restart
    /// delay grows exponentially. Default 3.
    pub backoff_exp_after: u32,

    /// `PROMOTION_THRESHOLD` — stake fraction required to promote an agent,
    /// clamped to `[0, 1]`. Default 0 (auto-admit).
    pub promotion_threshold: f64,

    /// `HEARTBEAT_INT` — maximum interval between beats in seconds.
    /// `None` means each agent's own cycle period applies.
    pub heartbeat_interval: Option<f64>,

    /// `RESCAN_SEC` — hot-directory rescan cadence in seconds. Default 60.
    pub rescan_interval: Duration,

    /// `LEDGER_PATH` — audit ledger file location. The parent directory must
    /// exist.
    pub ledger_path: PathBuf,

    /// `ARCHIVE_PATH` — lineage archive file location.
    pub archive_path: PathBuf,

    /// `BROKER_URL` — `host:port` of the external broker bridge. `None`
    /// disables forwarding.
    pub broker_url: Option<String>,

    /// `ALLOW_INSECURE` — disables plugin signature enforcement. Local
    /// development only. Default false.
    pub allow_insecure: bool,

    /// `MAX_EXPERIMENTS` — per-process cap on concurrent experiments.
    /// Default 10.
    pub max_experiments: usize,

    /// `MAX_PAYLOAD_BYTES` — serialised payload cap enforced at publish
    /// time. Default 1 MiB.
    pub max_payload_bytes: usize,

    /// `AGENT_HOT_DIR` — directory scanned for signed plugin bundles.
    pub hot_dir: Option<PathBuf>,

    /// `REGRESSION_WINDOW` — number of samples in the regression-guard
    /// rolling window. Default 5.
    pub regression_window: usize,

    /// `REGRESSION_DECLINE` — fractional decline from the window plateau
    /// that triggers a pause. Default 0.2.
    pub regression_decline: f64,

    /// Sampling interval for the regression guard. Default 30 s.
    pub regression_interval: Duration,

    /// Liveness scan interval. Default 2 s.
    pub scan_interval: Duration,

    /// Bounds of the uniform restart-delay jitter in seconds.
    /// Default `(0.5, 1.5)`.
    pub restart_delay_range: (f64, f64),

    /// Preflight wall-clock timeout. Default 300 s.
    pub preflight_timeout: Duration,

    /// Cadence of ledger Merkle-root publication. Default 1 h.
    pub merkle_interval: Duration,

    /// Cadence of archive root publication. Default 24 h.
    pub archive_root_interval: Duration,

    /// Optional per-process address-space cap in bytes. Default 8 GiB.
    pub address_space_limit: Option<u64>,

    /// Emit JSON-formatted logs. Default false.
    pub json_logs: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            err_threshold: 3,
            quarantine_threshold: 3,
            backoff_exp_after: 3,
            promotion_threshold: 0.0,
            heartbeat_interval: None,
            rescan_interval: Duration::from_secs(60),
            ledger_path: PathBuf::from("audit.ledger"),
            archive_path: PathBuf::from("archive.jsonl"),
            broker_url: None,
            allow_insecure: false,
            max_experiments: 10,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            hot_dir: None,
            regression_window: 5,
            regression_decline: 0.2,
            regression_interval: Duration::from_secs(30),
            scan_interval: Duration::from_secs(2),
            restart_delay_range: (0.5, 1.5),
            preflight_timeout: Duration::from_secs(300),
            merkle_interval: Duration::from_secs(3600),
            archive_root_interval: Duration::from_secs(86_400),
            address_space_limit: Some(DEFAULT_ADDRESS_SPACE_LIMIT),
            json_logs: false,
        }
    }
}

impl Settings {
    /// Load settings from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load settings from an arbitrary key lookup.
    ///
    /// The lookup abstraction keeps parsing testable without touching the
    /// process environment.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            err_threshold: parse_or(&get, "AGENT_ERR_THRESHOLD", defaults.err_threshold),
            quarantine_threshold: parse_or(
                &get,
                "AGENT_QUARANTINE_THRESHOLD",
                defaults.quarantine_threshold,
            ),
            backoff_exp_after: parse_or(
                &get,
                "AGENT_BACKOFF_EXP_AFTER",
                defaults.backoff_exp_after,
            ),
            promotion_threshold: parse_or(
                &get,
                "PROMOTION_THRESHOLD",
                defaults.promotion_threshold,
            )
            .clamp(0.0, 1.0),
            heartbeat_interval: get("HEARTBEAT_INT").and_then(|v| match v.parse::<f64>() {
                Ok(secs) if secs > 0.0 => Some(secs),
                _ => {
                    warn!(target: "afc.config", value = %v, "ignoring invalid HEARTBEAT_INT");
                    None
                }
            }),
            rescan_interval: Duration::from_secs_f64(
                parse_or(&get, "RESCAN_SEC", 60.0f64).max(1.0),
            ),
            ledger_path: get("LEDGER_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.ledger_path),
            archive_path: get("ARCHIVE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.archive_path),
            broker_url: get("BROKER_URL").filter(|v| !v.is_empty()),
            allow_insecure: parse_bool(&get, "ALLOW_INSECURE", defaults.allow_insecure),
            max_experiments: parse_or(&get, "MAX_EXPERIMENTS", defaults.max_experiments),
            max_payload_bytes: parse_or(&get, "MAX_PAYLOAD_BYTES", defaults.max_payload_bytes),
            hot_dir: get("AGENT_HOT_DIR").filter(|v| !v.is_empty()).map(PathBuf::from),
            regression_window: parse_or(&get, "REGRESSION_WINDOW", defaults.regression_window)
                .max(2),
            regression_decline: parse_or(&get, "REGRESSION_DECLINE", defaults.regression_decline)
                .clamp(0.0, 1.0),
            ..defaults
        }
    }
}

/// Parse an environment value, falling back to `default` with a warning.
fn parse_or<T: std::str::FromStr + std::fmt::Display>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    match get(key) {
        Some(raw) => match raw.parse() {
            Ok(v) => v,
            Err(_) => {
                warn!(target: "afc.config", %key, value = %raw, %default, "unparseable value, using default");
                default
            }
        },
        None => default,
    }
}

/// Accepts `1`, `true`, `yes`, `on` (case-insensitive) as true.
fn parse_bool(get: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> bool {
    match get(key) {
        Some(raw) => matches!(
            raw.to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        None => default,
    }
}
