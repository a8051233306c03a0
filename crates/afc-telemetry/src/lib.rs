// SPDX-License-Identifier: MIT OR Apache-2.0
//! afc-telemetry
//!
//! Structured logging setup and per-agent cycle metrics.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// Initialise the global tracing subscriber.
///
/// Respects `RUST_LOG`; defaults to `info`. With `json` set, events are
/// emitted as JSON lines. Safe to call more than once — later calls are
/// no-ops, which keeps tests happy.
pub fn init(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if result.is_err() {
        debug!(target: "afc.telemetry", "subscriber already installed");
    }
}

// ---------------------------------------------------------------------------
// Cycle metrics
// ---------------------------------------------------------------------------

/// One recorded agent cycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CycleSample {
    /// Agent that ran the cycle.
    pub agent: String,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
    /// Whether the cycle completed without error.
    pub ok: bool,
}

/// Aggregated statistics for one agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CycleSummary {
    /// Number of recorded cycles.
    pub count: usize,
    /// Mean duration in milliseconds.
    pub mean_ms: f64,
    /// Median duration in milliseconds.
    pub p50_ms: f64,
    /// 99th-percentile duration in milliseconds.
    pub p99_ms: f64,
    /// Fraction of cycles that failed.
    pub error_rate: f64,
}

/// Compute a percentile value from a **sorted** slice.
fn percentile(sorted: &[u64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    if sorted.len() == 1 {
        return sorted[0] as f64;
    }
    let rank = pct / 100.0 * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let frac = rank - lower as f64;
    sorted[lower] as f64 * (1.0 - frac) + sorted[upper] as f64 * frac
}

/// Thread-safe collector of [`CycleSample`]s.
///
/// Clone freely — all clones share the same storage.
#[derive(Debug, Clone, Default)]
pub struct CycleMetrics {
    inner: Arc<Mutex<Vec<CycleSample>>>,
}

impl CycleMetrics {
    /// Create an empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one cycle observation.
    pub fn observe(&self, agent: &str, duration: Duration, ok: bool) {
        let sample = CycleSample {
            agent: agent.to_string(),
            duration_ms: duration.as_millis() as u64,
            ok,
        };
        debug!(
            target: "afc.telemetry",
            agent,
            duration_ms = sample.duration_ms,
            ok,
            "cycle observed"
        );
        self.inner.lock().expect("metrics lock poisoned").push(sample);
    }

    /// Total number of recorded samples across all agents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().expect("metrics lock poisoned").len()
    }

    /// Returns `true` when nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Summarise recorded cycles per agent, in name order.
    #[must_use]
    pub fn summarise(&self) -> BTreeMap<String, CycleSummary> {
        let samples = self.inner.lock().expect("metrics lock poisoned");
        let mut by_agent: BTreeMap<String, Vec<&CycleSample>> = BTreeMap::new();
        for s in samples.iter() {
            by_agent.entry(s.agent.clone()).or_default().push(s);
        }
        by_agent
            .into_iter()
            .map(|(agent, samples)| {
                let mut durations: Vec<u64> = samples.iter().map(|s| s.duration_ms).collect();
                durations.sort_unstable();
                let errors = samples.iter().filter(|s| !s.ok).count();
                let mean = durations.iter().sum::<u64>() as f64 / durations.len() as f64;
                let summary = CycleSummary {
                    count: samples.len(),
                    mean_ms: mean,
                    p50_ms: percentile(&durations, 50.0),
                    p99_ms: percentile(&durations, 99.0),
                    error_rate: errors as f64 / samples.len() as f64,
                };
                (agent, summary)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_collector_summarises_to_nothing() {
        let metrics = CycleMetrics::new();
        assert!(metrics.is_empty());
        assert!(metrics.summarise().is_empty());
    }

    #[test]
    fn summary_groups_by_agent() {
        let metrics = CycleMetrics::new();
        metrics.observe("a", Duration::from_millis(10), true);
        metrics.observe("a", Duration::from_millis(30), false);
        metrics.observe("b", Duration::from_millis(20), true);
        let summary = metrics.summarise();
        assert_eq!(summary.len(), 2);
        assert_eq!(summary["a"].count, 2);
        assert_eq!(summary["a"].mean_ms, 20.0);
        assert_eq!(summary["a"].error_rate, 0.5);
        assert_eq!(summary["b"].count, 1);
        assert_eq!(summary["b"].error_rate, 0.0);
    }

    #[test]
    fn percentile_interpolates() {
        let sorted = [10, 20, 30, 40];
        assert_eq!(percentile(&sorted, 50.0), 25.0);
        assert_eq!(percentile(&sorted, 0.0), 10.0);
        assert_eq!(percentile(&sorted, 100.0), 40.0);
    }

    #[test]
    fn percentile_of_single_sample() {
        assert_eq!(percentile(&[7], 99.0), 7.0);
        assert_eq!(percentile(&[], 50.0), 0.0);
    }

    #[test]
    fn clones_share_storage() {
        let metrics = CycleMetrics::new();
        let clone = metrics.clone();
        clone.observe("a", Duration::from_millis(5), true);
        assert_eq!(metrics.len(), 1);
    }

    #[test]
    fn sample_serialises() {
        let s = CycleSample {
            agent: "a".into(),
            duration_ms: 12,
            ok: true,
        };
        let json = serde_json::to_string(&s).unwrap();
        assert!(json.contains("duration_ms"));
    }
}
