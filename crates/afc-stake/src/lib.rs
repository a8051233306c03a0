// SPDX-License-Identifier: MIT OR Apache-2.0
//! afc-stake
//!
//! Lock-guarded stake ledger gating promotions and recording slashes.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use tracing::info;

/// Smallest stake a burn can leave behind, so operators can revive an agent.
pub const MIN_STAKE: f64 = 1e-4;

#[derive(Debug, Default)]
struct Inner {
    stakes: BTreeMap<String, f64>,
    thresholds: BTreeMap<String, f64>,
    supporters: BTreeMap<String, BTreeSet<String>>,
}

/// Per-agent stake with slashing and proposal thresholds.
///
/// All operations take the single internal lock; the registry is cheap to
/// share behind an `Arc`.
#[derive(Debug, Default)]
pub struct StakeRegistry {
    inner: Mutex<Inner>,
}

impl StakeRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set an agent's stake, clamped to `(0, 1]`.
    pub fn set_stake(&self, agent: &str, stake: f64) {
        let clamped = stake.clamp(MIN_STAKE, 1.0);
        self.inner
            .lock()
            .expect("stake lock poisoned")
            .stakes
            .insert(agent.to_string(), clamped);
    }

    /// Current stake of an agent, if registered.
    #[must_use]
    pub fn stake(&self, agent: &str) -> Option<f64> {
        self.inner
            .lock()
            .expect("stake lock poisoned")
            .stakes
            .get(agent)
            .copied()
    }

    /// Burn a fraction of an agent's stake: `stake ← stake × (1 − fraction)`,
    /// saturating at [`MIN_STAKE`].
    ///
    /// Unknown agents are ignored.
    pub fn burn(&self, agent: &str, fraction: f64) {
        let fraction = fraction.clamp(0.0, 1.0);
        let mut inner = self.inner.lock().expect("stake lock poisoned");
        if let Some(stake) = inner.stakes.get_mut(agent) {
            *stake = (*stake * (1.0 - fraction)).max(MIN_STAKE);
            info!(target: "afc.stake", agent, fraction, remaining = *stake, "stake burned");
        }
    }

    /// Set the accept fraction a proposal must reach, clamped to `[0, 1]`.
    pub fn set_threshold(&self, proposal: &str, fraction: f64) {
        self.inner
            .lock()
            .expect("stake lock poisoned")
            .thresholds
            .insert(proposal.to_string(), fraction.clamp(0.0, 1.0));
    }

    /// Record that `agent` approves `proposal`.
    pub fn support(&self, proposal: &str, agent: &str) {
        self.inner
            .lock()
            .expect("stake lock poisoned")
            .supporters
            .entry(proposal.to_string())
            .or_default()
            .insert(agent.to_string());
    }

    /// Withdraw `agent`'s approval of `proposal`.
    pub fn withdraw(&self, proposal: &str, agent: &str) {
        let mut inner = self.inner.lock().expect("stake lock poisoned");
        if let Some(set) = inner.supporters.get_mut(proposal) {
            set.remove(agent);
        }
    }

    /// Returns `true` when the sum of approving stakes meets the proposal's
    /// threshold. Unknown proposals have threshold 0 and are auto-admitted.
    #[must_use]
    pub fn accepted(&self, proposal: &str) -> bool {
        let inner = self.inner.lock().expect("stake lock poisoned");
        let threshold = inner.thresholds.get(proposal).copied().unwrap_or(0.0);
        let approving: f64 = inner
            .supporters
            .get(proposal)
            .map(|set| {
                set.iter()
                    .filter_map(|agent| inner.stakes.get(agent))
                    .sum()
            })
            .unwrap_or(0.0);
        approving >= threshold
    }

    /// Snapshot of all stakes, in name order.
    #[must_use]
    pub fn stakes(&self) -> BTreeMap<String, f64> {
        self.inner
            .lock()
            .expect("stake lock poisoned")
            .stakes
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stake_is_clamped_into_unit_interval() {
        let reg = StakeRegistry::new();
        reg.set_stake("a", 5.0);
        assert_eq!(reg.stake("a"), Some(1.0));
        reg.set_stake("b", -1.0);
        assert_eq!(reg.stake("b"), Some(MIN_STAKE));
    }

    #[test]
    fn burn_is_multiplicative() {
        let reg = StakeRegistry::new();
        reg.set_stake("a", 1.0);
        reg.burn("a", 0.10);
        assert!((reg.stake("a").unwrap() - 0.9).abs() < 1e-12);
    }

    #[test]
    fn burn_saturates_at_the_floor() {
        let reg = StakeRegistry::new();
        reg.set_stake("a", 1.0);
        for _ in 0..1000 {
            reg.burn("a", 0.5);
        }
        assert_eq!(reg.stake("a"), Some(MIN_STAKE));
    }

    #[test]
    fn burn_of_unknown_agent_is_ignored() {
        let reg = StakeRegistry::new();
        reg.burn("ghost", 0.1);
        assert_eq!(reg.stake("ghost"), None);
    }

    #[test]
    fn default_threshold_auto_admits() {
        let reg = StakeRegistry::new();
        assert!(reg.accepted("promote:anything"));
    }

    #[test]
    fn acceptance_sums_supporting_stakes() {
        let reg = StakeRegistry::new();
        reg.set_stake("x", 0.3);
        reg.set_threshold("promote:x", 0.5);
        reg.support("promote:x", "x");
        assert!(!reg.accepted("promote:x"));

        reg.set_stake("x", 0.8);
        assert!(reg.accepted("promote:x"));
    }

    #[test]
    fn multiple_supporters_pool_their_stake() {
        let reg = StakeRegistry::new();
        reg.set_stake("a", 0.3);
        reg.set_stake("b", 0.3);
        reg.set_threshold("upgrade", 0.5);
        reg.support("upgrade", "a");
        assert!(!reg.accepted("upgrade"));
        reg.support("upgrade", "b");
        assert!(reg.accepted("upgrade"));
        reg.withdraw("upgrade", "b");
        assert!(!reg.accepted("upgrade"));
    }

    #[test]
    fn slash_leaves_other_stakes_untouched() {
        let reg = StakeRegistry::new();
        reg.set_stake("a", 1.0);
        reg.set_stake("b", 1.0);
        reg.burn("a", 0.10);
        assert!((reg.stake("a").unwrap() - 0.9).abs() < 1e-12);
        assert_eq!(reg.stake("b"), Some(1.0));
    }
}
