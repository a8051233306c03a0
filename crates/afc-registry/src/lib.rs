// SPDX-License-Identifier: MIT OR Apache-2.0
//! afc-registry
//!
//! Lock-guarded agent registry with a derived capability graph.
//!
//! All metadata mutation — registration, error accounting, quarantine —
//! happens under the single registry lock. Capability queries read a
//! precomputed index.

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// The agent trait, factory type, and quarantine stub.
pub mod agent;
/// Hot-directory scanning for signed plugin bundles.
pub mod discovery;
/// Plugin bundle verification and manifests.
pub mod plugin;

pub use agent::{Agent, AgentFactory, StubAgent};
pub use discovery::{HotDirScanner, ScanReport};
pub use plugin::{AgentCatalog, PluginError, PluginManifest, PluginVerifier};

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use tracing::{info, warn};

/// Version suffix marking a quarantined agent.
pub const STUB_SUFFIX: &str = "+stub";

/// Errors from registry operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// An agent with this name is already registered.
    #[error("agent already registered: {name}")]
    Duplicate {
        /// Conflicting agent name.
        name: String,
    },

    /// No agent with this name is registered.
    #[error("unknown agent: {name}")]
    Unknown {
        /// Name that was looked up.
        name: String,
    },
}

/// Descriptive record for one registered agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentMetadata {
    /// Unique agent name.
    pub name: String,
    /// Semver, suffixed `+stub` while quarantined.
    pub version: String,
    /// Capability tags.
    pub capabilities: BTreeSet<String>,
    /// Compliance tags.
    pub compliance_tags: BTreeSet<String>,
    /// Errors recorded against the current incarnation.
    pub err_count: u32,
    /// Whether the agent needs an API key to run.
    pub requires_api_key: bool,
}

impl AgentMetadata {
    /// Create metadata with empty tag sets and a zero error count.
    #[must_use]
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            capabilities: BTreeSet::new(),
            compliance_tags: BTreeSet::new(),
            err_count: 0,
            requires_api_key: false,
        }
    }

    /// Add capability tags.
    #[must_use]
    pub fn with_capabilities<I: IntoIterator<Item = S>, S: Into<String>>(
        mut self,
        capabilities: I,
    ) -> Self {
        self.capabilities
            .extend(capabilities.into_iter().map(Into::into));
        self
    }

    /// Add compliance tags.
    #[must_use]
    pub fn with_compliance_tags<I: IntoIterator<Item = S>, S: Into<String>>(
        mut self,
        tags: I,
    ) -> Self {
        self.compliance_tags.extend(tags.into_iter().map(Into::into));
        self
    }

    /// Mark the agent as requiring an API key.
    #[must_use]
    pub fn requires_api_key(mut self) -> Self {
        self.requires_api_key = true;
        self
    }

    /// Returns `true` while the agent is quarantined.
    #[must_use]
    pub fn is_quarantined(&self) -> bool {
        self.version.ends_with(STUB_SUFFIX)
    }
}

/// One row of [`AgentRegistry::list_agents`] output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentListing {
    /// Agent or bundle name.
    pub name: String,
    /// Version string, empty for failed imports.
    pub version: String,
    /// Capability tags.
    pub capabilities: BTreeSet<String>,
    /// `"ok"` or `"error"`.
    pub status: String,
    /// Failure reason for failed imports.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

struct Entry {
    meta: AgentMetadata,
    factory: AgentFactory,
}

#[derive(Default)]
struct Inner {
    agents: BTreeMap<String, Entry>,
    capabilities: BTreeMap<String, BTreeSet<String>>,
    failed: BTreeMap<String, String>,
}

impl Inner {
    fn rebuild_capabilities(&mut self) {
        self.capabilities.clear();
        for entry in self.agents.values() {
            for cap in &entry.meta.capabilities {
                self.capabilities
                    .entry(cap.clone())
                    .or_default()
                    .insert(entry.meta.name.clone());
            }
        }
    }
}

/// Lock-guarded store of [`AgentMetadata`] and constructors.
#[derive(Default)]
pub struct AgentRegistry {
    inner: Mutex<Inner>,
}

impl AgentRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent.
    ///
    /// With `overwrite` set (the quarantine path), an existing entry has its
    /// implementation swapped while name, capabilities, and compliance tags
    /// are preserved; the error count resets for the fresh incarnation.
    ///
    /// # Errors
    ///
    /// [`RegistryError::Duplicate`] when the name exists and `overwrite` is
    /// not set.
    pub fn register(
        &self,
        meta: AgentMetadata,
        factory: AgentFactory,
        overwrite: bool,
    ) -> Result<(), RegistryError> {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        let name = meta.name.clone();
        if let Some(existing) = inner.agents.get_mut(&name) {
            if !overwrite {
                return Err(RegistryError::Duplicate { name });
            }
            existing.meta.version = meta.version;
            existing.meta.err_count = 0;
            existing.factory = factory;
        } else {
            inner.agents.insert(name.clone(), Entry { meta, factory });
        }
        inner.failed.remove(&name);
        inner.rebuild_capabilities();
        info!(target: "afc.registry", agent = %name, overwrite, "agent registered");
        Ok(())
    }

    /// Remove an agent.
    ///
    /// # Errors
    ///
    /// [`RegistryError::Unknown`] when the name is not registered.
    pub fn deregister(&self, name: &str) -> Result<AgentMetadata, RegistryError> {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        let entry = inner.agents.remove(name).ok_or(RegistryError::Unknown {
            name: name.to_string(),
        })?;
        inner.rebuild_capabilities();
        Ok(entry.meta)
    }

    /// Construct a fresh incarnation of the named agent.
    ///
    /// # Errors
    ///
    /// [`RegistryError::Unknown`] when the name is not registered.
    pub fn instantiate(&self, name: &str) -> Result<Box<dyn Agent>, RegistryError> {
        let inner = self.inner.lock().expect("registry lock poisoned");
        let entry = inner.agents.get(name).ok_or(RegistryError::Unknown {
            name: name.to_string(),
        })?;
        Ok((entry.factory)())
    }

    /// Metadata snapshot for one agent.
    #[must_use]
    pub fn metadata(&self, name: &str) -> Option<AgentMetadata> {
        self.inner
            .lock()
            .expect("registry lock poisoned")
            .agents
            .get(name)
            .map(|e| e.meta.clone())
    }

    /// Names of all registered agents, in order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.inner
            .lock()
            .expect("registry lock poisoned")
            .agents
            .keys()
            .cloned()
            .collect()
    }

    /// Record one error against the named agent's current incarnation.
    ///
    /// Returns the updated cumulative count; unknown agents return 0.
    pub fn record_error(&self, name: &str) -> u32 {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        inner.agents.get_mut(name).map_or(0, |entry| {
            entry.meta.err_count += 1;
            entry.meta.err_count
        })
    }

    /// Swap the named agent for a [`StubAgent`], preserving its name and
    /// capability set and suffixing the version with `+stub`.
    ///
    /// # Errors
    ///
    /// [`RegistryError::Unknown`] when the name is not registered.
    pub fn quarantine(&self, name: &str) -> Result<AgentMetadata, RegistryError> {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        let entry = inner.agents.get_mut(name).ok_or(RegistryError::Unknown {
            name: name.to_string(),
        })?;
        if !entry.meta.version.ends_with(STUB_SUFFIX) {
            entry.meta.version.push_str(STUB_SUFFIX);
        }
        entry.meta.err_count = 0;
        entry.factory = StubAgent::factory(name);
        let meta = entry.meta.clone();
        warn!(target: "afc.registry", agent = name, version = %meta.version, "agent quarantined");
        Ok(meta)
    }

    /// Names of agents carrying the given capability. O(1) index lookup.
    #[must_use]
    pub fn capability_agents(&self, capability: &str) -> BTreeSet<String> {
        self.inner
            .lock()
            .expect("registry lock poisoned")
            .capabilities
            .get(capability)
            .cloned()
            .unwrap_or_default()
    }

    /// All capabilities present in the registry, in order.
    #[must_use]
    pub fn list_capabilities(&self) -> Vec<String> {
        self.inner
            .lock()
            .expect("registry lock poisoned")
            .capabilities
            .keys()
            .cloned()
            .collect()
    }

    /// Record a failed plugin import for later listing.
    pub fn record_failure(&self, name: &str, reason: impl Into<String>) {
        self.inner
            .lock()
            .expect("registry lock poisoned")
            .failed
            .insert(name.to_string(), reason.into());
    }

    /// Forget a previously recorded import failure.
    pub fn clear_failure(&self, name: &str) {
        self.inner
            .lock()
            .expect("registry lock poisoned")
            .failed
            .remove(name);
    }

    /// Registered agents and, with `detail`, last-known failed imports.
    #[must_use]
    pub fn list_agents(&self, detail: bool) -> Vec<AgentListing> {
        let inner = self.inner.lock().expect("registry lock poisoned");
        let mut out: Vec<AgentListing> = inner
            .agents
            .values()
            .map(|e| AgentListing {
                name: e.meta.name.clone(),
                version: e.meta.version.clone(),
                capabilities: e.meta.capabilities.clone(),
                status: "ok".into(),
                message: None,
            })
            .collect();
        if detail {
            out.extend(inner.failed.iter().map(|(name, reason)| AgentListing {
                name: name.clone(),
                version: String::new(),
                capabilities: BTreeSet::new(),
                status: "error".into(),
                message: Some(reason.clone()),
            }));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn noop_factory(name: &str) -> AgentFactory {
        StubAgent::factory(name)
    }

    fn meta(name: &str, caps: &[&str]) -> AgentMetadata {
        AgentMetadata::new(name, "1.0.0").with_capabilities(caps.iter().copied())
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let reg = AgentRegistry::new();
        reg.register(meta("a", &[]), noop_factory("a"), false).unwrap();
        let err = reg
            .register(meta("a", &[]), noop_factory("a"), false)
            .unwrap_err();
        assert!(matches!(err, RegistryError::Duplicate { .. }));
    }

    #[test]
    fn capability_graph_is_rebuilt_on_registration() {
        let reg = AgentRegistry::new();
        reg.register(meta("a", &["planning"]), noop_factory("a"), false)
            .unwrap();
        reg.register(meta("b", &["planning", "research"]), noop_factory("b"), false)
            .unwrap();
        assert_eq!(
            reg.capability_agents("planning"),
            ["a", "b"].iter().map(|s| s.to_string()).collect()
        );
        assert_eq!(reg.list_capabilities(), vec!["planning", "research"]);

        reg.deregister("b").unwrap();
        assert!(reg.capability_agents("research").is_empty());
    }

    #[test]
    fn quarantine_preserves_name_and_capabilities() {
        let reg = AgentRegistry::new();
        reg.register(
            meta("fail", &["self-improvement"]),
            noop_factory("fail"),
            false,
        )
        .unwrap();
        reg.record_error("fail");
        reg.record_error("fail");

        let swapped = reg.quarantine("fail").unwrap();
        assert_eq!(swapped.name, "fail");
        assert_eq!(swapped.version, "1.0.0+stub");
        assert!(swapped.is_quarantined());
        assert_eq!(swapped.err_count, 0);
        assert!(swapped.capabilities.contains("self-improvement"));

        // The capability index still lists the quarantined agent.
        assert!(reg.capability_agents("self-improvement").contains("fail"));

        // Quarantining twice does not stack suffixes.
        let again = reg.quarantine("fail").unwrap();
        assert_eq!(again.version, "1.0.0+stub");
    }

    #[test]
    fn non_quarantined_versions_never_carry_the_stub_suffix() {
        let reg = AgentRegistry::new();
        for name in ["a", "b", "c"] {
            reg.register(meta(name, &[]), noop_factory(name), false)
                .unwrap();
        }
        reg.quarantine("b").unwrap();
        for listing in reg.list_agents(false) {
            if listing.name == "b" {
                assert!(listing.version.ends_with(STUB_SUFFIX));
            } else {
                assert!(!listing.version.ends_with(STUB_SUFFIX));
            }
        }
    }

    #[test]
    fn overwrite_swaps_implementation_and_resets_errors() {
        let reg = AgentRegistry::new();
        reg.register(meta("a", &["x"]), noop_factory("a"), false)
            .unwrap();
        reg.record_error("a");
        reg.register(AgentMetadata::new("a", "2.0.0"), noop_factory("a"), true)
            .unwrap();
        let meta = reg.metadata("a").unwrap();
        assert_eq!(meta.version, "2.0.0");
        assert_eq!(meta.err_count, 0);
        // Capabilities carried over from the original registration.
        assert!(meta.capabilities.contains("x"));
    }

    #[test]
    fn error_counts_accumulate_per_incarnation() {
        let reg = AgentRegistry::new();
        reg.register(meta("a", &[]), noop_factory("a"), false).unwrap();
        assert_eq!(reg.record_error("a"), 1);
        assert_eq!(reg.record_error("a"), 2);
        assert_eq!(reg.record_error("ghost"), 0);
    }

    #[test]
    fn listing_includes_failures_only_in_detail_mode() {
        let reg = AgentRegistry::new();
        reg.register(meta("a", &[]), noop_factory("a"), false).unwrap();
        reg.record_failure("broken.agent.toml", "signature mismatch");

        assert_eq!(reg.list_agents(false).len(), 1);
        let detailed = reg.list_agents(true);
        assert_eq!(detailed.len(), 2);
        let failed = detailed.iter().find(|l| l.status == "error").unwrap();
        assert_eq!(failed.name, "broken.agent.toml");
        assert_eq!(failed.message.as_deref(), Some("signature mismatch"));
    }

    #[test]
    fn successful_registration_clears_a_recorded_failure() {
        let reg = AgentRegistry::new();
        reg.record_failure("a", "bad signature");
        reg.register(meta("a", &[]), noop_factory("a"), false).unwrap();
        assert!(reg.list_agents(true).iter().all(|l| l.status == "ok"));
    }

    #[test]
    fn instantiate_uses_the_stored_factory() {
        let reg = AgentRegistry::new();
        let made = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let counter = Arc::clone(&made);
        let factory: AgentFactory = Arc::new(move || {
            counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            Box::new(StubAgent::new("a")) as Box<dyn Agent>
        });
        reg.register(meta("a", &[]), factory, false).unwrap();
        let _one = reg.instantiate("a").unwrap();
        let _two = reg.instantiate("a").unwrap();
        assert_eq!(made.load(std::sync::atomic::Ordering::Relaxed), 2);
        assert!(reg.instantiate("ghost").is_err());
    }
}
