// SPDX-License-Identifier: MIT OR Apache-2.0
//! Hot-directory discovery of signed plugin bundles.
//!
//! The scanner walks the configured directory for `*.agent.toml` bundles and
//! registers every one that verifies. Failures are recorded in the registry
//! so `list_agents(detail)` can surface them; a later successful rescan
//! clears the record.

use crate::plugin::{AgentCatalog, PluginVerifier};
use crate::{AgentRegistry, RegistryError};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// File suffix identifying a plugin bundle.
pub const BUNDLE_SUFFIX: &str = ".agent.toml";

/// Outcome of one hot-directory scan.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanReport {
    /// Agent names registered by this scan.
    pub loaded: Vec<String>,
    /// Bundles already registered and left untouched.
    pub skipped: Vec<String>,
    /// Bundle filename → refusal reason.
    pub failed: Vec<(String, String)>,
}

/// Scans a directory for signed plugin bundles.
pub struct HotDirScanner {
    dir: PathBuf,
    verifier: PluginVerifier,
    catalog: AgentCatalog,
}

impl HotDirScanner {
    /// Create a scanner over `dir`.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, verifier: PluginVerifier, catalog: AgentCatalog) -> Self {
        Self {
            dir: dir.into(),
            verifier,
            catalog,
        }
    }

    /// Directory being scanned.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Scan once, registering every bundle that verifies.
    ///
    /// A missing directory is an empty scan, not an error — the hot
    /// directory may be created after startup.
    pub fn scan(&self, registry: &AgentRegistry) -> ScanReport {
        let mut report = ScanReport::default();
        if !self.dir.is_dir() {
            debug!(target: "afc.registry.discovery", dir = %self.dir.display(), "hot dir absent");
            return report;
        }
        for entry in WalkDir::new(&self.dir)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_map(Result::ok)
        {
            let path = entry.path();
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(file_name) = path.file_name().map(|n| n.to_string_lossy().into_owned())
            else {
                continue;
            };
            if !file_name.ends_with(BUNDLE_SUFFIX) {
                continue;
            }

            match self.verifier.load(path, &self.catalog) {
                Ok((meta, factory)) => {
                    let name = meta.name.clone();
                    match registry.register(meta, factory, false) {
                        Ok(()) => {
                            registry.clear_failure(&file_name);
                            report.loaded.push(name);
                        }
                        Err(RegistryError::Duplicate { .. }) => {
                            registry.clear_failure(&file_name);
                            report.skipped.push(name);
                        }
                        Err(e) => {
                            warn!(target: "afc.registry.discovery", bundle = %file_name, error = %e, "registration failed");
                            registry.record_failure(&file_name, e.to_string());
                            report.failed.push((file_name, e.to_string()));
                        }
                    }
                }
                Err(e) => {
                    warn!(target: "afc.registry.discovery", bundle = %file_name, error = %e, "bundle refused");
                    registry.record_failure(&file_name, e.to_string());
                    report.failed.push((file_name, e.to_string()));
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::sidecar_path;
    use crate::{Agent, PluginManifest, StubAgent};
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use ed25519_dalek::{Signer, SigningKey};
    use rand::rngs::OsRng;

    fn manifest(name: &str) -> String {
        format!("name = \"{name}\"\nversion = \"1.0.0\"\nkind = \"stub\"\n")
    }

    fn catalog() -> AgentCatalog {
        let mut catalog = AgentCatalog::new();
        catalog.add("stub", |m: &PluginManifest| {
            Box::new(StubAgent::new(m.name.clone())) as Box<dyn Agent>
        });
        catalog
    }

    fn signed_bundle(dir: &Path, sk: &SigningKey, name: &str) {
        let text = manifest(name);
        let bundle = dir.join(format!("{name}.agent.toml"));
        std::fs::write(&bundle, &text).unwrap();
        let sig = BASE64.encode(sk.sign(text.as_bytes()).to_bytes());
        std::fs::write(sidecar_path(&bundle), sig).unwrap();
    }

    #[test]
    fn scan_registers_valid_bundles_and_records_failures() {
        let dir = tempfile::tempdir().unwrap();
        let sk = SigningKey::generate(&mut OsRng);
        let pk = BASE64.encode(sk.verifying_key().to_bytes());

        signed_bundle(dir.path(), &sk, "alpha");
        signed_bundle(dir.path(), &sk, "beta");
        // An unsigned straggler.
        std::fs::write(dir.path().join("gamma.agent.toml"), manifest("gamma")).unwrap();
        // A file the scanner must ignore entirely.
        std::fs::write(dir.path().join("notes.txt"), "not a bundle").unwrap();

        let registry = AgentRegistry::new();
        let scanner = HotDirScanner::new(
            dir.path(),
            PluginVerifier::new(&pk).unwrap(),
            catalog(),
        );
        let report = scanner.scan(&registry);

        assert_eq!(report.loaded, vec!["alpha", "beta"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "gamma.agent.toml");
        assert!(registry.metadata("alpha").is_some());
        assert!(registry.metadata("gamma").is_none());

        let failed: Vec<_> = registry
            .list_agents(true)
            .into_iter()
            .filter(|l| l.status == "error")
            .collect();
        assert_eq!(failed.len(), 1);
    }

    #[test]
    fn rescan_skips_already_registered_bundles() {
        let dir = tempfile::tempdir().unwrap();
        let sk = SigningKey::generate(&mut OsRng);
        let pk = BASE64.encode(sk.verifying_key().to_bytes());
        signed_bundle(dir.path(), &sk, "alpha");

        let registry = AgentRegistry::new();
        let scanner = HotDirScanner::new(
            dir.path(),
            PluginVerifier::new(&pk).unwrap(),
            catalog(),
        );
        assert_eq!(scanner.scan(&registry).loaded, vec!["alpha"]);
        let second = scanner.scan(&registry);
        assert!(second.loaded.is_empty());
        assert_eq!(second.skipped, vec!["alpha"]);
    }

    #[test]
    fn missing_directory_yields_empty_report() {
        let registry = AgentRegistry::new();
        let scanner = HotDirScanner::new(
            "/nonexistent/hot-dir",
            PluginVerifier::insecure(),
            catalog(),
        );
        let report = scanner.scan(&registry);
        assert_eq!(report, ScanReport::default());
    }

    #[test]
    fn bundle_fixed_by_operator_clears_its_failure() {
        let dir = tempfile::tempdir().unwrap();
        let sk = SigningKey::generate(&mut OsRng);
        let pk = BASE64.encode(sk.verifying_key().to_bytes());

        let text = manifest("alpha");
        let bundle = dir.path().join("alpha.agent.toml");
        std::fs::write(&bundle, &text).unwrap();

        let registry = AgentRegistry::new();
        let scanner = HotDirScanner::new(
            dir.path(),
            PluginVerifier::new(&pk).unwrap(),
            catalog(),
        );
        assert_eq!(scanner.scan(&registry).failed.len(), 1);

        // Operator drops the signature in; the next rescan succeeds.
        let sig = BASE64.encode(sk.sign(text.as_bytes()).to_bytes());
        std::fs::write(sidecar_path(&bundle), sig).unwrap();
        assert_eq!(scanner.scan(&registry).loaded, vec!["alpha"]);
        assert!(registry.list_agents(true).iter().all(|l| l.status == "ok"));
    }
}
