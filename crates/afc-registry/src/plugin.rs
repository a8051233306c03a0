// SPDX-License-Identifier: MIT OR Apache-2.0
//! Signed plugin bundle verification and manifests.
//!
//! A bundle is a TOML manifest describing one agent, distributed with a
//! side-car `.sig` file holding a base64 Ed25519 signature. The loader
//! accepts two signing conventions: the signature may cover the raw bundle
//! bytes or their SHA-512 digest. When the pinned table lists the bundle
//! filename, the side-car must match it exactly — a valid signature alone
//! does not admit a bundle the table disagrees with.

use crate::agent::{Agent, AgentFactory};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::Deserialize;
use sha2::{Digest, Sha512};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use afc_core::ErrorCode;

/// Errors from plugin verification and loading.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    /// The side-car `.sig` file is missing.
    #[error("missing .sig file for {path}")]
    MissingSignature {
        /// Bundle path.
        path: PathBuf,
    },

    /// The configured public key or side-car is not valid base64/Ed25519.
    #[error("bad key material: {detail}")]
    BadKeyMaterial {
        /// Decoder detail.
        detail: String,
    },

    /// Neither signing convention verified the signature.
    #[error("invalid signature for {path}")]
    InvalidSignature {
        /// Bundle path.
        path: PathBuf,
    },

    /// The side-car disagrees with the pinned signature table.
    #[error("pinned signature mismatch for {name}")]
    PinnedMismatch {
        /// Bundle filename.
        name: String,
    },

    /// The manifest is missing or malformed.
    #[error("bad manifest: {detail}")]
    BadManifest {
        /// Parser detail.
        detail: String,
    },

    /// The manifest names an agent kind absent from the catalog.
    #[error("unknown agent kind: {kind}")]
    UnknownKind {
        /// Kind that was requested.
        kind: String,
    },

    /// Underlying filesystem failure.
    #[error("plugin I/O on {path}: {source}")]
    Io {
        /// File involved.
        path: PathBuf,
        /// OS error.
        #[source]
        source: std::io::Error,
    },
}

impl PluginError {
    /// Stable code for this error.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        ErrorCode::PluginRejected
    }
}

/// Agent description carried inside a signed bundle.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PluginManifest {
    /// Unique agent name.
    pub name: String,
    /// Agent version.
    pub version: String,
    /// Constructor kind resolved against the [`AgentCatalog`].
    pub kind: String,
    /// Capability tags.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Compliance tags.
    #[serde(default)]
    pub compliance_tags: Vec<String>,
    /// Whether the agent needs an API key.
    #[serde(default)]
    pub requires_api_key: bool,
    /// Cycle period in seconds.
    #[serde(default = "default_cycle_seconds")]
    pub cycle_seconds: f64,
}

fn default_cycle_seconds() -> f64 {
    1.0
}

impl PluginManifest {
    /// Parse a manifest from bundle bytes.
    ///
    /// # Errors
    ///
    /// [`PluginError::BadManifest`] on non-UTF-8 or invalid TOML.
    pub fn parse(bytes: &[u8]) -> Result<Self, PluginError> {
        let text = std::str::from_utf8(bytes).map_err(|e| PluginError::BadManifest {
            detail: e.to_string(),
        })?;
        toml::from_str(text).map_err(|e| PluginError::BadManifest {
            detail: e.to_string(),
        })
    }

    /// Cycle period as a [`Duration`].
    #[must_use]
    pub fn cycle_period(&self) -> Duration {
        Duration::from_secs_f64(self.cycle_seconds.max(0.0))
    }
}

/// Named constructors that manifests can reference by `kind`.
#[derive(Default)]
pub struct AgentCatalog {
    kinds: BTreeMap<String, Arc<dyn Fn(&PluginManifest) -> Box<dyn Agent> + Send + Sync>>,
}

impl AgentCatalog {
    /// Create an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor under a kind name.
    pub fn add(
        &mut self,
        kind: impl Into<String>,
        ctor: impl Fn(&PluginManifest) -> Box<dyn Agent> + Send + Sync + 'static,
    ) {
        self.kinds.insert(kind.into(), Arc::new(ctor));
    }

    /// Build an [`AgentFactory`] for the manifest's kind.
    ///
    /// # Errors
    ///
    /// [`PluginError::UnknownKind`] when the kind is not in the catalog.
    pub fn factory(&self, manifest: &PluginManifest) -> Result<AgentFactory, PluginError> {
        let ctor = self
            .kinds
            .get(&manifest.kind)
            .ok_or_else(|| PluginError::UnknownKind {
                kind: manifest.kind.clone(),
            })?
            .clone();
        let manifest = manifest.clone();
        Ok(Arc::new(move || ctor(&manifest)))
    }
}

/// Verifies bundle signatures against the configured public key and pinned
/// table.
#[derive(Clone)]
pub struct PluginVerifier {
    key: Option<VerifyingKey>,
    pinned: BTreeMap<String, String>,
    allow_insecure: bool,
}

impl PluginVerifier {
    /// Build a verifier from a base64-encoded raw 32-byte public key.
    ///
    /// # Errors
    ///
    /// [`PluginError::BadKeyMaterial`] when the key does not decode.
    pub fn new(pubkey_b64: &str) -> Result<Self, PluginError> {
        let bytes = BASE64
            .decode(pubkey_b64.trim())
            .map_err(|e| PluginError::BadKeyMaterial {
                detail: e.to_string(),
            })?;
        let raw: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| PluginError::BadKeyMaterial {
                detail: format!("expected 32 key bytes, got {}", bytes.len()),
            })?;
        let key = VerifyingKey::from_bytes(&raw).map_err(|e| PluginError::BadKeyMaterial {
            detail: e.to_string(),
        })?;
        Ok(Self {
            key: Some(key),
            pinned: BTreeMap::new(),
            allow_insecure: false,
        })
    }

    /// Build a verifier that admits everything. Local development only.
    #[must_use]
    pub fn insecure() -> Self {
        warn!(target: "afc.registry.plugin", "signature enforcement disabled");
        Self {
            key: None,
            pinned: BTreeMap::new(),
            allow_insecure: true,
        }
    }

    /// Attach the pinned signature table (`bundle filename → base64 sig`).
    #[must_use]
    pub fn with_pinned(mut self, pinned: BTreeMap<String, String>) -> Self {
        self.pinned = pinned;
        self
    }

    /// Verify the bundle at `path` against its side-car signature.
    ///
    /// # Errors
    ///
    /// Any [`PluginError`] variant describing the refusal; callers must not
    /// load the bundle on error.
    pub fn verify(&self, path: &Path) -> Result<(), PluginError> {
        if self.allow_insecure {
            return Ok(());
        }
        let key = self.key.as_ref().ok_or_else(|| PluginError::BadKeyMaterial {
            detail: "no public key configured".into(),
        })?;

        let sig_path = sidecar_path(path);
        if !sig_path.is_file() {
            return Err(PluginError::MissingSignature {
                path: path.to_path_buf(),
            });
        }
        let sig_b64 = std::fs::read_to_string(&sig_path)
            .map_err(|source| PluginError::Io {
                path: sig_path.clone(),
                source,
            })?
            .trim()
            .to_string();

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if let Some(expected) = self.pinned.get(&file_name)
            && expected != &sig_b64
        {
            return Err(PluginError::PinnedMismatch { name: file_name });
        }

        let sig_bytes = BASE64
            .decode(&sig_b64)
            .map_err(|e| PluginError::BadKeyMaterial {
                detail: e.to_string(),
            })?;
        let sig_raw: [u8; 64] =
            sig_bytes
                .as_slice()
                .try_into()
                .map_err(|_| PluginError::BadKeyMaterial {
                    detail: format!("expected 64 signature bytes, got {}", sig_bytes.len()),
                })?;
        let signature = Signature::from_bytes(&sig_raw);

        let data = std::fs::read(path).map_err(|source| PluginError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        // Raw-bytes convention first, SHA-512 pre-hash as the legacy
        // fallback. Either admits.
        if key.verify(&data, &signature).is_ok() {
            return Ok(());
        }
        let digest = Sha512::digest(&data);
        if key.verify(&digest, &signature).is_ok() {
            return Ok(());
        }
        Err(PluginError::InvalidSignature {
            path: path.to_path_buf(),
        })
    }

    /// Verify, parse, and resolve a bundle into registration inputs.
    ///
    /// # Errors
    ///
    /// Verification, manifest, or catalog failures; nothing is registered on
    /// error.
    pub fn load(
        &self,
        path: &Path,
        catalog: &AgentCatalog,
    ) -> Result<(crate::AgentMetadata, AgentFactory), PluginError> {
        self.verify(path)?;
        let bytes = std::fs::read(path).map_err(|source| PluginError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let manifest = PluginManifest::parse(&bytes)?;
        let factory = catalog.factory(&manifest)?;
        let meta = crate::AgentMetadata::new(&manifest.name, &manifest.version)
            .with_capabilities(manifest.capabilities.iter().cloned())
            .with_compliance_tags(manifest.compliance_tags.iter().cloned());
        let meta = if manifest.requires_api_key {
            meta.requires_api_key()
        } else {
            meta
        };
        info!(target: "afc.registry.plugin", agent = %meta.name, bundle = %path.display(), "plugin verified");
        Ok((meta, factory))
    }
}

/// Side-car signature path: the bundle filename with `.sig` appended.
#[must_use]
pub fn sidecar_path(bundle: &Path) -> PathBuf {
    let mut name = bundle
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push_str(".sig");
    bundle.with_file_name(name)
}
