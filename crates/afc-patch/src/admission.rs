// SPDX-License-Identifier: MIT OR Apache-2.0
//! The admission pipeline: normalise → safety → preflight → round-trip →
//! record.
//!
//! Work happens in a scratch clone; the supervised workspace is only
//! touched by the final all-or-nothing copy-over, and only for files inside
//! the allow-list. Every outcome, admitted or rejected, is appended to the
//! audit ledger.

use afc_archive::Archive;
use afc_core::hash::{hex, sha256};
use afc_core::{ErrorCode, now_ts};
use afc_ledger::{Ledger, LedgerError};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use crate::apply::{emit, parse, patched_contents};
use crate::guard::PatchGuard;
use crate::normalize::{changed_files, normalize};
use crate::preflight::{PreflightConfig, PreflightError, run_preflight};

/// Pipeline stage names used in rejections and ledger events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Diff normalisation and structural parsing.
    Normalise,
    /// Deny patterns and allow-list checks.
    Safety,
    /// Scratch-clone application and preflight commands.
    Preflight,
    /// The emit/parse idempotence probe.
    Roundtrip,
    /// Final application and archive/ledger recording.
    Record,
}

impl Stage {
    /// Wire name of the stage.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normalise => "normalise",
            Self::Safety => "safety",
            Self::Preflight => "preflight",
            Self::Roundtrip => "roundtrip",
            Self::Record => "record",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed rejection carrying the failing stage and a short cause.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("patch rejected at {stage}: {detail}")]
pub struct PatchRejected {
    /// Stage that refused the patch.
    pub stage: Stage,
    /// Short textual cause (stderr/stdout tail for preflight failures).
    pub detail: String,
    /// Set when the preflight subprocess exceeded its wall clock.
    pub timed_out: bool,
}

impl PatchRejected {
    fn new(stage: Stage, detail: impl Into<String>) -> Self {
        Self {
            stage,
            detail: detail.into(),
            timed_out: false,
        }
    }

    /// Stable code for this rejection.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        if self.timed_out {
            ErrorCode::PreflightTimeout
        } else {
            ErrorCode::PatchRejected
        }
    }
}

/// Errors from [`PatchAdmission::admit`].
#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    /// The patch was refused; the workspace and archive are unchanged.
    #[error(transparent)]
    Rejected(#[from] PatchRejected),

    /// The audit ledger failed; process-fatal.
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Successful admission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admitted {
    /// Hex SHA-256 of the normalised diff; the archive key.
    pub hash: String,
    /// Parent reference for the next patch in the lineage.
    pub new_parent: String,
    /// Archive entry id recording this admission.
    pub archive_id: u64,
}

/// The only component authorised to mutate the supervised workspace.
pub struct PatchAdmission {
    guard: PatchGuard,
    preflight: PreflightConfig,
    archive: Arc<Archive>,
    ledger: Ledger,
}

impl PatchAdmission {
    /// Build an admission pipeline.
    ///
    /// # Errors
    ///
    /// Invalid allow-list globs.
    pub fn new(
        allow: &[String],
        preflight: PreflightConfig,
        archive: Arc<Archive>,
        ledger: Ledger,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            guard: PatchGuard::new(allow)?,
            preflight,
            archive,
            ledger,
        })
    }

    /// Run the full pipeline for one candidate diff.
    ///
    /// # Errors
    ///
    /// [`AdmissionError::Rejected`] with the failing stage, or
    /// [`AdmissionError::Ledger`] when the audit trail cannot be written.
    pub async fn admit(
        &self,
        diff: &str,
        parent: &str,
        repo_root: &Path,
    ) -> Result<Admitted, AdmissionError> {
        match self.run_pipeline(diff, parent, repo_root).await {
            Ok(admitted) => Ok(admitted),
            Err(AdmissionError::Rejected(rejection)) => {
                warn!(
                    target: "afc.patch",
                    stage = rejection.stage.as_str(),
                    detail = %rejection.detail,
                    "patch rejected"
                );
                self.ledger
                    .append(
                        serde_json::json!({
                            "event": "patch.rejected",
                            "stage": rejection.stage.as_str(),
                            "detail": rejection.detail,
                        }),
                        now_ts(),
                    )
                    .await?;
                Err(rejection.into())
            }
            Err(other) => Err(other),
        }
    }

    async fn run_pipeline(
        &self,
        diff: &str,
        parent: &str,
        repo_root: &Path,
    ) -> Result<Admitted, AdmissionError> {
        // 1. Normalise; parse failures are structural problems of the
        //    normalised text and belong to this stage.
        let normalised = normalize(diff, repo_root);
        let patches = parse(&normalised)
            .map_err(|e| PatchRejected::new(Stage::Normalise, e.to_string()))?;

        // 2. Safety scan.
        self.guard
            .check(&normalised)
            .map_err(|v| PatchRejected::new(Stage::Safety, v.to_string()))?;

        // 3. Preflight in a scratch clone.
        let scratch = tempfile::tempdir()
            .map_err(|e| PatchRejected::new(Stage::Preflight, e.to_string()))?;
        copy_tree(repo_root, scratch.path())
            .map_err(|e| PatchRejected::new(Stage::Preflight, e.to_string()))?;
        let clone_contents = patched_contents(scratch.path(), &patches)
            .map_err(|e| PatchRejected::new(Stage::Preflight, e.to_string()))?;
        self.write_contents(scratch.path(), &clone_contents, Stage::Preflight)?;
        run_preflight(&self.preflight, scratch.path())
            .await
            .map_err(|e| match e {
                PreflightError::TimedOut { .. } => PatchRejected {
                    stage: Stage::Preflight,
                    detail: e.to_string(),
                    timed_out: true,
                },
                other => PatchRejected::new(Stage::Preflight, other.to_string()),
            })?;

        // 4. Tool round-trip: parse-then-emit must reproduce the
        //    normalised bytes exactly.
        if emit(&patches) != normalised {
            return Err(PatchRejected::new(
                Stage::Roundtrip,
                "parse/emit did not round-trip the normalised diff",
            )
            .into());
        }

        // 5. Record: atomic copy-over, archive entry, ledger event.
        let real_contents = patched_contents(repo_root, &patches)
            .map_err(|e| PatchRejected::new(Stage::Record, e.to_string()))?;
        self.commit_contents(repo_root, &real_contents)?;

        let hash = hex(&sha256(normalised.as_bytes()));
        let files = changed_files(&normalised);
        let archive_id = self
            .archive
            .add(
                None,
                serde_json::json!({
                    "hash": hash,
                    "parent": parent,
                    "diff": normalised,
                    "files": files,
                }),
                0.0,
            )
            .map_err(|e| PatchRejected::new(Stage::Record, e.to_string()))?;
        self.ledger
            .append(
                serde_json::json!({
                    "event": "patch.admitted",
                    "hash": hash,
                    "parent": parent,
                    "files": files,
                }),
                now_ts(),
            )
            .await?;

        info!(target: "afc.patch", %hash, files = files.len(), "patch admitted");
        Ok(Admitted {
            new_parent: hash.clone(),
            hash,
            archive_id,
        })
    }

    /// Write patched contents into a scratch tree, re-checking the
    /// allow-list per file.
    fn write_contents(
        &self,
        root: &Path,
        contents: &BTreeMap<String, String>,
        stage: Stage,
    ) -> Result<(), PatchRejected> {
        for (path, text) in contents {
            if !self.guard.allows(path) {
                return Err(PatchRejected::new(
                    stage,
                    format!("file outside allow-list: {path}"),
                ));
            }
            std::fs::write(root.join(path), text)
                .map_err(|e| PatchRejected::new(stage, e.to_string()))?;
        }
        Ok(())
    }

    /// All-or-nothing copy-over into the supervised workspace.
    ///
    /// Each file is staged next to its target and committed by rename; on
    /// any error the already-renamed files are restored from their saved
    /// originals.
    fn commit_contents(
        &self,
        root: &Path,
        contents: &BTreeMap<String, String>,
    ) -> Result<(), PatchRejected> {
        let mut originals: BTreeMap<String, String> = BTreeMap::new();
        for (path, text) in contents {
            // Second-line defence against normaliser bugs.
            if !self.guard.allows(path) {
                self.rollback(root, &originals);
                return Err(PatchRejected::new(
                    Stage::Record,
                    format!("file outside allow-list: {path}"),
                ));
            }
            let target = root.join(path);
            let staged = target.with_extension("afc-staged");
            let result = std::fs::read_to_string(&target)
                .and_then(|original| {
                    std::fs::write(&staged, text)?;
                    std::fs::rename(&staged, &target)?;
                    Ok(original)
                });
            match result {
                Ok(original) => {
                    originals.insert(path.clone(), original);
                }
                Err(e) => {
                    self.rollback(root, &originals);
                    return Err(PatchRejected::new(Stage::Record, e.to_string()));
                }
            }
        }
        Ok(())
    }

    fn rollback(&self, root: &Path, originals: &BTreeMap<String, String>) {
        for (path, original) in originals {
            if let Err(e) = std::fs::write(root.join(path), original) {
                warn!(target: "afc.patch", path, error = %e, "rollback write failed");
            }
        }
    }
}

/// Recursively copy a directory tree.
fn copy_tree(src: &Path, dst: &Path) -> std::io::Result<()> {
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            std::fs::create_dir_all(&to)?;
            copy_tree(&from, &to)?;
        } else if entry.file_type()?.is_file() {
            std::fs::copy(&from, &to)?;
        }
    }
    Ok(())
}
