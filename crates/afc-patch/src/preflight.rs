// SPDX-License-Identifier: MIT OR Apache-2.0
//! Preflight command execution against a scratch clone.
//!
//! Commands run with a cleared environment (only `PATH` survives), the
//! scratch directory as CWD, and a shared wall-clock budget. A command that
//! outlives the budget is killed and the patch is rejected with a timeout.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// How much combined stdout/stderr is retained for rejection messages.
const TAIL_BYTES: usize = 2048;

/// Preflight command set and wall-clock budget.
#[derive(Debug, Clone)]
pub struct PreflightConfig {
    /// Commands to run, each as `argv`. Empty means no preflight.
    pub commands: Vec<Vec<String>>,
    /// Wall-clock budget across all commands.
    pub timeout: Duration,
}

impl Default for PreflightConfig {
    fn default() -> Self {
        Self {
            commands: Vec::new(),
            timeout: Duration::from_secs(300),
        }
    }
}

impl PreflightConfig {
    /// Config running the given commands under the default 300 s budget.
    #[must_use]
    pub fn with_commands(commands: Vec<Vec<String>>) -> Self {
        Self {
            commands,
            ..Self::default()
        }
    }
}

/// Errors from a preflight run.
#[derive(Debug, thiserror::Error)]
pub enum PreflightError {
    /// A command exited non-zero.
    #[error("preflight command failed ({command}): {tail}")]
    Failed {
        /// The command that failed.
        command: String,
        /// Tail of its combined output.
        tail: String,
    },

    /// The wall-clock budget was exceeded.
    #[error("preflight timed out after {seconds}s in {command}")]
    TimedOut {
        /// The command that was killed.
        command: String,
        /// Budget in seconds.
        seconds: u64,
    },

    /// The command could not be spawned at all.
    #[error("preflight spawn failed ({command}): {source}")]
    Spawn {
        /// The command that failed to spawn.
        command: String,
        /// OS error.
        #[source]
        source: std::io::Error,
    },
}

/// Last `TAIL_BYTES` of combined stdout and stderr.
fn output_tail(stdout: &[u8], stderr: &[u8]) -> String {
    let mut combined = String::from_utf8_lossy(stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(stderr));
    let cut = combined.len().saturating_sub(TAIL_BYTES);
    combined[cut..].to_string()
}

/// Run every configured command in `dir`, stopping at the first failure.
///
/// The budget is shared: time spent by earlier commands shrinks what later
/// ones may use.
///
/// # Errors
///
/// The first [`PreflightError`] encountered.
pub async fn run_preflight(config: &PreflightConfig, dir: &Path) -> Result<(), PreflightError> {
    let deadline = tokio::time::Instant::now() + config.timeout;
    for argv in &config.commands {
        let Some((program, args)) = argv.split_first() else {
            continue;
        };
        let command_display = argv.join(" ");
        debug!(target: "afc.patch.preflight", command = %command_display, "running");

        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(dir)
            .env_clear()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // The scratch environment keeps PATH only; no keys, no proxies.
        if let Ok(path) = std::env::var("PATH") {
            command.env("PATH", path);
        }

        let child = command.spawn().map_err(|source| PreflightError::Spawn {
            command: command_display.clone(),
            source,
        })?;

        let output = match tokio::time::timeout_at(deadline, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => {
                return Err(PreflightError::Spawn {
                    command: command_display,
                    source,
                });
            }
            Err(_) => {
                warn!(target: "afc.patch.preflight", command = %command_display, "killed on timeout");
                return Err(PreflightError::TimedOut {
                    command: command_display,
                    seconds: config.timeout.as_secs(),
                });
            }
        };

        if !output.status.success() {
            return Err(PreflightError::Failed {
                command: command_display,
                tail: output_tail(&output.stdout, &output.stderr),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn empty_command_set_passes() {
        let dir = tempfile::tempdir().unwrap();
        run_preflight(&PreflightConfig::default(), dir.path())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn succeeding_command_passes() {
        let dir = tempfile::tempdir().unwrap();
        let config = PreflightConfig::with_commands(vec![argv(&["true"])]);
        run_preflight(&config, dir.path()).await.unwrap();
    }

    #[tokio::test]
    async fn failing_command_rejects_with_tail() {
        let dir = tempfile::tempdir().unwrap();
        let config = PreflightConfig::with_commands(vec![argv(&[
            "sh",
            "-c",
            "echo boom >&2; exit 3",
        ])]);
        let err = run_preflight(&config, dir.path()).await.unwrap_err();
        match err {
            PreflightError::Failed { tail, .. } => assert!(tail.contains("boom")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn slow_command_is_killed_on_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let config = PreflightConfig {
            commands: vec![argv(&["sleep", "30"])],
            timeout: Duration::from_millis(100),
        };
        let started = std::time::Instant::now();
        let err = run_preflight(&config, dir.path()).await.unwrap_err();
        assert!(matches!(err, PreflightError::TimedOut { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn commands_run_in_the_given_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker"), "here").unwrap();
        let config = PreflightConfig::with_commands(vec![argv(&["test", "-f", "marker"])]);
        run_preflight(&config, dir.path()).await.unwrap();
    }

    #[tokio::test]
    async fn environment_is_cleared() {
        let dir = tempfile::tempdir().unwrap();
        // HOME is present in any normal test environment; the scratch run
        // must not see it.
        let config = PreflightConfig::with_commands(vec![argv(&[
            "sh",
            "-c",
            "test -z \"$HOME\"",
        ])]);
        run_preflight(&config, dir.path()).await.unwrap();
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let config =
            PreflightConfig::with_commands(vec![argv(&["definitely-not-a-binary-xyz"])]);
        let err = run_preflight(&config, dir.path()).await.unwrap_err();
        assert!(matches!(err, PreflightError::Spawn { .. }));
    }
}
