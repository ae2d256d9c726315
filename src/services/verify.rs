//! Baseline verification runner.
//!
//! The project's verification command is externally configured as an argv
//! template and run inside a worktree. Exit 0 is the only success signal;
//! everything else (including a timeout) is a failure whose combined
//! output feeds back into the next attempt.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use crate::domain::errors::{EngineError, EngineResult};

/// Outcome of one verification run.
#[derive(Debug, Clone)]
pub struct VerifyResult {
    pub passed: bool,
    /// Combined stdout + stderr, truncated for prompt feedback
    pub output: String,
}

const MAX_FEEDBACK_CHARS: usize = 8_000;

/// Runs the configured verification command.
#[derive(Debug, Clone)]
pub struct Verifier {
    command: Vec<String>,
    timeout: Duration,
}

impl Verifier {
    pub fn new(command: Vec<String>, timeout: Duration) -> Self {
        Self { command, timeout }
    }

    /// Whether a verification command is configured at all.
    pub fn is_configured(&self) -> bool {
        !self.command.is_empty()
    }

    /// Run verification in `workdir`. An unconfigured verifier always
    /// passes.
    pub async fn run(&self, workdir: &Path) -> EngineResult<VerifyResult> {
        let Some((program, args)) = self.command.split_first() else {
            return Ok(VerifyResult {
                passed: true,
                output: String::new(),
            });
        };

        debug!(command = ?self.command, workdir = %workdir.display(), "running verification");

        let child = Command::new(program)
            .args(args)
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(self.timeout, child).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(EngineError::ValidationFailed(format!(
                    "failed to spawn verification command: {e}"
                )))
            }
            Err(_) => {
                return Ok(VerifyResult {
                    passed: false,
                    output: format!(
                        "verification timed out after {}s",
                        self.timeout.as_secs()
                    ),
                })
            }
        };

        let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            if !combined.is_empty() {
                combined.push('\n');
            }
            combined.push_str(&stderr);
        }
        if combined.chars().count() > MAX_FEEDBACK_CHARS {
            combined = combined.chars().take(MAX_FEEDBACK_CHARS).collect();
        }

        Ok(VerifyResult {
            passed: output.status.success(),
            output: combined,
        })
    }
}
