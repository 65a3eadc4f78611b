//! Process execution
//!
//! The runner never spawns processes itself; it goes through a
//! `ProcessLauncher` so tests can substitute a recording fake.

use crate::automation::ScriptExecutionError;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{info, warn};

/// A program and its arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<String>,
}

/// Result of a process that ran to completion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub success: bool,
    /// Exit status as reported by the OS, e.g. `exit status: 1`
    pub status: String,
    /// stdout followed by stderr
    pub output: String,
}

#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    /// Run to completion, killing the process if it outlives `timeout`
    async fn run(
        &self,
        invocation: &Invocation,
        timeout: Duration,
    ) -> Result<ProcessOutput, ScriptExecutionError>;

    /// Start in its own process group and return its pid without waiting
    fn spawn_detached(&self, invocation: &Invocation) -> Result<u32, ScriptExecutionError>;
}

/// Launches real processes with tokio
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemLauncher;

impl SystemLauncher {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProcessLauncher for SystemLauncher {
    async fn run(
        &self,
        invocation: &Invocation,
        timeout: Duration,
    ) -> Result<ProcessOutput, ScriptExecutionError> {
        let child = Command::new(&invocation.program)
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ScriptExecutionError::SpawnFailed {
                program: invocation.program.clone(),
                source,
            })?;

        // Dropping the wait future on timeout drops the child, which kills it
        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| ScriptExecutionError::TimedOut(timeout))??;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        Ok(ProcessOutput {
            success: output.status.success(),
            status: output.status.to_string(),
            output: combined,
        })
    }

    fn spawn_detached(&self, invocation: &Invocation) -> Result<u32, ScriptExecutionError> {
        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        // A signal sent to our process group must not reach the script
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .map_err(|source| ScriptExecutionError::SpawnFailed {
                program: invocation.program.clone(),
                source,
            })?;
        let pid = child.id().unwrap_or_default();

        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) if status.success() => {
                    info!("Async script completed successfully (pid: {})", pid);
                }
                Ok(status) => {
                    warn!("Async script failed (pid: {}): {}", pid, status);
                }
                Err(e) => {
                    warn!("Failed to wait for async script (pid: {}): {}", pid, e);
                }
            }
        });

        Ok(pid)
    }
}
