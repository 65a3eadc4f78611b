//! Port change automation hook
//!
//! When the forwarded port changes, a user-supplied program is invoked as
//!
//! ```text
//! <command> <port> <output-file>
//! ```
//!
//! In synchronous mode the program runs to completion (bounded by a timeout)
//! and its output is logged. In asynchronous mode it is started in its own
//! process group and left alone; a background task only logs when it exits.

pub mod launcher;

pub use launcher::{Invocation, ProcessLauncher, ProcessOutput, SystemLauncher};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum ScriptExecutionError {
    #[error("Failed to start {program}: {source}")]
    SpawnFailed {
        program: PathBuf,
        source: std::io::Error,
    },

    #[error("Script timed out after {0:?}")]
    TimedOut(Duration),

    #[error("Script I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Script interrupted by shutdown")]
    Cancelled,
}

/// How to run the port change program
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutomationSpec {
    pub command_path: PathBuf,
    pub synchronous: bool,
    pub timeout: Duration,
}

impl AutomationSpec {
    pub fn mode(&self) -> &'static str {
        if self.synchronous {
            "synchronous"
        } else {
            "asynchronous"
        }
    }
}

/// What happened when the hook was triggered
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AutomationOutcome {
    /// Synchronous run finished
    Completed { success: bool, output: String },
    /// Asynchronous run started
    Detached { pid: u32 },
}

pub struct AutomationRunner {
    spec: AutomationSpec,
    launcher: Arc<dyn ProcessLauncher>,
}

impl AutomationRunner {
    pub fn new(spec: AutomationSpec, launcher: Arc<dyn ProcessLauncher>) -> Self {
        Self { spec, launcher }
    }

    pub fn spec(&self) -> &AutomationSpec {
        &self.spec
    }

    fn invocation(&self, port: u16, output_file: &Path) -> Invocation {
        Invocation {
            program: self.spec.command_path.clone(),
            args: vec![port.to_string(), output_file.display().to_string()],
        }
    }

    /// Invoke the program for `port`.
    ///
    /// Synchronous runs can be interrupted by `cancel`; detached runs return
    /// as soon as the process has started.
    pub async fn run(
        &self,
        port: u16,
        output_file: &Path,
        cancel: &CancellationToken,
    ) -> Result<AutomationOutcome, ScriptExecutionError> {
        info!(
            "Executing port change script: {} ({})",
            self.spec.command_path.display(),
            self.spec.mode()
        );
        let invocation = self.invocation(port, output_file);

        if !self.spec.synchronous {
            let pid = self.launcher.spawn_detached(&invocation)?;
            info!("Started script asynchronously (pid: {})", pid);
            return Ok(AutomationOutcome::Detached { pid });
        }

        let output = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ScriptExecutionError::Cancelled),
            result = self.launcher.run(&invocation, self.spec.timeout) => result?,
        };

        if output.success {
            info!("Script executed successfully\nOutput: {}", output.output);
        } else {
            warn!(
                "Script execution failed: {}\nOutput: {}",
                output.status, output.output
            );
        }

        Ok(AutomationOutcome::Completed {
            success: output.success,
            output: output.output,
        })
    }
}
