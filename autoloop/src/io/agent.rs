//! Agent invocation.
//!
//! The [`AgentInvoker`] trait decouples the loop from the actual agent backend.
//! [`CliAgent`] spawns the configured command, feeds the prompt on stdin and
//! streams output to a live observer. Tests use scripted invokers that return
//! predetermined results without spawning processes.
//!
//! No retry logic lives here: every failure is reported once and the loop
//! runner decides whether to try again.

use std::process::Command;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, warn};

use crate::core::types::{AgentInvocationResult, InvocationFailure};
use crate::io::control::LoopControl;
use crate::io::observer::{LineObserver, TracingObserver};
use crate::io::process::{StreamOptions, is_not_found, run_command_streaming};

/// Abstraction over agent execution backends.
pub trait AgentInvoker {
    /// Run the agent once with `prompt`, giving up after `timeout`.
    fn invoke(&self, prompt: &str, timeout: Duration) -> AgentInvocationResult;
}

/// Agent driven through a non-interactive command line.
pub struct CliAgent {
    program: String,
    args: Vec<String>,
    workdir: std::path::PathBuf,
    output_limit_bytes: usize,
    observer: Arc<dyn LineObserver>,
    control: Option<LoopControl>,
}

impl CliAgent {
    /// `command` is the program followed by its arguments; it must not be empty.
    pub fn new(
        command: &[String],
        workdir: impl Into<std::path::PathBuf>,
        output_limit_bytes: usize,
    ) -> anyhow::Result<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| anyhow::anyhow!("agent command must not be empty"))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            workdir: workdir.into(),
            output_limit_bytes,
            observer: Arc::new(TracingObserver),
            control: None,
        })
    }

    pub fn with_observer(mut self, observer: Arc<dyn LineObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Kill the agent when `control` requests a pause or stop.
    pub fn with_control(mut self, control: LoopControl) -> Self {
        self.control = Some(control);
        self
    }
}

impl AgentInvoker for CliAgent {
    #[instrument(skip_all, fields(program = %self.program, timeout_secs = timeout.as_secs()))]
    fn invoke(&self, prompt: &str, timeout: Duration) -> AgentInvocationResult {
        info!(workdir = %self.workdir.display(), prompt_bytes = prompt.len(), "starting agent");
        let start = Instant::now();

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).current_dir(&self.workdir);

        let control = self.control.clone();
        let interrupt = move || control.as_ref().is_some_and(LoopControl::should_interrupt);
        let options = StreamOptions {
            stdin: Some(prompt.as_bytes()),
            timeout,
            output_limit_bytes: self.output_limit_bytes,
            observer: self.observer.clone(),
            interrupt: Some(&interrupt),
        };

        let output = match run_command_streaming(cmd, &options) {
            Ok(output) => output,
            Err(err) if is_not_found(&err) => {
                warn!(program = %self.program, "agent executable not found");
                return AgentInvocationResult::failed(
                    InvocationFailure::NotFound,
                    String::new(),
                    format!("{err:#}"),
                    start.elapsed(),
                );
            }
            Err(err) => {
                warn!(err = %format!("{err:#}"), "agent could not be run");
                return AgentInvocationResult::failed(
                    InvocationFailure::SpawnFailed {
                        message: format!("{err:#}"),
                    },
                    String::new(),
                    String::new(),
                    start.elapsed(),
                );
            }
        };

        let mut stdout = output.stdout_lossy();
        stdout.push_str(&output.stdout_truncated_notice("agent"));
        let mut stderr = output.stderr_lossy();
        stderr.push_str(&output.stderr_truncated_notice("agent"));

        if output.interrupted {
            // Partial output of an interrupted attempt is discarded.
            warn!("agent interrupted");
            return AgentInvocationResult::failed(
                InvocationFailure::Interrupted,
                String::new(),
                String::new(),
                output.elapsed,
            );
        }
        if output.timed_out {
            warn!(timeout_secs = timeout.as_secs(), "agent timed out");
            return AgentInvocationResult::failed(
                InvocationFailure::TimeoutExceeded {
                    timeout_secs: timeout.as_secs(),
                },
                stdout,
                stderr,
                output.elapsed,
            );
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "agent failed");
            return AgentInvocationResult::failed(
                InvocationFailure::NonzeroExit {
                    code: output.status.code(),
                },
                stdout,
                stderr,
                output.elapsed,
            );
        }

        debug!(elapsed_ms = output.elapsed.as_millis() as u64, "agent completed successfully");
        AgentInvocationResult::succeeded(stdout, stderr, output.elapsed)
    }
}
