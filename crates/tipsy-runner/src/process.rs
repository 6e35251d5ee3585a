//! External process execution: build invocation and simulator helpers.

use std::io::{Read, Write};
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::RunConfiguration;
use crate::harness::HARNESS_CLASS_NAME;
use crate::interrupt::Interrupt;

/// How long a freshly launched simulator is given before the run continues.
pub const SIMULATOR_WARMUP: Duration = Duration::from_secs(20);

const EXIT_SIGNAL_BASE: i32 = 128;
const INTERRUPT_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProcessError {
    #[error("failed to start shell: {0}")]
    SpawnFailure(String),
    #[error("build command exited with status {exit_code}")]
    BuildFailure { exit_code: i32 },
    #[error("simulator command `{command}` failed: {reason}")]
    SimulatorCommandFailure { command: String, reason: String },
}

/// Result of running one shell command to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed { exit_code: i32 },
    SpawnFailure(String),
}

impl RunOutcome {
    pub fn succeeded(&self) -> bool {
        matches!(self, RunOutcome::Completed { exit_code: 0 })
    }
}

/// The seam between the runner and the operating system.
pub trait Shell {
    /// Runs `command` to completion with its output discarded.
    fn status(&self, command: &str) -> RunOutcome;
    /// Runs `command` to completion, forwarding combined stdout and stderr to
    /// `sink` as it is produced.
    fn stream(&self, command: &str, sink: &mut dyn Write) -> RunOutcome;
    /// Starts `command` and returns without waiting for it.
    fn spawn_detached(&self, command: &str) -> Result<(), ProcessError>;
}

impl<S: Shell + ?Sized> Shell for &S {
    fn status(&self, command: &str) -> RunOutcome {
        (**self).status(command)
    }

    fn stream(&self, command: &str, sink: &mut dyn Write) -> RunOutcome {
        (**self).stream(command, sink)
    }

    fn spawn_detached(&self, command: &str) -> Result<(), ProcessError> {
        (**self).spawn_detached(command)
    }
}

/// `bash -c`; bash is required for `PIPESTATUS`.
///
/// With an [`Interrupt`] attached, streamed commands get their own process
/// group and a raised signal is forwarded to that group.
#[derive(Debug, Clone, Default)]
pub struct BashShell {
    interrupt: Option<Interrupt>,
}

impl BashShell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_interrupt(interrupt: Interrupt) -> Self {
        Self {
            interrupt: Some(interrupt),
        }
    }

    fn command(script: &str) -> Command {
        let mut cmd = Command::new("bash");
        cmd.arg("-c").arg(script);
        cmd
    }

    fn pending_signal(&self) -> Option<i32> {
        self.interrupt.as_ref().and_then(Interrupt::signal)
    }
}

impl Shell for BashShell {
    fn status(&self, command: &str) -> RunOutcome {
        let mut cmd = Self::command(command);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        match cmd.status() {
            Ok(status) => RunOutcome::Completed {
                exit_code: exit_code_of(status),
            },
            Err(e) => RunOutcome::SpawnFailure(e.to_string()),
        }
    }

    fn stream(&self, command: &str, sink: &mut dyn Write) -> RunOutcome {
        let script = format!("exec 2>&1\n{}", command);
        let mut cmd = Self::command(&script);
        cmd.stdin(Stdio::null()).stdout(Stdio::piped());
        #[cfg(unix)]
        if self.interrupt.is_some() {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => return RunOutcome::SpawnFailure(e.to_string()),
        };
        if let Some(stdout) = child.stdout.take() {
            let (tx, rx) = mpsc::channel();
            let reader = thread::spawn(move || pump(stdout, tx));
            let mut sink_ok = true;
            let mut forwarded = None;
            loop {
                match rx.recv_timeout(INTERRUPT_POLL) {
                    Ok(chunk) => {
                        // Keep draining even if the sink fails so the child never blocks.
                        if sink_ok {
                            if let Err(e) = sink.write_all(&chunk).and_then(|_| sink.flush()) {
                                warn!(error = %e, "output sink failed; discarding further output");
                                sink_ok = false;
                            }
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
                if let Some(signal) = self.pending_signal() {
                    if forwarded != Some(signal) {
                        forward_signal(child.id(), signal);
                        forwarded = Some(signal);
                    }
                }
            }
            let _ = reader.join();
        }
        match child.wait() {
            Ok(status) => RunOutcome::Completed {
                exit_code: exit_code_of(status),
            },
            Err(e) => RunOutcome::SpawnFailure(e.to_string()),
        }
    }

    fn spawn_detached(&self, command: &str) -> Result<(), ProcessError> {
        let mut cmd = Self::command(command);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        let mut child = cmd
            .spawn()
            .map_err(|e| ProcessError::SpawnFailure(e.to_string()))?;
        // Reap in the background so the child does not linger as a zombie.
        thread::spawn(move || {
            let _ = child.wait();
        });
        Ok(())
    }
}

fn pump(mut out: impl Read, tx: mpsc::Sender<Vec<u8>>) {
    let mut buf = [0u8; 8192];
    loop {
        match out.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(error = %e, "failed reading process output");
                break;
            }
        }
    }
}

/// Sends `signal` to the process group led by `pgid`.
fn forward_signal(pgid: u32, signal: i32) {
    info!(signal, pgid, "forwarding interrupt to build");
    let status = Command::new("bash")
        .arg("-c")
        .arg(format!("kill -n {} -- -{}", signal, pgid))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    if !matches!(status, Ok(s) if s.success()) {
        warn!(signal, pgid, "failed to forward interrupt");
    }
}

fn exit_code_of(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return EXIT_SIGNAL_BASE + signal;
        }
    }
    1
}

pub fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:=,@+".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}

/// Composes the build-tool command line for an isolated workspace.
pub fn build_command(config: &RunConfiguration, workspace: &Path) -> String {
    let only_testing = format!("-only-testing:{}/{}", config.target, HARNESS_CLASS_NAME);
    [
        config.build_tool.clone(),
        "-workspace".to_string(),
        shell_quote(&workspace.to_string_lossy()),
        "-scheme".to_string(),
        shell_quote(&config.scheme),
        "-destination".to_string(),
        shell_quote(&config.destination),
        shell_quote(&only_testing),
        "test".to_string(),
    ]
    .join(" ")
}

/// Pipes `build` through `formatter` while keeping the build's exit status.
pub fn pipe_through_formatter(build: &str, formatter: &str) -> String {
    format!(
        "{} 2>&1 | {}; exit ${{PIPESTATUS[0]}}",
        build,
        shell_quote(formatter)
    )
}

pub struct ProcessRunner<S: Shell> {
    shell: S,
    simulator_warmup: Duration,
}

impl<S: Shell> ProcessRunner<S> {
    pub fn new(shell: S) -> Self {
        Self {
            shell,
            simulator_warmup: SIMULATOR_WARMUP,
        }
    }

    pub fn with_simulator_warmup(mut self, warmup: Duration) -> Self {
        self.simulator_warmup = warmup;
        self
    }

    pub fn shell(&self) -> &S {
        &self.shell
    }

    /// Whether `tool` resolves on `PATH`, judged by the lookup's exit code alone.
    pub fn probe(&self, tool: &str) -> bool {
        let found = self
            .shell
            .status(&format!("command -v {}", shell_quote(tool)))
            .succeeded();
        debug!(tool, found, "probed tool");
        found
    }

    pub fn invoke(&self, command: &str, sink: &mut dyn Write) -> RunOutcome {
        info!(command, "invoking");
        self.shell.stream(command, sink)
    }

    /// Runs the build for `config` against `workspace`, streaming to `sink`.
    pub fn run_build(
        &self,
        config: &RunConfiguration,
        workspace: &Path,
        sink: &mut dyn Write,
    ) -> Result<(), ProcessError> {
        let build = build_command(config, workspace);
        let command = match config.formatter.as_deref() {
            Some(formatter) if self.probe(formatter) => pipe_through_formatter(&build, formatter),
            Some(formatter) => {
                info!(formatter, "formatter not found; streaming raw build output");
                build
            }
            None => build,
        };
        match self.invoke(&command, sink) {
            RunOutcome::Completed { exit_code: 0 } => Ok(()),
            RunOutcome::Completed { exit_code } => Err(ProcessError::BuildFailure { exit_code }),
            RunOutcome::SpawnFailure(cause) => Err(ProcessError::SpawnFailure(cause)),
        }
    }

    pub fn is_simulator_running(&self) -> bool {
        self.shell.status("pgrep -x Simulator").succeeded()
    }

    /// Opens the simulator and blocks for the fixed warm-up interval.
    pub fn launch_simulator(&self) -> Result<(), ProcessError> {
        self.shell.spawn_detached("open -a Simulator")?;
        info!(seconds = self.simulator_warmup.as_secs(), "waiting for simulator");
        thread::sleep(self.simulator_warmup);
        Ok(())
    }

    pub fn reset_simulator(&self) -> Result<(), ProcessError> {
        self.simulator_command("xcrun simctl shutdown all >/dev/null 2>&1; xcrun simctl erase all")
    }

    pub fn uninstall(&self, bundle_id: &str) -> Result<(), ProcessError> {
        self.simulator_command(&format!(
            "xcrun simctl uninstall booted {}",
            shell_quote(bundle_id)
        ))
    }

    fn simulator_command(&self, command: &str) -> Result<(), ProcessError> {
        match self.shell.status(command) {
            RunOutcome::Completed { exit_code: 0 } => Ok(()),
            RunOutcome::Completed { exit_code } => Err(ProcessError::SimulatorCommandFailure {
                command: command.to_string(),
                reason: format!("exit status {}", exit_code),
            }),
            RunOutcome::SpawnFailure(cause) => Err(ProcessError::SimulatorCommandFailure {
                command: command.to_string(),
                reason: cause,
            }),
        }
    }
}
