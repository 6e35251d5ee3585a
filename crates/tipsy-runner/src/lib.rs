//! Runs scenario-driven UI test sessions against an Xcode project without
//! touching the user's files.
//!
//! A run isolates the project and workspace into `-temp` copies, injects a
//! generated harness into the copy's test target, invokes the build tool and
//! removes every temporary artifact afterwards.

pub mod cleanup;
pub mod config;
pub mod graph;
pub mod harness;
pub mod interrupt;
pub mod isolate;
pub mod pbxproj;
pub mod process;
pub mod workspace;

use std::env;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use tracing::{error, info, warn};

pub use cleanup::{recover, ArtifactGuard, CleanupError, CleanupReport, RunLock};
pub use config::{ConfigError, ResetMode, RunConfiguration, RunMode, RunOptions};
pub use interrupt::Interrupt;
pub use process::{BashShell, ProcessError, ProcessRunner, RunOutcome, Shell};

use crate::graph::ProjectGraph;
use crate::workspace::WorkspaceDescriptor;

pub const SETUP_FAILURE_EXIT_CODE: i32 = 70;
pub const CONFIG_ERROR_EXIT_CODE: i32 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    Validating,
    Preparing,
    IsolatingArtifacts,
    MutatingGraph,
    RenderingHarness,
    Invoking,
    CleaningUp,
    Done,
}

impl RunStage {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStage::Validating => "validating",
            RunStage::Preparing => "preparing",
            RunStage::IsolatingArtifacts => "isolating_artifacts",
            RunStage::MutatingGraph => "mutating_graph",
            RunStage::RenderingHarness => "rendering_harness",
            RunStage::Invoking => "invoking",
            RunStage::CleaningUp => "cleaning_up",
            RunStage::Done => "done",
        }
    }

    fn allowed_transitions(self) -> &'static [RunStage] {
        use RunStage::*;
        match self {
            Validating => &[Preparing],
            Preparing => &[IsolatingArtifacts, CleaningUp],
            IsolatingArtifacts => &[MutatingGraph, CleaningUp],
            MutatingGraph => &[RenderingHarness, CleaningUp],
            RenderingHarness => &[Invoking, CleaningUp],
            Invoking => &[CleaningUp],
            CleaningUp => &[Done],
            Done => &[],
        }
    }

    pub fn can_transition_to(self, next: RunStage) -> bool {
        self.allowed_transitions().contains(&next)
    }
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final outcome of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunResult {
    Success,
    /// The build tool ran and exited non-zero.
    BuildFailure { exit_code: i32 },
    /// The run never reached a meaningful build outcome.
    SetupFailure { stage: RunStage, cause: String },
}

impl RunResult {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunResult::Success => 0,
            RunResult::BuildFailure { exit_code } => *exit_code,
            RunResult::SetupFailure { .. } => SETUP_FAILURE_EXIT_CODE,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RunResult::Success)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunResult::Success => "success",
            RunResult::BuildFailure { .. } => "build_failure",
            RunResult::SetupFailure { .. } => "setup_failure",
        }
    }
}

struct StageFailure {
    stage: RunStage,
    cause: String,
}

impl StageFailure {
    fn new(stage: RunStage, cause: impl fmt::Display) -> Self {
        Self {
            stage,
            cause: cause.to_string(),
        }
    }
}

enum Outcome {
    Built,
    BuildFailed(i32),
}

/// Paths of the isolated copies a run works on.
struct Isolation {
    project: PathBuf,
    workspace: PathBuf,
}

/// Drives one run through its stages. Construct a fresh one per invocation.
pub struct Orchestrator<S: Shell> {
    runner: ProcessRunner<S>,
    working_dir: PathBuf,
    interrupt: Option<Interrupt>,
    stage: RunStage,
}

impl<S: Shell> Orchestrator<S> {
    pub fn new(shell: S) -> Self {
        Self {
            runner: ProcessRunner::new(shell),
            working_dir: PathBuf::from("."),
            interrupt: None,
            stage: RunStage::Validating,
        }
    }

    /// Directory relative paths are resolved against and where the harness
    /// and run lock are written.
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }

    pub fn with_simulator_warmup(mut self, warmup: Duration) -> Self {
        self.runner = self.runner.with_simulator_warmup(warmup);
        self
    }

    /// Checked before every stage; a raised signal sends the run straight
    /// to cleanup.
    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = Some(interrupt);
        self
    }

    /// Validates `options` and performs the run, streaming build output into
    /// `sink`. An `Err` means validation failed and nothing was touched.
    pub fn execute(
        mut self,
        options: RunOptions,
        sink: &mut dyn Write,
    ) -> Result<RunResult, ConfigError> {
        info!(stage = %self.stage, "validating configuration");
        let working_dir = absolute(&self.working_dir);
        let config = resolve_paths(options.validate()?, &working_dir);
        info!(
            target = %config.target,
            scheme = %config.scheme,
            mode = config.run_mode.as_str(),
            "configuration accepted"
        );
        self.working_dir = working_dir;

        self.enter(RunStage::Preparing);
        let mut guard = match self.prepare() {
            Ok(guard) => guard,
            Err(failure) => return Ok(self.finish(Err(failure), None)),
        };
        let outcome = self.run_stages(&config, &mut guard, sink);
        Ok(self.finish(outcome, Some(guard)))
    }

    fn enter(&mut self, next: RunStage) {
        debug_assert!(
            self.stage.can_transition_to(next),
            "illegal transition {} -> {}",
            self.stage,
            next
        );
        info!(from = %self.stage, stage = %next, "stage");
        self.stage = next;
    }

    /// Enters `next` unless the run has been interrupted.
    fn advance(&mut self, next: RunStage) -> Result<(), StageFailure> {
        self.enter(next);
        self.check_interrupt()
    }

    fn check_interrupt(&self) -> Result<(), StageFailure> {
        match self.interrupt.as_ref().and_then(Interrupt::signal) {
            Some(signal) => Err(StageFailure::new(
                self.stage,
                format!("interrupted by signal {}", signal),
            )),
            None => Ok(()),
        }
    }

    fn prepare(&self) -> Result<ArtifactGuard, StageFailure> {
        let fail = |e: &dyn fmt::Display| StageFailure::new(RunStage::Preparing, e);
        let lock = RunLock::acquire(&self.working_dir).map_err(|e| fail(&e))?;
        Ok(ArtifactGuard::with_lock(lock))
    }

    fn run_stages(
        &mut self,
        config: &RunConfiguration,
        guard: &mut ArtifactGuard,
        sink: &mut dyn Write,
    ) -> Result<Outcome, StageFailure> {
        self.check_interrupt()?;
        self.prepare_simulator(config)
            .map_err(|e| StageFailure::new(RunStage::Preparing, e))?;

        self.advance(RunStage::IsolatingArtifacts)?;
        let isolation = isolate_artifacts(config, guard)?;
        let harness_path = harness::harness_path(&self.working_dir);
        guard
            .track(&harness_path)
            .map_err(|e| StageFailure::new(RunStage::IsolatingArtifacts, e))?;

        self.advance(RunStage::MutatingGraph)?;
        mutate_graph(config, &isolation, &harness_path)?;

        self.advance(RunStage::RenderingHarness)?;
        let replay_steps = match &config.run_mode {
            RunMode::Replay { steps } => {
                let fail = |e: &dyn fmt::Display| StageFailure::new(RunStage::RenderingHarness, e);
                let count = harness::check_replay_file(steps).map_err(|e| fail(&e))?;
                info!(path = %steps.display(), steps = count, "replay file decoded");
                Some(fs::canonicalize(steps).map_err(|e| fail(&e))?)
            }
            _ => None,
        };
        let artifact = harness::write_harness(config, &self.working_dir, replay_steps.as_deref())
            .map_err(|e| StageFailure::new(RunStage::RenderingHarness, e))?;
        info!(class = artifact.class_name, "harness ready");

        self.advance(RunStage::Invoking)?;
        match self.runner.run_build(config, &isolation.workspace, sink) {
            Ok(()) => Ok(Outcome::Built),
            Err(ProcessError::BuildFailure { exit_code }) => Ok(Outcome::BuildFailed(exit_code)),
            Err(e) => Err(StageFailure::new(RunStage::Invoking, e)),
        }
    }

    fn prepare_simulator(&self, config: &RunConfiguration) -> Result<(), ProcessError> {
        match &config.reset {
            ResetMode::None => Ok(()),
            ResetMode::Reset => {
                info!("resetting simulator");
                self.runner.reset_simulator()?;
                self.runner.launch_simulator()
            }
            ResetMode::Uninstall { bundle_id } => {
                if !self.runner.is_simulator_running() {
                    self.runner.launch_simulator()?;
                }
                info!(bundle_id = %bundle_id, "uninstalling app");
                self.runner.uninstall(bundle_id)
            }
        }
    }

    fn finish(
        &mut self,
        outcome: Result<Outcome, StageFailure>,
        guard: Option<ArtifactGuard>,
    ) -> RunResult {
        let result = match outcome {
            Ok(Outcome::Built) => RunResult::Success,
            Ok(Outcome::BuildFailed(exit_code)) => {
                match self.interrupt.as_ref().and_then(Interrupt::signal) {
                    Some(signal) => warn!(exit_code, signal, "build interrupted"),
                    None => warn!(exit_code, "build failed"),
                }
                RunResult::BuildFailure { exit_code }
            }
            Err(StageFailure { stage, cause }) => {
                error!(stage = %stage, cause = %cause, "run setup failed");
                RunResult::SetupFailure { stage, cause }
            }
        };

        self.enter(RunStage::CleaningUp);
        if let Some(mut guard) = guard {
            info!(artifacts = guard.artifacts().len(), "releasing temporary artifacts");
            let report = guard.release();
            for path in &report.failed {
                warn!(path = %path.display(), "temporary artifact left behind; run `tipsy clean`");
            }
        }

        self.enter(RunStage::Done);
        info!(result = result.as_str(), exit_code = result.exit_code(), "run finished");
        result
    }
}

fn isolate_artifacts(
    config: &RunConfiguration,
    guard: &mut ArtifactGuard,
) -> Result<Isolation, StageFailure> {
    let fail = |e: &dyn fmt::Display| StageFailure::new(RunStage::IsolatingArtifacts, e);
    let mut copies = Vec::with_capacity(2);
    for original in [&config.project, &config.workspace] {
        let temporary = isolate::temp_path_from(original).map_err(|e| fail(&e))?;
        guard.track(&temporary).map_err(|e| fail(&e))?;
        let isolated = isolate::isolate(original).map_err(|e| fail(&e))?;
        info!(
            original = %isolated.original.display(),
            temporary = %isolated.temporary.display(),
            "isolated"
        );
        copies.push(isolated.temporary);
    }
    let workspace = copies.pop().unwrap_or_default();
    let project = copies.pop().unwrap_or_default();
    Ok(Isolation { project, workspace })
}

fn mutate_graph(
    config: &RunConfiguration,
    isolation: &Isolation,
    harness_path: &Path,
) -> Result<(), StageFailure> {
    let fail = |e: &dyn fmt::Display| StageFailure::new(RunStage::MutatingGraph, e);
    let mut graph = ProjectGraph::load(&isolation.project).map_err(|e| fail(&e))?;
    let source_root = isolation
        .project
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();
    let injection = graph::inject_harness(
        &mut graph,
        &config.target,
        harness_path,
        &source_root,
        &isolation.project,
    )
    .map_err(|e| fail(&e))?;
    info!(
        target = %config.target,
        build_file = %injection.build_file,
        "harness registered in project copy"
    );

    let mut descriptor = WorkspaceDescriptor::load(&isolation.workspace).map_err(|e| fail(&e))?;
    let original_name = file_name(&config.project);
    // `group:` locations are relative to the directory holding the workspace.
    let workspace_dir = isolation.workspace.parent().unwrap_or_else(|| Path::new(""));
    let isolated_location = graph::relative_path(&isolation.project, workspace_dir);
    if descriptor.rewrite_project_location(&original_name, &isolated_location.to_string_lossy()) == 0 {
        return Err(fail(&format!(
            "workspace {} does not reference {}",
            config.workspace.display(),
            original_name
        )));
    }
    descriptor.save(&isolation.workspace).map_err(|e| fail(&e))?;
    Ok(())
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn absolute(dir: &Path) -> PathBuf {
    if dir.is_absolute() {
        return graph::normalize_path(dir);
    }
    match env::current_dir() {
        Ok(cwd) => graph::normalize_path(&cwd.join(dir)),
        Err(_) => dir.to_path_buf(),
    }
}

fn resolve_paths(mut config: RunConfiguration, base: &Path) -> RunConfiguration {
    let resolve = |p: &Path| {
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            graph::normalize_path(&base.join(p))
        }
    };
    config.workspace = resolve(&config.workspace);
    config.project = resolve(&config.project);
    if let RunMode::Replay { steps } = &config.run_mode {
        config.run_mode = RunMode::Replay {
            steps: resolve(steps),
        };
    }
    config.replay_output = config.replay_output.as_deref().map(resolve);
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stages_advance_linearly() {
        use RunStage::*;
        let order = [
            Validating,
            Preparing,
            IsolatingArtifacts,
            MutatingGraph,
            RenderingHarness,
            Invoking,
            CleaningUp,
            Done,
        ];
        for pair in order.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
        assert!(!Validating.can_transition_to(CleaningUp));
        assert!(!Invoking.can_transition_to(MutatingGraph));
        assert!(!Done.can_transition_to(Validating));
        for stage in [Preparing, IsolatingArtifacts, MutatingGraph, RenderingHarness, Invoking] {
            assert!(stage.can_transition_to(CleaningUp));
        }
    }

    #[test]
    fn results_map_to_exit_codes() {
        assert_eq!(RunResult::Success.exit_code(), 0);
        assert_eq!(RunResult::BuildFailure { exit_code: 65 }.exit_code(), 65);
        assert_eq!(
            RunResult::SetupFailure {
                stage: RunStage::MutatingGraph,
                cause: "no target".into()
            }
            .exit_code(),
            SETUP_FAILURE_EXIT_CODE
        );
    }

    #[test]
    fn working_dir_is_normalized() {
        let cwd = env::current_dir().unwrap();
        assert_eq!(absolute(Path::new(".")), cwd);
        assert_eq!(absolute(Path::new("/work/./sub/..")), PathBuf::from("/work"));
        let resolved = absolute(Path::new("./fixtures"));
        assert!(!resolved.to_string_lossy().contains("/./"));
    }

    #[test]
    fn relative_paths_resolve_against_working_dir() {
        let config = RunOptions {
            workspace: Some("App.xcworkspace".into()),
            project: Some("/abs/App.xcodeproj".into()),
            target: Some("AppTests".into()),
            scenarios: Some("A".into()),
            destination: Some("platform=iOS Simulator,name=iPhone 14".into()),
            replay: Some("steps.json".into()),
            replay_output: Some("out/replay.json".into()),
            ..RunOptions::default()
        }
        .validate()
        .unwrap();
        let resolved = resolve_paths(config, Path::new("/work"));
        assert_eq!(resolved.workspace, PathBuf::from("/work/App.xcworkspace"));
        assert_eq!(resolved.project, PathBuf::from("/abs/App.xcodeproj"));
        assert_eq!(
            resolved.run_mode,
            RunMode::Replay {
                steps: "/work/steps.json".into()
            }
        );
        assert_eq!(resolved.replay_output, Some("/work/out/replay.json".into()));
    }
}
