use std::cell::RefCell;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tipsy_runner::cleanup::{self, RunLock};
use tipsy_runner::harness::HARNESS_FILE_NAME;
use tipsy_runner::{
    ConfigError, Interrupt, Orchestrator, ProcessError, RunOptions, RunOutcome, RunResult,
    RunStage, Shell,
};

const SIGINT: i32 = 2;

fn fixtures() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests").join("fixtures")
}

fn copy_tree(from: &Path, to: &Path) {
    fs::create_dir_all(to).unwrap();
    for entry in fs::read_dir(from).unwrap() {
        let entry = entry.unwrap();
        let dest = to.join(entry.file_name());
        if entry.file_type().unwrap().is_dir() {
            copy_tree(&entry.path(), &dest);
        } else {
            fs::copy(entry.path(), &dest).unwrap();
        }
    }
}

fn scratch_project() -> tempfile::TempDir {
    let dir = tempfile::tempdir().expect("tempdir");
    copy_tree(&fixtures(), dir.path());
    dir
}

fn options() -> RunOptions {
    RunOptions {
        workspace: Some("Tipsy.xcworkspace".into()),
        project: Some("Tipsy.xcodeproj".into()),
        target: Some("Tipsy_Tests".into()),
        scenarios: Some("APIScenarios, UIScenarios".into()),
        destination: Some("platform=iOS Simulator,name=iPhone 14".into()),
        no_formatter: Some(true),
        ..RunOptions::default()
    }
}

/// Answers shell commands from a script and snapshots the generated files
/// at build time, before cleanup removes them.
struct ScriptedShell {
    working_dir: PathBuf,
    /// Directory holding the project copy, relative to `working_dir`.
    project_dir: PathBuf,
    build_exit: i32,
    formatter_installed: bool,
    simulator_running: bool,
    /// Raises SIGINT when a command containing the needle runs.
    interrupt_on: Option<(&'static str, Interrupt)>,
    commands: RefCell<Vec<String>>,
    harness_at_build: RefCell<Option<String>>,
    project_at_build: RefCell<Option<String>>,
    workspace_at_build: RefCell<Option<String>>,
}

impl ScriptedShell {
    fn new(working_dir: &Path) -> Self {
        Self {
            working_dir: working_dir.to_path_buf(),
            project_dir: PathBuf::new(),
            build_exit: 0,
            formatter_installed: false,
            simulator_running: true,
            interrupt_on: None,
            commands: RefCell::new(Vec::new()),
            harness_at_build: RefCell::new(None),
            project_at_build: RefCell::new(None),
            workspace_at_build: RefCell::new(None),
        }
    }

    fn record(&self, command: &str) {
        self.commands.borrow_mut().push(command.to_string());
        if let Some((needle, interrupt)) = &self.interrupt_on {
            if command.contains(needle) {
                interrupt.raise(SIGINT);
            }
        }
    }

    fn interrupted(&self) -> bool {
        self.interrupt_on
            .as_ref()
            .map_or(false, |(_, interrupt)| interrupt.signal().is_some())
    }

    fn commands(&self) -> Vec<String> {
        self.commands.borrow().clone()
    }

    fn build_commands(&self) -> Vec<String> {
        self.commands()
            .into_iter()
            .filter(|c| c.contains("-only-testing:"))
            .collect()
    }
}

impl Shell for ScriptedShell {
    fn status(&self, command: &str) -> RunOutcome {
        self.record(command);
        let ok = if command.starts_with("command -v") {
            self.formatter_installed
        } else if command.starts_with("pgrep") {
            self.simulator_running
        } else {
            true
        };
        RunOutcome::Completed {
            exit_code: if ok { 0 } else { 1 },
        }
    }

    fn stream(&self, command: &str, sink: &mut dyn Write) -> RunOutcome {
        self.record(command);
        *self.harness_at_build.borrow_mut() =
            fs::read_to_string(self.working_dir.join(HARNESS_FILE_NAME)).ok();
        *self.project_at_build.borrow_mut() = fs::read_to_string(
            self.working_dir
                .join(&self.project_dir)
                .join("Tipsy-temp.xcodeproj")
                .join("project.pbxproj"),
        )
        .ok();
        *self.workspace_at_build.borrow_mut() = fs::read_to_string(
            self.working_dir
                .join("Tipsy-temp.xcworkspace")
                .join("contents.xcworkspacedata"),
        )
        .ok();
        let _ = writeln!(sink, "** TEST EXECUTE **");
        if self.interrupted() {
            // bash reports a child killed by SIGINT as 128 + 2.
            return RunOutcome::Completed { exit_code: 130 };
        }
        RunOutcome::Completed {
            exit_code: self.build_exit,
        }
    }

    fn spawn_detached(&self, command: &str) -> Result<(), ProcessError> {
        self.record(command);
        Ok(())
    }
}

fn assert_no_artifacts(dir: &Path) {
    for name in [
        "Tipsy-temp.xcodeproj",
        "Tipsy-temp.xcworkspace",
        HARNESS_FILE_NAME,
        cleanup::RUN_LOCK_FILE,
    ] {
        assert!(!dir.join(name).exists(), "{} should have been removed", name);
    }
}

fn run(shell: &ScriptedShell, dir: &Path, options: RunOptions) -> Result<RunResult, ConfigError> {
    let mut sink = Vec::new();
    let mut orchestrator = Orchestrator::new(shell)
        .with_working_dir(dir)
        .with_simulator_warmup(Duration::ZERO);
    if let Some((_, interrupt)) = &shell.interrupt_on {
        orchestrator = orchestrator.with_interrupt(interrupt.clone());
    }
    orchestrator.execute(options, &mut sink)
}

#[test]
fn timed_run_succeeds_and_cleans_up() {
    let dir = scratch_project();
    let original_project =
        fs::read_to_string(dir.path().join("Tipsy.xcodeproj/project.pbxproj")).unwrap();
    let shell = ScriptedShell::new(dir.path());

    let result = run(&shell, dir.path(), options()).expect("valid options");
    assert_eq!(result, RunResult::Success);
    assert_eq!(result.exit_code(), 0);

    let harness = shell.harness_at_build.borrow().clone().expect("harness at build");
    let api = harness.find("APIScenarios(priority: .highest)").expect("api provider");
    let ui = harness.find("UIScenarios(priority: .highest)").expect("ui provider");
    assert!(api < ui);
    assert!(harness.contains("runner.run(minutes: 60)"));

    let project = shell.project_at_build.borrow().clone().expect("project at build");
    assert!(project.contains(HARNESS_FILE_NAME));
    assert!(project.contains("TipsyGenerated"));

    let workspace = shell.workspace_at_build.borrow().clone().expect("workspace at build");
    assert!(workspace.contains("location = \"group:Tipsy-temp.xcodeproj\""), "{}", workspace);
    assert!(!workspace.contains("group:Tipsy.xcodeproj"));
    assert!(workspace.contains("group:Pods/Pods.xcodeproj"));

    let builds = shell.build_commands();
    assert_eq!(builds.len(), 1);
    assert!(builds[0].contains("Tipsy-temp.xcworkspace"));
    assert!(builds[0].contains("-only-testing:Tipsy_Tests/TipsyGeneratedHarness"));

    assert_no_artifacts(dir.path());
    assert_eq!(
        fs::read_to_string(dir.path().join("Tipsy.xcodeproj/project.pbxproj")).unwrap(),
        original_project
    );
}

#[test]
fn missing_target_fails_setup_and_removes_artifacts() {
    let dir = scratch_project();
    let shell = ScriptedShell::new(dir.path());
    let mut opts = options();
    opts.target = Some("NoSuchTarget".into());

    let result = run(&shell, dir.path(), opts).expect("valid options");
    match &result {
        RunResult::SetupFailure { stage, cause } => {
            assert_eq!(*stage, RunStage::MutatingGraph);
            assert!(cause.contains("NoSuchTarget"), "{}", cause);
        }
        other => panic!("unexpected result {:?}", other),
    }
    assert_eq!(result.exit_code(), tipsy_runner::SETUP_FAILURE_EXIT_CODE);
    assert!(shell.build_commands().is_empty());
    assert_no_artifacts(dir.path());
}

#[test]
fn build_exit_code_is_propagated() {
    let dir = scratch_project();
    let mut shell = ScriptedShell::new(dir.path());
    shell.build_exit = 65;

    let result = run(&shell, dir.path(), options()).expect("valid options");
    assert_eq!(result, RunResult::BuildFailure { exit_code: 65 });
    assert_eq!(result.exit_code(), 65);
    assert_no_artifacts(dir.path());
}

#[test]
fn missing_option_fails_before_any_side_effect() {
    let dir = scratch_project();
    let before: Vec<_> = fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    let shell = ScriptedShell::new(dir.path());
    let mut opts = options();
    opts.destination = None;

    let err = run(&shell, dir.path(), opts).expect_err("destination is required");
    assert!(matches!(err, ConfigError::MissingRequiredOption("destination")));
    assert!(shell.commands().is_empty());
    let after: Vec<_> = fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    assert_eq!(before.len(), after.len());
}

#[test]
fn comprehensive_mode_wins_over_replay() {
    let dir = scratch_project();
    let shell = ScriptedShell::new(dir.path());
    let mut opts = options();
    opts.comprehensive = Some(true);
    opts.replay = Some("missing-steps.json".into());

    assert_eq!(run(&shell, dir.path(), opts).unwrap(), RunResult::Success);
    let harness = shell.harness_at_build.borrow().clone().unwrap();
    assert!(harness.contains("runner.runComprehensive()"));
    assert!(!harness.contains("JSONDecoder"));
}

#[test]
fn replay_run_embeds_absolute_steps_path() {
    let dir = scratch_project();
    fs::write(dir.path().join("steps.json"), "[{\"scenario\":\"login\"}]").unwrap();
    let shell = ScriptedShell::new(dir.path());
    let mut opts = options();
    opts.replay = Some("steps.json".into());

    assert_eq!(run(&shell, dir.path(), opts).unwrap(), RunResult::Success);
    let harness = shell.harness_at_build.borrow().clone().unwrap();
    let steps = fs::canonicalize(dir.path().join("steps.json")).unwrap();
    assert!(harness.contains(&*steps.to_string_lossy()));
    assert!(harness.contains("runner.replay(steps: steps)"));
    assert!(dir.path().join("steps.json").exists());
}

#[test]
fn undecodable_replay_file_fails_while_rendering() {
    let dir = scratch_project();
    fs::write(dir.path().join("steps.json"), "{\"not\":\"an array\"}").unwrap();
    let shell = ScriptedShell::new(dir.path());
    let mut opts = options();
    opts.replay = Some("steps.json".into());

    let result = run(&shell, dir.path(), opts).unwrap();
    assert!(matches!(
        result,
        RunResult::SetupFailure {
            stage: RunStage::RenderingHarness,
            ..
        }
    ));
    assert!(shell.build_commands().is_empty());
    assert_no_artifacts(dir.path());
}

#[test]
fn concurrent_run_is_rejected() {
    let dir = scratch_project();
    let _held = RunLock::acquire(dir.path()).expect("lock");
    let shell = ScriptedShell::new(dir.path());

    let result = run(&shell, dir.path(), options()).unwrap();
    assert!(matches!(
        result,
        RunResult::SetupFailure {
            stage: RunStage::Preparing,
            ..
        }
    ));
    assert!(!dir.path().join("Tipsy-temp.xcodeproj").exists());
}

#[test]
fn formatter_is_used_when_installed() {
    let dir = scratch_project();
    let mut shell = ScriptedShell::new(dir.path());
    shell.formatter_installed = true;
    let mut opts = options();
    opts.no_formatter = None;

    assert_eq!(run(&shell, dir.path(), opts).unwrap(), RunResult::Success);
    let builds = shell.build_commands();
    assert!(builds[0].contains("| xcpretty; exit ${PIPESTATUS[0]}"));
}

#[test]
fn uninstall_launches_simulator_when_needed() {
    let dir = scratch_project();
    let mut shell = ScriptedShell::new(dir.path());
    shell.simulator_running = false;
    let mut opts = options();
    opts.uninstall = Some("com.example.Tipsy".into());

    assert_eq!(run(&shell, dir.path(), opts).unwrap(), RunResult::Success);
    let commands = shell.commands();
    let launch = commands.iter().position(|c| c == "open -a Simulator").expect("launch");
    let uninstall = commands
        .iter()
        .position(|c| c == "xcrun simctl uninstall booted com.example.Tipsy")
        .expect("uninstall");
    assert!(launch < uninstall);
}

#[test]
fn clean_releases_artifacts_of_an_abandoned_run() {
    let dir = scratch_project();
    let orphan = dir.path().join("Tipsy-temp.xcodeproj");
    fs::create_dir_all(&orphan).unwrap();
    fs::write(
        dir.path().join(cleanup::RUN_LOCK_FILE),
        format!(
            "{{\"schema_version\":\"tipsy_run_v1\",\"pid\":0,\"acquired_at\":\"\",\"artifacts\":[{}]}}",
            serde_json::to_string(&orphan).unwrap()
        ),
    )
    .unwrap();

    let report = cleanup::recover(dir.path()).expect("recover");
    assert_eq!(report.removed, vec![orphan.clone()]);
    assert_no_artifacts(dir.path());
}

#[test]
fn nested_project_location_keeps_its_directory() {
    let dir = scratch_project();
    let nested = dir.path().join("Example");
    fs::create_dir_all(&nested).unwrap();
    fs::rename(
        dir.path().join("Tipsy.xcodeproj"),
        nested.join("Tipsy.xcodeproj"),
    )
    .unwrap();
    let contents = dir.path().join("Tipsy.xcworkspace/contents.xcworkspacedata");
    let descriptor = fs::read_to_string(&contents)
        .unwrap()
        .replace("group:Tipsy.xcodeproj", "group:Example/Tipsy.xcodeproj");
    fs::write(&contents, descriptor).unwrap();
    let mut shell = ScriptedShell::new(dir.path());
    shell.project_dir = PathBuf::from("Example");
    let mut opts = options();
    opts.project = Some("Example/Tipsy.xcodeproj".into());

    assert_eq!(run(&shell, dir.path(), opts).unwrap(), RunResult::Success);
    let workspace = shell.workspace_at_build.borrow().clone().expect("workspace at build");
    assert!(
        workspace.contains("location = \"group:Example/Tipsy-temp.xcodeproj\""),
        "{}",
        workspace
    );
    let project = shell.project_at_build.borrow().clone().expect("project at build");
    assert!(project.contains(HARNESS_FILE_NAME));

    assert_no_artifacts(dir.path());
    assert!(!nested.join("Tipsy-temp.xcodeproj").exists());
    assert!(nested.join("Tipsy.xcodeproj/project.pbxproj").exists());
}

#[test]
fn interrupted_build_still_removes_artifacts() {
    let dir = scratch_project();
    let interrupt = Interrupt::new();
    let mut shell = ScriptedShell::new(dir.path());
    shell.interrupt_on = Some(("-only-testing:", interrupt.clone()));

    let result = run(&shell, dir.path(), options()).unwrap();
    assert_eq!(result, RunResult::BuildFailure { exit_code: 130 });
    assert_eq!(result.exit_code(), 130);
    assert_eq!(interrupt.signal(), Some(SIGINT));
    assert!(shell.harness_at_build.borrow().is_some());
    assert_no_artifacts(dir.path());
}

#[test]
fn interrupt_before_isolation_stops_the_run() {
    let dir = scratch_project();
    let interrupt = Interrupt::new();
    let mut shell = ScriptedShell::new(dir.path());
    shell.interrupt_on = Some(("simctl uninstall", interrupt));
    let mut opts = options();
    opts.uninstall = Some("com.example.Tipsy".into());

    let result = run(&shell, dir.path(), opts).unwrap();
    match &result {
        RunResult::SetupFailure { stage, cause } => {
            assert_eq!(*stage, RunStage::IsolatingArtifacts);
            assert!(cause.contains("interrupted by signal 2"), "{}", cause);
        }
        other => panic!("unexpected result {:?}", other),
    }
    assert!(shell.build_commands().is_empty());
    assert_no_artifacts(dir.path());
}
