//! Rendering of the generated Swift harness.
//!
//! User-supplied values never reach the template unchecked: provider names
//! must be Swift identifiers, paths go through string-literal escaping and the
//! pre-run hook must fit on one line.

use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde_json::Value;
use thiserror::Error;
use tracing::{error, info};

use crate::config::{RunConfiguration, RunMode};

/// Class name of the generated harness; never a valid provider name.
pub const HARNESS_CLASS_NAME: &str = "TipsyGeneratedHarness";
pub const HARNESS_FILE_NAME: &str = "TipsyGeneratedHarness.swift";
const RUNTIME_MODULE: &str = "Tipsy";

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("invalid scenario identifier '{0}': expected a Swift type name")]
    InvalidScenarioIdentifier(String),
    #[error("scenario identifier '{0}' collides with the generated harness class")]
    ReservedIdentifier(String),
    #[error("pre-run hook must be a single line of Swift")]
    MultilineHook,
    #[error("failed to decode replay file {path}: {message}")]
    ReplayDecodeFailure { path: PathBuf, message: String },
    #[error("failed to write harness {path}: {source}")]
    HarnessWriteFailure {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// The harness file on disk and the class it defines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessArtifact {
    pub path: PathBuf,
    pub class_name: &'static str,
}

pub fn harness_path(working_dir: &Path) -> PathBuf {
    working_dir.join(HARNESS_FILE_NAME)
}

/// Renders the harness source for `config`.
///
/// `replay_steps` is the resolved location of the replay file when the run
/// mode is [`RunMode::Replay`]; relative paths in `config` are the caller's
/// business.
pub fn render(config: &RunConfiguration, replay_steps: Option<&Path>) -> Result<String, HarnessError> {
    let providers = config
        .scenario_names()
        .into_iter()
        .map(|name| provider_expression(&name))
        .collect::<Result<Vec<_>, _>>()?;

    let mut out = String::new();
    out.push_str("// Generated by tipsy. Do not edit; this file is deleted after the run.\n");
    out.push_str("import Foundation\n");
    out.push_str("import XCTest\n");
    let _ = writeln!(out, "import {}", RUNTIME_MODULE);
    out.push('\n');
    let _ = writeln!(out, "final class {}: XCTestCase {{", HARNESS_CLASS_NAME);
    out.push_str("    func testRunScenarios() {\n");
    out.push_str("        let providers: [ScenarioProvider] = [\n");
    for expr in &providers {
        let _ = writeln!(out, "            {},", expr);
    }
    out.push_str("        ]\n");
    out.push_str("        let runner = ScenarioRunner(providers: providers, testCase: self)\n");

    if let Some(output) = &config.replay_output {
        let _ = writeln!(
            out,
            "        runner.replayOutputPath = {}",
            swift_string_literal(&output.to_string_lossy())
        );
    }
    if let Some(hook) = &config.pre_run_hook {
        if hook.contains('\n') || hook.contains('\r') {
            return Err(HarnessError::MultilineHook);
        }
        let _ = writeln!(out, "        runner.preRun = {}", hook.trim());
    }

    match &config.run_mode {
        RunMode::Comprehensive => out.push_str("        runner.runComprehensive()\n"),
        RunMode::Replay { steps } => {
            let path = replay_steps.unwrap_or(steps.as_path());
            let literal = swift_string_literal(&path.to_string_lossy());
            let _ = writeln!(
                out,
                "        let replayData = try! Data(contentsOf: URL(fileURLWithPath: {}))",
                literal
            );
            out.push_str(
                "        let steps = try! JSONDecoder().decode([ScenarioStep].self, from: replayData)\n",
            );
            out.push_str("        runner.replay(steps: steps)\n");
        }
        RunMode::Timed { minutes } => {
            let _ = writeln!(out, "        runner.run(minutes: {})", minutes);
        }
    }

    out.push_str("    }\n");
    out.push_str("}\n");
    Ok(out)
}

/// Renders and writes the harness into `working_dir`.
pub fn write_harness(
    config: &RunConfiguration,
    working_dir: &Path,
    replay_steps: Option<&Path>,
) -> Result<HarnessArtifact, HarnessError> {
    let source = render(config, replay_steps)?;
    let path = harness_path(working_dir);
    if let Err(source) = fs::write(&path, source) {
        error!(path = %path.display(), error = %source, "failed to write harness");
        return Err(HarnessError::HarnessWriteFailure { path, source });
    }
    info!(path = %path.display(), "harness written");
    Ok(HarnessArtifact {
        path,
        class_name: HARNESS_CLASS_NAME,
    })
}

/// Decodes the replay file as a JSON array; the step schema is opaque here.
pub fn check_replay_file(path: &Path) -> Result<usize, HarnessError> {
    let fail = |message: String| HarnessError::ReplayDecodeFailure {
        path: path.to_path_buf(),
        message,
    };
    let bytes = fs::read(path).map_err(|e| fail(e.to_string()))?;
    match serde_json::from_slice::<Value>(&bytes).map_err(|e| fail(e.to_string()))? {
        Value::Array(steps) => Ok(steps.len()),
        other => Err(fail(format!(
            "expected a JSON array of steps, found {}",
            json_kind(&other)
        ))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn provider_expression(name: &str) -> Result<String, HarnessError> {
    if !is_swift_type_path(name) {
        return Err(HarnessError::InvalidScenarioIdentifier(name.to_string()));
    }
    if name == HARNESS_CLASS_NAME {
        return Err(HarnessError::ReservedIdentifier(name.to_string()));
    }
    Ok(format!("{}(priority: .highest)", name))
}

/// `Name` or `Module.Name`, each segment a plain Swift identifier.
fn is_swift_type_path(name: &str) -> bool {
    !name.is_empty()
        && name.split('.').all(|segment| {
            let mut chars = segment.chars();
            match chars.next() {
                Some(c) if c == '_' || c.is_ascii_alphabetic() => {
                    chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
                }
                _ => false,
            }
        })
}

fn swift_string_literal(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\0' => out.push_str("\\0"),
            other => out.push(other),
        }
    }
    out.push('"');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunOptions;

    fn config(scenarios: &str) -> RunConfiguration {
        RunOptions {
            workspace: Some("Tipsy.xcworkspace".into()),
            project: Some("Tipsy.xcodeproj".into()),
            target: Some("Tipsy_Tests".into()),
            scenarios: Some(scenarios.into()),
            destination: Some("platform=iOS Simulator,name=iPhone 14".into()),
            ..RunOptions::default()
        }
        .validate()
        .expect("valid config")
    }

    #[test]
    fn renders_providers_in_order_with_default_timed_directive() {
        let source = render(&config("APIScenarios, UIScenarios"), None).expect("render");
        let api = source.find("APIScenarios(priority: .highest),").expect("api provider");
        let ui = source.find("UIScenarios(priority: .highest),").expect("ui provider");
        assert!(api < ui);
        assert!(source.contains("runner.run(minutes: 60)"));
        assert!(source.contains(&format!("final class {}: XCTestCase", HARNESS_CLASS_NAME)));
        assert!(!source.contains("runComprehensive"));
        assert!(!source.contains("replay("));
    }

    #[test]
    fn optional_directives_precede_the_mode_directive() {
        let mut cfg = config("APIScenarios");
        cfg.replay_output = Some("out/steps.json".into());
        cfg.pre_run_hook = Some("{ AppState.reset() }".into());
        cfg.run_mode = RunMode::Comprehensive;
        let source = render(&cfg, None).expect("render");
        let output = source.find("runner.replayOutputPath = \"out/steps.json\"").unwrap();
        let hook = source.find("runner.preRun = { AppState.reset() }").unwrap();
        let mode = source.find("runner.runComprehensive()").unwrap();
        assert!(output < hook && hook < mode);
        assert!(!source.contains("runner.run(minutes"));
    }

    #[test]
    fn replay_directive_decodes_steps_from_the_given_file() {
        let mut cfg = config("APIScenarios");
        cfg.run_mode = RunMode::Replay {
            steps: "recorded.json".into(),
        };
        let source = render(&cfg, Some(Path::new("/work/recorded.json"))).expect("render");
        assert!(source.contains("URL(fileURLWithPath: \"/work/recorded.json\")"));
        assert!(source.contains("decode([ScenarioStep].self"));
        assert!(source.contains("runner.replay(steps: steps)"));
        assert!(!source.contains("runner.run(minutes"));
    }

    #[test]
    fn rejects_identifiers_that_would_break_the_source() {
        for bad in ["API Scenarios", "1Scenarios", "X()", "A\"B", "Mod..Name"] {
            let err = render(&config(bad), None).expect_err("should reject");
            assert!(
                matches!(err, HarnessError::InvalidScenarioIdentifier(_)),
                "{:?} gave {:?}",
                bad,
                err
            );
        }
        assert!(render(&config("MyModule.APIScenarios"), None).is_ok());
    }

    #[test]
    fn rejects_the_harness_class_name_as_provider() {
        let err = render(&config(HARNESS_CLASS_NAME), None).expect_err("should reject");
        assert!(matches!(err, HarnessError::ReservedIdentifier(_)));
    }

    #[test]
    fn rejects_multiline_hooks() {
        let mut cfg = config("APIScenarios");
        cfg.pre_run_hook = Some("{ a() }\n}; evil()".into());
        assert!(matches!(render(&cfg, None), Err(HarnessError::MultilineHook)));
    }

    #[test]
    fn paths_are_escaped_as_string_literals() {
        let mut cfg = config("APIScenarios");
        cfg.replay_output = Some("we\"ird\\path.json".into());
        let source = render(&cfg, None).expect("render");
        assert!(source.contains(r#"runner.replayOutputPath = "we\"ird\\path.json""#));
    }

    #[test]
    fn write_harness_places_file_in_working_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let artifact = write_harness(&config("APIScenarios"), dir.path(), None).expect("write");
        assert_eq!(artifact.path, dir.path().join(HARNESS_FILE_NAME));
        assert_eq!(artifact.class_name, HARNESS_CLASS_NAME);
        assert!(fs::read_to_string(&artifact.path)
            .unwrap()
            .contains("APIScenarios(priority: .highest)"));
    }

    #[test]
    fn write_harness_reports_unwritable_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("does-not-exist");
        let err = write_harness(&config("APIScenarios"), &missing, None).expect_err("should fail");
        assert!(matches!(err, HarnessError::HarnessWriteFailure { .. }));
    }

    #[test]
    fn replay_file_must_be_a_json_array() {
        let dir = tempfile::tempdir().expect("tempdir");
        let good = dir.path().join("good.json");
        fs::write(&good, r#"[{"action":"tap"},{"action":"swipe"}]"#).unwrap();
        assert_eq!(check_replay_file(&good).unwrap(), 2);

        let object = dir.path().join("object.json");
        fs::write(&object, r#"{"steps":[]}"#).unwrap();
        assert!(matches!(
            check_replay_file(&object),
            Err(HarnessError::ReplayDecodeFailure { .. })
        ));

        let corrupt = dir.path().join("corrupt.json");
        fs::write(&corrupt, "[{").unwrap();
        assert!(check_replay_file(&corrupt).is_err());
        assert!(check_replay_file(&dir.path().join("missing.json")).is_err());
    }
}
