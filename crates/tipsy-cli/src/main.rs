use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::{ArgGroup, Parser, Subcommand};
use serde_json::{json, Value};
use signal_hook::consts::{SIGINT, SIGTERM};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tipsy_runner::config::TIPSYFILE_NAME;
use tipsy_runner::{
    BashShell, CleanupReport, ConfigError, Interrupt, Orchestrator, RunOptions, RunResult,
    CONFIG_ERROR_EXIT_CODE,
};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const LOG_ENV: &str = "TIPSY_LOG";

#[derive(Parser)]
#[command(name = "tipsy", version, about = "Scenario-driven UI test runner for Xcode projects")]
struct Cli {
    /// Log at debug level unless TIPSY_LOG says otherwise.
    #[arg(long, short, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inject a generated harness into an isolated copy of the project and run it.
    #[command(group(ArgGroup::new("mode").args(["time", "comprehensive", "replay"])))]
    Run {
        #[arg(long)]
        workspace: Option<PathBuf>,
        #[arg(long)]
        project: Option<PathBuf>,
        /// Test target that receives the harness.
        #[arg(long)]
        target: Option<String>,
        /// Comma-separated scenario provider types, in priority order.
        #[arg(long)]
        scenarios: Option<String>,
        #[arg(long)]
        destination: Option<String>,
        /// Minutes to keep running scenarios.
        #[arg(long)]
        time: Option<u32>,
        #[arg(long)]
        comprehensive: bool,
        /// JSON file of recorded steps to replay.
        #[arg(long)]
        replay: Option<PathBuf>,
        #[arg(long)]
        replay_output: Option<PathBuf>,
        /// Erase all simulators before the run.
        #[arg(long, conflicts_with = "uninstall")]
        reset: bool,
        /// Bundle identifier to uninstall from the booted simulator.
        #[arg(long)]
        uninstall: Option<String>,
        /// One line of Swift assigned to the runner's pre-run hook.
        #[arg(long)]
        pre_run: Option<String>,
        #[arg(long)]
        scheme: Option<String>,
        #[arg(long)]
        build_tool: Option<String>,
        #[arg(long)]
        no_formatter: bool,
        #[arg(long)]
        tipsyfile: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Remove temporary artifacts left by an interrupted run.
    Clean {
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let json_mode = command_json_mode(&cli.command);
    match run_command(cli.command) {
        Ok((payload, code)) => {
            if let Some(payload) = payload {
                emit_json(&payload);
            }
            if code != 0 {
                std::process::exit(code);
            }
            Ok(())
        }
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", err.to_string(), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr).with_target(false))
        .with(filter)
        .init();
}

fn run_command(command: Commands) -> Result<(Option<Value>, i32)> {
    match command {
        Commands::Run {
            workspace,
            project,
            target,
            scenarios,
            destination,
            time,
            comprehensive,
            replay,
            replay_output,
            reset,
            uninstall,
            pre_run,
            scheme,
            build_tool,
            no_formatter,
            tipsyfile,
            json,
        } => {
            let cli_options = RunOptions {
                workspace,
                project,
                target,
                scheme,
                scenarios,
                destination,
                time,
                comprehensive: comprehensive.then_some(true),
                replay,
                replay_output,
                reset: reset.then_some(true),
                uninstall,
                pre_run,
                build_tool,
                formatter: None,
                no_formatter: no_formatter.then_some(true),
            };
            let started_at = Utc::now();
            let options = match load_tipsyfile(tipsyfile.as_deref()) {
                Ok(file_options) => file_options.merge(cli_options),
                Err(err) => return Ok(config_failure(&err, json, started_at)),
            };

            let interrupt = Interrupt::new();
            install_signal_handlers(&interrupt)?;
            let orchestrator = Orchestrator::new(BashShell::with_interrupt(interrupt.clone()))
                .with_interrupt(interrupt);
            // Build output goes to stderr when stdout carries the JSON summary.
            let outcome = if json {
                orchestrator.execute(options, &mut io::stderr())
            } else {
                orchestrator.execute(options, &mut io::stdout())
            };
            let result = match outcome {
                Ok(result) => result,
                Err(err) => return Ok(config_failure(&err, json, started_at)),
            };
            let finished_at = Utc::now();
            if json {
                return Ok((
                    Some(run_result_to_json(&result, started_at, finished_at)),
                    result.exit_code(),
                ));
            }
            print_result(&result);
            Ok((None, result.exit_code()))
        }
        Commands::Clean { json } => {
            let report = tipsy_runner::recover(Path::new("."))?;
            if json {
                return Ok((Some(clean_report_to_json(&report)), 0));
            }
            for path in &report.removed {
                println!("removed: {}", path.display());
            }
            for path in &report.failed {
                println!("failed: {}", path.display());
            }
            if report.removed.is_empty() && report.failed.is_empty() {
                println!("nothing to clean");
            }
            Ok((None, if report.is_clean() { 0 } else { 1 }))
        }
    }
}

/// SIGINT and SIGTERM no longer terminate the process; the orchestrator
/// forwards them to the build and cleans up before exiting.
fn install_signal_handlers(interrupt: &Interrupt) -> Result<()> {
    for signal in [SIGINT, SIGTERM] {
        signal_hook::flag::register_usize(signal, interrupt.flag(), signal as usize)?;
    }
    Ok(())
}

/// An explicit `--tipsyfile` must exist; the default one is optional.
fn load_tipsyfile(explicit: Option<&Path>) -> std::result::Result<RunOptions, ConfigError> {
    match explicit {
        Some(path) => RunOptions::from_tipsyfile(path),
        None => {
            let default = Path::new(TIPSYFILE_NAME);
            if default.is_file() {
                tracing::debug!(path = TIPSYFILE_NAME, "loading Tipsyfile");
                RunOptions::from_tipsyfile(default)
            } else {
                Ok(RunOptions::default())
            }
        }
    }
}

fn config_failure(err: &ConfigError, json: bool, started_at: DateTime<Utc>) -> (Option<Value>, i32) {
    if json {
        let mut payload = json_error("config_error", err.to_string(), json!({}));
        payload["exit_code"] = json!(CONFIG_ERROR_EXIT_CODE);
        payload["started_at"] = json!(started_at.to_rfc3339());
        return (Some(payload), CONFIG_ERROR_EXIT_CODE);
    }
    eprintln!("error: {}", err);
    (None, CONFIG_ERROR_EXIT_CODE)
}

fn print_result(result: &RunResult) {
    println!("result: {}", result.as_str());
    match result {
        RunResult::Success => {}
        RunResult::BuildFailure { exit_code } => println!("build_exit_code: {}", exit_code),
        RunResult::SetupFailure { stage, cause } => {
            println!("stage: {}", stage);
            println!("cause: {}", cause);
        }
    }
    println!("exit_code: {}", result.exit_code());
    let _ = io::stdout().flush();
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. } | Commands::Clean { json } => *json,
    }
}

fn run_result_to_json(
    result: &RunResult,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
) -> Value {
    let (stage, cause) = match result {
        RunResult::SetupFailure { stage, cause } => (stage.as_str(), Some(cause.as_str())),
        _ => ("done", None),
    };
    json!({
        "ok": result.is_success(),
        "command": "run",
        "result": result.as_str(),
        "exit_code": result.exit_code(),
        "stage": stage,
        "cause": cause,
        "started_at": started_at.to_rfc3339(),
        "finished_at": finished_at.to_rfc3339()
    })
}

fn clean_report_to_json(report: &CleanupReport) -> Value {
    json!({
        "ok": report.is_clean(),
        "command": "clean",
        "removed": report.removed.iter().map(|p| p.display().to_string()).collect::<Vec<_>>(),
        "failed": report.failed.iter().map(|p| p.display().to_string()).collect::<Vec<_>>()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_modes_are_mutually_exclusive() {
        let parsed = Cli::try_parse_from(["tipsy", "run", "--time", "5", "--comprehensive"]);
        assert!(parsed.is_err());
        let parsed = Cli::try_parse_from(["tipsy", "run", "--reset", "--uninstall", "com.x"]);
        assert!(parsed.is_err());
        let parsed = Cli::try_parse_from(["tipsy", "run", "--time", "5", "--reset"]);
        assert!(parsed.is_ok());
    }

    #[test]
    fn setup_failure_json_names_stage() {
        let now = Utc::now();
        let value = run_result_to_json(
            &RunResult::SetupFailure {
                stage: tipsy_runner::RunStage::MutatingGraph,
                cause: "no target named 'X'".into(),
            },
            now,
            now,
        );
        assert_eq!(value["ok"], json!(false));
        assert_eq!(value["stage"], json!("mutating_graph"));
        assert_eq!(value["exit_code"], json!(70));
    }
}
