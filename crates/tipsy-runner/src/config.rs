//! Run configuration.
//!
//! [`RunOptions`] is the loose, all-optional shape filled from the command
//! line and an optional Tipsyfile; [`RunOptions::validate`] turns it into the
//! immutable [`RunConfiguration`] a run is driven by.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// Minutes a timed run lasts when no duration is given.
pub const DEFAULT_RUN_MINUTES: u32 = 60;
pub const DEFAULT_BUILD_TOOL: &str = "xcodebuild";
pub const DEFAULT_FORMATTER: &str = "xcpretty";
pub const TIPSYFILE_NAME: &str = "Tipsyfile.yml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required option: --{0}")]
    MissingRequiredOption(&'static str),
    #[error("conflicting options: {0}")]
    Conflict(String),
    #[error("failed to read {path}: {message}")]
    Tipsyfile { path: PathBuf, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunMode {
    Timed { minutes: u32 },
    Comprehensive,
    Replay { steps: PathBuf },
}

impl RunMode {
    /// Comprehensive beats replay, replay beats timed.
    pub fn select(comprehensive: bool, replay: Option<PathBuf>, minutes: Option<u32>) -> Self {
        if comprehensive {
            RunMode::Comprehensive
        } else if let Some(steps) = replay {
            RunMode::Replay { steps }
        } else {
            RunMode::Timed {
                minutes: minutes.unwrap_or(DEFAULT_RUN_MINUTES),
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Timed { .. } => "timed",
            RunMode::Comprehensive => "comprehensive",
            RunMode::Replay { .. } => "replay",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ResetMode {
    #[default]
    None,
    Reset,
    Uninstall { bundle_id: String },
}

/// Everything one run needs. Built once, never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfiguration {
    pub workspace: PathBuf,
    pub project: PathBuf,
    pub target: String,
    pub scheme: String,
    /// Raw comma-separated provider identifiers.
    pub scenarios: String,
    pub destination: String,
    pub run_mode: RunMode,
    pub replay_output: Option<PathBuf>,
    pub reset: ResetMode,
    pub pre_run_hook: Option<String>,
    pub build_tool: String,
    pub formatter: Option<String>,
}

impl RunConfiguration {
    /// Scenario identifiers in order, trimmed, empties dropped.
    pub fn scenario_names(&self) -> Vec<String> {
        parse_scenarios(&self.scenarios)
    }
}

pub fn parse_scenarios(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Loose option set; later sources override earlier ones via [`RunOptions::merge`].
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct RunOptions {
    pub workspace: Option<PathBuf>,
    pub project: Option<PathBuf>,
    pub target: Option<String>,
    pub scheme: Option<String>,
    pub scenarios: Option<String>,
    pub destination: Option<String>,
    pub time: Option<u32>,
    pub comprehensive: Option<bool>,
    pub replay: Option<PathBuf>,
    pub replay_output: Option<PathBuf>,
    pub reset: Option<bool>,
    pub uninstall: Option<String>,
    pub pre_run: Option<String>,
    pub build_tool: Option<String>,
    pub formatter: Option<String>,
    pub no_formatter: Option<bool>,
}

impl RunOptions {
    pub fn from_tipsyfile(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|e| ConfigError::Tipsyfile {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        serde_yaml::from_str(&raw).map_err(|e| ConfigError::Tipsyfile {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Fields set in `overrides` win.
    pub fn merge(self, overrides: RunOptions) -> RunOptions {
        RunOptions {
            workspace: overrides.workspace.or(self.workspace),
            project: overrides.project.or(self.project),
            target: overrides.target.or(self.target),
            scheme: overrides.scheme.or(self.scheme),
            scenarios: overrides.scenarios.or(self.scenarios),
            destination: overrides.destination.or(self.destination),
            time: overrides.time.or(self.time),
            comprehensive: overrides.comprehensive.or(self.comprehensive),
            replay: overrides.replay.or(self.replay),
            replay_output: overrides.replay_output.or(self.replay_output),
            reset: overrides.reset.or(self.reset),
            uninstall: overrides.uninstall.or(self.uninstall),
            pre_run: overrides.pre_run.or(self.pre_run),
            build_tool: overrides.build_tool.or(self.build_tool),
            formatter: overrides.formatter.or(self.formatter),
            no_formatter: overrides.no_formatter.or(self.no_formatter),
        }
    }

    /// Checks required fields in a fixed order and reports the first missing one.
    pub fn validate(self) -> Result<RunConfiguration, ConfigError> {
        let workspace = required_path(self.workspace, "workspace")?;
        let project = required_path(self.project, "project")?;
        let target = required(self.target, "target")?;
        let scenarios = required(self.scenarios, "scenarios")?;
        if parse_scenarios(&scenarios).is_empty() {
            return Err(ConfigError::MissingRequiredOption("scenarios"));
        }
        let destination = required(self.destination, "destination")?;

        let reset_flag = self.reset.unwrap_or(false);
        let reset = match (reset_flag, self.uninstall) {
            (true, Some(_)) => {
                return Err(ConfigError::Conflict(
                    "--reset and --uninstall are mutually exclusive".into(),
                ))
            }
            (true, None) => ResetMode::Reset,
            (false, Some(bundle_id)) if !bundle_id.trim().is_empty() => ResetMode::Uninstall {
                bundle_id: bundle_id.trim().to_string(),
            },
            _ => ResetMode::None,
        };

        let scheme = self
            .scheme
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| target.clone());
        let formatter = if self.no_formatter.unwrap_or(false) {
            None
        } else {
            Some(
                self.formatter
                    .filter(|f| !f.trim().is_empty())
                    .unwrap_or_else(|| DEFAULT_FORMATTER.to_string()),
            )
        };

        Ok(RunConfiguration {
            workspace,
            project,
            target,
            scheme,
            scenarios,
            destination,
            run_mode: RunMode::select(
                self.comprehensive.unwrap_or(false),
                self.replay,
                self.time,
            ),
            replay_output: self.replay_output,
            reset,
            pre_run_hook: self.pre_run.filter(|s| !s.trim().is_empty()),
            build_tool: self
                .build_tool
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_BUILD_TOOL.to_string()),
            formatter,
        })
    }
}

fn required(value: Option<String>, name: &'static str) -> Result<String, ConfigError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
        _ => Err(ConfigError::MissingRequiredOption(name)),
    }
}

fn required_path(value: Option<PathBuf>, name: &'static str) -> Result<PathBuf, ConfigError> {
    match value {
        Some(p) if !p.as_os_str().is_empty() => Ok(p),
        _ => Err(ConfigError::MissingRequiredOption(name)),
    }
}
