//! Pipeline-wide and per-stage configuration.

use std::collections::{BTreeMap, BTreeSet};
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::Command;

use serde::{Deserialize, Serialize};

use crate::errors::{PipelineError, PipelineResult};

/// Shell used when shell execution is requested without naming one.
pub const DEFAULT_SHELL: &str = "/bin/bash";

/// Type of captured output.
///
/// Only changes how captured bytes are exposed; the processes see the same
/// data either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    #[default]
    Bytes,
    Text,
}

/// How stage commands are executed.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind")]
pub enum ExecMode {
    /// Execute argument vectors directly.
    #[default]
    Direct,
    /// Hand each stage to `<program> -c <command>`.
    Shell { program: PathBuf },
}

impl ExecMode {
    /// Shell execution through [`DEFAULT_SHELL`].
    pub fn shell() -> Self {
        ExecMode::Shell {
            program: PathBuf::from(DEFAULT_SHELL),
        }
    }

    pub fn shell_with(program: impl Into<PathBuf>) -> Self {
        ExecMode::Shell {
            program: program.into(),
        }
    }

    pub fn is_shell(&self) -> bool {
        matches!(self, ExecMode::Shell { .. })
    }

    pub fn shell_program(&self) -> Option<&PathBuf> {
        match self {
            ExecMode::Shell { program } => Some(program),
            ExecMode::Direct => None,
        }
    }
}

/// OS spawn options passed through to every stage.
///
/// Pipeline-wide options are merged with per-stage options, the stage
/// winning. `text` and `universal_newlines` are the only fields the engine
/// interprets: when set they must agree with the configured [`OutputMode`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpawnOptions {
    /// Working directory.
    pub cwd: Option<PathBuf>,
    /// Variables to set (or override) in the child environment.
    pub env: BTreeMap<String, String>,
    /// Variables to remove from the inherited environment.
    pub env_remove: Vec<String>,
    /// Start from an empty environment.
    pub env_clear: bool,
    /// Process group to place the stage in (`0` creates a new group).
    pub process_group: Option<i32>,
    pub text: Option<bool>,
    pub universal_newlines: Option<bool>,
}

impl SpawnOptions {
    /// Merge `overrides` on top of `self`.
    pub fn merge(&self, overrides: &SpawnOptions) -> SpawnOptions {
        let mut env = self.env.clone();
        env.extend(overrides.env.iter().map(|(k, v)| (k.clone(), v.clone())));

        let mut env_remove = self.env_remove.clone();
        for key in &overrides.env_remove {
            if !env_remove.contains(key) {
                env_remove.push(key.clone());
            }
        }

        SpawnOptions {
            cwd: overrides.cwd.clone().or_else(|| self.cwd.clone()),
            env,
            env_remove,
            env_clear: self.env_clear || overrides.env_clear,
            process_group: overrides.process_group.or(self.process_group),
            text: overrides.text.or(self.text),
            universal_newlines: overrides.universal_newlines.or(self.universal_newlines),
        }
    }

    /// Fail if a text-mode flag contradicts `mode`.
    pub(crate) fn check_mode(&self, mode: OutputMode) -> PipelineResult<()> {
        let wants_text = mode == OutputMode::Text;
        for (flag, value) in [
            ("text", self.text),
            ("universal_newlines", self.universal_newlines),
        ] {
            match value {
                Some(value) if value != wants_text => {
                    return Err(PipelineError::Config(format!(
                        "{}={} conflicts with output mode {:?}",
                        flag, value, mode
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub(crate) fn apply(&self, command: &mut Command) {
        if self.env_clear {
            command.env_clear();
        }
        for key in &self.env_remove {
            command.env_remove(key);
        }
        command.envs(&self.env);
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }
        if let Some(pgroup) = self.process_group {
            command.process_group(pgroup);
        }
    }
}

/// Pipeline-wide settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineOptions {
    pub mode: OutputMode,
    pub exec: ExecMode,
    /// Aggregate return codes treated as success.
    pub allowed_return_codes: BTreeSet<i32>,
    /// Log the reconstructed command line before spawning.
    pub echo: bool,
    /// Capture stderr of every stage but the last into its own buffer.
    pub capture_interior_stderr: bool,
    /// Defaults for every stage; per-stage options override them.
    pub spawn: SpawnOptions,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            mode: OutputMode::Bytes,
            exec: ExecMode::Direct,
            allowed_return_codes: BTreeSet::from([0]),
            echo: false,
            capture_interior_stderr: true,
            spawn: SpawnOptions::default(),
        }
    }
}

impl PipelineOptions {
    /// Validate the options before any process exists.
    pub fn sanitize(&self) -> PipelineResult<()> {
        if self.allowed_return_codes.is_empty() {
            return Err(PipelineError::Config(
                "allowed_return_codes must not be empty".into(),
            ));
        }
        if self
            .exec
            .shell_program()
            .is_some_and(|program| program.as_os_str().is_empty())
        {
            return Err(PipelineError::Config("shell program must not be empty".into()));
        }
        self.spawn.check_mode(self.mode)
    }

    pub fn is_allowed(&self, returncode: i32) -> bool {
        self.allowed_return_codes.contains(&returncode)
    }
}
