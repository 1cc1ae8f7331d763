//! Command normalization.
//!
//! Callers describe a pipeline in whichever form is convenient:
//!
//! ```text
//! "grep foo | wc -l"                      one pipe-delimited line
//! ["grep foo", "wc -l"]                   shell strings
//! [["grep", "foo"], ["wc", "-l"]]         argument vectors (mixing allowed)
//! ```
//!
//! [`normalize`] turns any of them into an ordered list of [`StageCommand`]s
//! that match the execution mode: argument vectors for direct execution,
//! quoted strings for shell execution.

mod split;

pub use split::{join, split_pipeline, tokenize};

use std::fmt;

use crate::errors::{PipelineError, PipelineResult};
use crate::options::ExecMode;

/// One stage of a pipeline, in either representation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageCommand {
    /// Program followed by its arguments.
    Argv(Vec<String>),
    /// A command string for the shell.
    Shell(String),
}

impl StageCommand {
    pub fn argv<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        StageCommand::Argv(words.into_iter().map(Into::into).collect())
    }

    pub fn shell(command: impl Into<String>) -> Self {
        StageCommand::Shell(command.into())
    }

    /// Convert to the representation `exec` runs.
    pub fn into_mode(self, exec: &ExecMode) -> PipelineResult<StageCommand> {
        match (exec.is_shell(), self) {
            (false, StageCommand::Shell(command)) => Ok(StageCommand::Argv(tokenize(&command)?)),
            (true, StageCommand::Argv(words)) => Ok(StageCommand::Shell(join(&words)?)),
            (_, stage) => stage.validated(),
        }
    }

    fn validated(self) -> PipelineResult<StageCommand> {
        let empty = match &self {
            StageCommand::Argv(words) => words.first().is_none_or(String::is_empty),
            StageCommand::Shell(command) => command.trim().is_empty(),
        };
        if empty {
            return Err(PipelineError::Config(format!("empty stage command: {:?}", self)));
        }
        Ok(self)
    }

    /// Name reported when the stage fails to start.
    pub fn program(&self) -> &str {
        match self {
            StageCommand::Argv(words) => words.first().map(String::as_str).unwrap_or_default(),
            StageCommand::Shell(command) => command,
        }
    }

    /// Shell-style rendering, used for echo and error messages.
    pub fn command_line(&self) -> String {
        match self {
            StageCommand::Argv(words) => join(words).unwrap_or_else(|_| words.join(" ")),
            StageCommand::Shell(command) => command.clone(),
        }
    }
}

impl fmt::Display for StageCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.command_line())
    }
}

impl From<&str> for StageCommand {
    fn from(command: &str) -> Self {
        StageCommand::shell(command)
    }
}

impl From<String> for StageCommand {
    fn from(command: String) -> Self {
        StageCommand::Shell(command)
    }
}

impl From<Vec<String>> for StageCommand {
    fn from(words: Vec<String>) -> Self {
        StageCommand::Argv(words)
    }
}

impl From<Vec<&str>> for StageCommand {
    fn from(words: Vec<&str>) -> Self {
        StageCommand::argv(words)
    }
}

impl<const N: usize> From<[&str; N]> for StageCommand {
    fn from(words: [&str; N]) -> Self {
        StageCommand::argv(words)
    }
}

/// Caller-facing description of a whole pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// A single line, split on unquoted `|`.
    Line(String),
    /// Explicit stages.
    Stages(Vec<StageCommand>),
}

impl From<&str> for Commands {
    fn from(line: &str) -> Self {
        Commands::Line(line.to_string())
    }
}

impl From<String> for Commands {
    fn from(line: String) -> Self {
        Commands::Line(line)
    }
}

impl From<Vec<StageCommand>> for Commands {
    fn from(stages: Vec<StageCommand>) -> Self {
        Commands::Stages(stages)
    }
}

impl From<Vec<&str>> for Commands {
    fn from(stages: Vec<&str>) -> Self {
        Commands::Stages(stages.into_iter().map(StageCommand::from).collect())
    }
}

impl From<Vec<Vec<&str>>> for Commands {
    fn from(stages: Vec<Vec<&str>>) -> Self {
        Commands::Stages(stages.into_iter().map(StageCommand::from).collect())
    }
}

impl From<Vec<Vec<String>>> for Commands {
    fn from(stages: Vec<Vec<String>>) -> Self {
        Commands::Stages(stages.into_iter().map(StageCommand::from).collect())
    }
}

/// Turn a pipeline description into stage commands for `exec`.
///
/// # Errors
///
/// `PipelineError::Config` if the pipeline is empty, a stage is empty, a
/// string cannot be tokenized, or an argument cannot be quoted.
pub fn normalize(commands: Commands, exec: &ExecMode) -> PipelineResult<Vec<StageCommand>> {
    let stages: Vec<StageCommand> = match commands {
        Commands::Line(line) => split_pipeline(&line)?
            .into_iter()
            .map(StageCommand::Shell)
            .collect(),
        Commands::Stages(stages) => stages,
    };

    if stages.is_empty() {
        return Err(PipelineError::Config(
            "pipeline must contain at least one stage".into(),
        ));
    }

    stages.into_iter().map(|stage| stage.into_mode(exec)).collect()
}
