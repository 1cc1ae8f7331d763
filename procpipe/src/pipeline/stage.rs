//! Stage and pipeline specifications.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::process::Command;

use super::Pipeline;
use crate::command::{self, Commands, StageCommand};
use crate::errors::{PipelineError, PipelineResult};
use crate::options::{DEFAULT_SHELL, ExecMode, OutputMode, PipelineOptions, SpawnOptions};
use crate::stream::StreamDirective;

/// One process of a pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageSpec {
    pub command: StageCommand,
    /// Per-stage spawn options, merged over the pipeline-wide ones.
    pub options: SpawnOptions,
}

impl StageSpec {
    pub fn new(command: impl Into<StageCommand>) -> Self {
        Self {
            command: command.into(),
            options: SpawnOptions::default(),
        }
    }

    pub fn with_options(mut self, options: SpawnOptions) -> Self {
        self.options = options;
        self
    }

    /// Build the OS command for this stage. Streams are left unset.
    pub(crate) fn build_command(
        &self,
        exec: &ExecMode,
        base: &SpawnOptions,
    ) -> PipelineResult<Command> {
        let mut command = match &self.command {
            StageCommand::Argv(words) => {
                let (program, args) = words.split_first().ok_or_else(|| {
                    PipelineError::Config("stage has an empty argument vector".into())
                })?;
                let mut command = Command::new(program);
                command.args(args);
                command
            }
            StageCommand::Shell(line) => {
                let shell = exec
                    .shell_program()
                    .cloned()
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_SHELL));
                let mut command = Command::new(shell);
                command.arg("-c").arg(line);
                command
            }
        };
        base.merge(&self.options).apply(&mut command);
        Ok(command)
    }
}

/// Complete description of a pipeline before it runs.
#[derive(Debug)]
pub struct PipelineSpec {
    pub stages: Vec<StageSpec>,
    /// Applies to the first stage only.
    pub stdin: StreamDirective,
    /// Applies to the last stage only.
    pub stdout: StreamDirective,
    /// Applies to the last stage only.
    pub stderr: StreamDirective,
    pub options: PipelineOptions,
}

impl PipelineSpec {
    pub fn new(stages: Vec<StageSpec>, options: PipelineOptions) -> Self {
        Self {
            stages,
            stdin: StreamDirective::Discard,
            stdout: StreamDirective::Pipe,
            stderr: StreamDirective::Pipe,
            options,
        }
    }
}

/// Fluent construction of a [`Pipeline`].
///
/// ```ignore
/// let mut p = Pipeline::builder()
///     .command_line("grep foo | wc -l")
///     .stdin(StreamDirective::literal("foo\nbar"))
///     .build()?;
/// p.block(None)?;
/// ```
#[derive(Debug, Default)]
pub struct PipelineBuilder {
    stages: Vec<StageSpec>,
    stdin: Option<StreamDirective>,
    stdout: Option<StreamDirective>,
    stderr: Option<StreamDirective>,
    options: PipelineOptions,
    error: Option<PipelineError>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(mut self, command: impl Into<StageCommand>) -> Self {
        self.stages.push(StageSpec::new(command));
        self
    }

    pub fn stages<I, S>(mut self, commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<StageCommand>,
    {
        self.stages.extend(commands.into_iter().map(StageSpec::new));
        self
    }

    /// Append a stage with its own spawn options.
    pub fn stage_spec(mut self, stage: StageSpec) -> Self {
        self.stages.push(stage);
        self
    }

    /// Append the stages of a pipe-delimited line. Parse errors surface from
    /// [`build`](Self::build).
    pub fn command_line(mut self, line: &str) -> Self {
        match command::split_pipeline(line) {
            Ok(segments) => self
                .stages
                .extend(segments.into_iter().map(StageSpec::new)),
            Err(e) => {
                self.error.get_or_insert(e);
            }
        }
        self
    }

    pub fn stdin(mut self, directive: StreamDirective) -> Self {
        self.stdin = Some(directive);
        self
    }

    pub fn stdout(mut self, directive: StreamDirective) -> Self {
        self.stdout = Some(directive);
        self
    }

    pub fn stderr(mut self, directive: StreamDirective) -> Self {
        self.stderr = Some(directive);
        self
    }

    pub fn options(mut self, options: PipelineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn spawn_options(mut self, spawn: SpawnOptions) -> Self {
        self.options.spawn = spawn;
        self
    }

    pub fn mode(mut self, mode: OutputMode) -> Self {
        self.options.mode = mode;
        self
    }

    pub fn text(self) -> Self {
        self.mode(OutputMode::Text)
    }

    /// Run every stage through `shell -c`.
    pub fn shell(mut self, shell: impl Into<PathBuf>) -> Self {
        self.options.exec = ExecMode::shell_with(shell);
        self
    }

    pub fn exec(mut self, exec: ExecMode) -> Self {
        self.options.exec = exec;
        self
    }

    pub fn echo(mut self, echo: bool) -> Self {
        self.options.echo = echo;
        self
    }

    pub fn capture_interior_stderr(mut self, capture: bool) -> Self {
        self.options.capture_interior_stderr = capture;
        self
    }

    pub fn allowed_return_codes(mut self, codes: impl IntoIterator<Item = i32>) -> Self {
        self.options.allowed_return_codes = codes.into_iter().collect::<BTreeSet<_>>();
        self
    }

    pub fn into_spec(self) -> PipelineResult<PipelineSpec> {
        if let Some(e) = self.error {
            return Err(e);
        }
        let mut spec = PipelineSpec::new(self.stages, self.options);
        if let Some(stdin) = self.stdin {
            spec.stdin = stdin;
        }
        if let Some(stdout) = self.stdout {
            spec.stdout = stdout;
        }
        if let Some(stderr) = self.stderr {
            spec.stderr = stderr;
        }
        Ok(spec)
    }

    /// Validate and create the pipeline. No process is started.
    pub fn build(self) -> PipelineResult<Pipeline> {
        Pipeline::from_spec(self.into_spec()?)
    }
}

impl From<Commands> for PipelineBuilder {
    fn from(commands: Commands) -> Self {
        let builder = PipelineBuilder::new();
        match commands {
            Commands::Line(line) => builder.command_line(&line),
            Commands::Stages(stages) => builder.stages(stages),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::StreamKind;

    #[test]
    fn test_build_command_direct() {
        let stage = StageSpec::new(["echo", "hi"]);
        let command = stage
            .build_command(&ExecMode::Direct, &SpawnOptions::default())
            .unwrap();
        assert_eq!(command.get_program(), "echo");
        assert_eq!(command.get_args().collect::<Vec<_>>(), vec!["hi"]);
    }

    #[test]
    fn test_build_command_shell_defaults_to_bash() {
        let stage = StageSpec::new(StageCommand::shell("echo hi >&2"));
        let command = stage
            .build_command(&ExecMode::Direct, &SpawnOptions::default())
            .unwrap();
        assert_eq!(command.get_program(), DEFAULT_SHELL);
        assert_eq!(
            command.get_args().collect::<Vec<_>>(),
            vec!["-c", "echo hi >&2"]
        );

        let command = stage
            .build_command(&ExecMode::shell_with("/bin/sh"), &SpawnOptions::default())
            .unwrap();
        assert_eq!(command.get_program(), "/bin/sh");
    }

    #[test]
    fn test_build_command_merges_spawn_options() {
        let base = SpawnOptions {
            cwd: Some(PathBuf::from("/")),
            ..Default::default()
        };
        let stage = StageSpec::new(["pwd"]).with_options(SpawnOptions {
            cwd: Some(PathBuf::from("/tmp")),
            ..Default::default()
        });
        let command = stage.build_command(&ExecMode::Direct, &base).unwrap();
        assert_eq!(command.get_current_dir(), Some(std::path::Path::new("/tmp")));
    }

    #[test]
    fn test_builder_defaults() {
        let spec = PipelineBuilder::new()
            .command_line("grep foo | wc -l")
            .into_spec()
            .unwrap();
        assert_eq!(spec.stages.len(), 2);
        assert_eq!(spec.stdin.kind(), StreamKind::Discard);
        assert_eq!(spec.stdout.kind(), StreamKind::Pipe);
        assert_eq!(spec.stderr.kind(), StreamKind::Pipe);
    }

    #[test]
    fn test_builder_defers_parse_errors() {
        let result = PipelineBuilder::new().command_line("a || b").into_spec();
        assert!(matches!(result, Err(PipelineError::Config(_))));
    }
}
