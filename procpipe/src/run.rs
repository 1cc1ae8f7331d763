//! One-call helpers over [`Pipeline`].

use std::time::Duration;

use crate::command::{self, Commands};
use crate::errors::{PipelineError, PipelineResult};
use crate::options::{ExecMode, OutputMode, PipelineOptions};
use crate::pipeline::{Pipeline, PipelineSpec, StageSpec};
use crate::stream::StreamDirective;

/// Options for [`run`] and [`sub`].
#[derive(Debug)]
pub struct RunOptions {
    /// Wait for completion, close, and check the return code.
    pub block: bool,
    /// Deadline for the blocking wait.
    pub timeout: Option<Duration>,
    pub stdin: StreamDirective,
    pub stdout: StreamDirective,
    pub stderr: StreamDirective,
    pub options: PipelineOptions,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            block: true,
            timeout: None,
            stdin: StreamDirective::Discard,
            stdout: StreamDirective::Pipe,
            stderr: StreamDirective::Pipe,
            options: PipelineOptions::default(),
        }
    }
}

impl RunOptions {
    /// Defaults with text output, as [`sub`] requires.
    pub fn text() -> Self {
        let mut run = Self::default();
        run.options.mode = OutputMode::Text;
        run
    }

    pub fn block(mut self, block: bool) -> Self {
        self.block = block;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn stdin(mut self, directive: StreamDirective) -> Self {
        self.stdin = directive;
        self
    }

    pub fn stdout(mut self, directive: StreamDirective) -> Self {
        self.stdout = directive;
        self
    }

    pub fn stderr(mut self, directive: StreamDirective) -> Self {
        self.stderr = directive;
        self
    }

    pub fn shell(mut self, exec: ExecMode) -> Self {
        self.options.exec = exec;
        self
    }

    pub fn options(mut self, options: PipelineOptions) -> Self {
        self.options = options;
        self
    }
}

/// Build a pipeline from `commands` and start it.
///
/// When `block` is set (the default) the pipeline is run inside a guard,
/// waited for, closed and checked, so on return its output is readable.
/// Otherwise the started pipeline is returned as is.
///
/// # Errors
///
/// * `Config` for malformed commands or options.
/// * `Spawn` if a stage cannot be started.
/// * `Timeout` if the blocking wait exceeds `timeout`; the pipeline is
///   killed and closed before returning.
/// * `Execution` if the aggregate return code is not allowed.
pub fn run(commands: impl Into<Commands>, run_options: RunOptions) -> PipelineResult<Pipeline> {
    let RunOptions {
        block,
        timeout,
        stdin,
        stdout,
        stderr,
        options,
    } = run_options;

    let stages = command::normalize(commands.into(), &options.exec)?
        .into_iter()
        .map(StageSpec::new)
        .collect();
    let mut spec = PipelineSpec::new(stages, options);
    spec.stdin = stdin;
    spec.stdout = stdout;
    spec.stderr = stderr;

    let mut pipeline = Pipeline::from_spec(spec)?;
    if block {
        pipeline.scoped(|p| p.block(timeout))?;
    } else {
        pipeline.run()?;
    }
    Ok(pipeline)
}

/// Run a blocking text pipeline and return its output.
///
/// # Errors
///
/// `Config` if `run_options` asks for bytes output or a non-blocking run; otherwise
/// as [`run`].
pub fn sub(commands: impl Into<Commands>, run_options: RunOptions) -> PipelineResult<String> {
    if run_options.options.mode != OutputMode::Text {
        return Err(PipelineError::Config(
            "sub() requires text output mode".into(),
        ));
    }
    if !run_options.block {
        return Err(PipelineError::Config("sub() requires a blocking run".into()));
    }
    let pipeline = run(commands, run_options)?;
    Ok(pipeline.output()?.to_string())
}
