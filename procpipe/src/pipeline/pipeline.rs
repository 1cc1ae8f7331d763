//! The [`Pipeline`] handle.

use std::fmt;
use std::path::PathBuf;
use std::process::{ChildStderr, ChildStdin, ChildStdout};
use std::time::Duration;

use super::engine::{Boundaries, CapturedStreams, RunningPipeline};
use super::lifecycle::{self, PipelineGuard};
use super::stage::{PipelineBuilder, PipelineSpec, StageSpec};
use super::status::aggregate_returncode;
use crate::command::{self, Commands};
use crate::errors::{PipelineError, PipelineResult};
use crate::options::PipelineOptions;
use crate::stream::{Captured, StreamDirective, StreamKind, StreamRole};

/// Lifecycle state of a [`Pipeline`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Validated, nothing spawned.
    Built,
    /// Processes spawned; exit not yet collected by `wait`.
    Running,
    /// Signalled by `kill` but not yet reaped.
    Killed,
    /// Every stage exited and piped output was drained.
    Done,
    /// Buffers read back and temp files deleted.
    Closed,
}

#[derive(Debug, Clone, Copy)]
struct BoundaryKinds {
    stdin: StreamKind,
    stdout: StreamKind,
    stderr: StreamKind,
}

/// A chain of processes connected stdout to stdin.
///
/// Created validated and idle; [`run`](Self::run) spawns every stage,
/// [`wait`](Self::wait) collects exit codes and piped output,
/// [`close`](Self::close) releases temp files and makes captured output
/// readable. Dropping a pipeline kills whatever is still running and closes
/// it.
pub struct Pipeline {
    stages: Vec<StageSpec>,
    pub(super) options: PipelineOptions,
    boundaries: Boundaries,
    kinds: BoundaryKinds,
    stdout_path: Option<PathBuf>,
    pub(super) state: PipelineState,
    pub(super) running: Option<RunningPipeline>,
    pub(super) result: Option<CapturedStreams>,
    pub(super) killed: bool,
}

impl Pipeline {
    // ========================================================================
    // CONSTRUCTION
    // ========================================================================

    /// Build a pipeline with default stream directives (stdin discarded,
    /// stdout and stderr piped).
    ///
    /// # Errors
    ///
    /// `PipelineError::Config` if the commands are empty or malformed, or
    /// the options are inconsistent.
    pub fn new(commands: impl Into<Commands>, options: PipelineOptions) -> PipelineResult<Self> {
        let stages = command::normalize(commands.into(), &options.exec)?
            .into_iter()
            .map(StageSpec::new)
            .collect();
        Self::from_spec(PipelineSpec::new(stages, options))
    }

    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }

    /// Validate `spec` and create an idle pipeline.
    ///
    /// Every check that does not need a process happens here: stage count,
    /// options, command shape for the exec mode, text-mode flags of each
    /// stage, and stream directive roles.
    pub fn from_spec(spec: PipelineSpec) -> PipelineResult<Self> {
        let PipelineSpec {
            stages,
            stdin,
            stdout,
            stderr,
            options,
        } = spec;

        if stages.is_empty() {
            return Err(PipelineError::Config(
                "pipeline must contain at least one stage".into(),
            ));
        }
        options.sanitize()?;

        let stages = stages
            .into_iter()
            .map(|stage| -> PipelineResult<StageSpec> {
                options.spawn.merge(&stage.options).check_mode(options.mode)?;
                Ok(StageSpec {
                    command: stage.command.into_mode(&options.exec)?,
                    options: stage.options,
                })
            })
            .collect::<PipelineResult<Vec<_>>>()?;

        stdin.validate(StreamRole::Stdin)?;
        stdout.validate(StreamRole::Stdout)?;
        stderr.validate(StreamRole::Stderr)?;

        let kinds = BoundaryKinds {
            stdin: stdin.kind(),
            stdout: stdout.kind(),
            stderr: stderr.kind(),
        };
        let stdout_path = match &stdout {
            StreamDirective::File(path) => Some(path.clone()),
            _ => None,
        };

        Ok(Self {
            stages,
            options,
            boundaries: Boundaries {
                stdin: Some(stdin),
                stdout: Some(stdout),
                stderr: Some(stderr),
            },
            kinds,
            stdout_path,
            state: PipelineState::Built,
            running: None,
            result: None,
            killed: false,
        })
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    /// Spawn every stage.
    ///
    /// # Errors
    ///
    /// * `InvalidState` if the pipeline was already started.
    /// * `Spawn` if a stage could not be started. Stages spawned before it
    ///   keep running; the pipeline is `Running` and must be killed or
    ///   dropped.
    pub fn run(&mut self) -> PipelineResult<()> {
        if self.state != PipelineState::Built {
            return Err(PipelineError::InvalidState(format!(
                "pipeline already started ({:?})",
                self.state
            )));
        }
        if self.options.echo {
            tracing::info!(command = %self, "running pipeline");
        }

        self.state = PipelineState::Running;
        let running = self.running.insert(RunningPipeline::default());
        running.spawn_all(&self.stages, &mut self.boundaries, &self.options)?;

        tracing::debug!(stages = self.stages.len(), pids = ?running.pids(), "pipeline started");
        Ok(())
    }

    /// Wait for every stage to exit, draining piped output.
    ///
    /// On timeout the pipeline is left running; call `wait` again or `kill`.
    pub fn wait(&mut self, timeout: Option<Duration>) -> PipelineResult<()> {
        lifecycle::wait(self, timeout)
    }

    /// Release handles and temp files. A second call is a no-op.
    pub fn close(&mut self) -> PipelineResult<()> {
        lifecycle::close(self)
    }

    /// Terminate every stage still alive. Returns whether any signal was
    /// sent; `false` once the pipeline has finished.
    pub fn kill(&mut self) -> PipelineResult<bool> {
        lifecycle::kill(self)
    }

    /// Run if needed and return a guard that kills and closes the pipeline
    /// when dropped.
    pub fn enter(&mut self) -> PipelineResult<PipelineGuard<'_>> {
        let mut guard = PipelineGuard::new(self);
        if guard.state == PipelineState::Built {
            guard.run()?;
        }
        Ok(guard)
    }

    /// Run `f` against the started pipeline; kill and close on the way out,
    /// whatever `f` returns.
    pub fn scoped<T, F>(&mut self, f: F) -> PipelineResult<T>
    where
        F: FnOnce(&mut Pipeline) -> PipelineResult<T>,
    {
        let mut guard = self.enter()?;
        f(&mut *guard)
    }

    /// `run` if not started yet, then `wait`, `close` and `check`.
    pub fn block(&mut self, timeout: Option<Duration>) -> PipelineResult<()> {
        self.start_if_built()?;
        self.wait(timeout)?;
        self.close()?;
        self.check()
    }

    /// `run` if not started yet, then `wait` and `check`, leaving the
    /// pipeline open.
    pub fn block_open(&mut self, timeout: Option<Duration>) -> PipelineResult<()> {
        self.start_if_built()?;
        self.wait(timeout)?;
        self.check()
    }

    // ========================================================================
    // STATUS
    // ========================================================================

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Whether the last stage has been seen to exit, by `wait` or `poll`.
    /// Output may still be undrained until `wait` returns.
    pub fn is_done(&self) -> bool {
        matches!(self.state, PipelineState::Done | PipelineState::Closed)
            || matches!(self.returncode(), Ok(Some(_)))
    }

    pub fn is_closed(&self) -> bool {
        self.state == PipelineState::Closed
    }

    /// Whether `kill` signalled at least one stage.
    pub fn is_killed(&self) -> bool {
        self.killed
    }

    /// Exit code of each stage, `None` where not yet observed or never
    /// spawned.
    pub fn exit_codes(&self) -> Vec<Option<i32>> {
        match (&self.running, &self.result) {
            (Some(running), _) => running.exit_codes(),
            (None, Some(result)) => result.exit_codes.clone(),
            (None, None) => Vec::new(),
        }
    }

    /// Aggregate return code from the statuses observed so far (pipefail
    /// rule). `Ok(None)` while the last stage has not been seen to exit.
    ///
    /// # Errors
    ///
    /// `InvalidState` before `run`.
    pub fn returncode(&self) -> PipelineResult<Option<i32>> {
        self.require_started("read the return code")?;
        Ok(aggregate_returncode(&self.exit_codes()))
    }

    /// Refresh stage statuses without blocking, then report the aggregate
    /// return code.
    pub fn poll(&mut self) -> PipelineResult<Option<i32>> {
        self.require_started("poll")?;
        if let Some(running) = self.running.as_mut() {
            running.poll_all()?;
        }
        self.returncode()
    }

    /// Whether the aggregate return code is finished and allowed.
    pub fn ok(&self) -> bool {
        matches!(self.returncode(), Ok(Some(rc)) if self.options.is_allowed(rc))
    }

    /// Turn a disallowed aggregate return code into
    /// `PipelineError::Execution`, carrying the stderr of every stage.
    pub fn check(&self) -> PipelineResult<()> {
        let returncode = self.returncode()?.ok_or_else(|| {
            PipelineError::InvalidState("pipeline has not finished".into())
        })?;
        if self.options.is_allowed(returncode) {
            return Ok(());
        }
        Err(PipelineError::Execution {
            returncode,
            command: self.to_string(),
            stderr: self.stderr_report(),
        })
    }

    fn stderr_report(&self) -> String {
        let entries: Vec<String> = match (&self.result, &self.running) {
            (Some(result), _) => result
                .all_stderr
                .iter()
                .map(|captured| captured.to_string_lossy().into_owned())
                .collect(),
            (None, Some(running)) => running.stderr_snapshot(),
            (None, None) => Vec::new(),
        };
        entries
            .iter()
            .map(|entry| entry.trim())
            .filter(|entry| !entry.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn pids(&self) -> Vec<u32> {
        self.running
            .as_ref()
            .map(RunningPipeline::pids)
            .unwrap_or_default()
    }

    // ========================================================================
    // STREAMS
    // ========================================================================

    /// Captured stdout of the last stage.
    ///
    /// # Errors
    ///
    /// `InvalidState` unless the pipeline is closed and stdout was a `Pipe`
    /// left to the engine, or a `Buffer`.
    pub fn output(&self) -> PipelineResult<&Captured> {
        self.require_closed("output")?
            .stdout
            .as_ref()
            .ok_or_else(|| PipelineError::InvalidState("stdout was not captured".into()))
    }

    /// Captured stderr of the last stage.
    pub fn error(&self) -> PipelineResult<&Captured> {
        self.require_closed("error")?
            .stderr
            .as_ref()
            .ok_or_else(|| PipelineError::InvalidState("stderr was not captured".into()))
    }

    /// Captured stderr of every stage, in stage order. Entries for streams
    /// that were not captured are empty.
    pub fn all_stderr(&self) -> PipelineResult<&[Captured]> {
        Ok(&self.require_closed("stderr")?.all_stderr)
    }

    /// Live input pipe of the first stage, when stdin is `Pipe`.
    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.live()?.stdin_pipe.take()
    }

    /// Live output pipe of the last stage. A taken stream is no longer
    /// drained by `wait` and not available through `output`.
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.live()?.stdout_pipe.take()
    }

    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.live()?.stderr_pipe.take()
    }

    pub fn stdin_kind(&self) -> PipelineResult<StreamKind> {
        self.require_started("inspect stdin")?;
        Ok(self.kinds.stdin)
    }

    pub fn stdout_kind(&self) -> PipelineResult<StreamKind> {
        self.require_started("inspect stdout")?;
        Ok(self.kinds.stdout)
    }

    pub fn stderr_kind(&self) -> PipelineResult<StreamKind> {
        self.require_started("inspect stderr")?;
        Ok(self.kinds.stderr)
    }

    // ========================================================================
    // HELPERS
    // ========================================================================

    fn start_if_built(&mut self) -> PipelineResult<()> {
        if self.state == PipelineState::Built {
            self.run()?;
        }
        Ok(())
    }

    fn require_started(&self, action: &str) -> PipelineResult<()> {
        if self.state == PipelineState::Built {
            return Err(PipelineError::InvalidState(format!(
                "cannot {} before the pipeline is run",
                action
            )));
        }
        Ok(())
    }

    fn require_closed(&self, what: &str) -> PipelineResult<&CapturedStreams> {
        match (&self.state, &self.result) {
            (PipelineState::Closed, Some(result)) => Ok(result),
            _ => Err(PipelineError::InvalidState(format!(
                "cannot read {} until the pipeline is closed (state: {:?})",
                what, self.state
            ))),
        }
    }

    fn live(&mut self) -> Option<&mut RunningPipeline> {
        match self.state {
            PipelineState::Running => self.running.as_mut(),
            _ => None,
        }
    }
}

impl fmt::Display for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, stage) in self.stages.iter().enumerate() {
            if index > 0 {
                f.write_str(" | ")?;
            }
            write!(f, "{}", stage.command)?;
        }
        if let Some(path) = &self.stdout_path {
            write!(f, " > {}", path.display())?;
        }
        Ok(())
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("command", &self.to_string())
            .field("state", &self.state)
            .field("pids", &self.pids())
            .finish()
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        lifecycle::release(self)
    }
}

// ============================================================================
// THREAD SAFETY ASSERTIONS
// ============================================================================

const _: () = {
    const fn assert_send_sync<T: Send + Sync>() {}
    let _ = assert_send_sync::<Pipeline>;
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::StageCommand;
    use crate::options::{ExecMode, OutputMode, SpawnOptions};
    use std::io::{Read, Write};
    use tempfile::TempDir;

    fn text_options() -> PipelineOptions {
        PipelineOptions {
            mode: OutputMode::Text,
            ..Default::default()
        }
    }

    #[test]
    fn test_pipefail_last_stage_fails() {
        let mut p = Pipeline::new("echo hi | cat procpipe-missing-file", text_options()).unwrap();
        p.run().unwrap();
        p.wait(None).unwrap();
        assert_eq!(p.returncode().unwrap(), Some(1));
        assert!(!p.ok());
    }

    #[test]
    fn test_pipefail_first_stage_fails() {
        let mut p = Pipeline::new("cat procpipe-missing-file | echo hi", text_options()).unwrap();
        p.run().unwrap();
        p.wait(None).unwrap();
        assert_eq!(p.returncode().unwrap(), Some(1));
        p.close().unwrap();
        assert_eq!(p.output().unwrap(), "hi");
    }

    #[test]
    fn test_literal_round_trip_in_both_modes() {
        for mode in [OutputMode::Bytes, OutputMode::Text] {
            let mut p = Pipeline::builder()
                .command_line("grep foo | wc -l")
                .stdin(StreamDirective::literal("foo\nbar"))
                .mode(mode)
                .build()
                .unwrap();
            p.block(None).unwrap();
            assert_eq!(p.output().unwrap(), "1");
            assert_eq!(p.output().unwrap().as_str().is_some(), mode == OutputMode::Text);
        }
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut p = Pipeline::new("echo hi", PipelineOptions::default()).unwrap();
        p.run().unwrap();
        p.wait(None).unwrap();
        p.close().unwrap();
        p.close().unwrap();
        assert!(p.is_closed());
        assert_eq!(p.output().unwrap(), "hi");
    }

    #[test]
    fn test_empty_pipeline_rejected() {
        let spec = PipelineSpec::new(Vec::new(), PipelineOptions::default());
        assert!(matches!(
            Pipeline::from_spec(spec),
            Err(PipelineError::Config(_))
        ));
        assert!(Pipeline::new(Vec::<StageCommand>::new(), PipelineOptions::default()).is_err());
    }

    #[test]
    fn test_timeout_leaves_pipeline_running() {
        let mut p = Pipeline::new("sleep 10", PipelineOptions::default()).unwrap();
        p.run().unwrap();

        let err = p.wait(Some(Duration::from_millis(200))).unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(p.state(), PipelineState::Running);
        assert_eq!(p.returncode().unwrap(), None);

        assert!(p.kill().unwrap());
        assert!(p.is_killed());
        assert!(p.is_done());
        assert_eq!(p.returncode().unwrap(), Some(-15));
        p.close().unwrap();
    }

    #[test]
    fn test_kill_after_finish_is_noop() {
        let mut p = Pipeline::new("echo hi", PipelineOptions::default()).unwrap();
        p.block(None).unwrap();
        assert!(!p.kill().unwrap());
        assert_eq!(p.returncode().unwrap(), Some(0));
        assert!(!p.is_killed());
    }

    #[test]
    fn test_interior_stderr_per_stage() {
        let mut p = Pipeline::builder()
            .stage(["echo", "hi"])
            .stage(["sh", "-c", "echo middle >&2; cat"])
            .stage(["cat"])
            .text()
            .build()
            .unwrap();
        p.block(None).unwrap();

        assert_eq!(p.output().unwrap(), "hi");
        let all: Vec<String> = p
            .all_stderr()
            .unwrap()
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(all, vec!["", "middle\n", ""]);
    }

    #[test]
    fn test_interior_stderr_capture_disabled() {
        let mut p = Pipeline::builder()
            .stage(["sh", "-c", "echo middle >&2; echo out"])
            .stage(["cat"])
            .capture_interior_stderr(false)
            .build()
            .unwrap();
        p.block(None).unwrap();
        assert!(p.all_stderr().unwrap().iter().all(Captured::is_empty));
    }

    #[test]
    fn test_allowed_return_codes() {
        let mut strict = Pipeline::new("echo foo | grep -c bar", PipelineOptions::default()).unwrap();
        let err = strict.block(None).unwrap_err();
        assert_eq!(err.returncode(), Some(1));

        let mut lenient = Pipeline::builder()
            .command_line("echo foo | grep -c bar")
            .allowed_return_codes([0, 1])
            .build()
            .unwrap();
        lenient.block(None).unwrap();
        assert!(lenient.ok());
        assert_eq!(lenient.output().unwrap(), "0");
    }

    #[test]
    fn test_execution_error_carries_every_stage_stderr() {
        let mut p = Pipeline::builder()
            .stage(["sh", "-c", "echo first >&2; echo data"])
            .stage(["sh", "-c", "cat >/dev/null; echo last >&2; exit 3"])
            .build()
            .unwrap();
        match p.block(None) {
            Err(PipelineError::Execution {
                returncode, stderr, ..
            }) => {
                assert_eq!(returncode, 3);
                assert_eq!(stderr, "first\nlast");
            }
            other => panic!("expected execution error, got {:?}", other),
        }
    }

    #[test]
    fn test_direct_mode_does_not_use_a_shell() {
        let mut p = Pipeline::new("exit 2", PipelineOptions::default()).unwrap();
        let err = p.run().unwrap_err();
        assert_eq!(err.io_kind(), Some(std::io::ErrorKind::NotFound));

        let options = PipelineOptions {
            exec: ExecMode::shell_with("/bin/sh"),
            ..Default::default()
        };
        let mut p = Pipeline::new("exit 2", options).unwrap();
        let err = p.block(None).unwrap_err();
        assert_eq!(err.returncode(), Some(2));
    }

    #[test]
    fn test_state_errors() {
        let mut p = Pipeline::new("echo hi", PipelineOptions::default()).unwrap();
        assert!(matches!(p.wait(None), Err(PipelineError::InvalidState(_))));
        assert!(matches!(p.close(), Err(PipelineError::InvalidState(_))));
        assert!(matches!(p.kill(), Err(PipelineError::InvalidState(_))));
        assert!(p.returncode().is_err());
        assert!(p.stdout_kind().is_err());

        p.run().unwrap();
        assert!(matches!(p.run(), Err(PipelineError::InvalidState(_))));
        assert!(matches!(p.output(), Err(PipelineError::InvalidState(_))));
        assert_eq!(p.stdout_kind().unwrap(), StreamKind::Pipe);
        assert_eq!(p.stdin_kind().unwrap(), StreamKind::Discard);

        p.block(None).unwrap();
        assert!(matches!(p.block(None), Err(PipelineError::InvalidState(_))));
    }

    #[test]
    fn test_buffer_capture_is_trimmed() {
        let mut p = Pipeline::builder()
            .stage(["echo", "hi"])
            .stdout(StreamDirective::Buffer)
            .stderr(StreamDirective::Buffer)
            .text()
            .build()
            .unwrap();
        p.run().unwrap();
        p.wait(None).unwrap();
        assert!(p.output().is_err());
        p.close().unwrap();
        assert_eq!(p.output().unwrap(), "hi");
        assert_eq!(p.error().unwrap(), "");
    }

    #[test]
    fn test_file_target_and_display() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.txt");
        let mut p = Pipeline::builder()
            .stage(["echo", "hi"])
            .stdout(StreamDirective::file(&path))
            .build()
            .unwrap();
        assert_eq!(p.to_string(), format!("echo hi > {}", path.display()));

        p.block(None).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hi\n");
        assert!(matches!(p.output(), Err(PipelineError::InvalidState(_))));
        assert_eq!(p.stdout_kind().unwrap(), StreamKind::File);
    }

    #[test]
    fn test_guard_kills_and_closes() {
        let mut p = Pipeline::new("sleep 5", PipelineOptions::default()).unwrap();
        {
            let guard = p.enter().unwrap();
            assert_eq!(guard.pids().len(), 1);
        }
        assert!(p.is_closed());
        assert_ne!(p.returncode().unwrap(), Some(0));
    }

    #[test]
    fn test_scoped_closes_on_error() {
        let mut p = Pipeline::new("sleep 5", PipelineOptions::default()).unwrap();
        let result: PipelineResult<()> =
            p.scoped(|_| Err(PipelineError::InvalidState("caller failed".into())));
        assert!(result.is_err());
        assert!(p.is_closed());
        assert!(p.is_killed());
    }

    #[test]
    fn test_text_flag_conflicts() {
        let options = PipelineOptions {
            spawn: SpawnOptions {
                text: Some(true),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(matches!(
            Pipeline::new("echo hi", options),
            Err(PipelineError::Config(_))
        ));

        let stage = StageSpec::new(["echo", "hi"]).with_options(SpawnOptions {
            universal_newlines: Some(false),
            ..Default::default()
        });
        let result = Pipeline::builder().stage_spec(stage).text().build();
        assert!(matches!(result, Err(PipelineError::Config(_))));
    }

    #[test]
    fn test_invalid_directive_rejected_before_run() {
        let result = Pipeline::builder()
            .stage(["cat"])
            .stdout(StreamDirective::literal("x"))
            .build();
        assert!(matches!(result, Err(PipelineError::Config(_))));
    }

    #[test]
    fn test_live_pipes() {
        let mut p = Pipeline::builder()
            .command_line("cat | tr a-z A-Z")
            .stdin(StreamDirective::Pipe)
            .build()
            .unwrap();
        p.run().unwrap();

        let mut stdin = p.take_stdin().unwrap();
        stdin.write_all(b"hello\n").unwrap();
        drop(stdin);

        let mut stdout = p.take_stdout().unwrap();
        let mut out = String::new();
        stdout.read_to_string(&mut out).unwrap();
        assert_eq!(out, "HELLO\n");

        p.block(None).unwrap();
        assert!(p.output().is_err());
    }

    #[test]
    fn test_poll_reports_completion() {
        let mut p = Pipeline::new("true", PipelineOptions::default()).unwrap();
        assert!(!p.is_done());
        p.run().unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while p.poll().unwrap().is_none() {
            assert!(std::time::Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(p.returncode().unwrap(), Some(0));
        assert_eq!(p.state(), PipelineState::Running);
        assert!(p.is_done());
        p.wait(None).unwrap();
    }

    #[test]
    fn test_block_open_keeps_buffers() {
        let mut p = Pipeline::builder()
            .stage(["sh", "-c", "echo problem >&2; exit 4"])
            .stderr(StreamDirective::Buffer)
            .build()
            .unwrap();
        let err = p.block_open(None).unwrap_err();
        assert!(err.to_string().contains("problem"));
        assert_eq!(p.state(), PipelineState::Done);
        p.close().unwrap();
        assert_eq!(p.error().unwrap(), "problem");
    }

    #[test]
    fn test_block_starts_built_pipeline() {
        let mut p = Pipeline::new("echo hi", PipelineOptions::default()).unwrap();
        assert_eq!(p.state(), PipelineState::Built);
        p.block(None).unwrap();
        assert!(p.is_closed());
        assert_eq!(p.output().unwrap(), "hi");
    }

    #[test]
    fn test_partial_spawn_has_no_returncode() {
        let mut p = Pipeline::builder()
            .stage(["true"])
            .stage(["procpipe-no-such-binary"])
            .build()
            .unwrap();
        let err = p.run().unwrap_err();
        assert_eq!(err.io_kind(), Some(std::io::ErrorKind::NotFound));
        assert_eq!(p.state(), PipelineState::Running);

        p.wait(None).unwrap();
        assert_eq!(p.exit_codes(), vec![Some(0), None]);
        assert_eq!(p.returncode().unwrap(), None);
        assert!(!p.ok());
        assert!(matches!(p.check(), Err(PipelineError::InvalidState(_))));

        p.close().unwrap();
        assert_eq!(p.exit_codes(), vec![Some(0), None]);
        assert_eq!(p.all_stderr().unwrap().len(), 2);
    }

    #[test]
    fn test_temp_files_removed_after_kill() {
        let mut p = Pipeline::builder()
            .stage(["cat"])
            .stage(["sleep", "10"])
            .stage(["cat"])
            .stdin(StreamDirective::literal("data"))
            .stdout(StreamDirective::Buffer)
            .stderr(StreamDirective::Buffer)
            .build()
            .unwrap();
        p.run().unwrap();

        // Literal stdin, both buffers, and two interior stderr files.
        let paths = p.running.as_ref().unwrap().temp_paths();
        assert_eq!(paths.len(), 5);
        assert!(paths.iter().all(|path| path.exists()));

        assert!(p.kill().unwrap());
        p.close().unwrap();
        assert!(paths.iter().all(|path| !path.exists()));
    }

    #[test]
    fn test_temp_files_removed_after_partial_spawn() {
        let mut p = Pipeline::builder()
            .stage(["cat"])
            .stage(["procpipe-no-such-binary"])
            .stdin(StreamDirective::literal("data"))
            .stdout(StreamDirective::Buffer)
            .stderr(StreamDirective::Buffer)
            .build()
            .unwrap();
        assert!(p.run().is_err());

        let paths = p.running.as_ref().unwrap().temp_paths();
        assert_eq!(paths.len(), 4);
        assert!(paths.iter().all(|path| path.exists()));

        drop(p);
        assert!(paths.iter().all(|path| !path.exists()));
    }

    #[test]
    fn test_output_file_error_is_io() {
        let dir = TempDir::new().unwrap();
        let mut p = Pipeline::builder()
            .stage(["echo", "hi"])
            .stdout(StreamDirective::file(dir.path().join("missing").join("out.txt")))
            .build()
            .unwrap();
        let err = p.run().unwrap_err();
        assert!(matches!(err, PipelineError::Io(_)));
        assert_eq!(err.io_kind(), Some(std::io::ErrorKind::NotFound));
        assert!(p.pids().is_empty());
    }
}
