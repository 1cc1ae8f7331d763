//! Process spawning and stream plumbing for a running pipeline.
//!
//! Data between stages flows through OS pipes only; the controller never
//! forwards bytes. It reads two streams itself, the last stage's stdout and
//! stderr when they are `Pipe`s, each on its own thread so neither can fill
//! up and stall the child. Interior stderr goes to temp files.

use std::io::{self, Read};
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tempfile::NamedTempFile;
use wait_timeout::ChildExt;

use super::stage::StageSpec;
use crate::errors::{PipelineError, PipelineResult};
use crate::options::{OutputMode, PipelineOptions};
use crate::stream::{
    self, Captured, ResolvedStream, StreamDirective, StreamRole, drain_temp, temp_buffer,
};
use crate::util::exit_code;

const READER_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Boundary directives, consumed when the owning stage spawns.
#[derive(Debug)]
pub(crate) struct Boundaries {
    pub stdin: Option<StreamDirective>,
    pub stdout: Option<StreamDirective>,
    pub stderr: Option<StreamDirective>,
}

/// Finalized results, available once the pipeline is closed.
#[derive(Debug, Clone)]
pub(crate) struct CapturedStreams {
    pub stdout: Option<Captured>,
    pub stderr: Option<Captured>,
    /// One entry per stage; the last one mirrors `stderr`.
    pub all_stderr: Vec<Captured>,
    pub exit_codes: Vec<Option<i32>>,
}

type Reader = JoinHandle<io::Result<Vec<u8>>>;

/// Live process set and the handles it owns.
#[derive(Debug, Default)]
pub(crate) struct RunningPipeline {
    /// Stages requested, spawned or not.
    expected: usize,
    children: Vec<Child>,
    statuses: Vec<Option<ExitStatus>>,
    stdin: Option<ResolvedStream>,
    stdout: Option<ResolvedStream>,
    stderr: Option<ResolvedStream>,
    /// Interior stages only, aligned with stage index.
    interior_stderr: Vec<Option<NamedTempFile>>,
    pub stdin_pipe: Option<ChildStdin>,
    pub stdout_pipe: Option<ChildStdout>,
    pub stderr_pipe: Option<ChildStderr>,
    stdout_reader: Option<Reader>,
    stderr_reader: Option<Reader>,
    drained_stdout: Option<Vec<u8>>,
    drained_stderr: Option<Vec<u8>>,
}

impl RunningPipeline {
    /// Spawn every stage in order, wiring stage `i` stdout to stage `i+1`
    /// stdin.
    ///
    /// Boundary streams are resolved right before the stage that owns them.
    /// On failure the stages already started keep running and stay tracked
    /// here so the caller can kill and close them.
    pub(crate) fn spawn_all(
        &mut self,
        stages: &[StageSpec],
        boundaries: &mut Boundaries,
        options: &PipelineOptions,
    ) -> PipelineResult<()> {
        self.expected = stages.len();
        let last = stages.len().saturating_sub(1);
        let mut upstream: Option<ChildStdout> = None;

        for (index, stage) in stages.iter().enumerate() {
            let mut command = stage.build_command(&options.exec, &options.spawn)?;

            let stdin = match upstream.take() {
                Some(pipe) => Stdio::from(pipe),
                None => resolve_boundary(&mut self.stdin, &mut boundaries.stdin, StreamRole::Stdin)?,
            };
            let stdout = if index == last {
                resolve_boundary(&mut self.stdout, &mut boundaries.stdout, StreamRole::Stdout)?
            } else {
                Stdio::piped()
            };
            let stderr = if index == last {
                resolve_boundary(&mut self.stderr, &mut boundaries.stderr, StreamRole::Stderr)?
            } else if options.capture_interior_stderr {
                let tmp = temp_buffer()?;
                let stdio = Stdio::from(tmp.as_file().try_clone()?);
                self.interior_stderr.push(Some(tmp));
                stdio
            } else {
                self.interior_stderr.push(None);
                Stdio::null()
            };

            command.stdin(stdin).stdout(stdout).stderr(stderr);
            let spawned = command.spawn();
            // Release the parent's copies of the child's descriptors, in
            // particular the upstream pipe read end.
            drop(command);

            let mut child = spawned.map_err(|source| {
                tracing::debug!(stage = index, program = stage.command.program(), error = %source, "spawn failed");
                PipelineError::Spawn {
                    program: stage.command.program().to_string(),
                    source,
                }
            })?;
            tracing::debug!(stage = index, pid = child.id(), command = %stage.command, "spawned stage");

            if index == 0 {
                self.stdin_pipe = child.stdin.take();
            }
            if index == last {
                self.stdout_pipe = child.stdout.take();
                self.stderr_pipe = child.stderr.take();
            } else {
                upstream = child.stdout.take();
            }

            self.children.push(child);
            self.statuses.push(None);
        }

        Ok(())
    }

    pub(crate) fn pids(&self) -> Vec<u32> {
        self.children.iter().map(Child::id).collect()
    }

    /// Exit code of every stage, `None` where not yet observed or never
    /// spawned.
    pub(crate) fn exit_codes(&self) -> Vec<Option<i32>> {
        let mut codes: Vec<Option<i32>> = self
            .statuses
            .iter()
            .map(|status| status.map(exit_code))
            .collect();
        codes.resize(self.expected.max(codes.len()), None);
        codes
    }

    /// Stages whose exit status has not been observed.
    pub(crate) fn pending(&self) -> impl Iterator<Item = (usize, u32)> + '_ {
        self.statuses
            .iter()
            .zip(&self.children)
            .enumerate()
            .filter(|(_, (status, _))| status.is_none())
            .map(|(index, (_, child))| (index, child.id()))
    }

    /// Non-blocking status refresh.
    pub(crate) fn poll_all(&mut self) -> PipelineResult<()> {
        for (index, child) in self.children.iter_mut().enumerate() {
            if self.statuses[index].is_some() {
                continue;
            }
            if let Some(status) = child.try_wait()? {
                record(index, child.id(), status);
                self.statuses[index] = Some(status);
            }
        }
        Ok(())
    }

    /// Wait for stage `index` until `deadline`. Returns whether it exited.
    pub(crate) fn wait_stage(
        &mut self,
        index: usize,
        deadline: Option<Instant>,
    ) -> PipelineResult<bool> {
        if self.statuses[index].is_some() {
            return Ok(true);
        }
        let child = &mut self.children[index];
        let status = match deadline {
            None => Some(child.wait()?),
            Some(deadline) => {
                child.wait_timeout(deadline.saturating_duration_since(Instant::now()))?
            }
        };
        match status {
            Some(status) => {
                record(index, child.id(), status);
                self.statuses[index] = Some(status);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Number of stages actually spawned.
    pub(crate) fn stage_count(&self) -> usize {
        self.children.len()
    }

    fn all_spawned(&self) -> bool {
        self.children.len() == self.expected
    }

    #[cfg(test)]
    pub(crate) fn temp_paths(&self) -> Vec<std::path::PathBuf> {
        let boundaries = [&self.stdin, &self.stdout, &self.stderr]
            .into_iter()
            .flatten()
            .filter_map(ResolvedStream::temp_path);
        let interior = self.interior_stderr.iter().flatten().map(NamedTempFile::path);
        boundaries
            .chain(interior)
            .map(std::path::Path::to_path_buf)
            .collect()
    }

    /// Close the input pipe so the first stage sees EOF.
    pub(crate) fn close_stdin(&mut self) {
        self.stdin_pipe.take();
    }

    /// Start draining piped boundary outputs. Idempotent.
    pub(crate) fn start_readers(&mut self) -> PipelineResult<()> {
        if let Some(pipe) = self.stdout_pipe.take() {
            self.stdout_reader = Some(spawn_reader("procpipe-stdout", pipe)?);
        }
        if let Some(pipe) = self.stderr_pipe.take() {
            self.stderr_reader = Some(spawn_reader("procpipe-stderr", pipe)?);
        }
        Ok(())
    }

    /// Collect drained output. Returns `false` if a reader is still busy at
    /// `deadline`.
    pub(crate) fn join_readers(&mut self, deadline: Option<Instant>) -> PipelineResult<bool> {
        if let Some(deadline) = deadline {
            loop {
                let busy = [&self.stdout_reader, &self.stderr_reader]
                    .into_iter()
                    .flatten()
                    .any(|reader| !reader.is_finished());
                if !busy {
                    break;
                }
                if Instant::now() >= deadline {
                    return Ok(false);
                }
                thread::sleep(READER_POLL_INTERVAL);
            }
        }

        if let Some(reader) = self.stdout_reader.take() {
            self.drained_stdout = Some(join_reader(reader)?);
        }
        if let Some(reader) = self.stderr_reader.take() {
            self.drained_stderr = Some(join_reader(reader)?);
        }
        Ok(true)
    }

    /// Current stderr of every stage, without consuming any buffer.
    pub(crate) fn stderr_snapshot(&self) -> Vec<String> {
        let mut snapshot: Vec<String> = self
            .interior_stderr
            .iter()
            .map(|tmp| tmp.as_ref().map(read_snapshot).unwrap_or_default())
            .collect();
        snapshot.truncate(self.children.len());
        snapshot.resize(self.expected.saturating_sub(1), String::new());
        snapshot.push(match (self.all_spawned(), &self.drained_stderr, &self.stderr) {
            (false, _, _) => String::new(),
            (true, Some(raw), _) => String::from_utf8_lossy(raw.trim_ascii()).into_owned(),
            (true, None, Some(ResolvedStream::Buffer(tmp))) => read_snapshot(tmp),
            _ => String::new(),
        });
        snapshot
    }

    /// Release every handle and temp file, reading buffers back.
    ///
    /// Never fails: problems are logged and the affected capture is left
    /// empty.
    pub(crate) fn finalize(mut self, mode: OutputMode) -> CapturedStreams {
        let exit_codes = self.exit_codes();

        self.stdin_pipe.take();
        self.stdout_pipe.take();
        self.stderr_pipe.take();
        if let Err(e) = self.join_readers(Some(Instant::now())) {
            tracing::warn!(error = %e, "failed to collect piped output");
        }
        for reader in [self.stdout_reader.take(), self.stderr_reader.take()]
            .into_iter()
            .flatten()
        {
            tracing::warn!(thread = ?reader.thread().name(), "output reader still running, detaching");
        }

        if let Some(stdin) = self.stdin.take() {
            stdin.release();
        }
        let stdout = finalize_boundary(self.stdout.take(), self.drained_stdout.take(), mode);
        let stderr = finalize_boundary(self.stderr.take(), self.drained_stderr.take(), mode);

        let mut all_stderr: Vec<Captured> = self
            .interior_stderr
            .drain(..)
            .map(|tmp| {
                tmp.and_then(drain_temp)
                    .map(|raw| Captured::decode(raw, mode))
                    .unwrap_or_else(|| Captured::empty(mode))
            })
            .collect();
        all_stderr.truncate(self.children.len());
        all_stderr.resize(self.expected.saturating_sub(1), Captured::empty(mode));
        all_stderr.push(match &stderr {
            Some(captured) if self.all_spawned() => captured.clone(),
            _ => Captured::empty(mode),
        });

        CapturedStreams {
            stdout,
            stderr,
            all_stderr,
            exit_codes,
        }
    }
}

fn resolve_boundary(
    slot: &mut Option<ResolvedStream>,
    directive: &mut Option<StreamDirective>,
    role: StreamRole,
) -> PipelineResult<Stdio> {
    let directive = directive
        .take()
        .ok_or_else(|| PipelineError::InvalidState(format!("{} already resolved", role)))?;
    let resolved = slot.insert(stream::resolve(directive, role)?);
    Ok(resolved.stdio()?)
}

fn read_snapshot(tmp: &NamedTempFile) -> String {
    let mut data = Vec::new();
    if let Err(e) = tmp.reopen().and_then(|mut file| file.read_to_end(&mut data)) {
        tracing::warn!(path = %tmp.path().display(), error = %e, "failed to read stderr buffer");
    }
    String::from_utf8_lossy(&data).into_owned()
}

/// Piped and buffered output is trimmed of surrounding whitespace once.
fn finalize_boundary(
    resolved: Option<ResolvedStream>,
    drained: Option<Vec<u8>>,
    mode: OutputMode,
) -> Option<Captured> {
    let buffered = resolved.and_then(ResolvedStream::release);
    drained
        .or(buffered)
        .map(|raw| Captured::decode_trimmed(&raw, mode))
}

fn spawn_reader<R: Read + Send + 'static>(name: &str, mut pipe: R) -> io::Result<Reader> {
    thread::Builder::new().name(name.to_string()).spawn(move || {
        let mut data = Vec::new();
        pipe.read_to_end(&mut data)?;
        Ok(data)
    })
}

fn join_reader(reader: Reader) -> io::Result<Vec<u8>> {
    reader
        .join()
        .map_err(|_| io::Error::other("output reader panicked"))?
}

fn record(index: usize, pid: u32, status: ExitStatus) {
    tracing::debug!(stage = index, pid = pid, code = exit_code(status), "stage exited");
}
