//! Pipeline lifecycle management
//!
//! Handles waiting, termination, cleanup, and the scoped guard.

use std::ops::{Deref, DerefMut};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::Signal;

use super::{Pipeline, PipelineState};
use crate::errors::{PipelineError, PipelineResult};
use crate::util::{is_process_alive, send_signal};

/// How long `kill` waits after each signal before escalating.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Wait for every stage to exit and drain piped output.
///
/// Stages are waited last to first. Exceeding `timeout` returns
/// `PipelineError::Timeout` and leaves the state untouched; statuses seen so
/// far are kept, so a later call picks up where this one stopped.
pub(super) fn wait(pipeline: &mut Pipeline, timeout: Option<Duration>) -> PipelineResult<()> {
    match pipeline.state {
        PipelineState::Running | PipelineState::Killed => {}
        PipelineState::Done => return Ok(()),
        other => {
            return Err(PipelineError::InvalidState(format!(
                "cannot wait on a pipeline in {:?} state",
                other
            )));
        }
    }

    let deadline = timeout.map(|timeout| Instant::now() + timeout);
    let timed_out = || PipelineError::Timeout {
        timeout: timeout.unwrap_or_default(),
    };

    let running = pipeline
        .running
        .as_mut()
        .ok_or_else(|| PipelineError::InvalidState("pipeline has no processes".into()))?;

    running.close_stdin();
    running.start_readers()?;

    for index in (0..running.stage_count()).rev() {
        if !running.wait_stage(index, deadline)? {
            tracing::debug!(stage = index, ?timeout, "wait timed out");
            return Err(timed_out());
        }
    }
    if !running.join_readers(deadline)? {
        tracing::debug!(?timeout, "wait timed out draining output");
        return Err(timed_out());
    }

    pipeline.state = PipelineState::Done;
    tracing::debug!(returncode = ?pipeline.returncode().ok().flatten(), "pipeline finished");
    Ok(())
}

/// Finalize buffers and delete temp files. No-op when already closed.
pub(super) fn close(pipeline: &mut Pipeline) -> PipelineResult<()> {
    match pipeline.state {
        PipelineState::Closed => return Ok(()),
        PipelineState::Done | PipelineState::Killed => {}
        other => {
            return Err(PipelineError::InvalidState(format!(
                "cannot close a pipeline in {:?} state",
                other
            )));
        }
    }

    if let Some(running) = pipeline.running.take() {
        pipeline.result = Some(running.finalize(pipeline.options.mode));
    }
    pipeline.state = PipelineState::Closed;
    tracing::trace!("pipeline closed");
    Ok(())
}

/// Send SIGTERM to every stage not yet seen to exit, then reap.
///
/// A stage that exits between the liveness check and the signal is
/// ignored. Stages that survive the grace period get SIGKILL. Returns
/// whether any signal was delivered.
pub(super) fn kill(pipeline: &mut Pipeline) -> PipelineResult<bool> {
    match pipeline.state {
        PipelineState::Built => {
            return Err(PipelineError::InvalidState(
                "cannot kill a pipeline that was never run".into(),
            ));
        }
        PipelineState::Done | PipelineState::Closed => return Ok(false),
        PipelineState::Running | PipelineState::Killed => {}
    }

    let signalled = signal_pending(pipeline, Signal::SIGTERM)?;
    if signalled {
        pipeline.state = PipelineState::Killed;
        pipeline.killed = true;
    }

    match wait(pipeline, Some(KILL_GRACE)) {
        Ok(()) => return Ok(signalled),
        Err(e) if e.is_timeout() => {
            tracing::debug!("stages survived SIGTERM, escalating to SIGKILL");
        }
        Err(e) => {
            tracing::warn!(error = %e, "failed to reap pipeline after kill");
            return Ok(signalled);
        }
    }

    if signal_pending(pipeline, Signal::SIGKILL)? {
        pipeline.state = PipelineState::Killed;
        pipeline.killed = true;
    }
    if let Err(e) = wait(pipeline, Some(KILL_GRACE)) {
        tracing::warn!(error = %e, "pipeline still not reaped after SIGKILL");
    }
    Ok(pipeline.killed)
}

fn signal_pending(pipeline: &mut Pipeline, signal: Signal) -> PipelineResult<bool> {
    let Some(running) = pipeline.running.as_mut() else {
        return Ok(false);
    };
    running.poll_all()?;

    let mut signalled = false;
    for (index, pid) in running.pending().collect::<Vec<_>>() {
        if !is_process_alive(pid) {
            tracing::trace!(stage = index, pid = pid, "stage already gone, not signalling");
            continue;
        }
        match send_signal(pid, signal) {
            Ok(()) => {
                tracing::debug!(stage = index, pid = pid, signal = ?signal, "signalled stage");
                signalled = true;
            }
            Err(Errno::ESRCH) => {
                tracing::trace!(stage = index, pid = pid, "stage already exited");
            }
            Err(e) => {
                tracing::warn!(stage = index, pid = pid, signal = ?signal, error = %e, "failed to signal stage");
            }
        }
    }
    Ok(signalled)
}

/// Best-effort teardown used on drop: kill if still running, then close.
pub(super) fn release(pipeline: &mut Pipeline) {
    if matches!(
        pipeline.state,
        PipelineState::Running | PipelineState::Killed
    ) {
        if let Err(e) = kill(pipeline) {
            tracing::warn!(error = %e, "failed to kill pipeline during cleanup");
        }
    }
    if matches!(pipeline.state, PipelineState::Done | PipelineState::Killed) {
        if let Err(e) = close(pipeline) {
            tracing::warn!(error = %e, "failed to close pipeline during cleanup");
        }
    }
}

/// Scoped access to a started pipeline.
///
/// Dropping the guard kills any stage still alive and closes the pipeline,
/// on every exit path.
pub struct PipelineGuard<'a> {
    pipeline: &'a mut Pipeline,
}

impl<'a> PipelineGuard<'a> {
    pub(super) fn new(pipeline: &'a mut Pipeline) -> Self {
        Self { pipeline }
    }
}

impl Deref for PipelineGuard<'_> {
    type Target = Pipeline;

    fn deref(&self) -> &Pipeline {
        self.pipeline
    }
}

impl DerefMut for PipelineGuard<'_> {
    fn deref_mut(&mut self) -> &mut Pipeline {
        self.pipeline
    }
}

impl Drop for PipelineGuard<'_> {
    fn drop(&mut self) {
        release(self.pipeline)
    }
}
