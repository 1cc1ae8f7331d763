//! procpipe: shell-style process pipelines without a shell.
//!
//! Stages are connected stdout to stdin with OS pipes. Each boundary stream
//! (first stdin, last stdout and stderr) is routed by a [`StreamDirective`];
//! interior stderr is captured per stage. The aggregate return code follows
//! `set -o pipefail`.
//!
//! ```ignore
//! use procpipe::{run, RunOptions, StreamDirective};
//!
//! let p = run(
//!     "grep foo | wc -l",
//!     RunOptions::text().stdin(StreamDirective::literal("foo\nbar")),
//! )?;
//! assert_eq!(p.output()?, "1");
//! ```

#![cfg(unix)]

pub mod command;
pub mod errors;
mod logging;
pub mod options;
pub mod pipeline;
mod run;
pub mod stream;
pub mod util;

pub use command::{Commands, StageCommand};
pub use errors::{PipelineError, PipelineResult};
pub use logging::init_logging;
pub use options::{DEFAULT_SHELL, ExecMode, OutputMode, PipelineOptions, SpawnOptions};
pub use pipeline::{
    Pipeline, PipelineBuilder, PipelineGuard, PipelineSpec, PipelineState, StageSpec,
};
pub use run::{RunOptions, run, sub};
pub use stream::{Captured, StreamDirective, StreamKind, StreamRole};
