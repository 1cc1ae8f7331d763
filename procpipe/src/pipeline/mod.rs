//! Process pipeline engine.
//!
//! A [`Pipeline`] chains child processes the way a shell pipe does, without
//! a shell in between:
//!
//! ```text
//!  stdin directive          internal pipes             stdout directive
//!        │                                                    ▲
//!        ▼                                                    │
//!   ┌─────────┐  stdout→stdin  ┌─────────┐  stdout→stdin  ┌─────────┐
//!   │ stage 0 │ ─────────────► │ stage 1 │ ─────────────► │ stage 2 │
//!   └─────────┘                └─────────┘                └─────────┘
//!        │ stderr                   │ stderr                   │ stderr
//!        ▼                          ▼                          ▼
//!    temp file                  temp file               stderr directive
//! ```
//!
//! ## Lifecycle
//!
//! ```text
//! Built ──run──► Running ──wait──► Done ──close──► Closed
//!                   │                ▲
//!                   └──kill──► Killed┘
//! ```
//!
//! The aggregate return code follows `pipefail`: the rightmost nonzero stage
//! exit code, or 0.

mod engine;
mod lifecycle;
#[allow(clippy::module_inception)]
mod pipeline;
mod stage;
mod status;

pub use lifecycle::PipelineGuard;
pub use pipeline::{Pipeline, PipelineState};
pub use stage::{PipelineBuilder, PipelineSpec, StageSpec};
pub use status::aggregate_returncode;
