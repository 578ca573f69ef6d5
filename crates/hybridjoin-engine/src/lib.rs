//! Bounded-memory chained streaming join.
//!
//! A [`StreamSource`](source::StreamSource) feeds transaction events through
//! two windowed [`JoinStage`](stage::JoinStage)s, each probing a sorted master
//! relation one partition at a time. The last stage resolves surrogate keys
//! and persists facts in batches through a [`SinkAdapter`](sink::SinkAdapter).
//! Memory is bounded by the configured window, partition, channel and batch
//! sizes, independent of stream length.

#![warn(clippy::pedantic)]

pub mod channel;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod reader;
pub mod result;
pub mod sink;
pub mod source;
pub mod stage;
pub mod window;

// Re-export public API for convenience
pub use error::PipelineError;
pub use orchestrator::{
    check_pipeline, run_join_pipeline, run_pipeline, PipelineParts, PipelineSettings,
};
pub use result::{CheckResult, PipelineResult, SourceReport, StageReport};
