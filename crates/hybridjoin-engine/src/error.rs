//! Pipeline error model.

use hybridjoin_state::StateError;
use hybridjoin_types::state::StageName;

/// Categorized pipeline error.
///
/// Probe failures and dimension misses never surface here; stages recover
/// from those locally. Everything in this enum is fatal to the run.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Invalid pipeline configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// The event stream could not be read or held a malformed event.
    #[error("source error: {0}")]
    Source(String),

    /// A tuple violated the stage contract (e.g. missing join key).
    #[error("protocol violation in stage '{stage}': {message}")]
    Protocol { stage: StageName, message: String },

    /// The stage's downstream channel was closed while it still had output.
    /// Usually a symptom of the downstream stage failing first.
    #[error("stage '{stage}' lost its downstream channel")]
    ChannelClosed { stage: StageName },

    /// Fact persistence failed. Not retried.
    #[error("fact sink failed: {0}")]
    Sink(#[source] StateError),

    /// Warehouse or relation setup failed.
    #[error("storage error: {0}")]
    Storage(#[from] StateError),

    /// Host-side failure (task panic, runtime error).
    #[error(transparent)]
    Infrastructure(#[from] anyhow::Error),
}

impl PipelineError {
    pub fn protocol(stage: &StageName, message: impl Into<String>) -> Self {
        Self::Protocol {
            stage: stage.clone(),
            message: message.into(),
        }
    }

    /// `true` for errors that only reflect another stage's failure. The
    /// orchestrator reports the root cause in preference to these.
    #[must_use]
    pub fn is_secondary(&self) -> bool {
        matches!(self, Self::ChannelClosed { .. })
    }
}
