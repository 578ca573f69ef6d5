//! Stream source: feeds events into the first stage's input channel.

use std::time::{Duration, Instant};

use hybridjoin_types::state::StageName;
use hybridjoin_types::StreamTuple;

use crate::channel::{CompletionNotifier, StageSender};
use crate::config::types::DEFAULT_REPORT_INTERVAL_SECS;
use crate::error::PipelineError;
use crate::result::SourceReport;

/// Anything that yields events in stream order.
pub trait EventReader: Iterator<Item = Result<StreamTuple, PipelineError>> + Send {}

impl<I> EventReader for I where I: Iterator<Item = Result<StreamTuple, PipelineError>> + Send {}

#[derive(Debug, Clone)]
pub struct SourceSettings {
    pub name: StageName,
    /// Pause after each event. Zero streams as fast as the channel accepts.
    pub emit_delay: Duration,
    pub report_interval: Duration,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            name: StageName::new("stream-source"),
            emit_delay: Duration::ZERO,
            report_interval: Duration::from_secs(DEFAULT_REPORT_INTERVAL_SECS),
        }
    }
}

/// Pushes every event, in order, into a bounded channel, then signals
/// completion. Blocks while the channel is full.
pub struct StreamSource<R> {
    settings: SourceSettings,
    reader: R,
    output: StageSender<StreamTuple>,
    done: CompletionNotifier,
}

impl<R: EventReader> StreamSource<R> {
    pub fn new(
        settings: SourceSettings,
        reader: R,
        output: StageSender<StreamTuple>,
        done: CompletionNotifier,
    ) -> Self {
        Self {
            settings,
            reader,
            output,
            done,
        }
    }

    /// Stream until the reader is exhausted.
    ///
    /// The completion signal is set on return, including on error, so the
    /// first stage always drains and stops.
    ///
    /// # Errors
    ///
    /// Returns the reader's error for a malformed event, or
    /// [`PipelineError::ChannelClosed`] if the first stage went away.
    #[allow(clippy::cast_precision_loss)]
    pub fn run(self) -> Result<SourceReport, PipelineError> {
        let Self {
            settings,
            reader,
            output,
            done,
        } = self;
        let started = Instant::now();
        let mut last_report = started;
        let mut streamed = 0u64;

        tracing::info!(
            source = %settings.name,
            buffer_capacity = output.capacity(),
            "Stream source started"
        );

        for event in reader {
            let tuple = event.inspect_err(|e| {
                tracing::error!(source = %settings.name, streamed, "Stream source failed: {e}");
            })?;
            output
                .put(tuple)
                .map_err(|_| PipelineError::ChannelClosed {
                    stage: settings.name.clone(),
                })?;
            streamed += 1;

            if !settings.emit_delay.is_zero() {
                std::thread::sleep(settings.emit_delay);
            }

            if last_report.elapsed() >= settings.report_interval {
                let backlog = output.backlog();
                let elapsed = started.elapsed().as_secs_f64();
                tracing::info!(
                    source = %settings.name,
                    streamed,
                    rate_per_sec = (streamed as f64 / elapsed).round(),
                    buffer = backlog,
                    buffer_pct = (backlog as f64 / output.capacity() as f64 * 100.0).round(),
                    "Stream source progress"
                );
                last_report = Instant::now();
            }
        }

        drop(output);
        done.notify();

        let report = SourceReport {
            streamed,
            duration_secs: started.elapsed().as_secs_f64(),
        };
        tracing::info!(
            source = %settings.name,
            streamed,
            duration_secs = report.duration_secs,
            "Stream source exhausted"
        );
        Ok(report)
    }
}
