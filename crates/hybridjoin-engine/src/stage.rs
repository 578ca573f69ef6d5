//! Windowed, partition-probing join stage.
//!
//! Each iteration admits whatever the input channel has ready, probes the
//! relation with the window's oldest key, joins every pending tuple whose key
//! appears in the fetched partition, and flushes the oldest key's tuples when
//! the relation has no row for it. The window bounds memory; the partition
//! size bounds the cost of each probe.

use std::time::{Duration, Instant};

use hybridjoin_state::PartitionLoader;
use hybridjoin_types::state::StageName;
use hybridjoin_types::{EnrichedTuple, JoinKey, StreamTuple};

use crate::channel::{CompletionNotifier, CompletionSignal, Received, StageReceiver, StageSender};
use crate::config::types::{
    DEFAULT_IDLE_BACKOFF_MS, DEFAULT_PARTITION_SIZE, DEFAULT_REPORT_INTERVAL_SECS,
    DEFAULT_WINDOW_CAPACITY,
};
use crate::error::PipelineError;
use crate::result::StageReport;
use crate::window::Window;

/// Probe failures logged at warn level before switching to debug.
const PROBE_FAILURE_LOG_SAMPLES: u64 = 3;

/// Where a stage is in its admission/probe cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagePhase {
    Admitting,
    Probing,
    Matching,
    Flushing,
    Draining,
    Terminated,
}

/// Fixed per-stage parameters.
#[derive(Debug, Clone)]
pub struct StageSettings {
    pub name: StageName,
    /// Stream field holding this stage's join key.
    pub join_key: String,
    pub window_capacity: usize,
    pub partition_size: usize,
    /// Sleep while the window is empty and upstream is still producing.
    pub idle_backoff: Duration,
    pub report_interval: Duration,
}

impl StageSettings {
    #[must_use]
    pub fn new(name: impl Into<StageName>, join_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            join_key: join_key.into(),
            window_capacity: DEFAULT_WINDOW_CAPACITY,
            partition_size: DEFAULT_PARTITION_SIZE,
            idle_backoff: Duration::from_millis(DEFAULT_IDLE_BACKOFF_MS),
            report_interval: Duration::from_secs(DEFAULT_REPORT_INTERVAL_SECS),
        }
    }

    #[must_use]
    pub fn window_capacity(mut self, capacity: usize) -> Self {
        self.window_capacity = capacity;
        self
    }

    #[must_use]
    pub fn partition_size(mut self, size: usize) -> Self {
        self.partition_size = size;
        self
    }

    #[must_use]
    pub fn idle_backoff(mut self, backoff: Duration) -> Self {
        self.idle_backoff = backoff;
        self
    }

    #[must_use]
    pub fn report_interval(mut self, interval: Duration) -> Self {
        self.report_interval = interval;
        self
    }
}

/// Delivery counters of a stage output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutputStats {
    pub forwarded: u64,
    pub loaded: u64,
    pub dropped: u64,
}

/// Destination of a stage's enriched tuples.
pub trait StageOutput: Send {
    /// Accept one enriched tuple.
    ///
    /// # Errors
    ///
    /// Any error is fatal to the stage.
    fn emit(&mut self, tuple: EnrichedTuple) -> Result<(), PipelineError>;

    /// Called once when the stage terminates normally.
    ///
    /// # Errors
    ///
    /// Any error is fatal to the stage.
    fn finish(&mut self) -> Result<(), PipelineError>;

    fn stats(&self) -> OutputStats;
}

/// Output that forwards enriched tuples into the next stage's input channel,
/// signalling that stage's upstream completion on finish.
pub struct Forward {
    stage: StageName,
    tx: Option<StageSender<StreamTuple>>,
    done: Option<CompletionNotifier>,
    forwarded: u64,
}

impl Forward {
    #[must_use]
    pub fn new(stage: StageName, tx: StageSender<StreamTuple>, done: CompletionNotifier) -> Self {
        Self {
            stage,
            tx: Some(tx),
            done: Some(done),
            forwarded: 0,
        }
    }
}

impl StageOutput for Forward {
    fn emit(&mut self, tuple: EnrichedTuple) -> Result<(), PipelineError> {
        let tx = self.tx.as_ref().ok_or_else(|| PipelineError::ChannelClosed {
            stage: self.stage.clone(),
        })?;
        tx.put(tuple).map_err(|_| PipelineError::ChannelClosed {
            stage: self.stage.clone(),
        })?;
        self.forwarded += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<(), PipelineError> {
        self.tx = None;
        if let Some(done) = self.done.take() {
            done.notify();
        }
        Ok(())
    }

    fn stats(&self) -> OutputStats {
        OutputStats {
            forwarded: self.forwarded,
            ..OutputStats::default()
        }
    }
}

/// Running totals of one stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageCounters {
    pub iterations: u64,
    pub processed: u64,
    pub joined: u64,
    pub flushed: u64,
    pub probes: u64,
    pub probe_failures: u64,
    pub peak_window: usize,
}

struct Telemetry {
    last_at: Instant,
    last_delivered: u64,
}

/// One join stage: owns its window, its relation handle, and its output.
pub struct JoinStage<L, O> {
    settings: StageSettings,
    window: Window,
    input: StageReceiver<StreamTuple>,
    upstream: CompletionSignal,
    upstream_closed: bool,
    loader: L,
    output: O,
    phase: StagePhase,
    admission_open: bool,
    counters: StageCounters,
    started: Instant,
    telemetry: Telemetry,
}

impl<L: PartitionLoader, O: StageOutput> JoinStage<L, O> {
    pub fn new(
        settings: StageSettings,
        input: StageReceiver<StreamTuple>,
        upstream: CompletionSignal,
        loader: L,
        output: O,
    ) -> Self {
        let now = Instant::now();
        Self {
            window: Window::new(settings.window_capacity),
            settings,
            input,
            upstream,
            upstream_closed: false,
            loader,
            output,
            phase: StagePhase::Admitting,
            admission_open: true,
            counters: StageCounters::default(),
            started: now,
            telemetry: Telemetry {
                last_at: now,
                last_delivered: 0,
            },
        }
    }

    #[must_use]
    pub fn phase(&self) -> StagePhase {
        self.phase
    }

    #[must_use]
    pub fn window(&self) -> &Window {
        &self.window
    }

    #[must_use]
    pub fn counters(&self) -> StageCounters {
        self.counters
    }

    #[must_use]
    pub fn output(&self) -> &O {
        &self.output
    }

    #[must_use]
    pub fn settings(&self) -> &StageSettings {
        &self.settings
    }

    /// Run one admit/probe iteration and return the phase reached.
    ///
    /// # Errors
    ///
    /// Returns a fatal error on a protocol violation or output failure.
    /// Probe failures are absorbed by flushing.
    pub fn step(&mut self) -> Result<StagePhase, PipelineError> {
        if self.phase == StagePhase::Terminated {
            return Ok(self.phase);
        }
        self.counters.iterations += 1;

        if self.admission_open {
            self.enter(StagePhase::Admitting);
            if self.admit_ready()? > 0 {
                self.admission_open = false;
            }
        }

        if self.window.is_empty() {
            if self.upstream_finished() && self.input.is_empty() {
                self.enter(StagePhase::Draining);
                self.output.finish()?;
                self.enter(StagePhase::Terminated);
            } else {
                self.await_arrival()?;
            }
        } else {
            self.probe()?;
        }

        self.report_if_due();
        Ok(self.phase)
    }

    /// Step until the stage terminates.
    ///
    /// # Errors
    ///
    /// Returns the first fatal error raised by [`step`](Self::step).
    pub fn run(mut self) -> Result<StageReport, PipelineError> {
        tracing::info!(
            stage = %self.settings.name,
            join_key = self.settings.join_key,
            window_capacity = self.window.capacity(),
            partition_size = self.settings.partition_size,
            "Join stage started"
        );

        loop {
            match self.step() {
                Ok(StagePhase::Terminated) => break,
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(stage = %self.settings.name, "Join stage failed: {e}");
                    return Err(e);
                }
            }
        }

        let report = self.report();
        tracing::info!(
            stage = %report.stage,
            processed = report.processed,
            joined = report.joined,
            flushed = report.flushed,
            forwarded = report.forwarded,
            loaded = report.loaded,
            dropped = report.dropped,
            probes = report.probes,
            join_rate_pct = report.join_rate(),
            joins_per_probe = report.joins_per_probe(),
            duration_secs = report.duration_secs,
            "Join stage completed"
        );
        Ok(report)
    }

    /// Snapshot of the stage's counters as a report.
    #[must_use]
    pub fn report(&self) -> StageReport {
        let out = self.output.stats();
        StageReport {
            stage: self.settings.name.to_string(),
            join_key: self.settings.join_key.clone(),
            processed: self.counters.processed,
            joined: self.counters.joined,
            flushed: self.counters.flushed,
            probes: self.counters.probes,
            probe_failures: self.counters.probe_failures,
            forwarded: out.forwarded,
            loaded: out.loaded,
            dropped: out.dropped,
            peak_window: self.counters.peak_window,
            duration_secs: self.started.elapsed().as_secs_f64(),
        }
    }

    fn enter(&mut self, phase: StagePhase) {
        if self.phase != phase {
            tracing::trace!(stage = %self.settings.name, from = ?self.phase, to = ?phase, "Phase transition");
            self.phase = phase;
        }
    }

    fn upstream_finished(&self) -> bool {
        self.upstream_closed || self.upstream.is_set()
    }

    /// Admit ready tuples until the window is full or the channel is
    /// momentarily empty.
    fn admit_ready(&mut self) -> Result<usize, PipelineError> {
        let mut admitted = 0usize;
        while !self.window.is_full() {
            match self.input.try_get() {
                Received::Item(tuple) => {
                    self.admit(tuple)?;
                    admitted += 1;
                }
                Received::Empty => break,
                Received::Closed => {
                    self.upstream_closed = true;
                    break;
                }
            }
        }
        Ok(admitted)
    }

    /// Idle with an empty window: wait up to `idle_backoff` for one tuple and
    /// admit it as soon as it arrives.
    fn await_arrival(&mut self) -> Result<(), PipelineError> {
        match self.input.get_timeout(self.settings.idle_backoff) {
            Received::Item(tuple) => {
                self.admit(tuple)?;
                self.admission_open = false;
            }
            Received::Empty => {}
            Received::Closed => self.upstream_closed = true,
        }
        Ok(())
    }

    fn admit(&mut self, tuple: StreamTuple) -> Result<(), PipelineError> {
        let key = tuple.key(&self.settings.join_key).ok_or_else(|| {
            PipelineError::protocol(
                &self.settings.name,
                format!("tuple has no usable '{}' join key", self.settings.join_key),
            )
        })?;
        self.window
            .admit(key, tuple)
            .map_err(|e| PipelineError::protocol(&self.settings.name, e.to_string()))?;
        self.counters.processed += 1;
        self.counters.peak_window = self.counters.peak_window.max(self.window.len());
        Ok(())
    }

    fn probe(&mut self) -> Result<(), PipelineError> {
        let Some(oldest) = self.window.peek_oldest().cloned() else {
            return Ok(());
        };

        self.enter(StagePhase::Probing);
        self.counters.probes += 1;
        let fetched = self.loader.fetch(&oldest, self.settings.partition_size);
        self.admission_open = true;

        match fetched {
            Ok(rows) if !rows.is_empty() => {
                self.enter(StagePhase::Matching);
                for row in &rows {
                    // The first row with a key drains its bucket; later
                    // duplicates find it empty.
                    for tuple in self.window.take_bucket(&row.key) {
                        self.counters.joined += 1;
                        self.output.emit(tuple.enrich(row))?;
                    }
                }
                // The partition starts past `oldest`: no relation row exists for it.
                if self.window.bucket_len(&oldest) > 0 {
                    self.flush(&oldest);
                }
            }
            Ok(_) => {
                self.enter(StagePhase::Flushing);
                self.flush(&oldest);
            }
            Err(err) => {
                self.counters.probe_failures += 1;
                if self.counters.probe_failures <= PROBE_FAILURE_LOG_SAMPLES {
                    tracing::warn!(
                        stage = %self.settings.name,
                        key = %oldest,
                        error = %err,
                        "Partition fetch failed, flushing pending tuples for key"
                    );
                } else {
                    tracing::debug!(stage = %self.settings.name, key = %oldest, error = %err, "Partition fetch failed");
                }
                self.enter(StagePhase::Flushing);
                self.flush(&oldest);
            }
        }
        Ok(())
    }

    fn flush(&mut self, key: &JoinKey) {
        let flushed = self.window.take_bucket(key).len();
        self.counters.flushed += flushed as u64;
        tracing::trace!(stage = %self.settings.name, key = %key, flushed, "Flushed unmatched tuples");
    }

    #[allow(clippy::cast_precision_loss)]
    fn report_if_due(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.telemetry.last_at);
        if elapsed < self.settings.report_interval {
            return;
        }
        let out = self.output.stats();
        let delivered = out.forwarded + out.loaded;
        let recent_rate =
            (delivered - self.telemetry.last_delivered) as f64 / elapsed.as_secs_f64();
        tracing::info!(
            stage = %self.settings.name,
            iteration = self.counters.iterations,
            window = self.window.len(),
            distinct_keys = self.window.distinct_keys(),
            free = self.window.free(),
            backlog = self.input.backlog(),
            probes = self.counters.probes,
            joined = self.counters.joined,
            forwarded = out.forwarded,
            loaded = out.loaded,
            dropped = out.dropped,
            rate_per_sec = recent_rate.round(),
            "Join stage progress"
        );
        self.telemetry = Telemetry {
            last_at: now,
            last_delivered: delivered,
        };
    }
}
