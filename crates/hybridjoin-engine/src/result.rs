//! Pipeline execution result types.

use hybridjoin_types::state::RunStats;
use serde::Serialize;

/// Final counters of the stream source.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SourceReport {
    pub streamed: u64,
    pub duration_secs: f64,
}

impl SourceReport {
    #[must_use]
    pub fn rate(&self) -> f64 {
        per_second(self.streamed, self.duration_secs)
    }
}

/// Final counters of one join stage.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StageReport {
    pub stage: String,
    pub join_key: String,
    /// Tuples admitted into the window.
    pub processed: u64,
    pub joined: u64,
    /// Tuples discarded because their key had no relation row or the probe failed.
    pub flushed: u64,
    pub probes: u64,
    pub probe_failures: u64,
    pub forwarded: u64,
    pub loaded: u64,
    /// Joined tuples rejected by the sink (dimension miss).
    pub dropped: u64,
    /// Largest window occupancy observed.
    pub peak_window: usize,
    pub duration_secs: f64,
}

impl StageReport {
    /// Joined tuples as a percentage of admitted tuples.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn join_rate(&self) -> f64 {
        if self.processed == 0 {
            0.0
        } else {
            self.joined as f64 / self.processed as f64 * 100.0
        }
    }

    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn joins_per_probe(&self) -> f64 {
        if self.probes == 0 {
            0.0
        } else {
            self.joined as f64 / self.probes as f64
        }
    }

    /// Tuples delivered downstream per second.
    #[must_use]
    pub fn throughput(&self) -> f64 {
        per_second(self.forwarded + self.loaded, self.duration_secs)
    }
}

/// Result of a pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineResult {
    pub pipeline: String,
    pub source: SourceReport,
    pub stages: Vec<StageReport>,
    pub duration_secs: f64,
    /// Upper bound on tuples held in memory at once:
    /// `2·window + 2·partition + stream_buffer + intermediate_queue + batch`.
    pub memory_bound_tuples: usize,
}

impl PipelineResult {
    /// Facts persisted by the final stage.
    #[must_use]
    pub fn records_loaded(&self) -> u64 {
        self.stages.last().map_or(0, |s| s.loaded)
    }

    #[must_use]
    pub fn records_dropped(&self) -> u64 {
        self.stages.last().map_or(0, |s| s.dropped)
    }

    #[must_use]
    pub fn records_joined(&self) -> u64 {
        self.stages.last().map_or(0, |s| s.joined)
    }

    /// End-to-end loaded records per second.
    #[must_use]
    pub fn throughput(&self) -> f64 {
        per_second(self.records_loaded(), self.duration_secs)
    }

    /// Loaded records as a percentage of streamed records.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn efficiency(&self) -> f64 {
        if self.source.streamed == 0 {
            0.0
        } else {
            self.records_loaded() as f64 / self.source.streamed as f64 * 100.0
        }
    }

    #[must_use]
    pub fn run_stats(&self) -> RunStats {
        RunStats {
            records_streamed: self.source.streamed,
            records_joined: self.records_joined(),
            records_loaded: self.records_loaded(),
            records_dropped: self.records_dropped(),
            error_message: None,
        }
    }
}

/// One pre-flight check and its outcome.
#[derive(Debug, Clone, Serialize)]
pub struct CheckItem {
    pub name: String,
    pub ok: bool,
    pub detail: String,
}

/// Result of a pipeline check.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CheckResult {
    pub items: Vec<CheckItem>,
}

impl CheckResult {
    pub fn record(&mut self, name: impl Into<String>, outcome: Result<String, String>) {
        let (ok, detail) = match outcome {
            Ok(detail) => (true, detail),
            Err(detail) => (false, detail),
        };
        self.items.push(CheckItem {
            name: name.into(),
            ok,
            detail,
        });
    }

    #[must_use]
    pub fn all_ok(&self) -> bool {
        self.items.iter().all(|item| item.ok)
    }
}

#[allow(clippy::cast_precision_loss)]
fn per_second(count: u64, secs: f64) -> f64 {
    if secs > 0.0 {
        count as f64 / secs
    } else {
        0.0
    }
}
