//! Names and counters written to the `etl_runs` ledger.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! label {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash)]
        pub struct $name(String);

        impl $name {
            #[must_use]
            pub fn new(label: impl Into<String>) -> Self {
                Self(label.into())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl<S: Into<String>> From<S> for $name {
            fn from(label: S) -> Self {
                Self::new(label)
            }
        }
    };
}

label! {
    /// `pipeline` column of a ledger row, taken from the pipeline file.
    PipelineId
}

label! {
    /// Task label (`stream-source`, `customer-join`, ...) carried by reports
    /// and errors.
    StageName
}

/// Ledger row status. A row is inserted as `Running` and rewritten exactly
/// once when the run ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counters copied into the ledger row when a run ends. Failed runs carry
/// the root-cause message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    pub records_streamed: u64,
    pub records_joined: u64,
    pub records_loaded: u64,
    pub records_dropped: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}
