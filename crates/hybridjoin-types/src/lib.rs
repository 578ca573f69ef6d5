//! Shared hybridjoin data model types.
//!
//! Kept free of storage and runtime dependencies so the state backend and the
//! engine can both depend on it without cycles.

pub mod fact;
pub mod record;
pub mod state;
pub mod value;

pub use fact::FactRecord;
pub use record::{EnrichedTuple, PartitionRow, Record, StreamTuple};
pub use value::{JoinKey, Value};
