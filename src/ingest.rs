mod accumulator;
mod state;
mod types;

#[cfg(test)]
mod tests;

use crate::schema::SchemaRegistry;
use std::sync::Arc;
use tokio::sync::Mutex;

pub use accumulator::interval_start;
pub use types::ClosedBucket;

/// Reserved payload keys that never become bucket fields.
const RESERVED_KEYS: &[&str] = &[
    crate::schema::DEVICE_FIELD,
    crate::schema::TIMESTAMP_FIELD,
    "sentence_type",
];

/// In-memory staging area merging partial field updates into one bucket per
/// `(device, interval_start)`.
#[derive(Clone)]
pub struct Accumulator {
    schema: Arc<SchemaRegistry>,
    period_ms: i64,
    max_retained_buckets: usize,
    state: Arc<Mutex<state::AccumulatorState>>,
}
