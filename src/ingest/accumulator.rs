use super::state::{AccumulatorState, BucketFields};
use super::types::ClosedBucket;
use super::{Accumulator, RESERVED_KEYS};
use crate::schema::SchemaRegistry;
use crate::telemetry::FieldUpdate;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Start of the `period_ms` wide interval containing `timestamp_ms`.
pub fn interval_start(timestamp_ms: i64, period_ms: i64) -> i64 {
    let period = period_ms.max(1);
    timestamp_ms.div_euclid(period) * period
}

impl Accumulator {
    pub fn new(schema: Arc<SchemaRegistry>, period_ms: u64, max_retained_buckets: usize) -> Self {
        Self {
            schema,
            period_ms: i64::try_from(period_ms).unwrap_or(i64::MAX).max(1),
            max_retained_buckets: max_retained_buckets.max(1),
            state: Arc::new(Mutex::new(AccumulatorState::new())),
        }
    }

    pub fn period_ms(&self) -> i64 {
        self.period_ms
    }

    /// Merges `update` into its bucket. Malformed updates are dropped.
    pub async fn ingest(&self, update: FieldUpdate) {
        let device_id = update.device_id.trim();
        if device_id.is_empty() {
            tracing::debug!("dropping telemetry without device id");
            return;
        }
        if update.timestamp_ms <= 0 {
            tracing::debug!(device = %device_id, timestamp = update.timestamp_ms, "dropping telemetry with invalid timestamp");
            return;
        }

        let interval = interval_start(update.timestamp_ms, self.period_ms);
        let mut accepted = BucketFields::new();
        for (name, value) in update.fields {
            if RESERVED_KEYS.contains(&name.as_str()) {
                continue;
            }
            if !self.schema.is_value_field(&name) {
                tracing::trace!(device = %device_id, field = %name, "ignoring unknown field");
                continue;
            }
            accepted.insert(name, value);
        }

        let mut state = self.state.lock().await;
        let bucket = state
            .devices
            .entry(device_id.to_string())
            .or_default()
            .entry(interval)
            .or_default();
        for (name, value) in accepted {
            bucket.insert(name, value);
        }
        tracing::trace!(device = %device_id, interval, fields = bucket.len(), "merged telemetry");
    }

    /// Atomically removes every bucket whose interval starts before `before_interval_start`.
    pub async fn drain_closed(&self, before_interval_start: i64) -> Vec<ClosedBucket> {
        let mut state = self.state.lock().await;
        let mut closed = Vec::new();
        state.devices.retain(|device_id, intervals| {
            let open = intervals.split_off(&before_interval_start);
            let drained = std::mem::replace(intervals, open);
            closed.extend(
                drained
                    .into_iter()
                    .map(|(interval_start, fields)| ClosedBucket {
                        device_id: device_id.clone(),
                        interval_start,
                        fields,
                    }),
            );
            !intervals.is_empty()
        });
        closed.sort_by(|a, b| {
            (a.interval_start, &a.device_id).cmp(&(b.interval_start, &b.device_id))
        });
        closed
    }

    /// Puts back buckets whose write failed. Values that arrived for the same key
    /// since the drain are newer and win. Returns how many buckets were discarded
    /// to stay under the retention cap.
    pub async fn restore(&self, buckets: Vec<ClosedBucket>) -> usize {
        let mut state = self.state.lock().await;
        for bucket in buckets {
            let current = state
                .devices
                .entry(bucket.device_id)
                .or_insert_with(BTreeMap::new)
                .entry(bucket.interval_start)
                .or_default();
            for (name, value) in bucket.fields {
                current.entry(name).or_insert(value);
            }
        }

        let mut discarded = 0;
        while state.bucket_count() > self.max_retained_buckets {
            match state.evict_oldest() {
                Some((device, interval)) => {
                    tracing::error!(device = %device, interval, "discarding unflushed bucket over retention cap");
                    discarded += 1;
                }
                None => break,
            }
        }
        discarded
    }

    pub async fn pending(&self) -> usize {
        self.state.lock().await.bucket_count()
    }

    #[cfg(test)]
    pub async fn device_count(&self) -> usize {
        self.state.lock().await.devices.len()
    }

    #[cfg(test)]
    pub async fn bucket(&self, device_id: &str, interval_start: i64) -> Option<BucketFields> {
        let state = self.state.lock().await;
        state
            .devices
            .get(device_id)
            .and_then(|intervals| intervals.get(&interval_start))
            .cloned()
    }
}
