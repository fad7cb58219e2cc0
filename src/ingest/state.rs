use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};

pub(in crate::ingest) type BucketFields = Map<String, Value>;

#[derive(Debug, Default)]
pub(in crate::ingest) struct AccumulatorState {
    /// device id -> interval start -> latest value per field
    pub(in crate::ingest) devices: HashMap<String, BTreeMap<i64, BucketFields>>,
}

impl AccumulatorState {
    pub(in crate::ingest) fn new() -> Self {
        Self::default()
    }

    pub(in crate::ingest) fn bucket_count(&self) -> usize {
        self.devices.values().map(BTreeMap::len).sum()
    }

    /// Removes the single oldest bucket across all devices.
    pub(in crate::ingest) fn evict_oldest(&mut self) -> Option<(String, i64)> {
        let (device_id, interval) = self
            .devices
            .iter()
            .filter_map(|(device, intervals)| {
                intervals
                    .keys()
                    .next()
                    .map(|interval| (device.clone(), *interval))
            })
            .min_by_key(|(_, interval)| *interval)?;
        if let Some(intervals) = self.devices.get_mut(&device_id) {
            intervals.remove(&interval);
            if intervals.is_empty() {
                self.devices.remove(&device_id);
            }
        }
        Some((device_id, interval))
    }
}
