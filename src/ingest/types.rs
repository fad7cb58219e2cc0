use crate::store::UpsertRecord;
use serde_json::{Map, Value};

/// A bucket removed from memory by the flush path, waiting to be written.
#[derive(Clone, Debug, PartialEq)]
pub struct ClosedBucket {
    pub device_id: String,
    pub interval_start: i64,
    pub fields: Map<String, Value>,
}

impl ClosedBucket {
    pub fn to_record(&self) -> UpsertRecord {
        let mut record = UpsertRecord::new(self.device_id.clone(), self.interval_start);
        record.fields = self.fields.clone();
        record
    }
}
