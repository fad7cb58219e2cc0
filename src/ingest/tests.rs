use super::{interval_start, Accumulator, ClosedBucket};
use crate::schema::SchemaRegistry;
use crate::telemetry::FieldUpdate;
use serde_json::{json, Map, Value};
use std::sync::Arc;

const PERIOD_MS: u64 = 60_000;

fn accumulator() -> Accumulator {
    Accumulator::new(Arc::new(SchemaRegistry::vessel()), PERIOD_MS, 1_000)
}

fn update(device: &str, ts: i64, fields: Value) -> FieldUpdate {
    let Value::Object(fields) = fields else {
        panic!("fields must be an object");
    };
    FieldUpdate::new(device, ts, fields)
}

fn object(fields: Value) -> Map<String, Value> {
    match fields {
        Value::Object(map) => map,
        _ => panic!("expected object"),
    }
}

#[test]
fn interval_start_floors_to_period() {
    assert_eq!(interval_start(0, 60_000), 0);
    assert_eq!(interval_start(59_999, 60_000), 0);
    assert_eq!(interval_start(60_000, 60_000), 60_000);
    assert_eq!(interval_start(1_700_000_012_345, 60_000), 1_699_999_980_000);
    assert_eq!(interval_start(-1, 60_000), -60_000);
}

#[tokio::test]
async fn last_write_wins_per_field() {
    let acc = accumulator();
    acc.ingest(update("X", 1_000, json!({"awa": 10, "aws_knots": 4})))
        .await;
    acc.ingest(update("X", 2_000, json!({"awa": 12}))).await;
    acc.ingest(update("X", 500, json!({"sog_knots": 5}))).await;

    assert_eq!(acc.pending().await, 1);
    assert_eq!(
        acc.bucket("X", 0).await,
        Some(object(json!({"awa": 12, "aws_knots": 4, "sog_knots": 5})))
    );
}

#[tokio::test]
async fn order_of_application_decides_the_winner() {
    let forward = accumulator();
    forward.ingest(update("X", 1, json!({"awa": 1}))).await;
    forward.ingest(update("X", 2, json!({"awa": 2}))).await;

    let reverse = accumulator();
    reverse.ingest(update("X", 2, json!({"awa": 2}))).await;
    reverse.ingest(update("X", 1, json!({"awa": 1}))).await;

    assert_eq!(forward.bucket("X", 0).await.unwrap()["awa"], json!(2));
    assert_eq!(reverse.bucket("X", 0).await.unwrap()["awa"], json!(1));
}

#[tokio::test]
async fn reserved_and_unknown_keys_stay_out_of_buckets() {
    let acc = accumulator();
    acc.ingest(update(
        "X",
        1_000,
        json!({
            "mmsi": "spoofed",
            "timestamp": 5,
            "sentence_type": "RMC",
            "mystery": 1,
            "latitude": 47.6
        }),
    ))
    .await;

    assert_eq!(
        acc.bucket("X", 0).await,
        Some(object(json!({"latitude": 47.6})))
    );
}

#[tokio::test]
async fn malformed_updates_are_dropped() {
    let acc = accumulator();
    acc.ingest(update("", 1_000, json!({"awa": 1}))).await;
    acc.ingest(update("   ", 1_000, json!({"awa": 1}))).await;
    acc.ingest(update("X", 0, json!({"awa": 1}))).await;
    acc.ingest(update("X", -5, json!({"awa": 1}))).await;
    assert_eq!(acc.pending().await, 0);
    assert_eq!(acc.device_count().await, 0);
}

#[tokio::test]
async fn buckets_are_per_device_and_interval() {
    let acc = accumulator();
    acc.ingest(update("X", 1_000, json!({"awa": 1}))).await;
    acc.ingest(update("Y", 1_000, json!({"awa": 2}))).await;
    acc.ingest(update("X", 61_000, json!({"awa": 3}))).await;

    assert_eq!(acc.pending().await, 3);
    assert_eq!(acc.device_count().await, 2);
    assert_eq!(acc.bucket("X", 60_000).await.unwrap()["awa"], json!(3));
}

#[tokio::test]
async fn drain_closed_takes_only_earlier_intervals() {
    let acc = accumulator();
    acc.ingest(update("X", 1_000, json!({"awa": 1}))).await;
    acc.ingest(update("Y", 2_000, json!({"awa": 2}))).await;
    acc.ingest(update("X", 61_000, json!({"awa": 3}))).await;

    let drained = acc.drain_closed(60_000).await;
    assert_eq!(
        drained,
        vec![
            ClosedBucket {
                device_id: "X".to_string(),
                interval_start: 0,
                fields: object(json!({"awa": 1})),
            },
            ClosedBucket {
                device_id: "Y".to_string(),
                interval_start: 0,
                fields: object(json!({"awa": 2})),
            },
        ]
    );
    assert_eq!(acc.pending().await, 1);
    // Y had nothing left and is removed entirely
    assert_eq!(acc.device_count().await, 1);
    assert!(acc.drain_closed(60_000).await.is_empty());
}

#[tokio::test]
async fn restore_keeps_newer_values() {
    let acc = accumulator();
    acc.ingest(update("X", 1_000, json!({"awa": 1, "tws_knots": 8})))
        .await;
    let drained = acc.drain_closed(60_000).await;

    // arrives while the drained bucket is being written
    acc.ingest(update("X", 1_500, json!({"awa": 2}))).await;

    assert_eq!(acc.restore(drained).await, 0);
    assert_eq!(
        acc.bucket("X", 0).await,
        Some(object(json!({"awa": 2, "tws_knots": 8})))
    );
}

#[tokio::test]
async fn concurrent_ingests_are_not_lost() {
    let acc = accumulator();
    let fields = [
        "awa",
        "aws_knots",
        "cog_true",
        "hdg_true",
        "latitude",
        "longitude",
        "sog_knots",
        "twd_true",
    ];
    let mut handles = Vec::new();
    for (i, field) in fields.iter().enumerate() {
        let acc = acc.clone();
        let field = field.to_string();
        handles.push(tokio::spawn(async move {
            let mut map = Map::new();
            map.insert(field, json!(i));
            acc.ingest(FieldUpdate::new("X", 1_000, map)).await;
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let bucket = acc.bucket("X", 0).await.unwrap();
    assert_eq!(bucket.len(), fields.len());
}
