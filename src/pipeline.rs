use crate::ingest::{interval_start, Accumulator, ClosedBucket};
use crate::store::{Store, StoreError, UpsertRecord};
use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex,
};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

#[derive(Debug)]
pub enum FlushCommand {
    /// Flush closed intervals now instead of waiting for the next tick.
    Flush(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct PipelineHandle {
    tx: mpsc::Sender<FlushCommand>,
    stats: Arc<PipelineStats>,
}

impl PipelineHandle {
    pub fn new(tx: mpsc::Sender<FlushCommand>, stats: Arc<PipelineStats>) -> Self {
        Self { tx, stats }
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        self.stats.clone()
    }

    pub async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(FlushCommand::Flush(tx)).await?;
        rx.await?;
        Ok(())
    }

    /// Stops `producers` before the final drain, then closes the channel so the
    /// worker flushes every bucket. Returns how many buckets are left unflushed.
    pub async fn shutdown<T>(
        self,
        worker: JoinHandle<()>,
        accumulator: &Accumulator,
        producers: impl IntoIterator<Item = JoinHandle<T>>,
    ) -> usize {
        for producer in producers {
            producer.abort();
            let _ = producer.await;
        }
        if let Err(err) = self.flush().await {
            tracing::warn!(error=%err, "final flush request failed");
        }
        drop(self);
        if let Err(err) = worker.await {
            tracing::warn!(error=%err, "flush worker failed");
        }
        accumulator.pending().await
    }
}

#[derive(Debug)]
pub struct PipelineStats {
    pub last_flush_unix_ms: AtomicU64,
    pub last_batch_len: AtomicU64,
    pub average_flush_micros: AtomicU64,
    pub inflight_flushes: AtomicU64,
    pub failed_flushes: AtomicU64,
    pub discarded_buckets: AtomicU64,
    pub mqtt_connected: AtomicBool,
    pub last_error: Mutex<Option<String>>,
}

impl Default for PipelineStats {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineStats {
    pub fn new() -> Self {
        Self {
            last_flush_unix_ms: AtomicU64::new(0),
            last_batch_len: AtomicU64::new(0),
            average_flush_micros: AtomicU64::new(0),
            inflight_flushes: AtomicU64::new(0),
            failed_flushes: AtomicU64::new(0),
            discarded_buckets: AtomicU64::new(0),
            mqtt_connected: AtomicBool::new(false),
            last_error: Mutex::new(None),
        }
    }

    pub fn set_mqtt_connected(&self, connected: bool) {
        self.mqtt_connected.store(connected, Ordering::Relaxed);
    }

    pub fn record_error(&self, err: impl Into<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(err.into());
        }
    }

    pub fn clear_error(&self) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = None;
        }
    }

    pub fn snapshot(&self, pending_buckets: usize) -> StatsSnapshot {
        StatsSnapshot {
            pending_buckets,
            last_flush_unix_ms: self.last_flush_unix_ms.load(Ordering::Relaxed),
            last_batch_len: self.last_batch_len.load(Ordering::Relaxed),
            average_flush_micros: self.average_flush_micros.load(Ordering::Relaxed),
            inflight_flushes: self.inflight_flushes.load(Ordering::Relaxed),
            failed_flushes: self.failed_flushes.load(Ordering::Relaxed),
            discarded_buckets: self.discarded_buckets.load(Ordering::Relaxed),
            mqtt_connected: self.mqtt_connected.load(Ordering::Relaxed),
            last_error: self.last_error.lock().ok().and_then(|guard| guard.clone()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub pending_buckets: usize,
    pub last_flush_unix_ms: u64,
    pub last_batch_len: u64,
    pub average_flush_micros: u64,
    pub inflight_flushes: u64,
    pub failed_flushes: u64,
    pub discarded_buckets: u64,
    pub mqtt_connected: bool,
    pub last_error: Option<String>,
}

/// Moves closed buckets from the accumulator into the store.
#[derive(Clone)]
pub struct Flusher {
    accumulator: Accumulator,
    store: Store,
    stats: Arc<PipelineStats>,
}

impl Flusher {
    pub fn new(accumulator: Accumulator, store: Store, stats: Arc<PipelineStats>) -> Self {
        Self {
            accumulator,
            store,
            stats,
        }
    }

    /// Writes every bucket whose interval ended before the interval containing `now_ms`.
    pub async fn flush_closed(&self, now_ms: i64) -> Result<usize, StoreError> {
        let current = interval_start(now_ms, self.accumulator.period_ms());
        self.flush_before(current).await
    }

    /// Writes every bucket, open intervals included.
    pub async fn flush_all(&self) -> Result<usize, StoreError> {
        self.flush_before(i64::MAX).await
    }

    async fn flush_before(&self, before_interval_start: i64) -> Result<usize, StoreError> {
        let buckets = self.accumulator.drain_closed(before_interval_start).await;
        if buckets.is_empty() {
            return Ok(0);
        }

        let started = Instant::now();
        self.stats.inflight_flushes.fetch_add(1, Ordering::Relaxed);
        let records: Vec<UpsertRecord> = buckets.iter().map(ClosedBucket::to_record).collect();
        let len = records.len();
        let result = self.store.upsert_batch(&records).await;
        self.stats.inflight_flushes.fetch_sub(1, Ordering::Relaxed);

        match result {
            Ok(written) => {
                self.stats.last_batch_len.store(len as u64, Ordering::Relaxed);
                let now = Utc::now().timestamp_millis() as u64;
                self.stats.last_flush_unix_ms.store(now, Ordering::Relaxed);
                let micros = started.elapsed().as_micros() as u64;
                let prev = self.stats.average_flush_micros.load(Ordering::Relaxed);
                let avg = if prev == 0 {
                    micros
                } else {
                    (prev + micros) / 2
                };
                self.stats.average_flush_micros.store(avg, Ordering::Relaxed);
                self.stats.clear_error();
                tracing::debug!(len, micros, "flushed closed buckets");
                Ok(written)
            }
            Err(err) => {
                self.stats.failed_flushes.fetch_add(1, Ordering::Relaxed);
                self.stats.record_error(err.to_string());
                tracing::error!(error=%err, buckets = len, "failed to flush buckets; retaining for retry");
                let discarded = self.accumulator.restore(buckets).await;
                if discarded > 0 {
                    self.stats
                        .discarded_buckets
                        .fetch_add(discarded as u64, Ordering::Relaxed);
                }
                Err(err)
            }
        }
    }
}

pub fn spawn_worker(
    flusher: Flusher,
    mut rx: mpsc::Receiver<FlushCommand>,
    flush_interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(flush_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = flusher.flush_closed(Utc::now().timestamp_millis()).await {
                        tracing::warn!(error=%err, "flush on interval failed");
                    }
                }
                cmd = rx.recv() => {
                    match cmd {
                        Some(FlushCommand::Flush(done)) => {
                            if let Err(err) = flusher.flush_closed(Utc::now().timestamp_millis()).await {
                                tracing::warn!(error=%err, "flush on demand failed");
                            }
                            let _ = done.send(());
                        }
                        None => {
                            if let Err(err) = flusher.flush_all().await {
                                tracing::warn!(error=%err, "flush during shutdown failed");
                            }
                            break;
                        }
                    }
                }
            }
        }
    })
}
