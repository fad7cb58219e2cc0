mod api;
mod config;
mod ingest;
mod mqtt;
mod pipeline;
mod query;
mod schema;
mod store;
mod telemetry;

use crate::api::AppState;
use crate::config::Config;
use crate::ingest::Accumulator;
use crate::pipeline::{spawn_worker, FlushCommand, Flusher, PipelineHandle, PipelineStats};
use crate::query::QueryFacade;
use crate::schema::SchemaRegistry;
use crate::store::{build_pool, Store};
use anyhow::Result;
use futures::future;
use std::sync::Arc;
use tokio::sync::mpsc;

fn init_tracing(config: &Config) -> Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as OTelTraceConfig, Resource};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,nmea_recorder=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);

    if let Some(endpoint) = &config.otlp_endpoint {
        let endpoint = normalize_otlp_http_endpoint(endpoint);
        let exporter = opentelemetry_otlp::new_exporter()
            .http()
            .with_endpoint(endpoint);
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(OTelTraceConfig::default().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "nmea-recorder"),
            ])))
            .install_batch(Tokio)?;

        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(otel_layer)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    }

    Ok(())
}

fn normalize_otlp_http_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.contains("/v1/traces") {
        return trimmed.to_string();
    }
    format!("{}/v1/traces", trimmed.trim_end_matches('/'))
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config)?;

    let schema = Arc::new(SchemaRegistry::vessel());
    let pool = build_pool(&config.database_url, config.db_pool_size).await?;
    let store = Store::new(pool, schema.clone(), config.store_timeout());
    store.migrate().await?;
    tracing::info!(database = %config.database_url, "store ready");

    let accumulator = Accumulator::new(
        schema,
        config.bucket_period_ms,
        config.max_retained_buckets,
    );
    let stats = Arc::new(PipelineStats::new());
    let (tx, rx) = mpsc::channel::<FlushCommand>(8);
    let pipeline = PipelineHandle::new(tx, stats.clone());
    let flusher = Flusher::new(accumulator.clone(), store.clone(), stats.clone());
    let worker_handle = spawn_worker(flusher, rx, config.flush_interval());

    let state = AppState {
        facade: QueryFacade::new(store.clone()),
        accumulator: accumulator.clone(),
        stats: pipeline.stats(),
    };
    let listener = tokio::net::TcpListener::bind(config.http_addr()?).await?;
    tracing::info!(addr = %config.http_bind, "HTTP API listening");
    let mut http_handle = tokio::spawn(async move {
        axum::serve(listener, api::router(state)).await
    });

    let mut mqtt_handle = if config.enable_mqtt_listener {
        let config_clone = config.clone();
        let accumulator_clone = accumulator.clone();
        let stats_clone = stats.clone();
        Some(tokio::spawn(async move {
            mqtt::run_listener(config_clone, accumulator_clone, stats_clone).await
        }))
    } else {
        None
    };

    tokio::select! {
        res = &mut http_handle => {
            match res {
                Ok(Err(err)) => tracing::error!(error=%err, "HTTP server exited"),
                Err(err) => tracing::error!(error=%err, "HTTP task failed"),
                Ok(Ok(())) => {}
            }
        }
        res = async {
            match mqtt_handle.as_mut() {
                Some(handle) => handle.await,
                None => future::pending().await,
            }
        } => {
            match res {
                Ok(Err(err)) => tracing::error!(error=%err, "MQTT listener exited"),
                Err(err) => tracing::warn!(error=%err, "MQTT task failed"),
                Ok(Ok(())) => {}
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    http_handle.abort();
    let pending = pipeline
        .shutdown(worker_handle, &accumulator, mqtt_handle)
        .await;
    if pending > 0 {
        tracing::error!(pending, "exiting with unflushed buckets");
    }
    store.pool().close().await;

    Ok(())
}
