use crate::ingest::Accumulator;
use crate::pipeline::{PipelineStats, StatsSnapshot};
use crate::query::{QueryError, QueryFacade, RangeParams};
use crate::store::PersistedRecord;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub facade: QueryFacade,
    pub accumulator: Accumulator,
    pub stats: Arc<PipelineStats>,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<QueryError> for ApiError {
    fn from(err: QueryError) -> Self {
        match err {
            QueryError::Invalid(message) => Self::new(StatusCode::BAD_REQUEST, message),
            QueryError::Store(err) => {
                tracing::error!(error = %err, "error fetching data from database");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub pipeline: StatsSnapshot,
}

pub(crate) async fn healthz_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let pending = state.accumulator.pending().await;
    Json(HealthResponse {
        status: "ok".to_string(),
        pipeline: state.stats.snapshot(pending),
    })
}

pub(crate) async fn query_all(
    State(state): State<AppState>,
    Query(params): Query<RangeParams>,
) -> Result<Json<Vec<PersistedRecord>>, ApiError> {
    let rows = state
        .facade
        .query_range(None, &params, Utc::now().timestamp_millis())
        .await?;
    Ok(Json(rows))
}

pub(crate) async fn query_device(
    State(state): State<AppState>,
    Path(mmsi): Path<String>,
    Query(params): Query<RangeParams>,
) -> Result<Json<Vec<PersistedRecord>>, ApiError> {
    let rows = state
        .facade
        .query_range(Some(&mmsi), &params, Utc::now().timestamp_millis())
        .await?;
    Ok(Json(rows))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/api/v1/data", get(query_all))
        .route("/api/v1/data/{mmsi}", get(query_device))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaRegistry;
    use crate::store::{memory_store, Store, UpsertRecord};
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    async fn app() -> (Router, Store) {
        let store = memory_store().await;
        store
            .upsert_batch(&[
                UpsertRecord::new("api_test", 1_000).with("awa", 10.0),
                UpsertRecord::new("api_test", 2_000).with("awa", 20.0),
                UpsertRecord::new("other", 1_500).with("awa", 30.0),
            ])
            .await
            .unwrap();
        let state = AppState {
            facade: QueryFacade::new(store.clone()),
            accumulator: Accumulator::new(Arc::new(SchemaRegistry::vessel()), 60_000, 10),
            stats: Arc::new(PipelineStats::new()),
        };
        (router(state), store)
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn returns_all_devices_in_window() {
        let (app, _) = app().await;
        let (status, body) = get_json(app, "/api/v1/data?start=0&end=5000").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn filters_by_device_and_orders_descending() {
        let (app, _) = app().await;
        let (status, body) =
            get_json(app, "/api/v1/data/api_test?start=0&end=5000&direction=desc").await;
        assert_eq!(status, StatusCode::OK);
        let rows = body.as_array().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["timestamp"], json!(2_000));
        assert_eq!(rows[0]["mmsi"], json!("api_test"));
        assert_eq!(rows[1]["awa"], json!(10.0));
    }

    #[tokio::test]
    async fn respects_limit() {
        let (app, _) = app().await;
        let (status, body) = get_json(app, "/api/v1/data?start=0&end=5000&limit=1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert_eq!(body[0]["timestamp"], json!(1_000));
    }

    #[tokio::test]
    async fn default_window_excludes_old_rows() {
        let (app, _) = app().await;
        let (status, body) = get_json(app, "/api/v1/data").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejects_invalid_parameters() {
        let (app, _) = app().await;
        let (status, body) = get_json(app.clone(), "/api/v1/data?limit=abc").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());

        let (status, _) = get_json(app.clone(), "/api/v1/data?direction=foo").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = get_json(app, "/api/v1/data/api_test?start=later").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn blank_device_path_is_a_bad_request() {
        let (app, _) = app().await;
        let (status, body) = get_json(app, "/api/v1/data/%20?start=0&end=5000").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], json!("Invalid mmsi"));
    }

    #[tokio::test]
    async fn store_failure_is_an_internal_error() {
        let (app, store) = app().await;
        store.pool().close().await;
        let (status, body) = get_json(app, "/api/v1/data?start=0&end=5000").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], json!("Internal server error"));
    }

    #[tokio::test]
    async fn healthz_reports_pipeline_state() {
        let (app, _) = app().await;
        let (status, body) = get_json(app, "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], json!("ok"));
        assert_eq!(body["pipeline"]["pending_buckets"], json!(0));
        assert_eq!(body["pipeline"]["mqtt_connected"], json!(false));
    }
}
