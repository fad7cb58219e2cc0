use crate::store::{PersistedRecord, RangeQuery, SortDirection, Store, StoreError};
use serde::Deserialize;

pub const DEFAULT_WINDOW_MS: i64 = 60 * 60 * 1000;

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("{0}")]
    Invalid(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Unvalidated range parameters as they arrive from a caller.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RangeParams {
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
    #[serde(default)]
    pub limit: Option<String>,
    #[serde(default)]
    pub direction: Option<String>,
}

impl RangeParams {
    /// Validates the parameters; the default window is the hour before `now_ms`.
    pub fn resolve(&self, device_id: Option<&str>, now_ms: i64) -> Result<RangeQuery, QueryError> {
        let start = parse_present(self.start.as_deref())
            .map(|parsed| parsed.unwrap_or(now_ms - DEFAULT_WINDOW_MS));
        let end = parse_present(self.end.as_deref()).map(|parsed| parsed.unwrap_or(now_ms));
        let limit = parse_present(self.limit.as_deref());
        let (Ok(start), Ok(end), Ok(limit)) = (start, end, limit) else {
            return Err(QueryError::Invalid("Invalid start, end or limit".to_string()));
        };
        let limit = match limit {
            Some(value) => Some(
                u64::try_from(value)
                    .map_err(|_| QueryError::Invalid("Invalid start, end or limit".to_string()))?,
            ),
            None => None,
        };

        let direction = match self.direction.as_deref().map(str::trim) {
            None | Some("") => SortDirection::Asc,
            Some(raw) => raw.parse::<SortDirection>().map_err(QueryError::Invalid)?,
        };

        let device_id = match device_id.map(str::trim) {
            None => None,
            Some("") => return Err(QueryError::Invalid("Invalid mmsi".to_string())),
            Some(value) => Some(value.to_string()),
        };

        Ok(RangeQuery {
            device_id,
            start,
            end,
            limit,
            direction,
        })
    }
}

/// An empty parameter counts as absent; anything else must be an integer.
fn parse_present(raw: Option<&str>) -> Result<Option<i64>, ()> {
    match raw.map(str::trim) {
        None | Some("") => Ok(None),
        Some(value) => value.parse::<i64>().map(Some).map_err(|_| ()),
    }
}

/// Stateless translation of raw range parameters into store queries.
#[derive(Clone)]
pub struct QueryFacade {
    store: Store,
}

impl QueryFacade {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn query_range(
        &self,
        device_id: Option<&str>,
        params: &RangeParams,
        now_ms: i64,
    ) -> Result<Vec<PersistedRecord>, QueryError> {
        let query = params.resolve(device_id, now_ms)?;
        tracing::debug!(
            device = query.device_id.as_deref().unwrap_or("*"),
            start = query.start,
            end = query.end,
            limit = query.limit,
            direction = ?query.direction,
            "range query"
        );
        Ok(self.store.query(&query).await?)
    }
}
