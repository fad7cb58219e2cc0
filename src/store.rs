use crate::schema::{
    FieldType, FieldValue, SchemaRegistry, DEVICE_FIELD, TABLE_NAME, TIMESTAMP_FIELD,
};
use serde::Serialize;
use serde_json::{Map, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("upsert requires a non-empty mmsi and a timestamp")]
    MissingPrimaryKey,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),
}

/// A write for one `(mmsi, timestamp)` row. Fields not mentioned keep their stored value.
#[derive(Debug, Clone, PartialEq)]
pub struct UpsertRecord {
    pub device_id: String,
    pub timestamp: i64,
    pub fields: Map<String, Value>,
}

impl UpsertRecord {
    pub fn new(device_id: impl Into<String>, timestamp: i64) -> Self {
        Self {
            device_id: device_id.into(),
            timestamp,
            fields: Map::new(),
        }
    }

    #[cfg(test)]
    pub fn with(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(name.to_string(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PersistedRecord {
    #[serde(rename = "mmsi")]
    pub device_id: String,
    pub timestamp: i64,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl PersistedRecord {
    #[cfg(test)]
    pub fn field(&self, name: &str) -> &Value {
        self.fields.get(name).unwrap_or(&Value::Null)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl SortDirection {
    fn sql(self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}

impl FromStr for SortDirection {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim() {
            value if value.eq_ignore_ascii_case("asc") => Ok(SortDirection::Asc),
            value if value.eq_ignore_ascii_case("desc") => Ok(SortDirection::Desc),
            other => Err(format!("Invalid direction {other:?}. Use \"asc\" or \"desc\"")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeQuery {
    pub device_id: Option<String>,
    pub start: i64,
    pub end: i64,
    pub limit: Option<u64>,
    pub direction: SortDirection,
}

pub async fn build_pool(database_url: &str, max_connections: u32) -> anyhow::Result<SqlitePool> {
    let in_memory = database_url.contains(":memory:");
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .busy_timeout(Duration::from_secs(5));
    let options = if in_memory {
        options
    } else {
        options.journal_mode(SqliteJournalMode::Wal)
    };

    let mut pool_options = SqlitePoolOptions::new();
    if in_memory {
        // every connection to :memory: is its own database
        pool_options = pool_options
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None);
    } else {
        pool_options = pool_options.max_connections(max_connections.max(1));
    }
    let pool = pool_options.connect_with(options).await?;
    Ok(pool)
}

/// Durable upsert-merge storage of per-interval records, keyed by `(mmsi, timestamp)`.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    schema: Arc<SchemaRegistry>,
    timeout: Duration,
}

impl Store {
    pub fn new(pool: SqlitePool, schema: Arc<SchemaRegistry>, timeout: Duration) -> Self {
        Self {
            pool,
            schema,
            timeout,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        let create = self.schema.create_table_sql();
        let index = format!(
            "CREATE INDEX IF NOT EXISTS {TABLE_NAME}_{TIMESTAMP_FIELD}_idx ON {TABLE_NAME} ({TIMESTAMP_FIELD})"
        );
        self.bounded(async {
            sqlx::query(&create).execute(&self.pool).await?;
            sqlx::query(&index).execute(&self.pool).await?;
            Ok(())
        })
        .await
    }

    pub async fn upsert(&self, record: &UpsertRecord) -> Result<(), StoreError> {
        if record.device_id.trim().is_empty() {
            return Err(StoreError::MissingPrimaryKey);
        }
        self.bounded(async {
            let mut builder = self.upsert_query(record);
            builder.build().execute(&self.pool).await?;
            Ok(())
        })
        .await
    }

    /// Applies every record in one transaction; either all rows land or none do.
    pub async fn upsert_batch(&self, records: &[UpsertRecord]) -> Result<usize, StoreError> {
        match records {
            [] => return Ok(0),
            [record] => {
                self.upsert(record).await?;
                return Ok(1);
            }
            _ => {}
        }
        if records
            .iter()
            .any(|record| record.device_id.trim().is_empty())
        {
            return Err(StoreError::MissingPrimaryKey);
        }

        self.bounded(async {
            let mut tx = self.pool.begin().await?;
            for record in records {
                let mut builder = self.upsert_query(record);
                builder.build().execute(&mut *tx).await?;
            }
            tx.commit().await?;
            Ok(records.len())
        })
        .await
    }

    pub async fn query(&self, query: &RangeQuery) -> Result<Vec<PersistedRecord>, StoreError> {
        let columns: Vec<&str> = self.schema.fields().iter().map(|field| field.name).collect();
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {} FROM {TABLE_NAME} WHERE {TIMESTAMP_FIELD} >= ",
            columns.join(", ")
        ));
        builder
            .push_bind(query.start)
            .push(format!(" AND {TIMESTAMP_FIELD} <= "))
            .push_bind(query.end);
        if let Some(device_id) = &query.device_id {
            builder
                .push(format!(" AND {DEVICE_FIELD} = "))
                .push_bind(device_id.clone());
        }
        let direction = query.direction.sql();
        builder.push(format!(
            " ORDER BY {TIMESTAMP_FIELD} {direction}, {DEVICE_FIELD} {direction}"
        ));
        if let Some(limit) = query.limit {
            builder
                .push(" LIMIT ")
                .push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
        }

        let rows = self
            .bounded(async { Ok(builder.build().fetch_all(&self.pool).await?) })
            .await?;
        rows.iter().map(|row| self.decode_row(row)).collect()
    }

    fn upsert_query(&self, record: &UpsertRecord) -> QueryBuilder<'static, Sqlite> {
        let mut names: Vec<&'static str> = Vec::new();
        let mut values: Vec<FieldValue> = Vec::new();
        for field in self.schema.value_fields() {
            let Some(raw) = record.fields.get(field.name) else {
                continue;
            };
            match self.schema.coerce(field.name, raw) {
                Some(value) => {
                    names.push(field.name);
                    values.push(value);
                }
                None => {
                    tracing::debug!(field = field.name, value = %raw, "omitting value that failed coercion")
                }
            }
        }
        if tracing::enabled!(tracing::Level::TRACE) {
            for name in record.fields.keys() {
                if !self.schema.is_value_field(name) {
                    tracing::trace!(field = %name, "omitting unknown field");
                }
            }
        }

        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("INSERT INTO {TABLE_NAME} ({DEVICE_FIELD}, {TIMESTAMP_FIELD}"));
        for name in &names {
            builder.push(", ").push(*name);
        }
        builder.push(") VALUES (");
        {
            let mut separated = builder.separated(", ");
            separated.push_bind(record.device_id.trim().to_string());
            separated.push_bind(record.timestamp);
            for value in values {
                match value {
                    FieldValue::Null => separated.push_bind(None::<f64>),
                    FieldValue::Text(text) => separated.push_bind(text),
                    FieldValue::Integer(n) => separated.push_bind(n),
                    FieldValue::Real(n) => separated.push_bind(n),
                };
            }
        }
        builder.push(format!(
            ") ON CONFLICT({DEVICE_FIELD}, {TIMESTAMP_FIELD}) "
        ));
        if names.is_empty() {
            builder.push("DO NOTHING");
        } else {
            let updates: Vec<String> = names
                .iter()
                .map(|name| format!("{name} = excluded.{name}"))
                .collect();
            builder.push("DO UPDATE SET ").push(updates.join(", "));
        }
        builder
    }

    fn decode_row(&self, row: &SqliteRow) -> Result<PersistedRecord, StoreError> {
        let device_id = row.try_get::<String, _>(DEVICE_FIELD)?;
        let timestamp = row.try_get::<i64, _>(TIMESTAMP_FIELD)?;
        let mut fields = Map::new();
        for field in self.schema.value_fields() {
            let value = match field.field_type {
                FieldType::Real => row
                    .try_get::<Option<f64>, _>(field.name)?
                    .map(FieldValue::Real),
                FieldType::Integer => row
                    .try_get::<Option<i64>, _>(field.name)?
                    .map(FieldValue::Integer),
                FieldType::Text => row
                    .try_get::<Option<String>, _>(field.name)?
                    .map(FieldValue::Text),
            };
            fields.insert(
                field.name.to_string(),
                value.unwrap_or(FieldValue::Null).into(),
            );
        }
        Ok(PersistedRecord {
            device_id,
            timestamp,
            fields,
        })
    }

    async fn bounded<T, F>(&self, operation: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        match tokio::time::timeout(self.timeout, operation).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.timeout)),
        }
    }
}

#[cfg(test)]
pub(crate) async fn memory_store() -> Store {
    let pool = build_pool("sqlite::memory:", 1).await.expect("pool");
    let store = Store::new(
        pool,
        Arc::new(SchemaRegistry::vessel()),
        Duration::from_secs(5),
    );
    store.migrate().await.expect("migrate");
    store
}
