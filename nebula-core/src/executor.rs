use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

use crate::collection::Collection;
use crate::config::DatabaseConfig;
use crate::dialect::{self, DEFAULT_SCHEMA};
use crate::error::{NebulaError, NebulaResult};
use crate::model::EntityType;
use crate::query::QueryBuilder;
use crate::value::{Record, Value, bind_value, decode_row};

#[cfg(feature = "metrics")]
fn record_query_metrics(operation: &str, table: &str, elapsed: Duration) {
    let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
    let labels = [
        ("operation", operation.to_owned()),
        ("table", table.to_owned()),
    ];
    metrics::histogram!("nebula.query.duration_ms", &labels).record(elapsed_ms);
    metrics::counter!("nebula.query.count", &labels).increment(1);
}

#[cfg(not(feature = "metrics"))]
fn record_query_metrics(_operation: &str, _table: &str, _elapsed: Duration) {}

/// A statement captured by the query log.
#[derive(Debug, Clone, PartialEq)]
pub struct LoggedQuery {
    pub sql: String,
    pub params: Vec<Value>,
}

#[derive(Debug, Default)]
struct QueryLog {
    enabled: AtomicBool,
    entries: Mutex<Vec<LoggedQuery>>,
}

/// Connection handle threaded through every query, model and relation call.
///
/// Cloning is cheap: clones share the pool, the query log and the primary key
/// cache.
#[derive(Debug, Clone)]
pub struct Executor {
    pool: SqlitePool,
    schema: Arc<str>,
    log: Arc<QueryLog>,
    primary_keys: Arc<Mutex<HashMap<String, Option<String>>>>,
}

impl Executor {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            schema: Arc::from(DEFAULT_SCHEMA),
            log: Arc::default(),
            primary_keys: Arc::default(),
        }
    }

    /// Qualifies tables with `schema` instead of `main`.
    pub fn with_schema(mut self, schema: &str) -> Self {
        self.schema = Arc::from(schema);
        self
    }

    /// Opens a pool from `config`, creating the database file when missing.
    pub async fn connect(config: &DatabaseConfig) -> NebulaResult<Self> {
        let options = SqliteConnectOptions::from_str(&config.url)
            .map_err(|err| NebulaError::driver(&config.url, err))?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await
            .map_err(|err| NebulaError::driver(&config.url, err))?;

        let executor = Self::new(pool).with_schema(&config.schema);
        if config.log_queries {
            executor.enable_query_log();
        }
        Ok(executor)
    }

    /// A private in-memory database on a single long-lived connection.
    pub async fn in_memory() -> NebulaResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None::<Duration>)
            .max_lifetime(None::<Duration>)
            .connect("sqlite::memory:")
            .await
            .map_err(|err| NebulaError::driver("sqlite::memory:", err))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// Starts a query chain over a plain table. Rows come back as [`Record`]s.
    pub fn table(&self, table: &str) -> QueryBuilder<Record> {
        QueryBuilder::new(self.clone(), &self.schema, table, None)
    }

    pub(crate) fn entity_query(&self, ty: EntityType) -> QueryBuilder<crate::model::Entity> {
        let schema = ty.schema().unwrap_or(self.schema());
        QueryBuilder::for_entity(self.clone(), schema, ty)
    }

    /// Runs a hand-written statement with positional parameters.
    #[tracing::instrument(skip(self, params))]
    pub async fn raw(&self, sql: &str, params: Vec<Value>) -> NebulaResult<Collection<Record>> {
        let rows = self.fetch_all("raw", "", sql, params).await?;
        Ok(Collection::from(rows))
    }

    /// Runs one or more `;` separated statements without parameters.
    pub async fn execute_script(&self, sql: &str) -> NebulaResult<u64> {
        self.trace("script", "", sql, &[]);
        let start = Instant::now();
        let result = sqlx::Executor::execute(&self.pool, sql)
            .await
            .map_err(|err| self.failure("script", sql, err))?;
        record_query_metrics("script", "", start.elapsed());
        Ok(result.rows_affected())
    }

    pub fn enable_query_log(&self) {
        self.log.enabled.store(true, Ordering::SeqCst);
    }

    pub fn disable_query_log(&self) {
        self.log.enabled.store(false, Ordering::SeqCst);
    }

    /// Statements recorded since the log was enabled or last flushed.
    pub fn query_log(&self) -> Vec<LoggedQuery> {
        self.log
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn flush_query_log(&self) {
        self.log
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub(crate) async fn fetch_all(
        &self,
        operation: &'static str,
        table: &str,
        sql: &str,
        params: Vec<Value>,
    ) -> NebulaResult<Vec<Record>> {
        self.trace(operation, table, sql, &params);
        let start = Instant::now();
        let query = params.into_iter().fold(sqlx::query(sql), bind_value);
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|err| self.failure(operation, sql, err))?;
        record_query_metrics(operation, table, start.elapsed());

        rows.iter()
            .map(decode_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| self.failure(operation, sql, err))
    }

    pub(crate) async fn fetch_optional(
        &self,
        operation: &'static str,
        table: &str,
        sql: &str,
        params: Vec<Value>,
    ) -> NebulaResult<Option<Record>> {
        self.trace(operation, table, sql, &params);
        let start = Instant::now();
        let query = params.into_iter().fold(sqlx::query(sql), bind_value);
        let row = query
            .fetch_optional(&self.pool)
            .await
            .map_err(|err| self.failure(operation, sql, err))?;
        record_query_metrics(operation, table, start.elapsed());

        row.as_ref()
            .map(decode_row)
            .transpose()
            .map_err(|err| self.failure(operation, sql, err))
    }

    /// Runs a statement and returns the number of affected rows.
    pub(crate) async fn execute(
        &self,
        operation: &'static str,
        table: &str,
        sql: &str,
        params: Vec<Value>,
    ) -> NebulaResult<u64> {
        self.trace(operation, table, sql, &params);
        let start = Instant::now();
        let query = params.into_iter().fold(sqlx::query(sql), bind_value);
        let result = query
            .execute(&self.pool)
            .await
            .map_err(|err| self.failure(operation, sql, err))?;
        record_query_metrics(operation, table, start.elapsed());
        Ok(result.rows_affected())
    }

    /// Single-column primary key of `schema.table`, read from the table info
    /// pragma and cached. Composite or missing keys yield `None`.
    pub(crate) async fn primary_key_of(
        &self,
        schema: &str,
        table: &str,
    ) -> NebulaResult<Option<String>> {
        let cache_key = dialect::qualified(schema, table);
        if let Some(hit) = self
            .primary_keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&cache_key)
        {
            return Ok(hit.clone());
        }

        let sql = "SELECT name FROM pragma_table_info(?, ?) WHERE pk > 0 ORDER BY pk";
        let columns: Vec<String> = sqlx::query_scalar(sql)
            .bind(table)
            .bind(schema)
            .fetch_all(&self.pool)
            .await
            .map_err(|err| self.failure("introspect", sql, err))?;
        let key = match columns.as_slice() {
            [single] => Some(single.clone()),
            _ => None,
        };

        self.primary_keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(cache_key, key.clone());
        Ok(key)
    }

    fn trace(&self, operation: &'static str, table: &str, sql: &str, params: &[Value]) {
        tracing::debug!(
            operation,
            table,
            sql = %sql,
            params = %format_params(params),
            "nebula query"
        );
        if self.log.enabled.load(Ordering::SeqCst) {
            self.log
                .entries
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(LoggedQuery {
                    sql: sql.to_owned(),
                    params: params.to_vec(),
                });
        }
    }

    fn failure(&self, operation: &'static str, sql: &str, err: sqlx::Error) -> NebulaError {
        tracing::error!(operation, sql = %sql, error = %err, "nebula query failed");
        NebulaError::driver(sql, err)
    }
}

fn format_params(params: &[Value]) -> String {
    let mut out = String::from("[");
    for (i, value) in params.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        match value {
            Value::String(v) => {
                out.push('\'');
                out.push_str(v);
                out.push('\'');
            }
            other => out.push_str(&other.to_string()),
        }
    }
    out.push(']');
    out
}
