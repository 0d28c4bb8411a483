//! Legacy connector contracts, engine implementations, record mappers and the
//! per-job-type adapter registry.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use lsync_core::{
    AuthorityOverrides, CanonicalRecord, ExternalKey, FieldAuthority, LegacyRow, SyncJobType, SyncScope,
};
use lsync_storage::{classify_sqlx_error, RetryDisposition};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use sqlx::mysql::{MySql, MySqlArguments, MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions, Postgres};
use sqlx::query::Query;
use sqlx::{Column, Decode, Row, Type, TypeInfo};
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "lsync-adapters";

#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("legacy source `{source_id}` unavailable: {message}")]
    Unavailable { source_id: String, message: String },
    #[error("query on legacy source `{source_id}` failed: {message}")]
    Query { source_id: String, message: String },
    #[error("invalid cursor `{0}`")]
    InvalidCursor(String),
    #[error("fixture {path}: {message}")]
    Fixture { path: String, message: String },
}

impl ConnectorError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            ConnectorError::Unavailable { .. } => RetryDisposition::Retryable,
            _ => RetryDisposition::NonRetryable,
        }
    }

    fn from_sqlx(source_id: &str, err: sqlx::Error) -> Self {
        match classify_sqlx_error(&err) {
            RetryDisposition::Retryable => ConnectorError::Unavailable {
                source_id: source_id.to_string(),
                message: err.to_string(),
            },
            RetryDisposition::NonRetryable => ConnectorError::Query {
                source_id: source_id.to_string(),
                message: err.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MappingError {
    #[error("row has no id column (tried {})", .0.join(", "))]
    MissingId(Vec<String>),
    #[error("field `{field}` from column `{column}`: cannot read {value} as {kind}")]
    InvalidValue {
        field: String,
        column: String,
        kind: FieldKind,
        value: String,
    },
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("job type {0} is not configured")]
    NotConfigured(SyncJobType),
    #[error("unknown legacy source `{0}`")]
    UnknownSource(String),
    #[error("unsupported engine `{0}`: no driver in this build")]
    UnsupportedEngine(LegacyEngine),
    #[error("invalid adapter configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Opaque resume position handed back by a connector.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cursor(String);

impl Cursor {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn from_offset(offset: u64) -> Self {
        Self(offset.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn offset(&self) -> Result<u64, ConnectorError> {
        self.0
            .parse()
            .map_err(|_| ConnectorError::InvalidCursor(self.0.clone()))
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Restricts a fetch to explicit record ids or to rows modified since a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchFilter {
    pub entity_ids: Option<Vec<String>>,
    pub modified_since: Option<DateTime<Utc>>,
}

impl FetchFilter {
    /// `Incremental` scopes must already carry a resolved `since`; without one the window is unbounded.
    pub fn for_scope(scope: &SyncScope) -> Self {
        match scope {
            SyncScope::Full => Self::default(),
            SyncScope::Incremental { since } => Self {
                entity_ids: None,
                modified_since: *since,
            },
            SyncScope::Subset { entity_ids } => Self {
                entity_ids: Some(entity_ids.clone()),
                modified_since: None,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchedBatch {
    pub rows: Vec<LegacyRow>,
    pub next_cursor: Option<Cursor>,
    pub exhausted: bool,
}

/// Read-only access to one legacy data source.
#[async_trait]
pub trait LegacyConnector: Send + Sync {
    fn source_id(&self) -> &str;

    async fn fetch(
        &self,
        cursor: Option<&Cursor>,
        batch_size: u32,
        filter: &FetchFilter,
    ) -> Result<FetchedBatch, ConnectorError>;

    /// Total rows matching `filter`, when the engine can tell cheaply.
    async fn count(&self, _filter: &FetchFilter) -> Result<Option<u64>, ConnectorError> {
        Ok(None)
    }

    async fn close(&self) {}
}

/// Render a legacy id value the way external keys store it.
pub fn value_to_key(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
    #[default]
    Int,
    Text,
}

/// Where a job type's rows live inside a legacy source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSpec {
    pub table: String,
    pub key_column: String,
    #[serde(default)]
    pub key_type: KeyType,
    #[serde(default)]
    pub modified_column: Option<String>,
}

impl TableSpec {
    pub fn new(table: &str, key_column: &str, modified_column: Option<&str>) -> Self {
        Self {
            table: table.to_string(),
            key_column: key_column.to_string(),
            key_type: KeyType::Int,
            modified_column: modified_column.map(str::to_string),
        }
    }

    fn validate(&self) -> Result<(), AdapterError> {
        let columns = [Some(&self.table), Some(&self.key_column), self.modified_column.as_ref()];
        for ident in columns.into_iter().flatten() {
            if !is_safe_identifier(ident) {
                return Err(AdapterError::Config(format!("`{ident}` is not a plain SQL identifier")));
            }
        }
        Ok(())
    }
}

fn is_safe_identifier(ident: &str) -> bool {
    !ident.is_empty()
        && ident
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}

fn row_matches(row: &JsonMap<String, JsonValue>, spec: &TableSpec, filter: &FetchFilter) -> bool {
    if let Some(ids) = &filter.entity_ids {
        let Some(id) = row.get(&spec.key_column).and_then(value_to_key) else {
            return false;
        };
        if !ids.iter().any(|wanted| wanted == &id) {
            return false;
        }
    }
    if let (Some(since), Some(column)) = (filter.modified_since, &spec.modified_column) {
        let modified = row
            .get(column)
            .and_then(|v| v.as_str())
            .and_then(|s| parse_legacy_datetime(s).ok().flatten());
        match modified {
            Some(at) if at >= since => {}
            _ => return false,
        }
    }
    true
}

fn page_rows(
    source_id: &str,
    rows: &[JsonMap<String, JsonValue>],
    spec: &TableSpec,
    cursor: Option<&Cursor>,
    batch_size: u32,
    filter: &FetchFilter,
) -> Result<FetchedBatch, ConnectorError> {
    let offset = cursor.map(Cursor::offset).transpose()?.unwrap_or(0) as usize;
    let matching = rows
        .iter()
        .filter(|row| row_matches(row, spec, filter))
        .collect::<Vec<_>>();
    let page = matching
        .iter()
        .skip(offset)
        .take(batch_size.max(1) as usize)
        .map(|values| LegacyRow::new(source_id, (*values).clone()))
        .collect::<Vec<_>>();
    let next = offset + page.len();
    Ok(FetchedBatch {
        rows: page,
        next_cursor: Some(Cursor::from_offset(next as u64)),
        exhausted: next >= matching.len(),
    })
}

/// In-process rows with offset cursors.
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    source_id: String,
    spec: TableSpec,
    rows: Vec<JsonMap<String, JsonValue>>,
}

impl MemoryConnector {
    pub fn new(source_id: impl Into<String>, spec: TableSpec, rows: Vec<JsonMap<String, JsonValue>>) -> Self {
        Self {
            source_id: source_id.into(),
            spec,
            rows,
        }
    }
}

#[async_trait]
impl LegacyConnector for MemoryConnector {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch(
        &self,
        cursor: Option<&Cursor>,
        batch_size: u32,
        filter: &FetchFilter,
    ) -> Result<FetchedBatch, ConnectorError> {
        page_rows(&self.source_id, &self.rows, &self.spec, cursor, batch_size, filter)
    }

    async fn count(&self, filter: &FetchFilter) -> Result<Option<u64>, ConnectorError> {
        let total = self
            .rows
            .iter()
            .filter(|row| row_matches(row, &self.spec, filter))
            .count();
        Ok(Some(total as u64))
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FixtureFile {
    Rows(Vec<JsonMap<String, JsonValue>>),
    Wrapped { rows: Vec<JsonMap<String, JsonValue>> },
}

async fn read_fixture_rows(path: &Path) -> Result<Vec<JsonMap<String, JsonValue>>> {
    let data = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let file: FixtureFile =
        serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
    Ok(match file {
        FixtureFile::Rows(rows) | FixtureFile::Wrapped { rows } => rows,
    })
}

/// JSON file of legacy rows, loaded on first use. Used for development and tests.
#[derive(Debug)]
pub struct FixtureConnector {
    source_id: String,
    spec: TableSpec,
    path: PathBuf,
    rows: OnceCell<Vec<JsonMap<String, JsonValue>>>,
}

impl FixtureConnector {
    pub fn new(source_id: impl Into<String>, spec: TableSpec, path: impl Into<PathBuf>) -> Self {
        Self {
            source_id: source_id.into(),
            spec,
            path: path.into(),
            rows: OnceCell::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn rows(&self) -> Result<&[JsonMap<String, JsonValue>], ConnectorError> {
        let rows = self
            .rows
            .get_or_try_init(|| async {
                read_fixture_rows(&self.path)
                    .await
                    .map_err(|err| ConnectorError::Fixture {
                        path: self.path.display().to_string(),
                        message: format!("{err:#}"),
                    })
            })
            .await?;
        Ok(rows.as_slice())
    }
}

#[async_trait]
impl LegacyConnector for FixtureConnector {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch(
        &self,
        cursor: Option<&Cursor>,
        batch_size: u32,
        filter: &FetchFilter,
    ) -> Result<FetchedBatch, ConnectorError> {
        let rows = self.rows().await?;
        page_rows(&self.source_id, rows, &self.spec, cursor, batch_size, filter)
    }

    async fn count(&self, filter: &FetchFilter) -> Result<Option<u64>, ConnectorError> {
        let rows = self.rows().await?;
        let total = rows
            .iter()
            .filter(|row| row_matches(row, &self.spec, filter))
            .count();
        Ok(Some(total as u64))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlEngine {
    Postgres,
    MySql,
}

enum SqlPool {
    Postgres(PgPool),
    MySql(MySqlPool),
}

#[derive(Debug, Clone)]
enum SqlParam {
    Int(i64),
    Text(String),
    Time(NaiveDateTime),
}

impl KeyType {
    fn param(&self, raw: &str) -> Option<SqlParam> {
        match self {
            KeyType::Int => raw.trim().parse().ok().map(SqlParam::Int),
            KeyType::Text => Some(SqlParam::Text(raw.to_string())),
        }
    }
}

fn bind_pg(query: Query<'_, Postgres, PgArguments>, param: SqlParam) -> Query<'_, Postgres, PgArguments> {
    match param {
        SqlParam::Int(v) => query.bind(v),
        SqlParam::Text(v) => query.bind(v),
        SqlParam::Time(v) => query.bind(v),
    }
}

fn bind_mysql(query: Query<'_, MySql, MySqlArguments>, param: SqlParam) -> Query<'_, MySql, MySqlArguments> {
    match param {
        SqlParam::Int(v) => query.bind(v),
        SqlParam::Text(v) => query.bind(v),
        SqlParam::Time(v) => query.bind(v),
    }
}

/// MySQL or Postgres table read with keyset pagination on the key column.
/// The pool is opened on first fetch and released by `close`.
pub struct SqlConnector {
    source_id: String,
    engine: SqlEngine,
    url: String,
    spec: TableSpec,
    pool: OnceCell<SqlPool>,
}

impl SqlConnector {
    pub fn new(
        source_id: impl Into<String>,
        engine: SqlEngine,
        url: impl Into<String>,
        spec: TableSpec,
    ) -> Result<Self, AdapterError> {
        spec.validate()?;
        Ok(Self {
            source_id: source_id.into(),
            engine,
            url: url.into(),
            spec,
            pool: OnceCell::new(),
        })
    }

    async fn pool(&self) -> Result<&SqlPool, ConnectorError> {
        self.pool
            .get_or_try_init(|| async {
                info!(source_id = %self.source_id, engine = ?self.engine, "opening legacy connection pool");
                let pool = match self.engine {
                    SqlEngine::Postgres => PgPoolOptions::new()
                        .max_connections(2)
                        .acquire_timeout(Duration::from_secs(15))
                        .connect(&self.url)
                        .await
                        .map(SqlPool::Postgres),
                    SqlEngine::MySql => MySqlPoolOptions::new()
                        .max_connections(2)
                        .acquire_timeout(Duration::from_secs(15))
                        .connect(&self.url)
                        .await
                        .map(SqlPool::MySql),
                };
                pool.map_err(|err| ConnectorError::Unavailable {
                    source_id: self.source_id.clone(),
                    message: err.to_string(),
                })
            })
            .await
    }

    fn where_clause(&self, engine: SqlEngine, after: Option<SqlParam>, filter: &FetchFilter) -> (String, Vec<SqlParam>) {
        let mut clauses = Vec::new();
        let mut params = Vec::new();
        let placeholder = |params: &mut Vec<SqlParam>, param: SqlParam| {
            params.push(param);
            match engine {
                SqlEngine::Postgres => format!("${}", params.len()),
                SqlEngine::MySql => "?".to_string(),
            }
        };

        if let Some(after) = after {
            let ph = placeholder(&mut params, after);
            clauses.push(format!("{} > {ph}", self.spec.key_column));
        }
        match (filter.modified_since, &self.spec.modified_column) {
            (Some(since), Some(column)) => {
                let ph = placeholder(&mut params, SqlParam::Time(since.naive_utc()));
                clauses.push(format!("{column} >= {ph}"));
            }
            (Some(_), None) => {
                debug!(source_id = %self.source_id, table = %self.spec.table, "no modified column; incremental window ignored");
            }
            _ => {}
        }
        if let Some(ids) = &filter.entity_ids {
            let mut holders = Vec::new();
            for id in ids {
                match self.spec.key_type.param(id) {
                    Some(param) => holders.push(placeholder(&mut params, param)),
                    None => warn!(source_id = %self.source_id, id = %id, "entity id does not match key type; skipped"),
                }
            }
            if holders.is_empty() {
                clauses.push("1 = 0".to_string());
            } else {
                clauses.push(format!("{} IN ({})", self.spec.key_column, holders.join(", ")));
            }
        }

        let sql = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };
        (sql, params)
    }

    /// Rows without a key stay in the batch so the mapper can flag them; the
    /// cursor advances to the last keyed row. A full page of keyless rows
    /// cannot be paged past and ends the read.
    fn to_batch(&self, rows: Vec<LegacyRow>, batch_size: u32) -> FetchedBatch {
        let key_column = &self.spec.key_column;
        let next_cursor = rows
            .iter()
            .rev()
            .find_map(|row| row.get(key_column).and_then(value_to_key))
            .map(Cursor::new);
        let keyless = rows
            .iter()
            .filter(|row| row.get(key_column).and_then(value_to_key).is_none())
            .count();
        if keyless > 0 {
            warn!(source_id = %self.source_id, key_column = %key_column, keyless, "legacy rows without key column");
        }
        let mut exhausted = rows.len() < batch_size.max(1) as usize;
        if next_cursor.is_none() && !rows.is_empty() && !exhausted {
            warn!(source_id = %self.source_id, "batch has no keyed row; ending keyset read");
            exhausted = true;
        }
        FetchedBatch {
            rows,
            next_cursor,
            exhausted,
        }
    }
}

/// A non-object `to_jsonb` value becomes an empty row, which the mapper
/// reports as a record error instead of failing the whole page.
fn pg_row_values(source_id: &str, value: JsonValue) -> LegacyRow {
    match value {
        JsonValue::Object(values) => LegacyRow::new(source_id, values),
        other => {
            warn!(source_id = %source_id, value = %other, "expected a row object");
            LegacyRow::new(source_id, JsonMap::new())
        }
    }
}

/// `None` when the column cannot be decoded as `T`, `Some(None)` for SQL NULL.
fn decoded<'r, T>(row: &'r MySqlRow, idx: usize) -> Option<Option<T>>
where
    T: Decode<'r, MySql> + Type<MySql>,
{
    row.try_get::<Option<T>, _>(idx).ok()
}

/// Undecodable values (MySQL zero-dates among them) surface as JSON null.
fn decode_mysql_value(row: &MySqlRow, idx: usize, type_name: &str) -> JsonValue {
    let unsigned = type_name.ends_with("UNSIGNED");
    let base = type_name.trim_end_matches(" UNSIGNED");
    let value = match base {
        "BOOLEAN" | "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" | "YEAR" => {
            if unsigned {
                decoded::<u64>(row, idx).flatten().map(JsonValue::from)
            } else {
                decoded::<i64>(row, idx).flatten().map(JsonValue::from)
            }
        }
        "FLOAT" | "DOUBLE" => decoded::<f64>(row, idx).flatten().map(JsonValue::from),
        "DATETIME" | "TIMESTAMP" => decoded::<NaiveDateTime>(row, idx)
            .flatten()
            .map(|v| JsonValue::from(v.format("%Y-%m-%d %H:%M:%S").to_string())),
        "DATE" => decoded::<NaiveDate>(row, idx)
            .flatten()
            .map(|v| JsonValue::from(v.format("%Y-%m-%d").to_string())),
        "JSON" => decoded::<JsonValue>(row, idx).flatten(),
        _ => decoded::<String>(row, idx)
            .map(|v| v.map(JsonValue::from))
            .or_else(|| {
                decoded::<Vec<u8>>(row, idx)
                    .map(|v| v.map(|bytes| JsonValue::from(String::from_utf8_lossy(&bytes).into_owned())))
            })
            .flatten(),
    };
    value.unwrap_or(JsonValue::Null)
}

fn decode_mysql_row(source_id: &str, row: &MySqlRow) -> LegacyRow {
    let mut values = JsonMap::new();
    for (idx, column) in row.columns().iter().enumerate() {
        let type_name = column.type_info().name().to_ascii_uppercase();
        values.insert(column.name().to_string(), decode_mysql_value(row, idx, &type_name));
    }
    LegacyRow::new(source_id, values)
}

#[async_trait]
impl LegacyConnector for SqlConnector {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch(
        &self,
        cursor: Option<&Cursor>,
        batch_size: u32,
        filter: &FetchFilter,
    ) -> Result<FetchedBatch, ConnectorError> {
        let after = cursor
            .map(|c| {
                self.spec
                    .key_type
                    .param(c.as_str())
                    .ok_or_else(|| ConnectorError::InvalidCursor(c.to_string()))
            })
            .transpose()?;
        let limit = i64::from(batch_size.max(1));
        let table = &self.spec.table;
        let key = &self.spec.key_column;

        let rows = match self.pool().await? {
            SqlPool::Postgres(pool) => {
                let (where_sql, params) = self.where_clause(SqlEngine::Postgres, after, filter);
                let sql = format!(
                    "SELECT to_jsonb(t) AS row FROM (SELECT * FROM {table}{where_sql} ORDER BY {key} ASC LIMIT ${}) t ORDER BY t.{key} ASC",
                    params.len() + 1
                );
                let mut query = sqlx::query(&sql);
                for param in params {
                    query = bind_pg(query, param);
                }
                let fetched = query
                    .bind(limit)
                    .fetch_all(pool)
                    .await
                    .map_err(|err| ConnectorError::from_sqlx(&self.source_id, err))?;
                fetched
                    .iter()
                    .map(|row| {
                        let value: JsonValue = row
                            .try_get("row")
                            .map_err(|err| ConnectorError::from_sqlx(&self.source_id, err))?;
                        Ok(pg_row_values(&self.source_id, value))
                    })
                    .collect::<Result<Vec<_>, ConnectorError>>()?
            }
            SqlPool::MySql(pool) => {
                let (where_sql, params) = self.where_clause(SqlEngine::MySql, after, filter);
                let sql = format!("SELECT * FROM {table}{where_sql} ORDER BY {key} ASC LIMIT ?");
                let mut query = sqlx::query(&sql);
                for param in params {
                    query = bind_mysql(query, param);
                }
                let fetched = query
                    .bind(limit)
                    .fetch_all(pool)
                    .await
                    .map_err(|err| ConnectorError::from_sqlx(&self.source_id, err))?;
                fetched
                    .iter()
                    .map(|row| decode_mysql_row(&self.source_id, row))
                    .collect()
            }
        };

        debug!(source_id = %self.source_id, table = %table, rows = rows.len(), "fetched legacy batch");
        Ok(self.to_batch(rows, batch_size))
    }

    async fn count(&self, filter: &FetchFilter) -> Result<Option<u64>, ConnectorError> {
        let table = &self.spec.table;
        let total: i64 = match self.pool().await? {
            SqlPool::Postgres(pool) => {
                let (where_sql, params) = self.where_clause(SqlEngine::Postgres, None, filter);
                let sql = format!("SELECT COUNT(*) AS total FROM {table}{where_sql}");
                let mut query = sqlx::query(&sql);
                for param in params {
                    query = bind_pg(query, param);
                }
                query
                    .fetch_one(pool)
                    .await
                    .and_then(|row| row.try_get("total"))
                    .map_err(|err| ConnectorError::from_sqlx(&self.source_id, err))?
            }
            SqlPool::MySql(pool) => {
                let (where_sql, params) = self.where_clause(SqlEngine::MySql, None, filter);
                let sql = format!("SELECT COUNT(*) AS total FROM {table}{where_sql}");
                let mut query = sqlx::query(&sql);
                for param in params {
                    query = bind_mysql(query, param);
                }
                query
                    .fetch_one(pool)
                    .await
                    .and_then(|row| row.try_get("total"))
                    .map_err(|err| ConnectorError::from_sqlx(&self.source_id, err))?
            }
        };
        Ok(Some(u64::try_from(total).unwrap_or(0)))
    }

    async fn close(&self) {
        match self.pool.get() {
            Some(SqlPool::Postgres(pool)) => pool.close().await,
            Some(SqlPool::MySql(pool)) => pool.close().await,
            None => {}
        }
    }
}

/// Drains several sources in order. Cursor format is `{source index}|{inner cursor}`.
pub struct ChainedConnector {
    id: String,
    connectors: Vec<Box<dyn LegacyConnector>>,
}

impl ChainedConnector {
    pub fn new(connectors: Vec<Box<dyn LegacyConnector>>) -> Self {
        let id = connectors
            .iter()
            .map(|c| c.source_id())
            .collect::<Vec<_>>()
            .join("+");
        Self { id, connectors }
    }

    fn split_cursor(cursor: Option<&Cursor>) -> Result<(usize, Option<Cursor>), ConnectorError> {
        let Some(cursor) = cursor else {
            return Ok((0, None));
        };
        let (index, inner) = cursor
            .as_str()
            .split_once('|')
            .ok_or_else(|| ConnectorError::InvalidCursor(cursor.to_string()))?;
        let index = index
            .parse()
            .map_err(|_| ConnectorError::InvalidCursor(cursor.to_string()))?;
        let inner = (!inner.is_empty()).then(|| Cursor::new(inner));
        Ok((index, inner))
    }
}

#[async_trait]
impl LegacyConnector for ChainedConnector {
    fn source_id(&self) -> &str {
        &self.id
    }

    async fn fetch(
        &self,
        cursor: Option<&Cursor>,
        batch_size: u32,
        filter: &FetchFilter,
    ) -> Result<FetchedBatch, ConnectorError> {
        let (index, inner) = Self::split_cursor(cursor)?;
        let Some(connector) = self.connectors.get(index) else {
            return Ok(FetchedBatch {
                rows: Vec::new(),
                next_cursor: None,
                exhausted: true,
            });
        };
        let batch = connector.fetch(inner.as_ref(), batch_size, filter).await?;
        let last_source = index + 1 >= self.connectors.len();
        let (next_cursor, exhausted) = if batch.exhausted {
            if last_source {
                (None, true)
            } else {
                (Some(Cursor::new(format!("{}|", index + 1))), false)
            }
        } else {
            let inner_next = batch.next_cursor.as_ref().map(Cursor::as_str).unwrap_or("");
            (Some(Cursor::new(format!("{index}|{inner_next}"))), false)
        };
        Ok(FetchedBatch {
            rows: batch.rows,
            next_cursor,
            exhausted,
        })
    }

    async fn count(&self, filter: &FetchFilter) -> Result<Option<u64>, ConnectorError> {
        let mut total = 0;
        for connector in &self.connectors {
            match connector.count(filter).await? {
                Some(n) => total += n,
                None => return Ok(None),
            }
        }
        Ok(Some(total))
    }

    async fn close(&self) {
        for connector in &self.connectors {
            connector.close().await;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Text,
    Int,
    Float,
    Bool,
    Datetime,
    Date,
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldKind::Text => "text",
            FieldKind::Int => "int",
            FieldKind::Float => "float",
            FieldKind::Bool => "bool",
            FieldKind::Datetime => "datetime",
            FieldKind::Date => "date",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldRule {
    pub field: String,
    /// Fallback order; the first non-null column wins.
    pub columns: Vec<String>,
    pub kind: FieldKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMapping {
    pub id_columns: Vec<String>,
    #[serde(default)]
    pub modified_column: Option<String>,
    pub fields: Vec<FieldRule>,
}

/// Pure legacy-row to canonical-record conversion.
pub trait RecordMapper: Send + Sync {
    fn map(&self, row: &LegacyRow) -> Result<CanonicalRecord, MappingError>;

    /// Best-effort id for audit rows when `map` fails.
    fn record_id(&self, row: &LegacyRow) -> Option<String>;
}

/// Accepts `YYYY-MM-DD`, `YYYY-MM-DD HH:MM:SS[.f]`, ISO-8601 with or without offset.
/// Zero-dates, blanks and years outside 1900..=2100 read as absent.
pub fn parse_legacy_datetime(raw: &str) -> Result<Option<DateTime<Utc>>, ()> {
    let raw = raw.trim();
    if raw.is_empty() || raw.starts_with("0000-00-00") {
        return Ok(None);
    }
    let parsed = DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f").map(|dt| dt.and_utc()))
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f").map(|dt| dt.and_utc()))
        .or_else(|_| {
            NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .map(|d| d.and_hms_opt(0, 0, 0).unwrap_or_default().and_utc())
        })
        .map_err(|_| ())?;
    if !(1900..=2100).contains(&parsed.year()) {
        return Ok(None);
    }
    Ok(Some(parsed))
}

fn coerce(kind: FieldKind, value: &JsonValue) -> Result<JsonValue, ()> {
    match (kind, value) {
        (_, JsonValue::Null) => Ok(JsonValue::Null),
        (FieldKind::Text, JsonValue::String(s)) if s.trim().is_empty() => Ok(JsonValue::Null),
        (FieldKind::Text, JsonValue::String(_)) => Ok(value.clone()),
        (FieldKind::Text, JsonValue::Number(n)) => Ok(JsonValue::from(n.to_string())),
        (FieldKind::Text, JsonValue::Bool(b)) => Ok(JsonValue::from(b.to_string())),
        (FieldKind::Int, JsonValue::Number(n)) => match (n.as_i64(), n.as_f64()) {
            (Some(v), _) => Ok(JsonValue::from(v)),
            (None, Some(f)) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => Ok(JsonValue::from(f as i64)),
            _ => Err(()),
        },
        (FieldKind::Int, JsonValue::String(s)) => {
            let s = s.trim();
            if s.is_empty() {
                return Ok(JsonValue::Null);
            }
            match s.parse::<i64>() {
                Ok(v) => Ok(JsonValue::from(v)),
                Err(_) => match s.parse::<f64>() {
                    Ok(f) if f.fract() == 0.0 => Ok(JsonValue::from(f as i64)),
                    _ => Err(()),
                },
            }
        }
        (FieldKind::Int, JsonValue::Bool(b)) => Ok(JsonValue::from(i64::from(*b))),
        (FieldKind::Float, JsonValue::Number(n)) => n.as_f64().map(JsonValue::from).ok_or(()),
        (FieldKind::Float, JsonValue::String(s)) => {
            let s = s.trim();
            if s.is_empty() {
                return Ok(JsonValue::Null);
            }
            s.parse::<f64>().map(JsonValue::from).map_err(|_| ())
        }
        (FieldKind::Bool, JsonValue::Bool(_)) => Ok(value.clone()),
        (FieldKind::Bool, JsonValue::Number(n)) => Ok(JsonValue::from(n.as_f64().map_or(false, |v| v != 0.0))),
        (FieldKind::Bool, JsonValue::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "y" => Ok(JsonValue::from(true)),
            "0" | "false" | "no" | "n" => Ok(JsonValue::from(false)),
            "" => Ok(JsonValue::Null),
            _ => Err(()),
        },
        (FieldKind::Datetime, JsonValue::String(s)) => parse_legacy_datetime(s)
            .map(|dt| dt.map_or(JsonValue::Null, |dt| JsonValue::from(dt.to_rfc3339_opts(SecondsFormat::Secs, true)))),
        (FieldKind::Date, JsonValue::String(s)) => parse_legacy_datetime(s).map(|dt| {
            dt.map_or(JsonValue::Null, |dt| {
                JsonValue::from(dt.date_naive().format("%Y-%m-%d").to_string())
            })
        }),
        _ => Err(()),
    }
}

/// Declarative mapper driven by a [`ColumnMapping`].
#[derive(Debug, Clone)]
pub struct ColumnMapper {
    job_type: SyncJobType,
    mapping: ColumnMapping,
}

impl ColumnMapper {
    pub fn new(job_type: SyncJobType, mapping: ColumnMapping) -> Self {
        Self { job_type, mapping }
    }

    pub fn builtin(job_type: SyncJobType) -> Self {
        Self::new(job_type, builtin_mapping(job_type))
    }

    pub fn mapping(&self) -> &ColumnMapping {
        &self.mapping
    }
}

impl RecordMapper for ColumnMapper {
    fn map(&self, row: &LegacyRow) -> Result<CanonicalRecord, MappingError> {
        let record_id = self
            .record_id(row)
            .ok_or_else(|| MappingError::MissingId(self.mapping.id_columns.clone()))?;

        let mut fields = BTreeMap::new();
        for rule in &self.mapping.fields {
            let found = rule.columns.iter().find_map(|column| {
                row.get(column)
                    .filter(|value| !matches!(value, JsonValue::String(s) if s.trim().is_empty()))
                    .map(|value| (column, value))
            });
            let value = match found {
                Some((column, raw)) => coerce(rule.kind, raw).map_err(|_| MappingError::InvalidValue {
                    field: rule.field.clone(),
                    column: column.clone(),
                    kind: rule.kind,
                    value: raw.to_string(),
                })?,
                None => JsonValue::Null,
            };
            fields.insert(rule.field.clone(), value);
        }

        let source_modified_at = self
            .mapping
            .modified_column
            .as_ref()
            .and_then(|column| row.get(column))
            .and_then(|value| value.as_str())
            .and_then(|raw| parse_legacy_datetime(raw).ok().flatten());

        Ok(CanonicalRecord {
            key: ExternalKey::new(self.job_type, row.source_id.clone(), record_id),
            fields,
            source_modified_at,
        })
    }

    fn record_id(&self, row: &LegacyRow) -> Option<String> {
        self.mapping
            .id_columns
            .iter()
            .find_map(|column| row.get(column).and_then(value_to_key))
    }
}

fn rule(field: &str, columns: &[&str], kind: FieldKind) -> FieldRule {
    FieldRule {
        field: field.to_string(),
        columns: columns.iter().map(|c| c.to_string()).collect(),
        kind,
    }
}

fn simple(field: &str, column: &str, kind: FieldKind) -> FieldRule {
    rule(field, &[column], kind)
}

pub fn builtin_table(job_type: SyncJobType) -> TableSpec {
    match job_type {
        SyncJobType::Vehicles => TableSpec::new("bus_vehicle", "id", None),
        SyncJobType::GpsPoints => TableSpec::new("gps_data", "id", Some("captured")),
        SyncJobType::Stops => TableSpec::new("unique_station_id_local", "unique_id", Some("changed")),
        SyncJobType::TimetableDates => TableSpec::new("timetable_dates", "id", Some("kad")),
        SyncJobType::TimetableSchedules => TableSpec::new("vremena_polaska", "id", None),
        SyncJobType::PriceVariations => TableSpec::new("price_variation", "id", None),
    }
}

pub fn builtin_mapping(job_type: SyncJobType) -> ColumnMapping {
    use FieldKind::*;

    match job_type {
        SyncJobType::Vehicles => ColumnMapping {
            id_columns: vec!["ID".into(), "id".into(), "BusVehicleID".into()],
            modified_column: None,
            fields: vec![
                rule("garageNumber", &["garage_no", "garazni_broj"], Text),
                rule("registrationNumber", &["bus_registration", "registracijski_broj"], Text),
                simple("vehicleNumber", "vehicle_number", Text),
                rule("vehicleType", &["vehicle_type", "tip"], Text),
                simple("vehicleBrand", "vehicle_brand", Text),
                rule("vehicleModel", &["vehicle_model", "model_vozila"], Text),
                simple("chassisNumber", "chassis_number", Text),
                simple("motorNumber", "motor_number", Text),
                simple("yearOfManufacture", "godina_proizvodnje", Date),
                simple("seatCapacity", "broj_sedecih", Int),
                simple("standingCapacity", "broj_stajacih", Int),
                simple("fuelType", "fuel_type", Text),
                simple("active", "active", Bool),
                simple("visible", "show_image_in_public", Bool),
                simple("wifi", "wifi", Bool),
                simple("airCondition", "aircondition", Bool),
                simple("videoSystem", "surveliance_camera", Bool),
                simple("imei", "imei", Text),
                simple("imeiNet", "imei_net", Text),
                simple("gpsModel", "gps_model", Text),
                simple("technicalControlFrom", "tech_control_from", Date),
                simple("technicalControlTo", "tech_control_to", Date),
                simple("registrationValidTo", "validate_to", Date),
                simple("firstRegistrationDate", "first_registration_date", Date),
                simple("centralPointId", "central_point_db_id", Int),
                simple("centralPointName", "central_point_name", Text),
                rule("note", &["note", "napomena_vozilo"], Text),
            ],
        },
        SyncJobType::GpsPoints => ColumnMapping {
            id_columns: vec!["id".into()],
            modified_column: Some("captured".into()),
            fields: vec![
                rule("garageNumber", &["garage_no", "garazni_broj"], Text),
                simple("capturedAt", "captured", Datetime),
                simple("lat", "lat", Float),
                simple("lng", "lng", Float),
                simple("speed", "speed", Float),
                simple("course", "course", Float),
                simple("altitude", "alt", Float),
                simple("state", "state", Int),
                simple("inRoute", "inroute", Int),
            ],
        },
        SyncJobType::Stops => ColumnMapping {
            id_columns: vec!["unique_id".into(), "id".into()],
            modified_column: Some("changed".into()),
            fields: vec![
                simple("stationName", "station_name", Text),
                simple("gpsx", "gpsx", Float),
                simple("gpsy", "gpsy", Float),
                simple("description", "description", Text),
                simple("range", "range", Int),
                simple("rangeForDriverConsole", "range_for_driver_console", Int),
                simple("rangeForValidators", "range_for_validators", Int),
                simple("changed", "changed", Datetime),
                simple("mainOperator", "main_operator", Int),
                simple("groupId", "group_id", Int),
                simple("readyForBooking", "ready_for_booking", Int),
                simple("usedInBooking", "used_in_booking", Int),
                simple("dateValidFrom", "date_valid_from", Date),
            ],
        },
        SyncJobType::TimetableDates => ColumnMapping {
            id_columns: vec!["id".into()],
            modified_column: Some("kad".into()),
            fields: vec![
                simple("dateValidFrom", "datum", Date),
                simple("dateValidTo", "date_valid_to", Date),
                simple("timetableName", "timetable_name", Text),
                simple("changedBy", "changed_by", Text),
                simple("changedAt", "kad", Datetime),
            ],
        },
        SyncJobType::TimetableSchedules => ColumnMapping {
            id_columns: vec!["id".into()],
            modified_column: None,
            fields: vec![
                simple("lineId", "idlinije", Text),
                simple("departureTime", "vreme", Text),
                simple("direction", "smer", Text),
                simple("description", "opis", Text),
                simple("dateValidFrom", "datum", Date),
                simple("monday", "pon", Bool),
                simple("tuesday", "uto", Bool),
                simple("wednesday", "sre", Bool),
                simple("thursday", "cet", Bool),
                simple("friday", "pet", Bool),
                simple("saturday", "sub", Bool),
                simple("sunday", "ned", Bool),
                simple("stations", "stanice", Text),
                simple("centralPoint", "central_point", Text),
                simple("variation", "variation", Text),
                simple("turageNo", "turage_no", Int),
                simple("departureNoInTurage", "departure_no_in_turage", Int),
                simple("gtfsTripId", "gtfs_trip_id", Text),
            ],
        },
        SyncJobType::PriceVariations => ColumnMapping {
            id_columns: vec!["id".into()],
            modified_column: None,
            fields: vec![
                simple("variationName", "variation_name", Text),
                simple("variationDescription", "variation_description", Text),
                simple("gtfsRouteSettingsId", "gtfs_route_settings_id", Int),
                simple("direction", "direction", Text),
                simple("mainBasicRoute", "main_basic_route", Bool),
                simple("lineTypeId", "line_type_id", Int),
                simple("datetimeFrom", "datetime_from", Datetime),
                simple("datetimeTo", "datetime_to", Datetime),
            ],
        },
    }
}

/// Fields curated on the canonical side; every other field follows the legacy source.
pub fn builtin_authority(job_type: SyncJobType) -> FieldAuthority {
    match job_type {
        SyncJobType::Vehicles => FieldAuthority::with_canonical_fields(["note", "visible"]),
        SyncJobType::Stops => FieldAuthority::with_canonical_fields(["description"]),
        SyncJobType::PriceVariations => FieldAuthority::with_canonical_fields(["variationDescription"]),
        _ => FieldAuthority::default(),
    }
}

/// Folds mapped records into a single per-run figure stored on the sync log.
pub trait MetricAccumulator: Send {
    fn observe(&mut self, record: &CanonicalRecord);
    fn value(&self) -> Option<f64>;
}

const EARTH_RADIUS_KM: f64 = 6371.0;

pub fn haversine_km(from: (f64, f64), to: (f64, f64)) -> f64 {
    let (lat1, lng1) = (from.0.to_radians(), from.1.to_radians());
    let (lat2, lng2) = (to.0.to_radians(), to.1.to_radians());
    let dlat = lat2 - lat1;
    let dlng = lng2 - lng1;
    let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().atan2((1.0 - a).sqrt())
}

/// Distance covered by synced GPS points, summed per vehicle over consecutive points.
#[derive(Debug, Default)]
pub struct GpsDistanceAccumulator {
    last_point: HashMap<String, (f64, f64)>,
    total_km: f64,
    observed: bool,
}

impl MetricAccumulator for GpsDistanceAccumulator {
    fn observe(&mut self, record: &CanonicalRecord) {
        let vehicle = record.fields.get("garageNumber").and_then(value_to_key);
        let lat = record.fields.get("lat").and_then(JsonValue::as_f64);
        let lng = record.fields.get("lng").and_then(JsonValue::as_f64);
        let (Some(vehicle), Some(lat), Some(lng)) = (vehicle, lat, lng) else {
            return;
        };
        self.observed = true;
        if let Some(previous) = self.last_point.insert(vehicle, (lat, lng)) {
            self.total_km += haversine_km(previous, (lat, lng));
        }
    }

    fn value(&self) -> Option<f64> {
        self.observed.then_some(self.total_km)
    }
}

/// Everything the runner needs for one job type: where to read, how to map, who owns which field.
pub struct DomainAdapter {
    pub job_type: SyncJobType,
    pub connector: Box<dyn LegacyConnector>,
    pub mapper: Box<dyn RecordMapper>,
    pub authority: FieldAuthority,
}

impl DomainAdapter {
    pub fn new(job_type: SyncJobType, connector: Box<dyn LegacyConnector>) -> Self {
        Self {
            job_type,
            connector,
            mapper: Box::new(ColumnMapper::builtin(job_type)),
            authority: builtin_authority(job_type),
        }
    }

    pub fn with_mapper(mut self, mapper: Box<dyn RecordMapper>) -> Self {
        self.mapper = mapper;
        self
    }

    pub fn with_authority(mut self, authority: FieldAuthority) -> Self {
        self.authority = authority;
        self
    }

    pub fn metric(&self) -> Option<Box<dyn MetricAccumulator>> {
        match self.job_type {
            SyncJobType::GpsPoints => Some(Box::new(GpsDistanceAccumulator::default())),
            _ => None,
        }
    }
}

/// Builds a fresh adapter (and so a fresh connector) for every run.
pub trait AdapterRegistry: Send + Sync {
    fn adapter_for(&self, job_type: SyncJobType) -> Result<DomainAdapter, AdapterError>;

    fn configured_job_types(&self) -> Vec<SyncJobType>;

    /// `(job type, cron expression)` pairs for scheduled runs.
    fn schedules(&self) -> Vec<(SyncJobType, String)> {
        Vec::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LegacyEngine {
    Mysql,
    Postgres,
    Fixture,
    Oracle,
    Mssql,
    Mongodb,
}

impl fmt::Display for LegacyEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LegacyEngine::Mysql => "mysql",
            LegacyEngine::Postgres => "postgres",
            LegacyEngine::Fixture => "fixture",
            LegacyEngine::Oracle => "oracle",
            LegacyEngine::Mssql => "mssql",
            LegacyEngine::Mongodb => "mongodb",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub id: String,
    pub engine: LegacyEngine,
    #[serde(default)]
    pub url: Option<String>,
    /// Name of an environment variable holding the connection URL.
    #[serde(default)]
    pub url_env: Option<String>,
    /// Directory of `<table>.json` files for the fixture engine.
    #[serde(default)]
    pub fixture_dir: Option<PathBuf>,
}

impl SourceConfig {
    fn resolve_url(&self) -> Result<String, AdapterError> {
        if let Some(url) = &self.url {
            return Ok(url.clone());
        }
        let Some(var) = &self.url_env else {
            return Err(AdapterError::Config(format!("source `{}` needs url or url_env", self.id)));
        };
        std::env::var(var)
            .map_err(|_| AdapterError::Config(format!("source `{}`: environment variable {var} is not set", self.id)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobConfig {
    pub job_type: SyncJobType,
    pub sources: Vec<String>,
    #[serde(default)]
    pub schedule: Option<String>,
    #[serde(default)]
    pub table: Option<TableSpec>,
    #[serde(default)]
    pub authority: Option<AuthorityOverrides>,
    #[serde(default)]
    pub mapping: Option<ColumnMapping>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub jobs: Vec<JobConfig>,
}

/// Registry backed by `sync.yaml`; relative fixture paths resolve against `base_dir`.
#[derive(Debug, Clone)]
pub struct ConfiguredRegistry {
    config: RegistryConfig,
    base_dir: PathBuf,
}

impl ConfiguredRegistry {
    pub fn new(config: RegistryConfig, base_dir: impl Into<PathBuf>) -> Self {
        Self {
            config,
            base_dir: base_dir.into(),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    fn job(&self, job_type: SyncJobType) -> Option<&JobConfig> {
        self.config.jobs.iter().find(|j| j.job_type == job_type)
    }

    fn connector_for(&self, source: &SourceConfig, spec: &TableSpec) -> Result<Box<dyn LegacyConnector>, AdapterError> {
        match source.engine {
            LegacyEngine::Mysql => Ok(Box::new(SqlConnector::new(
                &source.id,
                SqlEngine::MySql,
                source.resolve_url()?,
                spec.clone(),
            )?)),
            LegacyEngine::Postgres => Ok(Box::new(SqlConnector::new(
                &source.id,
                SqlEngine::Postgres,
                source.resolve_url()?,
                spec.clone(),
            )?)),
            LegacyEngine::Fixture => {
                let dir = source
                    .fixture_dir
                    .as_ref()
                    .ok_or_else(|| AdapterError::Config(format!("fixture source `{}` needs fixture_dir", source.id)))?;
                let path = self.base_dir.join(dir).join(format!("{}.json", spec.table));
                Ok(Box::new(FixtureConnector::new(&source.id, spec.clone(), path)))
            }
            engine @ (LegacyEngine::Oracle | LegacyEngine::Mssql | LegacyEngine::Mongodb) => {
                Err(AdapterError::UnsupportedEngine(engine))
            }
        }
    }
}

impl AdapterRegistry for ConfiguredRegistry {
    fn adapter_for(&self, job_type: SyncJobType) -> Result<DomainAdapter, AdapterError> {
        let job = self.job(job_type).ok_or(AdapterError::NotConfigured(job_type))?;
        if job.sources.is_empty() {
            return Err(AdapterError::Config(format!("job {job_type} lists no sources")));
        }
        let spec = job.table.clone().unwrap_or_else(|| builtin_table(job_type));

        let mut connectors = Vec::with_capacity(job.sources.len());
        for source_id in &job.sources {
            let source = self
                .config
                .sources
                .iter()
                .find(|s| &s.id == source_id)
                .ok_or_else(|| AdapterError::UnknownSource(source_id.clone()))?;
            connectors.push(self.connector_for(source, &spec)?);
        }
        let connector = if connectors.len() == 1 {
            connectors.remove(0)
        } else {
            Box::new(ChainedConnector::new(connectors))
        };

        let mapping = job.mapping.clone().unwrap_or_else(|| builtin_mapping(job_type));
        let authority = match &job.authority {
            Some(overrides) => builtin_authority(job_type).merged(overrides),
            None => builtin_authority(job_type),
        };
        Ok(DomainAdapter::new(job_type, connector)
            .with_mapper(Box::new(ColumnMapper::new(job_type, mapping)))
            .with_authority(authority))
    }

    fn configured_job_types(&self) -> Vec<SyncJobType> {
        self.config.jobs.iter().map(|j| j.job_type).collect()
    }

    fn schedules(&self) -> Vec<(SyncJobType, String)> {
        self.config
            .jobs
            .iter()
            .filter_map(|j| j.schedule.clone().map(|s| (j.job_type, s)))
            .collect()
    }
}

pub type AdapterFactory = Arc<dyn Fn() -> Result<DomainAdapter, AdapterError> + Send + Sync>;

/// Registry of in-process adapter factories, mainly for embedding and tests.
#[derive(Default, Clone)]
pub struct StaticRegistry {
    factories: HashMap<SyncJobType, AdapterFactory>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<F>(mut self, job_type: SyncJobType, factory: F) -> Self
    where
        F: Fn() -> Result<DomainAdapter, AdapterError> + Send + Sync + 'static,
    {
        self.factories.insert(job_type, Arc::new(factory));
        self
    }
}

impl AdapterRegistry for StaticRegistry {
    fn adapter_for(&self, job_type: SyncJobType) -> Result<DomainAdapter, AdapterError> {
        let factory = self
            .factories
            .get(&job_type)
            .ok_or(AdapterError::NotConfigured(job_type))?;
        factory()
    }

    fn configured_job_types(&self) -> Vec<SyncJobType> {
        let mut types = self.factories.keys().copied().collect::<Vec<_>>();
        types.sort();
        types
    }
}
