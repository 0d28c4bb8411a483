//! Job-status store, canonical record store and retry policy for the sync engine.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lsync_core::{
    CanonicalRecord, ExternalKey, LocalRecord, NewSyncDetail, NewSyncLog, Page, ProgressUpdate,
    SyncDetail, SyncJobType, SyncLog, SyncScope, SyncStatus,
};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "lsync-storage";

const ACTIVE_RUN_INDEX: &str = "sync_logs_one_active_per_job";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("a {job_type} sync is already running (log {active_id})")]
    AlreadyRunning { job_type: SyncJobType, active_id: i64 },
    #[error("{0} not found")]
    NotFound(String),
    #[error("sync log {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: i64,
        from: SyncStatus,
        to: SyncStatus,
    },
    #[error("constraint violated: {0}")]
    Constraint(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("decoding stored row: {0}")]
    Decode(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

impl StoreError {
    /// Constraint violations belong to one record; everything else means the store itself is unhealthy.
    pub fn is_record_scoped(&self) -> bool {
        matches!(self, StoreError::Constraint(_))
    }

    pub fn disposition(&self) -> RetryDisposition {
        match self {
            StoreError::Unavailable(_) => RetryDisposition::Retryable,
            StoreError::Database(err) => classify_sqlx_error(err),
            _ => RetryDisposition::NonRetryable,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_sqlx_error(err: &sqlx::Error) -> RetryDisposition {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Tls(_)
        | sqlx::Error::WorkerCrashed => RetryDisposition::Retryable,
        _ => RetryDisposition::NonRetryable,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Content hash of a canonical field map; BTreeMap ordering keeps it stable.
pub fn fingerprint(fields: &BTreeMap<String, JsonValue>) -> String {
    let bytes = serde_json::to_vec(fields).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    hex::encode(hasher.finalize())
}

/// Persisted run state. The only writer of job status; start is an atomic check-and-set.
#[async_trait]
pub trait SyncStore: Send + Sync {
    /// Fails with `AlreadyRunning` if the job type has a pending or in-progress log.
    async fn create_log(&self, new: NewSyncLog) -> Result<SyncLog, StoreError>;

    async fn mark_in_progress(&self, id: i64, total_units: u64) -> Result<SyncLog, StoreError>;

    /// Advances counters and the progress heartbeat. `processed_units` never decreases.
    async fn record_progress(&self, id: i64, update: ProgressUpdate) -> Result<(), StoreError>;

    async fn finish(
        &self,
        id: i64,
        status: SyncStatus,
        progress: Option<ProgressUpdate>,
        error_message: Option<String>,
    ) -> Result<SyncLog, StoreError>;

    async fn request_cancel(&self, id: i64) -> Result<SyncLog, StoreError>;

    async fn get_log(&self, id: i64) -> Result<Option<SyncLog>, StoreError>;

    async fn active_log(&self, job_type: SyncJobType) -> Result<Option<SyncLog>, StoreError>;

    async fn history(&self, job_type: SyncJobType, limit: u32) -> Result<Vec<SyncLog>, StoreError>;

    async fn last_completed(&self, job_type: SyncJobType) -> Result<Option<SyncLog>, StoreError>;

    async fn insert_details(&self, log_id: i64, details: &[NewSyncDetail]) -> Result<(), StoreError>;

    async fn details(&self, log_id: i64, page: u32, limit: u32) -> Result<Page<SyncDetail>, StoreError>;

    /// Marks active logs whose heartbeat is older than `stale_before` as failed, skipping `exclude`.
    async fn fail_stale(
        &self,
        job_type: Option<SyncJobType>,
        stale_before: DateTime<Utc>,
        exclude: &[i64],
        message: &str,
    ) -> Result<Vec<i64>, StoreError>;
}

/// The application's own copy of synced entities, addressed by external key.
#[async_trait]
pub trait CanonicalStore: Send + Sync {
    async fn load(&self, keys: &[ExternalKey]) -> Result<HashMap<ExternalKey, LocalRecord>, StoreError>;

    async fn insert(&self, record: &CanonicalRecord) -> Result<LocalRecord, StoreError>;

    /// Writes every change or none. Fails with `Constraint` if the record moved since it was loaded.
    async fn update_fields(
        &self,
        existing: &LocalRecord,
        changes: &BTreeMap<String, JsonValue>,
    ) -> Result<LocalRecord, StoreError>;

    async fn count(&self, job_type: SyncJobType) -> Result<u64, StoreError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    logs: BTreeMap<i64, SyncLog>,
    details: Vec<SyncDetail>,
    next_log_id: i64,
    next_detail_id: i64,
    records: HashMap<ExternalKey, LocalRecord>,
}

/// Single-process store used when no database is configured, and as the test double.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves a log's heartbeat, e.g. to simulate a process that died mid-run.
    pub async fn set_last_progress(&self, id: i64, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let log = state
            .logs
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("sync log {id}")))?;
        log.last_progress_at = at;
        Ok(())
    }

    pub async fn local_records(&self, job_type: SyncJobType) -> Vec<LocalRecord> {
        let state = self.state.lock().await;
        let mut out = state
            .records
            .values()
            .filter(|r| r.key.job_type == job_type)
            .cloned()
            .collect::<Vec<_>>();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }
}

fn transition(log: &mut SyncLog, to: SyncStatus) -> Result<(), StoreError> {
    if !log.status.can_transition_to(to) {
        return Err(StoreError::InvalidTransition {
            id: log.id,
            from: log.status,
            to,
        });
    }
    log.status = to;
    Ok(())
}

fn apply_progress(log: &mut SyncLog, update: &ProgressUpdate, now: DateTime<Utc>) {
    log.total_units = update.total_units;
    log.processed_units = log.processed_units.max(update.counters.processed);
    log.created_count = update.counters.created;
    log.updated_count = update.counters.updated;
    log.skipped_count = update.counters.skipped;
    log.conflict_count = update.counters.conflicts;
    log.error_count = update.counters.errors;
    if update.domain_scalar.is_some() {
        log.domain_scalar = update.domain_scalar;
    }
    log.last_progress_at = now;
}

#[async_trait]
impl SyncStore for MemoryStore {
    async fn create_log(&self, new: NewSyncLog) -> Result<SyncLog, StoreError> {
        let mut state = self.state.lock().await;
        if let Some(active) = state
            .logs
            .values()
            .find(|l| l.job_type == new.job_type && l.is_active())
        {
            return Err(StoreError::AlreadyRunning {
                job_type: new.job_type,
                active_id: active.id,
            });
        }
        state.next_log_id += 1;
        let now = Utc::now();
        let log = SyncLog {
            id: state.next_log_id,
            job_type: new.job_type,
            scope: new.scope,
            status: SyncStatus::Pending,
            started_at: now,
            completed_at: None,
            total_units: 0,
            processed_units: 0,
            created_count: 0,
            updated_count: 0,
            skipped_count: 0,
            conflict_count: 0,
            error_count: 0,
            batch_size: new.batch_size,
            delay_ms: new.delay_ms,
            initiated_by: new.initiated_by,
            domain_scalar: None,
            error_message: None,
            cancel_requested: false,
            owner_instance: new.owner_instance,
            last_progress_at: now,
        };
        state.logs.insert(log.id, log.clone());
        Ok(log)
    }

    async fn mark_in_progress(&self, id: i64, total_units: u64) -> Result<SyncLog, StoreError> {
        let mut state = self.state.lock().await;
        let log = state
            .logs
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("sync log {id}")))?;
        transition(log, SyncStatus::InProgress)?;
        log.total_units = total_units;
        log.last_progress_at = Utc::now();
        Ok(log.clone())
    }

    async fn record_progress(&self, id: i64, update: ProgressUpdate) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let log = state
            .logs
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("sync log {id}")))?;
        if log.status.is_terminal() {
            return Err(StoreError::InvalidTransition {
                id,
                from: log.status,
                to: SyncStatus::InProgress,
            });
        }
        apply_progress(log, &update, Utc::now());
        Ok(())
    }

    async fn finish(
        &self,
        id: i64,
        status: SyncStatus,
        progress: Option<ProgressUpdate>,
        error_message: Option<String>,
    ) -> Result<SyncLog, StoreError> {
        let mut state = self.state.lock().await;
        let log = state
            .logs
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("sync log {id}")))?;
        transition(log, status)?;
        let now = Utc::now();
        if let Some(update) = progress {
            apply_progress(log, &update, now);
        }
        log.completed_at = Some(now);
        log.error_message = error_message;
        Ok(log.clone())
    }

    async fn request_cancel(&self, id: i64) -> Result<SyncLog, StoreError> {
        let mut state = self.state.lock().await;
        let log = state
            .logs
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("sync log {id}")))?;
        if log.status.is_terminal() {
            return Err(StoreError::InvalidTransition {
                id,
                from: log.status,
                to: SyncStatus::Cancelled,
            });
        }
        log.cancel_requested = true;
        Ok(log.clone())
    }

    async fn get_log(&self, id: i64) -> Result<Option<SyncLog>, StoreError> {
        Ok(self.state.lock().await.logs.get(&id).cloned())
    }

    async fn active_log(&self, job_type: SyncJobType) -> Result<Option<SyncLog>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .logs
            .values()
            .find(|l| l.job_type == job_type && l.is_active())
            .cloned())
    }

    async fn history(&self, job_type: SyncJobType, limit: u32) -> Result<Vec<SyncLog>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .logs
            .values()
            .rev()
            .filter(|l| l.job_type == job_type)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn last_completed(&self, job_type: SyncJobType) -> Result<Option<SyncLog>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .logs
            .values()
            .rev()
            .find(|l| l.job_type == job_type && l.status == SyncStatus::Completed)
            .cloned())
    }

    async fn insert_details(&self, log_id: i64, details: &[NewSyncDetail]) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if !state.logs.contains_key(&log_id) {
            return Err(StoreError::NotFound(format!("sync log {log_id}")));
        }
        let now = Utc::now();
        for detail in details {
            state.next_detail_id += 1;
            let row = SyncDetail {
                id: state.next_detail_id,
                sync_log_id: log_id,
                external_key: detail.external_key.clone(),
                action: detail.action,
                field_changes: detail.field_changes.clone(),
                conflict_fields: detail.conflict_fields.clone(),
                resolution: detail.resolution,
                error_message: detail.error_message.clone(),
                created_at: now,
            };
            state.details.push(row);
        }
        Ok(())
    }

    async fn details(&self, log_id: i64, page: u32, limit: u32) -> Result<Page<SyncDetail>, StoreError> {
        let state = self.state.lock().await;
        let matching = state
            .details
            .iter()
            .filter(|d| d.sync_log_id == log_id)
            .collect::<Vec<_>>();
        let total = matching.len() as u64;
        let rows = matching
            .into_iter()
            .skip(Page::<SyncDetail>::offset(page, limit) as usize)
            .take(limit.max(1) as usize)
            .cloned()
            .collect();
        Ok(Page::new(rows, total, page, limit))
    }

    async fn fail_stale(
        &self,
        job_type: Option<SyncJobType>,
        stale_before: DateTime<Utc>,
        exclude: &[i64],
        message: &str,
    ) -> Result<Vec<i64>, StoreError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let mut failed = Vec::new();
        for log in state.logs.values_mut() {
            if log.is_active()
                && log.last_progress_at < stale_before
                && !exclude.contains(&log.id)
                && job_type.map_or(true, |t| t == log.job_type)
            {
                log.status = SyncStatus::Failed;
                log.completed_at = Some(now);
                log.error_message = Some(message.to_string());
                failed.push(log.id);
            }
        }
        Ok(failed)
    }
}

#[async_trait]
impl CanonicalStore for MemoryStore {
    async fn load(&self, keys: &[ExternalKey]) -> Result<HashMap<ExternalKey, LocalRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(keys
            .iter()
            .filter_map(|k| state.records.get(k).map(|r| (k.clone(), r.clone())))
            .collect())
    }

    async fn insert(&self, record: &CanonicalRecord) -> Result<LocalRecord, StoreError> {
        let mut state = self.state.lock().await;
        if state.records.contains_key(&record.key) {
            return Err(StoreError::Constraint(format!("{} already exists", record.key)));
        }
        let local = LocalRecord {
            local_id: Uuid::new_v4(),
            key: record.key.clone(),
            fields: record.fields.clone(),
            fingerprint: fingerprint(&record.fields),
            updated_at: Utc::now(),
        };
        state.records.insert(local.key.clone(), local.clone());
        Ok(local)
    }

    async fn update_fields(
        &self,
        existing: &LocalRecord,
        changes: &BTreeMap<String, JsonValue>,
    ) -> Result<LocalRecord, StoreError> {
        let mut state = self.state.lock().await;
        let current = state
            .records
            .get_mut(&existing.key)
            .ok_or_else(|| StoreError::NotFound(existing.key.to_string()))?;
        if current.fingerprint != existing.fingerprint {
            return Err(StoreError::Constraint(format!(
                "{} was modified concurrently",
                existing.key
            )));
        }
        for (field, value) in changes {
            current.fields.insert(field.clone(), value.clone());
        }
        current.fingerprint = fingerprint(&current.fields);
        current.updated_at = Utc::now();
        Ok(current.clone())
    }

    async fn count(&self, job_type: SyncJobType) -> Result<u64, StoreError> {
        let state = self.state.lock().await;
        Ok(state.records.keys().filter(|k| k.job_type == job_type).count() as u64)
    }
}

/// Postgres-backed job-status and canonical store.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

fn to_db(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_db(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn classify_write_error(err: sqlx::Error) -> StoreError {
    if let Some(db) = err.as_database_error() {
        if db.code().is_some_and(|c| c.starts_with("23")) {
            return StoreError::Constraint(db.message().to_string());
        }
    }
    match classify_sqlx_error(&err) {
        RetryDisposition::Retryable => StoreError::Unavailable(err.to_string()),
        RetryDisposition::NonRetryable => StoreError::Database(err),
    }
}

fn decode_err(err: impl std::fmt::Display) -> StoreError {
    StoreError::Decode(err.to_string())
}

fn log_from_row(row: &PgRow) -> Result<SyncLog, StoreError> {
    let job_type: String = row.try_get("job_type")?;
    let status: String = row.try_get("status")?;
    let scope_json: JsonValue = row.try_get("scope_json")?;
    let batch_size: i32 = row.try_get("batch_size")?;
    Ok(SyncLog {
        id: row.try_get("id")?,
        job_type: job_type.parse().map_err(decode_err)?,
        scope: serde_json::from_value::<SyncScope>(scope_json).map_err(decode_err)?,
        status: status.parse().map_err(decode_err)?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        total_units: from_db(row.try_get("total_units")?),
        processed_units: from_db(row.try_get("processed_units")?),
        created_count: from_db(row.try_get("created_count")?),
        updated_count: from_db(row.try_get("updated_count")?),
        skipped_count: from_db(row.try_get("skipped_count")?),
        conflict_count: from_db(row.try_get("conflict_count")?),
        error_count: from_db(row.try_get("error_count")?),
        batch_size: u32::try_from(batch_size).unwrap_or(0),
        delay_ms: from_db(row.try_get("delay_ms")?),
        initiated_by: row.try_get("initiated_by")?,
        domain_scalar: row.try_get("domain_scalar")?,
        error_message: row.try_get("error_message")?,
        cancel_requested: row.try_get("cancel_requested")?,
        owner_instance: row.try_get("owner_instance")?,
        last_progress_at: row.try_get("last_progress_at")?,
    })
}

fn detail_from_row(row: &PgRow) -> Result<SyncDetail, StoreError> {
    let action: String = row.try_get("action")?;
    let resolution: String = row.try_get("resolution")?;
    let field_changes: JsonValue = row.try_get("field_changes")?;
    let conflict_fields: JsonValue = row.try_get("conflict_fields")?;
    Ok(SyncDetail {
        id: row.try_get("id")?,
        sync_log_id: row.try_get("sync_log_id")?,
        external_key: row.try_get("external_key")?,
        action: action.parse().map_err(decode_err)?,
        field_changes: serde_json::from_value(field_changes).map_err(decode_err)?,
        conflict_fields: serde_json::from_value(conflict_fields).map_err(decode_err)?,
        resolution: resolution.parse().map_err(decode_err)?,
        error_message: row.try_get("error_message")?,
        created_at: row.try_get("created_at")?,
    })
}

fn record_from_row(row: &PgRow) -> Result<LocalRecord, StoreError> {
    let job_type: String = row.try_get("job_type")?;
    let fields: JsonValue = row.try_get("fields")?;
    Ok(LocalRecord {
        local_id: row.try_get("local_id")?,
        key: ExternalKey::new(
            job_type.parse().map_err(decode_err)?,
            row.try_get::<String, _>("source_id")?,
            row.try_get::<String, _>("record_id")?,
        ),
        fields: serde_json::from_value(fields).map_err(decode_err)?,
        fingerprint: row.try_get("fingerprint")?,
        updated_at: row.try_get("updated_at")?,
    })
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .map_err(classify_write_error)?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("sync store migrations applied");
        Ok(())
    }

    async fn fetch_log(&self, id: i64) -> Result<SyncLog, StoreError> {
        self.get_log(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("sync log {id}")))
    }

    async fn transition_error(&self, id: i64, to: SyncStatus) -> StoreError {
        match self.fetch_log(id).await {
            Ok(log) => StoreError::InvalidTransition {
                id,
                from: log.status,
                to,
            },
            Err(err) => err,
        }
    }
}

#[async_trait]
impl SyncStore for PgStore {
    async fn create_log(&self, new: NewSyncLog) -> Result<SyncLog, StoreError> {
        let scope_json = serde_json::to_value(&new.scope).map_err(decode_err)?;
        let inserted = sqlx::query(
            r#"
            INSERT INTO sync_logs (job_type, scope_kind, scope_json, status, batch_size, delay_ms,
                                   initiated_by, owner_instance)
            VALUES ($1, $2, $3, 'pending', $4, $5, $6, $7)
            RETURNING *
            "#,
        )
        .bind(new.job_type.as_str())
        .bind(new.scope.kind())
        .bind(scope_json)
        .bind(i32::try_from(new.batch_size).unwrap_or(i32::MAX))
        .bind(to_db(new.delay_ms))
        .bind(&new.initiated_by)
        .bind(&new.owner_instance)
        .fetch_one(&self.pool)
        .await;

        match inserted {
            Ok(row) => log_from_row(&row),
            Err(err) => {
                let is_lock_conflict = err
                    .as_database_error()
                    .is_some_and(|db| db.is_unique_violation() && db.constraint() == Some(ACTIVE_RUN_INDEX));
                if !is_lock_conflict {
                    return Err(classify_write_error(err));
                }
                let active_id = self
                    .active_log(new.job_type)
                    .await?
                    .map(|l| l.id)
                    .unwrap_or_default();
                Err(StoreError::AlreadyRunning {
                    job_type: new.job_type,
                    active_id,
                })
            }
        }
    }

    async fn mark_in_progress(&self, id: i64, total_units: u64) -> Result<SyncLog, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE sync_logs
               SET status = 'in_progress',
                   total_units = $2,
                   last_progress_at = NOW()
             WHERE id = $1
               AND status IN ('pending', 'in_progress')
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(to_db(total_units))
        .fetch_optional(&self.pool)
        .await
        .map_err(classify_write_error)?;
        match row {
            Some(row) => log_from_row(&row),
            None => Err(self.transition_error(id, SyncStatus::InProgress).await),
        }
    }

    async fn record_progress(&self, id: i64, update: ProgressUpdate) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE sync_logs
               SET total_units = $2,
                   processed_units = GREATEST(processed_units, $3),
                   created_count = $4,
                   updated_count = $5,
                   skipped_count = $6,
                   conflict_count = $7,
                   error_count = $8,
                   domain_scalar = COALESCE($9, domain_scalar),
                   last_progress_at = NOW()
             WHERE id = $1
               AND status IN ('pending', 'in_progress')
            "#,
        )
        .bind(id)
        .bind(to_db(update.total_units))
        .bind(to_db(update.counters.processed))
        .bind(to_db(update.counters.created))
        .bind(to_db(update.counters.updated))
        .bind(to_db(update.counters.skipped))
        .bind(to_db(update.counters.conflicts))
        .bind(to_db(update.counters.errors))
        .bind(update.domain_scalar)
        .execute(&self.pool)
        .await
        .map_err(classify_write_error)?;
        if result.rows_affected() == 0 {
            return Err(self.transition_error(id, SyncStatus::InProgress).await);
        }
        Ok(())
    }

    async fn finish(
        &self,
        id: i64,
        status: SyncStatus,
        progress: Option<ProgressUpdate>,
        error_message: Option<String>,
    ) -> Result<SyncLog, StoreError> {
        let current = self.fetch_log(id).await?;
        if !current.status.can_transition_to(status) {
            return Err(StoreError::InvalidTransition {
                id,
                from: current.status,
                to: status,
            });
        }
        let update = progress.unwrap_or(ProgressUpdate {
            total_units: current.total_units,
            counters: current.counters(),
            domain_scalar: current.domain_scalar,
        });
        let row = sqlx::query(
            r#"
            UPDATE sync_logs
               SET status = $2,
                   completed_at = NOW(),
                   error_message = $3,
                   total_units = $4,
                   processed_units = GREATEST(processed_units, $5),
                   created_count = $6,
                   updated_count = $7,
                   skipped_count = $8,
                   conflict_count = $9,
                   error_count = $10,
                   domain_scalar = COALESCE($11, domain_scalar),
                   last_progress_at = NOW()
             WHERE id = $1
               AND status IN ('pending', 'in_progress')
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(error_message)
        .bind(to_db(update.total_units))
        .bind(to_db(update.counters.processed))
        .bind(to_db(update.counters.created))
        .bind(to_db(update.counters.updated))
        .bind(to_db(update.counters.skipped))
        .bind(to_db(update.counters.conflicts))
        .bind(to_db(update.counters.errors))
        .bind(update.domain_scalar)
        .fetch_optional(&self.pool)
        .await
        .map_err(classify_write_error)?;
        match row {
            Some(row) => log_from_row(&row),
            None => Err(self.transition_error(id, status).await),
        }
    }

    async fn request_cancel(&self, id: i64) -> Result<SyncLog, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE sync_logs
               SET cancel_requested = TRUE
             WHERE id = $1
               AND status IN ('pending', 'in_progress')
            RETURNING *
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(classify_write_error)?;
        match row {
            Some(row) => log_from_row(&row),
            None => Err(self.transition_error(id, SyncStatus::Cancelled).await),
        }
    }

    async fn get_log(&self, id: i64) -> Result<Option<SyncLog>, StoreError> {
        let row = sqlx::query("SELECT * FROM sync_logs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(log_from_row).transpose()
    }

    async fn active_log(&self, job_type: SyncJobType) -> Result<Option<SyncLog>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT *
              FROM sync_logs
             WHERE job_type = $1
               AND status IN ('pending', 'in_progress')
             ORDER BY id DESC
             LIMIT 1
            "#,
        )
        .bind(job_type.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(log_from_row).transpose()
    }

    async fn history(&self, job_type: SyncJobType, limit: u32) -> Result<Vec<SyncLog>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT *
              FROM sync_logs
             WHERE job_type = $1
             ORDER BY started_at DESC, id DESC
             LIMIT $2
            "#,
        )
        .bind(job_type.as_str())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(log_from_row).collect()
    }

    async fn last_completed(&self, job_type: SyncJobType) -> Result<Option<SyncLog>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT *
              FROM sync_logs
             WHERE job_type = $1
               AND status = 'completed'
             ORDER BY started_at DESC, id DESC
             LIMIT 1
            "#,
        )
        .bind(job_type.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(log_from_row).transpose()
    }

    async fn insert_details(&self, log_id: i64, details: &[NewSyncDetail]) -> Result<(), StoreError> {
        if details.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await.map_err(classify_write_error)?;
        for detail in details {
            sqlx::query(
                r#"
                INSERT INTO sync_details (sync_log_id, external_key, action, field_changes,
                                          conflict_fields, resolution, error_message)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(log_id)
            .bind(&detail.external_key)
            .bind(detail.action.as_str())
            .bind(serde_json::to_value(&detail.field_changes).map_err(decode_err)?)
            .bind(serde_json::to_value(&detail.conflict_fields).map_err(decode_err)?)
            .bind(detail.resolution.as_str())
            .bind(&detail.error_message)
            .execute(&mut *tx)
            .await
            .map_err(classify_write_error)?;
        }
        tx.commit().await.map_err(classify_write_error)?;
        Ok(())
    }

    async fn details(&self, log_id: i64, page: u32, limit: u32) -> Result<Page<SyncDetail>, StoreError> {
        let limit = limit.max(1);
        let total: i64 = sqlx::query("SELECT COUNT(*) AS total FROM sync_details WHERE sync_log_id = $1")
            .bind(log_id)
            .fetch_one(&self.pool)
            .await?
            .try_get("total")?;
        let rows = sqlx::query(
            r#"
            SELECT *
              FROM sync_details
             WHERE sync_log_id = $1
             ORDER BY id ASC
             LIMIT $2 OFFSET $3
            "#,
        )
        .bind(log_id)
        .bind(i64::from(limit))
        .bind(to_db(Page::<SyncDetail>::offset(page, limit)))
        .fetch_all(&self.pool)
        .await?;
        let data = rows.iter().map(detail_from_row).collect::<Result<Vec<_>, _>>()?;
        Ok(Page::new(data, from_db(total), page, limit))
    }

    async fn fail_stale(
        &self,
        job_type: Option<SyncJobType>,
        stale_before: DateTime<Utc>,
        exclude: &[i64],
        message: &str,
    ) -> Result<Vec<i64>, StoreError> {
        let rows = sqlx::query(
            r#"
            UPDATE sync_logs
               SET status = 'failed',
                   completed_at = NOW(),
                   error_message = $3
             WHERE status IN ('pending', 'in_progress')
               AND last_progress_at < $1
               AND NOT (id = ANY($2))
               AND ($4::text IS NULL OR job_type = $4)
            RETURNING id
            "#,
        )
        .bind(stale_before)
        .bind(exclude.to_vec())
        .bind(message)
        .bind(job_type.map(|t| t.as_str()))
        .fetch_all(&self.pool)
        .await
        .map_err(classify_write_error)?;
        let ids = rows
            .iter()
            .map(|r| r.try_get::<i64, _>("id"))
            .collect::<Result<Vec<_>, _>>()?;
        if !ids.is_empty() {
            warn!(count = ids.len(), ?ids, "marked stale sync runs as failed");
        }
        Ok(ids)
    }
}

#[async_trait]
impl CanonicalStore for PgStore {
    async fn load(&self, keys: &[ExternalKey]) -> Result<HashMap<ExternalKey, LocalRecord>, StoreError> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let job_types = keys.iter().map(|k| k.job_type.as_str().to_string()).collect::<Vec<_>>();
        let source_ids = keys.iter().map(|k| k.source_id.clone()).collect::<Vec<_>>();
        let record_ids = keys.iter().map(|k| k.record_id.clone()).collect::<Vec<_>>();
        let rows = sqlx::query(
            r#"
            SELECT c.*
              FROM canonical_records c
              JOIN UNNEST($1::text[], $2::text[], $3::text[]) AS k(job_type, source_id, record_id)
                ON c.job_type = k.job_type
               AND c.source_id = k.source_id
               AND c.record_id = k.record_id
            "#,
        )
        .bind(job_types)
        .bind(source_ids)
        .bind(record_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(classify_write_error)?;
        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            let record = record_from_row(&row)?;
            out.insert(record.key.clone(), record);
        }
        Ok(out)
    }

    async fn insert(&self, record: &CanonicalRecord) -> Result<LocalRecord, StoreError> {
        let fields = serde_json::to_value(&record.fields).map_err(decode_err)?;
        let row = sqlx::query(
            r#"
            INSERT INTO canonical_records (local_id, job_type, source_id, record_id, fields,
                                           fingerprint, source_modified_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(record.key.job_type.as_str())
        .bind(&record.key.source_id)
        .bind(&record.key.record_id)
        .bind(fields)
        .bind(fingerprint(&record.fields))
        .bind(record.source_modified_at)
        .fetch_one(&self.pool)
        .await
        .map_err(classify_write_error)?;
        record_from_row(&row)
    }

    async fn update_fields(
        &self,
        existing: &LocalRecord,
        changes: &BTreeMap<String, JsonValue>,
    ) -> Result<LocalRecord, StoreError> {
        let mut tx = self.pool.begin().await.map_err(classify_write_error)?;
        let row = sqlx::query("SELECT * FROM canonical_records WHERE local_id = $1 FOR UPDATE")
            .bind(existing.local_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(classify_write_error)?
            .ok_or_else(|| StoreError::NotFound(existing.key.to_string()))?;
        let mut current = record_from_row(&row)?;
        if current.fingerprint != existing.fingerprint {
            return Err(StoreError::Constraint(format!(
                "{} was modified concurrently",
                existing.key
            )));
        }
        for (field, value) in changes {
            current.fields.insert(field.clone(), value.clone());
        }
        let row = sqlx::query(
            r#"
            UPDATE canonical_records
               SET fields = $2,
                   fingerprint = $3,
                   updated_at = NOW()
             WHERE local_id = $1
            RETURNING *
            "#,
        )
        .bind(current.local_id)
        .bind(serde_json::to_value(&current.fields).map_err(decode_err)?)
        .bind(fingerprint(&current.fields))
        .fetch_one(&mut *tx)
        .await
        .map_err(classify_write_error)?;
        let updated = record_from_row(&row)?;
        tx.commit().await.map_err(classify_write_error)?;
        Ok(updated)
    }

    async fn count(&self, job_type: SyncJobType) -> Result<u64, StoreError> {
        let total: i64 = sqlx::query("SELECT COUNT(*) AS total FROM canonical_records WHERE job_type = $1")
            .bind(job_type.as_str())
            .fetch_one(&self.pool)
            .await?
            .try_get("total")?;
        Ok(from_db(total))
    }
}
