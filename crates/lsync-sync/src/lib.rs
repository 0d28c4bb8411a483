//! Sync engine orchestration: reconciliation, batch runs, job supervision and progress views.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use lsync_adapters::{
    AdapterError, AdapterRegistry, ConfiguredRegistry, ConnectorError, Cursor, DomainAdapter,
    FetchFilter, FetchedBatch, LegacyConnector, MetricAccumulator, RegistryConfig,
};
use lsync_core::{
    Authority, CanonicalRecord, ConflictField, ExternalKey, FieldAuthority, FieldChange,
    LegacyRow, LocalRecord, NewSyncDetail, NewSyncLog, Page, ProgressUpdate, SyncCounters,
    SyncDetail, SyncJobType, SyncLog, SyncScope, SyncStatus,
};
use lsync_storage::{
    BackoffPolicy, CanonicalStore, MemoryStore, PgStore, RetryDisposition, StoreError, SyncStore,
};
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::watch;
use tokio_cron_scheduler::{Job, JobScheduler};
pub use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "lsync-sync";

pub const DEFAULT_BATCH_SIZE: u32 = 50;
pub const DEFAULT_DELAY_MS: u64 = 1000;
pub const MAX_BATCH_SIZE: u32 = 10_000;
pub const DEFAULT_STALE_THRESHOLD: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_HISTORY_LIMIT: u32 = 10;
pub const MAX_HISTORY_LIMIT: u32 = 100;
pub const STALE_RUN_MESSAGE: &str = "stale run: no progress within threshold";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// `None` runs against in-memory stores.
    pub database_url: Option<String>,
    pub registry_path: PathBuf,
    pub web_port: u16,
    pub default_batch_size: u32,
    pub default_delay_ms: u64,
    pub stale_threshold: Duration,
    pub fetch_backoff: BackoffPolicy,
    pub scheduler_enabled: bool,
    pub instance_id: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            registry_path: PathBuf::from("./sync.yaml"),
            web_port: 8000,
            default_batch_size: DEFAULT_BATCH_SIZE,
            default_delay_ms: DEFAULT_DELAY_MS,
            stale_threshold: DEFAULT_STALE_THRESHOLD,
            fetch_backoff: BackoffPolicy::default(),
            scheduler_enabled: false,
            instance_id: format!("lsync-{}", Uuid::new_v4()),
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: std::env::var("DATABASE_URL").ok().filter(|v| !v.trim().is_empty()),
            registry_path: std::env::var("LSYNC_CONFIG")
                .map(PathBuf::from)
                .unwrap_or(defaults.registry_path),
            web_port: env_or("LSYNC_WEB_PORT", defaults.web_port),
            default_batch_size: env_or("LSYNC_DEFAULT_BATCH_SIZE", defaults.default_batch_size),
            default_delay_ms: env_or("LSYNC_DEFAULT_DELAY_MS", defaults.default_delay_ms),
            stale_threshold: Duration::from_secs(env_or(
                "LSYNC_STALE_THRESHOLD_SECS",
                defaults.stale_threshold.as_secs(),
            )),
            fetch_backoff: BackoffPolicy {
                max_retries: env_or("LSYNC_MAX_FETCH_RETRIES", defaults.fetch_backoff.max_retries),
                ..defaults.fetch_backoff
            },
            scheduler_enabled: std::env::var("LSYNC_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            instance_id: std::env::var("LSYNC_INSTANCE_ID").unwrap_or(defaults.instance_id),
        }
    }
}

pub async fn load_registry_config(path: &Path) -> Result<RegistryConfig> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Loads `sync.yaml`; relative fixture directories resolve against the file's own directory.
pub async fn load_registry(path: &Path) -> Result<ConfiguredRegistry> {
    let config = load_registry_config(path).await?;
    let base_dir = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    Ok(ConfiguredRegistry::new(config, base_dir))
}

pub type Stores = (Arc<dyn SyncStore>, Arc<dyn CanonicalStore>);

/// Postgres when `DATABASE_URL` is set (migrations applied), otherwise a shared in-memory store.
pub async fn open_stores(config: &SyncConfig) -> Result<Stores> {
    match &config.database_url {
        Some(url) => {
            let store = PgStore::connect(url).await.context("connecting to sync database")?;
            store.migrate().await.context("applying sync store migrations")?;
            let store = Arc::new(store);
            Ok((store.clone(), store))
        }
        None => {
            warn!("DATABASE_URL not set; sync state is kept in memory only");
            let store = Arc::new(MemoryStore::new());
            Ok((store.clone(), store))
        }
    }
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("a {job_type} sync is already running (log {active_id})")]
    AlreadyRunning { job_type: SyncJobType, active_id: i64 },
    #[error("no {job_type} sync is running")]
    NotRunning { job_type: SyncJobType },
    #[error("{0} not found")]
    NotFound(String),
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error("job type {0} is not configured")]
    NotConfigured(SyncJobType),
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for SupervisorError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::AlreadyRunning { job_type, active_id } => {
                SupervisorError::AlreadyRunning { job_type, active_id }
            }
            StoreError::NotFound(what) => SupervisorError::NotFound(what),
            other => SupervisorError::Store(other),
        }
    }
}

impl From<AdapterError> for SupervisorError {
    fn from(err: AdapterError) -> Self {
        match err {
            AdapterError::NotConfigured(job_type) => SupervisorError::NotConfigured(job_type),
            other => SupervisorError::Invalid(other.to_string()),
        }
    }
}

/// Outcome of reconciling one canonical record against the local copy.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Create,
    Update {
        changes: Vec<FieldChange>,
        conflicts: Vec<ConflictField>,
    },
    Skip,
    /// Only canonical-owned fields differ; nothing is written.
    Conflict { conflicts: Vec<ConflictField> },
}

/// Field-level diff driven by the authority table. Null legacy values never blank a local value.
pub fn reconcile(
    record: &CanonicalRecord,
    existing: Option<&LocalRecord>,
    authority: &FieldAuthority,
) -> Decision {
    let Some(local) = existing else {
        return Decision::Create;
    };

    let mut changes = Vec::new();
    let mut conflicts = Vec::new();
    for (field, legacy) in &record.fields {
        if legacy.is_null() {
            continue;
        }
        let current = local.fields.get(field).unwrap_or(&JsonValue::Null);
        if current == legacy {
            continue;
        }
        match authority.authority_for(field) {
            Authority::Legacy => changes.push(FieldChange {
                field: field.clone(),
                before: current.clone(),
                after: legacy.clone(),
            }),
            Authority::Canonical => conflicts.push(ConflictField {
                field: field.clone(),
                local: current.clone(),
                legacy: legacy.clone(),
            }),
        }
    }

    match (changes.is_empty(), conflicts.is_empty()) {
        (true, true) => Decision::Skip,
        (true, false) => Decision::Conflict { conflicts },
        (false, _) => Decision::Update { changes, conflicts },
    }
}

/// Sleeps for `delay`, returning early once the token is cancelled.
pub async fn pause(delay: Duration, token: &CancellationToken) {
    if delay.is_zero() {
        return;
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => {}
        _ = token.cancelled() => {}
    }
}

enum RunEnd {
    Completed,
    Cancelled,
    Failed(String),
}

struct RunState {
    counters: SyncCounters,
    total: u64,
    metric: Option<Box<dyn MetricAccumulator>>,
    started: bool,
}

impl RunState {
    fn progress(&self) -> ProgressUpdate {
        ProgressUpdate {
            total_units: self.total.max(self.counters.processed),
            counters: self.counters,
            domain_scalar: self.metric.as_ref().and_then(|m| m.value()),
        }
    }
}

struct Applied {
    detail: Option<NewSyncDetail>,
    local: Option<LocalRecord>,
    counters: SyncCounters,
}

/// Drives one sync run from first fetch to a terminal status.
#[derive(Clone)]
pub struct BatchRunner {
    sync_store: Arc<dyn SyncStore>,
    canonical: Arc<dyn CanonicalStore>,
    backoff: BackoffPolicy,
}

impl BatchRunner {
    pub fn new(sync_store: Arc<dyn SyncStore>, canonical: Arc<dyn CanonicalStore>, backoff: BackoffPolicy) -> Self {
        Self {
            sync_store,
            canonical,
            backoff,
        }
    }

    /// Per-record failures are recorded and the run continues. A store failure aborts the run
    /// as `failed` and is returned as `Err`.
    pub async fn run(
        &self,
        log: SyncLog,
        adapter: DomainAdapter,
        token: CancellationToken,
    ) -> Result<SyncLog, StoreError> {
        let span = info_span!("sync_run", job_type = %log.job_type, log_id = log.id);
        self.run_logged(log, adapter, token).instrument(span).await
    }

    async fn run_logged(
        &self,
        log: SyncLog,
        adapter: DomainAdapter,
        token: CancellationToken,
    ) -> Result<SyncLog, StoreError> {
        info!(scope = log.scope.kind(), batch_size = log.batch_size, delay_ms = log.delay_ms, "sync run starting");
        let mut state = RunState {
            counters: SyncCounters::default(),
            total: 0,
            metric: adapter.metric(),
            started: false,
        };
        let end = self.drive(&log, &adapter, &token, &mut state).await;
        adapter.connector.close().await;
        let progress = state.progress();

        match end {
            Ok(RunEnd::Completed) => {
                let done = self
                    .sync_store
                    .finish(log.id, SyncStatus::Completed, Some(progress), None)
                    .await?;
                info!(
                    processed = done.processed_units,
                    created = done.created_count,
                    updated = done.updated_count,
                    skipped = done.skipped_count,
                    conflicts = done.conflict_count,
                    errors = done.error_count,
                    "sync run completed"
                );
                Ok(done)
            }
            Ok(RunEnd::Cancelled) => {
                let done = self
                    .sync_store
                    .finish(log.id, SyncStatus::Cancelled, Some(progress), None)
                    .await?;
                info!(processed = done.processed_units, "sync run cancelled");
                Ok(done)
            }
            Ok(RunEnd::Failed(message)) => {
                error!(error = %message, "sync run failed");
                self.sync_store
                    .finish(log.id, SyncStatus::Failed, Some(progress), Some(message))
                    .await
            }
            Err(err) => {
                error!(error = %err, "sync run aborted by store failure");
                if let Err(finish_err) = self
                    .sync_store
                    .finish(log.id, SyncStatus::Failed, Some(progress), Some(err.to_string()))
                    .await
                {
                    warn!(error = %finish_err, "could not record failed status");
                }
                Err(err)
            }
        }
    }

    async fn drive(
        &self,
        log: &SyncLog,
        adapter: &DomainAdapter,
        token: &CancellationToken,
        state: &mut RunState,
    ) -> Result<RunEnd, StoreError> {
        let filter = FetchFilter::for_scope(&log.scope);
        state.total = match adapter.connector.count(&filter).await {
            Ok(total) => total.unwrap_or(0),
            Err(err) => {
                warn!(error = %err, "could not count legacy rows; total unknown");
                0
            }
        };

        let delay = Duration::from_millis(log.delay_ms);
        let mut cursor: Option<Cursor> = None;
        let mut batch_no = 0u64;
        loop {
            if batch_no > 0 {
                pause(delay, token).await;
            }
            if self.cancel_observed(log.id, token).await? {
                return Ok(RunEnd::Cancelled);
            }

            let batch = match self
                .fetch_with_retry(adapter.connector.as_ref(), cursor.as_ref(), log.batch_size, &filter)
                .await
            {
                Ok(batch) => batch,
                Err(err) => return Ok(RunEnd::Failed(format!("fetching batch {}: {err}", batch_no + 1))),
            };
            if !state.started {
                self.sync_store.mark_in_progress(log.id, state.total).await?;
                state.started = true;
            }
            if self.cancel_observed(log.id, token).await? {
                return Ok(RunEnd::Cancelled);
            }

            batch_no += 1;
            let rows = batch.rows.len();
            self.process_batch(log, adapter, batch.rows, state).await?;
            self.sync_store.record_progress(log.id, state.progress()).await?;
            info!(
                batch = batch_no,
                rows,
                processed = state.counters.processed,
                total = state.total,
                "batch reconciled"
            );

            if batch.exhausted || (rows == 0 && batch.next_cursor.is_none()) {
                return Ok(RunEnd::Completed);
            }
            cursor = batch.next_cursor;
        }
    }

    /// Checks the in-process token and the persisted flag set by other instances.
    async fn cancel_observed(&self, log_id: i64, token: &CancellationToken) -> Result<bool, StoreError> {
        if token.is_cancelled() {
            return Ok(true);
        }
        let requested = self
            .sync_store
            .get_log(log_id)
            .await?
            .is_some_and(|log| log.cancel_requested);
        if requested {
            token.cancel();
        }
        Ok(requested)
    }

    async fn fetch_with_retry(
        &self,
        connector: &dyn LegacyConnector,
        cursor: Option<&Cursor>,
        batch_size: u32,
        filter: &FetchFilter,
    ) -> Result<FetchedBatch, ConnectorError> {
        let mut attempt = 0;
        loop {
            let span = info_span!("batch_fetch", source_id = connector.source_id(), attempt);
            match connector.fetch(cursor, batch_size, filter).instrument(span).await {
                Ok(batch) => return Ok(batch),
                Err(err)
                    if err.disposition() == RetryDisposition::Retryable && attempt < self.backoff.max_retries =>
                {
                    let delay = self.backoff.delay_for_attempt(attempt);
                    warn!(error = %err, attempt = attempt + 1, delay_ms = delay.as_millis() as u64, "legacy fetch failed; retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn process_batch(
        &self,
        log: &SyncLog,
        adapter: &DomainAdapter,
        rows: Vec<LegacyRow>,
        state: &mut RunState,
    ) -> Result<(), StoreError> {
        let mut batch = SyncCounters::default();
        let mut details = Vec::with_capacity(rows.len());
        let mut mapped = Vec::with_capacity(rows.len());

        for row in &rows {
            batch.processed += 1;
            match adapter.mapper.map(row) {
                Ok(record) => {
                    if let Some(metric) = state.metric.as_mut() {
                        metric.observe(&record);
                    }
                    mapped.push(record);
                }
                Err(err) => {
                    let key = adapter
                        .mapper
                        .record_id(row)
                        .map(|id| ExternalKey::new(adapter.job_type, &row.source_id, id).to_string())
                        .unwrap_or_else(|| format!("{}:{}:?", adapter.job_type, row.source_id));
                    warn!(key = %key, error = %err, "legacy row could not be mapped");
                    batch.errors += 1;
                    details.push(NewSyncDetail::error(key, &err.to_string()));
                }
            }
        }

        let keys = mapped.iter().map(|r| r.key.clone()).collect::<Vec<_>>();
        let mut existing = self.canonical.load(&keys).await?;
        for record in mapped {
            let local = existing.get(&record.key).cloned();
            let decision = reconcile(&record, local.as_ref(), &adapter.authority);
            match self.apply(&record, local.as_ref(), decision).await {
                Ok(applied) => {
                    batch.absorb(&applied.counters);
                    if let Some(written) = applied.local {
                        existing.insert(record.key.clone(), written);
                    }
                    details.extend(applied.detail);
                }
                Err(err) if err.is_record_scoped() => {
                    warn!(key = %record.key, error = %err, "record write rejected");
                    batch.errors += 1;
                    details.push(NewSyncDetail::error(record.key.to_string(), &err.to_string()));
                }
                Err(err) => return Err(err),
            }
        }

        self.sync_store.insert_details(log.id, &details).await?;
        state.counters.absorb(&batch);
        Ok(())
    }

    async fn apply(
        &self,
        record: &CanonicalRecord,
        local: Option<&LocalRecord>,
        decision: Decision,
    ) -> Result<Applied, StoreError> {
        let mut counters = SyncCounters::default();
        match (decision, local) {
            (Decision::Create, _) => {
                let written = self.canonical.insert(record).await?;
                counters.created = 1;
                Ok(Applied {
                    detail: Some(NewSyncDetail::created(&record.key, &record.fields)),
                    local: Some(written),
                    counters,
                })
            }
            (Decision::Update { changes, conflicts }, Some(local)) => {
                let values = changes
                    .iter()
                    .map(|c| (c.field.clone(), c.after.clone()))
                    .collect::<BTreeMap<_, _>>();
                let written = self.canonical.update_fields(local, &values).await?;
                counters.updated = 1;
                counters.conflicts = u64::from(!conflicts.is_empty());
                Ok(Applied {
                    detail: Some(NewSyncDetail::updated(&record.key, changes, conflicts)),
                    local: Some(written),
                    counters,
                })
            }
            (Decision::Conflict { conflicts }, _) => {
                counters.skipped = 1;
                counters.conflicts = 1;
                Ok(Applied {
                    detail: Some(NewSyncDetail::conflict(&record.key, conflicts)),
                    local: None,
                    counters,
                })
            }
            (Decision::Skip, _) | (Decision::Update { .. }, None) => {
                counters.skipped = 1;
                Ok(Applied {
                    detail: None,
                    local: None,
                    counters,
                })
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Running,
    Succeeded,
    SucceededWithWarnings,
    Failed,
    Cancelled,
}

impl Outcome {
    pub fn of(log: &SyncLog) -> Self {
        match log.status {
            SyncStatus::Pending | SyncStatus::InProgress => Outcome::Running,
            SyncStatus::Completed if log.error_count > 0 => Outcome::SucceededWithWarnings,
            SyncStatus::Completed => Outcome::Succeeded,
            SyncStatus::Failed => Outcome::Failed,
            SyncStatus::Cancelled => Outcome::Cancelled,
        }
    }
}

/// Derived, read-time view of a run's progress.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub log_id: i64,
    pub status: SyncStatus,
    pub outcome: Outcome,
    pub processed_units: u64,
    pub total_units: Option<u64>,
    pub percent: Option<f64>,
    pub elapsed_seconds: f64,
    pub throughput_per_second: Option<f64>,
    pub eta_seconds: Option<f64>,
    pub counters: SyncCounters,
    pub domain_scalar: Option<f64>,
    pub error_message: Option<String>,
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusView {
    pub is_running: bool,
    pub sync_log: Option<SyncLog>,
    pub progress: Option<ProgressSnapshot>,
}

/// Read-only access to run state for status polling, history and audit drill-down.
#[derive(Clone)]
pub struct ProgressReporter {
    store: Arc<dyn SyncStore>,
}

impl ProgressReporter {
    pub fn new(store: Arc<dyn SyncStore>) -> Self {
        Self { store }
    }

    pub fn snapshot(log: &SyncLog, now: DateTime<Utc>) -> ProgressSnapshot {
        let end = log.completed_at.unwrap_or(now);
        let elapsed = ((end - log.started_at).num_milliseconds().max(0) as f64) / 1000.0;
        let processed = log.processed_units;
        let total = (log.total_units > 0).then_some(log.total_units);

        let percent = match (log.status, total) {
            (SyncStatus::Completed, _) => Some(100.0),
            (_, Some(total)) => Some(round2((processed as f64 / total as f64 * 100.0).min(100.0))),
            (_, None) => None,
        };
        let throughput = (elapsed > 0.0 && processed > 0).then(|| processed as f64 / elapsed);
        let eta = match (log.status.is_active(), throughput, total) {
            (true, Some(rate), Some(total)) if rate > 0.0 => {
                Some(round2(total.saturating_sub(processed) as f64 / rate))
            }
            _ => None,
        };

        ProgressSnapshot {
            log_id: log.id,
            status: log.status,
            outcome: Outcome::of(log),
            processed_units: processed,
            total_units: total,
            percent,
            elapsed_seconds: round2(elapsed),
            throughput_per_second: throughput.map(round2),
            eta_seconds: eta,
            counters: log.counters(),
            domain_scalar: log.domain_scalar,
            error_message: log.error_message.clone(),
        }
    }

    /// The active run if there is one, else the most recent run.
    pub async fn status(&self, job_type: SyncJobType) -> Result<StatusView, SupervisorError> {
        let active = self.store.active_log(job_type).await?;
        let is_running = active.is_some();
        let latest = match active {
            Some(log) => Some(log),
            None => self.store.history(job_type, 1).await?.into_iter().next(),
        };
        let progress = latest.as_ref().map(|log| Self::snapshot(log, Utc::now()));
        Ok(StatusView {
            is_running,
            sync_log: latest,
            progress,
        })
    }

    pub async fn history(&self, job_type: SyncJobType, limit: u32) -> Result<Vec<SyncLog>, SupervisorError> {
        let limit = limit.clamp(1, MAX_HISTORY_LIMIT);
        Ok(self.store.history(job_type, limit).await?)
    }

    pub async fn details(
        &self,
        job_type: SyncJobType,
        log_id: i64,
        page: u32,
        limit: u32,
    ) -> Result<Page<SyncDetail>, SupervisorError> {
        match self.store.get_log(log_id).await? {
            Some(log) if log.job_type == job_type => {}
            _ => return Err(SupervisorError::NotFound(format!("{job_type} sync log {log_id}"))),
        }
        Ok(self.store.details(log_id, page.max(1), limit.clamp(1, MAX_HISTORY_LIMIT)).await?)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartOptions {
    pub batch_size: Option<u32>,
    pub delay_ms: Option<u64>,
    pub initiated_by: Option<String>,
}

struct LiveRun {
    log_id: i64,
    token: CancellationToken,
}

type LiveRuns = Arc<Mutex<HashMap<SyncJobType, LiveRun>>>;
type RunCompletions = Arc<Mutex<HashMap<i64, watch::Receiver<bool>>>>;

/// Held by a spawned run; dropping it, on return or unwind, signals waiters
/// and drops the run's entry.
struct CompletionGuard {
    log_id: i64,
    completions: RunCompletions,
    done: watch::Sender<bool>,
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        self.completions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.log_id);
        self.done.send_replace(true);
    }
}

/// Starts, stops and cleans up runs. At most one active run per job type, enforced by the store.
#[derive(Clone)]
pub struct JobSupervisor {
    config: SyncConfig,
    sync_store: Arc<dyn SyncStore>,
    registry: Arc<dyn AdapterRegistry>,
    runner: BatchRunner,
    reporter: ProgressReporter,
    live: LiveRuns,
    completions: RunCompletions,
}

impl JobSupervisor {
    pub fn new(
        config: SyncConfig,
        sync_store: Arc<dyn SyncStore>,
        canonical: Arc<dyn CanonicalStore>,
        registry: Arc<dyn AdapterRegistry>,
    ) -> Self {
        let runner = BatchRunner::new(sync_store.clone(), canonical, config.fetch_backoff);
        let reporter = ProgressReporter::new(sync_store.clone());
        Self {
            config,
            sync_store,
            registry,
            runner,
            reporter,
            live: Arc::new(Mutex::new(HashMap::new())),
            completions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn reporter(&self) -> &ProgressReporter {
        &self.reporter
    }

    pub fn configured_job_types(&self) -> Vec<SyncJobType> {
        self.registry.configured_job_types()
    }

    #[cfg(test)]
    fn tracked_runs(&self) -> usize {
        self.completions.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn live_ids(&self) -> Vec<i64> {
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|run| run.log_id)
            .collect()
    }

    async fn resolve_scope(&self, job_type: SyncJobType, scope: SyncScope) -> Result<SyncScope, SupervisorError> {
        match scope {
            SyncScope::Subset { entity_ids } => {
                let entity_ids = entity_ids
                    .into_iter()
                    .map(|id| id.trim().to_string())
                    .filter(|id| !id.is_empty())
                    .collect::<Vec<_>>();
                if entity_ids.is_empty() {
                    return Err(SupervisorError::Invalid("subset scope needs at least one entity id".into()));
                }
                Ok(SyncScope::Subset { entity_ids })
            }
            SyncScope::Incremental { since: None } => {
                let since = self
                    .sync_store
                    .last_completed(job_type)
                    .await?
                    .map(|log| log.started_at);
                if since.is_none() {
                    info!(job_type = %job_type, "no completed run yet; incremental sync covers everything");
                }
                Ok(SyncScope::Incremental { since })
            }
            other => Ok(other),
        }
    }

    /// Validates, creates the log atomically and spawns the runner. Returns the pending log.
    pub async fn start(
        &self,
        job_type: SyncJobType,
        scope: SyncScope,
        options: StartOptions,
    ) -> Result<SyncLog, SupervisorError> {
        let batch_size = options.batch_size.unwrap_or(self.config.default_batch_size);
        if !(1..=MAX_BATCH_SIZE).contains(&batch_size) {
            return Err(SupervisorError::Invalid(format!(
                "batchSize must be between 1 and {MAX_BATCH_SIZE}, got {batch_size}"
            )));
        }
        let delay_ms = options.delay_ms.unwrap_or(self.config.default_delay_ms);
        let adapter = self.registry.adapter_for(job_type)?;
        let scope = self.resolve_scope(job_type, scope).await?;

        let log = self
            .sync_store
            .create_log(NewSyncLog {
                job_type,
                scope,
                batch_size,
                delay_ms,
                initiated_by: options.initiated_by,
                owner_instance: Some(self.config.instance_id.clone()),
            })
            .await?;

        let token = CancellationToken::new();
        self.live.lock().unwrap_or_else(PoisonError::into_inner).insert(
            job_type,
            LiveRun {
                log_id: log.id,
                token: token.clone(),
            },
        );

        let (done, done_rx) = watch::channel(false);
        self.completions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(log.id, done_rx);
        let guard = CompletionGuard {
            log_id: log.id,
            completions: self.completions.clone(),
            done,
        };

        let runner = self.runner.clone();
        let live = self.live.clone();
        let run_log = log.clone();
        tokio::spawn(async move {
            let _guard = guard;
            let log_id = run_log.id;
            if let Err(err) = runner.run(run_log, adapter, token).await {
                error!(job_type = %job_type, log_id, error = %err, "sync run ended with a store failure");
            }
            let mut live = live.lock().unwrap_or_else(PoisonError::into_inner);
            if live.get(&job_type).is_some_and(|run| run.log_id == log_id) {
                live.remove(&job_type);
            }
        });

        info!(job_type = %job_type, log_id = log.id, scope = log.scope.kind(), "sync run scheduled");
        Ok(log)
    }

    /// Requests a cooperative stop and returns at once; the runner finishes its current batch.
    pub async fn stop(&self, job_type: SyncJobType, log_id: Option<i64>) -> Result<SyncLog, SupervisorError> {
        let target = match log_id {
            Some(id) => self
                .sync_store
                .get_log(id)
                .await?
                .filter(|log| log.job_type == job_type && log.is_active()),
            None => self.sync_store.active_log(job_type).await?,
        };
        let Some(target) = target else {
            return Err(SupervisorError::NotRunning { job_type });
        };

        let updated = match self.sync_store.request_cancel(target.id).await {
            Ok(log) => log,
            Err(StoreError::InvalidTransition { .. }) => return Err(SupervisorError::NotRunning { job_type }),
            Err(err) => return Err(err.into()),
        };
        if let Some(run) = self
            .live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&job_type)
            .filter(|run| run.log_id == target.id)
        {
            run.token.cancel();
        }
        info!(job_type = %job_type, log_id = target.id, "stop requested");
        Ok(updated)
    }

    pub async fn status(&self, job_type: SyncJobType) -> Result<StatusView, SupervisorError> {
        self.reporter.status(job_type).await
    }

    pub async fn history(&self, job_type: SyncJobType, limit: u32) -> Result<Vec<SyncLog>, SupervisorError> {
        self.reporter.history(job_type, limit).await
    }

    pub async fn details(
        &self,
        job_type: SyncJobType,
        log_id: i64,
        page: u32,
        limit: u32,
    ) -> Result<Page<SyncDetail>, SupervisorError> {
        self.reporter.details(job_type, log_id, page, limit).await
    }

    /// Fails active logs without progress inside the stale threshold, sparing runs this process owns.
    pub async fn cleanup_stale(&self, job_type: Option<SyncJobType>) -> Result<Vec<i64>, SupervisorError> {
        let threshold = chrono::Duration::from_std(self.config.stale_threshold)
            .unwrap_or_else(|_| chrono::Duration::minutes(30));
        let stale_before = Utc::now() - threshold;
        let cleaned = self
            .sync_store
            .fail_stale(job_type, stale_before, &self.live_ids(), STALE_RUN_MESSAGE)
            .await?;
        if !cleaned.is_empty() {
            info!(count = cleaned.len(), ?cleaned, "stale sync runs cleaned up");
        }
        Ok(cleaned)
    }

    /// Waits for a run started by this supervisor and returns its final log.
    pub async fn wait_for(&self, log_id: i64) -> Result<SyncLog, SupervisorError> {
        let pending = self
            .completions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&log_id)
            .cloned();
        if let Some(mut done) = pending {
            if done.wait_for(|finished| *finished).await.is_err() {
                error!(log_id, "sync task ended without signalling completion");
            }
        }
        self.sync_store
            .get_log(log_id)
            .await?
            .ok_or_else(|| SupervisorError::NotFound(format!("sync log {log_id}")))
    }

    /// Cron-driven incremental starts for every job type with a schedule.
    pub async fn maybe_build_scheduler(&self) -> Result<Option<JobScheduler>> {
        let schedules = self.registry.schedules();
        if !self.config.scheduler_enabled || schedules.is_empty() {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        for (job_type, cron) in schedules {
            let supervisor = self.clone();
            let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
                let supervisor = supervisor.clone();
                Box::pin(async move {
                    let options = StartOptions {
                        initiated_by: Some("scheduler".to_string()),
                        ..StartOptions::default()
                    };
                    match supervisor
                        .start(job_type, SyncScope::Incremental { since: None }, options)
                        .await
                    {
                        Ok(log) => info!(job_type = %job_type, log_id = log.id, "scheduled sync started"),
                        Err(SupervisorError::AlreadyRunning { active_id, .. }) => {
                            warn!(job_type = %job_type, active_id, "scheduled sync skipped; a run is already active")
                        }
                        Err(err) => error!(job_type = %job_type, error = %err, "scheduled sync could not start"),
                    }
                })
            })
            .with_context(|| format!("creating scheduler job for {job_type} with cron {cron}"))?;
            sched.add(job).await.context("adding scheduler job")?;
        }
        Ok(Some(sched))
    }
}

/// Registry from `LSYNC_CONFIG`, stores from `DATABASE_URL`.
pub async fn build_supervisor(config: SyncConfig) -> Result<JobSupervisor> {
    let registry = load_registry(&config.registry_path).await?;
    let (sync_store, canonical) = open_stores(&config).await?;
    info!(
        instance_id = %config.instance_id,
        job_types = ?registry.configured_job_types(),
        "sync supervisor ready"
    );
    Ok(JobSupervisor::new(config, sync_store, canonical, Arc::new(registry)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use lsync_adapters::{builtin_table, MemoryConnector, StaticRegistry, TableSpec};
    use lsync_core::{DetailAction, Resolution};
    use serde_json::{json, Map as JsonMap};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Semaphore;

    type Rows = Arc<Mutex<Vec<JsonMap<String, JsonValue>>>>;

    fn object(value: JsonValue) -> JsonMap<String, JsonValue> {
        match value {
            JsonValue::Object(map) => map,
            _ => panic!("expected an object"),
        }
    }

    fn vehicle_rows(n: usize) -> Vec<JsonMap<String, JsonValue>> {
        (1..=n)
            .map(|i| {
                object(json!({
                    "id": i,
                    "garage_no": format!("P{i}"),
                    "active": 1,
                    "note": "legacy note",
                    "changed": "2024-03-01 10:00:00",
                }))
            })
            .collect()
    }

    fn test_config() -> SyncConfig {
        SyncConfig {
            default_delay_ms: 0,
            fetch_backoff: BackoffPolicy {
                max_retries: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
            },
            instance_id: "test-instance".into(),
            ..SyncConfig::default()
        }
    }

    fn supervisor_with(registry: StaticRegistry) -> (JobSupervisor, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let supervisor = JobSupervisor::new(test_config(), store.clone(), store.clone(), Arc::new(registry));
        (supervisor, store)
    }

    fn vehicles_from(rows: Rows) -> StaticRegistry {
        StaticRegistry::new().with(SyncJobType::Vehicles, move || {
            let current = rows.lock().unwrap().clone();
            Ok(DomainAdapter::new(
                SyncJobType::Vehicles,
                Box::new(MemoryConnector::new("ticketing", builtin_table(SyncJobType::Vehicles), current)),
            ))
        })
    }

    fn options(batch_size: u32) -> StartOptions {
        StartOptions {
            batch_size: Some(batch_size),
            delay_ms: Some(0),
            initiated_by: Some("test".into()),
        }
    }

    async fn run_to_end(supervisor: &JobSupervisor, job_type: SyncJobType, scope: SyncScope) -> SyncLog {
        let log = supervisor.start(job_type, scope, options(50)).await.unwrap();
        supervisor.wait_for(log.id).await.unwrap()
    }

    async fn all_details(store: &MemoryStore, log_id: i64) -> Vec<SyncDetail> {
        store.details(log_id, 1, 10_000).await.unwrap().data
    }

    /// Counts fetches; every fetch after the first waits for a permit.
    struct GatedConnector {
        inner: MemoryConnector,
        fetches: Arc<AtomicUsize>,
        gate: Option<Arc<Semaphore>>,
    }

    #[async_trait]
    impl LegacyConnector for GatedConnector {
        fn source_id(&self) -> &str {
            self.inner.source_id()
        }

        async fn fetch(
            &self,
            cursor: Option<&Cursor>,
            batch_size: u32,
            filter: &FetchFilter,
        ) -> Result<FetchedBatch, ConnectorError> {
            let seen = self.fetches.fetch_add(1, Ordering::SeqCst);
            if let (Some(gate), true) = (&self.gate, seen > 0) {
                gate.acquire().await.unwrap().forget();
            }
            self.inner.fetch(cursor, batch_size, filter).await
        }

        async fn count(&self, filter: &FetchFilter) -> Result<Option<u64>, ConnectorError> {
            self.inner.count(filter).await
        }
    }

    /// Fails the first `failures` fetches with a retryable error.
    struct FlakyConnector {
        inner: MemoryConnector,
        failures: usize,
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl LegacyConnector for FlakyConnector {
        fn source_id(&self) -> &str {
            self.inner.source_id()
        }

        async fn fetch(
            &self,
            cursor: Option<&Cursor>,
            batch_size: u32,
            filter: &FetchFilter,
        ) -> Result<FetchedBatch, ConnectorError> {
            if self.attempts.fetch_add(1, Ordering::SeqCst) < self.failures {
                return Err(ConnectorError::Unavailable {
                    source_id: "ticketing".into(),
                    message: "connection reset by peer".into(),
                });
            }
            self.inner.fetch(cursor, batch_size, filter).await
        }
    }

    fn gated_registry(rows: usize, fetches: Arc<AtomicUsize>, gate: Option<Arc<Semaphore>>) -> StaticRegistry {
        StaticRegistry::new().with(SyncJobType::Vehicles, move || {
            Ok(DomainAdapter::new(
                SyncJobType::Vehicles,
                Box::new(GatedConnector {
                    inner: MemoryConnector::new("ticketing", builtin_table(SyncJobType::Vehicles), vehicle_rows(rows)),
                    fetches: fetches.clone(),
                    gate: gate.clone(),
                }),
            ))
        })
    }

    async fn wait_until(condition: impl Fn() -> bool) {
        for _ in 0..2_000 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("condition not reached in time");
    }

    fn local(fields: JsonValue) -> LocalRecord {
        LocalRecord {
            local_id: Uuid::new_v4(),
            key: ExternalKey::new(SyncJobType::Vehicles, "ticketing", "1"),
            fields: serde_json::from_value(fields).unwrap(),
            fingerprint: String::new(),
            updated_at: Utc::now(),
        }
    }

    fn canonical(fields: JsonValue) -> CanonicalRecord {
        CanonicalRecord {
            key: ExternalKey::new(SyncJobType::Vehicles, "ticketing", "1"),
            fields: serde_json::from_value(fields).unwrap(),
            source_modified_at: None,
        }
    }

    #[test]
    fn reconcile_follows_the_authority_table() {
        let authority = FieldAuthority::with_canonical_fields(["note"]);
        let existing = local(json!({"garageNumber": "P1", "note": "curated"}));

        assert_eq!(reconcile(&canonical(json!({"garageNumber": "P1"})), None, &authority), Decision::Create);
        assert_eq!(
            reconcile(&canonical(json!({"garageNumber": "P1", "note": "curated"})), Some(&existing), &authority),
            Decision::Skip
        );
        assert_eq!(
            reconcile(&canonical(json!({"garageNumber": "P1", "note": "legacy"})), Some(&existing), &authority),
            Decision::Conflict {
                conflicts: vec![ConflictField {
                    field: "note".into(),
                    local: json!("curated"),
                    legacy: json!("legacy"),
                }]
            }
        );

        match reconcile(&canonical(json!({"garageNumber": "P2", "note": "legacy"})), Some(&existing), &authority) {
            Decision::Update { changes, conflicts } => {
                assert_eq!(changes.len(), 1);
                assert_eq!(changes[0].field, "garageNumber");
                assert_eq!(changes[0].before, json!("P1"));
                assert_eq!(conflicts.len(), 1);
            }
            other => panic!("expected update, got {other:?}"),
        }
    }

    #[test]
    fn absent_legacy_values_never_blank_local_values() {
        let authority = FieldAuthority::default();
        let existing = local(json!({"garageNumber": "P1", "imei": "3587"}));
        let decision = reconcile(&canonical(json!({"garageNumber": "P1", "imei": null})), Some(&existing), &authority);
        assert_eq!(decision, Decision::Skip);
    }

    #[tokio::test]
    async fn cancellation_token_interrupts_pause() {
        let token = CancellationToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move {
            let started = std::time::Instant::now();
            pause(Duration::from_secs(30), &waiter).await;
            started.elapsed()
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();
        let waited = handle.await.unwrap();
        assert!(waited < Duration::from_secs(5));
        assert!(token.is_cancelled());
        // already-cancelled tokens resolve immediately
        token.cancelled().await;
    }

    #[tokio::test]
    async fn full_run_creates_everything_in_three_batches() {
        let fetches = Arc::new(AtomicUsize::new(0));
        let (supervisor, store) = supervisor_with(gated_registry(120, fetches.clone(), None));

        let done = run_to_end(&supervisor, SyncJobType::Vehicles, SyncScope::Full).await;
        assert_eq!(done.status, SyncStatus::Completed);
        assert_eq!(done.total_units, 120);
        assert_eq!(done.processed_units, 120);
        assert_eq!(done.created_count, 120);
        assert_eq!(done.error_count, 0);
        assert!(!done.cancel_requested);
        assert_eq!(fetches.load(Ordering::SeqCst), 3);
        assert_eq!(store.local_records(SyncJobType::Vehicles).await.len(), 120);

        let details = all_details(&store, done.id).await;
        assert_eq!(details.len(), 120);
        assert!(details.iter().all(|d| d.action == DetailAction::Create));
        assert_eq!(details[0].external_key, "vehicles:ticketing:1");

        let status = supervisor.status(SyncJobType::Vehicles).await.unwrap();
        assert!(!status.is_running);
        let progress = status.progress.unwrap();
        assert_eq!(progress.outcome, Outcome::Succeeded);
        assert_eq!(progress.percent, Some(100.0));
    }

    #[tokio::test]
    async fn second_run_over_unchanged_data_skips_everything() {
        let rows: Rows = Arc::new(Mutex::new(vehicle_rows(120)));
        let (supervisor, store) = supervisor_with(vehicles_from(rows));

        let first = run_to_end(&supervisor, SyncJobType::Vehicles, SyncScope::Full).await;
        let second = run_to_end(&supervisor, SyncJobType::Vehicles, SyncScope::Full).await;
        assert_eq!(second.status, SyncStatus::Completed);
        assert_eq!(second.created_count, 0);
        assert_eq!(second.updated_count, 0);
        assert_eq!(second.skipped_count, second.total_units);
        assert_eq!(second.skipped_count, 120);

        // unchanged records leave no audit rows
        assert_eq!(all_details(&store, first.id).await.len(), 120);
        assert!(all_details(&store, second.id).await.is_empty());
        assert_eq!(store.details(second.id, 1, 50).await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn canonical_owned_changes_become_conflicts() {
        let rows: Rows = Arc::new(Mutex::new(vehicle_rows(3)));
        let (supervisor, store) = supervisor_with(vehicles_from(rows.clone()));
        run_to_end(&supervisor, SyncJobType::Vehicles, SyncScope::Full).await;

        {
            let mut rows = rows.lock().unwrap();
            // note is canonical-owned for vehicles; garage number follows legacy
            rows[0].insert("note".into(), json!("changed in legacy"));
            rows[1].insert("note".into(), json!("changed in legacy"));
            rows[1].insert("garage_no".into(), json!("P200"));
        }
        let second = run_to_end(&supervisor, SyncJobType::Vehicles, SyncScope::Full).await;
        assert_eq!(second.status, SyncStatus::Completed);
        assert_eq!(second.updated_count, 1);
        assert_eq!(second.skipped_count, 2);
        assert_eq!(second.conflict_count, 2);

        let details = all_details(&store, second.id).await;
        let conflict = details
            .iter()
            .find(|d| d.external_key == "vehicles:ticketing:1")
            .unwrap();
        assert_eq!(conflict.action, DetailAction::Skip);
        assert_eq!(conflict.resolution, Resolution::ManualPending);
        assert_eq!(conflict.conflict_fields[0].field, "note");

        let mixed = details
            .iter()
            .find(|d| d.external_key == "vehicles:ticketing:2")
            .unwrap();
        assert_eq!(mixed.action, DetailAction::Update);
        assert_eq!(mixed.resolution, Resolution::ManualPending);
        assert_eq!(mixed.field_changes.len(), 1);
        assert_eq!(mixed.field_changes[0].after, json!("P200"));

        let locals = store.local_records(SyncJobType::Vehicles).await;
        let first = locals.iter().find(|r| r.key.record_id == "1").unwrap();
        assert_eq!(first.fields["note"], json!("legacy note"));
        let second_local = locals.iter().find(|r| r.key.record_id == "2").unwrap();
        assert_eq!(second_local.fields["garageNumber"], json!("P200"));
        assert_eq!(second_local.fields["note"], json!("legacy note"));
    }

    #[tokio::test]
    async fn malformed_rows_are_recorded_and_the_run_completes() {
        let mut rows = vehicle_rows(10);
        rows[3].remove("id");
        let rows: Rows = Arc::new(Mutex::new(rows));
        let (supervisor, store) = supervisor_with(vehicles_from(rows));

        let done = run_to_end(&supervisor, SyncJobType::Vehicles, SyncScope::Full).await;
        assert_eq!(done.status, SyncStatus::Completed);
        assert_eq!(done.processed_units, 10);
        assert_eq!(done.created_count, 9);
        assert_eq!(done.error_count, 1);

        let errors = all_details(&store, done.id)
            .await
            .into_iter()
            .filter(|d| d.action == DetailAction::Error)
            .collect::<Vec<_>>();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].error_message.as_deref().unwrap().contains("no id column"));
        assert_eq!(Outcome::of(&done), Outcome::SucceededWithWarnings);
    }

    #[tokio::test]
    async fn second_start_is_rejected_without_creating_a_log() {
        let fetches = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Semaphore::new(0));
        let (supervisor, store) = supervisor_with(gated_registry(120, fetches.clone(), Some(gate.clone())));

        let first = supervisor
            .start(SyncJobType::Vehicles, SyncScope::Full, options(50))
            .await
            .unwrap();
        let err = supervisor
            .start(SyncJobType::Vehicles, SyncScope::Full, options(50))
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::AlreadyRunning { active_id, .. } if active_id == first.id));
        assert_eq!(store.history(SyncJobType::Vehicles, 10).await.unwrap().len(), 1);

        gate.add_permits(10);
        let done = supervisor.wait_for(first.id).await.unwrap();
        assert_eq!(done.status, SyncStatus::Completed);
    }

    #[tokio::test]
    async fn stop_after_first_batch_keeps_completed_work() {
        let fetches = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Semaphore::new(0));
        let (supervisor, store) = supervisor_with(gated_registry(120, fetches.clone(), Some(gate.clone())));

        let log = supervisor
            .start(SyncJobType::Vehicles, SyncScope::Full, options(50))
            .await
            .unwrap();
        let counter = fetches.clone();
        wait_until(move || counter.load(Ordering::SeqCst) >= 2).await;

        let status = supervisor.status(SyncJobType::Vehicles).await.unwrap();
        assert!(status.is_running);
        assert_eq!(status.sync_log.unwrap().processed_units, 50);

        let stopping = supervisor.stop(SyncJobType::Vehicles, None).await.unwrap();
        assert!(stopping.cancel_requested);
        gate.add_permits(1);

        let done = supervisor.wait_for(log.id).await.unwrap();
        assert_eq!(done.status, SyncStatus::Cancelled);
        assert_eq!(done.processed_units, 50);
        assert_eq!(done.created_count, 50);
        assert_eq!(store.count(SyncJobType::Vehicles).await.unwrap(), 50);
        assert_eq!(Outcome::of(&done), Outcome::Cancelled);
    }

    #[tokio::test]
    async fn persisted_cancel_flag_alone_stops_the_run() {
        let fetches = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Semaphore::new(0));
        let (supervisor, store) = supervisor_with(gated_registry(120, fetches.clone(), Some(gate.clone())));

        let log = supervisor
            .start(SyncJobType::Vehicles, SyncScope::Full, options(50))
            .await
            .unwrap();
        let counter = fetches.clone();
        wait_until(move || counter.load(Ordering::SeqCst) >= 2).await;

        // another instance flips the flag; the in-process token is never cancelled
        store.request_cancel(log.id).await.unwrap();
        gate.add_permits(1);

        let done = supervisor.wait_for(log.id).await.unwrap();
        assert_eq!(done.status, SyncStatus::Cancelled);
        assert!(done.cancel_requested);
        assert_eq!(done.processed_units, 50);
        assert_eq!(store.count(SyncJobType::Vehicles).await.unwrap(), 50);
    }

    #[tokio::test]
    async fn finished_runs_release_their_completion_entries() {
        let fetches = Arc::new(AtomicUsize::new(0));
        let (supervisor, store) = supervisor_with(gated_registry(120, fetches, None));

        let mut ids = Vec::new();
        for _ in 0..5 {
            let log = supervisor
                .start(SyncJobType::Vehicles, SyncScope::Full, options(50))
                .await
                .unwrap();
            ids.push(log.id);
            wait_until(|| supervisor.tracked_runs() == 0).await;
        }

        for id in ids {
            let log = store.get_log(id).await.unwrap().unwrap();
            assert_eq!(log.status, SyncStatus::Completed);
            // waiting after the fact still resolves from the stored log
            assert_eq!(supervisor.wait_for(id).await.unwrap().status, SyncStatus::Completed);
        }
        assert_eq!(supervisor.tracked_runs(), 0);
    }

    #[tokio::test]
    async fn stop_without_an_active_run_is_not_running() {
        let rows: Rows = Arc::new(Mutex::new(vehicle_rows(5)));
        let (supervisor, _store) = supervisor_with(vehicles_from(rows));
        assert!(matches!(
            supervisor.stop(SyncJobType::Vehicles, None).await,
            Err(SupervisorError::NotRunning { .. })
        ));

        let done = run_to_end(&supervisor, SyncJobType::Vehicles, SyncScope::Full).await;
        assert!(matches!(
            supervisor.stop(SyncJobType::Vehicles, Some(done.id)).await,
            Err(SupervisorError::NotRunning { .. })
        ));
    }

    #[tokio::test]
    async fn transient_fetch_failures_are_retried_within_budget() {
        let registry = |failures: usize| {
            StaticRegistry::new().with(SyncJobType::Vehicles, move || {
                Ok(DomainAdapter::new(
                    SyncJobType::Vehicles,
                    Box::new(FlakyConnector {
                        inner: MemoryConnector::new("ticketing", builtin_table(SyncJobType::Vehicles), vehicle_rows(20)),
                        failures,
                        attempts: AtomicUsize::new(0),
                    }),
                ))
            })
        };

        let (supervisor, _store) = supervisor_with(registry(2));
        let done = run_to_end(&supervisor, SyncJobType::Vehicles, SyncScope::Full).await;
        assert_eq!(done.status, SyncStatus::Completed);
        assert_eq!(done.created_count, 20);

        let (supervisor, _store) = supervisor_with(registry(10));
        let done = run_to_end(&supervisor, SyncJobType::Vehicles, SyncScope::Full).await;
        assert_eq!(done.status, SyncStatus::Failed);
        assert!(done.error_message.as_deref().unwrap().contains("connection reset by peer"));
        assert_eq!(Outcome::of(&done), Outcome::Failed);
    }

    #[tokio::test]
    async fn invalid_starts_create_no_log() {
        let rows: Rows = Arc::new(Mutex::new(vehicle_rows(5)));
        let (supervisor, store) = supervisor_with(vehicles_from(rows));

        assert!(matches!(
            supervisor.start(SyncJobType::Vehicles, SyncScope::Full, options(0)).await,
            Err(SupervisorError::Invalid(_))
        ));
        assert!(matches!(
            supervisor.start(SyncJobType::Vehicles, SyncScope::Full, options(10_001)).await,
            Err(SupervisorError::Invalid(_))
        ));
        assert!(matches!(
            supervisor
                .start(SyncJobType::Vehicles, SyncScope::Subset { entity_ids: vec![" ".into()] }, options(50))
                .await,
            Err(SupervisorError::Invalid(_))
        ));
        assert!(matches!(
            supervisor.start(SyncJobType::Stops, SyncScope::Full, options(50)).await,
            Err(SupervisorError::NotConfigured(SyncJobType::Stops))
        ));
        assert!(store.history(SyncJobType::Vehicles, 10).await.unwrap().is_empty());
        assert!(store.history(SyncJobType::Stops, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn subset_scope_touches_only_listed_records() {
        let rows: Rows = Arc::new(Mutex::new(vehicle_rows(30)));
        let (supervisor, store) = supervisor_with(vehicles_from(rows));
        let done = run_to_end(
            &supervisor,
            SyncJobType::Vehicles,
            SyncScope::Subset {
                entity_ids: vec!["3".into(), "17".into()],
            },
        )
        .await;
        assert_eq!(done.created_count, 2);
        assert_eq!(done.total_units, 2);
        let ids = store
            .local_records(SyncJobType::Vehicles)
            .await
            .into_iter()
            .map(|r| r.key.record_id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["17".to_string(), "3".to_string()]);
    }

    #[tokio::test]
    async fn incremental_scope_starts_from_last_completed_run() {
        let rows: Rows = Arc::new(Mutex::new(vehicle_rows(4)));
        let (supervisor, _store) = supervisor_with(vehicles_from(rows));

        let first = run_to_end(&supervisor, SyncJobType::Vehicles, SyncScope::Incremental { since: None }).await;
        assert_eq!(first.scope, SyncScope::Incremental { since: None });
        assert_eq!(first.created_count, 4);

        let second = supervisor
            .start(SyncJobType::Vehicles, SyncScope::Incremental { since: None }, options(50))
            .await
            .unwrap();
        assert_eq!(
            second.scope,
            SyncScope::Incremental {
                since: Some(first.started_at)
            }
        );
        supervisor.wait_for(second.id).await.unwrap();
    }

    #[tokio::test]
    async fn incremental_window_filters_on_modified_column() {
        let mut rows = vehicle_rows(5);
        rows[2].insert("changed".into(), json!("2030-01-01 00:00:00"));
        let registry = StaticRegistry::new().with(SyncJobType::Vehicles, move || {
            Ok(DomainAdapter::new(
                SyncJobType::Vehicles,
                Box::new(MemoryConnector::new(
                    "ticketing",
                    TableSpec::new("bus_vehicle", "id", Some("changed")),
                    rows.clone(),
                )),
            ))
        });
        let (supervisor, _store) = supervisor_with(registry);
        let since = "2029-01-01T00:00:00Z".parse().unwrap();
        let done = run_to_end(&supervisor, SyncJobType::Vehicles, SyncScope::Incremental { since: Some(since) }).await;
        assert_eq!(done.processed_units, 1);
        assert_eq!(done.created_count, 1);
    }

    #[tokio::test]
    async fn cleanup_spares_live_and_recent_runs() {
        let fetches = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Semaphore::new(0));
        let (supervisor, store) = supervisor_with(gated_registry(120, fetches.clone(), Some(gate.clone())));

        let live = supervisor
            .start(SyncJobType::Vehicles, SyncScope::Full, options(50))
            .await
            .unwrap();
        let orphan = store
            .create_log(NewSyncLog {
                job_type: SyncJobType::Stops,
                scope: SyncScope::Full,
                batch_size: 50,
                delay_ms: 0,
                initiated_by: None,
                owner_instance: Some("crashed-instance".into()),
            })
            .await
            .unwrap();
        let recent = store
            .create_log(NewSyncLog {
                job_type: SyncJobType::GpsPoints,
                scope: SyncScope::Full,
                batch_size: 50,
                delay_ms: 0,
                initiated_by: None,
                owner_instance: Some("other-instance".into()),
            })
            .await
            .unwrap();
        let long_ago = Utc::now() - chrono::Duration::hours(3);
        store.set_last_progress(orphan.id, long_ago).await.unwrap();
        store.set_last_progress(live.id, long_ago).await.unwrap();

        let cleaned = supervisor.cleanup_stale(None).await.unwrap();
        assert_eq!(cleaned, vec![orphan.id]);
        let orphan = store.get_log(orphan.id).await.unwrap().unwrap();
        assert_eq!(orphan.status, SyncStatus::Failed);
        assert_eq!(orphan.error_message.as_deref(), Some(STALE_RUN_MESSAGE));
        assert!(store.get_log(recent.id).await.unwrap().unwrap().is_active());

        gate.add_permits(10);
        let done = supervisor.wait_for(live.id).await.unwrap();
        assert_eq!(done.status, SyncStatus::Completed);
    }

    #[tokio::test]
    async fn details_are_scoped_to_the_job_type() {
        let rows: Rows = Arc::new(Mutex::new(vehicle_rows(7)));
        let (supervisor, _store) = supervisor_with(vehicles_from(rows));
        let done = run_to_end(&supervisor, SyncJobType::Vehicles, SyncScope::Full).await;

        let page = supervisor.details(SyncJobType::Vehicles, done.id, 2, 5).await.unwrap();
        assert_eq!(page.total, 7);
        assert_eq!(page.total_pages, 2);
        assert_eq!(page.data.len(), 2);

        assert!(matches!(
            supervisor.details(SyncJobType::Stops, done.id, 1, 5).await,
            Err(SupervisorError::NotFound(_))
        ));
        assert!(matches!(
            supervisor.details(SyncJobType::Vehicles, 9_999, 1, 5).await,
            Err(SupervisorError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn gps_runs_record_distance_travelled() {
        let rows = vec![
            object(json!({"id": 1, "garage_no": "P1", "lat": 44.8176, "lng": 20.4569, "captured": "2024-03-01 10:00:00"})),
            object(json!({"id": 2, "garage_no": "P1", "lat": 44.8276, "lng": 20.4569, "captured": "2024-03-01 10:01:00"})),
        ];
        let registry = StaticRegistry::new().with(SyncJobType::GpsPoints, move || {
            Ok(DomainAdapter::new(
                SyncJobType::GpsPoints,
                Box::new(MemoryConnector::new("city", builtin_table(SyncJobType::GpsPoints), rows.clone())),
            ))
        });
        let (supervisor, _store) = supervisor_with(registry);
        let done = run_to_end(&supervisor, SyncJobType::GpsPoints, SyncScope::Full).await;
        let km = done.domain_scalar.unwrap();
        assert!((km - 1.112).abs() < 0.01, "got {km}");
    }

    #[test]
    fn progress_snapshot_derives_rates() {
        let now = Utc::now();
        let mut log = SyncLog {
            id: 1,
            job_type: SyncJobType::Stops,
            scope: SyncScope::Full,
            status: SyncStatus::InProgress,
            started_at: now - chrono::Duration::seconds(10),
            completed_at: None,
            total_units: 200,
            processed_units: 50,
            created_count: 50,
            updated_count: 0,
            skipped_count: 0,
            conflict_count: 0,
            error_count: 0,
            batch_size: 50,
            delay_ms: 1000,
            initiated_by: None,
            domain_scalar: None,
            error_message: None,
            cancel_requested: false,
            owner_instance: None,
            last_progress_at: now,
        };

        let running = ProgressReporter::snapshot(&log, now);
        assert_eq!(running.outcome, Outcome::Running);
        assert_eq!(running.percent, Some(25.0));
        assert_eq!(running.throughput_per_second, Some(5.0));
        assert_eq!(running.eta_seconds, Some(30.0));
        assert_eq!(running.elapsed_seconds, 10.0);

        log.total_units = 0;
        let unknown = ProgressReporter::snapshot(&log, now);
        assert_eq!(unknown.percent, None);
        assert_eq!(unknown.total_units, None);
        assert_eq!(unknown.eta_seconds, None);

        log.status = SyncStatus::Completed;
        log.completed_at = Some(now);
        log.error_count = 2;
        let done = ProgressReporter::snapshot(&log, now + chrono::Duration::seconds(60));
        assert_eq!(done.outcome, Outcome::SucceededWithWarnings);
        assert_eq!(done.percent, Some(100.0));
        assert_eq!(done.eta_seconds, None);
        assert_eq!(done.elapsed_seconds, 10.0);
    }

    #[tokio::test]
    async fn registry_yaml_loads_relative_to_its_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.yaml");
        std::fs::write(
            &path,
            r#"
sources:
  - id: ticketing
    engine: fixture
    fixture_dir: fixtures/ticketing
jobs:
  - job_type: vehicles
    sources: [ticketing]
    schedule: "0 0 2 * * *"
    authority:
      default: legacy
      fields:
        imei: canonical
"#,
        )
        .unwrap();
        std::fs::create_dir_all(dir.path().join("fixtures/ticketing")).unwrap();
        std::fs::write(
            dir.path().join("fixtures/ticketing/bus_vehicle.json"),
            r#"[{"id": 1, "garage_no": "P1"}, {"id": 2, "garage_no": "P2"}]"#,
        )
        .unwrap();

        let registry = load_registry(&path).await.unwrap();
        assert_eq!(registry.configured_job_types(), vec![SyncJobType::Vehicles]);
        assert_eq!(registry.schedules().len(), 1);

        let store = Arc::new(MemoryStore::new());
        let supervisor = JobSupervisor::new(test_config(), store.clone(), store.clone(), Arc::new(registry));
        let done = run_to_end(&supervisor, SyncJobType::Vehicles, SyncScope::Full).await;
        assert_eq!(done.status, SyncStatus::Completed);
        assert_eq!(done.created_count, 2);

        assert!(load_registry_config(&dir.path().join("missing.yaml")).await.is_err());
    }
}
