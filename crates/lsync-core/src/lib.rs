//! Core domain model for the legacy sync engine: job types, run logs, audit details,
//! external identities and the canonical record shape shared by every crate.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "lsync-core";

/// Max length of a stored per-record error message.
pub const MAX_ERROR_MESSAGE_CHARS: usize = 255;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} `{value}`")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

/// Which domain a sync run reconciles. Selects connectors, mapper and authority table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncJobType {
    Vehicles,
    GpsPoints,
    Stops,
    TimetableDates,
    TimetableSchedules,
    PriceVariations,
}

impl SyncJobType {
    pub const ALL: [SyncJobType; 6] = [
        SyncJobType::Vehicles,
        SyncJobType::GpsPoints,
        SyncJobType::Stops,
        SyncJobType::TimetableDates,
        SyncJobType::TimetableSchedules,
        SyncJobType::PriceVariations,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncJobType::Vehicles => "vehicles",
            SyncJobType::GpsPoints => "gps-points",
            SyncJobType::Stops => "stops",
            SyncJobType::TimetableDates => "timetable-dates",
            SyncJobType::TimetableSchedules => "timetable-schedules",
            SyncJobType::PriceVariations => "price-variations",
        }
    }
}

impl fmt::Display for SyncJobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncJobType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SyncJobType::ALL
            .into_iter()
            .find(|t| t.as_str() == s || t.as_str().replace('-', "_") == s)
            .ok_or_else(|| UnknownVariant {
                kind: "job type",
                value: s.to_string(),
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::InProgress => "in_progress",
            SyncStatus::Completed => "completed",
            SyncStatus::Failed => "failed",
            SyncStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SyncStatus::Completed | SyncStatus::Failed | SyncStatus::Cancelled
        )
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Terminal logs are immutable; `completed` is only reachable from `in_progress`.
    pub fn can_transition_to(&self, next: SyncStatus) -> bool {
        match (self, next) {
            (SyncStatus::Pending, SyncStatus::InProgress) => true,
            (SyncStatus::Pending, SyncStatus::Failed | SyncStatus::Cancelled) => true,
            (SyncStatus::InProgress, SyncStatus::InProgress) => true,
            (SyncStatus::InProgress, s) => s.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SyncStatus::Pending),
            "in_progress" => Ok(SyncStatus::InProgress),
            "completed" => Ok(SyncStatus::Completed),
            "failed" => Ok(SyncStatus::Failed),
            "cancelled" => Ok(SyncStatus::Cancelled),
            other => Err(UnknownVariant {
                kind: "sync status",
                value: other.to_string(),
            }),
        }
    }
}

/// What part of the legacy data a run covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum SyncScope {
    Full,
    Incremental {
        #[serde(default)]
        since: Option<DateTime<Utc>>,
    },
    Subset {
        entity_ids: Vec<String>,
    },
}

impl SyncScope {
    pub fn kind(&self) -> &'static str {
        match self {
            SyncScope::Full => "full",
            SyncScope::Incremental { .. } => "incremental",
            SyncScope::Subset { .. } => "subset",
        }
    }
}

/// Stable identity joining a legacy record to its canonical counterpart across runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalKey {
    pub job_type: SyncJobType,
    pub source_id: String,
    pub record_id: String,
}

impl ExternalKey {
    pub fn new(job_type: SyncJobType, source_id: impl Into<String>, record_id: impl Into<String>) -> Self {
        Self {
            job_type,
            source_id: source_id.into(),
            record_id: record_id.into(),
        }
    }
}

impl fmt::Display for ExternalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.job_type, self.source_id, self.record_id)
    }
}

impl FromStr for ExternalKey {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(job), Some(source), Some(record)) if !source.is_empty() && !record.is_empty() => {
                Ok(ExternalKey::new(job.parse()?, source, record))
            }
            _ => Err(UnknownVariant {
                kind: "external key",
                value: s.to_string(),
            }),
        }
    }
}

/// Engine-agnostic legacy row or document, keyed by column/attribute name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyRow {
    pub source_id: String,
    pub values: serde_json::Map<String, JsonValue>,
}

impl LegacyRow {
    pub fn new(source_id: impl Into<String>, values: serde_json::Map<String, JsonValue>) -> Self {
        Self {
            source_id: source_id.into(),
            values,
        }
    }

    /// Missing columns and SQL NULL both read as `None`.
    pub fn get(&self, column: &str) -> Option<&JsonValue> {
        self.values.get(column).filter(|v| !v.is_null())
    }
}

/// Legacy row after mapping: JSON-normalized field values, ready for reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalRecord {
    pub key: ExternalKey,
    pub fields: BTreeMap<String, JsonValue>,
    pub source_modified_at: Option<DateTime<Utc>>,
}

/// The canonical store's current copy of a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalRecord {
    pub local_id: Uuid,
    pub key: ExternalKey,
    pub fields: BTreeMap<String, JsonValue>,
    pub fingerprint: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Authority {
    /// The legacy source owns the field; differences are applied.
    Legacy,
    /// The canonical side owns the field; differences are recorded as conflicts.
    Canonical,
}

/// Per-domain field ownership table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldAuthority {
    #[serde(default = "default_authority")]
    pub default: Authority,
    #[serde(default)]
    pub fields: BTreeMap<String, Authority>,
}

fn default_authority() -> Authority {
    Authority::Legacy
}

impl Default for FieldAuthority {
    fn default() -> Self {
        Self {
            default: Authority::Legacy,
            fields: BTreeMap::new(),
        }
    }
}

impl FieldAuthority {
    pub fn with_canonical_fields<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            default: Authority::Legacy,
            fields: fields
                .into_iter()
                .map(|f| (f.into(), Authority::Canonical))
                .collect(),
        }
    }

    pub fn authority_for(&self, field: &str) -> Authority {
        self.fields.get(field).copied().unwrap_or(self.default)
    }

    /// Override entries win; the default changes only when one is given.
    pub fn merged(mut self, overrides: &AuthorityOverrides) -> Self {
        if let Some(default) = overrides.default {
            self.default = default;
        }
        for (field, authority) in &overrides.fields {
            self.fields.insert(field.clone(), *authority);
        }
        self
    }
}

/// Configured changes to a built-in [`FieldAuthority`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorityOverrides {
    #[serde(default)]
    pub default: Option<Authority>,
    #[serde(default)]
    pub fields: BTreeMap<String, Authority>,
}

/// Run counters. Only the owning batch runner advances them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncCounters {
    pub processed: u64,
    pub created: u64,
    pub updated: u64,
    pub skipped: u64,
    pub conflicts: u64,
    pub errors: u64,
}

impl SyncCounters {
    pub fn absorb(&mut self, other: &SyncCounters) {
        self.processed += other.processed;
        self.created += other.created;
        self.updated += other.updated;
        self.skipped += other.skipped;
        self.conflicts += other.conflicts;
        self.errors += other.errors;
    }
}

/// One sync run attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncLog {
    pub id: i64,
    pub job_type: SyncJobType,
    pub scope: SyncScope,
    pub status: SyncStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_units: u64,
    pub processed_units: u64,
    pub created_count: u64,
    pub updated_count: u64,
    pub skipped_count: u64,
    pub conflict_count: u64,
    pub error_count: u64,
    pub batch_size: u32,
    pub delay_ms: u64,
    pub initiated_by: Option<String>,
    /// Domain-specific run total, e.g. kilometres covered by synced GPS points.
    pub domain_scalar: Option<f64>,
    pub error_message: Option<String>,
    pub cancel_requested: bool,
    pub owner_instance: Option<String>,
    pub last_progress_at: DateTime<Utc>,
}

impl SyncLog {
    pub fn counters(&self) -> SyncCounters {
        SyncCounters {
            processed: self.processed_units,
            created: self.created_count,
            updated: self.updated_count,
            skipped: self.skipped_count,
            conflicts: self.conflict_count,
            errors: self.error_count,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewSyncLog {
    pub job_type: SyncJobType,
    pub scope: SyncScope,
    pub batch_size: u32,
    pub delay_ms: u64,
    pub initiated_by: Option<String>,
    pub owner_instance: Option<String>,
}

/// Counter snapshot flushed by the runner after every batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressUpdate {
    pub total_units: u64,
    pub counters: SyncCounters,
    pub domain_scalar: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetailAction {
    Create,
    Update,
    Skip,
    Error,
}

impl DetailAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetailAction::Create => "create",
            DetailAction::Update => "update",
            DetailAction::Skip => "skip",
            DetailAction::Error => "error",
        }
    }
}

impl FromStr for DetailAction {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(DetailAction::Create),
            "update" => Ok(DetailAction::Update),
            "skip" => Ok(DetailAction::Skip),
            "error" => Ok(DetailAction::Error),
            other => Err(UnknownVariant {
                kind: "detail action",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Auto,
    ManualPending,
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::Auto => "auto",
            Resolution::ManualPending => "manual_pending",
        }
    }
}

impl FromStr for Resolution {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(Resolution::Auto),
            "manual_pending" => Ok(Resolution::ManualPending),
            other => Err(UnknownVariant {
                kind: "resolution",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldChange {
    pub field: String,
    pub before: JsonValue,
    pub after: JsonValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictField {
    pub field: String,
    pub local: JsonValue,
    pub legacy: JsonValue,
}

/// Audit row for a single reconciled record; written once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncDetail {
    pub id: i64,
    pub sync_log_id: i64,
    pub external_key: String,
    pub action: DetailAction,
    pub field_changes: Vec<FieldChange>,
    pub conflict_fields: Vec<ConflictField>,
    pub resolution: Resolution,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewSyncDetail {
    pub external_key: String,
    pub action: DetailAction,
    pub field_changes: Vec<FieldChange>,
    pub conflict_fields: Vec<ConflictField>,
    pub resolution: Resolution,
    pub error_message: Option<String>,
}

impl NewSyncDetail {
    pub fn created(key: &ExternalKey, fields: &BTreeMap<String, JsonValue>) -> Self {
        Self {
            external_key: key.to_string(),
            action: DetailAction::Create,
            field_changes: fields
                .iter()
                .map(|(field, value)| FieldChange {
                    field: field.clone(),
                    before: JsonValue::Null,
                    after: value.clone(),
                })
                .collect(),
            conflict_fields: Vec::new(),
            resolution: Resolution::Auto,
            error_message: None,
        }
    }

    pub fn updated(key: &ExternalKey, changes: Vec<FieldChange>, conflicts: Vec<ConflictField>) -> Self {
        let resolution = if conflicts.is_empty() {
            Resolution::Auto
        } else {
            Resolution::ManualPending
        };
        Self {
            external_key: key.to_string(),
            action: DetailAction::Update,
            field_changes: changes,
            conflict_fields: conflicts,
            resolution,
            error_message: None,
        }
    }

    pub fn conflict(key: &ExternalKey, conflicts: Vec<ConflictField>) -> Self {
        Self {
            external_key: key.to_string(),
            action: DetailAction::Skip,
            field_changes: Vec::new(),
            conflict_fields: conflicts,
            resolution: Resolution::ManualPending,
            error_message: None,
        }
    }

    pub fn error(external_key: impl Into<String>, message: &str) -> Self {
        Self {
            external_key: external_key.into(),
            action: DetailAction::Error,
            field_changes: Vec::new(),
            conflict_fields: Vec::new(),
            resolution: Resolution::Auto,
            error_message: Some(truncate_message(message)),
        }
    }
}

pub fn truncate_message(message: &str) -> String {
    message.chars().take(MAX_ERROR_MESSAGE_CHARS).collect()
}

/// One page of a paginated listing. Pages are 1-based.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub data: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub limit: u32,
    pub total_pages: u32,
}

impl<T> Page<T> {
    pub fn new(data: Vec<T>, total: u64, page: u32, limit: u32) -> Self {
        let limit = limit.max(1);
        let total_pages = u32::try_from(total.div_ceil(u64::from(limit))).unwrap_or(u32::MAX);
        Self {
            data,
            total,
            page: page.max(1),
            limit,
            total_pages,
        }
    }

    pub fn offset(page: u32, limit: u32) -> u64 {
        u64::from(page.max(1) - 1) * u64::from(limit.max(1))
    }
}
