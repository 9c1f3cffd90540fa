//! Persistent record types shared by the store, the chain resolver and the workers.
//!
//! Records are serialized with bincode, so free-form blobs (environment configuration)
//! are kept as JSON text rather than `serde_json::Value`.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub const ENVIRONMENT_SCHEMA_VERSION: u8 = 1;
pub const JOB_SCHEMA_VERSION: u8 = 1;
pub const ENTRY_SCHEMA_VERSION: u8 = 2;
pub const RUN_SCHEMA_VERSION: u8 = 1;

macro_rules! record_id {
    ($name:ident, $prefix:literal) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "-{}"), self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = std::num::ParseIntError;

            /// Accepts either the bare number or the prefixed display form.
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let raw = s.strip_prefix(concat!($prefix, "-")).unwrap_or(s);
                raw.parse::<u64>().map($name)
            }
        }
    };
}

record_id!(EnvironmentId, "env");
record_id!(JobId, "job");
record_id!(EntryId, "entry");
record_id!(RunId, "run");

/// Unit identifier (relative path) → content hash (lowercase SHA-256 hex).
pub type ChecksumMap = BTreeMap<String, String>;

/// A volume identifier qualified by its environment. `data` on two hosts is two volumes,
/// each with its own chain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VolumeRef {
    pub environment_id: EnvironmentId,
    pub volume: String,
}

impl VolumeRef {
    pub fn new(environment_id: EnvironmentId, volume: impl Into<String>) -> Self {
        Self {
            environment_id,
            volume: volume.into(),
        }
    }
}

impl fmt::Display for VolumeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.environment_id, self.volume)
    }
}

/// Opaque reference to payload held by the content-transfer service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransferHandle(pub String);

impl fmt::Display for TransferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A named logical backup target (e.g. one host's volumes).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Environment {
    pub id: EnvironmentId,
    pub name: String,
    /// Configuration blob as JSON text.
    pub config: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub schema_version: u8,
}

impl Environment {
    pub fn config_value(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::from_str(&self.config)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Idle,
    Queued,
    Running,
    Disabled,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Idle => "idle",
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Disabled => "disabled",
        };
        f.write_str(s)
    }
}

/// Retention policy expressed as (max age, newest N to keep). Unset rules do not vote.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct RetentionPolicy {
    pub keep_last: Option<u32>,
    pub max_age_hours: Option<u64>,
}

impl RetentionPolicy {
    pub fn keep_last(n: u32) -> Self {
        Self {
            keep_last: Some(n),
            max_age_hours: None,
        }
    }

    pub fn max_age(&self) -> Option<Duration> {
        self.max_age_hours
            .map(|h| Duration::hours(h.min(i64::MAX as u64 / 3600) as i64))
    }

    pub fn is_unbounded(&self) -> bool {
        self.keep_last.is_none() && self.max_age_hours.is_none()
    }
}

impl fmt::Display for RetentionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.keep_last, self.max_age_hours) {
            (None, None) => f.write_str("keep forever"),
            (Some(n), None) => write!(f, "keep last {}", n),
            (None, Some(h)) => write!(f, "max age {}h", h),
            (Some(n), Some(h)) => write!(f, "keep last {} / max age {}h", n, h),
        }
    }
}

/// A scheduled backup policy bound to one environment and one volume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub environment_id: EnvironmentId,
    pub volume: String,
    /// Schedule expression, see [`crate::schedule::Schedule`].
    pub schedule: String,
    pub retention: RetentionPolicy,
    /// Force a full backup once the current chain holds `full_every - 1` incrementals.
    pub full_every: Option<u32>,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub schema_version: u8,
}

impl Job {
    /// The volume whose chain this job extends.
    pub fn volume_ref(&self) -> VolumeRef {
        VolumeRef::new(self.environment_id, self.volume.clone())
    }
}

/// Input for [`crate::store::MetadataStore::create_job`].
#[derive(Debug, Clone)]
pub struct NewJob {
    pub name: String,
    pub environment_id: EnvironmentId,
    pub volume: String,
    pub schedule: String,
    pub retention: RetentionPolicy,
    pub full_every: Option<u32>,
    pub next_run: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Full,
    /// Units listed in `removed` existed in the parent state and are gone in this one.
    Incremental {
        parent: EntryId,
        removed: Vec<String>,
    },
}

impl EntryKind {
    pub fn parent(&self) -> Option<EntryId> {
        match self {
            EntryKind::Full => None,
            EntryKind::Incremental { parent, .. } => Some(*parent),
        }
    }

    pub fn is_full(&self) -> bool {
        matches!(self, EntryKind::Full)
    }

    pub fn label(&self) -> &'static str {
        match self {
            EntryKind::Full => "full",
            EntryKind::Incremental { .. } => "incremental",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Pending,
    Valid,
    Corrupt,
    Deleted,
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EntryStatus::Pending => "pending",
            EntryStatus::Valid => "valid",
            EntryStatus::Corrupt => "corrupt",
            EntryStatus::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

/// One full or incremental volume backup in a chain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChainEntry {
    pub id: EntryId,
    pub volume: VolumeRef,
    pub kind: EntryKind,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub checksums: ChecksumMap,
    pub metadata: BTreeMap<String, String>,
    pub status: EntryStatus,
    /// Policy in effect when the entry was created.
    pub retention: RetentionPolicy,
    pub job_id: Option<JobId>,
    pub run_id: Option<RunId>,
    pub handle: TransferHandle,
    pub schema_version: u8,
}

impl ChainEntry {
    pub fn parent(&self) -> Option<EntryId> {
        self.kind.parent()
    }

    pub fn is_valid(&self) -> bool {
        self.status == EntryStatus::Valid
    }
}

/// Input for [`crate::store::MetadataStore::create_pending_entry`].
#[derive(Debug, Clone)]
pub struct NewEntry {
    pub volume: VolumeRef,
    pub kind: EntryKind,
    pub size_bytes: u64,
    pub checksums: ChecksumMap,
    pub metadata: BTreeMap<String, String>,
    pub retention: RetentionPolicy,
    pub job_id: Option<JobId>,
    pub run_id: Option<RunId>,
    pub handle: TransferHandle,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Success,
    Partial,
    Failed,
    Aborted,
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunOutcome::Success => "success",
            RunOutcome::Partial => "partial",
            RunOutcome::Failed => "failed",
            RunOutcome::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    Backup { entry: Option<EntryId> },
    Restore { target: EntryId, destination: String },
}

/// One execution of a backup or restore. Append-only once `completed_at` is set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunRecord {
    pub id: RunId,
    pub job_id: Option<JobId>,
    pub kind: RunKind,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub outcome: Option<RunOutcome>,
    pub bytes_moved: u64,
    pub error_detail: Option<String>,
    /// Restore: number of path entries fully applied.
    pub progress: u32,
    pub schema_version: u8,
}

impl RunRecord {
    pub fn is_terminal(&self) -> bool {
        self.completed_at.is_some()
    }

    pub fn produced_entry(&self) -> Option<EntryId> {
        match self.kind {
            RunKind::Backup { entry } => entry,
            RunKind::Restore { .. } => None,
        }
    }
}

/// Terminal state written by [`crate::store::MetadataStore::complete_run`].
#[derive(Debug, Clone)]
pub struct RunCompletion {
    pub outcome: RunOutcome,
    pub bytes_moved: u64,
    pub error_detail: Option<String>,
}

impl RunCompletion {
    pub fn success(bytes_moved: u64) -> Self {
        Self {
            outcome: RunOutcome::Success,
            bytes_moved,
            error_detail: None,
        }
    }

    pub fn failure(outcome: RunOutcome, bytes_moved: u64, detail: impl Into<String>) -> Self {
        Self {
            outcome,
            bytes_moved,
            error_detail: Some(detail.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_parse_with_or_without_prefix() {
        assert_eq!("entry-12".parse::<EntryId>().unwrap(), EntryId(12));
        assert_eq!("12".parse::<EntryId>().unwrap(), EntryId(12));
        assert_eq!(JobId(4).to_string(), "job-4");
        assert!("job-x".parse::<JobId>().is_err());
    }

    #[test]
    fn incremental_kind_exposes_parent() {
        let kind = EntryKind::Incremental {
            parent: EntryId(7),
            removed: vec![],
        };
        assert_eq!(kind.parent(), Some(EntryId(7)));
        assert!(!kind.is_full());
        assert_eq!(EntryKind::Full.parent(), None);
    }

    #[test]
    fn volume_ref_display_names_environment() {
        assert_eq!(VolumeRef::new(EnvironmentId(3), "www").to_string(), "env-3/www");
        assert_ne!(
            VolumeRef::new(EnvironmentId(1), "data"),
            VolumeRef::new(EnvironmentId(2), "data")
        );
    }

    #[test]
    fn retention_display() {
        assert_eq!(RetentionPolicy::default().to_string(), "keep forever");
        assert_eq!(RetentionPolicy::keep_last(3).to_string(), "keep last 3");
    }
}
