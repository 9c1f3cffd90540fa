use thiserror::Error;

use crate::model::{EntryId, JobId};
use crate::transfer::TransferError;

/// Errors that can arise while orchestrating backups, leases and restores.
#[derive(Debug, Error)]
pub enum VaultError {
    /// A concurrent mutation won the race; re-read and retry.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Returned when fetching a record that is not present.
    #[error("record not found: {0}")]
    NotFound(String),

    /// A restore path runs through an entry that is not `valid`.
    #[error("broken chain at entry {entry}: {reason}")]
    BrokenChain { entry: EntryId, reason: String },

    /// The worker no longer owns the lease it was started with.
    #[error("lease expired for job {0}")]
    LeaseExpired(JobId),

    /// Pin lease held by a restore run expired or was reclaimed.
    #[error("restore pin expired")]
    PinExpired,

    /// Content hash did not match the recorded checksum.
    #[error("integrity error on unit {unit}: expected {expected}, got {actual}")]
    Integrity {
        unit: String,
        expected: String,
        actual: String,
    },

    /// Content-transfer collaborator failed.
    #[error("transfer error: {0}")]
    Transfer(String),

    /// Wrapper around sled's error type.
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    /// Wrapper around bincode serialization and deserialization errors.
    #[error("serialization error: {0}")]
    Bincode(#[from] bincode::Error),

    /// Wrapper around IO errors (directory creation, etc.).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Returned when deserializing a record with an unexpected schema version.
    #[error("schema mismatch for {entity}: expected {expected}, got {found}")]
    SchemaMismatch {
        entity: &'static str,
        expected: u8,
        found: u8,
    },

    #[error("invalid schedule expression: {0}")]
    InvalidSchedule(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Internal error (task join errors, closed channels)
    #[error("internal error: {0}")]
    Internal(String),
}

impl VaultError {
    /// Whether the scheduler may simply try again on its next slot.
    pub fn is_retryable(&self) -> bool {
        matches!(self, VaultError::Conflict(_) | VaultError::Transfer(_))
    }
}

impl From<TransferError> for VaultError {
    fn from(err: TransferError) -> Self {
        match err {
            TransferError::Integrity {
                unit,
                expected,
                actual,
            } => VaultError::Integrity {
                unit,
                expected,
                actual,
            },
            other => VaultError::Transfer(other.to_string()),
        }
    }
}

pub type VaultResult<T> = Result<T, VaultError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_retryable_errors() {
        assert!(VaultError::Conflict("x".into()).is_retryable());
        assert!(VaultError::Transfer("io".into()).is_retryable());
        assert!(!VaultError::BrokenChain {
            entry: EntryId(3),
            reason: "corrupt".into()
        }
        .is_retryable());
        assert!(!VaultError::LeaseExpired(JobId(1)).is_retryable());
    }

    #[test]
    fn transfer_integrity_maps_to_integrity() {
        let err: VaultError = TransferError::Integrity {
            unit: "a.txt".into(),
            expected: "00".into(),
            actual: "ff".into(),
        }
        .into();
        assert!(matches!(err, VaultError::Integrity { ref unit, .. } if unit == "a.txt"));
    }
}
