//! Content-transfer contract.
//!
//! The orchestrator never touches payload bytes directly. It asks a [`ContentTransfer`]
//! implementation to snapshot a volume, to read units back from a stored snapshot, and to
//! write or remove units at a restore destination. Units are identified by a relative
//! path-like string and hashed with SHA-256 (lowercase hex).

pub mod fs;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::model::{ChecksumMap, Environment, TransferHandle};

pub type TransferResult<T> = Result<T, TransferError>;

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid unit identifier: {0}")]
    InvalidUnit(String),
    #[error("checksum mismatch on {unit}: expected {expected}, got {actual}")]
    Integrity {
        unit: String,
        expected: String,
        actual: String,
    },
    #[error("transfer error: {0}")]
    Other(String),
}

/// Result of snapshotting a volume.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Units stored in this snapshot with their hashes. Against a base this holds only the
    /// units that are new or changed.
    pub checksums: ChecksumMap,
    /// Units present in the base but gone from the volume.
    pub removed: Vec<String>,
    /// Units that could not be read (vanished or unreadable mid-walk).
    pub skipped: Vec<String>,
    pub size_bytes: u64,
    pub handle: TransferHandle,
}

/// Moves and hashes payload bytes on behalf of the workers.
#[async_trait]
pub trait ContentTransfer: Send + Sync {
    /// Capture the current state of `volume`. With a `base`, only changes relative to it
    /// are stored.
    async fn snapshot(
        &self,
        environment: &Environment,
        volume: &str,
        base: Option<&ChecksumMap>,
    ) -> TransferResult<Snapshot>;

    /// Read one unit back from a stored snapshot.
    async fn read(&self, handle: &TransferHandle, unit: &str) -> TransferResult<Vec<u8>>;

    /// Write one unit to a restore destination. Implementations must refuse data whose
    /// hash differs from `expected_hash`.
    async fn write(
        &self,
        destination: &str,
        unit: &str,
        data: &[u8],
        expected_hash: &str,
    ) -> TransferResult<()>;

    /// Remove one unit from a restore destination. Missing units are not an error.
    async fn remove(&self, destination: &str, unit: &str) -> TransferResult<()>;

    /// Drop the stored payload behind `handle`.
    async fn purge(&self, handle: &TransferHandle) -> TransferResult<()>;
}

/// Lowercase hex SHA-256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Compare `data` against `expected`, returning an integrity error on mismatch.
pub fn verify_unit(unit: &str, data: &[u8], expected: &str) -> TransferResult<()> {
    let actual = sha256_hex(data);
    if actual != expected {
        return Err(TransferError::Integrity {
            unit: unit.to_string(),
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}
