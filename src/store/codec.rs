//! Key layout, bincode encoding and sled transaction helpers shared by the
//! metadata store and the lease manager.

use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionError,
    TransactionalTree,
};
use sled::IVec;

use crate::errors::{VaultError, VaultResult};
use crate::model::{
    ChainEntry, EntryId, Environment, EnvironmentId, Job, JobId, RunId, RunRecord, VolumeRef,
    ENTRY_SCHEMA_VERSION, ENVIRONMENT_SCHEMA_VERSION, JOB_SCHEMA_VERSION, RUN_SCHEMA_VERSION,
};

pub(crate) type TxResult<T> = ConflictableTransactionResult<T, VaultError>;

/// Records carrying a schema version that is checked on every read.
pub(crate) trait Record: serde::Serialize + serde::de::DeserializeOwned {
    const ENTITY: &'static str;
    const VERSION: u8;
    fn schema_version(&self) -> u8;
}

impl Record for Environment {
    const ENTITY: &'static str = "environment";
    const VERSION: u8 = ENVIRONMENT_SCHEMA_VERSION;
    fn schema_version(&self) -> u8 {
        self.schema_version
    }
}

impl Record for Job {
    const ENTITY: &'static str = "job";
    const VERSION: u8 = JOB_SCHEMA_VERSION;
    fn schema_version(&self) -> u8 {
        self.schema_version
    }
}

impl Record for ChainEntry {
    const ENTITY: &'static str = "chain entry";
    const VERSION: u8 = ENTRY_SCHEMA_VERSION;
    fn schema_version(&self) -> u8 {
        self.schema_version
    }
}

impl Record for RunRecord {
    const ENTITY: &'static str = "run";
    const VERSION: u8 = RUN_SCHEMA_VERSION;
    fn schema_version(&self) -> u8 {
        self.schema_version
    }
}

pub(crate) fn id_key(id: u64) -> Vec<u8> {
    format!("{:020}", id).into_bytes()
}

pub(crate) fn parse_id_key(bytes: &[u8]) -> Option<u64> {
    std::str::from_utf8(bytes).ok()?.parse().ok()
}

/// `<environment id><volume>\0<entry id>`; volumes never contain NUL (checked on job
/// creation) and ids are fixed width.
pub(crate) fn volume_key(volume: &VolumeRef, entry: EntryId) -> Vec<u8> {
    let mut key = volume_prefix(volume);
    key.extend_from_slice(&id_key(entry.0));
    key
}

pub(crate) fn volume_prefix(volume: &VolumeRef) -> Vec<u8> {
    let mut key = id_key(volume.environment_id.0);
    key.extend_from_slice(volume.volume.as_bytes());
    key.push(0);
    key
}

/// Inverse of [`volume_prefix`] for any key of the volume index.
pub(crate) fn parse_volume_key(key: &[u8]) -> Option<VolumeRef> {
    const ID_WIDTH: usize = 20;
    if key.len() <= ID_WIDTH {
        return None;
    }
    let environment = parse_id_key(&key[..ID_WIDTH])?;
    let rest = &key[ID_WIDTH..];
    let end = rest.iter().position(|b| *b == 0)?;
    let volume = std::str::from_utf8(&rest[..end]).ok()?;
    Some(VolumeRef::new(EnvironmentId(environment), volume))
}

pub(crate) fn job_run_key(job: JobId, run: RunId) -> Vec<u8> {
    let mut key = job_run_prefix(job);
    key.extend_from_slice(&id_key(run.0));
    key
}

pub(crate) fn job_run_prefix(job: JobId) -> Vec<u8> {
    let mut key = id_key(job.0);
    key.push(0);
    key
}

pub(crate) fn encode<T: serde::Serialize>(value: &T) -> VaultResult<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

pub(crate) fn decode_raw<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> VaultResult<T> {
    Ok(bincode::deserialize::<T>(bytes)?)
}

pub(crate) fn decode<T: Record>(bytes: &[u8]) -> VaultResult<T> {
    let record: T = decode_raw(bytes)?;
    if record.schema_version() != T::VERSION {
        return Err(VaultError::SchemaMismatch {
            entity: T::ENTITY,
            expected: T::VERSION,
            found: record.schema_version(),
        });
    }
    Ok(record)
}

pub(crate) fn abort<T>(err: VaultError) -> TxResult<T> {
    Err(ConflictableTransactionError::Abort(err))
}

pub(crate) fn tx_encode<T: serde::Serialize>(value: &T) -> TxResult<Vec<u8>> {
    encode(value).map_err(ConflictableTransactionError::Abort)
}

pub(crate) fn tx_decode<T: Record>(bytes: &IVec) -> TxResult<T> {
    decode(bytes).map_err(ConflictableTransactionError::Abort)
}

pub(crate) fn tx_decode_raw<T: serde::de::DeserializeOwned>(bytes: &IVec) -> TxResult<T> {
    decode_raw(bytes).map_err(ConflictableTransactionError::Abort)
}

/// Fetch and decode a record inside a transaction, aborting with `NotFound` when absent.
pub(crate) fn tx_load<T: Record>(tree: &TransactionalTree, id: u64, what: &str) -> TxResult<T> {
    match tree.get(id_key(id))? {
        Some(bytes) => tx_decode(&bytes),
        None => abort(VaultError::NotFound(format!("{} {}", what, id))),
    }
}

pub(crate) fn tx_store<T: serde::Serialize>(
    tree: &TransactionalTree,
    id: u64,
    value: &T,
) -> TxResult<()> {
    let bytes = tx_encode(value)?;
    tree.insert(id_key(id), bytes)?;
    Ok(())
}

pub(crate) fn finish<T>(result: Result<T, TransactionError<VaultError>>) -> VaultResult<T> {
    result.map_err(|e| match e {
        TransactionError::Abort(err) => err,
        TransactionError::Storage(err) => VaultError::Sled(err),
    })
}

pub(crate) fn read_counter(bytes: Option<IVec>) -> u32 {
    bytes
        .and_then(|b| <[u8; 4]>::try_from(b.as_ref()).ok())
        .map(u32::from_be_bytes)
        .unwrap_or(0)
}
