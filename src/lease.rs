//! Job lock manager: time-bounded leases kept in the metadata database.
//!
//! A lease moves through `unlocked → leased(owner, expiry) → unlocked`. Every
//! operation is a sled transaction over the `leases` tree, so two processes racing
//! for the same job (or for two jobs of the same environment) see exactly one winner.
//! An expired lease is treated as absent and may be taken over; the previous record
//! is handed back to the new owner so it can close the abandoned run.
//!
//! The same tree holds restore pins: a restore run pins the entries of its resolved
//! path so retention never deletes them underneath it.

use chrono::{DateTime, Duration, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use sled::transaction::TransactionalTree;
use std::collections::HashSet;
use uuid::Uuid;

use crate::errors::{VaultError, VaultResult};
use crate::model::{EntryId, EnvironmentId, Job, JobId, RunId};
use crate::store::codec::{abort, decode_raw, finish, tx_decode_raw, tx_encode, TxResult};
use crate::store::MetadataStore;

const PIN_PREFIX: &str = "pin:";
const PIN_SLOT_PREFIX: &str = "pinned:";

/// Proof of ownership handed to the worker that executes a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LeaseToken {
    pub job_id: JobId,
    pub environment_id: EnvironmentId,
    pub id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub token: LeaseToken,
    pub owner: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub renewals: u32,
    /// Run guarded by this lease, once the worker has started it.
    pub run_id: Option<RunId>,
}

impl LeaseRecord {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// Result of a successful [`LockManager::acquire`].
#[derive(Debug, Clone)]
pub struct LeaseGrant {
    pub lease: LeaseRecord,
    /// Expired lease that was taken over, if any.
    pub reclaimed: Option<LeaseRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PinToken(pub Uuid);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PinRecord {
    owner: String,
    entries: Vec<EntryId>,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PinSlot {
    token: PinToken,
    expires_at: DateTime<Utc>,
}

fn job_key(job: JobId) -> Vec<u8> {
    format!("job:{:020}", job.0).into_bytes()
}

fn env_key(env: EnvironmentId) -> Vec<u8> {
    format!("env:{:020}", env.0).into_bytes()
}

fn pin_key(token: PinToken) -> Vec<u8> {
    format!("{}{}", PIN_PREFIX, token.0).into_bytes()
}

fn pin_slot_key(entry: EntryId) -> Vec<u8> {
    format!("{}{:020}", PIN_SLOT_PREFIX, entry.0).into_bytes()
}

fn validate_ttl(ttl: Duration) -> VaultResult<()> {
    if ttl <= Duration::zero() {
        return Err(VaultError::InvalidConfig(format!(
            "lease ttl must be positive, got {}s",
            ttl.num_seconds()
        )));
    }
    Ok(())
}

/// Check inside a transaction that `token` still owns an unexpired lease.
pub(crate) fn verify_in_tx(
    tree: &TransactionalTree,
    token: &LeaseToken,
    now: DateTime<Utc>,
) -> TxResult<LeaseRecord> {
    match tree.get(job_key(token.job_id))? {
        Some(bytes) => {
            let record: LeaseRecord = tx_decode_raw(&bytes)?;
            if record.token == *token && record.is_live(now) {
                Ok(record)
            } else {
                abort(VaultError::LeaseExpired(token.job_id))
            }
        }
        None => abort(VaultError::LeaseExpired(token.job_id)),
    }
}

/// Whether any unexpired restore pin covers `entry`, read inside a transaction.
pub(crate) fn pinned_in_tx(
    tree: &TransactionalTree,
    entry: EntryId,
    now: DateTime<Utc>,
) -> TxResult<bool> {
    match tree.get(pin_slot_key(entry))? {
        Some(bytes) => {
            let slots: Vec<PinSlot> = tx_decode_raw(&bytes)?;
            Ok(slots.iter().any(|s| s.expires_at > now))
        }
        None => Ok(false),
    }
}

/// Record `run_id` on the lease owned by `token`, inside a transaction.
pub(crate) fn attach_run_in_tx(
    tree: &TransactionalTree,
    token: &LeaseToken,
    run_id: RunId,
    now: DateTime<Utc>,
) -> TxResult<LeaseRecord> {
    let mut record = verify_in_tx(tree, token, now)?;
    record.run_id = Some(run_id);
    write_lease(tree, &record)?;
    Ok(record)
}

fn write_lease(tree: &TransactionalTree, record: &LeaseRecord) -> TxResult<()> {
    let bytes = tx_encode(record)?;
    tree.insert(job_key(record.token.job_id), bytes.clone())?;
    tree.insert(env_key(record.token.environment_id), bytes)?;
    Ok(())
}

/// Leases and restore pins backed by the metadata database.
#[derive(Clone)]
pub struct LockManager {
    tree: sled::Tree,
}

impl LockManager {
    pub fn new(store: &MetadataStore) -> Self {
        Self {
            tree: store.leases().clone(),
        }
    }

    /// Take the lease for `job`. Fails with `Conflict` while an unexpired lease exists for
    /// the job, or for another job of the same environment.
    pub fn acquire(
        &self,
        job: &Job,
        owner: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> VaultResult<LeaseGrant> {
        validate_ttl(ttl)?;
        let token = LeaseToken {
            job_id: job.id,
            environment_id: job.environment_id,
            id: Uuid::new_v4(),
        };
        let record = LeaseRecord {
            token,
            owner: owner.to_string(),
            acquired_at: now,
            expires_at: now + ttl,
            renewals: 0,
            run_id: None,
        };

        let reclaimed = finish(self.tree.transaction(|tx| {
            let previous: Option<LeaseRecord> = match tx.get(job_key(job.id))? {
                Some(bytes) => Some(tx_decode_raw(&bytes)?),
                None => None,
            };
            if let Some(prev) = &previous {
                if prev.is_live(now) {
                    return abort(VaultError::Conflict(format!(
                        "{} is leased by {} until {}",
                        job.id, prev.owner, prev.expires_at
                    )));
                }
            }
            if let Some(bytes) = tx.get(env_key(job.environment_id))? {
                let env_lease: LeaseRecord = tx_decode_raw(&bytes)?;
                if env_lease.token.job_id != job.id && env_lease.is_live(now) {
                    return abort(VaultError::Conflict(format!(
                        "{} is busy with {} (owner {})",
                        job.environment_id, env_lease.token.job_id, env_lease.owner
                    )));
                }
            }
            write_lease(tx, &record)?;
            Ok(previous)
        }))?;

        debug!(
            "lease acquired for {} by {} until {}",
            job.id, owner, record.expires_at
        );
        Ok(LeaseGrant {
            lease: record,
            reclaimed,
        })
    }

    /// Extend the lease to `now + ttl`. Fails with `LeaseExpired` if the lease already
    /// lapsed or was taken over.
    pub fn renew(
        &self,
        token: &LeaseToken,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> VaultResult<LeaseRecord> {
        validate_ttl(ttl)?;
        finish(self.tree.transaction(|tx| {
            let mut record = verify_in_tx(tx, token, now)?;
            record.expires_at = now + ttl;
            record.renewals += 1;
            write_lease(tx, &record)?;
            Ok(record)
        }))
    }

    /// Record the run guarded by this lease.
    pub fn attach_run(
        &self,
        token: &LeaseToken,
        run_id: RunId,
        now: DateTime<Utc>,
    ) -> VaultResult<LeaseRecord> {
        finish(
            self.tree
                .transaction(|tx| attach_run_in_tx(tx, token, run_id, now)),
        )
    }

    /// Drop the lease early. Returns false when the token no longer owns it.
    pub fn release(&self, token: &LeaseToken) -> VaultResult<bool> {
        let released = finish(self.tree.transaction(|tx| {
            let mut released = false;
            for key in [job_key(token.job_id), env_key(token.environment_id)] {
                if let Some(bytes) = tx.get(&key)? {
                    let record: LeaseRecord = tx_decode_raw(&bytes)?;
                    if record.token == *token {
                        tx.remove(key)?;
                        released = true;
                    }
                }
            }
            Ok(released)
        }))?;
        if released {
            debug!("lease released for {}", token.job_id);
        }
        Ok(released)
    }

    /// Confirm the lease is still held without extending it.
    pub fn check(&self, token: &LeaseToken, now: DateTime<Utc>) -> VaultResult<LeaseRecord> {
        match self.current(token.job_id)? {
            Some(record) if record.token == *token && record.is_live(now) => Ok(record),
            _ => Err(VaultError::LeaseExpired(token.job_id)),
        }
    }

    /// The stored lease for a job, live or not.
    pub fn current(&self, job: JobId) -> VaultResult<Option<LeaseRecord>> {
        match self.tree.get(job_key(job))? {
            Some(bytes) => Ok(Some(decode_raw(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn is_leased(&self, job: JobId, now: DateTime<Utc>) -> VaultResult<bool> {
        Ok(self
            .current(job)?
            .map(|r| r.is_live(now))
            .unwrap_or(false))
    }

    /// Pin `entries` against deletion until `now + ttl`.
    pub fn pin(
        &self,
        entries: &[EntryId],
        owner: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> VaultResult<PinToken> {
        validate_ttl(ttl)?;
        let token = PinToken(Uuid::new_v4());
        let record = PinRecord {
            owner: owner.to_string(),
            entries: entries.to_vec(),
            expires_at: now + ttl,
        };
        finish(self.tree.transaction(|tx| {
            tx.insert(pin_key(token), tx_encode(&record)?)?;
            Self::write_slots(tx, &record, token, now)?;
            Ok(())
        }))?;
        Ok(token)
    }

    pub fn renew_pin(&self, token: PinToken, ttl: Duration, now: DateTime<Utc>) -> VaultResult<()> {
        validate_ttl(ttl)?;
        finish(self.tree.transaction(|tx| {
            let mut record: PinRecord = match tx.get(pin_key(token))? {
                Some(bytes) => tx_decode_raw(&bytes)?,
                None => return abort(VaultError::PinExpired),
            };
            if record.expires_at <= now {
                return abort(VaultError::PinExpired);
            }
            record.expires_at = now + ttl;
            tx.insert(pin_key(token), tx_encode(&record)?)?;
            Self::write_slots(tx, &record, token, now)?;
            Ok(())
        }))
    }

    pub fn release_pin(&self, token: PinToken) -> VaultResult<()> {
        finish(self.tree.transaction(|tx| {
            if let Some(bytes) = tx.get(pin_key(token))? {
                let record: PinRecord = tx_decode_raw(&bytes)?;
                Self::drop_pin(tx, token, &record)?;
            }
            Ok(())
        }))
    }

    /// Remove pins whose holder stopped renewing them (a crashed restore). Returns how many
    /// were dropped.
    pub fn prune_expired_pins(&self, now: DateTime<Utc>) -> VaultResult<usize> {
        let mut expired = Vec::new();
        for item in self.tree.scan_prefix(PIN_PREFIX.as_bytes()) {
            let (key, value) = item?;
            let record: PinRecord = decode_raw(&value)?;
            if record.expires_at > now {
                continue;
            }
            let token = std::str::from_utf8(&key[PIN_PREFIX.len()..])
                .ok()
                .and_then(|s| Uuid::parse_str(s).ok())
                .map(PinToken);
            if let Some(token) = token {
                expired.push(token);
            }
        }

        let mut pruned = 0;
        for token in expired {
            let dropped = finish(self.tree.transaction(|tx| {
                let Some(bytes) = tx.get(pin_key(token))? else {
                    return Ok(false);
                };
                let record: PinRecord = tx_decode_raw(&bytes)?;
                // Renewed since the scan.
                if record.expires_at > now {
                    return Ok(false);
                }
                Self::drop_pin(tx, token, &record)?;
                Ok(true)
            }))?;
            if dropped {
                debug!("pruned expired restore pin {}", token.0);
                pruned += 1;
            }
        }
        Ok(pruned)
    }

    fn drop_pin(tx: &TransactionalTree, token: PinToken, record: &PinRecord) -> TxResult<()> {
        for entry in &record.entries {
            let key = pin_slot_key(*entry);
            if let Some(bytes) = tx.get(&key)? {
                let mut slots: Vec<PinSlot> = tx_decode_raw(&bytes)?;
                slots.retain(|s| s.token != token);
                if slots.is_empty() {
                    tx.remove(key)?;
                } else {
                    tx.insert(key, tx_encode(&slots)?)?;
                }
            }
        }
        tx.remove(pin_key(token))?;
        Ok(())
    }

    /// Entries covered by at least one unexpired pin.
    pub fn pinned_entries(&self, now: DateTime<Utc>) -> VaultResult<HashSet<EntryId>> {
        let mut pinned = HashSet::new();
        for item in self.tree.scan_prefix(PIN_SLOT_PREFIX.as_bytes()) {
            let (key, value) = item?;
            let slots: Vec<PinSlot> = decode_raw(&value)?;
            if !slots.iter().any(|s| s.expires_at > now) {
                continue;
            }
            let id = std::str::from_utf8(&key[PIN_SLOT_PREFIX.len()..])
                .ok()
                .and_then(|s| s.parse::<u64>().ok());
            if let Some(id) = id {
                pinned.insert(EntryId(id));
            }
        }
        Ok(pinned)
    }

    fn write_slots(
        tx: &TransactionalTree,
        record: &PinRecord,
        token: PinToken,
        now: DateTime<Utc>,
    ) -> TxResult<()> {
        for entry in &record.entries {
            let key = pin_slot_key(*entry);
            let mut slots: Vec<PinSlot> = match tx.get(&key)? {
                Some(bytes) => tx_decode_raw(&bytes)?,
                None => Vec::new(),
            };
            slots.retain(|s| s.token != token && s.expires_at > now);
            slots.push(PinSlot {
                token,
                expires_at: record.expires_at,
            });
            tx.insert(key, tx_encode(&slots)?)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NewJob, RetentionPolicy};
    use tempfile::TempDir;

    fn setup() -> (TempDir, MetadataStore, Job) {
        let dir = TempDir::new().expect("tempdir");
        let store = MetadataStore::open(dir.path()).expect("store");
        let env = store
            .create_environment("host-a", &serde_json::json!({}))
            .expect("env");
        let job = store
            .create_job(NewJob {
                name: "nightly".into(),
                environment_id: env.id,
                volume: "data".into(),
                schedule: "daily".into(),
                retention: RetentionPolicy::default(),
                full_every: None,
                next_run: None,
            })
            .expect("job");
        (dir, store, job)
    }

    #[test]
    fn second_acquire_conflicts_until_expiry() {
        let (_dir, store, job) = setup();
        let locks = LockManager::new(&store);
        let t0 = Utc::now();
        let grant = locks
            .acquire(&job, "a", Duration::seconds(30), t0)
            .expect("first");
        assert!(grant.reclaimed.is_none());
        let err = locks
            .acquire(&job, "b", Duration::seconds(30), t0 + Duration::seconds(10))
            .unwrap_err();
        assert!(matches!(err, VaultError::Conflict(_)));

        let later = locks
            .acquire(&job, "b", Duration::seconds(30), t0 + Duration::seconds(40))
            .expect("reclaim");
        assert_eq!(later.reclaimed.map(|r| r.owner), Some("a".to_string()));
    }

    #[test]
    fn renew_fails_after_takeover() {
        let (_dir, store, job) = setup();
        let locks = LockManager::new(&store);
        let t0 = Utc::now();
        let a = locks.acquire(&job, "a", Duration::seconds(30), t0).unwrap();
        locks
            .renew(&a.lease.token, Duration::seconds(30), t0 + Duration::seconds(20))
            .expect("renew while live");
        let _b = locks
            .acquire(&job, "b", Duration::seconds(30), t0 + Duration::seconds(60))
            .unwrap();
        let err = locks
            .renew(&a.lease.token, Duration::seconds(30), t0 + Duration::seconds(61))
            .unwrap_err();
        assert!(matches!(err, VaultError::LeaseExpired(id) if id == job.id));
    }

    #[test]
    fn release_only_by_owner() {
        let (_dir, store, job) = setup();
        let locks = LockManager::new(&store);
        let now = Utc::now();
        let grant = locks.acquire(&job, "a", Duration::seconds(30), now).unwrap();
        let mut stranger = grant.lease.token;
        stranger.id = Uuid::new_v4();
        assert!(!locks.release(&stranger).unwrap());
        assert!(locks.is_leased(job.id, now).unwrap());
        assert!(locks.release(&grant.lease.token).unwrap());
        assert!(!locks.is_leased(job.id, now).unwrap());
    }

    #[test]
    fn pins_expire_and_release() {
        let (_dir, store, _job) = setup();
        let locks = LockManager::new(&store);
        let now = Utc::now();
        let token = locks
            .pin(&[EntryId(1), EntryId(2)], "restore", Duration::seconds(30), now)
            .unwrap();
        let pinned = locks.pinned_entries(now).unwrap();
        assert!(pinned.contains(&EntryId(1)) && pinned.contains(&EntryId(2)));
        assert!(locks
            .pinned_entries(now + Duration::seconds(31))
            .unwrap()
            .is_empty());
        locks.release_pin(token).unwrap();
        assert!(locks.pinned_entries(now).unwrap().is_empty());
        assert!(matches!(
            locks.renew_pin(token, Duration::seconds(30), now),
            Err(VaultError::PinExpired)
        ));
    }

    #[test]
    fn expired_pins_are_pruned_and_live_ones_kept() {
        let (_dir, store, _job) = setup();
        let locks = LockManager::new(&store);
        let t0 = Utc::now();
        // Holder crashed: never renewed, never released.
        locks
            .pin(&[EntryId(1), EntryId(2)], "crashed", Duration::seconds(30), t0)
            .unwrap();
        let live = locks
            .pin(&[EntryId(2)], "running", Duration::seconds(120), t0)
            .unwrap();

        let later = t0 + Duration::seconds(60);
        assert_eq!(locks.prune_expired_pins(later).unwrap(), 1);
        assert_eq!(locks.prune_expired_pins(later).unwrap(), 0);

        assert!(locks.tree.get(pin_slot_key(EntryId(1))).unwrap().is_none());
        let slots: Vec<PinSlot> =
            decode_raw(&locks.tree.get(pin_slot_key(EntryId(2))).unwrap().unwrap()).unwrap();
        assert_eq!(slots.len(), 1);
        assert_eq!(slots[0].token, live);
        assert_eq!(locks.tree.scan_prefix(PIN_PREFIX.as_bytes()).count(), 1);
    }

    #[test]
    fn rejects_non_positive_ttl() {
        let (_dir, store, job) = setup();
        let locks = LockManager::new(&store);
        assert!(matches!(
            locks.acquire(&job, "a", Duration::zero(), Utc::now()),
            Err(VaultError::InvalidConfig(_))
        ));
    }
}
