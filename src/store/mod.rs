//! # Metadata Store
//!
//! Sled-backed durable record of environments, jobs, chain entries and run history.
//! Every multi-record state change (validating an entry together with its run and job,
//! deleting an entry together with its parent's child counter) runs as one sled
//! transaction, so partial application is never observable.
//!
//! ## Trees
//!
//! ```text
//! environments   <id>                → Environment
//! jobs           <id>                → Job
//! names          env:<name> / job:<name> → id
//! entries        <id>                → ChainEntry
//! volumes        <env><volume>\0<entry> → ()
//! children       <parent>            → u32 count of non-deleted children
//! successors     <parent>            → id of the valid incremental child
//! runs           <id>                → RunRecord
//! job_runs       <job>\0<run>        → ()
//! leases         (owned by crate::lease)
//! ```
//!
//! Ids come from `sled::Db::generate_id`, so they are unique across processes sharing
//! the database and increase with creation order.

pub(crate) mod codec;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use sled::Transactional;
use std::path::Path;

use crate::chain;
use crate::errors::{VaultError, VaultResult};
use crate::lease::{self, LeaseToken};
use crate::model::{
    ChainEntry, EntryId, EntryStatus, Environment, EnvironmentId, Job, JobId,
    JobStatus, NewEntry, NewJob, RetentionPolicy, RunCompletion, RunId, RunKind, RunOutcome,
    RunRecord, VolumeRef, ENTRY_SCHEMA_VERSION, ENVIRONMENT_SCHEMA_VERSION, JOB_SCHEMA_VERSION,
    RUN_SCHEMA_VERSION,
};
use codec::{
    abort, decode, finish, id_key, job_run_key, job_run_prefix, parse_id_key, parse_volume_key,
    read_counter, tx_decode, tx_load, tx_store, volume_key, volume_prefix, Record,
};

const TREE_ENVIRONMENTS: &str = "environments";
const TREE_JOBS: &str = "jobs";
const TREE_NAMES: &str = "names";
const TREE_ENTRIES: &str = "entries";
const TREE_VOLUMES: &str = "volumes";
const TREE_CHILDREN: &str = "children";
const TREE_SUCCESSORS: &str = "successors";
const TREE_RUNS: &str = "runs";
const TREE_JOB_RUNS: &str = "job_runs";
const TREE_LEASES: &str = "leases";

fn env_name_key(name: &str) -> Vec<u8> {
    format!("env:{}", name).into_bytes()
}

fn job_name_key(name: &str) -> Vec<u8> {
    format!("job:{}", name).into_bytes()
}

/// Durable, transactional metadata for the orchestrator.
pub struct MetadataStore {
    db: sled::Db,
    environments: sled::Tree,
    jobs: sled::Tree,
    names: sled::Tree,
    entries: sled::Tree,
    volumes: sled::Tree,
    children: sled::Tree,
    successors: sled::Tree,
    runs: sled::Tree,
    job_runs: sled::Tree,
    leases: sled::Tree,
}

impl MetadataStore {
    /// Open (or create) the store rooted at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> VaultResult<Self> {
        let path_ref = path.as_ref();
        std::fs::create_dir_all(path_ref)?;
        let db = sled::open(path_ref)?;
        let store = Self {
            environments: db.open_tree(TREE_ENVIRONMENTS)?,
            jobs: db.open_tree(TREE_JOBS)?,
            names: db.open_tree(TREE_NAMES)?,
            entries: db.open_tree(TREE_ENTRIES)?,
            volumes: db.open_tree(TREE_VOLUMES)?,
            children: db.open_tree(TREE_CHILDREN)?,
            successors: db.open_tree(TREE_SUCCESSORS)?,
            runs: db.open_tree(TREE_RUNS)?,
            job_runs: db.open_tree(TREE_JOB_RUNS)?,
            leases: db.open_tree(TREE_LEASES)?,
            db,
        };
        debug!("metadata store opened at {}", path_ref.display());
        Ok(store)
    }

    pub(crate) fn leases(&self) -> &sled::Tree {
        &self.leases
    }

    pub fn flush(&self) -> VaultResult<()> {
        self.db.flush()?;
        Ok(())
    }

    fn next_id(&self) -> VaultResult<u64> {
        Ok(self.db.generate_id()? + 1)
    }

    fn get_record<T: Record>(&self, tree: &sled::Tree, id: u64, what: &str) -> VaultResult<T> {
        let Some(bytes) = tree.get(id_key(id))? else {
            return Err(VaultError::NotFound(format!("{} {}", what, id)));
        };
        decode(&bytes)
    }

    fn scan_records<T: Record>(tree: &sled::Tree) -> VaultResult<Vec<T>> {
        let mut out = Vec::new();
        for item in tree.iter() {
            let (_, value) = item?;
            out.push(decode(&value)?);
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Environments
    // ------------------------------------------------------------------

    pub fn create_environment(
        &self,
        name: &str,
        config: &serde_json::Value,
    ) -> VaultResult<Environment> {
        if name.trim().is_empty() {
            return Err(VaultError::InvalidConfig("environment name is empty".into()));
        }
        let now = Utc::now();
        let env = Environment {
            id: EnvironmentId(self.next_id()?),
            name: name.to_string(),
            config: serde_json::to_string(config)?,
            created_at: now,
            updated_at: now,
            schema_version: ENVIRONMENT_SCHEMA_VERSION,
        };
        finish((&self.environments, &self.names).transaction(|(envs, names)| {
            if names.get(env_name_key(name))?.is_some() {
                return abort(VaultError::Conflict(format!(
                    "environment '{}' already exists",
                    name
                )));
            }
            names.insert(env_name_key(name), id_key(env.id.0))?;
            tx_store(envs, env.id.0, &env)
        }))?;
        info!("created environment {} ({})", env.name, env.id);
        Ok(env)
    }

    pub fn get_environment(&self, id: EnvironmentId) -> VaultResult<Environment> {
        self.get_record(&self.environments, id.0, "environment")
    }

    pub fn find_environment(&self, name: &str) -> VaultResult<Option<Environment>> {
        match self.names.get(env_name_key(name))?.and_then(|b| parse_id_key(&b)) {
            Some(id) => Ok(Some(self.get_environment(EnvironmentId(id))?)),
            None => Ok(None),
        }
    }

    pub fn list_environments(&self) -> VaultResult<Vec<Environment>> {
        Self::scan_records(&self.environments)
    }

    /// Replace the configuration blob. Existing chain entries are untouched.
    pub fn update_environment_config(
        &self,
        id: EnvironmentId,
        config: &serde_json::Value,
    ) -> VaultResult<Environment> {
        let text = serde_json::to_string(config)?;
        let now = Utc::now();
        finish(self.environments.transaction(|envs| {
            let mut env: Environment = tx_load(envs, id.0, "environment")?;
            env.config = text.clone();
            env.updated_at = now;
            tx_store(envs, id.0, &env)?;
            Ok(env)
        }))
    }

    /// Remove an environment that no job references any more.
    pub fn delete_environment(&self, id: EnvironmentId) -> VaultResult<()> {
        let env = self.get_environment(id)?;
        let referencing: Vec<JobId> = self
            .list_jobs()?
            .into_iter()
            .filter(|j| j.environment_id == id)
            .map(|j| j.id)
            .collect();
        if !referencing.is_empty() {
            return Err(VaultError::Conflict(format!(
                "{} is still referenced by {} job(s)",
                id,
                referencing.len()
            )));
        }
        finish((&self.environments, &self.names).transaction(|(envs, names)| {
            envs.remove(id_key(id.0))?;
            names.remove(env_name_key(&env.name))?;
            Ok(())
        }))?;
        info!("deleted environment {} ({})", env.name, id);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Jobs
    // ------------------------------------------------------------------

    pub fn create_job(&self, new: NewJob) -> VaultResult<Job> {
        if new.name.trim().is_empty() {
            return Err(VaultError::InvalidConfig("job name is empty".into()));
        }
        if new.volume.is_empty() || new.volume.contains('\0') {
            return Err(VaultError::InvalidConfig(format!(
                "invalid volume identifier {:?}",
                new.volume
            )));
        }
        crate::schedule::Schedule::parse(&new.schedule)?;
        let job = Job {
            id: JobId(self.next_id()?),
            name: new.name.clone(),
            environment_id: new.environment_id,
            volume: new.volume.clone(),
            schedule: new.schedule.clone(),
            retention: new.retention,
            full_every: new.full_every,
            last_run: None,
            next_run: new.next_run,
            status: JobStatus::Idle,
            created_at: Utc::now(),
            schema_version: JOB_SCHEMA_VERSION,
        };
        finish(
            (&self.environments, &self.jobs, &self.names).transaction(|(envs, jobs, names)| {
                let _env: Environment = tx_load(envs, new.environment_id.0, "environment")?;
                if names.get(job_name_key(&new.name))?.is_some() {
                    return abort(VaultError::Conflict(format!(
                        "job '{}' already exists",
                        new.name
                    )));
                }
                names.insert(job_name_key(&new.name), id_key(job.id.0))?;
                tx_store(jobs, job.id.0, &job)
            }),
        )?;
        info!(
            "created job {} ({}) for volume {} schedule '{}'",
            job.name, job.id, job.volume, job.schedule
        );
        Ok(job)
    }

    pub fn get_job(&self, id: JobId) -> VaultResult<Job> {
        self.get_record(&self.jobs, id.0, "job")
    }

    pub fn find_job(&self, name: &str) -> VaultResult<Option<Job>> {
        match self.names.get(job_name_key(name))?.and_then(|b| parse_id_key(&b)) {
            Some(id) => Ok(Some(self.get_job(JobId(id))?)),
            None => Ok(None),
        }
    }

    pub fn list_jobs(&self) -> VaultResult<Vec<Job>> {
        Self::scan_records(&self.jobs)
    }

    pub fn jobs_for_volume(&self, volume: &VolumeRef) -> VaultResult<Vec<Job>> {
        Ok(self
            .list_jobs()?
            .into_iter()
            .filter(|j| j.environment_id == volume.environment_id && j.volume == volume.volume)
            .collect())
    }

    /// Read-modify-write a job atomically.
    pub fn update_job<F>(&self, id: JobId, mutate: F) -> VaultResult<Job>
    where
        F: Fn(&mut Job) -> VaultResult<()>,
    {
        finish(self.jobs.transaction(|jobs| {
            let mut job: Job = tx_load(jobs, id.0, "job")?;
            if let Err(err) = mutate(&mut job) {
                return abort(err);
            }
            tx_store(jobs, id.0, &job)?;
            Ok(job)
        }))
    }

    /// Replace the job's retention policy. Entries keep the snapshot taken at creation.
    pub fn set_retention_policy(&self, id: JobId, policy: RetentionPolicy) -> VaultResult<Job> {
        let job = self.update_job(id, |job| {
            job.retention = policy;
            Ok(())
        })?;
        info!("retention for {} set to {}", id, policy);
        Ok(job)
    }

    pub fn set_job_enabled(&self, id: JobId, enabled: bool) -> VaultResult<Job> {
        self.update_job(id, |job| {
            job.status = match (enabled, job.status) {
                (false, _) => JobStatus::Disabled,
                (true, JobStatus::Disabled) => JobStatus::Idle,
                (true, other) => other,
            };
            Ok(())
        })
    }

    pub fn mark_job_queued(&self, id: JobId, next_run: Option<DateTime<Utc>>) -> VaultResult<Job> {
        self.update_job(id, |job| {
            if job.status == JobStatus::Disabled {
                return Err(VaultError::Conflict(format!("{} is disabled", job.id)));
            }
            job.status = JobStatus::Queued;
            if next_run.is_some() {
                job.next_run = next_run;
            }
            Ok(())
        })
    }

    /// Remove the job definition. Chain entries and run history are kept.
    pub fn delete_job(&self, id: JobId) -> VaultResult<Job> {
        let job = finish((&self.jobs, &self.names).transaction(|(jobs, names)| {
            let job: Job = tx_load(jobs, id.0, "job")?;
            jobs.remove(id_key(id.0))?;
            names.remove(job_name_key(&job.name))?;
            Ok(job)
        }))?;
        info!("deleted job {} ({}); chain entries retained", job.name, id);
        Ok(job)
    }

    // ------------------------------------------------------------------
    // Runs
    // ------------------------------------------------------------------

    fn new_run(&self, job_id: Option<JobId>, kind: RunKind) -> VaultResult<RunRecord> {
        Ok(RunRecord {
            id: RunId(self.next_id()?),
            job_id,
            kind,
            started_at: Utc::now(),
            completed_at: None,
            outcome: None,
            bytes_moved: 0,
            error_detail: None,
            progress: 0,
            schema_version: RUN_SCHEMA_VERSION,
        })
    }

    /// Append a new run record. A job-bound run flips the job to `running` atomically.
    pub fn begin_run(&self, job_id: Option<JobId>, kind: RunKind) -> VaultResult<RunRecord> {
        let run = self.new_run(job_id, kind)?;
        finish(
            (&self.runs, &self.job_runs, &self.jobs).transaction(|(runs, job_runs, jobs)| {
                if let Some(job_id) = job_id {
                    if matches!(run.kind, RunKind::Backup { .. }) {
                        let mut job: Job = tx_load(jobs, job_id.0, "job")?;
                        if job.status != JobStatus::Disabled {
                            job.status = JobStatus::Running;
                        }
                        tx_store(jobs, job_id.0, &job)?;
                    }
                    job_runs.insert(job_run_key(job_id, run.id), Vec::<u8>::new())?;
                }
                tx_store(runs, run.id.0, &run)
            }),
        )?;
        Ok(run)
    }

    /// Start a backup run under `lease`. The lease is verified and pointed at the new run,
    /// and the job flips to `running`, in one transaction. A request whose lease lapsed
    /// while it sat in the queue fails with `LeaseExpired` and writes nothing.
    pub fn begin_backup(&self, lease: &LeaseToken, now: DateTime<Utc>) -> VaultResult<RunRecord> {
        let job_id = lease.job_id;
        let run = self.new_run(Some(job_id), RunKind::Backup { entry: None })?;
        finish(
            (&self.runs, &self.job_runs, &self.jobs, &self.leases).transaction(
                |(runs, job_runs, jobs, leases)| {
                    lease::attach_run_in_tx(leases, lease, run.id, now)?;
                    let mut job: Job = tx_load(jobs, job_id.0, "job")?;
                    if job.status != JobStatus::Disabled {
                        job.status = JobStatus::Running;
                    }
                    tx_store(jobs, job_id.0, &job)?;
                    job_runs.insert(job_run_key(job_id, run.id), Vec::<u8>::new())?;
                    tx_store(runs, run.id.0, &run)
                },
            ),
        )?;
        Ok(run)
    }

    pub fn get_run(&self, id: RunId) -> VaultResult<RunRecord> {
        self.get_record(&self.runs, id.0, "run")
    }

    /// Run history of a job, newest first.
    pub fn runs_for_job(&self, job: JobId) -> VaultResult<Vec<RunRecord>> {
        let mut out = Vec::new();
        for item in self.job_runs.scan_prefix(job_run_prefix(job)) {
            let (key, _) = item?;
            let run_part = &key[key.len() - 20..];
            if let Some(id) = parse_id_key(run_part) {
                out.push(self.get_run(RunId(id))?);
            }
        }
        out.reverse();
        Ok(out)
    }

    pub fn recent_runs(&self, limit: usize) -> VaultResult<Vec<RunRecord>> {
        let mut out = Vec::new();
        for item in self.runs.iter().rev().take(limit) {
            let (_, value) = item?;
            out.push(decode(&value)?);
        }
        Ok(out)
    }

    /// Record restore progress on a run that is still open.
    pub fn record_progress(&self, id: RunId, progress: u32, bytes_moved: u64) -> VaultResult<()> {
        finish(self.runs.transaction(|runs| {
            let mut run: RunRecord = tx_load(runs, id.0, "run")?;
            if run.is_terminal() {
                return abort(VaultError::Conflict(format!("{} already completed", id)));
            }
            run.progress = progress;
            run.bytes_moved = bytes_moved;
            tx_store(runs, id.0, &run)
        }))
    }

    /// Close a run. Fails with `Conflict` if it was already closed.
    pub fn complete_run(&self, id: RunId, completion: RunCompletion) -> VaultResult<RunRecord> {
        let now = Utc::now();
        finish((&self.runs, &self.jobs).transaction(|(runs, jobs)| {
            let run = Self::close_run_tx(runs, id, &completion, now)?;
            Self::settle_job_tx(jobs, &run, now)?;
            Ok(run)
        }))
    }

    fn close_run_tx(
        runs: &sled::transaction::TransactionalTree,
        id: RunId,
        completion: &RunCompletion,
        now: DateTime<Utc>,
    ) -> codec::TxResult<RunRecord> {
        let mut run: RunRecord = tx_load(runs, id.0, "run")?;
        if run.is_terminal() {
            return abort(VaultError::Conflict(format!("{} already completed", id)));
        }
        run.completed_at = Some(now);
        run.outcome = Some(completion.outcome);
        run.bytes_moved = run.bytes_moved.max(completion.bytes_moved);
        run.error_detail = completion.error_detail.clone();
        tx_store(runs, id.0, &run)?;
        Ok(run)
    }

    /// After a backup run closes its job goes back to idle and records the run time.
    fn settle_job_tx(
        jobs: &sled::transaction::TransactionalTree,
        run: &RunRecord,
        now: DateTime<Utc>,
    ) -> codec::TxResult<()> {
        let (Some(job_id), RunKind::Backup { .. }) = (run.job_id, &run.kind) else {
            return Ok(());
        };
        // The job may have been deleted while the run was in flight.
        let Some(bytes) = jobs.get(id_key(job_id.0))? else {
            return Ok(());
        };
        let mut job: Job = tx_decode(&bytes)?;
        if job.status != JobStatus::Disabled {
            job.status = JobStatus::Idle;
        }
        job.last_run = Some(now);
        tx_store(jobs, job_id.0, &job)
    }

    // ------------------------------------------------------------------
    // Chain entries
    // ------------------------------------------------------------------

    /// Append a chain entry in `pending` state. An incremental's parent must exist and be
    /// `valid` at the moment of creation.
    pub fn create_pending_entry(&self, new: NewEntry) -> VaultResult<ChainEntry> {
        let entry = ChainEntry {
            id: EntryId(self.next_id()?),
            volume: new.volume.clone(),
            kind: new.kind.clone(),
            created_at: Utc::now(),
            size_bytes: new.size_bytes,
            checksums: new.checksums.clone(),
            metadata: new.metadata.clone(),
            status: EntryStatus::Pending,
            retention: new.retention,
            job_id: new.job_id,
            run_id: new.run_id,
            handle: new.handle.clone(),
            schema_version: ENTRY_SCHEMA_VERSION,
        };
        finish(
            (&self.entries, &self.volumes, &self.children, &self.runs).transaction(
                |(entries, volumes, children, runs)| {
                    if let Some(parent_id) = entry.parent() {
                        let parent: ChainEntry = tx_load(entries, parent_id.0, "chain entry")?;
                        if parent.status != EntryStatus::Valid {
                            return abort(VaultError::Conflict(format!(
                                "parent {} is {}, not valid",
                                parent_id, parent.status
                            )));
                        }
                        if parent.volume != entry.volume {
                            return abort(VaultError::Conflict(format!(
                                "parent {} belongs to volume {}",
                                parent_id, parent.volume
                            )));
                        }
                        let count = read_counter(children.get(id_key(parent_id.0))?);
                        children.insert(id_key(parent_id.0), &(count + 1).to_be_bytes()[..])?;
                    }
                    if let Some(run_id) = entry.run_id {
                        let mut run: RunRecord = tx_load(runs, run_id.0, "run")?;
                        if run.is_terminal() {
                            return abort(VaultError::Conflict(format!(
                                "{} already completed",
                                run_id
                            )));
                        }
                        run.kind = RunKind::Backup {
                            entry: Some(entry.id),
                        };
                        tx_store(runs, run_id.0, &run)?;
                    }
                    volumes.insert(volume_key(&entry.volume, entry.id), Vec::<u8>::new())?;
                    tx_store(entries, entry.id.0, &entry)
                },
            ),
        )?;
        debug!(
            "pending {} entry {} on volume {}",
            entry.kind.label(),
            entry.id,
            entry.volume
        );
        Ok(entry)
    }

    pub fn get_entry(&self, id: EntryId) -> VaultResult<ChainEntry> {
        self.get_record(&self.entries, id.0, "chain entry")
    }

    /// All entries of a volume (any status), parents before children.
    pub fn list_volume_entries(&self, volume: &VolumeRef) -> VaultResult<Vec<ChainEntry>> {
        let prefix = volume_prefix(volume);
        let mut entries = Vec::new();
        for item in self.volumes.scan_prefix(&prefix) {
            let (key, _) = item?;
            if let Some(id) = parse_id_key(&key[prefix.len()..]) {
                entries.push(self.get_entry(EntryId(id))?);
            }
        }
        Ok(chain::causal_order(entries))
    }

    /// Distinct volumes that have at least one entry, grouped by environment.
    pub fn list_volumes(&self) -> VaultResult<Vec<VolumeRef>> {
        let mut volumes: Vec<VolumeRef> = Vec::new();
        for item in self.volumes.iter() {
            let (key, _) = item?;
            let Some(volume) = parse_volume_key(&key) else {
                warn!("unreadable volume index key {:?}", key);
                continue;
            };
            if volumes.last() != Some(&volume) {
                volumes.push(volume);
            }
        }
        Ok(volumes)
    }

    pub fn latest_valid_entry(&self, volume: &VolumeRef) -> VaultResult<Option<ChainEntry>> {
        Ok(chain::latest_valid(&self.list_volume_entries(volume)?).cloned())
    }

    /// Transition a `pending` entry to `valid` or `corrupt`. Fails with `Conflict` if the
    /// entry is no longer pending (someone else validated it first).
    pub fn transition_entry(&self, id: EntryId, to: EntryStatus) -> VaultResult<ChainEntry> {
        if !matches!(to, EntryStatus::Valid | EntryStatus::Corrupt) {
            return Err(VaultError::Internal(format!(
                "pending entries can only become valid or corrupt, not {}",
                to
            )));
        }
        finish(
            (&self.entries, &self.successors).transaction(|(entries, successors)| {
                Self::transition_tx(entries, successors, id, to)
            }),
        )
    }

    fn transition_tx(
        entries: &sled::transaction::TransactionalTree,
        successors: &sled::transaction::TransactionalTree,
        id: EntryId,
        to: EntryStatus,
    ) -> codec::TxResult<ChainEntry> {
        let mut entry: ChainEntry = tx_load(entries, id.0, "chain entry")?;
        if entry.status != EntryStatus::Pending {
            return abort(VaultError::Conflict(format!(
                "{} is {}, not pending",
                id, entry.status
            )));
        }
        if to == EntryStatus::Valid {
            if let Some(parent_id) = entry.parent() {
                let parent: ChainEntry = tx_load(entries, parent_id.0, "chain entry")?;
                if parent.status != EntryStatus::Valid {
                    return abort(VaultError::Conflict(format!(
                        "parent {} became {}",
                        parent_id, parent.status
                    )));
                }
                if let Some(bytes) = successors.get(id_key(parent_id.0))? {
                    if let Some(other) = parse_id_key(&bytes) {
                        let sibling: Option<ChainEntry> = match entries.get(id_key(other))? {
                            Some(b) => Some(tx_decode(&b)?),
                            None => None,
                        };
                        if sibling.map(|s| s.is_valid()).unwrap_or(false) {
                            return abort(VaultError::Conflict(format!(
                                "parent {} already has valid successor entry-{}",
                                parent_id, other
                            )));
                        }
                    }
                }
                successors.insert(id_key(parent_id.0), id_key(id.0))?;
            }
        }
        entry.status = to;
        tx_store(entries, id.0, &entry)?;
        Ok(entry)
    }

    /// Validate a backup entry, close its run and settle its job in one transaction.
    /// Fails with `LeaseExpired` if `lease` no longer owns the job at `now`.
    pub fn commit_backup(
        &self,
        entry_id: EntryId,
        run_id: RunId,
        lease: &LeaseToken,
        completion: RunCompletion,
        now: DateTime<Utc>,
    ) -> VaultResult<(ChainEntry, RunRecord)> {
        let result = finish(
            (
                &self.entries,
                &self.successors,
                &self.runs,
                &self.jobs,
                &self.leases,
            )
                .transaction(|(entries, successors, runs, jobs, leases)| {
                    lease::verify_in_tx(leases, lease, now)?;
                    let entry = Self::transition_tx(entries, successors, entry_id, EntryStatus::Valid)?;
                    let run = Self::close_run_tx(runs, run_id, &completion, now)?;
                    Self::settle_job_tx(jobs, &run, now)?;
                    Ok((entry, run))
                }),
        )?;
        info!(
            "committed {} entry {} for volume {} ({} units, {} bytes)",
            result.0.kind.label(),
            entry_id,
            result.0.volume,
            result.0.checksums.len(),
            result.0.size_bytes
        );
        Ok(result)
    }

    /// Close a failed backup run. Its entry, if still pending, becomes `corrupt` in the
    /// same transaction so it is never used as a parent.
    pub fn fail_backup(
        &self,
        run_id: RunId,
        completion: RunCompletion,
    ) -> VaultResult<RunRecord> {
        self.close_failed(run_id, &completion, true)
    }

    /// Close a run whose worker lost its lease. The job itself is left alone since a newer
    /// lease holder may already be driving it. Already-closed runs are ignored.
    pub fn abandon_run(&self, run_id: RunId, detail: &str) -> VaultResult<Option<RunRecord>> {
        let completion = RunCompletion::failure(RunOutcome::Aborted, 0, detail);
        match self.close_failed(run_id, &completion, false) {
            Ok(run) => {
                warn!("abandoned {}: {}", run_id, detail);
                Ok(Some(run))
            }
            Err(VaultError::Conflict(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn close_failed(
        &self,
        run_id: RunId,
        completion: &RunCompletion,
        settle_job: bool,
    ) -> VaultResult<RunRecord> {
        let now = Utc::now();
        finish(
            (&self.entries, &self.runs, &self.jobs).transaction(|(entries, runs, jobs)| {
                let run = Self::close_run_tx(runs, run_id, completion, now)?;
                if let Some(entry_id) = run.produced_entry() {
                    if let Some(bytes) = entries.get(id_key(entry_id.0))? {
                        let mut entry: ChainEntry = tx_decode(&bytes)?;
                        if entry.status == EntryStatus::Pending {
                            entry.status = EntryStatus::Corrupt;
                            tx_store(entries, entry_id.0, &entry)?;
                        }
                    }
                }
                if settle_job {
                    Self::settle_job_tx(jobs, &run, now)?;
                }
                Ok(run)
            }),
        )
    }

    /// Entries stuck in `pending` whose producing run is closed (or gone) become `corrupt`.
    /// Returns the ids that were changed.
    pub fn recover_abandoned_entries(&self) -> VaultResult<Vec<EntryId>> {
        let mut recovered = Vec::new();
        for entry in Self::scan_records::<ChainEntry>(&self.entries)? {
            if entry.status != EntryStatus::Pending {
                continue;
            }
            let orphaned = match entry.run_id {
                Some(run_id) => match self.get_run(run_id) {
                    Ok(run) => run.is_terminal(),
                    Err(VaultError::NotFound(_)) => true,
                    Err(err) => return Err(err),
                },
                None => false,
            };
            if !orphaned {
                continue;
            }
            match self.transition_entry(entry.id, EntryStatus::Corrupt) {
                Ok(_) => {
                    warn!("pending entry {} abandoned by its run, marked corrupt", entry.id);
                    recovered.push(entry.id);
                }
                Err(VaultError::Conflict(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(recovered)
    }

    /// Mark an entry `deleted`. Re-checks, inside the transaction, that no non-deleted
    /// child references it and that no restore pin covers it.
    pub fn mark_entry_deleted(&self, id: EntryId, now: DateTime<Utc>) -> VaultResult<ChainEntry> {
        let entry = finish(
            (
                &self.entries,
                &self.children,
                &self.successors,
                &self.leases,
            )
                .transaction(|(entries, children, successors, leases)| {
                    let mut entry: ChainEntry = tx_load(entries, id.0, "chain entry")?;
                    match entry.status {
                        EntryStatus::Deleted => {
                            return abort(VaultError::Conflict(format!("{} already deleted", id)))
                        }
                        EntryStatus::Pending => {
                            return abort(VaultError::Conflict(format!("{} is still pending", id)))
                        }
                        EntryStatus::Valid | EntryStatus::Corrupt => {}
                    }
                    let live_children = read_counter(children.get(id_key(id.0))?);
                    if live_children > 0 {
                        return abort(VaultError::Conflict(format!(
                            "{} still has {} live child(ren)",
                            id, live_children
                        )));
                    }
                    if lease::pinned_in_tx(leases, id, now)? {
                        return abort(VaultError::Conflict(format!(
                            "{} is pinned by a restore",
                            id
                        )));
                    }
                    if let Some(parent_id) = entry.parent() {
                        let count = read_counter(children.get(id_key(parent_id.0))?);
                        if count <= 1 {
                            children.remove(id_key(parent_id.0))?;
                        } else {
                            children.insert(id_key(parent_id.0), &(count - 1).to_be_bytes()[..])?;
                        }
                        if let Some(bytes) = successors.get(id_key(parent_id.0))? {
                            if parse_id_key(&bytes) == Some(id.0) {
                                successors.remove(id_key(parent_id.0))?;
                            }
                        }
                    }
                    children.remove(id_key(id.0))?;
                    entry.status = EntryStatus::Deleted;
                    tx_store(entries, id.0, &entry)?;
                    Ok(entry)
                }),
        )?;
        info!("entry {} on volume {} marked deleted", id, entry.volume);
        Ok(entry)
    }

    /// Number of non-deleted children referencing `id` as parent.
    pub fn live_children(&self, id: EntryId) -> VaultResult<u32> {
        Ok(read_counter(self.children.get(id_key(id.0))?))
    }

    #[cfg(test)]
    pub(crate) fn overwrite_entry(&self, entry: &ChainEntry) -> VaultResult<()> {
        self.entries.insert(id_key(entry.id.0), codec::encode(entry)?)?;
        Ok(())
    }
}
