//! Operations exposed to collaborators (CLI, an API layer) and the long-running daemon.

use chrono::Utc;
use log::{debug, info, warn};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use crate::config::Config;
use crate::errors::{VaultError, VaultResult};
use crate::lease::LeaseRecord;
use crate::model::{
    ChainEntry, EntryId, Environment, EnvironmentId, Job, JobId, NewJob, RetentionPolicy,
    RunRecord, VolumeRef,
};
use crate::retention::{self, SweepReport};
use crate::schedule::Schedule;
use crate::scheduler::{start_scheduler, Scheduler};
use crate::store::MetadataStore;
use crate::transfer::fs::FsTransfer;
use crate::transfer::ContentTransfer;
use crate::worker::{
    backup, restore, start_worker_pool, RestoreRequest, RunRequest, WorkerContext, WorkerSettings,
};

/// Daemon loop timing.
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub poll_interval: Duration,
    pub max_concurrent_runs: usize,
    /// `None` disables the periodic retention sweep.
    pub sweep_interval: Option<Duration>,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(15),
            max_concurrent_runs: 4,
            sweep_interval: Some(Duration::from_secs(3600)),
        }
    }
}

/// Everything an operator wants to know about one job.
#[derive(Debug, Clone)]
pub struct JobStatusView {
    pub job: Job,
    pub lease: Option<LeaseRecord>,
    pub last_run: Option<RunRecord>,
    pub latest_entry: Option<ChainEntry>,
}

/// Result of reconciling configured environments and jobs.
#[derive(Debug, Clone, Default)]
pub struct ApplyReport {
    pub environments_created: usize,
    pub environments_updated: usize,
    pub jobs_created: usize,
    pub jobs_updated: usize,
}

pub struct Service {
    ctx: Arc<WorkerContext>,
    scheduler: Arc<Scheduler>,
    settings: ServiceSettings,
    runs: Mutex<Option<mpsc::UnboundedSender<RunRequest>>>,
}

impl Service {
    pub fn new(
        store: Arc<MetadataStore>,
        transfer: Arc<dyn ContentTransfer>,
        worker: WorkerSettings,
        settings: ServiceSettings,
    ) -> Self {
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            worker.owner.clone(),
            worker.lease_ttl,
        ));
        Self {
            ctx: Arc::new(WorkerContext::new(store, transfer, worker)),
            scheduler,
            settings,
            runs: Mutex::new(None),
        }
    }

    /// Open the metadata store and filesystem transfer described by `config`.
    pub fn from_config(config: &Config) -> VaultResult<Self> {
        let o = &config.orchestrator;
        let store = Arc::new(MetadataStore::open(&o.data_dir)?);
        std::fs::create_dir_all(&config.transfer.repository)?;
        let transfer = Arc::new(FsTransfer::new(
            &config.transfer.source_root,
            &config.transfer.repository,
        ));
        let worker = WorkerSettings {
            owner: o.node_id.clone(),
            lease_ttl: config.lease_ttl(),
            transfer_attempts: o.transfer_attempts,
            retry_backoff: Duration::from_millis(o.transfer_retry_backoff_ms),
        };
        let settings = ServiceSettings {
            poll_interval: Duration::from_secs(o.poll_interval_secs.max(1)),
            max_concurrent_runs: o.max_concurrent_runs,
            sweep_interval: (o.retention_sweep_interval_secs > 0)
                .then(|| Duration::from_secs(o.retention_sweep_interval_secs)),
        };
        Ok(Self::new(store, transfer, worker, settings))
    }

    pub fn store(&self) -> &MetadataStore {
        &self.ctx.store
    }

    pub fn context(&self) -> &WorkerContext {
        &self.ctx
    }

    // ------------------------------------------------------------------
    // Environments and jobs
    // ------------------------------------------------------------------

    pub fn create_environment(
        &self,
        name: &str,
        config: &serde_json::Value,
    ) -> VaultResult<Environment> {
        self.ctx.store.create_environment(name, config)
    }

    pub fn update_environment(
        &self,
        id: EnvironmentId,
        config: &serde_json::Value,
    ) -> VaultResult<Environment> {
        self.ctx.store.update_environment_config(id, config)
    }

    pub fn delete_environment(&self, id: EnvironmentId) -> VaultResult<()> {
        self.ctx.store.delete_environment(id)
    }

    pub fn list_environments(&self) -> VaultResult<Vec<Environment>> {
        self.ctx.store.list_environments()
    }

    /// Look an environment up by `env-N`, `N` or its name.
    pub fn resolve_environment(&self, reference: &str) -> VaultResult<Environment> {
        if let Ok(id) = reference.parse::<EnvironmentId>() {
            if let Ok(env) = self.ctx.store.get_environment(id) {
                return Ok(env);
            }
        }
        self.ctx
            .store
            .find_environment(reference)?
            .ok_or_else(|| VaultError::NotFound(format!("environment {}", reference)))
    }

    /// Create a job; its first slot is computed from now when not given.
    pub fn create_job(&self, mut new: NewJob) -> VaultResult<Job> {
        if new.next_run.is_none() {
            new.next_run = Schedule::parse(&new.schedule)?.next_after(Utc::now());
        }
        self.ctx.store.create_job(new)
    }

    pub fn delete_job(&self, id: JobId) -> VaultResult<Job> {
        self.ctx.store.delete_job(id)
    }

    pub fn set_job_enabled(&self, id: JobId, enabled: bool) -> VaultResult<Job> {
        let job = self.ctx.store.set_job_enabled(id, enabled)?;
        info!(
            "{} ({}) {}",
            job.name,
            id,
            if enabled { "enabled" } else { "disabled" }
        );
        Ok(job)
    }

    /// Look a job up by `job-N`, `N` or its name.
    pub fn resolve_job(&self, reference: &str) -> VaultResult<Job> {
        if let Ok(id) = reference.parse::<JobId>() {
            if let Ok(job) = self.ctx.store.get_job(id) {
                return Ok(job);
            }
        }
        self.ctx
            .store
            .find_job(reference)?
            .ok_or_else(|| VaultError::NotFound(format!("job {}", reference)))
    }

    pub fn job_status(&self, id: JobId) -> VaultResult<JobStatusView> {
        let job = self.ctx.store.get_job(id)?;
        let lease = self.ctx.locks.current(id)?;
        let last_run = self.ctx.store.runs_for_job(id)?.into_iter().next();
        let latest_entry = self.ctx.store.latest_valid_entry(&job.volume_ref())?;
        Ok(JobStatusView {
            job,
            lease,
            last_run,
            latest_entry,
        })
    }

    pub fn list_jobs(&self) -> VaultResult<Vec<Job>> {
        self.ctx.store.list_jobs()
    }

    pub fn list_entries(&self, volume: &VolumeRef) -> VaultResult<Vec<ChainEntry>> {
        self.ctx.store.list_volume_entries(volume)
    }

    pub fn run_history(&self, job: JobId) -> VaultResult<Vec<RunRecord>> {
        self.ctx.store.runs_for_job(job)
    }

    pub fn update_retention_policy(&self, job: JobId, policy: RetentionPolicy) -> VaultResult<Job> {
        self.ctx.store.set_retention_policy(job, policy)
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    fn submit(&self, request: RunRequest) -> VaultResult<()> {
        let guard = self
            .runs
            .lock()
            .map_err(|_| VaultError::Internal("run queue lock poisoned".into()))?;
        let Some(tx) = guard.as_ref() else {
            return Err(VaultError::Internal("worker pool is not running".into()));
        };
        tx.send(request)
            .map_err(|_| VaultError::Internal("worker pool is shut down".into()))
    }

    /// Lease the job and hand it to the worker pool.
    pub fn enqueue_backup(&self, job: JobId) -> VaultResult<()> {
        let lease = self.scheduler.enqueue_now(job, Utc::now())?;
        if let Err(e) = self.submit(RunRequest::Backup { job, lease }) {
            let _ = self.ctx.locks.release(&lease);
            return Err(e);
        }
        info!("{} enqueued on request", job);
        Ok(())
    }

    pub fn enqueue_restore(
        &self,
        entry: EntryId,
        destination: &str,
        resume_from: usize,
    ) -> VaultResult<()> {
        self.ctx.store.get_entry(entry)?;
        self.submit(RunRequest::Restore(RestoreRequest {
            target: entry,
            destination: destination.to_string(),
            resume_from,
        }))
    }

    /// Run a backup in the calling task and wait for its run record.
    pub async fn backup_now(&self, job: JobId) -> VaultResult<RunRecord> {
        let lease = self.scheduler.enqueue_now(job, Utc::now())?;
        backup::execute(&self.ctx, job, lease).await
    }

    /// Run a restore in the calling task and wait for its run record.
    pub async fn restore_now(
        &self,
        entry: EntryId,
        destination: &str,
        resume_from: usize,
    ) -> VaultResult<RunRecord> {
        restore::execute(
            &self.ctx,
            RestoreRequest {
                target: entry,
                destination: destination.to_string(),
                resume_from,
            },
        )
        .await
    }

    pub async fn sweep_retention(&self, dry_run: bool) -> VaultResult<SweepReport> {
        retention::sweep(&self.ctx, Utc::now(), dry_run).await
    }

    // ------------------------------------------------------------------
    // Configuration reconciliation
    // ------------------------------------------------------------------

    /// Create or update the environments and jobs declared in `config`, matched by name.
    /// Existing chain entries are never touched.
    pub fn apply_config(&self, config: &Config) -> VaultResult<ApplyReport> {
        let store = &self.ctx.store;
        let now = Utc::now();
        let mut report = ApplyReport::default();

        for env_cfg in &config.environments {
            let blob = serde_json::to_value(&env_cfg.config)?;
            let env = match store.find_environment(&env_cfg.name)? {
                Some(env) if env.config_value()? == blob => env,
                Some(env) => {
                    report.environments_updated += 1;
                    store.update_environment_config(env.id, &blob)?
                }
                None => {
                    report.environments_created += 1;
                    store.create_environment(&env_cfg.name, &blob)?
                }
            };

            for job_cfg in &env_cfg.jobs {
                let schedule = Schedule::parse(&job_cfg.schedule)?;
                let retention: RetentionPolicy = job_cfg.retention.into();
                match store.find_job(&job_cfg.name)? {
                    None => {
                        store.create_job(NewJob {
                            name: job_cfg.name.clone(),
                            environment_id: env.id,
                            volume: job_cfg.volume.clone(),
                            schedule: job_cfg.schedule.clone(),
                            retention,
                            full_every: job_cfg.full_every,
                            next_run: schedule.next_after(now),
                        })?;
                        report.jobs_created += 1;
                    }
                    Some(job) => {
                        if job.environment_id != env.id || job.volume != job_cfg.volume {
                            return Err(VaultError::InvalidConfig(format!(
                                "job '{}' cannot move to another environment or volume; \
                                 create a new job instead",
                                job.name
                            )));
                        }
                        let unchanged = job.schedule == job_cfg.schedule
                            && job.retention == retention
                            && job.full_every == job_cfg.full_every;
                        if unchanged {
                            continue;
                        }
                        let schedule_changed = job.schedule != job_cfg.schedule;
                        store.update_job(job.id, |j| {
                            if schedule_changed {
                                j.schedule = job_cfg.schedule.clone();
                                j.next_run = schedule.next_after(now);
                            }
                            j.retention = retention;
                            j.full_every = job_cfg.full_every;
                            Ok(())
                        })?;
                        report.jobs_updated += 1;
                    }
                }
            }
        }
        info!(
            "configuration applied: {} env created, {} env updated, {} jobs created, {} jobs updated",
            report.environments_created,
            report.environments_updated,
            report.jobs_created,
            report.jobs_updated
        );
        Ok(report)
    }

    // ------------------------------------------------------------------
    // Daemon
    // ------------------------------------------------------------------

    /// Run scheduler, worker pool and retention sweeper until `shutdown` resolves.
    pub async fn run<S>(&self, shutdown: S) -> VaultResult<()>
    where
        S: Future<Output = ()>,
    {
        let pool = start_worker_pool(self.ctx.clone(), self.settings.max_concurrent_runs);
        {
            let mut guard = self
                .runs
                .lock()
                .map_err(|_| VaultError::Internal("run queue lock poisoned".into()))?;
            *guard = Some(pool.sender());
        }
        let scheduler = start_scheduler(
            self.scheduler.clone(),
            pool.sender(),
            self.settings.poll_interval,
        );
        let (sweep_stop, sweeper) = match self.settings.sweep_interval {
            Some(every) => {
                let (tx, rx) = oneshot::channel();
                (Some(tx), Some(spawn_sweeper(self.ctx.clone(), every, rx)))
            }
            None => (None, None),
        };
        info!(
            "chainvault running: poll every {:?}, {} worker slot(s)",
            self.settings.poll_interval, self.settings.max_concurrent_runs
        );

        shutdown.await;
        info!("shutting down");

        scheduler.shutdown().await;
        if let Some(stop) = sweep_stop {
            let _ = stop.send(());
        }
        if let Some(task) = sweeper {
            let _ = task.await;
        }
        if let Ok(mut guard) = self.runs.lock() {
            guard.take();
        }
        pool.shutdown().await;
        self.ctx.store.flush()?;
        Ok(())
    }
}

fn spawn_sweeper(
    ctx: Arc<WorkerContext>,
    every: Duration,
    mut stop: oneshot::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = &mut stop => break,
                _ = ticker.tick() => {
                    match retention::sweep(&ctx, Utc::now(), false).await {
                        Ok(report) => debug!(
                            "periodic sweep: {} deleted, {} pinned",
                            report.deleted.len(),
                            report.pinned.len()
                        ),
                        Err(e) => warn!("periodic retention sweep failed: {}", e),
                    }
                }
            }
        }
    })
}
