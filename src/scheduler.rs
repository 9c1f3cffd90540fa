//! Due-job scanning and run enqueueing.
//!
//! The scan is optimistic: nothing stops two schedulers from looking at the same job at
//! once, and only the lease decides who gets to run it. A job whose lease is still live
//! is skipped quietly. `next_run` is always recomputed from the current time, so a job
//! that missed several slots (downtime, a long previous run) gets exactly one run.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use crate::errors::{VaultError, VaultResult};
use crate::lease::{LeaseToken, LockManager};
use crate::model::{Job, JobId, JobStatus, RunId};
use crate::schedule::Schedule;
use crate::store::MetadataStore;
use crate::worker::RunRequest;

/// What one scan did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    pub queued: Vec<JobId>,
    /// Due jobs whose lease is held elsewhere.
    pub skipped: Vec<JobId>,
    /// Runs closed as aborted because their lease had expired.
    pub reclaimed: Vec<RunId>,
    /// Jobs found `queued`/`running` with no live lease, reset to `idle`.
    pub recovered: Vec<JobId>,
}

pub struct Scheduler {
    store: Arc<MetadataStore>,
    locks: LockManager,
    owner: String,
    lease_ttl: ChronoDuration,
}

impl Scheduler {
    pub fn new(store: Arc<MetadataStore>, owner: impl Into<String>, lease_ttl: ChronoDuration) -> Self {
        let locks = LockManager::new(&store);
        Self {
            store,
            locks,
            owner: owner.into(),
            lease_ttl,
        }
    }

    /// Take the lease for `job`, closing whatever run an expired predecessor left open.
    pub fn claim(&self, job: &Job, now: DateTime<Utc>, report: &mut TickReport) -> VaultResult<LeaseToken> {
        let grant = self.locks.acquire(job, &self.owner, self.lease_ttl, now)?;
        if let Some(previous) = grant.reclaimed {
            info!(
                "reclaimed expired lease of {} held by {} (expired {})",
                job.id, previous.owner, previous.expires_at
            );
            if let Some(run_id) = previous.run_id {
                if self
                    .store
                    .abandon_run(run_id, "lease expired; reclaimed by scheduler")?
                    .is_some()
                {
                    report.reclaimed.push(run_id);
                }
            }
        }
        Ok(grant.lease.token)
    }

    /// Lease and mark queued a job on operator request, regardless of its schedule.
    pub fn enqueue_now(&self, job_id: JobId, now: DateTime<Utc>) -> VaultResult<LeaseToken> {
        let job = self.store.get_job(job_id)?;
        if job.status == JobStatus::Disabled {
            return Err(VaultError::Conflict(format!("{} is disabled", job_id)));
        }
        let mut report = TickReport::default();
        let token = self.claim(&job, now, &mut report)?;
        if let Err(e) = self.store.mark_job_queued(job_id, None) {
            let _ = self.locks.release(&token);
            return Err(e);
        }
        Ok(token)
    }

    /// Scan every job once. Returns the run requests for jobs that were queued.
    pub fn tick(&self, now: DateTime<Utc>) -> VaultResult<(TickReport, Vec<RunRequest>)> {
        let mut report = TickReport::default();
        let mut requests = Vec::new();

        for job in self.store.list_jobs()? {
            if job.status == JobStatus::Disabled {
                continue;
            }
            let schedule = match Schedule::parse(&job.schedule) {
                Ok(s) => s,
                Err(e) => {
                    warn!("{} has an unusable schedule: {}", job.id, e);
                    continue;
                }
            };
            let job = self.recover_stale(job, now, &mut report)?;

            let Some(next_run) = job.next_run else {
                if let Some(first) = schedule.next_after(now) {
                    self.store.update_job(job.id, |j| {
                        j.next_run = Some(first);
                        Ok(())
                    })?;
                    debug!("{} first slot at {}", job.id, first);
                }
                continue;
            };
            if schedule.is_disabled() || next_run > now {
                continue;
            }

            let token = match self.claim(&job, now, &mut report) {
                Ok(token) => token,
                Err(VaultError::Conflict(reason)) => {
                    debug!("{} due but not acquired: {}", job.id, reason);
                    report.skipped.push(job.id);
                    continue;
                }
                Err(e) => {
                    warn!("lease acquisition for {} failed: {}", job.id, e);
                    continue;
                }
            };

            let next = schedule.next_after(now);
            match self.store.mark_job_queued(job.id, next) {
                Ok(_) => {
                    debug!(
                        "{} queued (slot {}, next {})",
                        job.id,
                        next_run,
                        next.map(|n| n.to_rfc3339()).unwrap_or_else(|| "-".into())
                    );
                    report.queued.push(job.id);
                    requests.push(RunRequest::Backup {
                        job: job.id,
                        lease: token,
                    });
                }
                Err(e) => {
                    warn!("could not queue {}: {}", job.id, e);
                    let _ = self.locks.release(&token);
                }
            }
        }
        Ok((report, requests))
    }

    /// A job left `queued`/`running` without a live lease belongs to a crashed worker.
    fn recover_stale(&self, job: Job, now: DateTime<Utc>, report: &mut TickReport) -> VaultResult<Job> {
        if !matches!(job.status, JobStatus::Queued | JobStatus::Running) {
            return Ok(job);
        }
        if self.locks.is_leased(job.id, now)? {
            return Ok(job);
        }
        if let Some(run_id) = self.locks.current(job.id)?.and_then(|l| l.run_id) {
            if self
                .store
                .abandon_run(run_id, "worker lost its lease")?
                .is_some()
            {
                report.reclaimed.push(run_id);
            }
        }
        let job = self.store.update_job(job.id, |j| {
            if matches!(j.status, JobStatus::Queued | JobStatus::Running) {
                j.status = JobStatus::Idle;
            }
            Ok(())
        })?;
        warn!("{} was stuck without a live lease; reset to {}", job.id, job.status);
        report.recovered.push(job.id);
        Ok(job)
    }
}

#[derive(Debug, Clone, Default)]
pub struct SchedulerStats {
    pub ticks: u64,
    pub queued_total: u64,
    pub skipped_total: u64,
    pub reclaimed_total: u64,
    pub last_tick: Option<DateTime<Utc>>,
}

pub enum ScheduleCommand {
    /// Run a scan immediately.
    TickNow(oneshot::Sender<VaultResult<TickReport>>),
    Snapshot(oneshot::Sender<SchedulerStats>),
    Shutdown(oneshot::Sender<()>),
}

#[derive(Clone, Debug)]
pub struct SchedulerHandle {
    tx: mpsc::UnboundedSender<ScheduleCommand>,
}

impl SchedulerHandle {
    pub async fn tick_now(&self) -> VaultResult<TickReport> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(ScheduleCommand::TickNow(tx))
            .map_err(|_| VaultError::Internal("scheduler stopped".into()))?;
        rx.await
            .map_err(|_| VaultError::Internal("scheduler stopped".into()))?
    }

    pub async fn snapshot(&self) -> Option<SchedulerStats> {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(ScheduleCommand::Snapshot(tx)).is_ok() {
            rx.await.ok()
        } else {
            None
        }
    }

    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        let _ = self.tx.send(ScheduleCommand::Shutdown(tx));
        let _ = rx.await;
    }
}

pub fn start_scheduler(
    scheduler: Arc<Scheduler>,
    runs: mpsc::UnboundedSender<RunRequest>,
    poll_interval: Duration,
) -> SchedulerHandle {
    let (tx, mut rx) = mpsc::unbounded_channel::<ScheduleCommand>();
    let handle = SchedulerHandle { tx };

    tokio::spawn(async move {
        let mut stats = SchedulerStats::default();
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                Some(cmd) = rx.recv() => {
                    match cmd {
                        ScheduleCommand::TickNow(resp) => {
                            let result = run_tick(&scheduler, &runs, &mut stats);
                            let _ = resp.send(result);
                        }
                        ScheduleCommand::Snapshot(resp) => { let _ = resp.send(stats.clone()); }
                        ScheduleCommand::Shutdown(done) => { let _ = done.send(()); break; }
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = run_tick(&scheduler, &runs, &mut stats) {
                        error!("scheduler scan failed: {}", e);
                    }
                }
            }
        }
        info!("scheduler stopped after {} scans", stats.ticks);
    });

    handle
}

fn run_tick(
    scheduler: &Scheduler,
    runs: &mpsc::UnboundedSender<RunRequest>,
    stats: &mut SchedulerStats,
) -> VaultResult<TickReport> {
    let now = Utc::now();
    let (report, requests) = scheduler.tick(now)?;
    for request in requests {
        if let Err(mpsc::error::SendError(request)) = runs.send(request) {
            if let RunRequest::Backup { lease, .. } = request {
                error!("worker pool gone; dropping run for {}", lease.job_id);
                let _ = scheduler.locks.release(&lease);
            }
        }
    }
    stats.ticks += 1;
    stats.queued_total += report.queued.len() as u64;
    stats.skipped_total += report.skipped.len() as u64;
    stats.reclaimed_total += report.reclaimed.len() as u64;
    stats.last_tick = Some(now);
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NewJob, RetentionPolicy};
    use tempfile::TempDir;

    fn t(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn setup(next_run: Option<DateTime<Utc>>) -> (TempDir, Arc<MetadataStore>, Scheduler, Job) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MetadataStore::open(dir.path()).unwrap());
        let env = store
            .create_environment("host-a", &serde_json::json!({}))
            .unwrap();
        let job = store
            .create_job(NewJob {
                name: "hourly-docs".into(),
                environment_id: env.id,
                volume: "docs".into(),
                schedule: "hourly".into(),
                retention: RetentionPolicy::keep_last(2),
                full_every: None,
                next_run,
            })
            .unwrap();
        let scheduler = Scheduler::new(store.clone(), "node-a", ChronoDuration::seconds(30));
        (dir, store, scheduler, job)
    }

    #[test]
    fn missed_slots_coalesce_into_one_run() {
        // Three hourly slots missed.
        let (_dir, store, scheduler, job) = setup(Some(t("2025-03-10T07:00:00Z")));
        let now = t("2025-03-10T10:15:00Z");

        let (report, requests) = scheduler.tick(now).unwrap();
        assert_eq!(report.queued, vec![job.id]);
        assert_eq!(requests.len(), 1);
        let job = store.get_job(job.id).unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.next_run, Some(t("2025-03-10T11:00:00Z")));

        // Re-scanning at the same instant queues nothing more.
        let (again, requests) = scheduler.tick(now).unwrap();
        assert!(again.queued.is_empty());
        assert!(requests.is_empty());
    }

    #[test]
    fn due_job_with_live_lease_is_skipped() {
        let (_dir, store, scheduler, job) = setup(Some(t("2025-03-10T07:00:00Z")));
        let now = t("2025-03-10T07:00:05Z");
        let locks = LockManager::new(&store);
        locks
            .acquire(&job, "other-node", ChronoDuration::seconds(60), now)
            .unwrap();

        let (report, requests) = scheduler.tick(now).unwrap();
        assert_eq!(report.skipped, vec![job.id]);
        assert!(requests.is_empty());
        assert_eq!(store.get_job(job.id).unwrap().status, JobStatus::Idle);
    }

    #[test]
    fn unscheduled_job_gets_first_slot() {
        let (_dir, store, scheduler, job) = setup(None);
        let now = t("2025-03-10T07:20:00Z");
        let (report, _) = scheduler.tick(now).unwrap();
        assert!(report.queued.is_empty());
        assert_eq!(
            store.get_job(job.id).unwrap().next_run,
            Some(t("2025-03-10T08:00:00Z"))
        );
    }

    #[test]
    fn stuck_job_without_lease_is_recovered() {
        let (_dir, store, scheduler, job) = setup(Some(t("2025-03-10T09:00:00Z")));
        let queued_at = t("2025-03-10T07:00:00Z");
        scheduler.enqueue_now(job.id, queued_at).unwrap();
        assert_eq!(store.get_job(job.id).unwrap().status, JobStatus::Queued);

        // The lease (30s) is long gone; the worker never showed up.
        let (report, requests) = scheduler.tick(t("2025-03-10T08:00:00Z")).unwrap();
        assert_eq!(report.recovered, vec![job.id]);
        assert!(requests.is_empty());
        assert_eq!(store.get_job(job.id).unwrap().status, JobStatus::Idle);
    }
}
