//! Run execution.
//!
//! Backup and restore runs are executed by a small pool fed through an mpsc channel. Each
//! request runs on its own task; a semaphore bounds how many execute at once. A backup
//! waiting for a slot keeps heartbeating the lease it was queued with. Workers share
//! nothing in process beyond the [`WorkerContext`]: coordination goes through the metadata
//! store and the lease records.

pub mod backup;
pub mod restore;

use chrono::{Duration as ChronoDuration, Utc};
use log::{debug, error, info, warn};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};

use crate::errors::{VaultError, VaultResult};
use crate::lease::{LeaseToken, LockManager};
use crate::model::{EntryId, JobId};
use crate::store::MetadataStore;
use crate::transfer::ContentTransfer;

/// Tunables shared by every run.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Lease and pin owner label written into lease records.
    pub owner: String,
    pub lease_ttl: ChronoDuration,
    /// Snapshot attempts before a run fails with a transfer error.
    pub transfer_attempts: u32,
    pub retry_backoff: Duration,
}

impl WorkerSettings {
    /// Renewal cadence: a third of the lease TTL.
    pub fn heartbeat_interval(&self) -> Duration {
        (self.lease_ttl / 3)
            .to_std()
            .unwrap_or(Duration::from_secs(1))
            .max(Duration::from_millis(10))
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            owner: "chainvault".to_string(),
            lease_ttl: ChronoDuration::seconds(30),
            transfer_attempts: 3,
            retry_backoff: Duration::from_millis(500),
        }
    }
}

pub struct WorkerContext {
    pub store: Arc<MetadataStore>,
    pub locks: LockManager,
    pub transfer: Arc<dyn ContentTransfer>,
    pub settings: WorkerSettings,
}

impl WorkerContext {
    pub fn new(
        store: Arc<MetadataStore>,
        transfer: Arc<dyn ContentTransfer>,
        settings: WorkerSettings,
    ) -> Self {
        let locks = LockManager::new(&store);
        Self {
            store,
            locks,
            transfer,
            settings,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RestoreRequest {
    pub target: EntryId,
    pub destination: String,
    /// Index into the resolved path at which to resume replay.
    pub resume_from: usize,
}

#[derive(Debug)]
pub enum RunRequest {
    /// Back up a job whose lease the requester already holds.
    Backup { job: JobId, lease: LeaseToken },
    Restore(RestoreRequest),
}

/// Drive `work` to completion while calling `renew` every `every`.
///
/// If a renewal fails the work future is dropped and the renewal error returned, so a
/// worker that lost its lease stops at its next heartbeat.
pub(crate) async fn with_heartbeat<T, F, R>(every: Duration, renew: R, work: F) -> VaultResult<T>
where
    F: Future<Output = VaultResult<T>>,
    R: Fn() -> VaultResult<()>,
{
    tokio::pin!(work);
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        tokio::select! {
            result = &mut work => return result,
            _ = ticker.tick() => {
                renew()?;
                debug!("heartbeat renewed");
            }
        }
    }
}

/// Handle to a running worker pool.
pub struct WorkerPool {
    tx: mpsc::UnboundedSender<RunRequest>,
    task: JoinHandle<()>,
}

impl WorkerPool {
    pub fn submit(&self, request: RunRequest) -> VaultResult<()> {
        self.tx
            .send(request)
            .map_err(|_| VaultError::Internal("worker pool is shut down".into()))
    }

    pub fn sender(&self) -> mpsc::UnboundedSender<RunRequest> {
        self.tx.clone()
    }

    /// Stop accepting work and wait for in-flight runs to finish.
    pub async fn shutdown(self) {
        drop(self.tx);
        if let Err(e) = self.task.await {
            error!("worker pool task failed: {}", e);
        }
    }
}

pub fn start_worker_pool(ctx: Arc<WorkerContext>, max_concurrent: usize) -> WorkerPool {
    let (tx, mut rx) = mpsc::unbounded_channel::<RunRequest>();
    let semaphore = Arc::new(Semaphore::new(max_concurrent.max(1)));

    let task = tokio::spawn(async move {
        let mut runs = JoinSet::new();
        loop {
            tokio::select! {
                request = rx.recv() => {
                    let Some(request) = request else { break };
                    let ctx = ctx.clone();
                    let semaphore = semaphore.clone();
                    runs.spawn(async move {
                        if let Some(_permit) = wait_for_slot(&ctx, semaphore, &request).await {
                            dispatch(&ctx, request).await;
                        }
                    });
                }
                Some(done) = runs.join_next(), if !runs.is_empty() => {
                    if let Err(e) = done {
                        error!("run task failed: {}", e);
                    }
                }
            }
        }
        // Drain: queued requests still get their slot, then everything finishes.
        while let Some(done) = runs.join_next().await {
            if let Err(e) = done {
                error!("run task failed: {}", e);
            }
        }
        info!("worker pool drained");
    });

    WorkerPool { tx, task }
}

/// Wait for an execution slot. A queued backup renews its lease meanwhile, so neither the
/// scheduler nor another node sees it as abandoned; if the lease is lost anyway the request
/// is dropped and whoever holds the job now settles it.
async fn wait_for_slot(
    ctx: &WorkerContext,
    semaphore: Arc<Semaphore>,
    request: &RunRequest,
) -> Option<OwnedSemaphorePermit> {
    let acquire = async move {
        semaphore
            .acquire_owned()
            .await
            .map_err(|_| VaultError::Internal("worker pool closed".into()))
    };
    let result = match request {
        RunRequest::Backup { lease, .. } => {
            let ttl = ctx.settings.lease_ttl;
            let renew = || ctx.locks.renew(lease, ttl, Utc::now()).map(|_| ());
            with_heartbeat(ctx.settings.heartbeat_interval(), renew, acquire).await
        }
        RunRequest::Restore(_) => acquire.await,
    };
    match result {
        Ok(permit) => Some(permit),
        Err(e) => {
            match request {
                RunRequest::Backup { job, .. } => {
                    warn!("dropping queued backup of {}: {}", job, e)
                }
                RunRequest::Restore(req) => {
                    warn!("dropping queued restore of {}: {}", req.target, e)
                }
            }
            None
        }
    }
}

async fn dispatch(ctx: &WorkerContext, request: RunRequest) {
    match request {
        RunRequest::Backup { job, lease } => match backup::execute(ctx, job, lease).await {
            Ok(run) => info!(
                "backup {} for {} finished: {}",
                run.id,
                job,
                run.outcome.map(|o| o.to_string()).unwrap_or_default()
            ),
            Err(e) if e.is_retryable() => {
                warn!("backup for {} failed (will retry next slot): {}", job, e)
            }
            Err(e) => error!("backup for {} failed: {}", job, e),
        },
        RunRequest::Restore(req) => {
            let target = req.target;
            match restore::execute(ctx, req).await {
                Ok(run) => info!("restore {} of {} finished", run.id, target),
                Err(e) => error!("restore of {} failed: {}", target, e),
            }
        }
    }
}
