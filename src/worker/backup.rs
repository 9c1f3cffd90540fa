//! Single backup run: snapshot → checksum → chain-link → persist.

use chrono::Utc;
use log::{debug, info, warn};
use std::collections::BTreeMap;

use super::{with_heartbeat, WorkerContext};
use crate::chain::{self, ChainIndex};
use crate::errors::{VaultError, VaultResult};
use crate::lease::LeaseToken;
use crate::model::{
    ChainEntry, ChecksumMap, EntryId, EntryKind, Environment, Job, JobId, NewEntry, RunCompletion,
    RunOutcome, RunRecord,
};
use crate::transfer::{sha256_hex, Snapshot, TransferError};

/// What the next entry for a volume should be.
#[derive(Debug, Clone, PartialEq)]
pub enum BackupPlan {
    Full,
    Incremental { parent: EntryId, base: ChecksumMap },
}

/// Decide full vs incremental from the volume's chain.
///
/// Full when no valid entry exists, when the chain under the latest valid entry already
/// holds `full_every - 1` incrementals, or when that chain cannot be resolved.
pub fn plan(job: &Job, entries: &[ChainEntry]) -> BackupPlan {
    let Some(latest) = chain::latest_valid(entries) else {
        return BackupPlan::Full;
    };
    let index = ChainIndex::new(entries.iter().cloned());
    if let Some(every) = job.full_every {
        if index.depth(latest.id) + 1 >= every as usize {
            debug!("{} reached full_every={}, forcing full", job.id, every);
            return BackupPlan::Full;
        }
    }
    match index.resolve_path(latest.id) {
        Ok(path) => BackupPlan::Incremental {
            parent: latest.id,
            base: chain::materialize(&path),
        },
        Err(e) => {
            warn!("cannot resolve chain of {} ({}), taking a full", latest.id, e);
            BackupPlan::Full
        }
    }
}

/// Execute one backup of `job_id` under `lease`. Always leaves a terminal run record and
/// releases (or loses) the lease before returning.
pub async fn execute(ctx: &WorkerContext, job_id: JobId, lease: LeaseToken) -> VaultResult<RunRecord> {
    let run = match ctx.store.begin_backup(&lease, Utc::now()) {
        Ok(run) => run,
        Err(e) => {
            if matches!(e, VaultError::LeaseExpired(_)) {
                warn!("{} lost its lease before the run started", job_id);
            }
            release(ctx, &lease);
            return Err(e);
        }
    };

    let outcome = run_backup(ctx, job_id, &lease, &run).await;
    let result = match outcome {
        Ok(run) => Ok(run),
        Err(VaultError::LeaseExpired(job)) => {
            // Someone else may own the job now; close our run without touching the job.
            if let Err(close_err) = ctx.store.abandon_run(run.id, "lease expired before commit") {
                warn!("could not close {}: {}", run.id, close_err);
            }
            Err(VaultError::LeaseExpired(job))
        }
        Err(err) => {
            if let Err(close_err) = ctx.store.fail_backup(
                run.id,
                RunCompletion::failure(RunOutcome::Failed, 0, err.to_string()),
            ) {
                warn!("could not close {}: {}", run.id, close_err);
            }
            Err(err)
        }
    };
    release(ctx, &lease);
    result
}

fn release(ctx: &WorkerContext, lease: &LeaseToken) {
    match ctx.locks.release(lease) {
        Ok(true) => debug!("released lease on {}", lease.job_id),
        Ok(false) => debug!("lease on {} already gone", lease.job_id),
        Err(e) => warn!("releasing lease on {} failed: {}", lease.job_id, e),
    }
}

async fn run_backup(
    ctx: &WorkerContext,
    job_id: JobId,
    lease: &LeaseToken,
    run: &RunRecord,
) -> VaultResult<RunRecord> {
    let ttl = ctx.settings.lease_ttl;
    let job = ctx.store.get_job(job_id)?;
    let environment = ctx.store.get_environment(job.environment_id)?;
    let volume = job.volume_ref();
    let entries = ctx.store.list_volume_entries(&volume)?;
    let plan = plan(&job, &entries);
    info!(
        "{} starting {} backup of volume {} ({})",
        run.id,
        match plan {
            BackupPlan::Full => "full",
            BackupPlan::Incremental { .. } => "incremental",
        },
        volume,
        job.name
    );

    let renew = || ctx.locks.renew(lease, ttl, Utc::now()).map(|_| ());
    let every = ctx.settings.heartbeat_interval();

    let base = match &plan {
        BackupPlan::Full => None,
        BackupPlan::Incremental { base, .. } => Some(base),
    };
    let snapshot = with_heartbeat(
        every,
        &renew,
        snapshot_with_retries(ctx, &environment, &job.volume, base),
    )
    .await?;

    let kind = match &plan {
        BackupPlan::Full => EntryKind::Full,
        BackupPlan::Incremental { parent, .. } => EntryKind::Incremental {
            parent: *parent,
            removed: snapshot.removed.clone(),
        },
    };
    let mut metadata = BTreeMap::new();
    metadata.insert("job".to_string(), job.name.clone());
    metadata.insert("environment".to_string(), environment.name.clone());
    if !snapshot.skipped.is_empty() {
        metadata.insert("skipped_units".to_string(), snapshot.skipped.len().to_string());
    }

    let entry = match ctx.store.create_pending_entry(NewEntry {
        volume,
        kind,
        size_bytes: snapshot.size_bytes,
        checksums: snapshot.checksums.clone(),
        metadata,
        retention: job.retention,
        job_id: Some(job.id),
        run_id: Some(run.id),
        handle: snapshot.handle.clone(),
    }) {
        Ok(entry) => entry,
        Err(e) => {
            // Nothing references the payload yet.
            if let Err(purge_err) = ctx.transfer.purge(&snapshot.handle).await {
                warn!("purging orphan payload {} failed: {}", snapshot.handle, purge_err);
            }
            return Err(e);
        }
    };

    with_heartbeat(every, &renew, verify_snapshot(ctx, &snapshot)).await?;

    let completion = if snapshot.skipped.is_empty() {
        RunCompletion::success(snapshot.size_bytes)
    } else {
        RunCompletion::failure(
            RunOutcome::Partial,
            snapshot.size_bytes,
            format!("{} unit(s) skipped: {}", snapshot.skipped.len(), snapshot.skipped.join(", ")),
        )
    };
    let (_, run) = ctx
        .store
        .commit_backup(entry.id, run.id, lease, completion, Utc::now())?;
    Ok(run)
}

async fn snapshot_with_retries(
    ctx: &WorkerContext,
    environment: &Environment,
    volume: &str,
    base: Option<&ChecksumMap>,
) -> VaultResult<Snapshot> {
    let attempts = ctx.settings.transfer_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match ctx.transfer.snapshot(environment, volume, base).await {
            Ok(snapshot) => return Ok(snapshot),
            Err(err @ (TransferError::InvalidUnit(_) | TransferError::Integrity { .. })) => {
                return Err(err.into())
            }
            Err(err) if attempt < attempts => {
                warn!(
                    "snapshot of {} attempt {}/{} failed: {}",
                    volume, attempt, attempts, err
                );
                tokio::time::sleep(ctx.settings.retry_backoff).await;
            }
            Err(err) => return Err(err.into()),
        }
    }
}

/// Re-read every stored unit and compare against the recorded hash.
async fn verify_snapshot(ctx: &WorkerContext, snapshot: &Snapshot) -> VaultResult<()> {
    for (unit, expected) in &snapshot.checksums {
        let data = ctx.transfer.read(&snapshot.handle, unit).await?;
        let actual = sha256_hex(&data);
        if &actual != expected {
            return Err(VaultError::Integrity {
                unit: unit.clone(),
                expected: expected.clone(),
                actual,
            });
        }
    }
    Ok(())
}
