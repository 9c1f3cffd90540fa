//! Retention sweeps.
//!
//! A sweep first recovers entries left `pending` by runs that already closed and drops
//! restore pins nobody renews any more, then walks every volume asking the chain resolver
//! for the current deletion frontier. Each delete
//! goes through [`MetadataStore::mark_entry_deleted`], which re-checks live children and
//! restore pins inside its transaction, so a frontier computed a moment earlier can never
//! remove something a newer child or a running restore depends on. Payload is purged
//! only after the metadata says `deleted`; a failed purge leaks bytes, never chain state.
//!
//! [`MetadataStore::mark_entry_deleted`]: crate::store::MetadataStore::mark_entry_deleted

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::collections::{HashMap, HashSet};

use crate::chain::{compute_deletable, ExpiryContext, ExpiryRule};
use crate::errors::{VaultError, VaultResult};
use crate::model::{ChainEntry, EntryId, EntryStatus, JobId, RetentionPolicy};
use crate::worker::WorkerContext;

/// Present policy of every job, keyed by job id. Entries whose job is gone are judged by
/// their own policy snapshot alone.
pub struct CurrentPolicies(HashMap<JobId, RetentionPolicy>);

impl CurrentPolicies {
    pub fn new(policies: HashMap<JobId, RetentionPolicy>) -> Self {
        Self(policies)
    }
}

impl ExpiryRule for CurrentPolicies {
    fn is_expired(&self, entry: &ChainEntry, ctx: &ExpiryContext) -> bool {
        match entry.job_id.and_then(|id| self.0.get(&id)) {
            Some(policy) => policy.is_expired(entry, ctx),
            None => true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    pub dry_run: bool,
    /// Pending entries of closed runs that were marked corrupt.
    pub recovered: Vec<EntryId>,
    /// Entries marked deleted (or that would be, on a dry run), leaf first.
    pub deleted: Vec<EntryId>,
    /// Deletable entries held back by a live restore pin.
    pub pinned: Vec<EntryId>,
    /// Restore pins dropped because their holder stopped renewing them.
    pub expired_pins: usize,
    pub purge_failures: usize,
}

pub async fn sweep(
    ctx: &WorkerContext,
    now: DateTime<Utc>,
    dry_run: bool,
) -> VaultResult<SweepReport> {
    let mut report = SweepReport {
        dry_run,
        ..SweepReport::default()
    };
    if !dry_run {
        report.recovered = ctx.store.recover_abandoned_entries()?;
        report.expired_pins = ctx.locks.prune_expired_pins(now)?;
    }

    let policies = CurrentPolicies::new(
        ctx.store
            .list_jobs()?
            .into_iter()
            .map(|j| (j.id, j.retention))
            .collect(),
    );
    let pinned = ctx.locks.pinned_entries(now)?;

    for volume in ctx.store.list_volumes()? {
        let mut entries = ctx.store.list_volume_entries(&volume)?;
        loop {
            let frontier = compute_deletable(&entries, &policies, now);
            let (held, ready): (Vec<EntryId>, Vec<EntryId>) =
                frontier.into_iter().partition(|id| pinned.contains(id));
            for id in held {
                if !report.pinned.contains(&id) {
                    report.pinned.push(id);
                }
            }
            if ready.is_empty() {
                break;
            }

            let deleted_now = if dry_run {
                ready.clone()
            } else {
                delete_frontier(ctx, &ready, now, &mut report).await?
            };
            if deleted_now.is_empty() {
                break;
            }
            let gone: HashSet<EntryId> = deleted_now.iter().copied().collect();
            for entry in entries.iter_mut().filter(|e| gone.contains(&e.id)) {
                entry.status = EntryStatus::Deleted;
            }
            report.deleted.extend(deleted_now);
        }
    }

    if dry_run {
        info!(
            "retention dry run: {} entries would be deleted, {} pinned",
            report.deleted.len(),
            report.pinned.len()
        );
    } else if !report.deleted.is_empty() || !report.recovered.is_empty() {
        info!(
            "retention sweep deleted {} entries, recovered {} abandoned",
            report.deleted.len(),
            report.recovered.len()
        );
    }
    Ok(report)
}

async fn delete_frontier(
    ctx: &WorkerContext,
    ready: &[EntryId],
    now: DateTime<Utc>,
    report: &mut SweepReport,
) -> VaultResult<Vec<EntryId>> {
    let mut deleted = Vec::new();
    for id in ready {
        match ctx.store.mark_entry_deleted(*id, now) {
            Ok(entry) => {
                if let Err(e) = ctx.transfer.purge(&entry.handle).await {
                    warn!("purge of {} ({}) failed: {}", id, entry.handle, e);
                    report.purge_failures += 1;
                }
                deleted.push(*id);
            }
            // Lost a race with a new child or pin; the next sweep will see it.
            Err(VaultError::Conflict(reason)) => debug!("skipping {}: {}", id, reason),
            Err(e) => return Err(e),
        }
    }
    Ok(deleted)
}
