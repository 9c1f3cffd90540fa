//! Single restore run: resolve chain → pin → replay in order → verify every unit.

use chrono::Utc;
use log::{debug, info, warn};

use super::{with_heartbeat, RestoreRequest, WorkerContext};
use crate::chain::ChainIndex;
use crate::errors::{VaultError, VaultResult};
use crate::lease::PinToken;
use crate::model::{ChainEntry, EntryId, EntryKind, RunCompletion, RunKind, RunOutcome, RunRecord};
use crate::transfer::sha256_hex;

/// Replay `request.target` into `request.destination`.
///
/// The run record is closed as `success` only when every unit of every path entry from
/// `resume_from` on was read, matched its recorded hash and was written. The first
/// mismatch stops the replay with `Integrity`.
pub async fn execute(ctx: &WorkerContext, request: RestoreRequest) -> VaultResult<RunRecord> {
    let target = ctx.store.get_entry(request.target)?;
    let run = ctx.store.begin_run(
        target.job_id,
        RunKind::Restore {
            target: target.id,
            destination: request.destination.clone(),
        },
    )?;
    info!(
        "{} restoring {} of volume {} into {} (from step {})",
        run.id, target.id, target.volume, request.destination, request.resume_from
    );

    match replay(ctx, &target, &request, &run).await {
        Ok(bytes) => ctx.store.complete_run(run.id, RunCompletion::success(bytes)),
        Err(err) => {
            warn!("{} failed: {}", run.id, err);
            if let Err(close_err) = ctx.store.complete_run(
                run.id,
                RunCompletion::failure(RunOutcome::Failed, 0, err.to_string()),
            ) {
                warn!("could not close {}: {}", run.id, close_err);
            }
            Err(err)
        }
    }
}

async fn replay(
    ctx: &WorkerContext,
    target: &ChainEntry,
    request: &RestoreRequest,
    run: &RunRecord,
) -> VaultResult<u64> {
    let unpinned = resolve(ctx, target)?;
    if request.resume_from > unpinned.len() {
        return Err(VaultError::InvalidConfig(format!(
            "resume_from {} is past the end of a {}-entry path",
            request.resume_from,
            unpinned.len()
        )));
    }

    let (pin, path) = pin_path(ctx, target, &unpinned)?;
    let ttl = ctx.settings.lease_ttl;
    let renew = || ctx.locks.renew_pin(pin, ttl, Utc::now());

    let work = async {
        let mut moved = 0u64;
        for (index, entry) in path.iter().enumerate().skip(request.resume_from) {
            moved += apply_entry(ctx, entry, &request.destination).await?;
            ctx.store.record_progress(run.id, (index + 1) as u32, moved)?;
            debug!("{} applied {} ({}/{})", run.id, entry.id, index + 1, path.len());
        }
        Ok(moved)
    };
    let result = with_heartbeat(ctx.settings.heartbeat_interval(), &renew, work).await;

    if let Err(e) = ctx.locks.release_pin(pin) {
        warn!("releasing restore pin failed: {}", e);
    }
    result
}

fn resolve(ctx: &WorkerContext, target: &ChainEntry) -> VaultResult<Vec<ChainEntry>> {
    let entries = ctx.store.list_volume_entries(&target.volume)?;
    ChainIndex::new(entries).resolve_path(target.id)
}

/// Pin the entries of `path`, then resolve it again under the pin. A sweep that deleted
/// part of the path before the pin landed shows up as `BrokenChain` here, not as missing
/// payload halfway through the replay.
fn pin_path(
    ctx: &WorkerContext,
    target: &ChainEntry,
    path: &[ChainEntry],
) -> VaultResult<(PinToken, Vec<ChainEntry>)> {
    let ids: Vec<EntryId> = path.iter().map(|e| e.id).collect();
    let pin = ctx
        .locks
        .pin(&ids, &ctx.settings.owner, ctx.settings.lease_ttl, Utc::now())?;
    match resolve(ctx, target) {
        Ok(pinned) if pinned.iter().map(|e| e.id).eq(ids.iter().copied()) => Ok((pin, pinned)),
        other => {
            if let Err(e) = ctx.locks.release_pin(pin) {
                warn!("releasing restore pin failed: {}", e);
            }
            match other {
                Err(e) => Err(e),
                Ok(_) => Err(VaultError::BrokenChain {
                    entry: target.id,
                    reason: "restore path changed while it was being pinned".into(),
                }),
            }
        }
    }
}

async fn apply_entry(ctx: &WorkerContext, entry: &ChainEntry, destination: &str) -> VaultResult<u64> {
    if let EntryKind::Incremental { removed, .. } = &entry.kind {
        for unit in removed {
            ctx.transfer.remove(destination, unit).await?;
        }
    }
    let mut moved = 0u64;
    for (unit, expected) in &entry.checksums {
        let data = ctx.transfer.read(&entry.handle, unit).await?;
        let actual = sha256_hex(&data);
        if &actual != expected {
            return Err(VaultError::Integrity {
                unit: unit.clone(),
                expected: expected.clone(),
                actual,
            });
        }
        ctx.transfer.write(destination, unit, &data, expected).await?;
        moved += data.len() as u64;
    }
    Ok(moved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NewJob, RetentionPolicy};
    use crate::store::MetadataStore;
    use crate::transfer::fs::FsTransfer;
    use crate::worker::{backup, WorkerSettings};
    use std::sync::Arc;
    use tempfile::TempDir;

    struct Fixture {
        _dirs: Vec<TempDir>,
        ctx: WorkerContext,
        volume: std::path::PathBuf,
        job: crate::model::Job,
    }

    fn fixture() -> Fixture {
        let db = TempDir::new().unwrap();
        let src = TempDir::new().unwrap();
        let repo = TempDir::new().unwrap();
        let store = Arc::new(MetadataStore::open(db.path()).unwrap());
        let env = store
            .create_environment(
                "host-a",
                &serde_json::json!({ "root": src.path().to_string_lossy() }),
            )
            .unwrap();
        let job = store
            .create_job(NewJob {
                name: "docs".into(),
                environment_id: env.id,
                volume: "docs".into(),
                schedule: "daily".into(),
                retention: RetentionPolicy::keep_last(3),
                full_every: None,
                next_run: None,
            })
            .unwrap();
        let volume = src.path().join("docs");
        std::fs::create_dir_all(&volume).unwrap();
        let transfer = Arc::new(FsTransfer::new(src.path(), repo.path()));
        let ctx = WorkerContext::new(store, transfer, WorkerSettings::default());
        Fixture {
            _dirs: vec![db, src, repo],
            ctx,
            volume,
            job,
        }
    }

    async fn backup_now(f: &Fixture) -> RunRecord {
        let grant = f
            .ctx
            .locks
            .acquire(&f.job, "test", f.ctx.settings.lease_ttl, Utc::now())
            .unwrap();
        backup::execute(&f.ctx, f.job.id, grant.lease.token)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn altered_checksum_map_fails_restore() {
        let f = fixture();
        std::fs::write(f.volume.join("report.txt"), b"quarterly numbers").unwrap();
        let run = backup_now(&f).await;
        let entry_id = run.produced_entry().unwrap();

        let mut entry = f.ctx.store.get_entry(entry_id).unwrap();
        entry
            .checksums
            .insert("report.txt".into(), sha256_hex(b"something else"));
        f.ctx.store.overwrite_entry(&entry).unwrap();

        let dest = TempDir::new().unwrap();
        let err = execute(
            &f.ctx,
            RestoreRequest {
                target: entry_id,
                destination: dest.path().to_string_lossy().into_owned(),
                resume_from: 0,
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, VaultError::Integrity { ref unit, .. } if unit == "report.txt"));
        assert!(!dest.path().join("report.txt").exists());

        let history = f.ctx.store.runs_for_job(f.job.id).unwrap();
        assert_eq!(history[0].outcome, Some(RunOutcome::Failed));
        assert!(f.ctx.locks.pinned_entries(Utc::now()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn entry_deleted_before_the_pin_is_a_broken_chain() {
        let f = fixture();
        std::fs::write(f.volume.join("a"), b"one").unwrap();
        backup_now(&f).await;
        std::fs::write(f.volume.join("a"), b"two").unwrap();
        let run = backup_now(&f).await;
        let target = f.ctx.store.get_entry(run.produced_entry().unwrap()).unwrap();
        let path = resolve(&f.ctx, &target).unwrap();
        assert_eq!(path.len(), 2);

        // A sweep removes the leaf after the path was read but before it was pinned.
        f.ctx.store.mark_entry_deleted(target.id, Utc::now()).unwrap();

        let err = pin_path(&f.ctx, &target, &path).unwrap_err();
        assert!(matches!(err, VaultError::BrokenChain { entry, .. } if entry == target.id));
        assert!(f.ctx.locks.pinned_entries(Utc::now()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn resume_skips_applied_entries() {
        let f = fixture();
        std::fs::write(f.volume.join("a"), b"one").unwrap();
        backup_now(&f).await;
        std::fs::write(f.volume.join("b"), b"two").unwrap();
        let run = backup_now(&f).await;
        let target = run.produced_entry().unwrap();

        let dest = TempDir::new().unwrap();
        let restored = execute(
            &f.ctx,
            RestoreRequest {
                target,
                destination: dest.path().to_string_lossy().into_owned(),
                resume_from: 1,
            },
        )
        .await
        .unwrap();
        assert_eq!(restored.progress, 2);
        assert_eq!(std::fs::read(dest.path().join("b")).unwrap(), b"two");
        // The full entry at index 0 was not replayed.
        assert!(!dest.path().join("a").exists());

        let past_end = execute(
            &f.ctx,
            RestoreRequest {
                target,
                destination: dest.path().to_string_lossy().into_owned(),
                resume_from: 3,
            },
        )
        .await;
        assert!(matches!(past_end, Err(VaultError::InvalidConfig(_))));
    }
}
