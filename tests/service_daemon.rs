mod common;

use chrono::{Duration, Utc};
use std::time::Duration as StdDuration;
use tokio::sync::oneshot;

use chainvault::config::Config;
use chainvault::errors::VaultError;
use chainvault::model::{JobStatus, NewJob, RetentionPolicy, RunOutcome};
use chainvault::service::ServiceSettings;
use common::{faulty_harness, harness_with, worker_settings, write_unit};

fn fast_settings() -> ServiceSettings {
    ServiceSettings {
        poll_interval: StdDuration::from_millis(50),
        max_concurrent_runs: 2,
        sweep_interval: None,
    }
}

async fn wait_for<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(StdDuration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn missed_slots_produce_a_single_run() {
    let h = harness_with(worker_settings(), fast_settings(), |fs| fs);
    std::fs::create_dir_all(h.volume("www")).unwrap();
    write_unit(&h.volume("www"), "index.html", "hi");
    let started = Utc::now();
    let job = h
        .service
        .create_job(NewJob {
            name: "www-hourly".into(),
            environment_id: h.environment.id,
            volume: "www".into(),
            schedule: "hourly".into(),
            retention: RetentionPolicy::default(),
            full_every: None,
            // Five hourly slots went by while nothing was running.
            next_run: Some(started - Duration::hours(5)),
        })
        .unwrap();

    let (stop, stopped) = oneshot::channel::<()>();
    let daemon = h.service.run(async {
        let _ = stopped.await;
    });
    let driver = async {
        let done = wait_for(|| {
            h.store
                .runs_for_job(job.id)
                .unwrap()
                .iter()
                .any(|r| r.outcome.is_some())
        })
        .await;
        // A few more scans must not queue anything else.
        tokio::time::sleep(StdDuration::from_millis(300)).await;
        let _ = stop.send(());
        done
    };
    let (result, done) = tokio::join!(daemon, driver);
    result.unwrap();
    assert!(done, "scheduled run never finished");

    let runs = h.store.runs_for_job(job.id).unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].outcome, Some(RunOutcome::Success));
    let job = h.store.get_job(job.id).unwrap();
    assert_eq!(job.status, JobStatus::Idle);
    assert!(job.next_run.unwrap() > started);
    assert_eq!(h.entries("www").len(), 1);
}

#[tokio::test]
async fn enqueue_backup_runs_on_the_pool() {
    let h = harness_with(worker_settings(), fast_settings(), |fs| fs);
    let job = h.add_job("docs", "docs", RetentionPolicy::default(), None);
    h.store
        .update_job(job.id, |j| {
            j.schedule = "disabled".into();
            j.next_run = None;
            Ok(())
        })
        .unwrap();
    write_unit(&h.volume("docs"), "a.txt", "alpha");

    let (stop, stopped) = oneshot::channel::<()>();
    let daemon = h.service.run(async {
        let _ = stopped.await;
    });
    let driver = async {
        tokio::time::sleep(StdDuration::from_millis(20)).await;
        h.service.enqueue_backup(job.id).unwrap();
        let done = wait_for(|| h.store.latest_valid_entry(&h.volume_ref("docs")).unwrap().is_some()).await;
        let _ = stop.send(());
        done
    };
    let (result, done) = tokio::join!(daemon, driver);
    result.unwrap();
    assert!(done, "enqueued backup never committed");
    assert!(!h
        .service
        .context()
        .locks
        .is_leased(job.id, Utc::now())
        .unwrap());
}

#[tokio::test]
async fn queued_backup_keeps_its_lease_while_waiting_for_a_slot() {
    let mut worker = worker_settings();
    worker.lease_ttl = Duration::milliseconds(300);
    let settings = ServiceSettings {
        max_concurrent_runs: 1,
        ..fast_settings()
    };
    let (h, _) = faulty_harness(worker, settings, |t| t.slow(StdDuration::from_millis(900)));
    let (other, other_root) = h.add_environment("host-b");
    let first = h.add_job("docs", "docs", RetentionPolicy::default(), None);
    let second = h.add_job_in(&other, &other_root, "media", "media", RetentionPolicy::default(), None);
    for job in [&first, &second] {
        h.store
            .update_job(job.id, |j| {
                j.schedule = "disabled".into();
                j.next_run = None;
                Ok(())
            })
            .unwrap();
    }
    write_unit(&h.volume("docs"), "a.txt", "alpha");
    write_unit(&other_root.join("media"), "b.txt", "bravo");

    let (stop, stopped) = oneshot::channel::<()>();
    let daemon = h.service.run(async {
        let _ = stopped.await;
    });
    let driver = async {
        tokio::time::sleep(StdDuration::from_millis(20)).await;
        h.service.enqueue_backup(first.id).unwrap();
        h.service.enqueue_backup(second.id).unwrap();
        let done = wait_for(|| {
            [first.id, second.id].iter().all(|id| {
                h.store
                    .runs_for_job(*id)
                    .unwrap()
                    .iter()
                    .any(|r| r.outcome.is_some())
            })
        })
        .await;
        let _ = stop.send(());
        done
    };
    let (result, done) = tokio::join!(daemon, driver);
    result.unwrap();
    assert!(done, "queued backups never finished");

    // The second job sat in the queue for longer than its TTL and still ran.
    for job in [&first, &second] {
        let runs = h.store.runs_for_job(job.id).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].outcome, Some(RunOutcome::Success));
    }
    assert!(h
        .store
        .latest_valid_entry(&second.volume_ref())
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn enqueue_without_a_running_pool_fails_and_frees_the_lease() {
    let h = harness_with(worker_settings(), fast_settings(), |fs| fs);
    let job = h.add_job("docs", "docs", RetentionPolicy::default(), None);
    let err = h.service.enqueue_backup(job.id).unwrap_err();
    assert!(matches!(err, VaultError::Internal(_)));
    assert!(!h
        .service
        .context()
        .locks
        .is_leased(job.id, Utc::now())
        .unwrap());
}

#[tokio::test]
async fn apply_config_reconciles_by_name() {
    let h = harness_with(worker_settings(), fast_settings(), |fs| fs);
    let mut config = Config::default();
    config.environments[0].config.insert(
        "root".into(),
        toml::Value::String(h.source.to_string_lossy().to_string()),
    );

    let first = h.service.apply_config(&config).unwrap();
    assert_eq!(first.environments_created, 1);
    assert_eq!(first.jobs_created, 1);
    let job = h.service.resolve_job("web-1-www").unwrap();
    assert_eq!(job.retention, RetentionPolicy { keep_last: Some(14), max_age_hours: Some(720) });
    assert!(job.next_run.is_some());

    let again = h.service.apply_config(&config).unwrap();
    assert_eq!(again.environments_updated + again.jobs_created + again.jobs_updated, 0);

    config.environments[0].jobs[0].schedule = "hourly".into();
    let changed = h.service.apply_config(&config).unwrap();
    assert_eq!(changed.jobs_updated, 1);
    let updated = h.service.resolve_job(&job.id.to_string()).unwrap();
    assert_eq!(updated.schedule, "hourly");
    assert!(updated.next_run.unwrap() <= Utc::now() + Duration::hours(1));

    config.environments[0].jobs[0].volume = "elsewhere".into();
    let err = h.service.apply_config(&config).unwrap_err();
    assert!(matches!(err, VaultError::InvalidConfig(_)));
}
