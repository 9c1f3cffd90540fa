//! Test utilities & fixtures.
//! Every harness lives in its own temp dirs: metadata db, source volumes, repository.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chainvault::model::{
    ChainEntry, ChecksumMap, Environment, Job, NewJob, RetentionPolicy, TransferHandle, VolumeRef,
};
use chainvault::service::{Service, ServiceSettings};
use chainvault::store::MetadataStore;
use chainvault::transfer::fs::FsTransfer;
use chainvault::transfer::{ContentTransfer, Snapshot, TransferError, TransferResult};
use chainvault::worker::WorkerSettings;
use tempfile::TempDir;

pub struct Harness {
    pub service: Service,
    pub store: Arc<MetadataStore>,
    pub environment: Environment,
    /// Root of the environment: volume `v` lives in `source.join(v)`.
    pub source: PathBuf,
    pub repository: PathBuf,
    pub scratch: PathBuf,
    _dirs: Vec<TempDir>,
}

impl Harness {
    pub fn add_job(
        &self,
        name: &str,
        volume: &str,
        retention: RetentionPolicy,
        full_every: Option<u32>,
    ) -> Job {
        let environment = self.environment.clone();
        let root = self.source.clone();
        self.add_job_in(&environment, &root, name, volume, retention, full_every)
    }

    /// Add a job to another environment whose volumes live under `root`.
    pub fn add_job_in(
        &self,
        environment: &Environment,
        root: &Path,
        name: &str,
        volume: &str,
        retention: RetentionPolicy,
        full_every: Option<u32>,
    ) -> Job {
        std::fs::create_dir_all(root.join(volume)).unwrap();
        self.service
            .create_job(NewJob {
                name: name.into(),
                environment_id: environment.id,
                volume: volume.into(),
                schedule: "daily".into(),
                retention,
                full_every,
                next_run: None,
            })
            .unwrap()
    }

    /// A second environment rooted in its own directory under scratch.
    pub fn add_environment(&self, name: &str) -> (Environment, PathBuf) {
        let root = self.scratch.join("roots").join(name);
        std::fs::create_dir_all(&root).unwrap();
        let environment = self
            .service
            .create_environment(name, &serde_json::json!({ "root": root.to_string_lossy() }))
            .unwrap();
        (environment, root)
    }

    pub fn volume(&self, volume: &str) -> PathBuf {
        self.source.join(volume)
    }

    pub fn volume_ref(&self, volume: &str) -> VolumeRef {
        VolumeRef::new(self.environment.id, volume)
    }

    /// Chain of `volume` in the default environment, parents first.
    pub fn entries(&self, volume: &str) -> Vec<ChainEntry> {
        self.service.list_entries(&self.volume_ref(volume)).unwrap()
    }
}

pub fn worker_settings() -> WorkerSettings {
    WorkerSettings {
        owner: "test-node".into(),
        lease_ttl: chrono::Duration::seconds(30),
        transfer_attempts: 1,
        retry_backoff: Duration::from_millis(10),
    }
}

pub fn harness() -> Harness {
    harness_with(worker_settings(), ServiceSettings::default(), |fs| fs)
}

/// Build a harness, letting the caller wrap the filesystem transfer.
pub fn harness_with<F>(worker: WorkerSettings, settings: ServiceSettings, wrap: F) -> Harness
where
    F: FnOnce(Arc<dyn ContentTransfer>) -> Arc<dyn ContentTransfer>,
{
    let db = TempDir::new().unwrap();
    let src = TempDir::new().unwrap();
    let repo = TempDir::new().unwrap();
    let scratch = TempDir::new().unwrap();
    let store = Arc::new(MetadataStore::open(db.path()).unwrap());
    let fs: Arc<dyn ContentTransfer> = Arc::new(FsTransfer::new(src.path(), repo.path()));
    let service = Service::new(store.clone(), wrap(fs), worker, settings);
    let environment = service
        .create_environment(
            "host-a",
            &serde_json::json!({ "root": src.path().to_string_lossy() }),
        )
        .unwrap();
    Harness {
        service,
        store,
        environment,
        source: src.path().to_path_buf(),
        repository: repo.path().to_path_buf(),
        scratch: scratch.path().to_path_buf(),
        _dirs: vec![db, src, repo, scratch],
    }
}

pub fn write_unit(root: &Path, unit: &str, content: &str) {
    let path = root.join(unit);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, content).unwrap();
}

/// Build a harness over a [`FaultyTransfer`] configured by `configure`, keeping a handle
/// on it so the test can flip faults and read counters.
pub fn faulty_harness<F>(
    worker: WorkerSettings,
    settings: ServiceSettings,
    configure: F,
) -> (Harness, Arc<FaultyTransfer>)
where
    F: FnOnce(FaultyTransfer) -> FaultyTransfer,
{
    let mut faults = None;
    let h = harness_with(worker, settings, |inner| {
        let transfer = Arc::new(configure(FaultyTransfer::new(inner)));
        faults = Some(transfer.clone());
        transfer
    });
    (h, faults.unwrap())
}

/// Filesystem transfer with injectable faults.
pub struct FaultyTransfer {
    inner: Arc<dyn ContentTransfer>,
    delay: Duration,
    skip_unit: Option<String>,
    /// Snapshot calls that still have to fail before one goes through.
    pub failing_snapshots: AtomicUsize,
    pub snapshot_calls: AtomicUsize,
    /// While set, every unit read back differs from what was stored.
    pub corrupt_reads: AtomicBool,
}

impl FaultyTransfer {
    pub fn new(inner: Arc<dyn ContentTransfer>) -> Self {
        Self {
            inner,
            delay: Duration::ZERO,
            skip_unit: None,
            failing_snapshots: AtomicUsize::new(0),
            snapshot_calls: AtomicUsize::new(0),
            corrupt_reads: AtomicBool::new(false),
        }
    }

    pub fn slow(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Leave `unit` out of every snapshot as if it vanished mid-walk.
    pub fn skipping(mut self, unit: &str) -> Self {
        self.skip_unit = Some(unit.to_string());
        self
    }

    pub fn failing(self, snapshots: usize) -> Self {
        self.failing_snapshots.store(snapshots, Ordering::SeqCst);
        self
    }
}

#[async_trait]
impl ContentTransfer for FaultyTransfer {
    async fn snapshot(
        &self,
        environment: &Environment,
        volume: &str,
        base: Option<&ChecksumMap>,
    ) -> TransferResult<Snapshot> {
        self.snapshot_calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let fail = self
            .failing_snapshots
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(TransferError::Other("volume busy".into()));
        }
        let mut snapshot = self.inner.snapshot(environment, volume, base).await?;
        if let Some(unit) = &self.skip_unit {
            if snapshot.checksums.remove(unit).is_some() {
                snapshot.skipped.push(unit.clone());
            }
        }
        Ok(snapshot)
    }

    async fn read(&self, handle: &TransferHandle, unit: &str) -> TransferResult<Vec<u8>> {
        let mut data = self.inner.read(handle, unit).await?;
        if self.corrupt_reads.load(Ordering::SeqCst) {
            data.push(b'!');
        }
        Ok(data)
    }

    async fn write(
        &self,
        destination: &str,
        unit: &str,
        data: &[u8],
        expected_hash: &str,
    ) -> TransferResult<()> {
        self.inner.write(destination, unit, data, expected_hash).await
    }

    async fn remove(&self, destination: &str, unit: &str) -> TransferResult<()> {
        self.inner.remove(destination, unit).await
    }

    async fn purge(&self, handle: &TransferHandle) -> TransferResult<()> {
        self.inner.purge(handle).await
    }
}

/// Every file under `root` keyed by its `/`-separated relative path.
pub fn read_tree(root: &Path) -> BTreeMap<String, Vec<u8>> {
    fn walk(dir: &Path, prefix: &str, out: &mut BTreeMap<String, Vec<u8>>) {
        for entry in std::fs::read_dir(dir).unwrap() {
            let entry = entry.unwrap();
            let name = entry.file_name().to_string_lossy().to_string();
            let unit = if prefix.is_empty() {
                name
            } else {
                format!("{}/{}", prefix, name)
            };
            if entry.file_type().unwrap().is_dir() {
                walk(&entry.path(), &unit, out);
            } else {
                out.insert(unit, std::fs::read(entry.path()).unwrap());
            }
        }
    }
    let mut out = BTreeMap::new();
    walk(root, "", &mut out);
    out
}
