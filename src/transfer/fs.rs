//! Directory-backed content transfer.
//!
//! A volume is a directory: `<root>/<volume>` where `<root>` is the environment's
//! `root` configuration key, or `<source_root>/<environment name>` when unset. Units are the
//! regular files below it, named by their `/`-separated relative path.
//!
//! Snapshots live in `<repository>/<handle>/`, one gzip file per stored unit, with the unit
//! name percent-encoded into a flat file name.

use async_trait::async_trait;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::{debug, warn};
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};

use super::{sha256_hex, verify_unit, ContentTransfer, Snapshot, TransferError, TransferResult};
use crate::model::{ChecksumMap, Environment, TransferHandle};

pub struct FsTransfer {
    source_root: PathBuf,
    repository: PathBuf,
}

impl FsTransfer {
    pub fn new(source_root: impl Into<PathBuf>, repository: impl Into<PathBuf>) -> Self {
        Self {
            source_root: source_root.into(),
            repository: repository.into(),
        }
    }

    /// Directory holding `volume` for `environment`.
    pub fn volume_dir(&self, environment: &Environment, volume: &str) -> PathBuf {
        let configured = environment
            .config_value()
            .ok()
            .and_then(|v| v.get("root").and_then(|r| r.as_str()).map(PathBuf::from));
        configured
            .unwrap_or_else(|| self.source_root.join(&environment.name))
            .join(volume)
    }

    fn payload_path(&self, handle: &TransferHandle, unit: &str) -> PathBuf {
        payload_file(&self.repository.join(&handle.0), unit)
    }
}

fn payload_file(snapshot_dir: &Path, unit: &str) -> PathBuf {
    snapshot_dir.join(format!("{}.gz", utf8_percent_encode(unit, NON_ALPHANUMERIC)))
}

/// Reject unit names that would escape the destination directory.
fn unit_path(base: &Path, unit: &str) -> TransferResult<PathBuf> {
    let relative = Path::new(unit);
    let clean = !unit.is_empty()
        && relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if !clean {
        return Err(TransferError::InvalidUnit(unit.to_string()));
    }
    Ok(base.join(relative))
}

fn join_unit(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", prefix, name)
    }
}

/// Walk `dir` collecting regular files. Entries whose name is not UTF-8 cannot be named as
/// units; they are reported in `skipped` under a lossy name.
fn collect_units(
    dir: &Path,
    prefix: &str,
    out: &mut Vec<(String, PathBuf)>,
    skipped: &mut Vec<String>,
) -> std::io::Result<()> {
    let mut children: Vec<_> = std::fs::read_dir(dir)?.collect::<Result<_, _>>()?;
    children.sort_by_key(|e| e.file_name());
    for child in children {
        let file_name = child.file_name();
        let Some(name) = file_name.to_str() else {
            let lossy = join_unit(prefix, &file_name.to_string_lossy());
            warn!("skipping non UTF-8 path {} under {}", lossy, dir.display());
            skipped.push(lossy);
            continue;
        };
        let unit = join_unit(prefix, name);
        let file_type = child.file_type()?;
        if file_type.is_dir() {
            collect_units(&child.path(), &unit, out, skipped)?;
        } else if file_type.is_file() {
            out.push((unit, child.path()));
        }
    }
    Ok(())
}

fn store_payload(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let file = std::fs::File::create(path)?;
    let mut encoder = GzEncoder::new(file, Compression::default());
    encoder.write_all(data)?;
    encoder.finish()?.sync_all()?;
    Ok(())
}

fn snapshot_blocking(
    source: PathBuf,
    target: PathBuf,
    handle: TransferHandle,
    base: Option<ChecksumMap>,
) -> TransferResult<Snapshot> {
    if !source.is_dir() {
        return Err(TransferError::NotFound(format!(
            "volume directory {}",
            source.display()
        )));
    }
    let mut units = Vec::new();
    let mut skipped = Vec::new();
    collect_units(&source, "", &mut units, &mut skipped)?;
    std::fs::create_dir_all(&target)?;

    let mut checksums = ChecksumMap::new();
    let mut seen = std::collections::HashSet::new();
    let mut size_bytes = 0u64;
    for (unit, path) in units {
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(err) => {
                warn!("unit {} unreadable during snapshot: {}", unit, err);
                skipped.push(unit);
                continue;
            }
        };
        let hash = sha256_hex(&data);
        seen.insert(unit.clone());
        if base.as_ref().and_then(|b| b.get(&unit)) == Some(&hash) {
            continue;
        }
        store_payload(&payload_file(&target, &unit), &data)?;
        size_bytes += data.len() as u64;
        checksums.insert(unit, hash);
    }

    let removed = base
        .map(|b| {
            b.into_keys()
                .filter(|u| !seen.contains(u) && !skipped.contains(u))
                .collect()
        })
        .unwrap_or_default();

    Ok(Snapshot {
        checksums,
        removed,
        skipped,
        size_bytes,
        handle,
    })
}

#[async_trait]
impl ContentTransfer for FsTransfer {
    async fn snapshot(
        &self,
        environment: &Environment,
        volume: &str,
        base: Option<&ChecksumMap>,
    ) -> TransferResult<Snapshot> {
        let source = self.volume_dir(environment, volume);
        let handle = TransferHandle(uuid::Uuid::new_v4().simple().to_string());
        let target = self.repository.join(&handle.0);
        let base = base.cloned();
        debug!("snapshotting {} into {}", source.display(), target.display());

        let task_target = target.clone();
        let result = tokio::task::spawn_blocking(move || {
            snapshot_blocking(source, task_target, handle, base)
        })
        .await
        .map_err(|e| TransferError::Other(format!("snapshot task failed: {}", e)))?;

        if result.is_err() {
            let _ = tokio::fs::remove_dir_all(&target).await;
        }
        result
    }

    async fn read(&self, handle: &TransferHandle, unit: &str) -> TransferResult<Vec<u8>> {
        let path = self.payload_path(handle, unit);
        let compressed = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(TransferError::NotFound(format!("unit {} in {}", unit, handle)))
            }
            Err(err) => return Err(err.into()),
        };
        let mut data = Vec::new();
        GzDecoder::new(compressed.as_slice()).read_to_end(&mut data)?;
        Ok(data)
    }

    async fn write(
        &self,
        destination: &str,
        unit: &str,
        data: &[u8],
        expected_hash: &str,
    ) -> TransferResult<()> {
        let path = unit_path(Path::new(destination), unit)?;
        verify_unit(unit, data, expected_hash)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = path.with_file_name(format!(".{}.partial", file_name));
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn remove(&self, destination: &str, unit: &str) -> TransferResult<()> {
        let path = unit_path(Path::new(destination), unit)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn purge(&self, handle: &TransferHandle) -> TransferResult<()> {
        match tokio::fs::remove_dir_all(self.repository.join(&handle.0)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
