//! Per-group snapshot store.
//!
//! Layout under `snapshots/<group>/`:
//! `<index>-<term>/{meta, data}` for the live snapshot, `tmp-*` while one is
//! being written, and `checkpoint-<index>-<term>/` for a checkpoint: a
//! durable snapshot that does not yet authorise segment deletion. Data files
//! are fsynced before promotion and carry a blake3 digest in the meta so a
//! torn write is detected on recovery. At most the live snapshot and one in
//! flight are kept.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use bytes::Bytes;
use cairn_raft::raft::{ClusterConfig, Index, Term};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub last_index: Index,
    pub last_term: Term,
    pub cluster_config: ClusterConfig,
    pub machine_version: u32,
    /// blake3 of the data file, hex.
    pub digest: String,
}

/// A written-but-not-promoted snapshot.
#[derive(Debug)]
pub struct PendingSnapshot {
    pub meta: SnapshotMeta,
    dir: PathBuf,
}

pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn open(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).context("create snapshot dir")?;
        // A crash can leave a tmp dir behind; it never got promoted, drop it.
        for dirent in fs::read_dir(&dir)? {
            let path = dirent?.path();
            if path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with("tmp-"))
                .unwrap_or(false)
            {
                let _ = fs::remove_dir_all(&path);
            }
        }
        Ok(Self { dir })
    }

    /// Write a snapshot into a temporary directory, fsynced but invisible to
    /// recovery until promoted.
    pub fn write(
        &self,
        last_index: Index,
        last_term: Term,
        cluster_config: ClusterConfig,
        machine_version: u32,
        data: &[u8],
    ) -> anyhow::Result<PendingSnapshot> {
        let meta = SnapshotMeta {
            last_index,
            last_term,
            cluster_config,
            machine_version,
            digest: blake3::hash(data).to_hex().to_string(),
        };
        let tmp = self.dir.join(format!("tmp-{last_index}-{last_term}"));
        let _ = fs::remove_dir_all(&tmp);
        write_snapshot_dir(&tmp, &meta, data)?;
        Ok(PendingSnapshot { meta, dir: tmp })
    }

    /// Make a pending snapshot the live one and drop everything older.
    pub fn promote(&self, pending: PendingSnapshot) -> anyhow::Result<SnapshotMeta> {
        let target = self.slot_dir(pending.meta.last_index, pending.meta.last_term);
        let _ = fs::remove_dir_all(&target);
        fs::rename(&pending.dir, &target).context("promote snapshot")?;
        fsync_dir(&self.dir)?;
        self.drop_older_than(pending.meta.last_index)?;
        tracing::info!(
            index = pending.meta.last_index,
            term = pending.meta.last_term,
            "snapshot promoted"
        );
        Ok(pending.meta)
    }

    /// Write a checkpoint: durable, recoverable, but not yet a license to
    /// delete log segments.
    pub fn write_checkpoint(
        &self,
        last_index: Index,
        last_term: Term,
        cluster_config: ClusterConfig,
        machine_version: u32,
        data: &[u8],
    ) -> anyhow::Result<SnapshotMeta> {
        let meta = SnapshotMeta {
            last_index,
            last_term,
            cluster_config,
            machine_version,
            digest: blake3::hash(data).to_hex().to_string(),
        };
        let tmp = self.dir.join(format!("tmp-ckpt-{last_index}-{last_term}"));
        let _ = fs::remove_dir_all(&tmp);
        write_snapshot_dir(&tmp, &meta, data)?;
        let target = self
            .dir
            .join(format!("checkpoint-{last_index}-{last_term}"));
        let _ = fs::remove_dir_all(&target);
        fs::rename(&tmp, &target).context("place checkpoint")?;
        fsync_dir(&self.dir)?;
        Ok(meta)
    }

    /// Promote the newest checkpoint at or past `min_index` into the live
    /// snapshot slot. Returns its meta when one was promoted.
    pub fn promote_checkpoint(&self, min_index: Index) -> anyhow::Result<Option<SnapshotMeta>> {
        let mut best: Option<(Index, Term, PathBuf)> = None;
        for dirent in fs::read_dir(&self.dir)? {
            let path = dirent?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(rest) = name.strip_prefix("checkpoint-") else {
                continue;
            };
            let Some((index, term)) = parse_slot(rest) else {
                continue;
            };
            if index >= min_index && best.as_ref().map(|(i, _, _)| index > *i).unwrap_or(true) {
                best = Some((index, term, path));
            }
        }
        let Some((index, term, path)) = best else {
            return Ok(None);
        };
        let target = self.slot_dir(index, term);
        let _ = fs::remove_dir_all(&target);
        fs::rename(&path, &target).context("promote checkpoint")?;
        fsync_dir(&self.dir)?;
        self.drop_older_than(index)?;
        let meta = read_meta(&target)?;
        tracing::info!(index, term, "checkpoint promoted");
        Ok(Some(meta))
    }

    /// Newest live snapshot whose digest verifies.
    pub fn recover(&self) -> anyhow::Result<Option<(SnapshotMeta, Bytes)>> {
        let mut slots = self.live_slots()?;
        slots.sort_unstable_by_key(|(index, _, _)| std::cmp::Reverse(*index));
        for (index, _, path) in slots {
            match load_verified(&path) {
                Ok(found) => return Ok(Some(found)),
                Err(err) => {
                    tracing::warn!(
                        index,
                        path = %path.display(),
                        error = ?err,
                        "snapshot failed verification, trying older"
                    );
                }
            }
        }
        Ok(None)
    }

    /// Meta of the newest live snapshot, data left on disk.
    pub fn latest_meta(&self) -> anyhow::Result<Option<SnapshotMeta>> {
        let mut slots = self.live_slots()?;
        slots.sort_unstable_by_key(|(index, _, _)| std::cmp::Reverse(*index));
        match slots.first() {
            Some((_, _, path)) => Ok(Some(read_meta(path)?)),
            None => Ok(None),
        }
    }

    /// Receiver side of a peer-streamed snapshot: write and promote in one
    /// step, trusting the already-assembled bytes.
    pub fn install(
        &self,
        last_index: Index,
        last_term: Term,
        cluster_config: ClusterConfig,
        machine_version: u32,
        data: &[u8],
    ) -> anyhow::Result<SnapshotMeta> {
        let pending = self.write(last_index, last_term, cluster_config, machine_version, data)?;
        self.promote(pending)
    }

    pub fn delete_all(&self) -> anyhow::Result<()> {
        fs::remove_dir_all(&self.dir).context("delete snapshot dir")
    }

    fn slot_dir(&self, index: Index, term: Term) -> PathBuf {
        self.dir.join(format!("{index}-{term}"))
    }

    fn live_slots(&self) -> anyhow::Result<Vec<(Index, Term, PathBuf)>> {
        let mut out = Vec::new();
        for dirent in fs::read_dir(&self.dir)? {
            let path = dirent?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.starts_with("tmp-") || name.starts_with("checkpoint-") {
                continue;
            }
            if let Some((index, term)) = parse_slot(name) {
                out.push((index, term, path));
            }
        }
        Ok(out)
    }

    fn drop_older_than(&self, index: Index) -> anyhow::Result<()> {
        for (slot_index, _, path) in self.live_slots()? {
            if slot_index < index {
                let _ = fs::remove_dir_all(&path);
            }
        }
        for dirent in fs::read_dir(&self.dir)? {
            let path = dirent?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if let Some(rest) = name.strip_prefix("checkpoint-") {
                if let Some((ckpt_index, _)) = parse_slot(rest) {
                    if ckpt_index <= index {
                        let _ = fs::remove_dir_all(&path);
                    }
                }
            }
        }
        Ok(())
    }
}

fn parse_slot(name: &str) -> Option<(Index, Term)> {
    let (index, term) = name.split_once('-')?;
    Some((index.parse().ok()?, term.parse().ok()?))
}

fn write_snapshot_dir(dir: &Path, meta: &SnapshotMeta, data: &[u8]) -> anyhow::Result<()> {
    fs::create_dir_all(dir)?;
    let mut data_file = File::create(dir.join("data"))?;
    data_file.write_all(data)?;
    data_file.sync_all().context("fsync snapshot data")?;
    let mut meta_file = File::create(dir.join("meta"))?;
    meta_file.write_all(serde_json::to_string_pretty(meta)?.as_bytes())?;
    meta_file.sync_all().context("fsync snapshot meta")?;
    fsync_dir(dir)?;
    Ok(())
}

fn read_meta(dir: &Path) -> anyhow::Result<SnapshotMeta> {
    let raw = fs::read_to_string(dir.join("meta"))
        .with_context(|| format!("read snapshot meta in {}", dir.display()))?;
    serde_json::from_str(&raw).context("parse snapshot meta")
}

fn load_verified(dir: &Path) -> anyhow::Result<(SnapshotMeta, Bytes)> {
    let meta = read_meta(dir)?;
    let data = fs::read(dir.join("data"))?;
    let digest = blake3::hash(&data).to_hex().to_string();
    anyhow::ensure!(
        digest == meta.digest,
        "snapshot data digest mismatch in {}",
        dir.display()
    );
    Ok((meta, Bytes::from(data)))
}

fn fsync_dir(dir: &Path) -> anyhow::Result<()> {
    File::open(dir)
        .and_then(|f| f.sync_all())
        .with_context(|| format!("fsync dir {}", dir.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config() -> ClusterConfig {
        ClusterConfig::new([1, 2, 3])
    }

    #[test]
    fn write_promote_recover_round_trip() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::open(dir.path().join("g")).unwrap();
        assert!(store.recover().unwrap().is_none());

        let pending = store.write(100, 4, config(), 0, b"machine-state").unwrap();
        // Unpromoted snapshots are invisible.
        assert!(store.recover().unwrap().is_none());

        store.promote(pending).unwrap();
        let (meta, data) = store.recover().unwrap().unwrap();
        assert_eq!(meta.last_index, 100);
        assert_eq!(meta.last_term, 4);
        assert_eq!(meta.cluster_config, config());
        assert_eq!(&data[..], b"machine-state");
    }

    #[test]
    fn promotion_drops_older_snapshot() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::open(dir.path().join("g")).unwrap();
        let old = store.write(10, 1, config(), 0, b"old").unwrap();
        store.promote(old).unwrap();
        let new = store.write(20, 2, config(), 0, b"new").unwrap();
        store.promote(new).unwrap();

        let (meta, data) = store.recover().unwrap().unwrap();
        assert_eq!(meta.last_index, 20);
        assert_eq!(&data[..], b"new");
        assert!(!dir.path().join("g/10-1").exists());
    }

    #[test]
    fn corrupt_data_falls_back_to_older() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::open(dir.path().join("g")).unwrap();
        let a = store.write(10, 1, config(), 0, b"good").unwrap();
        store.promote(a).unwrap();
        // Place a newer slot with flipped bytes by hand.
        let b = store.write(20, 2, config(), 0, b"will-corrupt").unwrap();
        store.promote(b).unwrap();
        // Promote removed the older one, so re-create it before corrupting.
        let again = store.write(10, 1, config(), 0, b"good").unwrap();
        let target = dir.path().join("g/10-1");
        fs::rename(&again.dir, &target).unwrap();
        fs::write(dir.path().join("g/20-2/data"), b"flipped").unwrap();

        let (meta, data) = store.recover().unwrap().unwrap();
        assert_eq!(meta.last_index, 10);
        assert_eq!(&data[..], b"good");
    }

    #[test]
    fn checkpoint_promotes_into_live_slot() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::open(dir.path().join("g")).unwrap();
        store.write_checkpoint(50, 3, config(), 0, b"ckpt").unwrap();
        // A checkpoint alone does not answer recovery.
        assert!(store.recover().unwrap().is_none());

        let meta = store.promote_checkpoint(0).unwrap().unwrap();
        assert_eq!(meta.last_index, 50);
        let (recovered, data) = store.recover().unwrap().unwrap();
        assert_eq!(recovered.last_index, 50);
        assert_eq!(&data[..], b"ckpt");
    }
}
