//! Durable term and vote for one group.
//!
//! Small write-rename-fsync file under `meta/<group>/state`. The group id
//! bytes are stored alongside so the node can enumerate hosted groups on
//! restart.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use anyhow::Context;
use cairn_raft::raft::{GroupId, NodeId, PersistentState, Term};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
struct MetaFile {
    /// Hex of the group id bytes; lets recovery map directories back to ids.
    group: String,
    current_term: Term,
    voted_for: Option<NodeId>,
}

pub struct MetaStore {
    dir: PathBuf,
    group: GroupId,
}

impl MetaStore {
    pub fn open(dir: impl Into<PathBuf>, group: GroupId) -> anyhow::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).context("create meta dir")?;
        Ok(Self { dir, group })
    }

    pub fn load(&self) -> anyhow::Result<Option<PersistentState>> {
        let path = self.dir.join("state");
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let meta: MetaFile = serde_json::from_str(&raw).context("parse group meta")?;
        anyhow::ensure!(
            meta.group == hex(self.group.as_bytes()),
            "meta file belongs to another group"
        );
        Ok(Some(PersistentState {
            current_term: meta.current_term,
            voted_for: meta.voted_for,
        }))
    }

    /// Persist term and vote. Must complete before any vote or ack that
    /// depends on it leaves the node.
    pub fn save(&self, state: &PersistentState) -> anyhow::Result<()> {
        let meta = MetaFile {
            group: hex(self.group.as_bytes()),
            current_term: state.current_term,
            voted_for: state.voted_for,
        };
        let tmp = self.dir.join("state.tmp");
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&tmp)
            .context("open meta tmp")?;
        file.write_all(serde_json::to_string(&meta)?.as_bytes())?;
        file.sync_all().context("fsync meta")?;
        fs::rename(&tmp, self.dir.join("state")).context("replace meta")?;
        File::open(&self.dir).and_then(|d| d.sync_all()).context("fsync meta dir")?;
        Ok(())
    }

    pub fn delete(&self) -> anyhow::Result<()> {
        fs::remove_dir_all(&self.dir).context("delete meta dir")
    }
}

/// Read just the group id recorded in a meta directory.
pub fn read_group_id(dir: &std::path::Path) -> anyhow::Result<GroupId> {
    let raw = fs::read_to_string(dir.join("state")).context("read group meta")?;
    let meta: MetaFile = serde_json::from_str(&raw).context("parse group meta")?;
    let bytes = unhex(&meta.group).context("decode group id")?;
    Ok(GroupId::new(bytes))
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn unhex(s: &str) -> anyhow::Result<Vec<u8>> {
    anyhow::ensure!(s.len() % 2 == 0, "odd hex length");
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(Into::into))
        .collect()
}
