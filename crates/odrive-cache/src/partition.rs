//! On-disk partition layout and restart recovery.
//!
//! Every ciphertext file is named `<hex32 id>.<state>`. A file moves between
//! states only by `rename(2)`; data is written only under the temp suffixes
//! `uploading` and `caching`.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use odrive_core::ObjectId;
use tokio::fs;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CacheState {
    Uploading,
    Uploaded,
    Caching,
    Cached,
    Orphaned,
}

impl CacheState {
    pub const ALL: [CacheState; 5] = [
        CacheState::Uploading,
        CacheState::Uploaded,
        CacheState::Caching,
        CacheState::Cached,
        CacheState::Orphaned,
    ];

    pub fn suffix(self) -> &'static str {
        match self {
            CacheState::Uploading => "uploading",
            CacheState::Uploaded => "uploaded",
            CacheState::Caching => "caching",
            CacheState::Cached => "cached",
            CacheState::Orphaned => "orphaned",
        }
    }

    pub fn from_suffix(s: &str) -> Option<Self> {
        CacheState::ALL.into_iter().find(|st| st.suffix() == s)
    }

    /// Files still being written; never valid across a restart.
    pub fn is_temp(self) -> bool {
        matches!(self, CacheState::Uploading | CacheState::Caching)
    }

    /// Which state survives when one id is present under several names.
    fn precedence(self) -> u8 {
        match self {
            CacheState::Cached => 3,
            CacheState::Uploaded => 2,
            CacheState::Orphaned => 1,
            CacheState::Uploading | CacheState::Caching => 0,
        }
    }
}

impl fmt::Display for CacheState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}

/// Parse `<hex32>.<state>`; anything else is not ours.
pub fn parse_file_name(name: &str) -> Option<(ObjectId, CacheState)> {
    let (id, suffix) = name.split_once('.')?;
    Some((id.parse().ok()?, CacheState::from_suffix(suffix)?))
}

#[derive(Debug, Clone)]
pub struct PartitionEntry {
    pub id: ObjectId,
    pub state: CacheState,
    pub size: u64,
    pub modified: SystemTime,
}

/// What restart recovery did.
#[derive(Debug, Default, Clone)]
pub struct RecoveryReport {
    /// `.uploaded` ids that must go back on the drain queue
    pub requeue: Vec<ObjectId>,
    pub removed_temp: usize,
    pub resolved_duplicates: usize,
    /// Bytes held by surviving files
    pub used_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct Partition {
    dir: PathBuf,
}

impl Partition {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, id: &ObjectId, state: CacheState) -> PathBuf {
        self.dir.join(format!("{}.{}", id.to_hex(), state.suffix()))
    }

    pub async fn ensure(&self) -> std::io::Result<()> {
        fs::create_dir_all(&self.dir).await
    }

    /// Move `id` from one state to another. Fails if the source is absent.
    pub async fn transition(
        &self,
        id: &ObjectId,
        from: CacheState,
        to: CacheState,
    ) -> std::io::Result<()> {
        fs::rename(self.path(id, from), self.path(id, to)).await?;
        debug!(id = %id, from = %from, to = %to, "partition transition");
        Ok(())
    }

    /// The non-temp state `id` is currently in, if any. Blocking stat calls;
    /// cheap enough to run under the single-flight lock.
    pub fn settled_state_sync(&self, id: &ObjectId) -> Option<CacheState> {
        [CacheState::Cached, CacheState::Uploaded, CacheState::Orphaned]
            .into_iter()
            .find(|st| self.path(id, *st).exists())
    }

    /// Every recognised file with its size and mtime.
    pub async fn scan(&self) -> std::io::Result<Vec<PartitionEntry>> {
        let mut out = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some((id, state)) = name.to_str().and_then(parse_file_name) else {
                continue;
            };
            // Raced with a rename or delete; the next scan will see the new name.
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            out.push(PartitionEntry {
                id,
                state,
                size: meta.len(),
                modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            });
        }
        Ok(out)
    }

    /// Bring the partition to a consistent state after a restart.
    ///
    /// Temp files are deleted. When an id is present under more than one
    /// settled name, the highest-precedence one (`cached` > `uploaded` >
    /// `orphaned`) is kept. Surviving `.uploaded` ids are returned for requeue.
    pub async fn recover(&self) -> std::io::Result<RecoveryReport> {
        self.ensure().await?;
        let mut report = RecoveryReport::default();
        let mut by_id: HashMap<ObjectId, Vec<PartitionEntry>> = HashMap::new();

        for entry in self.scan().await? {
            if entry.state.is_temp() {
                warn!(id = %entry.id, state = %entry.state, "removing incomplete file");
                remove_if_present(&self.path(&entry.id, entry.state)).await?;
                report.removed_temp += 1;
                continue;
            }
            by_id.entry(entry.id).or_default().push(entry);
        }

        for (id, mut entries) in by_id {
            entries.sort_by_key(|e| std::cmp::Reverse(e.state.precedence()));
            let keep = entries.remove(0);
            for dup in entries {
                warn!(id = %id, kept = %keep.state, removed = %dup.state, "resolving dual presence");
                remove_if_present(&self.path(&id, dup.state)).await?;
                report.resolved_duplicates += 1;
            }
            if keep.state == CacheState::Uploaded {
                report.requeue.push(id);
            }
            report.used_bytes += keep.size;
        }

        info!(
            dir = %self.dir.display(),
            requeue = report.requeue.len(),
            removed_temp = report.removed_temp,
            duplicates = report.resolved_duplicates,
            used_bytes = report.used_bytes,
            "partition recovered"
        );
        Ok(report)
    }
}

pub(crate) async fn remove_if_present(path: &Path) -> std::io::Result<bool> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_name_grammar() {
        let id = ObjectId::from_bytes([0xab; 16]);
        let name = format!("{}.cached", id.to_hex());
        assert_eq!(parse_file_name(&name), Some((id, CacheState::Cached)));
        assert_eq!(parse_file_name(&format!("{}.bogus", id.to_hex())), None);
        assert_eq!(parse_file_name("short.cached"), None);
        assert_eq!(parse_file_name("noextension"), None);
    }

    #[tokio::test]
    async fn recover_cleans_and_requeues() {
        let tmp = tempfile::tempdir().unwrap();
        let p = Partition::new(tmp.path().join("cache"));
        p.ensure().await.unwrap();

        let uploading = ObjectId::random();
        let caching = ObjectId::random();
        let uploaded = ObjectId::random();
        let dual = ObjectId::random();
        let orphan = ObjectId::random();
        std::fs::write(p.path(&uploading, CacheState::Uploading), b"x").unwrap();
        std::fs::write(p.path(&caching, CacheState::Caching), b"x").unwrap();
        std::fs::write(p.path(&uploaded, CacheState::Uploaded), b"abc").unwrap();
        std::fs::write(p.path(&dual, CacheState::Uploaded), b"12").unwrap();
        std::fs::write(p.path(&dual, CacheState::Cached), b"12").unwrap();
        std::fs::write(p.path(&orphan, CacheState::Orphaned), b"1").unwrap();
        std::fs::write(p.dir().join("README"), b"not ours").unwrap();

        let report = p.recover().await.unwrap();
        assert_eq!(report.requeue, vec![uploaded]);
        assert_eq!(report.removed_temp, 2);
        assert_eq!(report.resolved_duplicates, 1);
        assert_eq!(report.used_bytes, 3 + 2 + 1);

        assert!(!p.path(&uploading, CacheState::Uploading).exists());
        assert!(!p.path(&caching, CacheState::Caching).exists());
        assert!(p.path(&dual, CacheState::Cached).exists());
        assert!(!p.path(&dual, CacheState::Uploaded).exists());
        assert!(p.path(&orphan, CacheState::Orphaned).exists());
        assert!(p.dir().join("README").exists());
    }

    #[tokio::test]
    async fn transition_renames() {
        let tmp = tempfile::tempdir().unwrap();
        let p = Partition::new(tmp.path());
        let id = ObjectId::random();
        std::fs::write(p.path(&id, CacheState::Uploaded), b"x").unwrap();
        p.transition(&id, CacheState::Uploaded, CacheState::Cached)
            .await
            .unwrap();
        assert_eq!(p.settled_state_sync(&id), Some(CacheState::Cached));
        assert!(p
            .transition(&id, CacheState::Uploaded, CacheState::Cached)
            .await
            .is_err());
    }
}
