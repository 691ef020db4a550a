// src/storage/mod.rs

//! Durable object storage used by snapshot-backed channels.

use std::fmt::Debug;
use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::debug;

pub mod memory;

pub use memory::MemoryStorage;

/// Abstract object storage keyed by URI.
pub trait Storage: Send + Sync + Debug {
    fn put(&self, uri: &str, payload: &[u8]) -> Result<()>;
    fn get(&self, uri: &str) -> Result<Option<Vec<u8>>>;
    fn contains(&self, uri: &str) -> bool;
    /// Remove an object. Removing a missing object is not an error.
    fn remove(&self, uri: &str) -> Result<()>;
}

/// Storage backed by a directory on the local filesystem.
///
/// `snapshot://exec/task/slot` is stored at `<root>/snapshot/exec/task/slot`.
#[derive(Debug, Clone)]
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, uri: &str) -> Result<PathBuf> {
        let (scheme, rest) = uri
            .split_once("://")
            .ok_or_else(|| anyhow!("storage uri without scheme: {uri}"))?;

        let relative = Path::new(rest);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(anyhow!("storage uri must not contain '..' or absolute parts: {uri}"));
        }

        Ok(self.root.join(scheme).join(relative))
    }
}

impl Storage for FsStorage {
    fn put(&self, uri: &str, payload: &[u8]) -> Result<()> {
        let path = self.path_for(uri)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("creating dir {:?}", parent))?;
        }

        // Write to a sibling temp file first so readers never see a torn object.
        let tmp = path.with_extension("partial");
        let mut file = fs::File::create(&tmp).with_context(|| format!("creating file {:?}", tmp))?;
        file.write_all(payload)
            .with_context(|| format!("writing to file {:?}", tmp))?;
        file.sync_all().with_context(|| format!("syncing file {:?}", tmp))?;
        fs::rename(&tmp, &path).with_context(|| format!("renaming {:?} to {:?}", tmp, path))?;

        debug!(uri, bytes = payload.len(), "stored object");
        Ok(())
    }

    fn get(&self, uri: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(uri)?;
        if !path.is_file() {
            return Ok(None);
        }
        let bytes = fs::read(&path).with_context(|| format!("reading file {:?}", path))?;
        Ok(Some(bytes))
    }

    fn contains(&self, uri: &str) -> bool {
        self.path_for(uri).map(|p| p.is_file()).unwrap_or(false)
    }

    fn remove(&self, uri: &str) -> Result<()> {
        let path = self.path_for(uri)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing file {:?}", path)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fs_storage_round_trips_objects() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let storage = FsStorage::new(dir.path());

        assert!(!storage.contains("snapshot://e1/A/out"));
        storage.put("snapshot://e1/A/out", b"payload")?;
        assert!(storage.contains("snapshot://e1/A/out"));
        assert_eq!(storage.get("snapshot://e1/A/out")?, Some(b"payload".to_vec()));

        storage.remove("snapshot://e1/A/out")?;
        storage.remove("snapshot://e1/A/out")?;
        assert_eq!(storage.get("snapshot://e1/A/out")?, None);
        Ok(())
    }

    #[test]
    fn fs_storage_rejects_escaping_uris() {
        let storage = FsStorage::new("/tmp/unused");
        assert!(storage.put("snapshot://../etc/passwd", b"x").is_err());
        assert!(storage.put("no-scheme", b"x").is_err());
    }
}
