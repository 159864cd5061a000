//! ABOUTME: Storage backend abstraction with in-memory and file-based implementations
//! ABOUTME: Supports point reads/writes plus append-only log segments per key

use aishell_core::{AiShellError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;

/// Persistence backend for run records, event logs, and checkpoints.
///
/// Keys are flat strings; log segments are append-only sequences of lines
/// addressed by the same key space.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<bool>;

    /// Append one entry to the log segment at `key`
    async fn append(&self, key: &str, entry: Vec<u8>) -> Result<()>;

    /// Read every entry of the log segment at `key`, oldest first
    async fn read_log(&self, key: &str) -> Result<Vec<Vec<u8>>>;

    /// Keys (both point values and log segments) starting with `prefix`
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>>;
}

/// In-memory backend for tests and ephemeral runs
#[derive(Default)]
pub struct MemoryBackend {
    values: DashMap<String, Vec<u8>>,
    logs: DashMap<String, Vec<Vec<u8>>>,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.values.get(key).map(|v| v.clone()))
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.values.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let had_value = self.values.remove(key).is_some();
        let had_log = self.logs.remove(key).is_some();
        Ok(had_value || had_log)
    }

    async fn append(&self, key: &str, entry: Vec<u8>) -> Result<()> {
        self.logs.entry(key.to_string()).or_default().push(entry);
        Ok(())
    }

    async fn read_log(&self, key: &str) -> Result<Vec<Vec<u8>>> {
        Ok(self.logs.get(key).map(|l| l.clone()).unwrap_or_default())
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .values
            .iter()
            .map(|e| e.key().clone())
            .chain(self.logs.iter().map(|e| e.key().clone()))
            .filter(|k| k.starts_with(prefix))
            .collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}

/// File-backed storage: one file per key, JSON-lines for log segments.
///
/// Keys map to file names with path separators escaped, so the layout
/// stays flat under the root directory.
pub struct FileBackend {
    root: PathBuf,
}

impl FileBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn sanitize(key: &str) -> String {
        key.chars()
            .map(|c| if c == '/' || c == '\\' { '_' } else { c })
            .collect()
    }

    fn path_for(&self, key: &str, log: bool) -> PathBuf {
        let suffix = if log { "log" } else { "json" };
        self.root.join(format!("{}.{suffix}", Self::sanitize(key)))
    }

    fn io_err(err: std::io::Error) -> AiShellError {
        AiShellError::Transient {
            message: format!("storage io: {err}"),
        }
    }
}

#[async_trait]
impl StorageBackend for FileBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.path_for(key, false)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(Self::io_err(err)),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(Self::io_err)?;
        // Write-then-rename keeps the record intact across a crash mid-write
        let target = self.path_for(key, false);
        let tmp = target.with_extension("json.tmp");
        tokio::fs::write(&tmp, value).await.map_err(Self::io_err)?;
        tokio::fs::rename(&tmp, &target)
            .await
            .map_err(Self::io_err)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut removed = false;
        for log in [false, true] {
            match tokio::fs::remove_file(self.path_for(key, log)).await {
                Ok(()) => removed = true,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(Self::io_err(err)),
            }
        }
        Ok(removed)
    }

    async fn append(&self, key: &str, entry: Vec<u8>) -> Result<()> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(Self::io_err)?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(key, true))
            .await
            .map_err(Self::io_err)?;
        file.write_all(&entry).await.map_err(Self::io_err)?;
        file.write_all(b"\n").await.map_err(Self::io_err)?;
        file.flush().await.map_err(Self::io_err)?;
        Ok(())
    }

    async fn read_log(&self, key: &str) -> Result<Vec<Vec<u8>>> {
        match tokio::fs::read(self.path_for(key, true)).await {
            Ok(bytes) => Ok(bytes
                .split(|b| *b == b'\n')
                .filter(|line| !line.is_empty())
                .map(<[u8]>::to_vec)
                .collect()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(Self::io_err(err)),
        }
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut dir = match tokio::fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(keys),
            Err(err) => return Err(Self::io_err(err)),
        };
        let wanted = Self::sanitize(prefix);
        while let Some(entry) = dir.next_entry().await.map_err(Self::io_err)? {
            let name = entry.file_name().to_string_lossy().to_string();
            let key = name
                .strip_suffix(".json")
                .or_else(|| name.strip_suffix(".log"));
            if let Some(key) = key {
                if key.starts_with(&wanted) {
                    keys.push(key.to_string());
                }
            }
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_backend_round_trip() {
        let backend = MemoryBackend::new();
        backend.set("a", b"1".to_vec()).await.unwrap();
        assert_eq!(backend.get("a").await.unwrap(), Some(b"1".to_vec()));
        assert!(backend.delete("a").await.unwrap());
        assert!(backend.get("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_backend_log_order() {
        let backend = MemoryBackend::new();
        backend.append("log", b"first".to_vec()).await.unwrap();
        backend.append("log", b"second".to_vec()).await.unwrap();
        let entries = backend.read_log("log").await.unwrap();
        assert_eq!(entries, vec![b"first".to_vec(), b"second".to_vec()]);
    }

    #[tokio::test]
    async fn test_file_backend_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path());

        backend
            .set("runs:r1:view", b"{\"x\":1}".to_vec())
            .await
            .unwrap();
        assert_eq!(
            backend.get("runs:r1:view").await.unwrap(),
            Some(b"{\"x\":1}".to_vec())
        );

        backend.append("runs:r1:log", b"e1".to_vec()).await.unwrap();
        backend.append("runs:r1:log", b"e2".to_vec()).await.unwrap();
        assert_eq!(
            backend.read_log("runs:r1:log").await.unwrap(),
            vec![b"e1".to_vec(), b"e2".to_vec()]
        );

        let keys = backend.list_keys("runs:r1").await.unwrap();
        assert_eq!(keys.len(), 2);
    }
}
