//! The reference filesystem `Engine`: one file per key under a root
//! directory, with atomic tmp+rename writes and a native
//! `commit_temp_file` fast path for transaction commit (§4.6.3 step 5).

use async_trait::async_trait;
use kvlayer_core::engine::bytes_stream::ByteStream;
use kvlayer_core::{Engine, Error, RecordInfo, Result};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_stream::StreamExt;

/// A filesystem-backed `Engine`. Every normalized key maps to a file
/// under `root`, preserving the key's `/` structure as directories.
pub struct FilesystemEngine {
    root: PathBuf,
    tmp_counter: AtomicU64,
}

impl FilesystemEngine {
    /// Open (creating if necessary) a filesystem engine rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(FilesystemEngine {
            root,
            tmp_counter: AtomicU64::new(0),
        })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        // Keys are already normalized (lower-case alnum, '-', '.', '/'),
        // so every path segment is filesystem-safe on every platform we
        // target.
        self.root.join(key)
    }

    fn next_tmp_suffix(&self) -> u64 {
        self.tmp_counter.fetch_add(1, Ordering::SeqCst)
    }

    async fn info_for(path: &Path) -> Result<RecordInfo> {
        let meta = fs::metadata(path).await?;
        let modified = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        Ok(RecordInfo {
            modified,
            length: meta.len(),
        })
    }

    async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension(format!("tmp.{}", self.next_tmp_suffix()));
        {
            let mut f = fs::File::create(&tmp).await?;
            f.write_all(bytes).await?;
            f.sync_all().await?;
        }
        if let Err(e) = fs::rename(&tmp, path).await {
            tracing::warn!(path = %path.display(), error = %e, "failed to commit atomic write, tmp file left behind");
            return Err(Error::Io(e));
        }
        Ok(())
    }

    fn not_found_if_missing(key: &str, err: std::io::Error) -> Error {
        if err.kind() == std::io::ErrorKind::NotFound {
            Error::not_found(key)
        } else {
            Error::Io(err)
        }
    }
}

#[async_trait]
impl Engine for FilesystemEngine {
    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.write_atomic(&self.path_for(key), value).await
    }

    async fn put_stream(&self, key: &str, mut stream: ByteStream) -> Result<()> {
        let mut buf = Vec::new();
        while let Some(chunk) = stream.next().await {
            buf.extend_from_slice(&chunk?);
        }
        self.put(key, &buf).await
    }

    async fn get(&self, key: &str) -> Result<(Vec<u8>, RecordInfo)> {
        let path = self.path_for(key);
        let bytes = fs::read(&path).await.map_err(|e| {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(key, error = %e, "engine read failed");
            }
            Self::not_found_if_missing(key, e)
        })?;
        let info = Self::info_for(&path).await?;
        Ok((bytes, info))
    }

    async fn head(&self, key: &str) -> Result<RecordInfo> {
        let path = self.path_for(key);
        Self::info_for(&path)
            .await
            .map_err(|_| Error::not_found(key))
    }

    async fn get_range(&self, key: &str, start: u64, end: u64) -> Result<(Vec<u8>, RecordInfo)> {
        let (bytes, info) = self.get(key).await?;
        if start > end || end > info.length {
            return Err(Error::InvalidInput(format!(
                "range [{start}, {end}) out of bounds for '{key}' (len {})",
                info.length
            )));
        }
        Ok((bytes[start as usize..end as usize].to_vec(), info))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        fs::remove_file(self.path_for(key)).await.map_err(|e| {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(key, error = %e, "engine delete failed");
            }
            Self::not_found_if_missing(key, e)
        })
    }

    async fn run_maintenance(&self) -> Result<()> {
        // No background compaction for the plain filesystem engine.
        Ok(())
    }

    async fn commit_temp_file(&self, key: &str, tmp_path: &Path) -> Result<bool> {
        let dest = self.path_for(key);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(tmp_path, &dest).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let e = FilesystemEngine::open(dir.path()).await.unwrap();
        e.put("users/bob", b"hello").await.unwrap();
        let (v, info) = e.get("users/bob").await.unwrap();
        assert_eq!(v, b"hello");
        assert_eq!(info.length, 5);
    }

    #[tokio::test]
    async fn missing_key_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let e = FilesystemEngine::open(dir.path()).await.unwrap();
        assert!(e.get("nope").await.unwrap_err().is_not_found());
        assert!(e.head("nope").await.unwrap_err().is_not_found());
        assert!(e.delete("nope").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn commit_temp_file_renames_into_place() {
        let dir = tempfile::tempdir().unwrap();
        let e = FilesystemEngine::open(dir.path()).await.unwrap();
        let tmp = dir.path().join("scratch.json");
        tokio::fs::write(&tmp, b"{\"a\":1}").await.unwrap();
        assert!(e.commit_temp_file("a/b", &tmp).await.unwrap());
        let (v, _) = e.get("a/b").await.unwrap();
        assert_eq!(v, b"{\"a\":1}");
        assert!(!tmp.exists());
    }

    #[tokio::test]
    async fn overwrite_replaces_value() {
        let dir = tempfile::tempdir().unwrap();
        let e = FilesystemEngine::open(dir.path()).await.unwrap();
        e.put("k", b"v1").await.unwrap();
        e.put("k", b"v2").await.unwrap();
        let (v, _) = e.get("k").await.unwrap();
        assert_eq!(v, b"v2");
    }
}
