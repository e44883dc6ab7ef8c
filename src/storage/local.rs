//! Local-filesystem storage provider.
//!
//! Blobs live under a root directory; keys map to relative paths. Writes
//! use the same atomic discipline as the catalog: write to `<path>.tmp`,
//! fsync, rename over the final name, so readers never observe a partial
//! blob.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncWriteExt, BufWriter};

use super::{BlobStat, BoxAsyncRead, Storage};
use crate::error::{BackupError, Result};

pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    // Keys are '/'-separated relative paths. Reject anything that could
    // address outside the root.
    fn blob_path(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() {
            return Err(BackupError::Storage("empty storage key".into()));
        }
        let mut path = self.root.clone();
        for segment in key.split('/') {
            if segment.is_empty()
                || segment == "."
                || segment == ".."
                || segment.contains('\\')
            {
                return Err(BackupError::Storage(format!("invalid storage key {key:?}")));
            }
            path.push(segment);
        }
        Ok(path)
    }

    fn storage_err(context: &str, e: std::io::Error) -> BackupError {
        BackupError::Storage(format!("{context}: {e}"))
    }
}

#[async_trait]
impl Storage for LocalStorage {
    fn provider(&self) -> &str {
        "local"
    }

    async fn put(
        &self,
        key: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        _size_hint: Option<u64>,
    ) -> Result<u64> {
        let path = self.blob_path(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| Self::storage_err("create blob directory", e))?;
        }

        // RAII temp file: an abandoned upload (error or cancellation)
        // cleans itself up on drop.
        let parent = path.parent().unwrap_or(&self.root).to_path_buf();
        let tmp = tempfile::Builder::new()
            .prefix(".put-")
            .suffix(".tmp")
            .tempfile_in(&parent)
            .map_err(|e| Self::storage_err("create blob", e))?;
        let file = tmp
            .reopen()
            .map_err(|e| Self::storage_err("create blob", e))?;
        let mut writer = BufWriter::new(fs::File::from_std(file));

        let written = tokio::io::copy(reader, &mut writer)
            .await
            .map_err(|e| Self::storage_err("write blob", e))?;
        writer
            .flush()
            .await
            .map_err(|e| Self::storage_err("flush blob", e))?;
        writer
            .get_ref()
            .sync_all()
            .await
            .map_err(|e| Self::storage_err("sync blob", e))?;

        tmp.persist(&path)
            .map_err(|e| Self::storage_err("finalize blob", e.error))?;
        Ok(written)
    }

    async fn get(&self, key: &str) -> Result<BoxAsyncRead> {
        let path = self.blob_path(key)?;
        match fs::File::open(&path).await {
            Ok(file) => Ok(Box::pin(file)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BackupError::NotFound(format!("blob {key}")))
            }
            Err(e) => Err(Self::storage_err("open blob", e)),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.blob_path(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(Self::storage_err("delete blob", e)),
        }

        // Prune now-empty key directories back up to the root.
        let mut dir = path.parent().map(Path::to_path_buf);
        while let Some(d) = dir {
            if d == self.root || fs::remove_dir(&d).await.is_err() {
                break;
            }
            dir = d.parent().map(Path::to_path_buf);
        }
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(Self::storage_err("list blobs", e)),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| Self::storage_err("list blobs", e))?
            {
                let path = entry.path();
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| Self::storage_err("list blobs", e))?;
                if file_type.is_dir() {
                    pending.push(path);
                } else if path.extension().map(|e| e != "tmp").unwrap_or(true) {
                    let rel = path
                        .strip_prefix(&self.root)
                        .map_err(|e| BackupError::Storage(format!("list blobs: {e}")))?;
                    let key = rel
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/");
                    if key.starts_with(prefix) {
                        keys.push(key);
                    }
                }
            }
        }

        keys.sort();
        Ok(keys)
    }

    async fn stat(&self, key: &str) -> Result<BlobStat> {
        let path = self.blob_path(key)?;
        match fs::metadata(&path).await {
            Ok(meta) => Ok(BlobStat {
                size: meta.len(),
                etag: None,
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BackupError::NotFound(format!("blob {key}")))
            }
            Err(e) => Err(Self::storage_err("stat blob", e)),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let path = self.blob_path(key)?;
        match fs::metadata(&path).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Self::storage_err("stat blob", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    async fn read_all(mut reader: BoxAsyncRead) -> Vec<u8> {
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());

        let data = b"artifact bytes".to_vec();
        let written = storage
            .put("backup-x/artifact.bin", &mut data.as_slice(), Some(data.len() as u64))
            .await
            .unwrap();
        assert_eq!(written, data.len() as u64);

        let got = read_all(storage.get("backup-x/artifact.bin").await.unwrap()).await;
        assert_eq!(got, data);

        let stat = storage.stat("backup-x/artifact.bin").await.unwrap();
        assert_eq!(stat.size, data.len() as u64);
        assert!(storage.exists("backup-x/artifact.bin").await.unwrap());
    }

    #[tokio::test]
    async fn test_no_tmp_residue_after_put() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());
        storage
            .put("k/blob.bin", &mut &b"data"[..], None)
            .await
            .unwrap();
        assert!(!dir.path().join("k/blob.tmp").exists());
        assert_eq!(storage.list("").await.unwrap(), vec!["k/blob.bin"]);
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());
        match storage.get("nope/blob.bin").await {
            Err(err) => assert_eq!(err.kind(), crate::error::ErrorKind::NotFound),
            Ok(_) => panic!("expected error"),
        }
    }

    #[tokio::test]
    async fn test_delete_is_idempotent_and_prunes() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());
        storage
            .put("backup-y/artifact.bin", &mut &b"x"[..], None)
            .await
            .unwrap();
        storage.delete("backup-y/artifact.bin").await.unwrap();
        assert!(!dir.path().join("backup-y").exists());
        // Second delete is a no-op.
        storage.delete("backup-y/artifact.bin").await.unwrap();
    }

    #[tokio::test]
    async fn test_list_prefix_filter() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());
        storage.put("a/1.bin", &mut &b"1"[..], None).await.unwrap();
        storage.put("a/2.bin", &mut &b"2"[..], None).await.unwrap();
        storage.put("b/3.bin", &mut &b"3"[..], None).await.unwrap();

        assert_eq!(storage.list("a/").await.unwrap(), vec!["a/1.bin", "a/2.bin"]);
        assert_eq!(storage.list("").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_traversal_keys_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());
        for key in ["../escape", "a/../../b", "/abs", "a//b", ""] {
            assert!(storage.get(key).await.is_err(), "{key}");
        }
    }
}
