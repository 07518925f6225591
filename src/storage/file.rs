// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Directory-backed fallback tier.
//!
//! One file per key, named by the hex encoding of the key so that any
//! `collection:id` string is a safe file name. Writes go to a temporary
//! file first and are renamed into place, so a crash never leaves a
//! half-written value behind.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::debug;

use super::traits::{FallbackStore, StorageError};

const VALUE_EXT: &str = "val";
const TEMP_EXT: &str = "tmp";

pub struct FileFallback {
    dir: PathBuf,
}

impl FileFallback {
    /// Open (creating if needed) a fallback directory.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).await.map_err(io_err)?;
        debug!(dir = %dir.display(), "Fallback directory ready");
        Ok(Self { dir })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", hex::encode(key.as_bytes()), VALUE_EXT))
    }
}

fn io_err(e: std::io::Error) -> StorageError {
    StorageError::Backend(format!("fallback io: {}", e))
}

#[async_trait]
impl FallbackStore for FileFallback {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        match fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_err(e)),
        }
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let path = self.path_for(key);
        let temp = path.with_extension(TEMP_EXT);
        fs::write(&temp, value).await.map_err(io_err)?;
        fs::rename(&temp, &path).await.map_err(io_err)
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        match fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(e)),
        }
    }

    async fn keys(&self) -> Result<Vec<String>, StorageError> {
        let mut entries = fs::read_dir(&self.dir).await.map_err(io_err)?;
        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(VALUE_EXT) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if let Some(key) = hex::decode(stem).ok().and_then(|b| String::from_utf8(b).ok()) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_put_get_remove() {
        let dir = tempdir().unwrap();
        let store = FileFallback::open(dir.path()).await.unwrap();

        store.put("orders:o1", b"{\"a\":1}").await.unwrap();
        assert_eq!(store.get("orders:o1").await.unwrap().unwrap(), b"{\"a\":1}");
        assert!(store.get("orders:o2").await.unwrap().is_none());

        store.remove("orders:o1").await.unwrap();
        assert!(store.get("orders:o1").await.unwrap().is_none());
        assert!(store.remove("orders:o1").await.is_ok());
    }

    #[tokio::test]
    async fn test_keys_survive_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = FileFallback::open(dir.path()).await.unwrap();
            store.put("users:a/b", b"1").await.unwrap();
            store.put("orders:o1", b"2").await.unwrap();
        }
        let reopened = FileFallback::open(dir.path()).await.unwrap();
        assert_eq!(reopened.keys().await.unwrap(), vec!["orders:o1", "users:a/b"]);
        assert!(reopened.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_overwrite_replaces_value() {
        let dir = tempdir().unwrap();
        let store = FileFallback::open(dir.path()).await.unwrap();
        store.put("k", b"old").await.unwrap();
        store.put("k", b"new").await.unwrap();
        assert_eq!(store.get("k").await.unwrap().unwrap(), b"new");
        assert_eq!(store.keys().await.unwrap().len(), 1);
    }
}
