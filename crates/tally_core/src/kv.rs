//! Key-value storage primitives for the local backend.
//!
//! [`KvStore`] is the narrow seam the local backend writes through: string
//! keys, string values, batch variants so a whole flush lands in one read
//! pass and one write pass. [`DirKv`] is the shipping implementation, one
//! file per key under a root directory.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::{Result, TallyError};

/// Async string key-value store.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Read one key. `Ok(None)` when absent.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write one key.
    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Remove one key. Removing an absent key is not an error.
    async fn remove(&self, key: &str) -> Result<()>;

    /// Read a batch of keys, preserving order. Absent keys yield `None`.
    async fn multi_get(&self, keys: &[String]) -> Result<Vec<(String, Option<String>)>> {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            out.push((key.clone(), self.get(key).await?));
        }
        Ok(out)
    }

    /// Write a batch of pairs.
    async fn multi_set(&self, pairs: &[(String, String)]) -> Result<()> {
        for (key, value) in pairs {
            self.set(key, value).await?;
        }
        Ok(())
    }

    /// Remove a batch of keys.
    async fn multi_remove(&self, keys: &[String]) -> Result<()> {
        for key in keys {
            self.remove(key).await?;
        }
        Ok(())
    }
}

/// File-per-key store under a root directory.
///
/// Keys contain `:` and `/` separators, so each key is escaped into a single
/// flat file name; no directory hierarchy is created per key.
#[derive(Debug, Clone)]
pub struct DirKv {
    root: PathBuf,
}

impl DirKv {
    /// Store keys under `root`. The directory is created on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        DirKv { root: root.into() }
    }

    /// Root directory of this store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(escape_key(key))
    }
}

/// Escape a key into a file name: alphanumerics, `.`, `_` and `-` pass
/// through, every other byte becomes `%XX`.
fn escape_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'.' | b'_' | b'-' => {
                out.push(byte as char);
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[async_trait]
impl KvStore for DirKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        match tokio::fs::read_to_string(self.path_for(key)).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(TallyError::KvRead {
                key: key.to_string(),
                source: e,
            }),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let write_err = |e| TallyError::KvWrite {
            key: key.to_string(),
            source: e,
        };
        tokio::fs::create_dir_all(&self.root).await.map_err(write_err)?;
        tokio::fs::write(self.path_for(key), value)
            .await
            .map_err(write_err)
    }

    async fn remove(&self, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(TallyError::KvWrite {
                key: key.to_string(),
                source: e,
            }),
        }
    }
}
