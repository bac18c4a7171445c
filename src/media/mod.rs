//! Media temp store: streaming downloads with size caps and orphan cleanup.
//!
//! Outbound URL media is staged through a per-user temp directory. Every
//! download produces a [`DownloadHandle`] whose `release` deletes the file;
//! the handle also deletes on drop, so the file goes away on every exit path.
//! Orphans from crashed runs are swept at provider init.

use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::error::{RelayError, Result};

/// Prefix of all staged download files; the orphan sweep only touches these.
pub const DOWNLOAD_PREFIX: &str = "telegram-dl-";

/// How long an orphan may linger before the sweep removes it.
pub const ORPHAN_TTL: Duration = Duration::from_secs(60 * 60);

/// A staged download on disk. Owned by the send operation that created it.
#[derive(Debug)]
pub struct DownloadHandle {
    path: PathBuf,
    size: u64,
    content_type: Option<String>,
    released: bool,
}

impl DownloadHandle {
    /// Take ownership of an already-written staging file so it is deleted
    /// on release/drop like a streamed download.
    pub fn adopt(path: PathBuf, size: u64) -> Self {
        Self {
            path,
            size,
            content_type: None,
            released: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    /// Delete the staged file. Best-effort; never fails the caller.
    pub fn release(mut self) {
        self.delete();
    }

    fn delete(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("failed to remove temp file {}: {e}", self.path.display());
            }
        }
    }
}

impl Drop for DownloadHandle {
    fn drop(&mut self) {
        self.delete();
    }
}

/// The per-user staging directory for streaming downloads.
#[derive(Debug, Clone)]
pub struct TempStore {
    dir: PathBuf,
}

impl TempStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// The store rooted at the resolved telegram temp directory.
    pub fn for_telegram() -> Self {
        Self::new(crate::config::paths::telegram_temp_dir())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Stream a remote URL to a fresh temp file, enforcing `max_bytes` twice:
    /// before the transfer via a HEAD probe (when the host answers one), and
    /// during the transfer as the cumulative byte count grows. An aborted
    /// transfer leaves no file behind.
    pub async fn download_url(&self, url: &str, max_bytes: u64) -> Result<DownloadHandle> {
        let client = reqwest::Client::new();

        // HEAD probe: reject before any payload moves when the host
        // advertises a size.
        if let Ok(head) = client.head(url).send().await {
            if let Some(len) = head.content_length() {
                if len > max_bytes {
                    return Err(RelayError::RemoteRejected(format!(
                        "remote media is {len} bytes, limit is {max_bytes}"
                    )));
                }
            }
        }

        let response = client
            .get(url)
            .send()
            .await
            .map_err(|e| RelayError::transport_with(format!("GET {url} failed"), e))?;
        if !response.status().is_success() {
            return Err(RelayError::transport(format!(
                "GET {url} returned {}",
                response.status()
            )));
        }
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| RelayError::transport_with("failed to create temp dir", e))?;
        let path = self
            .dir
            .join(format!("{DOWNLOAD_PREFIX}{}.tmp", Uuid::new_v4()));

        let mut file = tokio::fs::File::create(&path)
            .await
            .map_err(|e| RelayError::transport_with("failed to create temp file", e))?;

        let mut stream = response.bytes_stream();
        let mut written: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    drop(file);
                    let _ = tokio::fs::remove_file(&path).await;
                    return Err(RelayError::transport_with("download stream failed", e));
                }
            };
            written += chunk.len() as u64;
            if written > max_bytes {
                drop(file);
                let _ = tokio::fs::remove_file(&path).await;
                return Err(RelayError::RemoteRejected(format!(
                    "download exceeded the {max_bytes}-byte limit"
                )));
            }
            if let Err(e) = file.write_all(&chunk).await {
                drop(file);
                let _ = tokio::fs::remove_file(&path).await;
                return Err(RelayError::transport_with("failed to write temp file", e));
            }
        }
        if let Err(e) = file.flush().await {
            let _ = tokio::fs::remove_file(&path).await;
            return Err(RelayError::transport_with("failed to flush temp file", e));
        }

        tracing::debug!("staged {written} bytes at {}", path.display());
        Ok(DownloadHandle {
            path,
            size: written,
            content_type,
            released: false,
        })
    }

    /// Remove staged files older than `ttl`. Returns how many were deleted.
    pub fn sweep_orphans(&self, ttl: Duration) -> usize {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return 0;
        };
        let now = SystemTime::now();
        let mut removed = 0;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.starts_with(DOWNLOAD_PREFIX) {
                continue;
            }
            let Ok(meta) = entry.metadata() else { continue };
            let age = meta
                .modified()
                .ok()
                .and_then(|m| now.duration_since(m).ok())
                .unwrap_or_default();
            if age >= ttl && std::fs::remove_file(entry.path()).is_ok() {
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!("swept {removed} orphaned download file(s)");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, TempStore) {
        let tmp = tempfile::tempdir().unwrap();
        let store = TempStore::new(tmp.path().to_path_buf());
        (tmp, store)
    }

    #[test]
    fn test_release_removes_file() {
        let (_tmp, store) = store();
        let path = store.dir().join(format!("{DOWNLOAD_PREFIX}x.tmp"));
        std::fs::write(&path, b"data").unwrap();
        let handle = DownloadHandle {
            path: path.clone(),
            size: 4,
            content_type: None,
            released: false,
        };
        handle.release();
        assert!(!path.exists());
    }

    #[test]
    fn test_drop_removes_file() {
        let (_tmp, store) = store();
        let path = store.dir().join(format!("{DOWNLOAD_PREFIX}y.tmp"));
        std::fs::write(&path, b"data").unwrap();
        {
            let _handle = DownloadHandle {
                path: path.clone(),
                size: 4,
                content_type: None,
                released: false,
            };
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_sweep_only_touches_prefixed_files() {
        let (_tmp, store) = store();
        let old = store.dir().join(format!("{DOWNLOAD_PREFIX}old.tmp"));
        let other = store.dir().join("unrelated.bin");
        std::fs::write(&old, b"x").unwrap();
        std::fs::write(&other, b"x").unwrap();

        // Zero TTL makes everything "old enough".
        let removed = store.sweep_orphans(Duration::ZERO);
        assert_eq!(removed, 1);
        assert!(!old.exists());
        assert!(other.exists());
    }

    #[test]
    fn test_sweep_respects_ttl() {
        let (_tmp, store) = store();
        let fresh = store.dir().join(format!("{DOWNLOAD_PREFIX}fresh.tmp"));
        std::fs::write(&fresh, b"x").unwrap();
        let removed = store.sweep_orphans(Duration::from_secs(3600));
        assert_eq!(removed, 0);
        assert!(fresh.exists());
    }

    #[test]
    fn test_sweep_missing_dir_is_noop() {
        let store = TempStore::new(PathBuf::from("/nonexistent/warelay-test"));
        assert_eq!(store.sweep_orphans(Duration::ZERO), 0);
    }
}
