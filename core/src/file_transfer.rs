//! FileTransfer + Cache. A pull protocol: the requesting device asks the
//! file's owning device for it by `file_id` over a dedicated multiplexed
//! QUIC stream, the owner streams it back length-prefixed, and the
//! receiver verifies size (and checksum, when the caller supplied one or
//! the index recorded one) before the bytes become visible in the cache.
//! The integrity check is a `sha2` checksum matching the one `IndexManager`
//! already computes over the same bytes at scan time.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use quinn::{Connection, RecvStream, SendStream};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::{FamilyVaultError, Result};
use crate::store::Store;
use crate::transport::{read_frame, write_frame, write_u8, STREAM_TYPE_FILE};

const CHUNK_SIZE: usize = 256 * 1024;
const MAX_FRAME: usize = 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FileRequest {
    request_id: String,
    file_id: i64,
    expected_size: Option<u64>,
    checksum: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum FileResponseHeader {
    Ok {
        size: u64,
        extension: Option<String>,
        checksum: Option<String>,
    },
    NotFound,
    Error {
        message: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum FileTrailer {
    Complete { checksum: String },
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum FileAck {
    Ack,
    Failed { reason: String },
}

/// Progress of one transfer, keyed by `request_id`.
#[derive(Debug, Clone)]
pub enum TransferProgress {
    Starting { total_size: u64 },
    Progress { bytes_transferred: u64, total_size: u64 },
    Completed { path: PathBuf, total_size: u64 },
    Failed { error: String },
    Cancelled,
}

struct PendingTransfer {
    source_device_id: String,
    cancel: Arc<AtomicBool>,
    transferred: Arc<AtomicU64>,
    total_size: u64,
    last_progress: Mutex<Instant>,
}

/// Content-addressed local cache of files pulled from peers: one
/// subdirectory per source device, one file per `file_id`.
pub struct FileCache {
    root: PathBuf,
}

impl FileCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, device_id: &str, file_id: i64, extension: Option<&str>) -> PathBuf {
        let dir = self.root.join(device_id);
        match extension {
            Some(ext) if !ext.is_empty() => dir.join(format!("{file_id}.{ext}")),
            _ => dir.join(file_id.to_string()),
        }
    }

    /// Returns the cached path if present and intact (size match, and
    /// checksum match when one was supplied).
    pub fn lookup(
        &self,
        device_id: &str,
        file_id: i64,
        extension: Option<&str>,
        expected_size: Option<u64>,
        expected_checksum: Option<&str>,
    ) -> Option<PathBuf> {
        let path = self.path_for(device_id, file_id, extension);
        let metadata = std::fs::metadata(&path).ok()?;
        if let Some(size) = expected_size {
            if metadata.len() != size {
                return None;
            }
        }
        if let Some(checksum) = expected_checksum {
            let bytes = std::fs::read(&path).ok()?;
            let actual = crate::crypto::sha256_hex(&bytes);
            if actual != checksum {
                return None;
            }
        }
        Some(path)
    }

    /// Deletes every cached file across every source device.
    pub fn clear(&self) -> Result<()> {
        if self.root.exists() {
            std::fs::remove_dir_all(&self.root)?;
        }
        Ok(())
    }

    /// Sum of every cached file's size, across all source devices.
    pub fn total_size(&self) -> Result<u64> {
        let mut total = 0u64;
        if !self.root.exists() {
            return Ok(0);
        }
        for entry in walkdir::WalkDir::new(&self.root)
            .into_iter()
            .filter_map(std::result::Result::ok)
        {
            if entry.file_type().is_file() {
                total += entry.metadata().map(|m| m.len()).unwrap_or(0);
            }
        }
        Ok(total)
    }
}

/// Drives both sides of the pull protocol and tracks in-flight transfers.
pub struct FileTransferManager {
    store: Store,
    cache: FileCache,
    pending: Mutex<HashMap<String, PendingTransfer>>,
}

impl FileTransferManager {
    pub fn new(store: Store, cache: FileCache) -> Self {
        Self {
            store,
            cache,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn cache(&self) -> &FileCache {
        &self.cache
    }

    /// Requests `file_id` from `source_device_id` over `connection`. Returns
    /// the local cache path immediately, without opening a stream, if an
    /// intact copy is already cached.
    pub async fn request_file(
        &self,
        connection: &Connection,
        source_device_id: &str,
        file_id: i64,
        expected_size: Option<u64>,
        expected_checksum: Option<String>,
        extension: Option<&str>,
        on_progress: impl Fn(TransferProgress) + Send + Sync + 'static,
    ) -> Result<PathBuf> {
        if let Some(cached) = self.cache.lookup(
            source_device_id,
            file_id,
            extension,
            expected_size,
            expected_checksum.as_deref(),
        ) {
            return Ok(cached);
        }

        let request_id = crate::crypto::uuid_v4();
        let (mut send, mut recv) = connection.open_bi().await.map_err(FamilyVaultError::QuicConnection)?;
        write_u8(&mut send, STREAM_TYPE_FILE).await?;

        let request = FileRequest {
            request_id: request_id.clone(),
            file_id,
            expected_size,
            checksum: expected_checksum.clone(),
        };
        let bytes = serde_json::to_vec(&request)?;
        write_frame(&mut send, &bytes).await?;

        let header_bytes = read_frame(&mut recv, MAX_FRAME).await?;
        let header: FileResponseHeader = serde_json::from_slice(&header_bytes)?;
        let (size, extension, remote_checksum) = match header {
            FileResponseHeader::Ok { size, extension, checksum } => (size, extension, checksum),
            FileResponseHeader::NotFound => {
                return Err(FamilyVaultError::NotFound(format!("file {file_id} on {source_device_id}")))
            }
            FileResponseHeader::Error { message } => return Err(FamilyVaultError::Network(message)),
        };

        let cancel = Arc::new(AtomicBool::new(false));
        let transferred = Arc::new(AtomicU64::new(0));
        self.pending.lock().insert(
            request_id.clone(),
            PendingTransfer {
                source_device_id: source_device_id.to_string(),
                cancel: cancel.clone(),
                transferred: transferred.clone(),
                total_size: size,
                last_progress: Mutex::new(Instant::now()),
            },
        );
        on_progress(TransferProgress::Starting { total_size: size });

        let dest_dir = self
            .cache
            .root
            .join(source_device_id);
        tokio::fs::create_dir_all(&dest_dir).await?;
        let temp_path = dest_dir.join(format!(".{request_id}.part"));
        let mut file = tokio::fs::File::create(&temp_path).await?;
        let mut hasher = Sha256::new();
        let mut received = 0u64;

        let result: Result<()> = async {
            while received < size {
                if cancel.load(Ordering::Relaxed) {
                    return Err(FamilyVaultError::Network("transfer cancelled".into()));
                }
                let chunk = read_frame(&mut recv, CHUNK_SIZE + 16).await?;
                hasher.update(&chunk);
                file.write_all(&chunk).await?;
                received += chunk.len() as u64;
                transferred.store(received, Ordering::Relaxed);
                self.touch_progress(&request_id);
                on_progress(TransferProgress::Progress { bytes_transferred: received, total_size: size });
            }
            file.flush().await?;

            let trailer_bytes = read_frame(&mut recv, MAX_FRAME).await?;
            let trailer: FileTrailer = serde_json::from_slice(&trailer_bytes)?;
            let sender_checksum = match trailer {
                FileTrailer::Complete { checksum } => checksum,
                FileTrailer::Cancelled => return Err(FamilyVaultError::Network("sender cancelled transfer".into())),
            };

            let computed = format!("{:x}", hasher.finalize());
            if computed != sender_checksum {
                return Err(FamilyVaultError::ChecksumMismatch);
            }
            if let Some(expected) = remote_checksum.as_deref() {
                if expected != computed {
                    return Err(FamilyVaultError::ChecksumMismatch);
                }
            }
            Ok(())
        }
        .await;

        self.pending.lock().remove(&request_id);

        match result {
            Ok(()) => {
                let final_path = self.cache.path_for(source_device_id, file_id, extension.as_deref());
                tokio::fs::rename(&temp_path, &final_path).await?;
                write_frame(&mut send, &serde_json::to_vec(&FileAck::Ack)?).await?;
                on_progress(TransferProgress::Completed { path: final_path.clone(), total_size: size });
                Ok(final_path)
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&temp_path).await;
                let ack = FileAck::Failed { reason: e.to_string() };
                if let Ok(bytes) = serde_json::to_vec(&ack) {
                    let _ = write_frame(&mut send, &bytes).await;
                }
                on_progress(TransferProgress::Failed { error: e.to_string() });
                Err(e)
            }
        }
    }

    /// Server side: called once a stream's leading type byte has already
    /// been read as `STREAM_TYPE_FILE` by the caller's dispatch loop.
    pub async fn handle_incoming_stream(&self, mut send: SendStream, mut recv: RecvStream) -> Result<()> {
        let request_bytes = read_frame(&mut recv, MAX_FRAME).await?;
        let request: FileRequest = serde_json::from_slice(&request_bytes)?;

        let row = self.store.query_one(
            "SELECT fo.path, f.relative_path, f.size, f.extension, f.checksum
             FROM files f JOIN folders fo ON fo.id = f.folder_id
             WHERE f.id = ?1",
            rusqlite::params![request.file_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                ))
            },
        )?;

        let Some((folder_path, relative_path, size, extension, checksum)) = row else {
            let header = serde_json::to_vec(&FileResponseHeader::NotFound)?;
            write_frame(&mut send, &header).await?;
            return Ok(());
        };

        let full_path = std::path::Path::new(&folder_path).join(&relative_path);
        let mut file = match tokio::fs::File::open(&full_path).await {
            Ok(f) => f,
            Err(e) => {
                let header = serde_json::to_vec(&FileResponseHeader::Error { message: e.to_string() })?;
                write_frame(&mut send, &header).await?;
                return Ok(());
            }
        };

        let header = FileResponseHeader::Ok {
            size: size as u64,
            extension,
            checksum,
        };
        write_frame(&mut send, &serde_json::to_vec(&header)?).await?;

        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            write_frame(&mut send, &buf[..n]).await?;
        }

        let trailer = FileTrailer::Complete {
            checksum: format!("{:x}", hasher.finalize()),
        };
        write_frame(&mut send, &serde_json::to_vec(&trailer)?).await?;

        let ack_bytes = read_frame(&mut recv, MAX_FRAME).await?;
        let ack: FileAck = serde_json::from_slice(&ack_bytes)?;
        if let FileAck::Failed { reason } = ack {
            tracing::warn!(file_id = request.file_id, reason, "peer reported transfer failure");
        }
        Ok(())
    }

    fn touch_progress(&self, request_id: &str) {
        let pending = self.pending.lock();
        if let Some(p) = pending.get(request_id) {
            *p.last_progress.lock() = Instant::now();
        }
    }

    /// Requests cancellation of an in-flight transfer; the receive loop
    /// notices at its next chunk boundary and tears down the temp file.
    pub fn cancel(&self, request_id: &str) {
        if let Some(pending) = self.pending.lock().get(request_id) {
            pending.cancel.store(true, Ordering::Relaxed);
        }
    }

    /// Cancels every in-flight transfer sourced from `device_id` — called
    /// when a session to that device is torn down by
    /// `NetworkManager::disconnect_device`, which cancels outstanding
    /// transfers on those sessions.
    pub fn cancel_for_device(&self, device_id: &str) -> usize {
        let pending = self.pending.lock();
        let mut count = 0;
        for transfer in pending.values() {
            if transfer.source_device_id == device_id {
                transfer.cancel.store(true, Ordering::Relaxed);
                count += 1;
            }
        }
        count
    }

    pub fn progress(&self, request_id: &str) -> Option<TransferProgress> {
        let pending = self.pending.lock();
        let p = pending.get(request_id)?;
        Some(TransferProgress::Progress {
            bytes_transferred: p.transferred.load(Ordering::Relaxed),
            total_size: p.total_size,
        })
    }

    /// Drops pending-transfer bookkeeping for requests that haven't made
    /// progress in `max_idle` — a vanished peer otherwise leaks an entry
    /// forever since nothing else ever completes or cancels it.
    pub fn sweep_stale(&self, max_idle: Duration) -> usize {
        let mut pending = self.pending.lock();
        let stale: Vec<String> = pending
            .iter()
            .filter(|(_, p)| p.last_progress.lock().elapsed() > max_idle)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            pending.remove(id);
        }
        stale.len()
    }

    pub fn clear_cache(&self) -> Result<()> {
        self.cache.clear()
    }

    pub fn cache_size(&self) -> Result<u64> {
        self.cache.total_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_lookup_respects_size_and_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path());
        let dest = dir.path().join("device-a");
        std::fs::create_dir_all(&dest).unwrap();
        std::fs::write(dest.join("7.txt"), b"hello").unwrap();

        let checksum = crate::crypto::sha256_hex(b"hello");
        assert!(cache
            .lookup("device-a", 7, Some("txt"), Some(5), Some(&checksum))
            .is_some());
        assert!(cache
            .lookup("device-a", 7, Some("txt"), Some(999), None)
            .is_none());
        assert!(cache
            .lookup("device-a", 7, Some("txt"), None, Some("deadbeef"))
            .is_none());
    }

    #[test]
    fn clear_removes_every_device_subdirectory() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path());
        let dest = dir.path().join("device-a");
        std::fs::create_dir_all(&dest).unwrap();
        std::fs::write(dest.join("1"), b"abc").unwrap();
        assert_eq!(cache.total_size().unwrap(), 3);
        cache.clear().unwrap();
        assert_eq!(cache.total_size().unwrap(), 0);
    }

    #[test]
    fn sweep_stale_drops_idle_pending_entries() {
        let store = Store::open_in_memory().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mgr = FileTransferManager::new(store, FileCache::new(dir.path()));
        mgr.pending.lock().insert(
            "req-1".into(),
            PendingTransfer {
                source_device_id: "device-a".into(),
                cancel: Arc::new(AtomicBool::new(false)),
                transferred: Arc::new(AtomicU64::new(0)),
                total_size: 100,
                last_progress: Mutex::new(Instant::now() - Duration::from_secs(3600)),
            },
        );
        let removed = mgr.sweep_stale(Duration::from_secs(60));
        assert_eq!(removed, 1);
        assert!(mgr.pending.lock().is_empty());
    }

    #[test]
    fn cancel_for_device_flags_only_that_devices_transfers() {
        let store = Store::open_in_memory().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mgr = FileTransferManager::new(store, FileCache::new(dir.path()));
        let cancel_a = Arc::new(AtomicBool::new(false));
        let cancel_b = Arc::new(AtomicBool::new(false));
        mgr.pending.lock().insert(
            "req-a".into(),
            PendingTransfer {
                source_device_id: "device-a".into(),
                cancel: cancel_a.clone(),
                transferred: Arc::new(AtomicU64::new(0)),
                total_size: 100,
                last_progress: Mutex::new(Instant::now()),
            },
        );
        mgr.pending.lock().insert(
            "req-b".into(),
            PendingTransfer {
                source_device_id: "device-b".into(),
                cancel: cancel_b.clone(),
                transferred: Arc::new(AtomicU64::new(0)),
                total_size: 100,
                last_progress: Mutex::new(Instant::now()),
            },
        );
        let cancelled = mgr.cancel_for_device("device-a");
        assert_eq!(cancelled, 1);
        assert!(cancel_a.load(Ordering::Relaxed));
        assert!(!cancel_b.load(Ordering::Relaxed));
    }
}
