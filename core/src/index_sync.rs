//! Remote index replication: pull-on-connect plus periodic push,
//! upsert-by-`(source_device_id, remote_id)` with a strictly monotonic
//! `sync_version`, and tombstones for visibility-private transitions,
//! carried as framed JSON row batches over the same multiplexed stream
//! machinery `file_transfer.rs` uses for bytes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rusqlite::params;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::store::Store;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);
const PUSH_INTERVAL: Duration = Duration::from_secs(30);

/// One replicated row, keyed by its origin device and that device's local
/// file id — never FamilyVault's own autoincrement id, which is only
/// meaningful locally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRow {
    pub remote_id: i64,
    pub folder_name: String,
    pub relative_path: String,
    pub name: String,
    pub extension: Option<String>,
    pub size: i64,
    pub mime_type: Option<String>,
    pub content_type: String,
    pub checksum: Option<String>,
    pub created_at: Option<i64>,
    pub modified_at: Option<i64>,
    pub sync_version: i64,
    /// `None` marks a tombstone: the row was deleted or turned private on
    /// the origin device and must be removed locally.
    pub tombstone: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexRequest {
    pub since_version: i64,
    pub full: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexResponse {
    pub rows: Vec<SyncRow>,
    pub new_cursor: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexNotify {
    pub rows: Vec<SyncRow>,
}

/// Per-device sync state: the high-water `sync_version` cursor FamilyVault
/// has already applied from that remote, and whether a sync is currently
/// in flight (surfaced to the embedder as `is_syncing`).
struct PeerCursor {
    applied_through: i64,
    syncing: bool,
    backoff: Duration,
}

pub struct IndexSync {
    store: Store,
    cursors: parking_lot::RwLock<std::collections::HashMap<String, PeerCursor>>,
    shutdown: Arc<AtomicBool>,
}

impl IndexSync {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            cursors: parking_lot::RwLock::new(std::collections::HashMap::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_syncing(&self, device_id: &str) -> bool {
        self.cursors
            .read()
            .get(device_id)
            .map(|c| c.syncing)
            .unwrap_or(false)
    }

    fn cursor_for(&self, device_id: &str) -> i64 {
        self.cursors
            .read()
            .get(device_id)
            .map(|c| c.applied_through)
            .unwrap_or(0)
    }

    pub fn set_syncing(&self, device_id: &str, syncing: bool) {
        self.cursors
            .write()
            .entry(device_id.to_string())
            .or_insert(PeerCursor {
                applied_through: 0,
                syncing: false,
                backoff: INITIAL_BACKOFF,
            })
            .syncing = syncing;
    }

    /// Builds the request this device sends on connect or on its periodic
    /// push timer: "send me everything you've changed since my cursor."
    pub fn build_request(&self, device_id: &str) -> IndexRequest {
        IndexRequest {
            since_version: self.cursor_for(device_id),
            full: false,
        }
    }

    /// Server side: rows this device owns locally (`is_remote = 0`,
    /// `visibility = 'family'`) with `sync_version` strictly greater than
    /// `since_version`. A row whose visibility flipped to private since
    /// last sync is emitted as a tombstone rather than omitted, so the
    /// peer drops its cached copy instead of keeping a stale one forever.
    pub fn handle_request(&self, req: &IndexRequest) -> Result<IndexResponse> {
        let since = if req.full { 0 } else { req.since_version };
        let rows: Vec<(i64, String, String, String, Option<String>, i64, Option<String>, String, Option<String>, Option<i64>, Option<i64>, i64)> =
            self.store.query(
                "SELECT f.id, fo.name, f.relative_path, f.name, f.extension, f.size, f.mime_type,
                        f.content_type, f.checksum, f.created_at, f.modified_at, f.sync_version
                 FROM files f JOIN folders fo ON fo.id = f.folder_id
                 WHERE f.is_remote = 0 AND f.visibility = 'family' AND f.sync_version > ?1
                 ORDER BY f.sync_version",
                params![since],
                |row| {
                    Ok((
                        row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?,
                        row.get(5)?, row.get(6)?, row.get(7)?, row.get(8)?, row.get(9)?,
                        row.get(10)?, row.get(11)?,
                    ))
                },
            )?;

        let tombstones: Vec<(i64, i64)> = self.store.query(
            "SELECT remote_id, sync_version FROM tombstones WHERE sync_version > ?1 ORDER BY sync_version",
            params![since],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let max_version: i64 = self
            .store
            .query_scalar_opt("SELECT MAX(sync_version) FROM files WHERE is_remote = 0", [])?
            .unwrap_or(0);
        let max_tombstone: i64 = self
            .store
            .query_scalar_opt::<i64>("SELECT MAX(sync_version) FROM tombstones", [])?
            .unwrap_or(0);

        let mut out_rows: Vec<SyncRow> = rows
            .into_iter()
            .map(
                |(id, folder_name, relative_path, name, extension, size, mime_type, content_type, checksum, created_at, modified_at, sync_version)| {
                    SyncRow {
                        remote_id: id,
                        folder_name,
                        relative_path,
                        name,
                        extension,
                        size,
                        mime_type,
                        content_type,
                        checksum,
                        created_at,
                        modified_at,
                        sync_version,
                        tombstone: false,
                    }
                },
            )
            .collect();

        for (remote_id, sync_version) in tombstones {
            out_rows.push(SyncRow {
                remote_id,
                folder_name: String::new(),
                relative_path: String::new(),
                name: String::new(),
                extension: None,
                size: 0,
                mime_type: None,
                content_type: String::new(),
                checksum: None,
                created_at: None,
                modified_at: None,
                sync_version,
                tombstone: true,
            });
        }
        out_rows.sort_by_key(|r| r.sync_version);

        Ok(IndexResponse {
            rows: out_rows,
            new_cursor: max_version.max(max_tombstone),
        })
    }

    /// Client side: applies a batch of rows from `source_device_id`.
    /// Equal-or-lesser `sync_version` than what's already stored for that
    /// `(source_device_id, remote_id)` pair is ignored — replication is
    /// idempotent and unordered-delivery safe.
    pub fn apply_rows(&self, source_device_id: &str, rows: &[SyncRow]) -> Result<u64> {
        let mut applied = 0u64;
        self.store.transaction(|tx| {
            for row in rows {
                let existing: Option<i64> = tx
                    .query_row(
                        "SELECT sync_version FROM files WHERE source_device_id = ?1 AND remote_ref_id = ?2",
                        params![source_device_id, row.remote_id],
                        |r| r.get(0),
                    )
                    .ok();
                if let Some(current) = existing {
                    if row.sync_version <= current {
                        continue;
                    }
                }

                if row.tombstone {
                    tx.execute(
                        "DELETE FROM files WHERE source_device_id = ?1 AND remote_ref_id = ?2",
                        params![source_device_id, row.remote_id],
                    )?;
                    applied += 1;
                    continue;
                }

                let folder_id: i64 = match tx.query_row(
                    "SELECT id FROM folders WHERE name = ?1 AND path = ?2",
                    params![row.folder_name, format!("remote://{source_device_id}/{}", row.folder_name)],
                    |r| r.get(0),
                ) {
                    Ok(id) => id,
                    Err(_) => {
                        tx.execute(
                            "INSERT INTO folders (path, name, default_visibility) VALUES (?1, ?2, 'family')",
                            params![format!("remote://{source_device_id}/{}", row.folder_name), row.folder_name],
                        )?;
                        tx.last_insert_rowid()
                    }
                };

                tx.execute(
                    "INSERT INTO files (folder_id, relative_path, name, extension, size, mime_type,
                        content_type, checksum, created_at, modified_at, indexed_at, visibility,
                        source_device_id, is_remote, sync_version, last_modified_by, remote_ref_id)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, strftime('%s','now'), 'family',
                        ?11, 1, ?12, ?11, ?13)
                     ON CONFLICT(folder_id, relative_path) DO UPDATE SET
                        size = excluded.size,
                        mime_type = excluded.mime_type,
                        content_type = excluded.content_type,
                        checksum = excluded.checksum,
                        modified_at = excluded.modified_at,
                        sync_version = excluded.sync_version,
                        last_modified_by = excluded.last_modified_by",
                    params![
                        folder_id, row.relative_path, row.name, row.extension, row.size,
                        row.mime_type, row.content_type, row.checksum, row.created_at,
                        row.modified_at, source_device_id, row.sync_version, row.remote_id,
                    ],
                )?;
                applied += 1;
            }
            Ok(())
        })?;

        let new_max = rows.iter().map(|r| r.sync_version).max().unwrap_or(0);
        let mut cursors = self.cursors.write();
        let cursor = cursors
            .entry(source_device_id.to_string())
            .or_insert(PeerCursor {
                applied_through: 0,
                syncing: false,
                backoff: INITIAL_BACKOFF,
            });
        cursor.applied_through = cursor.applied_through.max(new_max);

        Ok(applied)
    }

    /// Records that `relative_path`'s visibility flipped away from `family`
    /// (or the row was deleted) so the next sync tells peers to drop it.
    /// Shares `Store::next_sync_version`'s counter with `IndexManager` so
    /// every assigned version is globally unique, not just locally monotonic.
    pub fn record_tombstone(&self, remote_id: i64) -> Result<()> {
        let version = self.store.next_sync_version()?;
        self.store.execute(
            "INSERT INTO tombstones (remote_id, sync_version) VALUES (?1, ?2)",
            params![remote_id, version],
        )?;
        Ok(())
    }

    /// Computed backoff for the next retry after a failed sync attempt
    /// with `device_id`, doubling up to `MAX_BACKOFF`.
    pub fn next_backoff(&self, device_id: &str) -> Duration {
        let mut cursors = self.cursors.write();
        let cursor = cursors
            .entry(device_id.to_string())
            .or_insert(PeerCursor {
                applied_through: 0,
                syncing: false,
                backoff: INITIAL_BACKOFF,
            });
        let current = cursor.backoff;
        cursor.backoff = (cursor.backoff * 2).min(MAX_BACKOFF);
        current
    }

    pub fn reset_backoff(&self, device_id: &str) {
        if let Some(cursor) = self.cursors.write().get_mut(device_id) {
            cursor.backoff = INITIAL_BACKOFF;
        }
    }

    pub fn push_interval(&self) -> Duration {
        PUSH_INTERVAL
    }

    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

impl Drop for IndexSync {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_rows_is_monotonic() {
        let store = Store::open_in_memory().unwrap();
        let sync = IndexSync::new(store);

        let row = SyncRow {
            remote_id: 1,
            folder_name: "shared".into(),
            relative_path: "doc.txt".into(),
            name: "doc.txt".into(),
            extension: Some("txt".into()),
            size: 10,
            mime_type: None,
            content_type: "document".into(),
            checksum: Some("abc".into()),
            created_at: None,
            modified_at: None,
            sync_version: 5,
            tombstone: false,
        };
        let applied = sync.apply_rows("device-a", &[row.clone()]).unwrap();
        assert_eq!(applied, 1);

        let mut stale = row.clone();
        stale.sync_version = 3;
        stale.size = 999;
        let applied_stale = sync.apply_rows("device-a", &[stale]).unwrap();
        assert_eq!(applied_stale, 0);
    }

    #[test]
    fn backoff_doubles_up_to_max() {
        let store = Store::open_in_memory().unwrap();
        let sync = IndexSync::new(store);
        let first = sync.next_backoff("device-a");
        let second = sync.next_backoff("device-a");
        assert_eq!(first, INITIAL_BACKOFF);
        assert_eq!(second, INITIAL_BACKOFF * 2);
    }
}
