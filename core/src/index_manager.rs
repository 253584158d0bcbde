//! Watched-folder lifecycle: incremental upsert into the Store,
//! tombstoning of vanished files, and per-folder counters.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rusqlite::params;

use crate::crypto::sha256_hex;
use crate::error::{FamilyVaultError, Result};
use crate::scanner::{ScanFilters, Scanner};
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Private,
    Family,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Private => "private",
            Visibility::Family => "family",
        }
    }

    pub fn parse(s: &str) -> Self {
        if s == "family" {
            Visibility::Family
        } else {
            Visibility::Private
        }
    }
}

/// Effective visibility is the file's own override if set, else its
/// folder's default (the same `COALESCE` the search engine applies) —
/// callers resolve that before calling this.
fn is_family_effective(effective_visibility: Visibility) -> bool {
    effective_visibility == Visibility::Family
}

#[derive(Debug, Clone)]
pub struct Folder {
    pub id: i64,
    pub path: String,
    pub name: String,
    pub enabled: bool,
    pub default_visibility: Visibility,
    pub last_scan_at: Option<i64>,
    pub file_count: i64,
    pub total_size: i64,
}

fn now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

pub struct IndexManager {
    store: Store,
    cancel: Arc<AtomicBool>,
}

impl IndexManager {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Normalizes `path`, requires existence and directoriness, and upserts
    /// by path — a re-`add_folder` of an already-known path keeps its id
    /// and file rows.
    pub fn add_folder(
        &self,
        path: &str,
        name: &str,
        visibility: Visibility,
    ) -> Result<i64> {
        let normalized = std::fs::canonicalize(path)
            .map_err(|_| FamilyVaultError::InvalidArgument(format!("path does not exist: {path}")))?;
        if !normalized.is_dir() {
            return Err(FamilyVaultError::InvalidArgument(format!(
                "not a directory: {path}"
            )));
        }
        let normalized_str = normalized.to_string_lossy().to_string();

        if let Some(id) = self.store.query_scalar_opt::<i64>(
            "SELECT id FROM folders WHERE path = ?1",
            params![normalized_str],
        )? {
            return Ok(id);
        }

        self.store.execute(
            "INSERT INTO folders (path, name, enabled, default_visibility, file_count, total_size)
             VALUES (?1, ?2, 1, ?3, 0, 0)",
            params![normalized_str, name, visibility.as_str()],
        )?;
        Ok(self.store.last_insert_id())
    }

    /// Deletes the folder; cascades remove all its files, tags links and
    /// content rows (`ON DELETE CASCADE` in the schema).
    pub fn remove_folder(&self, id: i64) -> Result<()> {
        let affected = self
            .store
            .execute("DELETE FROM folders WHERE id = ?1", params![id])?;
        if affected == 0 {
            return Err(FamilyVaultError::NotFound(format!("folder {id}")));
        }
        Ok(())
    }

    pub fn get_folder(&self, id: i64) -> Result<Option<Folder>> {
        self.store.query_one(
            "SELECT id, path, name, enabled, default_visibility, last_scan_at, file_count, total_size
             FROM folders WHERE id = ?1",
            params![id],
            row_to_folder,
        )
    }

    pub fn list_folders(&self) -> Result<Vec<Folder>> {
        self.store.query(
            "SELECT id, path, name, enabled, default_visibility, last_scan_at, file_count, total_size
             FROM folders ORDER BY name",
            [],
            row_to_folder,
        )
    }

    /// Runs a scan: records `scan_start`, walks the folder, upserts every
    /// emitted file, then — if not cancelled — deletes rows stale since
    /// `scan_start` (tombstoning) and refreshes folder counters.
    pub fn scan_folder(
        &self,
        id: i64,
        mut on_progress: impl FnMut(u64, u64),
    ) -> Result<u64> {
        let folder = self
            .get_folder(id)?
            .ok_or_else(|| FamilyVaultError::NotFound(format!("folder {id}")))?;
        let scan_start = now();
        self.cancel.store(false, Ordering::Relaxed);

        let scanner = Scanner::new(&folder.path, ScanFilters::default());
        let total = scanner.count_eligible();
        let mut scanned = 0u64;
        let cancel = self.cancel.clone();

        let default_visibility = folder.default_visibility;
        let mut was_cancelled = false;
        scanner.scan(|file| {
            if cancel.load(Ordering::Relaxed) {
                was_cancelled = true;
                return;
            }
            if let Err(e) = self.upsert_scanned_file(&folder.path, folder.id, default_visibility, scan_start, &file) {
                tracing::warn!(error = %e, path = %file.relative_path, "failed to upsert scanned file");
            }
            scanned += 1;
            on_progress(scanned, total);
        })?;

        if !was_cancelled && !cancel.load(Ordering::Relaxed) {
            self.tombstone_vanished(folder.id, scan_start)?;
            self.refresh_folder_counters(folder.id)?;
            self.store.execute(
                "UPDATE folders SET last_scan_at = ?1 WHERE id = ?2",
                params![scan_start, folder.id],
            )?;
        }
        Ok(scanned)
    }

    /// Upserts one scanned entry, (re)computing its checksum only when new or
    /// changed (spec invariant: a checksum never mutates unless `modified_at`
    /// does), and assigning a fresh `sync_version` whenever the row becomes,
    /// or remains, family-effective-visible with new content — the mechanism
    /// `IndexSync` relies on to notice what changed since a peer's cursor.
    fn upsert_scanned_file(
        &self,
        folder_path: &str,
        folder_id: i64,
        default_visibility: Visibility,
        scan_start: i64,
        file: &crate::scanner::ScannedFile,
    ) -> Result<()> {
        let existing = self.store.query_one(
            "SELECT id, modified_at, checksum, visibility FROM files
             WHERE folder_id = ?1 AND relative_path = ?2",
            params![folder_id, file.relative_path],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Option<i64>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                ))
            },
        )?;

        let content_changed = match &existing {
            None => true,
            Some((_, modified_at, _, _)) => *modified_at != file.modified_at,
        };

        let checksum = if content_changed {
            let full_path = std::path::Path::new(folder_path).join(&file.relative_path);
            std::fs::read(&full_path).ok().map(|bytes| sha256_hex(&bytes))
        } else {
            existing.as_ref().and_then(|(_, _, checksum, _)| checksum.clone())
        };

        self.store.execute(
            "INSERT INTO files (folder_id, relative_path, name, extension, size, mime_type,
                content_type, checksum, created_at, modified_at, indexed_at, visibility)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, NULL)
             ON CONFLICT(folder_id, relative_path) DO UPDATE SET
                name = excluded.name,
                extension = excluded.extension,
                size = excluded.size,
                mime_type = excluded.mime_type,
                content_type = excluded.content_type,
                checksum = excluded.checksum,
                modified_at = excluded.modified_at,
                indexed_at = excluded.indexed_at",
            params![
                folder_id,
                file.relative_path,
                file.name,
                file.extension,
                file.size as i64,
                file.mime_type,
                file.content_type.as_str(),
                checksum,
                file.created_at,
                file.modified_at,
                scan_start,
            ],
        )?;

        let file_id = match existing {
            Some((id, _, _, _)) => id,
            None => self.store.last_insert_id(),
        };
        let visibility = existing
            .as_ref()
            .and_then(|(_, _, _, v)| v.clone())
            .map(|v| Visibility::parse(&v))
            .unwrap_or(default_visibility);
        if content_changed && is_family_effective(visibility) {
            self.bump_sync_version(file_id)?;
        }
        Ok(())
    }

    /// Anything not touched by this scan is gone from disk: deleted rows
    /// that were family-effective-visible leave a tombstone behind (keyed by
    /// their own row id, since this device is the tombstone's origin) so
    /// peers that already pulled them learn of the deletion too.
    fn tombstone_vanished(&self, folder_id: i64, scan_start: i64) -> Result<()> {
        let vanished = self.store.query(
            "SELECT f.id, f.visibility, fo.default_visibility
             FROM files f JOIN folders fo ON fo.id = f.folder_id
             WHERE f.folder_id = ?1 AND f.indexed_at < ?2 AND f.is_remote = 0",
            params![folder_id, scan_start],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, String>(2)?,
                ))
            },
        )?;
        for (file_id, visibility, default_visibility) in vanished {
            let visibility = visibility.map(|v| Visibility::parse(&v)).unwrap_or(Visibility::parse(&default_visibility));
            if is_family_effective(visibility) {
                self.record_tombstone(file_id)?;
            }
        }
        self.store.execute(
            "DELETE FROM files WHERE folder_id = ?1 AND indexed_at < ?2 AND is_remote = 0",
            params![folder_id, scan_start],
        )?;
        Ok(())
    }

    fn bump_sync_version(&self, file_id: i64) -> Result<()> {
        let version = self.store.next_sync_version()?;
        self.store.execute(
            "UPDATE files SET sync_version = ?1 WHERE id = ?2",
            params![version, file_id],
        )?;
        Ok(())
    }

    fn record_tombstone(&self, remote_id: i64) -> Result<()> {
        let version = self.store.next_sync_version()?;
        self.store.execute(
            "INSERT INTO tombstones (remote_id, sync_version) VALUES (?1, ?2)",
            params![remote_id, version],
        )?;
        Ok(())
    }

    /// Overrides a file's visibility independent of its folder's default.
    /// Transitioning away from family-effective visibility tombstones the
    /// row so peers that already synced it can remove their copy too —
    /// "private ⇒ never shipped" also covers "private again".
    pub fn set_file_visibility(&self, file_id: i64, visibility: Visibility) -> Result<()> {
        let row = self.store.query_one(
            "SELECT f.visibility, fo.default_visibility
             FROM files f JOIN folders fo ON fo.id = f.folder_id
             WHERE f.id = ?1",
            params![file_id],
            |row| Ok((row.get::<_, Option<String>>(0)?, row.get::<_, String>(1)?)),
        )?;
        let (prev_visibility, default_visibility) =
            row.ok_or_else(|| FamilyVaultError::NotFound(format!("file {file_id}")))?;
        let prev = prev_visibility
            .map(|v| Visibility::parse(&v))
            .unwrap_or_else(|| Visibility::parse(&default_visibility));
        let _ = default_visibility;
        let was_family = is_family_effective(prev);
        let becomes_family = is_family_effective(visibility);

        self.store.execute(
            "UPDATE files SET visibility = ?1 WHERE id = ?2",
            params![visibility.as_str(), file_id],
        )?;

        if becomes_family {
            self.bump_sync_version(file_id)?;
        } else if was_family {
            self.record_tombstone(file_id)?;
        }
        Ok(())
    }

    /// Computes any missing checksum (e.g. rows written before this column
    /// was populated, or restored from a backup). Scanned files already get
    /// one as part of the scan; this is for catching up stragglers.
    pub fn compute_missing_checksums(&self) -> Result<u64> {
        let rows = self.store.query(
            "SELECT f.id, fo.path, f.relative_path
             FROM files f JOIN folders fo ON fo.id = f.folder_id
             WHERE f.checksum IS NULL AND f.is_remote = 0",
            [],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            },
        )?;
        let mut computed = 0u64;
        for (file_id, folder_path, relative_path) in rows {
            let full_path = std::path::Path::new(&folder_path).join(&relative_path);
            let Ok(bytes) = std::fs::read(&full_path) else { continue };
            let checksum = sha256_hex(&bytes);
            self.store.execute(
                "UPDATE files SET checksum = ?1 WHERE id = ?2",
                params![checksum, file_id],
            )?;
            computed += 1;
        }
        Ok(computed)
    }

    pub fn scan_all(&self, mut on_progress: impl FnMut(i64, u64, u64)) -> Result<u64> {
        let mut total_scanned = 0u64;
        for folder in self.list_folders()? {
            if !folder.enabled {
                continue;
            }
            total_scanned +=
                self.scan_folder(folder.id, |scanned, total| on_progress(folder.id, scanned, total))?;
        }
        Ok(total_scanned)
    }

    /// Cooperative; returns immediately, the in-flight scan exits at its
    /// next safe point.
    pub fn stop_scan(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    pub fn delete_file(&self, id: i64, delete_from_disk: bool) -> Result<()> {
        let row = self.store.query_one(
            "SELECT f.relative_path, fo.path, f.folder_id
             FROM files f JOIN folders fo ON fo.id = f.folder_id
             WHERE f.id = ?1",
            params![id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            },
        )?;
        let (relative_path, folder_path, folder_id) = row
            .ok_or_else(|| FamilyVaultError::NotFound(format!("file {id}")))?;

        if delete_from_disk {
            let full_path = std::path::Path::new(&folder_path).join(&relative_path);
            if full_path.exists() {
                std::fs::remove_file(full_path)?;
            }
        }
        self.store.execute("DELETE FROM files WHERE id = ?1", params![id])?;
        self.refresh_folder_counters(folder_id)?;
        Ok(())
    }

    fn refresh_folder_counters(&self, folder_id: i64) -> Result<()> {
        self.store.execute(
            "UPDATE folders SET
                file_count = (SELECT COUNT(*) FROM files WHERE folder_id = ?1),
                total_size = (SELECT COALESCE(SUM(size), 0) FROM files WHERE folder_id = ?1)
             WHERE id = ?1",
            params![folder_id],
        )?;
        Ok(())
    }
}

fn row_to_folder(row: &rusqlite::Row<'_>) -> rusqlite::Result<Folder> {
    let visibility: String = row.get(4)?;
    Ok(Folder {
        id: row.get(0)?,
        path: row.get(1)?,
        name: row.get(2)?,
        enabled: row.get::<_, i64>(3)? != 0,
        default_visibility: Visibility::parse(&visibility),
        last_scan_at: row.get(5)?,
        file_count: row.get(6)?,
        total_size: row.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::sha256_hex;

    fn setup() -> (tempfile::TempDir, IndexManager) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_in_memory().unwrap();
        (dir, IndexManager::new(store))
    }

    #[test]
    fn rescans_are_idempotent() {
        let (dir, mgr) = setup();
        std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        let folder_id = mgr
            .add_folder(dir.path().to_str().unwrap(), "root", Visibility::Private)
            .unwrap();
        mgr.scan_folder(folder_id, |_, _| {}).unwrap();
        let first = mgr.list_folders().unwrap()[0].file_count;
        mgr.scan_folder(folder_id, |_, _| {}).unwrap();
        let second = mgr.list_folders().unwrap()[0].file_count;
        assert_eq!(first, 1);
        assert_eq!(second, 1);
    }

    #[test]
    fn tombstones_deleted_files() {
        let (dir, mgr) = setup();
        std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        std::fs::write(dir.path().join("b.txt"), b"world").unwrap();
        let folder_id = mgr
            .add_folder(dir.path().to_str().unwrap(), "root", Visibility::Private)
            .unwrap();
        mgr.scan_folder(folder_id, |_, _| {}).unwrap();
        std::fs::remove_file(dir.path().join("b.txt")).unwrap();
        mgr.scan_folder(folder_id, |_, _| {}).unwrap();
        let folder = mgr.get_folder(folder_id).unwrap().unwrap();
        assert_eq!(folder.file_count, 1);
    }

    #[test]
    fn scanned_files_get_a_checksum() {
        let (dir, mgr) = setup();
        std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        let folder_id = mgr
            .add_folder(dir.path().to_str().unwrap(), "root", Visibility::Private)
            .unwrap();
        mgr.scan_folder(folder_id, |_, _| {}).unwrap();
        let checksum: Option<String> = mgr
            .store
            .query_scalar("SELECT checksum FROM files LIMIT 1", [])
            .unwrap();
        assert_eq!(checksum.as_deref(), Some(sha256_hex(b"hello")).as_deref());
    }

    #[test]
    fn family_visible_scans_get_sync_versions() {
        let (dir, mgr) = setup();
        std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        let folder_id = mgr
            .add_folder(dir.path().to_str().unwrap(), "root", Visibility::Family)
            .unwrap();
        mgr.scan_folder(folder_id, |_, _| {}).unwrap();
        let version: i64 = mgr
            .store
            .query_scalar("SELECT sync_version FROM files LIMIT 1", [])
            .unwrap();
        assert!(version > 0);
    }

    #[test]
    fn private_scans_keep_sync_version_zero() {
        let (dir, mgr) = setup();
        std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        let folder_id = mgr
            .add_folder(dir.path().to_str().unwrap(), "root", Visibility::Private)
            .unwrap();
        mgr.scan_folder(folder_id, |_, _| {}).unwrap();
        let version: i64 = mgr
            .store
            .query_scalar("SELECT sync_version FROM files LIMIT 1", [])
            .unwrap();
        assert_eq!(version, 0);
    }

    #[test]
    fn unscanned_rescans_do_not_reassign_sync_version() {
        let (dir, mgr) = setup();
        std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        let folder_id = mgr
            .add_folder(dir.path().to_str().unwrap(), "root", Visibility::Family)
            .unwrap();
        mgr.scan_folder(folder_id, |_, _| {}).unwrap();
        let first: i64 = mgr
            .store
            .query_scalar("SELECT sync_version FROM files LIMIT 1", [])
            .unwrap();
        mgr.scan_folder(folder_id, |_, _| {}).unwrap();
        let second: i64 = mgr
            .store
            .query_scalar("SELECT sync_version FROM files LIMIT 1", [])
            .unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn setting_visibility_away_from_family_tombstones() {
        let (dir, mgr) = setup();
        std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        let folder_id = mgr
            .add_folder(dir.path().to_str().unwrap(), "root", Visibility::Family)
            .unwrap();
        mgr.scan_folder(folder_id, |_, _| {}).unwrap();
        let file_id: i64 = mgr.store.query_scalar("SELECT id FROM files LIMIT 1", []).unwrap();
        mgr.set_file_visibility(file_id, Visibility::Private).unwrap();
        let tombstones: i64 = mgr
            .store
            .query_scalar("SELECT COUNT(*) FROM tombstones WHERE remote_id = ?1", params![file_id])
            .unwrap();
        assert_eq!(tombstones, 1);
    }

    #[test]
    fn remove_folder_cascades() {
        let (dir, mgr) = setup();
        std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        let folder_id = mgr
            .add_folder(dir.path().to_str().unwrap(), "root", Visibility::Private)
            .unwrap();
        mgr.scan_folder(folder_id, |_, _| {}).unwrap();
        mgr.remove_folder(folder_id).unwrap();
        let count: i64 = mgr
            .store
            .query_scalar("SELECT COUNT(*) FROM files", [])
            .unwrap();
        assert_eq!(count, 0);
    }
}
