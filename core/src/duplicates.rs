//! Checksum-based duplicate grouping and safe delete.

use rusqlite::params;

use crate::error::{FamilyVaultError, Result};
use crate::index_manager::IndexManager;
use crate::store::Store;

#[derive(Debug, Clone)]
pub struct DuplicateGroup {
    pub checksum: String,
    pub size: i64,
    pub copies: i64,
    pub potential_savings: i64,
    pub file_ids: Vec<i64>,
}

pub struct DuplicateFinder {
    store: Store,
}

impl DuplicateFinder {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Groups local rows by non-null checksum; a group qualifies iff it has
    /// at least two local copies.
    pub fn find_local_duplicates(&self) -> Result<Vec<DuplicateGroup>> {
        let checksums: Vec<(String, i64, i64)> = self.store.query(
            "SELECT checksum, size, COUNT(*) FROM files
             WHERE is_remote = 0 AND checksum IS NOT NULL
             GROUP BY checksum, size HAVING COUNT(*) >= 2",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        let mut groups = Vec::new();
        for (checksum, size, copies) in checksums {
            let file_ids: Vec<i64> = self.store.query(
                "SELECT id FROM files WHERE is_remote = 0 AND checksum = ?1 AND size = ?2",
                params![checksum, size],
                |row| row.get(0),
            )?;
            groups.push(DuplicateGroup {
                potential_savings: size * (copies - 1),
                checksum,
                size,
                copies,
                file_ids,
            });
        }
        Ok(groups)
    }

    /// Local rows whose checksum has no matching row on any remote device.
    pub fn files_without_backup(&self) -> Result<Vec<i64>> {
        self.store.query(
            "SELECT id FROM files f WHERE f.is_remote = 0 AND f.checksum IS NOT NULL
             AND NOT EXISTS (
                SELECT 1 FROM files r WHERE r.is_remote = 1 AND r.checksum = f.checksum
             )",
            [],
            |row| row.get(0),
        )
    }

    /// Deletes every local copy in `file_ids` except `keep_id`, going
    /// through `IndexManager` when provided so folder counters stay
    /// consistent.
    pub fn keep_only_one(
        &self,
        file_ids: &[i64],
        keep_id: i64,
        index_manager: Option<&IndexManager>,
        delete_from_disk: bool,
    ) -> Result<()> {
        if !file_ids.contains(&keep_id) {
            return Err(FamilyVaultError::InvalidArgument(
                "keep_id must be one of file_ids".into(),
            ));
        }
        for &id in file_ids {
            if id == keep_id {
                continue;
            }
            match index_manager {
                Some(mgr) => mgr.delete_file(id, delete_from_disk)?,
                None => {
                    self.store.execute("DELETE FROM files WHERE id = ?1", params![id])?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index_manager::Visibility;

    fn insert_file(store: &Store, folder_id: i64, path: &str, checksum: &str, size: i64) -> i64 {
        store
            .execute(
                "INSERT INTO files (folder_id, relative_path, name, size, checksum, indexed_at)
                 VALUES (?1, ?2, ?2, ?3, ?4, 0)",
                params![folder_id, path, size, checksum],
            )
            .unwrap();
        store.last_insert_id()
    }

    #[test]
    fn finds_duplicate_groups_with_savings() {
        let store = Store::open_in_memory().unwrap();
        let mgr = IndexManager::new(store.clone());
        let dir = tempfile::tempdir().unwrap();
        let folder_id = mgr
            .add_folder(dir.path().to_str().unwrap(), "root", Visibility::Private)
            .unwrap();
        insert_file(&store, folder_id, "a.txt", "deadbeef", 5);
        insert_file(&store, folder_id, "a-copy.txt", "deadbeef", 5);

        let finder = DuplicateFinder::new(store);
        let groups = finder.find_local_duplicates().unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].size, 5);
        assert_eq!(groups[0].copies, 2);
        assert_eq!(groups[0].potential_savings, 5);
    }
}
