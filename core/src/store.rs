//! Embedded relational store. SQLite via `rusqlite` (bundled), WAL journal
//! mode, foreign keys on, a linear migration sequence recorded in
//! `schema_versions`, and a content-holding FTS5 index keyed by file row
//! id.
//!
//! Open/migrate/transaction follows the batched-DDL-in-a-transaction,
//! `ON CONFLICT … DO UPDATE` upsert shape common to embedded-SQLite stores,
//! run in WAL mode for concurrent readers, and wrapped in the
//! reference-counted handle multiple managers share.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::Connection;

use crate::error::{FamilyVaultError, Result};

/// Linear, numbered migrations. Each is applied once, in order, inside a
/// single transaction, with its index recorded into `schema_versions`.
const MIGRATIONS: &[(&str, &str)] = &[
    (
        "0001_init",
        r#"
        CREATE TABLE schema_versions (
            version     INTEGER NOT NULL PRIMARY KEY,
            name        TEXT NOT NULL,
            applied_at  INTEGER NOT NULL
        );

        CREATE TABLE folders (
            id                  INTEGER PRIMARY KEY AUTOINCREMENT,
            path                TEXT NOT NULL UNIQUE,
            name                TEXT NOT NULL,
            enabled             INTEGER NOT NULL DEFAULT 1,
            default_visibility  TEXT NOT NULL DEFAULT 'private',
            last_scan_at        INTEGER,
            file_count          INTEGER NOT NULL DEFAULT 0,
            total_size          INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE files (
            id                  INTEGER PRIMARY KEY AUTOINCREMENT,
            folder_id           INTEGER NOT NULL REFERENCES folders(id) ON DELETE CASCADE,
            relative_path       TEXT NOT NULL,
            name                TEXT NOT NULL,
            extension           TEXT,
            size                INTEGER NOT NULL,
            mime_type           TEXT,
            content_type        TEXT NOT NULL DEFAULT 'unknown',
            checksum            TEXT,
            created_at          INTEGER,
            modified_at         INTEGER,
            indexed_at          INTEGER NOT NULL,
            visibility          TEXT,
            source_device_id    TEXT,
            is_remote           INTEGER NOT NULL DEFAULT 0,
            sync_version        INTEGER NOT NULL DEFAULT 0,
            last_modified_by    TEXT,
            UNIQUE(folder_id, relative_path)
        );

        CREATE INDEX idx_files_folder ON files(folder_id);
        CREATE INDEX idx_files_checksum ON files(checksum);
        CREATE INDEX idx_files_remote ON files(source_device_id, is_remote);

        CREATE TABLE tags (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            name        TEXT NOT NULL UNIQUE,
            source      TEXT NOT NULL DEFAULT 'user',
            file_count  INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE file_tags (
            file_id     INTEGER NOT NULL REFERENCES files(id) ON DELETE CASCADE,
            tag_id      INTEGER NOT NULL REFERENCES tags(id) ON DELETE CASCADE,
            PRIMARY KEY (file_id, tag_id)
        );

        CREATE TABLE file_content (
            file_id      INTEGER PRIMARY KEY REFERENCES files(id) ON DELETE CASCADE,
            extracted_at INTEGER NOT NULL,
            method       TEXT NOT NULL,
            language     TEXT
        );

        CREATE VIRTUAL TABLE files_fts USING fts5(
            text
        );
        "#,
    ),
    (
        "0002_sync",
        r#"
        ALTER TABLE files ADD COLUMN remote_ref_id INTEGER;

        CREATE TABLE tombstones (
            remote_id    INTEGER NOT NULL,
            sync_version INTEGER NOT NULL
        );

        CREATE INDEX idx_tombstones_version ON tombstones(sync_version);

        CREATE TABLE sync_counter (
            id    INTEGER PRIMARY KEY CHECK (id = 1),
            value INTEGER NOT NULL
        );
        INSERT INTO sync_counter (id, value) VALUES (1, 0);
        "#,
    ),
];

/// A shared, reference-counted handle onto the SQLite connection. `Store`
/// is cheap to `Clone` (an `Arc` bump); every manager that wraps one holds
/// a clone, and `close` refuses while more than one handle is outstanding.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl Store {
    /// Opens (creating if necessary) the database at `path`, enables WAL and
    /// foreign keys, and applies any migration not yet recorded.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(std::time::Duration::from_secs(10))?;

        let store = Store {
            inner: Arc::new(StoreInner {
                conn: Mutex::new(conn),
                path,
            }),
        };
        store.migrate()?;
        Ok(store)
    }

    /// In-memory database, for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let store = Store {
            inner: Arc::new(StoreInner {
                conn: Mutex::new(conn),
                path: PathBuf::from(":memory:"),
            }),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<()> {
        let mut conn = self.inner.conn.lock();
        let applied: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='schema_versions'",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        let already_applied = if applied > 0 {
            conn.query_row("SELECT COUNT(*) FROM schema_versions", [], |row| {
                row.get::<_, i64>(0)
            })?
        } else {
            0
        };

        for (idx, (name, sql)) in MIGRATIONS.iter().enumerate() {
            let version = idx as i64 + 1;
            if version <= already_applied {
                continue;
            }
            let tx = conn.transaction()?;
            tx.execute_batch(sql)?;
            tx.execute(
                "INSERT INTO schema_versions (version, name, applied_at) VALUES (?1, ?2, strftime('%s','now'))",
                rusqlite::params![version, name],
            )?;
            tx.commit()?;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Number of live `Store` handles sharing this connection (this handle
    /// included). Mirrors the refcount the C ABI exposes explicitly.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Consumes this handle; fails with `Busy` if other clones are still
    /// alive (i.e. a manager is still holding the store).
    pub fn close(self) -> Result<()> {
        if Arc::strong_count(&self.inner) > 1 {
            return Err(FamilyVaultError::Busy(
                "store still referenced by live managers".into(),
            ));
        }
        Ok(())
    }

    pub fn execute(&self, sql: &str, params: impl rusqlite::Params) -> Result<usize> {
        Ok(self.inner.conn.lock().execute(sql, params)?)
    }

    /// Hands out the next strictly-increasing sync version: an
    /// atomic read-increment-write against the single-row `sync_counter`
    /// table, inside the same transaction as the caller's row mutation so a
    /// crash never leaves a gap visible to peers.
    pub fn next_sync_version(&self) -> Result<i64> {
        let mut conn = self.inner.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE sync_counter SET value = value + 1 WHERE id = 1",
            [],
        )?;
        let value: i64 = tx.query_row("SELECT value FROM sync_counter WHERE id = 1", [], |row| {
            row.get(0)
        })?;
        tx.commit()?;
        Ok(value)
    }

    pub fn last_insert_id(&self) -> i64 {
        self.inner.conn.lock().last_insert_rowid()
    }

    pub fn changes(&self) -> i64 {
        self.inner.conn.lock().changes() as i64
    }

    pub fn query_scalar<T: rusqlite::types::FromSql>(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<T> {
        Ok(self.inner.conn.lock().query_row(sql, params, |row| row.get(0))?)
    }

    pub fn query_scalar_opt<T: rusqlite::types::FromSql>(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Option<T>> {
        match self.inner.conn.lock().query_row(sql, params, |row| row.get(0)) {
            Ok(v) => Ok(Some(v)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn query_one<T, F>(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
        mapper: F,
    ) -> Result<Option<T>>
    where
        F: FnOnce(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
    {
        match self.inner.conn.lock().query_row(sql, params, mapper) {
            Ok(v) => Ok(Some(v)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn query<T, F>(&self, sql: &str, params: impl rusqlite::Params, mut mapper: F) -> Result<Vec<T>>
    where
        F: FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
    {
        let conn = self.inner.conn.lock();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, |row| mapper(row))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Runs `f` inside a scoped transaction; guaranteed commit on `Ok` and
    /// rollback (by drop) on `Err` — the `Transaction` is released on every
    /// exit path, including an early `?` inside `f`.
    pub fn transaction<R>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> Result<R>,
    ) -> Result<R> {
        let mut conn = self.inner.conn.lock();
        let tx = conn.transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_applies_migrations_once() {
        let store = Store::open_in_memory().unwrap();
        let version: i64 = store
            .query_scalar("SELECT MAX(version) FROM schema_versions", [])
            .unwrap();
        assert_eq!(version, MIGRATIONS.len() as i64);
    }

    #[test]
    fn close_fails_busy_while_referenced() {
        let store = Store::open_in_memory().unwrap();
        let clone = store.clone();
        assert!(matches!(
            store.close(),
            Err(FamilyVaultError::Busy(_))
        ));
        drop(clone);
    }

    #[test]
    fn close_succeeds_once_alone() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.close().is_ok());
    }

    #[test]
    fn next_sync_version_is_monotonic() {
        let store = Store::open_in_memory().unwrap();
        let a = store.next_sync_version().unwrap();
        let b = store.next_sync_version().unwrap();
        let c = store.next_sync_version().unwrap();
        assert_eq!((a, b, c), (1, 2, 3));
    }

    #[test]
    fn transaction_rolls_back_on_error() {
        let store = Store::open_in_memory().unwrap();
        store
            .execute(
                "INSERT INTO folders (path, name, last_scan_at) VALUES ('/a','a', NULL)",
                [],
            )
            .unwrap();
        let result: Result<()> = store.transaction(|tx| {
            tx.execute("INSERT INTO folders (path, name) VALUES ('/b','b')", [])?;
            Err(FamilyVaultError::Internal("boom".into()))
        });
        assert!(result.is_err());
        let count: i64 = store
            .query_scalar("SELECT COUNT(*) FROM folders", [])
            .unwrap();
        assert_eq!(count, 1);
    }
}
