//! Composes FTS + structured filters into a single query. The SQL is
//! always assembled from fragments with bound parameters — never
//! string-interpolated — the same discipline `Store` holds everywhere
//! else.

use rusqlite::types::Value as SqlValue;

use crate::error::Result;
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortField {
    Relevance,
    Name,
    Date,
    Size,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Default)]
pub struct SearchQuery {
    pub text: Option<String>,
    pub content_type: Option<String>,
    pub extension: Option<String>,
    pub folder_id: Option<i64>,
    pub modified_after: Option<i64>,
    pub modified_before: Option<i64>,
    pub size_min: Option<i64>,
    pub size_max: Option<i64>,
    pub require_tags: Vec<String>,
    pub exclude_tags: Vec<String>,
    pub visibility: Option<String>,
    pub include_remote: bool,
    pub sort: Option<(SortField, SortDirection)>,
    pub limit: i64,
    pub offset: i64,
}

impl SearchQuery {
    pub fn new(limit: i64) -> Self {
        Self {
            limit,
            include_remote: false,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchResult {
    pub file_id: i64,
    pub name: String,
    pub relative_path: String,
    pub folder_id: i64,
    pub size: i64,
    pub content_type: String,
    pub snippet: Option<String>,
}

/// Escapes FTS5 metacharacters (`"`, by quoting each token) so arbitrary
/// user text can never be interpreted as FTS query syntax.
fn escape_fts(text: &str) -> String {
    text.split_whitespace()
        .map(|token| format!("\"{}\"", token.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" ")
}

struct QueryBuilder {
    select: String,
    joins: Vec<String>,
    conditions: Vec<String>,
    params: Vec<SqlValue>,
    order_by: String,
    limit_offset: String,
}

pub struct SearchEngine {
    store: Store,
}

impl SearchEngine {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    fn build(&self, query: &SearchQuery, count_only: bool) -> QueryBuilder {
        let mut joins = Vec::new();
        let mut conditions = vec!["1=1".to_string()];
        let mut params: Vec<SqlValue> = Vec::new();

        if !query.include_remote {
            conditions.push("f.is_remote = 0".to_string());
        }
        if let Some(ct) = &query.content_type {
            conditions.push("f.content_type = ?".to_string());
            params.push(ct.clone().into());
        }
        if let Some(ext) = &query.extension {
            conditions.push("f.extension = ?".to_string());
            params.push(ext.clone().into());
        }
        if let Some(folder_id) = query.folder_id {
            conditions.push("f.folder_id = ?".to_string());
            params.push(folder_id.into());
        }
        if let Some(after) = query.modified_after {
            conditions.push("f.modified_at >= ?".to_string());
            params.push(after.into());
        }
        if let Some(before) = query.modified_before {
            conditions.push("f.modified_at <= ?".to_string());
            params.push(before.into());
        }
        if let Some(min) = query.size_min {
            conditions.push("f.size >= ?".to_string());
            params.push(min.into());
        }
        if let Some(max) = query.size_max {
            conditions.push("f.size <= ?".to_string());
            params.push(max.into());
        }
        // visibility: explicit per-file flag, falling back to folder default.
        if let Some(v) = &query.visibility {
            conditions.push("COALESCE(f.visibility, fo.default_visibility) = ?".to_string());
            params.push(v.clone().into());
        }

        joins.push("JOIN folders fo ON fo.id = f.folder_id".to_string());

        let mut has_fts = false;
        if let Some(text) = &query.text {
            let escaped = escape_fts(text);
            if !escaped.is_empty() {
                joins.push(
                    "JOIN files_fts ft ON ft.rowid = f.id".to_string(),
                );
                conditions.push("files_fts MATCH ?".to_string());
                params.push(escaped.into());
                has_fts = true;
            }
        }

        for (i, tag) in query.require_tags.iter().enumerate() {
            let alias = format!("rt{i}");
            joins.push(format!(
                "JOIN file_tags {alias} ON {alias}.file_id = f.id JOIN tags {alias}t ON {alias}t.id = {alias}.tag_id AND {alias}t.name = ?"
            ));
            params.push(tag.clone().into());
        }
        if !query.exclude_tags.is_empty() {
            let placeholders = query.exclude_tags.iter().map(|_| "?").collect::<Vec<_>>().join(",");
            conditions.push(format!(
                "f.id NOT IN (SELECT ft2.file_id FROM file_tags ft2 JOIN tags t2 ON t2.id = ft2.tag_id WHERE t2.name IN ({placeholders}))"
            ));
            for tag in &query.exclude_tags {
                params.push(tag.clone().into());
            }
        }

        let select = if count_only {
            "SELECT COUNT(DISTINCT f.id)".to_string()
        } else if has_fts {
            "SELECT DISTINCT f.id, f.name, f.relative_path, f.folder_id, f.size, f.content_type, snippet(files_fts, 0, '[', ']', '...', 8)".to_string()
        } else {
            "SELECT DISTINCT f.id, f.name, f.relative_path, f.folder_id, f.size, f.content_type, NULL".to_string()
        };

        let order_by = if count_only {
            String::new()
        } else {
            match query.sort {
                Some((SortField::Relevance, dir)) if has_fts => {
                    format!("ORDER BY rank {}", dir_sql(dir))
                }
                Some((SortField::Name, dir)) => format!("ORDER BY f.name {}", dir_sql(dir)),
                Some((SortField::Date, dir)) => format!("ORDER BY f.modified_at {}", dir_sql(dir)),
                Some((SortField::Size, dir)) => format!("ORDER BY f.size {}", dir_sql(dir)),
                _ if has_fts => "ORDER BY rank".to_string(),
                _ => "ORDER BY f.name ASC".to_string(),
            }
        };

        let limit_offset = if count_only {
            String::new()
        } else {
            format!("LIMIT {} OFFSET {}", query.limit.max(0), query.offset.max(0))
        };

        QueryBuilder {
            select,
            joins,
            conditions,
            params,
            order_by,
            limit_offset,
        }
    }

    fn assemble(&self, qb: &QueryBuilder) -> String {
        format!(
            "{} FROM files f {} WHERE {} {} {}",
            qb.select,
            qb.joins.join(" "),
            qb.conditions.join(" AND "),
            qb.order_by,
            qb.limit_offset
        )
    }

    pub fn search(&self, query: &SearchQuery) -> Result<Vec<SearchResult>> {
        let qb = self.build(query, false);
        let sql = self.assemble(&qb);
        let params = rusqlite::params_from_iter(qb.params.iter());
        self.store.query(&sql, params, |row| {
            Ok(SearchResult {
                file_id: row.get(0)?,
                name: row.get(1)?,
                relative_path: row.get(2)?,
                folder_id: row.get(3)?,
                size: row.get(4)?,
                content_type: row.get(5)?,
                snippet: row.get(6)?,
            })
        })
    }

    pub fn count_results(&self, query: &SearchQuery) -> Result<i64> {
        let qb = self.build(query, true);
        let sql = self.assemble(&qb);
        let params = rusqlite::params_from_iter(qb.params.iter());
        self.store.query_scalar(&sql, params)
    }

    /// Distinct recent tokens (tag names or filenames) matching `prefix`.
    pub fn suggest(&self, prefix: &str, limit: i64) -> Result<Vec<String>> {
        let like = format!("{prefix}%");
        let mut results = self.store.query(
            "SELECT DISTINCT name FROM tags WHERE name LIKE ?1 LIMIT ?2",
            rusqlite::params![like, limit],
            |row| row.get::<_, String>(0),
        )?;
        if (results.len() as i64) < limit {
            let remaining = limit - results.len() as i64;
            let mut names = self.store.query(
                "SELECT DISTINCT name FROM files WHERE is_remote = 0 AND name LIKE ?1
                 ORDER BY indexed_at DESC LIMIT ?2",
                rusqlite::params![like, remaining],
                |row| row.get::<_, String>(0),
            )?;
            results.append(&mut names);
        }
        Ok(results)
    }
}

fn dir_sql(dir: SortDirection) -> &'static str {
    match dir {
        SortDirection::Asc => "ASC",
        SortDirection::Desc => "DESC",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index_manager::{IndexManager, Visibility};

    fn setup_with_files() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        std::fs::write(dir.path().join("b.txt"), b"world").unwrap();
        let store = Store::open_in_memory().unwrap();
        let mgr = IndexManager::new(store.clone());
        let folder_id = mgr
            .add_folder(dir.path().to_str().unwrap(), "root", Visibility::Private)
            .unwrap();
        mgr.scan_folder(folder_id, |_, _| {}).unwrap();
        let ids: Vec<i64> = store.query("SELECT id FROM files", [], |r| r.get(0)).unwrap();
        for id in ids {
            let name: String = store
                .query_scalar("SELECT name FROM files WHERE id = ?1", rusqlite::params![id])
                .unwrap();
            let text = if name == "a.txt" { "hello" } else { "world" };
            store
                .execute(
                    "INSERT INTO files_fts (rowid, text) VALUES (?1, ?2)",
                    rusqlite::params![id, text],
                )
                .unwrap();
        }
        (dir, store)
    }

    #[test]
    fn text_search_finds_matching_file() {
        let (_dir, store) = setup_with_files();
        let engine = SearchEngine::new(store);
        let mut query = SearchQuery::new(10);
        query.text = Some("hello".to_string());
        let results = engine.search(&query).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].name, "a.txt");
        assert!(results[0].snippet.as_deref().unwrap_or("").contains("hello"));
    }

    #[test]
    fn remote_rows_excluded_by_default() {
        let (_dir, store) = setup_with_files();
        store
            .execute(
                "INSERT INTO files (folder_id, relative_path, name, size, indexed_at, is_remote, source_device_id, visibility)
                 VALUES (1, 'remote.txt', 'remote.txt', 10, 0, 1, 'dev-b', 'family')",
                [],
            )
            .unwrap();
        let engine = SearchEngine::new(store);
        let query = SearchQuery::new(10);
        let results = engine.search(&query).unwrap();
        assert!(results.iter().all(|r| r.name != "remote.txt"));
    }
}
