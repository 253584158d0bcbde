//! User + auto tagging. Tag addition is idempotent; auto-tags are
//! derived deterministically from content_type, extension, modified date
//! and a size bucket.

use rusqlite::params;

use crate::error::Result;
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagSource {
    User,
    Auto,
    Ai,
}

impl TagSource {
    fn as_str(&self) -> &'static str {
        match self {
            TagSource::User => "user",
            TagSource::Auto => "auto",
            TagSource::Ai => "ai",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Tag {
    pub id: i64,
    pub name: String,
    pub source: String,
    pub file_count: i64,
}

pub struct TagManager {
    store: Store,
}

impl TagManager {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Idempotent: `add_tag` twice equals `add_tag` once.
    pub fn add_tag(&self, file_id: i64, name: &str, source: TagSource) -> Result<i64> {
        self.store.execute(
            "INSERT INTO tags (name, source, file_count) VALUES (?1, ?2, 0)
             ON CONFLICT(name) DO NOTHING",
            params![name, source.as_str()],
        )?;
        let tag_id: i64 =
            self.store
                .query_scalar("SELECT id FROM tags WHERE name = ?1", params![name])?;
        let inserted = self.store.execute(
            "INSERT OR IGNORE INTO file_tags (file_id, tag_id) VALUES (?1, ?2)",
            params![file_id, tag_id],
        )?;
        if inserted > 0 {
            self.store.execute(
                "UPDATE tags SET file_count = file_count + 1 WHERE id = ?1",
                params![tag_id],
            )?;
        }
        Ok(tag_id)
    }

    pub fn remove_tag(&self, file_id: i64, name: &str) -> Result<()> {
        let tag_id: Option<i64> = self
            .store
            .query_scalar_opt("SELECT id FROM tags WHERE name = ?1", params![name])?;
        let Some(tag_id) = tag_id else { return Ok(()) };
        let removed = self.store.execute(
            "DELETE FROM file_tags WHERE file_id = ?1 AND tag_id = ?2",
            params![file_id, tag_id],
        )?;
        if removed > 0 {
            self.store.execute(
                "UPDATE tags SET file_count = MAX(file_count - 1, 0) WHERE id = ?1",
                params![tag_id],
            )?;
        }
        Ok(())
    }

    pub fn tags_for_file(&self, file_id: i64) -> Result<Vec<Tag>> {
        self.store.query(
            "SELECT t.id, t.name, t.source, t.file_count FROM tags t
             JOIN file_tags ft ON ft.tag_id = t.id WHERE ft.file_id = ?1 ORDER BY t.name",
            params![file_id],
            row_to_tag,
        )
    }

    pub fn list_tags(&self) -> Result<Vec<Tag>> {
        self.store
            .query("SELECT id, name, source, file_count FROM tags ORDER BY name", [], row_to_tag)
    }

    /// Derives and applies auto-tags for a file based on its content_type,
    /// extension, modified date (year / month / season) and size bucket.
    pub fn auto_tag(&self, file_id: i64) -> Result<()> {
        let row = self.store.query_one(
            "SELECT content_type, extension, modified_at, size FROM files WHERE id = ?1",
            params![file_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, Option<i64>>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            },
        )?;
        let Some((content_type, extension, modified_at, size)) = row else {
            return Ok(());
        };

        self.add_tag(file_id, &content_type, TagSource::Auto)?;
        if let Some(ext) = extension {
            self.add_tag(file_id, &format!("ext:{ext}"), TagSource::Auto)?;
        }
        if let Some(ts) = modified_at {
            if let Some((year, season)) = year_and_season(ts) {
                self.add_tag(file_id, &format!("year:{year}"), TagSource::Auto)?;
                self.add_tag(file_id, &format!("season:{season}"), TagSource::Auto)?;
            }
        }
        self.add_tag(file_id, size_bucket(size), TagSource::Auto)?;
        Ok(())
    }
}

fn row_to_tag(row: &rusqlite::Row<'_>) -> rusqlite::Result<Tag> {
    Ok(Tag {
        id: row.get(0)?,
        name: row.get(1)?,
        source: row.get(2)?,
        file_count: row.get(3)?,
    })
}

fn year_and_season(unix_ts: i64) -> Option<(i32, &'static str)> {
    const SECS_PER_DAY: i64 = 86_400;
    let days_since_epoch = unix_ts.div_euclid(SECS_PER_DAY);
    // Civil-from-days (Howard Hinnant's algorithm), good enough for a tag,
    // avoids pulling in a date/time crate for one calculation.
    let z = days_since_epoch + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as i64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = if month <= 2 { y + 1 } else { y };

    let season = match month {
        12 | 1 | 2 => "winter",
        3 | 4 | 5 => "spring",
        6 | 7 | 8 => "summer",
        _ => "autumn",
    };
    Some((year as i32, season))
}

fn size_bucket(size: i64) -> &'static str {
    const KB: i64 = 1024;
    const MB: i64 = 1024 * KB;
    match size {
        s if s < 100 * KB => "size:tiny",
        s if s < 10 * MB => "size:small",
        s if s < 100 * MB => "size:medium",
        _ => "size:large",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_tag_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        store
            .execute(
                "INSERT INTO folders (path, name) VALUES ('/x','x')",
                [],
            )
            .unwrap();
        store
            .execute(
                "INSERT INTO files (folder_id, relative_path, name, size, indexed_at) VALUES (1,'a','a',1,0)",
                [],
            )
            .unwrap();
        let mgr = TagManager::new(store.clone());
        mgr.add_tag(1, "vacation", TagSource::User).unwrap();
        mgr.add_tag(1, "vacation", TagSource::User).unwrap();
        let tags = mgr.tags_for_file(1).unwrap();
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].file_count, 1);
    }
}
