//! ContentExtractor registry + background worker. A registry of pluggable
//! extractors, implemented as a trait + registry rather than an inheritance
//! chain, feeds a single background worker thread that drains file ids and
//! writes into the content-holding FTS index (`store.rs`).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use rusqlite::params;

use crate::error::Result;
use crate::store::Store;

/// One extracted-text result.
pub struct Extraction {
    pub text: String,
    pub method: String,
    pub language: Option<String>,
    pub confidence: f32,
}

pub trait TextExtractor: Send + Sync {
    fn name(&self) -> &'static str;
    fn can_handle(&self, mime: &str) -> bool;
    /// Higher wins when more than one extractor can handle a MIME type.
    fn priority(&self) -> i32;
    fn extract(&self, path: &std::path::Path) -> Option<Extraction>;
}

/// Reference `TextExtractor`: handles `text/*` by reading the file as
/// UTF-8 (lossily) up to a cap. Production parsers for PDF/office formats
/// plug into the same registry from outside this crate.
pub struct PlainTextExtractor {
    pub max_bytes: usize,
}

impl Default for PlainTextExtractor {
    fn default() -> Self {
        Self { max_bytes: 512 * 1024 }
    }
}

impl TextExtractor for PlainTextExtractor {
    fn name(&self) -> &'static str {
        "plain_text"
    }

    fn can_handle(&self, mime: &str) -> bool {
        mime.starts_with("text/")
    }

    fn priority(&self) -> i32 {
        10
    }

    fn extract(&self, path: &std::path::Path) -> Option<Extraction> {
        let bytes = std::fs::read(path).ok()?;
        let slice = &bytes[..bytes.len().min(self.max_bytes)];
        let text = String::from_utf8_lossy(slice).to_string();
        Some(Extraction {
            text,
            method: self.name().to_string(),
            language: None,
            confidence: 1.0,
        })
    }
}

#[derive(Default)]
pub struct ExtractorRegistry {
    extractors: Vec<Arc<dyn TextExtractor>>,
}

impl ExtractorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, extractor: Arc<dyn TextExtractor>) {
        self.extractors.push(extractor);
    }

    /// Picks the highest-priority matching extractor.
    pub fn find(&self, mime: &str) -> Option<Arc<dyn TextExtractor>> {
        self.extractors
            .iter()
            .filter(|e| e.can_handle(mime))
            .max_by_key(|e| e.priority())
            .cloned()
    }
}

struct WorkerState {
    queue: Mutex<VecDeque<i64>>,
    cond: Condvar,
    stop: AtomicBool,
}

/// A background single-worker queue draining file ids: for each it loads
/// (path, mime, size), runs extraction, persists a `file_content` row and
/// the FTS text, truncated to `max_text_kb`. Unsupported types are recorded
/// with `method = "unsupported"` so they are not retried.
pub struct ContentExtractor {
    store: Store,
    registry: Arc<ExtractorRegistry>,
    state: Arc<WorkerState>,
    handle: Mutex<Option<JoinHandle<()>>>,
    max_text_kb: usize,
}

impl ContentExtractor {
    pub fn new(store: Store, registry: ExtractorRegistry, max_text_kb: usize) -> Self {
        Self {
            store,
            registry: Arc::new(registry),
            state: Arc::new(WorkerState {
                queue: Mutex::new(VecDeque::new()),
                cond: Condvar::new(),
                stop: AtomicBool::new(false),
            }),
            handle: Mutex::new(None),
            max_text_kb,
        }
    }

    pub fn enqueue(&self, file_id: i64) {
        let mut q = self.state.queue.lock().unwrap();
        q.push_back(file_id);
        self.state.cond.notify_one();
    }

    /// Enqueues every file whose `modified_at` is newer than its
    /// `extracted_at` (or that has never been extracted).
    pub fn enqueue_stale(&self) -> Result<u64> {
        let ids: Vec<i64> = self.store.query(
            "SELECT f.id FROM files f
             LEFT JOIN file_content c ON c.file_id = f.id
             WHERE f.is_remote = 0 AND (c.file_id IS NULL OR f.modified_at > c.extracted_at)",
            [],
            |row| row.get(0),
        )?;
        let n = ids.len() as u64;
        for id in ids {
            self.enqueue(id);
        }
        Ok(n)
    }

    pub fn start(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("content-extractor".into())
            .spawn(move || this.worker_loop())
            .expect("failed to spawn content-extractor thread");
        *self.handle.lock().unwrap() = Some(handle);
    }

    fn worker_loop(&self) {
        loop {
            let file_id = {
                let mut q = self.state.queue.lock().unwrap();
                loop {
                    if self.state.stop.load(Ordering::Relaxed) {
                        return;
                    }
                    if let Some(id) = q.pop_front() {
                        break Some(id);
                    }
                    q = self.state.cond.wait(q).unwrap();
                }
            };
            if let Some(id) = file_id {
                if let Err(e) = self.extract_one(id) {
                    tracing::warn!(error = %e, file_id = id, "content extraction failed");
                }
            }
            if self.state.stop.load(Ordering::Relaxed) {
                return;
            }
        }
    }

    fn extract_one(&self, file_id: i64) -> Result<()> {
        let row = self.store.query_one(
            "SELECT f.relative_path, fo.path, f.mime_type FROM files f
             JOIN folders fo ON fo.id = f.folder_id WHERE f.id = ?1",
            params![file_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            },
        )?;
        let Some((relative_path, folder_path, mime_type)) = row else {
            return Ok(());
        };
        let mime = mime_type.unwrap_or_else(|| "application/octet-stream".to_string());
        let full_path = std::path::Path::new(&folder_path).join(&relative_path);

        let extraction = self.registry.find(&mime).and_then(|e| e.extract(&full_path));
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;

        let (text, method, language) = match extraction {
            Some(e) => {
                let cap = self.max_text_kb * 1024;
                let truncated = if e.text.len() > cap {
                    e.text.chars().take(cap).collect()
                } else {
                    e.text
                };
                (truncated, e.method, e.language)
            }
            None => (String::new(), "unsupported".to_string(), None),
        };

        self.store.transaction(|tx| {
            tx.execute(
                "INSERT INTO file_content (file_id, extracted_at, method, language)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(file_id) DO UPDATE SET extracted_at = excluded.extracted_at,
                    method = excluded.method, language = excluded.language",
                params![file_id, now, method, language],
            )?;
            tx.execute("DELETE FROM files_fts WHERE rowid = ?1", params![file_id])?;
            if !text.is_empty() {
                tx.execute(
                    "INSERT INTO files_fts (rowid, text) VALUES (?1, ?2)",
                    params![file_id, text],
                )?;
            }
            Ok(())
        })
    }

    /// Cooperative; `wait = true` joins the worker thread.
    pub fn stop(&self, wait: bool) {
        self.state.stop.store(true, Ordering::Relaxed);
        self.state.cond.notify_all();
        if wait {
            if let Some(handle) = self.handle.lock().unwrap().take() {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index_manager::{IndexManager, Visibility};

    #[test]
    fn extracts_plain_text_into_fts() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hello world").unwrap();
        let store = Store::open_in_memory().unwrap();
        let mgr = IndexManager::new(store.clone());
        let folder_id = mgr
            .add_folder(dir.path().to_str().unwrap(), "root", Visibility::Private)
            .unwrap();
        mgr.scan_folder(folder_id, |_, _| {}).unwrap();
        let file_id: i64 = store
            .query_scalar("SELECT id FROM files LIMIT 1", [])
            .unwrap();

        let mut registry = ExtractorRegistry::new();
        registry.register(Arc::new(PlainTextExtractor::default()));
        let extractor = ContentExtractor::new(store.clone(), registry, 64);
        extractor.extract_one(file_id).unwrap();

        let count: i64 = store
            .query_scalar(
                "SELECT COUNT(*) FROM files_fts WHERE files_fts MATCH 'hello'",
                [],
            )
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn unsupported_mime_recorded_without_retry() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.bin"), [0u8, 1, 2]).unwrap();
        let store = Store::open_in_memory().unwrap();
        let mgr = IndexManager::new(store.clone());
        let folder_id = mgr
            .add_folder(dir.path().to_str().unwrap(), "root", Visibility::Private)
            .unwrap();
        mgr.scan_folder(folder_id, |_, _| {}).unwrap();
        let file_id: i64 = store
            .query_scalar("SELECT id FROM files LIMIT 1", [])
            .unwrap();

        let extractor = ContentExtractor::new(store.clone(), ExtractorRegistry::new(), 64);
        extractor.extract_one(file_id).unwrap();

        let method: String = store
            .query_scalar(
                "SELECT method FROM file_content WHERE file_id = ?1",
                params![file_id],
            )
            .unwrap();
        assert_eq!(method, "unsupported");
    }
}
