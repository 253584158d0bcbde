//! Recursive directory walk with cooperative cancellation, built on
//! `walkdir` as the primary indexing walk. Cancellation follows the same
//! idiom used elsewhere in this crate: a shared flag polled between units
//! of work (see `discovery.rs`'s `Arc<AtomicBool>` shutdown signal).

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::error::Result;

const SKIPPED_DIR_NAMES: &[&str] = &[
    ".git",
    "node_modules",
    "$RECYCLE.BIN",
    "System Volume Information",
    ".Trash",
    ".Trashes",
    "__pycache__",
];

const NOISE_EXTENSIONS: &[&str] = &["tmp", "log", "lock", "db-wal", "db-shm", "swp", "part"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Unknown,
    Image,
    Video,
    Audio,
    Document,
    Archive,
    Other,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Unknown => "unknown",
            ContentType::Image => "image",
            ContentType::Video => "video",
            ContentType::Audio => "audio",
            ContentType::Document => "document",
            ContentType::Archive => "archive",
            ContentType::Other => "other",
        }
    }

    /// Extension-first classification; magic-byte fallback for a small set
    /// (image/pdf/zip/office) is applied by `sniff_magic` below when the
    /// extension alone is ambiguous or absent.
    pub fn from_mime(mime: &str) -> Self {
        if mime.starts_with("image/") {
            ContentType::Image
        } else if mime.starts_with("video/") {
            ContentType::Video
        } else if mime.starts_with("audio/") {
            ContentType::Audio
        } else if mime == "application/pdf"
            || mime.starts_with("text/")
            || mime.contains("document")
            || mime.contains("msword")
            || mime.contains("opendocument")
            || mime.contains("spreadsheet")
            || mime.contains("presentation")
        {
            ContentType::Document
        } else if mime.contains("zip") || mime.contains("tar") || mime.contains("compressed") {
            ContentType::Archive
        } else {
            ContentType::Other
        }
    }
}

/// Classifies a file's MIME type by extension, falling back to magic bytes
/// for a small recognized set when the extension gives no match.
pub fn classify_mime(path: &Path) -> String {
    let guess = mime_guess::from_path(path).first();
    if let Some(mime) = guess {
        return mime.essence_str().to_string();
    }
    if let Some(magic) = sniff_magic(path) {
        return magic.to_string();
    }
    "application/octet-stream".to_string()
}

fn sniff_magic(path: &Path) -> Option<&'static str> {
    let mut buf = [0u8; 8];
    let mut f = fs::File::open(path).ok()?;
    use std::io::Read;
    let n = f.read(&mut buf).ok()?;
    if n < 4 {
        return None;
    }
    if buf.starts_with(b"\x89PNG") {
        Some("image/png")
    } else if buf.starts_with(b"\xFF\xD8\xFF") {
        Some("image/jpeg")
    } else if buf.starts_with(b"GIF8") {
        Some("image/gif")
    } else if buf.starts_with(b"%PDF") {
        Some("application/pdf")
    } else if buf.starts_with(b"PK\x03\x04") {
        Some("application/zip")
    } else {
        None
    }
}

#[derive(Debug, Clone)]
pub struct ScannedFile {
    pub relative_path: String,
    pub name: String,
    pub extension: Option<String>,
    pub size: u64,
    pub mime_type: String,
    pub content_type: ContentType,
    pub created_at: Option<i64>,
    pub modified_at: Option<i64>,
}

/// Include/exclude glob-style patterns (simple `*`/`?` wildcards, applied to
/// the file name) supersede the default skip lists.
#[derive(Debug, Clone, Default)]
pub struct ScanFilters {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

impl ScanFilters {
    fn matches(pattern: &str, name: &str) -> bool {
        glob_match(pattern, name)
    }

    fn is_included(&self, name: &str) -> bool {
        if !self.include.is_empty() && !self.include.iter().any(|p| Self::matches(p, name)) {
            return false;
        }
        if self.exclude.iter().any(|p| Self::matches(p, name)) {
            return false;
        }
        true
    }

    /// True when `name` matches one of the explicit include patterns.
    /// An explicit include supersedes the default noise skip list — see
    /// `Scanner::is_eligible`.
    fn explicitly_included(&self, name: &str) -> bool {
        !self.include.is_empty() && self.include.iter().any(|p| Self::matches(p, name))
    }
}

/// Minimal `*`/`?` glob matcher — no external glob crate dependency is
/// needed for the small pattern set this filter supports.
fn glob_match(pattern: &str, text: &str) -> bool {
    fn helper(p: &[u8], t: &[u8]) -> bool {
        match (p.first(), t.first()) {
            (None, None) => true,
            (Some(b'*'), _) => helper(&p[1..], t) || (!t.is_empty() && helper(p, &t[1..])),
            (Some(b'?'), Some(_)) => helper(&p[1..], &t[1..]),
            (Some(pc), Some(tc)) if pc == tc => helper(&p[1..], &t[1..]),
            _ => false,
        }
    }
    helper(pattern.as_bytes(), text.as_bytes())
}

fn is_noise(entry_name: &str) -> bool {
    if entry_name.starts_with('.') {
        return true;
    }
    if SKIPPED_DIR_NAMES.contains(&entry_name) {
        return true;
    }
    if let Some(ext) = entry_name.rsplit('.').next() {
        if NOISE_EXTENSIONS.contains(&ext.to_lowercase().as_str()) {
            return true;
        }
    }
    false
}

fn system_time_to_unix(t: std::io::Result<std::time::SystemTime>) -> Option<i64> {
    t.ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
}

/// Two-phase recursive walk: `count_eligible` enables progress percentages
/// before `scan` emits each `ScannedFile` through `on_file`. Symlinks are
/// never followed. Cancellation is a shared flag checked between entries;
/// what happens to a cancelled scan's partial results is the caller's
/// policy (see `IndexManager::scan_folder`).
pub struct Scanner {
    root: PathBuf,
    filters: ScanFilters,
    cancel: Arc<AtomicBool>,
}

impl Scanner {
    pub fn new(root: impl Into<PathBuf>, filters: ScanFilters) -> Self {
        Self {
            root: root.into(),
            filters,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    fn walk(&self) -> impl Iterator<Item = walkdir::DirEntry> + '_ {
        WalkDir::new(&self.root)
            .follow_links(false)
            .into_iter()
            .filter_entry(move |entry| {
                let name = entry.file_name().to_string_lossy();
                if entry.file_type().is_dir() {
                    !is_noise(&name)
                } else {
                    true
                }
            })
            .filter_map(|e| e.ok())
    }

    /// Phase 1: count eligible files, without reading any content.
    pub fn count_eligible(&self) -> u64 {
        let mut count = 0u64;
        for entry in self.walk() {
            if self.cancel.load(Ordering::Relaxed) {
                break;
            }
            if self.is_eligible(&entry) {
                count += 1;
            }
        }
        count
    }

    fn is_eligible(&self, entry: &walkdir::DirEntry) -> bool {
        if !entry.file_type().is_file() {
            return false;
        }
        let name = entry.file_name().to_string_lossy();
        // An explicit include match supersedes the default noise skip list
        // (spec §4.4); it still loses to an explicit exclude.
        if self.filters.explicitly_included(&name) {
            return !self.filters.exclude.iter().any(|p| ScanFilters::matches(p, &name));
        }
        if is_noise(&name) {
            return false;
        }
        self.filters.is_included(&name)
    }

    /// Phase 2: emit a `ScannedFile` per eligible file via `on_file`.
    /// Returns the number of files emitted, or fewer than `count_eligible`
    /// reported if cancelled mid-walk.
    pub fn scan(&self, mut on_file: impl FnMut(ScannedFile)) -> Result<u64> {
        let mut emitted = 0u64;
        for entry in self.walk() {
            if self.cancel.load(Ordering::Relaxed) {
                break;
            }
            if !self.is_eligible(&entry) {
                continue;
            }
            let path = entry.path();
            let relative_path = path
                .strip_prefix(&self.root)
                .unwrap_or(path)
                .to_string_lossy()
                .replace('\\', "/");
            let name = entry.file_name().to_string_lossy().to_string();
            let extension = path
                .extension()
                .map(|e| e.to_string_lossy().to_lowercase());
            let metadata = match entry.metadata() {
                Ok(m) => m,
                Err(_) => continue,
            };
            let mime_type = classify_mime(path);
            let content_type = ContentType::from_mime(&mime_type);
            on_file(ScannedFile {
                relative_path,
                name,
                extension,
                size: metadata.len(),
                mime_type,
                content_type,
                created_at: system_time_to_unix(metadata.created()),
                modified_at: system_time_to_unix(metadata.modified()),
            });
            emitted += 1;
        }
        Ok(emitted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn scans_eligible_files_and_skips_noise() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        std::fs::write(dir.path().join(".hidden"), b"x").unwrap();
        std::fs::write(dir.path().join("b.log"), b"x").unwrap();
        std::fs::create_dir(dir.path().join(".git")).unwrap();
        std::fs::write(dir.path().join(".git").join("HEAD"), b"x").unwrap();

        let scanner = Scanner::new(dir.path(), ScanFilters::default());
        let mut names = Vec::new();
        scanner.scan(|f| names.push(f.name)).unwrap();
        assert_eq!(names, vec!["a.txt".to_string()]);
    }

    #[test]
    fn cancellation_stops_the_walk() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..50 {
            let mut f = std::fs::File::create(dir.path().join(format!("f{i}.txt"))).unwrap();
            f.write_all(b"x").unwrap();
        }
        let scanner = Scanner::new(dir.path(), ScanFilters::default());
        let cancel = scanner.cancel_handle();
        cancel.store(true, Ordering::Relaxed);
        let mut count = 0;
        scanner.scan(|_| count += 1).unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn glob_filters_apply() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"x").unwrap();
        std::fs::write(dir.path().join("a.jpg"), b"x").unwrap();
        let filters = ScanFilters {
            include: vec!["*.jpg".to_string()],
            exclude: vec![],
        };
        let scanner = Scanner::new(dir.path(), filters);
        let mut names = Vec::new();
        scanner.scan(|f| names.push(f.name)).unwrap();
        assert_eq!(names, vec!["a.jpg".to_string()]);
    }

    #[test]
    fn explicit_include_overrides_default_noise_skip() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"x").unwrap();
        std::fs::write(dir.path().join("debug.log"), b"x").unwrap();
        let filters = ScanFilters {
            include: vec!["*.log".to_string()],
            exclude: vec![],
        };
        let scanner = Scanner::new(dir.path(), filters);
        let mut names = Vec::new();
        scanner.scan(|f| names.push(f.name)).unwrap();
        assert_eq!(names, vec!["debug.log".to_string()]);
    }
}
