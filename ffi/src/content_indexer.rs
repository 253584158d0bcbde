//! Background text extraction into the content-holding FTS index.

use std::sync::Arc;

use familyvault_core::{ContentExtractor, ExtractorRegistry, PlainTextExtractor};

use crate::database::{clone_store, FvDatabase};
use crate::errors::{clear_last_error, set_core_error, set_last_error, ErrorCode};

const MAX_TEXT_KB: usize = 256;

pub struct FvContentIndexer {
    inner: Arc<ContentExtractor>,
}

/// # Safety
/// `db` must be a valid, open database handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_content_indexer_new(db: *const FvDatabase) -> *mut FvContentIndexer {
    clear_last_error();
    let Some(store) = (unsafe { clone_store(db) }) else {
        set_last_error(ErrorCode::InvalidArgument, "database handle is null or closed");
        return std::ptr::null_mut();
    };
    let mut registry = ExtractorRegistry::new();
    registry.register(Arc::new(PlainTextExtractor::default()));
    Box::into_raw(Box::new(FvContentIndexer {
        inner: Arc::new(ContentExtractor::new(store, registry, MAX_TEXT_KB)),
    }))
}

/// Stops the worker (without waiting) and frees the handle.
///
/// # Safety
/// `handle` must be null or a valid, not-yet-freed pointer from
/// `fv_content_indexer_new`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_content_indexer_free(handle: *mut FvContentIndexer) {
    if !handle.is_null() {
        let boxed = unsafe { Box::from_raw(handle) };
        boxed.inner.stop(false);
    }
}

/// Queues `file_id` for extraction.
///
/// # Safety
/// `handle` must be valid.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_content_indexer_enqueue(handle: *mut FvContentIndexer, file_id: i64) {
    if let Some(indexer) = unsafe { handle.as_ref() } {
        indexer.inner.enqueue(file_id);
    }
}

/// Queues every local file whose content is missing or stale. Returns the
/// number queued, or `-1` on failure.
///
/// # Safety
/// `handle` must be valid.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_content_indexer_enqueue_stale(handle: *mut FvContentIndexer) -> i64 {
    clear_last_error();
    let Some(indexer) = (unsafe { handle.as_ref() }) else {
        set_last_error(ErrorCode::InvalidArgument, "content indexer handle is null");
        return -1;
    };
    match indexer.inner.enqueue_stale() {
        Ok(n) => n as i64,
        Err(e) => {
            set_core_error(&e);
            -1
        }
    }
}

/// Starts the single background extraction worker thread.
///
/// # Safety
/// `handle` must be valid.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_content_indexer_start(handle: *mut FvContentIndexer) {
    if let Some(indexer) = unsafe { handle.as_ref() } {
        indexer.inner.start();
    }
}

/// Stops the worker. `wait` joins the worker thread before returning.
///
/// # Safety
/// `handle` must be valid.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_content_indexer_stop(handle: *mut FvContentIndexer, wait: bool) {
    if let Some(indexer) = unsafe { handle.as_ref() } {
        indexer.inner.stop(wait);
    }
}
