//! User and auto tagging.

use std::os::raw::c_char;

use familyvault_core::{Tag, TagManager, TagSource};

use crate::database::{clone_store, FvDatabase};
use crate::errors::{clear_last_error, set_core_error, set_last_error, ErrorCode};
use crate::strings::{cstr_to_string, string_to_cstring};

pub struct FvTagManager {
    inner: TagManager,
}

fn tag_json(t: &Tag) -> serde_json::Value {
    serde_json::json!({
        "id": t.id,
        "name": t.name,
        "source": t.source,
        "file_count": t.file_count,
    })
}

fn parse_source(s: Option<String>) -> TagSource {
    match s.as_deref() {
        Some("auto") => TagSource::Auto,
        Some("ai") => TagSource::Ai,
        _ => TagSource::User,
    }
}

/// # Safety
/// `db` must be a valid, open database handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_tag_manager_new(db: *const FvDatabase) -> *mut FvTagManager {
    clear_last_error();
    let Some(store) = (unsafe { clone_store(db) }) else {
        set_last_error(ErrorCode::InvalidArgument, "database handle is null or closed");
        return std::ptr::null_mut();
    };
    Box::into_raw(Box::new(FvTagManager {
        inner: TagManager::new(store),
    }))
}

/// # Safety
/// `handle` must be null or a valid, not-yet-freed pointer from
/// `fv_tag_manager_new`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_tag_manager_free(handle: *mut FvTagManager) {
    if !handle.is_null() {
        drop(unsafe { Box::from_raw(handle) });
    }
}

/// Adds `name` to `file_id` (idempotent). `source` is `"user"`, `"auto"`, or
/// `"ai"` (null defaults to `"user"`). Returns the tag id, or `-1` on
/// failure.
///
/// # Safety
/// `handle` and `name` must be valid.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_tag_manager_add_tag(
    handle: *mut FvTagManager,
    file_id: i64,
    name: *const c_char,
    source: *const c_char,
) -> i64 {
    clear_last_error();
    let Some(mgr) = (unsafe { handle.as_ref() }) else {
        set_last_error(ErrorCode::InvalidArgument, "tag manager handle is null");
        return -1;
    };
    let Some(name) = (unsafe { cstr_to_string(name) }) else {
        set_last_error(ErrorCode::InvalidArgument, "name must be valid UTF-8");
        return -1;
    };
    let source = parse_source(unsafe { cstr_to_string(source) });
    match mgr.inner.add_tag(file_id, &name, source) {
        Ok(id) => id,
        Err(e) => {
            set_core_error(&e);
            -1
        }
    }
}

/// # Safety
/// `handle` and `name` must be valid.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_tag_manager_remove_tag(
    handle: *mut FvTagManager,
    file_id: i64,
    name: *const c_char,
) -> i32 {
    clear_last_error();
    let Some(mgr) = (unsafe { handle.as_ref() }) else {
        set_last_error(ErrorCode::InvalidArgument, "tag manager handle is null");
        return ErrorCode::InvalidArgument as i32;
    };
    let Some(name) = (unsafe { cstr_to_string(name) }) else {
        set_last_error(ErrorCode::InvalidArgument, "name must be valid UTF-8");
        return ErrorCode::InvalidArgument as i32;
    };
    match mgr.inner.remove_tag(file_id, &name) {
        Ok(()) => ErrorCode::Ok as i32,
        Err(e) => {
            let code = e.code();
            set_core_error(&e);
            code as i32
        }
    }
}

/// Returns `file_id`'s tags as a JSON array.
///
/// # Safety
/// `handle` must be valid.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_tag_manager_tags_for_file(
    handle: *mut FvTagManager,
    file_id: i64,
) -> *mut c_char {
    clear_last_error();
    let Some(mgr) = (unsafe { handle.as_ref() }) else {
        set_last_error(ErrorCode::InvalidArgument, "tag manager handle is null");
        return std::ptr::null_mut();
    };
    match mgr.inner.tags_for_file(file_id) {
        Ok(tags) => {
            let arr: Vec<_> = tags.iter().map(tag_json).collect();
            string_to_cstring(serde_json::Value::Array(arr).to_string()).into_raw()
        }
        Err(e) => {
            set_core_error(&e);
            std::ptr::null_mut()
        }
    }
}

/// Returns every tag in use as a JSON array.
///
/// # Safety
/// `handle` must be valid.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_tag_manager_list_tags(handle: *mut FvTagManager) -> *mut c_char {
    clear_last_error();
    let Some(mgr) = (unsafe { handle.as_ref() }) else {
        set_last_error(ErrorCode::InvalidArgument, "tag manager handle is null");
        return std::ptr::null_mut();
    };
    match mgr.inner.list_tags() {
        Ok(tags) => {
            let arr: Vec<_> = tags.iter().map(tag_json).collect();
            string_to_cstring(serde_json::Value::Array(arr).to_string()).into_raw()
        }
        Err(e) => {
            set_core_error(&e);
            std::ptr::null_mut()
        }
    }
}

/// Derives and applies auto-tags (content type, extension, year/season,
/// size bucket) for `file_id`.
///
/// # Safety
/// `handle` must be valid.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_tag_manager_auto_tag(handle: *mut FvTagManager, file_id: i64) -> i32 {
    clear_last_error();
    let Some(mgr) = (unsafe { handle.as_ref() }) else {
        set_last_error(ErrorCode::InvalidArgument, "tag manager handle is null");
        return ErrorCode::InvalidArgument as i32;
    };
    match mgr.inner.auto_tag(file_id) {
        Ok(()) => ErrorCode::Ok as i32,
        Err(e) => {
            let code = e.code();
            set_core_error(&e);
            code as i32
        }
    }
}
