//! Full-text and faceted search.

use std::os::raw::c_char;

use familyvault_core::{SearchEngine, SearchQuery, SearchResult, SortDirection, SortField};

use crate::database::{clone_store, FvDatabase};
use crate::errors::{clear_last_error, set_core_error, set_last_error, ErrorCode};
use crate::strings::{cstr_to_string, string_to_cstring};

pub struct FvSearchEngine {
    inner: SearchEngine,
}

fn sort_field(s: &str) -> Option<SortField> {
    match s {
        "relevance" => Some(SortField::Relevance),
        "name" => Some(SortField::Name),
        "date" => Some(SortField::Date),
        "size" => Some(SortField::Size),
        _ => None,
    }
}

fn sort_direction(s: &str) -> Option<SortDirection> {
    match s {
        "asc" => Some(SortDirection::Asc),
        "desc" => Some(SortDirection::Desc),
        _ => None,
    }
}

/// Builds a `SearchQuery` from a JSON object with fields: `text`,
/// `content_type`, `extension`, `folder_id`,
/// `modified_after`, `modified_before`, `size_min`, `size_max`,
/// `require_tags`, `exclude_tags`, `visibility`, `include_remote`, `sort`
/// (`{"field": ..., "direction": ...}`), `limit`, `offset`. Every field is
/// optional; an empty object searches everything up to the default limit.
fn query_from_json(json: &str) -> Result<SearchQuery, String> {
    let value: serde_json::Value =
        serde_json::from_str(json).map_err(|e| format!("invalid query JSON: {e}"))?;
    let limit = value.get("limit").and_then(serde_json::Value::as_i64).unwrap_or(100);
    let mut query = SearchQuery::new(limit);

    if let Some(text) = value.get("text").and_then(serde_json::Value::as_str) {
        query.text = Some(text.to_string());
    }
    if let Some(v) = value.get("content_type").and_then(serde_json::Value::as_str) {
        query.content_type = Some(v.to_string());
    }
    if let Some(v) = value.get("extension").and_then(serde_json::Value::as_str) {
        query.extension = Some(v.to_string());
    }
    if let Some(v) = value.get("folder_id").and_then(serde_json::Value::as_i64) {
        query.folder_id = Some(v);
    }
    if let Some(v) = value.get("modified_after").and_then(serde_json::Value::as_i64) {
        query.modified_after = Some(v);
    }
    if let Some(v) = value.get("modified_before").and_then(serde_json::Value::as_i64) {
        query.modified_before = Some(v);
    }
    if let Some(v) = value.get("size_min").and_then(serde_json::Value::as_i64) {
        query.size_min = Some(v);
    }
    if let Some(v) = value.get("size_max").and_then(serde_json::Value::as_i64) {
        query.size_max = Some(v);
    }
    if let Some(tags) = value.get("require_tags").and_then(serde_json::Value::as_array) {
        query.require_tags = tags
            .iter()
            .filter_map(serde_json::Value::as_str)
            .map(str::to_string)
            .collect();
    }
    if let Some(tags) = value.get("exclude_tags").and_then(serde_json::Value::as_array) {
        query.exclude_tags = tags
            .iter()
            .filter_map(serde_json::Value::as_str)
            .map(str::to_string)
            .collect();
    }
    if let Some(v) = value.get("visibility").and_then(serde_json::Value::as_str) {
        query.visibility = Some(v.to_string());
    }
    if let Some(v) = value.get("include_remote").and_then(serde_json::Value::as_bool) {
        query.include_remote = v;
    }
    if let Some(v) = value.get("offset").and_then(serde_json::Value::as_i64) {
        query.offset = v;
    }
    if let Some(sort) = value.get("sort").and_then(serde_json::Value::as_object) {
        let field = sort
            .get("field")
            .and_then(serde_json::Value::as_str)
            .and_then(sort_field);
        let direction = sort
            .get("direction")
            .and_then(serde_json::Value::as_str)
            .and_then(sort_direction)
            .unwrap_or(SortDirection::Asc);
        if let Some(field) = field {
            query.sort = Some((field, direction));
        }
    }
    Ok(query)
}

fn result_json(r: &SearchResult) -> serde_json::Value {
    serde_json::json!({
        "file_id": r.file_id,
        "name": r.name,
        "relative_path": r.relative_path,
        "folder_id": r.folder_id,
        "size": r.size,
        "content_type": r.content_type,
        "snippet": r.snippet,
    })
}

/// # Safety
/// `db` must be a valid, open database handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_search_engine_new(db: *const FvDatabase) -> *mut FvSearchEngine {
    clear_last_error();
    let Some(store) = (unsafe { clone_store(db) }) else {
        set_last_error(ErrorCode::InvalidArgument, "database handle is null or closed");
        return std::ptr::null_mut();
    };
    Box::into_raw(Box::new(FvSearchEngine {
        inner: SearchEngine::new(store),
    }))
}

/// # Safety
/// `handle` must be null or a valid, not-yet-freed pointer from
/// `fv_search_engine_new`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_search_engine_free(handle: *mut FvSearchEngine) {
    if !handle.is_null() {
        drop(unsafe { Box::from_raw(handle) });
    }
}

/// Runs `query_json` (see `query_from_json`'s field list) and returns the
/// matches as a JSON array, most-relevant/first-requested-sort-order first.
///
/// # Safety
/// `handle` and `query_json` must be valid.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_search_engine_search(
    handle: *mut FvSearchEngine,
    query_json: *const c_char,
) -> *mut c_char {
    clear_last_error();
    let Some(engine) = (unsafe { handle.as_ref() }) else {
        set_last_error(ErrorCode::InvalidArgument, "search engine handle is null");
        return std::ptr::null_mut();
    };
    let Some(json) = (unsafe { cstr_to_string(query_json) }) else {
        set_last_error(ErrorCode::InvalidArgument, "query must be valid UTF-8");
        return std::ptr::null_mut();
    };
    let query = match query_from_json(&json) {
        Ok(q) => q,
        Err(msg) => {
            set_last_error(ErrorCode::InvalidArgument, msg);
            return std::ptr::null_mut();
        }
    };
    match engine.inner.search(&query) {
        Ok(results) => {
            let arr: Vec<_> = results.iter().map(result_json).collect();
            string_to_cstring(serde_json::Value::Array(arr).to_string()).into_raw()
        }
        Err(e) => {
            set_core_error(&e);
            std::ptr::null_mut()
        }
    }
}

/// Counts matches for `query_json` without materializing rows. Returns
/// `-1` on failure.
///
/// # Safety
/// `handle` and `query_json` must be valid.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_search_engine_count(
    handle: *mut FvSearchEngine,
    query_json: *const c_char,
) -> i64 {
    clear_last_error();
    let Some(engine) = (unsafe { handle.as_ref() }) else {
        set_last_error(ErrorCode::InvalidArgument, "search engine handle is null");
        return -1;
    };
    let Some(json) = (unsafe { cstr_to_string(query_json) }) else {
        set_last_error(ErrorCode::InvalidArgument, "query must be valid UTF-8");
        return -1;
    };
    let query = match query_from_json(&json) {
        Ok(q) => q,
        Err(msg) => {
            set_last_error(ErrorCode::InvalidArgument, msg);
            return -1;
        }
    };
    match engine.inner.count_results(&query) {
        Ok(n) => n,
        Err(e) => {
            set_core_error(&e);
            -1
        }
    }
}

/// Tag and filename completion for `prefix`, as a JSON array of strings.
///
/// # Safety
/// `handle` and `prefix` must be valid.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_search_engine_suggest(
    handle: *mut FvSearchEngine,
    prefix: *const c_char,
    limit: i64,
) -> *mut c_char {
    clear_last_error();
    let Some(engine) = (unsafe { handle.as_ref() }) else {
        set_last_error(ErrorCode::InvalidArgument, "search engine handle is null");
        return std::ptr::null_mut();
    };
    let Some(prefix) = (unsafe { cstr_to_string(prefix) }) else {
        set_last_error(ErrorCode::InvalidArgument, "prefix must be valid UTF-8");
        return std::ptr::null_mut();
    };
    match engine.inner.suggest(&prefix, limit) {
        Ok(suggestions) => {
            let arr: Vec<_> = suggestions.into_iter().map(serde_json::Value::String).collect();
            string_to_cstring(serde_json::Value::Array(arr).to_string()).into_raw()
        }
        Err(e) => {
            set_core_error(&e);
            std::ptr::null_mut()
        }
    }
}
