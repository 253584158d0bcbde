//! C ABI for embedding FamilyVault in a host application.
//!
//! Every object-creating function returns an opaque handle or null; on null
//! the thread-local last-error (`fv_last_error_code` / `fv_last_error_message`)
//! is set (see `errors`). Strings the library hands back are heap-allocated
//! and must be released with `fv_free_string`. Collection-valued results are
//! JSON arrays with stable field names; progress and event callbacks share
//! one signature — an integer code plus an allocated JSON payload string the
//! receiver must free.
//!
//! The database handle is reference-counted (`database::FvDatabase`): every
//! manager constructor clones its `Store` (addRef), every destructor drops
//! its clone (release), and `fv_database_close` fails `Busy` while any
//! manager still holds one. Besides the last-error slot, this crate carries
//! no mutable global state other than the lazily-started tokio runtime used
//! to drive the core crate's async network and pairing APIs from
//! synchronous C calls.

mod content_indexer;
mod database;
mod discovery;
mod duplicates;
mod errors;
mod index_manager;
mod index_sync;
mod network;
mod pairing;
mod runtime;
mod search;
mod secure_storage;
mod strings;
mod tags;

pub use content_indexer::*;
pub use database::*;
pub use discovery::*;
pub use duplicates::*;
pub use errors::*;
pub use index_manager::*;
pub use index_sync::*;
pub use network::*;
pub use pairing::*;
pub use search::*;
pub use secure_storage::*;
pub use strings::*;
pub use tags::*;

use std::os::raw::{c_char, c_void};

/// Universal callback signature for every asynchronous notification this
/// crate produces — scan progress, content-extraction progress, device
/// events, network events: an application-defined `code` (0 for ordinary
/// event/progress notifications), an allocated JSON payload the receiver
/// must free via `fv_free_string`, and the opaque `user_data` the caller
/// registered the callback with.
pub type FvCallback =
    Option<unsafe extern "C" fn(code: i32, json_payload: *mut c_char, user_data: *mut c_void)>;

/// Wraps a raw `user_data` pointer so it can cross into a `Send + Sync`
/// closure. Safe because the pointer is never dereferenced on this side of
/// the boundary — it is only ever handed back to the caller's own callback.
#[derive(Clone, Copy)]
pub(crate) struct SendPtr(pub *mut c_void);
unsafe impl Send for SendPtr {}
unsafe impl Sync for SendPtr {}

pub(crate) unsafe fn invoke_callback(cb: FvCallback, user_data: SendPtr, code: i32, json: &str) {
    if let Some(f) = cb {
        let payload = strings::string_to_cstring(json).into_raw();
        unsafe { f(code, payload, user_data.0) };
    }
}

/// Installs a `tracing` subscriber reading `RUST_LOG` (or `info` if unset).
/// Idempotent — later calls are no-ops.
#[unsafe(no_mangle)]
pub extern "C" fn fv_init_logging() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(
                |_| tracing_subscriber::EnvFilter::new("info"),
            ))
            .try_init();
    });
}
