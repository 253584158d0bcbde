//! Secure family pairing: PIN issuance/join, and the plain-TCP pairing
//! protocol that exchanges the family secret before any PSK exists.

use std::os::raw::c_char;
use std::str::FromStr;
use std::sync::Arc;

use familyvault_core::{
    DeviceType, FamilyPairing, JoinError, JoinOutcome, PairingClient, PairingServer,
};

use crate::errors::{clear_last_error, set_core_error, set_last_error, ErrorCode};
use crate::runtime::runtime;
use crate::secure_storage::FvSecureStorage;
use crate::strings::{cstr_to_string, string_to_cstring};

pub struct FvFamilyPairing {
    inner: Arc<FamilyPairing>,
}

pub struct FvPairingServer {
    inner: PairingServer,
}

fn pairing_error_code(e: &familyvault_core::PairingError) -> ErrorCode {
    use familyvault_core::PairingError::*;
    match e {
        InvalidPin => ErrorCode::AuthFailed,
        Expired => ErrorCode::AuthFailed,
        RateLimited => ErrorCode::Busy,
        AlreadyConfigured => ErrorCode::AlreadyExists,
        NetworkError => ErrorCode::Network,
        InternalError => ErrorCode::Internal,
    }
}

fn set_pairing_error(e: &familyvault_core::PairingError) -> i32 {
    let code = pairing_error_code(e);
    set_last_error(code, e.to_string());
    code as i32
}

/// # Safety
/// `storage` must be a valid secure storage handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_family_pairing_new(
    storage: *const FvSecureStorage,
) -> *mut FvFamilyPairing {
    clear_last_error();
    let Some(storage) = (unsafe { storage.as_ref() }) else {
        set_last_error(ErrorCode::InvalidArgument, "secure storage handle is null");
        return std::ptr::null_mut();
    };
    Box::into_raw(Box::new(FvFamilyPairing {
        inner: Arc::new(FamilyPairing::new(Arc::clone(&storage.inner))),
    }))
}

/// # Safety
/// `handle` must be null or a valid, not-yet-freed pointer from
/// `fv_family_pairing_new`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_family_pairing_free(handle: *mut FvFamilyPairing) {
    if !handle.is_null() {
        drop(unsafe { Box::from_raw(handle) });
    }
}

/// Returns this installation's device id, or null on failure.
///
/// # Safety
/// `handle` must be valid.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_family_pairing_device_id(handle: *mut FvFamilyPairing) -> *mut c_char {
    clear_last_error();
    let Some(pairing) = (unsafe { handle.as_ref() }) else {
        set_last_error(ErrorCode::InvalidArgument, "pairing handle is null");
        return std::ptr::null_mut();
    };
    match pairing.inner.device_id() {
        Ok(id) => string_to_cstring(id).into_raw(),
        Err(e) => {
            set_core_error(&e);
            std::ptr::null_mut()
        }
    }
}

/// Returns `1`/`0`/`-1` (configured / not configured / error).
///
/// # Safety
/// `handle` must be valid.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_family_pairing_is_configured(handle: *mut FvFamilyPairing) -> i32 {
    clear_last_error();
    let Some(pairing) = (unsafe { handle.as_ref() }) else {
        set_last_error(ErrorCode::InvalidArgument, "pairing handle is null");
        return -1;
    };
    match pairing.inner.is_configured() {
        Ok(true) => 1,
        Ok(false) => 0,
        Err(e) => {
            set_core_error(&e);
            -1
        }
    }
}

fn qr_json(qr: &familyvault_core::QrCodeData) -> serde_json::Value {
    serde_json::json!({
        "pin": qr.pin,
        "host": qr.host,
        "port": qr.port,
        "url": qr.to_url(),
    })
}

/// Creates the family (first device) and issues a PIN. Returns a JSON
/// object `{pin, host, port, url}`, or null on failure.
///
/// # Safety
/// `handle`, `host` must be valid.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_family_pairing_create_family(
    handle: *mut FvFamilyPairing,
    host: *const c_char,
    port: u16,
) -> *mut c_char {
    clear_last_error();
    let Some(pairing) = (unsafe { handle.as_ref() }) else {
        set_last_error(ErrorCode::InvalidArgument, "pairing handle is null");
        return std::ptr::null_mut();
    };
    let Some(host) = (unsafe { cstr_to_string(host) }) else {
        set_last_error(ErrorCode::InvalidArgument, "host must be valid UTF-8");
        return std::ptr::null_mut();
    };
    match pairing.inner.create_family(&host, port) {
        Ok(qr) => string_to_cstring(qr_json(&qr).to_string()).into_raw(),
        Err(e) => {
            set_core_error(&e);
            std::ptr::null_mut()
        }
    }
}

/// Issues a fresh PIN for an already-created family. Returns a JSON object
/// `{pin, host, port, url}`, or null on failure.
///
/// # Safety
/// `handle`, `host` must be valid.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_family_pairing_regenerate_pin(
    handle: *mut FvFamilyPairing,
    host: *const c_char,
    port: u16,
) -> *mut c_char {
    clear_last_error();
    let Some(pairing) = (unsafe { handle.as_ref() }) else {
        set_last_error(ErrorCode::InvalidArgument, "pairing handle is null");
        return std::ptr::null_mut();
    };
    let Some(host) = (unsafe { cstr_to_string(host) }) else {
        set_last_error(ErrorCode::InvalidArgument, "host must be valid UTF-8");
        return std::ptr::null_mut();
    };
    match pairing.inner.regenerate_pin(&host, port) {
        Ok(qr) => string_to_cstring(qr_json(&qr).to_string()).into_raw(),
        Err(e) => {
            set_core_error(&e);
            std::ptr::null_mut()
        }
    }
}

/// Validates `pin` against the current session (3-strike rate limiting).
/// Returns `0` on success, an `ErrorCode` otherwise (`AuthFailed` for a bad
/// or expired PIN, `Busy` while rate-limited).
///
/// # Safety
/// `handle`, `pin` must be valid.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_family_pairing_validate_pin(
    handle: *mut FvFamilyPairing,
    pin: *const c_char,
) -> i32 {
    clear_last_error();
    let Some(pairing) = (unsafe { handle.as_ref() }) else {
        set_last_error(ErrorCode::InvalidArgument, "pairing handle is null");
        return ErrorCode::InvalidArgument as i32;
    };
    let Some(pin) = (unsafe { cstr_to_string(pin) }) else {
        set_last_error(ErrorCode::InvalidArgument, "pin must be valid UTF-8");
        return ErrorCode::InvalidArgument as i32;
    };
    match pairing.inner.validate_pin(&pin) {
        Ok(()) => ErrorCode::Ok as i32,
        Err(e) => set_pairing_error(&e),
    }
}

/// Joins a family on the joining device's side, given the `family_secret`
/// bytes obtained from the pairing handshake. Returns `0` on success.
///
/// # Safety
/// `handle`, `device_name` must be valid; `family_secret`/`len` must
/// describe a readable buffer.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_family_pairing_complete_join(
    handle: *mut FvFamilyPairing,
    family_secret: *const u8,
    family_secret_len: usize,
    device_name: *const c_char,
) -> i32 {
    clear_last_error();
    let Some(pairing) = (unsafe { handle.as_ref() }) else {
        set_last_error(ErrorCode::InvalidArgument, "pairing handle is null");
        return ErrorCode::InvalidArgument as i32;
    };
    if family_secret.is_null() {
        set_last_error(ErrorCode::InvalidArgument, "family_secret is null");
        return ErrorCode::InvalidArgument as i32;
    }
    let secret = unsafe { std::slice::from_raw_parts(family_secret, family_secret_len) };
    let Some(device_name) = (unsafe { cstr_to_string(device_name) }) else {
        set_last_error(ErrorCode::InvalidArgument, "device_name must be valid UTF-8");
        return ErrorCode::InvalidArgument as i32;
    };
    match pairing.inner.complete_join(secret, &device_name) {
        Ok(JoinOutcome::Success) => ErrorCode::Ok as i32,
        Err(e) => set_pairing_error(&e),
    }
}

/// Returns the family secret bytes (write-once `out_len`), or null if not
/// yet configured or on failure. Free the returned buffer with
/// `fv_secure_storage_free_bytes`.
///
/// # Safety
/// `handle`, `out_len` must be valid.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_family_pairing_family_secret(
    handle: *mut FvFamilyPairing,
    out_len: *mut usize,
) -> *mut u8 {
    clear_last_error();
    if !out_len.is_null() {
        unsafe { *out_len = 0 };
    }
    let Some(pairing) = (unsafe { handle.as_ref() }) else {
        set_last_error(ErrorCode::InvalidArgument, "pairing handle is null");
        return std::ptr::null_mut();
    };
    match pairing.inner.family_secret() {
        Ok(secret) => {
            if !out_len.is_null() {
                unsafe { *out_len = secret.len() };
            }
            Box::into_raw(secret.into_boxed_slice()) as *mut u8
        }
        Err(e) => {
            set_core_error(&e);
            std::ptr::null_mut()
        }
    }
}

/// Derives the 32-byte TLS-PSK from the family secret. Writes into
/// `out[0..32]`. Returns `0` on success.
///
/// # Safety
/// `handle` must be valid; `out` must point at a writable 32-byte buffer.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_family_pairing_derive_psk(
    handle: *mut FvFamilyPairing,
    out: *mut u8,
) -> i32 {
    clear_last_error();
    let Some(pairing) = (unsafe { handle.as_ref() }) else {
        set_last_error(ErrorCode::InvalidArgument, "pairing handle is null");
        return ErrorCode::InvalidArgument as i32;
    };
    if out.is_null() {
        set_last_error(ErrorCode::InvalidArgument, "out is null");
        return ErrorCode::InvalidArgument as i32;
    }
    match pairing.inner.derive_psk() {
        Ok(psk) => {
            unsafe { std::ptr::copy_nonoverlapping(psk.as_ptr(), out, 32) };
            ErrorCode::Ok as i32
        }
        Err(e) => {
            let code = e.code();
            set_core_error(&e);
            code as i32
        }
    }
}

/// Returns the current pairing session as `{"pin", "seconds_remaining"}`,
/// or null if no session is active.
///
/// # Safety
/// `handle` must be valid.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_family_pairing_current_session(
    handle: *mut FvFamilyPairing,
) -> *mut c_char {
    clear_last_error();
    let Some(pairing) = (unsafe { handle.as_ref() }) else {
        set_last_error(ErrorCode::InvalidArgument, "pairing handle is null");
        return std::ptr::null_mut();
    };
    match pairing.inner.current_session() {
        Some(session) => {
            let json = serde_json::json!({
                "pin": session.pin,
                "seconds_remaining": session.seconds_remaining(),
            });
            string_to_cstring(json.to_string()).into_raw()
        }
        None => std::ptr::null_mut(),
    }
}

/// Clears all pairing state (used family secret, device id, sessions).
///
/// # Safety
/// `handle` must be valid.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_family_pairing_reset(handle: *mut FvFamilyPairing) -> i32 {
    clear_last_error();
    let Some(pairing) = (unsafe { handle.as_ref() }) else {
        set_last_error(ErrorCode::InvalidArgument, "pairing handle is null");
        return ErrorCode::InvalidArgument as i32;
    };
    match pairing.inner.reset() {
        Ok(()) => ErrorCode::Ok as i32,
        Err(e) => {
            let code = e.code();
            set_core_error(&e);
            code as i32
        }
    }
}

/// Starts the plain-TCP pairing listener on `port` (`0` picks an ephemeral
/// port). Returns the handle, writing the bound port into `out_port`.
///
/// # Safety
/// `pairing` must be valid and stay alive for as long as the returned
/// server runs; `out_port` must be writable.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_pairing_server_start(
    pairing: *mut FvFamilyPairing,
    port: u16,
    out_port: *mut u16,
) -> *mut FvPairingServer {
    clear_last_error();
    let Some(pairing) = (unsafe { pairing.as_ref() }) else {
        set_last_error(ErrorCode::InvalidArgument, "pairing handle is null");
        return std::ptr::null_mut();
    };
    let pairing = Arc::clone(&pairing.inner);
    match runtime().block_on(PairingServer::start_with_bound_port(pairing, port)) {
        Ok((server, bound_port)) => {
            if !out_port.is_null() {
                unsafe { *out_port = bound_port };
            }
            Box::into_raw(Box::new(FvPairingServer { inner: server }))
        }
        Err(e) => {
            set_core_error(&e);
            std::ptr::null_mut()
        }
    }
}

/// # Safety
/// `handle` must be null or a valid, not-yet-freed pointer from
/// `fv_pairing_server_start`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_pairing_server_stop(handle: *mut FvPairingServer) {
    if !handle.is_null() {
        let boxed = unsafe { Box::from_raw(handle) };
        boxed.inner.stop();
    }
}

/// Joins a family at `host:port` using `pin`. On success, writes the
/// family secret bytes into a freshly allocated buffer (`out_len`), to be
/// passed to `fv_family_pairing_complete_join` and then freed with
/// `fv_secure_storage_free_bytes`. Returns `0` on success.
///
/// # Safety
/// `host`, `pin`, `device_id`, `device_name`, `device_type` must be valid;
/// `out_len` must be writable.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_pairing_client_join(
    host: *const c_char,
    port: u16,
    pin: *const c_char,
    device_id: *const c_char,
    device_name: *const c_char,
    device_type: *const c_char,
    out_len: *mut usize,
) -> *mut u8 {
    clear_last_error();
    if !out_len.is_null() {
        unsafe { *out_len = 0 };
    }
    let Some(host) = (unsafe { cstr_to_string(host) }) else {
        set_last_error(ErrorCode::InvalidArgument, "host must be valid UTF-8");
        return std::ptr::null_mut();
    };
    let Some(pin) = (unsafe { cstr_to_string(pin) }) else {
        set_last_error(ErrorCode::InvalidArgument, "pin must be valid UTF-8");
        return std::ptr::null_mut();
    };
    let Some(device_id) = (unsafe { cstr_to_string(device_id) }) else {
        set_last_error(ErrorCode::InvalidArgument, "device_id must be valid UTF-8");
        return std::ptr::null_mut();
    };
    let Some(device_name) = (unsafe { cstr_to_string(device_name) }) else {
        set_last_error(ErrorCode::InvalidArgument, "device_name must be valid UTF-8");
        return std::ptr::null_mut();
    };
    let device_type = unsafe { cstr_to_string(device_type) }
        .and_then(|s| DeviceType::from_str(&s).ok())
        .unwrap_or(DeviceType::Desktop);

    let result = runtime().block_on(PairingClient::join(
        &host,
        port,
        &pin,
        &device_id,
        &device_name,
        device_type,
    ));
    match result {
        Ok(secret) => {
            if !out_len.is_null() {
                unsafe { *out_len = secret.len() };
            }
            Box::into_raw(secret.into_boxed_slice()) as *mut u8
        }
        Err(JoinError::Pairing(e)) => {
            set_pairing_error(&e);
            std::ptr::null_mut()
        }
        Err(JoinError::Transport(e)) => {
            set_core_error(&e);
            std::ptr::null_mut()
        }
    }
}
