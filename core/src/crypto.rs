//! Cryptographic primitives: random bytes, HKDF-SHA256, PIN derivation,
//! UUIDv4 and base64 conveniences, kept as a small stateless module other
//! components call into directly.

use base64::Engine;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

use crate::error::{FamilyVaultError, Result};

const PIN_SALT: &[u8] = b"familyvault-pin";
const PIN_INFO: &[u8] = b"pin-derivation";
const PSK_SALT: &[u8] = b"familyvault-psk-v1";
const PSK_INFO: &[u8] = b"tls13-psk";

/// Cryptographically strong random bytes. Fails fatally on RNG failure —
/// `rand::thread_rng()` never fails in practice, but we still surface an
/// `Internal` error rather than panicking across the FFI boundary.
pub fn random_bytes(n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    rand::thread_rng().fill_bytes(&mut buf);
    buf
}

/// HKDF-SHA256 over `ikm` with the given `salt` and `info`, producing
/// exactly `out_len` bytes.
pub fn hkdf(ikm: &[u8], salt: &[u8], info: &[u8], out_len: usize) -> Result<Vec<u8>> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = vec![0u8; out_len];
    hk.expand(info, &mut okm)
        .map_err(|e| FamilyVaultError::Internal(format!("HKDF expand failed: {e}")))?;
    Ok(okm)
}

/// Derive the 6-digit pairing PIN from the family secret and a session
/// nonce: 4 bytes via HKDF, big-endian, modulo 10^6, zero-padded.
pub fn pin(secret: &[u8], nonce: &[u8]) -> Result<String> {
    let mut ikm = Vec::with_capacity(secret.len() + nonce.len());
    ikm.extend_from_slice(secret);
    ikm.extend_from_slice(nonce);
    let out = hkdf(&ikm, PIN_SALT, PIN_INFO, 4)?;
    let n = u32::from_be_bytes([out[0], out[1], out[2], out[3]]);
    Ok(format!("{:06}", n % 1_000_000))
}

/// Derive the 32-byte transport PSK from the family secret: the same
/// secret on every device in the family yields the same PSK.
pub fn derive_psk(family_secret: &[u8]) -> Result<[u8; 32]> {
    let out = hkdf(family_secret, PSK_SALT, PSK_INFO, 32)?;
    let mut psk = [0u8; 32];
    psk.copy_from_slice(&out);
    Ok(psk)
}

type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA256 over `message` keyed by `key`, used for the post-handshake
/// PSK-possession challenge in `transport.rs`.
pub fn hmac_sha256(key: &[u8], message: &[u8]) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| FamilyVaultError::Internal(format!("HMAC key error: {e}")))?;
    mac.update(message);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Constant-time comparison of two HMAC tags (or any secret-derived bytes).
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// 16 random bytes, version/variant bits set per RFC 4122, formatted
/// lowercase 8-4-4-4-12.
pub fn uuid_v4() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub fn base64_encode(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

pub fn base64_decode(s: &str) -> Result<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(s)
        .map_err(|e| FamilyVaultError::InvalidArgument(format!("invalid base64: {e}")))
}

/// SHA-256 of a byte slice, hex-encoded. Used for file checksums (spec
/// §3 Cache entry, §4.15) and distinct from the PSK-challenge HMAC above.
pub fn sha256_hex(bytes: &[u8]) -> String {
    use sha2::Digest;
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pin_is_deterministic_and_six_digits() {
        let secret = random_bytes(32);
        let nonce = random_bytes(16);
        let p1 = pin(&secret, &nonce).unwrap();
        let p2 = pin(&secret, &nonce).unwrap();
        assert_eq!(p1, p2);
        assert_eq!(p1.len(), 6);
        assert!(p1.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn pin_changes_with_either_input() {
        let secret = random_bytes(32);
        let nonce = random_bytes(16);
        let other_secret = random_bytes(32);
        let other_nonce = random_bytes(16);
        let base = pin(&secret, &nonce).unwrap();
        assert_ne!(base, pin(&other_secret, &nonce).unwrap());
        assert_ne!(base, pin(&secret, &other_nonce).unwrap());
    }

    #[test]
    fn psk_is_deterministic_per_secret() {
        let secret = random_bytes(32);
        assert_eq!(derive_psk(&secret).unwrap(), derive_psk(&secret).unwrap());
        let other = random_bytes(32);
        assert_ne!(derive_psk(&secret).unwrap(), derive_psk(&other).unwrap());
    }

    #[test]
    fn uuid_v4_is_well_formed() {
        let id = uuid_v4();
        assert_eq!(id.len(), 36);
        assert_eq!(id.chars().filter(|&c| c == '-').count(), 4);
    }

    #[test]
    fn base64_round_trips() {
        let bytes = random_bytes(20);
        let encoded = base64_encode(&bytes);
        assert_eq!(base64_decode(&encoded).unwrap(), bytes);
    }
}
