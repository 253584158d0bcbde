//! FamilyPairing: generates and validates the short-lived PIN, derives the
//! long-lived family secret and the transport PSK. Identity persistence
//! (device_id generation, SecureStorage-backed durability) follows the
//! same pattern used for certificate identity elsewhere, but there is no
//! per-peer trust database here — membership is proven by PIN/PSK
//! possession, not a certificate-trust lifecycle.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;

use crate::crypto;
use crate::error::PairingError;
use crate::secure_storage::{SecureStorage, KEY_DEVICE_ID, KEY_DEVICE_NAME, KEY_FAMILY_SECRET};

const PIN_TTL_SECS: i64 = 300;
const MAX_FAILURES: u32 = 3;
const RATE_LIMIT_SECS: i64 = 30;

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[derive(Debug, Clone)]
pub struct PairingSession {
    pub nonce: Vec<u8>,
    pub pin: String,
    pub created_at: i64,
    pub expires_at: i64,
    pub failed_attempts: u32,
    pub rate_limit_until: Option<i64>,
}

impl PairingSession {
    pub fn seconds_remaining(&self) -> i64 {
        self.expires_at - now()
    }

    pub fn is_expired(&self) -> bool {
        now() >= self.expires_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Success,
}

/// The URL-form QR payload: `fv://join?pin=<pin>&host=<ip>&port=<port>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QrCodeData {
    pub pin: String,
    pub host: String,
    pub port: u16,
}

impl QrCodeData {
    pub fn to_url(&self) -> String {
        format!("fv://join?pin={}&host={}&port={}", self.pin, self.host, self.port)
    }

    pub fn from_url(url: &str) -> Option<Self> {
        let rest = url.strip_prefix("fv://join?")?;
        let mut pin = None;
        let mut host = None;
        let mut port = None;
        for pair in rest.split('&') {
            let mut kv = pair.splitn(2, '=');
            let (k, v) = (kv.next()?, kv.next()?);
            match k {
                "pin" => pin = Some(v.to_string()),
                "host" => host = Some(v.to_string()),
                "port" => port = v.parse::<u16>().ok(),
                _ => {}
            }
        }
        Some(QrCodeData {
            pin: pin?,
            host: host?,
            port: port?,
        })
    }

    /// Backward-compatible base64(JSON) form with an embedded nonce; only
    /// accepted on parse, never produced by `to_base64`'s counterpart here
    /// since the primary form is the URL.
    pub fn to_base64(&self) -> crate::error::Result<String> {
        let json = serde_json::json!({
            "pin": self.pin,
            "host": self.host,
            "port": self.port,
        });
        Ok(crypto::base64_encode(serde_json::to_vec(&json)?.as_slice()))
    }

    pub fn from_base64(s: &str) -> Option<Self> {
        let bytes = crypto::base64_decode(s).ok()?;
        let value: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
        Some(QrCodeData {
            pin: value.get("pin")?.as_str()?.to_string(),
            host: value.get("host")?.as_str()?.to_string(),
            port: value.get("port")?.as_u64()? as u16,
        })
    }
}

pub struct FamilyPairing {
    storage: Arc<dyn SecureStorage>,
    session: RwLock<Option<PairingSession>>,
}

impl FamilyPairing {
    pub fn new(storage: Arc<dyn SecureStorage>) -> Self {
        Self {
            storage,
            session: RwLock::new(None),
        }
    }

    pub fn device_id(&self) -> crate::error::Result<String> {
        if let Some(id) = self.storage.retrieve_string(KEY_DEVICE_ID)? {
            return Ok(id);
        }
        let id = crypto::uuid_v4();
        self.storage.store_string(KEY_DEVICE_ID, &id)?;
        Ok(id)
    }

    pub fn is_configured(&self) -> crate::error::Result<bool> {
        Ok(self.storage.exists(KEY_FAMILY_SECRET)?)
    }

    /// Create flow: generates and persists a new family secret,
    /// a nonce, derives the PIN, sets a 5-minute expiry. Starting the
    /// `PairingServer` is the caller's responsibility (see
    /// `pairing_protocol.rs`); this call only prepares the session.
    pub fn create_family(&self, host: &str, port: u16) -> crate::error::Result<QrCodeData> {
        let secret = crypto::random_bytes(32);
        self.storage.store(KEY_FAMILY_SECRET, &secret)?;
        let qr = self.start_new_session(host, port)?;
        Ok(qr)
    }

    /// `regenerate_pin` makes a new nonce and restarts the session.
    pub fn regenerate_pin(&self, host: &str, port: u16) -> crate::error::Result<QrCodeData> {
        self.start_new_session(host, port)
    }

    fn start_new_session(&self, host: &str, port: u16) -> crate::error::Result<QrCodeData> {
        let secret = self
            .storage
            .retrieve(KEY_FAMILY_SECRET)?
            .ok_or_else(|| crate::error::FamilyVaultError::NotFound("family_secret".into()))?;
        let nonce = crypto::random_bytes(16);
        let pin = crypto::pin(&secret, &nonce)?;
        let created_at = now();
        *self.session.write() = Some(PairingSession {
            nonce,
            pin: pin.clone(),
            created_at,
            expires_at: created_at + PIN_TTL_SECS,
            failed_attempts: 0,
            rate_limit_until: None,
        });
        Ok(QrCodeData {
            pin,
            host: host.to_string(),
            port,
        })
    }

    /// Deletes the family secret; evicts this device from the family.
    pub fn reset(&self) -> crate::error::Result<()> {
        self.storage.remove(KEY_FAMILY_SECRET)?;
        *self.session.write() = None;
        Ok(())
    }

    /// The raw family secret, as transmitted to a newly-joining device on
    /// successful pairing. Never logged.
    pub fn family_secret(&self) -> crate::error::Result<Vec<u8>> {
        self.storage
            .retrieve(KEY_FAMILY_SECRET)?
            .ok_or_else(|| crate::error::FamilyVaultError::NotFound("family_secret".into()))
    }

    pub fn derive_psk(&self) -> crate::error::Result<[u8; 32]> {
        let secret = self
            .storage
            .retrieve(KEY_FAMILY_SECRET)?
            .ok_or_else(|| crate::error::FamilyVaultError::NotFound("family_secret".into()))?;
        crypto::derive_psk(&secret)
    }

    /// Server-side validation: refuses if no active session or
    /// expired; derives the expected PIN and compares in constant time; on
    /// mismatch increments a failure counter, on reaching 3 failures sets a
    /// 30-second cooldown.
    pub fn validate_pin(&self, candidate_pin: &str) -> Result<(), PairingError> {
        let secret = self
            .storage
            .retrieve(KEY_FAMILY_SECRET)
            .ok()
            .flatten()
            .ok_or(PairingError::InternalError)?;

        let mut guard = self.session.write();
        let session = guard.as_mut().ok_or(PairingError::Expired)?;
        if session.is_expired() {
            return Err(PairingError::Expired);
        }
        if let Some(until) = session.rate_limit_until {
            if now() < until {
                return Err(PairingError::RateLimited);
            }
            session.rate_limit_until = None;
            session.failed_attempts = 0;
        }

        let expected = crypto::pin(&secret, &session.nonce).map_err(|_| PairingError::InternalError)?;
        if crypto::constant_time_eq(expected.as_bytes(), candidate_pin.as_bytes()) {
            session.failed_attempts = 0;
            return Ok(());
        }

        session.failed_attempts += 1;
        if session.failed_attempts >= MAX_FAILURES {
            session.rate_limit_until = Some(now() + RATE_LIMIT_SECS);
            return Err(PairingError::RateLimited);
        }
        Err(PairingError::InvalidPin)
    }

    /// Join flow completion on success: persists the received family secret
    /// and local device identity.
    pub fn complete_join(
        &self,
        family_secret: &[u8],
        device_name: &str,
    ) -> Result<JoinOutcome, PairingError> {
        if self.is_configured().map_err(|_| PairingError::InternalError)? {
            return Err(PairingError::AlreadyConfigured);
        }
        self.storage
            .store(KEY_FAMILY_SECRET, family_secret)
            .map_err(|_| PairingError::InternalError)?;
        self.storage
            .store_string(KEY_DEVICE_NAME, device_name)
            .map_err(|_| PairingError::InternalError)?;
        let _ = self.device_id().map_err(|_| PairingError::InternalError)?;
        Ok(JoinOutcome::Success)
    }

    pub fn current_session(&self) -> Option<PairingSession> {
        self.session.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secure_storage::MemoryStorage;

    #[test]
    fn create_family_yields_six_digit_pin() {
        let fp = FamilyPairing::new(Arc::new(MemoryStorage::default()));
        let qr = fp.create_family("127.0.0.1", 45680).unwrap();
        assert_eq!(qr.pin.len(), 6);
        assert!(qr.pin.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn three_wrong_pins_then_rate_limited() {
        let fp = FamilyPairing::new(Arc::new(MemoryStorage::default()));
        fp.create_family("127.0.0.1", 45680).unwrap();
        assert_eq!(fp.validate_pin("000000"), Err(PairingError::InvalidPin));
        assert_eq!(fp.validate_pin("000000"), Err(PairingError::InvalidPin));
        assert_eq!(fp.validate_pin("000000"), Err(PairingError::RateLimited));
        assert_eq!(fp.validate_pin("000000"), Err(PairingError::RateLimited));
    }

    #[test]
    fn correct_pin_succeeds() {
        let fp = FamilyPairing::new(Arc::new(MemoryStorage::default()));
        let qr = fp.create_family("127.0.0.1", 45680).unwrap();
        assert_eq!(fp.validate_pin(&qr.pin), Ok(()));
    }

    #[test]
    fn qr_url_round_trips() {
        let qr = QrCodeData {
            pin: "123456".to_string(),
            host: "192.168.1.5".to_string(),
            port: 45680,
        };
        let url = qr.to_url();
        assert_eq!(QrCodeData::from_url(&url), Some(qr));
    }

    #[test]
    fn qr_base64_round_trips() {
        let qr = QrCodeData {
            pin: "654321".to_string(),
            host: "10.0.0.2".to_string(),
            port: 45680,
        };
        let b64 = qr.to_base64().unwrap();
        assert_eq!(QrCodeData::from_base64(&b64), Some(qr));
    }
}
