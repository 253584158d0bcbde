//! PairingServer / PairingClient. A single TCP port serves one in-flight
//! pairing conversation at a time. Framing: 4-byte magic, 1-byte type,
//! 4-byte big-endian length, JSON payload — the same length-prefix shape
//! `file_transfer.rs` uses, but carried over a plain `tokio::net::TcpStream`
//! rather than a QUIC stream, since pairing predates any PSK.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;

use crate::device::DeviceType;
use crate::error::{FamilyVaultError, PairingError, Result};
use crate::pairing::FamilyPairing;

const MAGIC: &[u8; 4] = b"FVP1";
const TYPE_REQUEST: u8 = 0x01;
const TYPE_RESPONSE: u8 = 0x81;
const MAX_PAYLOAD: usize = 64 * 1024;
const CLIENT_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Serialize, Deserialize)]
pub struct PairingRequestPayload {
    pub pin: String,
    pub device_id: String,
    pub device_name: String,
    pub device_type: DeviceType,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum PairingResponsePayload {
    #[serde(rename = "success")]
    Success {
        family_secret: String, // base64
    },
    #[serde(rename = "error")]
    Error { kind: String },
}

async fn write_frame(stream: &mut TcpStream, frame_type: u8, payload: &[u8]) -> Result<()> {
    stream.write_all(MAGIC).await?;
    stream.write_all(&[frame_type]).await?;
    stream.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    stream.write_all(payload).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_frame(stream: &mut TcpStream) -> Result<(u8, Vec<u8>)> {
    let mut magic = [0u8; 4];
    stream.read_exact(&mut magic).await?;
    if &magic != MAGIC {
        return Err(FamilyVaultError::Network("bad pairing frame magic".into()));
    }
    let mut type_byte = [0u8; 1];
    stream.read_exact(&mut type_byte).await?;
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_PAYLOAD {
        return Err(FamilyVaultError::Network("pairing frame too large".into()));
    }
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    Ok((type_byte[0], payload))
}

fn pairing_error_kind(err: &PairingError) -> &'static str {
    match err {
        PairingError::InvalidPin => "invalid_pin",
        PairingError::Expired => "expired",
        PairingError::RateLimited => "rate_limited",
        PairingError::NetworkError => "network_error",
        PairingError::AlreadyConfigured => "already_configured",
        PairingError::InternalError => "internal_error",
    }
}

fn pairing_error_from_kind(kind: &str) -> PairingError {
    match kind {
        "invalid_pin" => PairingError::InvalidPin,
        "expired" => PairingError::Expired,
        "rate_limited" => PairingError::RateLimited,
        "network_error" => PairingError::NetworkError,
        "already_configured" => PairingError::AlreadyConfigured,
        _ => PairingError::InternalError,
    }
}

/// A join attempt fails either because the remote rejected the PIN (a
/// `PairingError`, precise enough to drive a UI prompt) or because the
/// transport itself broke down (a `FamilyVaultError`).
#[derive(Debug, thiserror::Error)]
pub enum JoinError {
    #[error(transparent)]
    Pairing(#[from] PairingError),
    #[error(transparent)]
    Transport(#[from] FamilyVaultError),
}

/// Serves pairing requests for as long as the `FamilyPairing` session stays
/// live; once expired, all requests answer `Expired`. Start/stop is tied to
/// the `FamilyPairing` lifecycle by the caller (typically `NetworkManager`).
pub struct PairingServer {
    shutdown: Arc<Notify>,
}

impl PairingServer {
    pub async fn start(pairing: Arc<FamilyPairing>, port: u16) -> Result<Self> {
        let (_server, _port) = Self::start_with_bound_port(pairing, port).await?;
        Ok(_server)
    }

    /// As `start`, but also returns the bound port — useful when `port` was
    /// `0` and the OS picked an ephemeral one.
    pub async fn start_with_bound_port(
        pairing: Arc<FamilyPairing>,
        port: u16,
    ) -> Result<(Self, u16)> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        let bound_port = listener.local_addr()?.port();
        let shutdown = Arc::new(Notify::new());
        let shutdown_clone = shutdown.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_clone.notified() => break,
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, _addr)) => {
                                let pairing = pairing.clone();
                                tokio::spawn(async move {
                                    if let Err(e) = handle_connection(stream, pairing).await {
                                        tracing::warn!(error = %e, "pairing connection failed");
                                    }
                                });
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "pairing accept failed");
                            }
                        }
                    }
                }
            }
        });

        Ok((Self { shutdown }, bound_port))
    }

    pub fn stop(&self) {
        self.shutdown.notify_one();
    }
}

async fn handle_connection(mut stream: TcpStream, pairing: Arc<FamilyPairing>) -> Result<()> {
    let (frame_type, payload) = read_frame(&mut stream).await?;
    if frame_type != TYPE_REQUEST {
        return Err(FamilyVaultError::Network("unexpected pairing frame type".into()));
    }
    let request: PairingRequestPayload = serde_json::from_slice(&payload)?;

    let response = match pairing.validate_pin(&request.pin) {
        Ok(()) => match pairing.family_secret() {
            Ok(secret) => PairingResponsePayload::Success {
                family_secret: crate::crypto::base64_encode(&secret),
            },
            Err(_) => PairingResponsePayload::Error {
                kind: "internal_error".into(),
            },
        },
        Err(e) => PairingResponsePayload::Error {
            kind: pairing_error_kind(&e).to_string(),
        },
    };

    let bytes = serde_json::to_vec(&response)?;
    write_frame(&mut stream, TYPE_RESPONSE, &bytes).await
}

/// Join flow: connects to the initiator's pairing endpoint, sends the
/// request, and awaits a response within 15 s.
pub struct PairingClient;

impl PairingClient {
    pub async fn join(
        host: &str,
        port: u16,
        pin: &str,
        device_id: &str,
        device_name: &str,
        device_type: DeviceType,
    ) -> std::result::Result<Vec<u8>, JoinError> {
        let connect = TcpStream::connect((host, port));
        let mut stream = tokio::time::timeout(CLIENT_TIMEOUT, connect)
            .await
            .map_err(|_| FamilyVaultError::Network("pairing connect timed out".into()))??;

        let request = PairingRequestPayload {
            pin: pin.to_string(),
            device_id: device_id.to_string(),
            device_name: device_name.to_string(),
            device_type,
        };
        let bytes = serde_json::to_vec(&request).map_err(FamilyVaultError::from)?;
        write_frame(&mut stream, TYPE_REQUEST, &bytes).await?;

        let (_type, payload) = tokio::time::timeout(CLIENT_TIMEOUT, read_frame(&mut stream))
            .await
            .map_err(|_| FamilyVaultError::Network("pairing response timed out".into()))??;
        let response: PairingResponsePayload =
            serde_json::from_slice(&payload).map_err(FamilyVaultError::from)?;
        match response {
            PairingResponsePayload::Success { family_secret } => {
                Ok(crate::crypto::base64_decode(&family_secret)?)
            }
            PairingResponsePayload::Error { kind } => Err(pairing_error_from_kind(&kind).into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secure_storage::MemoryStorage;
    use std::sync::Arc;

    #[tokio::test]
    async fn join_with_correct_pin_over_loopback_succeeds() {
        let pairing = Arc::new(FamilyPairing::new(Arc::new(MemoryStorage::default())));
        let qr = pairing.create_family("127.0.0.1", 0).unwrap();

        let (server, port) = PairingServer::start_with_bound_port(pairing.clone(), 0)
            .await
            .unwrap();

        let secret = PairingClient::join(
            "127.0.0.1",
            port,
            &qr.pin,
            "device-b",
            "Bob's Phone",
            DeviceType::Mobile,
        )
        .await
        .unwrap();

        assert_eq!(secret, pairing.family_secret().unwrap());
        server.stop();
    }
}
