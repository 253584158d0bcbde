use thiserror::Error;

/// Error taxonomy shared by every component and mirrored 1:1 by the C ABI
/// error enum in `familyvault-ffi`.
#[derive(Error, Debug)]
pub enum FamilyVaultError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("resource busy: {0}")]
    Busy(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("mDNS error: {0}")]
    Mdns(#[from] mdns_sd::Error),

    #[error("QUIC connect error: {0}")]
    QuicConnect(#[from] quinn::ConnectError),

    #[error("QUIC connection error: {0}")]
    QuicConnection(#[from] quinn::ConnectionError),

    #[error("QUIC write error: {0}")]
    QuicWrite(#[from] quinn::WriteError),

    #[error("QUIC read error: {0}")]
    QuicRead(#[from] quinn::ReadExactError),

    #[error("QUIC read to end error: {0}")]
    QuicReadToEnd(#[from] quinn::ReadToEndError),

    #[error("QUIC stream closed: {0}")]
    QuicClosedStream(#[from] quinn::ClosedStream),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("certificate generation error: {0}")]
    CertGen(#[from] rcgen::Error),

    #[error("checksum mismatch")]
    ChecksumMismatch,
}

pub type Result<T> = std::result::Result<T, FamilyVaultError>;

impl FamilyVaultError {
    /// The `ErrorCode` this variant maps to across the C ABI boundary.
    pub fn code(&self) -> ErrorCode {
        match self {
            FamilyVaultError::InvalidArgument(_) => ErrorCode::InvalidArgument,
            FamilyVaultError::Database(_) => ErrorCode::Database,
            FamilyVaultError::Io(_) => ErrorCode::Io,
            FamilyVaultError::NotFound(_) => ErrorCode::NotFound,
            FamilyVaultError::AlreadyExists(_) => ErrorCode::AlreadyExists,
            FamilyVaultError::AuthFailed(_) => ErrorCode::AuthFailed,
            FamilyVaultError::Network(_) => ErrorCode::Network,
            FamilyVaultError::Busy(_) => ErrorCode::Busy,
            FamilyVaultError::Internal(_) => ErrorCode::Internal,
            FamilyVaultError::Serialization(_) => ErrorCode::InvalidArgument,
            FamilyVaultError::Mdns(_) => ErrorCode::Network,
            FamilyVaultError::QuicConnect(_)
            | FamilyVaultError::QuicConnection(_)
            | FamilyVaultError::QuicWrite(_)
            | FamilyVaultError::QuicRead(_)
            | FamilyVaultError::QuicReadToEnd(_)
            | FamilyVaultError::QuicClosedStream(_) => ErrorCode::Network,
            FamilyVaultError::Tls(_) | FamilyVaultError::CertGen(_) => ErrorCode::AuthFailed,
            FamilyVaultError::ChecksumMismatch => ErrorCode::Internal,
        }
    }
}

/// The C ABI error enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ErrorCode {
    Ok = 0,
    InvalidArgument = 1,
    Database = 2,
    Io = 3,
    NotFound = 4,
    AlreadyExists = 5,
    AuthFailed = 6,
    Network = 7,
    Busy = 8,
    Internal = 9,
}

/// Pairing-specific error mapping: the UI needs a precise prompt for
/// `InvalidPin` / `Expired` / `RateLimited` distinct from a generic
/// `AuthFailed` / `Network`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PairingError {
    #[error("invalid pin")]
    InvalidPin,
    #[error("pairing session expired")]
    Expired,
    #[error("too many attempts, try again later")]
    RateLimited,
    #[error("network error")]
    NetworkError,
    #[error("device already configured")]
    AlreadyConfigured,
    #[error("internal error")]
    InternalError,
}
