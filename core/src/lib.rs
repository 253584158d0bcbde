pub mod config;
pub mod content_extractor;
pub mod crypto;
pub mod device;
pub mod discovery;
pub mod duplicates;
pub mod error;
pub mod events;
pub mod file_transfer;
pub mod index_manager;
pub mod index_sync;
pub mod network;
pub mod pairing;
pub mod pairing_protocol;
pub mod scanner;
pub mod search;
pub mod secure_storage;
pub mod store;
pub mod tags;
pub mod transport;

pub use config::Config;
pub use content_extractor::{ContentExtractor, Extraction, ExtractorRegistry, TextExtractor};
pub use device::{DeviceIdentity, DeviceType};
pub use discovery::{DiscoveryEvent, DiscoveryService, Peer};
pub use duplicates::{DuplicateFinder, DuplicateGroup};
pub use error::{ErrorCode, FamilyVaultError, PairingError, Result};
pub use events::{FamilyVaultEvent, NetworkState};
pub use file_transfer::{FileCache, FileTransferManager, TransferProgress};
pub use index_manager::{Folder, IndexManager, Visibility};
pub use index_sync::{IndexNotify, IndexRequest, IndexResponse, IndexSync, SyncRow};
pub use network::NetworkManager;
pub use pairing::{FamilyPairing, JoinOutcome, QrCodeData};
pub use pairing_protocol::{JoinError, PairingClient, PairingServer};
pub use scanner::{ContentType, ScanFilters, ScannedFile, Scanner};
pub use search::{SearchEngine, SearchQuery, SearchResult, SortDirection, SortField};
pub use secure_storage::{EncryptedFileStorage, MemoryStorage, SecureStorage};
pub use store::Store;
pub use tags::{Tag, TagManager, TagSource};
