use serde::{Deserialize, Serialize};

/// Events delivered to the embedder. Every variant is a JSON object sized
/// to be safe to marshal across the FFI boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FamilyVaultEvent {
    /// A new device has been discovered on the network.
    DeviceDiscovered {
        device_id: String,
        device_name: String,
    },
    /// A known device's record changed (ip, port, name) without dropping out.
    DeviceUpdated {
        device_id: String,
        device_name: String,
    },
    /// A device is no longer reachable.
    DeviceLost { device_id: String },
    /// A transport connection to a device was established.
    DeviceConnected { device_id: String },
    /// A transport connection to a device was closed.
    DeviceDisconnected { device_id: String },

    /// Directory scan progress.
    ScanProgress {
        folder_id: i64,
        scanned: u64,
        total: u64,
    },
    ScanCompleted { folder_id: i64, file_count: u64 },

    /// Content extraction queue progress.
    ContentExtractionProgress { file_id: i64, remaining: u64 },

    /// File transfer lifecycle.
    TransferStarting {
        request_id: String,
        file_id: String,
        total_size: u64,
    },
    TransferProgress {
        request_id: String,
        bytes_transferred: u64,
        total_size: u64,
    },
    TransferCompleted { request_id: String },
    TransferFailed { request_id: String, error: String },

    /// Index sync progress.
    SyncStarted { device_id: String },
    SyncCompleted { device_id: String, rows_applied: u64 },
    SyncFailed { device_id: String, error: String },

    /// NetworkManager state machine transition.
    StateChanged { state: NetworkState },

    /// Critical error in a subsystem.
    Error { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}
