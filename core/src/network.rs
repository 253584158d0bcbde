//! NetworkManager: owns the state machine
//! `Stopped -> Starting -> Running -> Stopping -> Stopped` (with `Error`
//! reachable from any state), composes `DiscoveryService` + `TlsPskTransport`
//! + `IndexSync` + `FileTransferManager`, and routes every subsystem's
//! events through one callback sized to cross the FFI boundary.
//!
//! A connection table keyed by `device_id` multiplexes several logical
//! purposes — discovery event forwarding, the accept loop, sync and file
//! transfer — over the `STREAM_TYPE_*`-tagged streams `transport.rs`
//! defines, rather than one connection per purpose.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use quinn::{Connection, RecvStream, SendStream};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::device::DeviceIdentity;
use crate::discovery::{DiscoveryEvent, DiscoveryService, Peer};
use crate::error::{FamilyVaultError, Result};
use crate::events::{FamilyVaultEvent, NetworkState};
use crate::file_transfer::{FileCache, FileTransferManager};
use crate::index_sync::{IndexNotify, IndexRequest, IndexResponse, IndexSync, SyncRow};
use crate::store::Store;
use crate::transport::{
    read_frame, read_u8, write_frame, write_u8, TlsPskTransport, STREAM_TYPE_FILE,
    STREAM_TYPE_SYNC,
};

const MAX_SYNC_FRAME: usize = 8 * 1024 * 1024;
const CLEANUP_INTERVAL: Duration = Duration::from_secs(30);
const STALE_TRANSFER_IDLE: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Serialize, Deserialize)]
enum SyncMessage {
    Request(IndexRequest),
    Notify(IndexNotify),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum SyncReply {
    Response(IndexResponse),
    Applied { rows_applied: u64 },
}

type EventCallback = Arc<dyn Fn(FamilyVaultEvent) + Send + Sync>;

/// True if a newly-observed connection to `remote_id` should replace an
/// already-tracked one, given which side dialed it. The lower device_id's
/// own outbound dial is authoritative — deterministic without the two
/// sides needing to coordinate over the wire.
fn new_connection_wins(local_id: &str, remote_id: &str, dialed_by_us: bool) -> bool {
    if local_id < remote_id {
        dialed_by_us
    } else {
        !dialed_by_us
    }
}

pub struct NetworkManager {
    local_identity: DeviceIdentity,
    discovery: Arc<DiscoveryService>,
    transport: Arc<TlsPskTransport>,
    index_sync: Arc<IndexSync>,
    file_transfer: Arc<FileTransferManager>,
    connections: RwLock<HashMap<String, Connection>>,
    connect_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    state: RwLock<NetworkState>,
    event_cb: RwLock<Option<EventCallback>>,
    shutdown: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl NetworkManager {
    pub fn new(
        local_identity: DeviceIdentity,
        bind_addr: SocketAddr,
        psk: [u8; 32],
        store: Store,
        cache: FileCache,
    ) -> Result<Self> {
        let discovery = Arc::new(DiscoveryService::new(local_identity.clone(), bind_addr.port())?);
        let transport = Arc::new(TlsPskTransport::new(
            bind_addr,
            local_identity.device_id.clone(),
            psk,
        )?);
        Ok(Self {
            local_identity,
            discovery,
            transport,
            index_sync: Arc::new(IndexSync::new(store.clone())),
            file_transfer: Arc::new(FileTransferManager::new(store, cache)),
            connections: RwLock::new(HashMap::new()),
            connect_locks: Mutex::new(HashMap::new()),
            state: RwLock::new(NetworkState::Stopped),
            event_cb: RwLock::new(None),
            shutdown: Arc::new(AtomicBool::new(false)),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn local_device_id(&self) -> &str {
        &self.local_identity.device_id
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.transport.local_addr()
    }

    pub fn state(&self) -> NetworkState {
        *self.state.read()
    }

    pub fn file_transfer(&self) -> &Arc<FileTransferManager> {
        &self.file_transfer
    }

    pub fn index_sync(&self) -> &Arc<IndexSync> {
        &self.index_sync
    }

    pub fn discovered_peers(&self) -> Vec<Peer> {
        self.discovery.get_discovered_peers()
    }

    /// Derives the PSK from `FamilyPairing`, starts discovery and the
    /// transport accept loop, and installs `event_cb` for every routed
    /// event. Idempotent: calling `start` while already `Running` is a
    /// no-op other than replacing the callback.
    pub fn start(
        self: &Arc<Self>,
        event_cb: impl Fn(FamilyVaultEvent) + Send + Sync + 'static,
    ) -> Result<()> {
        *self.event_cb.write() = Some(Arc::new(event_cb));
        self.set_state(NetworkState::Starting);

        let (disc_tx, mut disc_rx) = mpsc::unbounded_channel();
        if let Err(e) = self.discovery.start_listening(disc_tx) {
            self.set_state(NetworkState::Error);
            return Err(e);
        }

        let this = self.clone();
        self.tasks.lock().push(tokio::spawn(async move {
            while let Some(event) = disc_rx.recv().await {
                this.handle_discovery_event(event);
            }
        }));

        let this = self.clone();
        self.tasks
            .lock()
            .push(tokio::spawn(async move { this.accept_loop().await }));

        let this = self.clone();
        self.tasks
            .lock()
            .push(tokio::spawn(async move { this.cleanup_loop().await }));

        self.set_state(NetworkState::Running);
        Ok(())
    }

    /// Closes the accept socket and every live connection, then joins the
    /// background tasks. Pending callbacks have already been dispatched
    /// synchronously from their originating task by the time this returns.
    pub async fn stop(&self) {
        self.set_state(NetworkState::Stopping);
        self.shutdown.store(true, Ordering::Relaxed);
        self.disconnect_all();
        self.transport.close();
        self.discovery.shutdown();
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
        self.set_state(NetworkState::Stopped);
    }

    pub async fn connect_to_device(self: &Arc<Self>, device_id: &str) -> Result<()> {
        let peer = self
            .discovery
            .get_peer(device_id)
            .ok_or_else(|| FamilyVaultError::NotFound(format!("peer {device_id}")))?;
        let addr: SocketAddr = format!("{}:{}", peer.ip_address, peer.service_port)
            .parse()
            .map_err(|_| FamilyVaultError::InvalidArgument("bad peer address".into()))?;
        self.connect_to_address(addr, device_id).await
    }

    /// Duplicate connects to the same device coalesce on a per-device lock;
    /// a concurrent caller waits for the in-flight attempt instead of
    /// opening a second connection.
    pub async fn connect_to_address(
        self: &Arc<Self>,
        addr: SocketAddr,
        expected_device_id: &str,
    ) -> Result<()> {
        if self.is_connected_to(expected_device_id) {
            return Ok(());
        }
        let lock = self
            .connect_locks
            .lock()
            .entry(expected_device_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;
        if self.is_connected_to(expected_device_id) {
            return Ok(());
        }

        match self.transport.connect(addr, expected_device_id).await {
            Ok(connection) => {
                self.register_connection(connection, expected_device_id.to_string(), true);
                Ok(())
            }
            Err(e) => {
                self.emit(FamilyVaultEvent::Error {
                    message: format!("connect to {expected_device_id} failed: {e}"),
                });
                Err(e)
            }
        }
    }

    pub fn disconnect_device(&self, device_id: &str) {
        if let Some(connection) = self.connections.write().remove(device_id) {
            connection.close(0u32.into(), b"disconnect");
            self.transport.invalidate_connection(device_id);
            self.file_transfer.cancel_for_device(device_id);
            self.emit(FamilyVaultEvent::DeviceDisconnected {
                device_id: device_id.to_string(),
            });
        }
    }

    pub fn disconnect_all(&self) {
        let ids: Vec<String> = self.connections.read().keys().cloned().collect();
        for id in ids {
            self.disconnect_device(&id);
        }
    }

    pub fn is_connected_to(&self, device_id: &str) -> bool {
        self.connections.read().contains_key(device_id)
    }

    pub fn connected_devices(&self) -> Vec<String> {
        self.connections.read().keys().cloned().collect()
    }

    fn register_connection(self: &Arc<Self>, connection: Connection, device_id: String, dialed_by_us: bool) {
        if !self.insert_connection(connection.clone(), &device_id, dialed_by_us) {
            return;
        }
        // Streams can arrive on either side of a full-duplex QUIC connection
        // regardless of who dialed, so both sides run the accept-stream loop
        // on their own connection handle.
        let this = self.clone();
        let peer = device_id.clone();
        self.tasks
            .lock()
            .push(tokio::spawn(async move { this.dispatch_streams(connection, peer).await }));
        self.spawn_sync_loop(device_id);
    }

    /// Returns `true` if `connection` became (or remains) the tracked
    /// connection for `device_id`; `false` if it lost the tie-break and was
    /// closed instead.
    fn insert_connection(&self, connection: Connection, device_id: &str, dialed_by_us: bool) -> bool {
        let mut connections = self.connections.write();
        if let Some(existing) = connections.remove(device_id) {
            if new_connection_wins(&self.local_identity.device_id, device_id, dialed_by_us) {
                existing.close(0u32.into(), b"duplicate-connection");
            } else {
                connections.insert(device_id.to_string(), existing);
                connection.close(0u32.into(), b"duplicate-connection");
                return false;
            }
        }
        connections.insert(device_id.to_string(), connection);
        self.emit(FamilyVaultEvent::DeviceConnected {
            device_id: device_id.to_string(),
        });
        true
    }

    async fn accept_loop(self: Arc<Self>) {
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }
            match self.transport.accept().await {
                Ok((connection, peer_id)) => {
                    self.register_connection(connection, peer_id, false);
                }
                Err(e) => {
                    if self.shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                    tracing::warn!(error = %e, "transport accept failed");
                }
            }
        }
    }

    async fn dispatch_streams(self: Arc<Self>, connection: Connection, peer_id: String) {
        loop {
            match connection.accept_bi().await {
                Ok((send, recv)) => {
                    let this = self.clone();
                    let peer = peer_id.clone();
                    tokio::spawn(async move { this.dispatch_one_stream(send, recv, peer).await });
                }
                Err(_) => break,
            }
        }
        self.disconnect_device(&peer_id);
    }

    async fn dispatch_one_stream(self: Arc<Self>, mut send: SendStream, mut recv: RecvStream, peer_id: String) {
        let stream_type = match read_u8(&mut recv).await {
            Ok(t) => t,
            Err(_) => return,
        };
        let result = match stream_type {
            STREAM_TYPE_SYNC => self.handle_sync_stream(send, recv, &peer_id).await,
            STREAM_TYPE_FILE => self.file_transfer.handle_incoming_stream(send, recv).await,
            _ => {
                let _ = send.finish();
                Ok(())
            }
        };
        if let Err(e) = result {
            tracing::warn!(error = %e, peer_id, "stream handling failed");
        }
    }

    async fn handle_sync_stream(&self, mut send: SendStream, mut recv: RecvStream, peer_id: &str) -> Result<()> {
        let bytes = read_frame(&mut recv, MAX_SYNC_FRAME).await?;
        let message: SyncMessage = serde_json::from_slice(&bytes)?;
        match message {
            SyncMessage::Request(req) => {
                let response = self.index_sync.handle_request(&req)?;
                write_frame(&mut send, &serde_json::to_vec(&SyncReply::Response(response))?).await?;
            }
            SyncMessage::Notify(notify) => {
                let applied = self.index_sync.apply_rows(peer_id, &notify.rows)?;
                write_frame(
                    &mut send,
                    &serde_json::to_vec(&SyncReply::Applied { rows_applied: applied })?,
                )
                .await?;
                self.emit(FamilyVaultEvent::SyncCompleted {
                    device_id: peer_id.to_string(),
                    rows_applied: applied,
                });
            }
        }
        Ok(())
    }

    /// Pull-on-connect plus periodic re-pull: each side periodically asks
    /// the other for rows since its cursor, which
    /// converges both directions' state within one `push_interval` without
    /// either side needing a local change-detection hook to trigger an
    /// unsolicited `IndexNotify`. `push_rows_to` below drives that push path
    /// explicitly when a caller already has a batch of changed rows at hand.
    fn spawn_sync_loop(self: &Arc<Self>, device_id: String) {
        let this = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                if this.shutdown.load(Ordering::Relaxed) || !this.is_connected_to(&device_id) {
                    break;
                }
                match this.sync_once(&device_id).await {
                    Ok(()) => {
                        this.index_sync.reset_backoff(&device_id);
                        tokio::time::sleep(this.index_sync.push_interval()).await;
                    }
                    Err(_) => {
                        let backoff = this.index_sync.next_backoff(&device_id);
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    async fn sync_once(&self, device_id: &str) -> Result<()> {
        let connection = self
            .connections
            .read()
            .get(device_id)
            .cloned()
            .ok_or_else(|| FamilyVaultError::NotFound(format!("no connection to {device_id}")))?;

        self.index_sync.set_syncing(device_id, true);
        self.emit(FamilyVaultEvent::SyncStarted {
            device_id: device_id.to_string(),
        });
        let result = self.pull_from(&connection, device_id).await;
        self.index_sync.set_syncing(device_id, false);

        match &result {
            Ok(applied) => self.emit(FamilyVaultEvent::SyncCompleted {
                device_id: device_id.to_string(),
                rows_applied: *applied,
            }),
            Err(e) => self.emit(FamilyVaultEvent::SyncFailed {
                device_id: device_id.to_string(),
                error: e.to_string(),
            }),
        }
        result.map(|_| ())
    }

    async fn pull_from(&self, connection: &Connection, device_id: &str) -> Result<u64> {
        let (mut send, mut recv) = connection
            .open_bi()
            .await
            .map_err(FamilyVaultError::QuicConnection)?;
        write_u8(&mut send, STREAM_TYPE_SYNC).await?;
        let request = self.index_sync.build_request(device_id);
        write_frame(&mut send, &serde_json::to_vec(&SyncMessage::Request(request))?).await?;

        let reply_bytes = read_frame(&mut recv, MAX_SYNC_FRAME).await?;
        let reply: SyncReply = serde_json::from_slice(&reply_bytes)?;
        match reply {
            SyncReply::Response(response) => self.index_sync.apply_rows(device_id, &response.rows),
            SyncReply::Applied { .. } => Err(FamilyVaultError::Network("unexpected sync reply".into())),
        }
    }

    /// Explicit push of an already-known batch of changed rows to
    /// `device_id`, using the wire protocol's `IndexNotify` path rather than
    /// waiting for that peer's own periodic pull to reach us.
    pub async fn push_rows_to(&self, device_id: &str, rows: Vec<SyncRow>) -> Result<u64> {
        let connection = self
            .connections
            .read()
            .get(device_id)
            .cloned()
            .ok_or_else(|| FamilyVaultError::NotFound(format!("no connection to {device_id}")))?;
        let (mut send, mut recv) = connection
            .open_bi()
            .await
            .map_err(FamilyVaultError::QuicConnection)?;
        write_u8(&mut send, STREAM_TYPE_SYNC).await?;
        write_frame(
            &mut send,
            &serde_json::to_vec(&SyncMessage::Notify(IndexNotify { rows }))?,
        )
        .await?;
        let reply_bytes = read_frame(&mut recv, MAX_SYNC_FRAME).await?;
        let reply: SyncReply = serde_json::from_slice(&reply_bytes)?;
        match reply {
            SyncReply::Applied { rows_applied } => Ok(rows_applied),
            SyncReply::Response(_) => Err(FamilyVaultError::Network("unexpected sync reply".into())),
        }
    }

    /// Pulls `file_id` from `source_device_id` over its tracked connection,
    /// delegating to `FileTransferManager::request_file` once the
    /// connection is resolved from `device_id`.
    pub async fn request_file_from(
        &self,
        source_device_id: &str,
        file_id: i64,
        expected_size: Option<u64>,
        expected_checksum: Option<String>,
        extension: Option<&str>,
        on_progress: impl Fn(crate::file_transfer::TransferProgress) + Send + Sync + 'static,
    ) -> Result<std::path::PathBuf> {
        let connection = self
            .connections
            .read()
            .get(source_device_id)
            .cloned()
            .ok_or_else(|| FamilyVaultError::NotFound(format!("no connection to {source_device_id}")))?;
        self.file_transfer
            .request_file(
                &connection,
                source_device_id,
                file_id,
                expected_size,
                expected_checksum,
                extension,
                on_progress,
            )
            .await
    }

    fn handle_discovery_event(&self, event: DiscoveryEvent) {
        match event {
            DiscoveryEvent::DeviceFound(peer) => self.emit(FamilyVaultEvent::DeviceDiscovered {
                device_id: peer.device_id,
                device_name: peer.device_name,
            }),
            DiscoveryEvent::DeviceUpdated(peer) => self.emit(FamilyVaultEvent::DeviceUpdated {
                device_id: peer.device_id,
                device_name: peer.device_name,
            }),
            DiscoveryEvent::DeviceLost(id) => {
                self.disconnect_device(&id);
                self.emit(FamilyVaultEvent::DeviceLost { device_id: id });
            }
            DiscoveryEvent::Error(msg) => self.emit(FamilyVaultEvent::Error { message: msg }),
        }
    }

    async fn cleanup_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
        loop {
            ticker.tick().await;
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }
            self.transport.cleanup_stale_connections();
            let removed = self.file_transfer.sweep_stale(STALE_TRANSFER_IDLE);
            if removed > 0 {
                tracing::debug!(removed, "swept stale pending file transfers");
            }
        }
    }

    fn emit(&self, event: FamilyVaultEvent) {
        if let Some(cb) = self.event_cb.read().as_ref() {
            cb(event);
        }
    }

    fn set_state(&self, state: NetworkState) {
        *self.state.write() = state;
        self.emit(FamilyVaultEvent::StateChanged { state });
    }
}

impl Drop for NetworkManager {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.disconnect_all();
        self.transport.close();
        self.discovery.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lower_device_id_wins_its_own_outbound_dial() {
        assert!(new_connection_wins("a-device", "b-device", true));
        assert!(!new_connection_wins("a-device", "b-device", false));
    }

    #[test]
    fn higher_device_id_defers_to_the_peers_inbound_dial() {
        assert!(!new_connection_wins("z-device", "b-device", true));
        assert!(new_connection_wins("z-device", "b-device", false));
    }
}
