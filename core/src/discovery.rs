//! LAN-wide periodic announce + passive listen of peer identity records.
//! An `mdns-sd`-based announce/browse/cleanup thread trio, with a
//! virtual-interface blocklist and found/updated/lost transition
//! bookkeeping driving a `Peer` record and a three-event model
//! (`DeviceFound`/`DeviceUpdated`/`DeviceLost`).
//!
//! Discovery never authenticates: a peer is worthy of trust only once
//! `TlsPskTransport` completes its PSK challenge.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use mdns_sd::{IfKind, ServiceDaemon, ServiceEvent, ServiceInfo};
use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::device::{DeviceIdentity, DeviceType};
use crate::error::{FamilyVaultError, Result};

const SERVICE_TYPE: &str = "_familyvault._udp.local.";
const REANNOUNCE_INTERVAL: Duration = Duration::from_secs(5);
const BROWSE_TIMEOUT: Duration = Duration::from_millis(100);
const DEVICE_STALE_TIMEOUT: Duration = Duration::from_secs(30); // t_lost
const CLEANUP_INTERVAL: Duration = Duration::from_secs(2);
const PROTOCOL_VERSION: u32 = 1;
const MIN_COMPATIBLE_VERSION: u32 = 1;

const VIRTUAL_INTERFACE_PATTERNS: &[&str] = &[
    "vmnet", "vmware", "virtualbox", "vboxnet", "vethernet", "hyper-v", "wsl", "docker", "br-",
    "veth", "virbr", "lxcbr", "lxdbr", "podman", "cni", "flannel", "calico", "weave", "loopback",
    "bluetooth", "tap-", "tun", "utun", "pptp", "ipsec", "wireguard", "wg", "nordlynx", "proton",
    "mullvad",
];

/// Ephemeral peer record.
#[derive(Debug, Clone, PartialEq)]
pub struct Peer {
    pub device_id: String,
    pub device_name: String,
    pub device_type: DeviceType,
    pub ip_address: String,
    pub service_port: u16,
    pub last_seen_at: i64,
}

#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    DeviceFound(Peer),
    DeviceUpdated(Peer),
    DeviceLost(String),
    Error(String),
}

fn now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

struct TrackedPeer {
    peer: Peer,
    last_seen: Instant,
}

pub struct DiscoveryService {
    daemon: ServiceDaemon,
    local_identity: DeviceIdentity,
    service_port: u16,
    peers: Arc<RwLock<HashMap<String, TrackedPeer>>>,
    running: Arc<AtomicBool>,
    service_fullname: String,
    thread_handles: RwLock<Vec<JoinHandle<()>>>,
}

impl DiscoveryService {
    pub fn new(local_identity: DeviceIdentity, service_port: u16) -> Result<Self> {
        let daemon = ServiceDaemon::new()?;
        Self::disable_virtual_interfaces(&daemon);

        let instance_name = Self::create_instance_name(&local_identity);
        let service_fullname = format!("{instance_name}.{SERVICE_TYPE}");

        Ok(Self {
            daemon,
            local_identity,
            service_port,
            peers: Arc::new(RwLock::new(HashMap::new())),
            running: Arc::new(AtomicBool::new(false)),
            service_fullname,
            thread_handles: RwLock::new(Vec::new()),
        })
    }

    fn disable_virtual_interfaces(daemon: &ServiceDaemon) {
        for pattern in VIRTUAL_INTERFACE_PATTERNS {
            let _ = daemon.disable_interface(IfKind::Name(format!("*{pattern}*")));
        }
    }

    /// "name--uuid" double-dash format, parsed back by `parse_instance_name`.
    fn create_instance_name(identity: &DeviceIdentity) -> String {
        format!("{}--{}", identity.device_name, identity.device_id)
    }

    fn parse_instance_name(instance: &str) -> Option<(String, String)> {
        let (name, id) = instance.rsplit_once("--")?;
        Some((name.to_string(), id.to_string()))
    }

    fn build_txt(&self) -> HashMap<String, String> {
        let mut txt = HashMap::new();
        txt.insert("id".to_string(), self.local_identity.device_id.clone());
        txt.insert("name".to_string(), self.local_identity.device_name.clone());
        txt.insert(
            "type".to_string(),
            self.local_identity.device_type.as_str().to_string(),
        );
        txt.insert("version".to_string(), PROTOCOL_VERSION.to_string());
        txt
    }

    fn do_announce(&self) -> Result<()> {
        let host_ip = local_ip_guess();
        let instance_name = Self::create_instance_name(&self.local_identity);
        let service_info = ServiceInfo::new(
            SERVICE_TYPE,
            &instance_name,
            &format!("{}.local.", instance_name.replace(' ', "-")),
            host_ip.as_str(),
            self.service_port,
            self.build_txt(),
        )
        .map_err(|e| FamilyVaultError::Internal(format!("mdns service info: {e}")))?;
        self.daemon.register(service_info)?;
        Ok(())
    }

    pub fn start_listening(
        self: &Arc<Self>,
        event_tx: mpsc::UnboundedSender<DiscoveryEvent>,
    ) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.do_announce()?;

        let receiver = self.daemon.browse(SERVICE_TYPE).map_err(FamilyVaultError::Mdns)?;

        let mut handles = Vec::new();

        {
            let this = Arc::clone(self);
            let tx = event_tx.clone();
            handles.push(
                std::thread::Builder::new()
                    .name("mdns-discovery".into())
                    .spawn(move || this.browse_loop(receiver, tx))
                    .expect("failed to spawn mdns-discovery thread"),
            );
        }
        {
            let this = Arc::clone(self);
            handles.push(
                std::thread::Builder::new()
                    .name("mdns-announce".into())
                    .spawn(move || this.announce_loop())
                    .expect("failed to spawn mdns-announce thread"),
            );
        }
        {
            let this = Arc::clone(self);
            let tx = event_tx.clone();
            handles.push(
                std::thread::Builder::new()
                    .name("mdns-cleanup".into())
                    .spawn(move || this.cleanup_loop(tx))
                    .expect("failed to spawn mdns-cleanup thread"),
            );
        }

        *self.thread_handles.write() = handles;
        Ok(())
    }

    fn browse_loop(
        &self,
        receiver: mdns_sd::Receiver<ServiceEvent>,
        tx: mpsc::UnboundedSender<DiscoveryEvent>,
    ) {
        while self.running.load(Ordering::SeqCst) {
            if let Ok(event) = receiver.recv_timeout(BROWSE_TIMEOUT) {
                if let ServiceEvent::ServiceResolved(info) = event {
                    self.handle_service_resolved(&info, &tx);
                }
            }
        }
    }

    fn handle_service_resolved(&self, info: &ServiceInfo, tx: &mpsc::UnboundedSender<DiscoveryEvent>) {
        let props = info.get_properties();
        let device_id = props
            .get_property_val_str("id")
            .map(str::to_string)
            .or_else(|| Self::parse_instance_name(info.get_fullname()).map(|(_, id)| id));
        let Some(device_id) = device_id else { return };
        if device_id == self.local_identity.device_id {
            return; // don't track ourselves
        }

        let version: u32 = props
            .get_property_val_str("version")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        if version < MIN_COMPATIBLE_VERSION {
            return;
        }

        let device_name = props
            .get_property_val_str("name")
            .unwrap_or("unknown")
            .to_string();
        let device_type = props
            .get_property_val_str("type")
            .and_then(|t| t.parse().ok())
            .unwrap_or(DeviceType::Desktop);
        let ip_address = info
            .get_addresses()
            .iter()
            .next()
            .map(|a| a.to_string())
            .unwrap_or_default();

        let peer = Peer {
            device_id: device_id.clone(),
            device_name,
            device_type,
            ip_address,
            service_port: info.get_port(),
            last_seen_at: now(),
        };

        let mut peers = self.peers.write();
        match peers.get(&device_id) {
            None => {
                peers.insert(
                    device_id,
                    TrackedPeer {
                        peer: peer.clone(),
                        last_seen: Instant::now(),
                    },
                );
                let _ = tx.send(DiscoveryEvent::DeviceFound(peer));
            }
            Some(existing) => {
                let changed = existing.peer.device_name != peer.device_name
                    || existing.peer.ip_address != peer.ip_address
                    || existing.peer.service_port != peer.service_port;
                peers.insert(
                    device_id,
                    TrackedPeer {
                        peer: peer.clone(),
                        last_seen: Instant::now(),
                    },
                );
                if changed {
                    let _ = tx.send(DiscoveryEvent::DeviceUpdated(peer));
                }
            }
        }
    }

    fn announce_loop(&self) {
        while self.running.load(Ordering::SeqCst) {
            std::thread::sleep(REANNOUNCE_INTERVAL);
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            if let Err(e) = self.do_announce() {
                tracing::warn!(error = %e, "mdns re-announce failed");
            }
        }
    }

    fn cleanup_loop(&self, tx: mpsc::UnboundedSender<DiscoveryEvent>) {
        while self.running.load(Ordering::SeqCst) {
            std::thread::sleep(CLEANUP_INTERVAL);
            let mut stale_ids = Vec::new();
            {
                let peers = self.peers.read();
                for (id, tracked) in peers.iter() {
                    if tracked.last_seen.elapsed() > DEVICE_STALE_TIMEOUT {
                        stale_ids.push(id.clone());
                    }
                }
            }
            if !stale_ids.is_empty() {
                let mut peers = self.peers.write();
                for id in stale_ids {
                    peers.remove(&id);
                    let _ = tx.send(DiscoveryEvent::DeviceLost(id));
                }
            }
        }
    }

    pub fn get_discovered_peers(&self) -> Vec<Peer> {
        self.peers.read().values().map(|t| t.peer.clone()).collect()
    }

    pub fn get_peer(&self, device_id: &str) -> Option<Peer> {
        self.peers.read().get(device_id).map(|t| t.peer.clone())
    }

    /// Stops all threads, unregisters the mDNS service, joins the threads
    /// with a short timeout to let goodbye packets go out.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.daemon.unregister(&self.service_fullname);
        std::thread::sleep(Duration::from_millis(50));
        for handle in self.thread_handles.write().drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for DiscoveryService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// mdns-sd resolves its own outgoing interfaces once virtual adapters are
/// disabled above, so `ServiceInfo::new` is given "0.0.0.0" rather than a
/// hand-picked address.
fn local_ip_guess() -> String {
    "0.0.0.0".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_name_round_trips() {
        let identity = DeviceIdentity::new("Kitchen iPad", DeviceType::Tablet);
        let instance = DiscoveryService::create_instance_name(&identity);
        let (name, id) = DiscoveryService::parse_instance_name(&instance).unwrap();
        assert_eq!(name, "Kitchen iPad");
        assert_eq!(id, identity.device_id);
    }

    #[test]
    fn create_instance_name_uses_double_dash() {
        let identity = DeviceIdentity::new("Office PC", DeviceType::Desktop);
        let instance = DiscoveryService::create_instance_name(&identity);
        assert!(instance.contains("--"));
    }
}
