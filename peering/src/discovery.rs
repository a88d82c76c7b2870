use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Mutex, RwLock};
use std::sync::Arc;

use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use models::{DevicePeer, PROTOCOL_VERSION, SERVICE_TYPE, TXT_DEVICE_ID, TXT_NICKNAME, TXT_VERSION};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("discovery failed to start: {0}")]
    StartFailed(String),
    #[error("failed to resolve service record: {0}")]
    ResolveFailed(String),
}

/// Cache of peers seen on the network, keyed by device id. The
/// instance-name map exists because loss events only carry the
/// instance name.
pub struct PeerCache {
    local_device_id: String,
    inner: RwLock<CacheInner>,
    snapshot_tx: watch::Sender<Vec<DevicePeer>>,
}

#[derive(Default)]
struct CacheInner {
    peers: HashMap<String, DevicePeer>,
    instances: HashMap<String, String>, // instance name -> device id
}

impl PeerCache {
    pub fn new(local_device_id: String) -> Self {
        let (snapshot_tx, _) = watch::channel(Vec::new());
        PeerCache {
            local_device_id,
            inner: RwLock::new(CacheInner::default()),
            snapshot_tx,
        }
    }

    /// Insert or refresh a resolved peer. Returns false when the record
    /// matched what we already had (duplicate resolution).
    pub fn upsert(&self, instance: &str, peer: DevicePeer) -> bool {
        if peer.device_id == self.local_device_id {
            return false;
        }
        let changed = {
            let mut inner = self.inner.write().unwrap();
            inner
                .instances
                .insert(instance.to_string(), peer.device_id.clone());
            match inner.peers.get(&peer.device_id) {
                Some(existing) if *existing == peer => false,
                _ => {
                    inner.peers.insert(peer.device_id.clone(), peer);
                    true
                }
            }
        };
        if changed {
            self.publish();
        }
        changed
    }

    /// Handle a loss event. Returns the device id that went offline.
    pub fn mark_offline_instance(&self, instance: &str) -> Option<String> {
        let device_id = {
            let mut inner = self.inner.write().unwrap();
            let device_id = inner.instances.get(instance)?.clone();
            match inner.peers.get_mut(&device_id) {
                Some(peer) if peer.online => peer.online = false,
                _ => return None,
            }
            device_id
        };
        self.publish();
        Some(device_id)
    }

    /// Connectivity is gone; every cached peer is unreachable.
    pub fn mark_all_offline(&self) {
        {
            let mut inner = self.inner.write().unwrap();
            for peer in inner.peers.values_mut() {
                peer.online = false;
            }
        }
        self.publish();
    }

    /// Drop offline records ahead of a browse restart.
    pub fn evict_offline(&self) {
        {
            let mut inner = self.inner.write().unwrap();
            inner.peers.retain(|_, p| p.online);
            let live: std::collections::HashSet<String> =
                inner.peers.keys().cloned().collect();
            inner.instances.retain(|_, id| live.contains(id));
        }
        self.publish();
    }

    pub fn get(&self, device_id: &str) -> Option<DevicePeer> {
        self.inner.read().unwrap().peers.get(device_id).cloned()
    }

    pub fn peers(&self) -> Vec<DevicePeer> {
        let mut peers: Vec<DevicePeer> =
            self.inner.read().unwrap().peers.values().cloned().collect();
        peers.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        peers
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<DevicePeer>> {
        self.snapshot_tx.subscribe()
    }

    fn publish(&self) {
        // send_replace keeps the latest snapshot even with no
        // subscriber listening yet
        self.snapshot_tx.send_replace(self.peers());
    }
}

/// Owns the mDNS daemon and the local service registration, and feeds
/// browse results into the peer cache.
pub struct Discovery {
    daemon: ServiceDaemon,
    cache: Arc<PeerCache>,
    device_id: String,
    nickname: Mutex<String>,
    port: u16,
    registered: Mutex<Option<String>>, // fullname of the active registration
}

impl Discovery {
    pub fn new(device_id: &str, nickname: &str, port: u16) -> Result<Self, DiscoveryError> {
        let daemon =
            ServiceDaemon::new().map_err(|e| DiscoveryError::StartFailed(e.to_string()))?;
        Ok(Discovery {
            daemon,
            cache: Arc::new(PeerCache::new(device_id.to_string())),
            device_id: device_id.to_string(),
            nickname: Mutex::new(nickname.to_string()),
            port,
            registered: Mutex::new(None),
        })
    }

    pub fn cache(&self) -> Arc<PeerCache> {
        Arc::clone(&self.cache)
    }

    /// Publish the local service record. Safe to call again to
    /// re-announce after a connectivity change; a conflicting instance
    /// name is renamed by the daemon and accepted as-is.
    pub fn advertise(&self) -> Result<(), DiscoveryError> {
        let nickname = self.nickname.lock().unwrap().clone();
        let properties = [
            (TXT_DEVICE_ID, self.device_id.as_str()),
            (TXT_NICKNAME, nickname.as_str()),
            (TXT_VERSION, PROTOCOL_VERSION),
        ];
        let hostname = format!("{}.local.", self.device_id);
        let info = ServiceInfo::new(
            SERVICE_TYPE,
            &nickname,
            &hostname,
            "",
            self.port,
            &properties[..],
        )
        .map_err(|e| DiscoveryError::StartFailed(e.to_string()))?
        .enable_addr_auto();

        let fullname = info.get_fullname().to_string();
        self.daemon
            .register(info)
            .map_err(|e| DiscoveryError::StartFailed(e.to_string()))?;
        info!(instance = %fullname, port = self.port, "advertising service");
        *self.registered.lock().unwrap() = Some(fullname);
        Ok(())
    }

    pub fn unadvertise(&self) {
        if let Some(fullname) = self.registered.lock().unwrap().take() {
            if let Err(e) = self.daemon.unregister(&fullname) {
                warn!(instance = %fullname, error = %e, "failed to unregister service");
            }
        }
    }

    /// Update the advertised nickname (settings change) and re-announce.
    pub fn set_nickname(&self, nickname: &str) -> Result<(), DiscoveryError> {
        self.unadvertise();
        *self.nickname.lock().unwrap() = nickname.to_string();
        self.advertise()
    }

    /// Start draining browse events into the cache. The returned task
    /// ends when `token` is cancelled.
    pub fn spawn_browser(&self, token: CancellationToken) -> Result<JoinHandle<()>, DiscoveryError> {
        let receiver = self
            .daemon
            .browse(SERVICE_TYPE)
            .map_err(|e| DiscoveryError::StartFailed(e.to_string()))?;
        let cache = Arc::clone(&self.cache);
        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    event = receiver.recv_async() => {
                        match event {
                            Ok(event) => handle_browse_event(&cache, event),
                            Err(_) => break,
                        }
                    }
                }
            }
        }))
    }

    /// Tear down the current browse and start a fresh one, flushing
    /// stale records first. Used on connectivity-up.
    pub fn restart_browse(&self, token: CancellationToken) -> Result<JoinHandle<()>, DiscoveryError> {
        let _ = self.daemon.stop_browse(SERVICE_TYPE);
        self.cache.evict_offline();
        self.spawn_browser(token)
    }

    pub fn shutdown(&self) {
        self.unadvertise();
        let _ = self.daemon.shutdown();
    }
}

fn handle_browse_event(cache: &PeerCache, event: ServiceEvent) {
    match event {
        ServiceEvent::ServiceResolved(info) => match peer_from_service(&info) {
            Ok(peer) => {
                let instance = instance_of(info.get_fullname());
                if cache.upsert(&instance, peer.clone()) {
                    info!(
                        device_id = %peer.device_id,
                        nickname = %peer.nickname,
                        addr = %peer.addr(),
                        "peer resolved"
                    );
                }
            }
            Err(e) => {
                // A single bad record never tears down browsing.
                warn!(instance = info.get_fullname(), error = %e, "dropping unresolvable record");
            }
        },
        ServiceEvent::ServiceRemoved(_ty, fullname) => {
            let instance = instance_of(&fullname);
            if let Some(device_id) = cache.mark_offline_instance(&instance) {
                info!(device_id = %device_id, instance = %instance, "peer lost");
            }
        }
        ServiceEvent::ServiceFound(_ty, fullname) => {
            debug!(instance = %fullname, "service found, awaiting resolution");
        }
        _ => {}
    }
}

fn peer_from_service(info: &ServiceInfo) -> Result<DevicePeer, DiscoveryError> {
    let device_id = info
        .get_property_val_str(TXT_DEVICE_ID)
        .ok_or_else(|| DiscoveryError::ResolveFailed("missing deviceId TXT key".to_string()))?
        .to_string();
    if device_id.is_empty() {
        return Err(DiscoveryError::ResolveFailed("empty deviceId".to_string()));
    }
    let nickname = info
        .get_property_val_str(TXT_NICKNAME)
        .unwrap_or("unknown")
        .to_string();
    let address: IpAddr = info
        .get_addresses()
        .iter()
        .next()
        .copied()
        .ok_or_else(|| DiscoveryError::ResolveFailed("record carries no address".to_string()))?;
    Ok(DevicePeer {
        device_id,
        nickname,
        address,
        port: info.get_port(),
        online: true,
    })
}

/// Strip the service-type suffix off a DNS-SD fullname.
fn instance_of(fullname: &str) -> String {
    fullname
        .strip_suffix(&format!(".{SERVICE_TYPE}"))
        .or_else(|| fullname.strip_suffix(SERVICE_TYPE).map(|s| s.trim_end_matches('.')))
        .unwrap_or(fullname)
        .to_string()
}
