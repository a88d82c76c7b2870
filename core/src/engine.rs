use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use indexer::{spawn_watcher, FileIndex};
use models::{AppConfig, AppSettings, DevicePeer, SharedFile, Transfer};
use peering::{
    spawn_acceptor, Discovery, PeerCache, PeerSession, ServeContext,
};
use protocol::{decode_payload, FileList, Handshake, HandshakeAck, ListFiles, MessageType};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use utilities::{init_logging, Clock, FileSystem, Net, RealClock, RealFileSystem, RealNet};
use uuid::Uuid;

use crate::monitor::{spawn_network_monitor, ConnectivityEvent};
use crate::transfer::{RetryPolicy, TransferCoordinator, TransferError};

/// Composes discovery, the acceptor, the indexer and the transfer
/// coordinator into one node with a start/stop lifecycle.
pub struct Engine {
    config: AppConfig,
    fs: Arc<dyn FileSystem>,
    net: Arc<dyn Net>,
    index: Arc<FileIndex>,
    discovery: Option<Arc<Discovery>>,
    peers: Arc<PeerCache>,
    coordinator: TransferCoordinator,
    token: CancellationToken,
    connectivity_tx: mpsc::Sender<ConnectivityEvent>,
    connectivity_rx: Mutex<Option<mpsc::Receiver<ConnectivityEvent>>>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl Engine {
    /// Production wiring: real filesystem, network, clock and mDNS.
    pub fn new(config: AppConfig) -> Result<Self> {
        let fs: Arc<dyn FileSystem> = Arc::new(RealFileSystem::new());
        let net: Arc<dyn Net> = Arc::new(RealNet);
        let clock: Arc<dyn Clock> = Arc::new(RealClock);
        Self::with_parts(config, fs, net, clock)
    }

    /// Custom collaborators, real mDNS discovery.
    pub fn with_parts(
        config: AppConfig,
        fs: Arc<dyn FileSystem>,
        net: Arc<dyn Net>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let discovery = Arc::new(
            Discovery::new(&config.device_id, &config.nickname, config.port)
                .context("starting mDNS discovery")?,
        );
        let peers = discovery.cache();
        Self::build(config, fs, net, clock, Some(discovery), peers)
    }

    /// No mDNS daemon; peers are fed into `peers` directly. Used by
    /// tests running on a virtual network.
    pub fn with_peer_cache(
        config: AppConfig,
        fs: Arc<dyn FileSystem>,
        net: Arc<dyn Net>,
        clock: Arc<dyn Clock>,
        peers: Arc<PeerCache>,
    ) -> Result<Self> {
        Self::build(config, fs, net, clock, None, peers)
    }

    fn build(
        config: AppConfig,
        fs: Arc<dyn FileSystem>,
        net: Arc<dyn Net>,
        clock: Arc<dyn Clock>,
        discovery: Option<Arc<Discovery>>,
        peers: Arc<PeerCache>,
    ) -> Result<Self> {
        if let Err(e) = config.validate() {
            bail!("invalid configuration: {e}");
        }
        init_logging(&config.log_path, fs.as_ref())?;

        let index = Arc::new(FileIndex::new(config.shared_root.clone(), fs.clone()));
        let token = CancellationToken::new();
        let coordinator = TransferCoordinator::new(
            config.device_id.clone(),
            config.nickname.clone(),
            Arc::clone(&peers),
            Arc::clone(&net),
            Arc::clone(&fs),
            clock,
            RetryPolicy::default(),
            token.child_token(),
        );
        let (connectivity_tx, connectivity_rx) = mpsc::channel(8);

        Ok(Engine {
            config,
            fs,
            net,
            index,
            discovery,
            peers,
            coordinator,
            token,
            connectivity_tx,
            connectivity_rx: Mutex::new(Some(connectivity_rx)),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        })
    }

    /// Bring the node up: index the shared root, start the watcher, the
    /// acceptor, discovery and the network monitor.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            bail!("engine already started");
        }
        info!(
            device_id = %self.config.device_id,
            nickname = %self.config.nickname,
            port = self.config.port,
            root = %self.config.shared_root.display(),
            "node starting"
        );

        let count = self.index.rescan();
        info!(count, "initial index scan complete");
        spawn_watcher(Arc::clone(&self.index), self.token.child_token());

        let ctx = Arc::new(ServeContext {
            device_id: self.config.device_id.clone(),
            nickname: self.config.nickname.clone(),
            index: Arc::clone(&self.index),
            fs: Arc::clone(&self.fs),
        });
        let listen = std::net::SocketAddr::new(
            std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
            self.config.port,
        );
        spawn_acceptor(
            Arc::clone(&self.net),
            listen,
            ctx,
            self.token.child_token(),
        );

        let browse_token = Arc::new(Mutex::new(self.token.child_token()));
        if let Some(discovery) = &self.discovery {
            discovery.advertise().context("advertising service")?;
            let slot = browse_token.lock().unwrap().clone();
            discovery.spawn_browser(slot).context("starting browse")?;
        }

        let events = self
            .connectivity_rx
            .lock()
            .unwrap()
            .take()
            .context("engine already started once")?;
        spawn_network_monitor(
            self.discovery.clone(),
            Arc::clone(&self.peers),
            browse_token,
            events,
            self.token.child_token(),
        );

        Ok(())
    }

    /// Graceful shutdown: unregister discovery, cancel transfers, stop
    /// the accept loop and close sessions. Safe to call repeatedly.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("node stopping");
        self.coordinator.shutdown();
        if let Some(discovery) = &self.discovery {
            discovery.shutdown();
        }
        self.token.cancel();
    }

    /// Restartable stream of peer-set snapshots.
    pub fn peers(&self) -> watch::Receiver<Vec<DevicePeer>> {
        self.peers.subscribe()
    }

    /// Restartable stream of local index snapshots.
    pub fn local_files(&self) -> watch::Receiver<Vec<SharedFile>> {
        self.index.subscribe()
    }

    /// Force a rescan of the shared root.
    pub fn refresh_local_index(&self) -> usize {
        self.index.rescan()
    }

    /// One-shot session against a peer: handshake, list, close.
    pub async fn remote_files(&self, peer_device_id: &str) -> Result<Vec<SharedFile>> {
        let peer = match self.peers.get(peer_device_id) {
            None => bail!("no peer with device id {peer_device_id:?}"),
            Some(p) if !p.online => bail!("peer {} is offline", p.nickname),
            Some(p) => p,
        };

        let mut session = PeerSession::connect(self.net.as_ref(), peer.addr()).await?;
        let result = async {
            session
                .send_message(
                    MessageType::Handshake,
                    &Handshake {
                        device_id: self.config.device_id.clone(),
                        nickname: self.config.nickname.clone(),
                        protocol_version: models::PROTOCOL_VERSION.to_string(),
                    },
                )
                .await?;
            let (kind, data) = session.recv_message().await?;
            if kind != MessageType::HandshakeAck {
                bail!("expected HANDSHAKE_ACK from {}, got {kind}", peer.nickname);
            }
            let _ack: HandshakeAck = decode_payload(kind, &data)?;

            session
                .send_message(MessageType::ListFiles, &ListFiles::default())
                .await?;
            let (kind, data) = session.recv_message().await?;
            if kind != MessageType::FileList {
                bail!("expected FILE_LIST from {}, got {kind}", peer.nickname);
            }
            let list: FileList = decode_payload(kind, &data)?;
            Ok(list.files)
        }
        .await;
        session.close().await;
        result
    }

    pub fn start_download(
        &self,
        request: models::TransferRequest,
    ) -> Result<Uuid, TransferError> {
        self.coordinator.start_download(request)
    }

    pub fn cancel_transfer(&self, transfer_id: Uuid) {
        self.coordinator.cancel_transfer(transfer_id);
    }

    pub fn observe_transfers(&self) -> watch::Receiver<Vec<Transfer>> {
        self.coordinator.observe_transfers()
    }

    pub fn observe_transfer(&self, transfer_id: Uuid) -> mpsc::Receiver<Transfer> {
        self.coordinator.observe_transfer(transfer_id)
    }

    pub fn transfer(&self, transfer_id: Uuid) -> Option<Transfer> {
        self.coordinator.get(transfer_id)
    }

    /// Handle for the host integration to report connectivity changes.
    pub fn connectivity_sender(&self) -> mpsc::Sender<ConnectivityEvent> {
        self.connectivity_tx.clone()
    }

    /// React to settings changes from the settings collaborator:
    /// nickname re-advertises, a new shared root re-indexes. A port
    /// change needs a restart and is ignored here.
    pub fn watch_settings(&self, mut settings: watch::Receiver<AppSettings>) {
        let discovery = self.discovery.clone();
        let index = Arc::clone(&self.index);
        let token = self.token.clone();
        let mut current = self.config.settings();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    changed = settings.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                let next = settings.borrow().clone();
                if next.nickname != current.nickname {
                    info!(nickname = %next.nickname, "nickname changed, re-advertising");
                    if let Some(discovery) = &discovery {
                        if let Err(e) = discovery.set_nickname(&next.nickname) {
                            warn!(error = %e, "re-advertise with new nickname failed");
                        }
                    }
                }
                if next.shared_root != current.shared_root {
                    info!(root = %next.shared_root.display(), "shared root changed, re-indexing");
                    index.set_root(next.shared_root.clone());
                    index.rescan();
                }
                if next.port != current.port {
                    warn!(port = next.port, "port change requires a restart, ignoring");
                }
                current = next;
            }
        });
    }
}
