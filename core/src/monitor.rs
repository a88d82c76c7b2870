use std::sync::{Arc, Mutex};

use peering::{Discovery, PeerCache};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Connectivity transitions reported by the host integration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
    Available,
    Lost,
}

/// Reacts to connectivity changes: re-advertise and restart browsing
/// when the network comes back, mark every peer offline when it goes.
/// In-flight transfers are left to hit their own timeouts. `discovery`
/// is absent when the node runs without mDNS (tests).
pub fn spawn_network_monitor(
    discovery: Option<Arc<Discovery>>,
    peers: Arc<PeerCache>,
    browse_token: Arc<Mutex<CancellationToken>>,
    mut events: mpsc::Receiver<ConnectivityEvent>,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = token.cancelled() => break,
                event = events.recv() => match event {
                    Some(e) => e,
                    None => break,
                },
            };

            match event {
                ConnectivityEvent::Available => {
                    let Some(discovery) = &discovery else {
                        continue;
                    };
                    info!("connectivity restored, re-announcing service");
                    if let Err(e) = discovery.advertise() {
                        warn!(error = %e, "re-advertise failed");
                    }
                    let fresh = token.child_token();
                    {
                        let mut slot = browse_token.lock().unwrap();
                        slot.cancel();
                        *slot = fresh.clone();
                    }
                    match discovery.restart_browse(fresh) {
                        Ok(_task) => {}
                        Err(e) => warn!(error = %e, "browse restart failed"),
                    }
                }
                ConnectivityEvent::Lost => {
                    info!("connectivity lost, marking peers offline");
                    peers.mark_all_offline();
                }
            }
        }
    })
}
