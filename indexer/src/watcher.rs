use std::sync::Arc;
use std::sync::mpsc as std_mpsc;
use std::time::Duration;

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::FileIndex;

/// Quiet period used to coalesce change bursts into one rescan.
const DEBOUNCE: Duration = Duration::from_millis(200);
const POLL: Duration = Duration::from_millis(500);

/// Watch the shared root and rescan after changes settle. Runs the
/// blocking notify loop on its own thread so scans never stall the
/// request path.
pub fn spawn_watcher(index: Arc<FileIndex>, token: CancellationToken) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || watch_root_blocking(index, token))
}

fn watch_root_blocking(index: Arc<FileIndex>, token: CancellationToken) {
    let root = index.root();
    let (tx_notify, rx_notify) = std_mpsc::channel();

    let mut watcher: RecommendedWatcher = match notify::recommended_watcher(move |res| {
        let _ = tx_notify.send(res);
    }) {
        Ok(w) => w,
        Err(e) => {
            error!("Failed to create watcher for {}: {e}", root.display());
            return;
        }
    };

    if let Err(e) = watcher.watch(&root, RecursiveMode::Recursive) {
        error!("Failed to watch {}: {e}", root.display());
        return;
    }

    info!("Watching shared root {}", root.display());

    loop {
        if token.is_cancelled() {
            break;
        }

        let event = match rx_notify.recv_timeout(POLL) {
            Ok(Ok(event)) => event,
            Ok(Err(e)) => {
                error!("Watch error on {}: {e}", root.display());
                continue;
            }
            Err(std_mpsc::RecvTimeoutError::Timeout) => continue,
            Err(std_mpsc::RecvTimeoutError::Disconnected) => {
                warn!("Watcher channel closed for {}", root.display());
                break;
            }
        };

        if !is_relevant(&event.kind) {
            continue;
        }

        // Drain the burst until it goes quiet, then rescan once.
        while rx_notify.recv_timeout(DEBOUNCE).is_ok() {
            if token.is_cancelled() {
                return;
            }
        }
        index.rescan();
    }
}

fn is_relevant(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}
