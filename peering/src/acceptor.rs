use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use utilities::Net;

use crate::dispatcher::{serve_session, ServeContext};
use crate::session::PeerSession;

/// Cap on simultaneous inbound sessions; connections beyond it are
/// accepted and closed without a message.
pub const MAX_INBOUND_SESSIONS: usize = 32;

/// Short accept poll so cancellation stays observable.
const ACCEPT_POLL: Duration = Duration::from_secs(5);

/// Bind the peer listener and serve inbound connections until the token
/// fires. Each accepted socket becomes a session handled on its own task.
pub fn spawn_acceptor(
    net: Arc<dyn Net>,
    addr: SocketAddr,
    ctx: Arc<ServeContext>,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let listener = match net.bind_tcp_listener(addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind peer listener on {addr}: {e}");
                return;
            }
        };
        info!("Listening for peers on {addr}");

        let sessions: Arc<Mutex<HashSet<u64>>> = Arc::new(Mutex::new(HashSet::new()));
        let mut next_id: u64 = 0;

        loop {
            let accepted = tokio::select! {
                _ = token.cancelled() => break,
                res = timeout(ACCEPT_POLL, listener.accept()) => res,
            };

            let (stream, remote) = match accepted {
                Err(_) => continue, // poll timeout
                Ok(Ok(pair)) => pair,
                Ok(Err(e)) => {
                    error!("Accept error on {addr}: {e}");
                    break;
                }
            };

            let live = sessions.lock().unwrap().len();
            if live >= MAX_INBOUND_SESSIONS {
                warn!(%remote, live, "session limit reached, dropping connection");
                drop(stream);
                continue;
            }

            next_id += 1;
            let id = next_id;
            sessions.lock().unwrap().insert(id);

            let ctx = Arc::clone(&ctx);
            let sessions = Arc::clone(&sessions);
            let child = token.child_token();
            tokio::spawn(async move {
                let session = PeerSession::new(stream, remote);
                if let Err(e) = serve_session(session, ctx, child).await {
                    warn!(%remote, error = %e, "inbound session ended with error");
                }
                sessions.lock().unwrap().remove(&id);
            });
        }

        info!("Peer listener on {addr} stopped");
    })
}
