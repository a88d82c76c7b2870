use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use models::{DevicePeer, ErrorCode, Transfer, TransferRequest, TransferState};
use peering::{PeerCache, PeerSession, SessionError};
use protocol::{
    decode_payload, CancelTransfer, Handshake, HandshakeAck, MessageType, TransferAck,
    TransferComplete, TransferErrorMsg, TransferRequestMsg, TransferStart,
};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use utilities::{temp_sibling, Clock, FileSystem, Net};
use uuid::Uuid;

/// Terminal transfers kept around for observers.
const FINISHED_CAPACITY: usize = 100;

/// Progress snapshots are published at most this often per transfer.
const PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("invalid transfer request: {0}")]
    Validation(String),
}

/// Session-level retry budget: one initial attempt plus `max_retries`,
/// with delays of `base_delay * 2^n` between them.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    fn delay_before(&self, retry: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(retry.saturating_sub(1))
    }
}

/// Orchestrates outbound downloads: one task per transfer, with retry,
/// cancellation, progress publication and a bounded terminal cache.
pub struct TransferCoordinator {
    ctx: Arc<CoordinatorCtx>,
}

struct CoordinatorCtx {
    device_id: String,
    nickname: String,
    peers: Arc<PeerCache>,
    net: Arc<dyn Net>,
    fs: Arc<dyn FileSystem>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    table: Mutex<TransferTable>,
    snapshot_tx: watch::Sender<Vec<Transfer>>,
    token: CancellationToken,
}

#[derive(Default)]
struct TransferTable {
    active: HashMap<Uuid, ActiveTransfer>,
    finished: VecDeque<Transfer>,
}

struct ActiveTransfer {
    transfer: Transfer,
    cancel: CancellationToken,
}

impl TransferCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        device_id: String,
        nickname: String,
        peers: Arc<PeerCache>,
        net: Arc<dyn Net>,
        fs: Arc<dyn FileSystem>,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
        token: CancellationToken,
    ) -> Self {
        let (snapshot_tx, _) = watch::channel(Vec::new());
        TransferCoordinator {
            ctx: Arc::new(CoordinatorCtx {
                device_id,
                nickname,
                peers,
                net,
                fs,
                clock,
                retry,
                table: Mutex::new(TransferTable::default()),
                snapshot_tx,
                token,
            }),
        }
    }

    /// Validate and launch a download. The returned id is immediately
    /// visible to observers; peer resolution failures surface as a
    /// terminal `Failed` state rather than an error here.
    pub fn start_download(&self, request: TransferRequest) -> Result<Uuid, TransferError> {
        request.validate().map_err(TransferError::Validation)?;

        let transfer = Transfer::new(&request);
        let transfer_id = transfer.transfer_id;
        let cancel = self.ctx.token.child_token();
        {
            let mut table = self.ctx.table.lock().unwrap();
            table.active.insert(
                transfer_id,
                ActiveTransfer {
                    transfer,
                    cancel: cancel.clone(),
                },
            );
        }
        self.ctx.publish();

        // Fail fast on unknown/offline peers, before any connection.
        match self.ctx.peers.get(&request.peer_device_id) {
            None => {
                self.ctx.finish_failed(
                    transfer_id,
                    ErrorCode::PeerUnknown,
                    format!("no peer with device id {:?}", request.peer_device_id),
                );
                return Ok(transfer_id);
            }
            Some(peer) if !peer.online => {
                self.ctx.finish_failed(
                    transfer_id,
                    ErrorCode::PeerOffline,
                    format!("peer {} is offline", peer.nickname),
                );
                return Ok(transfer_id);
            }
            Some(_) => {}
        }

        let ctx = Arc::clone(&self.ctx);
        tokio::spawn(async move {
            run_transfer(ctx, request, transfer_id, cancel).await;
        });
        Ok(transfer_id)
    }

    /// Cancel a running transfer. No-op on terminal or unknown ids.
    pub fn cancel_transfer(&self, transfer_id: Uuid) {
        let cancel = {
            let mut table = self.ctx.table.lock().unwrap();
            match table.active.get_mut(&transfer_id) {
                Some(entry) if !entry.transfer.is_terminal() => {
                    entry.transfer.state = TransferState::Cancelled;
                    Some(entry.cancel.clone())
                }
                _ => None,
            }
        };
        if let Some(cancel) = cancel {
            info!(%transfer_id, "transfer cancelled by caller");
            self.ctx.publish();
            cancel.cancel();
        }
    }

    /// Snapshot stream over the whole table (active plus retained
    /// terminal transfers). Restartable; finite only on shutdown.
    pub fn observe_transfers(&self) -> watch::Receiver<Vec<Transfer>> {
        self.ctx.snapshot_tx.subscribe()
    }

    /// Per-transfer snapshot stream; ends after the terminal snapshot.
    pub fn observe_transfer(&self, transfer_id: Uuid) -> mpsc::Receiver<Transfer> {
        let (tx, rx) = mpsc::channel(64);
        let mut snapshots = self.ctx.snapshot_tx.subscribe();
        let ctx = Arc::clone(&self.ctx);
        tokio::spawn(async move {
            if let Some(current) = ctx.lookup(transfer_id) {
                let terminal = current.is_terminal();
                if tx.send(current).await.is_err() || terminal {
                    return;
                }
            }
            while snapshots.changed().await.is_ok() {
                let found = snapshots
                    .borrow()
                    .iter()
                    .find(|t| t.transfer_id == transfer_id)
                    .cloned();
                if let Some(transfer) = found {
                    let terminal = transfer.is_terminal();
                    if tx.send(transfer).await.is_err() || terminal {
                        return;
                    }
                }
            }
        });
        rx
    }

    pub fn get(&self, transfer_id: Uuid) -> Option<Transfer> {
        self.ctx.lookup(transfer_id)
    }

    /// Cancel everything in flight; used on engine stop.
    pub fn shutdown(&self) {
        let ids: Vec<Uuid> = {
            let table = self.ctx.table.lock().unwrap();
            table.active.keys().copied().collect()
        };
        for id in ids {
            self.cancel_transfer(id);
        }
    }
}

impl CoordinatorCtx {
    fn lookup(&self, transfer_id: Uuid) -> Option<Transfer> {
        let table = self.table.lock().unwrap();
        table
            .active
            .get(&transfer_id)
            .map(|e| e.transfer.clone())
            .or_else(|| {
                table
                    .finished
                    .iter()
                    .find(|t| t.transfer_id == transfer_id)
                    .cloned()
            })
    }

    fn publish(&self) {
        let snapshot = {
            let table = self.table.lock().unwrap();
            let mut all: Vec<Transfer> =
                table.active.values().map(|e| e.transfer.clone()).collect();
            all.sort_by_key(|t| t.started_at);
            all.extend(table.finished.iter().cloned());
            all
        };
        // send_replace keeps the latest snapshot even with no
        // subscriber listening yet
        self.snapshot_tx.send_replace(snapshot);
    }

    /// Apply `update` unless the transfer already reached a terminal
    /// state; terminal states never transition.
    fn update<F: FnOnce(&mut Transfer)>(&self, transfer_id: Uuid, update: F) -> bool {
        let applied = {
            let mut table = self.table.lock().unwrap();
            match table.active.get_mut(&transfer_id) {
                Some(entry) if !entry.transfer.is_terminal() => {
                    update(&mut entry.transfer);
                    true
                }
                _ => false,
            }
        };
        if applied {
            self.publish();
        }
        applied
    }

    /// Move an active transfer into the bounded terminal cache.
    fn retire(&self, transfer_id: Uuid) {
        {
            let mut table = self.table.lock().unwrap();
            if let Some(entry) = table.active.remove(&transfer_id) {
                table.finished.push_back(entry.transfer);
                while table.finished.len() > FINISHED_CAPACITY {
                    table.finished.pop_front();
                }
            }
        }
        self.publish();
    }

    fn finish_failed(&self, transfer_id: Uuid, code: ErrorCode, message: String) {
        warn!(%transfer_id, %code, %message, "transfer failed");
        self.update(transfer_id, |t| {
            t.state = TransferState::Failed {
                code,
                message: message.clone(),
            };
        });
        self.retire(transfer_id);
    }

    fn finish_completed(&self, transfer_id: Uuid, path: PathBuf) {
        info!(%transfer_id, path = %path.display(), "transfer completed");
        self.update(transfer_id, |t| {
            t.state = TransferState::Completed {
                path: path.clone(),
                checksum: None,
            };
        });
        self.retire(transfer_id);
    }
}

enum AttemptError {
    Fatal(ErrorCode, String),
    Retryable(ErrorCode, String),
    Cancelled,
}

fn session_to_attempt(e: SessionError) -> AttemptError {
    match e {
        SessionError::Protocol(p) => AttemptError::Fatal(ErrorCode::InvalidRequest, p.to_string()),
        e => AttemptError::Retryable(ErrorCode::ConnectionLost, e.to_string()),
    }
}

async fn with_cancel<T, F>(cancel: &CancellationToken, fut: F) -> Result<T, AttemptError>
where
    F: Future<Output = Result<T, SessionError>>,
{
    tokio::select! {
        _ = cancelled(cancel) => Err(AttemptError::Cancelled),
        res = fut => res.map_err(session_to_attempt),
    }
}

async fn cancelled(cancel: &CancellationToken) {
    cancel.cancelled().await
}

async fn run_transfer(
    ctx: Arc<CoordinatorCtx>,
    request: TransferRequest,
    transfer_id: Uuid,
    cancel: CancellationToken,
) {
    let mut retry = 0u32;
    loop {
        let outcome = run_attempt(&ctx, &request, transfer_id, &cancel).await;
        match outcome {
            Ok(()) => return,
            Err(AttemptError::Cancelled) => {
                debug!(%transfer_id, "attempt aborted after cancellation");
                // Usually set by cancel_transfer already; covers the
                // shutdown path where only the token fired.
                ctx.update(transfer_id, |t| t.state = TransferState::Cancelled);
                ctx.retire(transfer_id);
                return;
            }
            Err(AttemptError::Fatal(code, message)) => {
                ctx.finish_failed(transfer_id, code, message);
                return;
            }
            Err(AttemptError::Retryable(code, message)) => {
                retry += 1;
                if retry > ctx.retry.max_retries {
                    ctx.finish_failed(
                        transfer_id,
                        code,
                        format!("{message} (retries exhausted)"),
                    );
                    return;
                }
                let delay = ctx.retry.delay_before(retry);
                warn!(
                    %transfer_id,
                    retry,
                    delay_ms = delay.as_millis() as u64,
                    %message,
                    "attempt failed, backing off"
                );
                // Back to Pending for the next attempt; observers see the
                // byte count reset at the retry boundary.
                ctx.update(transfer_id, |t| {
                    t.bytes_transferred = 0;
                    t.state = TransferState::Pending;
                });
                tokio::select! {
                    _ = cancelled(&cancel) => {
                        ctx.retire(transfer_id);
                        return;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

async fn run_attempt(
    ctx: &Arc<CoordinatorCtx>,
    request: &TransferRequest,
    transfer_id: Uuid,
    cancel: &CancellationToken,
) -> Result<(), AttemptError> {
    // Re-resolve the peer on every attempt; it may have moved.
    let peer = resolve_peer(ctx, &request.peer_device_id)?;

    let temp_path = temp_sibling(&request.destination_path);
    let _ = ctx.fs.remove_file(&temp_path);

    let mut session = with_cancel(
        cancel,
        PeerSession::connect(ctx.net.as_ref(), peer.addr()),
    )
    .await?;

    let result = drive_session(ctx, request, transfer_id, cancel, &mut session, &temp_path).await;

    match &result {
        Ok(()) => {}
        Err(AttemptError::Cancelled) => {
            // Best-effort courtesy note so the sender can stop early.
            let _ = session
                .send_message(MessageType::CancelTransfer, &CancelTransfer { transfer_id })
                .await;
            let _ = ctx.fs.remove_file(&temp_path);
        }
        Err(_) => {
            let _ = ctx.fs.remove_file(&temp_path);
        }
    }
    session.close().await;
    result
}

async fn drive_session(
    ctx: &Arc<CoordinatorCtx>,
    request: &TransferRequest,
    transfer_id: Uuid,
    cancel: &CancellationToken,
    session: &mut PeerSession,
    temp_path: &PathBuf,
) -> Result<(), AttemptError> {
    // Handshake.
    with_cancel(
        cancel,
        session.send_message(
            MessageType::Handshake,
            &Handshake {
                device_id: ctx.device_id.clone(),
                nickname: ctx.nickname.clone(),
                protocol_version: models::PROTOCOL_VERSION.to_string(),
            },
        ),
    )
    .await?;
    let (kind, data) = with_cancel(cancel, session.recv_message()).await?;
    if kind != MessageType::HandshakeAck {
        return Err(AttemptError::Fatal(
            ErrorCode::InvalidRequest,
            format!("expected HANDSHAKE_ACK, got {kind}"),
        ));
    }
    let _ack: HandshakeAck =
        decode_payload(kind, &data).map_err(|e| session_to_attempt(SessionError::Protocol(e)))?;

    // Request the file.
    with_cancel(
        cancel,
        session.send_message(
            MessageType::TransferRequest,
            &TransferRequestMsg {
                file_id: request.file_id,
                transfer_id,
            },
        ),
    )
    .await?;

    let (kind, data) = recv_skipping_progress(session, cancel).await?;
    let start: TransferStart = match kind {
        MessageType::TransferStart => {
            decode_payload(kind, &data).map_err(|e| session_to_attempt(SessionError::Protocol(e)))?
        }
        MessageType::TransferError => {
            let err: TransferErrorMsg = decode_payload(kind, &data)
                .map_err(|e| session_to_attempt(SessionError::Protocol(e)))?;
            return Err(if err.error_code.is_retryable() {
                AttemptError::Retryable(err.error_code, err.message)
            } else {
                AttemptError::Fatal(err.error_code, err.message)
            });
        }
        other => {
            return Err(AttemptError::Fatal(
                ErrorCode::InvalidRequest,
                format!("expected TRANSFER_START, got {other}"),
            ))
        }
    };

    ctx.update(transfer_id, |t| {
        t.file_name = start.file_name.clone();
        t.file_size = start.file_size;
        t.bytes_transferred = 0;
        t.state = TransferState::InProgress {
            bytes: 0,
            total: start.file_size,
            rate_bps: 0.0,
        };
    });

    // Receive exactly file_size raw bytes into the temp sibling.
    let mut writer = ctx
        .fs
        .open_write(temp_path)
        .map_err(|e| AttemptError::Fatal(map_write_error(&e), e.to_string()))?;
    let mut received: u64 = 0;
    let mut rate = RateTracker::new(ctx.clock.as_ref());
    let mut last_emit = ctx.clock.now();
    let mut buf = vec![0u8; models::CHUNK_SIZE as usize];

    while received < start.file_size {
        let want = (start.file_size - received).min(buf.len() as u64) as usize;
        let n = with_cancel(cancel, session.recv_bytes(&mut buf[..want])).await?;
        if n == 0 {
            return Err(AttemptError::Retryable(
                ErrorCode::ConnectionLost,
                format!("stream ended with {} bytes missing", start.file_size - received),
            ));
        }
        writer
            .write_all(&buf[..n])
            .map_err(|e| AttemptError::Fatal(map_write_error(&e), e.to_string()))?;
        received += n as u64;
        rate.record(ctx.clock.as_ref(), n as u64);

        let now = ctx.clock.now();
        if now.duration_since(last_emit) >= PROGRESS_INTERVAL || received == start.file_size {
            last_emit = now;
            let rate_bps = rate.rate_bps(ctx.clock.as_ref());
            ctx.update(transfer_id, |t| {
                t.bytes_transferred = received;
                t.state = TransferState::InProgress {
                    bytes: received,
                    total: start.file_size,
                    rate_bps,
                };
            });
        }
    }

    writer
        .sync()
        .map_err(|e| AttemptError::Fatal(map_write_error(&e), e.to_string()))?;
    drop(writer);

    // Trailer and acknowledgement.
    let (kind, data) = recv_skipping_progress(session, cancel).await?;
    match kind {
        MessageType::TransferComplete => {
            let _complete: TransferComplete = decode_payload(kind, &data)
                .map_err(|e| session_to_attempt(SessionError::Protocol(e)))?;
        }
        MessageType::TransferError => {
            let err: TransferErrorMsg = decode_payload(kind, &data)
                .map_err(|e| session_to_attempt(SessionError::Protocol(e)))?;
            return Err(if err.error_code.is_retryable() {
                AttemptError::Retryable(err.error_code, err.message)
            } else {
                AttemptError::Fatal(err.error_code, err.message)
            });
        }
        other => {
            return Err(AttemptError::Fatal(
                ErrorCode::InvalidRequest,
                format!("expected TRANSFER_COMPLETE, got {other}"),
            ))
        }
    }

    with_cancel(
        cancel,
        session.send_message(
            MessageType::TransferAck,
            &TransferAck {
                transfer_id,
                status: "completed".to_string(),
            },
        ),
    )
    .await?;

    ctx.fs
        .rename(temp_path, &request.destination_path)
        .map_err(|e| AttemptError::Fatal(map_write_error(&e), e.to_string()))?;

    ctx.finish_completed(transfer_id, request.destination_path.clone());
    Ok(())
}

/// Receive the next envelope, tolerating sender-emitted
/// TRANSFER_PROGRESS reports; this side counts bytes itself.
async fn recv_skipping_progress(
    session: &mut PeerSession,
    cancel: &CancellationToken,
) -> Result<(MessageType, String), AttemptError> {
    loop {
        let (kind, data) = with_cancel(cancel, session.recv_message()).await?;
        if kind == MessageType::TransferProgress {
            continue;
        }
        return Ok((kind, data));
    }
}

fn resolve_peer(ctx: &CoordinatorCtx, device_id: &str) -> Result<DevicePeer, AttemptError> {
    match ctx.peers.get(device_id) {
        None => Err(AttemptError::Fatal(
            ErrorCode::PeerUnknown,
            format!("no peer with device id {device_id:?}"),
        )),
        Some(peer) if !peer.online => Err(AttemptError::Fatal(
            ErrorCode::PeerOffline,
            format!("peer {} is offline", peer.nickname),
        )),
        Some(peer) => Ok(peer),
    }
}

fn map_write_error(e: &io::Error) -> ErrorCode {
    if e.raw_os_error() == Some(28) {
        // ENOSPC
        return ErrorCode::StorageFull;
    }
    match e.kind() {
        io::ErrorKind::PermissionDenied => ErrorCode::PermissionDenied,
        _ => ErrorCode::IoError,
    }
}

/// Moving average of received bytes over a ~1 s sliding window.
struct RateTracker {
    window: Duration,
    samples: VecDeque<(Instant, u64)>,
}

impl RateTracker {
    fn new(clock: &dyn Clock) -> Self {
        let mut samples = VecDeque::new();
        samples.push_back((clock.now(), 0));
        RateTracker {
            window: Duration::from_secs(1),
            samples,
        }
    }

    fn record(&mut self, clock: &dyn Clock, bytes: u64) {
        let now = clock.now();
        self.samples.push_back((now, bytes));
        self.trim(now);
    }

    fn rate_bps(&mut self, clock: &dyn Clock) -> f64 {
        let now = clock.now();
        self.trim(now);
        let total: u64 = self.samples.iter().map(|(_, b)| b).sum();
        let span = self
            .samples
            .front()
            .map(|(t, _)| now.duration_since(*t))
            .unwrap_or(self.window)
            .max(Duration::from_millis(10));
        total as f64 / span.as_secs_f64()
    }

    fn trim(&mut self, now: Instant) {
        while self
            .samples
            .front()
            .map(|(t, _)| now.duration_since(*t) > self.window)
            .unwrap_or(false)
            && self.samples.len() > 1
        {
            self.samples.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{RateTracker, RetryPolicy};
    use std::time::Duration;
    use utilities::ManualClock;

    #[test]
    fn backoff_doubles_per_retry() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_before(1), Duration::from_secs(1));
        assert_eq!(policy.delay_before(2), Duration::from_secs(2));
        assert_eq!(policy.delay_before(3), Duration::from_secs(4));
    }

    #[test]
    fn rate_tracks_bytes_over_the_window() {
        let clock = ManualClock::new();
        let mut rate = RateTracker::new(&clock);

        for _ in 0..10 {
            clock.advance(Duration::from_millis(100));
            rate.record(&clock, 1000);
        }
        let bps = rate.rate_bps(&clock);
        assert!((bps - 10_000.0).abs() < 1_500.0, "got {bps}");
    }

    #[test]
    fn rate_forgets_samples_outside_the_window() {
        let clock = ManualClock::new();
        let mut rate = RateTracker::new(&clock);

        clock.advance(Duration::from_millis(100));
        rate.record(&clock, 1_000_000);
        clock.advance(Duration::from_secs(5));
        rate.record(&clock, 100);
        let bps = rate.rate_bps(&clock);
        assert!(bps < 10_000.0, "stale burst still dominates: {bps}");
    }
}
