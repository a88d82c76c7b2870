use std::collections::HashMap;
use std::io::{self, Read};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use indexer::{FileIndex, IndexError};
use models::{ErrorCode, CHUNK_SIZE};
use protocol::{
    decode_payload, CancelTransfer, FileList, Handshake, HandshakeAck, MessageType, Ping, Pong,
    ProtocolError, TransferCancelled, TransferComplete, TransferErrorMsg, TransferRequestMsg,
    TransferStart,
};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use utilities::FileSystem;
use uuid::Uuid;

use crate::session::{PeerSession, SessionError, SessionWriter};

/// Everything an inbound session needs to answer requests.
pub struct ServeContext {
    pub device_id: String,
    pub nickname: String,
    pub index: Arc<FileIndex>,
    pub fs: Arc<dyn FileSystem>,
}

type SendRegistry = Arc<Mutex<HashMap<Uuid, CancellationToken>>>;

/// Serve one inbound session: handshake, then answer requests until the
/// peer goes away or the token fires.
pub async fn serve_session(
    session: PeerSession,
    ctx: Arc<ServeContext>,
    token: CancellationToken,
) -> Result<()> {
    let remote = session.remote();
    let (mut reader, writer) = session.into_split();
    let writer = Arc::new(AsyncMutex::new(writer));

    // Handshake first; anything else on a fresh session is a protocol error.
    let (kind, data) = tokio::select! {
        _ = token.cancelled() => return Ok(()),
        res = reader.recv_message() => res?,
    };
    if kind != MessageType::Handshake {
        anyhow::bail!("expected HANDSHAKE from {remote}, got {kind}");
    }
    let hello: Handshake = decode_payload(kind, &data)?;
    info!(
        device_id = %hello.device_id,
        nickname = %hello.nickname,
        version = %hello.protocol_version,
        %remote,
        "inbound peer session"
    );
    writer
        .lock()
        .await
        .send_message(
            MessageType::HandshakeAck,
            &HandshakeAck {
                device_id: ctx.device_id.clone(),
                nickname: ctx.nickname.clone(),
                status: "accepted".to_string(),
            },
        )
        .await?;

    let sends: SendRegistry = Arc::new(Mutex::new(HashMap::new()));

    loop {
        let received = tokio::select! {
            _ = token.cancelled() => break,
            res = reader.recv_message() => res,
        };

        match received {
            Ok((MessageType::ListFiles, _)) => {
                let files = ctx.index.files();
                debug!(count = files.len(), %remote, "serving file list");
                writer
                    .lock()
                    .await
                    .send_message(MessageType::FileList, &FileList { files })
                    .await?;
            }
            Ok((MessageType::Ping, data)) => match decode_payload::<Ping>(MessageType::Ping, &data)
            {
                Ok(ping) => {
                    writer
                        .lock()
                        .await
                        .send_message(
                            MessageType::Pong,
                            &Pong {
                                timestamp: ping.timestamp,
                            },
                        )
                        .await?;
                }
                Err(e) => {
                    warn!(%remote, error = %e, "bad PING payload");
                    send_invalid_request(&writer, None, "bad PING payload").await?;
                }
            },
            Ok((MessageType::TransferRequest, data)) => {
                match decode_payload::<TransferRequestMsg>(MessageType::TransferRequest, &data) {
                    Ok(request) => {
                        spawn_transfer_send(&ctx, &writer, &sends, &token, request);
                    }
                    Err(e) => {
                        warn!(%remote, error = %e, "bad TRANSFER_REQUEST payload");
                        send_invalid_request(&writer, None, "bad TRANSFER_REQUEST payload").await?;
                    }
                }
            }
            Ok((MessageType::CancelTransfer, data)) => {
                match decode_payload::<CancelTransfer>(MessageType::CancelTransfer, &data) {
                    Ok(cancel) => {
                        let in_flight = sends.lock().unwrap().get(&cancel.transfer_id).cloned();
                        match in_flight {
                            Some(transfer_token) => {
                                info!(transfer_id = %cancel.transfer_id, %remote, "cancelling in-flight send");
                                transfer_token.cancel();
                                // the send task confirms with TRANSFER_CANCELLED
                            }
                            None => {
                                writer
                                    .lock()
                                    .await
                                    .send_message(
                                        MessageType::TransferCancelled,
                                        &TransferCancelled {
                                            transfer_id: cancel.transfer_id,
                                        },
                                    )
                                    .await?;
                            }
                        }
                    }
                    Err(e) => {
                        warn!(%remote, error = %e, "bad CANCEL_TRANSFER payload");
                        send_invalid_request(&writer, None, "bad CANCEL_TRANSFER payload").await?;
                    }
                }
            }
            Ok((MessageType::TransferAck, _)) => {
                debug!(%remote, "transfer acknowledged");
            }
            Ok((kind, data)) => {
                warn!(%remote, %kind, "unsupported message type on serve session");
                send_invalid_request(
                    &writer,
                    transfer_id_hint(&data),
                    &format!("unsupported message type {kind}"),
                )
                .await?;
            }
            Err(SessionError::Protocol(ProtocolError::UnknownType(t))) => {
                warn!(%remote, unknown_type = %t, "unknown message type");
                send_invalid_request(&writer, None, &format!("unknown message type {t:?}")).await?;
            }
            Err(SessionError::PeerClosed) => {
                info!(%remote, "peer closed session");
                break;
            }
            Err(e) => {
                warn!(%remote, error = %e, "session read failed");
                break;
            }
        }
    }

    // Stop any in-flight sends before the writer goes away.
    for (_, transfer_token) in sends.lock().unwrap().drain() {
        transfer_token.cancel();
    }
    writer.lock().await.close().await;
    Ok(())
}

async fn send_invalid_request(
    writer: &Arc<AsyncMutex<SessionWriter>>,
    transfer_id: Option<Uuid>,
    message: &str,
) -> Result<(), SessionError> {
    writer
        .lock()
        .await
        .send_message(
            MessageType::TransferError,
            &TransferErrorMsg {
                transfer_id,
                error_code: ErrorCode::InvalidRequest,
                message: message.to_string(),
            },
        )
        .await
}

/// Pull a transferId out of an arbitrary payload, if one was supplied.
fn transfer_id_hint(data: &str) -> Option<Uuid> {
    let value: serde_json::Value = serde_json::from_str(data).ok()?;
    value
        .get("transferId")
        .and_then(|v| v.as_str())
        .and_then(|s| Uuid::parse_str(s).ok())
}

fn spawn_transfer_send(
    ctx: &Arc<ServeContext>,
    writer: &Arc<AsyncMutex<SessionWriter>>,
    sends: &SendRegistry,
    session_token: &CancellationToken,
    request: TransferRequestMsg,
) {
    let transfer_token = session_token.child_token();
    sends
        .lock()
        .unwrap()
        .insert(request.transfer_id, transfer_token.clone());

    let ctx = Arc::clone(ctx);
    let writer = Arc::clone(writer);
    let sends = Arc::clone(sends);
    let session_token = session_token.clone();
    tokio::spawn(async move {
        let outcome = run_transfer_send(&ctx, &writer, &request, &transfer_token).await;
        sends.lock().unwrap().remove(&request.transfer_id);
        if let Err(e) = outcome {
            // Mid-bulk failure leaves the stream unframed; drop the session.
            warn!(transfer_id = %request.transfer_id, error = %e, "bulk send failed, closing session");
            session_token.cancel();
        }
    });
}

async fn run_transfer_send(
    ctx: &Arc<ServeContext>,
    writer: &Arc<AsyncMutex<SessionWriter>>,
    request: &TransferRequestMsg,
    cancel: &CancellationToken,
) -> Result<(), SessionError> {
    let (file, absolute) = match ctx.index.resolve(request.file_id) {
        Ok(found) => found,
        Err(e) => {
            let code = match e {
                IndexError::NotFound(_) => ErrorCode::FileNotFound,
                IndexError::PathEscape(_) => ErrorCode::InvalidRequest,
            };
            return send_transfer_error(writer, request.transfer_id, code, &e.to_string()).await;
        }
    };

    let mut source = match ctx.fs.open_read(&absolute) {
        Ok(reader) => reader,
        Err(e) => {
            let code = match e.kind() {
                io::ErrorKind::NotFound => ErrorCode::FileNotFound,
                io::ErrorKind::PermissionDenied => ErrorCode::PermissionDenied,
                _ => ErrorCode::IoError,
            };
            return send_transfer_error(writer, request.transfer_id, code, &e.to_string()).await;
        }
    };

    // The writer stays locked for the whole bulk phase so no envelope can
    // interleave with raw bytes.
    let mut writer = writer.lock().await;
    writer
        .send_message(
            MessageType::TransferStart,
            &TransferStart {
                transfer_id: request.transfer_id,
                file_id: file.file_id,
                file_name: file.name.clone(),
                file_size: file.size,
                chunk_size: CHUNK_SIZE,
            },
        )
        .await?;

    info!(
        transfer_id = %request.transfer_id,
        file = %file.relative_path,
        size = file.size,
        "streaming file to peer"
    );

    let mut remaining = file.size;
    let mut buf = vec![0u8; CHUNK_SIZE as usize];
    while remaining > 0 {
        if cancel.is_cancelled() {
            info!(transfer_id = %request.transfer_id, "send cancelled mid-bulk");
            return writer
                .send_message(
                    MessageType::TransferCancelled,
                    &TransferCancelled {
                        transfer_id: request.transfer_id,
                    },
                )
                .await;
        }
        let want = remaining.min(buf.len() as u64) as usize;
        let n = match source.read(&mut buf[..want]) {
            Ok(0) => {
                return Err(SessionError::ConnectionLost(format!(
                    "{} truncated with {remaining} bytes left",
                    file.relative_path
                )))
            }
            Ok(n) => n,
            Err(e) => return Err(SessionError::ConnectionLost(e.to_string())),
        };
        writer.send_bytes(&buf[..n]).await?;
        remaining -= n as u64;
    }

    writer
        .send_message(
            MessageType::TransferComplete,
            &TransferComplete {
                transfer_id: request.transfer_id,
                file_id: file.file_id,
                checksum: None,
            },
        )
        .await
}

async fn send_transfer_error(
    writer: &Arc<AsyncMutex<SessionWriter>>,
    transfer_id: Uuid,
    code: ErrorCode,
    message: &str,
) -> Result<(), SessionError> {
    warn!(%transfer_id, %code, message, "answering transfer error");
    writer
        .lock()
        .await
        .send_message(
            MessageType::TransferError,
            &TransferErrorMsg {
                transfer_id: Some(transfer_id),
                error_code: code,
                message: message.to_string(),
            },
        )
        .await
}
