use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use indexer::FileIndex;
use models::SharedFile;
use peering::{spawn_acceptor, PeerSession, ServeContext};
use protocol::{
    decode_payload, CancelTransfer, FileList, Handshake, HandshakeAck, ListFiles, MessageType,
    Ping, Pong, TransferErrorMsg, TransferRequestMsg, TransferStart,
};
use tokio_util::sync::CancellationToken;
use utilities::{FileSystem, VirtualFileSystem, VirtualNet};
use uuid::Uuid;

fn listen_addr(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
}

fn serve_context(fs: Arc<VirtualFileSystem>) -> Arc<ServeContext> {
    let index = Arc::new(FileIndex::new(PathBuf::from("/shared"), fs.clone()));
    index.rescan();
    Arc::new(ServeContext {
        device_id: "server-device".to_string(),
        nickname: "server".to_string(),
        index,
        fs,
    })
}

fn seeded_fs() -> Arc<VirtualFileSystem> {
    let fs = VirtualFileSystem::new();
    fs.write(Path::new("/shared/hello.txt"), b"hi\n").unwrap();
    Arc::new(fs)
}

async fn connect_and_handshake(net: &VirtualNet, addr: SocketAddr) -> PeerSession {
    let mut session = PeerSession::connect(net, addr).await.unwrap();
    session
        .send_message(
            MessageType::Handshake,
            &Handshake {
                device_id: "client-device".to_string(),
                nickname: "client".to_string(),
                protocol_version: "1.0".to_string(),
            },
        )
        .await
        .unwrap();
    let (kind, data) = session.recv_message().await.unwrap();
    assert_eq!(kind, MessageType::HandshakeAck);
    let ack: HandshakeAck = decode_payload(kind, &data).unwrap();
    assert_eq!(ack.status, "accepted");
    assert_eq!(ack.device_id, "server-device");
    session
}

#[tokio::test]
async fn list_files_returns_the_index() {
    let net = VirtualNet::default();
    let addr = listen_addr(8101);
    let token = CancellationToken::new();
    let _acceptor = spawn_acceptor(
        Arc::new(net.clone()),
        addr,
        serve_context(seeded_fs()),
        token.clone(),
    );
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut session = connect_and_handshake(&net, addr).await;
    session
        .send_message(MessageType::ListFiles, &ListFiles::default())
        .await
        .unwrap();
    let (kind, data) = session.recv_message().await.unwrap();
    assert_eq!(kind, MessageType::FileList);
    let list: FileList = decode_payload(kind, &data).unwrap();
    assert_eq!(list.files.len(), 1);
    assert_eq!(list.files[0].relative_path, "hello.txt");
    assert_eq!(list.files[0].size, 3);

    token.cancel();
}

#[tokio::test]
async fn ping_echoes_the_timestamp() {
    let net = VirtualNet::default();
    let addr = listen_addr(8102);
    let token = CancellationToken::new();
    let _acceptor = spawn_acceptor(
        Arc::new(net.clone()),
        addr,
        serve_context(seeded_fs()),
        token.clone(),
    );
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut session = connect_and_handshake(&net, addr).await;
    session
        .send_message(MessageType::Ping, &Ping { timestamp: 123_456 })
        .await
        .unwrap();
    let (kind, data) = session.recv_message().await.unwrap();
    assert_eq!(kind, MessageType::Pong);
    let pong: Pong = decode_payload(kind, &data).unwrap();
    assert_eq!(pong.timestamp, 123_456);

    token.cancel();
}

#[tokio::test]
async fn download_streams_exactly_file_size_bytes() {
    let net = VirtualNet::default();
    let addr = listen_addr(8103);
    let token = CancellationToken::new();
    let _acceptor = spawn_acceptor(
        Arc::new(net.clone()),
        addr,
        serve_context(seeded_fs()),
        token.clone(),
    );
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut session = connect_and_handshake(&net, addr).await;
    let transfer_id = Uuid::new_v4();
    session
        .send_message(
            MessageType::TransferRequest,
            &TransferRequestMsg {
                file_id: SharedFile::id_for("hello.txt"),
                transfer_id,
            },
        )
        .await
        .unwrap();

    let (kind, data) = session.recv_message().await.unwrap();
    assert_eq!(kind, MessageType::TransferStart);
    let start: TransferStart = decode_payload(kind, &data).unwrap();
    assert_eq!(start.transfer_id, transfer_id);
    assert_eq!(start.file_size, 3);
    assert_eq!(start.chunk_size, 8192);

    let mut body = Vec::new();
    while body.len() < start.file_size as usize {
        let mut buf = [0u8; 16];
        let n = session.recv_bytes(&mut buf).await.unwrap();
        assert!(n > 0, "stream ended before file_size bytes");
        body.extend_from_slice(&buf[..n]);
    }
    assert_eq!(&body, b"hi\n");

    let (kind, _) = session.recv_message().await.unwrap();
    assert_eq!(kind, MessageType::TransferComplete);

    token.cancel();
}

#[tokio::test]
async fn missing_file_answers_file_not_found() {
    let net = VirtualNet::default();
    let addr = listen_addr(8104);
    let token = CancellationToken::new();
    let _acceptor = spawn_acceptor(
        Arc::new(net.clone()),
        addr,
        serve_context(seeded_fs()),
        token.clone(),
    );
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut session = connect_and_handshake(&net, addr).await;
    let transfer_id = Uuid::new_v4();
    session
        .send_message(
            MessageType::TransferRequest,
            &TransferRequestMsg {
                file_id: SharedFile::id_for("absent.bin"),
                transfer_id,
            },
        )
        .await
        .unwrap();

    let (kind, data) = session.recv_message().await.unwrap();
    assert_eq!(kind, MessageType::TransferError);
    let err: TransferErrorMsg = decode_payload(kind, &data).unwrap();
    assert_eq!(err.transfer_id, Some(transfer_id));
    assert_eq!(err.error_code, models::ErrorCode::FileNotFound);

    token.cancel();
}

#[tokio::test]
async fn unknown_type_gets_invalid_request_and_session_survives() {
    let net = VirtualNet::default();
    let addr = listen_addr(8105);
    let token = CancellationToken::new();
    let _acceptor = spawn_acceptor(
        Arc::new(net.clone()),
        addr,
        serve_context(seeded_fs()),
        token.clone(),
    );
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut session = connect_and_handshake(&net, addr).await;
    session
        .send_bytes(b"{\"type\":\"WAT\",\"data\":\"{}\"}\n")
        .await
        .unwrap();

    let (kind, data) = session.recv_message().await.unwrap();
    assert_eq!(kind, MessageType::TransferError);
    let err: TransferErrorMsg = decode_payload(kind, &data).unwrap();
    assert_eq!(err.error_code, models::ErrorCode::InvalidRequest);
    assert_eq!(err.transfer_id, None);

    // same session keeps serving
    session
        .send_message(MessageType::Ping, &Ping { timestamp: 1 })
        .await
        .unwrap();
    let (kind, _) = session.recv_message().await.unwrap();
    assert_eq!(kind, MessageType::Pong);

    token.cancel();
}

#[tokio::test]
async fn cancel_stops_an_in_flight_send() {
    let fs = VirtualFileSystem::new();
    let big = vec![b'a'; 1024 * 1024];
    fs.write(Path::new("/shared/big.bin"), &big).unwrap();
    let fs = Arc::new(fs);

    let net = VirtualNet::default();
    let addr = listen_addr(8106);
    let token = CancellationToken::new();
    let _acceptor = spawn_acceptor(
        Arc::new(net.clone()),
        addr,
        serve_context(fs),
        token.clone(),
    );
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut session = connect_and_handshake(&net, addr).await;
    let transfer_id = Uuid::new_v4();
    session
        .send_message(
            MessageType::TransferRequest,
            &TransferRequestMsg {
                file_id: SharedFile::id_for("big.bin"),
                transfer_id,
            },
        )
        .await
        .unwrap();

    let (kind, data) = session.recv_message().await.unwrap();
    assert_eq!(kind, MessageType::TransferStart);
    let start: TransferStart = decode_payload(kind, &data).unwrap();
    assert_eq!(start.file_size, big.len() as u64);

    // take a little of the stream, then cancel
    let mut taken = 0usize;
    while taken < 16 * 1024 {
        let mut buf = [0u8; 4096];
        let n = session.recv_bytes(&mut buf).await.unwrap();
        taken += n;
    }
    session
        .send_message(MessageType::CancelTransfer, &CancelTransfer { transfer_id })
        .await
        .unwrap();

    // drain remaining bulk until the cancel confirmation line shows up
    let mut tail = Vec::new();
    let confirmation = loop {
        let mut buf = [0u8; 4096];
        let n = session.recv_bytes(&mut buf).await.unwrap();
        assert!(n > 0, "session ended without TRANSFER_CANCELLED");
        tail.extend_from_slice(&buf[..n]);
        if let Some(pos) = tail.iter().position(|b| *b == b'{') {
            if tail[pos..].contains(&b'\n') {
                break String::from_utf8_lossy(&tail[pos..]).to_string();
            }
        }
        taken += n;
        assert!(
            taken < big.len(),
            "server streamed the whole file despite cancel"
        );
    };
    assert!(confirmation.contains("TRANSFER_CANCELLED"));

    token.cancel();
}

#[tokio::test]
async fn engine_stop_closes_inbound_sessions() {
    let net = VirtualNet::default();
    let addr = listen_addr(8107);
    let token = CancellationToken::new();
    let _acceptor = spawn_acceptor(
        Arc::new(net.clone()),
        addr,
        serve_context(seeded_fs()),
        token.clone(),
    );
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut session = connect_and_handshake(&net, addr).await;
    token.cancel();

    // the serve loop notices the cancellation and shuts the stream down
    let res = tokio::time::timeout(Duration::from_secs(5), session.recv_message()).await;
    assert!(matches!(res, Ok(Err(_))), "expected closed session");
}
