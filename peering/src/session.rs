use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use protocol::{decode_envelope, encode_envelope, MessageType, ProtocolError};
use serde::Serialize;
use thiserror::Error;
use tokio::io::{
    split, AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
    ReadHalf, WriteHalf,
};
use tokio::time::timeout;
use utilities::{DynStream, Net};

/// A session is torn down after this long without any successful I/O.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(30);
/// Budget for establishing the TCP connection.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("peer closed the stream")]
    PeerClosed,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl SessionError {
    fn from_io(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::UnexpectedEof => SessionError::PeerClosed,
            _ => SessionError::ConnectionLost(e.to_string()),
        }
    }
}

async fn timed<T, F>(fut: F) -> Result<T, SessionError>
where
    F: Future<Output = io::Result<T>>,
{
    match timeout(IDLE_TIMEOUT, fut).await {
        Ok(Ok(v)) => Ok(v),
        Ok(Err(e)) => Err(SessionError::from_io(e)),
        Err(_) => Err(SessionError::ConnectionLost("inactivity timeout".to_string())),
    }
}

/// Write one envelope line, flushed, under the inactivity deadline.
pub async fn send_framed<W, T>(
    writer: &mut W,
    kind: MessageType,
    payload: &T,
) -> Result<(), SessionError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let line = encode_envelope(kind, payload)?;
    timed(async {
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await
    })
    .await
}

/// Read one envelope line. Orderly EOF maps to `PeerClosed`.
pub async fn recv_framed<R>(reader: &mut R) -> Result<(MessageType, String), SessionError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let n = timed(reader.read_line(&mut line)).await?;
    if n == 0 {
        return Err(SessionError::PeerClosed);
    }
    Ok(decode_envelope(&line)?)
}

/// One reliable ordered byte stream to a peer, carrying newline-framed
/// envelopes and, during a transfer, raw bulk bytes. The buffered
/// reader is shared between the two so bulk reads drain whatever the
/// envelope reader had already buffered.
pub struct PeerSession {
    reader: BufReader<ReadHalf<DynStream>>,
    writer: WriteHalf<DynStream>,
    remote: SocketAddr,
    open: bool,
}

impl PeerSession {
    pub fn new(stream: DynStream, remote: SocketAddr) -> Self {
        let (read_half, write_half) = split(stream);
        PeerSession {
            reader: BufReader::new(read_half),
            writer: write_half,
            remote,
            open: true,
        }
    }

    /// Dial a peer under the connect deadline.
    pub async fn connect(net: &dyn Net, addr: SocketAddr) -> Result<Self, SessionError> {
        let stream = match timeout(CONNECT_TIMEOUT, net.connect_tcp(addr)).await {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => return Err(SessionError::ConnectionLost(e.to_string())),
            Err(_) => {
                return Err(SessionError::ConnectionLost(format!(
                    "connect to {addr} timed out"
                )))
            }
        };
        Ok(PeerSession::new(stream, addr))
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub async fn send_message<T: Serialize>(
        &mut self,
        kind: MessageType,
        payload: &T,
    ) -> Result<(), SessionError> {
        send_framed(&mut self.writer, kind, payload).await
    }

    pub async fn recv_message(&mut self) -> Result<(MessageType, String), SessionError> {
        recv_framed(&mut self.reader).await
    }

    pub async fn send_bytes(&mut self, buf: &[u8]) -> Result<(), SessionError> {
        timed(self.writer.write_all(buf)).await
    }

    /// Read up to `buf.len()` raw bytes; returns how many arrived.
    /// Zero means the peer closed mid-bulk.
    pub async fn recv_bytes(&mut self, buf: &mut [u8]) -> Result<usize, SessionError> {
        timed(self.reader.read(buf)).await
    }

    /// Flush buffered writes, then shut the stream down. Idempotent.
    pub async fn close(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        let _ = timeout(Duration::from_secs(1), async {
            let _ = self.writer.flush().await;
            let _ = self.writer.shutdown().await;
        })
        .await;
    }

    /// Split into independent halves so a serve loop can keep reading
    /// while a bulk send holds the write side.
    pub fn into_split(self) -> (SessionReader, SessionWriter) {
        (
            SessionReader {
                reader: self.reader,
                remote: self.remote,
            },
            SessionWriter {
                writer: self.writer,
                remote: self.remote,
            },
        )
    }
}

pub struct SessionReader {
    reader: BufReader<ReadHalf<DynStream>>,
    remote: SocketAddr,
}

impl SessionReader {
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub async fn recv_message(&mut self) -> Result<(MessageType, String), SessionError> {
        recv_framed(&mut self.reader).await
    }
}

pub struct SessionWriter {
    writer: WriteHalf<DynStream>,
    remote: SocketAddr,
}

impl SessionWriter {
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub async fn send_message<T: Serialize>(
        &mut self,
        kind: MessageType,
        payload: &T,
    ) -> Result<(), SessionError> {
        send_framed(&mut self.writer, kind, payload).await
    }

    pub async fn send_bytes(&mut self, buf: &[u8]) -> Result<(), SessionError> {
        timed(self.writer.write_all(buf)).await
    }

    pub async fn close(&mut self) {
        let _ = timeout(Duration::from_secs(1), async {
            let _ = self.writer.flush().await;
            let _ = self.writer.shutdown().await;
        })
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::PeerSession;
    use protocol::{decode_payload, MessageType, Ping};
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    fn addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
    }

    #[tokio::test]
    async fn messages_round_trip_between_session_ends() {
        let (a, b) = tokio::io::duplex(4096);
        let mut left = PeerSession::new(Box::new(a), addr());
        let mut right = PeerSession::new(Box::new(b), addr());

        left.send_message(MessageType::Ping, &Ping { timestamp: 7 })
            .await
            .unwrap();
        let (kind, data) = right.recv_message().await.unwrap();
        assert_eq!(kind, MessageType::Ping);
        let ping: Ping = decode_payload(kind, &data).unwrap();
        assert_eq!(ping.timestamp, 7);
    }

    #[tokio::test]
    async fn bulk_bytes_follow_envelopes_in_order() {
        let (a, b) = tokio::io::duplex(4096);
        let mut left = PeerSession::new(Box::new(a), addr());
        let mut right = PeerSession::new(Box::new(b), addr());

        left.send_message(MessageType::Ping, &Ping { timestamp: 1 })
            .await
            .unwrap();
        left.send_bytes(b"raw-payload").await.unwrap();
        left.send_message(MessageType::Pong, &Ping { timestamp: 2 })
            .await
            .unwrap();

        let (kind, _) = right.recv_message().await.unwrap();
        assert_eq!(kind, MessageType::Ping);

        let mut got = Vec::new();
        while got.len() < 11 {
            let mut buf = [0u8; 4];
            let n = right.recv_bytes(&mut buf).await.unwrap();
            assert!(n > 0);
            got.extend_from_slice(&buf[..n]);
        }
        assert_eq!(&got[..11], b"raw-payload");

        let (kind, _) = right.recv_message().await.unwrap();
        assert_eq!(kind, MessageType::Pong);
    }

    #[tokio::test]
    async fn orderly_eof_is_peer_closed() {
        let (a, b) = tokio::io::duplex(4096);
        let mut left = PeerSession::new(Box::new(a), addr());
        let mut right = PeerSession::new(Box::new(b), addr());

        left.close().await;
        assert!(!left.is_open());
        match right.recv_message().await {
            Err(super::SessionError::PeerClosed) => {}
            other => panic!("expected PeerClosed, got {:?}", other.map(|_| ())),
        }
    }
}
