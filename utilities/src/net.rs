use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

pub type DynStream = Box<dyn AsyncReadWrite>;

pub trait AsyncReadWrite: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T> AsyncReadWrite for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

#[async_trait]
pub trait TcpListenerLike: Send + Sync {
    async fn accept(&self) -> io::Result<(DynStream, SocketAddr)>;
}

#[async_trait]
pub trait Net: Send + Sync {
    async fn bind_tcp_listener(&self, addr: SocketAddr) -> io::Result<Arc<dyn TcpListenerLike>>;
    async fn connect_tcp(&self, addr: SocketAddr) -> io::Result<DynStream>;
}

/* Real network implementation (tokio) */

#[derive(Debug, Clone)]
pub struct RealNet;

fn tune_stream(stream: &tokio::net::TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)?;
    socket2::SockRef::from(stream).set_keepalive(true)?;
    Ok(())
}

#[async_trait]
impl Net for RealNet {
    async fn bind_tcp_listener(&self, addr: SocketAddr) -> io::Result<Arc<dyn TcpListenerLike>> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        Ok(Arc::new(RealTcpListener(listener)))
    }

    async fn connect_tcp(&self, addr: SocketAddr) -> io::Result<DynStream> {
        let stream = tokio::net::TcpStream::connect(addr).await?;
        tune_stream(&stream)?;
        Ok(Box::new(stream))
    }
}

struct RealTcpListener(tokio::net::TcpListener);

#[async_trait]
impl TcpListenerLike for RealTcpListener {
    async fn accept(&self) -> io::Result<(DynStream, SocketAddr)> {
        let (stream, addr) = self.0.accept().await?;
        tune_stream(&stream)?;
        Ok((Box::new(stream), addr))
    }
}

/* Virtual network for tests */

#[derive(Debug, Clone, Default)]
pub struct VirtualNet {
    inner: Arc<Mutex<VirtualNetInner>>,
}

#[derive(Default, Debug)]
struct VirtualNetInner {
    tcp_listeners: HashMap<SocketAddr, mpsc::Sender<(DynStream, SocketAddr)>>,
}

impl VirtualNet {
    /// Drop the listener registered at `addr`, so later connects are
    /// refused. Streams already established stay usable.
    pub fn kill_listener(&self, addr: SocketAddr) {
        self.inner.lock().unwrap().tcp_listeners.remove(&addr);
    }
}

#[async_trait]
impl Net for VirtualNet {
    async fn bind_tcp_listener(&self, addr: SocketAddr) -> io::Result<Arc<dyn TcpListenerLike>> {
        let (tx, rx) = mpsc::channel(32);
        self.inner.lock().unwrap().tcp_listeners.insert(addr, tx);
        Ok(Arc::new(VirtualTcpListener {
            addr,
            rx: tokio::sync::Mutex::new(rx),
        }))
    }

    async fn connect_tcp(&self, addr: SocketAddr) -> io::Result<DynStream> {
        let listener_tx = {
            let inner = self.inner.lock().unwrap();
            // a wildcard bind accepts connections addressed to any IP on
            // that port, like a real 0.0.0.0 listener
            let wildcard = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), addr.port());
            inner
                .tcp_listeners
                .get(&addr)
                .or_else(|| inner.tcp_listeners.get(&wildcard))
                .cloned()
                .ok_or_else(|| io::Error::new(io::ErrorKind::ConnectionRefused, "no listener"))?
        };

        let (client, server) = tokio::io::duplex(64 * 1024);
        let client_stream: DynStream = Box::new(client);
        let server_stream: DynStream = Box::new(server);
        listener_tx
            .send((
                server_stream,
                SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
            ))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::ConnectionAborted, "listener dropped"))?;
        Ok(client_stream)
    }
}

struct VirtualTcpListener {
    addr: SocketAddr,
    rx: tokio::sync::Mutex<mpsc::Receiver<(DynStream, SocketAddr)>>,
}

#[async_trait]
impl TcpListenerLike for VirtualTcpListener {
    async fn accept(&self) -> io::Result<(DynStream, SocketAddr)> {
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(v) => Ok(v),
            None => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("listener {} closed", self.addr),
            )),
        }
    }
}
