use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use utilities::{Net, VirtualNet};

#[tokio::test]
async fn tcp_connect_accept_is_duplex() {
    let net: Arc<dyn Net> = Arc::new(VirtualNet::default());
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9010);
    let listener = net.bind_tcp_listener(addr).await.unwrap();

    let server_task = tokio::spawn(async move {
        let (mut server_stream, _peer_addr) = listener.accept().await.unwrap();

        let mut buf = [0u8; 5];
        server_stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping!");

        server_stream.write_all(b"pong!").await.unwrap();
    });

    let mut client = net.connect_tcp(addr).await.unwrap();
    client.write_all(b"ping!").await.unwrap();
    let mut reply = [0u8; 5];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"pong!");

    server_task.await.unwrap();
}

#[tokio::test]
async fn tcp_connect_without_listener_fails() {
    let net = VirtualNet::default();
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9999);
    match net.connect_tcp(addr).await {
        Ok(_) => panic!("connect_tcp should fail without a listener"),
        Err(err) => assert_eq!(err.kind(), std::io::ErrorKind::ConnectionRefused),
    }
}

#[tokio::test]
async fn killed_listener_refuses_new_connections() {
    let net = VirtualNet::default();
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9020);
    let _listener = net.bind_tcp_listener(addr).await.unwrap();

    assert!(net.connect_tcp(addr).await.is_ok());
    net.kill_listener(addr);
    assert!(net.connect_tcp(addr).await.is_err());
}
