use std::net::{IpAddr, SocketAddr};

/// A peer observed on the local network via discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevicePeer {
    pub device_id: String,
    pub nickname: String,
    pub address: IpAddr,
    pub port: u16,
    pub online: bool,
}

impl DevicePeer {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}
