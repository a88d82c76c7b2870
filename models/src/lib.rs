#![allow(dead_code)]

pub mod config;
pub mod error;
pub mod file;
pub mod peer;
pub mod transfer;

pub use config::{AppConfig, AppSettings};
pub use error::ErrorCode;
pub use file::SharedFile;
pub use peer::DevicePeer;
pub use transfer::{Transfer, TransferRequest, TransferState};

/// DNS-SD service type peers advertise and browse for.
pub const SERVICE_TYPE: &str = "_p2p-file-share._tcp.local.";

/// Protocol version carried in HANDSHAKE and the service TXT record.
pub const PROTOCOL_VERSION: &str = "1.0";

/// TXT record keys published alongside the service instance.
pub const TXT_DEVICE_ID: &str = "deviceId";
pub const TXT_NICKNAME: &str = "nickname";
pub const TXT_VERSION: &str = "version";

/// Bulk chunk size advertised in TRANSFER_START.
pub const CHUNK_SIZE: u32 = 8192;
