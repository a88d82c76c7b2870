#![allow(dead_code)]

mod envelope;
mod payload;

pub use envelope::{decode_envelope, decode_payload, encode_envelope, Envelope};
pub use payload::{
    CancelTransfer, FileList, Handshake, HandshakeAck, ListFiles, Ping, Pong, TransferAck,
    TransferCancelled, TransferComplete, TransferErrorMsg, TransferProgress, TransferRequestMsg,
    TransferStart,
};

use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("unknown message type {0:?}")]
    UnknownType(String),
    #[error("payload decode failed for {kind}: {source}")]
    PayloadDecode {
        kind: MessageType,
        #[source]
        source: serde_json::Error,
    },
}

/// The envelope `type` discriminator. Values on the wire are the literal
/// strings below, case-sensitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Handshake,
    HandshakeAck,
    ListFiles,
    FileList,
    TransferRequest,
    TransferStart,
    TransferProgress,
    TransferComplete,
    TransferAck,
    TransferError,
    CancelTransfer,
    TransferCancelled,
    Ping,
    Pong,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Handshake => "HANDSHAKE",
            MessageType::HandshakeAck => "HANDSHAKE_ACK",
            MessageType::ListFiles => "LIST_FILES",
            MessageType::FileList => "FILE_LIST",
            MessageType::TransferRequest => "TRANSFER_REQUEST",
            MessageType::TransferStart => "TRANSFER_START",
            MessageType::TransferProgress => "TRANSFER_PROGRESS",
            MessageType::TransferComplete => "TRANSFER_COMPLETE",
            MessageType::TransferAck => "TRANSFER_ACK",
            MessageType::TransferError => "TRANSFER_ERROR",
            MessageType::CancelTransfer => "CANCEL_TRANSFER",
            MessageType::TransferCancelled => "TRANSFER_CANCELLED",
            MessageType::Ping => "PING",
            MessageType::Pong => "PONG",
        }
    }

    pub fn parse(s: &str) -> Result<Self, ProtocolError> {
        match s {
            "HANDSHAKE" => Ok(MessageType::Handshake),
            "HANDSHAKE_ACK" => Ok(MessageType::HandshakeAck),
            "LIST_FILES" => Ok(MessageType::ListFiles),
            "FILE_LIST" => Ok(MessageType::FileList),
            "TRANSFER_REQUEST" => Ok(MessageType::TransferRequest),
            "TRANSFER_START" => Ok(MessageType::TransferStart),
            "TRANSFER_PROGRESS" => Ok(MessageType::TransferProgress),
            "TRANSFER_COMPLETE" => Ok(MessageType::TransferComplete),
            "TRANSFER_ACK" => Ok(MessageType::TransferAck),
            "TRANSFER_ERROR" => Ok(MessageType::TransferError),
            "CANCEL_TRANSFER" => Ok(MessageType::CancelTransfer),
            "TRANSFER_CANCELLED" => Ok(MessageType::TransferCancelled),
            "PING" => Ok(MessageType::Ping),
            "PONG" => Ok(MessageType::Pong),
            other => Err(ProtocolError::UnknownType(other.to_string())),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
