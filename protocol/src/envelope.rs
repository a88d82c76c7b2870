use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{MessageType, ProtocolError};

/// The outer frame: one JSON object per newline-terminated line. `data`
/// holds the inner payload serialized independently and embedded as a
/// string so the receiver can pick a typed deserializer from `type`
/// before touching the payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: String,
}

/// Serialize `payload` into an envelope line, including the trailing
/// newline.
pub fn encode_envelope<T: Serialize>(kind: MessageType, payload: &T) -> Result<String, ProtocolError> {
    let data = serde_json::to_string(payload)
        .map_err(|e| ProtocolError::MalformedFrame(e.to_string()))?;
    let envelope = Envelope {
        kind: kind.as_str().to_string(),
        data,
    };
    let mut line = serde_json::to_string(&envelope)
        .map_err(|e| ProtocolError::MalformedFrame(e.to_string()))?;
    line.push('\n');
    Ok(line)
}

/// Parse one envelope line into its type and the raw payload string.
pub fn decode_envelope(line: &str) -> Result<(MessageType, String), ProtocolError> {
    let trimmed = line.trim_end_matches(['\r', '\n']);
    let envelope: Envelope = serde_json::from_str(trimmed)
        .map_err(|e| ProtocolError::MalformedFrame(e.to_string()))?;
    let kind = MessageType::parse(&envelope.kind)?;
    Ok((kind, envelope.data))
}

/// Deserialize the inner payload of an already-parsed envelope. Unknown
/// fields in the payload are ignored.
pub fn decode_payload<T: DeserializeOwned>(kind: MessageType, data: &str) -> Result<T, ProtocolError> {
    serde_json::from_str(data).map_err(|source| ProtocolError::PayloadDecode { kind, source })
}
