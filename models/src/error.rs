use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable error codes carried in TRANSFER_ERROR envelopes and terminal
/// transfer states. `Unknown` absorbs codes from newer peers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    FileNotFound,
    PermissionDenied,
    StorageFull,
    ConnectionLost,
    InvalidRequest,
    TransferCancelled,
    PeerUnknown,
    PeerOffline,
    IoError,
    #[serde(other)]
    Unknown,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::FileNotFound => "FILE_NOT_FOUND",
            ErrorCode::PermissionDenied => "PERMISSION_DENIED",
            ErrorCode::StorageFull => "STORAGE_FULL",
            ErrorCode::ConnectionLost => "CONNECTION_LOST",
            ErrorCode::InvalidRequest => "INVALID_REQUEST",
            ErrorCode::TransferCancelled => "TRANSFER_CANCELLED",
            ErrorCode::PeerUnknown => "PEER_UNKNOWN",
            ErrorCode::PeerOffline => "PEER_OFFLINE",
            ErrorCode::IoError => "IO_ERROR",
            ErrorCode::Unknown => "UNKNOWN",
        }
    }

    /// Whether another connection attempt is allowed under the backoff
    /// policy. Codes not in the non-retryable set are retried.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ErrorCode::FileNotFound
                | ErrorCode::PermissionDenied
                | ErrorCode::StorageFull
                | ErrorCode::TransferCancelled
                | ErrorCode::InvalidRequest
                | ErrorCode::PeerUnknown
                | ErrorCode::PeerOffline
                | ErrorCode::IoError
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::ErrorCode;

    #[test]
    fn retryability_matches_policy() {
        assert!(ErrorCode::ConnectionLost.is_retryable());
        assert!(ErrorCode::Unknown.is_retryable());
        assert!(!ErrorCode::FileNotFound.is_retryable());
        assert!(!ErrorCode::PermissionDenied.is_retryable());
        assert!(!ErrorCode::StorageFull.is_retryable());
        assert!(!ErrorCode::TransferCancelled.is_retryable());
        assert!(!ErrorCode::InvalidRequest.is_retryable());
    }

    #[test]
    fn unknown_wire_codes_fall_back() {
        let code: ErrorCode = serde_json::from_str("\"SOME_FUTURE_CODE\"").unwrap();
        assert_eq!(code, ErrorCode::Unknown);
        let known: ErrorCode = serde_json::from_str("\"FILE_NOT_FOUND\"").unwrap();
        assert_eq!(known, ErrorCode::FileNotFound);
    }
}
