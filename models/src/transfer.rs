use std::path::PathBuf;

use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::ErrorCode;

/// Input to start a download from a peer.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub peer_device_id: String,
    pub file_id: Uuid,
    pub destination_path: PathBuf,
}

impl TransferRequest {
    /// Checked before any I/O happens.
    pub fn validate(&self) -> Result<(), String> {
        if self.peer_device_id.is_empty() {
            return Err("peer device id must not be empty".to_string());
        }
        if self.file_id.is_nil() {
            return Err("file id must not be nil".to_string());
        }
        if self.destination_path.as_os_str().is_empty() {
            return Err("destination path must not be empty".to_string());
        }
        if !self.destination_path.is_absolute() {
            return Err(format!(
                "destination path must be absolute (got {})",
                self.destination_path.display()
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransferState {
    Pending,
    InProgress {
        bytes: u64,
        total: u64,
        rate_bps: f64,
    },
    Completed {
        path: PathBuf,
        checksum: Option<String>,
    },
    Failed {
        code: ErrorCode,
        message: String,
    },
    Cancelled,
}

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferState::Completed { .. } | TransferState::Failed { .. } | TransferState::Cancelled
        )
    }
}

/// One logical download from request to terminal state.
#[derive(Debug, Clone)]
pub struct Transfer {
    pub transfer_id: Uuid,
    pub file_id: Uuid,
    pub file_name: String,
    pub file_size: u64,
    pub bytes_transferred: u64,
    pub peer_device_id: String,
    pub started_at: OffsetDateTime,
    pub state: TransferState,
}

impl Transfer {
    pub fn new(request: &TransferRequest) -> Self {
        Transfer {
            transfer_id: Uuid::new_v4(),
            file_id: request.file_id,
            file_name: String::new(),
            file_size: 0,
            bytes_transferred: 0,
            peer_device_id: request.peer_device_id.clone(),
            started_at: OffsetDateTime::now_utc(),
            state: TransferState::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::{TransferRequest, TransferState};
    use crate::error::ErrorCode;
    use std::path::PathBuf;
    use uuid::Uuid;

    fn request(dest: &str) -> TransferRequest {
        TransferRequest {
            peer_device_id: "peer-1".to_string(),
            file_id: Uuid::new_v4(),
            destination_path: PathBuf::from(dest),
        }
    }

    #[test]
    fn validation_requires_absolute_destination() {
        assert!(request("/tmp/out.bin").validate().is_ok());
        assert!(request("relative/out.bin").validate().is_err());
        assert!(request("").validate().is_err());
    }

    #[test]
    fn validation_rejects_empty_identifiers() {
        let mut r = request("/tmp/out.bin");
        r.peer_device_id.clear();
        assert!(r.validate().is_err());

        let mut r = request("/tmp/out.bin");
        r.file_id = Uuid::nil();
        assert!(r.validate().is_err());
    }

    #[test]
    fn terminal_states() {
        assert!(!TransferState::Pending.is_terminal());
        assert!(!TransferState::InProgress {
            bytes: 0,
            total: 1,
            rate_bps: 0.0
        }
        .is_terminal());
        assert!(TransferState::Cancelled.is_terminal());
        assert!(TransferState::Completed {
            path: PathBuf::from("/x"),
            checksum: None
        }
        .is_terminal());
        assert!(TransferState::Failed {
            code: ErrorCode::ConnectionLost,
            message: String::new()
        }
        .is_terminal());
    }
}
