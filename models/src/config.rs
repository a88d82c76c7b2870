use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Full node configuration handed to `Engine::start`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub device_id: String,
    pub nickname: String,
    pub shared_root: PathBuf,
    pub port: u16,
    pub log_path: PathBuf,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.device_id.is_empty() {
            return Err("device id must not be empty".to_string());
        }
        if self.nickname.is_empty() {
            return Err("nickname must not be empty".to_string());
        }
        if self.shared_root.as_os_str().is_empty() {
            return Err("shared root must not be empty".to_string());
        }
        if self.port == 0 {
            return Err("port must be in 1..=65535".to_string());
        }
        Ok(())
    }

    pub fn settings(&self) -> AppSettings {
        AppSettings {
            nickname: self.nickname.clone(),
            shared_root: self.shared_root.clone(),
            port: self.port,
        }
    }
}

/// The mutable subset the settings collaborator may change at runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppSettings {
    pub nickname: String,
    pub shared_root: PathBuf,
    pub port: u16,
}

#[cfg(test)]
mod tests {
    use super::AppConfig;
    use std::path::PathBuf;

    fn config() -> AppConfig {
        AppConfig {
            device_id: "dev-1".to_string(),
            nickname: "office-pc".to_string(),
            shared_root: PathBuf::from("/srv/shared"),
            port: 8888,
            log_path: PathBuf::from("lanshare.log"),
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(config().validate().is_ok());
    }

    #[test]
    fn invalid_fields_are_rejected() {
        let mut c = config();
        c.device_id.clear();
        assert!(c.validate().is_err());

        let mut c = config();
        c.port = 0;
        assert!(c.validate().is_err());
    }
}
