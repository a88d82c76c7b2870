use clap::Parser;
use models::AppConfig;
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "lanshare", about = "LAN peer-to-peer file sharing node")]
pub struct CliConfig {
    /// Stable device identifier; generated when omitted
    #[arg(long)]
    pub device_id: Option<String>,

    /// Name shown to other peers; defaults to the hostname
    #[arg(long)]
    pub nickname: Option<String>,

    /// Directory whose files are offered to peers
    #[arg(long, default_value = "shared")]
    pub shared_root: PathBuf,

    /// TCP listen port for peer connections
    #[arg(long, default_value_t = 8888)]
    pub port: u16,

    /// Path to the log file
    #[arg(long, default_value = "lanshare.log")]
    pub log_path: PathBuf,
}

impl CliConfig {
    pub fn into_app_config(self) -> AppConfig {
        let nickname = self.nickname.unwrap_or_else(|| {
            hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "lanshare-node".to_string())
        });
        let device_id = self
            .device_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        AppConfig {
            device_id,
            nickname,
            shared_root: self.shared_root,
            port: self.port,
            log_path: self.log_path,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::CliConfig;
    use std::path::PathBuf;

    #[test]
    fn defaults_fill_identity_fields() {
        let cfg = CliConfig {
            device_id: None,
            nickname: None,
            shared_root: PathBuf::from("shared"),
            port: 8888,
            log_path: PathBuf::from("lanshare.log"),
        };
        let app = cfg.into_app_config();
        assert!(!app.device_id.is_empty());
        assert!(!app.nickname.is_empty());
        assert_eq!(app.port, 8888);
        assert!(app.validate().is_ok());
    }

    #[test]
    fn explicit_identity_is_kept() {
        let cfg = CliConfig {
            device_id: Some("dev-42".to_string()),
            nickname: Some("den-pc".to_string()),
            shared_root: PathBuf::from("/srv/share"),
            port: 9000,
            log_path: PathBuf::from("x.log"),
        };
        let app = cfg.into_app_config();
        assert_eq!(app.device_id, "dev-42");
        assert_eq!(app.nickname, "den-pc");
    }
}
