use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

/// Dockvault - container fleet backup and restore service
#[derive(Parser, Debug)]
#[command(name = "dockvault")]
#[command(version, about, long_about = None)]
pub struct Config {
    /// Port to listen on
    #[arg(short, long, env = "DOCKVAULT_PORT", default_value = "5055")]
    pub port: u16,

    /// Hostname to bind to
    #[arg(long, env = "DOCKVAULT_HOSTNAME")]
    pub hostname: Option<String>,

    /// Data directory for persisted state
    #[arg(long, env = "DOCKVAULT_DATA_DIR", default_value = "./data")]
    pub data_dir: PathBuf,

    /// Directory where finished artifacts are kept
    #[arg(long, env = "DOCKVAULT_BACKUP_DIR", default_value = "./backups")]
    pub backup_dir: PathBuf,

    /// Telegram bot token for shipping artifacts
    #[arg(long, env = "TELEGRAM_TOKEN")]
    pub telegram_token: Option<String>,

    /// Telegram chat that receives artifacts
    #[arg(long, env = "CHAT_ID")]
    pub chat_id: Option<String>,

    /// Override for the Telegram API root
    #[arg(long, env = "TELEGRAM_API_ROOT")]
    pub telegram_api_root: Option<String>,
}

impl Config {
    pub fn parse() -> Result<Self> {
        let config = <Self as Parser>::parse();
        Ok(config)
    }

    /// Get the bind address as a string
    pub fn bind_address(&self) -> String {
        if let Some(ref hostname) = self.hostname {
            format!("{}:{}", hostname, self.port)
        } else {
            format!("0.0.0.0:{}", self.port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::try_parse_from(["dockvault"]).unwrap();
        assert_eq!(config.port, 5055);
        assert_eq!(config.bind_address(), "0.0.0.0:5055");
        assert_eq!(config.data_dir, PathBuf::from("./data"));
        assert_eq!(config.backup_dir, PathBuf::from("./backups"));
    }

    #[test]
    fn test_hostname_in_bind_address() {
        let config =
            Config::try_parse_from(["dockvault", "--hostname", "127.0.0.1", "-p", "9000"]).unwrap();
        assert_eq!(config.bind_address(), "127.0.0.1:9000");
    }
}
