// Artifact shipping.
//
// When a Telegram token and chat id are configured the finalized artifact
// is POSTed as a document; on success the local file is deleted. Any
// failure keeps the artifact on disk and records the error, so a broken
// upload never loses a backup.

use crate::config::Config;
use crate::error::BackupError;
use crate::store::{Destination, Settings};
use std::path::Path;
use tracing::{info, warn};

const DEFAULT_API_ROOT: &str = "https://api.telegram.org";

#[derive(Debug, Clone)]
pub struct TelegramTarget {
    pub token: String,
    pub chat_id: String,
    pub api_root: String,
}

#[derive(Debug, Clone)]
pub struct UploadOutcome {
    pub destination: Destination,
    pub message: String,
    pub size_bytes: Option<u64>,
    pub artifact_path: Option<String>,
}

/// Environment-level configuration wins over stored settings.
pub fn resolve_target(config: &Config, settings: &Settings) -> Option<TelegramTarget> {
    let token = config
        .telegram_token
        .clone()
        .or_else(|| settings.telegram_token.clone())?;
    let chat_id = config
        .chat_id
        .clone()
        .or_else(|| settings.chat_id.clone())?;
    let api_root = config
        .telegram_api_root
        .clone()
        .or_else(|| settings.telegram_api_root.clone())
        .unwrap_or_else(|| DEFAULT_API_ROOT.to_string());

    Some(TelegramTarget {
        token,
        chat_id,
        api_root,
    })
}

async fn send_document(target: &TelegramTarget, path: &Path) -> Result<(), BackupError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| BackupError::UploadFailed(format!("failed to read artifact: {}", e)))?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "backup.zip".to_string());

    let url = format!(
        "{}/bot{}/sendDocument",
        target.api_root.trim_end_matches('/'),
        target.token
    );
    let form = reqwest::multipart::Form::new()
        .text("chat_id", target.chat_id.clone())
        .part(
            "document",
            reqwest::multipart::Part::bytes(bytes).file_name(file_name),
        );

    let response = reqwest::Client::new()
        .post(&url)
        .multipart(form)
        .send()
        .await
        .map_err(|e| BackupError::UploadFailed(e.to_string()))?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(BackupError::UploadFailed(format!(
            "telegram returned {}: {}",
            status,
            body.chars().take(300).collect::<String>()
        )));
    }
    Ok(())
}

/// Ship a finalized artifact, or keep it locally when no upload target
/// is configured or the upload fails.
pub async fn ship_artifact(target: Option<TelegramTarget>, path: &Path) -> UploadOutcome {
    let size_bytes = tokio::fs::metadata(path).await.map(|m| m.len()).ok();

    let Some(target) = target else {
        return UploadOutcome {
            destination: Destination::Local,
            message: "stored locally".to_string(),
            size_bytes,
            artifact_path: Some(path.display().to_string()),
        };
    };

    match send_document(&target, path).await {
        Ok(()) => {
            if let Err(e) = tokio::fs::remove_file(path).await {
                warn!("uploaded artifact could not be removed: {}", e);
            }
            info!("artifact {} shipped to telegram", path.display());
            UploadOutcome {
                destination: Destination::Telegram,
                message: "uploaded to telegram".to_string(),
                size_bytes,
                artifact_path: None,
            }
        }
        Err(e) => {
            warn!("upload failed, keeping artifact locally: {}", e);
            UploadOutcome {
                destination: Destination::Local,
                message: e.to_string(),
                size_bytes,
                artifact_path: Some(path.display().to_string()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn config(args: &[&str]) -> Config {
        // Keep ambient credentials out of the assertions.
        std::env::remove_var("TELEGRAM_TOKEN");
        std::env::remove_var("CHAT_ID");
        std::env::remove_var("TELEGRAM_API_ROOT");
        Config::try_parse_from(std::iter::once("dockvault").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_resolve_needs_token_and_chat() {
        let cfg = config(&[]);
        let settings = Settings::default();
        assert!(resolve_target(&cfg, &settings).is_none());

        let cfg = config(&["--telegram-token", "t0k"]);
        assert!(resolve_target(&cfg, &settings).is_none());

        let cfg = config(&["--telegram-token", "t0k", "--chat-id", "42"]);
        let target = resolve_target(&cfg, &settings).unwrap();
        assert_eq!(target.token, "t0k");
        assert_eq!(target.chat_id, "42");
        assert_eq!(target.api_root, DEFAULT_API_ROOT);
    }

    #[test]
    fn test_settings_fill_in_missing_config() {
        let cfg = config(&[]);
        let settings = Settings {
            telegram_token: Some("stored".to_string()),
            chat_id: Some("99".to_string()),
            telegram_api_root: Some("https://tg.example".to_string()),
            ..Default::default()
        };
        let target = resolve_target(&cfg, &settings).unwrap();
        assert_eq!(target.token, "stored");
        assert_eq!(target.api_root, "https://tg.example");
    }

    #[tokio::test]
    async fn test_unconfigured_ships_locally() {
        let dir = tempfile::TempDir::new().unwrap();
        let artifact = dir.path().join("a.zip");
        tokio::fs::write(&artifact, b"zipbytes").await.unwrap();

        let outcome = ship_artifact(None, &artifact).await;
        assert_eq!(outcome.destination, Destination::Local);
        assert_eq!(outcome.size_bytes, Some(8));
        assert!(artifact.exists());
    }
}
