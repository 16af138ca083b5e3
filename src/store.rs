// Persisted state: three JSON documents in the data directory.
//
//   settings.json  - upload settings and schedules
//   history.json   - newest first, bounded to 200 entries
//   stacks.json    - imported stack definitions keyed by stack name
//
// All mutations run load-mutate-persist under one mutex; readers get
// cloned snapshots.

use crate::compose::{self, ServiceSpec};
use crate::error::BackupError;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;

pub const HISTORY_LIMIT: usize = 200;

const SETTINGS_DOC: &str = "settings.json";
const HISTORY_DOC: &str = "history.json";
const STACKS_DOC: &str = "stacks.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Destination {
    Local,
    Telegram,
    Cloud,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub id: String,
    pub timestamp: String,
    pub subject: String,
    pub status: HistoryStatus,
    pub destination: Destination,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_path: Option<String>,
}

impl HistoryEntry {
    pub fn new(
        subject: impl Into<String>,
        status: HistoryStatus,
        destination: Destination,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now().to_rfc3339(),
            subject: subject.into(),
            status,
            destination,
            message: message.into(),
            size_bytes: None,
            artifact_path: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Manual,
    Daily,
    Weekly,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schedule {
    pub frequency: Frequency,
    /// Local wall-clock "HH:MM".
    pub time: String,
    /// 0 = Sunday .. 6 = Saturday; weekly only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub day_of_week: Option<u8>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub telegram_token: Option<String>,
    pub chat_id: Option<String>,
    pub telegram_api_root: Option<String>,
    pub container_schedules: BTreeMap<String, Schedule>,
    pub stack_schedules: BTreeMap<String, Schedule>,
}

/// An imported stack. Advisory: decides what to back up and provides the
/// manifest to redeploy from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackDefinition {
    pub stack_name: String,
    pub compose_yaml: String,
    #[serde(default)]
    pub env_vars: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env_file: Option<String>,
    #[serde(default)]
    pub services: BTreeMap<String, ServiceSpec>,
    pub updated_at: String,
}

#[derive(Default)]
struct StoreInner {
    settings: Settings,
    history: Vec<HistoryEntry>,
    stacks: BTreeMap<String, StackDefinition>,
}

#[derive(Clone)]
pub struct Store {
    data_dir: Arc<PathBuf>,
    inner: Arc<Mutex<StoreInner>>,
}

async fn load_doc<T: DeserializeOwned + Default>(path: &Path) -> T {
    match tokio::fs::read(path).await {
        Ok(bytes) => match serde_json::from_slice(&bytes) {
            Ok(value) => value,
            Err(e) => {
                warn!("ignoring malformed {}: {}", path.display(), e);
                T::default()
            }
        },
        Err(_) => T::default(),
    }
}

async fn save_doc<T: Serialize>(path: &Path, value: &T) -> Result<(), BackupError> {
    let bytes = serde_json::to_vec_pretty(value)?;
    tokio::fs::write(path, bytes).await?;
    Ok(())
}

impl Store {
    pub async fn open(data_dir: impl AsRef<Path>) -> Result<Self, BackupError> {
        let data_dir = data_dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&data_dir).await?;

        let inner = StoreInner {
            settings: load_doc(&data_dir.join(SETTINGS_DOC)).await,
            history: load_doc(&data_dir.join(HISTORY_DOC)).await,
            stacks: load_doc(&data_dir.join(STACKS_DOC)).await,
        };

        Ok(Self {
            data_dir: Arc::new(data_dir),
            inner: Arc::new(Mutex::new(inner)),
        })
    }

    // -- settings -----------------------------------------------------------

    pub async fn settings(&self) -> Settings {
        self.inner.lock().await.settings.clone()
    }

    pub async fn update_settings<F>(&self, mutate: F) -> Result<Settings, BackupError>
    where
        F: FnOnce(&mut Settings),
    {
        let mut inner = self.inner.lock().await;
        mutate(&mut inner.settings);
        save_doc(&self.data_dir.join(SETTINGS_DOC), &inner.settings).await?;
        Ok(inner.settings.clone())
    }

    // -- history ------------------------------------------------------------

    pub async fn history(&self) -> Vec<HistoryEntry> {
        self.inner.lock().await.history.clone()
    }

    /// Append one entry, newest first, evicting the oldest past the bound.
    pub async fn append_history(&self, entry: HistoryEntry) -> Result<(), BackupError> {
        let mut inner = self.inner.lock().await;
        inner.history.insert(0, entry);
        inner.history.truncate(HISTORY_LIMIT);
        save_doc(&self.data_dir.join(HISTORY_DOC), &inner.history).await?;
        Ok(())
    }

    // -- stacks -------------------------------------------------------------

    pub async fn stacks(&self) -> Vec<StackDefinition> {
        self.inner.lock().await.stacks.values().cloned().collect()
    }

    pub async fn stack(&self, name: &str) -> Option<StackDefinition> {
        self.inner.lock().await.stacks.get(name).cloned()
    }

    /// Import (or re-import) a stack definition, deriving per-service
    /// specs from the manifest.
    pub async fn import_stack(
        &self,
        name: &str,
        compose_yaml: String,
        env_vars: HashMap<String, String>,
        env_file: Option<String>,
    ) -> Result<StackDefinition, BackupError> {
        let parsed = compose::parse_manifest(&compose_yaml)?;
        let definition = StackDefinition {
            stack_name: name.to_string(),
            compose_yaml,
            env_vars,
            env_file,
            services: parsed.services,
            updated_at: Utc::now().to_rfc3339(),
        };

        let mut inner = self.inner.lock().await;
        inner
            .stacks
            .insert(name.to_string(), definition.clone());
        save_doc(&self.data_dir.join(STACKS_DOC), &inner.stacks).await?;
        Ok(definition)
    }

    pub async fn delete_stack(&self, name: &str) -> Result<bool, BackupError> {
        let mut inner = self.inner.lock().await;
        let removed = inner.stacks.remove(name).is_some();
        if removed {
            save_doc(&self.data_dir.join(STACKS_DOC), &inner.stacks).await?;
        }
        Ok(removed)
    }

    /// Volume destinations a stack declares for a compose service, when
    /// the container's labels map onto an imported definition.
    pub async fn declared_volumes(&self, project: &str, service: &str) -> Vec<String> {
        let inner = self.inner.lock().await;
        inner
            .stacks
            .get(project)
            .and_then(|def| def.services.get(service))
            .map(|spec| spec.volumes.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(n: usize) -> HistoryEntry {
        HistoryEntry::new(
            format!("job-{}", n),
            HistoryStatus::Success,
            Destination::Local,
            "ok",
        )
    }

    #[tokio::test]
    async fn test_history_is_bounded_newest_first() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path()).await.unwrap();

        for n in 0..HISTORY_LIMIT + 5 {
            store.append_history(entry(n)).await.unwrap();
        }

        let history = store.history().await;
        assert_eq!(history.len(), HISTORY_LIMIT);
        assert_eq!(history[0].subject, format!("job-{}", HISTORY_LIMIT + 4));
        // Oldest entries were evicted.
        assert_eq!(history.last().unwrap().subject, "job-5");
    }

    #[tokio::test]
    async fn test_import_stack_derives_services() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path()).await.unwrap();

        let manifest = r#"
services:
  db:
    image: postgres:16
    volumes:
      - data:/var/lib/postgresql/data
  web:
    image: nginx:1.27
"#;
        let def = store
            .import_stack("shop", manifest.to_string(), HashMap::new(), None)
            .await
            .unwrap();
        assert_eq!(def.services.len(), 2);
        assert_eq!(
            store.declared_volumes("shop", "db").await,
            vec!["/var/lib/postgresql/data".to_string()]
        );
        assert!(store.declared_volumes("shop", "ghost").await.is_empty());
        assert!(store.declared_volumes("other", "db").await.is_empty());
    }

    #[tokio::test]
    async fn test_import_rejects_bad_manifest() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path()).await.unwrap();
        let err = store
            .import_stack("x", "nope: [".to_string(), HashMap::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::Parse(_)));
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = Store::open(dir.path()).await.unwrap();
            store
                .import_stack("shop", "services:\n  db:\n    image: redis:7\n".to_string(), HashMap::new(), None)
                .await
                .unwrap();
            store.append_history(entry(1)).await.unwrap();
            store
                .update_settings(|s| {
                    s.stack_schedules.insert(
                        "shop".to_string(),
                        Schedule {
                            frequency: Frequency::Daily,
                            time: "03:30".to_string(),
                            day_of_week: None,
                        },
                    );
                })
                .await
                .unwrap();
        }

        let store = Store::open(dir.path()).await.unwrap();
        assert!(store.stack("shop").await.is_some());
        assert_eq!(store.history().await.len(), 1);
        assert_eq!(
            store.settings().await.stack_schedules["shop"].time,
            "03:30"
        );
    }
}
