// Artifact archive format.
//
// An artifact is a single zip (deflate, level 9) with a fixed layout:
//
// Single container:            Unified stack:
//   /config.json                 /stack_metadata.json
//   /dump.sql                    /docker-compose.yml
//   /<escaped_path>.tar          /.env
//   /ERROR_<escaped>.txt         /services/<name>/config.json
//                                /services/<name>/dump.sql
//                                /services/<name>/volumes/<escaped>.tar
//
// The metadata entry is always the first append. Captured tar entries
// encode the original absolute path: `/a/b/c` <-> `a_b_c.tar`. The escape
// is lossy for paths containing `_`; old archives must keep restoring, so
// the decode rule stays as-is.

use crate::error::BackupError;
use bytes::Bytes;
use futures_util::{pin_mut, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Seek, Write};
use std::path::PathBuf;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

pub const CONTAINER_META_ENTRY: &str = "config.json";
pub const STACK_META_ENTRY: &str = "stack_metadata.json";
pub const MANIFEST_ENTRY: &str = "docker-compose.yml";
pub const ENV_ENTRY: &str = ".env";
pub const DUMP_ENTRY: &str = "dump.sql";

// ---------------------------------------------------------------------------
// Path escape rule
// ---------------------------------------------------------------------------

/// `/usr/share` -> `_usr_share`: every separator becomes an underscore,
/// the leading one included.
pub fn escape_path(path: &str) -> String {
    path.replace('/', "_")
}

pub fn tar_entry_name(path: &str) -> String {
    format!("{}.tar", escape_path(path))
}

pub fn error_entry_name(path: &str) -> String {
    format!("ERROR_{}.txt", escape_path(path))
}

/// `_usr_share.tar` -> `/usr/share`. Also accepts the older form without
/// the leading underscore, so archives from either encoder restore.
/// Lossy for original paths containing `_`.
pub fn decode_tar_entry(name: &str) -> String {
    let stem = name.strip_suffix(".tar").unwrap_or(name);
    let path = stem.replace('_', "/");
    if path.starts_with('/') {
        path
    } else {
        format!("/{}", path)
    }
}

// ---------------------------------------------------------------------------
// Metadata schemas
// ---------------------------------------------------------------------------

/// Per-container metadata, the sole source of truth for a later restore.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerMeta {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub env: Vec<String>,
    /// Exposed container ports, docker-style `{"80/tcp": {}}`.
    #[serde(default)]
    pub ports: BTreeMap<String, serde_json::Value>,
    pub host_config: HostConfigMeta,
    #[serde(default)]
    pub cmd: Vec<String>,
    pub network_settings: NetworkSettingsMeta,
    pub app_type: String,
    #[serde(default)]
    pub backup_paths: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compose_project: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compose_service: Option<String>,
    pub timestamp: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostConfigMeta {
    #[serde(rename = "PortBindings", default)]
    pub port_bindings: BTreeMap<String, Vec<PortBindingMeta>>,
    #[serde(rename = "Binds", default)]
    pub binds: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortBindingMeta {
    #[serde(rename = "HostIp", default)]
    pub host_ip: String,
    #[serde(rename = "HostPort")]
    pub host_port: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkSettingsMeta {
    #[serde(rename = "Networks", default)]
    pub networks: BTreeMap<String, serde_json::Value>,
}

/// Root metadata of a unified stack archive.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackMetadata {
    pub stack_name: String,
    pub timestamp: String,
    pub containers: Vec<StackMember>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackMember {
    pub id: String,
    pub name: String,
    pub service: String,
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

/// Append-only, single-pass artifact writer. Callers order appends; the
/// metadata entry must come first. Dropping without `finalize` deletes
/// the partial output.
pub struct ArtifactWriter {
    zip: Option<ZipWriter<File>>,
    path: PathBuf,
}

impl ArtifactWriter {
    pub fn create(path: PathBuf) -> Result<Self, BackupError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(&path)?;
        Ok(Self {
            zip: Some(ZipWriter::new(file)),
            path,
        })
    }

    fn entry_options() -> SimpleFileOptions {
        SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .compression_level(Some(9))
            .large_file(true)
    }

    fn zip(&mut self) -> &mut ZipWriter<File> {
        // Only None after finalize consumed self.
        self.zip.as_mut().expect("writer already finalized")
    }

    pub fn append_bytes(&mut self, name: &str, bytes: &[u8]) -> Result<(), BackupError> {
        self.zip().start_file(name, Self::entry_options())?;
        self.zip().write_all(bytes)?;
        Ok(())
    }

    pub fn append_json<T: Serialize>(&mut self, name: &str, value: &T) -> Result<(), BackupError> {
        let bytes = serde_json::to_vec_pretty(value)?;
        self.append_bytes(name, &bytes)
    }

    /// Stream an engine tar into the archive, returning the byte count.
    /// A failing stream aborts the partially written entry so the
    /// archive stays consistent.
    pub async fn append_stream<S>(&mut self, name: &str, stream: S) -> Result<u64, BackupError>
    where
        S: Stream<Item = Result<Bytes, bollard::errors::Error>>,
    {
        pin_mut!(stream);
        self.zip().start_file(name, Self::entry_options())?;
        let mut written: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    let _ = self.zip().abort_file();
                    return Err(BackupError::CaptureFailed(e.to_string()));
                }
            };
            if let Err(e) = self.zip().write_all(&chunk) {
                let _ = self.zip().abort_file();
                return Err(BackupError::Io(e));
            }
            written += chunk.len() as u64;
        }
        Ok(written)
    }

    /// Copy a scratch file (a finished database dump) into the archive.
    pub fn append_file(&mut self, name: &str, file: &mut File) -> Result<u64, BackupError> {
        self.zip().start_file(name, Self::entry_options())?;
        file.rewind()?;
        let written = std::io::copy(file, self.zip())?;
        Ok(written)
    }

    pub fn finalize(mut self) -> Result<PathBuf, BackupError> {
        let zip = self.zip.take().expect("writer already finalized");
        zip.finish()?;
        Ok(self.path.clone())
    }
}

impl Drop for ArtifactWriter {
    fn drop(&mut self) {
        if self.zip.take().is_some() {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

// ---------------------------------------------------------------------------
// Reader helpers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    SingleContainer,
    UnifiedStack,
    /// Deprecated nested-zip stack form: child single-container archives
    /// at the root, no metadata entry.
    LegacyStack,
}

/// Route on root entries only.
pub fn detect_kind<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
) -> Result<ArtifactKind, BackupError> {
    let names: Vec<String> = archive.file_names().map(|n| n.to_string()).collect();
    if names.iter().any(|n| n == CONTAINER_META_ENTRY) {
        return Ok(ArtifactKind::SingleContainer);
    }
    if names.iter().any(|n| n == STACK_META_ENTRY) {
        return Ok(ArtifactKind::UnifiedStack);
    }
    if names.iter().any(|n| !n.contains('/') && n.ends_with(".zip")) {
        return Ok(ArtifactKind::LegacyStack);
    }
    Err(BackupError::Parse(
        "archive carries neither container nor stack metadata".to_string(),
    ))
}

pub fn read_entry_bytes<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
    name: &str,
) -> Result<Vec<u8>, BackupError> {
    let mut entry = archive.by_name(name)?;
    let mut buf = Vec::with_capacity(entry.size() as usize);
    entry.read_to_end(&mut buf)?;
    Ok(buf)
}

pub fn read_entry_string<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
    name: &str,
) -> Result<String, BackupError> {
    let bytes = read_entry_bytes(archive, name)?;
    String::from_utf8(bytes).map_err(|e| BackupError::Parse(format!("{}: {}", name, e)))
}
