//! Clone restore: recreate a container from a single-container artifact.
//!
//! Host-side conflicts are resolved on the way in: published ports are
//! probed and moved up to the first free port, existing bind-mount host
//! paths are retargeted to `<path>_restored_<epoch>`, and the original
//! network is reattached when it still exists (falling back to the
//! default bridge). A legacy stack archive (nested child zips, no root
//! metadata) restores each child onto a fresh bridge network, databases
//! first.
//!
//! Failures after creation leave the new container stopped, not removed,
//! so the operator can inspect it.

use crate::archive::{self, ArtifactKind, ContainerMeta, CONTAINER_META_ENTRY};
use crate::engine;
use crate::error::BackupError;
use crate::jobs::JobProgress;
use crate::rewrite::{self, HostView};
use bollard::container::Config;
use bollard::models::{
    EndpointSettings, HostConfig, PortBinding, RestartPolicy, RestartPolicyNameEnum,
};
use bollard::Docker;
use chrono::Utc;
use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use zip::ZipArchive;

#[derive(Debug)]
pub struct CloneOutcome {
    pub container: String,
    pub remappings: Vec<String>,
    pub warnings: Vec<String>,
}

/// Restore a single-container or legacy stack artifact. Unified stack
/// archives go through the stack pipeline instead; routing is on root
/// entries and happens in the job worker.
pub async fn clone_from_artifact(
    docker: &Docker,
    artifact: &Path,
    network_override: Option<String>,
    progress: &JobProgress,
) -> Result<Vec<CloneOutcome>, BackupError> {
    let file = File::open(artifact)?;
    let mut zip = ZipArchive::new(file)?;

    match archive::detect_kind(&mut zip)? {
        ArtifactKind::SingleContainer => {
            let outcome = clone_single(docker, artifact, network_override, progress).await?;
            Ok(vec![outcome])
        }
        ArtifactKind::LegacyStack => {
            clone_legacy_stack(docker, artifact, progress).await
        }
        ArtifactKind::UnifiedStack => Err(BackupError::Parse(
            "unified stack archive: restore it through the stack pipeline".to_string(),
        )),
    }
}

/// Database-looking children boot first so dependents find their
/// backends up.
fn database_rank(file_name: &str) -> usize {
    let lower = file_name.to_lowercase();
    let is_db = ["postgres", "mysql", "mariadb", "redis", "db"]
        .iter()
        .any(|needle| lower.contains(needle));
    if is_db {
        0
    } else {
        1
    }
}

async fn clone_legacy_stack(
    docker: &Docker,
    artifact: &Path,
    progress: &JobProgress,
) -> Result<Vec<CloneOutcome>, BackupError> {
    let epoch = Utc::now().timestamp();
    let network = format!("stack_restore_{}", epoch);

    // Unpack children to a scratch dir before touching the engine.
    let scratch = tempfile::Builder::new().prefix("dockvault-restore-").tempdir()?;
    let mut children: Vec<PathBuf> = Vec::new();
    {
        let file = File::open(artifact)?;
        let mut zip = ZipArchive::new(file)?;
        let names: Vec<String> = zip
            .file_names()
            .filter(|n| !n.contains('/') && n.ends_with(".zip"))
            .map(|n| n.to_string())
            .collect();
        for name in names {
            let bytes = archive::read_entry_bytes(&mut zip, &name)?;
            let child_path = scratch.path().join(&name);
            let mut out = File::create(&child_path)?;
            out.write_all(&bytes)?;
            children.push(child_path);
        }
    }
    if children.is_empty() {
        return Err(BackupError::Parse(
            "legacy stack archive has no child archives".to_string(),
        ));
    }

    children.sort_by_key(|path| {
        database_rank(
            path.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
                .as_str(),
        )
    });

    engine::create_bridge_network(docker, &network).await?;
    info!("restoring legacy stack onto network {}", network);

    // Every child is attempted; the restore succeeds iff all succeed.
    let total = children.len();
    let mut outcomes = Vec::new();
    let mut failures = Vec::new();
    for (i, child) in children.iter().enumerate() {
        let child_name = child
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        progress
            .set_message(format!("[{}/{}] {}", i + 1, total, child_name))
            .await;
        match clone_single(docker, child, Some(network.clone()), progress).await {
            Ok(outcome) => outcomes.push(outcome),
            Err(e) => {
                warn!("child {} failed: {}", child_name, e);
                failures.push(format!("{}: {}", child_name, e));
            }
        }
    }
    if !failures.is_empty() {
        return Err(BackupError::CaptureFailed(format!(
            "{} of {} children failed: {}",
            failures.len(),
            total,
            failures.join("; ")
        )));
    }
    Ok(outcomes)
}

/// Restore one container from its artifact.
pub async fn clone_single(
    docker: &Docker,
    artifact: &Path,
    network_override: Option<String>,
    progress: &JobProgress,
) -> Result<CloneOutcome, BackupError> {
    let file = File::open(artifact)?;
    let mut zip = ZipArchive::new(file)?;

    let meta: ContainerMeta = serde_json::from_str(
        &archive::read_entry_string(&mut zip, CONTAINER_META_ENTRY).map_err(|_| {
            BackupError::Parse(format!(
                "{}: missing {}",
                artifact.display(),
                CONTAINER_META_ENTRY
            ))
        })?,
    )?;

    progress
        .set_message(format!("pulling image {}", meta.image))
        .await;
    engine::ensure_image(docker, &meta.image).await?;

    let epoch = Utc::now().timestamp();
    let new_name = format!("{}_restored_{}", meta.name.trim_start_matches('/'), epoch);
    let mut warnings = Vec::new();

    // Networking: an override wins; otherwise the first original network
    // when it still exists, else the default bridge.
    let network = match &network_override {
        Some(network) => network.clone(),
        None => match meta.network_settings.networks.keys().next().cloned() {
            Some(name) => {
                if engine::network_exists(docker, &name).await.unwrap_or(false) {
                    name
                } else {
                    warnings.push(format!("network {} no longer exists, using bridge", name));
                    "bridge".to_string()
                }
            }
            None => "bridge".to_string(),
        },
    };

    let mut aliases = Vec::new();
    if let Some(service) = &meta.compose_service {
        aliases.push(service.clone());
    }
    aliases.push(meta.name.trim_start_matches('/').to_string());
    let mut endpoints = HashMap::new();
    endpoints.insert(
        network.clone(),
        EndpointSettings {
            aliases: Some(aliases),
            ..Default::default()
        },
    );

    // Port rebinding: probe from the original host port upward.
    let mut view = HostView {
        published: engine::published_host_ports(docker).await.unwrap_or_default(),
    };
    let mut remappings = Vec::new();
    let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
    for (container_port, bindings) in &meta.host_config.port_bindings {
        let mut rebound = Vec::new();
        for binding in bindings {
            let Ok(host) = binding.host_port.parse::<u16>() else {
                rebound.push(PortBinding {
                    host_ip: Some(binding.host_ip.clone()),
                    host_port: Some(binding.host_port.clone()),
                });
                continue;
            };
            let chosen = rewrite::find_free_port(host, &view, &mut rewrite::tcp_port_free)
                .ok_or_else(|| {
                    BackupError::RewriteFailed(format!("no free host port above {}", host))
                })?;
            if chosen != host {
                remappings.push(format!("{}: {} -> {}", container_port, host, chosen));
            }
            view.published.insert(chosen);
            rebound.push(PortBinding {
                host_ip: Some(binding.host_ip.clone()),
                host_port: Some(chosen.to_string()),
            });
        }
        port_bindings.insert(container_port.clone(), Some(rebound));
    }

    // Bind-mount rebinding: existing host paths are retargeted so the
    // clone never writes into the original's data.
    let mut binds = Vec::new();
    for bind in &meta.host_config.binds {
        binds.push(rebind_host_path(bind, epoch, &mut warnings));
    }

    progress.set_message("creating container").await;
    let config = Config::<String> {
        image: Some(meta.image.clone()),
        env: Some(meta.env.clone()),
        cmd: if meta.cmd.is_empty() {
            None
        } else {
            Some(meta.cmd.clone())
        },
        exposed_ports: Some(
            meta.ports
                .keys()
                .map(|port| (port.clone(), HashMap::new()))
                .collect(),
        ),
        host_config: Some(HostConfig {
            binds: if binds.is_empty() { None } else { Some(binds) },
            port_bindings: Some(port_bindings),
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
                maximum_retry_count: None,
            }),
            ..Default::default()
        }),
        networking_config: Some(bollard::container::NetworkingConfig {
            endpoints_config: endpoints,
        }),
        ..Default::default()
    };

    let id = engine::create_container(docker, &new_name, config).await?;
    engine::start_container(docker, &id).await?;
    progress.set_message("injecting volumes").await;

    // Stream every captured path back into the new container.
    let tar_entries: Vec<String> = zip
        .file_names()
        .filter(|n| !n.contains('/') && n.ends_with(".tar"))
        .map(|n| n.to_string())
        .collect();
    for entry in tar_entries {
        let result = async {
            let bytes = archive::read_entry_bytes(&mut zip, &entry)?;
            let decoded = archive::decode_tar_entry(&entry);
            let parent = Path::new(&decoded)
                .parent()
                .map(|p| p.display().to_string())
                .filter(|p| !p.is_empty())
                .unwrap_or_else(|| "/".to_string());
            engine::upload_archive(docker, &id, &parent, bytes).await
        }
        .await;

        if let Err(e) = result {
            // Leave the container stopped for diagnosis.
            warn!("volume injection into {} failed: {}", new_name, e);
            let _ = engine::stop_container(docker, &id).await;
            return Err(e);
        }
    }

    info!("restored {} as {}", meta.name, new_name);
    Ok(CloneOutcome {
        container: new_name,
        remappings,
        warnings,
    })
}

/// Retarget `hostPath:containerPath[:opts]` when the host path already
/// exists, pre-creating the new parent. Named volumes pass through.
fn rebind_host_path(bind: &str, epoch: i64, warnings: &mut Vec<String>) -> String {
    let mut parts: Vec<String> = bind.split(':').map(|p| p.to_string()).collect();
    if parts.len() < 2 || !parts[0].starts_with('/') {
        return bind.to_string();
    }

    if Path::new(&parts[0]).exists() {
        let retargeted = format!("{}_restored_{}", parts[0], epoch);
        if let Some(parent) = Path::new(&retargeted).parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warnings.push(format!("could not pre-create {}: {}", parent.display(), e));
            }
        }
        warnings.push(format!("bind {} -> {}", parts[0], retargeted));
        parts[0] = retargeted;
    }
    parts.join(":")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_database_rank_orders_databases_first() {
        let mut names = vec![
            "web_1700000001.zip".to_string(),
            "postgres_1700000002.zip".to_string(),
            "cache-redis_1700000003.zip".to_string(),
        ];
        names.sort_by_key(|n| database_rank(n));
        assert_eq!(names[0], "postgres_1700000002.zip");
        assert_eq!(names[1], "cache-redis_1700000003.zip");
        assert_eq!(names[2], "web_1700000001.zip");
    }

    #[test]
    fn test_rebind_skips_named_volumes_and_fresh_paths() {
        let mut warnings = Vec::new();
        assert_eq!(
            rebind_host_path("dbdata:/var/lib/postgresql/data", 1, &mut warnings),
            "dbdata:/var/lib/postgresql/data"
        );
        assert_eq!(
            rebind_host_path("/definitely/not/there:/data", 1, &mut warnings),
            "/definitely/not/there:/data"
        );
        assert!(warnings.is_empty());
    }

    #[test]
    fn test_rebind_retargets_existing_host_path() {
        let dir = TempDir::new().unwrap();
        let host = dir.path().join("www");
        std::fs::create_dir(&host).unwrap();

        let mut warnings = Vec::new();
        let bind = format!("{}:/usr/share/nginx/html:ro", host.display());
        let rebound = rebind_host_path(&bind, 42, &mut warnings);
        assert_eq!(
            rebound,
            format!("{}_restored_42:/usr/share/nginx/html:ro", host.display())
        );
        assert_eq!(warnings.len(), 1);
    }
}
