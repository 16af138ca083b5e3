//! Per-container and stack backup.
//!
//! ## Branch selection
//! Postgres/TimescaleDB and MySQL/MariaDB containers get a logical dump
//! (`pg_dumpall` / `mysqldump` executed inside the container); their
//! volumes are intentionally not tarred, the dump is the source of truth.
//! Everything else gets its declared paths captured as engine tar streams.
//!
//! ## Artifact ordering
//! The metadata entry (`config.json` or `stack_metadata.json`) is always
//! the first append. A dump is captured to a scratch file before the
//! archive is even opened, so a failed dump leaves no partial artifact.
//!
//! ## Failure policy
//! Per-path capture failures become `ERROR_<escaped>.txt` entries and the
//! artifact still finalizes. Per-service failures during a stack backup
//! are recorded and the remaining services continue; the job fails at the
//! end if any service failed.

use crate::archive::{
    self, ArtifactWriter, ContainerMeta, HostConfigMeta, NetworkSettingsMeta, PortBindingMeta,
    StackMember, StackMetadata, CONTAINER_META_ENTRY, DUMP_ENTRY, ENV_ENTRY, MANIFEST_ENTRY,
    STACK_META_ENTRY,
};
use crate::detect::{self, DumpKind, COMPOSE_PROJECT_LABEL, COMPOSE_SERVICE_LABEL};
use crate::engine::{self, with_timeout};
use crate::error::BackupError;
use crate::jobs::JobProgress;
use crate::store::Store;
use bollard::models::ContainerInspectResponse;
use bollard::Docker;
use chrono::Utc;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

pub const CONTAINER_STAGE_TIMEOUT: Duration = Duration::from_secs(300);
pub const STACK_JOB_TIMEOUT: Duration = Duration::from_secs(600);

/// Outcome of a stack backup: the artifact always finalizes, but the job
/// fails when any service could not be captured.
#[derive(Debug)]
pub struct StackBackupOutcome {
    pub artifact: PathBuf,
    pub services: usize,
    pub failures: Vec<String>,
    pub warnings: Vec<String>,
}

/// Single-quote a string for `sh -c`, escaping embedded quotes as `'\''`.
pub fn shell_single_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

fn env_value(env: &[String], key: &str) -> Option<String> {
    let prefix = format!("{}=", key);
    env.iter()
        .find_map(|kv| kv.strip_prefix(prefix.as_str()).map(|v| v.to_string()))
}

/// `pg_dumpall` invocation; the password is passed through PGPASSWORD and
/// omitted entirely when the environment declares none.
pub fn postgres_dump_cmd(env: &[String]) -> Vec<String> {
    let user = env_value(env, "POSTGRES_USER").unwrap_or_else(|| "postgres".to_string());
    let password =
        env_value(env, "POSTGRES_PASSWORD").or_else(|| env_value(env, "POSTGRES_PASS"));

    let mut inner = String::new();
    if let Some(password) = password {
        inner.push_str(&format!("PGPASSWORD={} ", shell_single_quote(&password)));
    }
    inner.push_str(&format!("pg_dumpall -U {} -w --clean --if-exists", user));

    vec!["sh".to_string(), "-c".to_string(), inner]
}

pub fn mysql_dump_cmd(env: &[String]) -> Vec<String> {
    let inner = match env_value(env, "MYSQL_ROOT_PASSWORD") {
        Some(password) => format!(
            "mysqldump -u root -p{} --all-databases",
            shell_single_quote(&password)
        ),
        None => "mysqldump -u root --skip-lock-tables --all-databases".to_string(),
    };
    vec!["sh".to_string(), "-c".to_string(), inner]
}

/// Artifact file stem: the engine's display name made filesystem-safe.
pub fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .trim_start_matches('/')
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "container".to_string()
    } else {
        cleaned
    }
}

fn inspect_name(inspect: &ContainerInspectResponse) -> String {
    inspect
        .name
        .as_deref()
        .unwrap_or("unknown")
        .trim_start_matches('/')
        .to_string()
}

fn inspect_labels(inspect: &ContainerInspectResponse) -> HashMap<String, String> {
    inspect
        .config
        .as_ref()
        .and_then(|c| c.labels.clone())
        .unwrap_or_default()
}

fn inspect_env(inspect: &ContainerInspectResponse) -> Vec<String> {
    inspect
        .config
        .as_ref()
        .and_then(|c| c.env.clone())
        .unwrap_or_default()
}

/// Build the `config.json` record, the sole source of truth for restore.
fn build_meta(
    inspect: &ContainerInspectResponse,
    app_type: &str,
    backup_paths: Vec<String>,
) -> ContainerMeta {
    let labels = inspect_labels(inspect);
    let config = inspect.config.as_ref();

    let ports = config
        .and_then(|c| c.exposed_ports.clone())
        .map(|ports| {
            ports
                .into_keys()
                .map(|port| (port, serde_json::json!({})))
                .collect()
        })
        .unwrap_or_default();

    let host_config = inspect.host_config.as_ref();
    let port_bindings = host_config
        .and_then(|hc| hc.port_bindings.clone())
        .map(|map| {
            map.into_iter()
                .map(|(port, bindings)| {
                    let bindings = bindings
                        .unwrap_or_default()
                        .into_iter()
                        .map(|b| PortBindingMeta {
                            host_ip: b.host_ip.unwrap_or_default(),
                            host_port: b.host_port.unwrap_or_default(),
                        })
                        .collect();
                    (port, bindings)
                })
                .collect()
        })
        .unwrap_or_default();

    let networks = inspect
        .network_settings
        .as_ref()
        .and_then(|ns| ns.networks.clone())
        .map(|networks| {
            networks
                .into_iter()
                .map(|(name, endpoint)| {
                    (name, serde_json::to_value(endpoint).unwrap_or_default())
                })
                .collect()
        })
        .unwrap_or_default();

    ContainerMeta {
        name: inspect_name(inspect),
        image: config
            .and_then(|c| c.image.clone())
            .unwrap_or_default(),
        env: inspect_env(inspect),
        ports,
        host_config: HostConfigMeta {
            port_bindings,
            binds: host_config
                .and_then(|hc| hc.binds.clone())
                .unwrap_or_default(),
        },
        cmd: config.and_then(|c| c.cmd.clone()).unwrap_or_default(),
        network_settings: NetworkSettingsMeta { networks },
        app_type: app_type.to_string(),
        backup_paths,
        compose_project: labels.get(COMPOSE_PROJECT_LABEL).cloned(),
        compose_service: labels.get(COMPOSE_SERVICE_LABEL).cloned(),
        timestamp: Utc::now().to_rfc3339(),
    }
}

/// Resolve the path set to capture for a volume-strategy container:
/// stack-declared destinations plus custom paths, deduplicated in order.
/// The legacy single-container path may fall back to the app hint table
/// and finally the working dir.
fn resolve_backup_paths(
    declared: Vec<String>,
    custom: &[String],
    app_type: &str,
    working_dir: Option<&str>,
    allow_fallback: bool,
) -> Vec<String> {
    let mut paths: Vec<String> = Vec::new();
    for path in declared.into_iter().chain(custom.iter().cloned()) {
        if !path.is_empty() && !paths.contains(&path) {
            paths.push(path);
        }
    }

    if paths.is_empty() && allow_fallback {
        if let Some(hint) = detect::volume_hint(app_type) {
            paths.push(hint.to_string());
        } else {
            let dir = working_dir.filter(|d| !d.is_empty()).unwrap_or("/app");
            paths.push(dir.to_string());
        }
    }
    paths
}

struct TreeLayout<'a> {
    /// `""` for a single-container artifact, `services/<name>/` inside a
    /// unified stack archive.
    prefix: &'a str,
    /// Extra directory for volume tars (`volumes/` in the unified layout).
    volume_dir: &'a str,
    /// Whether the hint-table fallback applies (legacy single path only).
    allow_fallback: bool,
}

/// Capture one container into the archive: config.json first, then the
/// dump or the volume tars. Returns capture warnings.
async fn append_container_tree(
    docker: &Docker,
    store: &Store,
    writer: &mut ArtifactWriter,
    inspect: &ContainerInspectResponse,
    custom_paths: &[String],
    layout: TreeLayout<'_>,
) -> Result<Vec<String>, BackupError> {
    let id = inspect.id.as_deref().unwrap_or_default().to_string();
    let name = inspect_name(inspect);
    let labels = inspect_labels(inspect);
    let env = inspect_env(inspect);
    let image = inspect
        .config
        .as_ref()
        .and_then(|c| c.image.as_deref())
        .unwrap_or_default();
    let app_type = detect::detect_app_type(image, &labels);

    let mut warnings = Vec::new();

    if let Some(kind) = detect::dump_kind(app_type) {
        // Dump branch: capture before touching the archive so a failed
        // dump leaves no partial artifact.
        let mut dump = capture_dump(docker, &id, kind, &env).await?;

        let meta = build_meta(inspect, app_type, Vec::new());
        writer.append_json(&format!("{}{}", layout.prefix, CONTAINER_META_ENTRY), &meta)?;
        let written =
            writer.append_file(&format!("{}{}", layout.prefix, DUMP_ENTRY), dump.as_file_mut())?;
        info!("captured {} dump of {} ({} bytes)", app_type, name, written);
        return Ok(warnings);
    }

    // Volume branch.
    let declared = match (
        labels.get(COMPOSE_PROJECT_LABEL),
        labels.get(COMPOSE_SERVICE_LABEL),
    ) {
        (Some(project), Some(service)) => store.declared_volumes(project, service).await,
        _ => Vec::new(),
    };
    let working_dir = inspect
        .config
        .as_ref()
        .and_then(|c| c.working_dir.as_deref());
    let paths = resolve_backup_paths(
        declared,
        custom_paths,
        app_type,
        working_dir,
        layout.allow_fallback,
    );

    let meta = build_meta(inspect, app_type, paths.clone());
    writer.append_json(&format!("{}{}", layout.prefix, CONTAINER_META_ENTRY), &meta)?;

    if paths.is_empty() {
        warn!("{}: no volumes defined, capturing metadata only", name);
        warnings.push(format!("{}: no volumes defined", name));
        return Ok(warnings);
    }

    with_timeout(CONTAINER_STAGE_TIMEOUT, "volume capture", async {
        for path in &paths {
            let entry = format!(
                "{}{}{}",
                layout.prefix,
                layout.volume_dir,
                archive::tar_entry_name(path)
            );
            let stream = engine::download_path(docker, &id, path);
            match writer.append_stream(&entry, stream).await {
                Ok(bytes) => info!("captured {}:{} ({} bytes)", name, path, bytes),
                Err(e) => {
                    warn!("failed to capture {}:{}: {}", name, path, e);
                    let marker = format!("{}{}", layout.prefix, archive::error_entry_name(path));
                    writer.append_bytes(&marker, e.to_string().as_bytes())?;
                    warnings.push(format!("{}:{}: {}", name, path, e));
                }
            }
        }
        Ok(())
    })
    .await?;

    Ok(warnings)
}

/// Run the dump client inside the container, capturing stdout to a
/// scratch file. A zero-byte dump fails with the captured stderr.
async fn capture_dump(
    docker: &Docker,
    id: &str,
    kind: DumpKind,
    env: &[String],
) -> Result<tempfile::NamedTempFile, BackupError> {
    let cmd = match kind {
        DumpKind::Postgres => postgres_dump_cmd(env),
        DumpKind::Mysql => mysql_dump_cmd(env),
    };

    let mut scratch = tempfile::NamedTempFile::new()?;
    let (written, stderr, exit_code) = with_timeout(
        CONTAINER_STAGE_TIMEOUT,
        "database dump",
        engine::exec_to_file(docker, id, cmd, scratch.as_file_mut()),
    )
    .await?;

    if written == 0 {
        let detail = if stderr.trim().is_empty() {
            "dump produced no output".to_string()
        } else {
            stderr.trim().to_string()
        };
        return Err(BackupError::CaptureEmpty(detail));
    }
    if exit_code.unwrap_or(0) != 0 {
        warn!(
            "dump client exited with {:?} but produced {} bytes: {}",
            exit_code,
            written,
            stderr.trim()
        );
    }
    Ok(scratch)
}

/// Back up one container into `<name>_<epoch>.zip`.
pub async fn backup_container(
    docker: &Docker,
    store: &Store,
    backup_dir: &Path,
    container_id: &str,
    custom_paths: &[String],
    progress: &JobProgress,
) -> Result<PathBuf, BackupError> {
    let inspect = engine::inspect_container(docker, container_id).await?;
    let name = inspect_name(&inspect);
    progress
        .set_message(format!("backing up container {}", name))
        .await;

    let epoch = Utc::now().timestamp();
    let path = backup_dir.join(format!("{}_{}.zip", sanitize_name(&name), epoch));
    let mut writer = ArtifactWriter::create(path)?;

    let warnings = append_container_tree(
        docker,
        store,
        &mut writer,
        &inspect,
        custom_paths,
        TreeLayout {
            prefix: "",
            volume_dir: "",
            allow_fallback: true,
        },
    )
    .await?;

    let artifact = with_timeout(CONTAINER_STAGE_TIMEOUT, "archive finalize", async {
        writer.finalize()
    })
    .await?;

    if !warnings.is_empty() {
        progress
            .set_message(format!("finished with {} warning(s)", warnings.len()))
            .await;
    }
    info!("container {} backed up to {}", name, artifact.display());
    Ok(artifact)
}

/// Back up every member of a stack into one unified archive.
pub async fn backup_stack(
    docker: &Docker,
    store: &Store,
    backup_dir: &Path,
    stack_name: &str,
    progress: &JobProgress,
) -> Result<StackBackupOutcome, BackupError> {
    let mut containers = engine::list_containers_by_project(docker, stack_name).await?;

    // Fallback: match service labels against the imported definition.
    if containers.is_empty() {
        if let Some(def) = store.stack(stack_name).await {
            containers = engine::list_all_containers(docker)
                .await?
                .into_iter()
                .filter(|c| {
                    c.labels
                        .as_ref()
                        .and_then(|l| l.get(COMPOSE_SERVICE_LABEL))
                        .map(|s| def.services.contains_key(s))
                        .unwrap_or(false)
                })
                .collect();
        }
    }
    if containers.is_empty() {
        return Err(BackupError::StackEmpty(stack_name.to_string()));
    }

    let members: Vec<StackMember> = containers
        .iter()
        .map(|c| StackMember {
            id: c.id.clone().unwrap_or_default(),
            name: engine::display_name(c.names.as_ref(), "unknown"),
            service: c
                .labels
                .as_ref()
                .and_then(|l| l.get(COMPOSE_SERVICE_LABEL))
                .cloned()
                .unwrap_or_default(),
        })
        .collect();

    let epoch = Utc::now().timestamp();
    let path = backup_dir.join(format!("{}_stack_{}.zip", sanitize_name(stack_name), epoch));
    let mut writer = ArtifactWriter::create(path)?;

    let definition = store.stack(stack_name).await;
    let total = containers.len();
    let mut failures = Vec::new();
    let mut warnings = Vec::new();

    with_timeout(STACK_JOB_TIMEOUT, "stack backup", async {
        let metadata = StackMetadata {
            stack_name: stack_name.to_string(),
            timestamp: Utc::now().to_rfc3339(),
            containers: members.clone(),
        };
        writer.append_json(STACK_META_ENTRY, &metadata)?;

        if let Some(def) = &definition {
            writer.append_bytes(MANIFEST_ENTRY, def.compose_yaml.as_bytes())?;
            if let Some(env) = stack_env_content(def).await {
                writer.append_bytes(ENV_ENTRY, env.as_bytes())?;
            }
        }

        for (i, member) in members.iter().enumerate() {
            progress
                .set_message(format!("[{}/{}] {}", i + 1, total, member.name))
                .await;

            let result = async {
                let inspect = engine::inspect_container(docker, &member.id).await?;
                let prefix = format!("services/{}/", member.name);
                append_container_tree(
                    docker,
                    store,
                    &mut writer,
                    &inspect,
                    &[],
                    TreeLayout {
                        prefix: &prefix,
                        volume_dir: "volumes/",
                        allow_fallback: false,
                    },
                )
                .await
            }
            .await;

            match result {
                Ok(tree_warnings) => warnings.extend(tree_warnings),
                Err(e) => {
                    warn!("service {} failed: {}", member.name, e);
                    let marker = format!("services/{}/ERROR.txt", member.name);
                    writer.append_bytes(&marker, e.to_string().as_bytes())?;
                    failures.push(format!("{}: {}", member.name, e));
                }
            }
        }
        Ok(())
    })
    .await?;

    let artifact = writer.finalize()?;
    info!(
        "stack {} backed up to {} ({} services, {} failures)",
        stack_name,
        artifact.display(),
        total,
        failures.len()
    );

    Ok(StackBackupOutcome {
        artifact,
        services: total,
        failures,
        warnings,
    })
}

/// `.env` content for a unified archive: generated from envVars when
/// present, otherwise the envFile contents, otherwise omitted.
async fn stack_env_content(def: &crate::store::StackDefinition) -> Option<String> {
    if !def.env_vars.is_empty() {
        let mut pairs: Vec<(&String, &String)> = def.env_vars.iter().collect();
        pairs.sort();
        let lines: Vec<String> = pairs
            .into_iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        return Some(lines.join("\n") + "\n");
    }
    if let Some(env_file) = &def.env_file {
        if let Ok(content) = tokio::fs::read_to_string(env_file).await {
            return Some(content);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_single_quote() {
        assert_eq!(shell_single_quote("plain"), "'plain'");
        assert_eq!(shell_single_quote("pa'ss"), r"'pa'\''ss'");
    }

    #[test]
    fn test_postgres_dump_cmd_with_password() {
        let env = vec![
            "POSTGRES_USER=app".to_string(),
            "POSTGRES_PASSWORD=s3cret".to_string(),
        ];
        let cmd = postgres_dump_cmd(&env);
        assert_eq!(cmd[0], "sh");
        assert_eq!(cmd[1], "-c");
        assert_eq!(
            cmd[2],
            "PGPASSWORD='s3cret' pg_dumpall -U app -w --clean --if-exists"
        );
    }

    #[test]
    fn test_postgres_dump_cmd_defaults() {
        let cmd = postgres_dump_cmd(&[]);
        assert_eq!(cmd[2], "pg_dumpall -U postgres -w --clean --if-exists");

        // POSTGRES_PASS is honored as the fallback variable.
        let env = vec!["POSTGRES_PASS=alt".to_string()];
        let cmd = postgres_dump_cmd(&env);
        assert!(cmd[2].starts_with("PGPASSWORD='alt' "));
    }

    #[test]
    fn test_mysql_dump_cmd() {
        let env = vec!["MYSQL_ROOT_PASSWORD=root".to_string()];
        assert_eq!(
            mysql_dump_cmd(&env)[2],
            "mysqldump -u root -p'root' --all-databases"
        );
        assert_eq!(
            mysql_dump_cmd(&[])[2],
            "mysqldump -u root --skip-lock-tables --all-databases"
        );
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("/nginx-1"), "nginx-1");
        assert_eq!(sanitize_name("my app/v2"), "my-app-v2");
        assert_eq!(sanitize_name(""), "container");
    }

    #[test]
    fn test_resolve_backup_paths_union_dedup() {
        let declared = vec!["/data".to_string(), "/etc/app".to_string()];
        let custom = vec!["/data".to_string(), "/extra".to_string()];
        let paths = resolve_backup_paths(declared, &custom, "generic", None, false);
        assert_eq!(paths, vec!["/data", "/etc/app", "/extra"]);
    }

    #[test]
    fn test_resolve_backup_paths_unified_has_no_fallback() {
        let paths = resolve_backup_paths(Vec::new(), &[], "nginx", Some("/srv"), false);
        assert!(paths.is_empty());
    }

    #[test]
    fn test_resolve_backup_paths_legacy_fallback_chain() {
        // Hint table first.
        let paths = resolve_backup_paths(Vec::new(), &[], "nginx", Some("/srv"), true);
        assert_eq!(paths, vec!["/usr/share/nginx/html"]);
        // Then the working dir.
        let paths = resolve_backup_paths(Vec::new(), &[], "generic", Some("/srv"), true);
        assert_eq!(paths, vec!["/srv"]);
        // Finally /app.
        let paths = resolve_backup_paths(Vec::new(), &[], "generic", None, true);
        assert_eq!(paths, vec!["/app"]);
    }
}
