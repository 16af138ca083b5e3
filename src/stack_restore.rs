//! Stack restore: bring a unified stack archive back into place.
//!
//! The pipeline is phased; each phase is a barrier and must finish for
//! every service before the next begins:
//!
//!   0. plan        - read metadata/manifest/env, clear the old stack
//!   1. rewrite     - conflict-rewrite the manifest, ensure networks
//!   2. deploy      - compose up --no-start, containers exist but stopped
//!   3. inject      - put-archive volume tars into the stopped containers
//!   4. db boot     - start the database cohort, probe readiness
//!   5. replay      - pipe dumps into the maintenance database clients
//!   6. resync      - re-assert env-declared Postgres credentials
//!   7. app boot    - compose up -d
//!
//! Only rewrite/deploy/manifest errors are fatal; everything else is
//! recorded as a warning and the pipeline keeps going, because a partly
//! restored stack that boots is worth more than a clean abort.

use crate::archive::{
    self, StackMetadata, DUMP_ENTRY, ENV_ENTRY, MANIFEST_ENTRY, STACK_META_ENTRY,
};
use crate::backup::shell_single_quote;
use crate::compose::{self, ServiceSpec};
use crate::deploy::{self, DeployMode};
use crate::detect;
use crate::engine::{self, with_timeout};
use crate::error::BackupError;
use crate::jobs::JobProgress;
use crate::rewrite;
use bollard::Docker;
use futures_util::future::join_all;
use std::collections::HashMap;
use std::fs::File;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};
use zip::ZipArchive;

const READINESS_ATTEMPTS: u32 = 30;
const READINESS_INTERVAL: Duration = Duration::from_secs(1);
const REPLAY_TIMEOUT: Duration = Duration::from_secs(300);
const REPLAY_GRACE: Duration = Duration::from_secs(2);
/// Dumps below this size replay with a warning instead of failing.
const SUSPICIOUS_DUMP_BYTES: usize = 100;

#[derive(Debug)]
pub struct StackRestoreReport {
    pub stack_name: String,
    pub services: usize,
    pub remappings: Vec<String>,
    pub warnings: Vec<String>,
}

/// One member of the stack as the restore pipeline sees it.
struct ServicePlan {
    /// Subtree name inside the archive (original container name).
    tree: String,
    /// Compose service label used to find the recreated container.
    service: String,
    app_type: &'static str,
    /// Fully resolved environment (env file + service overrides).
    env: HashMap<String, String>,
    has_dump: bool,
}

pub async fn restore_stack(
    docker: &Docker,
    artifact: &Path,
    progress: &JobProgress,
) -> Result<StackRestoreReport, BackupError> {
    // -- Phase 0: plan. No engine mutation before the manifest is known
    // to be present.
    progress.set_message("reading stack archive").await;
    let file = File::open(artifact)?;
    let mut zip = ZipArchive::new(file)?;

    let metadata: StackMetadata = serde_json::from_str(
        &archive::read_entry_string(&mut zip, STACK_META_ENTRY)
            .map_err(|_| BackupError::Parse("stack archive is missing stack_metadata.json".to_string()))?,
    )?;
    let manifest = archive::read_entry_string(&mut zip, MANIFEST_ENTRY)
        .map_err(|_| BackupError::Parse("stack archive is missing docker-compose.yml".to_string()))?;
    let env_text = archive::read_entry_string(&mut zip, ENV_ENTRY).ok();
    let env_map = env_text
        .as_deref()
        .map(compose::parse_env_lines)
        .unwrap_or_default();

    let parsed = compose::parse_manifest(&manifest)?;
    let stack_name = metadata.stack_name.clone();
    let mut warnings = Vec::new();

    let plans: Vec<ServicePlan> = metadata
        .containers
        .iter()
        .map(|member| {
            let spec = parsed.services.get(&member.service);
            let app_type = plan_app_type(spec, &member.name);
            ServicePlan {
                tree: member.name.clone(),
                service: member.service.clone(),
                app_type,
                env: resolve_service_env(spec, &env_map),
                has_dump: zip
                    .by_name(&format!("services/{}/{}", member.name, DUMP_ENTRY))
                    .is_ok(),
            }
        })
        .collect();

    // Same-name stack: remove the container objects, volumes stay on the
    // host. Engine trouble here is not in the fatal set; the deploy in
    // phase 2 will surface anything that actually blocks the restore.
    let existing = match engine::list_containers_by_project(docker, &stack_name).await {
        Ok(containers) => containers,
        Err(e) if e.fatal_for_stack_restore() => return Err(e),
        Err(e) => {
            warn!("could not list existing stack containers: {}", e);
            warnings.push(format!("existing stack lookup: {}", e));
            Vec::new()
        }
    };
    if !existing.is_empty() {
        progress
            .set_message(format!("removing {} existing containers", existing.len()))
            .await;
        for container in existing {
            let Some(id) = container.id else { continue };
            if let Err(e) = engine::stop_container(docker, &id).await {
                warn!("stop of {} failed: {}", id, e);
            }
            if let Err(e) = engine::remove_container(docker, &id).await {
                if e.fatal_for_stack_restore() {
                    return Err(e);
                }
                warn!("removal of {} failed: {}", id, e);
                warnings.push(format!("{}: remove failed: {}", id, e));
            }
        }
    }

    // -- Phase 1: rewrite. Ensures external networks exist.
    progress.set_message("rewriting manifest").await;
    let rewrite = rewrite::rewrite_manifest(docker, &manifest).await?;
    for remap in &rewrite.remappings {
        info!("port remapped: {}", remap);
    }

    // -- Phase 2: infrastructure-only deploy.
    progress.set_message("creating containers (no start)").await;
    let files = deploy::write_project_files(&rewrite.manifest, env_text.as_deref()).await?;
    deploy::compose_up(&stack_name, &files, DeployMode::CreateOnly).await?;

    // -- Phase 3: offline volume injection into the stopped containers.
    progress.set_message("injecting volumes").await;
    let service_ids = match service_container_ids(docker, &stack_name).await {
        Ok(ids) => ids,
        Err(e) if e.fatal_for_stack_restore() => return Err(e),
        Err(e) => {
            warn!("could not map services to containers: {}", e);
            warnings.push(format!("service lookup: {}", e));
            HashMap::new()
        }
    };
    for plan in &plans {
        let Some(id) = service_ids.get(&plan.service) else {
            if !plan.service.is_empty() {
                warnings.push(format!("{}: no container after deploy", plan.service));
            }
            continue;
        };
        let prefix = format!("services/{}/volumes/", plan.tree);
        let entries: Vec<String> = zip
            .file_names()
            .filter(|n| n.starts_with(&prefix) && n.ends_with(".tar"))
            .map(|n| n.to_string())
            .collect();
        for entry in entries {
            if let Err(e) = inject_volume(docker, id, &mut zip, &entry).await {
                warn!("{}: {}", entry, e);
                warnings.push(format!("{}: {}", entry, e));
            }
        }
    }

    // -- Phase 4: database cohort boot and readiness gating.
    let databases: Vec<&ServicePlan> = plans
        .iter()
        .filter(|p| detect::is_database(p.app_type))
        .collect();
    progress
        .set_message(format!("starting {} database(s)", databases.len()))
        .await;
    for plan in &databases {
        if let Some(id) = service_ids.get(&plan.service) {
            if let Err(e) = engine::start_container(docker, id).await {
                warnings.push(format!("{}: start failed: {}", plan.service, e));
            }
        }
    }

    let probes = databases.iter().filter_map(|plan| {
        let id = service_ids.get(&plan.service)?.clone();
        Some(async move {
            let ready = wait_for_readiness(docker, &id, plan).await;
            (plan.service.clone(), ready)
        })
    });
    for (service, ready) in join_all(probes).await {
        if !ready {
            let timeout = BackupError::ReadinessTimeout(format!(
                "{} after {}s",
                service, READINESS_ATTEMPTS
            ));
            warn!("database not ready, continuing anyway: {}", timeout);
            warnings.push(timeout.to_string());
        }
    }

    // -- Phase 5: SQL replay against the maintenance database.
    for plan in &databases {
        if !plan.has_dump {
            continue;
        }
        let Some(id) = service_ids.get(&plan.service) else { continue };
        progress
            .set_message(format!("replaying dump into {}", plan.service))
            .await;
        if let Err(e) = replay_dump(docker, id, &mut zip, plan).await {
            warn!("replay into {} failed: {}", plan.service, e);
            warnings.push(format!("{}: {}", plan.service, e));
        }
    }

    // -- Phase 6: Postgres credential resynchronization. The restored
    // dump may have renamed or re-passworded the role; the env-declared
    // password stays authoritative.
    for plan in &databases {
        if plan.app_type != "postgres" {
            continue;
        }
        let Some(id) = service_ids.get(&plan.service) else { continue };
        if let Err(e) = resync_postgres_credentials(docker, id, &plan.env).await {
            warn!("credential resync for {} failed: {}", plan.service, e);
            warnings.push(format!("{}: credential resync: {}", plan.service, e));
        }
    }

    // -- Phase 7: application boot; scratch files removed on drop.
    progress.set_message("starting applications").await;
    deploy::compose_up(&stack_name, &files, DeployMode::Up).await?;
    drop(files);

    info!(
        "stack {} restored ({} services, {} warnings)",
        stack_name,
        plans.len(),
        warnings.len()
    );
    Ok(StackRestoreReport {
        stack_name,
        services: plans.len(),
        remappings: rewrite.remappings,
        warnings,
    })
}

fn plan_app_type(spec: Option<&ServiceSpec>, tree_name: &str) -> &'static str {
    let empty = HashMap::new();
    match spec {
        Some(spec) if !spec.image.is_empty() => detect::detect_app_type(&spec.image, &empty),
        // No manifest entry for this member: fall back to its name.
        _ => detect::detect_app_type(tree_name, &empty),
    }
}

/// Environment visible to a service: the archive's env file overlaid by
/// the service's own declarations, placeholders resolved.
fn resolve_service_env(
    spec: Option<&ServiceSpec>,
    env_map: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut resolved = env_map.clone();
    if let Some(spec) = spec {
        for (key, value) in &spec.env {
            resolved.insert(key.clone(), compose::resolve_placeholders(value, env_map));
        }
    }
    resolved
}

async fn service_container_ids(
    docker: &Docker,
    project: &str,
) -> Result<HashMap<String, String>, BackupError> {
    let containers = engine::list_containers_by_project(docker, project).await?;
    let mut ids = HashMap::new();
    for container in containers {
        let Some(id) = container.id else { continue };
        if let Some(service) = container
            .labels
            .as_ref()
            .and_then(|l| l.get(detect::COMPOSE_SERVICE_LABEL))
        {
            ids.insert(service.clone(), id);
        }
    }
    Ok(ids)
}

async fn inject_volume<R: std::io::Read + std::io::Seek>(
    docker: &Docker,
    id: &str,
    zip: &mut ZipArchive<R>,
    entry: &str,
) -> Result<(), BackupError> {
    let bytes = archive::read_entry_bytes(zip, entry)?;
    let file_name = entry.rsplit('/').next().unwrap_or(entry);
    let decoded = archive::decode_tar_entry(file_name);
    let parent = Path::new(&decoded)
        .parent()
        .map(|p| p.display().to_string())
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| "/".to_string());
    engine::upload_archive(docker, id, &parent, bytes).await
}

/// Probe command per database flavor; None means no probe exists and the
/// service is taken as ready.
fn readiness_cmd(plan: &ServicePlan) -> Option<Vec<String>> {
    let inner = match plan.app_type {
        "postgres" => {
            let user = plan
                .env
                .get("POSTGRES_USER")
                .cloned()
                .unwrap_or_else(|| "postgres".to_string());
            format!("pg_isready -U {}", user)
        }
        "mysql" => "mysqladmin ping".to_string(),
        "redis" => "redis-cli ping".to_string(),
        _ => return None,
    };
    Some(vec!["sh".to_string(), "-c".to_string(), inner])
}

async fn wait_for_readiness(docker: &Docker, id: &str, plan: &ServicePlan) -> bool {
    let Some(cmd) = readiness_cmd(plan) else {
        return true;
    };

    for _ in 0..READINESS_ATTEMPTS {
        if let Ok(output) = engine::exec_collect(docker, id, cmd.clone()).await {
            let combined = format!("{}{}", output.stdout_lossy(), output.stderr).to_lowercase();
            if ["accepting", "alive", "pong"]
                .iter()
                .any(|needle| combined.contains(needle))
            {
                return true;
            }
        }
        tokio::time::sleep(READINESS_INTERVAL).await;
    }
    false
}

/// Client invocation bound to the maintenance database, credentials
/// explicit.
fn replay_cmd(plan: &ServicePlan) -> Vec<String> {
    let inner = match plan.app_type {
        "postgres" => {
            let user = plan
                .env
                .get("POSTGRES_USER")
                .cloned()
                .unwrap_or_else(|| "postgres".to_string());
            let password = plan
                .env
                .get("POSTGRES_PASSWORD")
                .or_else(|| plan.env.get("POSTGRES_PASS"))
                .cloned()
                .unwrap_or_default();
            format!(
                "PGPASSWORD={} psql -U {} -d postgres",
                shell_single_quote(&password),
                user
            )
        }
        _ => match plan.env.get("MYSQL_ROOT_PASSWORD") {
            Some(password) => format!("mysql -u root -p{}", shell_single_quote(password)),
            None => "mysql -u root".to_string(),
        },
    };
    vec!["sh".to_string(), "-c".to_string(), inner]
}

async fn replay_dump<R: std::io::Read + std::io::Seek>(
    docker: &Docker,
    id: &str,
    zip: &mut ZipArchive<R>,
    plan: &ServicePlan,
) -> Result<(), BackupError> {
    let dump = archive::read_entry_bytes(zip, &format!("services/{}/{}", plan.tree, DUMP_ENTRY))?;
    if dump.len() < SUSPICIOUS_DUMP_BYTES {
        warn!(
            "{}: dump is only {} bytes, replaying anyway",
            plan.service,
            dump.len()
        );
    }

    let output = with_timeout(
        REPLAY_TIMEOUT,
        "sql replay",
        engine::exec_with_stdin(docker, id, replay_cmd(plan), dump, REPLAY_GRACE),
    )
    .await?;

    if output.exit_code.unwrap_or(0) != 0 {
        return Err(BackupError::ReplayFailed(format!(
            "client exited with {:?}: {}",
            output.exit_code,
            output.stderr.trim()
        )));
    }
    Ok(())
}

/// Double-quote a SQL identifier, escaping embedded quotes.
pub fn sql_quote_ident(s: &str) -> String {
    format!("\"{}\"", s.replace('"', "\"\""))
}

/// Single-quote a SQL literal, escaping embedded quotes.
pub fn sql_quote_literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

/// Idempotent role repair: create the role when the dump dropped it,
/// then force the env-declared password and superuser back on.
fn credential_resync_sql(user: &str, password: &str) -> String {
    let ident = sql_quote_ident(user);
    let user_literal = sql_quote_literal(user);
    let password_literal = sql_quote_literal(password);
    format!(
        "DO $$ BEGIN\n  IF NOT EXISTS (SELECT FROM pg_catalog.pg_roles WHERE rolname={user_literal}) THEN\n    CREATE ROLE {ident} WITH LOGIN PASSWORD {password_literal};\n  END IF;\nEND $$;\nALTER ROLE {ident} WITH PASSWORD {password_literal};\nALTER ROLE {ident} SUPERUSER;\n"
    )
}

async fn resync_postgres_credentials(
    docker: &Docker,
    id: &str,
    env: &HashMap<String, String>,
) -> Result<(), BackupError> {
    let user = env
        .get("POSTGRES_USER")
        .cloned()
        .unwrap_or_else(|| "postgres".to_string());
    let password = env
        .get("POSTGRES_PASSWORD")
        .or_else(|| env.get("POSTGRES_PASS"))
        .cloned()
        .unwrap_or_default();

    let sql = credential_resync_sql(&user, &password);
    let cmd = vec![
        "sh".to_string(),
        "-c".to_string(),
        format!(
            "PGPASSWORD={} psql -U {} -d postgres",
            shell_single_quote(&password),
            user
        ),
    ];

    let output = engine::exec_with_stdin(docker, id, cmd, sql.into_bytes(), REPLAY_GRACE).await?;
    if output.exit_code.unwrap_or(0) != 0 {
        return Err(BackupError::ReplayFailed(format!(
            "psql exited with {:?}: {}",
            output.exit_code,
            output.stderr.trim()
        )));
    }
    info!("credentials for role {} re-synchronized", user);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sql_quoting() {
        assert_eq!(sql_quote_ident("app"), "\"app\"");
        assert_eq!(sql_quote_ident("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(sql_quote_literal("s3cret"), "'s3cret'");
        assert_eq!(sql_quote_literal("it's"), "'it''s'");
    }

    #[test]
    fn test_credential_resync_sql_shape() {
        let sql = credential_resync_sql("app", "it's");
        assert!(sql.contains("rolname='app'"));
        assert!(sql.contains("CREATE ROLE \"app\" WITH LOGIN PASSWORD 'it''s';"));
        assert!(sql.contains("ALTER ROLE \"app\" WITH PASSWORD 'it''s';"));
        assert!(sql.contains("ALTER ROLE \"app\" SUPERUSER;"));
    }

    fn plan(app_type: &'static str, env: &[(&str, &str)]) -> ServicePlan {
        ServicePlan {
            tree: "db".to_string(),
            service: "db".to_string(),
            app_type,
            env: env
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            has_dump: true,
        }
    }

    #[test]
    fn test_readiness_commands() {
        let postgres = plan("postgres", &[("POSTGRES_USER", "app")]);
        assert_eq!(readiness_cmd(&postgres).unwrap()[2], "pg_isready -U app");

        let mysql = plan("mysql", &[]);
        assert_eq!(readiness_cmd(&mysql).unwrap()[2], "mysqladmin ping");

        let redis = plan("redis", &[]);
        assert_eq!(readiness_cmd(&redis).unwrap()[2], "redis-cli ping");

        let mongo = plan("mongo", &[]);
        assert!(readiness_cmd(&mongo).is_none());
    }

    #[test]
    fn test_replay_cmd_binds_maintenance_database() {
        let postgres = plan(
            "postgres",
            &[("POSTGRES_USER", "app"), ("POSTGRES_PASSWORD", "pw")],
        );
        assert_eq!(replay_cmd(&postgres)[2], "PGPASSWORD='pw' psql -U app -d postgres");

        let mysql = plan("mysql", &[("MYSQL_ROOT_PASSWORD", "pw")]);
        assert_eq!(replay_cmd(&mysql)[2], "mysql -u root -p'pw'");

        let mysql_bare = plan("mysql", &[]);
        assert_eq!(replay_cmd(&mysql_bare)[2], "mysql -u root");
    }

    #[test]
    fn test_resolve_service_env_precedence() {
        let mut env_file = HashMap::new();
        env_file.insert("DB_PASSWORD".to_string(), "filepw".to_string());
        env_file.insert("SHARED".to_string(), "from-file".to_string());

        let spec = ServiceSpec {
            image: "postgres:16".to_string(),
            volumes: Vec::new(),
            env: [
                ("POSTGRES_PASSWORD".to_string(), "${DB_PASSWORD}".to_string()),
                ("POSTGRES_USER".to_string(), "${DB_USER:-app}".to_string()),
            ]
            .into_iter()
            .collect(),
        };

        let resolved = resolve_service_env(Some(&spec), &env_file);
        assert_eq!(resolved["POSTGRES_PASSWORD"], "filepw");
        assert_eq!(resolved["POSTGRES_USER"], "app");
        assert_eq!(resolved["SHARED"], "from-file");
    }

    #[tokio::test]
    async fn test_missing_manifest_fails_before_any_engine_mutation() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("broken_stack.zip");
        let mut writer = archive::ArtifactWriter::create(path.clone()).unwrap();
        writer
            .append_json(
                STACK_META_ENTRY,
                &StackMetadata {
                    stack_name: "shop".to_string(),
                    timestamp: "2026-01-01T00:00:00Z".to_string(),
                    containers: Vec::new(),
                },
            )
            .unwrap();
        writer.finalize().unwrap();

        // The client is lazy; nothing is contacted before the archive
        // check rejects the restore.
        let docker = engine::connect().unwrap();
        let (queue, _rx) = crate::jobs::JobQueue::new();
        let progress = queue.progress("none");

        let err = restore_stack(&docker, &path, &progress).await.unwrap_err();
        assert!(matches!(err, BackupError::Parse(_)));
    }

    #[test]
    fn test_plan_app_type_falls_back_to_tree_name() {
        assert_eq!(plan_app_type(None, "shop-postgres-1"), "postgres");
        let spec = ServiceSpec {
            image: "mariadb:11".to_string(),
            volumes: Vec::new(),
            env: HashMap::new(),
        };
        assert_eq!(plan_app_type(Some(&spec), "whatever"), "mysql");
    }
}
