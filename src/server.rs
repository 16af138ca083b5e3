//! HTTP surface and process wiring.
//!
//! Builds the shared context (engine client, store, job queue, scheduler),
//! spawns the single worker, registers schedule triggers and serves the
//! thin JSON API. Every mutating endpoint is an enqueue or a store write;
//! the actual work happens in the worker.

use crate::config::Config;
use crate::detect;
use crate::engine;
use crate::jobs::{spawn_worker, JobKind, JobQueue, WorkerContext};
use crate::scheduler::Scheduler;
use crate::store::{Schedule, Store};
use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::Mutex;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

/// Shared server context bundling dependencies
#[derive(Clone)]
pub struct ServerContext {
    pub config: Arc<Config>,
    pub docker: bollard::Docker,
    pub store: Store,
    pub queue: JobQueue,
    pub scheduler: Arc<Mutex<Scheduler>>,
}

pub async fn serve(config: Config) -> Result<()> {
    let config = Arc::new(config);
    tokio::fs::create_dir_all(&config.backup_dir)
        .await
        .context("failed to create backup directory")?;

    let docker = engine::connect().context("failed to connect to the container engine")?;
    let store = Store::open(&config.data_dir)
        .await
        .context("failed to open data store")?;

    let (queue, rx) = JobQueue::new();
    spawn_worker(
        WorkerContext {
            docker: docker.clone(),
            store: store.clone(),
            config: config.clone(),
            queue: queue.clone(),
        },
        rx,
    );

    let scheduler = Arc::new(Mutex::new(Scheduler::new()));
    scheduler.lock().await.reload(&store, &queue).await;

    let ctx = ServerContext {
        config: config.clone(),
        docker,
        store,
        queue,
        scheduler,
    };

    let app = Router::new()
        .route("/api/health", get(health))
        .route("/api/containers", get(list_containers))
        .route("/api/artifacts", get(list_artifacts))
        .route("/api/jobs", get(all_jobs))
        .route("/api/jobs/:id", get(job_status))
        .route("/api/history", get(history))
        .route("/api/stacks", get(list_stacks).post(import_stack))
        .route("/api/stacks/:name", delete(delete_stack))
        .route("/api/schedules", get(schedules))
        .route("/api/schedules/container/:id", put(set_container_schedule))
        .route("/api/schedules/stack/:name", put(set_stack_schedule))
        .route("/api/backup/container/:id", post(backup_container))
        .route("/api/backup/stack/:name", post(backup_stack))
        .route("/api/restore", post(restore))
        .with_state(ctx)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = config.bind_address();
    info!("listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        warn!("failed to listen for shutdown signal: {}", e);
        return;
    }
    info!("shutting down");
}

fn internal_error(e: impl std::fmt::Display) -> (StatusCode, Json<Value>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "ok": false, "msg": e.to_string() })),
    )
}

// ---------------------------------------------------------------------------
// Reads
// ---------------------------------------------------------------------------

async fn health(State(ctx): State<ServerContext>) -> (StatusCode, Json<Value>) {
    match ctx.docker.ping().await {
        Ok(_) => (StatusCode::OK, Json(json!({ "ok": true }))),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "ok": false, "msg": e.to_string() })),
        ),
    }
}

async fn list_containers(
    State(ctx): State<ServerContext>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let containers = engine::list_all_containers(&ctx.docker)
        .await
        .map_err(internal_error)?;

    let listed: Vec<Value> = containers
        .into_iter()
        .map(|c| {
            let labels: HashMap<String, String> = c.labels.unwrap_or_default();
            let image = c.image.unwrap_or_default();
            json!({
                "id": c.id.unwrap_or_default(),
                "name": engine::display_name(c.names.as_ref(), ""),
                "image": image,
                "state": c.state.unwrap_or_default(),
                "appType": detect::detect_app_type(&image, &labels),
                "composeProject": labels.get(detect::COMPOSE_PROJECT_LABEL),
                "composeService": labels.get(detect::COMPOSE_SERVICE_LABEL),
            })
        })
        .collect();

    Ok(Json(json!({ "ok": true, "containers": listed })))
}

async fn list_artifacts(
    State(ctx): State<ServerContext>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let mut artifacts = Vec::new();
    let mut entries = tokio::fs::read_dir(&ctx.config.backup_dir)
        .await
        .map_err(internal_error)?;
    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => return Err(internal_error(e)),
        };
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.ends_with(".zip") {
            continue;
        }
        let metadata = entry.metadata().await.ok();
        let modified_at = metadata
            .as_ref()
            .and_then(|m| m.modified().ok())
            .map(|t| chrono::DateTime::<chrono::Utc>::from(t).to_rfc3339());
        artifacts.push(json!({
            "name": name,
            "sizeBytes": metadata.as_ref().map(|m| m.len()),
            "modifiedAt": modified_at,
        }));
    }
    artifacts.sort_by(|a, b| b["name"].as_str().cmp(&a["name"].as_str()));

    Ok(Json(json!({ "ok": true, "artifacts": artifacts })))
}

async fn all_jobs(State(ctx): State<ServerContext>) -> Json<Value> {
    Json(json!({ "ok": true, "jobs": ctx.queue.all_jobs().await }))
}

async fn job_status(
    State(ctx): State<ServerContext>,
    Path(id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match ctx.queue.status(&id).await {
        Some(job) => Ok(Json(json!({ "ok": true, "job": job }))),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "ok": false, "msg": "job not found" })),
        )),
    }
}

async fn history(State(ctx): State<ServerContext>) -> Json<Value> {
    Json(json!({ "ok": true, "history": ctx.store.history().await }))
}

async fn list_stacks(State(ctx): State<ServerContext>) -> Json<Value> {
    Json(json!({ "ok": true, "stacks": ctx.store.stacks().await }))
}

async fn schedules(State(ctx): State<ServerContext>) -> Json<Value> {
    let settings = ctx.store.settings().await;
    Json(json!({
        "ok": true,
        "containerSchedules": settings.container_schedules,
        "stackSchedules": settings.stack_schedules,
    }))
}

// ---------------------------------------------------------------------------
// Stack definitions and schedules
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImportStackRequest {
    name: String,
    compose_yaml: String,
    #[serde(default)]
    env_vars: HashMap<String, String>,
    #[serde(default)]
    env_file: Option<String>,
}

async fn import_stack(
    State(ctx): State<ServerContext>,
    Json(request): Json<ImportStackRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let definition = ctx
        .store
        .import_stack(
            &request.name,
            request.compose_yaml,
            request.env_vars,
            request.env_file,
        )
        .await
        .map_err(|e| {
            (
                StatusCode::BAD_REQUEST,
                Json(json!({ "ok": false, "msg": e.to_string() })),
            )
        })?;
    Ok(Json(json!({ "ok": true, "stack": definition })))
}

async fn delete_stack(
    State(ctx): State<ServerContext>,
    Path(name): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let removed = ctx.store.delete_stack(&name).await.map_err(internal_error)?;
    if removed {
        Ok(Json(json!({ "ok": true })))
    } else {
        Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "ok": false, "msg": "stack not found" })),
        ))
    }
}

async fn set_container_schedule(
    State(ctx): State<ServerContext>,
    Path(id): Path<String>,
    Json(schedule): Json<Schedule>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    upsert_schedule(&ctx, true, id, schedule).await
}

async fn set_stack_schedule(
    State(ctx): State<ServerContext>,
    Path(name): Path<String>,
    Json(schedule): Json<Schedule>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    upsert_schedule(&ctx, false, name, schedule).await
}

async fn upsert_schedule(
    ctx: &ServerContext,
    container: bool,
    key: String,
    schedule: Schedule,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    ctx.store
        .update_settings(|settings| {
            let map = if container {
                &mut settings.container_schedules
            } else {
                &mut settings.stack_schedules
            };
            if matches!(schedule.frequency, crate::store::Frequency::Manual) {
                map.remove(&key);
            } else {
                map.insert(key.clone(), schedule);
            }
        })
        .await
        .map_err(internal_error)?;

    ctx.scheduler
        .lock()
        .await
        .reload(&ctx.store, &ctx.queue)
        .await;
    Ok(Json(json!({ "ok": true })))
}

// ---------------------------------------------------------------------------
// Job enqueues
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct BackupContainerRequest {
    paths: Vec<String>,
}

async fn backup_container(
    State(ctx): State<ServerContext>,
    Path(id): Path<String>,
    body: Option<Json<BackupContainerRequest>>,
) -> Json<Value> {
    let paths = body.map(|Json(b)| b.paths).unwrap_or_default();
    let job_id = ctx
        .queue
        .enqueue(JobKind::BackupContainer, id, paths, None)
        .await;
    Json(json!({ "ok": true, "jobId": job_id }))
}

async fn backup_stack(
    State(ctx): State<ServerContext>,
    Path(name): Path<String>,
) -> Json<Value> {
    let job_id = ctx
        .queue
        .enqueue(JobKind::BackupStack, name, Vec::new(), None)
        .await;
    Json(json!({ "ok": true, "jobId": job_id }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RestoreRequest {
    artifact: String,
    #[serde(default)]
    network_override: Option<String>,
    /// Restore a stack archive into place instead of cloning.
    #[serde(default)]
    into_place: bool,
}

async fn restore(
    State(ctx): State<ServerContext>,
    Json(request): Json<RestoreRequest>,
) -> Json<Value> {
    let kind = if request.into_place {
        JobKind::RestoreStackIntoPlace
    } else if request.network_override.is_some() {
        JobKind::RestoreClone
    } else {
        JobKind::RestoreContainer
    };
    let job_id = ctx
        .queue
        .enqueue(kind, request.artifact, Vec::new(), request.network_override)
        .await;
    Json(json!({ "ok": true, "jobId": job_id }))
}
