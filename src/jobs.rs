//! Serialized job queue and the single worker that drains it.
//!
//! Enqueues insert the pending record into the shared map before the
//! request is queued, so a job is observable immediately. Exactly one
//! worker processes requests in FIFO order; at most one job is ever in
//! `processing`. Status records are replaced whole, reads are snapshots.
//! Every job writes exactly one history entry on its terminal
//! transition; a failed terminal state is final.

use crate::archive::{self, ArtifactKind};
use crate::backup;
use crate::config::Config;
use crate::error::BackupError;
use crate::restore;
use crate::stack_restore;
use crate::store::{Destination, HistoryEntry, HistoryStatus, Store};
use crate::uploader;
use bollard::Docker;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{error, info};
use zip::ZipArchive;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    BackupContainer,
    BackupStack,
    RestoreContainer,
    RestoreStackIntoPlace,
    RestoreClone,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::BackupContainer => "backup-container",
            JobKind::BackupStack => "backup-stack",
            JobKind::RestoreContainer => "restore-container",
            JobKind::RestoreStackIntoPlace => "restore-stack-into-place",
            JobKind::RestoreClone => "restore-clone",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Uploading,
    Completed,
    Failed,
}

impl JobStatus {
    fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub kind: JobKind,
    pub target: String,
    pub status: JobStatus,
    pub message: String,
    pub last_updated: String,
}

#[derive(Debug)]
pub struct JobRequest {
    pub id: String,
    pub kind: JobKind,
    pub target: String,
    pub custom_paths: Vec<String>,
    pub network_override: Option<String>,
}

type SharedJobs = Arc<RwLock<HashMap<String, Job>>>;

#[derive(Clone)]
pub struct JobQueue {
    jobs: SharedJobs,
    tx: mpsc::UnboundedSender<JobRequest>,
}

impl JobQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<JobRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                jobs: Arc::new(RwLock::new(HashMap::new())),
                tx,
            },
            rx,
        )
    }

    /// Enqueue a job. The pending record is visible before the worker
    /// can possibly pick the request up.
    pub async fn enqueue(
        &self,
        kind: JobKind,
        target: impl Into<String>,
        custom_paths: Vec<String>,
        network_override: Option<String>,
    ) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        let target = target.into();
        let job = Job {
            id: id.clone(),
            kind,
            target: target.clone(),
            status: JobStatus::Pending,
            message: "queued".to_string(),
            last_updated: Utc::now().to_rfc3339(),
        };
        self.jobs.write().await.insert(id.clone(), job);

        let request = JobRequest {
            id: id.clone(),
            kind,
            target,
            custom_paths,
            network_override,
        };
        if self.tx.send(request).is_err() {
            self.progress(&id)
                .set_status(JobStatus::Failed, "worker is gone")
                .await;
        }
        id
    }

    pub async fn status(&self, id: &str) -> Option<Job> {
        self.jobs.read().await.get(id).cloned()
    }

    pub async fn all_jobs(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.jobs.read().await.values().cloned().collect();
        jobs.sort_by(|a, b| b.last_updated.cmp(&a.last_updated));
        jobs
    }

    pub fn progress(&self, id: &str) -> JobProgress {
        JobProgress {
            jobs: self.jobs.clone(),
            id: id.to_string(),
        }
    }
}

/// Handle the executing code uses to update one job's record. Progress
/// messages are replaced, not accumulated.
#[derive(Clone)]
pub struct JobProgress {
    jobs: SharedJobs,
    id: String,
}

impl JobProgress {
    pub async fn set_message(&self, message: impl Into<String>) {
        let mut jobs = self.jobs.write().await;
        if let Some(job) = jobs.get_mut(&self.id) {
            if job.status.is_terminal() {
                return;
            }
            let mut updated = job.clone();
            updated.message = message.into();
            updated.last_updated = Utc::now().to_rfc3339();
            *job = updated;
        }
    }

    pub async fn set_status(&self, status: JobStatus, message: impl Into<String>) {
        let mut jobs = self.jobs.write().await;
        if let Some(job) = jobs.get_mut(&self.id) {
            // Transitions are monotonic; a terminal state is final.
            if job.status.is_terminal() {
                return;
            }
            let mut updated = job.clone();
            updated.status = status;
            updated.message = message.into();
            updated.last_updated = Utc::now().to_rfc3339();
            *job = updated;
        }
    }
}

pub struct WorkerContext {
    pub docker: Docker,
    pub store: Store,
    pub config: Arc<Config>,
    pub queue: JobQueue,
}

struct JobReport {
    message: String,
    destination: Destination,
    size_bytes: Option<u64>,
    artifact_path: Option<String>,
}

/// Spawn the single worker draining the queue.
pub fn spawn_worker(
    ctx: WorkerContext,
    mut rx: mpsc::UnboundedReceiver<JobRequest>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(request) = rx.recv().await {
            let progress = ctx.queue.progress(&request.id);
            progress.set_status(JobStatus::Processing, "started").await;
            info!(
                "job {} started: {} {}",
                request.id,
                request.kind.as_str(),
                request.target
            );

            let subject = format!("{} {}", request.kind.as_str(), request.target);
            match run_job(&ctx, &request, &progress).await {
                Ok(report) => {
                    progress
                        .set_status(JobStatus::Completed, report.message.clone())
                        .await;
                    let mut entry = HistoryEntry::new(
                        subject,
                        HistoryStatus::Success,
                        report.destination,
                        report.message,
                    );
                    entry.size_bytes = report.size_bytes;
                    entry.artifact_path = report.artifact_path;
                    if let Err(e) = ctx.store.append_history(entry).await {
                        error!("failed to record history: {}", e);
                    }
                }
                Err(e) => {
                    error!("job {} failed: {}", request.id, e);
                    progress.set_status(JobStatus::Failed, e.to_string()).await;
                    let entry = HistoryEntry::new(
                        subject,
                        HistoryStatus::Failed,
                        Destination::Local,
                        e.to_string(),
                    );
                    if let Err(e) = ctx.store.append_history(entry).await {
                        error!("failed to record history: {}", e);
                    }
                }
            }
        }
    })
}

async fn run_job(
    ctx: &WorkerContext,
    request: &JobRequest,
    progress: &JobProgress,
) -> Result<JobReport, BackupError> {
    match request.kind {
        JobKind::BackupContainer => {
            let artifact = backup::backup_container(
                &ctx.docker,
                &ctx.store,
                &ctx.config.backup_dir,
                &request.target,
                &request.custom_paths,
                progress,
            )
            .await?;
            ship(ctx, progress, &artifact).await
        }
        JobKind::BackupStack => {
            let outcome = backup::backup_stack(
                &ctx.docker,
                &ctx.store,
                &ctx.config.backup_dir,
                &request.target,
                progress,
            )
            .await?;
            if !outcome.failures.is_empty() {
                return Err(BackupError::CaptureFailed(format!(
                    "{} of {} services failed ({}); artifact kept at {}",
                    outcome.failures.len(),
                    outcome.services,
                    outcome.failures.join("; "),
                    outcome.artifact.display()
                )));
            }
            let mut report = ship(ctx, progress, &outcome.artifact).await?;
            if !outcome.warnings.is_empty() {
                report.message =
                    format!("{} ({} warning(s))", report.message, outcome.warnings.len());
            }
            Ok(report)
        }
        JobKind::RestoreContainer | JobKind::RestoreClone | JobKind::RestoreStackIntoPlace => {
            let artifact = resolve_artifact_path(&ctx.config.backup_dir, &request.target)?;

            // Route on root entries only; the requested kind is advisory.
            let kind = {
                let file = File::open(&artifact)?;
                archive::detect_kind(&mut ZipArchive::new(file)?)?
            };

            match kind {
                ArtifactKind::UnifiedStack => {
                    let report =
                        stack_restore::restore_stack(&ctx.docker, &artifact, progress).await?;
                    Ok(JobReport {
                        message: format!(
                            "stack {} restored: {} service(s), {} remapping(s), {} warning(s)",
                            report.stack_name,
                            report.services,
                            report.remappings.len(),
                            report.warnings.len()
                        ),
                        destination: Destination::Local,
                        size_bytes: None,
                        artifact_path: Some(artifact.display().to_string()),
                    })
                }
                _ => {
                    let outcomes = restore::clone_from_artifact(
                        &ctx.docker,
                        &artifact,
                        request.network_override.clone(),
                        progress,
                    )
                    .await?;
                    let names: Vec<String> =
                        outcomes.iter().map(|o| o.container.clone()).collect();
                    let remapped: usize = outcomes.iter().map(|o| o.remappings.len()).sum();
                    let warned: usize = outcomes.iter().map(|o| o.warnings.len()).sum();
                    Ok(JobReport {
                        message: format!(
                            "restored {} ({} port remapping(s), {} warning(s))",
                            names.join(", "),
                            remapped,
                            warned
                        ),
                        destination: Destination::Local,
                        size_bytes: None,
                        artifact_path: Some(artifact.display().to_string()),
                    })
                }
            }
        }
    }
}

async fn ship(
    ctx: &WorkerContext,
    progress: &JobProgress,
    artifact: &Path,
) -> Result<JobReport, BackupError> {
    progress
        .set_status(JobStatus::Uploading, "uploading artifact")
        .await;
    let settings = ctx.store.settings().await;
    let target = uploader::resolve_target(&ctx.config, &settings);
    let outcome = uploader::ship_artifact(target, artifact).await;
    Ok(JobReport {
        message: outcome.message,
        destination: outcome.destination,
        size_bytes: outcome.size_bytes,
        artifact_path: outcome.artifact_path,
    })
}

fn resolve_artifact_path(backup_dir: &Path, target: &str) -> Result<PathBuf, BackupError> {
    let candidate = if Path::new(target).is_absolute() {
        PathBuf::from(target)
    } else {
        backup_dir.join(target)
    };
    if candidate.is_file() {
        Ok(candidate)
    } else {
        Err(BackupError::NotFound(format!("artifact {}", target)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_job_visible_immediately_after_enqueue() {
        let (queue, mut rx) = JobQueue::new();
        let id = queue
            .enqueue(JobKind::BackupContainer, "cafe", Vec::new(), None)
            .await;

        let job = queue.status(&id).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.kind, JobKind::BackupContainer);
        assert_eq!(job.target, "cafe");

        // The request is waiting for the worker.
        let request = rx.recv().await.unwrap();
        assert_eq!(request.id, id);
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let (queue, mut rx) = JobQueue::new();
        let first = queue
            .enqueue(JobKind::BackupContainer, "a", Vec::new(), None)
            .await;
        let second = queue
            .enqueue(JobKind::BackupStack, "b", Vec::new(), None)
            .await;

        assert_eq!(rx.recv().await.unwrap().id, first);
        assert_eq!(rx.recv().await.unwrap().id, second);
    }

    #[tokio::test]
    async fn test_failed_terminal_state_is_final() {
        let (queue, _rx) = JobQueue::new();
        let id = queue
            .enqueue(JobKind::RestoreClone, "a.zip", Vec::new(), None)
            .await;
        let progress = queue.progress(&id);

        progress.set_status(JobStatus::Processing, "started").await;
        progress.set_status(JobStatus::Failed, "boom").await;
        progress
            .set_status(JobStatus::Completed, "should not apply")
            .await;
        progress.set_message("should not apply either").await;

        let job = queue.status(&id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.message, "boom");
    }

    #[tokio::test]
    async fn test_progress_messages_replace() {
        let (queue, _rx) = JobQueue::new();
        let id = queue
            .enqueue(JobKind::BackupStack, "shop", Vec::new(), None)
            .await;
        let progress = queue.progress(&id);

        progress.set_message("[1/3] db").await;
        progress.set_message("[2/3] web").await;

        let job = queue.status(&id).await.unwrap();
        assert_eq!(job.message, "[2/3] web");
    }

    #[test]
    fn test_kind_serialization_is_kebab_case() {
        assert_eq!(
            serde_json::to_string(&JobKind::RestoreStackIntoPlace).unwrap(),
            "\"restore-stack-into-place\""
        );
        assert_eq!(JobKind::BackupContainer.as_str(), "backup-container");
    }

    #[test]
    fn test_resolve_artifact_path() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.zip"), b"x").unwrap();

        let found = resolve_artifact_path(dir.path(), "a.zip").unwrap();
        assert!(found.ends_with("a.zip"));
        assert!(resolve_artifact_path(dir.path(), "missing.zip").is_err());
    }
}
