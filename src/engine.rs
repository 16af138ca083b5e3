//! Docker engine operations via Bollard.
//!
//! Every call the backup/restore core makes against the engine lives here:
//! listing and inspection, exec sessions (collected, streamed-to-file and
//! stdin-fed), archive transfer in both directions, container lifecycle,
//! image pulls and network management.
//!
//! Errors are converted through `EngineResultExt` so the rest of the core
//! only sees `BackupError` kinds: a 404 becomes `NotFound`, anything else
//! `EngineUnavailable`.

use crate::error::BackupError;
use bollard::container::{
    Config, CreateContainerOptions, DownloadFromContainerOptions, InspectContainerOptions,
    ListContainersOptions, LogOutput, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions, UploadToContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerInspectResponse, ContainerSummary};
use bollard::network::{CreateNetworkOptions, ListNetworksOptions};
use bollard::Docker;
use futures_util::StreamExt;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::io::Write;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::detect::COMPOSE_PROJECT_LABEL;

pub const PULL_TIMEOUT: Duration = Duration::from_secs(300);

/// Extension trait for converting bollard errors to BackupError
pub trait EngineResultExt<T> {
    fn engine_context(self, context: &str) -> Result<T, BackupError>;
}

impl<T> EngineResultExt<T> for Result<T, BollardError> {
    fn engine_context(self, context: &str) -> Result<T, BackupError> {
        self.map_err(|e| match e {
            BollardError::DockerResponseServerError {
                status_code: 404,
                message,
            } => BackupError::NotFound(format!("{}: {}", context, message)),
            BollardError::DockerResponseServerError {
                status_code,
                message,
            } => BackupError::EngineUnavailable(format!(
                "{} ({}): {}",
                context, status_code, message
            )),
            other => BackupError::EngineUnavailable(format!("{}: {}", context, other)),
        })
    }
}

/// Guard a stage future with a wall-clock timeout.
pub async fn with_timeout<T, F>(dur: Duration, what: &str, fut: F) -> Result<T, BackupError>
where
    F: Future<Output = Result<T, BackupError>>,
{
    match tokio::time::timeout(dur, fut).await {
        Ok(result) => result,
        Err(_) => Err(BackupError::Timeout(format!(
            "{} exceeded {}s",
            what,
            dur.as_secs()
        ))),
    }
}

pub fn connect() -> Result<Docker, BackupError> {
    Docker::connect_with_local_defaults()
        .map_err(|e| BackupError::EngineUnavailable(e.to_string()))
}

/// Container display name without the engine's leading slash.
pub fn display_name(summary_names: Option<&Vec<String>>, fallback: &str) -> String {
    summary_names
        .and_then(|names| names.first())
        .map(|n| n.trim_start_matches('/').to_string())
        .unwrap_or_else(|| fallback.to_string())
}

// ---------------------------------------------------------------------------
// Listing and inspection
// ---------------------------------------------------------------------------

pub async fn list_all_containers(docker: &Docker) -> Result<Vec<ContainerSummary>, BackupError> {
    docker
        .list_containers(Some(ListContainersOptions::<String> {
            all: true,
            ..Default::default()
        }))
        .await
        .engine_context("failed to list containers")
}

/// List containers for a Docker Compose project
pub async fn list_containers_by_project(
    docker: &Docker,
    project_name: &str,
) -> Result<Vec<ContainerSummary>, BackupError> {
    let mut filters = HashMap::new();
    filters.insert(
        "label".to_string(),
        vec![format!("{}={}", COMPOSE_PROJECT_LABEL, project_name)],
    );

    docker
        .list_containers(Some(ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        }))
        .await
        .engine_context(&format!(
            "failed to list containers for project {}",
            project_name
        ))
}

pub async fn inspect_container(
    docker: &Docker,
    id: &str,
) -> Result<ContainerInspectResponse, BackupError> {
    docker
        .inspect_container(id, None::<InspectContainerOptions>)
        .await
        .engine_context(&format!("failed to inspect container {}", id))
}

/// Host ports currently published by any container.
pub async fn published_host_ports(docker: &Docker) -> Result<HashSet<u16>, BackupError> {
    let containers = list_all_containers(docker).await?;
    let mut ports = HashSet::new();
    for container in containers {
        for port in container.ports.unwrap_or_default() {
            if let Some(public) = port.public_port {
                ports.insert(public);
            }
        }
    }
    Ok(ports)
}

// ---------------------------------------------------------------------------
// Exec sessions
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct ExecOutput {
    pub exit_code: Option<i64>,
    pub stdout: Vec<u8>,
    pub stderr: String,
}

impl ExecOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

/// Run a command inside a container and collect stdout/stderr.
pub async fn exec_collect(
    docker: &Docker,
    id: &str,
    cmd: Vec<String>,
) -> Result<ExecOutput, BackupError> {
    let exec = docker
        .create_exec::<String>(
            id,
            CreateExecOptions {
                attach_stdout: Some(true),
                attach_stderr: Some(true),
                cmd: Some(cmd),
                ..Default::default()
            },
        )
        .await
        .engine_context("failed to create exec")?;

    let mut out = ExecOutput::default();
    if let StartExecResults::Attached { mut output, .. } = docker
        .start_exec(&exec.id, None)
        .await
        .engine_context("failed to start exec")?
    {
        while let Some(item) = output.next().await {
            match item {
                Ok(LogOutput::StdOut { message }) => out.stdout.extend_from_slice(&message),
                Ok(LogOutput::StdErr { message }) => {
                    out.stderr.push_str(&String::from_utf8_lossy(&message))
                }
                Ok(_) => {}
                Err(e) => return Err(BackupError::CaptureFailed(e.to_string())),
            }
        }
    }

    let inspect = docker
        .inspect_exec(&exec.id)
        .await
        .engine_context("failed to inspect exec")?;
    out.exit_code = inspect.exit_code;
    Ok(out)
}

/// Run a command inside a container, streaming stdout into `file`.
/// Returns (bytes written, collected stderr, exit code).
pub async fn exec_to_file(
    docker: &Docker,
    id: &str,
    cmd: Vec<String>,
    file: &mut std::fs::File,
) -> Result<(u64, String, Option<i64>), BackupError> {
    let exec = docker
        .create_exec::<String>(
            id,
            CreateExecOptions {
                attach_stdout: Some(true),
                attach_stderr: Some(true),
                cmd: Some(cmd),
                ..Default::default()
            },
        )
        .await
        .engine_context("failed to create exec")?;

    let mut written: u64 = 0;
    let mut stderr = String::new();
    if let StartExecResults::Attached { mut output, .. } = docker
        .start_exec(&exec.id, None)
        .await
        .engine_context("failed to start exec")?
    {
        while let Some(item) = output.next().await {
            match item {
                Ok(LogOutput::StdOut { message }) => {
                    file.write_all(&message)?;
                    written += message.len() as u64;
                }
                Ok(LogOutput::StdErr { message }) => {
                    stderr.push_str(&String::from_utf8_lossy(&message))
                }
                Ok(_) => {}
                Err(e) => return Err(BackupError::CaptureFailed(e.to_string())),
            }
        }
    }

    let inspect = docker
        .inspect_exec(&exec.id)
        .await
        .engine_context("failed to inspect exec")?;
    Ok((written, stderr, inspect.exit_code))
}

/// Run a command inside a container feeding `payload` to its stdin, then
/// wait out a short grace period after EOF before inspecting the exit
/// code. Used for SQL replay.
pub async fn exec_with_stdin(
    docker: &Docker,
    id: &str,
    cmd: Vec<String>,
    payload: Vec<u8>,
    grace: Duration,
) -> Result<ExecOutput, BackupError> {
    let exec = docker
        .create_exec::<String>(
            id,
            CreateExecOptions {
                attach_stdin: Some(true),
                attach_stdout: Some(true),
                attach_stderr: Some(true),
                cmd: Some(cmd),
                ..Default::default()
            },
        )
        .await
        .engine_context("failed to create exec")?;

    let mut out = ExecOutput::default();
    if let StartExecResults::Attached { mut output, mut input } = docker
        .start_exec(&exec.id, None)
        .await
        .engine_context("failed to start exec")?
    {
        let writer = async {
            input.write_all(&payload).await?;
            input.shutdown().await?;
            Ok::<(), std::io::Error>(())
        };
        let reader = async {
            let mut stdout = Vec::new();
            let mut stderr = String::new();
            while let Some(item) = output.next().await {
                match item {
                    Ok(LogOutput::StdOut { message }) => stdout.extend_from_slice(&message),
                    Ok(LogOutput::StdErr { message }) => {
                        stderr.push_str(&String::from_utf8_lossy(&message))
                    }
                    _ => {}
                }
            }
            (stdout, stderr)
        };

        let (write_result, (stdout, stderr)) = tokio::join!(writer, reader);
        write_result?;
        out.stdout = stdout;
        out.stderr = stderr;
        tokio::time::sleep(grace).await;
    }

    let inspect = docker
        .inspect_exec(&exec.id)
        .await
        .engine_context("failed to inspect exec")?;
    out.exit_code = inspect.exit_code;
    Ok(out)
}

// ---------------------------------------------------------------------------
// Archive transfer
// ---------------------------------------------------------------------------

/// Tar stream of a path inside a container (engine get-archive).
pub fn download_path<'a>(
    docker: &'a Docker,
    id: &str,
    path: &str,
) -> impl futures_util::Stream<Item = Result<bytes::Bytes, BollardError>> + 'a {
    docker.download_from_container(
        id,
        Some(DownloadFromContainerOptions {
            path: path.to_string(),
        }),
    )
}

/// Extract a tar into a container's filesystem at `dest` (engine
/// put-archive; works on stopped containers).
pub async fn upload_archive(
    docker: &Docker,
    id: &str,
    dest: &str,
    tar: Vec<u8>,
) -> Result<(), BackupError> {
    docker
        .upload_to_container(
            id,
            Some(UploadToContainerOptions {
                path: dest.to_string(),
                ..Default::default()
            }),
            bytes::Bytes::from(tar),
        )
        .await
        .engine_context(&format!("failed to upload archive to {}:{}", id, dest))
}

// ---------------------------------------------------------------------------
// Container lifecycle
// ---------------------------------------------------------------------------

pub async fn create_container(
    docker: &Docker,
    name: &str,
    config: Config<String>,
) -> Result<String, BackupError> {
    let response = docker
        .create_container(
            Some(CreateContainerOptions {
                name,
                platform: None,
            }),
            config,
        )
        .await
        .engine_context(&format!("failed to create container {}", name))?;
    Ok(response.id)
}

pub async fn start_container(docker: &Docker, id: &str) -> Result<(), BackupError> {
    docker
        .start_container(id, None::<StartContainerOptions<String>>)
        .await
        .engine_context(&format!("failed to start container {}", id))
}

pub async fn stop_container(docker: &Docker, id: &str) -> Result<(), BackupError> {
    docker
        .stop_container(id, Some(StopContainerOptions { t: 10 }))
        .await
        .engine_context(&format!("failed to stop container {}", id))
}

pub async fn remove_container(docker: &Docker, id: &str) -> Result<(), BackupError> {
    docker
        .remove_container(
            id,
            Some(RemoveContainerOptions {
                force: true,
                ..Default::default()
            }),
        )
        .await
        .engine_context(&format!("failed to remove container {}", id))
}

/// Make sure an image is available locally, pulling it when missing.
pub async fn ensure_image(docker: &Docker, image: &str) -> Result<(), BackupError> {
    if docker.inspect_image(image).await.is_ok() {
        return Ok(());
    }

    debug!("pulling image {}", image);
    let image = image.to_string();
    with_timeout(PULL_TIMEOUT, &format!("pull of {}", image), async {
        let mut stream = docker.create_image(
            Some(CreateImageOptions::<String> {
                from_image: image.clone(),
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(progress) = stream.next().await {
            progress.engine_context(&format!("failed to pull image {}", image))?;
        }
        Ok(())
    })
    .await
}

// ---------------------------------------------------------------------------
// Networks
// ---------------------------------------------------------------------------

pub async fn network_exists(docker: &Docker, name: &str) -> Result<bool, BackupError> {
    let mut filters = HashMap::new();
    filters.insert("name".to_string(), vec![name.to_string()]);
    let networks = docker
        .list_networks(Some(ListNetworksOptions { filters }))
        .await
        .engine_context("failed to list networks")?;
    // The name filter is fuzzy; require an exact match.
    Ok(networks
        .into_iter()
        .any(|n| n.name.as_deref() == Some(name)))
}

pub async fn create_bridge_network(docker: &Docker, name: &str) -> Result<(), BackupError> {
    docker
        .create_network(CreateNetworkOptions {
            name: name.to_string(),
            driver: "bridge".to_string(),
            ..Default::default()
        })
        .await
        .engine_context(&format!("failed to create network {}", name))?;
    Ok(())
}

pub async fn ensure_bridge_network(docker: &Docker, name: &str) -> Result<(), BackupError> {
    if !network_exists(docker, name).await? {
        create_bridge_network(docker, name).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_name_trims_engine_slash() {
        let names = vec!["/nginx-1".to_string()];
        assert_eq!(display_name(Some(&names), "cafe"), "nginx-1");
        assert_eq!(display_name(None, "cafe"), "cafe");
    }

    #[tokio::test]
    async fn test_with_timeout_expires() {
        let result: Result<(), BackupError> =
            with_timeout(Duration::from_millis(10), "slow stage", async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(BackupError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_with_timeout_passes_through() {
        let result = with_timeout(Duration::from_secs(5), "fast stage", async {
            Ok::<_, BackupError>(7)
        })
        .await;
        assert_eq!(result.unwrap(), 7);
    }
}
