// Compose deployment via the docker CLI.
//
// Compose is not part of the engine API, so redeploys shell out to
// `docker compose` against a scratch project directory holding the
// rewritten manifest and optional env file. Two modes: create every
// container without starting it (the offline-injection window of a stack
// restore) and a normal detached up.

use crate::error::BackupError;
use std::path::PathBuf;
use tempfile::TempDir;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployMode {
    /// `up --no-start`: containers exist but stay stopped.
    CreateOnly,
    /// `up -d --remove-orphans`.
    Up,
}

/// Scratch directory holding the manifest (and env file) for a deploy.
/// Dropping it removes the temp files.
pub struct ProjectFiles {
    dir: TempDir,
    pub compose_path: PathBuf,
    pub env_path: Option<PathBuf>,
}

impl ProjectFiles {
    pub fn dir(&self) -> &std::path::Path {
        self.dir.path()
    }
}

pub async fn write_project_files(
    manifest: &str,
    env: Option<&str>,
) -> Result<ProjectFiles, BackupError> {
    let dir = tempfile::Builder::new()
        .prefix("dockvault-deploy-")
        .tempdir()?;

    let compose_path = dir.path().join("docker-compose.yml");
    tokio::fs::write(&compose_path, manifest).await?;

    let env_path = match env {
        Some(content) => {
            let path = dir.path().join(".env");
            tokio::fs::write(&path, content).await?;
            Some(path)
        }
        None => None,
    };

    Ok(ProjectFiles {
        dir,
        compose_path,
        env_path,
    })
}

/// Build the docker compose argument list for a deploy.
fn compose_args(project: &str, files: &ProjectFiles, mode: DeployMode) -> Vec<String> {
    let mut args = vec![
        "compose".to_string(),
        "-p".to_string(),
        project.to_string(),
        "-f".to_string(),
        files.compose_path.display().to_string(),
    ];
    if let Some(env_path) = &files.env_path {
        args.push("--env-file".to_string());
        args.push(env_path.display().to_string());
    }
    args.push("up".to_string());
    match mode {
        DeployMode::CreateOnly => args.push("--no-start".to_string()),
        DeployMode::Up => {
            args.push("-d".to_string());
            args.push("--remove-orphans".to_string());
        }
    }
    args
}

/// Deploy a project. Non-zero exit surfaces the stderr tail.
pub async fn compose_up(
    project: &str,
    files: &ProjectFiles,
    mode: DeployMode,
) -> Result<(), BackupError> {
    let args = compose_args(project, files, mode);
    debug!("docker {}", args.join(" "));

    let output = Command::new("docker")
        .args(&args)
        .current_dir(files.dir())
        .output()
        .await
        .map_err(|e| BackupError::DeployFailed(format!("failed to run docker compose: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(BackupError::DeployFailed(format!(
            "docker compose exited with {}: {}",
            output.status,
            tail(&stderr, 2000)
        )));
    }
    Ok(())
}

fn tail(s: &str, max: usize) -> &str {
    let trimmed = s.trim_end();
    match trimmed.char_indices().nth_back(max.saturating_sub(1)) {
        Some((idx, _)) => &trimmed[idx..],
        None => trimmed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_compose_args_create_only() {
        let files = write_project_files("services: {}\n", None).await.unwrap();
        let args = compose_args("shop", &files, DeployMode::CreateOnly);
        assert_eq!(args[0..3], ["compose", "-p", "shop"]);
        assert_eq!(args[args.len() - 2..], ["up", "--no-start"]);
        assert!(!args.contains(&"--env-file".to_string()));
    }

    #[tokio::test]
    async fn test_compose_args_up_with_env() {
        let files = write_project_files("services: {}\n", Some("A=1\n"))
            .await
            .unwrap();
        let args = compose_args("shop", &files, DeployMode::Up);
        assert!(args.contains(&"--env-file".to_string()));
        assert_eq!(
            args[args.len() - 3..],
            ["up", "-d", "--remove-orphans"]
        );
    }

    #[tokio::test]
    async fn test_project_files_removed_on_drop() {
        let path = {
            let files = write_project_files("services: {}\n", Some("A=1\n"))
                .await
                .unwrap();
            assert!(files.compose_path.exists());
            assert!(files.env_path.as_ref().unwrap().exists());
            files.compose_path.clone()
        };
        assert!(!path.exists());
    }

    #[test]
    fn test_tail_bounds_output() {
        assert_eq!(tail("short", 2000), "short");
        let long = "x".repeat(3000);
        assert_eq!(tail(&long, 2000).len(), 2000);
    }
}
