// Error kinds shared by the backup/restore core.
//
// Per-path capture failures inside a volume backup are downgraded to
// ERROR_ entries in the artifact and never surface here; everything else
// propagates as one of these kinds and terminates the owning job stage.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("capture failed: {0}")]
    CaptureFailed(String),

    #[error("capture produced no data: {0}")]
    CaptureEmpty(String),

    #[error("rewrite failed: {0}")]
    RewriteFailed(String),

    #[error("deploy failed: {0}")]
    DeployFailed(String),

    #[error("readiness timeout: {0}")]
    ReadinessTimeout(String),

    #[error("replay failed: {0}")]
    ReplayFailed(String),

    #[error("upload failed: {0}")]
    UploadFailed(String),

    #[error("stack has no containers: {0}")]
    StackEmpty(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl BackupError {
    /// Fatal kinds for a stack restore job. Everything else is recorded as
    /// a warning and the pipeline keeps going.
    pub fn fatal_for_stack_restore(&self) -> bool {
        matches!(
            self,
            BackupError::RewriteFailed(_)
                | BackupError::DeployFailed(_)
                | BackupError::Parse(_)
                | BackupError::NotFound(_)
        )
    }
}

impl From<zip::result::ZipError> for BackupError {
    fn from(e: zip::result::ZipError) -> Self {
        match e {
            zip::result::ZipError::FileNotFound => {
                BackupError::NotFound("archive entry not found".to_string())
            }
            zip::result::ZipError::Io(io) => BackupError::Io(io),
            other => BackupError::Parse(format!("archive: {}", other)),
        }
    }
}

impl From<serde_json::Error> for BackupError {
    fn from(e: serde_json::Error) -> Self {
        BackupError::Parse(format!("json: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_kinds_for_stack_restore() {
        assert!(BackupError::RewriteFailed("x".into()).fatal_for_stack_restore());
        assert!(BackupError::DeployFailed("x".into()).fatal_for_stack_restore());
        assert!(BackupError::Parse("x".into()).fatal_for_stack_restore());
        assert!(BackupError::NotFound("x".into()).fatal_for_stack_restore());

        assert!(!BackupError::ReadinessTimeout("x".into()).fatal_for_stack_restore());
        assert!(!BackupError::ReplayFailed("x".into()).fatal_for_stack_restore());
        assert!(!BackupError::CaptureEmpty("x".into()).fatal_for_stack_restore());
    }
}
