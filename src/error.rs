use std::path::PathBuf;

use thiserror::Error;

pub type CsResult<T> = Result<T, CsError>;

#[derive(Debug, Error)]
pub enum CsError {
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("json failure: {0}")]
    Json(#[from] serde_json::Error),

    #[error("missing command `{command}` on PATH")]
    CommandMissing { command: String },

    #[error("command failed: `{command}` (status: {status}){stderr_suffix}")]
    CommandFailed {
        command: String,
        status: i32,
        stderr_suffix: String,
    },

    #[error("command timed out after {timeout_ms}ms: `{command}`{stderr_suffix}")]
    CommandTimedOut {
        command: String,
        timeout_ms: u64,
        stderr_suffix: String,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("unknown ASR provider `{0}`")]
    UnknownProvider(String),

    #[error("invalid chat file: {0}")]
    InvalidChatFile(String),

    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("stage output violation: {0}")]
    StageViolation(String),

    #[error("missing expected input at `{0}`")]
    MissingInput(PathBuf),

    #[error("run cancelled: {0}")]
    Cancelled(String),
}

impl CsError {
    #[must_use]
    pub fn from_command_failure(command: String, status: i32, stderr: String) -> Self {
        Self::CommandFailed {
            command,
            status,
            stderr_suffix: stderr_suffix(&stderr),
        }
    }

    #[must_use]
    pub fn from_command_timeout(command: String, timeout_ms: u64, stderr: String) -> Self {
        Self::CommandTimedOut {
            command,
            timeout_ms,
            stderr_suffix: stderr_suffix(&stderr),
        }
    }

    /// Stable, unique, machine-readable code for every variant.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::Io(_) => "CS-IO",
            Self::Json(_) => "CS-JSON",
            Self::CommandMissing { .. } => "CS-CMD-MISSING",
            Self::CommandFailed { .. } => "CS-CMD-FAILED",
            Self::CommandTimedOut { .. } => "CS-CMD-TIMEOUT",
            Self::InvalidConfig(_) => "CS-CONFIG",
            Self::UnknownProvider(_) => "CS-PROVIDER",
            Self::InvalidChatFile(_) => "CS-CHAT-FILE",
            Self::SchemaMismatch(_) => "CS-SCHEMA",
            Self::StageViolation(_) => "CS-STAGE",
            Self::MissingInput(_) => "CS-MISSING-INPUT",
            Self::Cancelled(_) => "CS-CANCELLED",
        }
    }

    /// Whether this error represents a wall-clock timeout of an external tool.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::CommandTimedOut { .. })
    }
}

fn stderr_suffix(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("; stderr: {trimmed}")
    }
}
