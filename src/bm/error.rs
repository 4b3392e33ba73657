/// Errors surfaced over the control socket. The kind strings are stable wire
/// contract; the human detail after the colon is not.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum BmError {
    /// Target resolves to no entry (for operations that require a match).
    #[error("NotFound: {0}")]
    NotFound(String),

    /// `start` with a name that is already registered.
    #[error("AlreadyExists: service {0} already exists")]
    AlreadyExists(String),

    /// Malformed cron, memory unit, health URL, signal, or empty script.
    #[error("InvalidSpec: {0}")]
    InvalidSpec(String),

    /// The OS rejected the exec.
    #[error("SpawnFailed: {0}")]
    SpawnFailed(String),

    /// Child survived SIGTERM and SIGKILL past the kill timeout.
    #[error("KillTimeout: {0}")]
    KillTimeout(String),

    /// Another supervisor holds the pid file + socket.
    #[error("AlreadyRunning: {0}")]
    AlreadyRunning(String),

    /// Disk failures for logs or the dump file.
    #[error("IOError: {0}")]
    IoError(String),

    /// Bug. The detail should still carry a stable hint.
    #[error("Internal: {0}")]
    Internal(String),
}

impl BmError {
    pub fn kind(&self) -> &'static str {
        match self {
            BmError::NotFound(_) => "NotFound",
            BmError::AlreadyExists(_) => "AlreadyExists",
            BmError::InvalidSpec(_) => "InvalidSpec",
            BmError::SpawnFailed(_) => "SpawnFailed",
            BmError::KillTimeout(_) => "KillTimeout",
            BmError::AlreadyRunning(_) => "AlreadyRunning",
            BmError::IoError(_) => "IOError",
            BmError::Internal(_) => "Internal",
        }
    }

    pub fn io(context: &str, e: impl std::fmt::Display) -> Self {
        BmError::IoError(format!("{context}: {e}"))
    }
}

impl From<anyhow::Error> for BmError {
    fn from(e: anyhow::Error) -> Self {
        match e.downcast::<BmError>() {
            Ok(b) => b,
            Err(e) => BmError::Internal(format!("{e:#}")),
        }
    }
}

pub type BmResult<T> = Result<T, BmError>;
