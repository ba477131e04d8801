//! Crate-wide error type.
//!
//! Every fallible operation in the core returns [`ServinResult`]. The variants
//! are the error kinds surfaced to CLI and CRI clients; each carries a
//! human-readable message.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type ServinResult<T> = Result<T, ServinError>;

/// Error kinds carried through the core.
#[derive(Debug, Error)]
pub enum ServinError {
    /// Referenced record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Partial identifier matches more than one record.
    #[error("ambiguous identifier: {0}")]
    Ambiguous(String),

    /// User-supplied configuration fails validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A record with the same identity already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// State precondition violated: the container is already running.
    #[error("already running: {0}")]
    AlreadyRunning(String),

    /// State precondition violated: the container is not running.
    #[error("not running: {0}")]
    NotRunning(String),

    /// Removal blocked by a live reference.
    #[error("in use: {0}")]
    InUse(String),

    /// Namespace/cgroup/mount/network setup failed.
    #[error("isolation failure: {0}")]
    Isolation(String),

    /// The referenced image is not in the store.
    #[error("image not found: {0}")]
    ImageNotFound(String),

    /// Image payload failed a structural or digest check.
    #[error("image corrupt: {0}")]
    ImageCorrupt(String),

    /// Uploaded or imported bytes do not hash to the declared digest.
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    /// Command execution inside a container failed.
    #[error("exec failed: {0}")]
    ExecFailed(String),

    /// Host filesystem error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// State store error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Deadline exceeded.
    #[error("timeout: {0}")]
    Timeout(String),

    /// VM mode requested but the guest is not reachable.
    #[error("vm unavailable: {0}")]
    VmUnavailable(String),

    /// Registry credentials missing or rejected.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Invariant violation; always accompanied by a log entry.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServinError {
    /// Short machine-readable name of the error kind, used by the CRI error
    /// mapping and by clients that switch on the kind rather than the text.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not-found",
            Self::Ambiguous(_) => "ambiguous",
            Self::InvalidConfig(_) => "invalid-config",
            Self::AlreadyExists(_) => "already-exists",
            Self::AlreadyRunning(_) => "already-running",
            Self::NotRunning(_) => "not-running",
            Self::InUse(_) => "in-use",
            Self::Isolation(_) => "isolation",
            Self::ImageNotFound(_) => "image-not-found",
            Self::ImageCorrupt(_) => "image-corrupt",
            Self::DigestMismatch { .. } => "digest-mismatch",
            Self::ExecFailed(_) => "exec-failed",
            Self::Io(_) => "io",
            Self::Storage(_) => "storage",
            Self::Timeout(_) => "timeout",
            Self::VmUnavailable(_) => "vm-unavailable",
            Self::Auth(_) => "auth",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<serde_json::Error> for ServinError {
    fn from(e: serde_json::Error) -> Self {
        Self::Storage(format!("serialization: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names_are_stable() {
        assert_eq!(ServinError::NotFound("x".into()).kind(), "not-found");
        assert_eq!(
            ServinError::DigestMismatch {
                expected: "a".into(),
                actual: "b".into()
            }
            .kind(),
            "digest-mismatch"
        );
    }

    #[test]
    fn test_display_carries_message() {
        let e = ServinError::InUse("container abc is running".into());
        assert!(e.to_string().contains("abc"));
    }
}
