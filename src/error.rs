//! Error types for the ferryfs library.

use thiserror::Error;

/// Main error type for storage operations.
///
/// Backends translate their native failure conditions (OS errno values,
/// HTTP 404/403-equivalent responses, protocol status codes) into these
/// variants at their own boundary, so callers classify errors with the
/// predicates below instead of matching on provider-specific strings.
#[derive(Error, Debug)]
pub enum FsError {
    /// The path does not exist on the backend.
    #[error("not found: {0}")]
    NotFound(String),

    /// The backend denied access to the path.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The operation is not supported by this backend.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// Rename/remove guard for backends without native recursive moves.
    #[error("directory is not empty: {0}")]
    DirNotEmpty(String),

    /// A folder or user quota ceiling would be exceeded.
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Invalid backend configuration, reported at construction time.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Local I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Backend request failed; the provider message is kept verbatim.
    #[error("backend error: {0}")]
    Backend(String),
}

impl FsError {
    /// Build a backend failure from any displayable provider error.
    pub fn backend(err: impl std::fmt::Display) -> Self {
        FsError::Backend(err.to_string())
    }

    /// True when the error means the path does not exist.
    pub fn is_not_exist(&self) -> bool {
        match self {
            FsError::NotFound(_) => true,
            FsError::Io(err) => err.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// True when the error means access was denied.
    pub fn is_permission(&self) -> bool {
        match self {
            FsError::PermissionDenied(_) => true,
            FsError::Io(err) => err.kind() == std::io::ErrorKind::PermissionDenied,
            _ => false,
        }
    }

    /// True when the backend does not implement the operation.
    pub fn is_unsupported(&self) -> bool {
        matches!(self, FsError::Unsupported(_))
    }

    /// True when a quota ceiling rejected the operation.
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, FsError::QuotaExceeded(_))
    }
}

impl From<FsError> for std::io::Error {
    fn from(err: FsError) -> Self {
        match err {
            FsError::Io(io) => io,
            FsError::NotFound(msg) => std::io::Error::new(std::io::ErrorKind::NotFound, msg),
            FsError::PermissionDenied(msg) => {
                std::io::Error::new(std::io::ErrorKind::PermissionDenied, msg)
            }
            other => std::io::Error::other(other.to_string()),
        }
    }
}

/// Result type alias for ferryfs operations.
pub type Result<T> = std::result::Result<T, FsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_exist_classification() {
        assert!(FsError::NotFound("/x".into()).is_not_exist());
        let io = FsError::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        assert!(io.is_not_exist());
        assert!(!FsError::Backend("503".into()).is_not_exist());
        assert!(!FsError::PermissionDenied("/x".into()).is_not_exist());
    }

    #[test]
    fn test_permission_classification() {
        assert!(FsError::PermissionDenied("/x".into()).is_permission());
        let io = FsError::Io(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "no",
        ));
        assert!(io.is_permission());
        assert!(!FsError::NotFound("/x".into()).is_permission());
    }

    #[test]
    fn test_backend_message_kept_verbatim() {
        let err = FsError::backend("connection reset by peer");
        assert_eq!(err.to_string(), "backend error: connection reset by peer");
    }

    #[test]
    fn test_io_error_round_trip() {
        let io: std::io::Error = FsError::NotFound("/a/b".into()).into();
        assert_eq!(io.kind(), std::io::ErrorKind::NotFound);
    }
}
