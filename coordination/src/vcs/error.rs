//! Errors from the git collaborator. Only I/O failures end a session.

use thiserror::Error;

pub type VcsResult<T> = Result<T, VcsError>;

#[derive(Error, Debug)]
pub enum VcsError {
    /// `git` exited non-zero.
    #[error("git {operation} failed: {message}")]
    Git { operation: String, message: String },

    #[error("Working copy I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

impl VcsError {
    pub fn git(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Git {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Transient failures worth another attempt: lock contention and the like.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Git { message, .. } => {
                let lower = message.to_lowercase();
                lower.contains("lock")
                    || lower.contains("timeout")
                    || lower.contains("another git process")
            }
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::TimedOut
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_contention_is_retryable() {
        let err = VcsError::git(
            "commit -m x",
            "fatal: Unable to create '/r/.git/index.lock': File exists.",
        );
        assert!(err.is_retryable());
        assert!(!VcsError::git("checkout nope", "error: pathspec 'nope' did not match").is_retryable());
    }

    #[test]
    fn test_display() {
        let err = VcsError::git("restore .", "boom");
        assert_eq!(err.to_string(), "git restore . failed: boom");
    }
}
