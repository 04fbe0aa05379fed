//! Error types for kiln.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Declaration errors
    #[error("Invalid pipeline declaration: {0}")]
    Spec(String),

    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    // Step errors
    #[error("Step failed with exit code {exit_code}: {message}")]
    StepFailed { exit_code: i32, message: String },

    #[error("Step timed out after {seconds}s")]
    StepTimeout { seconds: u64 },

    #[error("Run cancelled: {reason}")]
    Cancelled { reason: String },

    // Scoped resource errors
    #[error("Environment setup failed: {0}")]
    Environment(String),

    #[error("Action not found: {0}")]
    ActionNotFound(String),

    #[error("Action failed: {0}")]
    Action(String),

    // Infrastructure errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Shorthand for a declaration error.
    pub fn spec(message: impl Into<String>) -> Self {
        Error::Spec(message.into())
    }

    /// Whether the error invalidates the whole run rather than a single job.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Spec(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::Spec(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yaml_errors_are_spec_errors() {
        let err: Error = serde_yaml::from_str::<u32>("not a number").unwrap_err().into();
        assert!(matches!(err, Error::Spec(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_job_scoped_errors_are_not_fatal() {
        assert!(!Error::StepTimeout { seconds: 5 }.is_fatal());
        assert!(!Error::Environment("no disk".into()).is_fatal());
        assert!(
            !Error::Cancelled {
                reason: "superseded".into()
            }
            .is_fatal()
        );
    }
}
