//! Task execution error types
//!
//! Tasks report whether a failure is recoverable (the queue should retry the
//! task) or unrecoverable (the task fails immediately without retrying).

use std::fmt;

/// Task execution error that can be either recoverable or unrecoverable
#[derive(Debug)]
pub struct TaskError {
    inner: anyhow::Error,
    recoverable: bool,
}

impl TaskError {
    /// Create a new unrecoverable task error
    ///
    /// Unrecoverable errors fail the task immediately. Use this for input
    /// that will not change on retry, such as an undecodable payload.
    pub fn unrecoverable(err: impl Into<anyhow::Error>) -> Self {
        Self {
            inner: err.into(),
            recoverable: false,
        }
    }

    /// Create a new recoverable task error
    ///
    /// Recoverable errors are retried according to the task's retry policy:
    /// storage I/O failures, database connection errors, timeouts of
    /// downstream services.
    pub fn recoverable(err: impl Into<anyhow::Error>) -> Self {
        Self {
            inner: err.into(),
            recoverable: true,
        }
    }

    /// Check if this error is recoverable (should be retried)
    pub fn is_recoverable(&self) -> bool {
        self.recoverable
    }

    /// Get the inner error
    pub fn inner(&self) -> &anyhow::Error {
        &self.inner
    }

    /// Consume self and return the inner error
    pub fn into_inner(self) -> anyhow::Error {
        self.inner
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

impl std::error::Error for TaskError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner.source()
    }
}

impl From<anyhow::Error> for TaskError {
    /// Plain errors are treated as recoverable
    fn from(err: anyhow::Error) -> Self {
        Self::recoverable(err)
    }
}

/// Extension trait for Result to easily create unrecoverable task errors
pub trait TaskResultExt<T> {
    /// Mark this result as unrecoverable on error
    fn unrecoverable(self) -> Result<T, TaskError>;
}

impl<T, E: Into<anyhow::Error>> TaskResultExt<T> for Result<T, E> {
    fn unrecoverable(self) -> Result<T, TaskError> {
        self.map_err(|e| TaskError::unrecoverable(e.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unrecoverable_error_is_not_retried() {
        let err = TaskError::unrecoverable(anyhow::anyhow!("payload is not valid JSON"));
        assert!(!err.is_recoverable());
        assert!(err.to_string().contains("payload is not valid JSON"));
    }

    #[test]
    fn plain_anyhow_error_defaults_to_recoverable() {
        let err: TaskError = anyhow::anyhow!("connection reset").into();
        assert!(err.is_recoverable());
    }

    #[test]
    fn result_ext_marks_unrecoverable() {
        let result: Result<(), anyhow::Error> = Err(anyhow::anyhow!("bad payload"));
        let task_result = result.unrecoverable();
        assert!(!task_result.unwrap_err().is_recoverable());
    }
}
