//! Error types for composite actuators.
//!
//! This module defines `ActuatorError`, the single error type returned by every
//! actuator in the crate. Using the `thiserror` crate, it separates the two
//! families of failures an actuator can produce:
//!
//! ## Construction-time errors
//!
//! - **`Configuration`**: semantic problems in the parameters given to a
//!   constructor (mismatched axis maps, a backlash larger than the axis range,
//!   a missing dependency role, a malformed position table...). These abort
//!   the instantiation.
//! - **`ConfigLoad`**: wraps errors from `figment` while loading
//!   [`ActuatorSettings`](crate::config::ActuatorSettings).
//!
//! ## Operation-time errors
//!
//! - **`InvalidArgument`**, **`Unsupported`**, **`UnknownAxis`**,
//!   **`UnknownRole`**: synchronous validation failures, returned before any
//!   request is queued.
//! - **`Io`**, **`Timeout`**, **`Cancelled`**, **`TaskPanicked`**,
//!   **`ExecutorClosed`**: asynchronous failures, only ever delivered through
//!   the [`MoveFuture`](crate::executor::MoveFuture) of the request.
//! - **`Other`**: errors bubbling up from dependency drivers, which use
//!   `anyhow` internally.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the actuator error type.
pub type ActuatorResult<T> = std::result::Result<T, ActuatorError>;

#[derive(Error, Debug)]
pub enum ActuatorError {
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Configuration error: {0}")]
    ConfigLoad(#[from] Box<figment::Error>),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Unknown axis '{0}'")]
    UnknownAxis(String),

    #[error("Unknown dependency role '{0}'")]
    UnknownRole(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Request was cancelled")]
    Cancelled,

    #[error("Executor of '{0}' is shut down")]
    ExecutorClosed(String),

    #[error("Task panicked: {0}")]
    TaskPanicked(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ActuatorError {
    /// Shorthand for a configuration error built from anything displayable.
    pub fn config(msg: impl Into<String>) -> Self {
        ActuatorError::Configuration(msg.into())
    }

    /// Whether the error was raised while validating a request, before
    /// anything was queued.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            ActuatorError::InvalidArgument(_)
                | ActuatorError::Unsupported(_)
                | ActuatorError::UnknownAxis(_)
                | ActuatorError::UnknownRole(_)
        )
    }
}

impl From<figment::Error> for ActuatorError {
    fn from(err: figment::Error) -> Self {
        ActuatorError::ConfigLoad(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ActuatorError::config("axes differ");
        assert_eq!(
            err.to_string(),
            "Configuration validation error: axes differ"
        );
    }

    #[test]
    fn test_io_error_from_convergence() {
        let err: ActuatorError =
            std::io::Error::other("Failed to reach position 2, sensor reports 1").into();
        assert!(err.to_string().starts_with("I/O error"));
        assert!(!err.is_validation());
    }

    #[test]
    fn test_driver_error_is_transparent() {
        let err: ActuatorError = anyhow::anyhow!("stage jammed").into();
        assert_eq!(err.to_string(), "stage jammed");
    }

    #[test]
    fn test_validation_kinds() {
        assert!(ActuatorError::UnknownAxis("z".into()).is_validation());
        assert!(ActuatorError::Unsupported("rel".into()).is_validation());
        assert!(!ActuatorError::Cancelled.is_validation());
    }
}
