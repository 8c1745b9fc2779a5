//! Structured error types for the scheduler.
//!
//! `SchedulerError` provides pattern-matchable errors instead of generic
//! `anyhow`-style wrapping, so embedders can distinguish a misconfigured
//! registration from a transient database hiccup without string matching.

use std::fmt;

use thiserror::Error;

/// Structured error type for scheduler operations.
///
/// Each variant corresponds to one of the error kinds a caller may need to
/// match on; the loops themselves only ever log `Transient` and continue.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// A job definition or argument was malformed.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// What was wrong with the argument.
        message: String,
    },

    /// The same job name was registered twice in this process with a
    /// different definition.
    #[error("job {name} is already registered in this process")]
    AlreadyRegistered {
        /// The job name that collided.
        name: String,
    },

    /// An operation referenced a job name with no backing row.
    #[error("no such job: {name}")]
    NotFound {
        /// The job name that was not found.
        name: String,
    },

    /// The scheduler was started more than once.
    #[error("scheduler already started")]
    StateError,

    /// A persistence call failed in a way the caller or loop may retry.
    #[error("transient persistence error: {source}")]
    Transient {
        /// The underlying error from the persistence implementation.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A handler's `run` returned an error. Recorded on the run row, never
    /// surfaced past the worker that produced it.
    #[error("handler failed: {message}")]
    HandlerFailure {
        /// The job name whose handler failed.
        job_name: String,
        /// The error message the handler returned.
        message: String,
    },
}

impl SchedulerError {
    /// Build a [`SchedulerError::Transient`] from any boxable error.
    pub fn transient<E>(source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        SchedulerError::Transient {
            source: Box::new(source),
        }
    }

    /// Build an [`SchedulerError::InvalidArgument`] from a display-able message.
    pub fn invalid_argument(message: impl fmt::Display) -> Self {
        SchedulerError::InvalidArgument {
            message: message.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
