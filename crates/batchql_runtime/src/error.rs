//! Error types shared by the scheduler, sources, and the multiplex.

use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Error raised by a source's batch fetch.
///
/// Cheap to clone: one failed batch is delivered to every request that was
/// waiting on it, and all of them observe the same underlying error.
#[derive(Clone)]
pub struct FetchError {
    inner: Arc<dyn std::error::Error + Send + Sync>,
}

#[derive(Debug, Error)]
#[error("{0}")]
struct MessageError(String);

impl FetchError {
    /// Wraps an arbitrary error.
    pub fn new<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(error),
        }
    }

    /// Creates an error from a plain message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::new(MessageError(message.into()))
    }

    /// Returns the wrapped error if it is of type `E`.
    pub fn downcast_ref<E: std::error::Error + 'static>(&self) -> Option<&E> {
        self.inner.downcast_ref::<E>()
    }
}

impl fmt::Debug for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FetchError").field(&self.inner).finish()
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.inner, f)
    }
}

impl std::error::Error for FetchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner.source()
    }
}

/// Error observed at a `load` call site.
#[derive(Debug, Clone, Error)]
pub enum LoadError {
    /// The batch containing the key failed.
    #[error("{error}")]
    Fetch {
        source_name: &'static str,
        error: FetchError,
    },

    /// The source returned a different number of values than keys it was given.
    #[error("{source_name} returned {actual} values for {expected} keys")]
    CountMismatch {
        source_name: &'static str,
        expected: usize,
        actual: usize,
    },
}

impl LoadError {
    /// Name of the source type whose batch failed.
    pub fn source_name(&self) -> &'static str {
        match self {
            Self::Fetch { source_name, .. } | Self::CountMismatch { source_name, .. } => {
                source_name
            }
        }
    }

    /// Returns the fetch error if this is a fetch failure.
    pub fn fetch_error(&self) -> Option<&FetchError> {
        match self {
            Self::Fetch { error, .. } => Some(error),
            Self::CountMismatch { .. } => None,
        }
    }
}

/// A deliberate non-local exit raised from inside a job.
#[derive(Debug, Clone, PartialEq)]
pub struct Throw {
    pub tag: String,
    pub value: serde_json::Value,
}

/// Abnormal termination of a job.
#[derive(Debug, Clone, Error)]
pub enum JobError {
    /// A load failure the job did not handle.
    #[error(transparent)]
    Load(#[from] LoadError),

    /// An unexpected application failure.
    #[error("{0}")]
    Application(Arc<dyn std::error::Error + Send + Sync>),

    /// A non-local exit; `run` hands it back to its caller untouched.
    #[error("uncaught throw {:?}", .0.tag)]
    Throw(Throw),
}

impl JobError {
    /// Creates an application failure from any error.
    pub fn application<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Application(Arc::new(error))
    }

    /// Creates an application failure from a message.
    pub fn message(message: impl Into<String>) -> Self {
        Self::application(MessageError(message.into()))
    }

    /// Creates a throw with the given tag and payload.
    pub fn throw(tag: impl Into<String>, value: serde_json::Value) -> Self {
        Self::Throw(Throw {
            tag: tag.into(),
            value,
        })
    }

    /// Returns true for throws.
    pub fn is_throw(&self) -> bool {
        matches!(self, Self::Throw(_))
    }

    /// Catches a throw with a matching tag, returning its payload.
    ///
    /// Any other error (including throws with another tag) is handed back.
    pub fn into_thrown(self, tag: &str) -> Result<serde_json::Value, JobError> {
        match self {
            Self::Throw(throw) if throw.tag == tag => Ok(throw.value),
            other => Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("Nope")]
    struct ArgumentError;

    #[test]
    fn test_fetch_error_downcast() {
        let err = FetchError::new(ArgumentError);
        assert_eq!(err.to_string(), "Nope");
        assert!(err.downcast_ref::<ArgumentError>().is_some());
        assert!(FetchError::msg("other").downcast_ref::<ArgumentError>().is_none());
    }

    #[test]
    fn test_load_error_display() {
        let err = LoadError::Fetch {
            source_name: "ErrorSource",
            error: FetchError::new(ArgumentError),
        };
        assert_eq!(err.to_string(), "Nope");
        assert_eq!(err.source_name(), "ErrorSource");

        let err = LoadError::CountMismatch {
            source_name: "Short",
            expected: 3,
            actual: 1,
        };
        assert_eq!(err.to_string(), "Short returned 1 values for 3 keys");
        assert!(err.fetch_error().is_none());
    }

    #[test]
    fn test_into_thrown() {
        let err = JobError::throw("hello", serde_json::json!("world"));
        assert!(err.is_throw());
        assert_eq!(err.into_thrown("hello").unwrap(), serde_json::json!("world"));

        let err = JobError::throw("hello", serde_json::Value::Null);
        assert!(err.into_thrown("bye").is_err());

        let err = JobError::message("boom");
        assert!(err.into_thrown("hello").is_err());
    }
}
