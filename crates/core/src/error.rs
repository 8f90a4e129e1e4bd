//! Error types for bucketry
//!
//! Every backend maps its failures onto this taxonomy so that callers and the
//! sync engine can reason about outcomes without knowing which store is
//! underneath.

use std::fmt;

use thiserror::Error;

/// Result type alias for bucketry operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for bucket operations
#[derive(Error, Debug)]
pub enum Error {
    /// The requested key does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// An if-not-exists write found an existing object
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// The store refused access to an existing resource
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Checksum missing or mismatched
    #[error("Integrity check failed: {0}")]
    Integrity(String),

    /// The operation context was canceled
    #[error("Operation canceled")]
    Canceled,

    /// Transient transport failure (timeouts, throttling, 5xx)
    #[error("Network error: {0}")]
    Network(String),

    /// Non-transient backend failure
    #[error("Transfer failed: {0}")]
    Transfer(String),

    /// Invalid key or key/path mapping
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Several independent failures from a multi-item operation
    #[error("{0}")]
    Multiple(MultiError),
}

impl Error {
    /// Wrap an error with a short description of what was being attempted.
    ///
    /// Only message-carrying variants are rewritten; the variant itself is
    /// preserved so callers can keep matching on it.
    pub fn context(self, what: impl fmt::Display) -> Self {
        match self {
            Error::NotFound(msg) => Error::NotFound(format!("{what}: {msg}")),
            Error::AlreadyExists(msg) => Error::AlreadyExists(format!("{what}: {msg}")),
            Error::PermissionDenied(msg) => Error::PermissionDenied(format!("{what}: {msg}")),
            Error::Integrity(msg) => Error::Integrity(format!("{what}: {msg}")),
            Error::Network(msg) => Error::Network(format!("{what}: {msg}")),
            Error::Transfer(msg) => Error::Transfer(format!("{what}: {msg}")),
            Error::InvalidKey(msg) => Error::InvalidKey(format!("{what}: {msg}")),
            Error::Config(msg) => Error::Config(format!("{what}: {msg}")),
            Error::Io(e) => Error::Io(std::io::Error::new(e.kind(), format!("{what}: {e}"))),
            other => other,
        }
    }

    /// Returns true if this is a not-found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
            || matches!(self, Error::Io(e) if e.kind() == std::io::ErrorKind::NotFound)
    }

    /// Returns true if this error, or every error it aggregates, is a cancellation
    pub fn is_canceled(&self) -> bool {
        match self {
            Error::Canceled => true,
            Error::Multiple(multi) => multi.errors().iter().all(Error::is_canceled),
            _ => false,
        }
    }

    /// Flatten into the list of underlying errors
    pub fn into_errors(self) -> Vec<Error> {
        match self {
            Error::Multiple(multi) => multi.errors,
            other => vec![other],
        }
    }
}

/// Aggregate of errors from a multi-item operation
#[derive(Debug, Default)]
pub struct MultiError {
    errors: Vec<Error>,
}

impl MultiError {
    pub fn errors(&self) -> &[Error] {
        &self.errors
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} errors occurred", self.errors.len())?;
        for err in &self.errors {
            write!(f, "; {err}")?;
        }
        Ok(())
    }
}

/// Collects errors from concurrent workers and resolves them into one result
///
/// Cloning shares the same underlying list, so every worker task can hold its
/// own handle.
#[derive(Debug, Clone, Default)]
pub struct ErrorCollector {
    errors: std::sync::Arc<std::sync::Mutex<Vec<Error>>>,
}

impl ErrorCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, err: Error) {
        let mut errors = self.errors.lock().unwrap_or_else(|p| p.into_inner());
        match err {
            Error::Multiple(multi) => errors.extend(multi.errors),
            other => errors.push(other),
        }
    }

    /// Record the error of a result, if any
    pub fn check<T>(&self, result: Result<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                self.add(e);
                None
            }
        }
    }

    pub fn has_errors(&self) -> bool {
        !self
            .errors
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drain the collected errors into a single result
    ///
    /// No errors resolves to `Ok(())`, exactly one error is returned as is,
    /// anything more becomes [`Error::Multiple`].
    pub fn resolve(&self) -> Result<()> {
        let mut errors =
            std::mem::take(&mut *self.errors.lock().unwrap_or_else(|p| p.into_inner()));
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Error::Multiple(MultiError { errors })),
        }
    }
}
