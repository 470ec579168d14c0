//! Custom error types for the application.
//!
//! This module defines the primary error type, `MesuraError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the different kinds of errors that can occur while polling sources and persisting
//! their readings.
//!
//! ## Error Hierarchy
//!
//! `MesuraError` variants fall into four categories (see [`ErrorCategory`]):
//!
//! - **Configuration**: `Config`, `Configuration`, `InvalidInterval` and
//!   `MissingCredential`. These are detected at startup and are the only errors that
//!   keep a source from being scheduled.
//! - **Fetch**: `Fetch`, `Http` and `Authentication`. Raised by monitors while talking
//!   to a provider. The polling controller retries them after a short backoff.
//! - **Storage**: `Storage`, `Sqlite`, `Csv` and `Io`. Raised while inspecting,
//!   altering or appending to a destination. Backends log and swallow them per write.
//! - **Runtime**: `Task` and `AlreadyStarted`, for scheduler and controller misuse.
//!
//! By using `#[from]`, `MesuraError` can be created from the underlying library
//! errors with the `?` operator.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, MesuraError>;

/// Coarse classification used by the controller to decide how to react.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Invalid or incomplete configuration; fatal for the affected source.
    Configuration,
    /// Transient provider failure; retried with backoff.
    Fetch,
    /// Destination failure; logged and swallowed per write.
    Storage,
    /// Task management failures.
    Runtime,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ErrorCategory::Configuration => "configuration",
            ErrorCategory::Fetch => "fetch",
            ErrorCategory::Storage => "storage",
            ErrorCategory::Runtime => "runtime",
        };
        write!(f, "{}", label)
    }
}

/// Primary error type for mesura.
#[derive(Error, Debug)]
pub enum MesuraError {
    /// Configuration sources could not be merged or deserialized.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Configuration parsed but is semantically invalid.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// A polling interval string was rejected.
    #[error("Invalid interval '{input}': {reason}")]
    InvalidInterval {
        /// The string as supplied by the user.
        input: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A source needs a credential that was not supplied.
    #[error("Missing credential for source '{source_name}': set {hint}")]
    MissingCredential {
        /// Source that cannot be scheduled.
        source_name: String,
        /// Configuration key or environment variable to set.
        hint: String,
    },

    /// A provider answered with something unusable.
    #[error("Fetch error from '{source_name}': {message}")]
    Fetch {
        /// Source being polled.
        source_name: String,
        /// Description of the failure.
        message: String,
    },

    /// Transport or status failure of an HTTP request.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// A provider rejected our credentials or token.
    #[error("Authentication failed for '{source_name}': {message}")]
    Authentication {
        /// Source being polled.
        source_name: String,
        /// Description of the failure.
        message: String,
    },

    /// Generic destination failure.
    #[error("Storage error: {0}")]
    Storage(String),

    /// SQLite driver failure.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// CSV encoding or file failure.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A spawned task panicked or was aborted.
    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// `run` was called on a controller that already left the idle state.
    #[error("Controller '{0}' has already been started")]
    AlreadyStarted(String),
}

impl MesuraError {
    /// Shorthand for a [`MesuraError::Fetch`].
    pub fn fetch(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Fetch {
            source_name: source_name.into(),
            message: message.into(),
        }
    }

    /// Shorthand for a [`MesuraError::InvalidInterval`].
    pub fn invalid_interval(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidInterval {
            input: input.into(),
            reason: reason.into(),
        }
    }

    /// Returns the category this error belongs to.
    pub fn category(&self) -> ErrorCategory {
        match self {
            MesuraError::Config(_)
            | MesuraError::Configuration(_)
            | MesuraError::InvalidInterval { .. }
            | MesuraError::MissingCredential { .. } => ErrorCategory::Configuration,
            MesuraError::Fetch { .. }
            | MesuraError::Http(_)
            | MesuraError::Authentication { .. } => ErrorCategory::Fetch,
            MesuraError::Storage(_)
            | MesuraError::Sqlite(_)
            | MesuraError::Csv(_)
            | MesuraError::Io(_) => ErrorCategory::Storage,
            MesuraError::Task(_) | MesuraError::AlreadyStarted(_) => ErrorCategory::Runtime,
        }
    }

    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Fetch | ErrorCategory::Storage
        )
    }
}
