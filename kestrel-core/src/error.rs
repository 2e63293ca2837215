//! Error types for the Kestrel control plane
//!
//! Every error carries a stable string code (`KestrelError::code`) that is
//! surfaced verbatim through the API and recorded on VM rows by the
//! reconciler. Transient driver and storage failures are distinguished from
//! terminal ones so retry loops can decide without matching on message text.

use thiserror::Error;

/// Comprehensive error type for all Kestrel operations
#[derive(Error, Debug)]
pub enum KestrelError {
    #[error("Invalid input for {field}: {message}")]
    Validation { field: String, message: String },

    #[error("Resource not found: {resource}")]
    NotFound { resource: String },

    #[error("Conflict on {resource}: {message}")]
    Conflict { resource: String, message: String },

    #[error("Already exists: {resource}")]
    AlreadyExists { resource: String },

    #[error("Resource exhausted: {resource}")]
    Exhausted { resource: String },

    #[error("Insufficient capacity: {message}")]
    InsufficientCapacity { message: String },

    #[error("Driver for host {host} unavailable: {message}")]
    DriverUnavailable { host: String, message: String },

    #[error("Driver verb '{verb}' timed out after {duration:?}")]
    DriverTimeout {
        verb: String,
        duration: std::time::Duration,
    },

    #[error("Driver verb '{verb}' failed terminally: {message}")]
    DriverTerminal { verb: String, message: String },

    #[error("Storage unavailable: {operation} failed")]
    StorageUnavailable {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Unauthorized: {message}")]
    Unauthorized { message: String },

    #[error("Unsupported architecture: {arch}")]
    UnsupportedArch { arch: String },

    #[error("Serialization operation '{operation}' failed")]
    Serialization {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("IO error: {0}")]
    Io(#[from] Box<std::io::Error>),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

pub type Result<T> = std::result::Result<T, KestrelError>;
pub type KestrelResult<T> = std::result::Result<T, KestrelError>;

impl KestrelError {
    /// Stable string code surfaced through the API error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            KestrelError::Validation { .. } => "validation",
            KestrelError::NotFound { .. } => "not_found",
            KestrelError::Conflict { .. } | KestrelError::AlreadyExists { .. } => "conflict",
            KestrelError::Exhausted { .. } | KestrelError::InsufficientCapacity { .. } => {
                "exhausted"
            }
            KestrelError::DriverUnavailable { .. } => "driver_unavailable",
            KestrelError::DriverTimeout { .. } => "driver_timeout",
            KestrelError::DriverTerminal { .. } => "driver_terminal",
            KestrelError::StorageUnavailable { .. } => "storage_unavailable",
            KestrelError::Unauthorized { .. } => "unauthorized",
            KestrelError::UnsupportedArch { .. } => "unsupported_arch",
            KestrelError::Serialization { .. }
            | KestrelError::Io(_)
            | KestrelError::Internal { .. } => "internal",
        }
    }

    /// Whether a reconciler step hitting this error may be retried in place.
    ///
    /// Terminal errors park the VM in `error`; everything else backs off and
    /// retries up to the step budget.
    pub fn is_retryable(&self) -> bool {
        match self {
            KestrelError::DriverUnavailable { .. }
            | KestrelError::DriverTimeout { .. }
            | KestrelError::Io(_) => true,
            KestrelError::StorageUnavailable { .. } => true,
            _ => false,
        }
    }

    /// Create a Validation error
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        KestrelError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a NotFound error
    pub fn not_found(resource: impl Into<String>) -> Self {
        KestrelError::NotFound {
            resource: resource.into(),
        }
    }

    /// Create a Conflict error
    pub fn conflict(resource: impl Into<String>, message: impl Into<String>) -> Self {
        KestrelError::Conflict {
            resource: resource.into(),
            message: message.into(),
        }
    }

    /// Create an Internal error
    pub fn internal(message: impl Into<String>) -> Self {
        KestrelError::Internal {
            message: message.into(),
        }
    }

    /// Create a StorageUnavailable error with a boxed source
    pub fn storage<E: std::error::Error + Send + Sync + 'static>(
        operation: impl Into<String>,
        source: E,
    ) -> Self {
        KestrelError::StorageUnavailable {
            operation: operation.into(),
            source: Box::new(source),
        }
    }

    /// Create a Serialization error with a boxed source
    pub fn serialization<E: std::error::Error + Send + Sync + 'static>(
        operation: impl Into<String>,
        source: E,
    ) -> Self {
        KestrelError::Serialization {
            operation: operation.into(),
            source: Box::new(source),
        }
    }

    /// Create a DriverTerminal error
    pub fn driver_terminal(verb: impl Into<String>, message: impl Into<String>) -> Self {
        KestrelError::DriverTerminal {
            verb: verb.into(),
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for KestrelError {
    fn from(err: std::io::Error) -> Self {
        KestrelError::Io(Box::new(err))
    }
}

impl From<redb::TransactionError> for KestrelError {
    fn from(err: redb::TransactionError) -> Self {
        KestrelError::storage("transaction", err)
    }
}

impl From<redb::TableError> for KestrelError {
    fn from(err: redb::TableError) -> Self {
        KestrelError::storage("open table", err)
    }
}

impl From<redb::StorageError> for KestrelError {
    fn from(err: redb::StorageError) -> Self {
        KestrelError::storage("storage", err)
    }
}

impl From<redb::DatabaseError> for KestrelError {
    fn from(err: redb::DatabaseError) -> Self {
        KestrelError::storage("open database", err)
    }
}

impl From<redb::CommitError> for KestrelError {
    fn from(err: redb::CommitError) -> Self {
        KestrelError::storage("commit", err)
    }
}

impl From<bincode::Error> for KestrelError {
    fn from(err: bincode::Error) -> Self {
        KestrelError::serialization("bincode", err)
    }
}
