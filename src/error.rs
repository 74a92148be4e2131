//! Error types for the task pool.

use std::path::PathBuf;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Batch error: {0}")]
    Batch(#[from] BatchError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Import error: {0}")]
    Import(#[from] ImportError),
}

/// Caller-visible outcome class of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad startup configuration. Fatal.
    Configuration,
    /// Unknown type, task or batch.
    NotFound,
    /// Duplicate or out-of-order operation. Not retried.
    PreconditionViolated,
    /// Malformed import input. Aborts the current import call.
    ImportFormat,
    /// Per-file IO or decoding failure.
    Io,
    /// Storage failure. Outcome of a mutation is indeterminate.
    Storage,
    /// Optimistic update kept losing. Safe to retry.
    Conflict,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_) => ErrorKind::Configuration,
            Error::Database(e) => e.kind(),
            Error::Batch(e) => e.kind(),
            Error::Task(e) => e.kind(),
            Error::Import(e) => e.kind(),
        }
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Invalid task type registration {type_name:?}: {reason}")]
    InvalidTaskType { type_name: String, reason: String },

    #[error("Task type {0} registered twice")]
    DuplicateTaskType(String),

    #[error("Task type registry already installed")]
    RegistryAlreadyInstalled,

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl DatabaseError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DatabaseError::NotFound { .. } => ErrorKind::NotFound,
            DatabaseError::Constraint(_) => ErrorKind::PreconditionViolated,
            _ => ErrorKind::Storage,
        }
    }
}

/// Batch ledger errors.
#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error("Batch {batch_id} already exists")]
    AlreadyExists { batch_id: String },

    #[error("Batch {batch_id} holds {stored} tasks, cannot add {requested} tasks")]
    TypeMismatch {
        batch_id: String,
        stored: String,
        requested: String,
    },

    #[error("Batch {batch_id} not found")]
    NotFound { batch_id: String },

    #[error("Batch {batch_id} cannot count another closed task ({processed}/{count})")]
    CompletionRefused {
        batch_id: String,
        processed: u64,
        count: u64,
    },

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl BatchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BatchError::AlreadyExists { .. }
            | BatchError::TypeMismatch { .. }
            | BatchError::CompletionRefused { .. } => ErrorKind::PreconditionViolated,
            BatchError::NotFound { .. } => ErrorKind::NotFound,
            BatchError::Database(e) => e.kind(),
        }
    }
}

/// Task allocation errors.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("There is no task type {type_name}")]
    TypeNotFound { type_name: String },

    #[error("Worker {worker} is not eligible for {type_name} tasks")]
    NotEligible { worker: String, type_name: String },

    #[error("Task {task_id} not found")]
    NotFound { task_id: String },

    #[error("Worker {worker} already completed task {task_id}")]
    AlreadyCompleted { worker: String, task_id: String },

    #[error("Worker {worker} already skipped task {task_id}")]
    AlreadySkipped { worker: String, task_id: String },

    #[error("Task {task_id} is closed")]
    Closed { task_id: String },

    #[error("Answer for task {task_id} is invalid: {reason}")]
    InvalidAnswer { task_id: String, reason: String },

    #[error("Task {task_id} still contended after {attempts} attempts")]
    Contention { task_id: String, attempts: u32 },

    #[error(transparent)]
    Batch(#[from] BatchError),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl TaskError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TaskError::TypeNotFound { .. }
            | TaskError::NotEligible { .. }
            | TaskError::NotFound { .. } => ErrorKind::NotFound,
            TaskError::AlreadyCompleted { .. }
            | TaskError::AlreadySkipped { .. }
            | TaskError::Closed { .. }
            | TaskError::InvalidAnswer { .. } => ErrorKind::PreconditionViolated,
            TaskError::Contention { .. } => ErrorKind::Conflict,
            TaskError::Batch(e) => e.kind(),
            TaskError::Database(e) => e.kind(),
        }
    }

    /// True for rejections the caller should answer by fetching a new task.
    pub fn is_precondition_violation(&self) -> bool {
        self.kind() == ErrorKind::PreconditionViolated
    }
}

/// Bulk import errors.
#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    #[error("Malformed record in {source_name} ({unit}): {reason}")]
    Format {
        source_name: String,
        unit: String,
        reason: String,
    },

    #[error("Error while decoding json in {source_name} at line {line}: {reason}")]
    Decode {
        source_name: String,
        line: usize,
        reason: String,
    },

    #[error("Got IO error when reading {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Import worker failed: {0}")]
    Worker(String),

    #[error(transparent)]
    Batch(#[from] BatchError),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl ImportError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ImportError::Format { .. } => ErrorKind::ImportFormat,
            ImportError::Decode { .. } | ImportError::Io { .. } => ErrorKind::Io,
            ImportError::Worker(_) => ErrorKind::Storage,
            ImportError::Batch(e) => e.kind(),
            ImportError::Database(e) => e.kind(),
        }
    }

    /// Errors confined to one input source; the next source is still loaded.
    pub fn is_per_source(&self) -> bool {
        self.kind() == ErrorKind::Io
    }
}

/// Result type alias for the task pool.
pub type Result<T> = std::result::Result<T, Error>;
