use std::io;
use thiserror::Error;

use crate::channel::ChannelViolation;
use crate::table::WorkerId;

/// Unified error type for the fan-out/join coordinator
#[derive(Debug, Error)]
pub enum FanOutError {
    /// A worker could not be started. Fatal for the whole batch.
    #[error("failed to spawn worker {worker} at index {index}: {source}")]
    SpawnFailure {
        index: usize,
        worker: WorkerId,
        #[source]
        source: io::Error,
    },

    /// A fixed-width channel delivered or accepted the wrong number of bytes,
    /// or carried a value it cannot represent.
    #[error("channel contract violated by worker {worker}: {source}")]
    ChannelContractViolation {
        worker: WorkerId,
        #[source]
        source: ChannelViolation,
    },

    /// An OS identity that does not name exactly one worker: unregistered,
    /// or reused while its earlier owner is still unresolved
    #[error("{origin} does not identify a single worker")]
    AttributionAmbiguity { origin: String },

    #[error("worker {0} is not part of this batch")]
    UnknownWorker(WorkerId),

    #[error("worker {0} was already registered")]
    DuplicateWorker(WorkerId),

    #[error("worker {0} was already delivered")]
    AlreadyDelivered(WorkerId),

    #[error("worker {0} has not resolved yet")]
    NotResolved(WorkerId),

    #[error("worker {worker} already resolved")]
    AlreadyResolved { worker: WorkerId },

    /// Every producer hung up while workers were still unresolved
    #[error("completion channel closed with {pending} workers unresolved")]
    ChannelClosed { pending: usize },

    #[error("task not found: {name}")]
    TaskNotFound { name: String },

    #[error("task already registered: {name}")]
    TaskAlreadyRegistered { name: String },

    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    #[error("IO operation failed: {operation}")]
    Io {
        operation: String,
        #[source]
        source: io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl FanOutError {
    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
            field: None,
        }
    }

    /// Create a configuration error naming the offending field
    pub fn configuration_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Configuration {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create an IO error
    pub fn io<S: Into<String>>(operation: S, source: io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    /// True for the two errors that terminate a batch
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::SpawnFailure { .. } | Self::ChannelContractViolation { .. }
        )
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::SpawnFailure { .. } => "spawn",
            Self::ChannelContractViolation { .. } => "channel",
            Self::AttributionAmbiguity { .. } => "attribution",
            Self::UnknownWorker(_)
            | Self::DuplicateWorker(_)
            | Self::AlreadyDelivered(_)
            | Self::NotResolved(_)
            | Self::AlreadyResolved { .. } => "table",
            Self::ChannelClosed { .. } => "join",
            Self::TaskNotFound { .. } | Self::TaskAlreadyRegistered { .. } => "task",
            Self::Configuration { .. } => "configuration",
            Self::Io { .. } => "io",
            Self::Json(_) | Self::Yaml(_) => "serialization",
        }
    }

    /// Process exit code the CLI reports for this error.
    ///
    /// Spawn failure exits with -1 (255 once the OS keeps the low byte).
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::SpawnFailure { .. } => -1,
            Self::ChannelContractViolation { .. } => 2,
            _ => 1,
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, FanOutError>;
