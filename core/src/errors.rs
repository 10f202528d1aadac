use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Log source error: {0}")]
    Source(#[from] SourceError),

    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializationError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Generic error: {0}")]
    Generic(#[from] anyhow::Error),
}

#[derive(Error, Debug)]
pub enum SourceError {
    /// The consumer group fell behind the retention horizon. Records between the
    /// committed position and the earliest retained offset are gone for good.
    #[error(
        "partition {partition} group {group}: offset {requested} is past retention (earliest retained {earliest})"
    )]
    RetentionExceeded {
        partition: u32,
        group: String,
        requested: u64,
        earliest: u64,
    },

    #[error("partition {partition} does not exist (log has {partition_count})")]
    UnknownPartition { partition: u32, partition_count: u32 },

    #[error("read cancelled")]
    Cancelled,

    #[error("Failed to connect or communicate with the source")]
    Connection {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Unrecoverable error from the source")]
    Unrecoverable(#[source] Box<dyn std::error::Error + Send + Sync>),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Configuration validation failed: {reason}")]
    ValidationFailed { reason: String },

    #[error("Failed to load configuration from {origin}: {error}")]
    LoadFailed {
        origin: String,
        #[source]
        error: Box<dyn std::error::Error + Send + Sync>,
    },
}

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("unknown sink '{sink}'")]
    UnknownSink { sink: String },

    #[error("write to sink '{sink}' failed: {reason}")]
    Write { sink: String, reason: String },

    #[error("sink '{sink}' still failing after {attempts} attempts: {reason}")]
    RetriesExhausted {
        sink: String,
        attempts: u32,
        reason: String,
    },

    #[error("{failures} consecutive sink failures exceed the ceiling of {ceiling}")]
    CeilingExceeded { failures: u32, ceiling: u32 },
}

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("Failed to load checkpoint for partition {partition} group {group}: {reason}")]
    Load {
        partition: u32,
        group: String,
        reason: String,
    },

    #[error("Failed to commit checkpoint for partition {partition} group {group}: {reason}")]
    Commit {
        partition: u32,
        group: String,
        reason: String,
    },
}

/// Why an ingress record could not become an [`crate::event::Event`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EventError {
    #[error("invalid JSON: {reason}")]
    Parse { reason: String },

    #[error("validation failed: {}", .errors.join("; "))]
    Validation { errors: Vec<String> },
}

#[derive(Error, Debug)]
pub enum SerializationError {
    #[error("JSON serialization failed: {reason}")]
    Json { reason: String },

    #[error("YAML serialization failed: {reason}")]
    Yaml { reason: String },
}

pub type Result<T> = std::result::Result<T, PipelineError>;

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::Serialization(SerializationError::Json {
            reason: err.to_string(),
        })
    }
}

impl From<serde_yaml::Error> for PipelineError {
    fn from(err: serde_yaml::Error) -> Self {
        PipelineError::Serialization(SerializationError::Yaml {
            reason: err.to_string(),
        })
    }
}

impl PipelineError {
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::Source(SourceError::Connection { .. }) => true,
            PipelineError::Sink(SinkError::Write { .. }) => true,
            PipelineError::Checkpoint(CheckpointError::Commit { .. }) => true,
            PipelineError::Io(_) => true,
            PipelineError::Config(_) => false,
            PipelineError::Serialization(_) => false,
            _ => false,
        }
    }

    /// Fatal errors stop the pipeline for its consumer group and need an operator.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PipelineError::Source(SourceError::RetentionExceeded { .. })
                | PipelineError::Source(SourceError::Unrecoverable(_))
                | PipelineError::Sink(SinkError::RetriesExhausted { .. })
                | PipelineError::Sink(SinkError::CeilingExceeded { .. })
                | PipelineError::Config(_)
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, PipelineError::Source(SourceError::Cancelled))
    }
}
