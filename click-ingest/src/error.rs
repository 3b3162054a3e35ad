use common_kafka::SourceError;
use thiserror::Error;

/// Everything that can terminate an ingest run.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("kafka source failed: {0}")]
    Source(#[from] SourceError),

    #[error("object store operation failed: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("failed to encode parquet: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("failed to build record batch: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("failed to (de)serialize json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid storage location {location}: {reason}")]
    InvalidLocation { location: String, reason: String },

    #[error(
        "checkpointed offset {checkpointed} of {topic}:{partition} is no longer available \
         (earliest is {earliest})"
    )]
    DataLoss {
        topic: String,
        partition: i32,
        checkpointed: i64,
        earliest: i64,
    },

    #[error(
        "checkpointed offset {checkpointed} of {topic}:{partition} is past the latest offset \
         {latest}; the topic may have been recreated"
    )]
    OffsetAhead {
        topic: String,
        partition: i32,
        checkpointed: i64,
        latest: i64,
    },

    #[error("another run is writing to checkpoint {0}")]
    ConcurrentRun(String),

    #[error("table at {location} has an incompatible schema: {reason}")]
    SchemaMismatch { location: String, reason: String },

    #[error("corrupt checkpoint entry {path}: {reason}")]
    CorruptCheckpoint { path: String, reason: String },

    #[error("unsupported delta log at {location}: {reason}")]
    UnsupportedLog { location: String, reason: String },

    #[error("gave up committing batch {batch_id} after {attempts} conflicting attempts")]
    CommitConflict { batch_id: u64, attempts: usize },

    #[error("query was stopped while a batch was in flight")]
    Interrupted,
}

pub type Result<T, E = IngestError> = std::result::Result<T, E>;
