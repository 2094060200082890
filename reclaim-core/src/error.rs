//! Stage-level error type. Every stage worker returns `Result<(), StageError>`;
//! the orchestrator is responsible for turning a `StageError` into a durable
//! `FileRecord` transition plus a log line, never for propagating it further.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StageError {
    #[error("source file not found: {0}")]
    SourceNotFound(String),

    #[error("staging budget exceeded, retry later")]
    StagingBudgetExceeded,

    #[error("free space below configured floor, retry later")]
    FreeSpaceFloor,

    #[error("fetch buffer budget exceeded, retry later")]
    FetchBufferExceeded,

    #[error("destination already exists and overwrite is disabled")]
    DestinationExists,

    #[error("encoder exited with status {status}, stderr tail:\n{stderr_tail}")]
    EncoderFailed { status: i32, stderr_tail: String },

    #[error("remux failed, stderr tail:\n{stderr_tail}")]
    RemuxFailed { stderr_tail: String },

    #[error(
        "duration mismatch: source {source_secs:.1}s vs output {output_secs:.1}s (tolerance {tolerance:.1}s)"
    )]
    DurationMismatch {
        source_secs: f64,
        output_secs: f64,
        tolerance: f64,
    },

    #[error("replace protocol failed at step {step}: {detail}")]
    ReplaceFailed { step: &'static str, detail: String },

    #[error("probe failed: {0}")]
    ProbeFailed(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl StageError {
    /// A transient condition the prefetch/orchestrator should retry rather
    /// than surface as an ERROR record.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            StageError::StagingBudgetExceeded
                | StageError::FreeSpaceFloor
                | StageError::FetchBufferExceeded
        )
    }

    /// The stage name recorded on the FileRecord, matching the taxonomy in
    /// the error handling design (fetch/encode/upload/verify/replace).
    pub fn stage_name(&self) -> &'static str {
        match self {
            StageError::SourceNotFound(_)
            | StageError::StagingBudgetExceeded
            | StageError::FreeSpaceFloor
            | StageError::FetchBufferExceeded => "fetch",
            StageError::DestinationExists => "upload",
            StageError::EncoderFailed { .. } | StageError::RemuxFailed { .. } => "encode",
            StageError::DurationMismatch { .. } | StageError::ProbeFailed(_) => "verify",
            StageError::ReplaceFailed { .. } => "replace",
            StageError::Io(_) => "io",
            StageError::Other(_) => "io",
        }
    }
}
