//! Error types shared across the pipeline, job and ledger.

use std::path::PathBuf;

use thiserror::Error;

use crate::job::{JobAction, JobState};

/// Failures from decoding, normalizing or cropping images.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    /// The source is not a readable raster image.
    #[error("cannot decode image {source_name}: {reason}")]
    Decode { source_name: String, reason: String },
    /// The selected region does not describe a usable box.
    #[error("invalid region: {0}")]
    InvalidRegion(String),
    /// The requested output canvas has a zero dimension.
    #[error("invalid target size {width}x{height}")]
    InvalidTarget { width: u32, height: u32 },
}

impl PipelineError {
    pub(crate) fn decode(source_name: impl Into<String>, reason: impl ToString) -> Self {
        Self::Decode {
            source_name: source_name.into(),
            reason: reason.to_string(),
        }
    }
}

/// Failure reported by a [`Classifier`](crate::Classifier).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClassificationError {
    /// The model could not produce a label.
    #[error("classifier failed: {0}")]
    Model(String),
    /// The call noticed the cancel token and stopped early.
    #[error("classification abandoned after cancellation")]
    Abandoned,
}

/// Why a job ended up `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobFailure {
    #[error(transparent)]
    Decode(#[from] PipelineError),
    #[error(transparent)]
    Classification(#[from] ClassificationError),
}

/// Rejected requests against the job state machine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    #[error("job {job_id} is still running")]
    AlreadyRunning { job_id: u64 },
    #[error("cannot {action} a job that is {state}")]
    IllegalTransition { action: JobAction, state: JobState },
}

/// Ledger write failures. The in-memory ledger is unchanged when returned.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("failed to persist feedback ledger to {path}: {source}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// A label string outside the closed label set.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown label {0:?}, expected \"Tumor\" or \"No Tumor\"")]
pub struct InvalidLabel(pub String);
