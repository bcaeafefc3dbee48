//! Core of the NeuroScan triage tool: image normalization, the cancellable
//! classification job, and the ledger of user corrections.

pub mod classifier;
pub mod config;
pub mod error;
pub mod job;
pub mod ledger;
pub mod outcome;
pub mod pipeline;

pub use classifier::{CancelToken, Classifier, SimulatedClassifier};
pub use config::{CoreConfig, SimulatorConfig};
pub use error::{
    ClassificationError, ConfigError, InvalidLabel, JobError, JobFailure, LedgerError,
    PipelineError,
};
pub use job::{
    CancelOutcome, ClassificationJob, JobAction, JobController, JobEvent, JobEventSink, JobInput,
    JobSettings, JobSnapshot, JobState, Progress,
};
pub use ledger::{FeedbackEntry, FeedbackLedger, FeedbackStatistics};
pub use outcome::{Label, Outcome};
pub use pipeline::{
    Image, NormalizedImage, Region, TargetSize, crop_region, decode_image, load_image, normalize,
    normalize_to_unit_range,
};
