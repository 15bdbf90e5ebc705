use thiserror::Error;

use crate::JobKind;

/// Reasons a submission is refused before anything is enqueued.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("{0} is already in progress")]
    AlreadyRunning(JobKind),

    #[error("invalid submission: {0}")]
    InvalidInput(String),

    #[error("task queue is closed")]
    QueueClosed,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum StatusError {
    #[error("no {0} is currently running")]
    NotRunning(JobKind),
}

/// Configuration problems while deriving the import window for a project.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DatasetError {
    #[error("unsupported report type '{0}'")]
    UnsupportedReportType(String),

    #[error("project id '{project_id}' does not match the {report_type} naming scheme")]
    UnparseableProjectId {
        project_id: String,
        report_type: String,
    },

    #[error("invalid reporting period: {0}")]
    InvalidPeriod(String),
}

#[derive(Error, Debug)]
pub enum ImportServiceError {
    #[error("import service request failed: {0}")]
    HttpRequest(#[from] reqwest::Error),

    #[error("invalid import service url: {0}")]
    InvalidUrl(String),
}

/// Terminal failures of a run. Every variant ends the run as failed.
#[derive(Error, Debug)]
pub enum JobError {
    #[error("project id is missing")]
    MissingProject,

    #[error("no report type configured for project '{0}'")]
    UnknownProject(String),

    #[error(transparent)]
    Configuration(#[from] DatasetError),

    #[error("Failed to start the EFR import process.")]
    StartFailed,

    #[error("EFR import progress could not be retrieved {0} times in a row, giving up")]
    PollingFailed(u32),

    #[error("EFR import did not finish within {0} minutes")]
    TimedOut(u64),

    #[error("SDS synchronization failed: {0}")]
    Sync(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("job panicked: {0}")]
    Panicked(String),
}
