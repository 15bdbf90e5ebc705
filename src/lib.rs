use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub mod admission;
pub mod config;
pub mod context;
pub mod dataset;
pub mod db;
pub mod erp_import;
pub mod error;
pub mod import_service;
pub mod notify;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod sds_sync;
pub mod state;
pub mod telemetry;

use crate::context::OrchestratorContext;
use crate::error::JobError;

/// The two kinds of background job the orchestrator knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    ErpImport,
    SdsSync,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::ErpImport => "erp_import",
            JobKind::SdsSync => "sds_sync",
        }
    }

    /// Name of the live-update channel that notifications for this kind are pushed on.
    pub fn channel(&self) -> &'static str {
        match self {
            JobKind::ErpImport => "erpimportstatus",
            JobKind::SdsSync => "sdssyncstatus",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::ErpImport => write!(f, "ERP import"),
            JobKind::SdsSync => write!(f, "SDS sync"),
        }
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "erp_import" => Ok(JobKind::ErpImport),
            "sds_sync" => Ok(JobKind::SdsSync),
            _ => Err(format!("Invalid job kind: {s}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErpImportSettings {
    pub run_id: Uuid,
    pub project_id: String,
    pub force_full_import: bool,
    pub part_of_sds_sync: bool,
    pub add_cooldown_period: bool,
}

impl ErpImportSettings {
    pub fn new(project_id: impl Into<String>) -> Self {
        ErpImportSettings {
            run_id: Uuid::new_v4(),
            project_id: project_id.into(),
            force_full_import: false,
            part_of_sds_sync: false,
            add_cooldown_period: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SdsSyncSettings {
    pub run_id: Uuid,
    pub project_id: String,
    pub combined_with_erp_import: bool,
}

impl SdsSyncSettings {
    pub fn new(project_id: impl Into<String>) -> Self {
        SdsSyncSettings {
            run_id: Uuid::new_v4(),
            project_id: project_id.into(),
            combined_with_erp_import: false,
        }
    }
}

/// A queued unit of work. Immutable once enqueued and consumed exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskRequest {
    ErpImport(ErpImportSettings),
    SdsSync(SdsSyncSettings),
}

impl TaskRequest {
    pub fn run_id(&self) -> Uuid {
        match self {
            TaskRequest::ErpImport(settings) => settings.run_id,
            TaskRequest::SdsSync(settings) => settings.run_id,
        }
    }

    pub fn project_id(&self) -> &str {
        match self {
            TaskRequest::ErpImport(settings) => &settings.project_id,
            TaskRequest::SdsSync(settings) => &settings.project_id,
        }
    }

    pub fn kind(&self) -> JobKind {
        match self {
            TaskRequest::ErpImport(_) => JobKind::ErpImport,
            TaskRequest::SdsSync(_) => JobKind::SdsSync,
        }
    }

    /// Runs the job to completion. Failures are already recorded on the run by the time the
    /// error is returned; the caller only needs it for reporting.
    pub async fn execute(self, ctx: &OrchestratorContext) -> Result<(), JobError> {
        match self {
            TaskRequest::ErpImport(settings) => erp_import::run(ctx, settings).await,
            TaskRequest::SdsSync(settings) => sds_sync::run(ctx, settings).await,
        }
    }
}
