//! Entry points for request handlers: job submission and run status queries.
//!
//! Admission refuses a job while one of the same kind is running or already admitted. The queue
//! itself does no admission control; it only serializes execution.

use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::context::OrchestratorContext;
use crate::error::{AdmissionError, StatusError};
use crate::queue::TaskQueue;
use crate::registry::{RunDetails, RunStatus};
use crate::{ErpImportSettings, JobKind, SdsSyncSettings, TaskRequest};

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErpImportSubmission {
    pub project_id: String,
    #[serde(default)]
    pub force_full_import: Option<bool>,
    #[serde(default)]
    pub part_of_sds_sync: Option<bool>,
    #[serde(default)]
    pub add_cooldown_period: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SdsSyncSubmission {
    pub project_id: String,
    #[serde(default)]
    pub combined_with_erp_import: Option<bool>,
}

#[derive(Clone)]
pub struct Admission {
    ctx: Arc<OrchestratorContext>,
    queue: TaskQueue,
}

fn validate_project_id(project_id: &str) -> Result<String, AdmissionError> {
    let project_id = project_id.trim();
    if project_id.is_empty() {
        return Err(AdmissionError::InvalidInput(
            "projectId must not be empty".to_string(),
        ));
    }
    if !project_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(AdmissionError::InvalidInput(format!(
            "projectId '{project_id}' contains invalid characters"
        )));
    }
    Ok(project_id.to_string())
}

impl Admission {
    pub fn new(ctx: Arc<OrchestratorContext>, queue: TaskQueue) -> Self {
        Admission { ctx, queue }
    }

    fn ensure_idle(&self, kind: JobKind) -> Result<(), AdmissionError> {
        if self.ctx.state.is_running(kind) || self.ctx.registry.has_current(kind) {
            debug!(message = "Refusing submission", kind = %kind);
            return Err(AdmissionError::AlreadyRunning(kind));
        }
        Ok(())
    }

    fn claim(&self, request: &TaskRequest) -> Result<(), AdmissionError> {
        let kind = request.kind();
        self.ensure_idle(kind)?;
        self.ctx
            .registry
            .register(RunDetails::new(kind, request.run_id(), request.project_id()))
    }

    /// Claims the slot of every request before enqueueing any of them. On failure nothing stays
    /// admitted, and tasks that already made it into the queue are withdrawn.
    fn admit_all(&self, requests: Vec<TaskRequest>) -> Result<Vec<Uuid>, AdmissionError> {
        let run_ids: Vec<Uuid> = requests.iter().map(TaskRequest::run_id).collect();

        for (claimed, request) in requests.iter().enumerate() {
            if let Err(err) = self.claim(request) {
                run_ids[..claimed].iter().for_each(|id| {
                    self.ctx.registry.remove(*id);
                });
                return Err(err);
            }
        }

        for (queued, request) in requests.into_iter().enumerate() {
            let kind = request.kind();
            if let Err(err) = self.queue.enqueue(request) {
                run_ids[..queued]
                    .iter()
                    .for_each(|id| self.ctx.registry.withdraw(*id));
                run_ids[queued..].iter().for_each(|id| {
                    self.ctx.registry.remove(*id);
                });
                return Err(err);
            }
            info!(message = "Admitted job", kind = %kind, run_id = %run_ids[queued]);
        }
        Ok(run_ids)
    }

    fn admit(&self, request: TaskRequest) -> Result<Uuid, AdmissionError> {
        let run_id = request.run_id();
        self.admit_all(vec![request])?;
        Ok(run_id)
    }

    pub fn submit_erp_import(&self, submission: ErpImportSubmission) -> Result<Uuid, AdmissionError> {
        let project_id = validate_project_id(&submission.project_id)?;
        self.admit(TaskRequest::ErpImport(ErpImportSettings {
            force_full_import: submission.force_full_import.unwrap_or(false),
            part_of_sds_sync: submission.part_of_sds_sync.unwrap_or(false),
            add_cooldown_period: submission.add_cooldown_period.unwrap_or(false),
            ..ErpImportSettings::new(project_id)
        }))
    }

    pub fn submit_sds_sync(&self, submission: SdsSyncSubmission) -> Result<Uuid, AdmissionError> {
        let project_id = validate_project_id(&submission.project_id)?;
        self.admit(TaskRequest::SdsSync(SdsSyncSettings {
            combined_with_erp_import: submission.combined_with_erp_import.unwrap_or(false),
            ..SdsSyncSettings::new(project_id)
        }))
    }

    /// Queues an ERP import followed by an SDS sync that continues its progress bar. Either both
    /// are admitted or neither is.
    pub fn submit_combined_sync(&self, project_id: &str) -> Result<(Uuid, Uuid), AdmissionError> {
        let project_id = validate_project_id(project_id)?;
        let import = ErpImportSettings {
            part_of_sds_sync: true,
            add_cooldown_period: true,
            ..ErpImportSettings::new(project_id.clone())
        };
        let sync = SdsSyncSettings {
            combined_with_erp_import: true,
            ..SdsSyncSettings::new(project_id)
        };
        let ids = (import.run_id, sync.run_id);

        self.admit_all(vec![TaskRequest::ErpImport(import), TaskRequest::SdsSync(sync)])?;
        Ok(ids)
    }

    pub fn status(&self, kind: JobKind) -> Result<RunStatus, StatusError> {
        self.ctx.registry.status(kind)
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }
}
