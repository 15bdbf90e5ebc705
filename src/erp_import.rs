//! ERP import state machine.
//!
//! `Idle -> Starting -> Polling -> (Succeeded | Failed | TimedOut) -> Done`
//!
//! A run asks the import service to start loading the datasets of the project's reporting
//! period, then polls the service until it reports nothing left to import, the consecutive
//! failure budget is spent, or the polling budget runs out.

use std::fmt;
use std::future::Future;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tracing::*;
use uuid::Uuid;

use crate::context::OrchestratorContext;
use crate::dataset::import_window;
use crate::error::JobError;
use crate::import_service::StartRequest;
use crate::state::RunningGuard;
use crate::{ErpImportSettings, JobKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportState {
    Idle,
    Starting,
    Polling,
    Succeeded,
    Failed(String),
    TimedOut(String),
    Done,
}

impl ImportState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed(_) | Self::TimedOut(_) | Self::Done
        )
    }
}

impl fmt::Display for ImportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Starting => write!(f, "starting"),
            Self::Polling => write!(f, "polling"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed(_) => write!(f, "failed"),
            Self::TimedOut(_) => write!(f, "timed_out"),
            Self::Done => write!(f, "done"),
        }
    }
}

/// Progress bookkeeping for the polling phase.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PollTracker {
    total: Option<u64>,
    completed: u64,
    part_of_sds_sync: bool,
}

/// What a single successful progress reply means for the run.
#[derive(Debug, Clone, PartialEq)]
pub struct PollUpdate {
    pub progress: f64,
    pub advanced_to: Option<u64>,
    pub finished: bool,
}

impl PollTracker {
    pub fn new(part_of_sds_sync: bool) -> Self {
        PollTracker {
            part_of_sds_sync,
            ..Default::default()
        }
    }

    pub fn total(&self) -> Option<u64> {
        self.total
    }

    /// Folds in a "remaining datasets" count. The first non-zero count becomes the total.
    pub fn observe(&mut self, remaining: u64) -> PollUpdate {
        let scale = if self.part_of_sds_sync { 0.5 } else { 1.0 };

        if remaining == 0 {
            return PollUpdate {
                progress: scale,
                advanced_to: None,
                finished: true,
            };
        }

        let total = *self.total.get_or_insert(remaining);
        let completed = total.saturating_sub(remaining);
        let advanced_to = (completed > self.completed).then(|| {
            self.completed = completed;
            completed
        });

        PollUpdate {
            progress: completed as f64 / total as f64 * scale,
            advanced_to,
            finished: false,
        }
    }
}

struct ErpImport<'a> {
    ctx: &'a OrchestratorContext,
    settings: ErpImportSettings,
    state: ImportState,
    running: Option<RunningGuard<'a>>,
    /// Start of execution plus the polling budget. Bounds every external call of the run.
    deadline: Instant,
}

impl<'a> ErpImport<'a> {
    fn new(ctx: &'a OrchestratorContext, settings: ErpImportSettings) -> Self {
        ErpImport {
            ctx,
            settings,
            state: ImportState::Idle,
            running: None,
            deadline: Instant::now() + ctx.config.poll_budget,
        }
    }

    fn run_id(&self) -> Uuid {
        self.settings.run_id
    }

    fn transition(&mut self, next: ImportState) {
        debug!(message = "ERP import transition", run_id = %self.run_id(), from = %self.state, to = %next);
        self.state = next;
    }

    fn log(&self, line: impl Into<String>) {
        self.ctx.registry.add_log(self.run_id(), line);
    }

    fn timed_out(&self) -> JobError {
        JobError::TimedOut(self.ctx.config.poll_budget.as_secs() / 60)
    }

    /// Awaits an external call, giving up once the run's deadline has passed.
    async fn within_budget<T>(&self, call: impl Future<Output = T>) -> Result<T, JobError> {
        let left = self.deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return Err(self.timed_out());
        }
        timeout(left, call).await.map_err(|_| {
            warn!(message = "External call outlived the polling budget", run_id = %self.run_id());
            self.timed_out()
        })
    }

    async fn execute(&mut self) -> Result<(), JobError> {
        self.transition(ImportState::Starting);
        let request = self.prepare()?;
        self.start(&request).await?;

        self.transition(ImportState::Polling);
        self.poll().await?;

        self.transition(ImportState::Succeeded);
        Ok(())
    }

    fn prepare(&self) -> Result<StartRequest, JobError> {
        let project_id = self.settings.project_id.trim();
        if project_id.is_empty() {
            return Err(JobError::MissingProject);
        }
        let report_type = self
            .ctx
            .catalog
            .report_type(project_id)
            .ok_or_else(|| JobError::UnknownProject(project_id.to_string()))?;

        let window = import_window(
            &report_type,
            project_id,
            self.ctx.today(),
            self.ctx.calendar.as_ref(),
        )?;

        Ok(StartRequest {
            dataset_pattern: window.dataset_pattern,
            start_date: window.start_date,
            full_update: self.settings.force_full_import,
        })
    }

    async fn start(&mut self, request: &StartRequest) -> Result<(), JobError> {
        self.log(format!(
            "Starting EFR import of '{}' from {}{}",
            request.dataset_pattern,
            request.start_date,
            if request.full_update { " (full update)" } else { "" }
        ));

        match self
            .within_budget(self.ctx.import_service.start(request))
            .await?
        {
            Ok(response) if response.is_success() => {}
            Ok(response) => {
                warn!(message = "Import service refused to start", run_id = %self.run_id(), status = response.status);
                return Err(JobError::StartFailed);
            }
            Err(err) => {
                warn!(message = "Import service start call failed", run_id = %self.run_id(), error = %err);
                return Err(JobError::StartFailed);
            }
        }

        self.running = Some(
            self.ctx
                .state
                .running(JobKind::ErpImport, &self.settings.project_id),
        );
        self.log("EFR import process started");
        Ok(())
    }

    async fn poll(&mut self) -> Result<(), JobError> {
        let config = &self.ctx.config;
        let mut tracker = PollTracker::new(self.settings.part_of_sds_sync);
        let mut failures = 0u32;

        while Instant::now() < self.deadline {
            let remaining = match self
                .within_budget(self.ctx.import_service.progress())
                .await?
            {
                Ok(response) if response.is_success() => response.remaining_datasets(),
                Ok(response) => {
                    warn!(message = "Import progress request failed", run_id = %self.run_id(), status = response.status);
                    None
                }
                Err(err) => {
                    warn!(message = "Import progress request failed", run_id = %self.run_id(), error = %err);
                    None
                }
            };

            match remaining {
                Some(remaining) => {
                    failures = 0;
                    let update = tracker.observe(remaining);
                    self.ctx.registry.set_progress(self.run_id(), update.progress);
                    if let (Some(completed), Some(total)) = (update.advanced_to, tracker.total()) {
                        self.log(format!("Imported {completed} of {total} datasets"));
                    }
                    if update.finished {
                        return Ok(());
                    }
                }
                None => {
                    failures += 1;
                    if failures >= config.failure_budget {
                        return Err(JobError::PollingFailed(failures));
                    }
                }
            }

            sleep_until((Instant::now() + config.poll_interval).min(self.deadline)).await;
        }

        Err(self.timed_out())
    }

    async fn finish(&mut self, outcome: &Result<(), JobError>) {
        match outcome {
            Ok(()) => {
                self.log("EFR import finished successfully");
                if self.settings.add_cooldown_period && !self.ctx.config.cooldown.is_zero() {
                    self.log("Waiting for downstream systems to pick up the imported data");
                    sleep(self.ctx.config.cooldown).await;
                }
            }
            Err(err) => {
                let message = err.to_string();
                self.log(message.clone());
                match err {
                    JobError::TimedOut(_) => self.transition(ImportState::TimedOut(message)),
                    _ => self.transition(ImportState::Failed(message)),
                }
            }
        }

        self.ctx.finalize_run(self.run_id(), outcome.is_ok()).await;
        self.running = None;
        self.transition(ImportState::Done);
    }
}

#[instrument(skip(ctx, settings), fields(run_id = %settings.run_id, project_id = %settings.project_id))]
pub async fn run(ctx: &OrchestratorContext, settings: ErpImportSettings) -> Result<(), JobError> {
    ctx.ensure_registered(JobKind::ErpImport, settings.run_id, &settings.project_id);

    let mut import = ErpImport::new(ctx, settings);
    let outcome = import.execute().await;
    match &outcome {
        Ok(()) => info!("ERP import succeeded"),
        Err(err) => error!(message = "ERP import failed", error = %err),
    }
    import.finish(&outcome).await;
    outcome
}
