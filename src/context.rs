//! Everything a job needs while it runs, constructed once and shared by the scheduler,
//! the admission layer and both orchestrators.

use chrono::{Local, NaiveDate, Utc};
use std::sync::Arc;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::dataset::{CalendarYear, ReportingCalendar};
use crate::db::RunStore;
use crate::import_service::ImportService;
use crate::notify::Notifier;
use crate::registry::{RunDetails, RunRegistry};
use crate::sds_sync::SdsSynchronizer;
use crate::state::SystemState;
use crate::JobKind;

/// Resolves the report type (e.g. `quarterly-report`) a project was set up with.
pub trait ProjectCatalog: Send + Sync {
    fn report_type(&self, project_id: &str) -> Option<String>;
}

/// Infers the report type from the project id prefix.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrefixCatalog;

impl ProjectCatalog for PrefixCatalog {
    fn report_type(&self, project_id: &str) -> Option<String> {
        let report_type = if project_id.starts_with("ar") {
            "annual-report"
        } else if project_id.starts_with('q') {
            "quarterly-report"
        } else if project_id.starts_with('m') {
            "monthly-report"
        } else {
            return None;
        };
        Some(report_type.to_string())
    }
}

pub struct OrchestratorContext {
    pub config: OrchestratorConfig,
    pub state: SystemState,
    pub registry: RunRegistry,
    pub import_service: Arc<dyn ImportService>,
    pub synchronizer: Arc<dyn SdsSynchronizer>,
    pub store: Arc<dyn RunStore>,
    pub notifier: Arc<dyn Notifier>,
    pub catalog: Arc<dyn ProjectCatalog>,
    pub calendar: Arc<dyn ReportingCalendar>,
    today: Option<NaiveDate>,
}

pub struct ContextBuilder {
    config: OrchestratorConfig,
    import_service: Arc<dyn ImportService>,
    synchronizer: Arc<dyn SdsSynchronizer>,
    store: Arc<dyn RunStore>,
    notifier: Arc<dyn Notifier>,
    catalog: Arc<dyn ProjectCatalog>,
    calendar: Arc<dyn ReportingCalendar>,
    today: Option<NaiveDate>,
}

impl ContextBuilder {
    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn catalog(mut self, catalog: Arc<dyn ProjectCatalog>) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn calendar(mut self, calendar: Arc<dyn ReportingCalendar>) -> Self {
        self.calendar = calendar;
        self
    }

    /// Pins the date import windows are computed against.
    pub fn today(mut self, today: NaiveDate) -> Self {
        self.today = Some(today);
        self
    }

    pub fn build(self) -> OrchestratorContext {
        OrchestratorContext {
            config: self.config,
            state: SystemState::new(),
            registry: RunRegistry::new(Arc::clone(&self.notifier)),
            import_service: self.import_service,
            synchronizer: self.synchronizer,
            store: self.store,
            notifier: self.notifier,
            catalog: self.catalog,
            calendar: self.calendar,
            today: self.today,
        }
    }
}

impl OrchestratorContext {
    pub fn builder(
        import_service: Arc<dyn ImportService>,
        synchronizer: Arc<dyn SdsSynchronizer>,
        store: Arc<dyn RunStore>,
        notifier: Arc<dyn Notifier>,
    ) -> ContextBuilder {
        ContextBuilder {
            config: OrchestratorConfig::default(),
            import_service,
            synchronizer,
            store,
            notifier,
            catalog: Arc::new(PrefixCatalog),
            calendar: Arc::new(CalendarYear),
            today: None,
        }
    }

    pub fn today(&self) -> NaiveDate {
        self.today.unwrap_or_else(|| Local::now().date_naive())
    }

    /// Makes sure a run picked up from the queue has a record to write to. A task that bypassed
    /// admission while another run holds the slot still gets a record, so its history is kept.
    pub(crate) fn ensure_registered(&self, kind: JobKind, run_id: Uuid, project_id: &str) {
        if self.registry.contains(run_id) {
            return;
        }
        if let Err(err) = self
            .registry
            .register(RunDetails::new(kind, run_id, project_id))
        {
            warn!(message = "Run was not admitted, tracking it without the current-run slot", run_id = %run_id, error = %err);
            self.registry.track(RunDetails::new(kind, run_id, project_id));
        }
    }

    /// Terminal transition shared by every job kind: stamps the outcome, persists and versions
    /// the record, pushes the final status, drops the run and clears the running flag.
    ///
    /// Returns `false` without side effects when the run was already finalized.
    pub async fn finalize_run(&self, run_id: Uuid, success: bool) -> bool {
        let Some(details) = self.registry.update(run_id, |details| {
            details.end_time = Some(Utc::now());
            details.success = Some(success);
        }) else {
            debug!(message = "Run already finalized", run_id = %run_id);
            return false;
        };

        match self.store.save_run(&details).await {
            Ok(true) => {
                let message = format!("{} run {} ({})", details.kind, run_id, outcome(success));
                if let Err(err) = self.store.commit(&details.project_id, &message).await {
                    error!(message = "Failed to commit run history", run_id = %run_id, error = ?err);
                }
            }
            Ok(false) => debug!(message = "Run record unchanged, nothing to commit", run_id = %run_id),
            Err(err) => error!(message = "Failed to persist run", run_id = %run_id, error = ?err),
        }

        self.notifier.notify(details.notification(false));
        self.registry.remove(run_id);
        self.state.reset(details.kind);
        true
    }
}

fn outcome(success: bool) -> &'static str {
    if success {
        "succeeded"
    } else {
        "failed"
    }
}
