#![allow(dead_code)]

use anyhow::{anyhow, Error};
use async_trait::async_trait;
use chrono::NaiveDate;
use importq::config::OrchestratorConfig;
use importq::context::OrchestratorContext;
use importq::db::MemoryRunStore;
use importq::error::ImportServiceError;
use importq::import_service::{ImportService, ServiceResponse, StartRequest};
use importq::notify::{ChannelNotifier, Notification};
use importq::sds_sync::{SdsSynchronizer, SyncReport};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

/// Tracks how many jobs are inside an external call at once.
#[derive(Default)]
pub struct Concurrency {
    active: AtomicUsize,
    max: AtomicUsize,
}

impl Concurrency {
    pub fn enter(&self) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
    }

    pub fn exit(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn max(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }
}

pub fn failure() -> ServiceResponse {
    ServiceResponse {
        status: 500,
        body: "Internal Server Error".to_string(),
    }
}

pub fn remaining(n: i64) -> ServiceResponse {
    ServiceResponse::ok(format!("<remaining>{n}</remaining>"))
}

/// Replays scripted progress replies, then keeps reporting the import as finished.
pub struct ScriptedImportService {
    start_response: Mutex<ServiceResponse>,
    progress: Mutex<VecDeque<ServiceResponse>>,
    starts: Mutex<Vec<StartRequest>>,
    progress_calls: AtomicUsize,
    pub concurrency: Arc<Concurrency>,
    call_delay: Duration,
    hang_on_progress: bool,
}

impl ScriptedImportService {
    pub fn new(script: Vec<ServiceResponse>) -> Self {
        ScriptedImportService {
            start_response: Mutex::new(ServiceResponse::ok("started")),
            progress: Mutex::new(script.into()),
            starts: Mutex::new(Vec::new()),
            progress_calls: AtomicUsize::new(0),
            concurrency: Arc::new(Concurrency::default()),
            call_delay: Duration::ZERO,
            hang_on_progress: false,
        }
    }

    pub fn remaining(counts: &[i64]) -> Self {
        Self::new(counts.iter().map(|n| remaining(*n)).collect())
    }

    pub fn refusing_start(self) -> Self {
        *self.start_response.lock() = failure();
        self
    }

    pub fn with_concurrency(mut self, concurrency: Arc<Concurrency>, call_delay: Duration) -> Self {
        self.concurrency = concurrency;
        self.call_delay = call_delay;
        self
    }

    /// Progress requests never get an answer.
    pub fn hanging_on_progress(mut self) -> Self {
        self.hang_on_progress = true;
        self
    }

    pub fn starts(&self) -> Vec<StartRequest> {
        self.starts.lock().clone()
    }

    pub fn progress_calls(&self) -> usize {
        self.progress_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ImportService for ScriptedImportService {
    async fn start(&self, request: &StartRequest) -> Result<ServiceResponse, ImportServiceError> {
        self.concurrency.enter();
        tokio::time::sleep(self.call_delay).await;
        self.starts.lock().push(request.clone());
        let response = self.start_response.lock().clone();
        self.concurrency.exit();
        Ok(response)
    }

    async fn progress(&self) -> Result<ServiceResponse, ImportServiceError> {
        if self.hang_on_progress {
            self.progress_calls.fetch_add(1, Ordering::SeqCst);
            futures::future::pending::<()>().await;
        }
        self.concurrency.enter();
        tokio::time::sleep(self.call_delay).await;
        self.progress_calls.fetch_add(1, Ordering::SeqCst);
        let response = self.progress.lock().pop_front().unwrap_or_else(|| remaining(0));
        self.concurrency.exit();
        Ok(response)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum SyncBehaviour {
    Succeed,
    Fail,
    Panic,
}

pub struct FakeSynchronizer {
    behaviour: SyncBehaviour,
    pub synced: Mutex<Vec<String>>,
    pub invalidated: Mutex<Vec<String>>,
    pub concurrency: Arc<Concurrency>,
    call_delay: Duration,
}

impl FakeSynchronizer {
    pub fn new(behaviour: SyncBehaviour) -> Self {
        FakeSynchronizer {
            behaviour,
            synced: Mutex::new(Vec::new()),
            invalidated: Mutex::new(Vec::new()),
            concurrency: Arc::new(Concurrency::default()),
            call_delay: Duration::ZERO,
        }
    }

    pub fn with_concurrency(mut self, concurrency: Arc<Concurrency>, call_delay: Duration) -> Self {
        self.concurrency = concurrency;
        self.call_delay = call_delay;
        self
    }
}

#[async_trait]
impl SdsSynchronizer for FakeSynchronizer {
    async fn synchronize(&self, project_id: &str) -> Result<SyncReport, Error> {
        self.concurrency.enter();
        tokio::time::sleep(self.call_delay).await;
        self.synced.lock().push(project_id.to_string());
        self.concurrency.exit();
        match self.behaviour {
            SyncBehaviour::Succeed => Ok(SyncReport {
                elements_updated: 12,
                files_changed: 3,
            }),
            SyncBehaviour::Fail => Err(anyhow!("data store for {project_id} is locked")),
            SyncBehaviour::Panic => panic!("corrupt data store for {project_id}"),
        }
    }

    async fn invalidate_caches(&self, project_id: &str) -> Result<(), Error> {
        self.invalidated.lock().push(project_id.to_string());
        Ok(())
    }
}

pub fn test_config() -> OrchestratorConfig {
    OrchestratorConfig {
        tick: Duration::from_millis(10),
        poll_interval: Duration::ZERO,
        poll_budget: Duration::from_secs(60),
        failure_budget: 2,
        cooldown: Duration::ZERO,
        request_timeout: Duration::from_secs(5),
    }
}

pub struct Harness {
    pub ctx: Arc<OrchestratorContext>,
    pub import_service: Arc<ScriptedImportService>,
    pub synchronizer: Arc<FakeSynchronizer>,
    pub store: Arc<MemoryRunStore>,
    pub notifications: UnboundedReceiver<Notification>,
}

impl Harness {
    pub fn new(import_service: ScriptedImportService, synchronizer: FakeSynchronizer) -> Self {
        Self::with_config(import_service, synchronizer, test_config())
    }

    pub fn with_config(
        import_service: ScriptedImportService,
        synchronizer: FakeSynchronizer,
        config: OrchestratorConfig,
    ) -> Self {
        let import_service = Arc::new(import_service);
        let synchronizer = Arc::new(synchronizer);
        let store = Arc::new(MemoryRunStore::new());
        let (notifier, notifications) = ChannelNotifier::new();
        let ctx = OrchestratorContext::builder(
            import_service.clone(),
            synchronizer.clone(),
            store.clone(),
            Arc::new(notifier),
        )
        .config(config)
        .today(NaiveDate::from_ymd_opt(2005, 8, 15).unwrap())
        .build();

        Harness {
            ctx: Arc::new(ctx),
            import_service,
            synchronizer,
            store,
            notifications,
        }
    }

    pub fn drain_notifications(&mut self) -> Vec<Notification> {
        let mut drained = Vec::new();
        while let Ok(notification) = self.notifications.try_recv() {
            drained.push(notification);
        }
        drained
    }
}
