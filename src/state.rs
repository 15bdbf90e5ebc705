//! Process-wide record of which job kind is running, and for which project.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

use crate::JobKind;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobFlag {
    pub is_running: bool,
    pub project_id: Option<String>,
}

#[derive(Debug, Default)]
pub struct SystemState {
    erp_import: Mutex<JobFlag>,
    sds_sync: Mutex<JobFlag>,
    active_users: AtomicUsize,
}

impl SystemState {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, kind: JobKind) -> &Mutex<JobFlag> {
        match kind {
            JobKind::ErpImport => &self.erp_import,
            JobKind::SdsSync => &self.sds_sync,
        }
    }

    pub fn get(&self, kind: JobKind) -> JobFlag {
        self.slot(kind).lock().clone()
    }

    pub fn is_running(&self, kind: JobKind) -> bool {
        self.slot(kind).lock().is_running
    }

    pub fn mark_running(&self, kind: JobKind, project_id: &str) {
        debug!(message = "Marking job running", kind = %kind, project_id = project_id);
        *self.slot(kind).lock() = JobFlag {
            is_running: true,
            project_id: Some(project_id.to_string()),
        };
    }

    pub fn reset(&self, kind: JobKind) {
        debug!(message = "Resetting job state", kind = %kind);
        *self.slot(kind).lock() = JobFlag::default();
    }

    /// Marks the kind running until the returned guard is dropped, including on unwind.
    pub fn running(&self, kind: JobKind, project_id: &str) -> RunningGuard<'_> {
        self.mark_running(kind, project_id);
        RunningGuard { state: self, kind }
    }

    pub fn user_connected(&self) -> usize {
        self.active_users.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn user_disconnected(&self) -> usize {
        let previous = self
            .active_users
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        previous.saturating_sub(1)
    }

    pub fn active_users(&self) -> usize {
        self.active_users.load(Ordering::SeqCst)
    }
}

pub struct RunningGuard<'a> {
    state: &'a SystemState,
    kind: JobKind,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.state.reset(self.kind);
    }
}
