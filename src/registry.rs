//! Per-run status records, keyed by run id.
//!
//! Each job kind has a single "current run" slot. Admission claims the slot, the orchestrator
//! executing the run is the only writer of its record, and finalization releases the slot.
//! Status queries read the slot instead of aggregating over every registered record.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::error::{AdmissionError, StatusError};
use crate::notify::{Notification, Notifier};
use crate::JobKind;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunDetails {
    pub run_id: Uuid,
    pub project_id: String,
    pub kind: JobKind,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    /// Unset until the run reaches a terminal state.
    pub success: Option<bool>,
    pub progress: f64,
    pub log: Vec<String>,
}

impl RunDetails {
    pub fn new(kind: JobKind, run_id: Uuid, project_id: impl Into<String>) -> Self {
        RunDetails {
            run_id,
            project_id: project_id.into(),
            kind,
            start_time: Utc::now(),
            end_time: None,
            success: None,
            progress: 0.0,
            log: Vec::new(),
        }
    }

    pub fn log_text(&self) -> String {
        self.log.join("\n")
    }

    pub fn notification(&self, is_running: bool) -> Notification {
        Notification {
            channel: self.kind.channel().to_string(),
            project_id: self.project_id.clone(),
            log_text: self.log_text(),
            progress: self.progress,
            is_running,
            success: self.success,
        }
    }
}

/// What live clients polling a run see.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunStatus {
    pub log: String,
    pub progress: String,
}

pub struct RunRegistry {
    runs: DashMap<Uuid, RunDetails>,
    current: DashMap<JobKind, Uuid>,
    withdrawn: DashSet<Uuid>,
    notifier: Arc<dyn Notifier>,
}

impl RunRegistry {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        RunRegistry {
            runs: DashMap::new(),
            current: DashMap::new(),
            withdrawn: DashSet::new(),
            notifier,
        }
    }

    /// Claims the current-run slot for the record's kind and stores the record.
    pub fn register(&self, details: RunDetails) -> Result<(), AdmissionError> {
        match self.current.entry(details.kind) {
            Entry::Occupied(_) => Err(AdmissionError::AlreadyRunning(details.kind)),
            Entry::Vacant(slot) => {
                debug!(message = "Registering run", run_id = %details.run_id, kind = %details.kind);
                slot.insert(details.run_id);
                self.runs.insert(details.run_id, details);
                Ok(())
            }
        }
    }

    /// Stores a record without claiming its kind's slot. Status queries never report it.
    pub fn track(&self, details: RunDetails) {
        debug!(message = "Tracking run outside the current-run slot", run_id = %details.run_id, kind = %details.kind);
        self.runs.insert(details.run_id, details);
    }

    /// Drops an admitted run whose task is already queued. The scheduler discards the task.
    pub fn withdraw(&self, run_id: Uuid) {
        self.remove(run_id);
        self.withdrawn.insert(run_id);
    }

    pub fn take_withdrawn(&self, run_id: Uuid) -> bool {
        self.withdrawn.remove(&run_id).is_some()
    }

    pub fn contains(&self, run_id: Uuid) -> bool {
        self.runs.contains_key(&run_id)
    }

    pub fn get(&self, run_id: Uuid) -> Option<RunDetails> {
        self.runs.get(&run_id).map(|entry| entry.value().clone())
    }

    pub fn current(&self, kind: JobKind) -> Option<RunDetails> {
        let run_id = *self.current.get(&kind)?;
        self.get(run_id)
    }

    pub fn has_current(&self, kind: JobKind) -> bool {
        self.current.contains_key(&kind)
    }

    /// Appends a log line and pushes the updated record to live clients.
    pub fn add_log(&self, run_id: Uuid, line: impl Into<String>) -> bool {
        let line = line.into();
        let notification = match self.runs.get_mut(&run_id) {
            Some(mut entry) => {
                trace!(message = "Run log", run_id = %run_id, line = %line);
                entry.log.push(line);
                entry.notification(true)
            }
            None => return false,
        };
        self.notifier.notify(notification);
        true
    }

    /// Raises the progress of a run. Lower values are ignored so progress never moves backwards.
    pub fn set_progress(&self, run_id: Uuid, progress: f64) -> Option<f64> {
        let mut entry = self.runs.get_mut(&run_id)?;
        let clamped = progress.clamp(0.0, 1.0);
        if clamped > entry.progress {
            entry.progress = clamped;
        }
        Some(entry.progress)
    }

    pub fn update<F>(&self, run_id: Uuid, f: F) -> Option<RunDetails>
    where
        F: FnOnce(&mut RunDetails),
    {
        let mut entry = self.runs.get_mut(&run_id)?;
        f(entry.value_mut());
        Some(entry.value().clone())
    }

    /// Removes a run and releases its kind's current-run slot if it still holds it.
    pub fn remove(&self, run_id: Uuid) -> Option<RunDetails> {
        let (_, details) = self.runs.remove(&run_id)?;
        self.current.remove_if(&details.kind, |_, current| *current == run_id);
        debug!(message = "Removed run", run_id = %run_id, kind = %details.kind);
        Some(details)
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    pub fn status(&self, kind: JobKind) -> Result<RunStatus, StatusError> {
        let details = self.current(kind).ok_or(StatusError::NotRunning(kind))?;
        Ok(RunStatus {
            log: details.log_text(),
            progress: format!("{}%", (details.progress * 100.0).round() as u32),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::ChannelNotifier;

    fn registry() -> (
        RunRegistry,
        tokio::sync::mpsc::UnboundedReceiver<Notification>,
    ) {
        let (notifier, receiver) = ChannelNotifier::new();
        (RunRegistry::new(Arc::new(notifier)), receiver)
    }

    #[test]
    fn second_run_of_same_kind_is_refused() {
        let (registry, _rx) = registry();
        let first = RunDetails::new(JobKind::ErpImport, Uuid::new_v4(), "q205");
        let second = RunDetails::new(JobKind::ErpImport, Uuid::new_v4(), "q305");
        let sync = RunDetails::new(JobKind::SdsSync, Uuid::new_v4(), "q205");

        registry.register(first).unwrap();
        assert_eq!(
            registry.register(second),
            Err(AdmissionError::AlreadyRunning(JobKind::ErpImport))
        );
        registry.register(sync).unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn add_log_appends_and_notifies() {
        let (registry, mut rx) = registry();
        let run_id = Uuid::new_v4();
        registry
            .register(RunDetails::new(JobKind::ErpImport, run_id, "m0324"))
            .unwrap();

        assert!(registry.add_log(run_id, "first"));
        assert!(registry.add_log(run_id, "second"));

        let first = rx.try_recv().unwrap();
        assert_eq!(first.log_text, "first");
        assert_eq!(first.channel, "erpimportstatus");
        let second = rx.try_recv().unwrap();
        assert_eq!(second.log_text, "first\nsecond");
        assert!(second.is_running);
        assert!(rx.try_recv().is_err());

        assert!(!registry.add_log(Uuid::new_v4(), "nobody"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn progress_never_decreases() {
        let (registry, _rx) = registry();
        let run_id = Uuid::new_v4();
        registry
            .register(RunDetails::new(JobKind::ErpImport, run_id, "q205"))
            .unwrap();

        assert_eq!(registry.set_progress(run_id, 0.4), Some(0.4));
        assert_eq!(registry.set_progress(run_id, 0.2), Some(0.4));
        assert_eq!(registry.set_progress(run_id, 1.7), Some(1.0));
    }

    #[test]
    fn tracked_runs_leave_the_slot_alone() {
        let (registry, _rx) = registry();
        let admitted = Uuid::new_v4();
        let stray = Uuid::new_v4();
        registry
            .register(RunDetails::new(JobKind::SdsSync, admitted, "ar22"))
            .unwrap();
        registry.track(RunDetails::new(JobKind::SdsSync, stray, "ar23"));

        assert!(registry.add_log(stray, "running anyway"));
        assert_eq!(registry.current(JobKind::SdsSync).unwrap().run_id, admitted);

        registry.remove(stray);
        assert_eq!(registry.current(JobKind::SdsSync).unwrap().run_id, admitted);
    }

    #[test]
    fn withdrawn_runs_are_reported_once() {
        let (registry, _rx) = registry();
        let run_id = Uuid::new_v4();
        registry
            .register(RunDetails::new(JobKind::ErpImport, run_id, "q205"))
            .unwrap();

        registry.withdraw(run_id);
        assert!(!registry.contains(run_id));
        assert!(!registry.has_current(JobKind::ErpImport));
        assert!(registry.take_withdrawn(run_id));
        assert!(!registry.take_withdrawn(run_id));
    }

    #[test]
    fn status_reports_current_run_and_clears_on_remove() {
        let (registry, _rx) = registry();
        let run_id = Uuid::new_v4();
        assert_eq!(
            registry.status(JobKind::ErpImport),
            Err(StatusError::NotRunning(JobKind::ErpImport))
        );

        registry
            .register(RunDetails::new(JobKind::ErpImport, run_id, "q205"))
            .unwrap();
        registry.add_log(run_id, "Started");
        registry.set_progress(run_id, 0.3);

        let status = registry.status(JobKind::ErpImport).unwrap();
        assert_eq!(status.progress, "30%");
        assert_eq!(status.log, "Started");

        assert!(registry.remove(run_id).is_some());
        assert!(registry.remove(run_id).is_none());
        assert!(!registry.has_current(JobKind::ErpImport));
        assert!(registry.status(JobKind::ErpImport).is_err());
    }
}
