mod common;

use common::*;
use importq::admission::{Admission, ErpImportSubmission, SdsSyncSubmission};
use importq::db::RunStore;
use importq::error::{AdmissionError, JobError};
use importq::queue::TaskQueue;
use importq::scheduler::{self, WorkMessage};
use importq::{sds_sync, ErpImportSettings, JobKind, SdsSyncSettings, TaskRequest};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

async fn collect_events(
    recv: &mut mpsc::UnboundedReceiver<WorkMessage>,
    finished: usize,
) -> Vec<WorkMessage> {
    let mut events = Vec::new();
    let mut done = 0;
    while done < finished {
        let event = tokio::time::timeout(Duration::from_secs(10), recv.recv())
            .await
            .expect("scheduler stalled")
            .expect("scheduler channel closed");
        if !matches!(event, WorkMessage::JobStarted(_)) {
            done += 1;
        }
        events.push(event);
    }
    events
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_producers_are_served_in_order_one_at_a_time() {
    let concurrency = Arc::new(Concurrency::default());
    let harness = Harness::new(
        ScriptedImportService::remaining(&[]).with_concurrency(concurrency.clone(), Duration::from_millis(1)),
        FakeSynchronizer::new(SyncBehaviour::Succeed).with_concurrency(concurrency.clone(), Duration::from_millis(1)),
    );
    let queue = TaskQueue::new();
    let (send_to_client, mut recv_from_scheduler) = mpsc::unbounded_channel();
    let cancel_token = CancellationToken::new();

    let scheduler = tokio::spawn(scheduler::start(
        cancel_token.clone(),
        harness.ctx.clone(),
        queue.clone(),
        Some(send_to_client),
    ));

    let producers: Vec<_> = (0..4)
        .map(|producer| {
            let queue = queue.clone();
            tokio::spawn(async move {
                let mut submitted = Vec::new();
                for i in 0..5 {
                    let task = if (producer + i) % 2 == 0 {
                        TaskRequest::ErpImport(ErpImportSettings::new("q205"))
                    } else {
                        TaskRequest::SdsSync(SdsSyncSettings::new("q205"))
                    };
                    submitted.push(task.run_id());
                    queue.enqueue(task).unwrap();
                    tokio::task::yield_now().await;
                }
                submitted
            })
        })
        .collect();

    let mut per_producer = Vec::new();
    for producer in producers {
        per_producer.push(producer.await.unwrap());
    }

    let events = collect_events(&mut recv_from_scheduler, 20).await;
    cancel_token.cancel();
    scheduler.await.unwrap();

    // Every start is immediately followed by the end of the same job.
    let mut started_order = Vec::new();
    for pair in events.chunks(2) {
        match pair {
            [WorkMessage::JobStarted(started), WorkMessage::JobCompleted(finished)] => {
                assert_eq!(started, finished);
                started_order.push(*started);
            }
            other => panic!("jobs overlapped: {other:?}"),
        }
    }
    assert_eq!(concurrency.max(), 1);

    // FIFO: each producer's jobs run in the order it submitted them.
    let position: HashMap<Uuid, usize> = started_order
        .iter()
        .enumerate()
        .map(|(i, id)| (*id, i))
        .collect();
    for submitted in per_producer {
        let positions: Vec<usize> = submitted.iter().map(|id| position[id]).collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
    }

    assert!(harness.ctx.registry.is_empty());
    assert!(!harness.ctx.state.is_running(JobKind::ErpImport));
    assert!(!harness.ctx.state.is_running(JobKind::SdsSync));
}

#[tokio::test]
async fn failed_sync_is_reported_and_resets_state() {
    let mut harness = Harness::new(
        ScriptedImportService::remaining(&[]),
        FakeSynchronizer::new(SyncBehaviour::Fail),
    );
    let settings = SdsSyncSettings::new("m0324");
    let run_id = settings.run_id;

    let err = sds_sync::run(&harness.ctx, settings).await.unwrap_err();
    assert!(matches!(err, JobError::Sync(_)));
    assert!(!harness.ctx.state.is_running(JobKind::SdsSync));
    assert!(harness.synchronizer.invalidated.lock().is_empty());

    let last = harness.drain_notifications().pop().unwrap();
    assert_eq!(last.channel, "sdssyncstatus");
    assert_eq!(last.success, Some(false));
    assert!(last.log_text.contains("is locked"));

    let run = harness.store.load_run(run_id).await.unwrap().unwrap();
    assert_eq!(run.success, Some(false));
}

#[tokio::test]
async fn successful_sync_invalidates_caches() {
    let harness = Harness::new(
        ScriptedImportService::remaining(&[]),
        FakeSynchronizer::new(SyncBehaviour::Succeed),
    );
    let settings = SdsSyncSettings::new("ar22");
    let run_id = settings.run_id;

    sds_sync::run(&harness.ctx, settings).await.unwrap();

    assert_eq!(*harness.synchronizer.invalidated.lock(), vec!["ar22".to_string()]);
    let run = harness.store.load_run(run_id).await.unwrap().unwrap();
    assert_eq!(run.success, Some(true));
    assert_eq!(run.progress, 1.0);
    assert!(run.log.iter().any(|line| line.contains("12 structured data elements")));
}

#[tokio::test]
async fn panicking_job_does_not_stop_the_scheduler() {
    let harness = Harness::new(
        ScriptedImportService::remaining(&[3, 0]),
        FakeSynchronizer::new(SyncBehaviour::Panic),
    );
    let queue = TaskQueue::new();
    let admission = Admission::new(harness.ctx.clone(), queue.clone());
    let (send_to_client, mut recv_from_scheduler) = mpsc::unbounded_channel();

    let sync_id = admission
        .submit_sds_sync(SdsSyncSubmission {
            project_id: "q205".to_string(),
            ..Default::default()
        })
        .unwrap();
    let import = ErpImportSettings::new("q205");
    let import_id = import.run_id;
    queue.enqueue(TaskRequest::ErpImport(import)).unwrap();

    let processed = scheduler::drain(
        &CancellationToken::new(),
        &harness.ctx,
        &queue,
        Some(&send_to_client),
    )
    .await;
    assert_eq!(processed, 2);

    let events = collect_events(&mut recv_from_scheduler, 2).await;
    assert!(matches!(&events[1], WorkMessage::JobFailed(id, reason) if *id == sync_id && reason.contains("corrupt")));
    assert_eq!(events[3], WorkMessage::JobCompleted(import_id));

    let sync_run = harness.store.load_run(sync_id).await.unwrap().unwrap();
    assert_eq!(sync_run.success, Some(false));
    assert!(!harness.ctx.state.is_running(JobKind::SdsSync));
    assert!(harness.ctx.registry.is_empty());
}

#[tokio::test]
async fn combined_sync_continues_the_import_progress() {
    let harness = Harness::new(
        ScriptedImportService::remaining(&[2, 1, 0]),
        FakeSynchronizer::new(SyncBehaviour::Succeed),
    );
    let queue = TaskQueue::new();
    let admission = Admission::new(harness.ctx.clone(), queue.clone());

    let (import_id, sync_id) = admission.submit_combined_sync("q205").unwrap();
    assert!(admission.submit_combined_sync("q205").is_err());
    assert_eq!(queue.len(), 2);

    scheduler::drain(&CancellationToken::new(), &harness.ctx, &queue, None).await;

    let import = harness.store.load_run(import_id).await.unwrap().unwrap();
    assert_eq!(import.progress, 0.5);
    assert_eq!(import.success, Some(true));
    let sync = harness.store.load_run(sync_id).await.unwrap().unwrap();
    assert_eq!(sync.progress, 1.0);
    assert_eq!(sync.success, Some(true));
    assert_eq!(harness.store.runs_for_project("q205").await.unwrap().len(), 2);
}

#[tokio::test]
async fn scheduler_clears_stale_flags_on_start() {
    let harness = Harness::new(
        ScriptedImportService::remaining(&[]),
        FakeSynchronizer::new(SyncBehaviour::Succeed),
    );
    harness.ctx.state.mark_running(JobKind::SdsSync, "q205");

    let cancel_token = CancellationToken::new();
    cancel_token.cancel();
    scheduler::start(cancel_token, harness.ctx.clone(), TaskQueue::new(), None).await;

    assert!(!harness.ctx.state.is_running(JobKind::SdsSync));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_submissions_admit_exactly_one_import() {
    let harness = Harness::new(
        ScriptedImportService::remaining(&[3, 1, 0]),
        FakeSynchronizer::new(SyncBehaviour::Succeed),
    );
    let queue = TaskQueue::new();
    let admission = Admission::new(harness.ctx.clone(), queue.clone());
    let barrier = Arc::new(tokio::sync::Barrier::new(8));

    let submitters: Vec<_> = (0..8)
        .map(|_| {
            let admission = admission.clone();
            let barrier = barrier.clone();
            tokio::spawn(async move {
                barrier.wait().await;
                admission.submit_erp_import(ErpImportSubmission {
                    project_id: "q205".to_string(),
                    ..Default::default()
                })
            })
        })
        .collect();

    let mut admitted = Vec::new();
    let mut refused = 0;
    for submitter in submitters {
        match submitter.await.unwrap() {
            Ok(run_id) => admitted.push(run_id),
            Err(AdmissionError::AlreadyRunning(JobKind::ErpImport)) => refused += 1,
            Err(err) => panic!("unexpected admission error: {err}"),
        }
    }
    assert_eq!(admitted.len(), 1);
    assert_eq!(refused, 7);
    assert_eq!(queue.len(), 1);

    let processed = scheduler::drain(&CancellationToken::new(), &harness.ctx, &queue, None).await;
    assert_eq!(processed, 1);
    let runs = harness.store.runs_for_project("q205").await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].run_id, admitted[0]);
    assert_eq!(runs[0].success, Some(true));
}

#[tokio::test]
async fn withdrawn_task_is_discarded_by_the_scheduler() {
    let harness = Harness::new(
        ScriptedImportService::remaining(&[0]),
        FakeSynchronizer::new(SyncBehaviour::Succeed),
    );
    let queue = TaskQueue::new();
    let admission = Admission::new(harness.ctx.clone(), queue.clone());
    let run_id = admission
        .submit_erp_import(ErpImportSubmission {
            project_id: "q205".to_string(),
            ..Default::default()
        })
        .unwrap();

    harness.ctx.registry.withdraw(run_id);
    let processed = scheduler::drain(&CancellationToken::new(), &harness.ctx, &queue, None).await;

    assert_eq!(processed, 0);
    assert!(queue.is_empty());
    assert!(harness.import_service.starts().is_empty());
    assert!(harness.store.load_run(run_id).await.unwrap().is_none());
}
