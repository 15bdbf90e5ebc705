use anyhow::Error;
use clap::Parser;

use importq::admission::{Admission, ErpImportSubmission, SdsSyncSubmission};
use importq::config::ConfigContext;
use importq::context::OrchestratorContext;
use importq::db::{DbHandle, MemoryRunStore, RunStore};
use importq::import_service::HttpImportService;
use importq::notify::ChannelNotifier;
use importq::queue::TaskQueue;
use importq::scheduler;
use importq::sds_sync::HttpSdsSynchronizer;
use importq::telemetry;
use std::env;
use std::sync::Arc;
use tokio::{
    signal::unix::{signal, SignalKind},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};

#[instrument(skip(cancel_token, config))]
async fn setup(cancel_token: CancellationToken, config: ConfigContext) -> Result<(), Error> {
    let store: Arc<dyn RunStore> = match &config.connect_url {
        Some(url) => Arc::new(DbHandle::new(url).await?),
        None => {
            warn!("No database configured, run history is kept in memory");
            Arc::new(MemoryRunStore::new())
        }
    };

    let orchestrator = config.orchestrator();
    let (notifier, mut recv_notifications) = ChannelNotifier::new();
    let ctx = Arc::new(
        OrchestratorContext::builder(
            Arc::new(HttpImportService::new(
                &config.import_url,
                orchestrator.request_timeout,
            )?),
            Arc::new(HttpSdsSynchronizer::new(
                &config.sds_url,
                orchestrator.request_timeout,
            )?),
            store,
            Arc::new(notifier),
        )
        .config(orchestrator)
        .build(),
    );
    let queue = TaskQueue::new();
    let admission = Admission::new(Arc::clone(&ctx), queue.clone());

    // Channel for job lifecycle events from the scheduler
    let (send_to_client, mut recv_from_scheduler) = mpsc::unbounded_channel();

    let scheduler_spawn = {
        let cancel_token = cancel_token.clone();
        let ctx = Arc::clone(&ctx);
        let queue = queue.clone();
        tokio::spawn(
            async move {
                scheduler::start(cancel_token, ctx, queue, Some(send_to_client)).await;
            }
            .instrument(info_span!("scheduler")),
        )
    };

    for project_id in &config.erp_import {
        let submission = ErpImportSubmission {
            project_id: project_id.clone(),
            ..Default::default()
        };
        match admission.submit_erp_import(submission) {
            Ok(run_id) => info!(message = "Submitted ERP import", project_id = %project_id, run_id = %run_id),
            Err(err) => error!(message = "ERP import not admitted", project_id = %project_id, error = %err),
        }
    }
    for project_id in &config.sds_sync {
        let submission = SdsSyncSubmission {
            project_id: project_id.clone(),
            ..Default::default()
        };
        match admission.submit_sds_sync(submission) {
            Ok(run_id) => info!(message = "Submitted SDS sync", project_id = %project_id, run_id = %run_id),
            Err(err) => error!(message = "SDS sync not admitted", project_id = %project_id, error = %err),
        }
    }

    debug!("Done submitting start-up jobs");
    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!("Setup Cancelled");
                break;
            },
            event = recv_from_scheduler.recv() => {
                match event {
                    Some(msg) => info!(event = "Job", msg = ?msg),
                    None => {
                        debug!("Scheduler channel closed unexpectedly, exiting");
                        break;
                    }
                }
            },
            notification = recv_notifications.recv() => {
                if let Some(notification) = notification {
                    debug!(
                        channel = %notification.channel,
                        project_id = %notification.project_id,
                        progress = notification.progress,
                        is_running = notification.is_running,
                        "Live update"
                    );
                }
            }
        }
    }

    queue.close();
    println!("Waiting for scheduler to shutdown...");
    scheduler_spawn.await?;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if env::var("RUST_LOG").is_err() {
        env::set_var("RUST_LOG", "importq=DEBUG");
    }

    let config = ConfigContext::parse();
    telemetry::init(config.jaeger_endpoint.as_deref())?;

    let token = CancellationToken::new();

    let cloned_token = token.clone();
    let app = tokio::spawn(setup(cloned_token, config));

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {println!("Received SIGTERM"); token.cancel()},
            _ = sigint.recv() => {println!("Received SIGINT"); token.cancel()},
        }
    });
    app.await??;
    println!("Shutting down.");
    telemetry::shutdown();

    Ok(())
}
