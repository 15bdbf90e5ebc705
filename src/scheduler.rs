use crate::context::OrchestratorContext;
use crate::queue::TaskQueue;
use crate::{JobKind, TaskRequest};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::*;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkMessage {
    JobStarted(Uuid),
    JobCompleted(Uuid),
    JobFailed(Uuid, String),
}

/// Wakes every tick and drains the queue, running each task to completion before taking the
/// next one. At most one job of any kind executes at a time.
pub async fn start(
    cancel_token: CancellationToken,
    ctx: Arc<OrchestratorContext>,
    queue: TaskQueue,
    send_to_client: Option<UnboundedSender<WorkMessage>>,
) {
    recover_stale_state(&ctx);

    let mut ticker = interval(ctx.config.tick.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!("Scheduler Cancelled");
                break;
            },
            _ = ticker.tick() => {
                drain(&cancel_token, &ctx, &queue, send_to_client.as_ref()).await;
            }
        }
    }
    info!("Scheduler stopped.");
}

/// Nothing runs before the scheduler starts, so any running flag at this point is left over.
fn recover_stale_state(ctx: &OrchestratorContext) {
    for kind in [JobKind::ErpImport, JobKind::SdsSync] {
        if ctx.state.is_running(kind) && !ctx.registry.has_current(kind) {
            warn!(message = "Resetting stale running flag", kind = %kind);
            ctx.state.reset(kind);
        }
    }
}

fn report(send_to_client: Option<&UnboundedSender<WorkMessage>>, message: WorkMessage) {
    if let Some(sender) = send_to_client {
        if let Err(err) = sender.send(message) {
            debug!(message = "Nobody is listening for job events", event = ?err.0);
        }
    }
}

pub async fn drain(
    cancel_token: &CancellationToken,
    ctx: &OrchestratorContext,
    queue: &TaskQueue,
    send_to_client: Option<&UnboundedSender<WorkMessage>>,
) -> usize {
    let mut processed = 0;
    while !cancel_token.is_cancelled() {
        let Some(task) = queue.try_dequeue() else {
            break;
        };
        if ctx.registry.take_withdrawn(task.run_id()) {
            debug!(message = "Discarding withdrawn task", run_id = %task.run_id());
            continue;
        }
        process(ctx, task, send_to_client).await;
        processed += 1;
    }
    processed
}

#[instrument(skip_all, fields(run_id = %task.run_id(), kind = %task.kind()))]
async fn process(
    ctx: &OrchestratorContext,
    task: TaskRequest,
    send_to_client: Option<&UnboundedSender<WorkMessage>>,
) {
    let run_id = task.run_id();
    let kind = task.kind();
    report(send_to_client, WorkMessage::JobStarted(run_id));

    match AssertUnwindSafe(task.execute(ctx)).catch_unwind().await {
        Ok(Ok(())) => {
            debug!(message = "Completed job", run_id = ?run_id);
            report(send_to_client, WorkMessage::JobCompleted(run_id));
        }
        Ok(Err(err)) => {
            debug!(message = "Failed job", run_id = ?run_id, error = %err);
            report(send_to_client, WorkMessage::JobFailed(run_id, err.to_string()));
        }
        Err(panic) => {
            let reason = panic_message(panic);
            error!(message = "Job panicked", run_id = ?run_id, reason = %reason);
            ctx.registry
                .add_log(run_id, format!("Unexpected error: {reason}"));
            ctx.finalize_run(run_id, false).await;
            ctx.state.reset(kind);
            report(send_to_client, WorkMessage::JobFailed(run_id, reason));
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
