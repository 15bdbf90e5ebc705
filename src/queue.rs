use async_channel::{Receiver, Sender, TrySendError};
use tracing::debug;

use crate::error::AdmissionError;
use crate::TaskRequest;

/// FIFO of pending jobs. Any number of producers may enqueue concurrently without blocking;
/// the scheduler is the single consumer.
#[derive(Clone)]
pub struct TaskQueue {
    send_to_queue: Sender<TaskRequest>,
    recv_from_queue: Receiver<TaskRequest>,
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskQueue {
    pub fn new() -> Self {
        let (send_to_queue, recv_from_queue) = async_channel::unbounded();
        TaskQueue {
            send_to_queue,
            recv_from_queue,
        }
    }

    pub fn enqueue(&self, request: TaskRequest) -> Result<(), AdmissionError> {
        debug!(message = "Enqueueing task", run_id = %request.run_id(), kind = %request.kind());
        self.send_to_queue.try_send(request).map_err(|err| match err {
            TrySendError::Closed(_) | TrySendError::Full(_) => AdmissionError::QueueClosed,
        })
    }

    pub fn try_dequeue(&self) -> Option<TaskRequest> {
        self.recv_from_queue.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.recv_from_queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recv_from_queue.is_empty()
    }

    /// Refuses further submissions. Already queued tasks can still be drained.
    pub fn close(&self) -> bool {
        self.send_to_queue.close()
    }
}
