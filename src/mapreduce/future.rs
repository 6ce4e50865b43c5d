//! Cancellable handle on an asynchronously running task execution

use super::TaskId;
use crate::error::{MapReduceError, MapReduceResult};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::task::JoinHandle;
use tracing::info;

/// Cancels one execution by broadcasting a cancel to each of its parts.
///
/// Clones share state: the broadcast happens once, whichever clone asks
/// first, and every later call is a no-op.
#[derive(Clone)]
pub struct TaskCanceller {
    task_id: TaskId,
    cancelled: Arc<AtomicBool>,
    broadcast: Arc<dyn Fn() + Send + Sync>,
}

impl TaskCanceller {
    pub(crate) fn new(
        task_id: TaskId,
        cancelled: Arc<AtomicBool>,
        broadcast: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        Self {
            task_id,
            cancelled,
            broadcast: Arc::new(broadcast),
        }
    }

    /// Request cancellation. Returns `true` only for the call that did it.
    pub fn cancel(&self) -> bool {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return false;
        }
        info!("Cancelling task {}", self.task_id);
        (self.broadcast)();
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }
}

impl fmt::Debug for TaskCanceller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskCanceller")
            .field("task_id", &self.task_id)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Result of [`MapReduceTask::execute_async`](super::MapReduceTask::execute_async).
///
/// Resolves to the execution's outcome, or to an interrupted error once
/// cancelled. Dropping it does not stop the execution.
pub struct TaskFuture<T> {
    handle: JoinHandle<MapReduceResult<T>>,
    canceller: TaskCanceller,
}

impl<T> TaskFuture<T> {
    pub(crate) fn new(handle: JoinHandle<MapReduceResult<T>>, canceller: TaskCanceller) -> Self {
        Self { handle, canceller }
    }

    /// Cancel the execution unless it already finished
    pub fn cancel(&self) -> bool {
        if self.handle.is_finished() {
            return false;
        }
        self.canceller.cancel()
    }

    pub fn is_cancelled(&self) -> bool {
        self.canceller.is_cancelled()
    }

    pub fn is_done(&self) -> bool {
        self.handle.is_finished()
    }

    /// Detached cancel handle, usable after the future was moved
    pub fn canceller(&self) -> TaskCanceller {
        self.canceller.clone()
    }

    pub fn task_id(&self) -> &TaskId {
        self.canceller.task_id()
    }
}

impl<T> Future for TaskFuture<T> {
    type Output = MapReduceResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let outcome = match Pin::new(&mut this.handle).poll(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(outcome) => outcome,
        };
        if this.canceller.is_cancelled() {
            return Poll::Ready(Err(MapReduceError::interrupted(this.canceller.task_id())));
        }
        Poll::Ready(match outcome {
            Ok(result) => result,
            Err(join_err) => Err(MapReduceError::ExecutionAborted {
                task_id: this.canceller.task_id().to_string(),
                reason: join_err.to_string(),
            }),
        })
    }
}
