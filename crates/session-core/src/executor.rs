//! Serialized task queues
//!
//! Two queues drive the whole layer. The engine queue runs every call into a
//! media-session handle one job at a time, so negotiation steps never
//! interleave. The event queue delivers request results and observer
//! notifications, so user code never runs inside an engine callback.

use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::errors::{Result, SessionError};

/// A named FIFO queue of futures executed one after another on a single task
#[derive(Clone)]
pub struct TaskQueue {
    name: &'static str,
    tx: mpsc::UnboundedSender<BoxFuture<'static, ()>>,
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("name", &self.name)
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl TaskQueue {
    /// Start a queue on the current tokio runtime
    pub fn new(name: &'static str) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<BoxFuture<'static, ()>>();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                if AssertUnwindSafe(job).catch_unwind().await.is_err() {
                    error!(queue = name, "Job panicked, queue keeps running");
                }
            }
            debug!(queue = name, "Task queue stopped");
        });
        Self { name, tx }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Append a job. Jobs posted from inside a job run after it, in order.
    pub fn post<F>(&self, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.tx.send(Box::pin(job)).is_err() {
            warn!(queue = self.name, "Task queue is gone, job dropped");
        }
    }

    /// Run a job on the queue and wait for its output
    pub async fn run<F, T>(&self, job: F) -> Result<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.post(async move {
            let _ = tx.send(job.await);
        });
        rx.await
            .map_err(|_| SessionError::internal(format!("{} queue dropped the job", self.name)))
    }
}

/// The engine queue and the event queue shared by one client
#[derive(Clone, Debug)]
pub struct Executors {
    pub engine: TaskQueue,
    pub events: TaskQueue,
}

impl Executors {
    pub fn new() -> Self {
        Self {
            engine: TaskQueue::new("engine"),
            events: TaskQueue::new("events"),
        }
    }
}

/// Single-use result slot for one request.
///
/// The result is handed to the waiting caller through the event queue.
/// Dropping an unfinished completion fails the request, so every request
/// resolves exactly once.
pub struct Completion<T: Send + 'static> {
    tx: Option<oneshot::Sender<Result<T>>>,
    events: TaskQueue,
}

impl<T: Send + 'static> std::fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion")
            .field("pending", &self.tx.is_some())
            .finish()
    }
}

impl<T: Send + 'static> Completion<T> {
    pub fn new(events: &TaskQueue) -> (Self, PendingResult<T>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                tx: Some(tx),
                events: events.clone(),
            },
            PendingResult { rx },
        )
    }

    pub fn succeed(self, value: T) {
        self.complete(Ok(value));
    }

    pub fn fail(self, error: SessionError) {
        self.complete(Err(error));
    }

    pub fn complete(mut self, result: Result<T>) {
        if let Some(tx) = self.tx.take() {
            self.events.post(async move {
                let _ = tx.send(result);
            });
        }
    }
}

impl<T: Send + 'static> Drop for Completion<T> {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            self.events.post(async move {
                let _ = tx.send(Err(SessionError::internal("request abandoned")));
            });
        }
    }
}

/// Receiving side of a [`Completion`]
#[derive(Debug)]
pub struct PendingResult<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> PendingResult<T> {
    pub async fn wait(self) -> Result<T> {
        self.rx
            .await
            .unwrap_or_else(|_| Err(SessionError::internal("request abandoned")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use parking_lot::Mutex;

    #[tokio::test]
    async fn test_jobs_run_in_post_order() {
        let queue = TaskQueue::new("test");
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let seen = seen.clone();
            queue.post(async move {
                // later jobs must not overtake a sleeping one
                tokio::time::sleep(Duration::from_millis(5 - i)).await;
                seen.lock().push(i);
            });
        }
        queue.run(async {}).await.unwrap();
        assert_eq!(*seen.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_panicking_job_does_not_stop_queue() {
        let queue = TaskQueue::new("test");
        queue.post(async {
            panic!("boom");
        });
        assert_eq!(queue.run(async { 7 }).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_completion_resolves_once() {
        let executors = Executors::new();
        let (completion, pending) = Completion::<u32>::new(&executors.events);
        completion.succeed(3);
        assert_eq!(pending.wait().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_dropped_completion_fails() {
        let executors = Executors::new();
        let (completion, pending) = Completion::<()>::new(&executors.events);
        drop(completion);
        assert!(matches!(pending.wait().await, Err(SessionError::Internal { .. })));
    }
}
