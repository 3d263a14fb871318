//! Serialized task executor.
//!
//! Every composite actuator that needs to sequence several dependency calls
//! owns one [`SerialExecutor`]: a single tokio worker draining a FIFO queue,
//! so at most one request body runs at a time and in submission order.
//!
//! Each submission returns a [`MoveFuture`], which resolves exactly once with
//! the body's result. Not-yet-started requests can be cancelled individually
//! ([`MoveFuture::cancel`]) or all at once ([`SerialExecutor::cancel`]); a body
//! that is already running is never aborted.
//!
//! The worker publishes the actuator state (`Moving`/`Referencing` while a
//! body runs, then `Idle` or `Error`). Failures and panics of a body are
//! delivered through its future and never stop the worker.

use crate::axis::AxisSet;
use crate::capabilities::ActuatorState;
use crate::error::{ActuatorError, ActuatorResult};
use crate::observable::Observable;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, Instrument};

/// What a queued body does. Selects the state published while it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Move,
    Reference,
}

/// Body of a queued request.
pub type TaskBody = Box<dyn FnOnce(TaskContext) -> BoxFuture<'static, ActuatorResult<()>> + Send>;

struct Job {
    id: u64,
    kind: TaskKind,
    update_axes: Option<AxisSet>,
    body: TaskBody,
    reply: oneshot::Sender<ActuatorResult<()>>,
}

#[derive(Default)]
struct Queue {
    jobs: VecDeque<Job>,
    closed: bool,
}

struct Shared {
    name: String,
    queue: Mutex<Queue>,
    notify: Notify,
    state: Observable<ActuatorState>,
    next_id: AtomicU64,
}

impl Shared {
    fn remove(&self, id: u64) -> Option<Job> {
        let mut queue = self.queue.lock();
        let idx = queue.jobs.iter().position(|j| j.id == id)?;
        queue.jobs.remove(idx)
    }
}

/// Single-worker FIFO executor.
pub struct SerialExecutor {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for SerialExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialExecutor")
            .field("name", &self.shared.name)
            .field("pending", &self.pending())
            .finish()
    }
}

impl SerialExecutor {
    /// Spawn the worker on the current tokio runtime.
    ///
    /// `state` is the observable the worker keeps up to date.
    pub fn new(name: impl Into<String>, state: Observable<ActuatorState>) -> ActuatorResult<Self> {
        let name = name.into();
        let handle = tokio::runtime::Handle::try_current().map_err(|_| {
            ActuatorError::config(format!("'{name}' must be created inside a tokio runtime"))
        })?;

        let shared = Arc::new(Shared {
            name,
            queue: Mutex::new(Queue::default()),
            notify: Notify::new(),
            state,
            next_id: AtomicU64::new(1),
        });
        let worker = handle.spawn(run_worker(Arc::clone(&shared)));

        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Queue a body. Never blocks.
    ///
    /// `update_axes` marks the request as an update move over those axes; a
    /// running body can see it with [`TaskContext::next_update_axes`].
    pub fn submit<F>(&self, kind: TaskKind, update_axes: Option<AxisSet>, body: F) -> MoveFuture
    where
        F: FnOnce(TaskContext) -> BoxFuture<'static, ActuatorResult<()>> + Send + 'static,
    {
        let (reply, rx) = oneshot::channel();
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut queue = self.shared.queue.lock();
            if queue.closed {
                return MoveFuture::ready(Err(ActuatorError::ExecutorClosed(
                    self.shared.name.clone(),
                )));
            }
            queue.jobs.push_back(Job {
                id,
                kind,
                update_axes,
                body: Box::new(body),
                reply,
            });
        }
        self.shared.notify.notify_one();

        MoveFuture {
            rx,
            handle: Some(JobHandle {
                id,
                shared: Arc::downgrade(&self.shared),
            }),
        }
    }

    /// Drop every request that has not started yet. Their futures resolve
    /// with [`ActuatorError::Cancelled`]. Returns how many were dropped.
    pub fn cancel(&self) -> usize {
        let drained: Vec<Job> = self.shared.queue.lock().jobs.drain(..).collect();
        let count = drained.len();
        for job in drained {
            let _ = job.reply.send(Err(ActuatorError::Cancelled));
        }
        if count > 0 {
            debug!(actuator = %self.shared.name, count, "Cancelled queued requests");
        }
        count
    }

    /// Number of requests waiting to start.
    pub fn pending(&self) -> usize {
        self.shared.queue.lock().jobs.len()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.queue.lock().closed
    }

    /// Refuse new requests, cancel the queued ones and wait for the running
    /// body to finish.
    pub async fn shutdown(&self) {
        self.shared.queue.lock().closed = true;
        self.cancel();
        self.shared.notify.notify_one();

        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                error!(actuator = %self.shared.name, "Executor worker failed: {}", e);
            }
        }
    }
}

impl Drop for SerialExecutor {
    fn drop(&mut self) {
        self.shared.queue.lock().closed = true;
        self.shared.notify.notify_one();
    }
}

async fn run_worker(shared: Arc<Shared>) {
    loop {
        let next = {
            let mut queue = shared.queue.lock();
            match queue.jobs.pop_front() {
                Some(job) => Some(job),
                None if queue.closed => break,
                None => None,
            }
        };

        let Some(job) = next else {
            shared.notify.notified().await;
            continue;
        };

        let Job {
            id,
            kind,
            body,
            reply,
            ..
        } = job;

        shared.state.publish(match kind {
            TaskKind::Move => ActuatorState::Moving,
            TaskKind::Reference => ActuatorState::Referencing,
        });

        let ctx = TaskContext {
            shared: Arc::clone(&shared),
        };
        let span = tracing::debug_span!("task", actuator = %shared.name, id, ?kind);
        let result = AssertUnwindSafe(async move { body(ctx).await })
            .catch_unwind()
            .instrument(span)
            .await
            .unwrap_or_else(|panic| Err(ActuatorError::TaskPanicked(panic_message(&panic))));

        match &result {
            Ok(()) | Err(ActuatorError::Cancelled) => shared.state.publish(ActuatorState::Idle),
            Err(e) => {
                error!(actuator = %shared.name, "Request {} failed: {}", id, e);
                shared.state.publish(ActuatorState::Error(e.to_string()));
            }
        }

        // The caller may have dropped its future; the body still ran.
        let _ = reply.send(result);
    }
    debug!(actuator = %shared.name, "Executor worker stopped");
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Handed to a running body.
pub struct TaskContext {
    shared: Arc<Shared>,
}

impl TaskContext {
    /// Axes of the request queued right after this one, if it is an update
    /// move.
    pub fn next_update_axes(&self) -> Option<AxisSet> {
        self.shared
            .queue
            .lock()
            .jobs
            .front()
            .and_then(|j| j.update_axes.clone())
    }

    /// Name of the owning actuator.
    pub fn name(&self) -> &str {
        &self.shared.name
    }
}

struct JobHandle {
    id: u64,
    shared: Weak<Shared>,
}

/// Handle on a submitted request. Resolves exactly once.
///
/// Dropping it does not cancel the request.
#[must_use = "a MoveFuture does nothing unless awaited, but the request still runs"]
pub struct MoveFuture {
    rx: oneshot::Receiver<ActuatorResult<()>>,
    handle: Option<JobHandle>,
}

impl std::fmt::Debug for MoveFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MoveFuture")
            .field("id", &self.handle.as_ref().map(|h| h.id))
            .finish()
    }
}

impl MoveFuture {
    /// An already resolved future.
    pub fn ready(result: ActuatorResult<()>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self { rx, handle: None }
    }

    /// Cancel the request if it has not started yet.
    ///
    /// Returns true if it was removed from the queue; the future then
    /// resolves with [`ActuatorError::Cancelled`].
    pub fn cancel(&self) -> bool {
        let Some(handle) = &self.handle else {
            return false;
        };
        let Some(shared) = handle.shared.upgrade() else {
            return false;
        };
        match shared.remove(handle.id) {
            Some(job) => {
                let _ = job.reply.send(Err(ActuatorError::Cancelled));
                true
            }
            None => false,
        }
    }

    /// Wait at most `timeout` for the result.
    pub async fn wait_timeout(self, timeout: Duration) -> ActuatorResult<()> {
        tokio::time::timeout(timeout, self)
            .await
            .map_err(|_| ActuatorError::Timeout(timeout))?
    }
}

impl Future for MoveFuture {
    type Output = ActuatorResult<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // Sender dropped without a result: the executor went away.
            Poll::Ready(Err(_)) => Poll::Ready(Err(ActuatorError::Cancelled)),
            Poll::Pending => Poll::Pending,
        }
    }
}
