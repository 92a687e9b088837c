//! # Pending-Task Registry
//!
//! Correlates responses to outstanding requests. Every outbound request
//! that expects responses registers a task keyed by its message id; each
//! arriving response body accumulates against the task, and the task's
//! handler fires exactly once — with [`TaskStatus::Ok`] once enough
//! responses arrived, with [`TaskStatus::Timeout`] when the deadline
//! passes first, or with a cancellation status when the node shuts down
//! or loses its bootstrap session.
//!
//! Task ids are monotonic from a random starting point and double as wire
//! message ids, so a response always correlates by the id echoed in its
//! header. Registration happens before the request is handed to the
//! transport, so a response can never race its own task.
//!
//! The internal mutex is never held across a handler invocation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, trace};

use crate::messages::Message;

/// Terminal status delivered to a task's response handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskStatus {
    /// All requested responses arrived before the deadline.
    Ok,
    /// The deadline elapsed; the handler receives whatever accumulated.
    Timeout,
    /// The node is shutting down.
    Shutdown,
    /// The bootstrap relay session ended before the response arrived.
    SessionEnded,
    /// The destination was rejected before any network activity.
    InvalidDestination,
    /// The payload was empty or exceeded the maximum size.
    DataTooLarge,
}

/// Erased per-request result handler. Receives the terminal status and
/// the accumulated response bodies; invoked exactly once.
pub type ResponseHandler = Box<dyn FnOnce(TaskStatus, Vec<Message>) + Send + 'static>;

struct Task {
    responses: Vec<Message>,
    needed: usize,
    handler: ResponseHandler,
}

struct Inner {
    next_id: u64,
    tasks: HashMap<u64, Task>,
}

/// Shared registry handle; cheap to clone.
#[derive(Clone)]
pub struct PendingTasks {
    inner: Arc<Mutex<Inner>>,
}

impl Default for PendingTasks {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingTasks {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                next_id: rand::random(),
                tasks: HashMap::new(),
            })),
        }
    }

    /// Allocate a fresh message id without registering a task.
    pub fn next_id(&self) -> u64 {
        let mut inner = self.inner.lock().expect("pending tasks lock poisoned");
        let id = inner.next_id;
        inner.next_id = inner.next_id.wrapping_add(1);
        id
    }

    /// Register a waiter for `needed` responses, with a deadline.
    ///
    /// The returned id is used as the outbound message id. The handler is
    /// invoked from the timer or from a later `complete` call, never
    /// synchronously from here.
    pub fn add_task(&self, timeout: Duration, needed: usize, handler: ResponseHandler) -> u64 {
        let id = {
            let mut inner = self.inner.lock().expect("pending tasks lock poisoned");
            let id = inner.next_id;
            inner.next_id = inner.next_id.wrapping_add(1);
            inner.tasks.insert(
                id,
                Task {
                    responses: Vec::new(),
                    needed: needed.max(1),
                    handler,
                },
            );
            id
        };
        trace!(task_id = id, needed, "registered pending task");

        let registry = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let expired = {
                let mut inner = registry.inner.lock().expect("pending tasks lock poisoned");
                inner.tasks.remove(&id)
            };
            if let Some(task) = expired {
                debug!(
                    task_id = id,
                    accumulated = task.responses.len(),
                    "pending task timed out"
                );
                (task.handler)(TaskStatus::Timeout, task.responses);
            }
        });

        id
    }

    /// Record a response for `task_id`. Fires the handler with
    /// [`TaskStatus::Ok`] once the accumulator is full. Unknown ids are
    /// ignored (late responses after timeout or cancellation).
    pub fn complete(&self, task_id: u64, response: Message) {
        let finished = {
            let mut inner = self.inner.lock().expect("pending tasks lock poisoned");
            let Some(task) = inner.tasks.get_mut(&task_id) else {
                trace!(task_id, "response for unknown or expired task");
                return;
            };
            task.responses.push(response);
            if task.responses.len() >= task.needed {
                inner.tasks.remove(&task_id)
            } else {
                None
            }
        };
        if let Some(task) = finished {
            trace!(task_id, "pending task completed");
            (task.handler)(TaskStatus::Ok, task.responses);
        }
    }

    /// Drop a task without invoking its handler. Idempotent.
    pub fn cancel_task(&self, task_id: u64) {
        let mut inner = self.inner.lock().expect("pending tasks lock poisoned");
        if inner.tasks.remove(&task_id).is_some() {
            trace!(task_id, "pending task cancelled");
        }
    }

    /// Cancel every outstanding task, invoking each handler once with the
    /// given status and whatever responses accumulated.
    pub fn cancel_all(&self, status: TaskStatus) {
        let drained: Vec<Task> = {
            let mut inner = self.inner.lock().expect("pending tasks lock poisoned");
            inner.tasks.drain().map(|(_, task)| task).collect()
        };
        if !drained.is_empty() {
            debug!(count = drained.len(), ?status, "cancelling pending tasks");
        }
        for task in drained {
            (task.handler)(status, task.responses);
        }
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .expect("pending tasks lock poisoned")
            .tasks
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
