//! In-process task queue - connects webhook/API handlers to background workers
//!
//! Producers enqueue [`Task`]s through a cloneable [`TaskQueue`]; a fixed pool
//! of tokio workers pulls them from a shared receiver and runs them through a
//! [`TaskHandler`]. Each run is bounded by a time limit, and webhook payload
//! processing is retried after a delay.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::CrmConfig;
use crate::storage::StorageError;

/// Background work items
#[derive(Debug, Clone, PartialEq)]
pub enum Task {
    ProcessWebhookPayload {
        payload: Value,
        phone_number_id: String,
    },
    ProcessIncomingMessage {
        message: Value,
        phone_number_id: String,
        profile_name: Option<String>,
    },
    ProcessStatusUpdate {
        status: Value,
    },
    ProcessAiResponse {
        conversation_id: String,
    },
    SendMessage {
        message_id: String,
    },
    SendTemplate {
        message_id: String,
        name: String,
        language: String,
        components: Value,
    },
}

impl Task {
    pub fn name(&self) -> &'static str {
        match self {
            Task::ProcessWebhookPayload { .. } => "process_webhook_payload",
            Task::ProcessIncomingMessage { .. } => "process_incoming_message",
            Task::ProcessStatusUpdate { .. } => "process_status_update",
            Task::ProcessAiResponse { .. } => "process_ai_response",
            Task::SendMessage { .. } => "send_message",
            Task::SendTemplate { .. } => "send_template",
        }
    }

    /// Only webhook payload fan-out is retried
    fn retryable(&self) -> bool {
        matches!(self, Task::ProcessWebhookPayload { .. })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Invalid task payload: {0}")]
    InvalidPayload(String),

    #[error("Task exceeded time limit of {0:?}")]
    TimedOut(Duration),

    #[error("Queue closed")]
    QueueClosed,
}

/// Runs tasks pulled from the queue
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: Task) -> Result<(), TaskError>;
}

/// Queued task with delivery bookkeeping
#[derive(Debug)]
struct Envelope {
    id: Uuid,
    attempt: u32,
    task: Task,
}

/// Producer handle
#[derive(Clone)]
pub struct TaskQueue {
    tx: mpsc::UnboundedSender<Envelope>,
}

/// Consumer side, handed to the worker pool
pub struct TaskReceiver {
    rx: mpsc::UnboundedReceiver<Envelope>,
}

impl TaskQueue {
    pub fn new() -> (Self, TaskReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, TaskReceiver { rx })
    }

    /// Enqueue a task for a worker
    pub fn enqueue(&self, task: Task) -> Result<Uuid, TaskError> {
        let id = Uuid::new_v4();
        debug!("Enqueuing {} ({})", task.name(), id);
        self.send(Envelope {
            id,
            attempt: 0,
            task,
        })?;
        Ok(id)
    }

    fn send(&self, envelope: Envelope) -> Result<(), TaskError> {
        self.tx.send(envelope).map_err(|_| TaskError::QueueClosed)
    }
}

impl TaskReceiver {
    /// Next task already waiting, without blocking
    #[cfg(test)]
    pub fn try_next(&mut self) -> Option<Task> {
        self.rx.try_recv().ok().map(|envelope| envelope.task)
    }

    /// Drain every waiting task
    #[cfg(test)]
    pub fn drain(&mut self) -> Vec<Task> {
        std::iter::from_fn(|| self.try_next()).collect()
    }
}

/// Worker pool settings
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub worker_count: usize,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub time_limit: Duration,
}

impl WorkerSettings {
    pub fn from_config(config: &CrmConfig) -> Self {
        Self {
            worker_count: config.worker_count.max(1),
            max_retries: config.task_max_retries,
            retry_delay: config.task_retry_delay(),
            time_limit: config.task_time_limit(),
        }
    }
}

/// Spawn the worker pool
pub fn start_workers(
    queue: TaskQueue,
    receiver: TaskReceiver,
    handler: Arc<dyn TaskHandler>,
    settings: WorkerSettings,
) -> Vec<JoinHandle<()>> {
    let rx = Arc::new(Mutex::new(receiver.rx));
    info!("Starting {} task workers", settings.worker_count);

    (0..settings.worker_count)
        .map(|worker_id| {
            let rx = rx.clone();
            let queue = queue.clone();
            let handler = handler.clone();
            let settings = settings.clone();
            tokio::spawn(async move {
                worker_loop(worker_id, rx, queue, handler, settings).await;
            })
        })
        .collect()
}

async fn worker_loop(
    worker_id: usize,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Envelope>>>,
    queue: TaskQueue,
    handler: Arc<dyn TaskHandler>,
    settings: WorkerSettings,
) {
    loop {
        let next = { rx.lock().await.recv().await };
        let Some(envelope) = next else {
            debug!("Worker {} stopping: queue closed", worker_id);
            return;
        };

        run_envelope(worker_id, envelope, &queue, handler.as_ref(), &settings).await;
    }
}

async fn run_envelope(
    worker_id: usize,
    envelope: Envelope,
    queue: &TaskQueue,
    handler: &dyn TaskHandler,
    settings: &WorkerSettings,
) {
    let name = envelope.task.name();
    debug!(
        "Worker {} running {} ({}, attempt {})",
        worker_id,
        name,
        envelope.id,
        envelope.attempt + 1
    );

    let result = match tokio::time::timeout(settings.time_limit, handler.handle(envelope.task.clone()))
        .await
    {
        Ok(result) => result,
        Err(_) => Err(TaskError::TimedOut(settings.time_limit)),
    };

    let Err(e) = result else {
        debug!("Task {} ({}) finished", name, envelope.id);
        return;
    };

    if envelope.task.retryable() && envelope.attempt < settings.max_retries {
        warn!(
            "Task {} ({}) failed: {}; retrying in {:?} ({}/{})",
            name,
            envelope.id,
            e,
            settings.retry_delay,
            envelope.attempt + 1,
            settings.max_retries
        );
        let queue = queue.clone();
        let delay = settings.retry_delay;
        let retry = Envelope {
            id: envelope.id,
            attempt: envelope.attempt + 1,
            task: envelope.task,
        };
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if queue.send(retry).is_err() {
                warn!("Dropping retry of {}: queue closed", name);
            }
        });
    } else {
        error!("Task {} ({}) failed: {}", name, envelope.id, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as SyncMutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn settings() -> WorkerSettings {
        WorkerSettings {
            worker_count: 2,
            max_retries: 3,
            retry_delay: Duration::from_millis(10),
            time_limit: Duration::from_millis(200),
        }
    }

    /// Fails the first `failures` runs, then records the task
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
        done: SyncMutex<Vec<Task>>,
    }

    #[async_trait]
    impl TaskHandler for Flaky {
        async fn handle(&self, task: Task) -> Result<(), TaskError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(TaskError::InvalidPayload("boom".into()));
            }
            self.done.lock().push(task);
            Ok(())
        }
    }

    struct Sleepy;

    #[async_trait]
    impl TaskHandler for Sleepy {
        async fn handle(&self, _task: Task) -> Result<(), TaskError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        }
    }

    async fn wait_for(condition: impl Fn() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    fn webhook_task() -> Task {
        Task::ProcessWebhookPayload {
            payload: serde_json::json!({"entry": []}),
            phone_number_id: "1001".into(),
        }
    }

    #[test]
    fn test_enqueue_and_drain() {
        let (queue, mut receiver) = TaskQueue::new();
        queue
            .enqueue(Task::SendMessage {
                message_id: "m1".into(),
            })
            .unwrap();
        queue
            .enqueue(Task::ProcessAiResponse {
                conversation_id: "c1".into(),
            })
            .unwrap();

        let tasks = receiver.drain();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].name(), "send_message");
        assert!(receiver.try_next().is_none());
    }

    #[test]
    fn test_enqueue_after_close() {
        let (queue, receiver) = TaskQueue::new();
        drop(receiver);
        assert!(matches!(
            queue.enqueue(webhook_task()),
            Err(TaskError::QueueClosed)
        ));
    }

    #[tokio::test]
    async fn test_webhook_task_retried_until_success() {
        let (queue, receiver) = TaskQueue::new();
        let handler = Arc::new(Flaky {
            failures: 2,
            calls: AtomicU32::new(0),
            done: SyncMutex::new(Vec::new()),
        });
        let workers = start_workers(queue.clone(), receiver, handler.clone(), settings());

        queue.enqueue(webhook_task()).unwrap();
        wait_for(|| !handler.done.lock().is_empty()).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);

        workers.iter().for_each(|w| w.abort());
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let (queue, receiver) = TaskQueue::new();
        let handler = Arc::new(Flaky {
            failures: u32::MAX,
            calls: AtomicU32::new(0),
            done: SyncMutex::new(Vec::new()),
        });
        let workers = start_workers(queue.clone(), receiver, handler.clone(), settings());

        queue.enqueue(webhook_task()).unwrap();
        // first run + 3 retries
        wait_for(|| handler.calls.load(Ordering::SeqCst) == 4).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 4);

        workers.iter().for_each(|w| w.abort());
    }

    #[tokio::test]
    async fn test_other_tasks_not_retried() {
        let (queue, receiver) = TaskQueue::new();
        let handler = Arc::new(Flaky {
            failures: 1,
            calls: AtomicU32::new(0),
            done: SyncMutex::new(Vec::new()),
        });
        let workers = start_workers(queue.clone(), receiver, handler.clone(), settings());

        queue
            .enqueue(Task::SendMessage {
                message_id: "m1".into(),
            })
            .unwrap();
        wait_for(|| handler.calls.load(Ordering::SeqCst) == 1).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert!(handler.done.lock().is_empty());

        workers.iter().for_each(|w| w.abort());
    }

    #[tokio::test]
    async fn test_time_limit_applies() {
        let (queue, mut receiver) = TaskQueue::new();
        let mut settings = settings();
        settings.max_retries = 0;

        let envelope = Envelope {
            id: Uuid::new_v4(),
            attempt: 0,
            task: webhook_task(),
        };
        let started = std::time::Instant::now();
        run_envelope(0, envelope, &queue, &Sleepy, &settings).await;
        assert!(started.elapsed() < Duration::from_secs(2));
        // retries exhausted, nothing requeued
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(receiver.try_next().is_none());
    }
}
