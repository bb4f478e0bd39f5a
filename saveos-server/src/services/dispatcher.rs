use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

/// A job id handed to the worker pool.
#[derive(Debug, Clone)]
pub struct QueuedTask {
    pub task_id: Uuid,
    pub job_id: i64,
    pub enqueued_at: DateTime<Utc>,
}

/// Identifies an accepted task in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskHandle(pub Uuid);

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("job queue is full")]
    QueueFull,

    #[error("job queue is closed")]
    QueueClosed,
}

pub type TaskReceiver = Arc<Mutex<mpsc::Receiver<QueuedTask>>>;

/// Bounded in-process queue between request handlers and workers. Only job
/// ids travel through it; workers reload the job from the database.
#[derive(Clone)]
pub struct Dispatcher {
    tx: mpsc::Sender<QueuedTask>,
}

impl Dispatcher {
    pub fn new(capacity: usize) -> (Self, TaskReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, Arc::new(Mutex::new(rx)))
    }

    /// Never blocks: a full queue is reported instead of waited on.
    pub fn enqueue(&self, job_id: i64) -> Result<TaskHandle, DispatchError> {
        let task = QueuedTask {
            task_id: Uuid::new_v4(),
            job_id,
            enqueued_at: Utc::now(),
        };
        let handle = TaskHandle(task.task_id);

        self.tx.try_send(task).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DispatchError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => DispatchError::QueueClosed,
        })?;

        tracing::debug!(job_id, task_id = %handle.0, "Job enqueued");
        Ok(handle)
    }

    pub fn depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tasks_arrive_in_order() {
        let (dispatcher, rx) = Dispatcher::new(4);
        dispatcher.enqueue(1).unwrap();
        dispatcher.enqueue(2).unwrap();
        assert_eq!(dispatcher.depth(), 2);

        let mut rx = rx.lock().await;
        assert_eq!(rx.recv().await.unwrap().job_id, 1);
        assert_eq!(rx.recv().await.unwrap().job_id, 2);
    }

    #[tokio::test]
    async fn full_queue_is_reported() {
        let (dispatcher, _rx) = Dispatcher::new(1);
        dispatcher.enqueue(1).unwrap();
        assert!(matches!(dispatcher.enqueue(2), Err(DispatchError::QueueFull)));
    }

    #[tokio::test]
    async fn closed_queue_is_reported() {
        let (dispatcher, rx) = Dispatcher::new(1);
        drop(rx);
        assert!(matches!(dispatcher.enqueue(1), Err(DispatchError::QueueClosed)));
    }
}
