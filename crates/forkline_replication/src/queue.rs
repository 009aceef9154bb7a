//! FIFO task queues.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Runs submitted futures one after another, in submission order.
///
/// Every direction of a replication owns one queue, so a batch never starts
/// before the previous batch has been persisted. Jobs run on a worker task
/// whether or not anybody waits for them.
pub(crate) struct TaskQueue {
    name: &'static str,
    sender: mpsc::UnboundedSender<Job>,
    submitted: AtomicU64,
    completed: watch::Receiver<u64>,
    worker: JoinHandle<()>,
}

impl TaskQueue {
    /// Creates a queue and spawns its worker on the current tokio runtime.
    pub fn new(name: &'static str) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Job>();
        let (completed_tx, completed) = watch::channel(0u64);
        let worker = tokio::spawn(async move {
            while let Some(job) = receiver.recv().await {
                job.await;
                completed_tx.send_modify(|count| *count += 1);
            }
        });
        Self {
            name,
            sender,
            submitted: AtomicU64::new(0),
            completed,
            worker,
        }
    }

    /// Submits a job without waiting for it.
    pub fn push<F>(&self, job: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.submit(Box::pin(job))
    }

    fn submit(&self, job: Job) -> bool {
        self.submitted.fetch_add(1, Ordering::SeqCst);
        if self.sender.send(job).is_err() {
            self.submitted.fetch_sub(1, Ordering::SeqCst);
            return false;
        }
        true
    }

    /// Returns the number of submitted jobs that did not complete yet.
    pub fn pending(&self) -> u64 {
        let completed = *self.completed.borrow();
        self.submitted
            .load(Ordering::SeqCst)
            .saturating_sub(completed)
    }

    /// Waits until every job submitted before this call completed.
    pub async fn drained(&self) {
        let target = self.submitted.load(Ordering::SeqCst);
        let mut completed = self.completed.clone();
        // an error means the worker is gone and nothing will complete anymore
        let _done = completed.wait_for(|count| *count >= target).await.is_ok();
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("name", &self.name)
            .field("pending", &self.pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn jobs_run_in_order() {
        let queue = TaskQueue::new("test");
        let log = Arc::new(Mutex::new(Vec::new()));

        for i in 0..5u64 {
            let log = Arc::clone(&log);
            queue.push(async move {
                // later jobs sleep less; order must still hold
                tokio::time::sleep(Duration::from_millis(10 - 2 * i)).await;
                log.lock().push(i);
            });
        }

        queue.drained().await;
        assert_eq!(*log.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn pushed_jobs_run_without_awaiting() {
        let queue = TaskQueue::new("test");
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let log = Arc::clone(&log);
            assert!(queue.push(async move { log.lock().push(i) }));
        }
        queue.drained().await;
        assert_eq!(*log.lock(), vec![0, 1, 2]);
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn drained_waits_for_running_job() {
        let queue = TaskQueue::new("test");
        let done = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&done);
        queue.push(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            *flag.lock() = true;
        });
        queue.drained().await;
        assert!(*done.lock());
    }

    #[tokio::test]
    async fn pending_counts_unfinished_jobs() {
        let queue = TaskQueue::new("test");
        let gate = Arc::new(tokio::sync::Notify::new());
        let opened = Arc::clone(&gate);
        queue.push(async move { opened.notified().await });
        queue.push(async {});
        assert_eq!(queue.pending(), 2);

        gate.notify_one();
        queue.drained().await;
        assert_eq!(queue.pending(), 0);
    }
}
