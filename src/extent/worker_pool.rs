use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

/// Bounded set of workers that run pipeline drains. Each task holds one permit for its whole run.
#[derive(Clone)]
pub(crate) struct WorkerPool {
    permits: Arc<Semaphore>,
}

impl WorkerPool {
    pub(crate) fn new(size: usize) -> Self {
        WorkerPool {
            permits: Arc::new(Semaphore::new(size)),
        }
    }

    pub(crate) fn spawn<F>(&self, task: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permits = self.permits.clone();
        tokio::spawn(async move {
            // The semaphore is never closed.
            let _permit = permits.acquire_owned().await;
            task.await;
        })
    }

    pub(crate) fn available(&self) -> usize {
        self.permits.available_permits()
    }
}
