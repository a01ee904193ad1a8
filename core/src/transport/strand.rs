// Strand — serialized execution queue
//
// Jobs posted to one strand run strictly one after another, in posting
// order, on whichever runtime worker picks up the strand's task. Distinct
// strands run concurrently. Closing a strand drops every queued job.

use super::TransportError;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::future::Future;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

type Job = BoxFuture<'static, ()>;

pub struct Strand {
    sender: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Strand {
    /// Must be called from within a Tokio runtime.
    pub fn new() -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Job>();
        let worker = tokio::spawn(async move {
            while let Some(job) = receiver.recv().await {
                job.await;
            }
        });

        Self {
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Queue a job without waiting for it.
    pub fn post<F>(&self, job: F) -> Result<(), TransportError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let sender = self.sender.lock();
        let sender = sender.as_ref().ok_or(TransportError::Closed)?;
        sender.send(job.boxed()).map_err(|_| TransportError::Closed)
    }

    /// Queue a job and wait for its result.
    pub async fn run<F, T>(&self, job: F) -> Result<T, TransportError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.post(async move {
            let _ = tx.send(job.await);
        })?;
        rx.await.map_err(|_| TransportError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.sender.lock().is_none()
    }

    /// Stop accepting jobs and cancel whatever is queued or running.
    pub fn close(&self) {
        self.sender.lock().take();
        if let Some(worker) = self.worker.lock().take() {
            worker.abort();
        }
    }

    /// Stop accepting jobs and wait for the queued ones to finish.
    pub async fn drain(&self) {
        self.sender.lock().take();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }
}

impl Default for Strand {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Strand {
    fn drop(&mut self) {
        self.close();
    }
}
