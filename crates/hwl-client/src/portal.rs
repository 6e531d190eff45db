//! Blocking bridge into async client code
//!
//! A [`Portal`] owns a worker thread running a single-threaded tokio
//! runtime. Synchronous callers hand it futures and block until the result
//! comes back, so client trees can be used from code with no runtime.

use std::future::Future;
use std::pin::Pin;
use std::thread::JoinHandle;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Errors from the portal itself, not from the submitted work
#[derive(Error, Debug)]
pub enum PortalError {
    /// The worker thread is gone
    #[error("Portal is stopped")]
    Stopped,

    /// The worker runtime could not be created
    #[error("Failed to start portal runtime: {0}")]
    Runtime(#[from] std::io::Error),
}

/// Worker thread executing futures on behalf of synchronous callers
pub struct Portal {
    jobs: Option<mpsc::UnboundedSender<Job>>,
    worker: Option<JoinHandle<()>>,
}

impl Portal {
    /// Start the worker thread
    pub fn start() -> Result<Self, PortalError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let (jobs, mut queue) = mpsc::unbounded_channel::<Job>();

        let worker = std::thread::Builder::new()
            .name("hwl-portal".to_string())
            .spawn(move || {
                runtime.block_on(async move {
                    while let Some(job) = queue.recv().await {
                        tokio::spawn(job);
                    }
                });
                tracing::debug!("Portal worker exiting");
            })?;

        Ok(Self {
            jobs: Some(jobs),
            worker: Some(worker),
        })
    }

    /// Run `future` on the worker and block until it completes
    ///
    /// Must not be called from inside an async runtime.
    pub fn call<F, T>(&self, future: F) -> Result<T, PortalError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.spawn(async move {
            let _ = tx.send(future.await);
        })?;
        rx.blocking_recv().map_err(|_| PortalError::Stopped)
    }

    /// Run `future` on the worker without waiting for it
    pub fn spawn<F>(&self, future: F) -> Result<(), PortalError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let jobs = self.jobs.as_ref().ok_or(PortalError::Stopped)?;
        jobs.send(Box::pin(future)).map_err(|_| PortalError::Stopped)
    }

    /// Stop accepting work, abandon running futures and join the worker
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.jobs = None;
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::warn!("Portal worker panicked");
            }
        }
    }
}

impl Drop for Portal {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_call_blocks_for_result() {
        let portal = Portal::start().unwrap();
        let value = portal
            .call(async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                21 * 2
            })
            .unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn test_concurrent_jobs_share_runtime() {
        let portal = Portal::start().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel::<u32>();

        portal
            .spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                let _ = tx.send(7);
            })
            .unwrap();

        let got = portal.call(async move { rx.await.unwrap_or_default() }).unwrap();
        assert_eq!(got, 7);
        portal.stop();
    }
}
