//! Dispatch queue and dispatch thread
//!
//! One thread owns a context `C` (bus connections, the subscription
//! registry) and runs every job against it. Caller threads hand jobs over
//! through a bounded [`DispatchQueue`]; submission never blocks and fails
//! fast when the queue is full or the thread is gone.
//!
//! ```text
//!  caller ──try_send──▶ [ bounded queue ] ──▶ dispatch thread ──▶ &mut C
//!                                              ▲
//!  bus match tasks ──schedule──▶ [ local queue ]┘
//! ```
//!
//! The thread runs a current-thread runtime inside a `LocalSet`, so jobs
//! may spawn `!Send` tasks (pending method calls, match forwarders). Those
//! tasks get back to the context through a [`LocalHandle`].

use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use futures::future::LocalBoxFuture;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Notify;
use tokio::task::LocalSet;
use tracing::{debug, error, info, warn};

use crate::error::{BridgeError, Result};

/// Job run on the dispatch thread with exclusive access to the context
pub type Job<C> = Box<dyn for<'c> FnOnce(&'c mut C) -> LocalBoxFuture<'c, ()> + Send>;

type LocalJob<C> = Box<dyn FnOnce(&mut C)>;

/// Box a closure as a [`Job`]
pub fn job<C, F>(f: F) -> Job<C>
where
    F: for<'c> FnOnce(&'c mut C) -> LocalBoxFuture<'c, ()> + Send + 'static,
{
    Box::new(f)
}

/// Sending half of the dispatch queue, cloneable across threads
pub struct DispatchQueue<C> {
    sender: mpsc::Sender<Job<C>>,
    capacity: usize,
}

impl<C> Clone for DispatchQueue<C> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            capacity: self.capacity,
        }
    }
}

impl<C: 'static> DispatchQueue<C> {
    /// Enqueue `job` without waiting.
    ///
    /// Jobs run in submission order. A rejected job is dropped unrun.
    pub fn submit(&self, job: Job<C>) -> Result<()> {
        self.sender.try_send(job).map_err(|e| match e {
            TrySendError::Full(_) => {
                warn!(capacity = self.capacity, "Dispatch queue full, job rejected");
                BridgeError::Overloaded {
                    capacity: self.capacity,
                }
            }
            TrySendError::Closed(_) => {
                warn!("Dispatch loop not running, job rejected");
                BridgeError::ServiceUnavailable
            }
        })
    }

    pub fn is_running(&self) -> bool {
        !self.sender.is_closed()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Jobs waiting to be picked up
    pub fn pending(&self) -> usize {
        self.capacity - self.sender.capacity()
    }
}

/// Schedules synchronous work on the dispatch thread from local tasks
pub struct LocalHandle<C> {
    sender: mpsc::UnboundedSender<LocalJob<C>>,
}

impl<C> Clone for LocalHandle<C> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<C: 'static> LocalHandle<C> {
    /// Run `f` against the context before the next queued job.
    ///
    /// Returns false once the dispatch loop has stopped.
    pub fn schedule(&self, f: impl FnOnce(&mut C) + 'static) -> bool {
        self.sender.send(Box::new(f)).is_ok()
    }
}

/// Owner of the dispatch thread
pub struct Dispatcher<C> {
    queue: DispatchQueue<C>,
    shutdown: Arc<Notify>,
    thread: Option<JoinHandle<()>>,
}

impl<C: 'static> Dispatcher<C> {
    /// Start the dispatch thread and build its context there.
    ///
    /// Returns once the context exists, or with the error `make_ctx` failed
    /// with.
    pub fn spawn<F>(name: &str, capacity: usize, make_ctx: F) -> Result<Self>
    where
        F: FnOnce(LocalHandle<C>) -> Result<C> + Send + 'static,
    {
        if capacity == 0 {
            return Err(BridgeError::Config("dispatch queue capacity must be positive".into()));
        }

        let (sender, receiver) = mpsc::channel(capacity);
        let shutdown = Arc::new(Notify::new());
        let (ready_tx, ready_rx) = std_mpsc::sync_channel(1);

        let thread_shutdown = shutdown.clone();
        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = ready_tx.send(Err(BridgeError::Internal(format!(
                            "dispatch runtime: {e}"
                        ))));
                        return;
                    }
                };
                let local = LocalSet::new();
                local.block_on(
                    &runtime,
                    run_loop(receiver, thread_shutdown, make_ctx, ready_tx),
                );
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                info!(name, capacity, "Dispatch thread started");
                Ok(Self {
                    queue: DispatchQueue { sender, capacity },
                    shutdown,
                    thread: Some(thread),
                })
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(BridgeError::Internal("dispatch thread exited during startup".into()))
            }
        }
    }

    pub fn queue(&self) -> DispatchQueue<C> {
        self.queue.clone()
    }

    /// Stop the loop and wait for the thread; queued jobs are dropped unrun
    pub fn shutdown(mut self) {
        self.stop();
    }
}

impl<C> Dispatcher<C> {
    fn stop(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.shutdown.notify_one();
            if thread.join().is_err() {
                error!("Dispatch thread panicked");
            }
        }
    }
}

impl<C> Drop for Dispatcher<C> {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_loop<C, F>(
    mut jobs: mpsc::Receiver<Job<C>>,
    shutdown: Arc<Notify>,
    make_ctx: F,
    ready: std_mpsc::SyncSender<Result<()>>,
) where
    C: 'static,
    F: FnOnce(LocalHandle<C>) -> Result<C>,
{
    let (local_tx, mut local_rx) = mpsc::unbounded_channel::<LocalJob<C>>();
    let mut ctx = match make_ctx(LocalHandle { sender: local_tx }) {
        Ok(ctx) => ctx,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    let _ = ready.send(Ok(()));

    loop {
        tokio::select! {
            biased;
            _ = shutdown.notified() => {
                debug!("Dispatch loop shutdown requested");
                break;
            }
            Some(local) = local_rx.recv() => local(&mut ctx),
            next = jobs.recv() => match next {
                Some(job) => job(&mut ctx).await,
                None => {
                    debug!("All dispatch queue senders dropped");
                    break;
                }
            },
        }
    }

    jobs.close();
    drop(ctx);
    info!("Dispatch loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    #[test]
    fn test_zero_capacity_rejected() {
        let result = Dispatcher::<Vec<u32>>::spawn("dispatch-test", 0, |_| Ok(Vec::new()));
        assert!(matches!(result, Err(BridgeError::Config(_))));
    }

    #[test]
    fn test_context_failure_surfaces() {
        let result = Dispatcher::<Vec<u32>>::spawn("dispatch-test", 1, |_| {
            Err(BridgeError::Internal("no context".into()))
        });
        assert!(matches!(result, Err(BridgeError::Internal(_))));
    }

    #[test]
    fn test_submit_after_shutdown_is_unavailable() {
        let dispatcher =
            Dispatcher::<Vec<u32>>::spawn("dispatch-test", 2, |_| Ok(Vec::new())).unwrap();
        let queue = dispatcher.queue();
        assert!(queue.is_running());
        dispatcher.shutdown();

        assert!(!queue.is_running());
        let result = queue.submit(job(|ctx: &mut Vec<u32>| {
            async move { ctx.push(1) }.boxed_local()
        }));
        assert!(matches!(result, Err(BridgeError::ServiceUnavailable)));
    }
}
