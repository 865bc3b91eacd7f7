//! Fixed-size pool of supervised OS-thread workers.
//!
//! Admission is a two-level rendezvous. Each idle worker sends a fresh
//! single-use inbox into a bounded channel and blocks on it. A dispatcher
//! takes one inbox at a time (under an async mutex) and hands the job over.
//! A worker only announces itself again once its job is done, so at most
//! `size` jobs run at any moment.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use log::{error, info, warn};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};

use crate::common::errors::ResizeError;

/// How often shutdown re-checks for workers that died without announcing.
const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

/// A unit of work a pool worker can drive to completion.
pub trait Task: Send + 'static {
    type Output: Send + 'static;

    fn run(self) -> impl Future<Output = Self::Output> + Send;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("worker panicked while running the job: {0}")]
    WorkerPanicked(String),
    #[error("worker pool is shut down")]
    ShutDown,
}

impl From<PoolError> for ResizeError {
    fn from(err: PoolError) -> Self {
        ResizeError::Internal(err.to_string())
    }
}

pub type JobResult<T> = Result<<T as Task>::Output, PoolError>;

/// Receiving half of a job's reply channel.
pub type JobReply<T> = oneshot::Receiver<JobResult<T>>;

/// A task paired with the channel its single result is sent on.
pub struct Job<T: Task> {
    task: T,
    reply: oneshot::Sender<JobResult<T>>,
}

impl<T: Task> Job<T> {
    pub fn new(task: T) -> (Self, JobReply<T>) {
        let (reply, rx) = oneshot::channel();
        (Self { task, reply }, rx)
    }

    fn reject(self, err: PoolError) {
        // The caller may have stopped waiting.
        let _ = self.reply.send(Err(err));
    }
}

enum Signal<T: Task> {
    Run(Job<T>),
    Stop,
}

type Inbox<T> = oneshot::Sender<Signal<T>>;

enum Exit {
    Stopped,
    Panicked,
}

pub struct WorkerPool<T: Task> {
    size: usize,
    handle: Handle,
    ready_tx: Mutex<Option<mpsc::Sender<Inbox<T>>>>,
    ready_rx: tokio::sync::Mutex<mpsc::Receiver<Inbox<T>>>,
    closed: AtomicBool,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: Task> WorkerPool<T> {
    /// `handle` is the runtime workers drive task futures on.
    pub fn new(size: usize, handle: Handle) -> Self {
        let size = size.max(1);
        let (ready_tx, ready_rx) = mpsc::channel(size);
        Self {
            size,
            handle,
            ready_tx: Mutex::new(Some(ready_tx)),
            ready_rx: tokio::sync::Mutex::new(ready_rx),
            closed: AtomicBool::new(false),
            threads: Mutex::new(Vec::with_capacity(size)),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Start the worker threads. Can only be called once.
    pub fn run(&self) -> Result<()> {
        let ready = self
            .ready_tx
            .lock()
            .map_err(|_| anyhow::anyhow!("worker pool state poisoned"))?
            .take();
        let Some(ready) = ready else {
            bail!("worker pool already started");
        };

        let mut threads = self
            .threads
            .lock()
            .map_err(|_| anyhow::anyhow!("worker pool state poisoned"))?;
        for id in 0..self.size {
            let ready = ready.clone();
            let handle = self.handle.clone();
            let thread = thread::Builder::new()
                .name(format!("resize-worker-{id}"))
                .spawn(move || worker_loop(id, ready, handle))
                .with_context(|| format!("Failed to spawn resize-worker-{id}"))?;
            threads.push(thread);
        }
        info!("Started {} resize workers", self.size);
        Ok(())
    }

    /// Wait for an idle worker and hand `job` to it. The outcome arrives on
    /// the job's reply channel.
    pub async fn dispatch(&self, job: Job<T>) {
        if self.closed.load(Ordering::Acquire) {
            job.reject(PoolError::ShutDown);
            return;
        }

        let mut ready = self.ready_rx.lock().await;
        let mut job = job;
        loop {
            if self.closed.load(Ordering::Acquire) {
                job.reject(PoolError::ShutDown);
                return;
            }
            let Some(inbox) = ready.recv().await else {
                job.reject(PoolError::ShutDown);
                return;
            };
            match inbox.send(Signal::Run(job)) {
                Ok(()) => return,
                // The worker went away between announcing and receiving.
                Err(Signal::Run(returned)) => job = returned,
                Err(Signal::Stop) => return,
            }
        }
    }

    /// Threads that have not returned yet.
    fn live_workers(&self) -> usize {
        match self.threads.lock() {
            Ok(threads) => threads.iter().filter(|t| !t.is_finished()).count(),
            Err(_) => 0,
        }
    }

    /// Stop admitting jobs, let in-flight jobs finish, stop every worker and
    /// join the threads. A worker thread that died without announcing itself
    /// is not waited for.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        if let Ok(mut ready_tx) = self.ready_tx.lock() {
            ready_tx.take();
        }

        {
            let mut ready = self.ready_rx.lock().await;
            let mut poll = tokio::time::interval(SHUTDOWN_POLL);
            while self.live_workers() > 0 {
                tokio::select! {
                    inbox = ready.recv() => match inbox {
                        Some(inbox) => {
                            let _ = inbox.send(Signal::Stop);
                        }
                        None => break,
                    },
                    _ = poll.tick() => {}
                }
            }
        }

        let threads = match self.threads.lock() {
            Ok(mut threads) => std::mem::take(&mut *threads),
            Err(_) => {
                error!("Worker pool state poisoned, skipping join");
                return;
            }
        };
        let joined = tokio::task::spawn_blocking(move || {
            for thread in threads {
                let name = thread.thread().name().unwrap_or("resize-worker").to_string();
                if thread.join().is_err() {
                    error!("{} exited abnormally", name);
                }
            }
        })
        .await;
        if let Err(err) = joined {
            error!("Failed to join resize workers: {}", err);
        }
        info!("Resize workers stopped");
    }
}

fn worker_loop<T: Task>(id: usize, ready: mpsc::Sender<Inbox<T>>, handle: Handle) {
    loop {
        match serve(&ready, &handle) {
            Exit::Stopped => break,
            Exit::Panicked => warn!("resize-worker-{} restarting after a panic", id),
        }
    }
}

fn serve<T: Task>(ready: &mpsc::Sender<Inbox<T>>, handle: &Handle) -> Exit {
    loop {
        let (inbox, signal) = oneshot::channel();
        if ready.blocking_send(inbox).is_err() {
            return Exit::Stopped;
        }
        let Job { task, reply } = match signal.blocking_recv() {
            Ok(Signal::Run(job)) => job,
            Ok(Signal::Stop) => return Exit::Stopped,
            // Dispatcher dropped the inbox unused; announce again.
            Err(_) => continue,
        };

        match catch_unwind(AssertUnwindSafe(|| handle.block_on(task.run()))) {
            Ok(output) => {
                let _ = reply.send(Ok(output));
            }
            Err(payload) => {
                let message = panic_message(payload);
                error!("Worker panicked while running a job: {}", message);
                let _ = reply.send(Err(PoolError::WorkerPanicked(message)));
                return Exit::Panicked;
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        return (*message).to_string();
    }
    if let Some(message) = payload.downcast_ref::<String>() {
        return message.clone();
    }
    "non-string panic payload".to_string()
}
