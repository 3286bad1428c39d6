//! Background task executor
//!
//! A fixed-size pool of named worker threads. Every submitted job passes
//! through a [`TaskDecorator`] first; the default [`CorrelationPropagator`]
//! carries the submitter's correlation context over to the worker so the
//! job's log lines keep the request id of the request that spawned it.

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::config::ExecutorConfig;
use crate::correlation::{self, CorrelationContext};
use crate::error::{ReqlogError, Result};

/// Unit of work run on a worker thread
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Transforms a job before it is queued.
pub trait TaskDecorator: Send + Sync + 'static {
    fn decorate(&self, job: Job) -> Job;
}

/// Decorator restoring the submitter's correlation context on the worker.
///
/// The context is captured when the job is decorated; each job owns its own
/// copy. The worker's previous context is restored once the job returns.
#[derive(Debug, Clone, Copy, Default)]
pub struct CorrelationPropagator;

impl TaskDecorator for CorrelationPropagator {
    fn decorate(&self, job: Job) -> Job {
        match CorrelationContext::current() {
            Some(ctx) => Box::new(move || correlation::scope_sync(ctx, job)),
            None => job,
        }
    }
}

/// Fixed-size worker pool
pub struct TaskExecutor {
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    decorator: Arc<dyn TaskDecorator>,
    worker_count: usize,
}

impl TaskExecutor {
    /// Create an executor propagating correlation context to its jobs
    pub fn new(config: &ExecutorConfig) -> Result<Self> {
        Self::with_decorator(config, CorrelationPropagator)
    }

    /// Create an executor applying `decorator` to every submitted job
    pub fn with_decorator(config: &ExecutorConfig, decorator: impl TaskDecorator) -> Result<Self> {
        if config.workers == 0 {
            return Err(ReqlogError::InvalidConfig(
                "executor needs at least one worker".into(),
            ));
        }

        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));

        let mut workers = Vec::with_capacity(config.workers);
        for n in 1..=config.workers {
            let receiver = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("{}{}", config.thread_name_prefix, n))
                .spawn(move || worker_loop(receiver))?;
            workers.push(handle);
        }

        info!(
            "Task executor started with {} workers (prefix {:?})",
            config.workers, config.thread_name_prefix
        );

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            decorator: Arc::new(decorator),
            worker_count: config.workers,
        })
    }

    /// Queue a job; the decorator runs on the calling thread
    pub fn submit<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let job = self.decorator.decorate(Box::new(task));
        let sender = self.sender.lock();
        match sender.as_ref() {
            Some(sender) => sender.send(job).map_err(|_| ReqlogError::ExecutorClosed),
            None => Err(ReqlogError::ExecutorClosed),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Stop accepting jobs and wait for queued ones to finish
    pub fn shutdown(&self) {
        self.sender.lock().take();

        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in workers {
            if handle.join().is_err() {
                error!("Task executor worker terminated abnormally");
            }
        }
        info!("Task executor stopped");
    }
}

impl Drop for TaskExecutor {
    fn drop(&mut self) {
        // Workers exit once the queue is closed and drained
        self.sender.lock().take();
    }
}

fn worker_loop(receiver: Arc<Mutex<mpsc::Receiver<Job>>>) {
    loop {
        let job = receiver.lock().recv();
        match job {
            Ok(job) => {
                if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(job)) {
                    error!(panic = panic_message(&*panic), "Task panicked");
                }
            }
            Err(_) => break,
        }
    }
    debug!("Task executor worker exiting");
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}
