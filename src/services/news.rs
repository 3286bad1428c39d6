//! Demo news service
//!
//! Produces the business log lines of the demo endpoints, some of them from
//! the task executor, so the correlation id can be followed across threads.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rand::Rng;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::correlation;
use crate::error::Result;
use crate::executor::TaskExecutor;
use crate::models::FakeNews;
use crate::telemetry::{LogData, Tag};

/// Reply of the async greeting job
pub const GREETING: &str = "Hello World !!";

#[derive(Clone)]
pub struct NewsService {
    executor: Arc<TaskExecutor>,
    max_async_delay: Duration,
}

impl NewsService {
    pub fn new(executor: Arc<TaskExecutor>, max_async_delay: Duration) -> Self {
        Self {
            executor,
            max_async_delay,
        }
    }

    pub fn executor(&self) -> &TaskExecutor {
        &self.executor
    }

    pub fn get_fake_news(&self) -> FakeNews {
        let news = FakeNews::new(1, "U23 Việt Nam vô địch!");
        LogData::new(Tag::Gateway, &news).emit(&format!("Return news: {:?}", news));
        news
    }

    /// Run a background job; job 1 spawns a sub task of its own
    pub fn some_async_job(&self, id: u32) -> Result<()> {
        let executor = self.executor.clone();
        self.executor.submit(move || {
            LogData::new(Tag::AsyncJob, id).emit(&format!("Doing in async job id={}", id));
            if id == 1 {
                if let Err(e) = executor.submit(|| info!("Executing sub task of fake news")) {
                    warn!(error = %e, "Sub task rejected");
                }
            }
        })
    }

    /// Record the submitted jobs from a runtime task.
    ///
    /// The spawned task carries the caller's correlation context.
    pub fn spawn_audit(&self, jobs: u32) -> JoinHandle<()> {
        tokio::spawn(correlation::propagate(async move {
            LogData::new(Tag::AsyncJob, jobs).emit("Async jobs submitted");
        }))
    }

    /// Job producing the greeting after a random delay
    pub fn greeting_job(&self) -> impl FnOnce() -> &'static str + Send + 'static {
        let max_delay = self.max_async_delay;
        move || {
            info!("Async endpoint: started!");
            thread::sleep(random_delay(max_delay));
            info!("Async endpoint: completed!");
            GREETING
        }
    }
}

fn random_delay(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..max_ms))
}
