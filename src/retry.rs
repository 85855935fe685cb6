use log::debug;
use std::sync::Arc;
use std::time::Duration;

use crate::pool::{Scheduler, WorkerPool};

/// Backoff schedule for retried tasks.
///
/// The n-th retry waits `delays[n - 1]`; once the schedule is exhausted the
/// last delay repeats. An empty schedule retries immediately.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RetryPolicy {
    delays: Vec<Duration>,
}

impl RetryPolicy {
    pub fn new(delays: Vec<Duration>) -> Self {
        Self { delays }
    }

    pub fn from_millis(delays: &[u64]) -> Self {
        Self::new(delays.iter().copied().map(Duration::from_millis).collect())
    }

    /// A policy that resubmits without waiting.
    pub fn immediate() -> Self {
        Self::default()
    }

    /// Delay before the retry that follows `failed_attempts` failures.
    pub fn delay_for(&self, failed_attempts: u32) -> Duration {
        if self.delays.is_empty() {
            return Duration::ZERO;
        }
        let index = (failed_attempts.saturating_sub(1) as usize).min(self.delays.len() - 1);
        self.delays[index]
    }
}

/// What a retryable task tells its driver after one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    /// The task finished (successfully or not) and must not run again.
    Done,
    /// The task is not done and wants to be resubmitted after a backoff.
    Retry,
}

/// A task that is run once per attempt by [`spawn_retrying`].
///
/// Tasks never loop internally: backoff and thread reuse are left to the
/// driver, the [`WorkerPool`] and the [`Scheduler`].
pub trait Retryable: Send + 'static {
    fn try_once(&mut self) -> Attempt;

    /// How many times `try_once` has run.
    fn attempts(&self) -> u32;

    /// Short description used in diagnostics.
    fn describe(&self) -> String;
}

/// Submits `task` to `pool` and keeps resubmitting it through `scheduler`
/// until it reports [`Attempt::Done`].
pub fn spawn_retrying<T: Retryable>(
    task: T,
    pool: Arc<dyn WorkerPool>,
    scheduler: Arc<dyn Scheduler>,
    policy: Arc<RetryPolicy>,
) {
    let submit_to = Arc::clone(&pool);
    submit_to.submit(Box::new(move || run_attempt(task, pool, scheduler, policy)));
}

fn run_attempt<T: Retryable>(
    mut task: T,
    pool: Arc<dyn WorkerPool>,
    scheduler: Arc<dyn Scheduler>,
    policy: Arc<RetryPolicy>,
) {
    match task.try_once() {
        Attempt::Done => {
            debug!("{} done after {} attempt(s)", task.describe(), task.attempts());
        }
        Attempt::Retry => {
            let delay = policy.delay_for(task.attempts());
            debug!(
                "{} not done after attempt {}, retrying in {:?}",
                task.describe(),
                task.attempts(),
                delay
            );
            let retry_scheduler = Arc::clone(&scheduler);
            scheduler.schedule_retry(
                Box::new(move || spawn_retrying(task, pool, retry_scheduler, policy)),
                delay,
            );
        }
    }
}
