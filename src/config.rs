use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::retry::RetryPolicy;

/// Tunables of a [`Coordinator`](crate::Coordinator).
///
/// Every field has a default, so partial configurations deserialize.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Threads in the default worker pool.
    pub worker_threads: usize,
    /// Attempts a prepare task makes before assuming `Aborted`.
    pub prepare_max_attempts: u32,
    /// Attempts an abort task makes before assuming `Aborted`.
    pub abort_max_attempts: u32,
    /// Attempts a commit task makes. `None` retries forever.
    pub commit_max_attempts: Option<u32>,
    /// Backoff between participant task attempts, in milliseconds.
    pub retry_delays_ms: Vec<u64>,
    /// Backoff between settler attempts, in milliseconds.
    pub settler_delays_ms: Vec<u64>,
    /// How long one settler attempt waits on a phase before giving the
    /// worker thread back.
    pub settler_wait_ms: u64,
    /// Use `prepare_and_commit` when a transaction has exactly one participant.
    pub single_participant_fast_path: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            worker_threads: 8,
            prepare_max_attempts: 5,
            abort_max_attempts: 5,
            commit_max_attempts: None,
            retry_delays_ms: vec![100, 500, 1_000, 5_000, 10_000],
            settler_delays_ms: vec![1_000, 5_000, 10_000, 60_000],
            settler_wait_ms: 2_000,
            single_participant_fast_path: true,
        }
    }
}

impl CoordinatorConfig {
    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads;
        self
    }

    pub fn with_retry_delays_ms(mut self, delays: Vec<u64>) -> Self {
        self.retry_delays_ms = delays;
        self
    }

    pub fn with_settler_delays_ms(mut self, delays: Vec<u64>) -> Self {
        self.settler_delays_ms = delays;
        self
    }

    pub fn with_settler_wait(mut self, wait: Duration) -> Self {
        self.settler_wait_ms = wait.as_millis() as u64;
        self
    }

    pub fn with_single_participant_fast_path(mut self, enabled: bool) -> Self {
        self.single_participant_fast_path = enabled;
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from_millis(&self.retry_delays_ms)
    }

    pub fn settler_policy(&self) -> RetryPolicy {
        RetryPolicy::from_millis(&self.settler_delays_ms)
    }

    pub fn settler_wait(&self) -> Duration {
        Duration::from_millis(self.settler_wait_ms)
    }
}
