use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use crate::config::CoordinatorConfig;
use crate::errors::{CoordinatorError, Result};
use crate::handle::ParticipantHandle;
use crate::observe::Observer;
use crate::pool::{Scheduler, WorkerPool};
use crate::retry::{RetryPolicy, spawn_retrying};
use crate::state::{TxnId, TxnState};
use crate::task::ParticipantTask;
use crate::txn_log::LogWriter;

/// One step of the two-phase commit protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Prepare,
    Commit,
    Abort,
    /// Prepare and commit in one call; used for single-participant
    /// transactions.
    PrepareAndCommit,
}

/// Folds the per-handle outcomes of a phase into the phase result.
///
/// Entries are `None` while a handle has no recorded outcome. Returns
/// `CoordinatorError::NotReady` when the result cannot be decided yet.
pub type Aggregate = fn(TxnId, &[Option<TxnState>]) -> Result<TxnState>;

/// Everything that distinguishes one phase from another.
#[derive(Clone, Copy)]
pub struct PhasePolicy {
    pub phase: Phase,
    /// Outcome recorded when a participant fails terminally or the attempt
    /// ceiling is exceeded.
    pub natural_outcome: TxnState,
    /// Attempt ceiling per participant. `None` retries forever.
    pub max_attempts: Option<u32>,
    pub aggregate: Aggregate,
}

impl std::fmt::Debug for PhasePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhasePolicy")
            .field("phase", &self.phase)
            .field("natural_outcome", &self.natural_outcome)
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}

impl PhasePolicy {
    pub fn prepare(max_attempts: u32) -> Self {
        Self {
            phase: Phase::Prepare,
            natural_outcome: TxnState::Aborted,
            max_attempts: Some(max_attempts),
            aggregate: aggregate_prepare,
        }
    }

    pub fn commit(max_attempts: Option<u32>) -> Self {
        Self {
            phase: Phase::Commit,
            natural_outcome: TxnState::Committed,
            max_attempts,
            aggregate: aggregate_commit,
        }
    }

    pub fn abort(max_attempts: u32) -> Self {
        Self {
            phase: Phase::Abort,
            natural_outcome: TxnState::Aborted,
            max_attempts: Some(max_attempts),
            aggregate: aggregate_abort,
        }
    }

    pub fn prepare_and_commit(max_attempts: u32) -> Self {
        Self {
            phase: Phase::PrepareAndCommit,
            natural_outcome: TxnState::Aborted,
            max_attempts: Some(max_attempts),
            aggregate: aggregate_prepare_and_commit,
        }
    }

    pub fn for_phase(phase: Phase, config: &CoordinatorConfig) -> Self {
        match phase {
            Phase::Prepare => Self::prepare(config.prepare_max_attempts),
            Phase::Commit => Self::commit(config.commit_max_attempts),
            Phase::Abort => Self::abort(config.abort_max_attempts),
            Phase::PrepareAndCommit => Self::prepare_and_commit(config.prepare_max_attempts),
        }
    }

    /// The outcome this phase can take from an already recorded vote
    /// without contacting the participant.
    pub fn known_outcome(&self, vote: Option<TxnState>) -> Option<TxnState> {
        let vote = vote?;
        match (self.phase, vote) {
            (Phase::Prepare, TxnState::Prepared | TxnState::NotChanged | TxnState::Aborted) => {
                Some(vote)
            }
            (Phase::Prepare, TxnState::Committed) => Some(TxnState::Prepared),
            (Phase::Commit, TxnState::Committed | TxnState::NotChanged) => Some(vote),
            (Phase::Abort, TxnState::Aborted | TxnState::NotChanged) => Some(vote),
            (
                Phase::PrepareAndCommit,
                TxnState::Committed | TxnState::Aborted | TxnState::NotChanged,
            ) => Some(vote),
            _ => None,
        }
    }
}

/// One dissenting vote aborts everything, even while other votes are still
/// outstanding. Otherwise every vote must be in: any `Prepared` makes the
/// phase `Prepared`, all `NotChanged` makes it `NotChanged`.
pub fn aggregate_prepare(txn_id: TxnId, results: &[Option<TxnState>]) -> Result<TxnState> {
    if results.iter().any(|r| *r == Some(TxnState::Aborted)) {
        return Ok(TxnState::Aborted);
    }
    if results.iter().any(Option::is_none) {
        return Err(CoordinatorError::NotReady(txn_id));
    }
    if results.iter().any(|r| *r == Some(TxnState::Prepared)) {
        Ok(TxnState::Prepared)
    } else {
        Ok(TxnState::NotChanged)
    }
}

pub fn aggregate_commit(txn_id: TxnId, results: &[Option<TxnState>]) -> Result<TxnState> {
    if results.iter().any(Option::is_none) {
        return Err(CoordinatorError::NotReady(txn_id));
    }
    Ok(TxnState::Committed)
}

pub fn aggregate_abort(txn_id: TxnId, results: &[Option<TxnState>]) -> Result<TxnState> {
    if results.iter().any(Option::is_none) {
        return Err(CoordinatorError::NotReady(txn_id));
    }
    Ok(TxnState::Aborted)
}

pub fn aggregate_prepare_and_commit(
    txn_id: TxnId,
    results: &[Option<TxnState>],
) -> Result<TxnState> {
    if results.iter().any(Option::is_none) {
        return Err(CoordinatorError::NotReady(txn_id));
    }
    if results.iter().any(|r| *r == Some(TxnState::Aborted)) {
        Ok(TxnState::Aborted)
    } else if results.iter().any(|r| *r == Some(TxnState::Committed)) {
        Ok(TxnState::Committed)
    } else {
        Ok(TxnState::NotChanged)
    }
}

/// Shared collaborators handed to every job of a coordinator.
#[derive(Clone)]
pub struct JobContext {
    pub log: LogWriter,
    pub pool: Arc<dyn WorkerPool>,
    pub scheduler: Arc<dyn Scheduler>,
    pub retry: Arc<RetryPolicy>,
    pub observer: Arc<dyn Observer>,
}

/// Drives one phase of the protocol for one transaction.
///
/// A job fans out one [`ParticipantTask`] per handle onto the worker pool
/// and joins on their results. Tasks post results through [`Job::record`];
/// the caller blocks in [`Job::run`] until the phase policy can decide.
pub struct Job {
    txn_id: TxnId,
    handles: Vec<Arc<ParticipantHandle>>,
    policy: PhasePolicy,
    ctx: JobContext,
    results: Mutex<Vec<Option<TxnState>>>,
    posted: Condvar,
    started: AtomicBool,
    stopped: AtomicBool,
    completed: AtomicBool,
}

impl Job {
    pub fn new(
        txn_id: TxnId,
        handles: Vec<Arc<ParticipantHandle>>,
        policy: PhasePolicy,
        ctx: JobContext,
    ) -> Arc<Self> {
        let results = vec![None; handles.len()];
        Arc::new(Self {
            txn_id,
            handles,
            policy,
            ctx,
            results: Mutex::new(results),
            posted: Condvar::new(),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            completed: AtomicBool::new(false),
        })
    }

    pub fn txn_id(&self) -> TxnId {
        self.txn_id
    }

    pub fn phase(&self) -> Phase {
        self.policy.phase
    }

    pub fn policy(&self) -> &PhasePolicy {
        &self.policy
    }

    pub fn handles(&self) -> &[Arc<ParticipantHandle>] {
        &self.handles
    }

    pub(crate) fn handle(&self, index: usize) -> &Arc<ParticipantHandle> {
        &self.handles[index]
    }

    pub(crate) fn context(&self) -> &JobContext {
        &self.ctx
    }

    /// One task per handle, bound to this job.
    pub fn create_tasks(self: &Arc<Self>) -> Vec<ParticipantTask> {
        (0..self.handles.len())
            .map(|index| ParticipantTask::new(Arc::clone(self), index))
            .collect()
    }

    /// Submits the job's tasks to the worker pool. Later calls do nothing.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        self.ctx
            .observer
            .phase_started(self.txn_id, self.policy.phase, self.handles.len());
        for task in self.create_tasks() {
            spawn_retrying(
                task,
                Arc::clone(&self.ctx.pool),
                Arc::clone(&self.ctx.scheduler),
                Arc::clone(&self.ctx.retry),
            );
        }
    }

    /// Starts the job if needed and blocks until the phase is decided.
    ///
    /// # Errors
    ///
    /// Returns `CoordinatorError::NotReady` if the job is stopped before it
    /// could decide.
    pub fn run(self: &Arc<Self>) -> Result<TxnState> {
        self.run_until(None)
    }

    /// Like [`Job::run`] but gives up at `deadline`, leaving the tasks
    /// running. A later call joins the same tasks again.
    pub fn run_until(self: &Arc<Self>, deadline: Option<Instant>) -> Result<TxnState> {
        self.start();
        let mut results = self.results.lock();
        loop {
            match (self.policy.aggregate)(self.txn_id, &results) {
                Ok(outcome) => {
                    drop(results);
                    self.finish(outcome);
                    return Ok(outcome);
                }
                Err(CoordinatorError::NotReady(_)) => {}
                Err(e) => return Err(e),
            }
            if self.is_stopped() {
                return Err(CoordinatorError::NotReady(self.txn_id));
            }
            match deadline {
                Some(deadline) => {
                    if self.posted.wait_until(&mut results, deadline).timed_out() {
                        return match (self.policy.aggregate)(self.txn_id, &results) {
                            Ok(outcome) => {
                                drop(results);
                                self.finish(outcome);
                                Ok(outcome)
                            }
                            Err(e) => Err(e),
                        };
                    }
                }
                None => self.posted.wait(&mut results),
            }
        }
    }

    /// Aggregates the recorded outcomes into the phase result.
    ///
    /// # Errors
    ///
    /// Returns `CoordinatorError::NotReady` if the job was never started or
    /// the phase policy still needs outstanding results.
    pub fn compute_result(&self) -> Result<TxnState> {
        if !self.is_started() {
            return Err(CoordinatorError::NotReady(self.txn_id));
        }
        let results = self.results.lock();
        (self.policy.aggregate)(self.txn_id, &results)
    }

    /// Posts the outcome of the task for handle `index`. The first outcome
    /// posted for a handle wins.
    pub fn record(&self, index: usize, outcome: TxnState) {
        let mut results = self.results.lock();
        if let Some(slot) = results.get_mut(index) {
            if slot.is_none() {
                *slot = Some(outcome);
            }
        }
        self.posted.notify_all();
    }

    /// Abandons the job: pending tasks stop being resubmitted and callers
    /// blocked in `run` return. Outstanding remote calls are not interrupted.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let _results = self.results.lock();
        self.posted.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }

    fn finish(&self, outcome: TxnState) {
        if self.completed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop();
        let committed = self
            .handles
            .iter()
            .filter(|handle| handle.vote() == Some(TxnState::Committed))
            .count();
        self.ctx
            .observer
            .phase_completed(self.txn_id, self.policy.phase, outcome, committed);
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("txn_id", &self.txn_id)
            .field("phase", &self.policy.phase)
            .field("handles", &self.handles)
            .field("started", &self.is_started())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
