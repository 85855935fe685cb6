//! Common utilities for Maat integration tests.
#![allow(dead_code)]

use ahash::AHashMap as HashMap;
use maat::prelude::*;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::{Duration, Instant};

// --- MockParticipant ---

/// A scripted participant. Each phase pops its next scripted response and
/// falls back to a default once the script is empty.
pub struct MockParticipant {
    id: ParticipantId,
    default_vote: Mutex<Vote>,
    prepare_script: Mutex<VecDeque<std::result::Result<Vote, ParticipantError>>>,
    commit_script: Mutex<VecDeque<std::result::Result<(), ParticipantError>>>,
    abort_script: Mutex<VecDeque<std::result::Result<(), ParticipantError>>>,
    commit_always_fails: Mutex<Option<ParticipantError>>,
    prepare_delay: Mutex<Option<Duration>>,
    prepare_and_commit_result: Mutex<Option<TxnState>>,
    pub prepare_calls: AtomicU32,
    pub commit_calls: AtomicU32,
    pub abort_calls: AtomicU32,
    pub prepare_and_commit_calls: AtomicU32,
}

impl MockParticipant {
    pub fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: ParticipantId::from(id),
            default_vote: Mutex::new(Vote::Prepared),
            prepare_script: Mutex::new(VecDeque::new()),
            commit_script: Mutex::new(VecDeque::new()),
            abort_script: Mutex::new(VecDeque::new()),
            commit_always_fails: Mutex::new(None),
            prepare_delay: Mutex::new(None),
            prepare_and_commit_result: Mutex::new(None),
            prepare_calls: AtomicU32::new(0),
            commit_calls: AtomicU32::new(0),
            abort_calls: AtomicU32::new(0),
            prepare_and_commit_calls: AtomicU32::new(0),
        })
    }

    pub fn id(&self) -> &ParticipantId {
        &self.id
    }

    pub fn set_vote(&self, vote: Vote) {
        *self.default_vote.lock() = vote;
    }

    pub fn push_prepare(&self, response: std::result::Result<Vote, ParticipantError>) {
        self.prepare_script.lock().push_back(response);
    }

    pub fn push_commit(&self, response: std::result::Result<(), ParticipantError>) {
        self.commit_script.lock().push_back(response);
    }

    pub fn push_abort(&self, response: std::result::Result<(), ParticipantError>) {
        self.abort_script.lock().push_back(response);
    }

    pub fn fail_prepares(&self, times: usize, error: ParticipantError) {
        for _ in 0..times {
            self.push_prepare(Err(error.clone()));
        }
    }

    pub fn fail_commits(&self, times: usize, error: ParticipantError) {
        for _ in 0..times {
            self.push_commit(Err(error.clone()));
        }
    }

    pub fn fail_aborts(&self, times: usize, error: ParticipantError) {
        for _ in 0..times {
            self.push_abort(Err(error.clone()));
        }
    }

    /// Makes `prepare_and_commit` answer `state` without preparing.
    pub fn set_prepare_and_commit_result(&self, state: TxnState) {
        *self.prepare_and_commit_result.lock() = Some(state);
    }

    pub fn fail_commits_forever(&self, error: ParticipantError) {
        *self.commit_always_fails.lock() = Some(error);
    }

    pub fn set_prepare_delay(&self, delay: Duration) {
        *self.prepare_delay.lock() = Some(delay);
    }

    pub fn prepares(&self) -> u32 {
        self.prepare_calls.load(Ordering::SeqCst)
    }

    pub fn commits(&self) -> u32 {
        self.commit_calls.load(Ordering::SeqCst)
    }

    pub fn aborts(&self) -> u32 {
        self.abort_calls.load(Ordering::SeqCst)
    }

    pub fn prepare_and_commits(&self) -> u32 {
        self.prepare_and_commit_calls.load(Ordering::SeqCst)
    }

    fn next_vote(&self) -> std::result::Result<Vote, ParticipantError> {
        let delay = *self.prepare_delay.lock();
        if let Some(delay) = delay {
            thread::sleep(delay);
        }
        let scripted = self.prepare_script.lock().pop_front();
        scripted.unwrap_or_else(|| Ok(*self.default_vote.lock()))
    }

    fn next_commit(&self) -> std::result::Result<(), ParticipantError> {
        if let Some(error) = self.commit_always_fails.lock().clone() {
            return Err(error);
        }
        let scripted = self.commit_script.lock().pop_front();
        scripted.unwrap_or(Ok(()))
    }
}

impl Participant for MockParticipant {
    fn prepare(&self, _txn_id: TxnId) -> std::result::Result<Vote, ParticipantError> {
        self.prepare_calls.fetch_add(1, Ordering::SeqCst);
        self.next_vote()
    }

    fn commit(&self, _txn_id: TxnId) -> std::result::Result<(), ParticipantError> {
        self.commit_calls.fetch_add(1, Ordering::SeqCst);
        self.next_commit()
    }

    fn abort(&self, _txn_id: TxnId) -> std::result::Result<(), ParticipantError> {
        self.abort_calls.fetch_add(1, Ordering::SeqCst);
        let scripted = self.abort_script.lock().pop_front();
        scripted.unwrap_or(Ok(()))
    }

    fn prepare_and_commit(&self, _txn_id: TxnId) -> std::result::Result<TxnState, ParticipantError> {
        self.prepare_and_commit_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(state) = *self.prepare_and_commit_result.lock() {
            return Ok(state);
        }
        match self.next_vote()? {
            Vote::Prepared => {
                self.next_commit()?;
                Ok(TxnState::Committed)
            }
            vote => Ok(vote.into()),
        }
    }
}

// --- MockLocator ---

#[derive(Default)]
pub struct MockLocator {
    participants: Mutex<HashMap<ParticipantId, Arc<MockParticipant>>>,
    failing: Mutex<HashMap<ParticipantId, usize>>,
    pub resolve_calls: AtomicU32,
}

impl MockLocator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, participant: &Arc<MockParticipant>) {
        self.participants
            .lock()
            .insert(participant.id().clone(), Arc::clone(participant));
    }

    /// The next `times` resolutions of `id` fail with a retryable error.
    pub fn fail_resolutions(&self, id: &ParticipantId, times: usize) {
        self.failing.lock().insert(id.clone(), times);
    }
}

impl ParticipantLocator for MockLocator {
    fn resolve(&self, id: &ParticipantId) -> std::result::Result<Arc<dyn Participant>, ParticipantError> {
        self.resolve_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(remaining) = self.failing.lock().get_mut(id) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ParticipantError::ConnectionFailed(format!("{} unreachable", id)));
            }
        }
        match self.participants.lock().get(id) {
            Some(participant) => Ok(Arc::clone(participant) as Arc<dyn Participant>),
            None => Err(ParticipantError::UnknownHost(id.to_string())),
        }
    }
}

// --- RecordingObserver ---

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    PhaseStarted(TxnId, Phase),
    Outcome(TxnId, Phase, ParticipantId, TxnState),
    Failure(TxnId, Phase, ParticipantId, FailureClass),
    PhaseCompleted(TxnId, Phase, TxnState),
    Settled(TxnId),
    Stuck(TxnId, TxnState),
    Recovered(usize),
}

#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<Event>>,
}

impl RecordingObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn count(&self, predicate: impl Fn(&Event) -> bool) -> usize {
        self.events.lock().iter().filter(|event| predicate(event)).count()
    }
}

impl Observer for RecordingObserver {
    fn phase_started(&self, txn_id: TxnId, phase: Phase, _participants: usize) {
        self.events.lock().push(Event::PhaseStarted(txn_id, phase));
    }

    fn participant_outcome(
        &self,
        txn_id: TxnId,
        phase: Phase,
        participant: &ParticipantId,
        outcome: TxnState,
        _attempt: u32,
    ) {
        self.events
            .lock()
            .push(Event::Outcome(txn_id, phase, participant.clone(), outcome));
    }

    fn participant_failure(
        &self,
        txn_id: TxnId,
        phase: Phase,
        participant: &ParticipantId,
        error: &ParticipantError,
        _attempt: u32,
    ) {
        self.events
            .lock()
            .push(Event::Failure(txn_id, phase, participant.clone(), error.class()));
    }

    fn phase_completed(&self, txn_id: TxnId, phase: Phase, outcome: TxnState, _committed: usize) {
        self.events.lock().push(Event::PhaseCompleted(txn_id, phase, outcome));
    }

    fn settled(&self, txn_id: TxnId, _attempts: u32) {
        self.events.lock().push(Event::Settled(txn_id));
    }

    fn stuck(&self, txn_id: TxnId, state: TxnState) {
        self.events.lock().push(Event::Stuck(txn_id, state));
    }

    fn recovered(&self, unsettled: usize) {
        self.events.lock().push(Event::Recovered(unsettled));
    }
}

// --- FailingLog ---

/// A log whose every write fails.
#[derive(Default)]
pub struct FailingLog;

impl TransactionLog for FailingLog {
    fn append(&self, _record: LogRecord) -> Result<()> {
        Err(CoordinatorError::LogError("disk full".to_string()))
    }

    fn replay(&self) -> Result<Vec<LogRecord>> {
        Ok(Vec::new())
    }
}

// --- Helper Functions ---

/// A configuration with millisecond backoffs so retries do not slow tests.
pub fn fast_config() -> CoordinatorConfig {
    CoordinatorConfig::default()
        .with_worker_threads(4)
        .with_retry_delays_ms(vec![1])
        .with_settler_delays_ms(vec![5])
        .with_settler_wait(Duration::from_millis(200))
}

/// Registers fresh participants with a new locator.
pub fn participants(ids: &[&str]) -> (Arc<MockLocator>, Vec<Arc<MockParticipant>>) {
    let locator = MockLocator::new();
    let participants = ids
        .iter()
        .map(|id| {
            let participant = MockParticipant::new(id);
            locator.register(&participant);
            participant
        })
        .collect();
    (locator, participants)
}

/// A coordinator over an in-memory log with its own pool and timer.
pub fn setup_coordinator(
    config: CoordinatorConfig,
    locator: Arc<MockLocator>,
) -> (Coordinator, MemoryTransactionLog) {
    let log = MemoryTransactionLog::new();
    let coordinator = Coordinator::new(config, Arc::new(log.clone()), locator);
    (coordinator, log)
}

/// A coordinator that reports to `observer`. The pool and timer are owned by
/// the returned guard.
pub struct ObservedCoordinator {
    pub coordinator: Coordinator,
    pub observer: Arc<RecordingObserver>,
    pool: Arc<ThreadPool>,
    scheduler: Arc<TimerScheduler>,
}

impl Drop for ObservedCoordinator {
    fn drop(&mut self) {
        self.coordinator.shutdown();
        self.scheduler.shutdown();
        self.pool.shutdown();
    }
}

pub fn setup_observed(
    config: CoordinatorConfig,
    log: Arc<dyn TransactionLog>,
    locator: Arc<MockLocator>,
) -> ObservedCoordinator {
    let pool = Arc::new(ThreadPool::new(config.worker_threads));
    let scheduler = Arc::new(TimerScheduler::new());
    let observer = RecordingObserver::new();
    let coordinator = Coordinator::with_runtime(
        config,
        log,
        locator,
        Arc::clone(&pool) as Arc<dyn WorkerPool>,
        Arc::clone(&scheduler) as Arc<dyn Scheduler>,
        Arc::clone(&observer) as Arc<dyn Observer>,
    );
    ObservedCoordinator {
        coordinator,
        observer,
        pool,
        scheduler,
    }
}

/// A job context on a fresh pool with immediate retries.
pub fn job_context(log: &MemoryTransactionLog, observer: Arc<dyn Observer>) -> JobContext {
    JobContext {
        log: LogWriter::new(Arc::new(log.clone())),
        pool: Arc::new(ThreadPool::new(4)),
        scheduler: Arc::new(TimerScheduler::new()),
        retry: Arc::new(RetryPolicy::from_millis(&[1])),
        observer,
    }
}

pub fn handles(
    locator: &Arc<MockLocator>,
    participants: &[Arc<MockParticipant>],
) -> Vec<Arc<ParticipantHandle>> {
    participants
        .iter()
        .map(|participant| {
            Arc::new(ParticipantHandle::new(
                participant.id().clone(),
                Arc::clone(locator) as Arc<dyn ParticipantLocator>,
            ))
        })
        .collect()
}

/// Polls `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

pub fn vote_records(log: &MemoryTransactionLog, txn_id: TxnId) -> Vec<(ParticipantId, TxnState)> {
    log.records()
        .into_iter()
        .filter_map(|record| match record {
            LogRecord::Vote {
                txn_id: id,
                participant,
                state,
            } if id == txn_id => Some((participant, state)),
            _ => None,
        })
        .collect()
}

pub fn is_settled(log: &MemoryTransactionLog, txn_id: TxnId) -> Option<TxnState> {
    log.records().into_iter().find_map(|record| match record {
        LogRecord::Settled { txn_id: id, state } if id == txn_id => Some(state),
        _ => None,
    })
}
