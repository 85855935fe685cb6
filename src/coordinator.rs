use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use log::{debug, info};
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crate::config::CoordinatorConfig;
use crate::errors::{CoordinatorError, Result};
use crate::handle::ParticipantHandle;
use crate::job::{Job, JobContext, Phase, PhasePolicy};
use crate::observe::{LogObserver, Observer};
use crate::participant::{ParticipantId, ParticipantLocator};
use crate::pool::{Scheduler, ThreadPool, TimerScheduler, WorkerPool};
use crate::retry::{RetryPolicy, spawn_retrying};
use crate::settler::{Settle, SettlerTask};
use crate::state::{TxnId, TxnState};
use crate::txn_log::{LogRecord, LogWriter, Replay, TransactionLog};

/// Maat prelude
pub mod prelude {
    pub use crate::config::*;
    pub use crate::coordinator::Coordinator;
    pub use crate::errors::*;
    pub use crate::handle::*;
    pub use crate::job::*;
    pub use crate::observe::*;
    pub use crate::participant::*;
    pub use crate::pool::*;
    pub use crate::retry::*;
    pub use crate::settler::*;
    pub use crate::state::*;
    pub use crate::txn_log::*;
}

/// Coordinator-side record of one transaction.
struct TxnRecord {
    txn_id: TxnId,
    state: Mutex<TxnState>,
    handles: Mutex<Vec<Arc<ParticipantHandle>>>,
    /// The phase currently running, kept so a caller that timed out (or a
    /// settler) joins it instead of starting a second job.
    in_flight: Mutex<Option<Arc<Job>>>,
    /// Serializes commit, abort and join on this transaction.
    op_lock: Mutex<()>,
    settler_scheduled: AtomicBool,
}

impl TxnRecord {
    fn new(txn_id: TxnId, state: TxnState, handles: Vec<Arc<ParticipantHandle>>) -> Self {
        Self {
            txn_id,
            state: Mutex::new(state),
            handles: Mutex::new(handles),
            in_flight: Mutex::new(None),
            op_lock: Mutex::new(()),
            settler_scheduled: AtomicBool::new(false),
        }
    }

    fn state(&self) -> TxnState {
        *self.state.lock()
    }

    fn handles(&self) -> Vec<Arc<ParticipantHandle>> {
        self.handles.lock().clone()
    }

    fn participant_ids(&self) -> Vec<ParticipantId> {
        self.handles
            .lock()
            .iter()
            .map(|handle| handle.id().clone())
            .collect()
    }
}

struct Inner {
    me: Weak<Inner>,
    config: CoordinatorConfig,
    ctx: JobContext,
    log: Arc<dyn TransactionLog>,
    locator: Arc<dyn ParticipantLocator>,
    txns: RwLock<HashMap<TxnId, Arc<TxnRecord>>>,
    stuck: Mutex<HashSet<TxnId>>,
    next_txn_id: AtomicU64,
    settler_policy: Arc<RetryPolicy>,
    shut_down: AtomicBool,
    owned_runtime: Option<(Arc<ThreadPool>, Arc<TimerScheduler>)>,
}

/// The two-phase commit coordinator.
///
/// Owns a table of in-flight transactions and drives each one through
/// prepare and then commit or abort using [`Job`]s whose participant tasks
/// run on a shared worker pool. Every per-participant outcome and every
/// decision is appended to the [`TransactionLog`], so a coordinator opened
/// on the same log after a crash can finish what the previous one started.
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    /// Creates a coordinator with its own worker pool and timer thread.
    ///
    /// Nothing is read from `log`; use [`Coordinator::open`] to recover.
    pub fn new(
        config: CoordinatorConfig,
        log: Arc<dyn TransactionLog>,
        locator: Arc<dyn ParticipantLocator>,
    ) -> Self {
        let pool = Arc::new(ThreadPool::new(config.worker_threads));
        let scheduler = Arc::new(TimerScheduler::new());
        Self::build(
            config,
            log,
            locator,
            Arc::clone(&pool) as Arc<dyn WorkerPool>,
            Arc::clone(&scheduler) as Arc<dyn Scheduler>,
            Arc::new(LogObserver),
            Some((pool, scheduler)),
        )
    }

    /// Creates a coordinator on caller-supplied threads and observer.
    ///
    /// The caller stays responsible for shutting `pool` and `scheduler` down.
    pub fn with_runtime(
        config: CoordinatorConfig,
        log: Arc<dyn TransactionLog>,
        locator: Arc<dyn ParticipantLocator>,
        pool: Arc<dyn WorkerPool>,
        scheduler: Arc<dyn Scheduler>,
        observer: Arc<dyn Observer>,
    ) -> Self {
        Self::build(config, log, locator, pool, scheduler, observer, None)
    }

    /// Creates a coordinator and recovers unsettled transactions from `log`.
    ///
    /// # Errors
    ///
    /// Returns `CoordinatorError::LogError` if the log cannot be replayed.
    pub fn open(
        config: CoordinatorConfig,
        log: Arc<dyn TransactionLog>,
        locator: Arc<dyn ParticipantLocator>,
    ) -> Result<Self> {
        let coordinator = Self::new(config, log, locator);
        coordinator.recover()?;
        Ok(coordinator)
    }

    fn build(
        config: CoordinatorConfig,
        log: Arc<dyn TransactionLog>,
        locator: Arc<dyn ParticipantLocator>,
        pool: Arc<dyn WorkerPool>,
        scheduler: Arc<dyn Scheduler>,
        observer: Arc<dyn Observer>,
        owned_runtime: Option<(Arc<ThreadPool>, Arc<TimerScheduler>)>,
    ) -> Self {
        let ctx = JobContext {
            log: LogWriter::new(Arc::clone(&log)),
            pool,
            scheduler,
            retry: Arc::new(config.retry_policy()),
            observer,
        };
        let settler_policy = Arc::new(config.settler_policy());
        let inner = Arc::new_cyclic(|me| Inner {
            me: me.clone(),
            config,
            ctx,
            log,
            locator,
            txns: RwLock::new(HashMap::new()),
            stuck: Mutex::new(HashSet::new()),
            next_txn_id: AtomicU64::new(1),
            settler_policy,
            shut_down: AtomicBool::new(false),
            owned_runtime,
        });
        Self { inner }
    }

    /// Starts a new transaction in the `Active` state.
    pub fn begin(&self) -> Result<TxnId> {
        self.inner.ensure_running()?;
        let txn_id = self.inner.next_txn_id.fetch_add(1, Ordering::SeqCst);
        let record = Arc::new(TxnRecord::new(txn_id, TxnState::Active, Vec::new()));
        self.inner.txns.write().insert(txn_id, record);
        debug!("Started Tx {}", txn_id);
        Ok(txn_id)
    }

    /// Enlists a participant. Joining twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `UnknownTransaction` or, if the transaction is no longer
    /// `Active`, `InvalidState`.
    pub fn join(&self, txn_id: TxnId, participant: ParticipantId) -> Result<()> {
        let record = self.inner.get(txn_id)?;
        let _op = record.op_lock.lock();
        let state = record.state();
        if state != TxnState::Active {
            return Err(CoordinatorError::InvalidState {
                txn_id,
                state,
                operation: "join",
            });
        }
        let mut handles = record.handles.lock();
        if !handles.iter().any(|handle| *handle.id() == participant) {
            handles.push(Arc::new(ParticipantHandle::new(
                participant,
                Arc::clone(&self.inner.locator),
            )));
        }
        Ok(())
    }

    /// The transaction's current state.
    ///
    /// Settled transactions are forgotten and report `UnknownTransaction`.
    pub fn state(&self, txn_id: TxnId) -> Result<TxnState> {
        self.inner.get(txn_id).map(|record| record.state())
    }

    /// Enlisted participants with their last recorded vote.
    pub fn participants(&self, txn_id: TxnId) -> Result<Vec<(ParticipantId, Option<TxnState>)>> {
        let record = self.inner.get(txn_id)?;
        Ok(record
            .handles()
            .iter()
            .map(|handle| (handle.id().clone(), handle.vote()))
            .collect())
    }

    /// Runs the protocol to completion and returns the outcome.
    ///
    /// # Returns
    ///
    /// `Committed`, or `NotChanged` if no participant had anything to do.
    ///
    /// # Errors
    ///
    /// Returns `CannotCommit` if the transaction was aborted instead.
    pub fn commit(&self, txn_id: TxnId) -> Result<TxnState> {
        self.inner.ensure_running()?;
        self.inner.commit(txn_id, None)
    }

    /// Like [`Coordinator::commit`] but returns `NotReady` if the protocol
    /// has not finished after `timeout`.
    ///
    /// The unfinished phase keeps running and a settler is scheduled to
    /// finish the transaction; calling `commit` again joins the same phase.
    pub fn commit_within(&self, txn_id: TxnId, timeout: Duration) -> Result<TxnState> {
        self.inner.ensure_running()?;
        self.inner.commit(txn_id, Some(Instant::now() + timeout))
    }

    /// Rolls the transaction back.
    ///
    /// # Errors
    ///
    /// Returns `CannotAbort` if the transaction already decided to commit.
    pub fn abort(&self, txn_id: TxnId) -> Result<TxnState> {
        self.inner.ensure_running()?;
        self.inner.abort(txn_id, None)
    }

    /// Runs a single phase over `handles` and returns its aggregate outcome.
    ///
    /// This does not consult or update the transaction table; participant
    /// outcomes are still recorded on the handles and logged.
    pub fn run_phase(
        &self,
        phase: Phase,
        txn_id: TxnId,
        handles: Vec<Arc<ParticipantHandle>>,
    ) -> Result<TxnState> {
        self.inner.ensure_running()?;
        let policy = PhasePolicy::for_phase(phase, &self.inner.config);
        Job::new(txn_id, handles, policy, self.inner.ctx.clone()).run()
    }

    /// Replays the log, rebuilds every unsettled transaction and schedules a
    /// settler for each of them.
    ///
    /// # Returns
    ///
    /// The number of settlers scheduled.
    pub fn recover(&self) -> Result<usize> {
        self.inner.recover()
    }

    /// Transactions the settler could not act on.
    pub fn stuck_transactions(&self) -> Vec<TxnId> {
        let mut stuck: Vec<TxnId> = self.inner.stuck.lock().iter().copied().collect();
        stuck.sort_unstable();
        stuck
    }

    /// Number of transactions that have not settled yet.
    pub fn active_transactions(&self) -> usize {
        self.inner.txns.read().len()
    }

    /// Stops in-flight jobs and, for coordinators built with
    /// [`Coordinator::new`], the worker pool and timer thread.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

impl Inner {
    fn ensure_running(&self) -> Result<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            Err(CoordinatorError::ShutDown)
        } else {
            Ok(())
        }
    }

    fn get(&self, txn_id: TxnId) -> Result<Arc<TxnRecord>> {
        self.txns
            .read()
            .get(&txn_id)
            .cloned()
            .ok_or(CoordinatorError::UnknownTransaction(txn_id))
    }

    fn commit(&self, txn_id: TxnId, deadline: Option<Instant>) -> Result<TxnState> {
        let record = self.get(txn_id)?;
        let _op = lock_until(&record, deadline)?;

        match record.state() {
            state @ (TxnState::Active | TxnState::Voting) => {
                if state == TxnState::Active {
                    self.ctx.log.append(LogRecord::Voting {
                        txn_id,
                        participants: record.participant_ids(),
                    });
                    *record.state.lock() = TxnState::Voting;
                }

                let handles = record.handles();
                if handles.is_empty() {
                    self.decide(&record, TxnState::NotChanged);
                    self.settle(&record, TxnState::NotChanged);
                    return Ok(TxnState::NotChanged);
                }

                let phase = if handles.len() == 1
                    && self.config.single_participant_fast_path
                    && handles[0].vote().is_none()
                {
                    Phase::PrepareAndCommit
                } else {
                    Phase::Prepare
                };

                match (phase, self.drive(&record, phase, deadline)?) {
                    (_, TxnState::Aborted) => {
                        self.decide(&record, TxnState::Aborted);
                        self.drive(&record, Phase::Abort, deadline)?;
                        self.settle(&record, TxnState::Aborted);
                        Err(CoordinatorError::CannotCommit(txn_id))
                    }
                    (_, TxnState::NotChanged) => {
                        self.decide(&record, TxnState::NotChanged);
                        self.settle(&record, TxnState::NotChanged);
                        Ok(TxnState::NotChanged)
                    }
                    (Phase::PrepareAndCommit, TxnState::Committed) => {
                        self.decide(&record, TxnState::Committed);
                        self.settle(&record, TxnState::Committed);
                        Ok(TxnState::Committed)
                    }
                    (Phase::Prepare, TxnState::Prepared) => {
                        self.decide(&record, TxnState::Committed);
                        self.drive(&record, Phase::Commit, deadline)?;
                        self.settle(&record, TxnState::Committed);
                        Ok(TxnState::Committed)
                    }
                    (phase, outcome) => Err(CoordinatorError::Other(format!(
                        "Tx {}: unexpected {:?} outcome {:?}",
                        txn_id, phase, outcome
                    ))),
                }
            }
            TxnState::Committed => {
                self.drive(&record, Phase::Commit, deadline)?;
                self.settle(&record, TxnState::Committed);
                Ok(TxnState::Committed)
            }
            TxnState::Aborted => {
                self.drive(&record, Phase::Abort, deadline)?;
                self.settle(&record, TxnState::Aborted);
                Err(CoordinatorError::CannotCommit(txn_id))
            }
            state => Err(CoordinatorError::InvalidState {
                txn_id,
                state,
                operation: "commit",
            }),
        }
    }

    fn abort(&self, txn_id: TxnId, deadline: Option<Instant>) -> Result<TxnState> {
        let record = self.get(txn_id)?;
        let _op = lock_until(&record, deadline)?;

        match record.state() {
            TxnState::Active | TxnState::Voting => {
                self.decide(&record, TxnState::Aborted);
                self.drive(&record, Phase::Abort, deadline)?;
                self.settle(&record, TxnState::Aborted);
                Ok(TxnState::Aborted)
            }
            TxnState::Aborted => {
                self.drive(&record, Phase::Abort, deadline)?;
                self.settle(&record, TxnState::Aborted);
                Ok(TxnState::Aborted)
            }
            TxnState::Committed => Err(CoordinatorError::CannotAbort(txn_id)),
            state => Err(CoordinatorError::InvalidState {
                txn_id,
                state,
                operation: "abort",
            }),
        }
    }

    /// Runs `phase` for the transaction, joining the in-flight job when it
    /// is the same phase and stopping it otherwise.
    fn drive(
        &self,
        record: &Arc<TxnRecord>,
        phase: Phase,
        deadline: Option<Instant>,
    ) -> Result<TxnState> {
        let job = {
            let mut in_flight = record.in_flight.lock();
            match in_flight.as_ref() {
                Some(job) if job.phase() == phase && !job.is_stopped() => Arc::clone(job),
                _ => {
                    if let Some(stale) = in_flight.take() {
                        stale.stop();
                    }
                    let policy = PhasePolicy::for_phase(phase, &self.config);
                    let job = Job::new(record.txn_id, record.handles(), policy, self.ctx.clone());
                    *in_flight = Some(Arc::clone(&job));
                    job
                }
            }
        };

        match job.run_until(deadline) {
            Ok(outcome) => {
                let mut in_flight = record.in_flight.lock();
                if in_flight.as_ref().is_some_and(|current| Arc::ptr_eq(current, &job)) {
                    *in_flight = None;
                }
                Ok(outcome)
            }
            Err(CoordinatorError::NotReady(txn_id)) => {
                if deadline.is_some() && !self.shut_down.load(Ordering::SeqCst) {
                    self.schedule_settler(record);
                }
                Err(CoordinatorError::NotReady(txn_id))
            }
            Err(e) => Err(e),
        }
    }

    fn decide(&self, record: &TxnRecord, state: TxnState) {
        self.ctx.log.append(LogRecord::Decision {
            txn_id: record.txn_id,
            state,
            participants: record.participant_ids(),
        });
        *record.state.lock() = state;
    }

    fn settle(&self, record: &TxnRecord, state: TxnState) {
        self.ctx.log.append(LogRecord::Settled {
            txn_id: record.txn_id,
            state,
        });
        *record.state.lock() = state;
        record.in_flight.lock().take();
        self.txns.write().remove(&record.txn_id);
        self.stuck.lock().remove(&record.txn_id);
        debug!("Tx {} settled as {:?}", record.txn_id, state);
    }

    fn schedule_settler(&self, record: &TxnRecord) {
        if record.settler_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(me) = self.me.upgrade() else {
            return;
        };
        let task = SettlerTask::new(
            record.txn_id,
            me as Arc<dyn Settle>,
            Arc::clone(&self.ctx.observer),
        );
        spawn_retrying(
            task,
            Arc::clone(&self.ctx.pool),
            Arc::clone(&self.ctx.scheduler),
            Arc::clone(&self.settler_policy),
        );
    }

    fn recover(&self) -> Result<usize> {
        let replay = Replay::from_records(self.log.replay()?);
        if let Some(max) = replay.max_txn_id {
            self.next_txn_id.fetch_max(max + 1, Ordering::SeqCst);
        }

        let mut to_settle = Vec::new();
        for txn in replay.unsettled {
            if txn.state == TxnState::NotChanged {
                self.ctx.log.append(LogRecord::Settled {
                    txn_id: txn.txn_id,
                    state: TxnState::NotChanged,
                });
                continue;
            }
            let handles = txn
                .participants
                .into_iter()
                .map(|(id, vote)| {
                    Arc::new(ParticipantHandle::with_vote(
                        id,
                        Arc::clone(&self.locator),
                        vote,
                    ))
                })
                .collect();
            let record = Arc::new(TxnRecord::new(txn.txn_id, txn.state, handles));
            let mut txns = self.txns.write();
            if txns.contains_key(&txn.txn_id) {
                continue;
            }
            txns.insert(txn.txn_id, Arc::clone(&record));
            to_settle.push(record);
        }

        self.ctx.observer.recovered(to_settle.len());
        for record in &to_settle {
            self.schedule_settler(record);
        }
        Ok(to_settle.len())
    }

    fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down coordinator");
        let records: Vec<Arc<TxnRecord>> = self.txns.read().values().cloned().collect();
        for record in records {
            if let Some(job) = record.in_flight.lock().as_ref() {
                job.stop();
            }
        }
        if let Some((pool, scheduler)) = &self.owned_runtime {
            scheduler.shutdown();
            pool.shutdown();
        }
    }
}

/// Takes the transaction's operation lock, giving up with `NotReady` at
/// `deadline` so a settler never parks a worker thread behind a caller.
fn lock_until(record: &TxnRecord, deadline: Option<Instant>) -> Result<MutexGuard<'_, ()>> {
    match deadline {
        Some(deadline) => record
            .op_lock
            .try_lock_until(deadline)
            .ok_or(CoordinatorError::NotReady(record.txn_id)),
        None => Ok(record.op_lock.lock()),
    }
}

impl Settle for Inner {
    fn decision(&self, txn_id: TxnId) -> Result<TxnState> {
        self.get(txn_id).map(|record| record.state())
    }

    fn settle_commit(&self, txn_id: TxnId) -> Result<TxnState> {
        self.ensure_running()?;
        self.commit(txn_id, Some(Instant::now() + self.config.settler_wait()))
    }

    fn settle_abort(&self, txn_id: TxnId) -> Result<TxnState> {
        self.ensure_running()?;
        self.abort(txn_id, Some(Instant::now() + self.config.settler_wait()))
    }

    fn mark_stuck(&self, txn_id: TxnId, state: TxnState) {
        debug!("Tx {} marked stuck in {:?}", txn_id, state);
        self.stuck.lock().insert(txn_id);
    }
}
