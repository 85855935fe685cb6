use log::debug;
use std::sync::Arc;

use crate::handle::ParticipantHandle;
use crate::job::{Job, Phase};
use crate::participant::{FailureClass, ParticipantError};
use crate::retry::{Attempt, Retryable};
use crate::state::TxnState;
use crate::txn_log::LogRecord;

/// The work one job does for one participant.
///
/// A task is owned by whichever worker thread runs its current attempt, so
/// the attempt counter needs no synchronization. Once a task records an
/// outcome it reports [`Attempt::Done`] and is never resubmitted.
pub struct ParticipantTask {
    job: Arc<Job>,
    index: usize,
    attempt: u32,
}

impl ParticipantTask {
    pub(crate) fn new(job: Arc<Job>, index: usize) -> Self {
        Self {
            job,
            index,
            attempt: 0,
        }
    }

    pub fn handle(&self) -> &Arc<ParticipantHandle> {
        self.job.handle(self.index)
    }

    /// Runs one attempt of the phase for this task's participant.
    ///
    /// # Returns
    ///
    /// The participant's outcome, or `None` if it is not decided yet and the
    /// task should be resubmitted.
    pub fn do_work(&mut self) -> Option<TxnState> {
        let policy = *self.job.policy();
        let txn_id = self.job.txn_id();
        let handle = Arc::clone(self.job.handle(self.index));
        let observer = Arc::clone(&self.job.context().observer);

        if let Some(known) = policy.known_outcome(handle.vote()) {
            return Some(known);
        }

        let participant = match handle.participant() {
            Ok(participant) => participant,
            Err(e) => {
                debug!(
                    "Tx {} {:?}: cannot resolve participant {}: {}",
                    txn_id,
                    policy.phase,
                    handle.id(),
                    e
                );
                return None;
            }
        };

        self.attempt += 1;
        if let Some(max) = policy.max_attempts {
            if self.attempt > max {
                debug!(
                    "Tx {} {:?}: participant {} exceeded {} attempts, assuming {:?}",
                    txn_id,
                    policy.phase,
                    handle.id(),
                    max,
                    policy.natural_outcome
                );
                return Some(policy.natural_outcome);
            }
        }

        let result = match policy.phase {
            Phase::Prepare => participant.prepare(txn_id).map(TxnState::from),
            Phase::Commit => participant.commit(txn_id).map(|()| TxnState::Committed),
            Phase::Abort => participant.abort(txn_id).map(|()| TxnState::Aborted),
            Phase::PrepareAndCommit => participant
                .prepare_and_commit(txn_id)
                .and_then(|state| match state {
                    TxnState::Committed | TxnState::Aborted | TxnState::NotChanged => Ok(state),
                    other => Err(ParticipantError::Runtime(format!(
                        "prepare_and_commit returned {:?}",
                        other
                    ))),
                }),
        };

        match result {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                observer.participant_failure(txn_id, policy.phase, handle.id(), &e, self.attempt);
                match e.class() {
                    FailureClass::Retryable => None,
                    FailureClass::TerminalNatural | FailureClass::TerminalExceptional => {
                        Some(policy.natural_outcome)
                    }
                }
            }
        }
    }
}

impl Retryable for ParticipantTask {
    fn try_once(&mut self) -> Attempt {
        if self.job.is_stopped() {
            debug!("{} abandoned", self.describe());
            return Attempt::Done;
        }

        let Some(outcome) = self.do_work() else {
            return Attempt::Retry;
        };

        if self.job.is_stopped() {
            debug!("{} abandoned, dropping {:?}", self.describe(), outcome);
            return Attempt::Done;
        }

        let txn_id = self.job.txn_id();
        let handle = Arc::clone(self.job.handle(self.index));
        let ctx = self.job.context();
        let job = &self.job;
        handle.record_with(outcome, |state| {
            // Checked again under the vote lock so a stopped job can never
            // log after the phase that replaced it.
            if job.is_stopped() {
                return false;
            }
            ctx.log.append(LogRecord::Vote {
                txn_id,
                participant: handle.id().clone(),
                state,
            });
            true
        });
        ctx.observer
            .participant_outcome(txn_id, self.job.phase(), handle.id(), outcome, self.attempt);
        self.job.record(self.index, outcome);
        Attempt::Done
    }

    fn attempts(&self) -> u32 {
        self.attempt
    }

    fn describe(&self) -> String {
        format!(
            "{:?} task for participant {} of Tx {}",
            self.job.phase(),
            self.handle().id(),
            self.job.txn_id()
        )
    }
}
