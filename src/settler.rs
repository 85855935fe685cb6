use log::{debug, warn};
use std::sync::Arc;

use crate::errors::{CoordinatorError, Result};
use crate::observe::Observer;
use crate::participant::FailureClass;
use crate::retry::{Attempt, Retryable};
use crate::state::{TxnId, TxnState};

/// Operations a [`SettlerTask`] needs from the coordinator.
pub trait Settle: Send + Sync {
    /// The transaction's current decision state.
    fn decision(&self, txn_id: TxnId) -> Result<TxnState>;

    /// Drives the transaction forward to `Committed` (preparing first if no
    /// decision was logged).
    fn settle_commit(&self, txn_id: TxnId) -> Result<TxnState>;

    /// Drives the transaction to `Aborted`.
    fn settle_abort(&self, txn_id: TxnId) -> Result<TxnState>;

    /// Parks a transaction that cannot be settled automatically.
    fn mark_stuck(&self, txn_id: TxnId, state: TxnState);
}

/// Result of one settler attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleOutcome {
    /// The transaction reached a terminal state, or was already settled.
    Settled,
    /// A transient failure; try again later.
    Pending,
    /// The transaction is in a state the settler cannot act on. It needs an
    /// operator and is not retried.
    Stuck,
    /// An unexpected failure was logged and swallowed; the task retires.
    Failed,
}

/// Repeatedly tries to drive one recovered transaction to a terminal state.
pub struct SettlerTask {
    txn_id: TxnId,
    settle: Arc<dyn Settle>,
    observer: Arc<dyn Observer>,
    attempts: u32,
}

impl SettlerTask {
    pub fn new(txn_id: TxnId, settle: Arc<dyn Settle>, observer: Arc<dyn Observer>) -> Self {
        Self {
            txn_id,
            settle,
            observer,
            attempts: 0,
        }
    }

    pub fn txn_id(&self) -> TxnId {
        self.txn_id
    }

    /// Makes one attempt to settle the transaction.
    pub fn try_settle(&mut self) -> SettleOutcome {
        self.attempts += 1;
        let state = match self.settle.decision(self.txn_id) {
            Ok(state) => state,
            Err(e) => return self.classify(Err(e)),
        };

        let result = match state {
            TxnState::Voting | TxnState::Committed => self.settle.settle_commit(self.txn_id),
            TxnState::Aborted => self.settle.settle_abort(self.txn_id),
            other => {
                self.settle.mark_stuck(self.txn_id, other);
                self.observer.stuck(self.txn_id, other);
                return SettleOutcome::Stuck;
            }
        };
        self.classify(result)
    }

    fn classify(&self, result: Result<TxnState>) -> SettleOutcome {
        match result {
            Ok(_) => SettleOutcome::Settled,
            Err(CoordinatorError::UnknownTransaction(_)) | Err(CoordinatorError::CannotCommit(_)) => {
                SettleOutcome::Settled
            }
            Err(CoordinatorError::NotReady(_)) => SettleOutcome::Pending,
            Err(CoordinatorError::Participant(e)) => match e.class() {
                FailureClass::TerminalNatural => SettleOutcome::Settled,
                FailureClass::Retryable => SettleOutcome::Pending,
                FailureClass::TerminalExceptional => {
                    warn!("Settler for Tx {} gave up: {}", self.txn_id, e);
                    SettleOutcome::Failed
                }
            },
            Err(e) => {
                warn!("Settler for Tx {} gave up: {}", self.txn_id, e);
                SettleOutcome::Failed
            }
        }
    }
}

impl Retryable for SettlerTask {
    fn try_once(&mut self) -> Attempt {
        match self.try_settle() {
            SettleOutcome::Settled => {
                self.observer.settled(self.txn_id, self.attempts);
                Attempt::Done
            }
            SettleOutcome::Pending => Attempt::Retry,
            outcome => {
                debug!("Settler for Tx {} retired: {:?}", self.txn_id, outcome);
                Attempt::Done
            }
        }
    }

    fn attempts(&self) -> u32 {
        self.attempts
    }

    fn describe(&self) -> String {
        format!("Settler for Tx {}", self.txn_id)
    }
}
