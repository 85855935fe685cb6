use log::{debug, error, info, warn};

use crate::job::Phase;
use crate::participant::{FailureClass, ParticipantError, ParticipantId};
use crate::state::{TxnId, TxnState};

const TARGET: &str = "maat::ops";

/// Receives protocol events from jobs, tasks and settlers.
///
/// An observer is injected into the coordinator at construction and shared
/// by every job it runs. All methods have empty defaults so implementations
/// only override what they care about.
pub trait Observer: Send + Sync {
    fn phase_started(&self, _txn_id: TxnId, _phase: Phase, _participants: usize) {}

    /// A participant's outcome for `phase` was recorded (and logged unless it
    /// was already known).
    fn participant_outcome(
        &self,
        _txn_id: TxnId,
        _phase: Phase,
        _participant: &ParticipantId,
        _outcome: TxnState,
        _attempt: u32,
    ) {
    }

    fn participant_failure(
        &self,
        _txn_id: TxnId,
        _phase: Phase,
        _participant: &ParticipantId,
        _error: &ParticipantError,
        _attempt: u32,
    ) {
    }

    /// `committed` counts handles whose outcome is `Committed`; it is
    /// informational only.
    fn phase_completed(&self, _txn_id: TxnId, _phase: Phase, _outcome: TxnState, _committed: usize) {}

    fn settled(&self, _txn_id: TxnId, _attempts: u32) {}

    fn stuck(&self, _txn_id: TxnId, _state: TxnState) {}

    fn recovered(&self, _unsettled: usize) {}
}

/// Forwards observer events to the `log` facade under the `maat::ops` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl Observer for LogObserver {
    fn phase_started(&self, txn_id: TxnId, phase: Phase, participants: usize) {
        debug!(target: TARGET, "Tx {} {:?} started with {} participant(s)", txn_id, phase, participants);
    }

    fn participant_outcome(
        &self,
        txn_id: TxnId,
        phase: Phase,
        participant: &ParticipantId,
        outcome: TxnState,
        attempt: u32,
    ) {
        debug!(
            target: TARGET,
            "Tx {} {:?}: participant {} -> {:?} (attempt {})",
            txn_id, phase, participant, outcome, attempt
        );
    }

    fn participant_failure(
        &self,
        txn_id: TxnId,
        phase: Phase,
        participant: &ParticipantId,
        error: &ParticipantError,
        attempt: u32,
    ) {
        match error.class() {
            FailureClass::Retryable | FailureClass::TerminalNatural => debug!(
                target: TARGET,
                "Tx {} {:?}: participant {} failed on attempt {}: {}",
                txn_id, phase, participant, attempt, error
            ),
            FailureClass::TerminalExceptional => warn!(
                target: TARGET,
                "Tx {} {:?}: participant {} failed terminally on attempt {}: {}",
                txn_id, phase, participant, attempt, error
            ),
        }
    }

    fn phase_completed(&self, txn_id: TxnId, phase: Phase, outcome: TxnState, committed: usize) {
        info!(
            target: TARGET,
            "Tx {} {:?} completed: {:?} ({} committed)",
            txn_id, phase, outcome, committed
        );
    }

    fn settled(&self, txn_id: TxnId, attempts: u32) {
        info!(target: TARGET, "Tx {} settled after {} attempt(s)", txn_id, attempts);
    }

    fn stuck(&self, txn_id: TxnId, state: TxnState) {
        error!(
            target: TARGET,
            "Tx {} cannot be settled from state {:?}; operator intervention required",
            txn_id, state
        );
    }

    fn recovered(&self, unsettled: usize) {
        info!(target: TARGET, "Recovered {} unsettled transaction(s) from the log", unsettled);
    }
}
