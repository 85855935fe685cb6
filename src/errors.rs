use thiserror::Error;

use crate::participant::ParticipantError;
use crate::state::{TxnId, TxnState};

#[derive(Error, Debug)]
pub enum CoordinatorError {
    /// A phase still has participants without a recorded outcome, or it was
    /// never started. Callers poll again later.
    #[error("Transaction {0} not ready: phase has unsettled participants")]
    NotReady(TxnId),

    #[error("Unknown transaction: {0}")]
    UnknownTransaction(TxnId),

    #[error("Transaction {0} cannot commit: it was aborted")]
    CannotCommit(TxnId),

    #[error("Transaction {0} cannot abort: it was committed")]
    CannotAbort(TxnId),

    #[error("Transaction {txn_id} is {state:?}, cannot {operation}")]
    InvalidState {
        txn_id: TxnId,
        state: TxnState,
        operation: &'static str,
    },

    #[error("Log error: {0}")]
    LogError(String),

    #[error("Participant error: {0}")]
    Participant(#[from] ParticipantError),

    #[error("Coordinator is shut down")]
    ShutDown,

    #[error("Other error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, CoordinatorError>;
