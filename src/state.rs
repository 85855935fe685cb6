use serde::{Deserialize, Serialize};

/// Numeric identifier of a transaction owned by this coordinator.
pub type TxnId = u64;

/// Lifecycle state of a transaction, also used as the per-participant
/// vote/outcome state.
///
/// A transaction starts `Active`, becomes `Voting` once commit is requested,
/// and ends in one of the terminal states `Committed`, `Aborted` or
/// `NotChanged`. `Prepared` only appears as a participant vote and as the
/// aggregate of the prepare phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxnState {
    /// Participants may still join.
    Active,
    /// Commit was requested; participants are being asked to vote.
    Voting,
    /// The participant (or, in aggregate, the prepare phase) can commit.
    Prepared,
    /// Changes were made durable.
    Committed,
    /// Changes were rolled back.
    Aborted,
    /// Nothing had to be done.
    NotChanged,
}

impl TxnState {
    /// Returns `true` for `Committed`, `Aborted` and `NotChanged`.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TxnState::Committed | TxnState::Aborted | TxnState::NotChanged
        )
    }
}

/// The answer a participant gives to `prepare`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Vote {
    Prepared,
    NotChanged,
    Aborted,
}

impl From<Vote> for TxnState {
    fn from(vote: Vote) -> Self {
        match vote {
            Vote::Prepared => TxnState::Prepared,
            Vote::NotChanged => TxnState::NotChanged,
            Vote::Aborted => TxnState::Aborted,
        }
    }
}
