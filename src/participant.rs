use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::state::{TxnId, TxnState, Vote};

/// Opaque identifier of a participant enlisted in a transaction.
///
/// The coordinator never interprets the identifier; it is handed to a
/// [`ParticipantLocator`] whenever a live reference is needed and written to
/// the transaction log so that enlisted participants survive a restart.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParticipantId(pub String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// How the coordinator treats a failed remote call.
///
/// The classification is decided once, at the transport boundary, by
/// [`ParticipantError::class`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// A transport hiccup. The task is resubmitted later.
    Retryable,
    /// The participant already reached the desired state by other means.
    /// The phase's natural outcome is recorded.
    TerminalNatural,
    /// The call can never succeed. The phase's natural outcome is recorded
    /// and the failure is reported.
    TerminalExceptional,
}

/// Error returned by a [`Participant`] call.
///
/// Each variant is one semantic failure category of the remote invocation
/// layer; transports are expected to map their own failures onto these.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParticipantError {
    /// The participant has no record of the transaction, or it has already
    /// settled it.
    #[error("No such transaction: {0}")]
    NoSuchTransaction(String),
    /// The remote object could not be found or activated.
    #[error("No such object: {0}")]
    NoSuchObject(String),
    /// The connection was refused or failed at the I/O level.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    /// The participant's host cannot be resolved.
    #[error("Unknown host: {0}")]
    UnknownHost(String),
    /// Arguments or results could not be marshalled.
    #[error("Marshal error: {0}")]
    Marshal(String),
    /// Authorization or registry access was refused.
    #[error("Access denied: {0}")]
    AccessDenied(String),
    /// Catch-all remote failure.
    #[error("Transport error: {0}")]
    Transport(String),
    /// The participant raised an unexpected local fault.
    #[error("Runtime fault: {0}")]
    Runtime(String),
}

impl ParticipantError {
    /// Classifies this failure for the retry policy.
    ///
    /// Only `ConnectionFailed` and `Transport` are retried; every other
    /// failure ends the task with the phase's natural outcome.
    pub fn class(&self) -> FailureClass {
        match self {
            ParticipantError::ConnectionFailed(_) | ParticipantError::Transport(_) => {
                FailureClass::Retryable
            }
            ParticipantError::NoSuchTransaction(_) | ParticipantError::NoSuchObject(_) => {
                FailureClass::TerminalNatural
            }
            ParticipantError::UnknownHost(_)
            | ParticipantError::Marshal(_)
            | ParticipantError::AccessDenied(_)
            | ParticipantError::Runtime(_) => FailureClass::TerminalExceptional,
        }
    }
}

/// A remote party enlisted in a transaction.
///
/// The coordinator drives every participant through prepare and then either
/// commit or abort. Calls may be issued from any worker thread and may be
/// repeated after a retryable failure, so implementations must be idempotent
/// for a given transaction ID.
///
/// Implementations must be `Send` and `Sync` to be used concurrently.
pub trait Participant: Send + Sync {
    /// Phase 1: asks the participant whether it can commit.
    ///
    /// # Arguments
    ///
    /// * `txn_id` - The transaction being voted on.
    ///
    /// # Returns
    ///
    /// Returns the participant's [`Vote`]: `Prepared` if it can commit,
    /// `NotChanged` if it has nothing to do, `Aborted` if it cannot commit.
    ///
    /// # Errors
    ///
    /// Returns a [`ParticipantError`] describing why the call failed.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use maat::prelude::*;
    ///
    /// struct ReadOnlyParticipant;
    ///
    /// impl Participant for ReadOnlyParticipant {
    ///     fn prepare(&self, _txn_id: TxnId) -> std::result::Result<Vote, ParticipantError> {
    ///         Ok(Vote::NotChanged)
    ///     }
    ///
    ///     fn commit(&self, _txn_id: TxnId) -> std::result::Result<(), ParticipantError> {
    ///         Ok(())
    ///     }
    ///
    ///     fn abort(&self, _txn_id: TxnId) -> std::result::Result<(), ParticipantError> {
    ///         Ok(())
    ///     }
    /// }
    /// ```
    fn prepare(&self, txn_id: TxnId) -> Result<Vote, ParticipantError>;

    /// Phase 2: makes the prepared changes durable.
    fn commit(&self, txn_id: TxnId) -> Result<(), ParticipantError>;

    /// Phase 2: discards any prepared changes.
    fn abort(&self, txn_id: TxnId) -> Result<(), ParticipantError>;

    /// Prepares and, if prepared, commits in a single round trip.
    ///
    /// Used when a transaction has exactly one participant. The default
    /// implementation issues `prepare` followed by `commit`.
    ///
    /// # Returns
    ///
    /// `Committed`, `Aborted` or `NotChanged`.
    fn prepare_and_commit(&self, txn_id: TxnId) -> Result<TxnState, ParticipantError> {
        match self.prepare(txn_id)? {
            Vote::Prepared => {
                self.commit(txn_id)?;
                Ok(TxnState::Committed)
            }
            vote => Ok(vote.into()),
        }
    }
}

/// Turns a [`ParticipantId`] into a live participant reference.
///
/// Resolution may fail (the participant's endpoint is temporarily unknown);
/// the coordinator treats such failures as transient and tries again later.
pub trait ParticipantLocator: Send + Sync {
    fn resolve(&self, id: &ParticipantId) -> Result<Arc<dyn Participant>, ParticipantError>;
}
