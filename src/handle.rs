use log::debug;
use parking_lot::Mutex;
use std::sync::Arc;

use crate::participant::{Participant, ParticipantError, ParticipantId, ParticipantLocator};
use crate::state::TxnState;

/// One participant enlisted in one transaction.
///
/// The handle carries the participant's last known vote/outcome (unset until
/// the first phase records something, or pre-set from the log on recovery)
/// and lazily resolves the remote participant through the locator. A
/// resolved reference is cached; a failed resolution is retried on the next
/// call.
pub struct ParticipantHandle {
    id: ParticipantId,
    locator: Arc<dyn ParticipantLocator>,
    resolved: Mutex<Option<Arc<dyn Participant>>>,
    vote: Mutex<Option<TxnState>>,
}

impl ParticipantHandle {
    /// Creates a handle with no recorded vote.
    pub fn new(id: ParticipantId, locator: Arc<dyn ParticipantLocator>) -> Self {
        Self {
            id,
            locator,
            resolved: Mutex::new(None),
            vote: Mutex::new(None),
        }
    }

    /// Creates a handle whose vote is already known, e.g. from log replay.
    pub fn with_vote(
        id: ParticipantId,
        locator: Arc<dyn ParticipantLocator>,
        vote: Option<TxnState>,
    ) -> Self {
        let handle = Self::new(id, locator);
        *handle.vote.lock() = vote;
        handle
    }

    pub fn id(&self) -> &ParticipantId {
        &self.id
    }

    /// The last recorded vote/outcome, `None` if unset.
    pub fn vote(&self) -> Option<TxnState> {
        *self.vote.lock()
    }

    /// Returns the remote participant, resolving it on first use.
    pub fn participant(&self) -> Result<Arc<dyn Participant>, ParticipantError> {
        let mut resolved = self.resolved.lock();
        if let Some(participant) = resolved.as_ref() {
            return Ok(Arc::clone(participant));
        }
        let participant = self.locator.resolve(&self.id)?;
        *resolved = Some(Arc::clone(&participant));
        Ok(participant)
    }

    /// Records a new vote/outcome.
    ///
    /// Allowed transitions are unset to anything and `Prepared` to
    /// `Committed` or `Aborted`. Anything else, including any change out of
    /// `Committed`, is refused.
    ///
    /// # Returns
    ///
    /// `true` if the vote changed and must be logged.
    pub fn record(&self, state: TxnState) -> bool {
        self.record_with(state, |_| true)
    }

    /// Like [`ParticipantHandle::record`], but runs `apply` under the vote
    /// lock once the transition is allowed. The vote only changes if `apply`
    /// returns `true`, so whatever `apply` writes is ordered with every other
    /// transition of this handle.
    pub fn record_with(&self, state: TxnState, apply: impl FnOnce(TxnState) -> bool) -> bool {
        let mut vote = self.vote.lock();
        let allowed = match *vote {
            None => true,
            Some(TxnState::Prepared) => {
                matches!(state, TxnState::Committed | TxnState::Aborted)
            }
            Some(_) => false,
        };
        if !allowed {
            debug!(
                "Participant {} refused transition {:?} -> {:?}",
                self.id, *vote, state
            );
            return false;
        }
        if !apply(state) {
            return false;
        }
        *vote = Some(state);
        true
    }
}

impl std::fmt::Debug for ParticipantHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParticipantHandle")
            .field("id", &self.id)
            .field("vote", &self.vote())
            .finish()
    }
}
