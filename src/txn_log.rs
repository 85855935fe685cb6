use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use log::{debug, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::errors::Result;
use crate::participant::ParticipantId;
use crate::state::{TxnId, TxnState};

/// An entry in the coordinator's append-only transaction log.
///
/// Records are immutable once written and are only read back by
/// [`Replay`] when the coordinator starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogRecord {
    /// Commit was requested; the listed participants are about to be asked
    /// to vote.
    Voting {
        txn_id: TxnId,
        participants: Vec<ParticipantId>,
    },
    /// The coordinator decided the transaction's outcome.
    Decision {
        txn_id: TxnId,
        state: TxnState,
        participants: Vec<ParticipantId>,
    },
    /// One participant's final vote or final commit/abort acknowledgment.
    Vote {
        txn_id: TxnId,
        participant: ParticipantId,
        state: TxnState,
    },
    /// Every participant reached a terminal state; nothing is left to do.
    Settled { txn_id: TxnId, state: TxnState },
}

impl LogRecord {
    pub fn txn_id(&self) -> TxnId {
        match self {
            LogRecord::Voting { txn_id, .. }
            | LogRecord::Decision { txn_id, .. }
            | LogRecord::Vote { txn_id, .. }
            | LogRecord::Settled { txn_id, .. } => *txn_id,
        }
    }
}

/// Append-only persistent record of phase decisions.
///
/// Implementations must be safe to share between every job and settler of a
/// coordinator: `append` is called concurrently from worker threads and must
/// be atomic per record. The on-disk format, compaction and snapshots are
/// the implementation's concern.
pub trait TransactionLog: Send + Sync {
    /// Durably appends one record.
    ///
    /// # Errors
    ///
    /// Returns a `CoordinatorError::LogError` if the record could not be
    /// persisted. Callers log and ignore the failure; the in-memory decision
    /// stays authoritative until the next restart.
    fn append(&self, record: LogRecord) -> Result<()>;

    /// Returns every record in append order. Only used at startup.
    fn replay(&self) -> Result<Vec<LogRecord>>;
}

/// A `TransactionLog` kept in memory.
///
/// Useful for tests and for embedders that persist elsewhere. Cloning shares
/// the same underlying records, so a "restarted" coordinator can be handed
/// the log of the previous one.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransactionLog {
    records: Arc<Mutex<Vec<LogRecord>>>,
}

impl MemoryTransactionLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of every record appended so far.
    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl TransactionLog for MemoryTransactionLog {
    fn append(&self, record: LogRecord) -> Result<()> {
        self.records.lock().push(record);
        Ok(())
    }

    fn replay(&self) -> Result<Vec<LogRecord>> {
        Ok(self.records.lock().clone())
    }
}

/// Write side of the log used by jobs and the coordinator.
///
/// Persistence failures are reported at warn level and swallowed; they never
/// change a protocol decision.
#[derive(Clone)]
pub struct LogWriter {
    log: Arc<dyn TransactionLog>,
}

impl LogWriter {
    pub fn new(log: Arc<dyn TransactionLog>) -> Self {
        Self { log }
    }

    /// Appends `record`, returning whether the write succeeded.
    pub fn append(&self, record: LogRecord) -> bool {
        let txn_id = record.txn_id();
        match self.log.append(record) {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to log record for transaction {}: {}", txn_id, e);
                false
            }
        }
    }
}

/// A transaction rebuilt from the log that has not settled yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredTxn {
    pub txn_id: TxnId,
    /// `Voting`, or the logged decision.
    pub state: TxnState,
    /// Every enlisted participant with its last logged vote.
    pub participants: Vec<(ParticipantId, Option<TxnState>)>,
}

/// Result of replaying a transaction log.
#[derive(Debug, Default)]
pub struct Replay {
    /// Unsettled transactions in ascending ID order.
    pub unsettled: Vec<RecoveredTxn>,
    /// Highest transaction ID seen in any record.
    pub max_txn_id: Option<TxnId>,
}

impl Replay {
    /// Rebuilds per-transaction state from records in append order.
    ///
    /// A `Decision` replaces `Voting`, and a `Settled` record drops the
    /// transaction for good: later records for it are ignored. A `Vote` only
    /// counts for a transaction that has a `Voting` or `Decision` record, and
    /// only where the handle would have accepted the transition.
    pub fn from_records(records: impl IntoIterator<Item = LogRecord>) -> Self {
        let mut txns: HashMap<TxnId, RecoveredTxn> = HashMap::new();
        let mut settled: HashSet<TxnId> = HashSet::new();
        let mut max_txn_id: Option<TxnId> = None;

        for record in records {
            let txn_id = record.txn_id();
            max_txn_id = Some(max_txn_id.map_or(txn_id, |max| max.max(txn_id)));
            if settled.contains(&txn_id) {
                debug!("Ignoring {:?} for settled transaction {}", record, txn_id);
                continue;
            }

            match record {
                LogRecord::Voting {
                    participants, ..
                } => {
                    let txn = txns.entry(txn_id).or_insert_with(|| RecoveredTxn {
                        txn_id,
                        state: TxnState::Voting,
                        participants: Vec::new(),
                    });
                    merge_participants(txn, participants);
                }
                LogRecord::Decision {
                    state,
                    participants,
                    ..
                } => {
                    let txn = txns.entry(txn_id).or_insert_with(|| RecoveredTxn {
                        txn_id,
                        state,
                        participants: Vec::new(),
                    });
                    txn.state = state;
                    merge_participants(txn, participants);
                }
                LogRecord::Vote {
                    participant, state, ..
                } => {
                    let Some(txn) = txns.get_mut(&txn_id) else {
                        debug!(
                            "Ignoring vote of {} for transaction {} without a commit request",
                            participant, txn_id
                        );
                        continue;
                    };
                    match txn.participants.iter_mut().find(|(id, _)| *id == participant) {
                        Some((_, vote)) => {
                            if replaces(*vote, state) {
                                *vote = Some(state);
                            }
                        }
                        None => txn.participants.push((participant, Some(state))),
                    }
                }
                LogRecord::Settled { .. } => {
                    txns.remove(&txn_id);
                    settled.insert(txn_id);
                }
            }
        }

        let mut unsettled: Vec<RecoveredTxn> = txns.into_values().collect();
        unsettled.sort_by_key(|txn| txn.txn_id);
        Self {
            unsettled,
            max_txn_id,
        }
    }
}

/// Mirrors the transitions a `ParticipantHandle` accepts.
fn replaces(current: Option<TxnState>, next: TxnState) -> bool {
    match current {
        None => true,
        Some(TxnState::Prepared) => matches!(next, TxnState::Committed | TxnState::Aborted),
        Some(_) => false,
    }
}

fn merge_participants(txn: &mut RecoveredTxn, participants: Vec<ParticipantId>) {
    for participant in participants {
        if !txn.participants.iter().any(|(id, _)| *id == participant) {
            txn.participants.push((participant, None));
        }
    }
}
