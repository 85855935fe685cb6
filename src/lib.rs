pub mod config;
pub mod coordinator;
pub mod errors;
pub mod handle;
pub mod job;
pub mod observe;
pub mod participant;
pub mod pool;
pub mod retry;
pub mod settler;
pub mod state;
pub mod task;
pub mod txn_log;

#[cfg(feature = "persistent")]
pub mod rocks_log;

// Re-export key types for easier access
pub use config::CoordinatorConfig;
pub use coordinator::{Coordinator, prelude};
pub use errors::{CoordinatorError, Result};
pub use handle::ParticipantHandle;
pub use job::{Job, Phase, PhasePolicy};
pub use observe::{LogObserver, Observer};
pub use participant::{FailureClass, Participant, ParticipantError, ParticipantId, ParticipantLocator};
pub use pool::{Scheduler, ThreadPool, TimerScheduler, WorkerPool};
pub use retry::RetryPolicy;
pub use settler::{SettleOutcome, SettlerTask};
pub use state::{TxnId, TxnState, Vote};
pub use txn_log::{LogRecord, MemoryTransactionLog, TransactionLog};

#[cfg(feature = "persistent")]
pub use rocks_log::RocksDbTransactionLog;
