use log::debug;
use rocksdb::{DB, IteratorMode, Options, WriteOptions};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::errors::{CoordinatorError, Result};
use crate::txn_log::{LogRecord, TransactionLog};

/// A [`TransactionLog`] stored in RocksDB.
///
/// Records are bincode-encoded and keyed by a big-endian sequence number, so
/// RocksDB's key order is append order. Every write is synced before
/// `append` returns.
pub struct RocksDbTransactionLog {
    db: DB,
    next_seq: AtomicU64,
}

impl RocksDbTransactionLog {
    /// Opens (or creates) the log at `path`. Appends continue after the
    /// last record already stored there.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, path).map_err(|e| CoordinatorError::LogError(e.to_string()))?;

        let next_seq = match db.iterator(IteratorMode::End).next() {
            Some(Ok((key, _))) => decode_seq(&key)? + 1,
            Some(Err(e)) => return Err(CoordinatorError::LogError(e.to_string())),
            None => 0,
        };
        debug!("Opened transaction log, next sequence {}", next_seq);

        Ok(Self {
            db,
            next_seq: AtomicU64::new(next_seq),
        })
    }
}

impl TransactionLog for RocksDbTransactionLog {
    fn append(&self, record: LogRecord) -> Result<()> {
        let value =
            bincode::serialize(&record).map_err(|e| CoordinatorError::LogError(e.to_string()))?;
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let mut opts = WriteOptions::default();
        opts.set_sync(true);
        self.db
            .put_opt(seq.to_be_bytes(), value, &opts)
            .map_err(|e| CoordinatorError::LogError(e.to_string()))
    }

    fn replay(&self) -> Result<Vec<LogRecord>> {
        let mut records = Vec::new();
        for item in self.db.iterator(IteratorMode::Start) {
            let (_, value) = item.map_err(|e| CoordinatorError::LogError(e.to_string()))?;
            let record: LogRecord = bincode::deserialize(&value)
                .map_err(|e| CoordinatorError::LogError(e.to_string()))?;
            records.push(record);
        }
        Ok(records)
    }
}

fn decode_seq(key: &[u8]) -> Result<u64> {
    let bytes: [u8; 8] = key
        .try_into()
        .map_err(|_| CoordinatorError::LogError(format!("Malformed log key: {:?}", key)))?;
    Ok(u64::from_be_bytes(bytes))
}
