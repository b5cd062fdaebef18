//! currentOp-style state reports
//!
//! Serializable snapshots of a session's transaction state for operators.
//! Producing them takes the metrics mutex (and, for stashed state, the
//! participant mutex) but never blocks the command hot path.

use crate::locker::LockStats;
use crate::metrics::SingleTransactionStats;
use crate::op_context::{ClientInfo, ReadConcernArgs};
use replidb_common::{SessionId, Timestamp, TxnNumber};
use serde::Serialize;

/// The user-specified parameters of the reported transaction.
#[derive(Debug, Clone, Serialize)]
pub struct TransactionParametersReport {
    pub txn_number: Option<TxnNumber>,
    pub autocommit: bool,
    pub read_concern: ReadConcernArgs,
}

/// Transaction-level stats embedded in both report flavors.
#[derive(Debug, Clone, Serialize)]
pub struct TransactionReport {
    pub parameters: TransactionParametersReport,
    pub read_timestamp: Option<Timestamp>,
    pub time_active_micros: u64,
    pub time_inactive_micros: u64,
}

impl TransactionReport {
    pub(crate) fn from_stats(
        stats: &SingleTransactionStats,
        read_concern: &ReadConcernArgs,
        now: u64,
    ) -> Self {
        Self {
            parameters: TransactionParametersReport {
                txn_number: stats.txn_number(),
                autocommit: stats.auto_commit().unwrap_or(true),
                read_concern: read_concern.clone(),
            },
            read_timestamp: stats.read_timestamp(),
            time_active_micros: stats.time_active_micros(now),
            time_inactive_micros: stats.time_inactive_micros(now),
        }
    }
}

/// Report for a transaction whose resources are stashed between commands.
#[derive(Debug, Clone, Serialize)]
pub struct StashedStateReport {
    pub host: String,
    pub desc: String,
    pub client: Option<ClientInfo>,
    pub lsid: SessionId,
    pub transaction: TransactionReport,
    pub waiting_for_lock: bool,
    pub active: bool,
    pub locker: LockStats,
}
