//! Per-transaction metrics observation
//!
//! Pure sink: the participant reports lifecycle events with timestamps; the
//! observer maintains the stats for the single transaction currently
//! associated with the session. currentOp-style readers consume the stats
//! through the metrics mutex alone, never the participant mutex.

use crate::op_context::ClientInfo;
use replidb_common::{Timestamp, TxnNumber};

/// The current wall-clock time in microseconds since the Unix epoch.
pub(crate) fn cur_time_micros() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

/// Accumulated statistics for one `(session, txn_number)` pair.
#[derive(Debug, Clone, Default)]
pub struct SingleTransactionStats {
    txn_number: Option<TxnNumber>,
    auto_commit: Option<bool>,
    start_time_micros: Option<u64>,
    end_time_micros: Option<u64>,
    time_active_micros: u64,
    /// Set while the transaction's resources are on an operation context
    last_time_active_start_micros: Option<u64>,
    read_timestamp: Option<Timestamp>,
    prepare_timestamp: Option<Timestamp>,
    last_client_info: Option<ClientInfo>,
}

impl SingleTransactionStats {
    pub fn txn_number(&self) -> Option<TxnNumber> {
        self.txn_number
    }

    pub fn auto_commit(&self) -> Option<bool> {
        self.auto_commit
    }

    /// Whether these stats track a multi-document transaction, as opposed to
    /// a retryable write.
    pub fn is_for_multi_document_transaction(&self) -> bool {
        self.auto_commit.is_some()
    }

    /// Whether the transaction's resources are currently on an operation
    /// context (not stashed).
    pub fn is_active(&self) -> bool {
        self.last_time_active_start_micros.is_some()
    }

    /// Whether the transaction reached a terminal outcome.
    pub fn is_ended(&self) -> bool {
        self.end_time_micros.is_some()
    }

    pub fn read_timestamp(&self) -> Option<Timestamp> {
        self.read_timestamp
    }

    pub fn prepare_timestamp(&self) -> Option<Timestamp> {
        self.prepare_timestamp
    }

    pub fn last_client_info(&self) -> Option<&ClientInfo> {
        self.last_client_info.as_ref()
    }

    /// Total duration, from start until end or `now`.
    pub fn duration_micros(&self, now: u64) -> u64 {
        let Some(start) = self.start_time_micros else {
            return 0;
        };
        self.end_time_micros.unwrap_or(now).saturating_sub(start)
    }

    /// Time spent with resources checked out onto an operation context.
    pub fn time_active_micros(&self, now: u64) -> u64 {
        let running = self
            .last_time_active_start_micros
            .map(|start| now.saturating_sub(start))
            .unwrap_or(0);
        self.time_active_micros + running
    }

    /// Time spent stashed between commands.
    pub fn time_inactive_micros(&self, now: u64) -> u64 {
        self.duration_micros(now)
            .saturating_sub(self.time_active_micros(now))
    }

    fn stop_active_timer(&mut self, now: u64) {
        if let Some(start) = self.last_time_active_start_micros.take() {
            self.time_active_micros += now.saturating_sub(start);
        }
    }
}

/// Observes participant state transitions and maintains the per-transaction
/// stats.
#[derive(Debug, Default)]
pub struct TransactionMetricsObserver {
    stats: SingleTransactionStats,
}

impl TransactionMetricsObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> &SingleTransactionStats {
        &self.stats
    }

    /// A new transaction number was assigned; drop the previous transaction's
    /// stats.
    pub fn reset(&mut self, txn_number: TxnNumber) {
        self.stats = SingleTransactionStats {
            txn_number: Some(txn_number),
            ..Default::default()
        };
    }

    /// A multi-document transaction started.
    pub fn on_start(&mut self, auto_commit: bool, cur_time: u64) {
        self.stats.auto_commit = Some(auto_commit);
        self.stats.start_time_micros = Some(cur_time);
        self.stats.last_time_active_start_micros = Some(cur_time);
    }

    /// Resources moved from the operation context into the stash.
    pub fn on_stash(&mut self, cur_time: u64) {
        self.stats.stop_active_timer(cur_time);
    }

    /// Resources moved from the stash onto an operation context.
    pub fn on_unstash(&mut self, cur_time: u64) {
        if self.stats.last_time_active_start_micros.is_none() {
            self.stats.last_time_active_start_micros = Some(cur_time);
        }
    }

    /// The transaction was prepared at `prepare_timestamp`.
    pub fn on_prepare(&mut self, prepare_timestamp: Timestamp, _cur_time: u64) {
        self.stats.prepare_timestamp = Some(prepare_timestamp);
    }

    /// A point-in-time read timestamp was chosen.
    pub fn on_choose_read_timestamp(&mut self, read_timestamp: Timestamp) {
        self.stats.read_timestamp = Some(read_timestamp);
    }

    /// The transaction committed.
    pub fn on_commit(&mut self, cur_time: u64) {
        self.stats.stop_active_timer(cur_time);
        self.stats.end_time_micros = Some(cur_time);
    }

    /// The transaction aborted while its resources were on an operation
    /// context.
    pub fn on_abort_active(&mut self, cur_time: u64) {
        self.stats.stop_active_timer(cur_time);
        self.stats.end_time_micros = Some(cur_time);
    }

    /// The transaction aborted while its resources were stashed.
    pub fn on_abort_inactive(&mut self, cur_time: u64) {
        self.stats.end_time_micros = Some(cur_time);
    }

    /// A command finished running under this transaction; remember who ran
    /// it, for reporting.
    pub fn on_transaction_operation(&mut self, client_info: ClientInfo) {
        self.stats.last_client_info = Some(client_info);
    }
}
