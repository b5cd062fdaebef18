//! The per-session transaction participant
//!
//! Drives a single logical session through the lifecycle of retryable writes
//! and multi-document transactions, including the two-phase prepare/commit
//! variant. The participant enforces the state transition lattice across
//! every entry point, moves execution resources between the operation
//! context and its stash, and guarantees exactly-once terminal outcomes.
//!
//! Two mutexes, strictly ordered participant -> metrics: the participant
//! mutex guards all transaction state and is never held across storage
//! commit/abort or op-observer calls; the metrics mutex guards only the
//! per-transaction stats so currentOp readers never block on the hot path.

use crate::command_guard;
use crate::config::ClusterRole;
use crate::error::{Result, TxnError};
use crate::locker::{LockMode, LockStats};
use crate::metrics::{cur_time_micros, SingleTransactionStats, TransactionMetricsObserver};
use crate::op_context::{OperationContext, ReadConcernArgs, ServiceContext};
use crate::oplog::OplogSlot;
use crate::report::{StashedStateReport, TransactionReport};
use crate::resources::{OplogSlotReserver, TxnResources};
use crate::session::{RefreshState, SessionCore};
use crate::state::{TransitionValidation, TxnState};
use parking_lot::{Mutex, MutexGuard};
use replidb_common::{OpTime, ReplOperation, Timestamp, TxnNumber, MAX_DOCUMENT_INTERNAL_BYTES};
use std::sync::Arc;
use std::time::Instant;

/// Which point in time a speculative transaction snapshot reads at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeculativeTransactionOpTime {
    AllCommitted,
    LastApplied,
}

/// State guarded by the participant mutex.
struct ParticipantInner {
    /// Last observed transaction number; uninitialized until first use
    active_txn_number: Option<TxnNumber>,
    state: TxnState,
    /// `None` = retryable write, `Some(false)` = multi-document transaction
    auto_commit: Option<bool>,
    /// Present iff the participant holds custody of the transaction's
    /// resources between commands
    stash: Option<TxnResources>,
    /// Oplog entries buffered by the in-progress transaction
    operations: Vec<ReplOperation>,
    operation_bytes: u64,
    prepare_op_time: OpTime,
    /// Timestamp of the first oplog entry written by this transaction (the
    /// prepare entry, while transactions write at most one entry)
    oldest_oplog_entry_ts: Option<Timestamp>,
    speculative_read_op_time: OpTime,
    expire_deadline: Option<Instant>,
    last_refresh_count: u64,
    in_shutdown: bool,
}

/// The per-session transaction participant. Lives as long as its session;
/// state `None` separates consecutive logical transactions.
pub struct TransactionParticipant {
    session: Arc<SessionCore>,
    service: Arc<ServiceContext>,
    inner: Mutex<ParticipantInner>,
    /// Guards only the metrics stats; always acquirable while the
    /// participant mutex is held, never the other way around.
    metrics: Mutex<TransactionMetricsObserver>,
}

impl TransactionParticipant {
    pub fn new(session: Arc<SessionCore>, service: Arc<ServiceContext>) -> Self {
        Self {
            session,
            service,
            inner: Mutex::new(ParticipantInner {
                active_txn_number: None,
                state: TxnState::None,
                auto_commit: None,
                stash: None,
                operations: Vec::new(),
                operation_bytes: 0,
                prepare_op_time: OpTime::null(),
                oldest_oplog_entry_ts: None,
                speculative_read_op_time: OpTime::null(),
                expire_deadline: None,
                last_refresh_count: 0,
                in_shutdown: false,
            }),
            metrics: Mutex::new(TransactionMetricsObserver::new()),
        }
    }

    // === QUERY METHODS ===

    /// Current transaction state.
    pub fn state(&self) -> TxnState {
        self.inner.lock().state
    }

    /// Last observed transaction number.
    pub fn active_txn_number(&self) -> Option<TxnNumber> {
        self.inner.lock().active_txn_number
    }

    /// Whether the participant holds custody of stashed resources.
    pub fn has_stashed_resources(&self) -> bool {
        self.inner.lock().stash.is_some()
    }

    /// Number of operations buffered by the in-progress transaction.
    pub fn operation_count(&self) -> usize {
        self.inner.lock().operations.len()
    }

    /// Total in-memory size of the buffered operations.
    pub fn operation_bytes(&self) -> u64 {
        self.inner.lock().operation_bytes
    }

    /// The optime reserved for the prepare oplog entry, null until prepared.
    pub fn prepare_op_time(&self) -> OpTime {
        self.inner.lock().prepare_op_time
    }

    /// The chosen point-in-time read optime, null until chosen.
    pub fn speculative_read_op_time(&self) -> OpTime {
        self.inner.lock().speculative_read_op_time
    }

    // === LIFECYCLE ENTRY POINTS ===

    /// Resolve a statement's intent: retryable write, new multi-document
    /// transaction, or continuation of one.
    pub fn begin_or_continue(
        &self,
        txn_number: TxnNumber,
        autocommit: Option<bool>,
        start_transaction: Option<bool>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();

        if let Some(refresh) = self.session.last_refresh_state() {
            self.update_state_from_refresh(&mut inner, refresh);
        }

        // Requests without an autocommit field are retryable writes. They
        // cannot specify startTransaction; request parsing enforces that.
        let Some(autocommit) = autocommit else {
            if start_transaction.is_some() {
                crate::fatal!("retryable write cannot specify startTransaction");
            }
            return self.begin_or_continue_retryable_write(&mut inner, txn_number);
        };

        // autocommit can only be given as false; verified at parsing.
        if autocommit {
            crate::fatal!("autocommit=true is not a valid transaction option");
        }

        let Some(start_transaction) = start_transaction else {
            return self.continue_multi_document_transaction(&mut inner, txn_number);
        };

        // startTransaction can only be specified as true; verified at
        // parsing.
        if !start_transaction {
            crate::fatal!("startTransaction=false is not a valid transaction option");
        }

        if inner.active_txn_number == Some(txn_number) {
            // Servers in a sharded cluster can start a new transaction at
            // the active transaction number to allow internal retries by
            // routers on re-targeting errors.
            if self.service.config().cluster_role() == ClusterRole::None {
                return Err(TxnError::ConflictingOperationInProgress(
                    "only servers in a sharded cluster can start a new transaction at the \
                     active transaction number"
                        .to_string(),
                ));
            }

            // The active transaction number can only be reused if the
            // transaction is not in a state that indicates it has been
            // involved in a two phase commit.
            let restartable = [TxnState::InProgress, TxnState::Aborted];
            if !inner.state.is_in(&restartable) {
                return Err(TxnError::ConflictingOperationInProgress(format!(
                    "cannot start a transaction at given transaction number {}; a \
                     transaction with the same number is in state {}",
                    txn_number, inner.state
                )));
            }
        } else if inner.active_txn_number.is_some_and(|active| txn_number < active) {
            return Err(TxnError::ConflictingOperationInProgress(format!(
                "cannot start transaction {} on session {} because a newer transaction {} \
                 has already started",
                txn_number,
                self.session.session_id(),
                inner.active_txn_number.unwrap_or_default()
            )));
        }

        self.begin_multi_document_transaction(&mut inner, txn_number);
        Ok(())
    }

    /// Start a multi-document transaction for internal paths that have
    /// already validated their preconditions.
    pub fn begin_transaction_unconditionally(&self, txn_number: TxnNumber) {
        let mut inner = self.inner.lock();
        self.begin_multi_document_transaction(&mut inner, txn_number);
    }

    /// Observe a transaction number advanced externally on the session.
    pub fn check_for_new_txn_number(&self) {
        let session_txn_number = self.session.active_txn_number();
        let mut inner = self.inner.lock();
        if let Some(txn_number) = session_txn_number {
            if inner.active_txn_number.map_or(true, |active| txn_number > active) {
                self.set_new_txn_number(&mut inner, txn_number);
            }
        }
    }

    /// Choose the transaction's point-in-time read and preallocate its
    /// snapshot.
    pub fn set_speculative_transaction_op_time(
        &self,
        op_ctx: &mut OperationContext,
        op_time_choice: SpeculativeTransactionOpTime,
    ) {
        let mut inner = self.inner.lock();
        let read_source = match op_time_choice {
            SpeculativeTransactionOpTime::AllCommitted => crate::storage::ReadSource::AllCommitted,
            SpeculativeTransactionOpTime::LastApplied => crate::storage::ReadSource::LastApplied,
        };
        op_ctx.recovery_unit_mut().set_timestamp_read_source(read_source);
        op_ctx.recovery_unit_mut().preallocate_snapshot();
        let Some(read_timestamp) = op_ctx.recovery_unit_mut().point_in_time_read_timestamp() else {
            crate::fatal!("recovery unit did not establish a point-in-time read timestamp");
        };
        // Transactions do not survive term changes, so combining the current
        // term with the snapshot timestamp does not race.
        inner.speculative_read_op_time = OpTime::new(read_timestamp, self.service.term());
        drop(inner);
        self.metrics.lock().on_choose_read_timestamp(read_timestamp);
    }

    // === RESOURCE CUSTODY ===

    /// Pull the transaction's resources off the operation context into the
    /// stash when a command returns without completing the transaction.
    pub fn stash_transaction_resources(&self, op_ctx: &mut OperationContext) -> Result<()> {
        if op_ctx.client().is_in_direct_client() {
            return Ok(());
        }
        let txn_number = Self::required_txn_number(op_ctx);

        let mut inner = self.inner.lock();

        // Always check the session's transaction number, since migration can
        // modify it without checking out the session. Aborted is not an
        // error here: this runs at the end of the abortTransaction command.
        self.check_is_active_transaction(&inner, txn_number, false)?;

        if !inner.state.in_multi_document_transaction() {
            // Not in a multi-document transaction: nothing to stash.
            return Ok(());
        }

        self.stash_active_transaction(&mut inner, op_ctx);
        Ok(())
    }

    /// Install the transaction's resources onto the operation context at the
    /// start of a command, either from the stash or freshly allocated.
    pub fn unstash_transaction_resources(
        &self,
        op_ctx: &mut OperationContext,
        cmd_name: &str,
    ) -> Result<()> {
        if op_ctx.client().is_in_direct_client() {
            return Ok(());
        }
        let txn_number = Self::required_txn_number(op_ctx);

        {
            let mut inner = self.inner.lock();

            // The session's transaction number and the state can both be
            // modified by session kill and migration, which do not check out
            // the session.
            self.check_is_active_transaction(&inner, txn_number, false)?;

            // Not a multi-document transaction: nothing to unstash.
            if inner.state.is_none() {
                if inner.stash.is_some() {
                    crate::fatal!("stashed resources exist outside a multi-document transaction");
                }
                return Ok(());
            }

            command_guard::check_command_valid_with_state(inner.state, txn_number, cmd_name)?;

            if inner.stash.is_some() {
                // Resources already exist for this transaction; transfer
                // them from the stash to the operation context.
                if !op_ctx.read_concern().is_empty() {
                    return Err(TxnError::InvalidOptions(
                        "only the first command in a transaction may specify a readConcern"
                            .to_string(),
                    ));
                }
                if let Some(stash) = inner.stash.as_mut() {
                    stash.release(op_ctx)?;
                }
                inner.stash = None;
                self.metrics.lock().on_unstash(cur_time_micros());
                return Ok(());
            }

            // With no stashed resources the transaction cannot be prepared.
            if inner.state.is_prepared() {
                crate::fatal!("prepared transaction has no stashed resources");
            }
            if !inner.state.is_in_progress() {
                // Either committed with this being a commitTransaction
                // retry, or in the process of committing.
                return Ok(());
            }

            // First statement of an in-progress transaction: set up fresh
            // resources on the operation context.
            op_ctx.begin_wuow();

            // Bound every lock request so a transaction cannot stall the
            // rest of the system behind a lock queue.
            if let Some(timeout) = self.service.config().max_transaction_lock_timeout() {
                op_ctx.locker_mut().set_max_lock_timeout(timeout);
            }

            self.metrics.lock().on_unstash(cur_time_micros());
        }

        // Storage engines start transactions lazily; establish the
        // point-in-time snapshot now, under at least a global intent lock.
        // Intent-exclusive, pessimistically: the transaction may write, and
        // upgrading IS to IX is not deadlock-safe.
        op_ctx.acquire_global_lock(LockMode::IntentExclusive)?;
        op_ctx.recovery_unit_mut().preallocate_snapshot();
        op_ctx.release_global_lock();
        Ok(())
    }

    // === PREPARE / COMMIT / ABORT ===

    /// Prepare the transaction for two-phase commit, returning the prepare
    /// timestamp. `prepare_op_time` is `None` on the primary (a slot is
    /// reserved) and dictated by the caller when applying as a secondary.
    pub fn prepare_transaction(
        &self,
        op_ctx: &mut OperationContext,
        prepare_op_time: Option<OpTime>,
    ) -> Result<Timestamp> {
        let txn_number = Self::required_txn_number(op_ctx);

        let inner = self.inner.lock();
        self.check_is_active_transaction(&inner, txn_number, true)?;

        // Pin the transaction number: no other thread may replace it while
        // the session has a prepared transaction.
        self.session.lock_txn_number(TxnError::PreparedTransactionInProgress(
            "cannot change transaction number while the session has a prepared transaction"
                .to_string(),
        ));

        match self.prepare_transaction_guarded(inner, op_ctx, prepare_op_time) {
            Ok(prepare_timestamp) => Ok(prepare_timestamp),
            Err(err) => {
                if prepare_op_time.is_some() {
                    // Prepare on a secondary applies a decided transaction
                    // and must always succeed.
                    crate::fatal!(
                        "failed to prepare transaction {} with a dictated optime: {}",
                        txn_number,
                        err
                    );
                }
                // Abort-guard: any failure before the prepare completes
                // aborts the active transaction.
                let _ = self.abort_active_transaction(op_ctx);
                Err(err)
            }
        }
    }

    fn prepare_transaction_guarded(
        &self,
        mut inner: MutexGuard<'_, ParticipantInner>,
        op_ctx: &mut OperationContext,
        prepare_op_time: Option<OpTime>,
    ) -> Result<Timestamp> {
        inner
            .state
            .transition_to(TxnState::Prepared, TransitionValidation::Validate);

        let mut reserver = None;
        let prepare_slot = match prepare_op_time {
            // On a secondary the caller dictates the timestamp.
            Some(op_time) => OplogSlot::new(op_time),
            // On the primary, reserve an optime for the prepare timestamp.
            // The reservation keeps a hole in the oplog that makes snapshot
            // and afterClusterTime readers wait until this transaction is
            // done being prepared.
            None => {
                let slot_reserver = OplogSlotReserver::reserve(op_ctx)?;
                let slot = slot_reserver.slot();
                reserver = Some(slot_reserver);
                slot
            }
        };

        if !inner.prepare_op_time.is_null() {
            crate::fatal!(
                "this transaction has already reserved a prepare optime at {}",
                inner.prepare_op_time
            );
        }
        inner.prepare_op_time = prepare_slot.op_time;

        op_ctx
            .recovery_unit_mut()
            .set_prepare_timestamp(prepare_slot.op_time.timestamp());
        op_ctx.prepare_wuow();

        // The op-observer writes the prepare oplog entry and calls back into
        // the session; the mutex cannot be held across it.
        drop(inner);
        self.service
            .observer()
            .on_transaction_prepare(op_ctx, prepare_slot);
        // Nothing past the observer call can fail, so the abort-guard in the
        // caller is effectively dismissed here.

        let mut inner = self.inner.lock();
        if let Some(ts) = inner.oldest_oplog_entry_ts {
            crate::fatal!(
                "this transaction's oldest oplog entry timestamp has already been set to {}",
                ts
            );
        }
        // Track the timestamp of the first oplog entry written by this
        // transaction. Today only the prepare entry exists; this will change
        // when transactions write multiple entries.
        inner.oldest_oplog_entry_ts = Some(prepare_slot.op_time.timestamp());
        drop(inner);

        self.metrics
            .lock()
            .on_prepare(prepare_slot.op_time.timestamp(), cur_time_micros());

        // The prepare entry has been written; dropping the reserver aborts
        // the side transaction and releases the oplog hole.
        drop(reserver);

        Ok(prepare_slot.op_time.timestamp())
    }

    /// Buffer an operation on the in-progress transaction.
    pub fn add_transaction_operation(
        &self,
        op_ctx: &mut OperationContext,
        operation: ReplOperation,
    ) -> Result<()> {
        let txn_number = Self::required_txn_number(op_ctx);
        let mut inner = self.inner.lock();
        self.check_is_active_transaction(&inner, txn_number, true)?;

        if !inner.state.is_in_progress() {
            crate::fatal!(
                "operations can only be added to an in-progress transaction; current state: {}",
                inner.state
            );
        }
        if inner.auto_commit != Some(false) || inner.active_txn_number.is_none() {
            crate::fatal!("operations can only be buffered by a multi-document transaction");
        }
        if !op_ctx.locker().in_wuow() {
            crate::fatal!("buffering an operation requires an active write unit of work");
        }

        let operation_size = operation.size_bytes().map_err(TxnError::InvalidOptions)?;
        inner.operation_bytes += operation_size;
        inner.operations.push(operation);
        // The on-oplog encoding adds overhead beyond the in-memory size, so
        // a transaction can still fail at commit; failing early here avoids
        // exhausting server memory first.
        if inner.operation_bytes > MAX_DOCUMENT_INTERNAL_BYTES {
            return Err(TxnError::TransactionTooLarge(format!(
                "total size of all transaction operations must be less than {}; actual size \
                 is {}",
                MAX_DOCUMENT_INTERNAL_BYTES, inner.operation_bytes
            )));
        }
        Ok(())
    }

    /// Move the buffered operations out of the participant, ending their
    /// accumulation.
    pub fn end_transaction_and_retrieve_operations(
        &self,
        op_ctx: &mut OperationContext,
    ) -> Result<Vec<ReplOperation>> {
        let txn_number = Self::required_txn_number(op_ctx);
        let mut inner = self.inner.lock();
        self.check_is_active_transaction(&inner, txn_number, true)?;

        if !inner.state.is_in(&[TxnState::InProgress, TxnState::Prepared]) {
            crate::fatal!(
                "transactions can only be ended when prepared or in progress; current state: {}",
                inner.state
            );
        }
        if inner.auto_commit.is_none() {
            crate::fatal!("only a multi-document transaction has operations to retrieve");
        }

        inner.operation_bytes = 0;
        Ok(std::mem::take(&mut inner.operations))
    }

    /// Commit a transaction that was never prepared.
    pub fn commit_unprepared_transaction(&self, op_ctx: &mut OperationContext) -> Result<()> {
        let txn_number = Self::required_txn_number(op_ctx);
        let inner = self.inner.lock();
        self.check_is_active_transaction(&inner, txn_number, true)?;

        if inner.state.is_prepared() {
            return Err(TxnError::InvalidOptions(
                "commitTransaction must provide commitTimestamp to prepared transaction"
                    .to_string(),
            ));
        }
        if let Some(ts) = inner.oldest_oplog_entry_ts {
            crate::fatal!(
                "the oldest oplog entry timestamp should not be set on an unprepared \
                 transaction, but it is {}",
                ts
            );
        }

        // The op-observer writes the commit entry in the same unit of work
        // as the data; drop the mutex across it.
        drop(inner);
        self.service.observer().on_transaction_commit(op_ctx, None, None);

        let mut inner = self.inner.lock();
        self.check_is_active_transaction(&inner, txn_number, true)?;
        // No externally visible changes were made yet, so the state could be
        // considered InProgress until now; anything that threw before this
        // point made the entry point abort the transaction.
        inner.state.transition_to(
            TxnState::CommittingWithoutPrepare,
            TransitionValidation::Validate,
        );

        drop(inner);
        self.commit_storage_transaction(op_ctx);

        let mut inner = self.inner.lock();
        self.check_is_active_transaction(&inner, txn_number, false)?;
        if !inner.state.is_committing_without_prepare() {
            crate::fatal!("current state: {}", inner.state);
        }
        self.finish_commit_transaction(&mut inner, op_ctx);
        Ok(())
    }

    /// Commit a prepared transaction at `commit_timestamp`.
    pub fn commit_prepared_transaction(
        &self,
        op_ctx: &mut OperationContext,
        commit_timestamp: Timestamp,
    ) -> Result<()> {
        let txn_number = Self::required_txn_number(op_ctx);
        let mut inner = self.inner.lock();
        self.check_is_active_transaction(&inner, txn_number, true)?;

        if !inner.state.is_prepared() {
            return Err(TxnError::InvalidOptions(
                "commitTransaction cannot provide commitTimestamp to unprepared transaction"
                    .to_string(),
            ));
        }
        if commit_timestamp.is_null() {
            return Err(TxnError::InvalidOptions(
                "'commitTimestamp' cannot be null".to_string(),
            ));
        }
        if commit_timestamp < inner.prepare_op_time.timestamp() {
            return Err(TxnError::InvalidOptions(
                "'commitTimestamp' must be greater than or equal to 'prepareTimestamp'"
                    .to_string(),
            ));
        }

        inner.state.transition_to(
            TxnState::CommittingWithPrepare,
            TransitionValidation::Validate,
        );
        op_ctx.recovery_unit_mut().set_commit_timestamp(commit_timestamp);

        // It is illegal for committing a prepared transaction to fail for
        // any reason other than an invalid command, so everything from here
        // on crashes instead of propagating.

        // Reserve an oplog slot before committing so that no write causally
        // related to this commit enters the oplog at an earlier timestamp
        // than the commit entry.
        let reserver = match OplogSlotReserver::reserve(op_ctx) {
            Ok(reserver) => reserver,
            Err(err) => crate::fatal!(
                "failed to reserve the commit oplog slot for prepared transaction {} on {}: {}",
                txn_number,
                self.session.session_id(),
                err
            ),
        };
        let commit_slot = reserver.slot();
        if commit_slot.op_time.timestamp() < commit_timestamp {
            crate::fatal!(
                "commit oplog entry optime {} must not be earlier than commit timestamp {}",
                commit_slot.op_time,
                commit_timestamp
            );
        }

        // Neither storage commit nor the op-observer may run under the
        // mutex; the observer calls back into the session.
        drop(inner);
        self.commit_storage_transaction(op_ctx);
        self.service.observer().on_transaction_commit(
            op_ctx,
            Some(commit_slot),
            Some(commit_timestamp),
        );

        let mut inner = self.inner.lock();
        if let Err(err) = self.check_is_active_transaction(&inner, txn_number, true) {
            crate::fatal!(
                "prepared transaction {} on {} was displaced during commit: {}",
                txn_number,
                self.session.session_id(),
                err
            );
        }
        self.finish_commit_transaction(&mut inner, op_ctx);
        self.session.unlock_txn_number();

        drop(inner);
        // The commit entry has been written; the reserver now releases the
        // oplog hole.
        drop(reserver);
        Ok(())
    }

    /// Abort an in-progress transaction from a non-user path. A prepared
    /// transaction is never aborted this way.
    pub fn abort_arbitrary_transaction(&self) {
        let mut inner = self.inner.lock();
        if !inner.state.is_in_progress() {
            return;
        }
        self.abort_transaction_on_session(&mut inner);
    }

    /// Abort an in-progress transaction that has outlived its deadline,
    /// killing the operation currently running under the session first.
    pub fn abort_arbitrary_transaction_if_expired(&self) {
        let mut inner = self.inner.lock();
        if !inner.state.is_in_progress() {
            return;
        }
        match inner.expire_deadline {
            Some(deadline) if deadline < Instant::now() => {}
            _ => return,
        }

        if let Some(operation) = self.session.current_operation() {
            // An operation still running for this transaction discovers the
            // kill at its next interruption point and unwinds.
            operation.kill(TxnError::ExceededTimeLimit(
                "transaction exceeded its lifetime limit".to_string(),
            ));
        }

        // Log after killing the current operation; tooling watches for this
        // line to learn that the kill was delivered.
        tracing::info!(
            txn_number = ?inner.active_txn_number,
            lsid = %self.session.session_id(),
            "aborting transaction because it has been running for longer than \
             transaction_lifetime_limit_seconds"
        );

        self.abort_transaction_on_session(&mut inner);
    }

    /// Abort the transaction the operation context is running, whether in
    /// progress or prepared.
    pub fn abort_active_transaction(&self, op_ctx: &mut OperationContext) -> Result<()> {
        let txn_number = Self::required_txn_number(op_ctx);
        let inner = self.inner.lock();
        // Must not fail when the transaction is already aborted.
        self.check_is_active_transaction(&inner, txn_number, false)?;
        self.abort_active_transaction_inner(
            inner,
            op_ctx,
            &[TxnState::InProgress, TxnState::Prepared],
        );
        Ok(())
    }

    /// At the end of a failed command: abort an unprepared transaction, but
    /// stash a prepared one so the coordinator's decision can still land.
    /// Any failure in here is fatal.
    pub fn abort_active_unprepared_or_stash_prepared(&self, op_ctx: &mut OperationContext) {
        if let Err(err) = self.abort_unprepared_or_stash_prepared(op_ctx) {
            crate::fatal!(
                "caught error during transaction {:?} abort or stash on {}: {}",
                op_ctx.txn_number(),
                self.session.session_id(),
                err
            );
        }
    }

    fn abort_unprepared_or_stash_prepared(&self, op_ctx: &mut OperationContext) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state.is_none() {
            return Ok(());
        }

        // Were this to fail we should have returned above; the caller turns
        // any error into a crash.
        let txn_number = Self::required_txn_number(op_ctx);
        self.check_is_active_transaction(&inner, txn_number, false)?;

        if inner.state.is_prepared() {
            self.stash_active_transaction(&mut inner, op_ctx);
            return Ok(());
        }

        if let Some(ts) = inner.oldest_oplog_entry_ts {
            crate::fatal!(
                "the oldest oplog entry timestamp should not be set on an unprepared \
                 transaction, but it is {}",
                ts
            );
        }

        self.abort_active_transaction_inner(inner, op_ctx, &[TxnState::InProgress]);
        Ok(())
    }

    /// Enter shutdown: drop the stash, aborting any storage transaction it
    /// owns, and refuse further stashing.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock();
        inner.in_shutdown = true;
        inner.stash = None;
    }

    /// Whether `cmd_name` against `db_name` may run in a multi-document
    /// transaction at all.
    pub fn is_valid(&self, db_name: &str, cmd_name: &str) -> Result<()> {
        command_guard::check_command(
            db_name,
            cmd_name,
            self.service.config().test_commands_enabled(),
        )
    }

    // === REPORTING ===

    /// currentOp report for a transaction whose resources are stashed.
    pub fn report_stashed_state(&self) -> Option<StashedStateReport> {
        let inner = self.inner.lock();
        let stash = inner.stash.as_ref()?;
        if inner.active_txn_number.is_none() {
            crate::fatal!("stashed resources exist without a transaction number");
        }

        let metrics = self.metrics.lock();
        let stats = metrics.stats();
        Some(StashedStateReport {
            host: self.service.host_and_port().to_string(),
            desc: "inactive transaction".to_string(),
            client: stats.last_client_info().cloned(),
            lsid: self.session.session_id(),
            transaction: TransactionReport::from_stats(
                stats,
                stash.read_concern(),
                cur_time_micros(),
            ),
            waiting_for_lock: false,
            active: false,
            locker: stash.locker().stats(),
        })
    }

    /// currentOp report for the running operation's transaction state. Takes
    /// only the metrics mutex: the caller already holds the client lock, so
    /// the stash cannot be inspected directly. A transaction counts as
    /// unstashed if it is a retryable write, is active, or has ended.
    pub fn report_unstashed_state(
        &self,
        read_concern: &ReadConcernArgs,
    ) -> Option<TransactionReport> {
        let metrics = self.metrics.lock();
        let stats = metrics.stats();
        if !stats.is_for_multi_document_transaction() || stats.is_active() || stats.is_ended() {
            Some(TransactionReport::from_stats(
                stats,
                read_concern,
                cur_time_micros(),
            ))
        } else {
            None
        }
    }

    // === PRIVATE HELPERS ===

    fn required_txn_number(op_ctx: &OperationContext) -> TxnNumber {
        match op_ctx.txn_number() {
            Some(txn_number) => txn_number,
            None => crate::fatal!("operation context is not bound to a transaction number"),
        }
    }

    /// The session's transaction number and the requested one must both
    /// match the participant's; session kill and migration can change them
    /// without checking out the session.
    fn check_is_active_transaction(
        &self,
        inner: &ParticipantInner,
        request_txn_number: TxnNumber,
        check_abort: bool,
    ) -> Result<()> {
        let session_txn_number = self.session.active_txn_number();
        if session_txn_number != inner.active_txn_number {
            return Err(TxnError::ConflictingOperationInProgress(format!(
                "cannot perform operations on transaction {:?} on session {} because a \
                 different transaction {:?} is now active",
                inner.active_txn_number,
                self.session.session_id(),
                session_txn_number
            )));
        }
        if Some(request_txn_number) != inner.active_txn_number {
            return Err(TxnError::ConflictingOperationInProgress(format!(
                "cannot perform operations on requested transaction {} on session {} because \
                 a different transaction {:?} is now active",
                request_txn_number,
                self.session.session_id(),
                inner.active_txn_number
            )));
        }
        if check_abort && inner.state.is_aborted() {
            return Err(TxnError::NoSuchTransaction(format!(
                "transaction {} has been aborted",
                request_txn_number
            )));
        }
        Ok(())
    }

    fn begin_or_continue_retryable_write(
        &self,
        inner: &mut ParticipantInner,
        txn_number: TxnNumber,
    ) -> Result<()> {
        match inner.active_txn_number {
            // New retryable write.
            None => self.set_new_txn_number(inner, txn_number),
            Some(active) if txn_number > active => self.set_new_txn_number(inner, txn_number),
            // Retrying a retryable write.
            Some(active) if txn_number == active => {
                if !inner.state.is_none() {
                    return Err(TxnError::InvalidOptions(
                        "must specify autocommit=false on all operations of a multi-statement \
                         transaction"
                            .to_string(),
                    ));
                }
                if inner.auto_commit.is_some() {
                    crate::fatal!("retryable write has a transaction autocommit setting");
                }
            }
            Some(active) => {
                return Err(TxnError::ConflictingOperationInProgress(format!(
                    "cannot retry write {} on session {} because a newer transaction {} has \
                     already started",
                    txn_number,
                    self.session.session_id(),
                    active
                )));
            }
        }
        Ok(())
    }

    fn continue_multi_document_transaction(
        &self,
        inner: &mut ParticipantInner,
        txn_number: TxnNumber,
    ) -> Result<()> {
        if inner.active_txn_number != Some(txn_number) || inner.state.is_none() {
            return Err(TxnError::NoSuchTransaction(format!(
                "given transaction number {} does not match any in-progress transactions; \
                 the active transaction number is {:?}",
                txn_number, inner.active_txn_number
            )));
        }

        if inner.state.is_in_progress() && inner.stash.is_none() {
            // The first command in the transaction failed without implicitly
            // aborting it. It is not safe to continue, in particular because
            // the read concern from the first statement was never saved.
            self.abort_transaction_on_session(inner);
            return Err(TxnError::NoSuchTransaction(format!(
                "transaction {} has been aborted",
                txn_number
            )));
        }

        Ok(())
    }

    fn begin_multi_document_transaction(
        &self,
        inner: &mut ParticipantInner,
        txn_number: TxnNumber,
    ) {
        // Aborts any in-progress transaction.
        self.set_new_txn_number(inner, txn_number);
        inner.auto_commit = Some(false);

        inner
            .state
            .transition_to(TxnState::InProgress, TransitionValidation::Validate);

        inner.expire_deadline =
            Some(Instant::now() + self.service.config().transaction_lifetime_limit());

        self.metrics.lock().on_start(false, cur_time_micros());

        if !inner.operations.is_empty() {
            crate::fatal!("a new transaction began with operations already buffered");
        }
    }

    fn set_new_txn_number(&self, inner: &mut ParticipantInner, txn_number: TxnNumber) {
        if inner
            .state
            .is_in(&[TxnState::Prepared, TxnState::CommittingWithPrepare])
        {
            crate::fatal!(
                "cannot replace the transaction number while a prepared transaction is on \
                 the session; current state: {}",
                inner.state
            );
        }

        // Abort an existing transaction that is neither prepared, committed
        // nor aborted.
        if inner.state.is_in_progress() {
            self.abort_transaction_on_session(inner);
        }

        inner.active_txn_number = Some(txn_number);
        inner.state.transition_to(TxnState::None, TransitionValidation::Validate);
        self.metrics.lock().reset(txn_number);
        inner.prepare_op_time = OpTime::null();
        inner.oldest_oplog_entry_ts = None;
        inner.speculative_read_op_time = OpTime::null();
        inner.auto_commit = None;
    }

    fn update_state_from_refresh(&self, inner: &mut ParticipantInner, refresh: RefreshState) {
        if refresh.refresh_count <= inner.last_refresh_count {
            return;
        }

        inner.active_txn_number = Some(refresh.txn_number);
        if refresh.is_committed {
            // Reconciliation may learn of a commit from any state; this is
            // the single relaxed path through the lattice.
            inner
                .state
                .transition_to(TxnState::Committed, TransitionValidation::Relax);
        }

        inner.last_refresh_count = refresh.refresh_count;
    }

    fn stash_active_transaction(&self, inner: &mut ParticipantInner, op_ctx: &mut OperationContext) {
        if inner.in_shutdown {
            return;
        }

        if inner.active_txn_number != op_ctx.txn_number() {
            crate::fatal!(
                "stashing for transaction {:?} but {:?} is active",
                op_ctx.txn_number(),
                inner.active_txn_number
            );
        }

        {
            let mut metrics = self.metrics.lock();
            metrics.on_stash(cur_time_micros());
            metrics.on_transaction_operation(op_ctx.client().info().clone());
        }

        if inner.stash.is_some() {
            crate::fatal!("transaction resources are already stashed");
        }
        inner.stash = Some(TxnResources::capture(op_ctx, false /* keep_ticket */));
    }

    /// Abort the transaction state on the session: drop any stash, clear the
    /// per-transaction fields and transition to Aborted.
    fn abort_transaction_on_session(&self, inner: &mut ParticipantInner) {
        let cur_time = cur_time_micros();
        if inner.stash.is_some() {
            // The resources are stashed: an inactive transaction aborts.
            self.metrics.lock().on_abort_inactive(cur_time);
            if let Some(stash) = inner.stash.as_ref() {
                self.log_slow_transaction(
                    inner,
                    &stash.locker().stats(),
                    TxnState::Aborted,
                    &stash.read_concern().clone(),
                );
            }
            // Dropping the stash aborts the storage transaction.
            inner.stash = None;
        } else {
            self.metrics.lock().on_abort_active(cur_time);
        }

        inner.operation_bytes = 0;
        inner.operations.clear();
        inner
            .state
            .transition_to(TxnState::Aborted, TransitionValidation::Validate);
        inner.prepare_op_time = OpTime::null();
        inner.oldest_oplog_entry_ts = None;
        inner.speculative_read_op_time = OpTime::null();

        self.session.unlock_txn_number();
    }

    fn abort_active_transaction_inner(
        &self,
        inner: MutexGuard<'_, ParticipantInner>,
        op_ctx: &mut OperationContext,
        expected_states: &[TxnState],
    ) {
        if inner.stash.is_some() {
            crate::fatal!("cannot abort an active transaction while its resources are stashed");
        }
        if inner.state.is_committing_with_prepare() {
            crate::fatal!("cannot abort a prepared transaction mid-commit");
        }

        if !inner.state.is_none() {
            self.metrics
                .lock()
                .on_transaction_operation(op_ctx.client().info().clone());
        }

        // The abort oplog entry is written before aborting the storage
        // transaction so no causally related write can enter the oplog at an
        // earlier timestamp; secondaries depend on that to order operations
        // on documents touched by a prepared update. The observer calls back
        // into the participant, so the mutex is dropped across it.
        drop(inner);
        self.service.observer().on_transaction_abort(op_ctx);
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        if inner.state.is_in(expected_states) {
            if op_ctx.txn_number() != inner.active_txn_number {
                crate::fatal!(
                    "aborting transaction {:?} but {:?} is active",
                    op_ctx.txn_number(),
                    inner.active_txn_number
                );
            }
            self.abort_transaction_on_session(inner);
        } else if op_ctx.txn_number() == inner.active_txn_number {
            if inner.state.is_none() {
                // The active transaction is not a multi-document one.
                if op_ctx.has_wuow() {
                    crate::fatal!("retryable write holds a write unit of work at abort");
                }
                return;
            }

            // Unless named in expected_states explicitly, these states
            // cannot be aborted; another thread finishing the transaction
            // concurrently would have moved it to None or Aborted instead.
            let unabortable = [
                TxnState::Prepared,
                TxnState::CommittingWithPrepare,
                TxnState::CommittingWithoutPrepare,
                TxnState::Committed,
            ];
            if inner.state.is_in(&unabortable) {
                crate::fatal!("cannot abort transaction in {}", inner.state);
            }
        } else {
            // A higher active transaction number means this transaction was
            // already aborted by its replacement.
            if !inner.state.is_in(&[TxnState::None, TxnState::Aborted]) {
                crate::fatal!(
                    "transaction was replaced while in state {}",
                    inner.state
                );
            }
        }

        // Clean up the operation context even when the transaction on the
        // session was not aborted here; this is what actually aborts the
        // storage transaction.
        self.clean_up_txn_resources_on_op_ctx(inner, op_ctx, TxnState::Aborted);
    }

    fn commit_storage_transaction(&self, op_ctx: &mut OperationContext) {
        if !op_ctx.has_wuow() {
            crate::fatal!("committing storage without an active write unit of work");
        }
        if let Err(err) = op_ctx.commit_wuow() {
            crate::fatal!(
                "caught exception during commit of storage transaction {:?} on {}: {}",
                op_ctx.txn_number(),
                self.session.session_id(),
                err
            );
        }

        // Clear the recovery unit and locker for the session-record and
        // oplog writes that follow the storage commit.
        op_ctx.install_fresh_recovery_unit();
        op_ctx.locker_mut().unset_max_lock_timeout();
    }

    fn finish_commit_transaction(
        &self,
        inner: &mut ParticipantInner,
        op_ctx: &mut OperationContext,
    ) {
        // If no writes were done, push the client's last optime forward to
        // the read timestamp so waiting for write concern guarantees all
        // read data was committed.
        if inner.speculative_read_op_time > op_ctx.client().last_op() {
            op_ctx.client().set_last_op(inner.speculative_read_op_time);
        }

        inner
            .state
            .transition_to(TxnState::Committed, TransitionValidation::Validate);

        {
            let mut metrics = self.metrics.lock();
            metrics.on_commit(cur_time_micros());
            metrics.on_transaction_operation(op_ctx.client().info().clone());
        }

        inner.operations.clear();
        inner.operation_bytes = 0;
        inner.oldest_oplog_entry_ts = None;

        self.clean_up_txn_resources_on_op_ctx(inner, op_ctx, TxnState::Committed);
    }

    /// Reset the operation context so post-transaction work runs without
    /// transactional settings such as a read timestamp.
    fn clean_up_txn_resources_on_op_ctx(
        &self,
        inner: &ParticipantInner,
        op_ctx: &mut OperationContext,
        termination_cause: TxnState,
    ) {
        let lock_stats = op_ctx.locker().stats();
        let read_concern = op_ctx.read_concern().clone();
        self.log_slow_transaction(inner, &lock_stats, termination_cause, &read_concern);

        op_ctx.clear_wuow();
        // Dropping the replaced recovery unit aborts any storage transaction
        // still open on it.
        op_ctx.install_fresh_recovery_unit();
        op_ctx.locker_mut().unset_max_lock_timeout();
    }

    /// Log the transaction when its duration crosses the slow threshold.
    fn log_slow_transaction(
        &self,
        inner: &ParticipantInner,
        lock_stats: &LockStats,
        termination_cause: TxnState,
        read_concern: &ReadConcernArgs,
    ) {
        // Only multi-document transactions are logged.
        if inner.state.is_none() {
            return;
        }

        let now = cur_time_micros();
        let metrics = self.metrics.lock();
        let duration_micros = metrics.stats().duration_micros(now);
        let threshold = self.service.config().slow_transaction_threshold();
        if duration_micros <= threshold.as_micros() as u64 {
            return;
        }

        let info = self.transaction_info_for_log(
            inner,
            metrics.stats(),
            lock_stats,
            termination_cause,
            read_concern,
            now,
        );
        drop(metrics);
        tracing::info!(target: "replidb::transaction", "transaction {}", info);
    }

    fn transaction_info_for_log(
        &self,
        inner: &ParticipantInner,
        stats: &SingleTransactionStats,
        lock_stats: &LockStats,
        termination_cause: TxnState,
        read_concern: &ReadConcernArgs,
        now: u64,
    ) -> String {
        debug_assert!(termination_cause.is_committed() || termination_cause.is_aborted());

        let cause = if termination_cause.is_committed() {
            "committed"
        } else {
            "aborted"
        };
        let locks = serde_json::to_string(lock_stats).unwrap_or_default();
        let read_concern = serde_json::to_string(read_concern).unwrap_or_default();

        format!(
            "parameters:{{ lsid: {}, txnNumber: {:?}, autocommit: {}, readConcern: {} }}, \
             readTimestamp:{}, terminationCause:{} timeActiveMicros:{} timeInactiveMicros:{} \
             numYields:0 locks:{} {}ms",
            self.session.session_id(),
            inner.active_txn_number,
            inner.auto_commit.unwrap_or(true),
            read_concern,
            inner.speculative_read_op_time.timestamp(),
            cause,
            stats.time_active_micros(now),
            stats.time_inactive_micros(now),
            locks,
            stats.duration_micros(now) / 1000,
        )
    }
}
