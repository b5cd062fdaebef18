//! Per-operation execution state
//!
//! An operation context bundles the client, the locker, the storage recovery
//! unit, the active write unit of work and the operation's read concern. The
//! transaction participant moves the locker / recovery unit / unit-of-work
//! triple between the context and its stash as commands come and go.

use crate::config::TransactionConfig;
use crate::error::{Result, StorageError, TxnError};
use crate::locker::{Locker, LockMode};
use crate::observer::OpObserver;
use crate::oplog::OplogAllocator;
use crate::storage::{RecoveryUnit, RecoveryUnitState, StorageEngine, WriteUnitOfWork};
use parking_lot::Mutex;
use replidb_common::{OpTime, Timestamp, TxnNumber};
use serde::Serialize;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Read concern level requested by a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReadConcernLevel {
    Local,
    Majority,
    Snapshot,
}

/// Read concern arguments captured from a command. Only the first statement
/// of a transaction may set these; they travel with the stashed resources.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReadConcernArgs {
    pub level: Option<ReadConcernLevel>,
    pub after_cluster_time: Option<Timestamp>,
}

impl ReadConcernArgs {
    /// A read concern at the given level.
    pub fn with_level(level: ReadConcernLevel) -> Self {
        Self {
            level: Some(level),
            after_cluster_time: None,
        }
    }

    /// Whether no read concern was specified.
    pub fn is_empty(&self) -> bool {
        self.level.is_none() && self.after_cluster_time.is_none()
    }
}

/// Connection metadata captured for reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientInfo {
    pub host_and_port: String,
    pub app_name: String,
    pub connection_id: u64,
}

/// Per-connection client state, shared by the operations it runs.
#[derive(Debug)]
pub struct Client {
    info: ClientInfo,
    last_op: Mutex<OpTime>,
    in_direct_client: bool,
}

impl Client {
    /// A client for an external connection.
    pub fn new(info: ClientInfo) -> Self {
        Self {
            info,
            last_op: Mutex::new(OpTime::null()),
            in_direct_client: false,
        }
    }

    /// A client for internal (direct) command execution. Direct clients do
    /// not participate in resource stashing.
    pub fn new_direct(info: ClientInfo) -> Self {
        Self {
            info,
            last_op: Mutex::new(OpTime::null()),
            in_direct_client: true,
        }
    }

    pub fn info(&self) -> &ClientInfo {
        &self.info
    }

    pub fn is_in_direct_client(&self) -> bool {
        self.in_direct_client
    }

    /// The last optime this client observed; write-concern waits use it.
    pub fn last_op(&self) -> OpTime {
        *self.last_op.lock()
    }

    pub fn set_last_op(&self, op_time: OpTime) {
        *self.last_op.lock() = op_time;
    }
}

/// Handle to a running operation, registered with the session so background
/// sweepers can interrupt it.
#[derive(Debug, Default)]
pub struct OperationHandle {
    kill_code: Mutex<Option<TxnError>>,
}

impl OperationHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark this operation killed. The operation discovers the kill at its
    /// next interruption point.
    pub fn kill(&self, error: TxnError) {
        let mut code = self.kill_code.lock();
        if code.is_none() {
            *code = Some(error);
        }
    }

    /// The kill code, if this operation was killed.
    pub fn killed(&self) -> Option<TxnError> {
        self.kill_code.lock().clone()
    }

    /// Fail if this operation was killed.
    pub fn check_for_interrupt(&self) -> Result<()> {
        match self.kill_code.lock().clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// Process-wide collaborators handed to every operation context.
pub struct ServiceContext {
    storage: Arc<dyn StorageEngine>,
    oplog: Arc<dyn OplogAllocator>,
    observer: Arc<dyn OpObserver>,
    config: TransactionConfig,
    term: AtomicI64,
    host_and_port: String,
}

impl ServiceContext {
    pub fn new(
        storage: Arc<dyn StorageEngine>,
        oplog: Arc<dyn OplogAllocator>,
        observer: Arc<dyn OpObserver>,
        config: TransactionConfig,
    ) -> Self {
        Self {
            storage,
            oplog,
            observer,
            config,
            term: AtomicI64::new(1),
            host_and_port: "localhost:27017".to_string(),
        }
    }

    /// Override the host string used by currentOp reporting.
    pub fn with_host_and_port(mut self, host_and_port: impl Into<String>) -> Self {
        self.host_and_port = host_and_port.into();
        self
    }

    pub fn storage(&self) -> &Arc<dyn StorageEngine> {
        &self.storage
    }

    pub fn oplog(&self) -> &Arc<dyn OplogAllocator> {
        &self.oplog
    }

    pub fn observer(&self) -> &Arc<dyn OpObserver> {
        &self.observer
    }

    pub fn config(&self) -> &TransactionConfig {
        &self.config
    }

    /// The current replication term. Transactions do not survive term
    /// changes, so pairing this with a snapshot timestamp does not race.
    pub fn term(&self) -> i64 {
        self.term.load(Ordering::Relaxed)
    }

    pub fn set_term(&self, term: i64) {
        self.term.store(term, Ordering::Relaxed);
    }

    pub fn host_and_port(&self) -> &str {
        &self.host_and_port
    }
}

/// Per-operation state object handed to each command.
pub struct OperationContext {
    service: Arc<ServiceContext>,
    client: Arc<Client>,
    handle: Arc<OperationHandle>,
    txn_number: Option<TxnNumber>,
    locker: Locker,
    recovery_unit: Box<dyn RecoveryUnit>,
    ru_state: RecoveryUnitState,
    wuow: Option<WriteUnitOfWork>,
    read_concern: ReadConcernArgs,
}

impl OperationContext {
    /// A fresh operation context with an empty locker and a non-transactional
    /// recovery unit.
    pub fn new(service: Arc<ServiceContext>, client: Arc<Client>) -> Self {
        let recovery_unit = service.storage().new_recovery_unit();
        Self {
            service,
            client,
            handle: Arc::new(OperationHandle::new()),
            txn_number: None,
            locker: Locker::new(),
            recovery_unit,
            ru_state: RecoveryUnitState::NotInUnitOfWork,
            wuow: None,
            read_concern: ReadConcernArgs::default(),
        }
    }

    pub fn service(&self) -> &Arc<ServiceContext> {
        &self.service
    }

    pub fn client(&self) -> &Arc<Client> {
        &self.client
    }

    pub fn handle(&self) -> &Arc<OperationHandle> {
        &self.handle
    }

    pub fn txn_number(&self) -> Option<TxnNumber> {
        self.txn_number
    }

    pub fn set_txn_number(&mut self, txn_number: TxnNumber) {
        self.txn_number = Some(txn_number);
    }

    pub fn read_concern(&self) -> &ReadConcernArgs {
        &self.read_concern
    }

    pub fn set_read_concern(&mut self, read_concern: ReadConcernArgs) {
        self.read_concern = read_concern;
    }

    pub fn locker(&self) -> &Locker {
        &self.locker
    }

    pub fn locker_mut(&mut self) -> &mut Locker {
        &mut self.locker
    }

    /// Swap the locker on this context, returning the previous one.
    pub fn swap_locker(&mut self, locker: Locker) -> Locker {
        std::mem::replace(&mut self.locker, locker)
    }

    pub fn recovery_unit_mut(&mut self) -> &mut dyn RecoveryUnit {
        self.recovery_unit.as_mut()
    }

    pub fn recovery_unit_state(&self) -> RecoveryUnitState {
        self.ru_state
    }

    /// Swap the recovery unit and its unit-of-work state, returning the
    /// previous pair.
    pub fn swap_recovery_unit(
        &mut self,
        recovery_unit: Box<dyn RecoveryUnit>,
        state: RecoveryUnitState,
    ) -> (Box<dyn RecoveryUnit>, RecoveryUnitState) {
        let old_unit = std::mem::replace(&mut self.recovery_unit, recovery_unit);
        let old_state = std::mem::replace(&mut self.ru_state, state);
        (old_unit, old_state)
    }

    /// Replace the recovery unit with a fresh non-transactional one,
    /// returning the old pair. Dropping the old unit aborts any storage
    /// transaction still open on it.
    pub fn install_fresh_recovery_unit(&mut self) -> (Box<dyn RecoveryUnit>, RecoveryUnitState) {
        let fresh = self.service.storage().new_recovery_unit();
        self.swap_recovery_unit(fresh, RecoveryUnitState::NotInUnitOfWork)
    }

    /// Whether a write unit of work is active on this context.
    pub fn has_wuow(&self) -> bool {
        self.wuow.is_some()
    }

    pub fn wuow(&self) -> Option<&WriteUnitOfWork> {
        self.wuow.as_ref()
    }

    /// Open a top-level write unit of work.
    pub fn begin_wuow(&mut self) {
        if self.wuow.is_some() {
            crate::fatal!("attempted to begin a write unit of work while one is active");
        }
        self.locker.begin_wuow();
        self.recovery_unit.begin_unit_of_work();
        self.ru_state = RecoveryUnitState::ActiveUnitOfWork;
        self.wuow = Some(WriteUnitOfWork::new());
    }

    /// Detach the active write unit of work without ending it, returning the
    /// recovery-unit state needed to resume it later.
    pub fn release_wuow(&mut self) -> RecoveryUnitState {
        if self.wuow.take().is_none() {
            crate::fatal!("attempted to release a write unit of work while none is active");
        }
        // The recovery unit keeps its in-flight state until a replacement
        // unit is installed.
        self.ru_state
    }

    /// Reattach a write unit of work released earlier, restoring the saved
    /// recovery-unit state.
    pub fn resume_wuow(&mut self, state: RecoveryUnitState) {
        if self.wuow.is_some() {
            crate::fatal!("attempted to resume a write unit of work while one is active");
        }
        self.ru_state = state;
        self.wuow = Some(WriteUnitOfWork::for_snapshot_resume());
    }

    /// Mark the active unit of work prepared in the storage engine.
    pub fn prepare_wuow(&mut self) {
        let Some(wuow) = self.wuow.as_mut() else {
            crate::fatal!("attempted to prepare without an active write unit of work");
        };
        self.recovery_unit.prepare_unit_of_work();
        wuow.mark_prepared();
    }

    /// Commit the active unit of work in the storage engine.
    pub fn commit_wuow(&mut self) -> std::result::Result<(), StorageError> {
        if self.wuow.take().is_none() {
            crate::fatal!("attempted to commit without an active write unit of work");
        }
        self.recovery_unit.commit_unit_of_work()?;
        self.locker.end_wuow();
        self.ru_state = RecoveryUnitState::NotInUnitOfWork;
        Ok(())
    }

    /// Detach and discard the write unit of work token, if any. The storage
    /// transaction is settled separately, through the recovery unit.
    pub fn clear_wuow(&mut self) {
        if self.wuow.take().is_some() {
            self.locker.end_wuow();
        }
    }

    /// Take the global lock, honoring a pending interrupt first.
    pub fn acquire_global_lock(&mut self, mode: LockMode) -> Result<()> {
        self.handle.check_for_interrupt()?;
        self.locker.acquire_global(mode);
        Ok(())
    }

    /// Release the global lock.
    pub fn release_global_lock(&mut self) {
        self.locker.release_global();
    }
}
