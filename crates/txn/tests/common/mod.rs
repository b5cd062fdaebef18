//! Common test doubles for transaction participant integration tests

// Each test binary uses a different slice of the harness.
#![allow(dead_code)]

use parking_lot::Mutex;
use replidb_common::{OpTime, SessionId, Timestamp, TxnNumber};
use replidb_txn::{
    Client, ClientInfo, OpObserver, OperationContext, OplogAllocator, OplogSlot, ReadSource,
    RecoveryUnit, Session, ServiceContext, StorageEngine, StorageError, TransactionConfig,
    TransactionParticipant,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Storage-transaction events recorded by the mock engine, keyed by
/// recovery-unit id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageEvent {
    Begin(u64),
    Prepare(u64),
    Commit(u64),
    Abort(u64),
}

/// Mock storage engine: hands out recovery units that record their lifecycle
/// into a shared event log.
pub struct MockStorage {
    next_unit_id: AtomicU64,
    /// Timestamp handed out by snapshot preallocation
    stable_timestamp: AtomicU64,
    events: Arc<Mutex<Vec<StorageEvent>>>,
}

impl MockStorage {
    pub fn new() -> Self {
        Self {
            next_unit_id: AtomicU64::new(1),
            stable_timestamp: AtomicU64::new(500),
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn events(&self) -> Vec<StorageEvent> {
        self.events.lock().clone()
    }

    #[allow(dead_code)]
    pub fn set_stable_timestamp(&self, micros: u64) {
        self.stable_timestamp.store(micros, Ordering::Relaxed);
    }

    pub fn commits(&self) -> Vec<u64> {
        self.events()
            .iter()
            .filter_map(|event| match event {
                StorageEvent::Commit(id) => Some(*id),
                _ => None,
            })
            .collect()
    }

    pub fn aborts(&self) -> Vec<u64> {
        self.events()
            .iter()
            .filter_map(|event| match event {
                StorageEvent::Abort(id) => Some(*id),
                _ => None,
            })
            .collect()
    }
}

impl StorageEngine for MockStorage {
    fn new_recovery_unit(&self) -> Box<dyn RecoveryUnit> {
        Box::new(MockRecoveryUnit {
            id: self.next_unit_id.fetch_add(1, Ordering::Relaxed),
            events: self.events.clone(),
            stable_timestamp: Timestamp::from_micros(self.stable_timestamp.load(Ordering::Relaxed)),
            open: false,
            snapshot: None,
            read_source: None,
            prepare_timestamp: None,
            commit_timestamp: None,
        })
    }
}

pub struct MockRecoveryUnit {
    id: u64,
    events: Arc<Mutex<Vec<StorageEvent>>>,
    stable_timestamp: Timestamp,
    /// Whether a storage transaction is open on this unit
    open: bool,
    snapshot: Option<Timestamp>,
    read_source: Option<ReadSource>,
    prepare_timestamp: Option<Timestamp>,
    commit_timestamp: Option<Timestamp>,
}

impl RecoveryUnit for MockRecoveryUnit {
    fn begin_unit_of_work(&mut self) {
        self.open = true;
        self.events.lock().push(StorageEvent::Begin(self.id));
    }

    fn commit_unit_of_work(&mut self) -> Result<(), StorageError> {
        self.open = false;
        self.events.lock().push(StorageEvent::Commit(self.id));
        Ok(())
    }

    fn abort_unit_of_work(&mut self) {
        if self.open {
            self.open = false;
            self.events.lock().push(StorageEvent::Abort(self.id));
        }
    }

    fn prepare_unit_of_work(&mut self) {
        self.events.lock().push(StorageEvent::Prepare(self.id));
    }

    fn set_prepare_timestamp(&mut self, ts: Timestamp) {
        self.prepare_timestamp = Some(ts);
    }

    fn set_commit_timestamp(&mut self, ts: Timestamp) {
        self.commit_timestamp = Some(ts);
    }

    fn set_timestamp_read_source(&mut self, source: ReadSource) {
        self.read_source = Some(source);
    }

    fn preallocate_snapshot(&mut self) {
        self.snapshot = Some(self.stable_timestamp);
    }

    fn point_in_time_read_timestamp(&self) -> Option<Timestamp> {
        self.snapshot
    }
}

impl Drop for MockRecoveryUnit {
    fn drop(&mut self) {
        // A unit discarded with a transaction still open aborts it.
        if self.open {
            self.events.lock().push(StorageEvent::Abort(self.id));
        }
    }
}

/// Mock oplog allocator: a monotonic counter.
pub struct MockOplog {
    next_micros: AtomicU64,
    term: i64,
}

impl MockOplog {
    pub fn new(term: i64) -> Self {
        Self {
            next_micros: AtomicU64::new(1000),
            term,
        }
    }

    /// How many slots have been reserved so far.
    pub fn reserved_count(&self) -> u64 {
        self.next_micros.load(Ordering::Relaxed) - 1000
    }
}

impl OplogAllocator for MockOplog {
    fn next_op_time(&self) -> OpTime {
        let micros = self.next_micros.fetch_add(1, Ordering::Relaxed);
        OpTime::new(Timestamp::from_micros(micros), self.term)
    }
}

/// Transaction events seen by the op-observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserverEvent {
    Prepare(OpTime),
    Commit {
        commit_slot: Option<OpTime>,
        commit_timestamp: Option<Timestamp>,
    },
    Abort,
}

/// Records observer callbacks, and probes the participant from inside each
/// one: the probe locks the participant mutex, so a callback issued with the
/// mutex held deadlocks the test instead of passing.
pub struct RecordingObserver {
    events: Mutex<Vec<ObserverEvent>>,
    session: Mutex<Weak<Session>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            session: Mutex::new(Weak::new()),
        }
    }

    pub fn attach_session(&self, session: &Arc<Session>) {
        *self.session.lock() = Arc::downgrade(session);
    }

    pub fn events(&self) -> Vec<ObserverEvent> {
        self.events.lock().clone()
    }

    fn probe_participant(&self) {
        if let Some(session) = self.session.lock().upgrade() {
            let _ = session.participant().state();
        }
    }
}

impl OpObserver for RecordingObserver {
    fn on_transaction_prepare(&self, _op_ctx: &mut OperationContext, prepare_slot: OplogSlot) {
        self.probe_participant();
        self.events
            .lock()
            .push(ObserverEvent::Prepare(prepare_slot.op_time));
    }

    fn on_transaction_commit(
        &self,
        _op_ctx: &mut OperationContext,
        commit_slot: Option<OplogSlot>,
        commit_timestamp: Option<Timestamp>,
    ) {
        self.probe_participant();
        self.events.lock().push(ObserverEvent::Commit {
            commit_slot: commit_slot.map(|slot| slot.op_time),
            commit_timestamp,
        });
    }

    fn on_transaction_abort(&self, _op_ctx: &mut OperationContext) {
        self.probe_participant();
        self.events.lock().push(ObserverEvent::Abort);
    }
}

/// One session plus every collaborator the participant talks to.
pub struct TestHarness {
    pub service: Arc<ServiceContext>,
    pub session: Arc<Session>,
    pub storage: Arc<MockStorage>,
    pub oplog: Arc<MockOplog>,
    pub observer: Arc<RecordingObserver>,
    pub client: Arc<Client>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(TransactionConfig::default())
    }

    pub fn with_config(config: TransactionConfig) -> Self {
        let storage = Arc::new(MockStorage::new());
        let oplog = Arc::new(MockOplog::new(1));
        let observer = Arc::new(RecordingObserver::new());
        let service = Arc::new(ServiceContext::new(
            storage.clone(),
            oplog.clone(),
            observer.clone(),
            config,
        ));
        let client = Arc::new(Client::new(ClientInfo {
            host_and_port: "test-client:40001".to_string(),
            app_name: "participant-tests".to_string(),
            connection_id: 1,
        }));
        let session = Arc::new(Session::new(SessionId::new(), service.clone()));
        observer.attach_session(&session);

        Self {
            service,
            session,
            storage,
            oplog,
            observer,
            client,
        }
    }

    pub fn participant(&self) -> &TransactionParticipant {
        self.session.participant()
    }

    /// Check the session out for `txn_number` and build the operation
    /// context a command would run with.
    pub fn op_ctx(&self, txn_number: TxnNumber) -> OperationContext {
        self.session
            .core()
            .set_active_txn_number(txn_number)
            .unwrap();
        let mut op_ctx = OperationContext::new(self.service.clone(), self.client.clone());
        op_ctx.set_txn_number(txn_number);
        self.session
            .core()
            .set_current_operation(Some(op_ctx.handle().clone()));
        op_ctx
    }

    /// Begin a multi-document transaction and unstash resources for its
    /// first statement, the way the command path does.
    pub fn begin_txn(&self, txn_number: TxnNumber) -> OperationContext {
        let mut op_ctx = self.op_ctx(txn_number);
        self.participant()
            .begin_or_continue(txn_number, Some(false), Some(true))
            .unwrap();
        self.participant()
            .unstash_transaction_resources(&mut op_ctx, "insert")
            .unwrap();
        op_ctx
    }
}
