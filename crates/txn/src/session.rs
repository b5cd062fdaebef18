//! Logical session state consumed by the transaction participant
//!
//! The session catalog checks a session out to at most one operation at a
//! time; that external checkout serializes the command path. Background
//! sweepers and refresh threads reach the session without checkout, so the
//! shared core is internally synchronized.

use crate::error::{Result, TxnError};
use crate::op_context::{OperationHandle, ServiceContext};
use crate::participant::TransactionParticipant;
use parking_lot::Mutex;
use replidb_common::{SessionId, TxnNumber};
use std::sync::Arc;

/// Durable session state observed from another node, handed to the
/// participant for reconciliation.
#[derive(Debug, Clone, Copy)]
pub struct RefreshState {
    /// Monotone counter deduplicating refreshes
    pub refresh_count: u64,
    /// The transaction number recorded durably
    pub txn_number: TxnNumber,
    /// Whether that transaction is known committed
    pub is_committed: bool,
}

#[derive(Default)]
struct SessionState {
    active_txn_number: Option<TxnNumber>,
    /// While set, the transaction number cannot advance; the stored error
    /// is returned to whoever tries.
    txn_number_lock: Option<TxnError>,
    last_refresh: Option<RefreshState>,
    current_operation: Option<Arc<OperationHandle>>,
}

/// Shared core of a logical session: its identity, the externally assigned
/// transaction number and the operation currently running under it.
pub struct SessionCore {
    session_id: SessionId,
    state: Mutex<SessionState>,
}

impl SessionCore {
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            state: Mutex::new(SessionState::default()),
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// The transaction number most recently assigned on checkout.
    pub fn active_txn_number(&self) -> Option<TxnNumber> {
        self.state.lock().active_txn_number
    }

    /// Assign a new transaction number. Fails with the pinning reason while
    /// the number is locked to a different value.
    pub fn set_active_txn_number(&self, txn_number: TxnNumber) -> Result<()> {
        let mut state = self.state.lock();
        if state.active_txn_number != Some(txn_number) {
            if let Some(reason) = &state.txn_number_lock {
                return Err(reason.clone());
            }
        }
        state.active_txn_number = Some(txn_number);
        Ok(())
    }

    /// Pin the transaction number so it cannot advance; `reason` is returned
    /// to any attempt to replace it.
    pub fn lock_txn_number(&self, reason: TxnError) {
        self.state.lock().txn_number_lock = Some(reason);
    }

    /// Release the transaction number pin.
    pub fn unlock_txn_number(&self) {
        self.state.lock().txn_number_lock = None;
    }

    /// Whether the transaction number is currently pinned.
    pub fn txn_number_locked(&self) -> bool {
        self.state.lock().txn_number_lock.is_some()
    }

    /// Record durable state observed from storage for reconciliation.
    pub fn set_last_refresh_state(&self, refresh: RefreshState) {
        self.state.lock().last_refresh = Some(refresh);
    }

    pub fn last_refresh_state(&self) -> Option<RefreshState> {
        self.state.lock().last_refresh
    }

    /// Register the operation currently running under this session.
    pub fn set_current_operation(&self, operation: Option<Arc<OperationHandle>>) {
        self.state.lock().current_operation = operation;
    }

    pub fn current_operation(&self) -> Option<Arc<OperationHandle>> {
        self.state.lock().current_operation.clone()
    }
}

/// A logical session owning its transaction participant.
pub struct Session {
    core: Arc<SessionCore>,
    participant: TransactionParticipant,
}

impl Session {
    pub fn new(session_id: SessionId, service: Arc<ServiceContext>) -> Self {
        let core = Arc::new(SessionCore::new(session_id));
        let participant = TransactionParticipant::new(core.clone(), service);
        Self { core, participant }
    }

    pub fn core(&self) -> &Arc<SessionCore> {
        &self.core
    }

    /// The transaction participant decorated onto this session.
    pub fn participant(&self) -> &TransactionParticipant {
        &self.participant
    }
}
