//! Transaction state machine with a validated transition lattice

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of the transaction currently associated with a session.
///
/// `None` is both the initial state and the re-entry point between logical
/// transactions; a retryable write never leaves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxnState {
    /// No multi-document transaction is in progress
    None,
    /// A multi-document transaction is accepting statements
    InProgress,
    /// Prepared for two-phase commit; write locks held, awaiting a decision
    Prepared,
    /// Committing a transaction that was never prepared
    CommittingWithoutPrepare,
    /// Committing a prepared transaction
    CommittingWithPrepare,
    /// Terminal: committed
    Committed,
    /// Terminal: aborted
    Aborted,
}

/// Whether `transition_to` enforces the lattice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionValidation {
    /// Abort the process on an illegal transition
    Validate,
    /// Permit any transition; used only by external refresh reconciliation
    Relax,
}

/// Every state, for lattice sweeps.
pub const ALL_STATES: [TxnState; 7] = [
    TxnState::None,
    TxnState::InProgress,
    TxnState::Prepared,
    TxnState::CommittingWithoutPrepare,
    TxnState::CommittingWithPrepare,
    TxnState::Committed,
    TxnState::Aborted,
];

impl TxnState {
    pub fn is_none(&self) -> bool {
        matches!(self, TxnState::None)
    }

    pub fn is_in_progress(&self) -> bool {
        matches!(self, TxnState::InProgress)
    }

    pub fn is_prepared(&self) -> bool {
        matches!(self, TxnState::Prepared)
    }

    pub fn is_committing_without_prepare(&self) -> bool {
        matches!(self, TxnState::CommittingWithoutPrepare)
    }

    pub fn is_committing_with_prepare(&self) -> bool {
        matches!(self, TxnState::CommittingWithPrepare)
    }

    pub fn is_committed(&self) -> bool {
        matches!(self, TxnState::Committed)
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, TxnState::Aborted)
    }

    /// Whether a multi-document transaction owns this session right now.
    pub fn in_multi_document_transaction(&self) -> bool {
        matches!(self, TxnState::InProgress | TxnState::Prepared)
    }

    /// Whether this state is in the given set.
    pub fn is_in(&self, states: &[TxnState]) -> bool {
        states.contains(self)
    }

    /// The states legally reachable from `from`, encoded as data so tests
    /// can sweep the full product.
    pub fn legal_transitions(from: TxnState) -> &'static [TxnState] {
        match from {
            TxnState::None => &[TxnState::None, TxnState::InProgress],
            TxnState::InProgress => &[
                TxnState::None,
                TxnState::Prepared,
                TxnState::CommittingWithoutPrepare,
                TxnState::Aborted,
            ],
            TxnState::Prepared => &[TxnState::CommittingWithPrepare, TxnState::Aborted],
            TxnState::CommittingWithoutPrepare | TxnState::CommittingWithPrepare => {
                &[TxnState::None, TxnState::Committed, TxnState::Aborted]
            }
            TxnState::Committed | TxnState::Aborted => {
                &[TxnState::None, TxnState::InProgress]
            }
        }
    }

    /// Whether the lattice permits `from` -> `to`.
    pub fn is_legal_transition(from: TxnState, to: TxnState) -> bool {
        Self::legal_transitions(from).contains(&to)
    }

    /// Move to `new_state`. With `Validate`, an illegal transition aborts the
    /// process.
    pub fn transition_to(&mut self, new_state: TxnState, validation: TransitionValidation) {
        if validation == TransitionValidation::Validate
            && !Self::is_legal_transition(*self, new_state)
        {
            crate::fatal!(
                "illegal transaction state transition: current state: {}, attempted next state: {}",
                self,
                new_state
            );
        }
        *self = new_state;
    }
}

impl fmt::Display for TxnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TxnState::None => "TxnState::None",
            TxnState::InProgress => "TxnState::InProgress",
            TxnState::Prepared => "TxnState::Prepared",
            TxnState::CommittingWithoutPrepare => "TxnState::CommittingWithoutPrepare",
            TxnState::CommittingWithPrepare => "TxnState::CommittingWithPrepare",
            TxnState::Committed => "TxnState::Committed",
            TxnState::Aborted => "TxnState::Aborted",
        };
        f.write_str(name)
    }
}
