//! Per-session transaction participant for a replicated document store
//!
//! This crate implements the state machine and resource-custody engine that
//! drives a single logical session through retryable writes and
//! multi-document transactions, including two-phase prepare/commit:
//!
//! - [`TransactionParticipant`] owns the transaction state and every public
//!   entry point (begin, continue, stash, unstash, prepare, commit, abort,
//!   expire, shutdown).
//! - [`TxnResources`], [`SideTransactionBlock`] and [`OplogSlotReserver`]
//!   move the heavyweight execution resources (locker, recovery unit, write
//!   unit of work) between the operation context and the session's stash.
//! - [`TxnState`] encodes the legal state transition lattice; illegal
//!   transitions abort the process.
//!
//! Command dispatch, the storage engine, the oplog and the session catalog
//! are external collaborators reached through the traits in [`storage`],
//! [`oplog`] and [`observer`].

mod command_guard;
mod config;
mod error;
mod fatal;
mod locker;
mod metrics;
pub mod observer;
mod op_context;
pub mod oplog;
mod participant;
mod report;
mod resources;
mod session;
mod state;
pub mod storage;

pub use command_guard::{check_command, check_command_valid_with_state};
pub use config::{ClusterRole, TransactionConfig};
pub use error::{Result, StorageError, TxnError};
pub use locker::{LockMode, LockStats, Locker, LockerClientState};
pub use metrics::{SingleTransactionStats, TransactionMetricsObserver};
pub use observer::OpObserver;
pub use op_context::{
    Client, ClientInfo, OperationContext, OperationHandle, ReadConcernArgs, ReadConcernLevel,
    ServiceContext,
};
pub use oplog::{OplogAllocator, OplogSlot};
pub use participant::{SpeculativeTransactionOpTime, TransactionParticipant};
pub use report::{StashedStateReport, TransactionParametersReport, TransactionReport};
pub use resources::{OplogSlotReserver, SideTransactionBlock, TxnResources};
pub use session::{RefreshState, Session, SessionCore};
pub use state::{TransitionValidation, TxnState, ALL_STATES};
pub use storage::{ReadSource, RecoveryUnit, RecoveryUnitState, StorageEngine, WriteUnitOfWork};
