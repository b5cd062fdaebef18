//! Storage-engine interfaces consumed by the transaction participant
//!
//! The storage engine itself is an external collaborator. The participant
//! only obtains recovery units and asks them to commit, abort, prepare, set
//! timestamps and take snapshots.

use crate::error::StorageError;
use replidb_common::Timestamp;

/// Where a transactional read snapshot is taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadSource {
    /// The all-committed point: everything below it is durably committed
    AllCommitted,
    /// The last optime applied on this node
    LastApplied,
}

/// Whether the recovery unit on an operation context is inside a write unit
/// of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryUnitState {
    NotInUnitOfWork,
    ActiveUnitOfWork,
    FailedUnitOfWork,
}

/// Handle to a single storage transaction / snapshot.
///
/// Dropping a recovery unit with an open unit of work must abort it; that is
/// how custody holders release storage resources they never handed back.
pub trait RecoveryUnit: Send {
    /// Start a unit of work on this recovery unit.
    fn begin_unit_of_work(&mut self);

    /// Commit the active unit of work, making its writes visible.
    ///
    /// A failure here is fatal to the caller; by the time commit is invoked
    /// the transaction has already been declared committing.
    fn commit_unit_of_work(&mut self) -> Result<(), StorageError>;

    /// Abort the active unit of work, rolling back its writes. Infallible;
    /// safe to call on an idle unit.
    fn abort_unit_of_work(&mut self);

    /// Mark the active unit of work prepared. Infallible; validation belongs
    /// to the writes that preceded it.
    fn prepare_unit_of_work(&mut self);

    /// Set the timestamp at which the prepared writes become visible under
    /// snapshot semantics once committed.
    fn set_prepare_timestamp(&mut self, ts: Timestamp);

    /// Set the timestamp the commit will be performed at.
    fn set_commit_timestamp(&mut self, ts: Timestamp);

    /// Choose where transactional reads take their snapshot from.
    fn set_timestamp_read_source(&mut self, source: ReadSource);

    /// Establish the point-in-time snapshot now rather than lazily at the
    /// first read.
    fn preallocate_snapshot(&mut self);

    /// The timestamp of the established point-in-time snapshot, if any.
    fn point_in_time_read_timestamp(&self) -> Option<Timestamp>;
}

/// Factory for recovery units.
pub trait StorageEngine: Send + Sync {
    /// Create a fresh, non-transactional recovery unit.
    fn new_recovery_unit(&self) -> Box<dyn RecoveryUnit>;
}

/// Token for a single atomic write span on an operation context.
///
/// The actual begin/commit/abort work runs through the operation context,
/// which owns the recovery unit the span wraps.
#[derive(Debug)]
pub struct WriteUnitOfWork {
    prepared: bool,
}

impl WriteUnitOfWork {
    pub(crate) fn new() -> Self {
        Self { prepared: false }
    }

    /// Recreate the token for a unit of work whose recovery-unit state was
    /// stashed and is now being resumed on an operation context.
    pub(crate) fn for_snapshot_resume() -> Self {
        Self { prepared: false }
    }

    /// Whether `prepare` has been called on this unit of work.
    pub fn is_prepared(&self) -> bool {
        self.prepared
    }

    pub(crate) fn mark_prepared(&mut self) {
        self.prepared = true;
    }
}
