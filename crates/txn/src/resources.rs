//! Custody transfer of transaction execution resources
//!
//! Between the statements of a multi-document transaction the participant
//! holds the locker, the recovery unit and the write-unit-of-work state in a
//! stash; while a statement runs they live on the operation context.
//! `TxnResources` is the movable bundle, `SideTransactionBlock` swaps it out
//! so unrelated storage work can run on the same context, and
//! `OplogSlotReserver` uses a side transaction to reserve an oplog slot
//! whose hole outlives the reservation scope.

use crate::error::Result;
use crate::locker::{Locker, LockerClientState};
use crate::op_context::{OperationContext, ReadConcernArgs};
use crate::oplog::OplogSlot;
use crate::storage::{RecoveryUnit, RecoveryUnitState};

/// Movable bundle owning the execution resources of one transaction.
pub struct TxnResources {
    locker: Option<Locker>,
    recovery_unit: Option<Box<dyn RecoveryUnit>>,
    wuow_state: RecoveryUnitState,
    read_concern: ReadConcernArgs,
    released: bool,
}

impl TxnResources {
    /// Take custody of the resources currently installed on `op_ctx`,
    /// leaving fresh non-transactional replacements behind.
    ///
    /// With `keep_ticket` the stashed locker retains its scheduling ticket;
    /// side transactions use this because the original operation resumes on
    /// the same thread moments later.
    pub fn capture(op_ctx: &mut OperationContext, keep_ticket: bool) -> Self {
        let wuow_state = op_ctx.release_wuow();

        let mut locker = op_ctx.swap_locker(Locker::new());
        if !keep_ticket {
            locker.release_ticket();
        }
        locker.unset_thread_id();

        // This thread must still respect the transaction lock timeout while
        // it runs non-transactional work, since it can prevent the
        // transaction from making progress.
        let lock_timeout = op_ctx.service().config().max_transaction_lock_timeout();
        if let Some(timeout) = lock_timeout {
            op_ctx.locker_mut().set_max_lock_timeout(timeout);
        }

        let (recovery_unit, _) = op_ctx.install_fresh_recovery_unit();
        let read_concern = op_ctx.read_concern().clone();

        Self {
            locker: Some(locker),
            recovery_unit: Some(recovery_unit),
            wuow_state,
            read_concern,
            released: false,
        }
    }

    /// Put the retained resources back onto `op_ctx`.
    ///
    /// Ticket reacquisition is the only fallible step and runs before
    /// custody is handed over; on failure the bundle is left intact.
    pub fn release(&mut self, op_ctx: &mut OperationContext) -> Result<()> {
        let Some(locker) = self.locker.as_mut() else {
            crate::fatal!("transaction resources released twice");
        };

        // Admission is an interruption point: a killed operation fails here
        // rather than readopting the transaction's resources.
        op_ctx.handle().check_for_interrupt()?;
        locker.acquire_ticket();

        self.released = true;

        let mut locker = self.locker.take().unwrap_or_else(|| {
            crate::fatal!("transaction resources lost their locker");
        });
        locker.rebind_to_current_thread();
        if op_ctx.locker().client_state() != LockerClientState::Inactive {
            crate::fatal!("cannot swap lockers while the active locker holds locks");
        }
        // The swapped-out locker is just the empty one installed at capture;
        // it is discarded.
        let _ = op_ctx.swap_locker(locker);

        let Some(recovery_unit) = self.recovery_unit.take() else {
            crate::fatal!("transaction resources lost their recovery unit");
        };
        let (_fresh, old_state) =
            op_ctx.swap_recovery_unit(recovery_unit, RecoveryUnitState::NotInUnitOfWork);
        if old_state != RecoveryUnitState::NotInUnitOfWork {
            crate::fatal!(
                "recovery unit on the operation context was transactional: {:?}",
                old_state
            );
        }

        op_ctx.resume_wuow(self.wuow_state);
        op_ctx.set_read_concern(self.read_concern.clone());
        Ok(())
    }

    /// The stashed locker, for stats reporting.
    pub fn locker(&self) -> &Locker {
        match self.locker.as_ref() {
            Some(locker) => locker,
            None => crate::fatal!("transaction resources have no locker"),
        }
    }

    /// The read concern captured with these resources.
    pub fn read_concern(&self) -> &ReadConcernArgs {
        &self.read_concern
    }
}

impl Drop for TxnResources {
    /// A bundle dropped without release aborts the storage transaction it
    /// owns. This is the only path that aborts storage resources that were
    /// never handed back, e.g. when a stashed transaction is thrown away.
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Some(mut recovery_unit) = self.recovery_unit.take() {
            // Unwind the write unit of work held open on the stashed locker.
            if let Some(locker) = self.locker.as_mut() {
                locker.end_wuow();
                debug_assert!(!locker.in_wuow());
            }
            recovery_unit.abort_unit_of_work();
        }
    }
}

/// Scoped swap-out of the active transaction's resources so unrelated
/// storage work can run on the same operation context.
///
/// `finish` must be called on every exit path; a block dropped unfinished
/// drops its captured resources, aborting the underlying transaction.
pub struct SideTransactionBlock {
    stashed: Option<TxnResources>,
}

impl SideTransactionBlock {
    /// Capture the context's transaction resources, if a write unit of work
    /// is active.
    pub fn start(op_ctx: &mut OperationContext) -> Self {
        let stashed = op_ctx
            .has_wuow()
            .then(|| TxnResources::capture(op_ctx, true /* keep_ticket */));
        Self { stashed }
    }

    /// Restore the swapped-out resources onto `op_ctx`.
    pub fn finish(mut self, op_ctx: &mut OperationContext) -> Result<()> {
        if let Some(mut resources) = self.stashed.take() {
            resources.release(op_ctx)?;
        }
        Ok(())
    }
}

/// Reserves the next oplog slot through a side transaction.
///
/// The reservation keeps a hole in the oplog: snapshot readers at or beyond
/// the slot's timestamp wait until the slot is filled or the reserver is
/// dropped, which aborts the side storage transaction and releases the hole.
pub struct OplogSlotReserver {
    locker: Option<Locker>,
    recovery_unit: Option<Box<dyn RecoveryUnit>>,
    slot: OplogSlot,
}

impl OplogSlotReserver {
    /// Reserve the next oplog slot. The active transaction's resources are
    /// swapped aside for the reservation and restored before this returns.
    pub fn reserve(op_ctx: &mut OperationContext) -> Result<Self> {
        let side_txn = SideTransactionBlock::start(op_ctx);
        let service = op_ctx.service().clone();

        // Open a unit of work on the side transaction and reserve the slot.
        op_ctx.begin_wuow();
        let op_time = service.oplog().next_op_time();

        // The unit of work is no longer in use, but the reservation must
        // outlive it; release rather than commit so the hole stays open.
        let _ = op_ctx.release_wuow();

        // Take custody of the side transaction's locker and recovery unit;
        // they anchor the hole until this reserver is dropped.
        if op_ctx.locker().client_state() != LockerClientState::Inactive {
            crate::fatal!("side transaction locker still holds locks");
        }
        let mut locker = op_ctx.swap_locker(Locker::new());
        locker.unset_thread_id();
        if let Some(timeout) = service.config().max_transaction_lock_timeout() {
            op_ctx.locker_mut().set_max_lock_timeout(timeout);
        }
        let (recovery_unit, _) = op_ctx.install_fresh_recovery_unit();

        side_txn.finish(op_ctx)?;

        Ok(Self {
            locker: Some(locker),
            recovery_unit: Some(recovery_unit),
            slot: OplogSlot::new(op_time),
        })
    }

    /// The reserved slot.
    pub fn slot(&self) -> OplogSlot {
        self.slot
    }
}

impl Drop for OplogSlotReserver {
    fn drop(&mut self) {
        if let Some(mut recovery_unit) = self.recovery_unit.take() {
            if let Some(locker) = self.locker.as_mut() {
                // Only the top-level unit of work for the reservation.
                locker.end_wuow();
                debug_assert!(!locker.in_wuow());
            }
            // Aborting the side transaction releases the oplog hole.
            recovery_unit.abort_unit_of_work();
        }
    }
}
