//! Op-observer hooks invoked at transaction lifecycle events
//!
//! The observer writes the transaction's oplog entries and may call back
//! into the session; the participant never holds its mutex across these
//! calls.

use crate::op_context::OperationContext;
use crate::oplog::OplogSlot;
use replidb_common::Timestamp;

/// Observer of replicated transaction events.
pub trait OpObserver: Send + Sync {
    /// A transaction was prepared; `prepare_slot` is the reserved slot for
    /// the prepare oplog entry.
    fn on_transaction_prepare(&self, op_ctx: &mut OperationContext, prepare_slot: OplogSlot);

    /// A transaction committed. Prepared commits carry the reserved commit
    /// slot and the commit timestamp; unprepared commits carry neither.
    fn on_transaction_commit(
        &self,
        op_ctx: &mut OperationContext,
        commit_slot: Option<OplogSlot>,
        commit_timestamp: Option<Timestamp>,
    );

    /// A transaction aborted.
    fn on_transaction_abort(&self, op_ctx: &mut OperationContext);
}
