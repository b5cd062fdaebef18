//! Common types for the replidb transaction subsystem
//!
//! This crate defines:
//! - Cluster timestamps and replication optimes
//! - Logical session identifiers
//! - Buffered replication operations and their size accounting

mod operation;
mod session_id;
mod timestamp;

pub use operation::MAX_DOCUMENT_INTERNAL_BYTES;
pub use operation::OperationType;
pub use operation::ReplOperation;
pub use session_id::SessionId;
pub use timestamp::OpTime;
pub use timestamp::Timestamp;
pub use timestamp::UNINITIALIZED_TERM;

/// Monotonically increasing transaction number within a logical session.
pub type TxnNumber = u64;
