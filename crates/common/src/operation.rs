//! Buffered replication operations

use serde::{Deserialize, Serialize};

/// Upper bound on the total in-memory size of the operations buffered by one
/// transaction. This is the maximum internal document size (16 MiB plus slack
/// for internal fields), since the buffered operations are eventually flushed
/// into a single commit or prepare oplog document.
pub const MAX_DOCUMENT_INTERNAL_BYTES: u64 = 16 * 1024 * 1024 + 16 * 1024;

/// The kind of write a buffered operation represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationType {
    /// Insert a new document
    Insert,
    /// Update an existing document
    Update,
    /// Delete a document
    Delete,
}

/// A single replicated write buffered by an in-progress transaction, waiting
/// to be flushed into the transaction's oplog entry at commit or prepare.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplOperation {
    /// What kind of write this is
    pub op_type: OperationType,
    /// Target namespace, `<db>.<collection>`
    pub namespace: String,
    /// The document written (inserts/updates) or matched (deletes)
    pub document: serde_json::Value,
    /// Selection criteria for updates and deletes
    pub criteria: Option<serde_json::Value>,
}

impl ReplOperation {
    /// An insert of `document` into `namespace`.
    pub fn insert(namespace: impl Into<String>, document: serde_json::Value) -> Self {
        Self {
            op_type: OperationType::Insert,
            namespace: namespace.into(),
            document,
            criteria: None,
        }
    }

    /// An update applying `document` to the documents matching `criteria`.
    pub fn update(
        namespace: impl Into<String>,
        criteria: serde_json::Value,
        document: serde_json::Value,
    ) -> Self {
        Self {
            op_type: OperationType::Update,
            namespace: namespace.into(),
            document,
            criteria: Some(criteria),
        }
    }

    /// A delete of the documents matching `criteria`.
    pub fn delete(namespace: impl Into<String>, criteria: serde_json::Value) -> Self {
        Self {
            op_type: OperationType::Delete,
            namespace: namespace.into(),
            document: serde_json::Value::Null,
            criteria: Some(criteria),
        }
    }

    /// In-memory size of this operation, measured as its CBOR encoding.
    ///
    /// The on-oplog encoding carries additional per-entry overhead, so a
    /// transaction can still be slightly too large and fail only at commit;
    /// measuring here lets oversized transactions fail early instead of
    /// exhausting server memory.
    pub fn size_bytes(&self) -> Result<u64, String> {
        let mut buf = Vec::new();
        ciborium::ser::into_writer(self, &mut buf)
            .map_err(|e| format!("Failed to serialize operation: {}", e))?;
        Ok(buf.len() as u64)
    }
}
