//! Command admission policy for multi-document transactions

use crate::error::{Result, TxnError};
use crate::state::TxnState;
use replidb_common::TxnNumber;

/// Commands that may execute inside a multi-document transaction.
const TXN_COMMANDS: &[&str] = &[
    "abortTransaction",
    "aggregate",
    "commitTransaction",
    "coordinateCommitTransaction",
    "delete",
    "distinct",
    "find",
    "findAndModify",
    // Legacy spelling accepted alongside findAndModify.
    "findandmodify",
    "geoSearch",
    "getMore",
    "insert",
    "killCursors",
    "prepareTransaction",
    "update",
    "voteAbortTransaction",
    "voteCommitTransaction",
];

/// Commands additionally permitted when test commands are enabled.
const TXN_COMMANDS_TEST_ONLY: &[&str] = &["dbHash"];

/// Commands that may run while the transaction is prepared.
const PREPARED_TXN_COMMANDS: &[&str] =
    &["abortTransaction", "commitTransaction", "prepareTransaction"];

/// Commands that may target the `admin` database inside a transaction.
const ADMIN_TXN_COMMANDS: &[&str] = &[
    "abortTransaction",
    "commitTransaction",
    "coordinateCommitTransaction",
    "prepareTransaction",
    "voteAbortTransaction",
    "voteCommitTransaction",
];

/// Check whether `cmd_name` against `db_name` is allowed in a multi-document
/// transaction at all.
pub fn check_command(db_name: &str, cmd_name: &str, test_commands_enabled: bool) -> Result<()> {
    if cmd_name == "count" {
        return Err(TxnError::OperationNotSupportedInTransaction(
            "cannot run 'count' in a multi-document transaction; \
             use aggregate with a $count stage instead"
                .to_string(),
        ));
    }

    if !TXN_COMMANDS.contains(&cmd_name)
        && !(test_commands_enabled && TXN_COMMANDS_TEST_ONLY.contains(&cmd_name))
    {
        return Err(TxnError::OperationNotSupportedInTransaction(format!(
            "cannot run '{}' in a multi-document transaction",
            cmd_name
        )));
    }

    if db_name == "config"
        || db_name == "local"
        || (db_name == "admin" && !ADMIN_TXN_COMMANDS.contains(&cmd_name))
    {
        return Err(TxnError::OperationNotSupportedInTransaction(format!(
            "cannot run command against the '{}' database in a transaction",
            db_name
        )));
    }

    Ok(())
}

/// Check whether `cmd_name` may run given the transaction's current state.
pub fn check_command_valid_with_state(
    state: TxnState,
    txn_number: TxnNumber,
    cmd_name: &str,
) -> Result<()> {
    // NoSuchTransaction rather than a dedicated aborted error: this is the
    // entry point of transaction execution.
    if state.is_aborted() {
        return Err(TxnError::NoSuchTransaction(format!(
            "transaction {} has been aborted",
            txn_number
        )));
    }

    // A committed transaction cannot change, but retrying commitTransaction
    // is allowed.
    if state.is_committed() && cmd_name != "commitTransaction" {
        return Err(TxnError::TransactionCommitted(format!(
            "transaction {} has been committed",
            txn_number
        )));
    }

    if state.is_prepared() && !PREPARED_TXN_COMMANDS.contains(&cmd_name) {
        return Err(TxnError::PreparedTransactionInProgress(
            "cannot call any operation other than abort, prepare or commit on \
             a prepared transaction"
                .to_string(),
        ));
    }

    Ok(())
}
