//! Lifecycle tests: retryable writes, begin/continue resolution, stash and
//! unstash custody, unprepared commit, expiry and shutdown.

mod common;

use common::{ObserverEvent, TestHarness};
use replidb_common::{ReplOperation, MAX_DOCUMENT_INTERNAL_BYTES};
use replidb_txn::{
    Client, ClientInfo, ClusterRole, OperationContext, ReadConcernArgs, ReadConcernLevel,
    SpeculativeTransactionOpTime, TransactionConfig, TxnError, TxnState,
};
use serde_json::json;
use std::sync::Arc;

#[test]
fn test_unprepared_commit_full_trace() {
    let harness = TestHarness::new();
    let participant = harness.participant();
    let mut op_ctx = harness.begin_txn(5);
    assert_eq!(participant.state(), TxnState::InProgress);

    participant
        .add_transaction_operation(&mut op_ctx, ReplOperation::insert("test.coll", json!({"_id": 1})))
        .unwrap();
    participant
        .add_transaction_operation(&mut op_ctx, ReplOperation::insert("test.coll", json!({"_id": 2})))
        .unwrap();
    assert_eq!(participant.operation_count(), 2);

    let operations = participant
        .end_transaction_and_retrieve_operations(&mut op_ctx)
        .unwrap();
    assert_eq!(operations.len(), 2);
    assert_eq!(participant.operation_count(), 0);
    assert_eq!(participant.operation_bytes(), 0);

    participant.commit_unprepared_transaction(&mut op_ctx).unwrap();
    assert_eq!(participant.state(), TxnState::Committed);

    assert_eq!(
        harness.observer.events(),
        vec![ObserverEvent::Commit {
            commit_slot: None,
            commit_timestamp: None,
        }]
    );
    // Exactly one storage transaction committed, none prepared.
    assert_eq!(harness.storage.commits().len(), 1);
}

#[test]
fn test_retryable_write_number_resolution() {
    let harness = TestHarness::new();
    let participant = harness.participant();

    harness.session.core().set_active_txn_number(1).unwrap();
    participant.begin_or_continue(1, None, None).unwrap();
    assert_eq!(participant.state(), TxnState::None);
    assert_eq!(participant.active_txn_number(), Some(1));

    // Retrying the same write is a no-op.
    participant.begin_or_continue(1, None, None).unwrap();
    assert_eq!(participant.active_txn_number(), Some(1));

    // A newer number advances.
    participant.begin_or_continue(3, None, None).unwrap();
    assert_eq!(participant.active_txn_number(), Some(3));

    // An older number cannot come back.
    let err = participant.begin_or_continue(2, None, None).unwrap_err();
    assert!(matches!(err, TxnError::ConflictingOperationInProgress(_)));
    assert_eq!(participant.active_txn_number(), Some(3));
}

#[test]
fn test_retryable_write_at_transaction_number_rejected() {
    let harness = TestHarness::new();
    let participant = harness.participant();
    let _op_ctx = harness.begin_txn(3);

    // Same number without autocommit=false: the transaction is in progress,
    // so the statement is malformed.
    let err = participant.begin_or_continue(3, None, None).unwrap_err();
    assert!(matches!(err, TxnError::InvalidOptions(_)));
}

#[test]
fn test_stash_unstash_round_trip_preserves_state() {
    let harness = TestHarness::new();
    let participant = harness.participant();
    let mut op_ctx = harness.begin_txn(13);

    participant
        .add_transaction_operation(&mut op_ctx, ReplOperation::insert("test.coll", json!({"_id": 1})))
        .unwrap();
    let bytes_before = participant.operation_bytes();

    participant.stash_transaction_resources(&mut op_ctx).unwrap();
    assert!(participant.has_stashed_resources());
    assert_eq!(participant.state(), TxnState::InProgress);

    // Second statement: continue, then unstash onto a fresh context.
    let mut second_ctx = harness.op_ctx(13);
    participant.begin_or_continue(13, Some(false), None).unwrap();
    participant
        .unstash_transaction_resources(&mut second_ctx, "insert")
        .unwrap();

    assert!(!participant.has_stashed_resources());
    assert_eq!(participant.state(), TxnState::InProgress);
    assert_eq!(participant.operation_count(), 1);
    assert_eq!(participant.operation_bytes(), bytes_before);
    assert!(second_ctx.has_wuow());

    // And back into the stash, unchanged.
    participant.stash_transaction_resources(&mut second_ctx).unwrap();
    assert!(participant.has_stashed_resources());
    assert_eq!(participant.state(), TxnState::InProgress);
    assert_eq!(participant.operation_count(), 1);
}

#[test]
fn test_only_first_command_may_specify_read_concern() {
    let harness = TestHarness::new();
    let participant = harness.participant();
    let mut op_ctx = harness.begin_txn(13);
    participant.stash_transaction_resources(&mut op_ctx).unwrap();

    let mut second_ctx = harness.op_ctx(13);
    second_ctx.set_read_concern(ReadConcernArgs::with_level(ReadConcernLevel::Snapshot));
    let err = participant
        .unstash_transaction_resources(&mut second_ctx, "insert")
        .unwrap_err();
    assert!(matches!(err, TxnError::InvalidOptions(_)));
    // The stash was not consumed by the rejected unstash.
    assert!(participant.has_stashed_resources());

    let mut third_ctx = harness.op_ctx(13);
    participant
        .unstash_transaction_resources(&mut third_ctx, "insert")
        .unwrap();
    assert!(!participant.has_stashed_resources());
}

#[test]
fn test_continue_after_failed_first_statement_aborts() {
    let harness = TestHarness::new();
    let participant = harness.participant();

    // The first statement began the transaction but failed before stashing.
    let _op_ctx = harness.op_ctx(7);
    participant
        .begin_or_continue(7, Some(false), Some(true))
        .unwrap();
    assert_eq!(participant.state(), TxnState::InProgress);
    assert!(!participant.has_stashed_resources());

    let err = participant
        .begin_or_continue(7, Some(false), None)
        .unwrap_err();
    assert!(matches!(err, TxnError::NoSuchTransaction(_)));
    assert_eq!(participant.state(), TxnState::Aborted);
}

#[test]
fn test_continue_unknown_transaction() {
    let harness = TestHarness::new();
    let participant = harness.participant();
    harness.session.core().set_active_txn_number(5).unwrap();

    let err = participant
        .begin_or_continue(5, Some(false), None)
        .unwrap_err();
    assert!(matches!(err, TxnError::NoSuchTransaction(_)));
}

#[test]
fn test_restart_at_active_number_requires_sharded_role() {
    let harness = TestHarness::new();
    let participant = harness.participant();
    let _op_ctx = harness.begin_txn(9);

    let err = participant
        .begin_or_continue(9, Some(false), Some(true))
        .unwrap_err();
    assert!(matches!(err, TxnError::ConflictingOperationInProgress(_)));
}

#[test]
fn test_restart_at_active_number_on_shard_server() {
    let harness = TestHarness::with_config(TransactionConfig::new(ClusterRole::ShardServer));
    let participant = harness.participant();
    let _op_ctx = harness.begin_txn(9);

    // Routers may retry the start after a re-targeting error while the
    // transaction is in progress...
    participant
        .begin_or_continue(9, Some(false), Some(true))
        .unwrap();
    assert_eq!(participant.state(), TxnState::InProgress);

    // ...and after the first attempt aborted.
    participant.abort_arbitrary_transaction();
    assert_eq!(participant.state(), TxnState::Aborted);
    participant
        .begin_or_continue(9, Some(false), Some(true))
        .unwrap();
    assert_eq!(participant.state(), TxnState::InProgress);
}

#[test]
fn test_operation_size_limit() {
    let harness = TestHarness::new();
    let participant = harness.participant();
    let mut op_ctx = harness.begin_txn(21);

    let small = ReplOperation::insert("test.coll", json!({"_id": 1}));
    let small_size = small.size_bytes().unwrap();
    participant
        .add_transaction_operation(&mut op_ctx, small)
        .unwrap();

    // One operation large enough to push the sum past the limit.
    let padding = "x".repeat(MAX_DOCUMENT_INTERNAL_BYTES as usize);
    let huge = ReplOperation::insert("test.coll", json!({"_id": 2, "padding": padding}));
    let huge_size = huge.size_bytes().unwrap();
    let err = participant
        .add_transaction_operation(&mut op_ctx, huge)
        .unwrap_err();
    assert!(matches!(err, TxnError::TransactionTooLarge(_)));

    // The failed operation still counts until the transaction aborts.
    assert_eq!(participant.operation_bytes(), small_size + huge_size);

    participant.abort_active_transaction(&mut op_ctx).unwrap();
    assert_eq!(participant.state(), TxnState::Aborted);
    assert_eq!(participant.operation_count(), 0);
    assert_eq!(participant.operation_bytes(), 0);
}

#[test]
fn test_new_transaction_aborts_in_progress_predecessor() {
    let harness = TestHarness::new();
    let participant = harness.participant();
    let mut op_ctx = harness.begin_txn(5);
    participant
        .add_transaction_operation(&mut op_ctx, ReplOperation::insert("test.coll", json!({"_id": 1})))
        .unwrap();
    participant.stash_transaction_resources(&mut op_ctx).unwrap();

    let _next_ctx = harness.op_ctx(6);
    participant
        .begin_or_continue(6, Some(false), Some(true))
        .unwrap();

    assert_eq!(participant.active_txn_number(), Some(6));
    assert_eq!(participant.state(), TxnState::InProgress);
    assert_eq!(participant.operation_count(), 0);
    // The predecessor's stashed storage transaction was aborted.
    assert_eq!(harness.storage.aborts().len(), 1);
}

#[test]
fn test_expired_transaction_is_killed_and_aborted() {
    let config = TransactionConfig::default();
    config.set_transaction_lifetime_limit_seconds(1).unwrap();
    let harness = TestHarness::with_config(config);
    let participant = harness.participant();

    let mut op_ctx = harness.begin_txn(11);
    participant
        .add_transaction_operation(&mut op_ctx, ReplOperation::insert("test.coll", json!({"_id": 1})))
        .unwrap();

    // Not yet expired: the sweeper leaves it alone.
    participant.abort_arbitrary_transaction_if_expired();
    assert_eq!(participant.state(), TxnState::InProgress);

    std::thread::sleep(std::time::Duration::from_millis(1200));

    participant.abort_arbitrary_transaction_if_expired();
    assert_eq!(participant.state(), TxnState::Aborted);
    assert_eq!(participant.operation_count(), 0);
    assert!(matches!(
        op_ctx.handle().killed(),
        Some(TxnError::ExceededTimeLimit(_))
    ));
}

#[test]
fn test_shutdown_drops_stash_without_observer_calls() {
    let harness = TestHarness::new();
    let participant = harness.participant();
    let mut op_ctx = harness.begin_txn(15);
    participant.stash_transaction_resources(&mut op_ctx).unwrap();

    participant.shutdown();

    assert!(!participant.has_stashed_resources());
    // The stashed storage transaction was aborted through resource custody,
    // not through the replication machinery.
    assert_eq!(harness.storage.aborts().len(), 1);
    assert!(harness.observer.events().is_empty());

    // Further stashing is refused while shutting down.
    let mut next_ctx = harness.op_ctx(16);
    participant
        .begin_or_continue(16, Some(false), Some(true))
        .unwrap();
    participant
        .unstash_transaction_resources(&mut next_ctx, "insert")
        .unwrap();
    participant.stash_transaction_resources(&mut next_ctx).unwrap();
    assert!(!participant.has_stashed_resources());
}

#[test]
fn test_direct_client_skips_resource_custody() {
    let harness = TestHarness::new();
    let participant = harness.participant();
    let _outer_ctx = harness.begin_txn(5);

    // An internal command running under the same session through a direct
    // client must not move resource custody.
    let direct_client = Arc::new(Client::new_direct(ClientInfo {
        host_and_port: "internal".to_string(),
        app_name: "direct".to_string(),
        connection_id: 2,
    }));
    let mut direct_ctx = OperationContext::new(harness.service.clone(), direct_client);
    direct_ctx.set_txn_number(5);

    participant.stash_transaction_resources(&mut direct_ctx).unwrap();
    assert!(!participant.has_stashed_resources());

    participant
        .unstash_transaction_resources(&mut direct_ctx, "insert")
        .unwrap();
    assert!(!direct_ctx.has_wuow());
}

#[test]
fn test_command_validity_delegation() {
    let harness = TestHarness::new();
    let participant = harness.participant();

    participant.is_valid("test", "find").unwrap();
    assert!(matches!(
        participant.is_valid("test", "count"),
        Err(TxnError::OperationNotSupportedInTransaction(_))
    ));
    assert!(participant.is_valid("config", "find").is_err());
    assert!(participant.is_valid("test", "dbHash").is_err());

    harness.service.config().set_test_commands_enabled(true);
    participant.is_valid("test", "dbHash").unwrap();
}

#[test]
fn test_unstash_after_commit_permits_only_commit_retry() {
    let harness = TestHarness::new();
    let participant = harness.participant();
    let mut op_ctx = harness.begin_txn(5);
    participant.commit_unprepared_transaction(&mut op_ctx).unwrap();

    let mut retry_ctx = harness.op_ctx(5);
    participant
        .unstash_transaction_resources(&mut retry_ctx, "commitTransaction")
        .unwrap();
    assert!(!retry_ctx.has_wuow());

    let err = participant
        .unstash_transaction_resources(&mut retry_ctx, "insert")
        .unwrap_err();
    assert!(matches!(err, TxnError::TransactionCommitted(_)));
}

#[test]
fn test_speculative_read_optime_advances_client_last_op() {
    let harness = TestHarness::new();
    let participant = harness.participant();
    let mut op_ctx = harness.begin_txn(5);

    participant
        .set_speculative_transaction_op_time(&mut op_ctx, SpeculativeTransactionOpTime::AllCommitted);
    let speculative = participant.speculative_read_op_time();
    assert!(!speculative.is_null());
    assert_eq!(speculative.term(), harness.service.term());

    participant.commit_unprepared_transaction(&mut op_ctx).unwrap();
    assert!(harness.client.last_op() >= speculative);
}

#[test]
fn test_refresh_reconciliation_reaches_committed() {
    let harness = TestHarness::new();
    let participant = harness.participant();
    let _op_ctx = harness.begin_txn(5);

    // A migration recorded durably that transaction 5 committed elsewhere.
    harness
        .session
        .core()
        .set_last_refresh_state(replidb_txn::RefreshState {
            refresh_count: 1,
            txn_number: 5,
            is_committed: true,
        });

    // Continuing picks the refresh up; the relaxed transition moves the
    // state straight to Committed.
    participant.begin_or_continue(5, Some(false), None).unwrap();
    assert_eq!(participant.state(), TxnState::Committed);

    // A stale refresh (same count) is ignored.
    participant.begin_or_continue(5, Some(false), None).unwrap();
    assert_eq!(participant.state(), TxnState::Committed);
}

#[test]
fn test_check_for_new_txn_number() {
    let harness = TestHarness::new();
    let participant = harness.participant();
    let _op_ctx = harness.begin_txn(5);

    harness.session.core().set_active_txn_number(8).unwrap();
    participant.check_for_new_txn_number();

    assert_eq!(participant.active_txn_number(), Some(8));
    assert_eq!(participant.state(), TxnState::None);
}

#[test]
fn test_report_stashed_state() {
    let harness = TestHarness::new();
    let participant = harness.participant();
    assert!(participant.report_stashed_state().is_none());

    let mut op_ctx = harness.begin_txn(5);
    participant.stash_transaction_resources(&mut op_ctx).unwrap();

    let report = participant.report_stashed_state().unwrap();
    assert_eq!(report.desc, "inactive transaction");
    assert!(!report.active);
    assert!(!report.waiting_for_lock);
    assert_eq!(report.lsid, harness.session.core().session_id());
    assert_eq!(report.transaction.parameters.txn_number, Some(5));
    assert!(!report.transaction.parameters.autocommit);
    assert_eq!(
        report.client.unwrap().app_name,
        harness.client.info().app_name
    );

    let mut second_ctx = harness.op_ctx(5);
    participant
        .unstash_transaction_resources(&mut second_ctx, "insert")
        .unwrap();
    assert!(participant.report_stashed_state().is_none());
}

#[test]
fn test_report_unstashed_state() {
    let harness = TestHarness::new();
    let participant = harness.participant();
    let read_concern = ReadConcernArgs::default();

    // Retryable write: reported (no stash is ever used).
    harness.session.core().set_active_txn_number(1).unwrap();
    participant.begin_or_continue(1, None, None).unwrap();
    assert!(participant.report_unstashed_state(&read_concern).is_some());

    // Active multi-document transaction: reported.
    let mut op_ctx = harness.begin_txn(2);
    let report = participant.report_unstashed_state(&read_concern).unwrap();
    assert_eq!(report.parameters.txn_number, Some(2));
    assert!(!report.parameters.autocommit);

    // Stashed between commands: not this reader's to report.
    participant.stash_transaction_resources(&mut op_ctx).unwrap();
    assert!(participant.report_unstashed_state(&read_concern).is_none());
}
