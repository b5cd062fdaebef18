//! Runtime-tunable transaction parameters

use crate::error::{Result, TxnError};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

/// Which role this node plays in a sharded deployment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ClusterRole {
    /// Standalone replica set member, not part of a sharded cluster
    #[default]
    None,
    /// Shard server reachable through cluster routers
    ShardServer,
    /// Config server for a sharded cluster
    ConfigServer,
}

/// Server-global transaction parameters.
///
/// Settable at runtime through the validating setters; reads are lock-free.
#[derive(Debug)]
pub struct TransactionConfig {
    /// Max milliseconds any transaction lock request waits for acquisition.
    /// Keeping this small avoids deadlocks while still letting fast-running
    /// metadata operations complete without aborting transactions. Negative
    /// disables the override.
    max_transaction_lock_request_timeout_millis: AtomicI64,

    /// Lifetime given to each transaction. Transactions must eventually
    /// expire to preempt storage cache pressure immobilizing the system.
    transaction_lifetime_limit_seconds: AtomicI64,

    /// Threshold above which a finished transaction is logged as slow.
    slow_transaction_threshold_millis: AtomicI64,

    /// Whether test-only commands are admitted into transactions.
    test_commands_enabled: AtomicBool,

    /// Deployment role, fixed at startup.
    cluster_role: ClusterRole,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            max_transaction_lock_request_timeout_millis: AtomicI64::new(5),
            transaction_lifetime_limit_seconds: AtomicI64::new(60),
            slow_transaction_threshold_millis: AtomicI64::new(100),
            test_commands_enabled: AtomicBool::new(false),
            cluster_role: ClusterRole::None,
        }
    }
}

impl TransactionConfig {
    /// Create a config with defaults for the given deployment role.
    pub fn new(cluster_role: ClusterRole) -> Self {
        Self {
            cluster_role,
            ..Default::default()
        }
    }

    /// Set the transaction lock request timeout in milliseconds. Negative
    /// values disable the override.
    pub fn set_max_transaction_lock_request_timeout_millis(&self, millis: i64) {
        self.max_transaction_lock_request_timeout_millis
            .store(millis, Ordering::Relaxed);
    }

    /// Set the transaction lifetime limit in seconds.
    pub fn set_transaction_lifetime_limit_seconds(&self, seconds: i64) -> Result<()> {
        if seconds < 1 {
            return Err(TxnError::BadValue(
                "transaction_lifetime_limit_seconds must be greater than or equal to 1s"
                    .to_string(),
            ));
        }
        self.transaction_lifetime_limit_seconds
            .store(seconds, Ordering::Relaxed);
        Ok(())
    }

    /// Set the slow transaction logging threshold in milliseconds.
    pub fn set_slow_transaction_threshold_millis(&self, millis: i64) -> Result<()> {
        if millis < 0 {
            return Err(TxnError::BadValue(
                "slow_transaction_threshold_millis must be non-negative".to_string(),
            ));
        }
        self.slow_transaction_threshold_millis
            .store(millis, Ordering::Relaxed);
        Ok(())
    }

    /// Enable or disable test-only commands.
    pub fn set_test_commands_enabled(&self, enabled: bool) {
        self.test_commands_enabled.store(enabled, Ordering::Relaxed);
    }

    /// The lock timeout to apply to transactional lockers, or `None` when the
    /// override is disabled.
    pub fn max_transaction_lock_timeout(&self) -> Option<Duration> {
        let millis = self
            .max_transaction_lock_request_timeout_millis
            .load(Ordering::Relaxed);
        (millis >= 0).then(|| Duration::from_millis(millis as u64))
    }

    /// Lifetime given to each transaction.
    pub fn transaction_lifetime_limit(&self) -> Duration {
        Duration::from_secs(self.transaction_lifetime_limit_seconds.load(Ordering::Relaxed) as u64)
    }

    /// Threshold above which a finished transaction is logged.
    pub fn slow_transaction_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_transaction_threshold_millis.load(Ordering::Relaxed) as u64)
    }

    /// Whether test-only commands are admitted.
    pub fn test_commands_enabled(&self) -> bool {
        self.test_commands_enabled.load(Ordering::Relaxed)
    }

    /// This node's deployment role.
    pub fn cluster_role(&self) -> ClusterRole {
        self.cluster_role
    }
}
