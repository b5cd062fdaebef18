//! Lock-manager handle owned by an operation context
//!
//! Lock-manager internals are out of scope here; the handle tracks only what
//! the transaction participant moves between threads: the scheduling ticket,
//! the bound thread, write-unit-of-work nesting, the transaction lock
//! timeout and acquisition statistics.

use serde::Serialize;
use std::thread::{self, ThreadId};
use std::time::Duration;

/// Lock mode for global lock acquisitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    IntentShared,
    IntentExclusive,
    Shared,
    Exclusive,
}

/// Whether the locker currently holds locks on behalf of a running operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockerClientState {
    Inactive,
    Active,
}

/// Aggregate acquisition counters, surfaced by currentOp readers and the
/// slow-transaction log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LockStats {
    pub acquisitions: u64,
    pub global_acquisitions: u64,
    pub ticket_reacquisitions: u64,
}

/// A thread's handle into the lock manager.
///
/// Movable between threads through an explicit thread-identity unbind/rebind;
/// a locker detached from its thread must not acquire anything until rebound.
#[derive(Debug)]
pub struct Locker {
    thread: Option<ThreadId>,
    ticket_held: bool,
    wuow_nesting: u32,
    max_lock_timeout: Option<Duration>,
    global_lock: Option<LockMode>,
    stats: LockStats,
}

impl Locker {
    /// A fresh, empty locker bound to the current thread.
    pub fn new() -> Self {
        Self {
            thread: Some(thread::current().id()),
            ticket_held: false,
            wuow_nesting: 0,
            max_lock_timeout: None,
            global_lock: None,
            stats: LockStats::default(),
        }
    }

    /// Whether this locker holds locks for a running operation.
    pub fn client_state(&self) -> LockerClientState {
        if self.global_lock.is_some() {
            LockerClientState::Active
        } else {
            LockerClientState::Inactive
        }
    }

    /// Give up the scheduling ticket so a stashed transaction does not count
    /// against execution admission.
    pub fn release_ticket(&mut self) {
        self.ticket_held = false;
    }

    /// Whether the scheduling ticket is held.
    pub fn ticket_held(&self) -> bool {
        self.ticket_held
    }

    pub(crate) fn acquire_ticket(&mut self) {
        if !self.ticket_held {
            self.ticket_held = true;
            self.stats.ticket_reacquisitions += 1;
        }
    }

    /// Detach this locker from its thread so it can be stashed and later
    /// adopted by another thread.
    pub fn unset_thread_id(&mut self) {
        self.thread = None;
    }

    /// Adopt this locker on the current thread.
    pub fn rebind_to_current_thread(&mut self) {
        self.thread = Some(thread::current().id());
    }

    /// The thread this locker is bound to, if any.
    pub fn thread_id(&self) -> Option<ThreadId> {
        self.thread
    }

    /// Cap how long any lock request on this locker waits.
    pub fn set_max_lock_timeout(&mut self, timeout: Duration) {
        self.max_lock_timeout = Some(timeout);
    }

    /// Remove the lock request wait cap.
    pub fn unset_max_lock_timeout(&mut self) {
        self.max_lock_timeout = None;
    }

    /// The current lock request wait cap.
    pub fn max_lock_timeout(&self) -> Option<Duration> {
        self.max_lock_timeout
    }

    pub(crate) fn begin_wuow(&mut self) {
        self.wuow_nesting += 1;
    }

    pub(crate) fn end_wuow(&mut self) {
        self.wuow_nesting = self.wuow_nesting.saturating_sub(1);
    }

    /// Whether a write unit of work is open on this locker.
    pub fn in_wuow(&self) -> bool {
        self.wuow_nesting > 0
    }

    /// Take the global lock in the given mode, acquiring a ticket if needed.
    pub fn acquire_global(&mut self, mode: LockMode) {
        self.acquire_ticket();
        self.global_lock = Some(mode);
        self.stats.acquisitions += 1;
        self.stats.global_acquisitions += 1;
    }

    /// Release the global lock.
    pub fn release_global(&mut self) {
        self.global_lock = None;
    }

    /// Accumulated acquisition statistics.
    pub fn stats(&self) -> LockStats {
        self.stats
    }
}

impl Default for Locker {
    fn default() -> Self {
        Self::new()
    }
}
