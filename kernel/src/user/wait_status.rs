//! Parent/child exit-status rendezvous.
//!
//! Mirrors `struct wait_status` from
//! `examples/original_source/pintos/include/userprog/process.h`: one
//! refcounted object shared between a parent's children list and the child
//! thread, so either exit order — parent `wait`s after the child has
//! already exited, or a parent exits without ever waiting — tears down
//! cleanly instead of leaking or double-freeing.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use spin::Mutex;

use crate::scheduler;

/// A counting semaphore built on the scheduler's yield loop rather than a
/// real parking primitive — the same style `filesystem::devfs`'s blocking
/// `read` already uses while it waits for keyboard input: waiting means
/// "yield until the predicate holds," not "block off the ready queue."
pub struct Semaphore {
    count: Mutex<u32>,
}

impl Semaphore {
    pub const fn new(value: u32) -> Self {
        Semaphore {
            count: Mutex::new(value),
        }
    }

    pub fn down(&self) {
        loop {
            {
                let mut count = self.count.lock();
                if *count > 0 {
                    *count -= 1;
                    return;
                }
            }
            scheduler::yield_execution();
        }
    }

    pub fn up(&self) {
        *self.count.lock() += 1;
    }
}

pub struct WaitStatus {
    pub tid: u32,
    exit_status: Mutex<i32>,
    dead: AtomicBool,
    ref_cnt: AtomicU8,
    sema: Semaphore,
}

impl WaitStatus {
    /// A freshly created wait_status is shared by exactly two owners — the
    /// parent's children list and the child thread — hence `ref_cnt` starts
    /// at 2, matching the original's `w->ref_cnt = 2`.
    pub fn new(tid: u32) -> Arc<WaitStatus> {
        Arc::new(WaitStatus {
            tid,
            exit_status: Mutex::new(0),
            dead: AtomicBool::new(false),
            ref_cnt: AtomicU8::new(2),
            sema: Semaphore::new(0),
        })
    }

    /// Called once, from the child's own exit path. Records the status,
    /// marks it dead, and wakes a parent already inside [`wait_for`].
    pub fn record_exit(&self, status: i32) {
        *self.exit_status.lock() = status;
        self.dead.store(true, Ordering::Release);
        self.sema.up();
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    pub fn exit_status(&self) -> i32 {
        *self.exit_status.lock()
    }

    /// Drops one of the two logical owners' references. Caller must call
    /// this at most once per owner — either the parent finishing
    /// `process_wait`, or whichever side (parent or child) exits without
    /// the parent ever having waited. `Arc` already handles the actual
    /// deallocation once every clone is dropped; this only tracks the
    /// *logical* two-owner count the original enforces before `free`.
    pub fn release(self: &Arc<Self>) {
        self.ref_cnt.fetch_sub(1, Ordering::AcqRel);
    }

    #[cfg(test)]
    pub fn ref_count(&self) -> u8 {
        self.ref_cnt.load(Ordering::Acquire)
    }
}

/// Blocks the calling thread until `w`'s child has exited, then releases
/// the caller's reference and returns the exit status. Mirrors the body of
/// `process_wait` that runs after the child has already been removed from
/// the parent's children list (double-wait prevention is the caller's job,
/// same as in the original).
pub fn wait_for(w: &Arc<WaitStatus>) -> i32 {
    if !w.is_dead() {
        w.sema.down();
    }
    let status = w.exit_status();
    w.release();
    status
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn waiting_on_an_already_dead_child_returns_immediately() {
        let w = WaitStatus::new(3);
        w.record_exit(42);
        assert_eq!(wait_for(&w), 42);
        assert_eq!(w.ref_count(), 1);
    }

    #[test]
    fn releasing_both_owners_drains_the_refcount() {
        let w = WaitStatus::new(5);
        w.release();
        assert_eq!(w.ref_count(), 1);
        w.release();
        assert_eq!(w.ref_count(), 0);
    }

    #[test]
    fn record_exit_marks_dead_and_stores_status() {
        let w = WaitStatus::new(1);
        assert!(!w.is_dead());
        w.record_exit(-1);
        assert!(w.is_dead());
        assert_eq!(w.exit_status(), -1);
    }
}
