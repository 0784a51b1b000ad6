//! Tick counter and sleep list.
//!
//! Mirrors `timer_ticks`/`timer_sleep`/`timer_interrupt` from
//! `examples/original_source/pintos/devices/timer.c`. The original busy-waits
//! with interrupts enabled; parking the calling thread and yielding instead
//! is the idiomatic translation here — there's a real scheduler to hand the
//! CPU to, so there's no reason to spin.
//!
//! `tick()` is called from the LAPIC timer ISR and must never yield
//! synchronously: it only wakes (requeues) threads and reports whether a
//! deferred yield is warranted, leaving the actual switch to happen once
//! the ISR returns.

use core::sync::atomic::{AtomicU64, Ordering};

use alloc::collections::vec_deque::VecDeque;
use alloc::sync::Arc;
use conquer_once::spin::OnceCell;
use spin::Mutex;
use x86_64::instructions::interrupts;

use crate::scheduler::{self, Thread};
use crate::CPUS;

static TICKS: AtomicU64 = AtomicU64::new(0);

struct Sleeper {
    wake_tick: u64,
    priority: u8,
    thread: Arc<Mutex<Thread>>,
}

static SLEEPING: OnceCell<Mutex<VecDeque<Sleeper>>> = OnceCell::uninit();

pub fn init() {
    SLEEPING
        .try_init_once(|| Mutex::new(VecDeque::new()))
        .expect("timer::init should only be called once.");
}

pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Puts the calling thread to sleep for at least `ticks_to_wait` timer
/// ticks. A request for zero ticks returns immediately without yielding,
/// matching `timer_sleep`'s early-out.
pub fn sleep(ticks_to_wait: u64) {
    if ticks_to_wait == 0 {
        return;
    }
    let wake_tick = ticks() + ticks_to_wait;

    interrupts::disable();
    let cpu = CPUS.get().unwrap().get_cpu();
    let thread = cpu
        .current_thread
        .clone()
        .expect("timer::sleep called with no current thread");
    thread.lock().wake_tick = Some(wake_tick);
    let priority = thread.lock().priority;

    {
        let mut list = SLEEPING
            .get()
            .expect("timer::init should have been called")
            .lock();
        insert_sorted(
            &mut list,
            Sleeper {
                wake_tick,
                priority,
                thread,
            },
        );
    }

    // IF stays off from here through the context switch inside
    // yield_execution -- only re-enabled once this thread is actually
    // scheduled back in and yield_execution returns to us.
    scheduler::yield_execution();
    interrupts::enable();
}

/// Kept sorted by wake tick, ties broken by priority (higher priority wakes
/// first), so `tick()` only ever has to look at the front of the list.
fn insert_sorted(list: &mut VecDeque<Sleeper>, sleeper: Sleeper) {
    let pos = list
        .iter()
        .position(|s| {
            s.wake_tick > sleeper.wake_tick
                || (s.wake_tick == sleeper.wake_tick && s.priority < sleeper.priority)
        })
        .unwrap_or(list.len());
    list.insert(pos, sleeper);
}

/// Pops every sleeper due by `now` off the front of `list`, in wake order.
/// Split out of `tick()` so the ordering invariant can be exercised without
/// a live scheduler to enqueue into.
fn drain_due(list: &mut VecDeque<Sleeper>, now: u64) -> VecDeque<Sleeper> {
    let mut due = VecDeque::new();
    while let Some(front) = list.front() {
        if front.wake_tick > now {
            break;
        }
        due.push_back(list.pop_front().unwrap());
    }
    due
}

/// Called once per timer interrupt. Advances the tick counter and requeues
/// any thread whose wake tick has arrived. Returns whether at least one
/// thread was woken, which the ISR uses to decide whether to request a
/// deferred yield on return.
pub fn tick() -> bool {
    let now = TICKS.fetch_add(1, Ordering::Relaxed) + 1;

    let due = {
        let mut list = SLEEPING
            .get()
            .expect("timer::init should have been called")
            .lock();
        drain_due(&mut list, now)
    };

    let woke_any = !due.is_empty();
    for sleeper in due {
        sleeper.thread.lock().wake_tick = None;
        scheduler::enqueue(sleeper.thread);
    }
    woke_any
}

#[cfg(test)]
mod tests {
    use super::*;

    unsafe extern "sysv64" fn noop() {}

    fn sleeper(wake_tick: u64, priority: u8, name: &str) -> Sleeper {
        let mut thread = Thread::from_func(noop, None, Some(name.to_owned()), None);
        thread.priority = priority;
        Sleeper {
            wake_tick,
            priority,
            thread: Arc::new(Mutex::new(thread)),
        }
    }

    fn names(list: &VecDeque<Sleeper>) -> alloc::vec::Vec<alloc::string::String> {
        list.iter()
            .map(|s| s.thread.lock().name.clone().unwrap())
            .collect()
    }

    #[test]
    fn insert_sorted_orders_by_wake_tick() {
        let mut list = VecDeque::new();
        insert_sorted(&mut list, sleeper(30, 31, "c"));
        insert_sorted(&mut list, sleeper(10, 31, "a"));
        insert_sorted(&mut list, sleeper(20, 31, "b"));

        assert_eq!(
            list.iter().map(|s| s.wake_tick).collect::<alloc::vec::Vec<_>>(),
            alloc::vec![10, 20, 30]
        );
    }

    #[test]
    fn insert_sorted_breaks_ties_by_priority_highest_first() {
        let mut list = VecDeque::new();
        insert_sorted(&mut list, sleeper(10, 10, "low"));
        insert_sorted(&mut list, sleeper(10, 31, "high"));
        insert_sorted(&mut list, sleeper(10, 20, "mid"));

        assert_eq!(names(&list), alloc::vec!["high", "mid", "low"]);
    }

    #[test]
    fn drain_due_pops_only_sleepers_due_by_now_in_wake_order() {
        let mut list = VecDeque::new();
        insert_sorted(&mut list, sleeper(5, 31, "first"));
        insert_sorted(&mut list, sleeper(5, 10, "second"));
        insert_sorted(&mut list, sleeper(9, 31, "not-yet"));

        let due = drain_due(&mut list, 5);

        assert_eq!(names(&due), alloc::vec!["first", "second"]);
        assert_eq!(list.len(), 1);
        assert_eq!(list.front().unwrap().wake_tick, 9);
    }

    #[test]
    fn drain_due_leaves_the_list_untouched_when_nothing_is_due() {
        let mut list = VecDeque::new();
        insert_sorted(&mut list, sleeper(100, 31, "late"));

        let due = drain_due(&mut list, 5);

        assert!(due.is_empty());
        assert_eq!(list.len(), 1);
    }
}
