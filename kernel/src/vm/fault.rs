//! Page-fault dispatch: decide whether a fault is a legitimate lazy load, a
//! stack-growth request, or a genuine access violation.
//!
//! Mirrors `vm_try_handle_fault` in
//! `examples/original_source/pintos/vm/vm.c`. Copy-on-write is out of scope,
//! so unlike the fork path this module never has to distinguish "present but
//! read-only" from "present and writable" — any present-but-faulting access
//! is always a real violation here.

use x86_64::VirtAddr;

use super::constants::{MAX_STACK_BYTES, RSP_SLACK_BYTES, USER_STACK_TOP};
use super::frame::FrameSource;
use super::mmu::AddressSpace;
use super::page::LazyAux;
use super::spt::SupplementalPageTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// The fault was resolved (a page was claimed, or the stack grew); the
    /// faulting instruction can be retried.
    Resolved,
    /// Not recoverable. The caller should terminate the process (or, for a
    /// fault with no user mapping at all, treat it as a kernel bug).
    Violation,
}

/// The subset of the CPU-provided fault context the decision tree needs.
pub struct FaultInfo {
    pub fault_addr: VirtAddr,
    /// The user-mode `rsp` at the time of the fault, read off the trap
    /// frame — not necessarily the faulting address itself.
    pub user_rsp: VirtAddr,
    pub present: bool,
    pub write: bool,
    pub user: bool,
}

/// Decides how to respond to a page fault and, if resolvable, resolves it.
pub fn handle_fault(
    spt: &mut SupplementalPageTable,
    pid: u32,
    frames: &mut dyn FrameSource,
    space: &mut dyn AddressSpace,
    info: &FaultInfo,
) -> FaultOutcome {
    if !info.user || info.fault_addr.as_u64() == 0 || info.fault_addr.as_u64() >= USER_STACK_TOP {
        return FaultOutcome::Violation;
    }

    if info.present {
        return FaultOutcome::Violation;
    }

    if spt.contains(info.fault_addr) {
        let page = spt.find(info.fault_addr).expect("just checked contains");
        if info.write && !page.writable {
            return FaultOutcome::Violation;
        }
        return match spt.claim(info.fault_addr, pid, frames, space) {
            Ok(()) => FaultOutcome::Resolved,
            Err(_) => FaultOutcome::Violation,
        };
    }

    if info.write && should_grow_stack(info.fault_addr, info.user_rsp) {
        let va = info.fault_addr.align_down(4096u64);
        let grown = spt
            .insert_uninit(va, true, LazyAux::AnonZero)
            .and_then(|()| spt.claim(va, pid, frames, space));
        return match grown {
            Ok(()) => FaultOutcome::Resolved,
            Err(_) => FaultOutcome::Violation,
        };
    }

    FaultOutcome::Violation
}

/// A miss below the lowest already-mapped stack page grows the stack only
/// if it's within [`RSP_SLACK_BYTES`] of the saved user `rsp` (covers a
/// `push`-style access that faults before `rsp` itself is updated) and the
/// resulting stack is no larger than [`MAX_STACK_BYTES`].
fn should_grow_stack(fault_addr: VirtAddr, user_rsp: VirtAddr) -> bool {
    if fault_addr.as_u64() >= USER_STACK_TOP {
        return false;
    }
    let grown_size = USER_STACK_TOP - fault_addr.align_down(4096u64).as_u64();
    if grown_size > MAX_STACK_BYTES {
        return false;
    }
    user_rsp.as_u64() != 0 && fault_addr.as_u64() + RSP_SLACK_BYTES >= user_rsp.as_u64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::frame::tests::FakeFrameSource;
    use crate::vm::mmu::tests::MockAddressSpace;

    fn info(fault_addr: u64, user_rsp: u64, present: bool, write: bool, user: bool) -> FaultInfo {
        FaultInfo {
            fault_addr: VirtAddr::new(fault_addr),
            user_rsp: VirtAddr::new(user_rsp),
            present,
            write,
            user,
        }
    }

    #[test]
    fn claims_a_registered_uninit_page_on_miss() {
        let mut spt = SupplementalPageTable::new();
        let mut frames = FakeFrameSource::new();
        let mut space = MockAddressSpace::new();
        let va = 0x4000_0000u64;
        spt.insert_uninit(VirtAddr::new(va), true, LazyAux::AnonZero)
            .unwrap();

        let outcome = handle_fault(
            &mut spt,
            1,
            &mut frames,
            &mut space,
            &info(va, USER_STACK_TOP - 0x1000, false, true, true),
        );
        assert_eq!(outcome, FaultOutcome::Resolved);
        assert!(space.is_present(VirtAddr::new(va)));
    }

    #[test]
    fn writing_a_read_only_registered_page_is_a_violation() {
        let mut spt = SupplementalPageTable::new();
        let mut frames = FakeFrameSource::new();
        let mut space = MockAddressSpace::new();
        let va = 0x4000_0000u64;
        spt.insert_uninit(VirtAddr::new(va), false, LazyAux::AnonZero)
            .unwrap();

        let outcome = handle_fault(
            &mut spt,
            1,
            &mut frames,
            &mut space,
            &info(va, USER_STACK_TOP - 0x1000, false, true, true),
        );
        assert_eq!(outcome, FaultOutcome::Violation);
    }

    #[test]
    fn present_but_faulting_is_always_a_violation() {
        let mut spt = SupplementalPageTable::new();
        let mut frames = FakeFrameSource::new();
        let mut space = MockAddressSpace::new();
        let outcome = handle_fault(
            &mut spt,
            1,
            &mut frames,
            &mut space,
            &info(0x4000_0000, 0x4000_1000, true, true, true),
        );
        assert_eq!(outcome, FaultOutcome::Violation);
    }

    #[test]
    fn kernel_mode_fault_is_a_violation() {
        let mut spt = SupplementalPageTable::new();
        let mut frames = FakeFrameSource::new();
        let mut space = MockAddressSpace::new();
        let outcome = handle_fault(
            &mut spt,
            1,
            &mut frames,
            &mut space,
            &info(0x4000_0000, 0x4000_1000, false, false, false),
        );
        assert_eq!(outcome, FaultOutcome::Violation);
    }

    #[test]
    fn a_miss_just_below_rsp_grows_the_stack() {
        let mut spt = SupplementalPageTable::new();
        let mut frames = FakeFrameSource::new();
        let mut space = MockAddressSpace::new();
        let rsp = USER_STACK_TOP - 0x1000;
        let fault_addr = rsp - 8;

        let outcome = handle_fault(
            &mut spt,
            1,
            &mut frames,
            &mut space,
            &info(fault_addr, rsp, false, true, true),
        );
        assert_eq!(outcome, FaultOutcome::Resolved);
        assert!(spt.contains(VirtAddr::new(fault_addr)));
    }

    #[test]
    fn a_miss_far_below_rsp_is_a_violation() {
        let mut spt = SupplementalPageTable::new();
        let mut frames = FakeFrameSource::new();
        let mut space = MockAddressSpace::new();
        let rsp = USER_STACK_TOP - 0x1000;
        let fault_addr = rsp - 0x10_0000;

        let outcome = handle_fault(
            &mut spt,
            1,
            &mut frames,
            &mut space,
            &info(fault_addr, rsp, false, true, true),
        );
        assert_eq!(outcome, FaultOutcome::Violation);
    }

    #[test]
    fn growth_beyond_max_stack_bytes_is_rejected() {
        let mut spt = SupplementalPageTable::new();
        let mut frames = FakeFrameSource::new();
        let mut space = MockAddressSpace::new();
        let fault_addr = USER_STACK_TOP - MAX_STACK_BYTES - 0x1000;

        let outcome = handle_fault(
            &mut spt,
            1,
            &mut frames,
            &mut space,
            &info(fault_addr, fault_addr, false, true, true),
        );
        assert_eq!(outcome, FaultOutcome::Violation);
    }
}
