//! Physical frame bookkeeping for the VM subsystem.
//!
//! `PhysicalMemoryManager` (see `crate::memory`) is the raw free-list; this
//! module layers an owner-tracking table on top of it, matching the `struct
//! frame { kva, page }` model from the original VM design: every resident
//! frame remembers which address space and VA it currently backs, so an
//! eviction path can locate (and clear) the right PTE instead of the
//! current thread's.
//!
//! [`FrameSource`] is the seam the rest of `vm` allocates/frees/claims
//! frames through, so [`spt`](super::spt) can be unit-tested against a fake
//! allocator instead of the global, boot-time-only [`PMM`](crate::PMM).

use alloc::collections::btree_map::BTreeMap;
use spin::Mutex;
use x86_64::structures::paging::{FrameAllocator, FrameDeallocator, PhysFrame, Size4KiB};
use x86_64::VirtAddr;

use crate::PMM;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameOwner {
    pub pid: u32,
    pub va: VirtAddr,
}

/// Allocates and tracks ownership of physical frames. Implementors don't
/// need to be `Send`/`Sync` themselves — the production implementation gets
/// that from the global statics it wraps.
pub trait FrameSource {
    fn alloc(&mut self) -> Option<PhysFrame<Size4KiB>>;
    /// Panics (via `debug_assert`) if the frame still has a registered owner.
    fn free(&mut self, frame: PhysFrame<Size4KiB>);
    fn claim(&mut self, frame: PhysFrame<Size4KiB>, pid: u32, va: VirtAddr);
    fn release(&mut self, frame: PhysFrame<Size4KiB>);
    fn owner_of(&self, frame: PhysFrame<Size4KiB>) -> Option<FrameOwner>;
}

static OWNERS: Mutex<BTreeMap<u64, FrameOwner>> = Mutex::new(BTreeMap::new());

fn key(frame: PhysFrame) -> u64 {
    frame.start_address().as_u64()
}

/// Allocates a fresh, unowned physical frame from the global allocator.
pub fn get_frame() -> Option<PhysFrame<Size4KiB>> {
    PMM.get().unwrap().lock().allocate_frame()
}

/// Returns a frame to the global free list. Panics if still claimed by an
/// owner, since that would indicate a PTE is still pointing at it.
pub fn free_frame(frame: PhysFrame<Size4KiB>) {
    debug_assert!(
        !OWNERS.lock().contains_key(&key(frame)),
        "freed a frame while it still had an owner registered"
    );
    unsafe { PMM.get().unwrap().lock().deallocate_frame(frame) };
}

/// Records that `frame` now backs `va` in process `pid`'s address space.
pub fn claim(frame: PhysFrame<Size4KiB>, pid: u32, va: VirtAddr) {
    OWNERS.lock().insert(key(frame), FrameOwner { pid, va });
}

/// Clears ownership, e.g. once a page is unmapped or swapped out.
pub fn release(frame: PhysFrame<Size4KiB>) {
    OWNERS.lock().remove(&key(frame));
}

pub fn owner_of(frame: PhysFrame<Size4KiB>) -> Option<FrameOwner> {
    OWNERS.lock().get(&key(frame)).copied()
}

/// [`FrameSource`] over the kernel's real, global physical memory manager.
pub struct GlobalFrameSource;

impl FrameSource for GlobalFrameSource {
    fn alloc(&mut self) -> Option<PhysFrame<Size4KiB>> {
        get_frame()
    }

    fn free(&mut self, frame: PhysFrame<Size4KiB>) {
        free_frame(frame)
    }

    fn claim(&mut self, frame: PhysFrame<Size4KiB>, pid: u32, va: VirtAddr) {
        claim(frame, pid, va)
    }

    fn release(&mut self, frame: PhysFrame<Size4KiB>) {
        release(frame)
    }

    fn owner_of(&self, frame: PhysFrame<Size4KiB>) -> Option<FrameOwner> {
        owner_of(frame)
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use x86_64::PhysAddr;

    fn frame(addr: u64) -> PhysFrame<Size4KiB> {
        PhysFrame::containing_address(PhysAddr::new(addr))
    }

    #[test]
    fn claim_then_release_round_trips() {
        let f = frame(0x10_0000);
        claim(f, 7, VirtAddr::new(0x1000));
        assert_eq!(
            owner_of(f),
            Some(FrameOwner {
                pid: 7,
                va: VirtAddr::new(0x1000)
            })
        );
        release(f);
        assert_eq!(owner_of(f), None);
    }

    #[test]
    fn unowned_frame_has_no_owner() {
        let f = frame(0x20_0000);
        assert_eq!(owner_of(f), None);
    }

    /// In-memory [`FrameSource`], for tests that exercise `spt`/`fault`
    /// claim logic without a booted kernel behind [`crate::PMM`]. Frames are
    /// synthesized from a monotonically increasing counter rather than
    /// backed by real memory; `page.rs`'s swap-in/out paths only ever write
    /// through the byte buffer passed to them, never through the frame
    /// address itself, so this is sound to use with `MockAddressSpace`.
    pub struct FakeFrameSource {
        next: u64,
        free_list: alloc::vec::Vec<PhysFrame<Size4KiB>>,
        owners: BTreeMap<u64, FrameOwner>,
    }

    impl FakeFrameSource {
        pub fn new() -> Self {
            Self::starting_at(0x1000)
        }

        /// Like [`FakeFrameSource::new`], but starts numbering frames from
        /// `start`. Lets tests with two independent fake sources (e.g. a
        /// parent and child address space during a simulated fork) avoid
        /// "allocating" the same frame address twice, which a single real
        /// allocator would never do.
        pub fn starting_at(start: u64) -> Self {
            FakeFrameSource {
                next: start,
                free_list: alloc::vec::Vec::new(),
                owners: BTreeMap::new(),
            }
        }
    }

    impl FrameSource for FakeFrameSource {
        fn alloc(&mut self) -> Option<PhysFrame<Size4KiB>> {
            if let Some(f) = self.free_list.pop() {
                return Some(f);
            }
            let f = frame(self.next);
            self.next += 0x1000;
            Some(f)
        }

        fn free(&mut self, frame: PhysFrame<Size4KiB>) {
            debug_assert!(!self.owners.contains_key(&key(frame)));
            self.free_list.push(frame);
        }

        fn claim(&mut self, frame: PhysFrame<Size4KiB>, pid: u32, va: VirtAddr) {
            self.owners.insert(key(frame), FrameOwner { pid, va });
        }

        fn release(&mut self, frame: PhysFrame<Size4KiB>) {
            self.owners.remove(&key(frame));
        }

        fn owner_of(&self, frame: PhysFrame<Size4KiB>) -> Option<FrameOwner> {
            self.owners.get(&key(frame)).copied()
        }
    }
}
