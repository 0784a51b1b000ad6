//! Narrow interface onto the hardware page tables.
//!
//! The supplemental page table, frame table and fault handler are written
//! against this trait rather than `x86_64::structures::paging` directly, so
//! their logic can be exercised under `#[cfg(test)]` with an in-memory
//! [`MockAddressSpace`] instead of real hardware.

use x86_64::structures::paging::PhysFrame;
use x86_64::VirtAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmuError {
    /// The underlying allocator had no frames left for a page table.
    OutOfFrames,
    /// Attempted to map a VA that was already mapped.
    AlreadyMapped,
    /// Attempted to operate on a VA with no mapping.
    NotMapped,
}

/// An address space the VM subsystem can install/remove/inspect mappings in.
///
/// Implementors own the root page table; callers only ever reach the
/// hardware through these methods.
pub trait AddressSpace {
    fn map(&mut self, va: VirtAddr, frame: PhysFrame, writable: bool) -> Result<(), MmuError>;
    fn unmap(&mut self, va: VirtAddr) -> Result<PhysFrame, MmuError>;
    fn translate(&self, va: VirtAddr) -> Option<PhysFrame>;
    fn is_present(&self, va: VirtAddr) -> bool;
    fn is_writable(&self, va: VirtAddr) -> bool;
    fn is_dirty(&self, va: VirtAddr) -> bool;
    fn clear_dirty(&mut self, va: VirtAddr);
    /// Writes a whole page's worth of bytes directly into physical `frame`,
    /// independent of whatever VA it's mapped at (or whether it's mapped at
    /// all yet). Used to fill a frame during a lazy load before it's wired
    /// into the page table.
    fn write_frame(&mut self, frame: PhysFrame, bytes: &[u8; 4096]);
    /// Reads a whole page's worth of bytes directly out of physical `frame`.
    fn read_frame(&self, frame: PhysFrame, bytes: &mut [u8; 4096]);
}

#[cfg(not(test))]
mod x86 {
    use super::{AddressSpace, MmuError};
    use crate::PMM;
    use x86_64::structures::paging::{
        FrameDeallocator, Mapper, OffsetPageTable, Page, PageTableFlags, PhysFrame, Size4KiB,
        Translate,
    };
    use x86_64::VirtAddr;

    /// Production [`AddressSpace`], backed by a real `OffsetPageTable` and the
    /// kernel's global physical memory manager (used to allocate/free the
    /// intermediate page-table frames `map_to`/`unmap` need).
    pub struct X86AddressSpace<'a> {
        mapper: &'a mut OffsetPageTable<'static>,
        phys_mem_offset: VirtAddr,
    }

    impl<'a> X86AddressSpace<'a> {
        pub fn new(mapper: &'a mut OffsetPageTable<'static>, phys_mem_offset: VirtAddr) -> Self {
            X86AddressSpace {
                mapper,
                phys_mem_offset,
            }
        }

        fn page(va: VirtAddr) -> Page<Size4KiB> {
            Page::containing_address(va)
        }

        fn frame_va(&self, frame: PhysFrame) -> VirtAddr {
            self.phys_mem_offset + frame.start_address().as_u64()
        }
    }

    impl AddressSpace for X86AddressSpace<'_> {
        fn map(&mut self, va: VirtAddr, frame: PhysFrame, writable: bool) -> Result<(), MmuError> {
            let mut pmm = PMM.get().unwrap().lock();
            let mut flags = PageTableFlags::PRESENT
                | PageTableFlags::USER_ACCESSIBLE
                | PageTableFlags::NO_EXECUTE;
            if writable {
                flags |= PageTableFlags::WRITABLE;
            }
            unsafe {
                self.mapper
                    .map_to(Self::page(va), frame, flags, &mut *pmm)
                    .map_err(|_| MmuError::AlreadyMapped)?
                    .flush();
            }
            Ok(())
        }

        fn unmap(&mut self, va: VirtAddr) -> Result<PhysFrame, MmuError> {
            let (frame, flush) = self.mapper.unmap(Self::page(va)).map_err(|_| MmuError::NotMapped)?;
            flush.flush();
            Ok(frame)
        }

        fn translate(&self, va: VirtAddr) -> Option<PhysFrame> {
            match self.mapper.translate_addr(va) {
                Some(addr) => PhysFrame::from_start_address(addr.align_down(4096u64)).ok(),
                None => None,
            }
        }

        fn is_present(&self, va: VirtAddr) -> bool {
            self.mapper.translate_addr(va).is_some()
        }

        fn is_writable(&self, va: VirtAddr) -> bool {
            flags_of(self.mapper, va)
                .map(|f| f.contains(PageTableFlags::WRITABLE))
                .unwrap_or(false)
        }

        fn is_dirty(&self, va: VirtAddr) -> bool {
            flags_of(self.mapper, va)
                .map(|f| f.contains(PageTableFlags::DIRTY))
                .unwrap_or(false)
        }

        fn clear_dirty(&mut self, va: VirtAddr) {
            // `x86_64::Mapper` has no direct "clear dirty" helper; the dirty
            // bit is cleared by remapping with the same flags minus `DIRTY`.
            if let Some(flags) = flags_of(self.mapper, va) {
                unsafe {
                    let _ = self
                        .mapper
                        .update_flags(Self::page(va), flags & !PageTableFlags::DIRTY);
                }
            }
        }

        fn write_frame(&mut self, frame: PhysFrame, bytes: &[u8; 4096]) {
            let va = self.frame_va(frame);
            unsafe {
                core::ptr::copy_nonoverlapping(bytes.as_ptr(), va.as_mut_ptr(), 4096);
            }
        }

        fn read_frame(&self, frame: PhysFrame, bytes: &mut [u8; 4096]) {
            let va = self.frame_va(frame);
            unsafe {
                core::ptr::copy_nonoverlapping(va.as_ptr(), bytes.as_mut_ptr(), 4096);
            }
        }
    }

    fn flags_of(mapper: &OffsetPageTable<'static>, va: VirtAddr) -> Option<PageTableFlags> {
        use x86_64::structures::paging::mapper::TranslateResult;
        match mapper.translate(va) {
            TranslateResult::Mapped { flags, .. } => Some(flags),
            _ => None,
        }
    }

    // silence unused-import warning on targets where FrameDeallocator isn't
    // exercised directly by this module (kept for parity with callers that
    // deallocate frames returned by `unmap`).
    #[allow(unused_imports)]
    use FrameDeallocator as _;
}

#[cfg(not(test))]
pub use x86::X86AddressSpace;

#[cfg(test)]
pub mod tests {
    use super::{AddressSpace, MmuError};
    use std::collections::BTreeMap;
    use x86_64::structures::paging::PhysFrame;
    use x86_64::VirtAddr;

    #[derive(Clone, Copy)]
    struct Entry {
        frame: PhysFrame,
        writable: bool,
        dirty: bool,
    }

    /// In-memory stand-in for a page table, used by `vm` unit tests. Also
    /// simulates physical memory itself (keyed by frame address) so tests can
    /// exercise `write_frame`/`read_frame` without real hardware.
    #[derive(Default)]
    pub struct MockAddressSpace {
        entries: BTreeMap<u64, Entry>,
        physical: BTreeMap<u64, [u8; 4096]>,
    }

    impl MockAddressSpace {
        pub fn new() -> Self {
            MockAddressSpace {
                entries: BTreeMap::new(),
                physical: BTreeMap::new(),
            }
        }

        fn key(va: VirtAddr) -> u64 {
            va.align_down(4096u64).as_u64()
        }

        fn frame_key(frame: PhysFrame) -> u64 {
            frame.start_address().as_u64()
        }
    }

    impl AddressSpace for MockAddressSpace {
        fn map(&mut self, va: VirtAddr, frame: PhysFrame, writable: bool) -> Result<(), MmuError> {
            let key = Self::key(va);
            if self.entries.contains_key(&key) {
                return Err(MmuError::AlreadyMapped);
            }
            self.entries.insert(
                key,
                Entry {
                    frame,
                    writable,
                    dirty: false,
                },
            );
            Ok(())
        }

        fn unmap(&mut self, va: VirtAddr) -> Result<PhysFrame, MmuError> {
            self.entries
                .remove(&Self::key(va))
                .map(|e| e.frame)
                .ok_or(MmuError::NotMapped)
        }

        fn translate(&self, va: VirtAddr) -> Option<PhysFrame> {
            self.entries.get(&Self::key(va)).map(|e| e.frame)
        }

        fn is_present(&self, va: VirtAddr) -> bool {
            self.entries.contains_key(&Self::key(va))
        }

        fn is_writable(&self, va: VirtAddr) -> bool {
            self.entries.get(&Self::key(va)).map(|e| e.writable).unwrap_or(false)
        }

        fn is_dirty(&self, va: VirtAddr) -> bool {
            self.entries.get(&Self::key(va)).map(|e| e.dirty).unwrap_or(false)
        }

        fn clear_dirty(&mut self, va: VirtAddr) {
            if let Some(e) = self.entries.get_mut(&Self::key(va)) {
                e.dirty = false;
            }
        }

        fn write_frame(&mut self, frame: PhysFrame, bytes: &[u8; 4096]) {
            self.physical.insert(Self::frame_key(frame), *bytes);
        }

        fn read_frame(&self, frame: PhysFrame, bytes: &mut [u8; 4096]) {
            match self.physical.get(&Self::frame_key(frame)) {
                Some(page) => bytes.copy_from_slice(page),
                None => bytes.fill(0),
            }
        }
    }

    impl MockAddressSpace {
        /// Test-only: simulate the CPU setting the dirty bit on a write fault.
        pub fn mark_dirty(&mut self, va: VirtAddr) {
            if let Some(e) = self.entries.get_mut(&Self::key(va)) {
                e.dirty = true;
            }
        }
    }
}
