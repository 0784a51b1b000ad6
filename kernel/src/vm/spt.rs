//! Per-process supplemental page table.
//!
//! Grounded in `vm_alloc_page_with_initializer`, `vm_do_claim_page`,
//! `supplemental_page_table_kill` and `supplemental_page_table_copy` from
//! `examples/original_source/pintos/vm/vm.c`. Frame allocation and PTE
//! installation both go through trait objects ([`FrameSource`],
//! [`AddressSpace`]) so `claim`/`kill`/`copy_into` can run under
//! `#[cfg(test)]` without real hardware.

use alloc::collections::btree_map::BTreeMap;
use x86_64::VirtAddr;

use crate::filesystem::FS_LOCK;
use crate::VFS;

use super::frame::FrameSource;
use super::mmu::AddressSpace;
use super::page::{AnonPage, LazyAux, Page, PageKind};
use super::VmError;

pub struct SupplementalPageTable {
    pages: BTreeMap<u64, Page>,
}

impl SupplementalPageTable {
    pub fn new() -> Self {
        SupplementalPageTable {
            pages: BTreeMap::new(),
        }
    }

    fn key(va: VirtAddr) -> u64 {
        va.align_down(4096u64).as_u64()
    }

    pub fn find(&self, va: VirtAddr) -> Option<&Page> {
        self.pages.get(&Self::key(va))
    }

    pub fn find_mut(&mut self, va: VirtAddr) -> Option<&mut Page> {
        self.pages.get_mut(&Self::key(va))
    }

    pub fn contains(&self, va: VirtAddr) -> bool {
        self.pages.contains_key(&Self::key(va))
    }

    /// Registers a not-yet-resident page. Mirrors
    /// `vm_alloc_page_with_initializer`: nothing is allocated or mapped yet,
    /// only the intent to lazily load it.
    pub fn insert_uninit(
        &mut self,
        va: VirtAddr,
        writable: bool,
        aux: LazyAux,
    ) -> Result<(), VmError> {
        let key = Self::key(va);
        if self.pages.contains_key(&key) {
            return Err(VmError::DuplicateMapping);
        }
        self.pages
            .insert(key, Page::new_uninit(va.align_down(4096u64), writable, aux));
        Ok(())
    }

    /// Used by munmap to drop a single page's registration up front, before
    /// the caller unmaps/writes it back itself.
    pub fn remove(&mut self, va: VirtAddr) -> Option<Page> {
        self.pages.remove(&Self::key(va))
    }

    /// Brings a registered page into residence: allocates a frame, lets the
    /// page fill it (zero fill, file load, or swap-in), installs the PTE and
    /// records frame ownership. A no-op if the page is already resident.
    /// Mirrors `vm_do_claim_page`.
    pub fn claim(
        &mut self,
        va: VirtAddr,
        pid: u32,
        frames: &mut dyn FrameSource,
        space: &mut dyn AddressSpace,
    ) -> Result<(), VmError> {
        let key = Self::key(va);
        let page = self.pages.get_mut(&key).ok_or(VmError::NotFound)?;
        if page.frame.is_some() {
            return Ok(());
        }

        let frame = frames.alloc().ok_or(VmError::OutOfMemory)?;
        let mut buf = [0u8; 4096];
        if let Err(e) = page.swap_in(&mut buf) {
            frames.free(frame);
            return Err(e);
        }
        space.write_frame(frame, &buf);

        if space.map(page.va, frame, page.writable).is_err() {
            frames.free(frame);
            return Err(VmError::OutOfMemory);
        }

        frames.claim(frame, pid, page.va);
        page.frame = Some(frame);
        Ok(())
    }

    /// Drops every entry, unmapping and freeing any resident frames. Called
    /// from process exit and from a failed/re-executed `execve`. Mirrors
    /// `supplemental_page_table_kill`.
    pub fn kill(&mut self, frames: &mut dyn FrameSource, space: &mut dyn AddressSpace) {
        for (_, mut page) in core::mem::take(&mut self.pages) {
            if page.frame.is_some() && space.is_present(page.va) {
                let _ = space.unmap(page.va);
            }
            page.destroy_with(frames);
        }
    }

    /// Copies every entry into `dst` for fork. UNINIT entries are
    /// re-registered with the same initializer (cheap: the initializer for a
    /// file-backed lazy load just reopens the same file at the same offset,
    /// and an anon-zero initializer carries no state). Resident pages —
    /// whether ANON or FILE-backed — are copied byte-for-byte into a fresh
    /// frame in the child and become privately anonymous there, matching the
    /// original's "the child's mapping diverges from the file as soon as it
    /// writes" semantics for pages already paged in at fork time. Mirrors
    /// `supplemental_page_table_copy`.
    pub fn copy_into(
        &self,
        dst: &mut SupplementalPageTable,
        child_pid: u32,
        src_space: &dyn AddressSpace,
        dst_frames: &mut dyn FrameSource,
        dst_space: &mut dyn AddressSpace,
    ) -> Result<(), VmError> {
        for page in self.pages.values() {
            match &page.kind {
                PageKind::Uninit(LazyAux::File {
                    inode,
                    offset,
                    read_bytes,
                }) => {
                    // FILE aux stays tied to the backing inode for the rest
                    // of its life, so the child needs its own independent
                    // handle rather than sharing the parent's -- obtained by
                    // reopening through the VFS, under FS_LOCK like every
                    // other open.
                    let new_inode = {
                        let _guard = FS_LOCK.lock();
                        let vfs = VFS.get().unwrap();
                        vfs.open(inode.clone()).map_err(|_| VmError::Io)?;
                        inode.clone()
                    };
                    dst.insert_uninit(
                        page.va,
                        page.writable,
                        LazyAux::File {
                            inode: new_inode,
                            offset: *offset,
                            read_bytes: *read_bytes,
                        },
                    )?;
                }
                PageKind::Uninit(aux) => {
                    dst.insert_uninit(page.va, page.writable, aux.clone())?;
                }
                _ => {
                    let mut buf = [0u8; 4096];
                    if let Some(frame) = page.frame {
                        src_space.read_frame(frame, &mut buf);
                    }
                    let new_frame = dst_frames.alloc().ok_or(VmError::OutOfMemory)?;
                    dst_space.write_frame(new_frame, &buf);
                    if dst_space.map(page.va, new_frame, page.writable).is_err() {
                        dst_frames.free(new_frame);
                        return Err(VmError::OutOfMemory);
                    }
                    dst_frames.claim(new_frame, child_pid, page.va);
                    dst.pages.insert(
                        Self::key(page.va),
                        Page {
                            va: page.va,
                            writable: page.writable,
                            frame: Some(new_frame),
                            kind: PageKind::Anon(AnonPage { swap_slot: None }),
                        },
                    );
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::frame::tests::FakeFrameSource;
    use crate::vm::mmu::tests::MockAddressSpace;
    use crate::vm::page::LazyAux;

    #[test]
    fn claiming_an_uninit_zero_page_maps_it_and_zero_fills() {
        let mut spt = SupplementalPageTable::new();
        let mut frames = FakeFrameSource::new();
        let mut space = MockAddressSpace::new();
        let va = VirtAddr::new(0x4000_0000);

        spt.insert_uninit(va, true, LazyAux::AnonZero).unwrap();
        spt.claim(va, 1, &mut frames, &mut space).unwrap();

        assert!(space.is_present(va));
        assert!(matches!(spt.find(va).unwrap().kind, PageKind::Anon(_)));
    }

    #[test]
    fn claiming_twice_is_a_no_op() {
        let mut spt = SupplementalPageTable::new();
        let mut frames = FakeFrameSource::new();
        let mut space = MockAddressSpace::new();
        let va = VirtAddr::new(0x4000_0000);

        spt.insert_uninit(va, true, LazyAux::AnonZero).unwrap();
        spt.claim(va, 1, &mut frames, &mut space).unwrap();
        let frame_first = spt.find(va).unwrap().frame;
        spt.claim(va, 1, &mut frames, &mut space).unwrap();
        assert_eq!(spt.find(va).unwrap().frame, frame_first);
    }

    #[test]
    fn claiming_an_unregistered_page_fails() {
        let mut spt = SupplementalPageTable::new();
        let mut frames = FakeFrameSource::new();
        let mut space = MockAddressSpace::new();
        assert_eq!(
            spt.claim(VirtAddr::new(0x1000), 1, &mut frames, &mut space),
            Err(VmError::NotFound)
        );
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut spt = SupplementalPageTable::new();
        let va = VirtAddr::new(0x4000_0000);
        spt.insert_uninit(va, true, LazyAux::AnonZero).unwrap();
        assert_eq!(
            spt.insert_uninit(va, true, LazyAux::AnonZero),
            Err(VmError::DuplicateMapping)
        );
    }

    #[test]
    fn kill_unmaps_and_frees_resident_pages() {
        let mut spt = SupplementalPageTable::new();
        let mut frames = FakeFrameSource::new();
        let mut space = MockAddressSpace::new();
        let va = VirtAddr::new(0x4000_0000);

        spt.insert_uninit(va, true, LazyAux::AnonZero).unwrap();
        spt.claim(va, 1, &mut frames, &mut space).unwrap();
        spt.kill(&mut frames, &mut space);

        assert!(!space.is_present(va));
    }

    #[test]
    fn copy_into_reregisters_uninit_pages_independently() {
        let mut parent = SupplementalPageTable::new();
        let mut child = SupplementalPageTable::new();
        let va = VirtAddr::new(0x4000_0000);
        parent.insert_uninit(va, true, LazyAux::AnonZero).unwrap();

        let parent_space = MockAddressSpace::new();
        let mut child_frames = FakeFrameSource::new();
        let mut child_space = MockAddressSpace::new();

        parent
            .copy_into(&mut child, 2, &parent_space, &mut child_frames, &mut child_space)
            .unwrap();

        assert!(child.contains(va));
        assert!(!child_space.is_present(va));
        parent.remove(va);
        assert!(child.contains(va));
    }

    #[test]
    fn copy_into_duplicates_resident_pages_into_fresh_frames() {
        let mut parent = SupplementalPageTable::new();
        let mut child = SupplementalPageTable::new();
        let va = VirtAddr::new(0x4000_0000);
        let mut parent_frames = FakeFrameSource::new();
        let mut parent_space = MockAddressSpace::new();

        parent.insert_uninit(va, true, LazyAux::AnonZero).unwrap();
        parent.claim(va, 1, &mut parent_frames, &mut parent_space).unwrap();
        let parent_frame = parent.find(va).unwrap().frame.unwrap();

        let mut child_frames = FakeFrameSource::starting_at(0x8000);
        let mut child_space = MockAddressSpace::new();
        parent
            .copy_into(&mut child, 2, &parent_space, &mut child_frames, &mut child_space)
            .unwrap();

        let child_frame = child.find(va).unwrap().frame.unwrap();
        assert_ne!(parent_frame, child_frame);
        assert!(child_space.is_present(va));
    }
}
