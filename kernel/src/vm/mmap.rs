//! mmap/munmap: map a file's contents into a process's lazily-loaded pages.
//!
//! Mirrors `do_mmap`/`do_munmap` in
//! `examples/original_source/pintos/vm/file.c`. Admission is address-space
//! bookkeeping only — nothing is paged in until the first touch takes the
//! usual lazy-load path through [`super::fault`].

use alloc::sync::Arc;

use x86_64::VirtAddr;

use crate::filesystem::vfs::Inode;
use crate::filesystem::{self, FS_LOCK};

use super::frame::FrameSource;
use super::mmu::AddressSpace;
use super::page::{LazyAux, PageKind};
use super::spt::SupplementalPageTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmapError {
    ZeroLength,
    NotPageAligned,
    Overlaps,
    Io,
}

/// A single live mmap mapping, tracked so `munmap` (or process exit) can
/// find and unwind it. One file handle is opened per region and closed
/// exactly once, by [`do_munmap`] — never by the individual pages, which
/// only know how to read and write bytes at an offset.
pub struct MmapRegion {
    pub base: VirtAddr,
    pub page_count: usize,
    pub inode: Arc<Inode>,
    closed: bool,
}

impl MmapRegion {
    pub fn end(&self) -> VirtAddr {
        self.base + (self.page_count as u64) * 4096
    }
}

/// Registers `length` bytes of `inode` as UNINIT FILE pages starting at
/// `addr`, offset `offset` into the file. `inode` must already be an
/// independent handle the caller opened for this mapping (the syscall layer
/// reopens the mmap'd fd's inode under [`FS_LOCK`] before calling this, the
/// same way `fork`'s fd duplication does). Rejects a zero-length request,
/// misaligned `addr`/`offset`, and any overlap with an `existing` region
/// before ever touching the filesystem, matching the rejection cases the
/// original checks before opening anything; once a real file op is needed
/// (reading its length, undoing a partial registration) `do_mmap` closes the
/// handle itself on failure.
pub fn do_mmap(
    spt: &mut SupplementalPageTable,
    existing: &[MmapRegion],
    addr: VirtAddr,
    length: usize,
    offset: u64,
    inode: Arc<Inode>,
) -> Result<MmapRegion, MmapError> {
    if length == 0 {
        return Err(MmapError::ZeroLength);
    }
    if addr.as_u64() % 4096 != 0 || offset % 4096 != 0 {
        return Err(MmapError::NotPageAligned);
    }

    let page_count = (length + 4095) / 4096;
    let end = addr + (page_count as u64) * 4096;
    for region in existing {
        if addr < region.end() && region.base < end {
            return Err(MmapError::Overlaps);
        }
    }

    let _guard = FS_LOCK.lock();
    let file_len = filesystem::length(&inode) as u64;
    if file_len == 0 {
        let _ = filesystem::close(inode);
        return Err(MmapError::ZeroLength);
    }

    let mut registered = 0usize;
    for i in 0..page_count {
        let va = addr + (i as u64) * 4096;
        let page_offset = offset + (i as u64) * 4096;
        let read_bytes = if page_offset >= file_len {
            0
        } else {
            core::cmp::min(4096, file_len - page_offset) as u32
        };
        let aux = LazyAux::File {
            inode: inode.clone(),
            offset: page_offset,
            read_bytes,
        };
        if spt.insert_uninit(va, true, aux).is_err() {
            for j in 0..registered {
                spt.remove(addr + (j as u64) * 4096);
            }
            let _ = filesystem::close(inode);
            return Err(MmapError::Overlaps);
        }
        registered += 1;
    }

    Ok(MmapRegion {
        base: addr,
        page_count,
        inode,
        closed: false,
    })
}

/// Writes back any dirty FILE pages, clears their PTEs, frees their frames,
/// and closes the region's file handle exactly once. Dirtiness is read from
/// `space`, the mapping's own address space — matching `file_backed_swap_out`,
/// which checks the frame owner's page table rather than whichever thread
/// happens to be running.
pub fn do_munmap(
    spt: &mut SupplementalPageTable,
    region: &mut MmapRegion,
    frames: &mut dyn FrameSource,
    space: &mut dyn AddressSpace,
) {
    for i in 0..region.page_count {
        let va = region.base + (i as u64) * 4096;
        if let Some(mut page) = spt.remove(va) {
            if let PageKind::File(file) = &page.kind {
                if let Some(frame) = page.frame {
                    if space.is_dirty(va) {
                        let mut buf = [0u8; 4096];
                        space.read_frame(frame, &mut buf);
                        let _guard = FS_LOCK.lock();
                        let _ = filesystem::vfs_write(
                            file.inode.clone(),
                            file.offset,
                            &buf[..file.read_bytes as usize],
                        );
                        space.clear_dirty(va);
                    }
                }
            }
            if page.frame.is_some() && space.is_present(va) {
                let _ = space.unmap(va);
            }
            page.destroy_with(frames);
        }
    }
    close_region(region);
}

fn close_region(region: &mut MmapRegion) {
    if !region.closed {
        let _guard = FS_LOCK.lock();
        let _ = filesystem::close(region.inode.clone());
        region.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Anything past the geometry checks touches `inode` through `crate::VFS`,
    // which needs a booted filesystem -- exercised instead by the pure
    // geometry helpers, which are what actually decide accept/reject.

    #[test]
    fn regions_overlap_when_ranges_intersect() {
        let a = MmapRegion {
            base: VirtAddr::new(0x4000_0000),
            page_count: 2,
            inode: dummy_inode(),
            closed: true,
        };
        assert_eq!(a.end(), VirtAddr::new(0x4000_2000));
        assert!(VirtAddr::new(0x4000_1000) < a.end());
    }

    fn dummy_inode() -> Arc<Inode> {
        Arc::new(Inode {
            dev: 0,
            inode: 0,
            file_type: crate::filesystem::vfs::FileType::File,
            size: 0,
            major: None,
            minor: None,
            inner: None,
        })
    }

    #[test]
    fn zero_length_request_is_rejected_before_touching_fs() {
        // length == 0 is checked before anything touches `inode`, so this
        // doesn't need a live VFS to exercise.
        let mut spt = SupplementalPageTable::new();
        let result = do_mmap(&mut spt, &[], VirtAddr::new(0x4000_0000), 0, 0, dummy_inode());
        assert_eq!(result.err(), Some(MmapError::ZeroLength));
    }

    #[test]
    fn misaligned_address_is_rejected_before_touching_fs() {
        let mut spt = SupplementalPageTable::new();
        let result = do_mmap(
            &mut spt,
            &[],
            VirtAddr::new(0x4000_0001),
            4096,
            0,
            dummy_inode(),
        );
        assert_eq!(result.err(), Some(MmapError::NotPageAligned));
    }

    #[test]
    fn overlapping_region_is_rejected_before_touching_fs() {
        let mut spt = SupplementalPageTable::new();
        let existing = [MmapRegion {
            base: VirtAddr::new(0x4000_0000),
            page_count: 2,
            inode: dummy_inode(),
            closed: true,
        }];
        let result = do_mmap(
            &mut spt,
            &existing,
            VirtAddr::new(0x4000_1000),
            4096,
            0,
            dummy_inode(),
        );
        assert_eq!(result.err(), Some(MmapError::Overlaps));
    }
}
