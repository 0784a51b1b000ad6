//! A single supplemental page table entry and its per-type swap/destroy
//! behavior, matching `struct page` + `struct page_operations` from
//! `examples/original_source/pintos/include/vm/vm.h`. Rather than a vtable of
//! function pointers, dispatch is a match on [`PageKind`] — the Rust-idiomatic
//! shape for a closed set of variants.

use alloc::sync::Arc;
use lazy_static::lazy_static;
use x86_64::structures::paging::{PhysFrame, Size4KiB};
use x86_64::VirtAddr;

use crate::filesystem::vfs::Inode;
use crate::filesystem::{self, FS_LOCK};

use super::frame;
use super::mmu::AddressSpace;
use super::swap::{BlockDevice, SwapBitmap};
use super::VmError;

/// What a not-yet-resident page will become once it's first touched.
#[derive(Clone)]
pub enum LazyAux {
    /// Zero-filled anonymous page (the default when no initializer is given).
    AnonZero,
    /// Loaded from `read_bytes` bytes of `inode` at `offset`, zero-padded to
    /// a full page, then treated as an ordinary anonymous page from then on
    /// — writes never go back to `inode`. Used for lazily-loaded ELF
    /// segments: `type_name()` already reports `"anon"` while the page is
    /// still UNINIT, matching a loader's segment always being ANON-typed
    /// even before its first touch.
    AnonFromFile {
        inode: Arc<Inode>,
        offset: u64,
        read_bytes: u32,
    },
    /// Backed by `read_bytes` bytes of `inode` at `offset`, zero-padded to a
    /// full page, and remaining tied to `inode` once resident — written back
    /// to it on eviction/munmap. Used for mmap regions.
    File {
        inode: Arc<Inode>,
        offset: u64,
        read_bytes: u32,
    },
}

pub struct AnonPage {
    pub swap_slot: Option<u64>,
}

pub struct FilePage {
    pub inode: Arc<Inode>,
    pub offset: u64,
    pub read_bytes: u32,
}

pub enum PageKind {
    Uninit(LazyAux),
    Anon(AnonPage),
    File(FilePage),
}

impl PageKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            PageKind::Uninit(_) => "uninit",
            PageKind::Anon(_) => "anon",
            PageKind::File(_) => "file",
        }
    }
}

pub struct Page {
    pub va: VirtAddr,
    pub writable: bool,
    pub frame: Option<PhysFrame<Size4KiB>>,
    pub kind: PageKind,
}

impl Page {
    pub fn new_uninit(va: VirtAddr, writable: bool, aux: LazyAux) -> Page {
        Page {
            va,
            writable,
            frame: None,
            kind: PageKind::Uninit(aux),
        }
    }

    /// Fills a freshly allocated frame according to the page's current kind.
    /// Called once, the first time a page transitions from UNINIT to
    /// resident (`vm_do_claim_page` -> `swap_in`), and again whenever a
    /// swapped-out/evicted page is brought back in.
    pub fn swap_in(&mut self, frame_bytes: &mut [u8]) -> Result<(), VmError> {
        match &self.kind {
            PageKind::Uninit(aux) => {
                let aux = aux.clone();
                match aux {
                    LazyAux::AnonZero => {
                        frame_bytes.fill(0);
                        self.kind = PageKind::Anon(AnonPage { swap_slot: None });
                    }
                    LazyAux::AnonFromFile {
                        inode,
                        offset,
                        read_bytes,
                    } => {
                        load_file_bytes(&inode, offset, read_bytes, frame_bytes)?;
                        self.kind = PageKind::Anon(AnonPage { swap_slot: None });
                    }
                    LazyAux::File {
                        inode,
                        offset,
                        read_bytes,
                    } => {
                        load_file_bytes(&inode, offset, read_bytes, frame_bytes)?;
                        self.kind = PageKind::File(FilePage {
                            inode,
                            offset,
                            read_bytes,
                        });
                    }
                }
                Ok(())
            }
            PageKind::Anon(anon) => {
                // By analogy with the stubbed-out original: zero-fill if this
                // page was never actually written to swap, otherwise pull its
                // sectors back in.
                match anon.swap_slot {
                    None => frame_bytes.fill(0),
                    Some(slot) => swap_device().1.read_slot(swap_device().0, slot, frame_bytes),
                }
                Ok(())
            }
            PageKind::File(file) => {
                let (inode, offset, read_bytes) =
                    (file.inode.clone(), file.offset, file.read_bytes);
                load_file_bytes(&inode, offset, read_bytes, frame_bytes)
            }
        }
    }

    /// Evicts a resident page, writing it back if needed. `dirty` must be
    /// read from the frame's *owner* address space, not necessarily the
    /// caller's (see `file_backed_swap_out` in the original: it checks
    /// `fr->pml4`, the page's owner, not the current thread).
    pub fn swap_out(&mut self, frame_bytes: &[u8], dirty: bool) -> Result<(), VmError> {
        match &mut self.kind {
            PageKind::Uninit(_) => Ok(()),
            PageKind::Anon(anon) => {
                let slot = match anon.swap_slot {
                    Some(slot) => slot,
                    None => {
                        let slot = swap_bitmap().alloc_slot()?;
                        anon.swap_slot = Some(slot);
                        slot
                    }
                };
                swap_device().1.write_slot(swap_device().0, slot, frame_bytes);
                Ok(())
            }
            PageKind::File(file) => {
                if dirty {
                    write_file_bytes(&file.inode, file.offset, file.read_bytes, frame_bytes)?;
                }
                Ok(())
            }
        }
    }

    /// Releases any per-type resources and frees the resident frame (if any)
    /// through the global allocator. Never call type-specific cleanup
    /// anywhere but here — pages are destroyed from several call sites
    /// (eviction, munmap, a failed lazy load, process exit) and they must
    /// all share this path.
    pub fn destroy(&mut self) {
        self.destroy_with(&mut frame::GlobalFrameSource);
    }

    /// Same as [`Page::destroy`], but frees the frame through an injected
    /// [`FrameSource`](super::frame::FrameSource) instead of the global
    /// allocator, so `spt`'s kill/fork-failure paths stay testable.
    pub fn destroy_with(&mut self, frames: &mut dyn super::frame::FrameSource) {
        match &mut self.kind {
            PageKind::Uninit(_) => {}
            PageKind::Anon(anon) => {
                if let Some(slot) = anon.swap_slot.take() {
                    swap_bitmap().free_slot(slot);
                }
            }
            PageKind::File(_) => {
                // The file handle is owned by the mmap region, not the page;
                // closed once by `do_munmap`, not here.
            }
        }
        if let Some(frame) = self.frame.take() {
            frames.release(frame);
            frames.free(frame);
        }
    }

    /// Unmaps this page from `space` without freeing the frame, and detaches
    /// ownership bookkeeping. Used when a frame is being handed off rather
    /// than freed (not currently exercised, since eviction policy is out of
    /// scope, but kept as the seam `swap_out` callers would use).
    pub fn detach(&mut self, space: &mut dyn AddressSpace) {
        if space.is_present(self.va) {
            let _ = space.unmap(self.va);
        }
        if let Some(frame) = self.frame.take() {
            frame::release(frame);
        }
    }
}

fn load_file_bytes(
    inode: &Arc<Inode>,
    offset: u64,
    read_bytes: u32,
    frame_bytes: &mut [u8],
) -> Result<(), VmError> {
    let _guard = FS_LOCK.lock();
    let read_bytes = read_bytes as usize;
    let got = filesystem::vfs_read(inode.clone(), offset, &mut frame_bytes[..read_bytes])
        .map_err(|_| VmError::ShortRead)?;
    if got != read_bytes {
        return Err(VmError::ShortRead);
    }
    frame_bytes[read_bytes..].fill(0);
    Ok(())
}

fn write_file_bytes(
    inode: &Arc<Inode>,
    offset: u64,
    read_bytes: u32,
    frame_bytes: &[u8],
) -> Result<(), VmError> {
    let _guard = FS_LOCK.lock();
    filesystem::vfs_write(inode.clone(), offset, &frame_bytes[..read_bytes as usize])
        .map_err(|_| VmError::ShortRead)?;
    Ok(())
}

// Single global swap device + bitmap, sized generously for a teaching
// kernel. Real admission control (growing the device, evicting instead of
// failing) is out of scope.
lazy_static! {
    static ref SWAP_BITMAP: SwapBitmap = SwapBitmap::new(256);
    static ref SWAP_DEVICE: super::swap::NullBlockDevice =
        super::swap::NullBlockDevice::new(256 * super::constants::SECTORS_PER_PAGE);
}

fn swap_bitmap() -> &'static SwapBitmap {
    &SWAP_BITMAP
}

fn swap_device() -> (&'static dyn BlockDevice, &'static SwapBitmap) {
    (&*SWAP_DEVICE, &SWAP_BITMAP)
}
