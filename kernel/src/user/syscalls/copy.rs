//! Verified user<->kernel copy protocol.
//!
//! Every user pointer crossing the syscall boundary goes through `copy_in`,
//! `copy_out`, or `copy_in_string` rather than a raw dereference, one page at
//! a time: check the VA is in user range, translate it through the calling
//! process's own page table (lazily claiming the page first if it's a
//! registered-but-not-yet-resident SPT entry), then copy up to one page's
//! worth of bytes before advancing. A null translation after a failed claim
//! fails the syscall with `CopyError::Fault`, mirroring a bad pointer taking
//! down the calling process with exit -1.

use alloc::vec::Vec;
use x86_64::VirtAddr;

use crate::vm::constants::PAGE_SIZE;
use crate::vm::frame::GlobalFrameSource;
use crate::vm::mmu::{AddressSpace, X86AddressSpace};

use super::super::UserProcess;

#[derive(Debug, PartialEq, Eq)]
pub enum CopyError {
    Fault,
    TooLong,
}

fn kernel_ptr_for(process: &mut UserProcess, va: VirtAddr) -> Result<*mut u8, CopyError> {
    if !super::check_addr(va) {
        return Err(CopyError::Fault);
    }

    let pid = process.pid;
    let phys_offset = process.mapper.phys_offset();
    let mut frames = GlobalFrameSource;
    let mut space = X86AddressSpace::new(&mut process.mapper, phys_offset);

    if !space.is_present(va) {
        process
            .spt
            .claim(va, pid, &mut frames, &mut space)
            .map_err(|_| CopyError::Fault)?;
    }

    let frame = space.translate(va).ok_or(CopyError::Fault)?;
    let page_offset = va.as_u64() % PAGE_SIZE;
    Ok((phys_offset + frame.start_address().as_u64() + page_offset).as_mut_ptr::<u8>())
}

const PAGE_SIZE_USIZE: usize = PAGE_SIZE as usize;

/// Copies `buf.len()` bytes from user address `va` into `buf`.
pub fn copy_in(process: &mut UserProcess, mut va: VirtAddr, buf: &mut [u8]) -> Result<(), CopyError> {
    let mut written = 0usize;
    while written < buf.len() {
        let page_offset = (va.as_u64() % PAGE_SIZE) as usize;
        let chunk_len = core::cmp::min(PAGE_SIZE_USIZE - page_offset, buf.len() - written);
        let kptr = kernel_ptr_for(process, va)?;
        unsafe {
            core::ptr::copy_nonoverlapping(kptr, buf[written..].as_mut_ptr(), chunk_len);
        }
        written += chunk_len;
        va += chunk_len as u64;
    }
    Ok(())
}

/// Copies `buf` out to user address `va`.
pub fn copy_out(process: &mut UserProcess, mut va: VirtAddr, buf: &[u8]) -> Result<(), CopyError> {
    let mut read = 0usize;
    while read < buf.len() {
        let page_offset = (va.as_u64() % PAGE_SIZE) as usize;
        let chunk_len = core::cmp::min(PAGE_SIZE_USIZE - page_offset, buf.len() - read);
        let kptr = kernel_ptr_for(process, va)?;
        unsafe {
            core::ptr::copy_nonoverlapping(buf[read..].as_ptr(), kptr, chunk_len);
        }
        read += chunk_len;
        va += chunk_len as u64;
    }
    Ok(())
}

/// Reads a single NUL-terminated string out of user memory, bounded by one
/// page (`PAGE_SIZE - 1` bytes, not counting the terminator).
pub fn copy_in_string(process: &mut UserProcess, mut va: VirtAddr) -> Result<Vec<u8>, CopyError> {
    let mut out = Vec::new();
    loop {
        if out.len() >= PAGE_SIZE_USIZE - 1 {
            return Err(CopyError::TooLong);
        }
        let page_offset = (va.as_u64() % PAGE_SIZE) as usize;
        let chunk_len = core::cmp::min(PAGE_SIZE_USIZE - page_offset, PAGE_SIZE_USIZE - 1 - out.len());
        let kptr = kernel_ptr_for(process, va)?;
        let chunk = unsafe { core::slice::from_raw_parts(kptr, chunk_len) };
        if let Some(nul) = chunk.iter().position(|&b| b == 0) {
            out.extend_from_slice(&chunk[..nul]);
            return Ok(out);
        }
        out.extend_from_slice(chunk);
        va += chunk_len as u64;
    }
}

/// Reads a single 8-byte word out of user memory (used to walk `argv`/`envp`
/// pointer arrays).
pub fn copy_in_u64(process: &mut UserProcess, va: VirtAddr) -> Result<u64, CopyError> {
    let mut bytes = [0u8; 8];
    copy_in(process, va, &mut bytes)?;
    Ok(u64::from_ne_bytes(bytes))
}
