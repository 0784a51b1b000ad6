//! User-process virtual memory: lazily-loaded, swap- and file-backed pages,
//! the supplemental page table, stack growth and mmap.
//!
//! Grounded throughout in `examples/original_source/pintos/vm/{vm,anon,file}.c`
//! and their headers. The hardware page table is reached only through
//! [`mmu::AddressSpace`], which is what lets every module here carry its own
//! `#[cfg(test)]` suite.

pub mod constants;
pub mod fault;
pub mod frame;
pub mod mmap;
pub mod mmu;
pub mod page;
pub mod spt;
pub mod swap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// A page was already registered at that VA.
    DuplicateMapping,
    /// No page is registered at that VA.
    NotFound,
    /// The underlying frame allocator/page-table allocator is out of memory.
    OutOfMemory,
    /// A file-backed lazy load came up short (truncated file).
    ShortRead,
    /// The swap device has no free slots (no admission control: the caller
    /// is expected to treat this as fatal, matching the original kernel).
    SwapFull,
    /// The faulting access violates the page's permissions or address-space
    /// bounds and must be reported to the process as a fault.
    AccessViolation,
    /// A filesystem operation needed to establish or duplicate a page's
    /// backing file failed (reopen, open).
    Io,
}
