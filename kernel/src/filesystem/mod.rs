use alloc::sync::Arc;
use alloc::{vec, vec::Vec};
use spin::Mutex;
use vfs::{Filesystem, FilesystemError, Inode};

use crate::VFS;

pub mod devfs;
pub mod initrd;
pub mod ramdisk;
pub mod vfs;

/// Serializes every operation that can observe or mutate file contents
/// (reads, writes, the open/close pair mmap and exec rely on). Pintos keeps a
/// single coarse `filesys_lock` rather than per-inode locks; kept here for
/// the same reason: none of the filesystems backing this kernel are
/// reentrant, and the VM subsystem needs a lock it can hold across a whole
/// lazy-load or writeback, not just a single call.
pub static FS_LOCK: Mutex<()> = Mutex::new(());

/// Convenience function to read the entirety of a file
pub fn read(path: &str) -> Result<Vec<u8>, FilesystemError> {
    let _guard = FS_LOCK.lock();
    let vfs = VFS.get().unwrap();
    let inode = vfs.traverse_fs(vfs.root.clone(), path)?;
    let mut buffer = vec![0; inode.size];

    vfs.open(inode.clone())?;
    vfs.read(inode.clone(), 0, buffer.as_mut_slice())?;
    vfs.close(inode.clone())?;

    Ok(buffer)
}

/// Looks a path up again without reading it, for callers (fork, mmap) that
/// need their own independent open/offset on a file that's already open
/// elsewhere. Caller is expected to already hold [`FS_LOCK`].
pub fn reopen(path: &str) -> Result<Arc<Inode>, FilesystemError> {
    let vfs = VFS.get().unwrap();
    let inode = vfs.traverse_fs(vfs.root.clone(), path)?;
    vfs.open(inode.clone())?;
    Ok(inode)
}

pub fn length(inode: &Arc<Inode>) -> usize {
    inode.size
}

/// Closes a file handle opened via [`reopen`]. Caller must hold [`FS_LOCK`].
pub fn close(inode: Arc<Inode>) -> Result<(), FilesystemError> {
    VFS.get().unwrap().close(inode)
}

/// Raw VFS read at `offset` into an already-open inode, for the VM
/// subsystem's lazy page loading. Caller must hold [`FS_LOCK`].
pub fn vfs_read(inode: Arc<Inode>, offset: u64, buffer: &mut [u8]) -> Result<usize, FilesystemError> {
    VFS.get().unwrap().read(inode, offset, buffer)
}

/// Raw VFS write at `offset` into an already-open inode, for mmap writeback.
/// Caller must hold [`FS_LOCK`].
pub fn vfs_write(inode: Arc<Inode>, offset: u64, buffer: &[u8]) -> Result<usize, FilesystemError> {
    VFS.get().unwrap().write(inode, offset, buffer)
}
