mod copy;
mod execve;

use core::arch::naked_asm;

use alloc::sync::Arc;
use alloc::vec;
use copy::{copy_in, copy_in_string, copy_out};
use execve::execve_inner;
use spin::{Mutex, RwLock};
use x86_64::{VirtAddr, registers::model_specific::FsBase};

use crate::{
    CPUS, VFS,
    filesystem::{self, FS_LOCK},
    kernel_log,
    scheduler::{self, Thread, enqueue},
    user::{
        FileDescriptor, forked_entry,
        constants::{
            EBADF, EFAULT, EIO, EMFILE, ENOENT, ENOSYS, O_ACCMODE, O_RDONLY, O_RDWR, O_WRONLY,
        },
        wait_status,
    },
    vm::frame::GlobalFrameSource,
    vm::mmap::{self, MmapError},
    vm::mmu::X86AddressSpace,
};

use super::{
    ProcessTable, UserProcess,
    constants::{ARCH_SET_FS, EINVAL, ENOTTY},
};

/// Bytes moved per page while streaming `write(1, ...)` to the console.
const CONSOLE_CHUNK: usize = 4096;

pub fn get_current_thread() -> Arc<Mutex<Thread>> {
    CPUS.get()
        .unwrap()
        .get_cpu()
        .current_thread
        .as_mut()
        .unwrap()
        .clone()
}

extern "sysv64" fn get_kernel_stack() -> u64 {
    CPUS.get()
        .unwrap()
        .get_cpu()
        .current_thread
        .as_mut()
        .unwrap()
        .lock()
        .kstack_addr()
        .as_u64()
}

/// Gets the current process (for syscalls, and for the page fault handler
/// in [`crate::interrupts`])
/// # Panics
/// If there is no current process or the CPU struct isn't initialised
pub(crate) fn get_current_process() -> Arc<Mutex<UserProcess>> {
    ProcessTable::get_by_pid(
        CPUS.get()
            .unwrap()
            .get_cpu()
            .current_thread
            .as_mut()
            .unwrap()
            .lock()
            .process
            .expect("No current process"),
    )
    .expect("No current process")
}

/// Returns true if an address is in userspace.
/// Since this is a higher half kernel, userspace bits will be in the lower half.
fn check_addr(addr: VirtAddr) -> bool {
    addr.as_u64() & (1 << 63) == 0
}

/// Writes raw bytes to the debug console, the way `console::DebugCons`
/// writes a `&str` one byte at a time, just over an arbitrary byte buffer
/// instead of requiring valid UTF-8.
fn write_console_bytes(bytes: &[u8]) {
    use x86_64::instructions::port::Port;
    let mut port: Port<u8> = Port::new(0xe9);
    for &b in bytes {
        unsafe { port.write(b) };
    }
}

fn read(fd: u32, buf: u64, count: usize) -> i64 {
    debug_println!("read({}, {:#x}, {})", fd, buf, count);

    let process = get_current_process();
    let mut process = process.lock();

    if fd == 0 {
        // No stdin device wired up: behaves like a device that never has
        // input ready.
        return 0;
    }
    if fd == 1 {
        return -(EBADF as i64);
    }

    let desc_arc = match process.files.get(&fd) {
        Some(desc) => desc.clone(),
        None => return -(EBADF as i64),
    };

    let (inode, offset, flags) = {
        let desc = desc_arc.read();
        (desc.inode.clone(), desc.offset, desc.flags)
    };
    if !(flags & O_ACCMODE == O_RDWR || flags & O_ACCMODE == O_RDONLY) {
        return -(EBADF as i64);
    }

    let mut kbuf = vec![0u8; count];
    let got = match filesystem::vfs_read(inode, offset, &mut kbuf) {
        Ok(n) => n,
        Err(_) => return -(EIO as i64),
    };

    if copy_out(&mut process, VirtAddr::new(buf), &kbuf[..got]).is_err() {
        return -(EFAULT as i64);
    }

    desc_arc.write().offset += got as u64;
    got as i64
}

fn write(fd: u32, buf: u64, count: usize) -> i64 {
    debug_println!("write({}, {:#x}, {})", fd, buf, count);

    let process = get_current_process();
    let mut process = process.lock();

    if fd == 0 {
        return -(EBADF as i64);
    }

    if fd == 1 {
        let mut chunk = [0u8; CONSOLE_CHUNK];
        let mut written = 0usize;
        while written < count {
            let n = core::cmp::min(CONSOLE_CHUNK, count - written);
            if copy_in(&mut process, VirtAddr::new(buf + written as u64), &mut chunk[..n]).is_err()
            {
                return -(EFAULT as i64);
            }
            write_console_bytes(&chunk[..n]);
            written += n;
        }
        return written as i64;
    }

    let desc_arc = match process.files.get(&fd) {
        Some(desc) => desc.clone(),
        None => return -(EBADF as i64),
    };

    let (inode, offset, flags) = {
        let desc = desc_arc.read();
        (desc.inode.clone(), desc.offset, desc.flags)
    };
    if !(flags & O_ACCMODE == O_RDWR || flags & O_ACCMODE == O_WRONLY) {
        return -(EBADF as i64);
    }

    let mut kbuf = vec![0u8; count];
    if copy_in(&mut process, VirtAddr::new(buf), &mut kbuf).is_err() {
        return -(EFAULT as i64);
    }

    let written = match filesystem::vfs_write(inode, offset, &kbuf) {
        Ok(n) => n,
        Err(_) => return -(EIO as i64),
    };

    desc_arc.write().offset += written as u64;
    written as i64
}

fn open(pathname: u64, flags: u32) -> i64 {
    let process = get_current_process();
    let mut process = process.lock();

    let pathname = match copy_in_string(&mut process, VirtAddr::new(pathname)) {
        Ok(bytes) => bytes,
        Err(_) => return -(EFAULT as i64),
    };
    let pathname = match core::str::from_utf8(&pathname) {
        Ok(s) => s,
        Err(_) => return -(EINVAL as i64),
    };
    debug_println!("open({:?}, {:?})", pathname, flags);

    let vfs = VFS.get().unwrap();
    let inode = match vfs.traverse_fs(vfs.root.clone(), pathname) {
        Ok(inode) => inode,
        Err(_) => return -(ENOENT as i64),
    };
    if vfs.open(inode.clone()).is_err() {
        return -(ENOENT as i64);
    }

    let fd = match process.alloc_fd() {
        Some(fd) => fd,
        None => {
            let _ = vfs.close(inode);
            return -(EMFILE as i64);
        }
    };

    process.files.insert(
        fd,
        Arc::new(RwLock::new(FileDescriptor {
            inode,
            flags,
            offset: 0,
        })),
    );

    debug_println!("Opened to fd: {}", fd);
    fd as i64
}

fn close(fd: u32) -> i64 {
    debug_println!("close({})", fd);

    let process = get_current_process();
    let desc_arc = match process.lock().files.remove(&fd) {
        Some(desc) => desc,
        None => return -(EBADF as i64),
    };
    let inode = desc_arc.read().inode.clone();

    let _guard = FS_LOCK.lock();
    match filesystem::close(inode) {
        Ok(()) => 0,
        Err(_) => -(EIO as i64),
    }
}

/// Maps `length` bytes of `fd`, starting at file `offset`, into the calling
/// process's address space at `addr`. Admission only: no bytes are actually
/// read until the first touch takes the usual lazy-load path.
fn mmap(addr: u64, length: u64, fd: u32, offset: u64) -> i64 {
    debug_println!("mmap({:#x}, {}, fd={}, {})", addr, length, fd, offset);

    let addr = VirtAddr::new(addr);
    if !check_addr(addr) {
        return -(EFAULT as i64);
    }

    let process = get_current_process();
    let mut process = process.lock();

    let inode = match process.files.get(&fd) {
        Some(desc) => desc.read().inode.clone(),
        None => return -(EBADF as i64),
    };

    let independent = {
        let _guard = FS_LOCK.lock();
        if VFS.get().unwrap().open(inode.clone()).is_err() {
            return -(EIO as i64);
        }
        inode
    };

    match mmap::do_mmap(
        &mut process.spt,
        &process.mmaps,
        addr,
        length as usize,
        offset,
        independent,
    ) {
        Ok(region) => {
            process.mmaps.push(region);
            addr.as_u64() as i64
        }
        Err(MmapError::Io) => -(EIO as i64),
        Err(_) => -(EINVAL as i64),
    }
}

/// Unmaps the region previously mmap'd at `addr`, writing back any dirty
/// pages and closing the region's file handle.
fn munmap(addr: u64) -> i64 {
    debug_println!("munmap({:#x})", addr);

    let addr = VirtAddr::new(addr);
    let process = get_current_process();
    let mut process = process.lock();

    let idx = match process.mmaps.iter().position(|r| r.base == addr) {
        Some(idx) => idx,
        None => return -(EINVAL as i64),
    };
    let mut region = process.mmaps.remove(idx);

    let phys_offset = process.mapper.phys_offset();
    let mut frames = GlobalFrameSource;
    let mut space = X86AddressSpace::new(&mut process.mapper, phys_offset);
    mmap::do_munmap(&mut process.spt, &mut region, &mut frames, &mut space);
    0
}

fn exit(status: i32) -> ! {
    kernel_log!("process exited with code {}", status);

    let process = get_current_process();
    process.lock().exit(status);

    loop {
        scheduler::yield_execution();
    }
}

fn arch_prctl(op: u32, addr: u64) -> u64 {
    debug_println!("arch_prctl({:x}, {:x})", op, addr);
    match op {
        ARCH_SET_FS => {
            let addr = VirtAddr::new(addr);
            if !check_addr(addr) {
                return (-EFAULT) as u64;
            };

            FsBase::write(addr);
            0
        }
        _ => (-EINVAL) as u64,
    }
}

fn execve(filename: u64, argv: u64, envp: u64) -> u64 {
    match execve_inner(filename, argv, envp) {
        Err(_) => u64::MAX,
    }
}

fn brk(addr: u64) -> u64 {
    debug_println!("brk({})", addr);

    let addr = VirtAddr::new(addr);
    let process = get_current_process();
    let mut process = process.lock();

    if !check_addr(addr) || addr < process.brk_initial || addr.is_null() {
        return process.brk.as_u64();
    }

    process.grow_brk(addr).as_u64()
}

fn fork() -> i64 {
    debug_println!("fork()");
    let child_pid = match get_current_process().lock().fork() {
        Some(pid) => pid,
        None => return -1,
    };

    let thread = ProcessTable::get_by_pid(child_pid)
        .unwrap()
        .lock()
        .thread
        .clone();

    {
        let mut thread = thread.lock();
        // Clone over the top 6 elements from the kernel stack (this is essentially our "trapframe")
        let current_thread = get_current_thread();
        let current_thread = current_thread.lock();

        let src = current_thread.kstack.last_chunk::<6>().unwrap();
        thread
            .kstack
            .last_chunk_mut::<6>()
            .unwrap()
            .copy_from_slice(src);

        // For ret to work, the top element needs to be address to entry point
        *thread.kstack.iter_mut().nth_back(6).unwrap() = forked_entry as u64;
        thread.context.rsp = thread.kstack.iter().nth_back(6).unwrap() as *const u64 as u64;
    }

    enqueue(thread);

    child_pid as i64
}

/// Blocks until child `pid` has exited, reaping its `WaitStatus`. Returns
/// -1 if `pid` isn't (or is no longer) a child of the caller.
fn wait(pid: u32) -> i64 {
    debug_println!("wait({})", pid);

    let process = get_current_process();
    let wstatus = {
        let mut process = process.lock();
        match process.children.iter().position(|w| w.tid == pid) {
            Some(idx) => process.children.remove(idx),
            None => return -1,
        }
    };

    wait_status::wait_for(&wstatus) as i64
}

pub extern "sysv64" fn handle_syscall_inner(
    syscall_number: u64,
    arg0: u64,
    arg1: u64,
    arg2: u64,
    arg3: u64,
) -> u64 {
    let retval: u64 = match syscall_number {
        0 => read(arg0 as u32, arg1, arg2 as usize) as u64,
        1 => write(arg0 as u32, arg1, arg2 as usize) as u64,
        2 => open(arg0, arg1 as u32) as u64,
        3 => close(arg0 as u32) as u64,
        9 => mmap(arg0, arg1, arg2 as u32, arg3) as u64,
        11 => munmap(arg0) as u64,
        12 => brk(arg0),
        16 => (-ENOTTY) as u64, // ioctl
        57 => fork() as u64,
        59 => execve(arg0, arg1, arg2),
        60 => exit(arg0 as i32),
        61 => wait(arg0 as u32) as u64, // wait4
        158 => arch_prctl(arg0 as u32, arg1),
        231 => exit(arg0 as i32), // exit_group
        _ => {
            debug_println!(
                "Unknown syscall {}: ({}, {}, {}, {})",
                syscall_number,
                arg0,
                arg1,
                arg2,
                arg3
            );
            (-ENOSYS) as u64
        }
    };
    debug_println!("returned {:?}", retval);
    retval
}

#[unsafe(naked)]
pub unsafe extern "sysv64" fn handle_syscall() {
    // save registers required by sysretq
    naked_asm!(
        "
        // systretq uses these
        push rcx // saved rip
        push r11 // saved rflags

        // We use these two callee-saved registers so back up the original values
        push rbp // Will store old sp
        push rbx // Will store new sp

        push rax // sycall number
        push rdi // arg0
        push rsi // arg1
        push rdx // arg2
        push r10 // arg3

        call {} // Return value is now in rax
        mov rbx, rax // RBX = new sp

        // Restore syscall params
        pop r10
        pop rdx
        pop rsi
        pop rdi
        pop rax

        mov rbp, rsp // backup userspace stack
        mov rsp, rbx // switch to new stack

        // === FROM NOW ON WE ARE ON KERNEL STACK ===

        // We push args to new stack
        push rax // sycall number
        push rdi // arg0
        push rsi // arg1
        push rdx // arg2
        push r10 // arg3

        // Pop to follow normal sysv64 calling convention
        pop r8
        pop rcx
        pop rdx
        pop rsi
        pop rdi

        /// AT THIS POINT THE KERNEL STACK SHOULD BE EMPTY (the following should be pushed at the base)

        // Save callee-saved registers so that they can be used in forked_entry:
        push rbx
        push r12
        push r13
        push r14
        push r15
        push rbp

        call {}

        // No need to pop from the kernel stack, syscall_ret doesn't use it
        jmp {}
        ",
        sym get_kernel_stack,
        sym handle_syscall_inner,
        sym syscall_ret
    );
}

/// Handles returning to userspace (including switching to userspace stack using the callee-saved rbp register)
#[unsafe(naked)]
pub unsafe extern "sysv64" fn syscall_ret() {
    naked_asm!(
        "
        mov rsp, rbp // Restore userspace stack
        pop rbx
        pop rbp
        pop r11
        pop rcx
        sysretq
        "
    )
}
