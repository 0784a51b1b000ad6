use core::arch::naked_asm;
use core::sync::atomic::{AtomicU32, Ordering};

use alloc::collections::btree_map::BTreeMap;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use conquer_once::spin::OnceCell;
use spin::RwLock;
use spin::mutex::Mutex;
use syscalls::syscall_ret;
use x86_64::VirtAddr;
use x86_64::registers::control::Cr3;
use x86_64::structures::paging::{OffsetPageTable, PageTable, PhysFrame};

use crate::debug_println;
use crate::filesystem::vfs::Inode;
use crate::filesystem::{self, FS_LOCK};
use crate::scheduler::Thread;
use crate::vm::VmError;
use crate::vm::constants::{FD_MAX, USER_STACK_TOP};
use crate::vm::frame::{self, GlobalFrameSource};
use crate::vm::mmap::{self, MmapRegion};
use crate::vm::mmu::{AddressSpace, X86AddressSpace};
use crate::vm::page::LazyAux;
use crate::vm::spt::SupplementalPageTable;

use elf::{Ehdr, LoadingError};
use wait_status::WaitStatus;

#[allow(dead_code)]
pub mod constants;

mod elf;
pub mod syscalls;
pub mod wait_status;

static NEXT_PID: AtomicU32 = AtomicU32::new(1);
static PROCESS_TABLE: OnceCell<ProcessTable> = OnceCell::uninit();

/// fds 0 and 1 are reserved for stdin/stdout and handled specially by
/// `read`/`write` without going through `UserProcess::files`.
pub const FIRST_FD: u32 = 2;

pub struct ProcessTable {
    /// Maps PID to user process
    processes: RwLock<BTreeMap<u32, Arc<Mutex<UserProcess>>>>,
}

impl ProcessTable {
    pub fn init() {
        PROCESS_TABLE.init_once(|| ProcessTable {
            processes: RwLock::new(BTreeMap::new()),
        });
    }

    /// Gets a process by its PID
    /// # Panics
    /// Panics if ProcessTable::init() has not been called.
    ///
    /// Most references to processes should be by PID. Holding this Arc<> for too long
    /// will delay process destruction, so drop this as soon as possible.
    pub fn get_by_pid(pid: u32) -> Option<Arc<Mutex<UserProcess>>> {
        PROCESS_TABLE
            .get()
            .expect("Expected ProcessTable::init() to have been called.")
            .processes
            .read()
            .get(&pid)
            .cloned()
    }

    /// Used internally when forking or creating a process to add to process table.
    /// # Panics
    /// Panics if ProcessTable::init() has not been called.
    fn add_process(process: UserProcess) {
        PROCESS_TABLE
            .get()
            .expect("Expected ProcessTable::init() to have been called.")
            .processes
            .write()
            .insert(process.pid, Arc::new(Mutex::new(process)));
    }

    /// Drops a process's table entry once it's fully torn down. The
    /// `wait_status` handoff is what actually lets a parent learn the exit
    /// code, so it must survive this.
    fn remove(pid: u32) {
        PROCESS_TABLE
            .get()
            .expect("Expected ProcessTable::init() to have been called.")
            .processes
            .write()
            .remove(&pid);
    }
}

pub struct FileDescriptor {
    pub inode: Arc<Inode>,
    pub offset: u64,
    pub flags: u32,
}

pub struct UserProcess {
    /// Open file descriptors, numbered from [`FIRST_FD`].
    pub files: BTreeMap<u32, Arc<RwLock<FileDescriptor>>>,
    next_fd: u32,
    pub mapper: OffsetPageTable<'static>,
    pub thread: Arc<Mutex<Thread>>,
    pub pid: u32,
    pub brk: VirtAddr,
    pub brk_initial: VirtAddr,
    pub cr3_frame: PhysFrame,
    pub spt: SupplementalPageTable,
    pub mmaps: Vec<MmapRegion>,
    /// Kept open for the process's entire lifetime, the way Pintos holds
    /// `exec_file` open (deny-write is out of scope, but the handle is still
    /// only closed once, at exit).
    exec_file: Option<Arc<Inode>>,
    /// This process's own wait_status, registered in its parent's
    /// `children` at fork time. `None` for the initial process, which has
    /// no parent to report to.
    pub wait_status: Option<Arc<WaitStatus>>,
    /// Wait-status handles for children that haven't been reaped yet.
    pub children: Vec<Arc<WaitStatus>>,
}

impl UserProcess {
    /// Used for creating the initial process.
    /// Reuses the initialisation page tables.
    /// Returns the PID of the new process.
    pub fn create(mapper: OffsetPageTable<'static>) -> u32 {
        let thread = Arc::new(Mutex::new(Thread::from_func(
            enter_userspace,
            None,
            None,
            None,
        )));

        let process = UserProcess {
            files: BTreeMap::new(),
            next_fd: FIRST_FD,
            mapper,
            thread: thread.clone(),
            pid: NEXT_PID.fetch_add(1, Ordering::Relaxed),
            brk: VirtAddr::new(0),
            brk_initial: VirtAddr::new(0),
            cr3_frame: Cr3::read().0,
            spt: SupplementalPageTable::new(),
            mmaps: Vec::new(),
            exec_file: None,
            wait_status: None,
            children: Vec::new(),
        };

        thread.lock().process = Some(process.pid);
        thread.lock().cr3_frame = Some(process.cr3_frame);

        let pid = process.pid;

        ProcessTable::add_process(process);

        pid
    }

    /// See the POSIX execve system call for information on how it is used.
    /// Currently this only supports static ELF loading -- dynamic
    /// executables or shebang scripts are not supported. Segments are not
    /// read eagerly: each PT_LOAD page is registered UNINIT and paged in the
    /// first time it faults, the same path ordinary lazy anonymous pages and
    /// stack growth go through.
    pub fn execve(&mut self, path: &str, args: Vec<&str>, _env: Vec<&str>) -> Result<(), LoadingError> {
        let (exec_inode, file_len, ehdr, phdrs) = {
            let _guard = FS_LOCK.lock();
            let exec_inode = filesystem::reopen(path).map_err(|_| LoadingError::InvalidHeader)?;
            let file_len = filesystem::length(&exec_inode);

            let mut ehdr_buf = [0u8; size_of::<Ehdr>()];
            let got = filesystem::vfs_read(exec_inode.clone(), 0, &mut ehdr_buf)
                .map_err(|_| LoadingError::InvalidHeader)?;
            if got != ehdr_buf.len() {
                let _ = filesystem::close(exec_inode);
                return Err(LoadingError::InvalidHeader);
            }
            let ehdr = match Ehdr::parse(&ehdr_buf) {
                Ok(ehdr) => ehdr,
                Err(e) => {
                    let _ = filesystem::close(exec_inode);
                    return Err(e);
                }
            };

            // Read just enough of the file to cover the program header
            // table -- segment contents are never read here, only loaded
            // lazily once each page first faults.
            let phdr_region_len = ehdr.e_phoff as usize
                + ehdr.e_phnum as usize * ehdr.e_phentsize as usize;
            let mut phdr_region = vec![0u8; phdr_region_len];
            let got = filesystem::vfs_read(exec_inode.clone(), 0, &mut phdr_region)
                .map_err(|_| LoadingError::InvalidHeader)?;
            if got != phdr_region_len {
                let _ = filesystem::close(exec_inode);
                return Err(LoadingError::InvalidHeader);
            }
            let phdrs = match ehdr.program_headers(&phdr_region) {
                Ok(phdrs) => phdrs,
                Err(e) => {
                    let _ = filesystem::close(exec_inode);
                    return Err(e);
                }
            };
            for phdr in phdrs.iter().filter(|p| p.is_load()) {
                if let Err(e) = phdr.validate(file_len) {
                    let _ = filesystem::close(exec_inode);
                    return Err(e);
                }
            }

            (exec_inode, file_len, ehdr, phdrs)
        };
        let _ = file_len;

        // Tear down whatever image this process was previously running (a
        // no-op for the very first execve of a freshly created process).
        // Done with FS_LOCK released: do_munmap's writeback takes it itself.
        self.destroy_address_space();

        for phdr in phdrs.iter().filter(|p| p.is_load()) {
            let vaddr_page0 = VirtAddr::new(phdr.p_vaddr).align_down(4096u64).as_u64();
            let file_off_page0 = phdr.p_offset - (phdr.p_vaddr - vaddr_page0);
            let mem_end = phdr.p_vaddr + phdr.p_memsz;
            let file_end = phdr.p_offset + phdr.p_filesz;

            let mut page_va = vaddr_page0;
            while page_va < mem_end {
                let file_off = file_off_page0 + (page_va - vaddr_page0);
                let read_bytes = if file_off >= file_end {
                    0
                } else {
                    core::cmp::min(4096, file_end - file_off) as u32
                };
                let aux = LazyAux::AnonFromFile {
                    inode: exec_inode.clone(),
                    offset: file_off,
                    read_bytes,
                };
                if self
                    .spt
                    .insert_uninit(VirtAddr::new(page_va), phdr.writable(), aux)
                    .is_err()
                {
                    let _ = filesystem::close(exec_inode);
                    return Err(LoadingError::BadSegmentLayout);
                }
                page_va += 4096;
            }
        }

        self.exec_file = Some(exec_inode);

        self.brk_initial = phdrs
            .iter()
            .filter(|p| p.is_load())
            .map(|p| VirtAddr::new(p.p_vaddr + p.p_memsz))
            .max()
            .unwrap_or(VirtAddr::new(0));
        self.brk = self.brk_initial;

        let (argc, argv_base, final_rsp) = self
            .build_initial_stack(&args)
            .map_err(|_| LoadingError::BadSegmentLayout)?;

        let mut thread = self.thread.lock();
        thread.context.rbp = ehdr.e_entry;
        thread.context.rbx = final_rsp;
        thread.context.r12 = argc;
        thread.context.r13 = argv_base;
        drop(thread);

        debug_println!("Userspace entry point {:x}", ehdr.e_entry);

        Ok(())
    }

    /// Builds the initial process stack inside a single freshly claimed page
    /// just below [`USER_STACK_TOP`]. Strings are copied highest-argument
    /// first so argv ends up in order; overflowing the single mapped page is
    /// an exec failure rather than a silent stack grow. Returns `(argc,
    /// argv_base)` and stashes the final `rsp` in `self.last_stack_rsp`.
    fn build_initial_stack(&mut self, args: &[&str]) -> Result<(u64, u64, u64), VmError> {
        let page_base = USER_STACK_TOP - 4096;
        let page_top = USER_STACK_TOP;
        let stack_va = VirtAddr::new(page_base);

        self.spt.insert_uninit(stack_va, true, LazyAux::AnonZero)?;
        let pid = self.pid;
        let frame = {
            let mut frames = GlobalFrameSource;
            let phys_offset = self.mapper.phys_offset();
            let mut space = X86AddressSpace::new(&mut self.mapper, phys_offset);
            self.spt.claim(stack_va, pid, &mut frames, &mut space)?;
            self.spt.find(stack_va).expect("just claimed").frame.expect("just claimed")
        };

        let phys_offset = self.mapper.phys_offset();
        let write_at = |sp_addr: u64, bytes: &[u8]| {
            debug_assert!(sp_addr >= page_base && sp_addr + bytes.len() as u64 <= page_top);
            let kva = phys_offset + frame.start_address().as_u64() + (sp_addr - page_base);
            unsafe { core::ptr::copy_nonoverlapping(bytes.as_ptr(), kva.as_mut_ptr::<u8>(), bytes.len()) };
        };

        let mut sp = page_top;

        // Step 1: copy argument strings, highest-index first, recording
        // each string's final address as we go.
        let mut argv_addrs = Vec::with_capacity(args.len());
        for arg in args.iter().rev() {
            let bytes = arg.as_bytes();
            sp = sp
                .checked_sub(bytes.len() as u64 + 1)
                .ok_or(VmError::AccessViolation)?;
            if sp < page_base {
                return Err(VmError::AccessViolation);
            }
            write_at(sp, bytes);
            write_at(sp + bytes.len() as u64, &[0u8]);
            argv_addrs.push(sp);
        }
        argv_addrs.reverse();

        // Step 2: align down to an 8-byte boundary.
        sp &= !7u64;

        // Step 3: argv[argc] = NULL.
        if sp < page_base + 8 {
            return Err(VmError::AccessViolation);
        }
        sp -= 8;
        write_at(sp, &0u64.to_ne_bytes());

        // Step 4: argv[0..argc] pointers, pushed in reverse so they end up
        // in forward order in memory.
        for &addr in argv_addrs.iter().rev() {
            if sp < page_base + 8 {
                return Err(VmError::AccessViolation);
            }
            sp -= 8;
            write_at(sp, &addr.to_ne_bytes());
        }
        let argv_base = sp;

        // Step 5: a fake return address of 0, so a stray `ret` in a process
        // that never calls `exit` faults instead of jumping anywhere live.
        if sp < page_base + 8 {
            return Err(VmError::AccessViolation);
        }
        sp -= 8;
        write_at(sp, &0u64.to_ne_bytes());

        Ok((args.len() as u64, argv_base, sp))
    }

    /// Tears down every mapping this process currently owns: mmap regions
    /// first (so dirty FILE pages get written back), then whatever remains
    /// in the supplemental page table. Safe to call on a process that owns
    /// nothing yet.
    fn destroy_address_space(&mut self) {
        let mut frames = GlobalFrameSource;
        let phys_offset = self.mapper.phys_offset();
        let mut space = X86AddressSpace::new(&mut self.mapper, phys_offset);
        for mut region in core::mem::take(&mut self.mmaps) {
            mmap::do_munmap(&mut self.spt, &mut region, &mut frames, &mut space);
        }
        self.spt.kill(&mut frames, &mut space);
    }

    /// Grows the heap lazily: new pages are registered but not claimed,
    /// exactly like any other anonymous mapping. Returns the new break, same
    /// as `brk` returns its (possibly unchanged) argument on failure.
    pub fn grow_brk(&mut self, new_brk: VirtAddr) -> VirtAddr {
        if new_brk < self.brk_initial {
            return self.brk;
        }

        if new_brk > self.brk {
            let mut va = self.brk.align_up(4096u64);
            while va < new_brk {
                if self.spt.insert_uninit(va, true, LazyAux::AnonZero).is_err() {
                    return self.brk;
                }
                va += 4096u64;
            }
        } else if new_brk < self.brk {
            let mut frames = GlobalFrameSource;
            let phys_offset = self.mapper.phys_offset();
            let mut space = X86AddressSpace::new(&mut self.mapper, phys_offset);
            let mut va = new_brk.align_up(4096u64);
            while va < self.brk.align_up(4096u64) {
                if let Some(mut page) = self.spt.remove(va) {
                    if page.frame.is_some() && space.is_present(va) {
                        let _ = space.unmap(va);
                    }
                    page.destroy_with(&mut frames);
                }
                va += 4096u64;
            }
        }

        self.brk = new_brk;
        self.brk
    }

    /// Allocates the next file descriptor number, bounded by [`FD_MAX`].
    fn alloc_fd(&mut self) -> Option<u32> {
        if self.next_fd >= FD_MAX {
            return None;
        }
        let fd = self.next_fd;
        self.next_fd += 1;
        Some(fd)
    }

    /// Forks the process: a fresh top-level page table whose kernel half is
    /// shared with the parent and whose user half is populated entirely by
    /// `spt.copy_into`, a byte-for-byte supplemental page table copy, and
    /// duplicated (not shared) file descriptors. Returns the child PID, or
    /// `None` if the copy or any fd duplication failed -- the whole fork is
    /// rolled back and the caller reports it to userspace as -1, matching
    /// `process_fork`'s "load failed" cleanup path.
    pub fn fork(&mut self) -> Option<u32> {
        let child_pid = NEXT_PID.fetch_add(1, Ordering::Relaxed);

        let (child_frame, child_l4) = fork_root_table(&self.mapper);
        let mut child_mapper = unsafe { OffsetPageTable::new(child_l4, self.mapper.phys_offset()) };

        let mut child_spt = SupplementalPageTable::new();
        {
            let phys_offset = self.mapper.phys_offset();
            let parent_space = X86AddressSpace::new(&mut self.mapper, phys_offset);
            let mut child_frames = GlobalFrameSource;
            let mut child_space = X86AddressSpace::new(&mut child_mapper, phys_offset);
            if self
                .spt
                .copy_into(&mut child_spt, child_pid, &parent_space, &mut child_frames, &mut child_space)
                .is_err()
            {
                child_spt.kill(&mut child_frames, &mut child_space);
                frame::free_frame(child_frame);
                return None;
            }
        }

        let mut child_files = BTreeMap::new();
        {
            let _guard = FS_LOCK.lock();
            let vfs = crate::VFS.get().unwrap();
            for (&fd, desc) in self.files.iter() {
                let desc = desc.read();
                if vfs.open(desc.inode.clone()).is_err() {
                    // Roll back every fd opened so far and fail the whole
                    // fork rather than hand the child a process with fewer
                    // open files than its parent.
                    for (_, opened) in child_files {
                        let _ = vfs.close(opened.read().inode.clone());
                    }
                    let mut child_frames = GlobalFrameSource;
                    let mut child_space = X86AddressSpace::new(&mut child_mapper, self.mapper.phys_offset());
                    child_spt.kill(&mut child_frames, &mut child_space);
                    frame::free_frame(child_frame);
                    return None;
                }
                child_files.insert(
                    fd,
                    Arc::new(RwLock::new(FileDescriptor {
                        inode: desc.inode.clone(),
                        offset: desc.offset,
                        flags: desc.flags,
                    })),
                );
            }
        }

        let exec_file = self.exec_file.as_ref().map(|inode| {
            let _guard = FS_LOCK.lock();
            let _ = crate::VFS.get().unwrap().open(inode.clone());
            inode.clone()
        });

        let wait_status = WaitStatus::new(child_pid);
        self.children.push(wait_status.clone());

        let child = UserProcess {
            files: child_files,
            next_fd: self.next_fd,
            mapper: child_mapper,
            thread: Arc::new(Mutex::new(Thread::from_func(
                forked_entry,
                None,
                None,
                Some(child_frame),
            ))),
            pid: child_pid,
            brk: self.brk,
            brk_initial: self.brk_initial,
            cr3_frame: child_frame,
            spt: child_spt,
            mmaps: Vec::new(),
            exec_file,
            wait_status: Some(wait_status),
            children: Vec::new(),
        };
        child.thread.lock().process = Some(child.pid);

        let pid = child.pid;
        ProcessTable::add_process(child);

        Some(pid)
    }

    /// Tears down the process's address space and open files, records its
    /// exit status for a waiting parent (or releases it immediately if there
    /// never will be one), and releases any still-unwaited children's
    /// reservation on their own `wait_status`. Does not remove the process
    /// from the table — the caller keeps this `UserProcess` locked only
    /// until it returns, so the table entry is dropped by [`ProcessTable::remove`]
    /// right after.
    pub fn exit(&mut self, status: i32) {
        self.destroy_address_space();

        if let Some(exec_file) = self.exec_file.take() {
            let _guard = FS_LOCK.lock();
            let _ = filesystem::close(exec_file);
        }

        for (_, desc) in core::mem::take(&mut self.files) {
            let desc = desc.read();
            let _guard = FS_LOCK.lock();
            let _ = filesystem::close(desc.inode.clone());
        }

        if let Some(ws) = self.wait_status.take() {
            ws.record_exit(status);
            ws.release();
        }

        for child_ws in core::mem::take(&mut self.children) {
            child_ws.release();
        }

        ProcessTable::remove(self.pid);
    }
}

/// Builds a fresh top-level page table for a forked child: the kernel half
/// (entries 256..512) points at the exact same lower-level tables as the
/// parent, matching every address space sharing one kernel mapping; the
/// user half starts empty and is populated entirely by `spt.copy_into`.
fn fork_root_table(parent: &OffsetPageTable<'static>) -> (PhysFrame, &'static mut PageTable) {
    let frame = frame::get_frame().expect("fork: no frame available for new page table");
    let dst_ptr = parent.phys_offset() + frame.start_address().as_u64();
    let dst: &mut PageTable = unsafe { &mut *dst_ptr.as_mut_ptr() };
    dst.zero();

    let src = parent.level_4_table();
    for (i, entry) in src.iter().enumerate().skip(256) {
        dst[i].set_addr(entry.addr(), entry.flags());
    }

    (frame, dst)
}

/// Enters userspace, enabling interrupts. Since thread entry points
/// can't take parameters:
/// - rbp stores userspace entry point
/// - rbx stores userspace stack pointer
/// - r12/r13 store argc/argv_base, loaded into rdi/rsi the way a normal
///   function call would receive them
#[unsafe(naked)]
unsafe extern "sysv64" fn enter_userspace() {
    naked_asm!(
        // We must keep the userspace stack in rbx, since the kstack
        // is used to 'return' into here.
        "mov rsp, rbx
        mov rdi, r12
        mov rsi, r13
        mov rcx, rbp
        mov r11, 0x0202
        sysretq"
    )
}

/// Forked entry uses the top 6 items on the stack to restore callee-saved parameters to return to userspace
#[unsafe(naked)]
unsafe extern "sysv64" fn forked_entry() {
    naked_asm!(
        "
        pop rbp
        pop r15
        pop r14
        pop r13
        pop r12
        pop rbx

        xor rax, rax // return 0

        jmp {}
        ", sym syscall_ret
    )
}
