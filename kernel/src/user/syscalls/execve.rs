use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use x86_64::VirtAddr;

use crate::{
    CPUS,
    scheduler::{enqueue, yield_execution},
    user::{
        enter_userspace,
        syscalls::{
            copy::{copy_in_string, copy_in_u64},
            get_current_process,
        },
    },
};

pub(super) struct ExecveError;

/// Max number of argv entries copied in, to avoid a malicious argv array
/// spinning the kernel forever looking for a NULL terminator that never
/// comes.
const MAX_ARGS: u64 = 256;

pub(super) fn execve_inner(filename: u64, argv: u64, _envp: u64) -> Result<!, ExecveError> {
    debug_println!("execve");
    if filename == 0 {
        return Err(ExecveError);
    }

    let process = get_current_process();

    let (path, args) = {
        let mut process = process.lock();

        let filename_bytes = copy_in_string(&mut process, VirtAddr::new(filename))
            .map_err(|_| ExecveError)?;
        let path = String::from_utf8(filename_bytes).map_err(|_| ExecveError)?;

        let mut args: Vec<String> = Vec::new();
        if argv != 0 {
            for i in 0..MAX_ARGS {
                let entry_va = VirtAddr::new(argv) + i * 8;
                let arg_ptr =
                    copy_in_u64(&mut process, entry_va).map_err(|_| ExecveError)?;
                if arg_ptr == 0 {
                    break;
                }
                let bytes = copy_in_string(&mut process, VirtAddr::new(arg_ptr))
                    .map_err(|_| ExecveError)?;
                args.push(String::from_utf8(bytes).map_err(|_| ExecveError)?);
            }
        }

        (path, args)
    };

    debug_println!("execve({:?}, {:?})", path, args);

    let execve_result = process
        .lock()
        .execve(&path, args.iter().map(|s| s.as_str()).collect(), vec![]);

    match execve_result {
        Ok(_) => {
            {
                let process = process.lock(); // In a block to ensure mutex guard is dropped before scheduler

                // Prevent context switch from saving current state (and overriding execve's work)
                CPUS.get().unwrap().get_cpu().current_thread = None;

                // Set entry point of process to switch to the userspace entry point (bypassing normal syscall machinery)
                process.thread.lock().set_func(enter_userspace);

                // We need to requeue the thread manually since yield_and_continue() relies on requeuing the current thread
                enqueue(process.thread.clone());
            }

            yield_execution();

            panic!("Re-entered invalid thread: execve syscall");
        }
        Err(_) => Err(ExecveError),
    }
}
