//! Raw `clone(2)` wrapper used to enter the new mount/pid/ipc
//! namespace directly, in one step, rather than `fork` then `unshare`.
//! `nix::sched::clone`'s interface doesn't give enough control over the
//! child stack for this, so this goes straight to `libc::clone`.

use std::mem;
use std::ptr;

use anyhow::{Context, Result};
use libc::{c_int, c_void};
use nix::errno::Errno;
use nix::sched::CloneFlags;
use nix::sys::mman;
use nix::sys::signal::Signal;
use nix::unistd::Pid;

pub type CloneCb = Box<dyn FnMut() -> isize>;

/// Clones a new process directly into `clone_flags`' namespaces,
/// running `cb` as its entire body. SIGCHLD is always added so the
/// result behaves like a normal child for `wait`.
pub fn clone(mut cb: CloneCb, clone_flags: CloneFlags) -> Result<Pid> {
    extern "C" fn callback(data: *mut CloneCb) -> c_int {
        let cb: &mut CloneCb = unsafe { &mut *data };
        (*cb)() as c_int
    }

    let page_size: usize = unsafe {
        match libc::sysconf(libc::_SC_PAGE_SIZE) {
            -1 => 4 * 1024,
            x => x as usize,
        }
    };

    let mut rlimit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    unsafe { Errno::result(libc::getrlimit(libc::RLIMIT_STACK, &mut rlimit))? };
    let default_stack_size = rlimit.rlim_cur as usize;

    // The child stack isn't managed by Rust: mmap it ourselves so we
    // control its lifetime and can guard the low page against overflow.
    let child_stack = unsafe {
        mman::mmap(
            ptr::null_mut(),
            default_stack_size,
            mman::ProtFlags::PROT_READ | mman::ProtFlags::PROT_WRITE,
            mman::MapFlags::MAP_PRIVATE | mman::MapFlags::MAP_ANONYMOUS | mman::MapFlags::MAP_STACK,
            -1,
            0,
        )?
    };

    let combined = clone_flags.bits() | Signal::SIGCHLD as c_int;
    let res = unsafe {
        mman::mprotect(child_stack, page_size, mman::ProtFlags::PROT_NONE)
            .context("failed to create guard page for clone stack")?;

        // clone's child stack grows down, so pass the top of the region.
        let child_stack_top = child_stack.add(default_stack_size);

        libc::clone(
            mem::transmute(callback as extern "C" fn(*mut CloneCb) -> i32),
            child_stack_top,
            combined,
            &mut cb as *mut _ as *mut c_void,
        )
    };
    Errno::result(res).map(Pid::from_raw).context("clone(2) failed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::wait::{waitpid, WaitStatus};
    use nix::unistd::getpid;

    #[test]
    #[serial_test::serial]
    fn clone_runs_callback_in_child() {
        let flags = CloneFlags::empty();
        let pid = clone(
            Box::new(|| {
                let _ = getpid();
                7
            }),
            flags,
        )
        .unwrap();
        let status = waitpid(pid, None).unwrap();
        assert_eq!(status, WaitStatus::Exited(pid, 7));
    }
}
