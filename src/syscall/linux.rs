use std::any::Any;
use std::ffi::CString;
use std::path::Path;

use caps::{errors::CapsError, CapSet, CapsHashSet};
use nix::errno::Errno;
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sched::{unshare, CloneFlags};
use nix::sys::stat::{mknod, Mode, SFlag};
use nix::unistd::{chdir, setuid, symlinkat, umask, Uid};

use super::Syscall;

pub struct LinuxSyscall;

impl Syscall for LinuxSyscall {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn mount(
        &self,
        source: Option<&Path>,
        target: &Path,
        fstype: Option<&str>,
        flags: MsFlags,
        data: Option<&str>,
    ) -> Result<(), Errno> {
        mount(source, target, fstype, flags, data)
    }

    fn umount2(&self, target: &Path, flags: MntFlags) -> Result<(), Errno> {
        umount2(target, flags)
    }

    fn pivot_root(&self, new_root: &Path, put_old: &Path) -> Result<(), Errno> {
        nix::unistd::pivot_root(new_root, put_old)
    }

    fn chdir(&self, path: &Path) -> Result<(), Errno> {
        chdir(path)
    }

    fn mkdir(&self, path: &Path, mode: Mode) -> Result<(), Errno> {
        nix::unistd::mkdir(path, mode)
    }

    fn symlink(&self, original: &Path, link: &Path) -> Result<(), Errno> {
        symlinkat(original, None, link)
    }

    fn mknod(&self, path: &Path, kind: SFlag, perm: Mode, dev: u64) -> Result<(), Errno> {
        mknod(path, kind, perm, dev)
    }

    fn unshare(&self, flags: CloneFlags) -> Result<(), Errno> {
        unshare(flags)
    }

    fn setuid(&self, uid: Uid) -> Result<(), Errno> {
        setuid(uid)
    }

    fn set_capability(&self, cset: CapSet, value: &CapsHashSet) -> Result<(), CapsError> {
        caps::set(None, cset, value)
    }

    fn set_keep_capabilities(&self, keep: bool) -> Result<(), Errno> {
        prctl_raw(libc::PR_SET_KEEPCAPS, keep as libc::c_ulong)
    }

    fn set_no_new_privs(&self) -> Result<(), Errno> {
        prctl_raw(libc::PR_SET_NO_NEW_PRIVS, 1)
    }

    fn umask(&self, mode: Mode) -> Mode {
        umask(mode)
    }
}

/// Renames this process as seen by `ps`/`/proc/<pid>/comm`.
///
/// TODO: also overwrite `/proc/<pid>/cmdline` by writing into the
/// original argv region; that requires capturing the raw argv pointer
/// at process start, which a plain `fn main` does not expose safely.
pub fn set_procname(name: &str) -> Result<(), Errno> {
    let c_name = CString::new(name).map_err(|_| Errno::EINVAL)?;
    prctl_raw(libc::PR_SET_NAME, c_name.as_ptr() as libc::c_ulong)
}

fn prctl_raw(option: libc::c_int, arg2: libc::c_ulong) -> Result<(), Errno> {
    let ret = unsafe { libc::prctl(option, arg2, 0, 0, 0) };
    Errno::result(ret).map(drop)
}
