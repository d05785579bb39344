//! The syscall boundary. Everything in `namespace`, `bindmount`,
//! `fstable`, and `capabilities` talks to the kernel only through this
//! trait, so it can be exercised under test without root or real
//! namespaces.

pub mod linux;
#[cfg(test)]
pub mod test;

use std::any::Any;
use std::path::Path;

use caps::{errors::CapsError, CapSet, CapsHashSet};
use nix::errno::Errno;
use nix::mount::{MntFlags, MsFlags};
use nix::sched::CloneFlags;
use nix::sys::stat::{Mode, SFlag};
use nix::unistd::Uid;

pub trait Syscall {
    fn as_any(&self) -> &dyn Any;

    fn mount(
        &self,
        source: Option<&Path>,
        target: &Path,
        fstype: Option<&str>,
        flags: MsFlags,
        data: Option<&str>,
    ) -> Result<(), Errno>;

    fn umount2(&self, target: &Path, flags: MntFlags) -> Result<(), Errno>;

    fn pivot_root(&self, new_root: &Path, put_old: &Path) -> Result<(), Errno>;

    fn chdir(&self, path: &Path) -> Result<(), Errno>;

    fn mkdir(&self, path: &Path, mode: Mode) -> Result<(), Errno>;

    fn symlink(&self, original: &Path, link: &Path) -> Result<(), Errno>;

    fn mknod(&self, path: &Path, kind: SFlag, perm: Mode, dev: u64) -> Result<(), Errno>;

    fn unshare(&self, flags: CloneFlags) -> Result<(), Errno>;

    fn setuid(&self, uid: Uid) -> Result<(), Errno>;

    fn set_capability(&self, cset: CapSet, value: &CapsHashSet) -> Result<(), CapsError>;

    fn set_keep_capabilities(&self, keep: bool) -> Result<(), Errno>;

    fn set_no_new_privs(&self) -> Result<(), Errno>;

    fn umask(&self, mode: Mode) -> Mode;
}

/// Real syscalls outside tests, a recording fake under them.
pub fn create_syscall() -> Box<dyn Syscall> {
    if cfg!(test) {
        Box::<test::TestHelperSyscall>::default()
    } else {
        Box::new(linux::LinuxSyscall)
    }
}
