//! Recording fake used by unit tests: every call is pushed onto a `Vec`
//! instead of touching the kernel, so C2/C3/C4/C5 logic can be tested
//! without root or real namespaces.

use std::any::Any;
use std::cell::RefCell;
use std::path::{Path, PathBuf};

use caps::{errors::CapsError, CapSet, CapsHashSet};
use nix::errno::Errno;
use nix::mount::{MntFlags, MsFlags};
use nix::sched::CloneFlags;
use nix::sys::stat::{Mode, SFlag};
use nix::unistd::Uid;

use super::Syscall;

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct MountArgs {
    pub source: Option<PathBuf>,
    pub target: PathBuf,
    pub fstype: Option<String>,
    pub flags: MsFlags,
    pub data: Option<String>,
}

#[derive(Default)]
pub struct TestHelperSyscall {
    mount_args: RefCell<Vec<MountArgs>>,
    umount2_args: RefCell<Vec<(PathBuf, MntFlags)>>,
    pivot_root_args: RefCell<Vec<(PathBuf, PathBuf)>>,
    chdir_args: RefCell<Vec<PathBuf>>,
    mkdir_args: RefCell<Vec<(PathBuf, Mode)>>,
    symlink_args: RefCell<Vec<(PathBuf, PathBuf)>>,
    mknod_args: RefCell<Vec<(PathBuf, SFlag, Mode, u64)>>,
    unshare_args: RefCell<Vec<CloneFlags>>,
    set_capability_args: RefCell<Vec<(CapSet, CapsHashSet)>>,
    /// Paths for which `mount` should return an error, simulating ENOENT
    /// on a host path that doesn't exist.
    pub fail_mount_targets: RefCell<Vec<PathBuf>>,
    /// Paths for which only the `MS_PRIVATE` remount call should fail,
    /// simulating a failure at bind-mount step 2.
    pub fail_private_targets: RefCell<Vec<PathBuf>>,
}

impl Syscall for TestHelperSyscall {
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
        if self.fail_mount_targets.borrow().iter().any(|p| p == target) {
            return Err(Errno::ENOENT);
        }
        if flags.contains(MsFlags::MS_PRIVATE) && self.fail_private_targets.borrow().iter().any(|p| p == target) {
            return Err(Errno::EIO);
        }
        self.mount_args.borrow_mut().push(MountArgs {
            source: source.map(|p| p.to_owned()),
            target: target.to_owned(),
            fstype: fstype.map(|s| s.to_owned()),
            flags,
            data: data.map(|s| s.to_owned()),
        });
        Ok(())
    }

    fn umount2(&self, target: &Path, flags: MntFlags) -> Result<(), Errno> {
        self.umount2_args.borrow_mut().push((target.to_owned(), flags));
        Ok(())
    }

    fn pivot_root(&self, new_root: &Path, put_old: &Path) -> Result<(), Errno> {
        self.pivot_root_args
            .borrow_mut()
            .push((new_root.to_owned(), put_old.to_owned()));
        Ok(())
    }

    fn chdir(&self, path: &Path) -> Result<(), Errno> {
        self.chdir_args.borrow_mut().push(path.to_owned());
        Ok(())
    }

    fn mkdir(&self, path: &Path, mode: Mode) -> Result<(), Errno> {
        self.mkdir_args.borrow_mut().push((path.to_owned(), mode));
        Ok(())
    }

    fn symlink(&self, original: &Path, link: &Path) -> Result<(), Errno> {
        self.symlink_args
            .borrow_mut()
            .push((original.to_owned(), link.to_owned()));
        Ok(())
    }

    fn mknod(&self, path: &Path, kind: SFlag, perm: Mode, dev: u64) -> Result<(), Errno> {
        self.mknod_args.borrow_mut().push((path.to_owned(), kind, perm, dev));
        Ok(())
    }

    fn unshare(&self, flags: CloneFlags) -> Result<(), Errno> {
        self.unshare_args.borrow_mut().push(flags);
        Ok(())
    }

    fn setuid(&self, _uid: Uid) -> Result<(), Errno> {
        Ok(())
    }

    fn set_capability(&self, cset: CapSet, value: &CapsHashSet) -> Result<(), CapsError> {
        self.set_capability_args.borrow_mut().push((cset, value.clone()));
        Ok(())
    }

    fn set_keep_capabilities(&self, _keep: bool) -> Result<(), Errno> {
        Ok(())
    }

    fn set_no_new_privs(&self) -> Result<(), Errno> {
        Ok(())
    }

    fn umask(&self, _mode: Mode) -> Mode {
        Mode::empty()
    }
}

impl TestHelperSyscall {
    pub fn get_mount_args(&self) -> Vec<MountArgs> {
        self.mount_args.borrow().clone()
    }

    pub fn get_umount2_args(&self) -> Vec<(PathBuf, MntFlags)> {
        self.umount2_args.borrow().clone()
    }

    pub fn get_pivot_root_args(&self) -> Vec<(PathBuf, PathBuf)> {
        self.pivot_root_args.borrow().clone()
    }

    pub fn get_mkdir_args(&self) -> Vec<(PathBuf, Mode)> {
        self.mkdir_args.borrow().clone()
    }

    pub fn get_symlink_args(&self) -> Vec<(PathBuf, PathBuf)> {
        self.symlink_args.borrow().clone()
    }

    pub fn get_unshare_args(&self) -> Vec<CloneFlags> {
        self.unshare_args.borrow().clone()
    }

    pub fn get_set_capability_args(&self) -> Vec<(CapSet, CapsHashSet)> {
        self.set_capability_args.borrow().clone()
    }
}
