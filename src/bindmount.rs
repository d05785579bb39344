//! C2: the bind-mount primitive every other filesystem operation in
//! this crate builds on. A plain `MS_BIND` mount silently drops the
//! flags its source had (the kernel only honors flags given at the
//! *original* mount, never on a bind); getting a read-only or
//! nodev/nosuid bind therefore takes a bind, then a remount that
//! re-applies both the flags the source already had and the flags the
//! caller asked for.

use std::path::Path;

use nix::mount::MsFlags;

use crate::mountinfo;
use crate::syscall::Syscall;

#[derive(Debug, Clone, Copy, Default)]
pub struct BindOptions {
    pub readonly: bool,
    pub private: bool,
    pub allow_devices: bool,
    pub recursive: bool,
}

/// A bind-mount failure, tagged with which of the four steps failed so
/// callers can decide whether it's recoverable (see `fstable`'s
/// `non-fatal`/`if-last-failed` protocol).
#[derive(Debug)]
pub struct BindError {
    pub step: u8,
    pub source: nix::errno::Errno,
}

impl std::fmt::Display for BindError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "bind mount failed at step {}: {}", self.step, self.source)
    }
}

impl std::error::Error for BindError {}

pub fn bind(syscall: &dyn Syscall, src: &Path, dst: &Path, opts: &BindOptions) -> Result<(), BindError> {
    // Step 1: the bind itself.
    let mut bind_flags = MsFlags::MS_BIND;
    if opts.recursive {
        bind_flags |= MsFlags::MS_REC;
    }
    syscall
        .mount(Some(src), dst, None, bind_flags, None)
        .map_err(|e| BindError { step: 1, source: e })?;

    // Step 2: make it private so later mount/unmount activity in the
    // new namespace never propagates back to the source mount.
    if opts.private {
        syscall
            .mount(None, dst, None, MsFlags::MS_PRIVATE | MsFlags::MS_REC, None)
            .map_err(|e| BindError { step: 2, source: e })?;
    }

    // Step 3: remount the top of the bind, re-applying the flags the
    // kernel just dropped plus whatever the caller asked for.
    remount_one(syscall, dst, opts).map_err(|e| BindError { step: 3, source: e })?;

    // Steps 4/5: for a recursive bind, every nested mount under dst
    // needs the same remount treatment individually.
    if opts.recursive {
        let subs = mountinfo::submounts_of(dst).map_err(|_| BindError {
            step: 4,
            source: nix::errno::Errno::EIO,
        })?;
        for sub in subs {
            remount_one(syscall, &sub, opts).map_err(|e| BindError { step: 5, source: e })?;
        }
    }

    Ok(())
}

fn remount_one(syscall: &dyn Syscall, target: &Path, opts: &BindOptions) -> Result<(), nix::errno::Errno> {
    let inherited = mountinfo::mount_flags_of(target).unwrap_or_default();
    let mut flags = MsFlags::MS_BIND | MsFlags::MS_REMOUNT;
    flags |= inherited.to_ms_flags();
    flags |= MsFlags::MS_NOSUID;
    if !opts.allow_devices {
        flags |= MsFlags::MS_NODEV;
    }
    if opts.readonly {
        flags |= MsFlags::MS_RDONLY;
    }
    syscall.mount(None, target, None, flags, None)
}
