//! Capability management (C4). The launcher typically starts as a
//! setuid-root binary; this module narrows that privilege down to the
//! one capability the namespace builder actually needs, then drops it
//! entirely once the sandbox's mounts are in place.

use anyhow::{Context, Result};
use caps::{CapSet, Capability, CapsHashSet};
use nix::unistd::{geteuid, getuid};

use crate::syscall::Syscall;

fn only(cap: Capability) -> CapsHashSet {
    let mut set = CapsHashSet::new();
    set.insert(cap);
    set
}

/// Drops from setuid-root down to the real uid, keeping exactly
/// `CAP_SYS_ADMIN` in the permitted and effective sets, then sets
/// `no_new_privs` so the dropped privileges can never be regained via
/// `execve`.
pub fn acquire(syscall: &dyn Syscall) -> Result<()> {
    let euid = geteuid();
    let ruid = getuid();

    if euid != ruid {
        syscall
            .set_keep_capabilities(true)
            .context("prctl(PR_SET_KEEPCAPS) failed")?;
        syscall.setuid(ruid).context("setuid(real uid) failed")?;
    }

    let keep = only(Capability::CAP_SYS_ADMIN);
    syscall
        .set_capability(CapSet::Permitted, &keep)
        .context("failed to set permitted capabilities")?;
    syscall
        .set_capability(CapSet::Effective, &keep)
        .context("failed to set effective capabilities")?;
    syscall
        .set_capability(CapSet::Inheritable, &CapsHashSet::new())
        .context("failed to clear inheritable capabilities")?;

    syscall
        .set_no_new_privs()
        .context("prctl(PR_SET_NO_NEW_PRIVS) failed")?;

    Ok(())
}

/// Zeroes the effective, permitted, and inheritable capability sets.
/// Called once the namespace builder has finished pivoting the root,
/// right before the target process is forked.
pub fn drop_all(syscall: &dyn Syscall) -> Result<()> {
    let empty = CapsHashSet::new();
    syscall
        .set_capability(CapSet::Effective, &empty)
        .context("failed to clear effective capabilities")?;
    syscall
        .set_capability(CapSet::Permitted, &empty)
        .context("failed to clear permitted capabilities")?;
    syscall
        .set_capability(CapSet::Inheritable, &empty)
        .context("failed to clear inheritable capabilities")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syscall::test::TestHelperSyscall;

    #[test]
    fn drop_all_clears_every_set() {
        let syscall = TestHelperSyscall::default();
        drop_all(&syscall).unwrap();
        let calls = syscall.get_set_capability_args();
        assert_eq!(calls.len(), 3);
        assert!(calls.iter().all(|(_, set)| set.is_empty()));
    }

    #[test]
    fn acquire_keeps_only_sys_admin() {
        let syscall = TestHelperSyscall::default();
        acquire(&syscall).unwrap();
        let calls = syscall.get_set_capability_args();
        let permitted = calls
            .iter()
            .find(|(set, _)| *set == CapSet::Permitted)
            .unwrap();
        assert_eq!(permitted.1, only(Capability::CAP_SYS_ADMIN));
    }
}
