//! C5: the namespace builder. Runs entirely inside the freshly cloned
//! mount/pid/ipc namespace, before any of the target's code runs. A
//! strict linear recipe: each step is a precondition for the next, and
//! any failure aborts the whole process rather than leaving a half
//! built root around for the target to observe.

use std::fs;
use std::os::unix::fs::symlink as std_symlink;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use nix::mount::{MntFlags, MsFlags};
use nix::sys::stat::Mode;
use nix::unistd::{Gid, Uid};

use crate::bindmount::{self, BindOptions};
use crate::fstable;
use crate::syscall::Syscall;

/// Where the sandbox's tmpfs is mounted. Persistent across
/// invocations; only its *contents* are ephemeral.
pub const NEW_ROOT: &str = "/srv/thingengine/sandbox-root";

/// Entries never recreated by [`mount_extra_root_dirs`]: either handled
/// by the main recipe already, or meaningless at the root of a fresh
/// tree. `etc` is added on top of the literal spec list because this
/// crate builds `/etc` itself, entry by entry, from the whitelist —
/// letting the generic host-root walk copy it wholesale would bypass
/// that restriction entirely.
const ROOT_BLOCKLIST: &[&str] = &[
    ".", "..", "lib", "lib32", "lib64", "bin", "sbin", "boot", "root", "srv", "home", "media",
    "mnt", "tmp", "app", "proc", "sys", "dev", "var", "run", "etc",
];

pub struct BuildParams {
    pub uid: Uid,
    pub gid: Gid,
    pub prefix_env: String,
    pub caller_cwd: PathBuf,
}

/// Builds the sandbox's root filesystem and pivots into it. On return,
/// the calling process's root and cwd are the new tree; the host root
/// is gone.
pub fn build(syscall: &dyn Syscall, params: &BuildParams) -> Result<()> {
    let old_umask = syscall.umask(Mode::from_bits_truncate(0o000));

    syscall
        .mount(None, Path::new("/"), None, MsFlags::MS_SLAVE | MsFlags::MS_REC, None)
        .context("failed to mark / MS_SLAVE")?;

    fs::create_dir_all(NEW_ROOT).context("failed to create NEW_ROOT")?;
    syscall
        .mount(
            None,
            Path::new(NEW_ROOT),
            Some("tmpfs"),
            MsFlags::MS_NODEV | MsFlags::MS_NOSUID,
            None,
        )
        .context("failed to mount tmpfs over NEW_ROOT")?;

    syscall
        .chdir(Path::new(NEW_ROOT))
        .context("failed to chdir into NEW_ROOT")?;

    let recipe = fstable::build_recipe(params.uid, &params.prefix_env);
    fstable::apply_recipe(syscall, &recipe, params.uid, params.gid).context("filesystem recipe failed")?;

    bind_app(syscall, &params.caller_cwd).context("failed to bind caller's cwd onto /app")?;

    // Post-recipe slot. Deliberately empty: anything placed here runs
    // after every bind but before the root pivot, which is a trap for
    // files that need the *pivoted* view instead. Keep it empty unless
    // you've confirmed your file genuinely needs pre-pivot timing.
    let post_recipe: &[fstable::ResolvedEntry] = &[];
    fstable::apply_recipe(syscall, post_recipe, params.uid, params.gid)?;

    mount_extra_root_dirs(syscall).context("failed to mirror extra host root entries")?;

    pivot(syscall).context("failed to pivot into new root")?;

    syscall.umask(old_umask);
    Ok(())
}

fn bind_app(syscall: &dyn Syscall, caller_cwd: &Path) -> Result<()> {
    syscall
        .mkdir(Path::new("app"), Mode::from_bits_truncate(0o755))
        .context("failed to create /app")?;
    let opts = BindOptions {
        readonly: false,
        private: true,
        allow_devices: false,
        recursive: true,
    };
    bindmount::bind(syscall, caller_cwd, Path::new("app"), &opts)?;
    Ok(())
}

/// Mirrors every host `/` entry the main recipe doesn't already own:
/// directories are recreated and bound read-only, symlinks are
/// recreated verbatim (never bound — a bind would follow the link to
/// the wrong inode once the pivot happens).
fn mount_extra_root_dirs(syscall: &dyn Syscall) -> Result<()> {
    for entry in fs::read_dir("/").context("failed to read host /")? {
        let entry = entry.context("failed to read a host / directory entry")?;
        let name = entry.file_name();
        let name = match name.to_str() {
            Some(n) => n,
            None => continue,
        };
        if ROOT_BLOCKLIST.contains(&name) {
            continue;
        }

        let host_path = entry.path();
        let metadata = fs::symlink_metadata(&host_path)
            .with_context(|| format!("failed to stat {}", host_path.display()))?;

        if metadata.file_type().is_symlink() {
            let target = fs::read_link(&host_path)
                .with_context(|| format!("failed to read symlink {}", host_path.display()))?;
            std_symlink(&target, name)
                .with_context(|| format!("failed to recreate symlink {}", name))?;
        } else if metadata.is_dir() {
            syscall
                .mkdir(Path::new(name), Mode::from_bits_truncate(0o755))
                .with_context(|| format!("failed to mkdir {}", name))?;
            let opts = BindOptions {
                readonly: true,
                private: false,
                allow_devices: false,
                recursive: true,
            };
            bindmount::bind(syscall, &host_path, Path::new(name), &opts)
                .with_context(|| format!("failed to bind {}", name))?;
        }
    }
    Ok(())
}

fn pivot(syscall: &dyn Syscall) -> Result<()> {
    syscall
        .mkdir(Path::new(".oldroot"), Mode::from_bits_truncate(0o700))
        .context("failed to create .oldroot")?;
    syscall
        .pivot_root(Path::new("."), Path::new(".oldroot"))
        .context("pivot_root failed")?;
    syscall.chdir(Path::new("/")).context("failed to chdir to new /")?;

    syscall
        .mount(None, Path::new("/.oldroot"), None, MsFlags::MS_PRIVATE | MsFlags::MS_REC, None)
        .context("failed to mark .oldroot private")?;
    syscall
        .umount2(Path::new("/.oldroot"), MntFlags::MNT_DETACH)
        .context("failed to detach .oldroot")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syscall::test::TestHelperSyscall;

    #[test]
    fn pivot_marks_oldroot_private_then_detaches() {
        let syscall = TestHelperSyscall::default();
        pivot(&syscall).unwrap();
        let mounts = syscall.get_mount_args();
        assert_eq!(mounts.len(), 1);
        assert!(mounts[0].flags.contains(MsFlags::MS_PRIVATE));
        let detaches = syscall.get_umount2_args();
        assert_eq!(detaches, vec![(PathBuf::from("/.oldroot"), MntFlags::MNT_DETACH)]);
        let roots = syscall.get_pivot_root_args();
        assert_eq!(roots, vec![(PathBuf::from("."), PathBuf::from(".oldroot"))]);
    }

    #[test]
    fn root_blocklist_excludes_etc_from_generic_mirroring() {
        assert!(ROOT_BLOCKLIST.contains(&"etc"));
        assert!(ROOT_BLOCKLIST.contains(&"lib32"));
        assert!(!ROOT_BLOCKLIST.contains(&"opt"));
    }

    #[test]
    fn bind_app_mounts_caller_cwd_privately() {
        let syscall = TestHelperSyscall::default();
        bind_app(&syscall, Path::new("/home/user/project")).unwrap();
        let mounts = syscall.get_mount_args();
        assert!(mounts.iter().any(|m| m.flags.contains(MsFlags::MS_PRIVATE)));
        assert!(mounts
            .iter()
            .any(|m| m.source.as_deref() == Some(Path::new("/home/user/project"))));
    }

    #[test]
    fn bind_app_private_step_failure_is_fatal() {
        let syscall = TestHelperSyscall::default();
        syscall.fail_private_targets.borrow_mut().push("app".into());
        let err = bind_app(&syscall, Path::new("/home/user/project")).unwrap_err();
        assert!(format!("{err:#}").contains("step 2"));
    }
}
