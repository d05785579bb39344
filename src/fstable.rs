//! C3: the filesystem table engine. Interprets a declarative recipe —
//! directories, symlinks, device nodes, bind points, static mounts,
//! remounts, and the synthesized `/etc/passwd`/`/etc/group` — into real
//! filesystem state under the new root. The recipe stays a plain
//! static array of records; this module is only the small dispatch on
//! `kind` that walks it.

use std::path::Path;

use anyhow::{anyhow, Result};
use nix::mount::MsFlags;
use nix::sys::stat::Mode;
use nix::unistd::{Gid, Uid};

use crate::bindmount::{self, BindOptions};
use crate::etc_whitelist::ETC_WHITELIST;
use crate::syscall::Syscall;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Directory,
    RegularFile,
    Symlink,
    ConditionalSymlink,
    Bind,
    BindReadonly,
    FsMount,
    ShmMount,
    Remount,
    DeviceNode,
    SynthPasswd,
    SynthGroup,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EntryFlags {
    pub non_fatal: bool,
    pub if_last_failed: bool,
    pub allow_devices: bool,
}

impl EntryFlags {
    pub const NONE: EntryFlags = EntryFlags {
        non_fatal: false,
        if_last_failed: false,
        allow_devices: false,
    };
    const NON_FATAL: EntryFlags = EntryFlags {
        non_fatal: true,
        if_last_failed: false,
        allow_devices: false,
    };
    const IF_LAST_FAILED: EntryFlags = EntryFlags {
        non_fatal: false,
        if_last_failed: true,
        allow_devices: false,
    };
    const DEVICE: EntryFlags = EntryFlags {
        non_fatal: false,
        if_last_failed: false,
        allow_devices: true,
    };
}

/// A recipe entry as it appears in the static table: string fields may
/// still contain the `{uid}` placeholder.
#[derive(Debug, Clone, Copy)]
pub struct RecipeEntry {
    pub kind: Kind,
    pub name: &'static str,
    pub mode: u32,
    pub data: &'static str,
    pub flags: EntryFlags,
}

/// A recipe entry with placeholders already substituted, ready to run.
#[derive(Debug, Clone)]
pub struct ResolvedEntry {
    pub kind: Kind,
    pub name: String,
    pub mode: u32,
    pub data: String,
    pub flags: EntryFlags,
}

fn resolve(template: &str, uid: Uid) -> String {
    template.replace("{uid}", &uid.to_string())
}

impl RecipeEntry {
    fn resolved(&self, uid: Uid) -> ResolvedEntry {
        ResolvedEntry {
            kind: self.kind,
            name: resolve(self.name, uid),
            mode: self.mode,
            data: resolve(self.data, uid),
            flags: self.flags,
        }
    }
}

/// The fixed topology of the sandbox root: device nodes, `/proc`,
/// `/sys`, and the usr-merge-aware compatibility binds. `/app`, `/etc`,
/// and `THINGENGINE_PREFIX` entries are appended at build time by
/// [`build_recipe`] since they depend on runtime input.
const RECIPE: &[RecipeEntry] = &[
    RecipeEntry { kind: Kind::Directory, name: "dev", mode: 0o755, data: "", flags: EntryFlags::NONE },
    RecipeEntry { kind: Kind::DeviceNode, name: "dev/null", mode: 0o666, data: "/dev/null", flags: EntryFlags::DEVICE },
    RecipeEntry { kind: Kind::DeviceNode, name: "dev/zero", mode: 0o666, data: "/dev/zero", flags: EntryFlags::DEVICE },
    RecipeEntry { kind: Kind::DeviceNode, name: "dev/full", mode: 0o666, data: "/dev/full", flags: EntryFlags::DEVICE },
    RecipeEntry { kind: Kind::DeviceNode, name: "dev/random", mode: 0o666, data: "/dev/random", flags: EntryFlags::DEVICE },
    RecipeEntry { kind: Kind::DeviceNode, name: "dev/urandom", mode: 0o666, data: "/dev/urandom", flags: EntryFlags::DEVICE },
    RecipeEntry { kind: Kind::DeviceNode, name: "dev/tty", mode: 0o666, data: "/dev/tty", flags: EntryFlags::DEVICE },
    RecipeEntry { kind: Kind::Directory, name: "dev/pts", mode: 0o755, data: "", flags: EntryFlags::NONE },
    RecipeEntry { kind: Kind::FsMount, name: "dev/pts", mode: 0, data: "", flags: EntryFlags::NONE },
    RecipeEntry { kind: Kind::Symlink, name: "dev/ptmx", mode: 0, data: "pts/ptmx", flags: EntryFlags::NONE },
    RecipeEntry { kind: Kind::Directory, name: "dev/shm", mode: 0o1777, data: "", flags: EntryFlags::NONE },
    RecipeEntry { kind: Kind::ShmMount, name: "dev/shm", mode: 0, data: "", flags: EntryFlags::NONE },
    RecipeEntry { kind: Kind::Symlink, name: "dev/fd", mode: 0, data: "/proc/self/fd", flags: EntryFlags::NONE },
    RecipeEntry { kind: Kind::Symlink, name: "dev/stdin", mode: 0, data: "/proc/self/fd/0", flags: EntryFlags::NONE },
    RecipeEntry { kind: Kind::Symlink, name: "dev/stdout", mode: 0, data: "/proc/self/fd/1", flags: EntryFlags::NONE },
    RecipeEntry { kind: Kind::Symlink, name: "dev/stderr", mode: 0, data: "/proc/self/fd/2", flags: EntryFlags::NONE },
    RecipeEntry { kind: Kind::Directory, name: "proc", mode: 0o555, data: "", flags: EntryFlags::NONE },
    RecipeEntry { kind: Kind::FsMount, name: "proc", mode: 0, data: "", flags: EntryFlags::NONE },
    RecipeEntry { kind: Kind::Bind, name: "proc/sys", mode: 0, data: "proc/sys", flags: EntryFlags::NONE },
    RecipeEntry { kind: Kind::Remount, name: "proc/sys", mode: 0, data: "", flags: EntryFlags::NONE },
    RecipeEntry { kind: Kind::Directory, name: "sys", mode: 0o755, data: "", flags: EntryFlags::NONE },
    RecipeEntry { kind: Kind::Directory, name: "sys/block", mode: 0o755, data: "", flags: EntryFlags::NON_FATAL },
    RecipeEntry { kind: Kind::BindReadonly, name: "sys/block", mode: 0, data: "/sys/block", flags: EntryFlags::NON_FATAL },
    RecipeEntry { kind: Kind::Directory, name: "sys/bus", mode: 0o755, data: "", flags: EntryFlags::NON_FATAL },
    RecipeEntry { kind: Kind::BindReadonly, name: "sys/bus", mode: 0, data: "/sys/bus", flags: EntryFlags::NON_FATAL },
    RecipeEntry { kind: Kind::Directory, name: "sys/class", mode: 0o755, data: "", flags: EntryFlags::NON_FATAL },
    RecipeEntry { kind: Kind::BindReadonly, name: "sys/class", mode: 0, data: "/sys/class", flags: EntryFlags::NON_FATAL },
    RecipeEntry { kind: Kind::Directory, name: "sys/dev", mode: 0o755, data: "", flags: EntryFlags::NON_FATAL },
    RecipeEntry { kind: Kind::BindReadonly, name: "sys/dev", mode: 0, data: "/sys/dev", flags: EntryFlags::NON_FATAL },
    RecipeEntry { kind: Kind::Directory, name: "sys/devices", mode: 0o755, data: "", flags: EntryFlags::NON_FATAL },
    RecipeEntry { kind: Kind::BindReadonly, name: "sys/devices", mode: 0, data: "/sys/devices", flags: EntryFlags::NON_FATAL },
    // usr-merge-aware compat binds: try the merged path first, fall
    // back to the classic FHS path only if that one was absent.
    RecipeEntry { kind: Kind::Directory, name: "lib", mode: 0o755, data: "", flags: EntryFlags::NON_FATAL },
    RecipeEntry { kind: Kind::BindReadonly, name: "lib", mode: 0, data: "/usr/lib", flags: EntryFlags::NON_FATAL },
    RecipeEntry { kind: Kind::BindReadonly, name: "lib", mode: 0, data: "/lib", flags: EntryFlags::IF_LAST_FAILED },
    RecipeEntry { kind: Kind::Directory, name: "lib64", mode: 0o755, data: "", flags: EntryFlags::NON_FATAL },
    RecipeEntry { kind: Kind::BindReadonly, name: "lib64", mode: 0, data: "/usr/lib64", flags: EntryFlags::NON_FATAL },
    RecipeEntry { kind: Kind::BindReadonly, name: "lib64", mode: 0, data: "/lib64", flags: EntryFlags::IF_LAST_FAILED },
    RecipeEntry { kind: Kind::ConditionalSymlink, name: "lib32", mode: 0, data: "usr/lib32", flags: EntryFlags::NONE },
    RecipeEntry { kind: Kind::Directory, name: "bin", mode: 0o755, data: "", flags: EntryFlags::NON_FATAL },
    RecipeEntry { kind: Kind::BindReadonly, name: "bin", mode: 0, data: "/usr/bin", flags: EntryFlags::NON_FATAL },
    RecipeEntry { kind: Kind::BindReadonly, name: "bin", mode: 0, data: "/bin", flags: EntryFlags::IF_LAST_FAILED },
    RecipeEntry { kind: Kind::Directory, name: "sbin", mode: 0o755, data: "", flags: EntryFlags::NON_FATAL },
    RecipeEntry { kind: Kind::BindReadonly, name: "sbin", mode: 0, data: "/usr/sbin", flags: EntryFlags::NON_FATAL },
    RecipeEntry { kind: Kind::BindReadonly, name: "sbin", mode: 0, data: "/sbin", flags: EntryFlags::IF_LAST_FAILED },
    // fresh per-invocation scratch space
    RecipeEntry { kind: Kind::Directory, name: "tmp", mode: 0o1777, data: "", flags: EntryFlags::NONE },
    RecipeEntry { kind: Kind::Directory, name: "var", mode: 0o755, data: "", flags: EntryFlags::NONE },
    RecipeEntry { kind: Kind::Directory, name: "var/tmp", mode: 0o1777, data: "", flags: EntryFlags::NONE },
    RecipeEntry { kind: Kind::Directory, name: "run", mode: 0o755, data: "", flags: EntryFlags::NONE },
    RecipeEntry { kind: Kind::Symlink, name: "var/run", mode: 0, data: "../run", flags: EntryFlags::NONE },
    RecipeEntry { kind: Kind::Directory, name: "etc", mode: 0o755, data: "", flags: EntryFlags::NONE },
];

/// The static fs-mount/shm-mount table (`spec.md` §6): fs-type, mount
/// data, and flags for each recognized table row.
fn static_mount_row(name: &str) -> Option<(&'static str, &'static str, MsFlags)> {
    match name {
        "proc" => Some(("proc", "", MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV)),
        "dev/pts" => Some(("devpts", "newinstance,ptmxmode=0666,mode=620", MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC)),
        "dev/shm" => Some(("tmpfs", "mode=1777", MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_STRICTATIME)),
        _ => None,
    }
}

/// Builds the full entry list for this invocation: the fixed topology,
/// the `/etc` whitelist (synthesizing `passwd`/`group` instead of
/// binding the host's), and one read-only bind per
/// `THINGENGINE_PREFIX` component.
pub fn build_recipe(uid: Uid, prefix_env: &str) -> Vec<ResolvedEntry> {
    let mut entries: Vec<ResolvedEntry> = RECIPE.iter().map(|e| e.resolved(uid)).collect();

    for name in ETC_WHITELIST {
        if *name == "passwd" || *name == "group" {
            continue;
        }
        entries.push(ResolvedEntry {
            kind: Kind::BindReadonly,
            name: format!("etc/{name}"),
            mode: 0,
            data: format!("/etc/{name}"),
            flags: EntryFlags::NON_FATAL,
        });
    }
    entries.push(ResolvedEntry {
        kind: Kind::SynthPasswd,
        name: "etc/passwd".to_string(),
        mode: 0o644,
        data: String::new(),
        flags: EntryFlags::NONE,
    });
    entries.push(ResolvedEntry {
        kind: Kind::SynthGroup,
        name: "etc/group".to_string(),
        mode: 0o644,
        data: String::new(),
        flags: EntryFlags::NONE,
    });

    for path in prefix_env.split(':').filter(|s| !s.is_empty()) {
        let trimmed = path.trim_start_matches('/');
        entries.push(ResolvedEntry {
            kind: Kind::BindReadonly,
            name: trimmed.to_string(),
            mode: 0,
            data: path.to_string(),
            flags: EntryFlags::NON_FATAL,
        });
    }

    entries
}

/// `if-last-failed` may only follow an entry marked `non-fatal`;
/// carrying the flag across unrelated entries is a programming error
/// in the recipe, not a runtime condition.
fn validate(entries: &[ResolvedEntry]) -> Result<()> {
    for (i, entry) in entries.iter().enumerate() {
        if entry.flags.if_last_failed {
            let prev_non_fatal = i > 0 && entries[i - 1].flags.non_fatal;
            if !prev_non_fatal {
                anyhow::bail!(
                    "recipe entry {} ({:?}) is marked if-last-failed but does not follow a non-fatal entry",
                    entry.name,
                    entry.kind
                );
            }
        }
    }
    Ok(())
}

struct EntryError {
    recoverable: bool,
    source: anyhow::Error,
}

impl From<bindmount::BindError> for EntryError {
    fn from(e: bindmount::BindError) -> Self {
        EntryError { recoverable: e.step == 1, source: anyhow!(e) }
    }
}

fn fatal(source: anyhow::Error) -> EntryError {
    EntryError { recoverable: false, source }
}

/// Runs every entry of `entries` in order against `syscall`, enforcing
/// the `non-fatal`/`if-last-failed` two-step recovery protocol.
pub fn apply_recipe(syscall: &dyn Syscall, entries: &[ResolvedEntry], uid: Uid, gid: Gid) -> Result<()> {
    validate(entries)?;

    let mut last_failed = false;
    for entry in entries {
        if entry.flags.if_last_failed && !last_failed {
            continue;
        }
        last_failed = false;

        if let Err(e) = apply_entry(syscall, entry, uid, gid) {
            if entry.flags.non_fatal && e.recoverable {
                log::debug!("non-fatal recipe entry {} failed: {:#}", entry.name, e.source);
                last_failed = true;
            } else {
                return Err(e.source.context(format!("recipe entry {:?} failed", entry.name)));
            }
        }
    }
    Ok(())
}

fn apply_entry(syscall: &dyn Syscall, entry: &ResolvedEntry, uid: Uid, gid: Gid) -> Result<(), EntryError> {
    let name = Path::new(&entry.name);
    match entry.kind {
        Kind::Directory => syscall
            .mkdir(name, Mode::from_bits_truncate(entry.mode))
            .map_err(|e| fatal(anyhow!(e))),

        Kind::RegularFile => std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(name)
            .map(drop)
            .map_err(|e| fatal(anyhow!(e))),

        Kind::Symlink => syscall
            .symlink(Path::new(&entry.data), name)
            .map_err(|e| fatal(anyhow!(e))),

        Kind::ConditionalSymlink => {
            let target_under_usr = entry.data.strip_prefix("usr/").unwrap_or(&entry.data);
            let resolved = Path::new("/usr").join(target_under_usr);
            if resolved.exists() {
                syscall
                    .symlink(Path::new(&entry.data), name)
                    .map_err(|e| fatal(anyhow!(e)))
            } else {
                Ok(())
            }
        }

        Kind::Bind | Kind::BindReadonly => {
            let opts = BindOptions {
                readonly: entry.kind == Kind::BindReadonly,
                private: false,
                allow_devices: entry.flags.allow_devices,
                recursive: true,
            };
            bindmount::bind(syscall, Path::new(&entry.data), name, &opts).map_err(EntryError::from)
        }

        Kind::FsMount | Kind::ShmMount => {
            let (fstype, data, flags) =
                static_mount_row(&entry.name).ok_or_else(|| fatal(anyhow!("no static mount table row for {:?}", entry.name)))?;
            let data = if data.is_empty() { None } else { Some(data) };
            syscall
                .mount(None, name, Some(fstype), flags, data)
                .map_err(|e| fatal(anyhow!(e)))
        }

        Kind::Remount => {
            // The only remount this recipe needs is hardening proc/sys
            // back to read-only after the self-bind above.
            let current = crate::mountinfo::mount_flags_of(name).unwrap_or_default();
            let flags = MsFlags::MS_REMOUNT | current.to_ms_flags() | MsFlags::MS_RDONLY;
            syscall.mount(None, name, None, flags, None).map_err(|e| fatal(anyhow!(e)))
        }

        Kind::DeviceNode => {
            std::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .open(name)
                .map_err(|e| fatal(anyhow!(e)))?;
            let opts = BindOptions {
                readonly: false,
                private: false,
                allow_devices: true,
                recursive: false,
            };
            bindmount::bind(syscall, Path::new(&entry.data), name, &opts).map_err(EntryError::from)
        }

        Kind::SynthPasswd => {
            let login = lookup_login_name(uid).unwrap_or_else(|| "sandbox".to_string());
            let contents = format!(
                "{login}:x:{uid}:{gid}:sandbox:/app:/bin/sh\nnfsnobody:x:65534:65534:Anonymous NFS User:/var/lib/nfs:/sbin/nologin\n",
                login = login,
                uid = uid,
                gid = gid,
            );
            std::fs::write(name, contents).map_err(|e| fatal(anyhow!(e)))
        }

        Kind::SynthGroup => {
            let contents = format!(
                "sandbox:x:{gid}:\nnfsnobody:x:65534:\n",
                gid = gid,
            );
            std::fs::write(name, contents).map_err(|e| fatal(anyhow!(e)))
        }
    }
}

/// Best-effort `getpwuid` lookup for the synthesized passwd entry; a
/// failed lookup isn't fatal, the caller falls back to a fixed name.
fn lookup_login_name(uid: Uid) -> Option<String> {
    let mut buf = vec![0_i8; 1024];
    let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut result: *mut libc::passwd = std::ptr::null_mut();
    loop {
        let ret = unsafe {
            libc::getpwuid_r(uid.as_raw(), &mut pwd, buf.as_mut_ptr(), buf.len(), &mut result)
        };
        if ret == libc::ERANGE {
            buf.resize(buf.len() * 2, 0);
            continue;
        }
        break;
    }
    if result.is_null() {
        return None;
    }
    // `pw_name` points into `buf`, not a malloc'd region `CString` could
    // take ownership of — borrow it as a `CStr` instead.
    let name = unsafe { std::ffi::CStr::from_ptr(pwd.pw_name) };
    Some(name.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syscall::test::TestHelperSyscall;
    use nix::unistd::{Gid, Uid};

    fn uid() -> Uid {
        Uid::from_raw(1000)
    }
    fn gid() -> Gid {
        Gid::from_raw(1000)
    }

    #[test]
    fn validate_rejects_orphaned_if_last_failed() {
        let entries = vec![ResolvedEntry {
            kind: Kind::BindReadonly,
            name: "x".into(),
            mode: 0,
            data: "/x".into(),
            flags: EntryFlags::IF_LAST_FAILED,
        }];
        assert!(validate(&entries).is_err());
    }

    #[test]
    fn if_last_failed_skipped_when_previous_succeeds() {
        let syscall = TestHelperSyscall::default();
        let entries = vec![
            ResolvedEntry { kind: Kind::Directory, name: "a".into(), mode: 0o755, data: String::new(), flags: EntryFlags::NON_FATAL },
            ResolvedEntry { kind: Kind::Directory, name: "b".into(), mode: 0o755, data: String::new(), flags: EntryFlags::IF_LAST_FAILED },
        ];
        apply_recipe(&syscall, &entries, uid(), gid()).unwrap();
        assert_eq!(syscall.get_mkdir_args().len(), 1);
    }

    #[test]
    fn if_last_failed_runs_when_previous_fails_at_step_one() {
        let syscall = TestHelperSyscall::default();
        syscall.fail_mount_targets.borrow_mut().push("missing".into());
        let entries = vec![
            ResolvedEntry { kind: Kind::BindReadonly, name: "missing".into(), mode: 0, data: "/nope".into(), flags: EntryFlags::NON_FATAL },
            ResolvedEntry { kind: Kind::Directory, name: "fallback".into(), mode: 0o755, data: String::new(), flags: EntryFlags::IF_LAST_FAILED },
        ];
        apply_recipe(&syscall, &entries, uid(), gid()).unwrap();
        assert_eq!(syscall.get_mkdir_args().len(), 1);
        assert_eq!(syscall.get_mkdir_args()[0].0, Path::new("fallback"));
    }

    #[test]
    fn step_two_bind_failure_is_not_recoverable() {
        let err = bindmount::BindError {
            step: 2,
            source: nix::errno::Errno::EIO,
        };
        let entry_err: EntryError = err.into();
        assert!(!entry_err.recoverable);
    }

    #[test]
    fn build_recipe_resolves_uid_placeholder_and_prefix_entries() {
        let entries = build_recipe(uid(), "/opt/a:/opt/b");
        assert!(entries.iter().any(|e| e.name == "opt/a" && e.data == "/opt/a"));
        assert!(entries.iter().any(|e| e.name == "opt/b" && e.data == "/opt/b"));
        assert!(entries.iter().any(|e| e.kind == Kind::SynthPasswd));
        assert!(!entries.iter().any(|e| e.name == "etc/passwd" && e.kind == Kind::BindReadonly));
    }

    #[test]
    fn conditional_symlink_skipped_when_target_absent() {
        let syscall = TestHelperSyscall::default();
        let entries = vec![ResolvedEntry {
            kind: Kind::ConditionalSymlink,
            name: "lib32".into(),
            mode: 0,
            data: "usr/lib32-does-not-exist-xyz".into(),
            flags: EntryFlags::NONE,
        }];
        apply_recipe(&syscall, &entries, uid(), gid()).unwrap();
        assert!(syscall.get_symlink_args().is_empty());
    }

    // `apply_entry` resolves `entry.name` relative to the process's cwd,
    // so exercising the real file writes (as opposed to the recorded
    // fake above) needs an actual directory and an actual chdir — hence
    // `serial_test`, since two tests changing cwd concurrently would
    // stomp on each other.
    #[test]
    #[serial_test::serial]
    fn synth_passwd_and_group_write_real_files() {
        let dir = tempfile::tempdir().unwrap();
        let orig = std::env::current_dir().unwrap();
        std::env::set_current_dir(dir.path()).unwrap();

        let syscall = TestHelperSyscall::default();
        let entries = vec![
            ResolvedEntry { kind: Kind::SynthPasswd, name: "passwd".into(), mode: 0o644, data: String::new(), flags: EntryFlags::NONE },
            ResolvedEntry { kind: Kind::SynthGroup, name: "group".into(), mode: 0o644, data: String::new(), flags: EntryFlags::NONE },
        ];
        apply_recipe(&syscall, &entries, uid(), gid()).unwrap();

        let passwd = std::fs::read_to_string(dir.path().join("passwd")).unwrap();
        assert!(passwd.contains(":x:1000:1000:"));
        assert!(passwd.contains("nfsnobody:x:65534:65534"));
        let group = std::fs::read_to_string(dir.path().join("group")).unwrap();
        assert!(group.contains(":x:1000:"));
        assert!(group.contains("nfsnobody:x:65534:"));

        std::env::set_current_dir(orig).unwrap();
    }
}
