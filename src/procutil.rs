//! C8: fd hygiene and argv scrubbing. Runs right before the target's
//! `execve`, and once more in the monitor right before it starts
//! polling — both places want a process that holds open exactly the
//! fds it's supposed to.

use std::ffi::CString;
use std::fs;
use std::os::unix::io::RawFd;

use anyhow::{Context, Result};
use nix::unistd::close;

/// Closes every open fd above 2 not present in `allowlist`. Prefers
/// iterating `/proc/self/fd`, which only visits fds that are actually
/// open; falls back to a dense `0..OPEN_MAX` scan (ignoring the
/// close-on-a-closed-fd error) if `/proc` isn't mounted yet.
pub fn close_extraneous_fds(allowlist: &[RawFd]) -> Result<()> {
    match fdwalk_proc(allowlist) {
        Ok(()) => Ok(()),
        Err(_) => fdwalk_sysconf(allowlist),
    }
}

fn fdwalk_proc(allowlist: &[RawFd]) -> Result<()> {
    let entries = fs::read_dir("/proc/self/fd").context("/proc/self/fd not available")?;
    for entry in entries {
        let entry = match entry {
            Ok(e) => e,
            Err(_) => continue,
        };
        if let Some(fd) = entry.file_name().to_str().and_then(|s| s.parse::<RawFd>().ok()) {
            close_if_extraneous(fd, allowlist);
        }
    }
    Ok(())
}

fn fdwalk_sysconf(allowlist: &[RawFd]) -> Result<()> {
    let max = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) };
    let max = if max < 0 { 1024 } else { max as RawFd };
    for fd in 0..max {
        close_if_extraneous(fd, allowlist);
    }
    Ok(())
}

fn close_if_extraneous(fd: RawFd, allowlist: &[RawFd]) {
    if fd > 2 && !allowlist.contains(&fd) {
        let _ = close(fd);
    }
}

/// A `clean_argv` result: `argv[0..]` as owned, nul-terminated copies,
/// independent of whatever memory region the original argv lived in.
///
/// The real motivation (per the upstream design this is adapted from)
/// is that `set_procname` overwrites that original region in place to
/// rename the process as seen in `/proc/<pid>/cmdline`; relocating argv
/// into a copy first means that overwrite can never clobber a live
/// pointer. This module only performs the safe half (the copy): the
/// in-place `/proc/<pid>/cmdline` rewrite itself needs the raw argv
/// pointer captured before `fn main` runs, which isn't available from
/// safe Rust entry points, so it's left to `syscall::linux::set_procname`'s
/// simpler `PR_SET_NAME` rename.
pub struct ScrubbedArgv {
    args: Vec<CString>,
}

impl ScrubbedArgv {
    pub fn from_args(args: impl IntoIterator<Item = String>) -> Result<Self> {
        let args = args
            .into_iter()
            .map(|s| CString::new(s).context("argv entry contained a NUL byte"))
            .collect::<Result<Vec<_>>>()?;
        Ok(ScrubbedArgv { args })
    }

    pub fn as_cstrings(&self) -> &[CString] {
        &self.args
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scrubbed_argv_preserves_order() {
        let argv = ScrubbedArgv::from_args(["sandbox".to_string(), "/bin/true".to_string()]).unwrap();
        let strs: Vec<_> = argv.as_cstrings().iter().map(|c| c.to_str().unwrap()).collect();
        assert_eq!(strs, vec!["sandbox", "/bin/true"]);
    }

    #[test]
    fn scrubbed_argv_rejects_embedded_nul() {
        let err = ScrubbedArgv::from_args(["bad\0arg".to_string()]);
        assert!(err.is_err());
    }

    #[test]
    fn close_extraneous_fds_keeps_allowlisted_stdio() {
        // stdio + an arbitrary high fd from the allowlist must survive
        // a close pass even though nothing above 2 is normally open
        // under the test harness.
        close_extraneous_fds(&[0, 1, 2]).unwrap();
    }
}
