//! C7: the wrapper variant. Instead of building the sandbox itself,
//! this assembles an argv for the external `bwrap` (bubblewrap) helper
//! that encodes the same filesystem policy as the native path, then
//! execs it. Useful on hosts where the native path's capability
//! requirements aren't available to the caller.

use std::env;
use std::ffi::CString;
use std::path::Path;

use anyhow::{Context, Result};
use nix::unistd::execvp;

use crate::etc_whitelist::ETC_WHITELIST;

pub struct WrapperArgs {
    pub prefix_env: String,
    pub cwd: String,
    pub command: Vec<String>,
    pub ci_mode: bool,
}

/// Builds the full `bwrap` argv in the fixed order the helper expects:
/// base flags, usr-dir binds, the API filesystem, the app bind, the
/// prefix binds, the `/etc` whitelist, a `--` separator, then the
/// child's own argv.
pub fn build_argv(args: &WrapperArgs) -> Vec<String> {
    let mut argv = vec!["bwrap".to_string()];
    add_base_args(&mut argv);
    add_usr_dirs(&mut argv);
    add_api_fs(&mut argv);
    add_app_dir(&mut argv, &args.cwd);
    add_prefix_dirs(&mut argv, &args.prefix_env);
    add_etc(&mut argv);
    argv.push("--".to_string());
    argv.extend(args.command.iter().cloned());
    argv
}

fn add_base_args(argv: &mut Vec<String>) {
    argv.extend(
        ["--unshare-ipc", "--unshare-pid", "--new-session", "--info-fd", "3"]
            .iter()
            .map(|s| s.to_string()),
    );
}

fn add_usr_dirs(argv: &mut Vec<String>) {
    for dir in ["/usr", "/lib", "/lib64", "/bin", "/sbin", "/opt"] {
        argv.push("--ro-bind".to_string());
        argv.push(dir.to_string());
        argv.push(dir.to_string());
    }
}

fn add_api_fs(argv: &mut Vec<String>) {
    argv.push("--proc".to_string());
    argv.push("/proc".to_string());
    for dir in ["/tmp", "/var/tmp", "/run"] {
        argv.push("--dir".to_string());
        argv.push(dir.to_string());
    }
    argv.push("--symlink".to_string());
    argv.push("../run".to_string());
    argv.push("/var/run".to_string());
    argv.push("--dev".to_string());
    argv.push("/dev".to_string());
    for dir in ["/sys/block", "/sys/bus", "/sys/class", "/sys/dev", "/sys/devices"] {
        argv.push("--ro-bind".to_string());
        argv.push(dir.to_string());
        argv.push(dir.to_string());
    }
}

fn add_app_dir(argv: &mut Vec<String>, cwd: &str) {
    argv.push("--chdir".to_string());
    argv.push("/app".to_string());
    argv.push("--bind".to_string());
    argv.push(cwd.to_string());
    argv.push("/app".to_string());
}

fn add_prefix_dirs(argv: &mut Vec<String>, prefix_env: &str) {
    for p in prefix_env.split(':').filter(|s| !s.is_empty()) {
        argv.push("--ro-bind".to_string());
        argv.push(p.to_string());
        argv.push(p.to_string());
    }
}

fn add_etc(argv: &mut Vec<String>) {
    for name in ETC_WHITELIST {
        let path = format!("/etc/{name}");
        if Path::new(&path).exists() {
            argv.push("--ro-bind".to_string());
            argv.push(path.clone());
            argv.push(path);
        }
    }
}

/// Reads the environment variables the wrapper needs and assembles the
/// argv, honoring `CI` (dump argv to stderr first).
pub fn run(command: Vec<String>) -> Result<()> {
    let prefix_env = env::var("THINGENGINE_PREFIX").context("THINGENGINE_PREFIX not set")?;
    let cwd = env::current_dir().context("failed to read current directory")?;
    let args = WrapperArgs {
        prefix_env,
        cwd: cwd.to_string_lossy().into_owned(),
        command,
        ci_mode: env::var_os("CI").is_some(),
    };

    redirect_log_streams().context("failed to redirect stdout/stderr to the log stream")?;

    let argv = build_argv(&args);
    if args.ci_mode {
        eprintln!("{}", argv.join(" "));
    }

    let cstrings: Vec<CString> = argv
        .iter()
        .map(|s| CString::new(s.as_str()).expect("argv entry contained a NUL byte"))
        .collect();
    execvp(&cstrings[0], &cstrings).context("failed to exec bwrap")?;
    unreachable!("execvp only returns on error, which is handled above");
}

#[cfg(feature = "journald")]
fn redirect_log_streams() -> Result<()> {
    if env::var_os("THINGENGINE_DISABLE_SYSTEMD").is_some() {
        return Ok(());
    }
    let user_id = env::var("THINGENGINE_USER_ID").context("THINGENGINE_USER_ID not set")?;
    let identifier = format!("thingengine-child-{user_id}");

    let stdout_fd = open_log_stream(&identifier, libc::LOG_INFO)?;
    nix::unistd::dup2(stdout_fd, 1).context("failed to redirect stdout to the log stream")?;
    nix::unistd::close(stdout_fd).context("failed to close the stdout log stream fd")?;

    let stderr_fd = open_log_stream(&identifier, libc::LOG_WARNING)?;
    nix::unistd::dup2(stderr_fd, 2).context("failed to redirect stderr to the log stream")?;
    nix::unistd::close(stderr_fd).context("failed to close the stderr log stream fd")?;

    Ok(())
}

#[cfg(not(feature = "journald"))]
fn redirect_log_streams() -> Result<()> {
    Ok(())
}

/// Opens a write end of a systemd journal stream, treated as an opaque
/// external primitive: an identifier and priority go in, a raw fd
/// suitable for `dup2`-ing onto stdout/stderr comes out. Backed by the
/// `libsystemd` C ABI that the `systemd` crate already links against.
#[cfg(feature = "journald")]
fn open_log_stream(identifier: &str, level: libc::c_int) -> Result<std::os::unix::io::RawFd> {
    let c_identifier = CString::new(identifier).context("log stream identifier contained a NUL byte")?;
    let fd = unsafe { sd_journal_stream_fd(c_identifier.as_ptr(), level, 1) };
    if fd < 0 {
        anyhow::bail!("sd_journal_stream_fd failed: {}", nix::errno::Errno::from_raw(-fd));
    }
    Ok(fd)
}

#[cfg(feature = "journald")]
extern "C" {
    fn sd_journal_stream_fd(identifier: *const libc::c_char, priority: libc::c_int, level_prefix: libc::c_int) -> libc::c_int;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_argv_matches_fixed_order() {
        let args = WrapperArgs {
            prefix_env: "/a:/b".to_string(),
            cwd: "/home/user/app".to_string(),
            command: vec!["/bin/echo".to_string(), "hi".to_string()],
            ci_mode: false,
        };
        let argv = build_argv(&args);
        assert_eq!(argv[0], "bwrap");
        assert_eq!(
            &argv[1..6],
            &["--unshare-ipc", "--unshare-pid", "--new-session", "--info-fd", "3"]
        );
        let joined = argv.join(" ");
        assert!(joined.contains("--ro-bind /a /a --ro-bind /b /b"));
        assert!(joined.ends_with("-- /bin/echo hi"));
    }

    #[test]
    fn etc_whitelist_entries_only_included_when_present_on_host() {
        let mut argv = Vec::new();
        add_etc(&mut argv);
        // /etc/shadow is never on the whitelist, so it can never appear
        // regardless of host state.
        assert!(!argv.iter().any(|a| a.contains("shadow")));
    }
}
