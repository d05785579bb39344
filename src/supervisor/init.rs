//! Pid-1's reap loop. Runs inside the new PID namespace and never
//! leaves it; its only job is noticing when the target exits and
//! relaying that status to the monitor.

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;

use super::eventchan::EventChannel;

/// Reaps every child until `wait()` reports `ECHILD`, reporting the
/// target's exit status over `events` the moment it's seen.
pub fn run(events: &EventChannel, target: Pid) -> Result<()> {
    loop {
        match waitpid(None, None) {
            Ok(status) => {
                if status.pid() == Some(target) {
                    events
                        .report_status(exit_code_of(&status))
                        .context("failed to report target status")?;
                }
            }
            Err(Errno::EINTR) => continue,
            Err(Errno::ECHILD) => return Ok(()),
            Err(e) => return Err(e).context("wait() failed"),
        }
    }
}

/// `WEXITSTATUS` on a normal exit, `1` for anything abnormal (signal,
/// core dump) — pid-1 never propagates a raw signal number.
fn exit_code_of(status: &WaitStatus) -> u8 {
    match status {
        WaitStatus::Exited(_, code) => *code as u8,
        _ => 1,
    }
}
