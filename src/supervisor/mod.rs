//! C6: the three-process supervision model. One `clone` plus one
//! `fork` per invocation, no threads:
//!
//! - the **monitor** is this process, continuing after `clone` returns;
//! - the **clone callback becomes pid-1**, running the namespace
//!   builder then forking the target;
//! - the **fork's child is the target** (pid 2 inside the namespace).
//!
//! Coordination is entirely through the eventfd in [`eventchan`] plus
//! ordinary `SIGCHLD`/`SIGTERM` handling.

pub mod eventchan;
pub mod init;
pub mod monitor;

use std::ffi::CString;

use anyhow::{Context, Result};
use nix::sched::CloneFlags;
use nix::sys::signal::{SigSet, SigmaskHow, Signal};
use nix::unistd::{execvp, fork, ForkResult};

use crate::capabilities;
use crate::clone_process;
use crate::namespace::{self, BuildParams};
use crate::procutil::ScrubbedArgv;
use crate::syscall::Syscall;
use eventchan::EventChannel;

/// Blocks SIGCHLD and SIGTERM on the calling thread so the window
/// between `clone` and the monitor's `signalfd` registration can never
/// lose a signal.
pub fn block_signals() -> Result<()> {
    let mut mask = SigSet::empty();
    mask.add(Signal::SIGCHLD);
    mask.add(Signal::SIGTERM);
    mask.thread_set_mask(SigmaskHow::SIG_BLOCK, &mask)
        .context("failed to block SIGCHLD/SIGTERM")?;
    Ok(())
}

fn unblock_signals() -> Result<()> {
    let mut mask = SigSet::empty();
    mask.add(Signal::SIGCHLD);
    mask.add(Signal::SIGTERM);
    mask.thread_set_mask(SigmaskHow::SIG_UNBLOCK, &mask)
        .context("failed to unblock SIGCHLD/SIGTERM")?;
    Ok(())
}

/// Clones into the new namespaces, builds the sandbox root, drops
/// capabilities, forks the target, and runs the monitor loop to
/// completion. Returns the exit code the whole invocation should use.
pub fn run(syscall: &dyn Syscall, build_params: BuildParams, argv: ScrubbedArgv) -> Result<i32> {
    let events = EventChannel::create()?;
    let monitor_events = events.try_clone().context("failed to dup eventfd for the monitor")?;
    block_signals()?;

    let flags = CloneFlags::CLONE_NEWNS | CloneFlags::CLONE_NEWPID | CloneFlags::CLONE_NEWIPC;

    // `libc::clone`'s callback can't return a `Result`; pid-1's own
    // failures are therefore reported on stderr and end the process
    // with a plain exit code, exactly like any other setup error.
    let pid1 = clone_process::clone(
        Box::new(move || match run_pid1(syscall, &build_params, &events, &argv) {
            Ok(code) => code as isize,
            Err(e) => {
                eprintln!("{e:#}");
                1
            }
        }),
        flags,
    )
    .context("clone(2) into new namespaces failed")?;

    monitor::run(monitor_events, pid1)
}

fn run_pid1(syscall: &dyn Syscall, build_params: &BuildParams, events: &EventChannel, argv: &ScrubbedArgv) -> Result<i32> {
    namespace::build(syscall, build_params)?;
    capabilities::drop_all(syscall)?;

    match unsafe { fork() }.context("fork() for the target failed")? {
        ForkResult::Parent { child } => {
            init::run(events, child)?;
            Ok(0)
        }
        ForkResult::Child => {
            unblock_signals().context("failed to unblock signals before execve")?;
            let cstrings = argv.as_cstrings();
            let prog = cstrings.first().cloned().unwrap_or_else(|| CString::new("/bin/false").unwrap());
            let _ = execvp(&prog, cstrings);
            std::process::exit(127);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_then_unblock_signals_round_trips() {
        block_signals().unwrap();
        unblock_signals().unwrap();
    }
}
