//! The native front-end: constructs the sandbox itself rather than
//! delegating to an external helper. `main` narrows capabilities down to
//! `CAP_SYS_ADMIN` as the very first action of the process, before any
//! argument parsing; this module runs after that narrowing has already
//! happened, wiring together env/build-params handling and
//! `supervisor::run`, which drops every remaining capability once the
//! new root is in place and just before the target execs.

use std::env;

use anyhow::{Context, Result};
use nix::unistd::{getgid, getuid};

use crate::namespace::BuildParams;
use crate::procutil::ScrubbedArgv;
use crate::supervisor;
use crate::syscall::Syscall;

/// Runs the whole native sandbox for `command`, returning the exit
/// code the calling process should use.
pub fn run(syscall: &'static dyn Syscall, command: Vec<String>) -> Result<i32> {
    let prefix_env = env::var("THINGENGINE_PREFIX").context("THINGENGINE_PREFIX not set")?;
    let caller_cwd = env::current_dir().context("failed to read current directory")?;

    let build_params = BuildParams {
        uid: getuid(),
        gid: getgid(),
        prefix_env,
        caller_cwd,
    };

    let argv = ScrubbedArgv::from_args(command).context("failed to scrub argv")?;

    supervisor::run(syscall, build_params, argv)
}
