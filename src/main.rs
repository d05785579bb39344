//! CLI entry point: `sandbox [options] COMMAND [ARGS...]`, dispatching
//! to either the native launcher or the `bwrap`-wrapping variant.

use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;

use thingengine_sandbox::capabilities;
use thingengine_sandbox::logger;
use thingengine_sandbox::native;
use thingengine_sandbox::syscall::{create_syscall, Syscall};
use thingengine_sandbox::wrapper;

/// Runs an untrusted command inside a restricted mount/pid/ipc
/// namespace, or behind bubblewrap.
#[derive(Parser, Debug)]
#[command(name = "sandbox", disable_help_flag = false)]
struct Cli {
    /// Accepted and ignored; reserves space for a large caller-supplied
    /// identifier.
    #[arg(short = 'i', value_name = "IDENTIFIER")]
    identifier: Option<String>,

    /// Use the bubblewrap-wrapping variant instead of building the
    /// namespace directly.
    #[arg(long)]
    wrapper: bool,

    /// The command to run inside the sandbox, and its arguments.
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

fn main() -> ExitCode {
    // Narrow from setuid-root to the real uid plus `CAP_SYS_ADMIN` as the
    // very first action, before any other code (argument parsing, logger
    // setup) runs with full root euid.
    let syscall: &'static dyn Syscall = Box::leak(create_syscall());
    if let Err(e) = capabilities::acquire(syscall) {
        eprintln!("sandbox: failed to acquire CAP_SYS_ADMIN: {e:#}");
        return ExitCode::from(1);
    }

    logger::init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // clap prints the usage/help/version text itself; only a
            // genuine parse failure is a precondition error (exit 1) —
            // `-h`/`--help` and `--version` keep clap's own exit code (0).
            e.print().ok();
            return ExitCode::from(e.exit_code() as u8);
        }
    };

    match run(syscall, cli) {
        Ok(code) => ExitCode::from(code as u8),
        Err(e) => {
            eprintln!("sandbox: {e:#}");
            ExitCode::from(1)
        }
    }
}

fn run(syscall: &'static dyn Syscall, cli: Cli) -> Result<i32> {
    if cli.wrapper || std::env::var_os("SANDBOX_USE_WRAPPER").is_some() {
        wrapper::run(cli.command)?;
        unreachable!("wrapper::run only returns via exec or an error");
    } else {
        native::run(syscall, cli.command)
    }
}
