//! The monitor: the only process of the three that never enters the
//! new namespace. It exists purely to turn whatever happened inside
//! into this invocation's own exit status, since the caller only ever
//! waits on the monitor.

use std::os::unix::io::AsRawFd;

use anyhow::{Context, Result};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use nix::sys::signal::{kill, Signal};
use nix::sys::signalfd::{SfdFlags, SigSet, SignalFd};
use nix::unistd::Pid;

use super::eventchan::EventChannel;
use crate::procutil;

const EVENTFD_TOKEN: Token = Token(0);
const SIGNALFD_TOKEN: Token = Token(1);

/// Blocks in `poll` until either pid-1 reports a status over `events`
/// or a signal arrives, and returns this process's own exit code.
///
/// Requires SIGCHLD and SIGTERM to already be blocked on the calling
/// thread (done once, before `clone`, by the caller) — `signalfd` only
/// intercepts signals that are blocked from normal delivery.
pub fn run(events: EventChannel, pid1: Pid) -> Result<i32> {
    let mut mask = SigSet::empty();
    mask.add(Signal::SIGCHLD);
    mask.add(Signal::SIGTERM);
    let signal_fd = SignalFd::with_flags(&mask, SfdFlags::SFD_CLOEXEC).context("signalfd(2) failed")?;

    procutil::close_extraneous_fds(&[events.as_raw_fd(), signal_fd.as_raw_fd(), 0, 1, 2])
        .context("failed to close extraneous fds before entering the monitor loop")?;

    let mut poll = Poll::new().context("failed to create epoll instance")?;
    let mut event_fd = events.as_raw_fd();
    let mut signal_raw_fd = signal_fd.as_raw_fd();
    poll.registry()
        .register(&mut SourceFd(&mut event_fd), EVENTFD_TOKEN, Interest::READABLE)
        .context("failed to register eventfd with the poller")?;
    poll.registry()
        .register(&mut SourceFd(&mut signal_raw_fd), SIGNALFD_TOKEN, Interest::READABLE)
        .context("failed to register signalfd with the poller")?;

    let mut poll_events = Events::with_capacity(4);
    loop {
        match poll.poll(&mut poll_events, None) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e).context("poll() failed"),
        }

        // Pid-1 always writes the target's status before it can exit
        // and raise its own SIGCHLD, but a single `poll()` wakeup can
        // still surface both the eventfd and the signalfd as readable
        // together, in no guaranteed order. Draining the eventfd first,
        // unconditionally, on every iteration — rather than only when
        // `poll_events` happens to report `EVENTFD_TOKEN` — means a real
        // exit status can never be shadowed by the generic SIGCHLD path
        // below.
        if let Some(status) = events.read_status().context("failed to read eventfd")? {
            return Ok(status as i32);
        }

        for event in poll_events.iter() {
            if event.token() == SIGNALFD_TOKEN {
                if let Some(info) = signal_fd.read_signal().context("failed to read signalfd")? {
                    if info.ssi_signo as i32 == Signal::SIGTERM as i32 {
                        let _ = kill(pid1, Signal::SIGTERM);
                    }
                    // Either a bare SIGCHLD (pid-1 died without
                    // reporting) or a forwarded SIGTERM: neither
                    // carries a real target status.
                    return Ok(1);
                }
            }
        }
    }
}
