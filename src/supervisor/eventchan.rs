//! The one-shot status channel between pid-1 and the monitor: an
//! eventfd carrying a single `status + 1` value, so `0` stays free to
//! mean "nothing written yet" and the monitor can tell a real exit
//! status apart from an unreported one.

use std::os::unix::io::{AsRawFd, RawFd};

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::sys::eventfd::{eventfd, EfdFlags};
use nix::unistd::{close, dup, read, write};

pub struct EventChannel(RawFd);

impl EventChannel {
    /// Non-blocking so the monitor can drain it unconditionally every
    /// loop iteration without risking a hang when nothing has been
    /// written yet.
    pub fn create() -> Result<Self> {
        let fd = eventfd(0, EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK).context("eventfd(2) failed")?;
        Ok(EventChannel(fd))
    }

    /// Writes `status + 1` as a single little-endian 8-byte value.
    /// Called exactly once, by pid-1, right before the target leaves
    /// the process table.
    pub fn report_status(&self, status: u8) -> Result<()> {
        let value: u64 = status as u64 + 1;
        write(self.0, &value.to_le_bytes()).context("failed to write eventfd status")?;
        Ok(())
    }

    /// Reads the value written by [`report_status`]. `None` either
    /// because the channel somehow received a bare `0` (which no caller
    /// of `report_status` can produce), or because nothing has been
    /// written yet (`EAGAIN` on this non-blocking fd).
    pub fn read_status(&self) -> Result<Option<u8>> {
        let mut buf = [0u8; 8];
        match read(self.0, &mut buf) {
            Ok(_) => {}
            Err(Errno::EAGAIN) => return Ok(None),
            Err(e) => return Err(e).context("failed to read eventfd status"),
        }
        let value = u64::from_le_bytes(buf);
        Ok(if value == 0 { None } else { Some((value - 1) as u8) })
    }

    /// Duplicates the underlying fd. Needed because the clone callback
    /// that becomes pid-1 takes ownership of one `EventChannel`, while
    /// the monitor (still the original process after `clone` returns)
    /// needs its own handle onto the very same kernel eventfd.
    pub fn try_clone(&self) -> Result<Self> {
        let fd = dup(self.0).context("failed to dup eventfd")?;
        Ok(EventChannel(fd))
    }
}

impl AsRawFd for EventChannel {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

impl Drop for EventChannel {
    fn drop(&mut self) {
        let _ = close(self.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_status() {
        let chan = EventChannel::create().unwrap();
        chan.report_status(42).unwrap();
        assert_eq!(chan.read_status().unwrap(), Some(42));
    }

    #[test]
    fn zero_exit_status_is_distinguishable_from_unset() {
        let chan = EventChannel::create().unwrap();
        chan.report_status(0).unwrap();
        assert_eq!(chan.read_status().unwrap(), Some(0));
    }

    #[test]
    fn read_before_any_write_returns_none_without_blocking() {
        let chan = EventChannel::create().unwrap();
        assert_eq!(chan.read_status().unwrap(), None);
    }
}
