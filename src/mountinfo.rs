//! C1: a small `/proc/self/mountinfo` reader. Used by the bind-mount
//! primitive (C2) to discover flags a freshly bound mount inherited
//! from its source, and the set of mounts nested under a subtree so a
//! recursive bind can remount each of them individually.
//!
//! The real mountinfo format carries a variable number of optional
//! fields before the `-` separator; this reader only needs the
//! mountpoint and the per-mount option list, so it treats a line as
//! exactly seven whitespace-separated tokens: mount id, parent id,
//! major:minor, root, mountpoint, options, and everything after that.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use nix::mount::MsFlags;

/// The subset of per-mount option flags this system cares about,
/// represented as a small fixed bitmask (no need for a general
/// bitflags crate over seven fixed bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MountFlags(u8);

impl MountFlags {
    pub const RDONLY: MountFlags = MountFlags(0b0000_0001);
    pub const NOSUID: MountFlags = MountFlags(0b0000_0010);
    pub const NODEV: MountFlags = MountFlags(0b0000_0100);
    pub const NOEXEC: MountFlags = MountFlags(0b0000_1000);
    pub const NOATIME: MountFlags = MountFlags(0b0001_0000);
    pub const NODIRATIME: MountFlags = MountFlags(0b0010_0000);
    pub const RELATIME: MountFlags = MountFlags(0b0100_0000);

    pub fn empty() -> Self {
        MountFlags(0)
    }

    pub fn contains(self, other: MountFlags) -> bool {
        self.0 & other.0 == other.0
    }

    fn from_options(options: &str) -> Self {
        let mut flags = MountFlags::empty();
        for opt in options.split(',') {
            match opt {
                "ro" => flags |= MountFlags::RDONLY,
                "nosuid" => flags |= MountFlags::NOSUID,
                "nodev" => flags |= MountFlags::NODEV,
                "noexec" => flags |= MountFlags::NOEXEC,
                "noatime" => flags |= MountFlags::NOATIME,
                "nodiratime" => flags |= MountFlags::NODIRATIME,
                "relatime" => flags |= MountFlags::RELATIME,
                _ => {}
            }
        }
        flags
    }

    /// Maps the recognized flags onto the `MsFlags` bits a remount
    /// needs to pass back in, to avoid the kernel silently dropping
    /// them across a plain bind mount.
    pub fn to_ms_flags(self) -> MsFlags {
        let mut flags = MsFlags::empty();
        if self.contains(MountFlags::RDONLY) {
            flags |= MsFlags::MS_RDONLY;
        }
        if self.contains(MountFlags::NOSUID) {
            flags |= MsFlags::MS_NOSUID;
        }
        if self.contains(MountFlags::NODEV) {
            flags |= MsFlags::MS_NODEV;
        }
        if self.contains(MountFlags::NOEXEC) {
            flags |= MsFlags::MS_NOEXEC;
        }
        if self.contains(MountFlags::NOATIME) {
            flags |= MsFlags::MS_NOATIME;
        }
        if self.contains(MountFlags::NODIRATIME) {
            flags |= MsFlags::MS_NODIRATIME;
        }
        if self.contains(MountFlags::RELATIME) {
            flags |= MsFlags::MS_RELATIME;
        }
        flags
    }
}

impl std::ops::BitOr for MountFlags {
    type Output = MountFlags;
    fn bitor(self, rhs: MountFlags) -> MountFlags {
        MountFlags(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for MountFlags {
    fn bitor_assign(&mut self, rhs: MountFlags) {
        self.0 |= rhs.0;
    }
}

struct Entry {
    mountpoint: PathBuf,
    flags: MountFlags,
}

fn parse_line(line: &str) -> Option<Entry> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.len() < 6 {
        return None;
    }
    Some(Entry {
        mountpoint: PathBuf::from(decode_octal_escapes(tokens[4])),
        flags: MountFlags::from_options(tokens[5]),
    })
}

fn read_entries() -> Result<Vec<Entry>> {
    let contents =
        fs::read_to_string("/proc/self/mountinfo").context("failed to read /proc/self/mountinfo")?;
    Ok(contents.lines().filter_map(parse_line).collect())
}

fn canonicalize(path: &Path) -> Result<PathBuf> {
    if path.is_relative() {
        let cwd = std::env::current_dir().context("failed to read current directory")?;
        Ok(cwd.join(path))
    } else {
        Ok(path.to_path_buf())
    }
}

/// The flags of the mount at `path`, or an empty set if `path` isn't a
/// mountpoint at all (never an error: an unknown mount just means no
/// flags to preserve).
pub fn mount_flags_of(path: &Path) -> Result<MountFlags> {
    let target = canonicalize(path)?;
    let entries = read_entries()?;
    Ok(entries
        .iter()
        .filter(|e| e.mountpoint == target)
        .last()
        .map(|e| e.flags)
        .unwrap_or_default())
}

/// Every mountpoint strictly under `prefix`, in the order mountinfo
/// reports them (oldest mount first).
pub fn submounts_of(prefix: &Path) -> Result<Vec<PathBuf>> {
    let target = canonicalize(prefix)?;
    let entries = read_entries()?;
    Ok(entries
        .into_iter()
        .filter(|e| e.mountpoint != target && e.mountpoint.starts_with(&target))
        .map(|e| e.mountpoint)
        .collect())
}

/// Decodes the kernel's `\NNN` octal escaping (used for space, tab,
/// newline, and backslash in mountpoint paths). Any other backslash
/// sequence is left untouched.
pub fn decode_octal_escapes(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = String::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() && is_octal_triplet(&bytes[i + 1..i + 4]) {
            let value = (bytes[i + 1] - b'0') * 64 + (bytes[i + 2] - b'0') * 8 + (bytes[i + 3] - b'0');
            out.push(value as char);
            i += 4;
        } else {
            out.push(bytes[i] as char);
            i += 1;
        }
    }
    out
}

fn is_octal_triplet(bytes: &[u8]) -> bool {
    bytes.len() == 3 && bytes.iter().all(|b| (b'0'..=b'7').contains(b))
}

/// The inverse of [`decode_octal_escapes`]: escapes space, tab,
/// newline, and backslash as `\NNN`.
pub fn encode_octal_escapes(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            ' ' => out.push_str("\\040"),
            '\t' => out.push_str("\\011"),
            '\n' => out.push_str("\\012"),
            '\\' => out.push_str("\\134"),
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn octal_escape_round_trips() {
        let original = "a dir\twith\\stuff";
        let encoded = encode_octal_escapes(original);
        let decoded = decode_octal_escapes(&encoded);
        assert_eq!(decoded, original);
    }

    #[test]
    fn decode_leaves_non_escape_backslashes_alone() {
        assert_eq!(decode_octal_escapes(r"C:\Users"), r"C:\Users");
    }

    #[test]
    fn decode_handles_space_escape() {
        assert_eq!(decode_octal_escapes(r"/mnt/my\040dir"), "/mnt/my dir");
    }

    #[test]
    fn parse_line_extracts_mountpoint_and_flags() {
        let line = "36 35 98:0 / /mnt/ro rw,noatime,nosuid master:1 - ext3 /dev/root rw,errors=continue";
        let entry = parse_line(line).unwrap();
        assert_eq!(entry.mountpoint, PathBuf::from("/mnt/ro"));
        assert!(entry.flags.contains(MountFlags::NOATIME));
        assert!(entry.flags.contains(MountFlags::NOSUID));
        assert!(!entry.flags.contains(MountFlags::RDONLY));
    }

    #[test]
    fn mount_flags_to_ms_flags_preserves_bits() {
        let flags = MountFlags::RDONLY | MountFlags::NODEV;
        let ms = flags.to_ms_flags();
        assert!(ms.contains(MsFlags::MS_RDONLY));
        assert!(ms.contains(MsFlags::MS_NODEV));
        assert!(!ms.contains(MsFlags::MS_NOEXEC));
    }
}
