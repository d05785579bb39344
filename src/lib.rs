//! A per-process sandbox launcher. It runs an untrusted child command
//! inside a restricted mount/pid/ipc namespace (the native path), or
//! behind an external `bwrap` helper configured with an equivalent
//! filesystem policy (the wrapper path).
//!
//! Both paths share the same filesystem policy: which host paths are
//! bound read-only, which are created fresh per invocation, and which
//! `/etc` files are exposed to the sandboxed command.

pub mod bindmount;
pub mod capabilities;
pub mod clone_process;
pub mod etc_whitelist;
pub mod fstable;
pub mod logger;
pub mod mountinfo;
pub mod namespace;
pub mod native;
pub mod procutil;
pub mod supervisor;
pub mod syscall;
pub mod wrapper;
