//! The `/etc` whitelist shared by the native filesystem table (C3) and
//! the wrapper argv builder (C7). Identical in both variants: each name
//! is exposed read-only only if it exists on the host.

pub const ETC_WHITELIST: &[&str] = &[
    "ca-certificates",
    "ca-certificates.conf",
    "ssl",
    "pki",
    "hostname",
    "localtime",
    "machine-id",
    "os-release",
    "nsswitch.conf",
    "host.conf",
    "hosts",
    "passwd",
    "group",
    "networks",
    "protocols",
    "services",
    "ethers",
    "shells",
    "ld.so.cache",
    "ld.so.conf",
    "ld.so.conf.d",
    "resolv.conf",
];
