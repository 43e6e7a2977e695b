//! Kernel and interface adapters for `meshrouted`.
//!
//! Everything here is Linux-specific: interface enumeration (§6 "Interface
//! enumeration"), the kernel route table (§6 "Route table"), the neighbor/ARP
//! table (§6 "ARP table"), and an interface-change watcher used to trigger an
//! out-of-cycle reachability recheck (§9, resolved open question on
//! `NewAddr`/`DelAddr`). None of this is addressed bit-exact by the
//! specification; it is the platform collaborator the core algorithm crate
//! (`meshrouted`) is built against.
//!
//! The mesh node this crate targets is a Linux box; `arp` and `route_table`
//! depend directly on Linux netlink and are not built for other targets,
//! matching the spec's own stated scope boundary (§1) rather than silently
//! miscompiling.

#[cfg(target_os = "linux")]
pub mod arp;
pub mod interfaces;
pub mod netmon;
#[cfg(target_os = "linux")]
pub mod route_table;
pub mod wireless;
