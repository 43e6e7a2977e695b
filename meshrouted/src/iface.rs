//! The contract `meshwatch` implements against the kernel and interfaces.
//!
//! Kept as plain traits in the algorithm crate so tests and alternate
//! platforms can supply a double without depending on `meshwatch` at all.

use std::collections::HashMap;

use crate::addr::Addr;

/// What a directly-attached interface looks like, electrically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IfaceKind {
    Wired,
    WifiClient,
    WifiMaster,
}

/// Per-interface reachability decisions, refreshed on a cadence.
///
/// `refresh` is called once per driver tick; implementations should only do
/// real work once their own internal cadence (association/ARP update
/// intervals) has elapsed, mirroring the update-gating of the original
/// per-interface refresh logic.
pub trait IfaceAdapter: Send + Sync {
    fn kind(&self, iface: &str) -> Option<IfaceKind>;

    /// Refreshes cached association/ARP state for `iface` if its internal
    /// cadence has elapsed.
    fn refresh(&self, iface: &str);

    /// Whether `mac` is currently reachable over `iface`, given its kind:
    /// always true for `Wired`, the client's association state for
    /// `WifiClient`, and membership in the master's associated-station set
    /// for `WifiMaster`.
    fn is_reachable(&self, iface: &str, mac: [u8; 6]) -> bool;

    /// Current ARP/neighbor-table snapshot, address to link-layer address.
    fn arp_table(&self) -> HashMap<Addr, [u8; 6]>;
}

/// Kernel route table collaborator: `fetch`/`commit` as described in §6.
pub trait RouteTable: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    fn fetch(&self) -> Result<crate::route::RouteSet, Self::Error>;
    fn commit(&self, diff: &crate::route::RouteDiff) -> Result<(), Self::Error>;
}

/// Raised when an interface-change notification arrives; consumers should
/// treat this as "re-check reachability and broadcast now" per the resolved
/// open question in the design notes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceChanged;
