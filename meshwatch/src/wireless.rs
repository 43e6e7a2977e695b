//! Best-effort wired/wifi reachability over Linux's `sysfs`.
//!
//! The original implementation queried FreeBSD's `SIOCG80211`/`SIOCGIFMEDIA`
//! ioctls for hostap station lists and client association state; those have
//! no Linux equivalent in this pack (wireless association queries are
//! explicitly an external collaborator per §1/§6). This adapter uses
//! `/sys/class/net/<iface>/{operstate,carrier,wireless}` as a reasonable
//! Linux substitute: a wired interface is reachable whenever it exists; a
//! wireless interface's reachability is approximated by link carrier state,
//! since a genuine hostap station list requires `nl80211`, which is out of
//! scope here.

use std::path::{Path, PathBuf};

/// What kind of link an interface is, electrically — matches
/// `meshrouted::iface::IfaceKind` without depending on that crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Wired,
    WifiClient,
    WifiMaster,
}

/// Probes `/sys/class/net/<iface>` to classify the interface.
///
/// An interface is considered wireless if it has a `wireless` or
/// `phy80211` entry in sysfs. Among wireless interfaces we cannot
/// distinguish master (AP) mode from client mode without `nl80211`; this
/// classifies everything wireless as `WifiClient`, the more common case for
/// a mesh node's uplink, and leaves `WifiMaster` for configurations that
/// name the interface explicitly.
pub fn classify(iface: &str, sys_class_net: &Path) -> Kind {
    let base = sys_class_net.join(iface);
    if base.join("wireless").exists() || base.join("phy80211").exists() {
        Kind::WifiClient
    } else {
        Kind::Wired
    }
}

/// Default `sysfs` root.
pub fn default_sys_class_net() -> PathBuf {
    PathBuf::from("/sys/class/net")
}

/// Reads `operstate` for `iface`; `None` if the file is unreadable.
fn operstate(iface: &str, sys_class_net: &Path) -> Option<String> {
    std::fs::read_to_string(sys_class_net.join(iface).join("operstate"))
        .ok()
        .map(|s| s.trim().to_string())
}

/// Whether the link layer reports carrier (cable plugged in / associated).
fn carrier(iface: &str, sys_class_net: &Path) -> bool {
    std::fs::read_to_string(sys_class_net.join(iface).join("carrier"))
        .ok()
        .map(|s| s.trim() == "1")
        .unwrap_or(false)
}

/// Reachability decision for `iface`, given its [`Kind`]:
/// - `Wired` is always reachable (§4.6).
/// - `WifiClient` is reachable iff it reports carrier (our best local proxy
///   for "associated with a master").
/// - `WifiMaster` likewise falls back to carrier, since the associated-
///   station set would require `nl80211`.
pub fn is_reachable(kind: Kind, iface: &str, sys_class_net: &Path) -> bool {
    match kind {
        Kind::Wired => true,
        Kind::WifiClient | Kind::WifiMaster => {
            carrier(iface, sys_class_net) || operstate(iface, sys_class_net).as_deref() == Some("up")
        }
    }
}
