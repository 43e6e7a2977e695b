//! Linux adapter wiring `meshwatch`'s netlink/sysfs primitives into the
//! [`crate::iface::IfaceAdapter`] and [`crate::iface::RouteTable`] contracts.
//!
//! Kept in this crate rather than `meshwatch` because implementing a trait
//! requires depending on both; `meshrouted` already depends on `meshwatch`.
//! Non-Linux targets get a stub that reports every operation unsupported,
//! matching the spec's own stated scope boundary (§1) instead of silently
//! miscompiling.

#[cfg(target_os = "linux")]
pub use linux::{LinuxIfaceAdapter, LinuxRouteTable};

#[cfg(target_os = "linux")]
mod linux {
    use std::{
        collections::HashMap,
        net::Ipv4Addr,
        path::PathBuf,
        sync::Mutex,
        time::{Duration, Instant},
    };

    use meshwatch::wireless::{self, Kind};
    use snafu::{ResultExt, Snafu};

    use crate::{
        addr::Addr,
        iface::{IfaceAdapter, IfaceKind, RouteTable},
        route::{Route, RouteSet},
    };

    const ASSOC_UPDATE_INTERVAL: Duration = Duration::from_secs(5);
    const ARP_UPDATE_INTERVAL: Duration = Duration::from_secs(60);

    struct IfaceCache {
        kind: Kind,
        last_assoc_update: Instant,
        reachable: bool,
    }

    /// Caches per-interface reachability and a process-global ARP snapshot,
    /// each refreshed no more often than its configured cadence (§4.6,
    /// §5 "ARP snapshots are process-global but refreshed only on access via
    /// a timestamp gate").
    pub struct LinuxIfaceAdapter {
        sys_class_net: PathBuf,
        runtime: tokio::runtime::Handle,
        ifaces: Mutex<HashMap<String, IfaceCache>>,
        arp: Mutex<(Instant, HashMap<Ipv4Addr, [u8; 6]>)>,
    }

    impl LinuxIfaceAdapter {
        pub fn new(runtime: tokio::runtime::Handle) -> Self {
            Self {
                sys_class_net: wireless::default_sys_class_net(),
                runtime,
                ifaces: Mutex::new(HashMap::new()),
                arp: Mutex::new((Instant::now() - ARP_UPDATE_INTERVAL, HashMap::new())),
            }
        }

        fn refresh_arp_if_due(&self) {
            let mut guard = self.arp.lock().expect("poisoned");
            if guard.0.elapsed() < ARP_UPDATE_INTERVAL {
                return;
            }
            let table = tokio::task::block_in_place(|| {
                self.runtime.block_on(meshwatch::arp::get_arptable())
            });
            if let Ok(table) = table {
                guard.1 = table;
            }
            guard.0 = Instant::now();
        }
    }

    impl IfaceAdapter for LinuxIfaceAdapter {
        fn kind(&self, iface: &str) -> Option<IfaceKind> {
            let mut guard = self.ifaces.lock().expect("poisoned");
            let entry = guard.entry(iface.to_string()).or_insert_with(|| IfaceCache {
                kind: wireless::classify(iface, &self.sys_class_net),
                last_assoc_update: Instant::now() - ASSOC_UPDATE_INTERVAL,
                reachable: false,
            });
            Some(match entry.kind {
                Kind::Wired => IfaceKind::Wired,
                Kind::WifiClient => IfaceKind::WifiClient,
                Kind::WifiMaster => IfaceKind::WifiMaster,
            })
        }

        fn refresh(&self, iface: &str) {
            self.refresh_arp_if_due();

            let mut guard = self.ifaces.lock().expect("poisoned");
            let entry = guard.entry(iface.to_string()).or_insert_with(|| IfaceCache {
                kind: wireless::classify(iface, &self.sys_class_net),
                last_assoc_update: Instant::now() - ASSOC_UPDATE_INTERVAL,
                reachable: false,
            });
            if entry.last_assoc_update.elapsed() >= ASSOC_UPDATE_INTERVAL {
                entry.reachable = wireless::is_reachable(entry.kind, iface, &self.sys_class_net);
                entry.last_assoc_update = Instant::now();
            }
        }

        fn is_reachable(&self, iface: &str, _mac: [u8; 6]) -> bool {
            let guard = self.ifaces.lock().expect("poisoned");
            guard.get(iface).map(|e| e.reachable).unwrap_or(false)
        }

        fn arp_table(&self) -> HashMap<Addr, [u8; 6]> {
            let guard = self.arp.lock().expect("poisoned");
            guard
                .1
                .iter()
                .map(|(addr, mac)| (Addr::from(*addr), *mac))
                .collect()
        }
    }

    #[derive(Debug, Snafu)]
    #[non_exhaustive]
    pub enum RouteTableError {
        #[snafu(display("kernel route table IO"))]
        Kernel { source: meshwatch::route_table::Error },
    }

    /// Wraps [`meshwatch::route_table::NetlinkRouteTable`], bridging its
    /// async fetch/commit into the synchronous [`RouteTable`] contract via
    /// `block_in_place` + the caller's runtime handle.
    pub struct LinuxRouteTable {
        inner: meshwatch::route_table::NetlinkRouteTable,
        runtime: tokio::runtime::Handle,
        min_routable: Addr,
        max_routable: Addr,
    }

    impl LinuxRouteTable {
        pub fn new(runtime: tokio::runtime::Handle, min_routable: Addr, max_routable: Addr) -> Self {
            Self {
                inner: meshwatch::route_table::NetlinkRouteTable::new(
                    Ipv4Addr::from(min_routable),
                    Ipv4Addr::from(max_routable),
                ),
                runtime,
                min_routable,
                max_routable,
            }
        }
    }

    impl RouteTable for LinuxRouteTable {
        type Error = RouteTableError;

        fn fetch(&self) -> Result<RouteSet, Self::Error> {
            let routes = tokio::task::block_in_place(|| self.runtime.block_on(self.inner.fetch()))
                .context(KernelSnafu)?;
            Ok(routes
                .into_iter()
                .map(|r| {
                    Route::new(
                        Addr::from(r.dest),
                        r.prefix_len,
                        Addr::from(r.gateway),
                    )
                })
                .filter(|r| {
                    r.addr.0 >= self.min_routable.0 && r.addr.0 <= self.max_routable.0
                })
                .collect())
        }

        fn commit(&self, diff: &crate::route::RouteDiff) -> Result<(), Self::Error> {
            let to_kernel = |r: &Route| meshwatch::route_table::KernelRoute {
                dest: Ipv4Addr::from(r.addr),
                prefix_len: r.netmask,
                gateway: Ipv4Addr::from(r.gateway),
            };
            let kernel_diff = meshwatch::route_table::RouteDiff {
                deletes: diff.deletes.iter().map(to_kernel).collect(),
                adds: diff.adds.iter().map(to_kernel).collect(),
                changes: diff.changes.iter().map(to_kernel).collect(),
            };
            tokio::task::block_in_place(|| self.runtime.block_on(self.inner.commit(&kernel_diff)))
                .context(KernelSnafu)
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub use unsupported::{Unsupported, UnsupportedIfaceAdapter, UnsupportedRouteTable};

#[cfg(not(target_os = "linux"))]
mod unsupported {
    use std::collections::HashMap;

    use crate::{
        addr::Addr,
        iface::{IfaceAdapter, IfaceKind, RouteTable},
        route::RouteSet,
    };

    /// This mesh node implementation targets Linux; off-Linux builds link
    /// but every operation reports unsupported rather than doing nothing
    /// silently.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, snafu::Snafu)]
    #[snafu(display("platform support is Linux-only"))]
    pub struct Unsupported;

    #[derive(Debug, Default)]
    pub struct UnsupportedIfaceAdapter;

    impl IfaceAdapter for UnsupportedIfaceAdapter {
        fn kind(&self, _iface: &str) -> Option<IfaceKind> {
            None
        }

        fn refresh(&self, _iface: &str) {}

        fn is_reachable(&self, _iface: &str, _mac: [u8; 6]) -> bool {
            false
        }

        fn arp_table(&self) -> HashMap<Addr, [u8; 6]> {
            HashMap::new()
        }
    }

    #[derive(Debug, Default)]
    pub struct UnsupportedRouteTable;

    impl RouteTable for UnsupportedRouteTable {
        type Error = Unsupported;

        fn fetch(&self) -> Result<RouteSet, Self::Error> {
            Err(Unsupported)
        }

        fn commit(&self, _diff: &crate::route::RouteDiff) -> Result<(), Self::Error> {
            Err(Unsupported)
        }
    }
}
