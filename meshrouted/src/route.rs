//! Route records, aggregation, and kernel-table diffing.

use std::{collections::BTreeSet, fmt};

use crate::addr::{bitmask, Addr};

/// A single routing table entry: destination `addr/netmask` via `gateway`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub addr: Addr,
    pub netmask: u8,
    pub gateway: Addr,
}

impl Route {
    pub fn new(addr: Addr, netmask: u8, gateway: Addr) -> Self {
        Self {
            addr,
            netmask,
            gateway,
        }
    }

    /// True if `self`'s prefix fully covers `other`'s prefix (same or wider).
    pub fn includes(&self, other: &Route) -> bool {
        if self.netmask > other.netmask {
            return false;
        }
        let mask = bitmask(self.netmask).unwrap_or(0);
        (self.addr.0 & mask) == (other.addr.0 & mask)
    }

    /// True if `addr` falls within this route's destination prefix.
    pub fn matches(&self, addr: Addr) -> bool {
        let mask = bitmask(self.netmask).unwrap_or(0);
        (self.addr.0 & mask) == (addr.0 & mask)
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} -> {}", self.addr, self.netmask, self.gateway)
    }
}

/// Ordered by `(addr, netmask)`, matching `RouteLess` in the original implementation.
impl PartialOrd for Route {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Route {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.addr.0, self.netmask).cmp(&(other.addr.0, other.netmask))
    }
}

pub type RouteSet = BTreeSet<Route>;

/// Collapses host-specific routes into shorter-prefix covers where doing so
/// does not change any address's effective gateway.
///
/// Processes routes in ascending `(addr, netmask)` order. A route already at
/// `minimum_netmask` is emitted unchanged. A self-route (`addr == gateway`,
/// `/32`) left over from direct-attachment bookkeeping is dropped. Otherwise
/// the prefix is widened one bit at a time, each step checking whether the
/// newly covered address space contains another *already-seen* route with a
/// conflicting gateway; if so, aggregation stops at the widest safe prefix
/// and every route it subsumes is dropped from further consideration.
pub fn aggregate(routes: &RouteSet, minimum_netmask: u8) -> RouteSet {
    let mut pending: Vec<Route> = routes.iter().copied().collect();
    pending.sort();

    let mut out = RouteSet::new();
    let mut consumed = vec![false; pending.len()];

    for i in 0..pending.len() {
        if consumed[i] {
            continue;
        }
        let route = pending[i];
        consumed[i] = true;

        if route.netmask <= minimum_netmask {
            out.insert(Route::new(route.addr, minimum_netmask, route.gateway));
            continue;
        }
        if route.netmask == 32 && route.addr == route.gateway {
            continue;
        }

        let mut widened = route;
        'widen: while widened.netmask > minimum_netmask {
            let candidate_mask = widened.netmask - 1;
            let mask = bitmask(candidate_mask).unwrap_or(0);
            let candidate_base = widened.addr.0 & mask;

            for (j, other) in pending.iter().enumerate() {
                if consumed[j] || j == i {
                    continue;
                }
                let other_covered = (other.addr.0 & mask) == candidate_base;
                if other_covered && other.gateway != route.gateway {
                    break 'widen;
                }
            }

            // Safe to widen: drop every pending route this prefix now covers.
            for (j, other) in pending.iter().enumerate() {
                if j == i || consumed[j] {
                    continue;
                }
                if (other.addr.0 & mask) == candidate_base {
                    consumed[j] = true;
                }
            }
            widened = Route::new(Addr::new(candidate_base), candidate_mask, route.gateway);
        }

        out.insert(widened);
    }

    out
}

/// The result of comparing two route sets, keyed on `(addr, netmask)`.
#[derive(Debug, Default, Clone)]
pub struct RouteDiff {
    pub deletes: Vec<Route>,
    pub adds: Vec<Route>,
    pub changes: Vec<Route>,
}

impl RouteDiff {
    pub fn is_empty(&self) -> bool {
        self.deletes.is_empty() && self.adds.is_empty() && self.changes.is_empty()
    }
}

/// Computes the ordered-set sweep between the currently installed routes and
/// the freshly derived set: entries only in `old` must be deleted, entries
/// only in `new` must be added, and entries present in both with a different
/// gateway must be changed in place.
pub fn diff(old: &RouteSet, new: &RouteSet) -> RouteDiff {
    let mut out = RouteDiff::default();
    let mut old_iter = old.iter().peekable();
    let mut new_iter = new.iter().peekable();

    loop {
        match (old_iter.peek(), new_iter.peek()) {
            (None, None) => break,
            (Some(_), None) => {
                out.deletes.push(*old_iter.next().unwrap());
            }
            (None, Some(_)) => {
                out.adds.push(*new_iter.next().unwrap());
            }
            (Some(o), Some(n)) => {
                let key_cmp = (o.addr.0, o.netmask).cmp(&(n.addr.0, n.netmask));
                match key_cmp {
                    std::cmp::Ordering::Less => out.deletes.push(*old_iter.next().unwrap()),
                    std::cmp::Ordering::Greater => out.adds.push(*new_iter.next().unwrap()),
                    std::cmp::Ordering::Equal => {
                        let o = *old_iter.next().unwrap();
                        let n = *new_iter.next().unwrap();
                        if o.gateway != n.gateway {
                            out.changes.push(n);
                        }
                    }
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn a(s: &str) -> Addr {
        Addr::from(s.parse::<std::net::Ipv4Addr>().unwrap())
    }

    #[test]
    fn includes_checks_prefix_containment() {
        let wide = Route::new(a("172.16.0.0"), 24, a("172.16.0.1"));
        let narrow = Route::new(a("172.16.0.5"), 32, a("172.16.0.1"));
        assert!(wide.includes(&narrow));
        assert!(!narrow.includes(&wide));
    }

    #[test]
    fn aggregate_collapses_contiguous_same_gateway_prefixes() {
        let gw = a("172.16.0.1");
        let mut routes = RouteSet::new();
        for i in 0..4u32 {
            let net = (0xac10_0000u32 + (i << 8)).into();
            routes.insert(Route::new(Addr::new(net), 24, gw));
        }
        let out = aggregate(&routes, 22);
        assert_eq!(out.len(), 1);
        let r = out.iter().next().unwrap();
        assert_eq!(r.netmask, 22);
        assert_eq!(r.gateway, gw);
    }

    #[test]
    fn aggregate_does_not_cross_gateway_boundaries() {
        let gw1 = a("172.16.0.1");
        let gw2 = a("172.16.0.2");
        let mut routes = RouteSet::new();
        routes.insert(Route::new(a("172.16.0.0"), 24, gw1));
        routes.insert(Route::new(a("172.16.1.0"), 24, gw2));
        let out = aggregate(&routes, 16);
        // Both survive distinctly since a shared wider prefix would mix gateways.
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn aggregate_drops_self_routes() {
        let me = a("172.16.0.5");
        let mut routes = RouteSet::new();
        routes.insert(Route::new(me, 32, me));
        let out = aggregate(&routes, 24);
        assert!(out.is_empty());
    }

    #[test]
    fn diff_reports_deletes_adds_and_changes() {
        let gw1 = a("172.16.0.1");
        let gw2 = a("172.16.0.2");
        let mut old = RouteSet::new();
        old.insert(Route::new(a("172.16.1.0"), 24, gw1)); // delete
        old.insert(Route::new(a("172.16.2.0"), 24, gw1)); // change

        let mut new = RouteSet::new();
        new.insert(Route::new(a("172.16.2.0"), 24, gw2)); // changed gateway
        new.insert(Route::new(a("172.16.3.0"), 24, gw1)); // add

        let d = diff(&old, &new);
        assert_eq!(d.deletes, vec![Route::new(a("172.16.1.0"), 24, gw1)]);
        assert_eq!(d.adds, vec![Route::new(a("172.16.3.0"), 24, gw1)]);
        assert_eq!(d.changes, vec![Route::new(a("172.16.2.0"), 24, gw2)]);
    }

    #[test]
    fn diff_of_equal_sets_is_empty() {
        let mut s = RouteSet::new();
        s.insert(Route::new(a("172.16.0.0"), 24, a("172.16.0.1")));
        assert!(diff(&s, &s).is_empty());
    }
}
