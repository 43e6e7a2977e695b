//! Periodic tick orchestration: reachability, expiry, conditional broadcast,
//! and route reconciliation.

use std::{
    collections::BTreeSet,
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::net::UdpSocket;
use tracing::{info, warn};

use crate::{
    addr::Addr,
    config::Config,
    iface::{IfaceAdapter, RouteTable},
    neighbor::{self, NeighborSet},
    route::{diff, RouteSet},
};

/// Everything one driver tick needs beyond the neighbor set itself.
pub struct Driver<I, R> {
    pub config: Arc<Config>,
    pub socket: UdpSocket,
    pub iface_adapter: I,
    pub route_table: R,
    pub direct_nets: RouteSet,
    pub direct_nodes: Vec<crate::tree::Node>,

    last_broadcast: Instant,
    unreachable: BTreeSet<Addr>,
}

impl<I, R> Driver<I, R>
where
    I: IfaceAdapter,
    R: RouteTable,
{
    pub fn new(
        config: Arc<Config>,
        socket: UdpSocket,
        iface_adapter: I,
        route_table: R,
        direct_nets: RouteSet,
        direct_nodes: Vec<crate::tree::Node>,
    ) -> Self {
        Self {
            config,
            socket,
            iface_adapter,
            route_table,
            direct_nets,
            direct_nodes,
            last_broadcast: Instant::now() - Duration::from_secs(3600),
            unreachable: BTreeSet::new(),
        }
    }

    /// Runs reachability checks and returns whether the unreachable set
    /// changed since the previous call.
    fn changes_in_reachability(&mut self, neighbors: &NeighborSet) -> bool {
        let arp = self.iface_adapter.arp_table();
        let mut now_unreachable = BTreeSet::new();
        for n in neighbors.iter() {
            self.iface_adapter.refresh(&n.iface);
            let iface = n.iface.clone();
            let reachable = neighbor::check_reachable(n, &arp, |mac| {
                self.iface_adapter.is_reachable(&iface, mac)
            });
            if !reachable {
                now_unreachable.insert(n.addr);
            }
        }
        for newly in now_unreachable.difference(&self.unreachable) {
            warn!(%newly, "neighbor became unreachable");
        }
        let changed = now_unreachable != self.unreachable;
        self.unreachable = now_unreachable;
        changed
    }

    /// Derives routes and this node's own tree, broadcasts to neighbors, and
    /// (if `real_route_updates`) reconciles the kernel table. Returns the
    /// full derived route set for observers (e.g. `Client::watch_routes`).
    pub(crate) async fn broadcast_run(
        &mut self,
        neighbors: &mut NeighborSet,
    ) -> Result<RouteSet, crate::error::Fatal> {
        let (mut routes, mut children) = neighbor::derive_routes_and_mytree(
            neighbors,
            &self.direct_nets,
            &self.config.default_gateways,
            &self.config.zero_hop_ifaces,
            self.config.minimum_netmask,
        )
        .map_err(|source| crate::error::Fatal::Broadcast { source })?;

        children.extend(self.direct_nodes.iter().cloned());
        let my_tree = crate::tree::Node {
            addr: Addr::new(0),
            ethernet: false,
            gateway: self.config.this_is_a_gateway,
            children,
        };

        neighbor::broadcast(
            &self.socket,
            self.config.port,
            &self.config.secret_key,
            &my_tree,
            neighbors,
        )
        .await
        .map_err(|source| crate::error::Fatal::Broadcast { source })?;

        routes.extend(self.direct_nets.iter().copied());

        if self.config.real_route_updates {
            if let Err(err) = self.reconcile(&routes) {
                warn!(%err, "route table reconciliation failed");
            }
        }

        self.last_broadcast = Instant::now();
        Ok(routes)
    }

    fn reconcile(&self, wanted: &RouteSet) -> Result<(), R::Error> {
        const MAX_ATTEMPTS: usize = 6;
        for attempt in 0..MAX_ATTEMPTS {
            let current = self.route_table.fetch()?;
            let delta = diff(&current, wanted);
            if delta.is_empty() {
                return Ok(());
            }
            self.route_table.commit(&delta)?;
            if attempt == MAX_ATTEMPTS - 1 {
                warn!(remaining = ?delta, "route reconciliation did not converge within retry budget");
            }
        }
        Ok(())
    }

    /// One periodic tick: reachability check, stale-tree expiry, and a
    /// conditional (or interface-change-forced) broadcast run. Returns the
    /// freshly derived route set if a broadcast ran this tick.
    pub async fn tick(
        &mut self,
        neighbors: &mut NeighborSet,
        interface_changed: bool,
    ) -> Result<Option<RouteSet>, crate::error::Fatal> {
        let reachability_changed = self.changes_in_reachability(neighbors);
        let trees_expired = neighbor::nuke_old_trees(neighbors, self.config.timeout_secs as i64);
        let overdue = self.last_broadcast.elapsed() >= self.config.broadcast_interval();

        if reachability_changed || trees_expired || overdue || interface_changed {
            info!(
                reachability_changed,
                trees_expired, overdue, interface_changed, "running broadcast cycle"
            );
            return Ok(Some(self.broadcast_run(neighbors).await?));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, sync::Mutex};

    use super::*;
    use crate::{
        iface::IfaceKind,
        route::{Route, RouteDiff},
    };

    struct FakeIfaceAdapter;

    impl IfaceAdapter for FakeIfaceAdapter {
        fn kind(&self, _iface: &str) -> Option<IfaceKind> {
            Some(IfaceKind::Wired)
        }
        fn refresh(&self, _iface: &str) {}
        fn is_reachable(&self, _iface: &str, _mac: [u8; 6]) -> bool {
            true
        }
        fn arp_table(&self) -> HashMap<Addr, [u8; 6]> {
            HashMap::new()
        }
    }

    #[derive(Default)]
    struct FakeRouteTable {
        current: Mutex<RouteSet>,
        commits: Mutex<Vec<RouteDiff>>,
    }

    impl RouteTable for FakeRouteTable {
        type Error = std::convert::Infallible;

        fn fetch(&self) -> Result<RouteSet, Self::Error> {
            Ok(self.current.lock().unwrap().clone())
        }

        fn commit(&self, diff: &RouteDiff) -> Result<(), Self::Error> {
            let mut current = self.current.lock().unwrap();
            for r in &diff.deletes {
                current.remove(r);
            }
            for r in diff.adds.iter().chain(diff.changes.iter()) {
                current.insert(*r);
            }
            self.commits.lock().unwrap().push(diff.clone());
            Ok(())
        }
    }

    async fn loopback_socket() -> UdpSocket {
        UdpSocket::bind("127.0.0.1:0").await.unwrap()
    }

    #[tokio::test]
    async fn first_tick_is_always_overdue_and_broadcasts() {
        let config = Arc::new(Config::default());
        let mut driver = Driver::new(
            config,
            loopback_socket().await,
            FakeIfaceAdapter,
            FakeRouteTable::default(),
            RouteSet::new(),
            Vec::new(),
        );
        let mut neighbors = NeighborSet::new();

        let result = driver.tick(&mut neighbors, false).await.unwrap();
        assert!(result.is_some());
    }

    #[tokio::test]
    async fn second_tick_without_changes_does_not_rebroadcast() {
        let config = Arc::new(Config::default());
        let mut driver = Driver::new(
            config,
            loopback_socket().await,
            FakeIfaceAdapter,
            FakeRouteTable::default(),
            RouteSet::new(),
            Vec::new(),
        );
        let mut neighbors = NeighborSet::new();

        driver.tick(&mut neighbors, false).await.unwrap();
        let second = driver.tick(&mut neighbors, false).await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn interface_change_forces_broadcast_even_when_not_overdue() {
        let config = Arc::new(Config::default());
        let mut driver = Driver::new(
            config,
            loopback_socket().await,
            FakeIfaceAdapter,
            FakeRouteTable::default(),
            RouteSet::new(),
            Vec::new(),
        );
        let mut neighbors = NeighborSet::new();

        driver.tick(&mut neighbors, false).await.unwrap();
        let second = driver.tick(&mut neighbors, true).await.unwrap();
        assert!(second.is_some());
    }

    #[tokio::test]
    async fn reconcile_installs_direct_nets_when_route_updates_enabled() {
        let mut config = Config::default();
        config.real_route_updates = true;
        let direct_net = Route::new(Addr::new(0xac10_0000), 24, Addr::new(0xac10_0000));
        let mut direct_nets = RouteSet::new();
        direct_nets.insert(direct_net);

        let route_table = FakeRouteTable::default();
        let mut driver = Driver::new(
            Arc::new(config),
            loopback_socket().await,
            FakeIfaceAdapter,
            route_table,
            direct_nets,
            Vec::new(),
        );
        let mut neighbors = NeighborSet::new();

        let routes = driver.broadcast_run(&mut neighbors).await.unwrap();
        assert!(routes.iter().any(|r| r.addr == Addr::new(0xac10_0000)));

        // The kernel table should now contain the direct net we derived.
        let installed = driver.route_table.fetch().unwrap();
        assert!(installed.iter().any(|r| r.addr == Addr::new(0xac10_0000)));
    }
}
