//! Kernel route table fetch/commit over Linux rtnetlink.
//!
//! Mirrors the `fetch()`/`commit()` contract of §6: `fetch` returns all
//! dynamic gateway routes whose destinations fall in the configured routable
//! range; `commit` installs a `(deletes, adds, changes)` triple. The original
//! implementation used BSD routing sockets; this is the Linux netlink
//! adapter the design notes (§9) ask for.

use std::net::Ipv4Addr;

use n0_future::TryStreamExt;
use nested_enum_utils::common_fields;
use netlink_packet_route::route::{RouteAddress, RouteAttribute, RouteProtocol};
use rtnetlink::{Handle, IpVersion};
use snafu::{Backtrace, ResultExt, Snafu};

/// One route as seen by (or sent to) the kernel, in plain IPv4 terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelRoute {
    pub dest: Ipv4Addr,
    pub prefix_len: u8,
    pub gateway: Ipv4Addr,
}

/// A `(deletes, adds, changes)` triple to reconcile against the kernel table.
#[derive(Debug, Default, Clone)]
pub struct RouteDiff {
    pub deletes: Vec<KernelRoute>,
    pub adds: Vec<KernelRoute>,
    pub changes: Vec<KernelRoute>,
}

#[common_fields({
    backtrace: Option<Backtrace>,
})]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("opening netlink connection"))]
    Connect { source: std::io::Error },
    #[snafu(display("netlink request failed"))]
    Netlink { source: rtnetlink::Error },
}

/// Fetches and commits mesh routes via the kernel's main routing table.
#[derive(Debug)]
pub struct NetlinkRouteTable {
    min_routable: Ipv4Addr,
    max_routable: Ipv4Addr,
}

impl NetlinkRouteTable {
    pub fn new(min_routable: Ipv4Addr, max_routable: Ipv4Addr) -> Self {
        Self {
            min_routable,
            max_routable,
        }
    }

    fn in_range(&self, addr: Ipv4Addr) -> bool {
        u32::from(addr) >= u32::from(self.min_routable) && u32::from(addr) <= u32::from(self.max_routable)
    }

    /// All routes in the kernel's main table with a gateway, whose
    /// destination falls in the configured routable range.
    pub async fn fetch(&self) -> Result<Vec<KernelRoute>, Error> {
        let (connection, handle, _rx) = rtnetlink::new_connection().context(ConnectSnafu)?;
        let task = tokio::spawn(connection);

        let mut out = Vec::new();
        let mut routes = handle.route().get(IpVersion::V4).execute();
        while let Some(route) = routes.try_next().await.context(NetlinkSnafu)? {
            if !matches!(
                route.header.protocol,
                RouteProtocol::Boot | RouteProtocol::Static | RouteProtocol::Other(_)
            ) {
                continue;
            }
            let mut dest = None;
            let mut gateway = None;
            for attr in &route.attributes {
                match attr {
                    RouteAttribute::Destination(RouteAddress::Inet(addr)) => dest = Some(*addr),
                    RouteAttribute::Gateway(RouteAddress::Inet(addr)) => gateway = Some(*addr),
                    _ => {}
                }
            }
            if let (Some(dest), Some(gateway)) = (dest, gateway) {
                if self.in_range(dest) {
                    out.push(KernelRoute {
                        dest,
                        prefix_len: route.header.destination_prefix_length,
                        gateway,
                    });
                }
            }
        }

        task.abort();
        Ok(out)
    }

    /// Installs `diff`: deletes first, then adds, then changes (delete +
    /// re-add, since a netlink route replace still needs matching attributes).
    pub async fn commit(&self, diff: &RouteDiff) -> Result<(), Error> {
        let (connection, handle, _rx) = rtnetlink::new_connection().context(ConnectSnafu)?;
        let task = tokio::spawn(connection);

        for route in &diff.deletes {
            delete_route(&handle, route).await?;
        }
        for route in &diff.adds {
            add_route(&handle, route).await?;
        }
        for route in &diff.changes {
            delete_route(&handle, route).await.ok();
            add_route(&handle, route).await?;
        }

        task.abort();
        Ok(())
    }
}

async fn add_route(handle: &Handle, route: &KernelRoute) -> Result<(), Error> {
    handle
        .route()
        .add()
        .v4()
        .destination_prefix(route.dest, route.prefix_len)
        .gateway(route.gateway)
        .execute()
        .await
        .context(NetlinkSnafu)
}

async fn delete_route(handle: &Handle, route: &KernelRoute) -> Result<(), Error> {
    let mut routes = handle.route().get(IpVersion::V4).execute();
    while let Some(msg) = routes.try_next().await.context(NetlinkSnafu)? {
        let mut dest = None;
        let mut gateway = None;
        for attr in &msg.attributes {
            match attr {
                RouteAttribute::Destination(RouteAddress::Inet(addr)) => dest = Some(*addr),
                RouteAttribute::Gateway(RouteAddress::Inet(addr)) => gateway = Some(*addr),
                _ => {}
            }
        }
        if dest == Some(route.dest)
            && gateway == Some(route.gateway)
            && msg.header.destination_prefix_length == route.prefix_len
        {
            handle.route().del(msg).execute().await.context(NetlinkSnafu)?;
            break;
        }
    }
    Ok(())
}
