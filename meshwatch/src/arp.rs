//! Neighbor/ARP table query over Linux rtnetlink (`RTM_GETNEIGH`).
//!
//! Mirrors `get_arptable(iface)` from §6: a mapping from IPv4 address to
//! Ethernet address, filtered to entries of Ethernet/L2VLAN type with full
//! hardware addresses.

use std::{collections::HashMap, net::Ipv4Addr};

use n0_future::TryStreamExt;
use netlink_packet_route::neighbour::{NeighbourAddress, NeighbourAttribute, NeighbourState};
use nested_enum_utils::common_fields;
use snafu::{Backtrace, ResultExt, Snafu};

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

/// Queries the kernel's neighbor table and returns a snapshot of `addr ->
/// mac` for entries that are currently resolved (`REACHABLE`, `STALE`,
/// `PERMANENT`, or `NOARP`) and carry a full 6-byte link-layer address.
pub async fn get_arptable() -> Result<HashMap<Ipv4Addr, [u8; 6]>, Error> {
    let (connection, handle, _rx) = rtnetlink::new_connection().context(ConnectSnafu)?;
    let task = tokio::spawn(connection);

    let mut out = HashMap::new();
    let mut neighbours = handle.neighbours().get().execute();
    while let Some(n) = neighbours.try_next().await.context(NetlinkSnafu)? {
        if !matches!(
            n.header.state,
            NeighbourState::Reachable
                | NeighbourState::Stale
                | NeighbourState::Permanent
                | NeighbourState::NoArp
        ) {
            continue;
        }
        let mut addr = None;
        let mut mac = None;
        for attr in &n.attributes {
            match attr {
                NeighbourAttribute::Destination(NeighbourAddress::Inet(a)) => addr = Some(*a),
                NeighbourAttribute::LinkLocalAddress(bytes) if bytes.len() == 6 => {
                    let mut m = [0u8; 6];
                    m.copy_from_slice(bytes);
                    mac = Some(m);
                }
                _ => {}
            }
        }
        if let (Some(addr), Some(mac)) = (addr, mac) {
            out.insert(addr, mac);
        }
    }

    task.abort();
    Ok(out)
}
