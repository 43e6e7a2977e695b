//! Neighbor bookkeeping and the signed broadcast protocol between peers.

use std::{
    cell::{Cell, RefCell},
    collections::BTreeSet,
    net::SocketAddrV4,
    path::Path,
    time::{SystemTime, UNIX_EPOCH},
};

use nested_enum_utils::common_fields;
use sha1::{Digest, Sha1};
use snafu::{Backtrace, ResultExt, Snafu};
use tokio::net::UdpSocket;
use tracing::{debug, trace, warn};

use crate::{
    addr::Addr,
    merge,
    route::{Route, RouteSet},
    tree::Node,
};

const SIGNATURE_LEN: usize = 20;
const TIMESTAMP_LEN: usize = 8;

#[common_fields({
    backtrace: Option<Backtrace>,
})]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("packet shorter than the signature"))]
    ShortPacket {},
    #[snafu(display("signature does not match the shared secret"))]
    BadSignature {},
    #[snafu(display("unknown neighbor {addr}"))]
    UnknownNeighbor { addr: Addr },
    #[snafu(display("decoding tree from neighbor"))]
    Tree { source: crate::tree::Error },
    #[snafu(display("encoding own tree for broadcast"))]
    Encode { source: crate::tree::Error },
    #[snafu(display("merging neighbor trees"))]
    Merge { source: merge::Error },
    #[snafu(display("sending broadcast packet"))]
    SendFatal { source: std::io::Error },
}

/// A peer reachable on one of our directly-attached interlink subnets.
#[derive(Debug)]
pub struct Neighbor {
    pub iface: String,
    pub addr: Addr,
    macaddr: Cell<Option<[u8; 6]>>,
    last_seen: Cell<i64>,
    seqno: Cell<u32>,
    tree: RefCell<Option<Node>>,
}

impl Neighbor {
    pub fn new(iface: impl Into<String>, addr: Addr) -> Self {
        Self {
            iface: iface.into(),
            addr,
            macaddr: Cell::new(None),
            last_seen: Cell::new(-1),
            seqno: Cell::new(0),
            tree: RefCell::new(None),
        }
    }

    pub fn socket_addr(&self, port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(self.addr.into(), port)
    }

    pub fn has_tree(&self) -> bool {
        self.tree.borrow().is_some()
    }

    pub fn tree(&self) -> Option<Node> {
        self.tree.borrow().clone()
    }

    pub fn clear_tree(&self) {
        *self.tree.borrow_mut() = None;
    }

    pub fn last_seen(&self) -> i64 {
        self.last_seen.get()
    }

    pub fn mac(&self) -> Option<[u8; 6]> {
        self.macaddr.get()
    }

    pub fn set_mac(&self, mac: [u8; 6]) {
        self.macaddr.set(Some(mac));
    }
}

impl PartialEq for Neighbor {
    fn eq(&self, other: &Self) -> bool {
        self.addr == other.addr
    }
}
impl Eq for Neighbor {}
impl PartialOrd for Neighbor {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Neighbor {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.addr.cmp(&other.addr)
    }
}

/// Neighbors are kept in an ordered set, keyed on address, matching the
/// deterministic send order the broadcast protocol relies on.
pub type NeighborSet = BTreeSet<Neighbor>;

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

fn sign(secret_key: &[u8], timestamp_and_tree: &[u8]) -> [u8; SIGNATURE_LEN] {
    let mut hasher = Sha1::new();
    hasher.update(secret_key);
    hasher.update(timestamp_and_tree);
    hasher.finalize().into()
}

/// Constant-time-ish comparison of two fixed-size signatures: folds the XOR
/// of every byte pair so no early exit leaks which byte first differed.
fn signatures_match(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Builds the signed wire packet for `my_tree` (this node's own subtree,
/// wrapped under a synthetic root with address 0) and sends it to every
/// neighbor in ascending address order. Neighbors whose send fails with one
/// of the four "host gone" errno classes are removed from `neighbors` and
/// logged at debug; any other failure is fatal and propagated.
pub async fn broadcast(
    socket: &UdpSocket,
    port: u16,
    secret_key: &[u8],
    my_tree: &Node,
    neighbors: &mut NeighborSet,
) -> Result<(), Error> {
    let root = Node {
        addr: Addr::new(0),
        ethernet: false,
        gateway: false,
        children: my_tree.children.clone(),
    };
    let tree_bytes = root.serialize().context(EncodeSnafu)?;

    let timestamp = now_unix();
    let mut payload = Vec::with_capacity(SIGNATURE_LEN + TIMESTAMP_LEN + tree_bytes.len());
    payload.extend_from_slice(&[0u8; SIGNATURE_LEN]);
    payload.extend_from_slice(&timestamp.to_ne_bytes());
    payload.extend_from_slice(&tree_bytes);

    let sig = sign(secret_key, &payload[SIGNATURE_LEN..]);
    payload[..SIGNATURE_LEN].copy_from_slice(&sig);

    let mut gone = Vec::new();
    for neighbor in neighbors.iter() {
        let dest = neighbor.socket_addr(port);
        match socket.send_to(&payload, dest).await {
            Ok(_) => {}
            Err(err) if is_host_gone(&err) => {
                debug!(%neighbor.addr, %err, "neighbor unreachable, dropping");
                gone.push(neighbor.addr);
            }
            Err(source) => return Err(source).context(SendFatalSnafu),
        }
    }
    neighbors.retain(|n| !gone.contains(&n.addr));
    Ok(())
}

fn is_host_gone(err: &std::io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EHOSTUNREACH)
            | Some(libc::EHOSTDOWN)
            | Some(libc::ECONNREFUSED)
            | Some(libc::ENETDOWN)
    )
}

/// Verifies and installs an incoming packet's tree on the matching neighbor.
///
/// If `debug_dump_dir` is set, the raw packet is additionally written to
/// `<dir>/packet-<addr>`, an opt-in facility for offline inspection.
pub fn handle_data(
    neighbors: &NeighborSet,
    buf: &[u8],
    from: Addr,
    secret_key: &[u8],
    debug_dump_dir: Option<&Path>,
) -> Result<(), Error> {
    if let Some(dir) = debug_dump_dir {
        let path = dir.join(format!("packet-{from}"));
        if let Err(source) = std::fs::write(&path, buf) {
            warn!(path = %path.display(), %source, "failed to write debug packet dump");
        }
    }

    if buf.len() <= SIGNATURE_LEN {
        return ShortPacketSnafu.fail();
    }
    let neighbor = neighbors
        .iter()
        .find(|n| n.addr == from)
        .ok_or_else(|| UnknownNeighborSnafu { addr: from }.build())?;

    let expected = sign(secret_key, &buf[SIGNATURE_LEN..]);
    if !signatures_match(&expected, &buf[..SIGNATURE_LEN]) {
        return BadSignatureSnafu.fail();
    }

    // buf[SIGNATURE_LEN..SIGNATURE_LEN+TIMESTAMP_LEN] carries the sender's
    // clock; currently unchecked (no replay window), see design notes.
    let tree_bytes = &buf[SIGNATURE_LEN + TIMESTAMP_LEN..];
    let mut decoded = Node::deserialize(tree_bytes).context(TreeSnafu)?;
    decoded.addr = from;

    *neighbor.tree.borrow_mut() = Some(decoded);
    neighbor.last_seen.set(now_unix());
    neighbor.seqno.set(neighbor.seqno.get().wrapping_add(1));
    trace!(%from, "installed neighbor tree");
    Ok(())
}

/// Clears the cached tree for every neighbor on `iface`.
pub fn nuke_trees_for_iface(neighbors: &NeighborSet, iface: &str) {
    for n in neighbors.iter().filter(|n| n.iface == iface) {
        n.clear_tree();
    }
}

/// Clears trees that have not been refreshed within `timeout` seconds.
/// Returns whether any neighbor was affected.
pub fn nuke_old_trees(neighbors: &NeighborSet, timeout_secs: i64) -> bool {
    let now = now_unix();
    let mut changed = false;
    for n in neighbors.iter() {
        if n.has_tree() && n.last_seen() < now - timeout_secs {
            n.clear_tree();
            changed = true;
        }
    }
    changed
}

/// Assembles the per-neighbor top-level view, merges it, aggregates the
/// result, folds in the default-gateway and direct-net adjustments, and
/// returns the routes to install plus this node's own transmittable subtree.
pub fn derive_routes_and_mytree(
    neighbors: &NeighborSet,
    direct_nets: &RouteSet,
    default_gateways: &BTreeSet<Addr>,
    zero_hop_ifaces: &BTreeSet<String>,
    minimum_netmask: u8,
) -> Result<(RouteSet, Vec<Node>), Error> {
    let mut roots = Vec::new();
    for n in neighbors.iter() {
        let Some(tree) = n.tree() else { continue };
        roots.push(Node {
            addr: n.addr,
            ethernet: zero_hop_ifaces.contains(&n.iface),
            gateway: default_gateways.contains(&n.addr),
            children: tree.children,
        });
    }

    let merged = merge::merge(&roots).context(MergeSnafu)?;
    let mut routes = crate::route::aggregate(&merged.routes, minimum_netmask);

    if let Some(gw) = merged.default_gateway {
        if !gw.is_zero() {
            routes.insert(Route::new(Addr::new(0), 0, gw));
        }
    }

    routes.retain(|r| !direct_nets.iter().any(|d| d.includes(r)));

    Ok((routes, merged.tree.children))
}

/// Reachability as seen through the interface adapter: refreshes the cached
/// MAC from the current ARP snapshot if missing, and clears the neighbor's
/// tree if it has gone unreachable.
pub fn check_reachable(
    neighbor: &Neighbor,
    arp: &std::collections::HashMap<Addr, [u8; 6]>,
    is_reachable: impl FnOnce([u8; 6]) -> bool,
) -> bool {
    if neighbor.mac().is_none() {
        if let Some(mac) = arp.get(&neighbor.addr) {
            neighbor.set_mac(*mac);
        }
    }

    let reachable = match neighbor.mac() {
        Some(mac) => is_reachable(mac),
        None => false,
    };

    if !reachable {
        neighbor.clear_tree();
        neighbor.last_seen.set(0);
    }
    reachable
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_rejects_any_single_bit_flip() {
        let secret = b"s00p3rs3kr3t";
        let mut payload = vec![0u8; SIGNATURE_LEN + TIMESTAMP_LEN + 4];
        let sig = sign(secret, &payload[SIGNATURE_LEN..]);
        payload[..SIGNATURE_LEN].copy_from_slice(&sig);

        assert!(signatures_match(
            &sign(secret, &payload[SIGNATURE_LEN..]),
            &payload[..SIGNATURE_LEN]
        ));

        payload[SIGNATURE_LEN + 2] ^= 0x01;
        let recomputed = sign(secret, &payload[SIGNATURE_LEN..]);
        assert!(!signatures_match(&recomputed, &payload[..SIGNATURE_LEN]));
    }

    #[test]
    fn handle_data_rejects_short_packets() {
        let neighbors = NeighborSet::new();
        let err = handle_data(&neighbors, &[0u8; 5], Addr::new(1), b"secret", None);
        assert!(matches!(err, Err(Error::ShortPacket { .. })));
    }

    #[test]
    fn handle_data_rejects_unknown_neighbor() {
        let neighbors = NeighborSet::new();
        let buf = vec![0u8; SIGNATURE_LEN + TIMESTAMP_LEN + 4];
        let err = handle_data(&neighbors, &buf, Addr::new(0xac100002), b"secret", None);
        assert!(matches!(err, Err(Error::UnknownNeighbor { .. })));
    }

    #[test]
    fn handle_data_installs_tree_on_valid_packet() {
        let mut neighbors = NeighborSet::new();
        let from = Addr::new(0xac100002);
        neighbors.insert(Neighbor::new("eth0", from));

        let root = Node::leaf(Addr::new(0));
        let tree_bytes = root.serialize().unwrap();
        let mut payload = vec![0u8; SIGNATURE_LEN + TIMESTAMP_LEN];
        payload.extend_from_slice(&tree_bytes);
        let sig = sign(b"secret", &payload[SIGNATURE_LEN..]);
        payload[..SIGNATURE_LEN].copy_from_slice(&sig);

        handle_data(&neighbors, &payload, from, b"secret", None).unwrap();
        let n = neighbors.iter().find(|n| n.addr == from).unwrap();
        assert!(n.has_tree());
        assert_eq!(n.tree().unwrap().addr, from);
    }

    #[test]
    fn nuke_old_trees_clears_stale_entries() {
        let mut neighbors = NeighborSet::new();
        let n = Neighbor::new("eth0", Addr::new(0xac100002));
        *n.tree.borrow_mut() = Some(Node::leaf(Addr::new(0xac100002)));
        n.last_seen.set(0);
        neighbors.insert(n);

        let changed = nuke_old_trees(&neighbors, 60);
        assert!(changed);
        assert!(!neighbors.iter().next().unwrap().has_tree());
    }

    #[test]
    fn check_reachable_clears_tree_when_unreachable() {
        let n = Neighbor::new("eth0", Addr::new(0xac100002));
        *n.tree.borrow_mut() = Some(Node::leaf(Addr::new(0xac100002)));
        let arp = std::collections::HashMap::new();
        let reachable = check_reachable(&n, &arp, |_| true);
        assert!(!reachable);
        assert!(!n.has_tree());
    }

    fn a(n: u32) -> Addr {
        Addr::new(0xac10_0000 | n)
    }

    #[test]
    fn derive_routes_trivial_merge_scenario() {
        // Spec §8 scenario 1: one neighbor at .2 advertises a single child .3.
        let mut neighbors = NeighborSet::new();
        let n2 = Neighbor::new("eth0", a(2));
        *n2.tree.borrow_mut() = Some({
            let mut t = Node::leaf(Addr::new(0));
            t.children.push(Node::new(a(3), true, false));
            t
        });
        neighbors.insert(n2);

        let direct_nets = RouteSet::new();
        let default_gateways = BTreeSet::new();
        let zero_hop = BTreeSet::new();

        let (routes, _children) =
            derive_routes_and_mytree(&neighbors, &direct_nets, &default_gateways, &zero_hop, 24)
                .unwrap();

        assert!(routes
            .iter()
            .any(|r| r.addr == a(2) && r.gateway == a(2) && r.netmask == 32));
        assert!(routes
            .iter()
            .any(|r| r.addr == a(3) && r.gateway == a(2) && r.netmask == 32));
    }

    #[test]
    fn derive_routes_prefers_wired_neighbor_and_marks_default_gateway() {
        // Spec §8 scenario 2, plus a gateway-flagged neighbor producing 0/0.
        let mut neighbors = NeighborSet::new();

        let wired = Neighbor::new("eth0", a(2));
        *wired.tree.borrow_mut() = Some({
            let mut t = Node::leaf(Addr::new(0));
            t.children.push(Node::new(Addr::new(0xac110009), false, false)); // 172.17.0.9
            t
        });
        neighbors.insert(wired);

        let wireless = Neighbor::new("wlan0", a(4));
        *wireless.tree.borrow_mut() = Some({
            let mut t = Node::leaf(Addr::new(0));
            t.children.push(Node::new(Addr::new(0xac110009), false, false));
            t
        });
        neighbors.insert(wireless);

        let direct_nets = RouteSet::new();
        let mut default_gateways = BTreeSet::new();
        default_gateways.insert(a(2));
        let mut zero_hop = BTreeSet::new();
        zero_hop.insert("eth0".to_string());

        let (routes, _children) =
            derive_routes_and_mytree(&neighbors, &direct_nets, &default_gateways, &zero_hop, 24)
                .unwrap();

        let via_wired = routes
            .iter()
            .find(|r| r.addr == Addr::new(0xac110009))
            .unwrap();
        assert_eq!(via_wired.gateway, a(2));

        let default_route = routes.iter().find(|r| r.netmask == 0).unwrap();
        assert_eq!(default_route.gateway, a(2));
    }

    #[test]
    fn derive_routes_drops_destinations_covered_by_direct_nets() {
        let mut neighbors = NeighborSet::new();
        let n2 = Neighbor::new("eth0", a(2));
        *n2.tree.borrow_mut() = Some({
            let mut t = Node::leaf(Addr::new(0));
            t.children.push(Node::new(a(3), true, false));
            t
        });
        neighbors.insert(n2);

        let mut direct_nets = RouteSet::new();
        direct_nets.insert(Route::new(Addr::new(0xac10_0000), 24, Addr::new(0xac10_0000)));

        let (routes, _) = derive_routes_and_mytree(
            &neighbors,
            &direct_nets,
            &BTreeSet::new(),
            &BTreeSet::new(),
            24,
        )
        .unwrap();

        // .2 and .3 both fall inside 172.16.0.0/24, our own directly-attached net.
        assert!(!routes.iter().any(|r| r.addr == a(2) || r.addr == a(3)));
    }
}
