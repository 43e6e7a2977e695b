//! Priority-queue merge of neighbor-advertised trees into one spanning tree.

use std::{cmp::Reverse, collections::BinaryHeap, collections::HashMap};

use snafu::Snafu;

use crate::{
    addr::Addr,
    route::{Route, RouteSet},
    tree::Node,
};

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// The priority queue guarantees nodes are admitted in non-decreasing
    /// cost order; this would mean that invariant broke.
    #[snafu(display(
        "internal ordering violation while merging trees: {addr} admitted at cost {new_cost} \
         after a lower cost {existing_cost} was already recorded"
    ))]
    InternalOrderingViolation {
        addr: Addr,
        new_cost: u32,
        existing_cost: u32,
    },
}

const ETHERNET_COST: u32 = 1;
const WIRELESS_COST: u32 = 10;

/// The outcome of merging a set of neighbor-rooted trees.
pub struct Merged {
    pub tree: Node,
    pub routes: RouteSet,
    pub default_gateway: Option<Addr>,
}

/// Merges `roots` (one tree per reachable neighbor, already rooted at that
/// neighbor's own address) into a single tree, a `/32`-per-node route table,
/// and the nearest gateway-flagged node, if any.
///
/// Costs accumulate at 1 per ethernet-flagged hop and 10 per wireless hop, so
/// wired paths are preferred over wireless ones at any distance shorter than
/// ten wireless hops. The flag that decides a node's outgoing step cost is
/// the node's *own* `ethernet` marker (the link its parent used to reach
/// it), applied uniformly to every one of its children — so a neighbor root
/// wrapped with the zero-hop flag for our own interface to that neighbor
/// governs the cost of everything that neighbor advertises, one level down,
/// exactly as it does in the original tree-merge routine. Ties on cost are
/// broken by keeping the numerically smaller gateway address, so the choice
/// is stable across repeated merges of otherwise-unchanged input.
pub fn merge(roots: &[Node]) -> Result<Merged, Error> {
    // Arena of admitted nodes; `new_tree` lives at index 0.
    let mut arena: Vec<Node> = vec![Node::leaf(Addr::new(0))];
    let mut children_of: Vec<Vec<usize>> = vec![Vec::new()];

    let mut routes_with_cost: HashMap<u32, (Addr, u32)> = HashMap::new();
    let mut default_gateway: Option<Addr> = None;

    let mut heap: BinaryHeap<Reverse<HeapItem>> = BinaryHeap::new();
    for root in roots {
        heap.push(Reverse(HeapItem {
            cost: 0,
            node: root,
            parent_idx: 0,
            gateway: root.addr,
        }));
    }

    while let Some(Reverse(HeapItem {
        cost,
        node,
        parent_idx,
        gateway,
    })) = heap.pop()
    {
        if default_gateway.is_none() && node.gateway {
            default_gateway = Some(node.addr);
        }

        match routes_with_cost.get(&node.addr.0).copied() {
            None => {
                let new_idx = arena.len();
                arena.push(Node::new(node.addr, node.ethernet, node.gateway));
                children_of.push(Vec::new());
                children_of[parent_idx].push(new_idx);
                routes_with_cost.insert(node.addr.0, (gateway, cost));

                let step = if node.ethernet {
                    ETHERNET_COST
                } else {
                    WIRELESS_COST
                };
                for child in &node.children {
                    heap.push(Reverse(HeapItem {
                        cost: cost + step,
                        node: child,
                        parent_idx: new_idx,
                        gateway,
                    }));
                }
            }
            Some((existing_gateway, existing_cost)) => {
                if existing_cost == cost {
                    if gateway.0 < existing_gateway.0 {
                        routes_with_cost.insert(node.addr.0, (gateway, cost));
                    }
                } else if existing_cost < cost {
                    // already have a cheaper path, ignore this one
                } else {
                    return InternalOrderingViolationSnafu {
                        addr: node.addr,
                        new_cost: cost,
                        existing_cost,
                    }
                    .fail();
                }
            }
        }
    }

    fn assemble(arena: &[Node], children_of: &[Vec<usize>], idx: usize) -> Node {
        let mut node = arena[idx].clone();
        node.children = children_of[idx]
            .iter()
            .map(|&c| assemble(arena, children_of, c))
            .collect();
        node
    }
    let tree = assemble(&arena, &children_of, 0);

    let routes = routes_with_cost
        .into_iter()
        .map(|(addr, (gateway, _cost))| Route::new(Addr::new(addr), 32, gateway))
        .collect();

    Ok(Merged {
        tree,
        routes,
        default_gateway,
    })
}

struct HeapItem<'a> {
    cost: u32,
    node: &'a Node,
    parent_idx: usize,
    gateway: Addr,
}

impl PartialEq for HeapItem<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.cost == other.cost
    }
}
impl Eq for HeapItem<'_> {}
impl PartialOrd for HeapItem<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapItem<'_> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.cost.cmp(&other.cost)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn a(n: u32) -> Addr {
        Addr::new(0xac10_0000 | n)
    }

    #[test]
    fn trivial_single_hop() {
        let mut neighbor = Node::new(a(2), true, false);
        neighbor.children.push(Node::new(a(3), true, false));
        let merged = merge(&[neighbor]).unwrap();

        let routes: Vec<_> = merged.routes.iter().collect();
        assert!(routes
            .iter()
            .any(|r| r.addr == a(2) && r.gateway == a(2) && r.netmask == 32));
        assert!(routes
            .iter()
            .any(|r| r.addr == a(3) && r.gateway == a(2) && r.netmask == 32));
    }

    #[test]
    fn wired_path_preferred_over_wireless() {
        // Root .2 and .4 each wrap the *same* advertised child .9; what
        // differs is our own link to the neighbor (root.ethernet), which
        // must be what decides the cost to .9, not any flag on .9 itself.
        let mut wired = Node::new(a(2), true, false);
        wired.children.push(Node::new(a(9), false, false));

        let mut wireless = Node::new(a(4), false, false);
        wireless.children.push(Node::new(a(9), false, false));

        let merged = merge(&[wired, wireless]).unwrap();
        let route = merged.routes.iter().find(|r| r.addr == a(9)).unwrap();
        assert_eq!(route.gateway, a(2));

        // Tie-break alone can't explain this: reversing which root is wired
        // (now .4 is wired, with the larger address) must flip the winner.
        let mut wired2 = Node::new(a(4), true, false);
        wired2.children.push(Node::new(a(9), false, false));
        let mut wireless2 = Node::new(a(2), false, false);
        wireless2.children.push(Node::new(a(9), false, false));
        let merged2 = merge(&[wired2, wireless2]).unwrap();
        let route2 = merged2.routes.iter().find(|r| r.addr == a(9)).unwrap();
        assert_eq!(route2.gateway, a(4));
    }

    #[test]
    fn equal_cost_tie_picks_smaller_gateway() {
        let mut n5 = Node::new(a(5), false, false);
        n5.children.push(Node::new(a(100), false, false));

        let mut n7 = Node::new(a(7), false, false);
        n7.children.push(Node::new(a(100), false, false));

        let merged = merge(&[n5, n7]).unwrap();
        let route = merged.routes.iter().find(|r| r.addr == a(100)).unwrap();
        assert_eq!(route.gateway, a(5));
    }

    #[test]
    fn first_gateway_flagged_node_wins_default_gateway() {
        let upstream = Node::new(a(2), true, true);
        let merged = merge(&[upstream]).unwrap();
        assert_eq!(merged.default_gateway, Some(a(2)));
    }

    #[test]
    fn no_gateway_flagged_node_yields_none() {
        let plain = Node::new(a(2), true, false);
        let merged = merge(&[plain]).unwrap();
        assert_eq!(merged.default_gateway, None);
    }
}
