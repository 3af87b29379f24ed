//! Consistent hashing with virtual nodes.
//!
//! Each physical node is hashed into `weight × vnodes_per_node` positions on
//! a u64 ring. A key's primary node is the first position clockwise from the
//! key's hash, so adding or removing one node remaps only the arcs that
//! change ownership.
//!
//! The ring itself is a plain value. The client shares it as an immutable
//! snapshot behind an `Arc`, so lookups are deterministic for a given
//! snapshot and never observe a topology change mid-flight.

use std::collections::BTreeMap;
use std::hash::Hasher;

use twox_hash::XxHash64;

/// One cache node on the ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    /// `host:port` address.
    pub addr: String,
    /// Relative weight; scales the node's virtual node count.
    pub weight: u32,
}

impl Node {
    pub fn new(addr: impl Into<String>, weight: u32) -> Self {
        Node {
            addr: addr.into(),
            weight: weight.max(1),
        }
    }
}

/// Consistent hash ring mapping keys to nodes.
#[derive(Debug, Clone)]
pub struct HashRing {
    /// Ring position to node index. On hash collisions the first-inserted
    /// node keeps the position, so lookups stay stable across rebuilds.
    positions: BTreeMap<u64, usize>,
    nodes: Vec<Node>,
    vnodes_per_node: usize,
}

impl HashRing {
    /// Builds a ring over `nodes` with `vnodes_per_node` positions per unit
    /// of weight.
    pub fn build(nodes: Vec<Node>, vnodes_per_node: usize) -> Self {
        let mut ring = HashRing {
            positions: BTreeMap::new(),
            nodes: Vec::new(),
            vnodes_per_node: vnodes_per_node.max(1),
        };
        for node in nodes {
            ring.add_node(node);
        }
        ring
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn contains(&self, addr: &str) -> bool {
        self.nodes.iter().any(|node| node.addr == addr)
    }

    /// Adds a node, claiming only positions no earlier node already owns.
    /// Adding an address already present is a no-op.
    pub fn add_node(&mut self, node: Node) {
        if self.contains(&node.addr) {
            return;
        }
        let idx = self.nodes.len();
        for position in vnode_positions(&node, self.vnodes_per_node) {
            self.positions.entry(position).or_insert(idx);
        }
        self.nodes.push(node);
    }

    /// Removes a node by address. Positions are rebuilt from the remaining
    /// nodes in their original insertion order, so surviving arcs keep their
    /// owners.
    pub fn remove_node(&mut self, addr: &str) {
        let Some(removed) = self.nodes.iter().position(|node| node.addr == addr) else {
            return;
        };
        self.nodes.remove(removed);

        self.positions.clear();
        for (idx, node) in self.nodes.iter().enumerate() {
            for position in vnode_positions(node, self.vnodes_per_node) {
                self.positions.entry(position).or_insert(idx);
            }
        }
    }

    /// Primary node for a key: the first ring position clockwise from the
    /// key's hash. Returns `None` on an empty ring.
    pub fn select(&self, key: &[u8]) -> Option<&Node> {
        let hash = hash_bytes(key);
        self.positions
            .range(hash..)
            .next()
            .or_else(|| self.positions.iter().next())
            .map(|(_, &idx)| &self.nodes[idx])
    }

    /// Up to `count` distinct nodes in ring order starting at the key's
    /// primary. The result never exceeds the node count.
    pub fn select_replicas(&self, key: &[u8], count: usize) -> Vec<&Node> {
        if self.positions.is_empty() || count == 0 {
            return Vec::new();
        }

        let hash = hash_bytes(key);
        let limit = count.min(self.nodes.len());
        let mut picked: Vec<usize> = Vec::with_capacity(limit);

        let wrapped = self
            .positions
            .range(hash..)
            .chain(self.positions.range(..hash));
        for (_, &idx) in wrapped {
            if !picked.contains(&idx) {
                picked.push(idx);
                if picked.len() == limit {
                    break;
                }
            }
        }

        picked.into_iter().map(|idx| &self.nodes[idx]).collect()
    }
}

fn vnode_positions<'a>(node: &'a Node, vnodes_per_node: usize) -> impl Iterator<Item = u64> + 'a {
    let count = vnodes_per_node * node.weight as usize;
    (0..count).map(move |i| {
        let mut hasher = XxHash64::with_seed(0);
        hasher.write(node.addr.as_bytes());
        hasher.write(b":");
        hasher.write(&(i as u64).to_le_bytes());
        hasher.finish()
    })
}

fn hash_bytes(key: &[u8]) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(key);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring_of(addrs: &[&str]) -> HashRing {
        HashRing::build(
            addrs.iter().map(|addr| Node::new(*addr, 1)).collect(),
            64,
        )
    }

    #[test]
    fn empty_ring_selects_nothing() {
        let ring = ring_of(&[]);
        assert!(ring.select(b"key").is_none());
        assert!(ring.select_replicas(b"key", 2).is_empty());
    }

    #[test]
    fn single_node_owns_everything() {
        let ring = ring_of(&["10.0.0.1:11211"]);
        for i in 0..100 {
            let key = format!("key-{}", i);
            assert_eq!(ring.select(key.as_bytes()).unwrap().addr, "10.0.0.1:11211");
        }
    }

    #[test]
    fn selection_is_deterministic() {
        let ring = ring_of(&["a:1", "b:1", "c:1"]);
        let first = ring.select(b"stable-key").unwrap().addr.clone();
        for _ in 0..10 {
            assert_eq!(ring.select(b"stable-key").unwrap().addr, first);
        }
    }

    #[test]
    fn replicas_are_distinct_and_bounded() {
        let ring = ring_of(&["a:1", "b:1", "c:1"]);
        let replicas = ring.select_replicas(b"key", 5);
        assert_eq!(replicas.len(), 3);
        let mut addrs: Vec<_> = replicas.iter().map(|n| n.addr.clone()).collect();
        addrs.dedup();
        assert_eq!(addrs.len(), 3);

        let primary = ring.select(b"key").unwrap();
        assert_eq!(replicas[0].addr, primary.addr);
    }

    #[test]
    fn duplicate_add_is_ignored() {
        let mut ring = ring_of(&["a:1"]);
        ring.add_node(Node::new("a:1", 1));
        assert_eq!(ring.node_count(), 1);
    }

    #[test]
    fn remove_missing_is_ignored() {
        let mut ring = ring_of(&["a:1"]);
        ring.remove_node("z:1");
        assert_eq!(ring.node_count(), 1);
    }

    #[test]
    fn removal_reassigns_only_the_lost_arcs() {
        let mut ring = ring_of(&["a:1", "b:1", "c:1"]);
        let keys: Vec<String> = (0..1000).map(|i| format!("key-{}", i)).collect();
        let before: Vec<String> = keys
            .iter()
            .map(|k| ring.select(k.as_bytes()).unwrap().addr.clone())
            .collect();

        ring.remove_node("b:1");

        for (key, owner) in keys.iter().zip(&before) {
            let now = &ring.select(key.as_bytes()).unwrap().addr;
            if owner != "b:1" {
                assert_eq!(now, owner, "key {} moved off a surviving node", key);
            } else {
                assert_ne!(now, "b:1");
            }
        }
    }

    #[test]
    fn adding_a_node_remaps_about_one_nth() {
        let mut ring = ring_of(&["a:1", "b:1", "c:1"]);
        let keys: Vec<String> = (0..4000).map(|i| format!("key-{}", i)).collect();
        let before: Vec<String> = keys
            .iter()
            .map(|k| ring.select(k.as_bytes()).unwrap().addr.clone())
            .collect();

        ring.add_node(Node::new("d:1", 1));

        let mut moved = 0usize;
        for (key, owner) in keys.iter().zip(&before) {
            let now = &ring.select(key.as_bytes()).unwrap().addr;
            if now != owner {
                // A key may only move to the new node, never between old ones.
                assert_eq!(now, "d:1");
                moved += 1;
            }
        }

        // Expectation is k/n = 1000 of 4000; allow generous variance.
        assert!(moved > 400, "only {} of 4000 keys moved", moved);
        assert!(moved < 1800, "{} of 4000 keys moved", moved);
    }

    #[test]
    fn weight_scales_ownership() {
        let ring = HashRing::build(
            vec![Node::new("heavy:1", 3), Node::new("light:1", 1)],
            64,
        );

        let mut heavy = 0usize;
        for i in 0..4000 {
            let key = format!("key-{}", i);
            if ring.select(key.as_bytes()).unwrap().addr == "heavy:1" {
                heavy += 1;
            }
        }
        // heavy owns ~3/4 of the space.
        assert!(heavy > 2400, "heavy node owns only {} of 4000", heavy);
    }

    #[test]
    fn distribution_is_roughly_even() {
        let ring = ring_of(&["a:1", "b:1", "c:1", "d:1"]);
        let mut counts = std::collections::HashMap::new();
        for i in 0..8000 {
            let key = format!("sample-{}", i);
            *counts
                .entry(ring.select(key.as_bytes()).unwrap().addr.clone())
                .or_insert(0usize) += 1;
        }
        for (addr, count) in counts {
            assert!(
                count > 1000 && count < 3200,
                "node {} owns {} of 8000 keys",
                addr,
                count
            );
        }
    }
}
