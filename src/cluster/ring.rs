use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

/// Consistent hash ring over cluster addresses.
///
/// Each node is placed at `virtual_nodes` points. A key belongs to the first
/// point clockwise from its hash. Hashes come from SHA-256 so every node
/// computes the same ring from the same address list.
#[derive(Debug, Clone)]
pub struct HashRing {
    points: BTreeMap<u64, usize>,
    nodes: Vec<String>,
}

impl HashRing {
    pub fn new(nodes: &[String], virtual_nodes: usize) -> Self {
        let mut unique: Vec<String> = nodes.to_vec();
        unique.sort();
        unique.dedup();

        let mut points = BTreeMap::new();
        for (idx, node) in unique.iter().enumerate() {
            for replica in 0..virtual_nodes.max(1) {
                let point = hash_key(&format!("{node}#{replica}"));
                // On a point collision the lexicographically smaller node keeps it,
                // independent of insertion order.
                points.entry(point).or_insert(idx);
            }
        }

        Self {
            points,
            nodes: unique,
        }
    }

    /// Returns the node owning `key`, or `None` on an empty ring.
    pub fn owner(&self, key: &str) -> Option<&str> {
        let hash = hash_key(key);
        let (_, idx) = self
            .points
            .range(hash..)
            .next()
            .or_else(|| self.points.iter().next())?;
        self.nodes.get(*idx).map(String::as_str)
    }

    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

fn hash_key(key: &str) -> u64 {
    let digest = Sha256::digest(key.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn keys() -> Vec<String> {
        (0..5000).map(|i| format!("201801011234_{i}_{}", i % 7)).collect()
    }

    #[test]
    fn test_empty_ring_has_no_owner() {
        let ring = HashRing::new(&[], 160);
        assert!(ring.is_empty());
        assert_eq!(ring.owner("anything"), None);
    }

    #[test]
    fn test_owner_is_independent_of_list_order() {
        let a = HashRing::new(&nodes(&["a:1", "b:1", "c:1"]), 64);
        let b = HashRing::new(&nodes(&["c:1", "a:1", "b:1", "a:1"]), 64);
        for key in keys().iter().take(500) {
            assert_eq!(a.owner(key), b.owner(key));
        }
    }

    #[test]
    fn test_adding_node_only_moves_keys_to_new_node() {
        let before = HashRing::new(&nodes(&["A", "B"]), 160);
        let after = HashRing::new(&nodes(&["A", "B", "C"]), 160);

        let mut moved = 0;
        for key in keys() {
            let old = before.owner(&key).expect("owner");
            let new = after.owner(&key).expect("owner");
            if old != new {
                // Keys only ever move onto the new node; A's and B's other
                // assignments are untouched.
                assert_eq!(new, "C", "key {key} moved from {old} to {new}");
                moved += 1;
            }
        }

        assert!(moved > 0);
        assert!(moved < keys().len() / 2, "moved {moved} keys");
    }

    #[test]
    fn test_removing_node_moves_about_its_share() {
        let all = nodes(&["n1", "n2", "n3", "n4"]);
        let before = HashRing::new(&all, 160);
        let after = HashRing::new(&all[..3], 160);

        let total = keys().len();
        let moved = keys()
            .iter()
            .filter(|key| before.owner(key) != after.owner(key))
            .count();

        // Only keys owned by the removed node move: roughly total / 4.
        for key in keys() {
            if before.owner(&key) != after.owner(&key) {
                assert_eq!(before.owner(&key), Some("n4"));
            }
        }
        assert!(moved < total * 2 / 5, "moved {moved} of {total}");
    }

    #[test]
    fn test_distribution_is_roughly_even() {
        let ring = HashRing::new(&nodes(&["x", "y", "z"]), 160);
        let mut counts = std::collections::HashMap::new();
        for key in keys() {
            *counts.entry(ring.owner(&key).expect("owner")).or_insert(0) += 1;
        }
        for (node, count) in counts {
            assert!(count > 900, "{node} owns only {count} keys");
        }
    }
}
