//! Ketama consistent hashing. Keys and ring points share the MD5-based
//! placement used by the classic libketama clients, so a key maps to
//! the same node from any client implementation given the same node
//! set.

use md5::{Digest, Md5};

use crate::address::Address;

/// Virtual points per node. Four 32-bit slices are taken from each MD5
/// digest, so this corresponds to 40 digests per node, the libketama
/// convention.
pub const DEFAULT_POINTS_PER_NODE: usize = 160;

/// An immutable ring mapping keys to node addresses. When the node set
/// changes a new ring is built and swapped in whole; rings are never
/// mutated in place.
#[derive(Debug, Clone)]
pub struct HashRing {
    addresses: Vec<Address>,
    points: Vec<(u32, usize)>,
}

impl HashRing {
    /// Build a ring with the default number of virtual points per node.
    pub fn new(addresses: Vec<Address>) -> Self {
        HashRing::with_points(addresses, DEFAULT_POINTS_PER_NODE)
    }

    /// Build a ring with a custom number of virtual points per node,
    /// rounded down to a multiple of four (one MD5 digest yields four
    /// points).
    pub fn with_points(addresses: Vec<Address>, points_per_node: usize) -> Self {
        let replicas = points_per_node / 4;
        let identities: Vec<String> = addresses.iter().map(Address::to_string).collect();

        let mut points = Vec::with_capacity(addresses.len() * replicas * 4);
        for (node_index, identity) in identities.iter().enumerate() {
            for replica in 0..replicas {
                let digest = Md5::digest(format!("{}-{}", identity, replica).as_bytes());
                for slice in 0..4 {
                    let point = u32::from_le_bytes(
                        digest[slice * 4..slice * 4 + 4].try_into().unwrap(),
                    );
                    points.push((point, node_index));
                }
            }
        }

        // On an exact point collision the node whose identity string
        // sorts first owns the point, so the binary search below always
        // lands on it.
        points.sort_unstable_by(|a, b| {
            a.0.cmp(&b.0)
                .then_with(|| identities[a.1].cmp(&identities[b.1]))
        });

        Self { addresses, points }
    }

    /// Number of nodes on the ring.
    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    /// The node owning the given key, or `None` on an empty ring.
    /// Deterministic for a fixed node set.
    pub fn pick(&self, key: &[u8]) -> Option<&Address> {
        if self.points.is_empty() {
            return None;
        }
        Some(&self.addresses[self.find_node(key)])
    }

    /// Group keys by their destination node, preserving the input order
    /// of keys within each group. Nodes owning no key are omitted.
    pub fn pick_many<K: AsRef<[u8]>>(&self, keys: Vec<K>) -> Vec<(&Address, Vec<K>)> {
        if self.points.is_empty() {
            return Vec::new();
        }
        let mut groups: Vec<Vec<K>> = (0..self.addresses.len()).map(|_| Vec::new()).collect();
        for key in keys {
            let node_index = self.find_node(key.as_ref());
            groups[node_index].push(key);
        }
        self.addresses
            .iter()
            .zip(groups)
            .filter(|(_, keys)| !keys.is_empty())
            .collect()
    }

    fn find_node(&self, key: &[u8]) -> usize {
        let ring_pos = hash_key(key);
        // First point whose value is >= the key position, wrapping
        // around past the last point.
        let point_index = self
            .points
            .partition_point(|(point, _)| *point < ring_pos);
        let (_, node_index) = self.points.get(point_index).unwrap_or(&self.points[0]);
        *node_index
    }
}

/// Position of a key on the ring: the first four bytes of its MD5
/// digest, little-endian, per the Ketama convention.
fn hash_key(key: &[u8]) -> u32 {
    let digest = Md5::digest(key);
    u32::from_le_bytes(digest[..4].try_into().unwrap())
}

#[cfg(test)]
mod tests {
    use super::{HashRing, DEFAULT_POINTS_PER_NODE};
    use crate::address::Address;

    fn three_nodes() -> Vec<Address> {
        vec![
            Address::tcp("localhost", 11211),
            Address::tcp("localhost", 11212),
            Address::tcp("localhost", 11213),
        ]
    }

    fn keys(n: usize) -> Vec<Vec<u8>> {
        (0..n).map(|i| format!("key-{}", i).into_bytes()).collect()
    }

    #[test]
    fn test_point_count() {
        let ring = HashRing::new(three_nodes());
        assert_eq!(3 * DEFAULT_POINTS_PER_NODE, ring.points.len());
        assert_eq!(3, ring.len());
    }

    #[test]
    fn test_empty_ring() {
        let ring = HashRing::new(vec![]);
        assert!(ring.is_empty());
        assert_eq!(None, ring.pick(b"foo"));
        assert!(ring.pick_many(keys(4)).is_empty());
    }

    #[test]
    fn test_deterministic_across_instances() {
        let a = HashRing::new(three_nodes());
        let b = HashRing::new(three_nodes());
        for key in keys(500) {
            assert_eq!(a.pick(&key), b.pick(&key));
        }
    }

    #[test]
    fn test_single_node_owns_everything() {
        let address = Address::tcp("localhost", 11211);
        let ring = HashRing::new(vec![address.clone()]);
        for key in keys(100) {
            assert_eq!(Some(&address), ring.pick(&key));
        }
    }

    #[test]
    fn test_all_nodes_get_traffic() {
        let ring = HashRing::new(three_nodes());
        let groups = ring.pick_many(keys(1000));
        assert_eq!(3, groups.len());
    }

    #[test]
    fn test_pick_many_matches_pick_and_preserves_order() {
        let ring = HashRing::new(three_nodes());
        let groups = ring.pick_many(keys(200));
        let mut seen = 0;
        for (address, group) in groups {
            // input order within each group: key indices ascending
            let indices: Vec<usize> = group
                .iter()
                .map(|key| {
                    std::str::from_utf8(key).unwrap()["key-".len()..]
                        .parse()
                        .unwrap()
                })
                .collect();
            let mut sorted = indices.clone();
            sorted.sort_unstable();
            assert_eq!(sorted, indices);

            for key in &group {
                assert_eq!(Some(address), ring.pick(key));
                seen += 1;
            }
        }
        assert_eq!(200, seen);
    }

    #[test]
    fn test_removing_a_node_moves_a_bounded_fraction() {
        let full = HashRing::new(three_nodes());
        let reduced = HashRing::new(three_nodes()[..2].to_vec());

        let keys = keys(1000);
        let moved = keys
            .iter()
            .filter(|key| full.pick(key) != reduced.pick(key))
            .count();

        // expectation is 1/3 of the keys; anything beyond 60% means the
        // ring is reshuffling instead of consistently hashing
        assert!(moved < 600, "{} of 1000 keys moved", moved);
    }
}
