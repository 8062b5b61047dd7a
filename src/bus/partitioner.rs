// ABOUTME: Key partitioner - maps a serialized primary key to a stable partition
// ABOUTME: Same key, same partition, across processes and restarts

use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyPartitioner {
    partitions: u32,
}

impl KeyPartitioner {
    pub fn new(partitions: u32) -> Self {
        Self {
            partitions: partitions.max(1),
        }
    }

    pub fn partitions(&self) -> u32 {
        self.partitions
    }

    /// First four SHA-256 bytes, big-endian, modulo the partition count.
    /// Must stay stable across restarts: replayed entries keep their partition.
    pub fn partition(&self, key: &str) -> u32 {
        let digest = Sha256::digest(key.as_bytes());
        let hash = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
        hash % self.partitions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_partition_is_deterministic() {
        let p = KeyPartitioner::new(8);
        let key = r#"public.products:[["id",42]]"#;
        assert_eq!(p.partition(key), p.partition(key));
        assert!(p.partition(key) < 8);
    }

    #[test]
    fn test_keys_spread_over_partitions() {
        let p = KeyPartitioner::new(8);
        let used: HashSet<u32> = (0..200)
            .map(|i| p.partition(&format!("orders:[[\"id\",{}]]", i)))
            .collect();
        assert!(used.len() >= 6, "only {} partitions used", used.len());
    }

    #[test]
    fn test_zero_partitions_means_one() {
        let p = KeyPartitioner::new(0);
        assert_eq!(p.partitions(), 1);
        assert_eq!(p.partition("anything"), 0);
    }
}
