//! Identifier and sequence partitioning for independent workers.

use std::ops::RangeInclusive;

use serde::{Deserialize, Serialize};

use crate::constants::SEQUENCE_STRIDE;
use crate::error::{Result, TrawlError};

/// Which slice of the identifier space and segment numbering a worker owns.
///
/// Workers with distinct `index` values and the same `count` never admit the same
/// identifier and never write the same segment sequence number, so their master logs
/// can be unioned afterwards without sharing an index at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardSpec {
    pub index: u32,
    pub count: u32,
}

impl Default for ShardSpec {
    fn default() -> Self {
        Self::single()
    }
}

impl ShardSpec {
    /// One worker owning everything.
    #[must_use]
    pub const fn single() -> Self {
        Self { index: 0, count: 1 }
    }

    pub fn new(index: u32, count: u32) -> Result<Self> {
        let spec = Self { index, count };
        spec.validate()?;
        Ok(spec)
    }

    pub fn validate(&self) -> Result<()> {
        if self.count == 0 {
            return Err(TrawlError::config("shard count must be non-zero"));
        }
        if self.index >= self.count {
            return Err(TrawlError::config(format!(
                "shard index {} out of range for {} shards",
                self.index, self.count
            )));
        }
        Ok(())
    }

    #[must_use]
    pub fn is_single(&self) -> bool {
        self.count == 1
    }

    /// Shard bucket of an identifier, stable across processes and platforms.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn bucket_of(identifier: &str, count: u32) -> u32 {
        let digest = blake3::hash(identifier.as_bytes());
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest.as_bytes()[..8]);
        (u64::from_le_bytes(head) % u64::from(count.max(1))) as u32
    }

    #[must_use]
    pub fn owns(&self, identifier: &str) -> bool {
        self.is_single() || Self::bucket_of(identifier, self.count) == self.index
    }

    /// Segment sequence numbers reserved for this shard.
    #[must_use]
    pub fn sequence_range(&self) -> RangeInclusive<u64> {
        let start = u64::from(self.index) * SEQUENCE_STRIDE + 1;
        start..=start + SEQUENCE_STRIDE - 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_identifier_has_exactly_one_owner() {
        let shards: Vec<ShardSpec> = (0..4).map(|i| ShardSpec::new(i, 4).unwrap()).collect();
        for n in 0..200 {
            let id = format!("place-{n}");
            let owners = shards.iter().filter(|s| s.owns(&id)).count();
            assert_eq!(owners, 1, "{id} owned by {owners} shards");
        }
    }

    #[test]
    fn sequence_ranges_are_disjoint() {
        let a = ShardSpec::new(0, 2).unwrap().sequence_range();
        let b = ShardSpec::new(1, 2).unwrap().sequence_range();
        assert!(a.end() < b.start());
        assert_eq!(*a.start(), 1);
    }

    #[test]
    fn rejects_out_of_range_index() {
        assert!(ShardSpec::new(2, 2).is_err());
        assert!(ShardSpec::new(0, 0).is_err());
    }
}
