//! Admission control: at most one record per identifier per dataset.

pub mod fuzzy;

use std::collections::HashSet;

use crate::types::{DedupOptions, DedupStats, Record, ShardSpec};

pub use fuzzy::{FuzzyMatch, FuzzyMatcher};

/// Identifiers present in the current logical dataset.
///
/// A derived view: rebuilt from segments at startup and never persisted on its own.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DedupIndex {
    identifiers: HashSet<String>,
}

impl DedupIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn contains(&self, identifier: &str) -> bool {
        self.identifiers.contains(identifier)
    }

    /// Returns `false` when the identifier was already present.
    pub fn insert(&mut self, identifier: &str) -> bool {
        if self.identifiers.contains(identifier) {
            return false;
        }
        self.identifiers.insert(identifier.to_string())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.identifiers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.identifiers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.identifiers.iter().map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Identifier already admitted.
    Duplicate,
    /// Different identifier, but the fuzzy layer judged it the same entity.
    NearDuplicate,
    /// Identifier belongs to another worker's shard.
    ForeignShard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accepted,
    Rejected(Rejection),
}

impl Admission {
    #[must_use]
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }
}

/// Decides admit/reject for each normalized record and owns the [`DedupIndex`].
#[derive(Debug, Clone)]
pub struct Deduplicator {
    index: DedupIndex,
    fuzzy: Option<FuzzyMatcher>,
    shard: ShardSpec,
    stats: DedupStats,
}

impl Default for Deduplicator {
    fn default() -> Self {
        Self::exact()
    }
}

impl Deduplicator {
    #[must_use]
    pub fn new(options: &DedupOptions, shard: ShardSpec) -> Self {
        let fuzzy = options
            .fuzzy
            .enabled
            .then(|| FuzzyMatcher::new(options.fuzzy.clone()));
        Self {
            index: DedupIndex::new(),
            fuzzy,
            shard,
            stats: DedupStats::default(),
        }
    }

    /// Identifier matching only, single shard.
    #[must_use]
    pub fn exact() -> Self {
        Self::new(&DedupOptions::default(), ShardSpec::single())
    }

    /// Admit a record if its identifier is new.
    ///
    /// On acceptance the identifier is inserted before returning, so a second call with
    /// the same identifier is always rejected. Rejections are counted, never errors.
    pub fn admit(&mut self, record: &Record) -> Admission {
        let identifier = record.identifier.as_str();
        if !self.shard.owns(identifier) {
            self.stats.foreign_shard += 1;
            tracing::debug!(
                record.identifier = identifier,
                shard.index = self.shard.index,
                "record outside shard"
            );
            return Admission::Rejected(Rejection::ForeignShard);
        }
        if self.index.contains(identifier) {
            self.stats.duplicates += 1;
            return Admission::Rejected(Rejection::Duplicate);
        }
        if let Some(found) = self.fuzzy.as_ref().and_then(|m| m.find_match(record)) {
            self.stats.near_duplicates += 1;
            tracing::warn!(
                target: "trawl_core::audit",
                { record.identifier = identifier, matched.identifier = %found.existing, similarity = found.similarity },
                "near-duplicate suppressed"
            );
            return Admission::Rejected(Rejection::NearDuplicate);
        }

        self.insert(record);
        self.stats.accepted += 1;
        Admission::Accepted
    }

    /// Re-insert a record already on disk. Returns `false` for a repeated identifier.
    pub fn restore(&mut self, record: &Record) -> bool {
        if self.index.contains(&record.identifier) {
            return false;
        }
        self.insert(record);
        true
    }

    fn insert(&mut self, record: &Record) {
        self.index.insert(&record.identifier);
        if let Some(matcher) = self.fuzzy.as_mut() {
            matcher.insert(record);
        }
    }

    #[must_use]
    pub fn index(&self) -> &DedupIndex {
        &self.index
    }

    #[must_use]
    pub fn into_index(self) -> DedupIndex {
        self.index
    }

    #[must_use]
    pub fn stats(&self) -> DedupStats {
        self.stats
    }

    #[must_use]
    pub fn shard(&self) -> ShardSpec {
        self.shard
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.index.len()
    }
}
