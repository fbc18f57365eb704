//! Rebuilding session state from a run's segments and its master log.
//!
//! Resume only reads. Running it twice over the same directory produces the same
//! index, count and diagnostics; repairs happen later, when the writer opens.

use crate::dedup::{DedupIndex, Deduplicator};
use crate::error::Result;
use crate::io::layout::{RunLayout, SegmentState};
use crate::io::segment::SegmentReader;
use crate::types::{DedupOptions, ResumeDiagnostics};

/// Where a resumed session starts from.
#[derive(Debug, Clone)]
pub struct ResumePoint {
    /// Distinct identifiers already collected.
    pub resume_count: u64,
    /// Complete lines replayed, duplicates included.
    pub records_replayed: u64,
    pub segments: usize,
    /// Identifiers found only in the master log, such as after segments were pruned.
    pub master_only: u64,
    pub diagnostics: ResumeDiagnostics,
    deduplicator: Deduplicator,
}

impl ResumePoint {
    #[must_use]
    pub fn index(&self) -> &DedupIndex {
        self.deduplicator.index()
    }

    /// The rebuilt deduplicator, ready to admit new records.
    #[must_use]
    pub fn into_deduplicator(self) -> Deduplicator {
        self.deduplicator
    }
}

#[derive(Debug, Clone)]
pub struct ResumeCoordinator {
    layout: RunLayout,
}

impl ResumeCoordinator {
    #[must_use]
    pub fn new(layout: RunLayout) -> Self {
        Self { layout }
    }

    /// Exact-match replay.
    pub fn scan(&self) -> Result<ResumePoint> {
        self.resume(&DedupOptions::default())
    }

    /// Replay every segment in sequence order into a fresh deduplicator built from
    /// `options` and the layout's shard, then fold in the master log when one exists.
    ///
    /// Segment diagnostics only describe segments; master records that a segment
    /// already holds are not counted as duplicates.
    pub fn resume(&self, options: &DedupOptions) -> Result<ResumePoint> {
        let mut deduplicator = Deduplicator::new(options, self.layout.shard());
        let mut diagnostics = ResumeDiagnostics::default();
        let mut replayed = 0u64;

        let segments = self.layout.list_segments()?;
        for segment in &segments {
            let mut duplicates = 0u64;
            let summary = SegmentReader::scan(&segment.path, |record| {
                if !deduplicator.restore(&record) {
                    duplicates += 1;
                }
                Ok(())
            })?;
            replayed += summary.records;
            diagnostics.cross_segment_duplicates += duplicates;

            if summary.torn_tail {
                diagnostics.torn_tails.push(segment.path.clone());
            }
            match segment.name.state {
                SegmentState::Open => diagnostics.orphaned_open.push(segment.path.clone()),
                SegmentState::Sealed { records, .. } if records != summary.records => {
                    tracing::warn!(
                        segment.path = %segment.path.display(),
                        segment.expected = records,
                        segment.found = summary.records,
                        "sealed segment count mismatch"
                    );
                    diagnostics.count_mismatches.push(segment.path.clone());
                }
                SegmentState::Sealed { .. } => {}
            }
        }

        let master = self.layout.master_path();
        let mut master_only = 0u64;
        if master.is_file() {
            let summary = SegmentReader::scan(&master, |record| {
                if deduplicator.restore(&record) {
                    master_only += 1;
                }
                Ok(())
            })?;
            replayed += summary.records;
            tracing::debug!(
                master.path = %master.display(),
                master.records = summary.records,
                master.only = master_only,
                "master log replayed"
            );
        }

        let resume_count = deduplicator.len() as u64;
        tracing::info!(
            resume.dir = %self.layout.segments_dir().display(),
            resume.segments = segments.len(),
            resume.count = resume_count,
            resume.replayed = replayed,
            resume.master_only = master_only,
            resume.clean = diagnostics.is_clean(),
            "resume state rebuilt"
        );
        Ok(ResumePoint {
            resume_count,
            records_replayed: replayed,
            segments: segments.len(),
            master_only,
            diagnostics,
            deduplicator,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Record, ShardSpec};
    use chrono::Utc;
    use tempfile::TempDir;

    fn write(layout: &RunLayout, name: &str, ids: &[&str]) {
        let dir = layout.segments_dir();
        fs_err::create_dir_all(&dir).unwrap();
        let now = Utc::now();
        let body: String = ids
            .iter()
            .map(|id| Record::new(*id, now).to_line().unwrap())
            .collect();
        fs_err::write(dir.join(name), body).unwrap();
    }

    #[test]
    fn empty_directory_resumes_from_zero() {
        let tmp = TempDir::new().unwrap();
        let layout = RunLayout::new(tmp.path(), "r", "m", ShardSpec::single()).unwrap();
        let point = ResumeCoordinator::new(layout).scan().unwrap();
        assert_eq!(point.resume_count, 0);
        assert!(point.diagnostics.is_clean());
    }

    #[test]
    fn reports_duplicates_mismatches_and_orphans() {
        let tmp = TempDir::new().unwrap();
        let layout = RunLayout::new(tmp.path(), "r", "m", ShardSpec::single()).unwrap();
        write(&layout, "r.m.s000001.n2.c00000002.jsonl", &["A", "B"]);
        write(&layout, "r.m.s000002.n3.c00000005.jsonl", &["B", "C"]);
        write(&layout, "r.m.s000003.open.jsonl", &["D"]);

        let point = ResumeCoordinator::new(layout).scan().unwrap();
        assert_eq!(point.resume_count, 4);
        assert_eq!(point.records_replayed, 5);
        assert_eq!(point.diagnostics.cross_segment_duplicates, 1);
        assert_eq!(point.diagnostics.count_mismatches.len(), 1);
        assert_eq!(point.diagnostics.orphaned_open.len(), 1);
        assert!(point.index().contains("D"));
    }

    #[test]
    fn master_log_contributes_identifiers_without_diagnostics() {
        let tmp = TempDir::new().unwrap();
        let layout = RunLayout::new(tmp.path(), "r", "m", ShardSpec::single()).unwrap();
        write(&layout, "r.m.s000001.n2.c00000002.jsonl", &["A", "B"]);
        let master = layout.master_path();
        fs_err::create_dir_all(master.parent().unwrap()).unwrap();
        let now = Utc::now();
        let body: String = ["X", "A", "B"]
            .iter()
            .map(|id| Record::new(*id, now).to_line().unwrap())
            .collect();
        fs_err::write(&master, body).unwrap();

        let point = ResumeCoordinator::new(layout).scan().unwrap();
        assert_eq!(point.resume_count, 3);
        assert_eq!(point.master_only, 1);
        assert!(point.index().contains("X"));
        assert!(point.diagnostics.is_clean());
    }
}
