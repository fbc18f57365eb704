//! Compaction of a run's segments into one duplicate-free master log.
//!
//! Output is a pure function of the input files and their order: every record is
//! re-serialized canonically, so compacting the same segments twice, or compacting a
//! master log on its own, reproduces the same bytes. An existing master log is read
//! ahead of the segments, so records whose segments were pruned are kept.

use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use atomic_write_file::AtomicWriteFile;

use crate::dedup::Deduplicator;
use crate::error::{Result, TrawlError};
use crate::io::layout::RunLayout;
use crate::io::segment::SegmentReader;
use crate::lock::DirLock;
use crate::types::CompactionReport;

#[derive(Debug, Clone)]
pub struct MasterCompactor {
    layout: RunLayout,
}

impl MasterCompactor {
    #[must_use]
    pub fn new(layout: RunLayout) -> Self {
        Self { layout }
    }

    /// Take the segment directory lock and compact.
    pub fn compact(&self) -> Result<CompactionReport> {
        let lock = DirLock::acquire(&self.layout.segments_dir())?;
        self.compact_locked(&lock)
    }

    /// Compact while the caller already holds the directory lock.
    ///
    /// Sources are the current master log, when present, followed by every segment
    /// in sequence order.
    pub fn compact_locked(&self, lock: &DirLock) -> Result<CompactionReport> {
        let dir = self.layout.segments_dir();
        if !lock.covers(&dir) {
            return Err(TrawlError::Lock(format!(
                "compaction of {} attempted without its lock",
                dir.display()
            )));
        }
        let master = self.layout.master_path();
        let mut sources = Vec::new();
        if master.is_file() {
            sources.push(master.clone());
        }
        sources.extend(
            self.layout
                .list_segments()?
                .into_iter()
                .map(|segment| segment.path),
        );
        compact_sources(&sources, &master)
    }
}

/// Stream `sources` in order through a fresh exact deduplicator into `output`.
pub(crate) fn compact_sources(sources: &[PathBuf], output: &Path) -> Result<CompactionReport> {
    if let Some(parent) = output.parent() {
        fs_err::create_dir_all(parent)?;
    }
    let mut staging = MasterStaging::prepare(output)?;
    let mut dedup = Deduplicator::exact();
    let mut report = CompactionReport {
        output: output.to_path_buf(),
        sources: sources.len(),
        records_read: 0,
        records_written: 0,
        duplicates_dropped: 0,
        torn_tails_discarded: 0,
    };

    for source in sources {
        let summary = SegmentReader::scan(source, |record| {
            report.records_read += 1;
            if dedup.admit(&record).is_accepted() {
                staging.write_line(&record.to_line()?)?;
                report.records_written += 1;
            } else {
                report.duplicates_dropped += 1;
            }
            Ok(())
        });
        let summary = match summary {
            Ok(summary) => summary,
            Err(err) => {
                staging.discard()?;
                return Err(err);
            }
        };
        if summary.torn_tail {
            report.torn_tails_discarded += 1;
        }
    }

    staging.commit()?;
    tracing::info!(
        compact.output = %output.display(),
        compact.sources = report.sources,
        compact.written = report.records_written,
        compact.dropped = report.duplicates_dropped,
        "master log written"
    );
    Ok(report)
}

/// New master contents, invisible until committed.
struct MasterStaging {
    writer: BufWriter<AtomicWriteFile>,
}

impl MasterStaging {
    fn prepare(path: &Path) -> Result<Self> {
        let atomic = AtomicWriteFile::options().open(path)?;
        Ok(Self {
            writer: BufWriter::new(atomic),
        })
    }

    fn write_line(&mut self, line: &str) -> Result<()> {
        self.writer.write_all(line.as_bytes())?;
        Ok(())
    }

    fn commit(self) -> Result<()> {
        let atomic = self.writer.into_inner().map_err(|err| err.into_error())?;
        atomic.commit().map_err(Into::into)
    }

    fn discard(self) -> Result<()> {
        let (atomic, _) = self.writer.into_parts();
        atomic.discard().map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Record, ShardSpec};
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    #[test]
    fn segment_set_without_segments_yields_empty_master() {
        let tmp = TempDir::new().unwrap();
        let layout = RunLayout::new(tmp.path(), "r", "m", ShardSpec::single()).unwrap();
        let report = MasterCompactor::new(layout.clone()).compact().unwrap();
        assert_eq!(report.records_written, 0);
        assert_eq!(fs_err::read(layout.master_path()).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn corrupt_source_leaves_previous_master_in_place() {
        let tmp = TempDir::new().unwrap();
        let output = tmp.path().join("out.jsonl");
        fs_err::write(&output, "previous\n").unwrap();

        let bad = tmp.path().join("bad.jsonl");
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let body = format!("garbage\n{}", Record::new("A", ts).to_line().unwrap());
        fs_err::write(&bad, body).unwrap();

        assert!(compact_sources(&[bad], &output).is_err());
        assert_eq!(fs_err::read_to_string(&output).unwrap(), "previous\n");
    }

    #[test]
    fn pruned_segments_keep_their_records_in_the_master() {
        let tmp = TempDir::new().unwrap();
        let layout = RunLayout::new(tmp.path(), "r", "m", ShardSpec::single()).unwrap();
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let dir = layout.segments_dir();
        fs_err::create_dir_all(&dir).unwrap();
        let first = dir.join("r.m.s000001.n2.c00000002.jsonl");
        let body: String = ["A", "B"]
            .iter()
            .map(|id| Record::new(*id, ts).to_line().unwrap())
            .collect();
        fs_err::write(&first, body).unwrap();
        let compactor = MasterCompactor::new(layout.clone());
        compactor.compact().unwrap();

        fs_err::remove_file(&first).unwrap();
        let body: String = ["B", "C"]
            .iter()
            .map(|id| Record::new(*id, ts).to_line().unwrap())
            .collect();
        fs_err::write(dir.join("r.m.s000002.n2.c00000004.jsonl"), body).unwrap();

        let report = compactor.compact().unwrap();
        assert_eq!(report.sources, 2);
        assert_eq!(report.records_written, 3);
        assert_eq!(report.duplicates_dropped, 1);
        let (records, _) = SegmentReader::read_all(&layout.master_path()).unwrap();
        let ids: Vec<String> = records
            .into_iter()
            .map(|r| r.identifier)
            .collect();
        assert_eq!(ids, vec!["A", "B", "C"]);
    }

    #[test]
    fn compaction_refuses_a_foreign_lock() {
        let tmp = TempDir::new().unwrap();
        let layout = RunLayout::new(tmp.path(), "r", "m", ShardSpec::single()).unwrap();
        let other = DirLock::acquire(&tmp.path().join("other")).unwrap();
        let err = MasterCompactor::new(layout).compact_locked(&other).unwrap_err();
        assert!(matches!(err, TrawlError::Lock(_)));
    }
}
