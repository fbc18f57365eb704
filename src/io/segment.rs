//! Line-delimited checkpoint segments.
//!
//! A segment holds one JSON record per line. A record counts as written only once its
//! terminating newline is on disk, so a crash mid-write leaves at most one unterminated
//! (or garbled) final line. [`SegmentReader`] drops that torn tail and trusts everything
//! before it; a bad line anywhere else is corruption.
//!
//! [`SegmentWriter`] appends with a single `write_all` per record and calls
//! `sync_data` every `flush_interval` appends, so an abrupt stop loses at most
//! `flush_interval - 1` admitted records. Full segments are sealed by renaming
//! `*.open.jsonl` to a name carrying the record counts; a sealed segment is never
//! opened for writing again.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use crate::error::{Result, TrawlError};
use crate::io::layout::{RunLayout, SegmentFile, SegmentName, SegmentState};
use crate::lock::DirLock;
use crate::types::{CheckpointConfig, Record};

/// Outcome of reading one segment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SegmentSummary {
    /// Complete records handed to the visitor.
    pub records: u64,
    /// Byte length of the trusted prefix.
    pub valid_len: u64,
    /// A trailing partial record was found and skipped.
    pub torn_tail: bool,
}

pub struct SegmentReader;

impl SegmentReader {
    /// Stream every complete record of `path` into `visit`, in file order.
    pub fn scan<F>(path: &Path, mut visit: F) -> Result<SegmentSummary>
    where
        F: FnMut(Record) -> Result<()>,
    {
        let file = fs_err::File::open(path)?;
        let mut reader = BufReader::new(file);
        let mut summary = SegmentSummary::default();
        let mut buf = Vec::new();
        let mut line_no = 0u64;

        loop {
            buf.clear();
            let read = reader.read_until(b'\n', &mut buf)?;
            if read == 0 {
                break;
            }
            line_no += 1;
            if buf.last() != Some(&b'\n') {
                summary.torn_tail = true;
                break;
            }

            let text = match std::str::from_utf8(&buf) {
                Ok(text) => text.trim(),
                Err(err) => {
                    if reader.fill_buf()?.is_empty() {
                        summary.torn_tail = true;
                        break;
                    }
                    return Err(corruption(path, line_no, err.to_string()));
                }
            };
            if !text.is_empty() {
                match Record::from_line(text) {
                    Ok(record) => {
                        visit(record)?;
                        summary.records += 1;
                    }
                    Err(err) => {
                        // A garbled final line is a torn write, not corruption.
                        if reader.fill_buf()?.is_empty() {
                            summary.torn_tail = true;
                            break;
                        }
                        return Err(corruption(path, line_no, err.to_string()));
                    }
                }
            }
            summary.valid_len += read as u64;
        }

        if summary.torn_tail {
            tracing::warn!(
                segment.path = %path.display(),
                segment.valid_len = summary.valid_len,
                "discarding torn tail"
            );
        }
        Ok(summary)
    }

    /// Collect all complete records. Convenient for small segments and tests.
    pub fn read_all(path: &Path) -> Result<(Vec<Record>, SegmentSummary)> {
        let mut records = Vec::new();
        let summary = Self::scan(path, |record| {
            records.push(record);
            Ok(())
        })?;
        Ok((records, summary))
    }
}

fn corruption(path: &Path, line: u64, reason: String) -> TrawlError {
    TrawlError::SegmentCorruption {
        path: path.to_path_buf(),
        line,
        reason,
    }
}

/// What happened to one appended record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendReceipt {
    pub sequence: u64,
    /// The append was followed by a durable flush.
    pub flushed: bool,
    /// Set when the append filled the segment and it was sealed.
    pub sealed: Option<PathBuf>,
}

#[derive(Debug)]
struct OpenSegment {
    name: SegmentName,
    path: PathBuf,
    file: File,
    records: u64,
    unflushed: usize,
}

/// Appends admitted records to the currently open segment of one run.
#[derive(Debug)]
pub struct SegmentWriter {
    layout: RunLayout,
    config: CheckpointConfig,
    dir: PathBuf,
    next_sequence: u64,
    cumulative: u64,
    current: Option<OpenSegment>,
    sealed_count: u64,
}

impl SegmentWriter {
    /// Open the writer for `layout`, repairing segments left open by a crash.
    ///
    /// The caller must hold the directory lock. Orphaned open segments are cut back to
    /// their last complete record and sealed; new records always go to a fresh
    /// sequence number.
    pub fn open(layout: RunLayout, config: CheckpointConfig, lock: &DirLock) -> Result<Self> {
        config.validate()?;
        let dir = layout.segments_dir();
        if !lock.covers(&dir) {
            return Err(TrawlError::Lock(format!(
                "writer for {} opened without holding its lock",
                dir.display()
            )));
        }
        fs_err::create_dir_all(&dir)?;

        let range = layout.shard().sequence_range();
        let mut cumulative = 0u64;
        let mut last_sequence = None;
        for segment in layout.list_segments()? {
            let records = match segment.name.state {
                SegmentState::Sealed { records, .. } => records,
                SegmentState::Open => repair_orphan(&layout, &segment, cumulative)?,
            };
            cumulative += records;
            if range.contains(&segment.name.sequence) {
                last_sequence = Some(segment.name.sequence);
            }
        }
        let next_sequence = last_sequence.map_or(*range.start(), |seq| seq + 1);

        tracing::debug!(
            segment.dir = %dir.display(),
            segment.next_sequence = next_sequence,
            segment.cumulative = cumulative,
            "segment writer opened"
        );
        Ok(Self {
            layout,
            config,
            dir,
            next_sequence,
            cumulative,
            current: None,
            sealed_count: 0,
        })
    }

    /// Append one record; returns once it is written (and flushed, when due).
    ///
    /// I/O failures surface as [`TrawlError::Durability`].
    pub fn append(&mut self, record: &Record) -> Result<AppendReceipt> {
        let line = record.to_line()?;
        if self.current.is_none() {
            self.current = Some(self.start_segment()?);
        }
        let Some(segment) = self.current.as_mut() else {
            return Err(TrawlError::Lock("no open segment".into()));
        };

        segment
            .file
            .write_all(line.as_bytes())
            .map_err(|err| durability_failure(&segment.path, &err))?;
        segment.records += 1;
        segment.unflushed += 1;
        self.cumulative += 1;

        let mut flushed = false;
        if segment.unflushed >= self.config.flush_interval {
            segment
                .file
                .sync_data()
                .map_err(|err| durability_failure(&segment.path, &err))?;
            segment.unflushed = 0;
            flushed = true;
        }

        let sequence = segment.name.sequence;
        tracing::debug!(
            segment.sequence = sequence,
            segment.records = segment.records,
            record.identifier = %record.identifier,
            "record appended"
        );

        let sealed = if segment.records >= self.config.segment_capacity as u64 {
            self.seal()?
        } else {
            None
        };
        Ok(AppendReceipt {
            sequence,
            flushed,
            sealed,
        })
    }

    /// Make every appended record durable.
    pub fn flush(&mut self) -> Result<()> {
        if let Some(segment) = self.current.as_mut() {
            if segment.unflushed > 0 {
                segment
                    .file
                    .sync_data()
                    .map_err(|err| durability_failure(&segment.path, &err))?;
                segment.unflushed = 0;
            }
        }
        Ok(())
    }

    /// Seal the open segment, if any. An empty open segment is removed instead.
    pub fn seal(&mut self) -> Result<Option<PathBuf>> {
        let Some(segment) = self.current.take() else {
            return Ok(None);
        };
        segment
            .file
            .sync_all()
            .map_err(|err| durability_failure(&segment.path, &err))?;
        drop(segment.file);

        if segment.records == 0 {
            fs_err::remove_file(&segment.path)
                .map_err(|err| durability_failure(&segment.path, &err))?;
            sync_dir(&self.dir)?;
            return Ok(None);
        }

        let sealed = segment.name.sealed(segment.records, self.cumulative);
        let target = self.layout.segment_path(&sealed);
        fs_err::rename(&segment.path, &target).map_err(|err| durability_failure(&target, &err))?;
        sync_dir(&self.dir)?;
        self.sealed_count += 1;

        tracing::info!(
            segment.sequence = sealed.sequence,
            segment.records = segment.records,
            segment.cumulative = self.cumulative,
            "segment sealed"
        );
        Ok(Some(target))
    }

    /// Flush and seal; the writer is finished afterwards.
    pub fn close(mut self) -> Result<Option<PathBuf>> {
        self.flush()?;
        self.seal()
    }

    /// Records written to this run's segments, across sessions.
    #[must_use]
    pub fn cumulative(&self) -> u64 {
        self.cumulative
    }

    /// Segments sealed by this writer.
    #[must_use]
    pub fn sealed_count(&self) -> u64 {
        self.sealed_count
    }

    #[must_use]
    pub fn next_sequence(&self) -> u64 {
        self.current
            .as_ref()
            .map_or(self.next_sequence, |segment| segment.name.sequence)
    }

    #[must_use]
    pub fn open_path(&self) -> Option<&Path> {
        self.current.as_ref().map(|segment| segment.path.as_path())
    }

    fn start_segment(&mut self) -> Result<OpenSegment> {
        let sequence = self.next_sequence;
        if !self.layout.shard().sequence_range().contains(&sequence) {
            return Err(TrawlError::CapacityExceeded {
                shard: self.layout.shard().index,
            });
        }
        let name = self.layout.open_name(sequence);
        let path = self.layout.segment_path(&name);
        let file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&path)
            .map_err(|err| durability_failure(&path, &err))?;
        sync_dir(&self.dir)?;
        self.next_sequence += 1;

        tracing::debug!(segment.sequence = sequence, "segment opened");
        Ok(OpenSegment {
            name,
            path,
            file,
            records: 0,
            unflushed: 0,
        })
    }
}

/// Truncate an orphaned open segment to its trusted prefix and seal it.
fn repair_orphan(layout: &RunLayout, segment: &SegmentFile, before: u64) -> Result<u64> {
    let summary = SegmentReader::scan(&segment.path, |_| Ok(()))?;
    let file = OpenOptions::new()
        .write(true)
        .open(&segment.path)
        .map_err(|err| durability_failure(&segment.path, &err))?;
    file.set_len(summary.valid_len)
        .and_then(|()| file.sync_all())
        .map_err(|err| durability_failure(&segment.path, &err))?;
    drop(file);

    let dir = layout.segments_dir();
    if summary.records == 0 {
        fs_err::remove_file(&segment.path)
            .map_err(|err| durability_failure(&segment.path, &err))?;
    } else {
        let sealed = segment
            .name
            .sealed(summary.records, before + summary.records);
        let target = layout.segment_path(&sealed);
        fs_err::rename(&segment.path, &target).map_err(|err| durability_failure(&target, &err))?;
    }
    sync_dir(&dir)?;

    tracing::warn!(
        segment.sequence = segment.name.sequence,
        segment.records = summary.records,
        segment.torn_tail = summary.torn_tail,
        "repaired orphaned open segment"
    );
    Ok(summary.records)
}

fn durability_failure(path: &Path, err: &std::io::Error) -> TrawlError {
    tracing::error!(segment.path = %path.display(), error = %err, "checkpoint write failed");
    TrawlError::durability(path, err)
}

#[cfg(unix)]
pub(crate) fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)
        .and_then(|handle| handle.sync_all())
        .map_err(|err| durability_failure(dir, &err))
}

#[cfg(not(unix))]
pub(crate) fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}
