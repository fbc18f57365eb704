//! Read side of the compacted master log.

use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use crate::compact::compact_sources;
use crate::error::{Result, TrawlError};
use crate::types::{CompactionReport, Record};

/// Downstream consumer of master log records (CSV/Excel exporters and the like).
pub trait RecordSink {
    fn accept(&mut self, record: &Record) -> Result<()>;
}

impl RecordSink for Vec<Record> {
    fn accept(&mut self, record: &Record) -> Result<()> {
        self.push(record.clone());
        Ok(())
    }
}

/// A compacted, duplicate-free record log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterLog {
    path: PathBuf,
}

impl MasterLog {
    /// Open an existing master log.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        fs_err::metadata(&path)?;
        Ok(Self { path })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records in admission order.
    pub fn records(&self) -> Result<MasterRecords> {
        let file = fs_err::File::open(&self.path)?;
        Ok(MasterRecords {
            reader: BufReader::new(file),
            path: self.path.clone(),
            line: 0,
            buf: String::new(),
        })
    }

    /// Hand every record to `sink`, in order. Returns the number exported.
    pub fn export(&self, sink: &mut dyn RecordSink) -> Result<u64> {
        let mut exported = 0;
        for record in self.records()? {
            sink.accept(&record?)?;
            exported += 1;
        }
        tracing::info!(master.path = %self.path.display(), master.records = exported, "master exported");
        Ok(exported)
    }

    /// Merge several master logs (typically one per shard) into `output`.
    ///
    /// Inputs are read in the order given and deduplicated by identifier, so the
    /// first occurrence wins.
    pub fn union(logs: &[MasterLog], output: &Path) -> Result<CompactionReport> {
        let sources: Vec<PathBuf> = logs.iter().map(|log| log.path.clone()).collect();
        compact_sources(&sources, output)
    }
}

/// Iterator over a master log. Any bad line is an error; masters are written atomically.
#[derive(Debug)]
pub struct MasterRecords {
    reader: BufReader<fs_err::File>,
    path: PathBuf,
    line: u64,
    buf: String,
}

impl Iterator for MasterRecords {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            self.buf.clear();
            match self.reader.read_line(&mut self.buf) {
                Ok(0) => return None,
                Ok(_) => {}
                Err(err) => return Some(Err(err.into())),
            }
            self.line += 1;
            let text = self.buf.trim();
            if text.is_empty() {
                continue;
            }
            return Some(Record::from_line(text).map_err(|err| {
                TrawlError::SegmentCorruption {
                    path: self.path.clone(),
                    line: self.line,
                    reason: err.to_string(),
                }
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    #[test]
    fn exports_in_file_order() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("m.jsonl");
        let now = Utc::now();
        let body: String = ["B", "A", "C"]
            .iter()
            .map(|id| Record::new(*id, now).to_line().unwrap())
            .collect();
        fs_err::write(&path, body).unwrap();

        let mut sink: Vec<Record> = Vec::new();
        let exported = MasterLog::open(&path).unwrap().export(&mut sink).unwrap();
        assert_eq!(exported, 3);
        let ids: Vec<&str> = sink.iter().map(|r| r.identifier.as_str()).collect();
        assert_eq!(ids, vec!["B", "A", "C"]);
    }

    #[test]
    fn missing_master_is_an_error() {
        let tmp = TempDir::new().unwrap();
        assert!(MasterLog::open(tmp.path().join("absent.jsonl")).is_err());
    }
}
