//! Directory layout and segment file naming.
//!
//! ```text
//! <root>/checkpoints/<run>/<mode>/                 segments of one run/mode (one shard)
//!     <run>.<mode>.s000001.n10.c00000010.jsonl     sealed: 10 records, 10 cumulative
//!     <run>.<mode>.s000002.open.jsonl              currently open
//!     .trawl.lock
//! <root>/final/<run>.<mode>.jsonl                  compacted master log
//! ```

use std::fmt;
use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;
use regex::Regex;

use crate::constants::{OPEN_SEGMENT_MARKER, OUTPUT_DIR, SEGMENT_EXTENSION, SEGMENTS_DIR};
use crate::error::{Result, TrawlError};
use crate::types::options::validate_slug;
use crate::types::{SessionConfig, ShardSpec};

/// Where one run/mode (and shard) keeps its segments and master log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLayout {
    root: PathBuf,
    run_id: String,
    mode: String,
    shard: ShardSpec,
}

impl RunLayout {
    pub fn new(
        root: impl Into<PathBuf>,
        run_id: impl Into<String>,
        mode: impl Into<String>,
        shard: ShardSpec,
    ) -> Result<Self> {
        let run_id = run_id.into();
        let mode = mode.into();
        validate_slug("run id", &run_id)?;
        validate_slug("mode", &mode)?;
        shard.validate()?;
        Ok(Self {
            root: root.into(),
            run_id,
            mode,
            shard,
        })
    }

    pub fn from_config(config: &SessionConfig) -> Result<Self> {
        Self::new(
            config.root.clone(),
            config.run_id.clone(),
            config.run.mode.clone(),
            config.shard,
        )
    }

    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    #[must_use]
    pub fn mode(&self) -> &str {
        &self.mode
    }

    #[must_use]
    pub fn shard(&self) -> ShardSpec {
        self.shard
    }

    #[must_use]
    pub fn segments_dir(&self) -> PathBuf {
        let dir = self
            .root
            .join(SEGMENTS_DIR)
            .join(&self.run_id)
            .join(&self.mode);
        if self.shard.is_single() {
            dir
        } else {
            dir.join(format!("shard-{}-of-{}", self.shard.index, self.shard.count))
        }
    }

    #[must_use]
    pub fn output_dir(&self) -> PathBuf {
        self.root.join(OUTPUT_DIR)
    }

    #[must_use]
    pub fn master_path(&self) -> PathBuf {
        let name = if self.shard.is_single() {
            format!("{}.{}.{SEGMENT_EXTENSION}", self.run_id, self.mode)
        } else {
            format!(
                "{}.{}.shard-{}-of-{}.{SEGMENT_EXTENSION}",
                self.run_id, self.mode, self.shard.index, self.shard.count
            )
        };
        self.output_dir().join(name)
    }

    #[must_use]
    pub fn segment_path(&self, name: &SegmentName) -> PathBuf {
        self.segments_dir().join(name.file_name())
    }

    #[must_use]
    pub fn open_name(&self, sequence: u64) -> SegmentName {
        SegmentName {
            run_id: self.run_id.clone(),
            mode: self.mode.clone(),
            sequence,
            state: SegmentState::Open,
        }
    }

    /// Segments of this run/mode, ordered by sequence number.
    ///
    /// Files that do not parse as segment names, or belong to another run or mode,
    /// are skipped.
    pub fn list_segments(&self) -> Result<Vec<SegmentFile>> {
        let dir = self.segments_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut segments = Vec::new();
        for entry in fs_err::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Ok(name) = SegmentName::parse(file_name) else {
                continue;
            };
            if name.run_id != self.run_id || name.mode != self.mode {
                tracing::debug!(segment.path = %path.display(), "skipping foreign segment");
                continue;
            }
            segments.push(SegmentFile { path, name });
        }
        segments.sort_by_key(|segment| segment.name.sequence);
        Ok(segments)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    Open,
    Sealed {
        /// Records in this segment.
        records: u64,
        /// Records in this and every earlier segment of the run.
        cumulative: u64,
    },
}

/// Parsed segment file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentName {
    pub run_id: String,
    pub mode: String,
    pub sequence: u64,
    pub state: SegmentState,
}

impl SegmentName {
    pub fn parse(file_name: &str) -> Result<Self> {
        static PATTERN: OnceCell<std::result::Result<Regex, String>> = OnceCell::new();
        let pattern = PATTERN.get_or_init(|| {
            Regex::new(
                r"^([A-Za-z0-9][A-Za-z0-9_-]*)\.([A-Za-z0-9][A-Za-z0-9_-]*)\.s(\d+)\.(?:(open)|n(\d+)\.c(\d+))\.jsonl$",
            )
            .map_err(|err| err.to_string())
        });
        let invalid = || TrawlError::InvalidSegmentName {
            name: file_name.to_string(),
        };
        let pattern = pattern.as_ref().map_err(|_| invalid())?;
        let caps = pattern.captures(file_name).ok_or_else(invalid)?;

        let number = |index: usize| -> Result<u64> {
            caps.get(index)
                .ok_or_else(invalid)?
                .as_str()
                .parse::<u64>()
                .map_err(|_| invalid())
        };
        let state = if caps.get(4).is_some() {
            SegmentState::Open
        } else {
            SegmentState::Sealed {
                records: number(5)?,
                cumulative: number(6)?,
            }
        };
        Ok(Self {
            run_id: caps[1].to_string(),
            mode: caps[2].to_string(),
            sequence: number(3)?,
            state,
        })
    }

    #[must_use]
    pub fn file_name(&self) -> String {
        match self.state {
            SegmentState::Open => format!(
                "{}.{}.s{:06}.{OPEN_SEGMENT_MARKER}.{SEGMENT_EXTENSION}",
                self.run_id, self.mode, self.sequence
            ),
            SegmentState::Sealed {
                records,
                cumulative,
            } => format!(
                "{}.{}.s{:06}.n{records}.c{cumulative:08}.{SEGMENT_EXTENSION}",
                self.run_id, self.mode, self.sequence
            ),
        }
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        matches!(self.state, SegmentState::Open)
    }

    #[must_use]
    pub fn sealed(&self, records: u64, cumulative: u64) -> Self {
        Self {
            state: SegmentState::Sealed {
                records,
                cumulative,
            },
            ..self.clone()
        }
    }
}

impl fmt::Display for SegmentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.file_name())
    }
}

/// A segment found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentFile {
    pub path: PathBuf,
    pub name: SegmentName,
}

impl SegmentFile {
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}
