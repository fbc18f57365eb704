//! Summaries returned by sessions, resumes and compactions.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Why a session stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Termination {
    TargetReached,
    /// The source reported no further results for the current query.
    SourceExhausted,
    /// The pacing controller halted after exhausting its long breaks, or on request.
    PacingHalted,
    Cancelled,
    /// The extraction collaborator reported an unrecoverable fault.
    Fatal { message: String },
    /// A checkpoint write or flush failed; later records were not collected.
    DurabilityFailure { message: String },
}

impl Termination {
    /// Process exit status for the surrounding command line tool.
    ///
    /// | reason | code |
    /// |---|---|
    /// | target reached | 0 |
    /// | source exhausted | 0 |
    /// | cancelled | 130 |
    /// | pacing halted | 75 |
    /// | fatal collaborator error | 70 |
    /// | durability failure | 74 |
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::TargetReached | Self::SourceExhausted => 0,
            Self::Cancelled => 130,
            Self::PacingHalted => 75,
            Self::Fatal { .. } => 70,
            Self::DurabilityFailure { .. } => 74,
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.exit_code() == 0
    }
}

/// Counters from one deduplication pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupStats {
    pub accepted: u64,
    pub duplicates: u64,
    pub near_duplicates: u64,
    pub foreign_shard: u64,
}

/// Findings from scanning a segment directory. Nothing here is fatal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeDiagnostics {
    /// Segments whose trailing partial record was discarded.
    pub torn_tails: Vec<PathBuf>,
    /// Segments left open by an interrupted session.
    pub orphaned_open: Vec<PathBuf>,
    /// Sealed segments whose name disagrees with the records found on disk.
    pub count_mismatches: Vec<PathBuf>,
    /// Records whose identifier had already been seen in an earlier segment.
    pub cross_segment_duplicates: u64,
}

impl ResumeDiagnostics {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.torn_tails.is_empty()
            && self.orphaned_open.is_empty()
            && self.count_mismatches.is_empty()
            && self.cross_segment_duplicates == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionReport {
    pub output: PathBuf,
    pub sources: usize,
    pub records_read: u64,
    pub records_written: u64,
    pub duplicates_dropped: u64,
    pub torn_tails_discarded: u64,
}

/// Final account of a collection session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionReport {
    /// Random per-session id, also stamped on the session's log lines.
    pub session_id: Uuid,
    pub termination: Termination,
    /// Records in the dataset at the end of the session, resumed ones included.
    pub admitted_total: u64,
    pub admitted_this_session: u64,
    pub resumed_from: u64,
    pub rejected_duplicates: u64,
    pub near_duplicates: u64,
    pub foreign_shard: u64,
    pub malformed: u64,
    pub transient_failures: u64,
    pub detections: u64,
    pub requests: u64,
    pub segments_sealed: u64,
    pub compaction: Option<CompactionReport>,
    /// Set when the finishing compaction failed; the segments are intact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compaction_error: Option<String>,
}
