#![deny(clippy::all, clippy::pedantic)]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
#![cfg_attr(
    test,
    allow(
        clippy::useless_vec,
        clippy::uninlined_format_args,
        clippy::cast_possible_truncation,
        clippy::float_cmp,
        clippy::cast_precision_loss
    )
)]
#![allow(clippy::module_name_repetitions)]
//
// Project-wide lint exceptions:
//
// Documentation lints: internal helpers are self-describing; public entry points
// carry their own docs.
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
//
// Casts: counters are u64 and file offsets fit comfortably; usize/u64 conversions
// are bounded by segment sizes.
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_lossless)]
//
// Style
#![allow(clippy::too_many_lines)]
#![allow(clippy::items_after_statements)]
#![allow(clippy::similar_names)] // run_id, mode, shard ids read alike on purpose
#![allow(clippy::manual_let_else)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::needless_pass_by_value)] // builders and sources take owned values
#![allow(clippy::return_self_not_must_use)] // builder setters
#![allow(clippy::struct_excessive_bools)]
#![allow(clippy::len_without_is_empty)]
#![allow(clippy::unnecessary_wraps)]

//! Resilient streaming collection engine.
//!
//! A [`CollectionSession`] pulls candidates from a [`CandidateSource`], normalizes
//! them, admits each identifier at most once, and checkpoints admitted records into
//! small append-only segments. Resume rebuilds the dedup index from those segments,
//! and [`MasterCompactor`] folds them into one duplicate-free master log.

/// The trawl-core crate version (matches `Cargo.toml`).
pub const TRAWL_CORE_VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod compact;
pub mod constants;
pub mod dedup;
pub mod error;
pub mod io;
pub mod lock;
pub mod normalize;
pub mod pacing;
pub mod resume;
pub mod session;
pub mod types;

pub use compact::MasterCompactor;
pub use constants::*;
pub use dedup::{Admission, DedupIndex, Deduplicator, FuzzyMatch, FuzzyMatcher, Rejection};
pub use error::{Result, TrawlError};
pub use io::{
    AppendReceipt, MasterLog, MasterRecords, RecordSink, RunLayout, SegmentFile, SegmentName,
    SegmentReader, SegmentState, SegmentSummary, SegmentWriter,
};
pub use lock::DirLock;
pub use normalize::{RecordNormalizer, clean_text};
pub use pacing::{
    CancellationToken, Clock, FailureKind, ManualClock, PacingController, PacingDecision,
    PacingState, PacingStats, SystemClock, WaitOutcome,
};
pub use resume::{ResumeCoordinator, ResumePoint};
pub use session::{CandidateSource, CollectionSession, ScriptedSource, SourceError};
pub use types::{
    Candidate, CheckpointConfig, CompactionReport, DedupOptions, DedupStats, FieldValue,
    FuzzyOptions, NormalizerOptions, PacingConfig, Record, ResumeDiagnostics, RunOptions,
    SessionConfig, SessionConfigBuilder, SessionReport, ShardSpec, StartMode, Termination,
};
