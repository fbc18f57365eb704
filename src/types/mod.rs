//! Public types exposed by the `trawl-core` crate.

pub mod options;
pub mod record;
pub mod report;
pub mod shard;

pub use options::{
    CheckpointConfig, DedupOptions, FuzzyOptions, NormalizerOptions, PacingConfig, RunOptions,
    SessionConfig, SessionConfigBuilder, StartMode,
};
pub use record::{Candidate, FieldValue, Record};
pub use report::{CompactionReport, DedupStats, ResumeDiagnostics, SessionReport, Termination};
pub use shard::ShardSpec;
