//! Tunable defaults shared by the collection engine.

/// Records per segment before it is sealed and a new one opened.
pub const DEFAULT_SEGMENT_CAPACITY: usize = 10;
/// Admissions between durable flushes. At most `interval - 1` records can be lost.
pub const DEFAULT_FLUSH_INTERVAL: usize = 1;

/// Consecutive requests before an enforced cooldown.
pub const DEFAULT_COOLDOWN_AFTER: u32 = 15;
pub const DEFAULT_COOLDOWN_MS: u64 = 30_000;
/// Consecutive transient failures that trigger a long break.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;
pub const DEFAULT_LONG_BREAK_MS: u64 = 5 * 60_000;
pub const DEFAULT_MAX_LONG_BREAK_MS: u64 = 30 * 60_000;
/// Long breaks allowed before the controller halts.
pub const DEFAULT_MAX_LONG_BREAKS: u32 = 3;
pub const DEFAULT_MIN_JITTER_MS: u64 = 1_000;
pub const DEFAULT_MAX_JITTER_MS: u64 = 2_000;
pub const DEFAULT_REQUESTS_PER_MINUTE: u32 = 30;
/// Floor for the adaptive request cap.
pub const DEFAULT_MIN_REQUESTS_PER_MINUTE: u32 = 5;
/// Cap multiplier after a failed request, in percent.
pub const DEFAULT_RATE_DECAY_PERCENT: u32 = 90;
/// Cap multiplier after a successful request, in percent.
pub const DEFAULT_RATE_RECOVERY_PERCENT: u32 = 105;
/// Cap on the exponential jitter multiplier applied after failures.
pub const FAILURE_BACKOFF_CAP: u64 = 10;
pub const RATE_WINDOW_MS: u64 = 60_000;

pub const DEFAULT_IDENTIFIER_FIELD: &str = "place_id";
pub const DEFAULT_KEY_FIELDS: [&str; 3] = ["name", "phone", "address"];
pub const DEFAULT_REQUIRED_FIELDS: [&str; 1] = ["name"];
/// Characters of the name that feed a derived identifier.
pub const DERIVED_NAME_PREFIX_CHARS: usize = 50;
pub const DERIVED_ID_PREFIX: &str = "derived:";

/// Jaro-Winkler similarity required on names before a near-duplicate is suppressed.
pub const DEFAULT_FUZZY_NAME_THRESHOLD: f64 = 0.97;

/// Width of each shard's segment sequence range.
pub const SEQUENCE_STRIDE: u64 = 1_000_000_000;

pub const LOCK_FILE_NAME: &str = ".trawl.lock";
pub const SEGMENT_EXTENSION: &str = "jsonl";
pub const OPEN_SEGMENT_MARKER: &str = "open";
pub const SEGMENTS_DIR: &str = "checkpoints";
pub const OUTPUT_DIR: &str = "final";
