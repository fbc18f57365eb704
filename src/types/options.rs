//! Serde-backed configuration for a collection session.

use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_COOLDOWN_AFTER, DEFAULT_COOLDOWN_MS, DEFAULT_FAILURE_THRESHOLD,
    DEFAULT_FLUSH_INTERVAL, DEFAULT_FUZZY_NAME_THRESHOLD, DEFAULT_IDENTIFIER_FIELD,
    DEFAULT_KEY_FIELDS, DEFAULT_LONG_BREAK_MS, DEFAULT_MAX_JITTER_MS, DEFAULT_MAX_LONG_BREAK_MS,
    DEFAULT_MAX_LONG_BREAKS, DEFAULT_MIN_JITTER_MS, DEFAULT_MIN_REQUESTS_PER_MINUTE,
    DEFAULT_RATE_DECAY_PERCENT, DEFAULT_RATE_RECOVERY_PERCENT, DEFAULT_REQUESTS_PER_MINUTE,
    DEFAULT_REQUIRED_FIELDS, DEFAULT_SEGMENT_CAPACITY,
};
use crate::error::{Result, TrawlError};
use crate::types::shard::ShardSpec;

/// Run ids and modes end up in file names, so they must be plain slugs.
pub(crate) fn validate_slug(kind: &str, value: &str) -> Result<()> {
    static SLUG: OnceCell<std::result::Result<Regex, String>> = OnceCell::new();
    let slug = SLUG.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]{0,63}$").map_err(|err| err.to_string())
    });
    let slug = match slug {
        Ok(regex) => regex,
        Err(reason) => return Err(TrawlError::config(reason.clone())),
    };
    if slug.is_match(value) {
        Ok(())
    } else {
        Err(TrawlError::config(format!(
            "{kind} `{value}` must match [A-Za-z0-9][A-Za-z0-9_-]* (max 64 chars)"
        )))
    }
}

/// Whether a session starts over or continues from existing segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartMode {
    /// Refuse to run if the segment directory already holds segments.
    Fresh,
    #[default]
    Resume,
}

/// Options the surrounding command line tool hands to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunOptions {
    /// Collection mode (for example `manual` or `auto`); part of every segment name.
    pub mode: String,
    /// Total records wanted in the dataset, resumed records included.
    pub max_records: u64,
    /// Forwarded to the browser collaborator; the engine itself ignores it.
    pub headless: bool,
    pub start: StartMode,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            mode: "manual".to_string(),
            max_records: 500,
            headless: false,
            start: StartMode::Resume,
        }
    }
}

/// Pacing state machine thresholds. Durations are milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PacingConfig {
    /// Consecutive requests before an enforced cooldown.
    pub cooldown_after: u32,
    pub cooldown_ms: u64,
    /// Consecutive transient failures before a long break.
    pub failure_threshold: u32,
    pub long_break_ms: u64,
    /// Upper bound for the geometrically growing long break.
    pub max_long_break_ms: u64,
    /// Long breaks allowed before the controller halts.
    pub max_long_breaks: u32,
    pub min_jitter_ms: u64,
    pub max_jitter_ms: u64,
    /// Sliding one-minute request cap; zero disables the window.
    pub requests_per_minute: u32,
    /// The cap adapts between this floor and `requests_per_minute`.
    pub min_requests_per_minute: u32,
    /// Percentage the cap is scaled by after each failure.
    pub rate_decay_percent: u32,
    /// Percentage the cap is scaled by after each success.
    pub rate_recovery_percent: u32,
    /// Seed for the jitter generator. `None` seeds from the OS.
    pub jitter_seed: Option<u64>,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            cooldown_after: DEFAULT_COOLDOWN_AFTER,
            cooldown_ms: DEFAULT_COOLDOWN_MS,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            long_break_ms: DEFAULT_LONG_BREAK_MS,
            max_long_break_ms: DEFAULT_MAX_LONG_BREAK_MS,
            max_long_breaks: DEFAULT_MAX_LONG_BREAKS,
            min_jitter_ms: DEFAULT_MIN_JITTER_MS,
            max_jitter_ms: DEFAULT_MAX_JITTER_MS,
            requests_per_minute: DEFAULT_REQUESTS_PER_MINUTE,
            min_requests_per_minute: DEFAULT_MIN_REQUESTS_PER_MINUTE,
            rate_decay_percent: DEFAULT_RATE_DECAY_PERCENT,
            rate_recovery_percent: DEFAULT_RATE_RECOVERY_PERCENT,
            jitter_seed: None,
        }
    }
}

impl PacingConfig {
    /// No jitter, no windows; thresholds kept. Handy for simulations.
    #[must_use]
    pub fn without_delays() -> Self {
        Self {
            min_jitter_ms: 0,
            max_jitter_ms: 0,
            requests_per_minute: 0,
            jitter_seed: Some(0),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.cooldown_after == 0 {
            return Err(TrawlError::config("pacing.cooldown_after must be non-zero"));
        }
        if self.failure_threshold == 0 {
            return Err(TrawlError::config(
                "pacing.failure_threshold must be non-zero",
            ));
        }
        if self.min_jitter_ms > self.max_jitter_ms {
            return Err(TrawlError::config(
                "pacing.min_jitter_ms exceeds pacing.max_jitter_ms",
            ));
        }
        if self.long_break_ms > self.max_long_break_ms {
            return Err(TrawlError::config(
                "pacing.long_break_ms exceeds pacing.max_long_break_ms",
            ));
        }
        if !(1..=100).contains(&self.rate_decay_percent) {
            return Err(TrawlError::config(
                "pacing.rate_decay_percent must be within 1..=100",
            ));
        }
        if self.rate_recovery_percent < 100 {
            return Err(TrawlError::config(
                "pacing.rate_recovery_percent must be at least 100",
            ));
        }
        Ok(())
    }
}

/// Segment rotation and flush cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    pub segment_capacity: usize,
    /// Appends between durable flushes; bounds crash loss to `flush_interval - 1`.
    pub flush_interval: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            segment_capacity: DEFAULT_SEGMENT_CAPACITY,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
        }
    }
}

impl CheckpointConfig {
    pub fn validate(&self) -> Result<()> {
        if self.segment_capacity == 0 {
            return Err(TrawlError::config(
                "checkpoint.segment_capacity must be non-zero",
            ));
        }
        if self.flush_interval == 0 || self.flush_interval > self.segment_capacity {
            return Err(TrawlError::config(
                "checkpoint.flush_interval must be between 1 and segment_capacity",
            ));
        }
        Ok(())
    }
}

/// Near-duplicate suppression. Opt-in.
///
/// Two records are near-duplicates only when their normalized addresses are equal,
/// their names reach `name_threshold` Jaro-Winkler similarity, and their phone
/// numbers do not disagree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FuzzyOptions {
    pub enabled: bool,
    pub name_threshold: f64,
    pub name_field: String,
    pub address_field: String,
    pub phone_field: String,
}

impl Default for FuzzyOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            name_threshold: DEFAULT_FUZZY_NAME_THRESHOLD,
            name_field: "name".to_string(),
            address_field: "address".to_string(),
            phone_field: "phone".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupOptions {
    pub fuzzy: FuzzyOptions,
}

impl DedupOptions {
    pub fn validate(&self) -> Result<()> {
        let threshold = self.fuzzy.name_threshold;
        if !(0.9..=1.0).contains(&threshold) {
            return Err(TrawlError::config(format!(
                "dedup.fuzzy.name_threshold {threshold} outside the conservative range 0.9..=1.0"
            )));
        }
        Ok(())
    }
}

/// How candidates are shaped into records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizerOptions {
    /// Field carrying the stable external key.
    pub identifier_field: String,
    /// Fields hashed into a derived identifier when the key is missing.
    pub key_fields: Vec<String>,
    pub required_fields: Vec<String>,
}

impl Default for NormalizerOptions {
    fn default() -> Self {
        Self {
            identifier_field: DEFAULT_IDENTIFIER_FIELD.to_string(),
            key_fields: DEFAULT_KEY_FIELDS.iter().map(ToString::to_string).collect(),
            required_fields: DEFAULT_REQUIRED_FIELDS
                .iter()
                .map(ToString::to_string)
                .collect(),
        }
    }
}

fn default_true() -> bool {
    true
}

/// Everything a [`crate::CollectionSession`] needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Root holding `checkpoints/` and `final/`.
    pub root: PathBuf,
    pub run_id: String,
    #[serde(default)]
    pub run: RunOptions,
    #[serde(default)]
    pub pacing: PacingConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub dedup: DedupOptions,
    #[serde(default)]
    pub normalizer: NormalizerOptions,
    #[serde(default)]
    pub shard: ShardSpec,
    #[serde(default = "default_true")]
    pub compact_on_finish: bool,
}

impl SessionConfig {
    #[must_use]
    pub fn builder(
        root: impl Into<PathBuf>,
        run_id: impl Into<String>,
        mode: impl Into<String>,
    ) -> SessionConfigBuilder {
        SessionConfigBuilder {
            inner: Self {
                root: root.into(),
                run_id: run_id.into(),
                run: RunOptions {
                    mode: mode.into(),
                    ..RunOptions::default()
                },
                pacing: PacingConfig::default(),
                checkpoint: CheckpointConfig::default(),
                dedup: DedupOptions::default(),
                normalizer: NormalizerOptions::default(),
                shard: ShardSpec::single(),
                compact_on_finish: true,
            },
        }
    }

    /// Load and validate a JSON config file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = fs_err::read(path.as_ref())?;
        let config: Self = serde_json::from_slice(&bytes)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        validate_slug("run id", &self.run_id)?;
        validate_slug("mode", &self.run.mode)?;
        if self.run.max_records == 0 {
            return Err(TrawlError::config("run.max_records must be non-zero"));
        }
        if self.normalizer.identifier_field.is_empty() {
            return Err(TrawlError::config(
                "normalizer.identifier_field must not be empty",
            ));
        }
        self.pacing.validate()?;
        self.checkpoint.validate()?;
        self.dedup.validate()?;
        self.shard.validate()
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfigBuilder {
    inner: SessionConfig,
}

impl SessionConfigBuilder {
    pub fn max_records(mut self, max_records: u64) -> Self {
        self.inner.run.max_records = max_records;
        self
    }

    pub fn headless(mut self, headless: bool) -> Self {
        self.inner.run.headless = headless;
        self
    }

    pub fn start(mut self, start: StartMode) -> Self {
        self.inner.run.start = start;
        self
    }

    pub fn pacing(mut self, pacing: PacingConfig) -> Self {
        self.inner.pacing = pacing;
        self
    }

    pub fn checkpoint(mut self, checkpoint: CheckpointConfig) -> Self {
        self.inner.checkpoint = checkpoint;
        self
    }

    pub fn dedup(mut self, dedup: DedupOptions) -> Self {
        self.inner.dedup = dedup;
        self
    }

    pub fn normalizer(mut self, normalizer: NormalizerOptions) -> Self {
        self.inner.normalizer = normalizer;
        self
    }

    pub fn shard(mut self, shard: ShardSpec) -> Self {
        self.inner.shard = shard;
        self
    }

    pub fn compact_on_finish(mut self, compact: bool) -> Self {
        self.inner.compact_on_finish = compact;
        self
    }

    pub fn build(self) -> Result<SessionConfig> {
        self.inner.validate()?;
        Ok(self.inner)
    }
}
