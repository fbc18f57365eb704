//! The collection loop.
//!
//! One session owns one segment directory (through its lock), one deduplicator and
//! one open segment. It pulls candidates from a [`CandidateSource`] strictly one at a
//! time, paced by a [`PacingController`], and always leaves the open segment flushed
//! when it stops.

use std::collections::VecDeque;

use thiserror::Error;
use uuid::Uuid;

use crate::compact::MasterCompactor;
use crate::dedup::{Admission, Deduplicator, Rejection};
use crate::error::{Result, TrawlError};
use crate::io::layout::RunLayout;
use crate::io::segment::SegmentWriter;
use crate::lock::DirLock;
use crate::normalize::RecordNormalizer;
use crate::pacing::{
    CancellationToken, Clock, FailureKind, PacingController, PacingDecision, PacingState,
    WaitOutcome,
};
use crate::resume::ResumeCoordinator;
use crate::types::{
    Candidate, ResumeDiagnostics, SessionConfig, SessionReport, StartMode, Termination,
};

/// Failure reported by the extraction side for one request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    /// Retry after the usual pacing delay.
    #[error("transient source error: {0}")]
    Transient(String),
    /// Block page, CAPTCHA or similar anti-bot signal.
    #[error("detection signal: {0}")]
    Detected(String),
    /// The source cannot continue; the session stops.
    #[error("fatal source error: {0}")]
    Fatal(String),
}

/// Produces raw candidates, one blocking call at a time.
///
/// `Ok(None)` means the current query has no further results.
pub trait CandidateSource {
    fn next_candidate(&mut self) -> std::result::Result<Option<Candidate>, SourceError>;
}

impl<T: CandidateSource + ?Sized> CandidateSource for &mut T {
    fn next_candidate(&mut self) -> std::result::Result<Option<Candidate>, SourceError> {
        (**self).next_candidate()
    }
}

impl<T: CandidateSource + ?Sized> CandidateSource for Box<T> {
    fn next_candidate(&mut self) -> std::result::Result<Option<Candidate>, SourceError> {
        (**self).next_candidate()
    }
}

/// Replays a fixed script of outcomes; reports exhaustion once the script runs out.
#[derive(Debug, Default)]
pub struct ScriptedSource {
    script: VecDeque<std::result::Result<Option<Candidate>, SourceError>>,
    calls: u64,
}

impl ScriptedSource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn candidate(mut self, candidate: Candidate) -> Self {
        self.script.push_back(Ok(Some(candidate)));
        self
    }

    /// Queue a JSON object as a candidate. Non-objects become empty candidates.
    pub fn json(self, value: serde_json::Value) -> Self {
        self.candidate(Candidate::from_json(value).unwrap_or_default())
    }

    pub fn error(mut self, error: SourceError) -> Self {
        self.script.push_back(Err(error));
        self
    }

    /// Queue an explicit end of results.
    pub fn exhausted(mut self) -> Self {
        self.script.push_back(Ok(None));
        self
    }

    #[must_use]
    pub fn calls(&self) -> u64 {
        self.calls
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.script.len()
    }
}

impl FromIterator<Candidate> for ScriptedSource {
    fn from_iter<I: IntoIterator<Item = Candidate>>(iter: I) -> Self {
        iter.into_iter().fold(Self::new(), Self::candidate)
    }
}

impl CandidateSource for ScriptedSource {
    fn next_candidate(&mut self) -> std::result::Result<Option<Candidate>, SourceError> {
        self.calls += 1;
        self.script.pop_front().unwrap_or(Ok(None))
    }
}

#[derive(Debug, Default)]
struct Counters {
    admitted_this_session: u64,
    malformed: u64,
    transient_failures: u64,
    detections: u64,
    requests: u64,
}

pub struct CollectionSession<S, C> {
    id: Uuid,
    config: SessionConfig,
    layout: RunLayout,
    lock: DirLock,
    source: S,
    clock: C,
    cancel: CancellationToken,
    normalizer: RecordNormalizer,
    dedup: Deduplicator,
    writer: SegmentWriter,
    pacing: PacingController,
    resumed_from: u64,
    diagnostics: ResumeDiagnostics,
    counters: Counters,
}

impl<S: CandidateSource, C: Clock> CollectionSession<S, C> {
    /// Lock the run's segment directory and rebuild state from it.
    ///
    /// A fresh start over a run that already holds segments or a master log fails with
    /// [`TrawlError::RunAlreadyExists`]; a resume replays those segments first.
    pub fn open(
        config: SessionConfig,
        source: S,
        clock: C,
        cancel: CancellationToken,
    ) -> Result<Self> {
        config.validate()?;
        let layout = RunLayout::from_config(&config)?;
        let dir = layout.segments_dir();
        let lock = DirLock::acquire(&dir)?;

        let (dedup, resumed_from, diagnostics) = match config.run.start {
            StartMode::Fresh => {
                if !layout.list_segments()?.is_empty() || layout.master_path().is_file() {
                    return Err(TrawlError::RunAlreadyExists { dir });
                }
                (
                    Deduplicator::new(&config.dedup, config.shard),
                    0,
                    ResumeDiagnostics::default(),
                )
            }
            StartMode::Resume => {
                let point = ResumeCoordinator::new(layout.clone()).resume(&config.dedup)?;
                let resumed = point.resume_count;
                let diagnostics = point.diagnostics.clone();
                (point.into_deduplicator(), resumed, diagnostics)
            }
        };

        let writer = SegmentWriter::open(layout.clone(), config.checkpoint, &lock)?;
        let pacing = PacingController::new(config.pacing.clone());
        let normalizer = RecordNormalizer::new(config.normalizer.clone());
        let id = Uuid::new_v4();

        tracing::info!(
            session.id = %id,
            session.run = %config.run_id,
            session.mode = %config.run.mode,
            session.target = config.run.max_records,
            session.resumed = resumed_from,
            session.headless = config.run.headless,
            shard.index = config.shard.index,
            shard.count = config.shard.count,
            "collection session opened"
        );
        Ok(Self {
            id,
            config,
            layout,
            lock,
            source,
            clock,
            cancel,
            normalizer,
            dedup,
            writer,
            pacing,
            resumed_from,
            diagnostics,
            counters: Counters::default(),
        })
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub fn resumed_from(&self) -> u64 {
        self.resumed_from
    }

    #[must_use]
    pub fn resume_diagnostics(&self) -> &ResumeDiagnostics {
        &self.diagnostics
    }

    #[must_use]
    pub fn pacing_state(&self) -> PacingState {
        self.pacing.state()
    }

    #[must_use]
    pub fn layout(&self) -> &RunLayout {
        &self.layout
    }

    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Dataset size: resumed records plus those admitted by this session.
    #[must_use]
    pub fn admitted_total(&self) -> u64 {
        self.resumed_from + self.counters.admitted_this_session
    }

    /// Collect until the target, exhaustion, a halt, cancellation or a fatal error.
    ///
    /// Stopping conditions are reported in [`SessionReport::termination`]. A failed
    /// finishing compaction is recorded in [`SessionReport::compaction_error`]; the
    /// report is always returned.
    pub fn run(mut self) -> Result<SessionReport> {
        let termination = self.collect();
        Ok(self.finish(termination))
    }

    fn collect(&mut self) -> Termination {
        let target = self.config.run.max_records;
        loop {
            if self.admitted_total() >= target {
                return Termination::TargetReached;
            }
            if self.cancel.is_cancelled() {
                return Termination::Cancelled;
            }

            match self.pacing.next_action(self.clock.now()) {
                PacingDecision::Halt => return Termination::PacingHalted,
                PacingDecision::Wait { duration } => {
                    tracing::debug!(
                        pacing.state = self.pacing.state().name(),
                        pacing.wait_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
                        "pacing wait"
                    );
                    if self.clock.wait(duration, &self.cancel) == WaitOutcome::Cancelled {
                        return Termination::Cancelled;
                    }
                    continue;
                }
                PacingDecision::Proceed { delay } => {
                    if self.clock.wait(delay, &self.cancel) == WaitOutcome::Cancelled {
                        return Termination::Cancelled;
                    }
                }
            }

            self.counters.requests += 1;
            match self.source.next_candidate() {
                Ok(None) => return Termination::SourceExhausted,
                Ok(Some(candidate)) => {
                    self.pacing.record_success(self.clock.now());
                    if let Err(err) = self.admit(candidate) {
                        if err.is_durability() {
                            tracing::error!(error = %err, "checkpoint failed; stopping session");
                            return Termination::DurabilityFailure {
                                message: err.to_string(),
                            };
                        }
                        tracing::error!(error = %err, "record could not be stored; stopping session");
                        return Termination::Fatal {
                            message: err.to_string(),
                        };
                    }
                }
                Err(SourceError::Transient(reason)) => {
                    self.counters.transient_failures += 1;
                    tracing::warn!(source.error = %reason, "transient source failure");
                    self.pacing
                        .record_failure(FailureKind::Transient, self.clock.now());
                }
                Err(SourceError::Detected(reason)) => {
                    self.counters.detections += 1;
                    tracing::warn!(source.error = %reason, "detection signal from source");
                    self.pacing
                        .record_failure(FailureKind::Detected, self.clock.now());
                }
                Err(SourceError::Fatal(reason)) => {
                    tracing::error!(source.error = %reason, "fatal source failure");
                    return Termination::Fatal { message: reason };
                }
            }
        }
    }

    /// Normalize, deduplicate and append one candidate.
    ///
    /// A record counts as admitted once its line is in the segment, even if the flush
    /// or seal that follows fails.
    fn admit(&mut self, candidate: Candidate) -> Result<()> {
        let record = match self.normalizer.normalize(candidate, self.clock.now_utc()) {
            Ok(record) => record,
            Err(err) => {
                self.counters.malformed += 1;
                tracing::warn!(error = %err, "skipping malformed candidate");
                return Ok(());
            }
        };

        match self.dedup.admit(&record) {
            Admission::Accepted => {
                let written_before = self.writer.cumulative();
                let appended = self.writer.append(&record);
                if self.writer.cumulative() > written_before {
                    self.counters.admitted_this_session += 1;
                }
                appended?;
                tracing::debug!(
                    record.identifier = %record.identifier,
                    session.admitted = self.admitted_total(),
                    "record admitted"
                );
            }
            Admission::Rejected(Rejection::Duplicate) => {
                tracing::debug!(record.identifier = %record.identifier, "duplicate rejected");
            }
            Admission::Rejected(_) => {}
        }
        Ok(())
    }

    fn finish(self, mut termination: Termination) -> SessionReport {
        let Self {
            id,
            config,
            layout,
            lock,
            writer,
            dedup,
            resumed_from,
            counters,
            ..
        } = self;

        let sealed_before = writer.sealed_count();
        let segments_sealed = match writer.close() {
            Ok(last) => sealed_before + u64::from(last.is_some()),
            Err(err) => {
                tracing::error!(error = %err, "final segment flush failed");
                if !matches!(termination, Termination::DurabilityFailure { .. }) {
                    termination = Termination::DurabilityFailure {
                        message: err.to_string(),
                    };
                }
                sealed_before
            }
        };

        let mut compaction = None;
        let mut compaction_error = None;
        if config.compact_on_finish
            && !matches!(termination, Termination::DurabilityFailure { .. })
        {
            match MasterCompactor::new(layout).compact_locked(&lock) {
                Ok(report) => compaction = Some(report),
                Err(err) => {
                    tracing::error!(error = %err, "master compaction failed");
                    compaction_error = Some(err.to_string());
                }
            }
        }

        let stats = dedup.stats();
        let report = SessionReport {
            session_id: id,
            termination,
            admitted_total: resumed_from + counters.admitted_this_session,
            admitted_this_session: counters.admitted_this_session,
            resumed_from,
            rejected_duplicates: stats.duplicates,
            near_duplicates: stats.near_duplicates,
            foreign_shard: stats.foreign_shard,
            malformed: counters.malformed,
            transient_failures: counters.transient_failures,
            detections: counters.detections,
            requests: counters.requests,
            segments_sealed,
            compaction,
            compaction_error,
        };
        tracing::info!(
            session.id = %id,
            session.run = %config.run_id,
            session.termination = ?report.termination,
            session.admitted = report.admitted_total,
            session.duplicates = report.rejected_duplicates,
            session.requests = report.requests,
            "collection session finished"
        );
        drop(lock);
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pacing::ManualClock;
    use crate::types::{CheckpointConfig, PacingConfig};
    use serde_json::json;
    use tempfile::TempDir;

    fn config(root: &std::path::Path, target: u64) -> SessionConfig {
        SessionConfig::builder(root, "cafes", "manual")
            .max_records(target)
            .pacing(PacingConfig::without_delays())
            .checkpoint(CheckpointConfig {
                segment_capacity: 2,
                flush_interval: 1,
            })
            .build()
            .unwrap()
    }

    fn place(id: &str) -> serde_json::Value {
        json!({"place_id": id, "name": format!("Place {id}")})
    }

    #[test]
    fn duplicates_do_not_count_toward_target() {
        let tmp = TempDir::new().unwrap();
        let source = ScriptedSource::new()
            .json(place("A"))
            .json(place("A"))
            .json(json!({"rating": 3}))
            .json(place("B"))
            .json(place("C"));
        let session = CollectionSession::open(
            config(tmp.path(), 2),
            source,
            ManualClock::new(),
            CancellationToken::new(),
        )
        .unwrap();
        let report = session.run().unwrap();
        assert_eq!(report.termination, Termination::TargetReached);
        assert_eq!(report.admitted_total, 2);
        assert_eq!(report.rejected_duplicates, 1);
        assert_eq!(report.malformed, 1);
        assert_eq!(report.requests, 4);
        assert_eq!(report.segments_sealed, 1);
        assert_eq!(report.compaction.unwrap().records_written, 2);
    }

    #[test]
    fn fatal_error_stops_after_flush() {
        let tmp = TempDir::new().unwrap();
        let mut source = ScriptedSource::new()
            .json(place("A"))
            .error(SourceError::Fatal("browser gone".into()))
            .json(place("B"));
        let session = CollectionSession::open(
            config(tmp.path(), 10),
            &mut source,
            ManualClock::new(),
            CancellationToken::new(),
        )
        .unwrap();
        let report = session.run().unwrap();
        assert_eq!(
            report.termination,
            Termination::Fatal {
                message: "browser gone".into()
            }
        );
        assert_eq!(report.termination.exit_code(), 70);
        assert_eq!(report.admitted_total, 1);
        assert_eq!(source.remaining(), 1);
    }

    #[test]
    fn scripted_source_reports_exhaustion_when_empty() {
        let mut source: ScriptedSource = std::iter::empty::<Candidate>().collect();
        assert_eq!(source.next_candidate(), Ok(None));
        assert_eq!(source.calls(), 1);
    }
}
