//! End-to-end collection sessions against scripted sources and a virtual clock.

use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use serde_json::{Value, json};
use tempfile::TempDir;

use trawl_core::{
    CancellationToken, Candidate, CandidateSource, CheckpointConfig, CollectionSession, DirLock,
    ManualClock, MasterLog, PacingConfig, Record, RunLayout, ScriptedSource, SessionConfig,
    ShardSpec, SourceError, StartMode, Termination, TrawlError,
};

fn config(root: &Path, target: u64) -> SessionConfig {
    SessionConfig::builder(root, "plumbers", "manual")
        .max_records(target)
        .pacing(PacingConfig::without_delays())
        .checkpoint(CheckpointConfig {
            segment_capacity: 3,
            flush_interval: 1,
        })
        .build()
        .unwrap()
}

fn place(n: usize) -> Value {
    json!({
        "place_id": format!("p{n}"),
        "name": format!("Plumber {n}"),
        "address": format!("{n} Pipe Street"),
    })
}

fn scripted(ids: impl IntoIterator<Item = usize>) -> ScriptedSource {
    ids.into_iter()
        .fold(ScriptedSource::new(), |source, n| source.json(place(n)))
}

fn layout(root: &Path) -> RunLayout {
    RunLayout::new(root, "plumbers", "manual", ShardSpec::single()).unwrap()
}

fn master_ids(root: &Path) -> Vec<String> {
    MasterLog::open(layout(root).master_path())
        .unwrap()
        .records()
        .unwrap()
        .map(|r| r.unwrap().identifier)
        .collect()
}

/// Source driven by a closure, for failure injection.
struct FnSource<F>(F);

impl<F> CandidateSource for FnSource<F>
where
    F: FnMut() -> Result<Option<Candidate>, SourceError>,
{
    fn next_candidate(&mut self) -> Result<Option<Candidate>, SourceError> {
        (self.0)()
    }
}

#[test]
fn interrupted_run_resumes_without_duplicates() {
    let tmp = TempDir::new().unwrap();
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let mut first_source = scripted(0..5);
    let mut calls = 0;
    let source = FnSource(|| {
        calls += 1;
        if calls == 5 {
            trigger.cancel();
        }
        first_source.next_candidate()
    });

    let session =
        CollectionSession::open(config(tmp.path(), 8), source, ManualClock::new(), cancel)
            .unwrap();
    let report = session.run().unwrap();
    assert_eq!(report.termination, Termination::Cancelled);
    assert_eq!(report.termination.exit_code(), 130);
    assert_eq!(report.admitted_total, 5);

    // Second session sees the same places again, then new ones.
    let session = CollectionSession::open(
        config(tmp.path(), 8),
        scripted([0, 1, 2, 3, 4, 5, 2, 6, 7, 8, 9]),
        ManualClock::new(),
        CancellationToken::new(),
    )
    .unwrap();
    assert_eq!(session.resumed_from(), 5);
    let report = session.run().unwrap();
    assert_eq!(report.termination, Termination::TargetReached);
    assert_eq!(report.resumed_from, 5);
    assert_eq!(report.admitted_this_session, 3);
    assert_eq!(report.admitted_total, 8);
    assert_eq!(report.rejected_duplicates, 6);

    let ids = master_ids(tmp.path());
    assert_eq!(ids, vec!["p0", "p1", "p2", "p3", "p4", "p5", "p6", "p7"]);
}

#[test]
fn fresh_start_refuses_existing_segments() {
    let tmp = TempDir::new().unwrap();
    let report = CollectionSession::open(
        config(tmp.path(), 2),
        scripted(0..2),
        ManualClock::new(),
        CancellationToken::new(),
    )
    .unwrap()
    .run()
    .unwrap();
    assert_eq!(report.termination, Termination::TargetReached);

    let mut fresh = config(tmp.path(), 2);
    fresh.run.start = StartMode::Fresh;
    let err = CollectionSession::open(
        fresh,
        ScriptedSource::new(),
        ManualClock::new(),
        CancellationToken::new(),
    )
    .err()
    .unwrap();
    assert!(matches!(err, TrawlError::RunAlreadyExists { .. }));
}

#[test]
fn resumed_dataset_already_at_target_issues_no_requests() {
    let tmp = TempDir::new().unwrap();
    CollectionSession::open(
        config(tmp.path(), 3),
        scripted(0..3),
        ManualClock::new(),
        CancellationToken::new(),
    )
    .unwrap()
    .run()
    .unwrap();

    let mut source = scripted(10..20);
    let report = CollectionSession::open(
        config(tmp.path(), 3),
        &mut source,
        ManualClock::new(),
        CancellationToken::new(),
    )
    .unwrap()
    .run()
    .unwrap();
    assert_eq!(report.termination, Termination::TargetReached);
    assert_eq!(report.requests, 0);
    assert_eq!(source.calls(), 0);
}

#[test]
fn second_session_on_same_directory_is_locked_out() {
    let tmp = TempDir::new().unwrap();
    let first = CollectionSession::open(
        config(tmp.path(), 2),
        ScriptedSource::new(),
        ManualClock::new(),
        CancellationToken::new(),
    )
    .unwrap();
    let err = CollectionSession::open(
        config(tmp.path(), 2),
        ScriptedSource::new(),
        ManualClock::new(),
        CancellationToken::new(),
    )
    .err()
    .unwrap();
    assert!(matches!(err, TrawlError::Lock(_)));

    let report = first.run().unwrap();
    assert_eq!(report.termination, Termination::SourceExhausted);
    assert!(DirLock::acquire(&tmp.path().join("checkpoints/plumbers/manual")).is_ok());
}

#[test]
fn repeated_detection_halts_the_session() {
    let tmp = TempDir::new().unwrap();
    let mut config = config(tmp.path(), 10);
    config.pacing.max_long_breaks = 3;
    config.pacing.long_break_ms = 60_000;
    config.pacing.max_long_break_ms = 600_000;
    let source = (0..5).fold(ScriptedSource::new().json(place(1)), |source, _| {
        source.error(SourceError::Detected("captcha".into()))
    });
    let clock = ManualClock::new();

    let report = CollectionSession::open(config, source, clock.clone(), CancellationToken::new())
        .unwrap()
        .run()
        .unwrap();
    assert_eq!(report.termination, Termination::PacingHalted);
    assert_eq!(report.termination.exit_code(), 75);
    assert_eq!(report.detections, 4);
    assert_eq!(report.admitted_total, 1);
    assert_eq!(
        clock.waits(),
        vec![
            Duration::from_secs(60),
            Duration::from_secs(120),
            Duration::from_secs(240)
        ]
    );
    assert_eq!(master_ids(tmp.path()), vec!["p1"]);
}

#[test]
fn cancellation_interrupts_a_long_break() {
    let tmp = TempDir::new().unwrap();
    let clock = ManualClock::new();
    clock.cancel_on_wait(1);
    let source = ScriptedSource::new()
        .json(place(1))
        .error(SourceError::Detected("blocked".into()))
        .json(place(2));

    let report = CollectionSession::open(
        config(tmp.path(), 10),
        source,
        clock.clone(),
        CancellationToken::new(),
    )
    .unwrap()
    .run()
    .unwrap();
    assert_eq!(report.termination, Termination::Cancelled);
    assert_eq!(report.admitted_total, 1);
    assert_eq!(report.requests, 2);
    assert_eq!(clock.elapsed(), Duration::ZERO);
}

#[test]
fn transient_failures_are_retried() {
    let tmp = TempDir::new().unwrap();
    let source = ScriptedSource::new()
        .error(SourceError::Transient("timeout".into()))
        .json(place(1))
        .error(SourceError::Transient("timeout".into()))
        .error(SourceError::Transient("timeout".into()))
        .json(place(2))
        .exhausted()
        .json(place(3));

    let report = CollectionSession::open(
        config(tmp.path(), 10),
        source,
        ManualClock::new(),
        CancellationToken::new(),
    )
    .unwrap()
    .run()
    .unwrap();
    assert_eq!(report.termination, Termination::SourceExhausted);
    assert_eq!(report.transient_failures, 3);
    assert_eq!(report.admitted_total, 2);
    assert_eq!(report.termination.exit_code(), 0);
}

#[cfg(unix)]
#[test]
fn checkpoint_failure_stops_collection() {
    let tmp = TempDir::new().unwrap();
    let segments = tmp.path().join("checkpoints/plumbers/manual");
    let mut config = config(tmp.path(), 10);
    config.checkpoint = CheckpointConfig {
        segment_capacity: 1,
        flush_interval: 1,
    };
    let mut calls = 0;
    let source = FnSource(|| {
        calls += 1;
        if calls == 2 {
            fs_err::remove_dir_all(&segments).unwrap();
        }
        Ok(Candidate::from_json(place(calls)).ok())
    });

    let report = CollectionSession::open(config, source, ManualClock::new(), CancellationToken::new())
        .unwrap()
        .run()
        .unwrap();
    assert!(matches!(
        report.termination,
        Termination::DurabilityFailure { .. }
    ));
    assert_eq!(report.termination.exit_code(), 74);
    assert_eq!(report.admitted_total, 1);
    assert!(report.compaction.is_none());
}

#[test]
fn shards_split_the_identifier_space() {
    let tmp = TempDir::new().unwrap();
    let mut masters = Vec::new();
    let mut admitted = 0;
    for index in 0..3 {
        let shard = ShardSpec::new(index, 3).unwrap();
        let config = SessionConfig::builder(tmp.path(), "plumbers", "manual")
            .max_records(100)
            .pacing(PacingConfig::without_delays())
            .shard(shard)
            .build()
            .unwrap();
        let report = CollectionSession::open(
            config,
            scripted(0..30),
            ManualClock::new(),
            CancellationToken::new(),
        )
        .unwrap()
        .run()
        .unwrap();
        assert_eq!(report.admitted_total + report.foreign_shard, 30);
        admitted += report.admitted_total;
        let layout = RunLayout::new(tmp.path(), "plumbers", "manual", shard).unwrap();
        masters.push(MasterLog::open(layout.master_path()).unwrap());
    }
    assert_eq!(admitted, 30);

    let merged = tmp.path().join("final/plumbers.manual.jsonl");
    let report = MasterLog::union(&masters, &merged).unwrap();
    assert_eq!(report.records_written, 30);
    assert_eq!(report.duplicates_dropped, 0);
}

#[test]
fn config_loads_from_json_file() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("trawl.json");
    let body = json!({
        "root": tmp.path(),
        "run_id": "plumbers",
        "run": {"mode": "manual", "max_records": 2},
        "pacing": {"min_jitter_ms": 0, "max_jitter_ms": 0, "requests_per_minute": 0},
        "dedup": {"fuzzy": {"enabled": true}}
    });
    fs_err::write(&path, body.to_string()).unwrap();

    let config = SessionConfig::from_json_file(&path).unwrap();
    assert!(config.dedup.fuzzy.enabled);
    let report = CollectionSession::open(
        config,
        scripted(0..5),
        ManualClock::new(),
        CancellationToken::new(),
    )
    .unwrap()
    .run()
    .unwrap();
    assert_eq!(report.admitted_total, 2);
}

#[test]
fn master_log_survives_pruned_segments() {
    let tmp = TempDir::new().unwrap();
    let master = layout(tmp.path()).master_path();
    fs_err::create_dir_all(master.parent().unwrap()).unwrap();
    let body: String = ["X", "Y"]
        .iter()
        .map(|id| Record::new(*id, Utc::now()).to_line().unwrap())
        .collect();
    fs_err::write(&master, body).unwrap();

    let source = ScriptedSource::new()
        .json(json!({"place_id": "Y", "name": "Yard"}))
        .json(json!({"place_id": "Z", "name": "Zinc"}));
    let report = CollectionSession::open(
        config(tmp.path(), 10),
        source,
        ManualClock::new(),
        CancellationToken::new(),
    )
    .unwrap()
    .run()
    .unwrap();
    assert_eq!(report.resumed_from, 2);
    assert_eq!(report.admitted_this_session, 1);
    assert_eq!(report.rejected_duplicates, 1);
    assert_eq!(master_ids(tmp.path()), vec!["X", "Y", "Z"]);

    let mut fresh = config(tmp.path(), 10);
    fresh.run.start = StartMode::Fresh;
    fs_err::remove_dir_all(layout(tmp.path()).segments_dir()).unwrap();
    let err = CollectionSession::open(
        fresh,
        ScriptedSource::new(),
        ManualClock::new(),
        CancellationToken::new(),
    )
    .err()
    .unwrap();
    assert!(matches!(err, TrawlError::RunAlreadyExists { .. }));
}

#[test]
fn failed_compaction_still_reports_the_session() {
    let tmp = TempDir::new().unwrap();
    fs_err::write(tmp.path().join("final"), "not a directory").unwrap();
    let report = CollectionSession::open(
        config(tmp.path(), 10),
        scripted([1, 1]),
        ManualClock::new(),
        CancellationToken::new(),
    )
    .unwrap()
    .run()
    .unwrap();
    assert_eq!(report.termination, Termination::SourceExhausted);
    assert_eq!(report.admitted_total, 1);
    assert_eq!(report.rejected_duplicates, 1);
    assert!(report.compaction.is_none());
    assert!(report.compaction_error.is_some());
}

#[test]
fn exhausted_sequence_range_is_fatal_not_a_durability_failure() {
    let tmp = TempDir::new().unwrap();
    let dir = layout(tmp.path()).segments_dir();
    fs_err::create_dir_all(&dir).unwrap();
    let last = *ShardSpec::single().sequence_range().end();
    fs_err::write(
        dir.join(format!("plumbers.manual.s{last:06}.n1.c00000001.jsonl")),
        Record::new("p0", Utc::now()).to_line().unwrap(),
    )
    .unwrap();

    let report = CollectionSession::open(
        config(tmp.path(), 10),
        scripted([1]),
        ManualClock::new(),
        CancellationToken::new(),
    )
    .unwrap()
    .run()
    .unwrap();
    assert!(matches!(report.termination, Termination::Fatal { .. }));
    assert_eq!(report.termination.exit_code(), 70);
    assert_eq!(report.admitted_total, 1);
    assert_eq!(report.admitted_this_session, 0);
}

#[cfg(unix)]
#[test]
fn record_written_before_a_failed_seal_is_counted() {
    let tmp = TempDir::new().unwrap();
    let segments = layout(tmp.path()).segments_dir();
    let mut config = config(tmp.path(), 10);
    config.checkpoint = CheckpointConfig {
        segment_capacity: 2,
        flush_interval: 1,
    };
    let mut calls = 0;
    let source = FnSource(|| {
        calls += 1;
        if calls == 2 {
            fs_err::remove_dir_all(&segments).unwrap();
        }
        Ok(Candidate::from_json(place(calls)).ok())
    });

    let report = CollectionSession::open(config, source, ManualClock::new(), CancellationToken::new())
        .unwrap()
        .run()
        .unwrap();
    assert!(matches!(
        report.termination,
        Termination::DurabilityFailure { .. }
    ));
    assert_eq!(report.admitted_this_session, 2);
}
