//! Collect then recover, end to end over the opendal `memory` backend.
//!
//! The source log runs from 0 to 100 and is captured in three cycles, giving
//! segments (0,40], (40,75] and (75,100]. Transactions:
//! - 10 BEGIN, 20 COMMIT
//! - 30 BEGIN, 40 COMMIT
//! - 50 self-contained
//! - 55 BEGIN, 65 row, 70 COMMIT
//! - 75 self-contained
//! - 80 BEGIN, 90 COMMIT
//! - 100 self-contained

mod common;

use binlog_pitr_core::{LogPosition, PitrError, StorageBackend};
use binlog_pitr_storage::{
    Collector, Recoverer, RecovererConfig, RecoveryTarget, RetryPolicy, SegmentManifest,
};
use chrono::Duration as ChronoDuration;
use common::*;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const TRANSACTIONS: &[(u64, bool)] = &[
    (10, false),
    (20, true),
    (30, false),
    (40, true),
    (50, true),
    (55, false),
    (65, false),
    (70, true),
    (75, true),
    (80, false),
    (90, true),
    (100, true),
];

struct Fixture {
    backend: Arc<FlakyBackend>,
    manifest: SegmentManifest,
    source: ScriptedSource,
    collector: Collector,
}

fn fixture(root: &str, events: &[(u64, bool)]) -> Fixture {
    let backend = Arc::new(FlakyBackend::new(memory_store(root)));
    let manifest = manifest_over(backend.clone());
    let source = ScriptedSource::new(script(events));
    let collector = Collector::new(
        fast_collector_config(30),
        manifest.clone(),
        Arc::new(source.clone()),
    );
    Fixture {
        backend,
        manifest,
        source,
        collector,
    }
}

fn recoverer(manifest: &SegmentManifest, target: RecoveryTarget, partial: bool) -> Recoverer {
    Recoverer::new(
        RecovererConfig {
            base: LogPosition::ORIGIN,
            target,
            allow_partial_target: partial,
            read_retry: RetryPolicy::new(3, Duration::from_millis(1)),
        },
        manifest.clone(),
    )
}

/// Test: recovery to position 60 never touches the third segment.
///
/// Expected
/// - Plan holds the first two segments with cutoff 60
/// - Everything up to the commit at 50 is applied; the transaction 55..70 is not
/// - Segment 3 is never downloaded
#[tokio::test]
async fn recovery_to_position_stops_inside_second_segment() {
    let fx = fixture("e2e-position", TRANSACTIONS);
    collect_through(&fx.collector, &fx.source, &[40, 75, 100]).await;

    let rec = recoverer(&fx.manifest, RecoveryTarget::Position(pos(60)), false);
    let plan = rec.plan().await.expect("plan");
    let planned: Vec<u64> = plan.segments.iter().map(|e| e.header.sequence).collect();
    assert_eq!(planned, vec![1, 2]);
    assert_eq!(plan.cutoff, pos(60));
    assert!(!plan.partial);

    let sink = RecordingSink::default();
    let report = rec
        .run(sink.clone(), &CancellationToken::new())
        .await
        .expect("recover");
    assert_eq!(sink.applied(), vec![10, 20, 30, 40, 50]);
    assert_eq!(report.apply.applied_through, pos(50));
    assert_eq!(report.apply.events_discarded, 4);

    let third = fx.manifest.segment_key(3);
    assert!(!fx.backend.full_reads().contains(&third));
}

#[tokio::test]
async fn removed_middle_segment_fails_with_incomplete_history() {
    let fx = fixture("e2e-gap", TRANSACTIONS);
    collect_through(&fx.collector, &fx.source, &[40, 75, 100]).await;
    fx.backend
        .delete(&fx.manifest.segment_key(2))
        .await
        .expect("delete middle segment");

    let sink = RecordingSink::default();
    let err = recoverer(&fx.manifest, RecoveryTarget::Position(pos(90)), false)
        .run(sink.clone(), &CancellationToken::new())
        .await
        .unwrap_err();
    match err {
        PitrError::IncompleteHistory { expected, .. } => assert_eq!(expected, pos(40)),
        other => panic!("expected IncompleteHistory, got {:?}", other),
    }
    assert!(sink.applied().is_empty());
}

#[tokio::test]
async fn target_after_latest_capture_is_not_captured_unless_partial_allowed() {
    let fx = fixture("e2e-beyond", TRANSACTIONS);
    collect_through(&fx.collector, &fx.source, &[40, 75, 100]).await;

    let err = recoverer(&fx.manifest, RecoveryTarget::Position(pos(500)), false)
        .plan()
        .await
        .unwrap_err();
    match err {
        PitrError::TargetNotCaptured { latest, .. } => assert_eq!(latest, pos(100)),
        other => panic!("expected TargetNotCaptured, got {:?}", other),
    }

    let sink = RecordingSink::default();
    let report = recoverer(&fx.manifest, RecoveryTarget::Position(pos(500)), true)
        .run(sink.clone(), &CancellationToken::new())
        .await
        .expect("partial recovery");
    assert!(report.partial);
    assert_eq!(report.cutoff, pos(100));
    assert_eq!(report.apply.applied_through, pos(100));
    assert_eq!(sink.applied().len(), TRANSACTIONS.len());
}

/// Test: a transaction split by a cycle boundary reaches the sink in one piece.
///
/// Flow
/// - Transaction 70 BEGIN, 75 row, 80 COMMIT; the second cycle stops at 75
///
/// Expected
/// - 70, 75 and 80 are delivered in the same batch
#[tokio::test]
async fn transaction_split_by_cycle_boundary_is_applied_whole() {
    let events = &[(20, true), (40, true), (70, false), (75, false), (80, true), (100, true)];
    let fx = fixture("e2e-carry", events);
    collect_through(&fx.collector, &fx.source, &[40, 75, 100]).await;

    let sink = RecordingSink::default();
    recoverer(&fx.manifest, RecoveryTarget::Position(pos(100)), false)
        .run(sink.clone(), &CancellationToken::new())
        .await
        .expect("recover");

    let batches = sink.batches();
    assert!(batches.contains(&vec![70, 75, 80, 100]));
    assert!(!batches.iter().any(|b| b == &vec![70, 75]));
    assert_eq!(sink.applied(), vec![20, 40, 70, 75, 80, 100]);
}

/// Test: a target time inside an idle period resolves to the end of the
/// last activity before it.
///
/// Flow
/// - Cycle 1 captures (0,40], cycles 2 and 3 are idle, then cycle 4 captures (40,75]
/// - Target time is the middle of idle cycle 2
///
/// Expected
/// - Cutoff is 40 and only the first segment is replayed
#[tokio::test]
async fn timestamp_target_inside_idle_period_resolves_via_empty_segments() {
    let fx = fixture("e2e-idle", &[(20, true), (40, true)]);
    collect_through(&fx.collector, &fx.source, &[40, 40, 40]).await;
    fx.source.push(script(&[(60, true), (75, true)]));
    collect_through(&fx.collector, &fx.source, &[75]).await;

    let entries = fx.manifest.list_entries().await.expect("list");
    assert_eq!(entries.len(), 4);
    assert!(entries[1].header.is_empty() && entries[2].header.is_empty());
    let idle = &entries[1].header;
    let target = idle.captured_from + (idle.captured_to - idle.captured_from) / 2;

    let rec = recoverer(&fx.manifest, RecoveryTarget::Timestamp(target), false);
    let plan = rec.plan().await.expect("plan");
    assert_eq!(plan.cutoff, pos(40));

    let sink = RecordingSink::default();
    rec.run(sink.clone(), &CancellationToken::new())
        .await
        .expect("recover");
    assert_eq!(sink.applied(), vec![20, 40]);
    assert!(!fx.backend.full_reads().contains(&fx.manifest.segment_key(4)));
}

#[tokio::test]
async fn timestamp_before_earliest_capture_is_incomplete_history() {
    let fx = fixture("e2e-early", TRANSACTIONS);
    collect_through(&fx.collector, &fx.source, &[40]).await;

    let entries = fx.manifest.list_entries().await.expect("list");
    let target = entries[0].header.captured_from - ChronoDuration::hours(1);
    let err = recoverer(&fx.manifest, RecoveryTarget::Timestamp(target), false)
        .plan()
        .await
        .unwrap_err();
    assert!(matches!(err, PitrError::IncompleteHistory { .. }));
}

#[tokio::test]
async fn cancelled_recovery_applies_nothing() {
    let fx = fixture("e2e-cancel", TRANSACTIONS);
    collect_through(&fx.collector, &fx.source, &[40, 75]).await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let sink = RecordingSink::default();
    let err = recoverer(&fx.manifest, RecoveryTarget::Position(pos(60)), false)
        .run(sink.clone(), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, PitrError::Cancelled));
    assert!(sink.applied().is_empty());
}
