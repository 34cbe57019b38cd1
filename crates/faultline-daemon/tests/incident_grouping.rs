//! End-to-end grouping scenarios: fingerprint correlation, severity
//! escalation boundaries, and watermark-driven catch-up.

mod common;

use chrono::Duration;
use common::Harness;
use faultline_core::clock::Clock;
use faultline_core::incident::{
    IncidentStatus, META_COUNT_UPGRADED, META_DURATION_UPGRADED, SEVERITY_COUNT_THRESHOLD,
};
use faultline_core::types::Severity;
use serde_json::json;

/// Three distinct events with the same error code group into one
/// incident carrying the canonical signature and seen-at bounds.
#[tokio::test]
async fn events_with_one_signature_group_into_one_incident() {
    let harness = Harness::new();

    let mut submissions = Vec::new();
    for (i, key) in ["k-1", "k-2", "k-3"].iter().enumerate() {
        let mut submission = harness.failure_submission(key);
        submission.occurred_at = harness.clock.now() + Duration::seconds(i64::try_from(i).unwrap());
        submissions.push(submission);
    }
    for submission in &submissions {
        harness.ingest(submission).await.unwrap();
    }

    harness.detect().await;

    let incident = harness.open_timeout_incident().unwrap();
    assert_eq!(incident.signature, "payment.failed:timeout:w1");
    assert_eq!(incident.event_count, 3);
    assert_eq!(incident.first_seen_at, submissions[0].occurred_at);
    assert_eq!(incident.last_seen_at, submissions[2].occurred_at);

    // exactly one open incident despite three events
    let event_ids = harness
        .store
        .incidents()
        .correlated_event_ids(&incident.id)
        .unwrap();
    assert_eq!(event_ids.len(), 3);
}

/// Different error codes produce different signatures and separate
/// incidents; volatile identifiers in codes collapse together.
#[tokio::test]
async fn signatures_separate_and_normalize() {
    let harness = Harness::new();

    let mut other = harness.failure_submission("k-other");
    other.payload = json!({"error_code": "invalid_credentials"});
    harness.ingest(&other).await.unwrap();

    // the same logical failure with different volatile ids
    let mut volatile_a = harness.failure_submission("k-va");
    volatile_a.payload = json!({"error_code": "db error id 123456"});
    let mut volatile_b = harness.failure_submission("k-vb");
    volatile_b.payload = json!({"error_code": "db error id 987654"});
    harness.ingest(&volatile_a).await.unwrap();
    harness.ingest(&volatile_b).await.unwrap();

    harness.detect().await;

    let incidents = harness.store.incidents();
    assert!(incidents
        .find_open("t1", "w1", "payment.failed:invalid_credentials:w1")
        .unwrap()
        .is_some());
    let collapsed = incidents
        .find_open("t1", "w1", "payment.failed:db error id N:w1")
        .unwrap()
        .unwrap();
    assert_eq!(collapsed.event_count, 2);
}

/// Non-failure events pass through ingestion without creating incidents.
#[tokio::test]
async fn non_failure_events_are_ignored_by_detection() {
    let harness = Harness::new();

    let mut submission = harness.failure_submission("k-ok");
    submission.event_type = "payment.completed".to_string();
    submission.payload = json!({"status": "ok"});
    harness.ingest(&submission).await.unwrap();

    let processed = harness.detect().await;
    assert_eq!(processed, 1);
    assert!(harness.open_timeout_incident().is_none());
    assert_eq!(harness.store.incidents().count_open().unwrap(), 0);
}

/// Crossing the count threshold upgrades severity exactly once: the
/// 101st event upgrades, the 102nd does not upgrade again.
#[tokio::test]
async fn count_threshold_upgrades_severity_exactly_once() {
    let harness = Harness::new();

    let total = SEVERITY_COUNT_THRESHOLD + 2;
    for i in 0..total {
        harness
            .ingest(&harness.failure_submission(&format!("k-{i}")))
            .await
            .unwrap();
    }
    harness.detect().await;

    let incident = harness.open_timeout_incident().unwrap();
    assert_eq!(incident.event_count, total);
    // medium -> high, exactly one level despite two events past the edge
    assert_eq!(incident.severity, Severity::High);
    assert!(incident.metadata_flag(META_COUNT_UPGRADED));
}

/// An incident smoldering for over an hour upgrades once on duration.
#[tokio::test]
async fn duration_threshold_upgrades_severity_once() {
    let harness = Harness::new();

    harness
        .ingest(&harness.failure_submission("k-first"))
        .await
        .unwrap();
    harness.detect().await;

    harness.clock.advance(Duration::seconds(3601));
    harness
        .ingest(&harness.failure_submission("k-later"))
        .await
        .unwrap();
    harness.detect().await;

    let incident = harness.open_timeout_incident().unwrap();
    assert_eq!(incident.severity, Severity::High);
    assert!(incident.metadata_flag(META_DURATION_UPGRADED));

    // another late event does not upgrade again
    harness.clock.advance(Duration::seconds(60));
    harness
        .ingest(&harness.failure_submission("k-even-later"))
        .await
        .unwrap();
    harness.detect().await;
    assert_eq!(
        harness.open_timeout_incident().unwrap().severity,
        Severity::High
    );
}

/// A resolved incident frees its signature: the next failure opens a
/// fresh incident instead of resurrecting the old one.
#[tokio::test]
async fn resolved_incidents_do_not_absorb_new_failures() {
    let harness = Harness::new();

    harness
        .ingest(&harness.failure_submission("k-1"))
        .await
        .unwrap();
    harness.detect().await;
    let first = harness.open_timeout_incident().unwrap();

    let incidents = harness.store.incidents();
    incidents
        .update_status(&first.id, IncidentStatus::Analyzing, IncidentStatus::Actioned)
        .ok();
    incidents
        .update_status(&first.id, IncidentStatus::Actioned, IncidentStatus::Resolved)
        .unwrap();

    harness
        .ingest(&harness.failure_submission("k-2"))
        .await
        .unwrap();
    harness.detect().await;

    let second = harness.open_timeout_incident().unwrap();
    assert_ne!(second.id, first.id);
    assert_eq!(second.event_count, 1);
}

/// Detection catches up from the durable watermark: events persisted
/// while the detector was not running are processed on the next drain.
#[tokio::test]
async fn detection_catches_up_from_the_watermark() {
    let harness = Harness::new();

    // ingest five events with no detection in between (lost wake-ups)
    for i in 0..5 {
        harness
            .ingest(&harness.failure_submission(&format!("k-{i}")))
            .await
            .unwrap();
    }
    assert!(harness.open_timeout_incident().is_none());

    let processed = harness.detect().await;
    assert_eq!(processed, 5);
    assert_eq!(harness.open_timeout_incident().unwrap().event_count, 5);

    // a second drain finds nothing left behind the watermark
    assert_eq!(harness.detect().await, 0);
}

/// Every decision row for an incident is preserved in insertion order;
/// nothing rewrites history.
#[tokio::test]
async fn decisions_accumulate_append_only() {
    let harness = Harness::new();

    harness
        .ingest(&harness.failure_submission("k-1"))
        .await
        .unwrap();
    harness.detect().await;
    let incident = harness.open_timeout_incident().unwrap();

    let before = harness
        .store
        .decisions()
        .list_for_incident(&incident.id)
        .unwrap();
    assert!(!before.is_empty());

    harness
        .ingest(&harness.failure_submission("k-2"))
        .await
        .unwrap();
    harness.detect().await;

    let after = harness
        .store
        .decisions()
        .list_for_incident(&incident.id)
        .unwrap();
    assert!(after.len() >= before.len());
    // earlier rows are byte-identical
    assert_eq!(&after[..before.len()], &before[..]);
}
