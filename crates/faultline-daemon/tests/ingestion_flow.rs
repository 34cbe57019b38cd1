//! End-to-end ingestion scenarios: idempotent replay, tenancy gates,
//! kill switches, and rate limiting.

mod common;

use chrono::Duration;
use common::Harness;
use faultline_core::clock::Clock;
use faultline_core::reject::RejectionCode;
use faultline_core::types::{Tenant, Workflow};
use faultline_daemon::pipeline::{IngestError, IngestStatus};
use faultline_daemon::store::kill_switch;
use serde_json::json;

/// Submitting the same event twice yields one row, the same event id,
/// and `duplicate` on the second response; detection sees one event.
#[tokio::test]
async fn duplicate_submission_is_idempotent() {
    let harness = Harness::new();
    let submission = harness.failure_submission("k-1");

    let first = harness.ingest(&submission).await.unwrap();
    assert_eq!(first.status, IngestStatus::Accepted);

    let second = harness.ingest(&submission).await.unwrap();
    assert_eq!(second.status, IngestStatus::Duplicate);
    assert_eq!(second.event_id, first.event_id);

    harness.detect().await;
    let incident = harness.open_timeout_incident().unwrap();
    assert_eq!(incident.event_count, 1);
    assert_eq!(
        harness
            .store
            .incidents()
            .correlated_event_ids(&incident.id)
            .unwrap(),
        vec![first.event_id]
    );
}

/// Unknown tenant and unknown workflow are 404-class rejections; an
/// inactive tenant is 400-class.
#[tokio::test]
async fn tenancy_gates_reject_before_any_write() {
    let harness = Harness::new();

    let mut submission = harness.failure_submission("k-tenant");
    submission.tenant_id = "ghost".to_string();
    let err = harness.ingest(&submission).await.unwrap_err();
    assert_eq!(err.code(), RejectionCode::NotFound);

    let mut submission = harness.failure_submission("k-wf");
    submission.workflow_id = "ghost".to_string();
    let err = harness.ingest(&submission).await.unwrap_err();
    assert_eq!(err.code(), RejectionCode::NotFound);

    harness
        .store
        .admin()
        .upsert_tenant(&Tenant {
            id: "t-frozen".to_string(),
            name: "Frozen".to_string(),
            active: false,
        })
        .unwrap();
    let mut submission = harness.failure_submission("k-frozen");
    submission.tenant_id = "t-frozen".to_string();
    let err = harness.ingest(&submission).await.unwrap_err();
    assert_eq!(err.code(), RejectionCode::TenantInactive);
    assert_eq!(err.code().status_class(), 400);

    // none of the rejected submissions persisted anything
    assert!(harness
        .store
        .events()
        .find_by_idempotency_key("t1", "k-wf")
        .unwrap()
        .is_none());
}

/// A workflow belonging to a different tenant is invisible.
#[tokio::test]
async fn workflow_of_another_tenant_is_not_found() {
    let harness = Harness::new();
    harness
        .store
        .admin()
        .upsert_tenant(&Tenant {
            id: "t2".to_string(),
            name: "Other".to_string(),
            active: true,
        })
        .unwrap();

    let mut submission = harness.failure_submission("k-cross");
    submission.tenant_id = "t2".to_string();
    // w1 exists, but belongs to t1
    let err = harness.ingest(&submission).await.unwrap_err();
    assert_eq!(err.code(), RejectionCode::NotFound);
}

/// Engaging a workflow-scoped kill switch rejects ingestion with
/// `workflow_disabled`, persists nothing, and leaves incidents alone.
#[tokio::test]
async fn kill_switch_blocks_ingestion() {
    let harness = Harness::new();

    // an incident exists from before the switch
    harness
        .ingest(&harness.failure_submission("k-before"))
        .await
        .unwrap();
    harness.detect().await;
    let incident_before = harness.open_timeout_incident().unwrap();

    harness
        .store
        .admin()
        .activate_kill_switch(&kill_switch(
            "t1",
            Some("w1"),
            "bad deploy",
            "ops",
            harness.clock.now(),
        ))
        .unwrap();

    let err = harness
        .ingest(&harness.failure_submission("k-after"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), RejectionCode::WorkflowDisabled);
    assert_eq!(err.code().status_class(), 403);

    assert!(harness
        .store
        .events()
        .find_by_idempotency_key("t1", "k-after")
        .unwrap()
        .is_none());

    harness.detect().await;
    let incident_after = harness.open_timeout_incident().unwrap();
    assert_eq!(incident_after.event_count, incident_before.event_count);

    // deactivating the switch restores ingestion
    harness
        .store
        .admin()
        .deactivate_kill_switch("t1", Some("w1"))
        .unwrap();
    assert!(harness
        .ingest(&harness.failure_submission("k-restored"))
        .await
        .is_ok());
}

/// A tenant-wide switch blocks every workflow of the tenant.
#[tokio::test]
async fn tenant_wide_kill_switch_blocks_all_workflows() {
    let harness = Harness::new();
    harness
        .store
        .admin()
        .upsert_workflow(&Workflow {
            id: "w2".to_string(),
            tenant_id: "t1".to_string(),
            name: "refunds".to_string(),
            active: true,
        })
        .unwrap();
    harness
        .store
        .admin()
        .activate_kill_switch(&kill_switch("t1", None, "freeze", "ops", harness.clock.now()))
        .unwrap();

    for workflow in ["w1", "w2"] {
        let mut submission = harness.failure_submission(&format!("k-{workflow}"));
        submission.workflow_id = workflow.to_string();
        let err = harness.ingest(&submission).await.unwrap_err();
        assert_eq!(err.code(), RejectionCode::WorkflowDisabled);
    }
}

/// An inactive workflow is `workflow_disabled` even without a switch.
#[tokio::test]
async fn inactive_workflow_is_disabled() {
    let harness = Harness::new();
    harness
        .store
        .admin()
        .upsert_workflow(&Workflow {
            id: "w1".to_string(),
            tenant_id: "t1".to_string(),
            name: "payments".to_string(),
            active: false,
        })
        .unwrap();

    let err = harness
        .ingest(&harness.failure_submission("k-inactive"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), RejectionCode::WorkflowDisabled);
}

/// Schema violations are 400-class and never reach the store.
#[tokio::test]
async fn validation_rejects_malformed_submissions() {
    let harness = Harness::new();

    let mut submission = harness.failure_submission("k-bad");
    submission.schema_version = "not-semver".to_string();
    let err = harness.ingest(&submission).await.unwrap_err();
    assert!(matches!(err, IngestError::Validation { .. }));
    assert_eq!(err.code().status_class(), 400);

    let mut submission = harness.failure_submission("k-bad2");
    submission.payload = json!(["not", "an", "object"]);
    assert!(harness.ingest(&submission).await.is_err());
}

/// The tenant sliding window rejects the request over the limit with a
/// retry-after hint, and admits again once the window rolls.
#[tokio::test]
async fn tenant_rate_limit_rejects_with_retry_after() {
    let mut config = common::test_config();
    config.pipeline.tenant_rate_limit_per_minute = 2;
    let harness = Harness::with_config(config);

    for i in 0..2 {
        harness
            .ingest(&harness.failure_submission(&format!("k-{i}")))
            .await
            .unwrap();
    }

    let err = harness
        .ingest(&harness.failure_submission("k-over"))
        .await
        .unwrap_err();
    match &err {
        IngestError::RateLimited {
            scope,
            retry_after_secs,
        } => {
            assert_eq!(*scope, "tenant");
            assert!(*retry_after_secs >= 1);
        },
        other => panic!("expected RateLimited, got {other:?}"),
    }
    assert_eq!(err.code().status_class(), 429);

    harness.clock.advance(Duration::seconds(61));
    assert!(harness
        .ingest(&harness.failure_submission("k-rolled"))
        .await
        .is_ok());
}
