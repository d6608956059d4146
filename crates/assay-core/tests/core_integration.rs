#![allow(clippy::unwrap_used, clippy::expect_used)]

use assay_core::*;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// 1. Worker result envelope as a worker would send it
// ---------------------------------------------------------------------------

#[test]
fn worker_result_from_json() {
    let id = Uuid::new_v4();
    let raw = serde_json::json!({
        "scenarioId": id,
        "status": "succeeded",
        "score": 0.82,
        "detail": "no critical findings"
    });

    let parsed: WorkerResultEnvelope = serde_json::from_value(raw).unwrap();
    assert_eq!(parsed.scenario_id, id);
    assert_eq!(parsed.status, WorkerOutcome::Succeeded);
    assert_eq!(parsed.score, Some(0.82));
    assert_eq!(parsed.detail.as_deref(), Some("no critical findings"));
}

// ---------------------------------------------------------------------------
// 2. Priority ordering and serialization
// ---------------------------------------------------------------------------

#[test]
fn priority_orders_by_severity() {
    let mut priorities = vec![Priority::High, Priority::Low, Priority::Critical, Priority::Medium];
    priorities.sort();
    assert_eq!(
        priorities,
        vec![Priority::Low, Priority::Medium, Priority::High, Priority::Critical]
    );
    assert_eq!(serde_json::to_string(&Priority::Critical).unwrap(), "\"critical\"");
    assert_eq!(Priority::default(), Priority::Medium);
}

// ---------------------------------------------------------------------------
// 3. Error display carries the identifying detail
// ---------------------------------------------------------------------------

#[test]
fn error_messages_identify_the_subject() {
    let task_id = Uuid::new_v4();
    let err = AssayError::InvalidTransition {
        task_id,
        from: "completed".into(),
        to: "running".into(),
    };
    let msg = err.to_string();
    assert!(msg.contains(&task_id.to_string()));
    assert!(msg.contains("completed -> running"));
    assert_eq!(err.kind(), "invalid_transition");

    let err = AssayError::Unroutable {
        scenario: "Load test checkout".into(),
        reason: "unknown capability 'load-test'".into(),
    };
    assert!(err.to_string().contains("Load test checkout"));
}

#[test]
fn json_errors_convert() {
    let parse: Result<WorkerResultEnvelope, _> = serde_json::from_str("{");
    let err: AssayError = parse.unwrap_err().into();
    assert_eq!(err.kind(), "json");
}
