//! Tests for the work list, its lifecycle rules, and slot arithmetic.

use chrono::{Duration, Utc};
use folio::error::Error;
use folio::limits::{Limits, available_slots};
use folio::model::*;
use folio::queue::JobQueue;

fn text(name: &str) -> Payload {
    Payload::Text {
        name: name.to_string(),
        body: format!("body of {name}"),
    }
}

fn outcome_ok() -> Outcome {
    Outcome {
        output: Some(ServiceOutput::Text("hello".to_string())),
        thinking: None,
        error: None,
        duration_ms: 12,
    }
}

fn outcome_err() -> Outcome {
    Outcome {
        output: None,
        thinking: None,
        error: Some("quota exceeded".to_string()),
        duration_ms: 7,
    }
}

// ---------------------------------------------------------------------------
// Ordering
// ---------------------------------------------------------------------------

#[test]
fn promote_takes_items_in_enqueue_order() {
    let mut queue = JobQueue::new();
    let now = Utc::now();
    let a = queue.enqueue(text("a"), now);
    let b = queue.enqueue(text("b"), now);
    let c = queue.enqueue(text("c"), now);

    assert_eq!(queue.promote(2), vec![a, b]);
    assert_eq!(queue.queued_ids(), vec![c]);

    let item = queue.get(a).unwrap();
    assert_eq!(item.state, State::Processing);
    assert_eq!(item.attempts, 1);
}

#[test]
fn promote_more_than_queued_takes_all() {
    let mut queue = JobQueue::new();
    let a = queue.enqueue(text("a"), Utc::now());
    assert_eq!(queue.promote(10), vec![a]);
    assert!(queue.promote(10).is_empty());
}

#[test]
fn retried_item_goes_to_the_back() {
    let mut queue = JobQueue::new();
    let now = Utc::now();
    let a = queue.enqueue(text("a"), now);
    let b = queue.enqueue(text("b"), now);

    queue.promote(1);
    queue.settle(a, State::Failed, outcome_err()).unwrap();
    let c = queue.enqueue(text("c"), now);
    queue.retry(a).unwrap();

    assert_eq!(queue.queued_ids(), vec![b, c, a]);
    let item = queue.get(a).unwrap();
    assert_eq!(item.state, State::Queued);
    assert!(item.outcome.is_none());
    assert_eq!(item.attempts, 1);
}

#[test]
fn listing_is_newest_first() {
    let mut queue = JobQueue::new();
    let t0 = Utc::now();
    let old = queue.enqueue(text("old"), t0);
    let new = queue.enqueue(text("new"), t0 + Duration::seconds(5));
    let same_time = queue.enqueue(text("same"), t0 + Duration::seconds(5));

    let ids: Vec<WorkId> = queue.by_recency().into_iter().map(|i| i.id).collect();
    assert_eq!(ids, vec![same_time, new, old]);
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[test]
fn settle_records_outcome() {
    let mut queue = JobQueue::new();
    let a = queue.enqueue(text("a"), Utc::now());
    queue.promote(1);
    queue.settle(a, State::Completed, outcome_ok()).unwrap();

    let item = queue.get(a).unwrap();
    assert_eq!(item.state, State::Completed);
    assert_eq!(item.outcome.as_ref().and_then(|o| o.text()), Some("hello"));
    assert_eq!(queue.count(State::Completed), 1);
}

#[test]
fn settle_queued_item_is_rejected() {
    let mut queue = JobQueue::new();
    let a = queue.enqueue(text("a"), Utc::now());
    let err = queue.settle(a, State::Completed, outcome_ok()).unwrap_err();
    assert!(matches!(
        err,
        Error::InvalidTransition {
            from: State::Queued,
            to: State::Completed
        }
    ));
}

#[test]
fn settle_cannot_move_back_to_queued() {
    let mut queue = JobQueue::new();
    let a = queue.enqueue(text("a"), Utc::now());
    queue.promote(1);
    assert!(queue.settle(a, State::Queued, outcome_ok()).is_err());
    assert_eq!(queue.get(a).unwrap().state, State::Processing);
}

#[test]
fn completed_item_cannot_be_retried() {
    let mut queue = JobQueue::new();
    let a = queue.enqueue(text("a"), Utc::now());
    queue.promote(1);
    queue.settle(a, State::Completed, outcome_ok()).unwrap();
    assert!(matches!(
        queue.retry(a),
        Err(Error::InvalidTransition { .. })
    ));
}

#[test]
fn unknown_id_is_not_found() {
    let mut queue = JobQueue::new();
    assert!(matches!(queue.retry(WorkId::new()), Err(Error::NotFound(_))));
    assert!(queue.remove(WorkId::new()).is_none());
}

#[test]
fn remove_deletes_in_any_state() {
    let mut queue = JobQueue::new();
    let now = Utc::now();
    let a = queue.enqueue(text("a"), now);
    let b = queue.enqueue(text("b"), now);
    queue.promote(1);

    assert_eq!(queue.remove(a).unwrap().state, State::Processing);
    assert_eq!(queue.remove(b).unwrap().state, State::Queued);
    assert!(queue.is_empty());
}

#[test]
fn transition_table() {
    use State::*;
    assert!(Queued.can_transition_to(Processing));
    assert!(Processing.can_transition_to(Completed));
    assert!(Processing.can_transition_to(Failed));
    assert!(Failed.can_transition_to(Queued));

    assert!(!Queued.can_transition_to(Completed));
    assert!(!Completed.can_transition_to(Queued));
    assert!(!Completed.can_transition_to(Processing));
    assert!(!Failed.can_transition_to(Processing));
}

#[test]
fn state_parses_its_display_form() {
    for state in [State::Queued, State::Processing, State::Completed, State::Failed] {
        assert_eq!(state.to_string().parse::<State>().unwrap(), state);
    }
    assert!("done".parse::<State>().is_err());
}

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

#[tokio::test]
async fn payload_is_classified_by_extension() {
    let dir = tempfile::tempdir().unwrap();

    let image = dir.path().join("scan.JPG");
    std::fs::write(&image, [0xff, 0xd8]).unwrap();
    let note = dir.path().join("note.md");
    std::fs::write(&note, "# Hallo").unwrap();
    let binary = dir.path().join("archive.zip");
    std::fs::write(&binary, [0u8; 4]).unwrap();

    match Payload::from_path(&image).await.unwrap() {
        Payload::ImageFile { media_type, .. } => assert_eq!(media_type, "image/jpeg"),
        other => panic!("expected image, got {other:?}"),
    }
    match Payload::from_path(&note).await.unwrap() {
        Payload::Text { body, .. } => assert_eq!(body, "# Hallo"),
        other => panic!("expected text, got {other:?}"),
    }
    assert!(matches!(
        Payload::from_path(&binary).await,
        Err(Error::Config(_))
    ));
}

#[test]
fn output_file_names_do_not_collide_for_same_stem() {
    let mut queue = JobQueue::new();
    let now = Utc::now();
    let image = Payload::ImageFile {
        path: "a/scan.png".into(),
        media_type: "image/png".to_string(),
    };
    let other_dir = Payload::ImageFile {
        path: "b/scan.png".into(),
        media_type: "image/png".to_string(),
    };
    let ids = [
        queue.enqueue(image, now),
        queue.enqueue(other_dir, now),
        queue.enqueue(text("scan.txt"), now),
    ];

    let names: Vec<String> = ids
        .iter()
        .map(|id| queue.get(*id).unwrap().output_file_name("txt"))
        .collect();
    let unique: std::collections::HashSet<&String> = names.iter().collect();
    assert_eq!(unique.len(), 3);

    for (id, name) in ids.iter().zip(&names) {
        assert_eq!(name, &format!("scan-{id}.txt"));
    }
}

// ---------------------------------------------------------------------------
// Limits
// ---------------------------------------------------------------------------

#[test]
fn coupled_limits_follow_rpm() {
    let mut limits = Limits::default();
    assert_eq!(limits.rpm, Limits::DEFAULT_RPM);
    assert_eq!(limits.max_concurrent, Limits::DEFAULT_RPM);

    limits.set_rpm(4);
    assert_eq!(limits.max_concurrent, 4);

    limits.set_max_concurrent(2);
    assert!(!limits.coupled);
    limits.set_rpm(8);
    assert_eq!(limits.max_concurrent, 2);
}

#[test]
fn concurrency_cap_never_exceeds_rpm() {
    assert_eq!(Limits::independent(3, 10).concurrency_cap(), 3);
    assert_eq!(Limits::independent(10, 3).concurrency_cap(), 3);
}

#[test]
fn slots_are_bounded_by_every_ceiling() {
    let limits = Limits::independent(10, 4);
    assert_eq!(available_slots(&limits, 0, 10, 20), 4);
    assert_eq!(available_slots(&limits, 3, 10, 20), 1);
    assert_eq!(available_slots(&limits, 0, 2, 20), 2);
    assert_eq!(available_slots(&limits, 0, 10, 1), 1);
    assert_eq!(available_slots(&limits, 0, 10, 0), 0);
}

#[test]
fn slots_clamp_to_zero() {
    assert_eq!(available_slots(&Limits::coupled(0), 0, 0, 5), 0);
    assert_eq!(available_slots(&Limits::independent(5, 0), 0, 5, 5), 0);
    assert!(!Limits::independent(5, 0).admits_anything());
    // More in flight than the cap (cap lowered mid-flight).
    assert_eq!(available_slots(&Limits::independent(10, 2), 5, 10, 5), 0);
}
