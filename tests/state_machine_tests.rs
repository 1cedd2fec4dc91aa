//! Integration tests for the record state machine.
//!
//! Exercises lifecycle transitions, claim semantics, and WIP limits the
//! way separate agent processes see them: through independent handles
//! on one shared root.

mod common;

use cairn::{
    Context, EventKind, Kind, NewNode, NodeUpdate, Status, Store, StoreConfig, StoreError,
    StoreEventExt,
};
use common::TestEnv;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

fn event_kinds(store: &Store, subject: &str) -> Vec<EventKind> {
    store
        .events_for(subject)
        .expect("Failed to read events")
        .into_iter()
        .map(|e| e.kind)
        .collect()
}

// =============================================================================
// Lifecycle Tests
// =============================================================================

#[test]
fn test_full_lifecycle() {
    let env = TestEnv::new();

    let node = env.create_task("Ship the feature");
    assert_eq!(node.status, Status::Todo);

    let claimed = env.store.claim(&env.ctx, &node.id).unwrap();
    assert_eq!(claimed.status, Status::Todo);
    assert_eq!(claimed.claimed_by.as_deref(), Some("test-agent"));

    let started = env.store.start(&env.ctx, &node.id).unwrap();
    assert_eq!(started.status, Status::InProgress);

    let done = env.store.complete(&env.ctx, &node.id).unwrap();
    assert_eq!(done.status, Status::Done);
    assert!(done.claimed_by.is_none());

    assert_eq!(
        event_kinds(&env.store, &node.id),
        vec![
            EventKind::Create,
            EventKind::Claim,
            EventKind::Start,
            EventKind::Complete
        ]
    );
}

#[test]
fn test_event_sequence_is_monotonic() {
    let env = TestEnv::new();

    let a = env.create_task("First");
    let b = env.create_task("Second");
    env.finish(&a);
    env.store.start(&env.ctx, &b.id).unwrap();

    let events = env.store.events_for(&a.id).unwrap();
    let mut last = 0;
    for event in &events {
        assert!(event.seq > last, "seq not increasing: {:?}", events);
        last = event.seq;
        assert_eq!(event.agent, "test-agent");
    }
}

#[test]
fn test_invalid_transition_leaves_no_trace() {
    let env = TestEnv::new();

    let node = env.create_task("Untouched");
    let err = env.store.complete(&env.ctx, &node.id).unwrap_err();
    assert!(matches!(
        err,
        StoreError::InvalidTransition {
            from: Status::Todo,
            to: Status::Done,
            ..
        }
    ));

    // Still todo, and no event beyond the create
    assert_eq!(env.store.get(&node.id).unwrap().unwrap().status, Status::Todo);
    assert_eq!(event_kinds(&env.store, &node.id), vec![EventKind::Create]);
}

#[test]
fn test_block_from_both_workable_states() {
    let env = TestEnv::new();

    let from_todo = env.create_task("Blocked fresh");
    env.store.block(&env.ctx, &from_todo.id).unwrap();
    assert_eq!(
        env.store.get(&from_todo.id).unwrap().unwrap().status,
        Status::Blocked
    );

    let from_progress = env.create_task("Blocked mid-flight");
    env.store.start(&env.ctx, &from_progress.id).unwrap();
    env.store.block(&env.ctx, &from_progress.id).unwrap();

    // Unblock lands on todo regardless of where the block started
    let back = env.store.unblock(&env.ctx, &from_progress.id).unwrap();
    assert_eq!(back.status, Status::Todo);

    let done = env.create_task("Finished");
    env.finish(&done);
    let err = env.store.block(&env.ctx, &done.id).unwrap_err();
    assert!(matches!(err, StoreError::InvalidTransition { .. }));
}

#[test]
fn test_update_leaves_status_and_claim_alone() {
    let env = TestEnv::new();

    let node = env.create_task("Original");
    env.store.start(&env.ctx, &node.id).unwrap();

    let updated = env
        .store
        .update(&env.ctx, &node.id, NodeUpdate::new().title("Adjusted"))
        .unwrap();
    assert_eq!(updated.title, "Adjusted");
    assert_eq!(updated.status, Status::InProgress);
    assert_eq!(updated.claimed_by.as_deref(), Some("test-agent"));
}

#[test]
fn test_unicode_titles_roundtrip() {
    let env = TestEnv::new();

    for title in ["Fix the 🐛 in auth", "修复登录问题", "إصلاح تسجيل الدخول"] {
        let node = env.create_task(title);
        assert_eq!(env.store.get(&node.id).unwrap().unwrap().title, title);
    }

    let report = env.store.reindex().unwrap();
    assert!(report.discrepancies.is_empty(), "{:?}", report.discrepancies);
}

#[test]
fn test_sub_records() {
    let env = TestEnv::new();
    let ctx = &env.ctx;

    let parent = env.create_task("Epic of work");
    let child = env
        .store
        .create_sub(ctx, &parent.id, NewNode::new(Kind::Task, "Part one"))
        .unwrap();
    let grandchild = env
        .store
        .create_sub(ctx, &child.id, NewNode::new(Kind::Task, "Detail"))
        .unwrap();

    assert_eq!(child.id, format!("{}.1", parent.id));
    assert_eq!(grandchild.id, format!("{}.1.1", parent.id));

    // Children live their own lifecycle
    env.finish(&grandchild);
    assert_eq!(
        env.store.get(&parent.id).unwrap().unwrap().status,
        Status::Todo
    );
    assert_eq!(env.total_count(), 3);
}

// =============================================================================
// Claim Semantics Across Handles
// =============================================================================

#[test]
fn test_claim_visible_to_other_handles() {
    let env = TestEnv::new();
    let other = env.open_again();

    let node = env.create_task("Shared work");
    env.store.claim(&env.ctx, &node.id).unwrap();

    let seen = other.get(&node.id).unwrap().unwrap();
    assert_eq!(seen.claimed_by.as_deref(), Some("test-agent"));

    let err = other.claim(&Context::new("agent-b"), &node.id).unwrap_err();
    match err {
        StoreError::ClaimConflict { holder, .. } => assert_eq!(holder, "test-agent"),
        other => panic!("expected ClaimConflict, got {:?}", other),
    }
}

#[test]
fn test_contested_start_leaves_clean_history() {
    let env = TestEnv::new();
    let other = env.open_again();

    let node = env.create_task("Contested");
    env.store.start(&env.ctx, &node.id).unwrap();

    // The loser's attempt leaves no mark on the record or its history
    let err = other.start(&Context::new("agent-b"), &node.id).unwrap_err();
    assert!(matches!(err, StoreError::ClaimConflict { .. }));

    env.store.complete(&env.ctx, &node.id).unwrap();
    assert_eq!(
        event_kinds(&env.store, &node.id),
        vec![EventKind::Create, EventKind::Start, EventKind::Complete]
    );
}

#[test]
fn test_release_returns_work_to_the_pool() {
    let env = TestEnv::new();
    let other = env.open_again();
    let agent_b = Context::new("agent-b");

    let node = env.create_task("Handover");
    env.store.start(&env.ctx, &node.id).unwrap();
    env.store.release(&env.ctx, &node.id).unwrap();

    let taken = other.start(&agent_b, &node.id).unwrap();
    assert_eq!(taken.status, Status::InProgress);
    assert_eq!(taken.claimed_by.as_deref(), Some("agent-b"));
}

#[test]
fn test_claim_expires_by_wall_clock() {
    let temp = TempDir::new().unwrap();
    let store = Store::init_with(
        temp.path(),
        StoreConfig {
            claim_ttl_secs: 1,
            ..StoreConfig::default()
        },
    )
    .unwrap();

    let ctx = Context::new("agent-a");
    let node = store.create(&ctx, NewNode::new(Kind::Task, "Lease")).unwrap();
    store.claim(&ctx, &node.id).unwrap();

    let err = store.claim(&Context::new("agent-b"), &node.id).unwrap_err();
    assert!(matches!(err, StoreError::ClaimConflict { .. }));

    thread::sleep(Duration::from_millis(1100));

    let taken = store.claim(&Context::new("agent-b"), &node.id).unwrap();
    assert_eq!(taken.claimed_by.as_deref(), Some("agent-b"));
}

// =============================================================================
// WIP Limit Tests
// =============================================================================

#[test]
fn test_wip_limit_spans_handles() {
    let env = TestEnv::new();
    let other = env.open_again();

    let mut ids = Vec::new();
    for i in 0..4 {
        ids.push(env.create_task(&format!("Task {}", i)).id);
    }
    for id in &ids[..3] {
        env.store.start(&env.ctx, id).unwrap();
    }

    // The limit follows the agent, not the handle
    let err = other.start(&env.ctx, &ids[3]).unwrap_err();
    assert!(matches!(err, StoreError::WipLimitExceeded { limit: 3, .. }));

    // Another agent still has a full budget
    let agent_b = Context::new("agent-b");
    other.start(&agent_b, &ids[3]).unwrap();
}

#[test]
fn test_wip_limit_disabled_by_zero() {
    let temp = TempDir::new().unwrap();
    let store = Store::init_with(
        temp.path(),
        StoreConfig {
            wip_limit: 0,
            ..StoreConfig::default()
        },
    )
    .unwrap();
    let ctx = Context::new("agent-a");

    for i in 0..5 {
        let node = store
            .create(&ctx, NewNode::new(Kind::Task, format!("Task {}", i)))
            .unwrap();
        store.start(&ctx, &node.id).unwrap();
    }
}
