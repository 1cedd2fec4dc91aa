//! Integration tests for index consistency and repair.
//!
//! The documents are the authority; these tests damage or desync the
//! index from outside the API and verify the store notices and heals.

mod common;

use cairn::{Discrepancy, Kind, NewNode, Relation, SessionStatus, Store};
use common::TestEnv;
use std::fs;

// =============================================================================
// Reindex Consistency Tests
// =============================================================================

#[test]
fn test_reindex_clean_after_normal_activity() {
    let env = TestEnv::new();
    let ctx = &env.ctx;

    let a = env.create_task("A");
    let b = env.create_task("B");
    env.add_dependency(&b, &a);
    env.finish(&a);
    env.store.start(ctx, &b.id).unwrap();
    let c = env.create_task("C");
    env.store.delete(ctx, &c.id).unwrap();

    let session = env.store.begin_session(ctx).unwrap();
    env.store
        .end_session(ctx, &session.id, SessionStatus::Completed)
        .unwrap();

    let report = env.store.reindex().unwrap();
    assert!(report.discrepancies.is_empty(), "{:?}", report.discrepancies);
    assert!(!report.rebuilt);
}

#[test]
fn test_out_of_band_edit_detected_and_repaired() {
    let env = TestEnv::new();
    let node = env.create_task("Original title");

    // Rewrite the document behind the index's back
    let path = env.temp_dir.path().join("task").join(&node.id);
    let doctored = fs::read_to_string(&path)
        .unwrap()
        .replace("Original title", "Doctored title");
    fs::write(&path, doctored).unwrap();

    // Reads go to the document, so the edit is already visible
    assert_eq!(
        env.store.get(&node.id).unwrap().unwrap().title,
        "Doctored title"
    );

    let report = env.store.reindex().unwrap();
    assert!(report.rebuilt);
    assert_eq!(
        report.discrepancies,
        vec![Discrepancy::FieldDrift {
            id: node.id.clone(),
            field: "title".to_string(),
        }]
    );

    // The repair holds
    let second = env.store.reindex().unwrap();
    assert!(second.discrepancies.is_empty());
}

#[test]
fn test_out_of_band_file_addition_detected() {
    let env = TestEnv::new();
    let node = env.create_task("Template");

    // Clone the document under a fresh id, as an external tool might
    let path = env.temp_dir.path().join("task").join(&node.id);
    let new_id = "task-00000000aa";
    let copied = fs::read_to_string(&path)
        .unwrap()
        .replace(&node.id, new_id);
    fs::write(env.temp_dir.path().join("task").join(new_id), copied).unwrap();

    let report = env.store.reindex().unwrap();
    assert!(report.rebuilt);
    assert_eq!(
        report.discrepancies,
        vec![Discrepancy::MissingRow {
            id: new_id.to_string()
        }]
    );
    assert!(env.store.get(new_id).unwrap().is_some());
}

#[test]
fn test_out_of_band_deletion_detected() {
    let env = TestEnv::new();
    let node = env.create_task("Doomed");
    let keeper = env.create_task("Keeper");

    fs::remove_file(env.temp_dir.path().join("task").join(&node.id)).unwrap();

    let report = env.store.reindex().unwrap();
    assert!(report.rebuilt);
    assert_eq!(
        report.discrepancies,
        vec![Discrepancy::OrphanRow {
            id: node.id.clone()
        }]
    );

    let ids: Vec<String> = env.store.list(None).unwrap().into_iter().map(|n| n.id).collect();
    assert_eq!(ids, vec![keeper.id]);
}

#[test]
fn test_corrupt_document_reported_not_fatal() {
    let env = TestEnv::new();
    let keeper = env.create_task("Keeper");

    fs::write(
        env.temp_dir.path().join("task").join("task-00000000bb"),
        "{ not json",
    )
    .unwrap();

    let report = env.store.reindex().unwrap();
    assert_eq!(report.discrepancies.len(), 1);
    assert!(matches!(
        &report.discrepancies[0],
        Discrepancy::CorruptDocument { origin, .. } if origin.contains("task-00000000bb")
    ));

    // The rest of the store stays usable
    let ids: Vec<String> = env.store.list(None).unwrap().into_iter().map(|n| n.id).collect();
    assert_eq!(ids, vec![keeper.id]);
}

// =============================================================================
// Rebuild-on-Open Tests
// =============================================================================

#[test]
fn test_index_deletion_recovered_on_open() {
    let temp = tempfile::TempDir::new().unwrap();
    let a_id;
    let b_id;
    {
        let store = Store::init(temp.path()).unwrap();
        let ctx = cairn::Context::new("test-agent");
        let a = store.create(&ctx, NewNode::new(Kind::Task, "A")).unwrap();
        let b = store.create(&ctx, NewNode::new(Kind::Task, "B")).unwrap();
        store
            .link(&ctx, &b.id, Relation::DependsOn, &a.id, None)
            .unwrap();
        a_id = a.id;
        b_id = b.id;
    }

    fs::remove_file(temp.path().join("index.db")).unwrap();

    let store = Store::open(temp.path()).unwrap();
    assert_eq!(store.list(None).unwrap().len(), 2);
    let ready: Vec<String> = store.ready().unwrap().into_iter().map(|n| n.id).collect();
    assert_eq!(ready, vec![a_id]);
    assert!(store.edges(&b_id, Relation::DependsOn).unwrap().len() == 1);

    let report = store.reindex().unwrap();
    assert!(report.discrepancies.is_empty());
}

#[test]
fn test_open_heals_documents_added_while_closed() {
    let temp = tempfile::TempDir::new().unwrap();
    let existing_id;
    {
        let store = Store::init(temp.path()).unwrap();
        let ctx = cairn::Context::new("test-agent");
        existing_id = store
            .create(&ctx, NewNode::new(Kind::Task, "Existing"))
            .unwrap()
            .id;
    }

    // Drop a document in while no handle is open
    let template = fs::read_to_string(temp.path().join("task").join(&existing_id)).unwrap();
    let new_id = "task-00000000cc";
    fs::write(
        temp.path().join("task").join(new_id),
        template.replace(&existing_id, new_id),
    )
    .unwrap();

    let store = Store::open(temp.path()).unwrap();
    let ids: Vec<String> = store.list(None).unwrap().into_iter().map(|n| n.id).collect();
    assert!(ids.contains(&existing_id.to_string()));
    assert!(ids.contains(&new_id.to_string()));
}

// =============================================================================
// Cross-Handle Visibility Tests
// =============================================================================

#[test]
fn test_writes_visible_to_already_open_handles() {
    let env = TestEnv::new();
    let other = env.open_again();

    let node = env.create_task("Fresh");
    let seen: Vec<String> = other.ready().unwrap().into_iter().map(|n| n.id).collect();
    assert_eq!(seen, vec![node.id.clone()]);

    env.finish(&node);
    assert!(other.ready().unwrap().is_empty());
    assert_eq!(other.list(Some(Kind::Task)).unwrap().len(), 1);
}
