//! Shared test infrastructure for Cairn integration tests.
//!
//! Provides TestEnv helper for consistent test setup/teardown.

#![allow(dead_code)]

use cairn::{Context, Kind, NewNode, Node, Relation, Store};
use tempfile::TempDir;

/// Test environment with automatic cleanup.
pub struct TestEnv {
    pub temp_dir: TempDir,
    pub store: Store,
    pub ctx: Context,
}

impl TestEnv {
    /// Create a new test environment with an initialized store.
    pub fn new() -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = Store::init(temp_dir.path()).expect("Failed to init store");
        Self {
            temp_dir,
            store,
            ctx: Context::new("test-agent"),
        }
    }

    /// Create a task with default priority.
    pub fn create_task(&self, title: &str) -> Node {
        self.store
            .create(&self.ctx, NewNode::new(Kind::Task, title))
            .expect("Failed to create record")
    }

    /// Create a task with a specific priority.
    pub fn create_task_with_priority(&self, title: &str, priority: u8) -> Node {
        self.store
            .create(
                &self.ctx,
                NewNode::new(Kind::Task, title).with_priority(priority),
            )
            .expect("Failed to create record")
    }

    /// Make `dependent` wait on `prerequisite` via a depends-on edge.
    pub fn add_dependency(&self, dependent: &Node, prerequisite: &Node) {
        self.store
            .link(
                &self.ctx,
                &dependent.id,
                Relation::DependsOn,
                &prerequisite.id,
                None,
            )
            .expect("Failed to link records");
    }

    /// Record a blocks edge from `blocker` to `held`.
    pub fn add_blocker(&self, blocker: &Node, held: &Node) {
        self.store
            .link(&self.ctx, &blocker.id, Relation::Blocks, &held.id, None)
            .expect("Failed to link records");
    }

    /// Work a record to completion.
    pub fn finish(&self, node: &Node) {
        self.store
            .start(&self.ctx, &node.id)
            .expect("Failed to start record");
        self.store
            .complete(&self.ctx, &node.id)
            .expect("Failed to complete record");
    }

    /// Open a second handle on the same root, as another process would.
    pub fn open_again(&self) -> Store {
        Store::open(self.temp_dir.path()).expect("Failed to reopen store")
    }

    /// Assert that a record is in the ready list.
    pub fn assert_ready(&self, node: &Node) {
        let ready = self.store.ready().expect("Failed to get ready records");
        assert!(
            ready.iter().any(|n| n.id == node.id),
            "Expected record {} to be ready, but it wasn't. Ready records: {:?}",
            node.id,
            ready.iter().map(|n| &n.id).collect::<Vec<_>>()
        );
    }

    /// Assert that a record is NOT in the ready list.
    pub fn assert_not_ready(&self, node: &Node) {
        let ready = self.store.ready().expect("Failed to get ready records");
        assert!(
            !ready.iter().any(|n| n.id == node.id),
            "Expected record {} to NOT be ready, but it was",
            node.id
        );
    }

    /// Assert that a record is in the blocked list.
    pub fn assert_blocked(&self, node: &Node) {
        let blocked = self.store.blocked().expect("Failed to get blocked records");
        assert!(
            blocked.iter().any(|n| n.id == node.id),
            "Expected record {} to be blocked, but it wasn't",
            node.id
        );
    }

    /// Get ready record count.
    pub fn ready_count(&self) -> usize {
        self.store.ready().expect("Failed to get ready records").len()
    }

    /// Get all record count.
    pub fn total_count(&self) -> usize {
        self.store.list(None).expect("Failed to list records").len()
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}
