//! High-level store API: the record state machine.
//!
//! Every mutating operation takes an explicit [`Context`] naming the
//! acting agent; nothing here reads ambient state. Operations follow
//! one shape: take the record lock, re-read the committed document,
//! check preconditions, write once, append an event.

use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::id;
use crate::storage::{ReindexReport, Storage};
use crate::types::{
    Context, Edge, EventKind, Kind, NewNode, Node, NodeUpdate, Relation, Session, SessionStatus,
    Status,
};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::path::Path;

/// A handle on one store root.
///
/// Handles are cheap to open and safe to use from many processes at
/// once; all cross-process coordination happens through lock files and
/// the shared index.
pub struct Store {
    storage: Storage,
}

impl Store {
    /// Initialize a store at `root`, creating the layout if needed.
    pub fn init(root: &Path) -> Result<Self, StoreError> {
        let config = StoreConfig::load(root)?;
        Ok(Self {
            storage: Storage::init(root, config)?,
        })
    }

    /// Open an existing store, honoring `<root>/config.yml` if present.
    pub fn open(root: &Path) -> Result<Self, StoreError> {
        let config = StoreConfig::load(root)?;
        Ok(Self {
            storage: Storage::open(root, config)?,
        })
    }

    /// Initialize with an explicit configuration, ignoring `config.yml`.
    pub fn init_with(root: &Path, config: StoreConfig) -> Result<Self, StoreError> {
        Ok(Self {
            storage: Storage::init(root, config)?,
        })
    }

    /// Open with an explicit configuration, ignoring `config.yml`.
    pub fn open_with(root: &Path, config: StoreConfig) -> Result<Self, StoreError> {
        Ok(Self {
            storage: Storage::open(root, config)?,
        })
    }

    pub fn root(&self) -> &Path {
        self.storage.root()
    }

    pub fn config(&self) -> &StoreConfig {
        self.storage.config()
    }

    pub(crate) fn storage(&self) -> &Storage {
        &self.storage
    }

    // ----- reads -----

    /// Read one record. Absence is `Ok(None)`, never an error.
    pub fn get(&self, id: &str) -> Result<Option<Node>, StoreError> {
        self.storage.get(id)
    }

    /// All records, optionally one kind, ordered `(priority, created_at)`.
    pub fn list(&self, kind: Option<Kind>) -> Result<Vec<Node>, StoreError> {
        self.storage.list(kind)
    }

    /// Todo records with no unfinished blocker.
    pub fn ready(&self) -> Result<Vec<Node>, StoreError> {
        self.storage.ready()
    }

    /// Records explicitly blocked or held back by an unfinished blocker.
    pub fn blocked(&self) -> Result<Vec<Node>, StoreError> {
        self.storage.blocked()
    }

    /// Targets of a record's edges of one relation.
    pub fn edges(&self, id: &str, relation: Relation) -> Result<BTreeSet<String>, StoreError> {
        self.storage.edges(id, relation)
    }

    /// Records whose readiness waits on `id` finishing.
    pub fn dependents(&self, id: &str) -> Result<BTreeSet<String>, StoreError> {
        self.storage.dependents(id)
    }

    /// Check the index against the documents, report divergences, rebuild.
    pub fn reindex(&self) -> Result<ReindexReport, StoreError> {
        self.storage.reindex()
    }

    // ----- record lifecycle -----

    /// Create a record. Status starts at `todo`; emits `Create`.
    pub fn create(&self, ctx: &Context, new: NewNode) -> Result<Node, StoreError> {
        let now = Utc::now();
        let id = id::generate_node_id(new.kind, &new.title, now);
        let node = build_node(id, new, now)?;
        self.storage.put(&node)?;
        self.storage.record_event(&node.id, EventKind::Create, ctx)?;
        Ok(node)
    }

    /// Create a child record under `parent_id`, allocating the next
    /// `.<n>` id. The child always takes the parent's kind.
    pub fn create_sub(&self, ctx: &Context, parent_id: &str, new: NewNode) -> Result<Node, StoreError> {
        // The parent lock serializes ordinal allocation across processes
        let _lock = self.storage.lock(parent_id)?;
        let parent = self
            .storage
            .get(parent_id)?
            .ok_or_else(|| StoreError::NotFound(parent_id.to_string()))?;

        let now = Utc::now();
        let ordinal = self.storage.max_child_ordinal(parent_id)? + 1;
        let mut new = new;
        new.kind = parent.kind;
        let node = build_node(id::sub_id(parent_id, ordinal), new, now)?;
        self.storage.put(&node)?;
        self.storage.record_event(&node.id, EventKind::Create, ctx)?;
        Ok(node)
    }

    /// Take the claim on a record. Any live claim, including the
    /// caller's own, is a conflict; an expired one is taken over.
    pub fn claim(&self, ctx: &Context, id: &str) -> Result<Node, StoreError> {
        let _lock = self.storage.lock(id)?;
        let node = self.require(id)?;
        let now = Utc::now();
        if let Some(holder) = node.live_claimant(self.config().claim_ttl_secs, now) {
            return Err(StoreError::ClaimConflict {
                id: id.to_string(),
                holder: holder.to_string(),
            });
        }

        let updated = Node {
            claimed_by: Some(ctx.agent.clone()),
            claimed_at: Some(now),
            claiming_session: ctx.session.clone(),
            updated_at: now,
            ..node
        };
        self.storage.write_node(&updated)?;
        self.storage.record_event(id, EventKind::Claim, ctx)?;
        Ok(updated)
    }

    /// Move a record to `in-progress`, claiming it if unclaimed.
    ///
    /// Fails with `ClaimConflict` when someone else holds a live claim,
    /// `InvalidTransition` off `todo`, and `WipLimitExceeded` when the
    /// agent is already at the in-progress limit for the record's kind.
    pub fn start(&self, ctx: &Context, id: &str) -> Result<Node, StoreError> {
        let _lock = self.storage.lock(id)?;
        let node = self.require(id)?;
        let now = Utc::now();
        if let Some(holder) = node.live_claimant(self.config().claim_ttl_secs, now)
            && holder != ctx.agent
        {
            return Err(StoreError::ClaimConflict {
                id: id.to_string(),
                holder: holder.to_string(),
            });
        }
        if node.status != Status::Todo {
            return Err(StoreError::InvalidTransition {
                id: id.to_string(),
                from: node.status,
                to: Status::InProgress,
            });
        }

        let limit = self.config().wip_limit;
        if limit > 0 {
            let wip = self.storage.index_fresh()?.wip_count(&ctx.agent, node.kind)?;
            if wip >= limit {
                return Err(StoreError::WipLimitExceeded {
                    agent: ctx.agent.clone(),
                    kind: node.kind.as_str().to_string(),
                    limit,
                });
            }
        }

        let updated = Node {
            status: Status::InProgress,
            claimed_by: Some(ctx.agent.clone()),
            claimed_at: Some(now),
            claiming_session: ctx.session.clone(),
            updated_at: now,
            ..node
        };
        self.storage.write_node(&updated)?;
        self.storage.record_event(id, EventKind::Start, ctx)?;
        Ok(updated)
    }

    /// Finish a record. Must be `in-progress` and, if claimed, claimed
    /// by the caller. Clears the claim; emits `Complete`.
    pub fn complete(&self, ctx: &Context, id: &str) -> Result<Node, StoreError> {
        let _lock = self.storage.lock(id)?;
        let node = self.require(id)?;
        let now = Utc::now();
        if let Some(holder) = node.live_claimant(self.config().claim_ttl_secs, now)
            && holder != ctx.agent
        {
            return Err(StoreError::ClaimConflict {
                id: id.to_string(),
                holder: holder.to_string(),
            });
        }
        if node.status != Status::InProgress {
            return Err(StoreError::InvalidTransition {
                id: id.to_string(),
                from: node.status,
                to: Status::Done,
            });
        }

        let updated = Node {
            status: Status::Done,
            claimed_by: None,
            claimed_at: None,
            claiming_session: None,
            updated_at: now,
            ..node
        };
        self.storage.write_node(&updated)?;
        self.storage.record_event(id, EventKind::Complete, ctx)?;
        Ok(updated)
    }

    /// Give a record back: clear the claim and revert `in-progress` to
    /// `todo`. Emits `Release`.
    pub fn release(&self, ctx: &Context, id: &str) -> Result<Node, StoreError> {
        let _lock = self.storage.lock(id)?;
        let node = self.require(id)?;
        let now = Utc::now();
        if let Some(holder) = node.live_claimant(self.config().claim_ttl_secs, now)
            && holder != ctx.agent
        {
            return Err(StoreError::ClaimConflict {
                id: id.to_string(),
                holder: holder.to_string(),
            });
        }

        let status = if node.status == Status::InProgress {
            Status::Todo
        } else {
            node.status
        };
        let updated = Node {
            status,
            claimed_by: None,
            claimed_at: None,
            claiming_session: None,
            updated_at: now,
            ..node
        };
        self.storage.write_node(&updated)?;
        self.storage.record_event(id, EventKind::Release, ctx)?;
        Ok(updated)
    }

    /// Mark a record `blocked`. The claim is left untouched.
    pub fn block(&self, ctx: &Context, id: &str) -> Result<Node, StoreError> {
        let _lock = self.storage.lock(id)?;
        let node = self.require(id)?;
        if !node.status.can_transition_to(&Status::Blocked) {
            return Err(StoreError::InvalidTransition {
                id: id.to_string(),
                from: node.status,
                to: Status::Blocked,
            });
        }

        let updated = Node {
            status: Status::Blocked,
            updated_at: Utc::now(),
            ..node
        };
        self.storage.write_node(&updated)?;
        self.storage.record_event(id, EventKind::Block, ctx)?;
        Ok(updated)
    }

    /// Move a `blocked` record back to `todo`. The claim is left
    /// untouched.
    pub fn unblock(&self, ctx: &Context, id: &str) -> Result<Node, StoreError> {
        let _lock = self.storage.lock(id)?;
        let node = self.require(id)?;
        if node.status != Status::Blocked {
            return Err(StoreError::InvalidTransition {
                id: id.to_string(),
                from: node.status,
                to: Status::Todo,
            });
        }

        let updated = Node {
            status: Status::Todo,
            updated_at: Utc::now(),
            ..node
        };
        self.storage.write_node(&updated)?;
        self.storage.record_event(id, EventKind::Unblock, ctx)?;
        Ok(updated)
    }

    /// Patch record fields and revalidate. Emits `Update`.
    pub fn update(&self, ctx: &Context, id: &str, patch: NodeUpdate) -> Result<Node, StoreError> {
        let _lock = self.storage.lock(id)?;
        let mut node = self.require(id)?;

        if let Some(title) = patch.title {
            node.title = title;
        }
        if let Some(priority) = patch.priority {
            node.priority = priority;
        }
        if let Some(steps) = patch.steps {
            node.steps = steps;
        }
        if let Some(extra) = patch.extra {
            node.extra = extra;
        }
        node.updated_at = Utc::now();
        node.validate()?;

        self.storage.write_node(&node)?;
        self.storage.record_event(id, EventKind::Update, ctx)?;
        Ok(node)
    }

    /// Add an edge on the source document. Idempotent: an existing
    /// `(relation, target)` pair is returned unchanged with no event.
    /// The target may be absent locally, and cycles are permitted.
    pub fn link(
        &self,
        ctx: &Context,
        from: &str,
        relation: Relation,
        to: &str,
        label: Option<&str>,
    ) -> Result<Node, StoreError> {
        let _lock = self.storage.lock(from)?;
        let mut node = self.require(from)?;
        if node.edge(relation, to).is_some() {
            return Ok(node);
        }

        node.edges.push(Edge {
            relation,
            target: to.to_string(),
            label: label.map(String::from),
        });
        node.updated_at = Utc::now();
        self.storage.write_node(&node)?;
        self.storage.record_event(from, EventKind::Link, ctx)?;
        Ok(node)
    }

    /// Remove an edge from the source document. Removing an absent edge
    /// is a no-op with no event.
    pub fn unlink(
        &self,
        ctx: &Context,
        from: &str,
        relation: Relation,
        to: &str,
    ) -> Result<Node, StoreError> {
        let _lock = self.storage.lock(from)?;
        let mut node = self.require(from)?;
        let before = node.edges.len();
        node.edges
            .retain(|e| !(e.relation == relation && e.target == to));
        if node.edges.len() == before {
            return Ok(node);
        }

        node.updated_at = Utc::now();
        self.storage.write_node(&node)?;
        self.storage.record_event(from, EventKind::Unlink, ctx)?;
        Ok(node)
    }

    /// Remove a record. Returns whether it existed; emits `Delete` only
    /// when it did. Inbound edges on other documents stay, dangling.
    pub fn delete(&self, ctx: &Context, id: &str) -> Result<bool, StoreError> {
        let _lock = self.storage.lock(id)?;
        let removed = self.storage.remove_node(id)?;
        if removed {
            self.storage.record_event(id, EventKind::Delete, ctx)?;
        }
        Ok(removed)
    }

    // ----- sessions -----

    /// Open a session for `ctx.agent`, delegated from
    /// `ctx.parent_session` when set. Emits `SessionStart` attributed to
    /// the new session.
    pub fn begin_session(&self, ctx: &Context) -> Result<Session, StoreError> {
        let now = Utc::now();
        let session = Session {
            id: id::generate_session_id(&ctx.agent, now),
            owning_agent: ctx.agent.clone(),
            parent_session: ctx.parent_session.clone(),
            status: SessionStatus::Active,
            started_at: now,
            ended_at: None,
            event_count: 0,
        };
        self.storage.put_session(&session)?;

        let event_ctx = Context {
            agent: ctx.agent.clone(),
            session: Some(session.id.clone()),
            parent_session: ctx.parent_session.clone(),
        };
        self.storage
            .record_event(&session.id, EventKind::SessionStart, &event_ctx)?;
        Ok(session)
    }

    /// Close out a session with an outcome.
    ///
    /// `Paused` stops a session that may be ended again later; a session
    /// already in a terminal status is returned unchanged. Asking for
    /// `Active` is a no-op. Emits `SessionEnd` when the status changes.
    pub fn end_session(
        &self,
        ctx: &Context,
        id: &str,
        outcome: SessionStatus,
    ) -> Result<Session, StoreError> {
        let _lock = self.storage.lock(id)?;
        let session = self
            .storage
            .get_session(id)?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if session.status.is_terminal()
            || outcome == SessionStatus::Active
            || outcome == session.status
        {
            return Ok(session);
        }

        let updated = Session {
            status: outcome,
            ended_at: Some(Utc::now()),
            ..session
        };
        self.storage.write_session(&updated)?;

        let event_ctx = Context {
            agent: ctx.agent.clone(),
            session: Some(id.to_string()),
            parent_session: ctx.parent_session.clone(),
        };
        self.storage
            .record_event(id, EventKind::SessionEnd, &event_ctx)?;
        Ok(updated)
    }

    /// Read one session. Absence is `Ok(None)`.
    pub fn get_session(&self, id: &str) -> Result<Option<Session>, StoreError> {
        self.storage.get_session(id)
    }

    /// All sessions, ordered by start time.
    pub fn sessions(&self) -> Result<Vec<Session>, StoreError> {
        self.storage.list_sessions()
    }

    fn require(&self, id: &str) -> Result<Node, StoreError> {
        self.storage
            .get(id)?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }
}

fn build_node(id: String, new: NewNode, now: DateTime<Utc>) -> Result<Node, StoreError> {
    let node = Node {
        id,
        kind: new.kind,
        status: Status::Todo,
        priority: new.priority,
        title: new.title,
        steps: new.steps,
        edges: Vec::new(),
        claimed_by: None,
        claimed_at: None,
        claiming_session: None,
        created_at: now,
        updated_at: now,
        extra: new.extra,
    };
    node.validate()?;
    Ok(node)
}
