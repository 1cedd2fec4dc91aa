//! Core record types for the work graph.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Reserved top-level document keys. The extension map may not shadow these.
const RESERVED_FIELDS: &[&str] = &[
    "id",
    "kind",
    "status",
    "priority",
    "title",
    "steps",
    "edges",
    "claimed_by",
    "claimed_at",
    "claiming_session",
    "created_at",
    "updated_at",
];

/// A single tracked work record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Node {
    /// Unique identifier: kind prefix + "-" + 10 hex chars, optionally
    /// extended with ".<n>" suffixes for sub-items. Immutable once assigned.
    pub id: String,

    /// Record kind, always consistent with the id prefix
    #[serde(default)]
    pub kind: Kind,

    /// Current state
    #[serde(default)]
    pub status: Status,

    /// Priority 0-4 (0 = critical, 4 = low)
    #[serde(default = "default_priority")]
    pub priority: u8,

    /// Short description of the work
    #[serde(default)]
    pub title: String,

    /// Ordered checklist
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<Step>,

    /// Typed relationships to other records, owned by this document
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub edges: Vec<Edge>,

    /// Agent holding the claim, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<String>,

    /// When the claim was taken
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,

    /// Session the claim was taken under
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claiming_session: Option<String>,

    /// When created
    #[serde(default = "default_timestamp")]
    pub created_at: DateTime<Utc>,

    /// Last modification
    #[serde(default = "default_timestamp")]
    pub updated_at: DateTime<Utc>,

    /// Unknown document fields, preserved across read/write cycles
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

fn default_priority() -> u8 {
    2
}

fn default_timestamp() -> DateTime<Utc> {
    DateTime::UNIX_EPOCH
}

/// Record kinds. The wire name doubles as the id prefix and the
/// directory name under the store root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Kind {
    #[serde(rename = "task")]
    Task,
    #[serde(rename = "feat")]
    Feature,
    #[serde(rename = "bug")]
    Bug,
    #[serde(rename = "chore")]
    Chore,
    #[serde(rename = "epic")]
    Epic,
}

impl Kind {
    pub const ALL: [Kind; 5] = [Kind::Task, Kind::Feature, Kind::Bug, Kind::Chore, Kind::Epic];

    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Task => "task",
            Kind::Feature => "feat",
            Kind::Bug => "bug",
            Kind::Chore => "chore",
            Kind::Epic => "epic",
        }
    }

    pub fn parse(s: &str) -> Option<Kind> {
        match s {
            "task" => Some(Kind::Task),
            "feat" => Some(Kind::Feature),
            "bug" => Some(Kind::Bug),
            "chore" => Some(Kind::Chore),
            "epic" => Some(Kind::Epic),
            _ => None,
        }
    }
}

impl Default for Kind {
    fn default() -> Self {
        Kind::Task
    }
}

/// Record status states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Status {
    Todo,
    InProgress,
    Blocked,
    Done,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Todo => "todo",
            Status::InProgress => "in-progress",
            Status::Blocked => "blocked",
            Status::Done => "done",
        }
    }

    pub fn parse(s: &str) -> Option<Status> {
        match s {
            "todo" => Some(Status::Todo),
            "in-progress" => Some(Status::InProgress),
            "blocked" => Some(Status::Blocked),
            "done" => Some(Status::Done),
            _ => None,
        }
    }

    /// Check if a status transition is valid.
    pub fn can_transition_to(&self, target: &Status) -> bool {
        use Status::*;
        match (self, target) {
            // Forward progress
            (Todo, InProgress) => true,
            (InProgress, Done) => true,

            // Blocking and unblocking
            (Todo, Blocked) => true,
            (InProgress, Blocked) => true,
            (Blocked, Todo) => true,

            // Release
            (InProgress, Todo) => true,

            // Done is terminal; everything else is invalid.
            _ => false,
        }
    }
}

impl Default for Status {
    fn default() -> Self {
        Status::Todo
    }
}

/// One entry in a record's ordered checklist.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Step {
    pub description: String,
    #[serde(default)]
    pub completed: bool,
}

impl Step {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            completed: false,
        }
    }
}

/// A directed, typed relationship stored on the source record.
///
/// Targets may be forward-declared: the target record need not exist.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Edge {
    /// Type of relationship
    pub relation: Relation,

    /// The record this edge points at
    pub target: String,

    /// Optional free-form annotation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// Closed vocabulary of relationship types.
///
/// `S --blocks--> T` holds T back until S finishes; `S --depends-on--> T`
/// holds S back until T finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Relation {
    Blocks,
    DependsOn,
    Related,
}

impl Relation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Relation::Blocks => "blocks",
            Relation::DependsOn => "depends-on",
            Relation::Related => "related",
        }
    }

    pub fn parse(s: &str) -> Option<Relation> {
        match s {
            "blocks" => Some(Relation::Blocks),
            "depends-on" => Some(Relation::DependsOn),
            "related" => Some(Relation::Related),
            _ => None,
        }
    }

    /// Returns true if this relation affects ready() calculation.
    pub fn is_blocking(&self) -> bool {
        matches!(self, Relation::Blocks | Relation::DependsOn)
    }
}

/// An agent work session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    /// Unique identifier: "session-" + 10 hex chars
    pub id: String,

    /// Agent that opened the session
    pub owning_agent: String,

    /// Delegating session, possibly outside this store. Soft reference:
    /// never required to resolve locally.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_session: Option<String>,

    /// Current state
    #[serde(default)]
    pub status: SessionStatus,

    /// When the session was opened
    #[serde(default = "default_timestamp")]
    pub started_at: DateTime<Utc>,

    /// When the session finished, for terminal statuses
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,

    /// Number of events attributed to this session. Derived from the
    /// event log on read, never persisted in the document.
    #[serde(skip)]
    pub event_count: u64,
}

/// Session status states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionStatus {
    Active,
    Completed,
    Paused,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Completed => "completed",
            SessionStatus::Paused => "paused",
            SessionStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<SessionStatus> {
        match s {
            "active" => Some(SessionStatus::Active),
            "completed" => Some(SessionStatus::Completed),
            "paused" => Some(SessionStatus::Paused),
            "failed" => Some(SessionStatus::Failed),
            _ => None,
        }
    }

    /// Completed and Failed cannot be left again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Failed)
    }
}

impl Default for SessionStatus {
    fn default() -> Self {
        SessionStatus::Active
    }
}

/// One immutable entry in the append-only event log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Unique identifier: "evt-" + 10 hex chars
    pub id: String,

    /// When the event was recorded
    pub ts: DateTime<Utc>,

    /// Store-wide monotonic sequence number, allocated under the log lock
    pub seq: u64,

    /// The record or session this event is about
    pub subject: String,

    /// What happened
    pub kind: EventKind,

    /// Agent that performed the mutation
    pub agent: String,

    /// Session the mutation was performed under
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
}

/// Closed vocabulary of event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    Create,
    Update,
    Claim,
    Start,
    Complete,
    Release,
    Block,
    Unblock,
    Link,
    Unlink,
    Delete,
    SessionStart,
    SessionEnd,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Create => "create",
            EventKind::Update => "update",
            EventKind::Claim => "claim",
            EventKind::Start => "start",
            EventKind::Complete => "complete",
            EventKind::Release => "release",
            EventKind::Block => "block",
            EventKind::Unblock => "unblock",
            EventKind::Link => "link",
            EventKind::Unlink => "unlink",
            EventKind::Delete => "delete",
            EventKind::SessionStart => "session-start",
            EventKind::SessionEnd => "session-end",
        }
    }

    pub fn parse(s: &str) -> Option<EventKind> {
        match s {
            "create" => Some(EventKind::Create),
            "update" => Some(EventKind::Update),
            "claim" => Some(EventKind::Claim),
            "start" => Some(EventKind::Start),
            "complete" => Some(EventKind::Complete),
            "release" => Some(EventKind::Release),
            "block" => Some(EventKind::Block),
            "unblock" => Some(EventKind::Unblock),
            "link" => Some(EventKind::Link),
            "unlink" => Some(EventKind::Unlink),
            "delete" => Some(EventKind::Delete),
            "session-start" => Some(EventKind::SessionStart),
            "session-end" => Some(EventKind::SessionEnd),
            _ => None,
        }
    }
}

/// Caller identity threaded explicitly through every mutation.
///
/// There is no ambient agent or session state anywhere in the store; a
/// caller that omits the session produces unattributed events.
#[derive(Debug, Clone, PartialEq)]
pub struct Context {
    /// Acting agent name
    pub agent: String,

    /// Session the agent is working under
    pub session: Option<String>,

    /// Delegating session, recorded on sessions opened with this context
    pub parent_session: Option<String>,
}

impl Context {
    pub fn new(agent: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            session: None,
            parent_session: None,
        }
    }

    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.session = Some(session.into());
        self
    }

    pub fn with_parent_session(mut self, parent: impl Into<String>) -> Self {
        self.parent_session = Some(parent.into());
        self
    }
}

/// Fields for creating a record.
#[derive(Debug, Clone)]
pub struct NewNode {
    pub kind: Kind,
    pub title: String,
    pub priority: u8,
    pub steps: Vec<Step>,
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl NewNode {
    pub fn new(kind: Kind, title: impl Into<String>) -> Self {
        Self {
            kind,
            title: title.into(),
            priority: default_priority(),
            steps: Vec::new(),
            extra: BTreeMap::new(),
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_step(mut self, description: impl Into<String>) -> Self {
        self.steps.push(Step::new(description));
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

/// Field patch for `update` and `batch_update`. `None` leaves a field
/// untouched; `steps` and `extra` replace wholesale when present.
#[derive(Debug, Clone, Default)]
pub struct NodeUpdate {
    pub title: Option<String>,
    pub priority: Option<u8>,
    pub steps: Option<Vec<Step>>,
    pub extra: Option<BTreeMap<String, serde_json::Value>>,
}

impl NodeUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn steps(mut self, steps: Vec<Step>) -> Self {
        self.steps = Some(steps);
        self
    }

    pub fn extra(mut self, extra: BTreeMap<String, serde_json::Value>) -> Self {
        self.extra = Some(extra);
        self
    }
}

/// Validation errors for records.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    EmptyTitle,
    TitleTooLong,
    InvalidCharacters,
    InvalidPriority,
    EmptyStepDescription,
    InvalidTimestamp,
    PartialClaim,
    ReservedField(String),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::EmptyTitle => write!(f, "title cannot be empty"),
            ValidationError::TitleTooLong => write!(f, "title exceeds 500 characters"),
            ValidationError::InvalidCharacters => write!(f, "title contains control characters"),
            ValidationError::InvalidPriority => write!(f, "priority must be 0-4"),
            ValidationError::EmptyStepDescription => write!(f, "step description cannot be empty"),
            ValidationError::InvalidTimestamp => write!(f, "updated_at cannot be before created_at"),
            ValidationError::PartialClaim => {
                write!(f, "claimed_at and claiming_session require claimed_by")
            }
            ValidationError::ReservedField(key) => {
                write!(f, "extension field '{}' shadows a built-in field", key)
            }
        }
    }
}

impl std::error::Error for ValidationError {}

impl Node {
    /// Validate the record's fields.
    pub fn validate(&self) -> Result<(), ValidationError> {
        // Title: required, 1-500 chars, no control characters
        if self.title.is_empty() {
            return Err(ValidationError::EmptyTitle);
        }
        if self.title.len() > 500 {
            return Err(ValidationError::TitleTooLong);
        }
        if self.title.chars().any(|c| c.is_control()) {
            return Err(ValidationError::InvalidCharacters);
        }

        // Priority: 0-4
        if self.priority > 4 {
            return Err(ValidationError::InvalidPriority);
        }

        for step in &self.steps {
            if step.description.is_empty() {
                return Err(ValidationError::EmptyStepDescription);
            }
        }

        // Timestamps: updated_at >= created_at
        if self.updated_at < self.created_at {
            return Err(ValidationError::InvalidTimestamp);
        }

        // Claim fields are set and cleared together.
        if self.claimed_by.is_none()
            && (self.claimed_at.is_some() || self.claiming_session.is_some())
        {
            return Err(ValidationError::PartialClaim);
        }

        for key in self.extra.keys() {
            if RESERVED_FIELDS.contains(&key.as_str()) {
                return Err(ValidationError::ReservedField(key.clone()));
            }
        }

        Ok(())
    }

    /// Claimant whose claim is still live under the given TTL.
    ///
    /// A TTL of 0 means claims never expire. A claim without a
    /// `claimed_at` timestamp counts as expired under a finite TTL.
    pub fn live_claimant(&self, ttl_secs: u64, now: DateTime<Utc>) -> Option<&str> {
        let agent = self.claimed_by.as_deref()?;
        if ttl_secs == 0 {
            return Some(agent);
        }
        let at = self.claimed_at?;
        let ttl = i64::try_from(ttl_secs).unwrap_or(i64::MAX);
        if now.signed_duration_since(at).num_seconds() < ttl {
            Some(agent)
        } else {
            None
        }
    }

    /// Find an edge by relation and target.
    pub fn edge(&self, relation: Relation, target: &str) -> Option<&Edge> {
        self.edges
            .iter()
            .find(|e| e.relation == relation && e.target == target)
    }
}
