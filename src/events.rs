//! Append-only event log and its query surface.
//!
//! The `events.jsonl` file is the authoritative history; the index
//! `events` table is a queryable mirror. Sequence numbers are allocated
//! under the event-log lock by reading the tail of the file, so the log
//! stays totally ordered across processes.

use crate::error::StoreError;
use crate::store::Store;
use crate::types::{Event, EventKind, Session};
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Event log file name under the store root.
pub(crate) const EVENTS_FILE: &str = "events.jsonl";

/// Lock name serializing seq allocation and appends.
pub(crate) const EVENTS_LOCK: &str = "events";

/// Bytes read from the end of the log to find the last sequence number.
const TAIL_WINDOW: u64 = 8192;

/// Handle on the append-only log file.
#[derive(Debug)]
pub(crate) struct EventLog {
    path: PathBuf,
}

impl EventLog {
    pub fn new(root: &Path) -> Self {
        Self {
            path: root.join(EVENTS_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Next sequence number. Caller must hold the event-log lock.
    pub fn next_seq(&self) -> Result<u64, StoreError> {
        let mut file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(1),
            Err(e) => return Err(StoreError::Io(e)),
        };
        let len = file.metadata()?.len();
        if len == 0 {
            return Ok(1);
        }

        let start = len.saturating_sub(TAIL_WINDOW);
        file.seek(SeekFrom::Start(start))?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        // The first line of the window may be partial when start > 0, and
        // a crashed writer may have left a torn last line; scanning from
        // the end skips anything unparseable.
        let buf = String::from_utf8_lossy(&bytes);
        for line in buf.lines().rev() {
            if line.trim().is_empty() {
                continue;
            }
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(line)
                && let Some(seq) = value.get("seq").and_then(|v| v.as_u64())
            {
                return Ok(seq + 1);
            }
        }
        if start == 0 {
            // Whole file scanned, nothing parseable
            return Ok(1);
        }
        Ok(self.full_scan_max_seq()? + 1)
    }

    fn full_scan_max_seq(&self) -> Result<u64, StoreError> {
        let file = File::open(&self.path)?;
        let reader = BufReader::new(file);
        let mut max_seq = 0u64;
        for line in reader.lines() {
            let Ok(line) = line else { continue };
            if line.trim().is_empty() {
                continue;
            }
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(&line)
                && let Some(seq) = value.get("seq").and_then(|v| v.as_u64())
            {
                max_seq = max_seq.max(seq);
            }
        }
        Ok(max_seq)
    }

    /// Append one event line and sync. Caller must hold the event-log lock.
    ///
    /// Returns the number of lines added: 2 when a torn tail from a
    /// crashed writer had to be terminated first.
    pub fn append(&self, event: &Event) -> Result<u64, StoreError> {
        let mut file = OpenOptions::new()
            .read(true)
            .create(true)
            .append(true)
            .open(&self.path)?;

        let mut added = 1u64;
        let len = file.metadata()?.len();
        if len > 0 {
            file.seek(SeekFrom::Start(len - 1))?;
            let mut last = [0u8; 1];
            file.read_exact(&mut last)?;
            if last[0] != b'\n' {
                log::warn!("terminating torn tail line in {}", self.path.display());
                file.write_all(b"\n")?;
                added += 1;
            }
        }

        let json = serde_json::to_string(event)
            .map_err(|e| StoreError::Io(io::Error::new(io::ErrorKind::InvalidData, e)))?;
        file.write_all(json.as_bytes())?;
        file.write_all(b"\n")?;
        file.sync_all()?;
        Ok(added)
    }

    /// All decodable events in file order, plus the raw line count for
    /// the freshness fingerprint. Undecodable lines are skipped.
    pub fn read_all(&self) -> Result<(Vec<Event>, i64), StoreError> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
            Err(e) => return Err(StoreError::Io(e)),
        };
        let reader = BufReader::new(file);
        let mut events = Vec::new();
        let mut line_count = 0i64;
        for line in reader.lines() {
            line_count += 1;
            let line = match line {
                Ok(l) => l,
                Err(e) => {
                    log::warn!("failed to read event line {}: {}", line_count, e);
                    continue;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Event>(&line) {
                Ok(event) => events.push(event),
                Err(e) => {
                    log::warn!("skipping unparseable event at line {}: {}", line_count, e);
                }
            }
        }
        Ok((events, line_count))
    }

    /// Raw line count, including unparseable lines.
    pub fn line_count(&self) -> Result<i64, StoreError> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(StoreError::Io(e)),
        };
        let reader = BufReader::new(file);
        Ok(reader.lines().count() as i64)
    }
}

/// Filter for querying recorded events.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub(crate) subject: Option<String>,
    pub(crate) session: Option<String>,
    pub(crate) kinds: Vec<EventKind>,
    pub(crate) since: Option<DateTime<Utc>>,
    pub(crate) until: Option<DateTime<Utc>>,
    pub(crate) limit: Option<usize>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter by the record or session the event is about.
    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Filter by the session the mutation was performed under.
    pub fn session(mut self, session: impl Into<String>) -> Self {
        self.session = Some(session.into());
        self
    }

    /// Filter by event kind. May be called repeatedly; kinds accumulate.
    pub fn kind(mut self, kind: EventKind) -> Self {
        self.kinds.push(kind);
        self
    }

    /// Filter by multiple event kinds.
    pub fn kinds(mut self, kinds: impl IntoIterator<Item = EventKind>) -> Self {
        self.kinds.extend(kinds);
        self
    }

    /// Events at or after this time.
    pub fn since(mut self, timestamp: DateTime<Utc>) -> Self {
        self.since = Some(timestamp);
        self
    }

    /// Events at or before this time.
    pub fn until(mut self, timestamp: DateTime<Utc>) -> Self {
        self.until = Some(timestamp);
        self
    }

    /// Limit results.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// One hop in a delegation chain, walking root-ward from a session.
#[derive(Debug, Clone, PartialEq)]
pub struct DelegationLink {
    /// Session id named by the chain
    pub session_id: String,
    /// The locally stored session; `None` for a parent reference that
    /// does not resolve in this store.
    pub session: Option<Session>,
}

/// Extension trait adding event queries to `Store`.
pub trait StoreEventExt {
    /// Events matching the filter, in `(ts, seq)` order.
    fn events(&self, filter: EventFilter) -> Result<Vec<Event>, StoreError>;

    /// Full history of one record or session.
    fn events_for(&self, subject: &str) -> Result<Vec<Event>, StoreError>;

    /// The delegation chain from a session up through its parents.
    ///
    /// Parent references are soft: a parent that does not resolve locally
    /// terminates the walk and appears as the final link.
    fn delegation_chain(&self, session_id: &str) -> Result<Vec<DelegationLink>, StoreError>;

    /// Events of a session and every descendant session found locally.
    fn session_tree_events(&self, session_id: &str) -> Result<Vec<Event>, StoreError>;
}

impl StoreEventExt for Store {
    fn events(&self, filter: EventFilter) -> Result<Vec<Event>, StoreError> {
        self.storage().index_fresh()?.events(&filter)
    }

    fn events_for(&self, subject: &str) -> Result<Vec<Event>, StoreError> {
        self.events(EventFilter::new().subject(subject))
    }

    fn delegation_chain(&self, session_id: &str) -> Result<Vec<DelegationLink>, StoreError> {
        let mut chain = Vec::new();
        let mut seen = BTreeSet::new();
        let mut current = Some(session_id.to_string());
        while let Some(id) = current.take() {
            if !seen.insert(id.clone()) {
                // Parent references form a loop; stop rather than spin.
                break;
            }
            match self.storage().get_session(&id)? {
                Some(session) => {
                    current = session.parent_session.clone();
                    chain.push(DelegationLink {
                        session_id: id,
                        session: Some(session),
                    });
                }
                None => {
                    chain.push(DelegationLink {
                        session_id: id,
                        session: None,
                    });
                }
            }
        }
        Ok(chain)
    }

    fn session_tree_events(&self, session_id: &str) -> Result<Vec<Event>, StoreError> {
        let index = self.storage().index_fresh()?;
        let mut queue = VecDeque::from([session_id.to_string()]);
        let mut seen = BTreeSet::new();
        let mut events = Vec::new();
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id.clone()) {
                continue;
            }
            events.extend(index.events(&EventFilter::new().session(id.as_str()))?);
            for child in index.session_child_ids(&id)? {
                queue.push_back(child);
            }
        }
        events.sort_by(|a, b| (a.ts, a.seq).cmp(&(b.ts, b.seq)));
        Ok(events)
    }
}
