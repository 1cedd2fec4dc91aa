//! ID generation and parsing for records, sessions, and events.

use crate::types::Kind;
use chrono::{DateTime, Utc};
use rand::Rng;
use sha2::{Digest, Sha256};

/// 10 hex chars of SHA256(seed material + random).
/// 40 bits = ~1 trillion values.
fn hash_body(seed: &str, ts: DateTime<Utc>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(seed.as_bytes());
    hasher.update(ts.timestamp_nanos_opt().unwrap_or(0).to_le_bytes());
    // 8 bytes of randomness to prevent collisions
    hasher.update(rand::rng().random::<[u8; 8]>());
    let hash = hasher.finalize();
    format!(
        "{:010x}",
        u64::from_be_bytes([hash[0], hash[1], hash[2], hash[3], hash[4], 0, 0, 0]) >> 24
    )
}

/// Generate a record id: kind prefix + "-" + 10 hex chars.
pub fn generate_node_id(kind: Kind, title: &str, created_at: DateTime<Utc>) -> String {
    format!("{}-{}", kind.as_str(), hash_body(title, created_at))
}

/// Generate a session id: "session-" + 10 hex chars.
pub fn generate_session_id(agent: &str, started_at: DateTime<Utc>) -> String {
    format!("session-{}", hash_body(agent, started_at))
}

/// Generate an event id: "evt-" + 10 hex chars.
pub fn generate_event_id(subject: &str, ts: DateTime<Utc>) -> String {
    format!("evt-{}", hash_body(subject, ts))
}

/// Build a sub-item id under a parent record.
pub fn sub_id(parent: &str, n: u64) -> String {
    format!("{}.{}", parent, n)
}

/// Parse the kind prefix of a record id.
///
/// Accepts canonical ids ("task-74a2b09c1d") and sub-item ids
/// ("task-74a2b09c1d.1.2"). Returns None for unknown prefixes or
/// malformed bodies.
pub fn node_kind(id: &str) -> Option<Kind> {
    let (prefix, rest) = id.split_once('-')?;
    let kind = Kind::parse(prefix)?;
    let mut parts = rest.split('.');
    let body = parts.next()?;
    if body.len() != 10 || !body.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    for part in parts {
        if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
    }
    Some(kind)
}

/// True for ids of session documents.
pub fn is_session_id(id: &str) -> bool {
    id.strip_prefix("session-")
        .is_some_and(|body| body.len() == 10 && body.bytes().all(|b| b.is_ascii_hexdigit()))
}
