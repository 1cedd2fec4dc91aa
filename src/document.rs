//! Record documents: pretty-JSON encoding with tolerant decoding.
//!
//! Documents are the authoritative representation. Encoding is strict and
//! stable (field order follows the struct, extension fields last); decoding
//! tolerates hand-edited files by defaulting missing optional fields. Only
//! a missing or unparseable identity makes a document corrupt.

use crate::error::StoreError;
use crate::id;
use crate::types::{Kind, Node, Session};

fn corrupt(origin: &str, reason: impl ToString) -> StoreError {
    StoreError::CorruptRecord {
        id: origin.to_string(),
        reason: reason.to_string(),
    }
}

/// Encode a record as a pretty-printed JSON document.
pub fn to_document(node: &Node) -> Result<String, StoreError> {
    let mut text = serde_json::to_string_pretty(node).map_err(|e| corrupt(&node.id, e))?;
    text.push('\n');
    Ok(text)
}

/// Decode a record document.
///
/// `origin` names the source (path or id) in errors. The id prefix is
/// authoritative for the kind: an absent `kind` field is derived from it,
/// an explicit one that disagrees is corrupt.
pub fn from_document(origin: &str, text: &str) -> Result<Node, StoreError> {
    let value: serde_json::Value = serde_json::from_str(text).map_err(|e| corrupt(origin, e))?;

    let kind = {
        let obj = value
            .as_object()
            .ok_or_else(|| corrupt(origin, "document is not a JSON object"))?;
        let id = obj.get("id").and_then(|v| v.as_str()).unwrap_or("");
        if id.is_empty() {
            return Err(corrupt(origin, "missing id"));
        }
        let kind = id::node_kind(id)
            .ok_or_else(|| corrupt(origin, format!("unparseable id '{}'", id)))?;
        if let Some(explicit) = obj.get("kind")
            && !explicit
                .as_str()
                .is_some_and(|s| Kind::parse(s) == Some(kind))
        {
            return Err(corrupt(
                origin,
                format!("kind field disagrees with id prefix '{}'", kind.as_str()),
            ));
        }
        kind
    };

    let mut node: Node = serde_json::from_value(value).map_err(|e| corrupt(origin, e))?;
    node.kind = kind;
    Ok(node)
}

/// Encode a session as a pretty-printed JSON document.
pub fn session_to_document(session: &Session) -> Result<String, StoreError> {
    let mut text =
        serde_json::to_string_pretty(session).map_err(|e| corrupt(&session.id, e))?;
    text.push('\n');
    Ok(text)
}

/// Decode a session document.
pub fn session_from_document(origin: &str, text: &str) -> Result<Session, StoreError> {
    let session: Session = serde_json::from_str(text).map_err(|e| corrupt(origin, e))?;
    if !id::is_session_id(&session.id) {
        return Err(corrupt(
            origin,
            format!("unparseable session id '{}'", session.id),
        ));
    }
    Ok(session)
}
