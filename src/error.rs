//! Error taxonomy for store operations.

use crate::types::{Status, ValidationError};

/// Errors surfaced by store operations.
///
/// Read lookups never produce `NotFound`; absence is `Ok(None)`. Mutating
/// operations return typed variants that callers are expected to match on.
/// `Busy` is the only variant a caller should retry automatically.
#[derive(Debug)]
pub enum StoreError {
    /// A mutation referenced a record that does not exist.
    NotFound(String),
    /// Lost a claim race: another agent holds a live claim on the record.
    ClaimConflict { id: String, holder: String },
    /// The agent is already at its in-progress limit for this record kind.
    WipLimitExceeded { agent: String, kind: String, limit: usize },
    /// Illegal state-machine move.
    InvalidTransition { id: String, from: Status, to: Status },
    /// A stored document could not be decoded.
    CorruptRecord { id: String, reason: String },
    /// Lock or index contention outlasted the bounded wait. Retryable.
    Busy(String),
    /// The atomic write could not be committed. Prior state is untouched.
    WriteFailed(std::io::Error),
    /// A query referenced an unknown field or mistyped a term.
    InvalidQuery(String),
    /// A record failed field validation.
    Validation(ValidationError),
    /// Underlying filesystem error outside the atomic write path.
    Io(std::io::Error),
    /// Underlying index database error.
    Sql(rusqlite::Error),
}

impl StoreError {
    /// True only for transient contention errors worth retrying with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Busy(_))
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::NotFound(id) => write!(f, "record not found: {}", id),
            StoreError::ClaimConflict { id, holder } => {
                write!(f, "record {} is claimed by {}", id, holder)
            }
            StoreError::WipLimitExceeded { agent, kind, limit } => {
                write!(
                    f,
                    "agent {} already has {} in-progress {} records",
                    agent, limit, kind
                )
            }
            StoreError::InvalidTransition { id, from, to } => {
                write!(
                    f,
                    "record {}: invalid transition {} -> {}",
                    id,
                    from.as_str(),
                    to.as_str()
                )
            }
            StoreError::CorruptRecord { id, reason } => {
                write!(f, "corrupt record {}: {}", id, reason)
            }
            StoreError::Busy(what) => write!(f, "busy: {}", what),
            StoreError::WriteFailed(e) => write!(f, "write failed: {}", e),
            StoreError::InvalidQuery(reason) => write!(f, "invalid query: {}", reason),
            StoreError::Validation(e) => write!(f, "validation error: {}", e),
            StoreError::Io(e) => write!(f, "io error: {}", e),
            StoreError::Sql(e) => write!(f, "index error: {}", e),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::WriteFailed(e) | StoreError::Io(e) => Some(e),
            StoreError::Sql(e) => Some(e),
            StoreError::Validation(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e)
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        // SQLite contention surfaces as Busy so callers can retry with backoff.
        if let rusqlite::Error::SqliteFailure(ffi, _) = &e
            && matches!(
                ffi.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            )
        {
            return StoreError::Busy("index database".to_string());
        }
        StoreError::Sql(e)
    }
}

impl From<ValidationError> for StoreError {
    fn from(e: ValidationError) -> Self {
        StoreError::Validation(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_busy_is_retryable() {
        assert!(StoreError::Busy("lock".to_string()).is_retryable());
        assert!(!StoreError::NotFound("task-0000000000".to_string()).is_retryable());
        assert!(
            !StoreError::ClaimConflict {
                id: "task-0000000000".to_string(),
                holder: "agent-a".to_string(),
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_display_names_the_record() {
        let e = StoreError::ClaimConflict {
            id: "feat-1234567890".to_string(),
            holder: "agent-b".to_string(),
        };
        let msg = e.to_string();
        assert!(msg.contains("feat-1234567890"));
        assert!(msg.contains("agent-b"));
    }

    #[test]
    fn test_busy_from_sqlite_busy_code() {
        let ffi = rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY);
        let e: StoreError = rusqlite::Error::SqliteFailure(ffi, None).into();
        assert!(matches!(e, StoreError::Busy(_)));
    }
}
