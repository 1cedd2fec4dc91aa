//! Condition-tree queries compiled to a single SELECT over the index.
//!
//! A query runs against the `nodes` projection and materializes matching
//! ids at issuance. The resulting [`QuerySnapshot`] is a point-in-time
//! sequence: later mutations do not disturb it, and it can be iterated
//! any number of times.

use crate::error::StoreError;
use crate::store::Store;
use crate::types::{Kind, Status};
use chrono::{DateTime, Utc};

/// A queryable column of the record projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Kind,
    Status,
    Priority,
    ClaimedBy,
    ClaimingSession,
    Created,
    Updated,
}

impl Field {
    /// Parse an external field spelling.
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "kind" | "type" => Ok(Field::Kind),
            "status" => Ok(Field::Status),
            "priority" => Ok(Field::Priority),
            "claimed_by" | "agent" => Ok(Field::ClaimedBy),
            "session" => Ok(Field::ClaimingSession),
            "created" => Ok(Field::Created),
            "updated" => Ok(Field::Updated),
            _ => Err(StoreError::InvalidQuery(format!("unknown field '{}'", s))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Field::Kind => "kind",
            Field::Status => "status",
            Field::Priority => "priority",
            Field::ClaimedBy => "claimed_by",
            Field::ClaimingSession => "session",
            Field::Created => "created",
            Field::Updated => "updated",
        }
    }

    fn column(&self) -> &'static str {
        match self {
            Field::Kind => "kind",
            Field::Status => "status",
            Field::Priority => "priority",
            Field::ClaimedBy => "claimed_by",
            Field::ClaimingSession => "claiming_session",
            Field::Created => "created_at",
            Field::Updated => "updated_at",
        }
    }
}

/// A literal compared against a field.
#[derive(Debug, Clone, PartialEq)]
pub enum Term {
    Str(String),
    Int(i64),
    Time(DateTime<Utc>),
}

impl From<&str> for Term {
    fn from(s: &str) -> Self {
        Term::Str(s.to_string())
    }
}

impl From<String> for Term {
    fn from(s: String) -> Self {
        Term::Str(s)
    }
}

impl From<i64> for Term {
    fn from(i: i64) -> Self {
        Term::Int(i)
    }
}

impl From<DateTime<Utc>> for Term {
    fn from(t: DateTime<Utc>) -> Self {
        Term::Time(t)
    }
}

/// A composable condition tree.
///
/// `All([])` matches everything; `Any([])` and an empty `In` match
/// nothing. Term types must agree with the field they test.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Eq(Field, Term),
    In(Field, Vec<Term>),
    Range {
        field: Field,
        min: Option<Term>,
        max: Option<Term>,
    },
    All(Vec<Condition>),
    Any(Vec<Condition>),
}

/// Sort key for query results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderField {
    Created,
    Updated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

/// A query over records, compiled on execution.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    condition: Condition,
    order_by: Option<(OrderField, Direction)>,
    limit: Option<usize>,
}

impl Query {
    pub fn new(condition: Condition) -> Self {
        Self {
            condition,
            order_by: None,
            limit: None,
        }
    }

    pub fn order_by(mut self, field: OrderField, direction: Direction) -> Self {
        self.order_by = Some((field, direction));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Compile to one parameterized SELECT returning ids.
    pub(crate) fn to_sql(&self) -> Result<(String, Vec<rusqlite::types::Value>), StoreError> {
        let mut clause = String::new();
        let mut bound = Vec::new();
        compile(&self.condition, &mut clause, &mut bound)?;

        let mut sql = format!("SELECT id FROM nodes WHERE {}", clause);
        match self.order_by {
            Some((field, direction)) => {
                let column = match field {
                    OrderField::Created => "created_at",
                    OrderField::Updated => "updated_at",
                };
                let dir = match direction {
                    Direction::Asc => "ASC",
                    Direction::Desc => "DESC",
                };
                sql.push_str(&format!(" ORDER BY {} {}, id ASC", column, dir));
            }
            // Same default order as list(), so results are deterministic
            None => sql.push_str(" ORDER BY priority ASC, created_at ASC, id ASC"),
        }
        if let Some(limit) = self.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }
        Ok((sql, bound))
    }
}

fn compile(
    condition: &Condition,
    sql: &mut String,
    bound: &mut Vec<rusqlite::types::Value>,
) -> Result<(), StoreError> {
    match condition {
        Condition::Eq(field, term) => {
            sql.push_str(field.column());
            sql.push_str(" = ?");
            bound.push(bind_term(*field, term)?);
        }
        Condition::In(field, terms) => {
            if terms.is_empty() {
                sql.push_str("1 = 0");
                return Ok(());
            }
            sql.push_str(field.column());
            sql.push_str(" IN (");
            for (i, term) in terms.iter().enumerate() {
                if i > 0 {
                    sql.push_str(", ");
                }
                sql.push('?');
                bound.push(bind_term(*field, term)?);
            }
            sql.push(')');
        }
        Condition::Range { field, min, max } => {
            if !matches!(field, Field::Priority | Field::Created | Field::Updated) {
                return Err(StoreError::InvalidQuery(format!(
                    "field '{}' does not support range terms",
                    field.as_str()
                )));
            }
            if min.is_none() && max.is_none() {
                return Err(StoreError::InvalidQuery(
                    "range with neither bound".to_string(),
                ));
            }
            sql.push('(');
            if let Some(min) = min {
                sql.push_str(field.column());
                sql.push_str(" >= ?");
                bound.push(bind_term(*field, min)?);
            }
            if let Some(max) = max {
                if min.is_some() {
                    sql.push_str(" AND ");
                }
                sql.push_str(field.column());
                sql.push_str(" <= ?");
                bound.push(bind_term(*field, max)?);
            }
            sql.push(')');
        }
        Condition::All(conditions) => {
            if conditions.is_empty() {
                sql.push_str("1 = 1");
                return Ok(());
            }
            sql.push('(');
            for (i, condition) in conditions.iter().enumerate() {
                if i > 0 {
                    sql.push_str(" AND ");
                }
                compile(condition, sql, bound)?;
            }
            sql.push(')');
        }
        Condition::Any(conditions) => {
            if conditions.is_empty() {
                sql.push_str("1 = 0");
                return Ok(());
            }
            sql.push('(');
            for (i, condition) in conditions.iter().enumerate() {
                if i > 0 {
                    sql.push_str(" OR ");
                }
                compile(condition, sql, bound)?;
            }
            sql.push(')');
        }
    }
    Ok(())
}

/// Type-check a term against its field and produce the bound value.
fn bind_term(field: Field, term: &Term) -> Result<rusqlite::types::Value, StoreError> {
    match (field, term) {
        (Field::Kind, Term::Str(s)) => {
            if Kind::parse(s).is_none() {
                return Err(StoreError::InvalidQuery(format!("unknown kind '{}'", s)));
            }
            Ok(s.clone().into())
        }
        (Field::Status, Term::Str(s)) => {
            if Status::parse(s).is_none() {
                return Err(StoreError::InvalidQuery(format!("unknown status '{}'", s)));
            }
            Ok(s.clone().into())
        }
        (Field::Priority, Term::Int(i)) => Ok((*i).into()),
        (Field::ClaimedBy | Field::ClaimingSession, Term::Str(s)) => Ok(s.clone().into()),
        (Field::Created | Field::Updated, Term::Time(t)) => Ok(t.to_rfc3339().into()),
        (field, term) => Err(StoreError::InvalidQuery(format!(
            "term {:?} does not match field '{}'",
            term,
            field.as_str()
        ))),
    }
}

/// Materialized query result: ids frozen at issuance.
#[derive(Debug, Clone, PartialEq)]
pub struct QuerySnapshot {
    ids: Vec<String>,
    taken_at: DateTime<Utc>,
}

impl QuerySnapshot {
    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    /// Restartable iteration; call as often as needed.
    pub fn iter(&self) -> std::slice::Iter<'_, String> {
        self.ids.iter()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// When the snapshot was materialized.
    pub fn taken_at(&self) -> DateTime<Utc> {
        self.taken_at
    }
}

impl<'a> IntoIterator for &'a QuerySnapshot {
    type Item = &'a String;
    type IntoIter = std::slice::Iter<'a, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.ids.iter()
    }
}

/// Query execution on a store handle.
pub trait StoreQueryExt {
    /// Run a query, materializing matching ids.
    fn query(&self, query: Query) -> Result<QuerySnapshot, StoreError>;
}

impl StoreQueryExt for Store {
    fn query(&self, query: Query) -> Result<QuerySnapshot, StoreError> {
        let (sql, bound) = query.to_sql()?;
        let ids = self.storage().index_fresh()?.select_ids(&sql, bound)?;
        Ok(QuerySnapshot {
            ids,
            taken_at: Utc::now(),
        })
    }
}
