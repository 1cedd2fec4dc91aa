//! Cairn: a file-first work graph for multi-agent orchestration.
//!
//! Records live as pretty-printed JSON documents under a store root,
//! one file per record. A SQLite index derived from those documents
//! accelerates queries and is rebuilt whenever it disagrees with the
//! files; the documents are always the authority. Multiple agent
//! processes share one store safely through atomic renames, per-record
//! lock files, and claim leases.
//!
//! # Example
//!
//! ```no_run
//! use cairn::{Context, Kind, NewNode, Relation, Store};
//! use std::path::Path;
//!
//! // Initialize a new store
//! let store = Store::init(Path::new(".")).unwrap();
//! let ctx = Context::new("agent-a");
//!
//! // Create records
//! let parser = store.create(&ctx, NewNode::new(Kind::Task, "Extract the parser")).unwrap();
//! let port = store.create(&ctx, NewNode::new(Kind::Task, "Port the CLI")).unwrap();
//!
//! // The port can only start once the parser is done
//! store.link(&ctx, &port.id, Relation::DependsOn, &parser.id, None).unwrap();
//!
//! // Query ready work
//! let ready = store.ready().unwrap();
//! assert_eq!(ready.len(), 1);
//! assert_eq!(ready[0].id, parser.id);
//!
//! // Work it
//! store.start(&ctx, &parser.id).unwrap();
//! store.complete(&ctx, &parser.id).unwrap();
//! assert_eq!(store.ready().unwrap()[0].id, port.id);
//! ```

mod batch;
mod config;
mod document;
mod error;
mod events;
mod fsio;
mod graph;
mod id;
mod index;
mod query;
mod storage;
mod store;
mod types;

// Re-export public API
pub use batch::{BatchFailure, BatchOutcome, StoreBatchExt};
pub use config::StoreConfig;
pub use error::StoreError;
pub use events::{DelegationLink, EventFilter, StoreEventExt};
pub use graph::GraphSnapshot;
pub use query::{
    Condition, Direction, Field, OrderField, Query, QuerySnapshot, StoreQueryExt, Term,
};
pub use storage::{Discrepancy, ReindexReport};
pub use store::Store;
pub use types::{
    Context, Edge, Event, EventKind, Kind, NewNode, Node, NodeUpdate, Relation, Session,
    SessionStatus, Status, Step, ValidationError,
};
