//! Storage backend interface.
//!
//! The front-end owns no persistence of its own: every data operation is
//! delegated through this trait. Filter evaluation and planning are backend
//! concerns; the handler only routes. SQL adapters live out of tree; the
//! bundled [`memory::MemoryStore`] backs the test suite and development.

pub mod memory;

use async_trait::async_trait;

use crate::conn::Scope;
use crate::cursor::DocStream;
use crate::error::{CommandError, ErrorCode};
use crate::types::{Document, ObjectId, Value};

/// Give a document an `_id` in first position before it reaches any backend.
/// Every insert path runs through this, whatever the backend.
pub fn ensure_id(doc: &mut Document) {
    if !doc.contains_key("_id") {
        doc.insert_front("_id", Value::ObjectId(ObjectId::new()));
    }
}

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("namespace {0} already exists")]
    NamespaceExists(String),

    #[error("namespace {0} not found")]
    NamespaceNotFound(String),

    #[error("write conflict")]
    WriteConflict,

    #[error("duplicate _id value")]
    DuplicateKey,

    #[error("operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Internal(String),
}

impl StoreError {
    /// Map onto the wire taxonomy. Backend-specific text never reaches the
    /// client unfiltered.
    pub fn to_command_error(&self) -> CommandError {
        match self {
            StoreError::NamespaceExists(ns) => CommandError::new(
                ErrorCode::NamespaceExists,
                format!("Collection {ns} already exists."),
            ),
            StoreError::NamespaceNotFound(ns) => CommandError::new(
                ErrorCode::NamespaceNotFound,
                format!("ns not found: {ns}"),
            ),
            StoreError::WriteConflict => {
                CommandError::new(ErrorCode::WriteConflict, "write conflict")
            }
            StoreError::DuplicateKey => {
                CommandError::new(ErrorCode::DuplicateKey, "E11000 duplicate key error")
            }
            StoreError::Cancelled | StoreError::Internal(_) => {
                CommandError::internal("backend operation failed")
            }
        }
    }

    /// True for "database/collection gone" errors the maintenance loop may
    /// swallow.
    pub fn is_namespace_gone(&self) -> bool {
        matches!(self, StoreError::NamespaceNotFound(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CreateOptions {
    pub capped: bool,
    pub max_size_bytes: Option<i64>,
    pub max_documents: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CollectionInfo {
    pub name: String,
    pub options: CreateOptions,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectionStats {
    pub count: i64,
    pub size_bytes: i64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateResult {
    pub matched: i64,
    pub modified: i64,
    pub upserted_id: Option<crate::types::Value>,
}

/// The pluggable storage backend. Implementations must be safe for
/// concurrent callers and must observe the scope's cancellation promptly.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn list_databases(&self, scope: &Scope) -> StoreResult<Vec<String>>;

    async fn list_collections(&self, scope: &Scope, db: &str) -> StoreResult<Vec<CollectionInfo>>;

    /// Explicit creation; fails with `NamespaceExists` when present.
    async fn create_collection(
        &self,
        scope: &Scope,
        db: &str,
        coll: &str,
        options: CreateOptions,
    ) -> StoreResult<()>;

    /// Returns false when the collection did not exist.
    async fn drop_collection(&self, scope: &Scope, db: &str, coll: &str) -> StoreResult<bool>;

    async fn drop_database(&self, scope: &Scope, db: &str) -> StoreResult<bool>;

    /// Insert creates the namespace implicitly, as the wire protocol
    /// requires.
    async fn insert(
        &self,
        scope: &Scope,
        db: &str,
        coll: &str,
        docs: Vec<Document>,
    ) -> StoreResult<u64>;

    /// Missing namespaces yield an empty stream, not an error.
    async fn find(
        &self,
        scope: &Scope,
        db: &str,
        coll: &str,
        filter: Document,
    ) -> StoreResult<DocStream>;

    /// A missing namespace reports zero matched and leaves the catalog
    /// untouched unless `upsert` forces a write.
    async fn update(
        &self,
        scope: &Scope,
        db: &str,
        coll: &str,
        filter: Document,
        update: Document,
        multi: bool,
        upsert: bool,
    ) -> StoreResult<UpdateResult>;

    async fn delete(
        &self,
        scope: &Scope,
        db: &str,
        coll: &str,
        filter: Document,
        multi: bool,
    ) -> StoreResult<u64>;

    async fn count(&self, scope: &Scope, db: &str, coll: &str, filter: Document)
    -> StoreResult<i64>;

    async fn collection_stats(
        &self,
        scope: &Scope,
        db: &str,
        coll: &str,
    ) -> StoreResult<CollectionStats>;

    /// Remove the `n` oldest documents in insertion order; used by the
    /// capped-collection maintenance loop.
    async fn delete_oldest(&self, scope: &Scope, db: &str, coll: &str, n: u64)
    -> StoreResult<u64>;

    /// Compaction hint; backends without one treat it as a no-op.
    async fn compact(&self, scope: &Scope, db: &str, coll: &str) -> StoreResult<()>;
}
