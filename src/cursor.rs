//! Process-wide registry of server-side cursors.
//!
//! A cursor is exclusively owned by its registry entry; command handlers hold
//! non-owning `Arc` references. Ids are random nonzero u64s and are never
//! reused for the lifetime of a registry.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use futures::stream::BoxStream;
use uuid::Uuid;

use crate::error::{CommandError, Error, Result};
use crate::types::Document;

/// Stream of result documents produced by a backend query. A cursor has at
/// most one consumer task at a time.
pub type DocStream = BoxStream<'static, Result<Document>>;

pub struct CursorEntry {
    pub id: u64,
    pub db: String,
    pub collection: String,
    pub owner: Option<Uuid>,
    stream: tokio::sync::Mutex<Option<DocStream>>,
    closed: AtomicBool,
}

impl CursorEntry {
    /// Pull the next document; `None` once the stream is drained or closed.
    pub async fn next(&self) -> Option<Result<Document>> {
        if self.closed.load(Ordering::Acquire) {
            return None;
        }
        let mut guard = self.stream.lock().await;
        match guard.as_mut() {
            Some(stream) => stream.next().await,
            None => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close the underlying stream. The swap guarantees the stream is dropped
    /// exactly once even under concurrent callers.
    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.stream.lock().await.take();
    }
}

impl std::fmt::Debug for CursorEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CursorEntry")
            .field("id", &self.id)
            .field("db", &self.db)
            .field("collection", &self.collection)
            .field("owner", &self.owner)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

pub struct CursorRegistry {
    entries: Mutex<Entries>,
    shut_down: AtomicBool,
    total_allocated: AtomicU64,
}

struct Entries {
    live: HashMap<u64, Arc<CursorEntry>>,
    // Every id ever handed out; reuse within a registry lifetime is forbidden.
    allocated: HashSet<u64>,
}

impl CursorRegistry {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Entries {
                live: HashMap::new(),
                allocated: HashSet::new(),
            }),
            shut_down: AtomicBool::new(false),
            total_allocated: AtomicU64::new(0),
        }
    }

    /// Store a new cursor and return its fresh id.
    pub fn register(
        &self,
        db: impl Into<String>,
        collection: impl Into<String>,
        owner: Option<Uuid>,
        stream: DocStream,
    ) -> Result<Arc<CursorEntry>> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(CommandError::internal("cursor registry is shut down").into());
        }
        let mut entries = self.entries.lock().expect("cursor registry poisoned");
        let id = loop {
            let candidate: u64 = rand::random();
            if candidate != 0 && !entries.allocated.contains(&candidate) {
                break candidate;
            }
        };
        entries.allocated.insert(id);
        let entry = Arc::new(CursorEntry {
            id,
            db: db.into(),
            collection: collection.into(),
            owner,
            stream: tokio::sync::Mutex::new(Some(stream)),
            closed: AtomicBool::new(false),
        });
        entries.live.insert(id, entry.clone());
        self.total_allocated.fetch_add(1, Ordering::Relaxed);
        Ok(entry)
    }

    pub fn get(&self, id: u64) -> Option<Arc<CursorEntry>> {
        let entries = self.entries.lock().expect("cursor registry poisoned");
        entries.live.get(&id).filter(|e| !e.is_closed()).cloned()
    }

    /// Point-in-time snapshot of the live entries. The registry lock is not
    /// held while the caller iterates.
    pub fn all(&self) -> Vec<Arc<CursorEntry>> {
        let entries = self.entries.lock().expect("cursor registry poisoned");
        entries.live.values().cloned().collect()
    }

    /// Close the entry's stream and unlink it. Idempotent.
    pub async fn close_and_remove(&self, entry: &CursorEntry) {
        entry.close().await;
        let mut entries = self.entries.lock().expect("cursor registry poisoned");
        entries.live.remove(&entry.id);
    }

    /// Close and remove every cursor owned by `owner` (connection teardown).
    pub async fn close_owned(&self, owner: Uuid) {
        for entry in self.all() {
            if entry.owner == Some(owner) {
                self.close_and_remove(&entry).await;
            }
        }
    }

    /// Close every live entry and reject registration from now on.
    pub async fn close(&self) {
        self.shut_down.store(true, Ordering::Release);
        for entry in self.all() {
            self.close_and_remove(&entry).await;
        }
    }

    pub fn live_count(&self) -> usize {
        self.entries
            .lock()
            .expect("cursor registry poisoned")
            .live
            .len()
    }

    pub fn total_allocations(&self) -> u64 {
        self.total_allocated.load(Ordering::Relaxed)
    }
}

impl Default for CursorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Wrap an in-memory batch of documents as a cursor stream.
pub fn stream_from_batch(docs: Vec<Document>) -> DocStream {
    futures::stream::iter(docs.into_iter().map(Ok)).boxed()
}
