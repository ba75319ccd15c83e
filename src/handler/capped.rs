//! Background maintenance for capped collections.
//!
//! A single task per handler wakes on the configured interval, walks every
//! capped collection, and trims the oldest documents once a size or count
//! limit is exceeded. "Namespace gone" races with drops are swallowed; other
//! errors are logged and the loop carries on at the next tick.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::conn::{ConnInfo, Scope};
use crate::cursor::CursorRegistry;
use crate::store::{Backend, CollectionInfo, StoreError, StoreResult};

pub(crate) fn spawn_cleanup_loop(
    backend: Arc<dyn Backend>,
    cursors: Arc<CursorRegistry>,
    interval: Duration,
    percentage: u8,
    mut stop_rx: oneshot::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        // Maintenance runs with an auth-bypass identity.
        let scope = Scope::background()
            .with_conn(Arc::new(ConnInfo::internal()))
            .with_cursors(cursors);

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick of `interval` fires immediately; consume it so the
        // first pass happens a full interval after startup.
        ticker.tick().await;

        tracing::debug!(interval_secs = interval.as_secs(), percentage, "capped cleanup loop running");
        loop {
            tokio::select! {
                _ = &mut stop_rx => {
                    tracing::debug!("capped cleanup loop stopping");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(error) = run_cleanup_pass(backend.as_ref(), &scope, percentage).await {
                        tracing::warn!(%error, "capped cleanup pass failed");
                    }
                }
            }
        }
    })
}

/// One full pass over every database. Public so tests can drive a pass
/// without waiting for the ticker.
pub async fn run_cleanup_pass(
    backend: &dyn Backend,
    scope: &Scope,
    percentage: u8,
) -> StoreResult<()> {
    for db in backend.list_databases(scope).await? {
        let collections = match backend.list_collections(scope, &db).await {
            Ok(collections) => collections,
            Err(error) if error.is_namespace_gone() => continue,
            Err(error) => {
                tracing::warn!(db = %db, %error, "listing collections failed");
                continue;
            }
        };
        for info in collections.into_iter().filter(|c| c.options.capped) {
            match cleanup_collection(backend, scope, &db, &info, percentage).await {
                Ok(()) => {}
                // The collection vanished between listing and trimming.
                Err(error) if error.is_namespace_gone() => continue,
                Err(error) => {
                    tracing::warn!(db = %db, coll = %info.name, %error, "capped cleanup failed");
                }
            }
        }
    }
    Ok(())
}

async fn cleanup_collection(
    backend: &dyn Backend,
    scope: &Scope,
    db: &str,
    info: &CollectionInfo,
    percentage: u8,
) -> StoreResult<()> {
    let stats = backend.collection_stats(scope, db, &info.name).await?;
    let over_count = info
        .options
        .max_documents
        .is_some_and(|max| stats.count > max);
    let over_size = info
        .options
        .max_size_bytes
        .is_some_and(|max| stats.size_bytes > max);
    if !over_count && !over_size {
        return Ok(());
    }

    let n = stats.count as u64 * percentage as u64 / 100;
    if n == 0 {
        return Ok(());
    }
    let deleted = backend.delete_oldest(scope, db, &info.name, n).await?;
    tracing::info!(db = %db, coll = %info.name, deleted, "capped collection trimmed");
    backend.compact(scope, db, &info.name).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::DocStream;
    use crate::doc;
    use crate::store::memory::MemoryStore;
    use crate::store::{CollectionStats, CreateOptions, UpdateResult};
    use crate::types::Document;
    use async_trait::async_trait;

    fn scope() -> Scope {
        Scope::background().with_conn(Arc::new(ConnInfo::internal()))
    }

    async fn seed_capped(store: &MemoryStore, s: &Scope, coll: &str, docs: i32, max: i64) {
        store
            .create_collection(
                s,
                "app",
                coll,
                CreateOptions {
                    capped: true,
                    max_size_bytes: None,
                    max_documents: Some(max),
                },
            )
            .await
            .unwrap();
        let docs: Vec<Document> = (0..docs).map(|i| doc! {"_id": i}).collect();
        store.insert(s, "app", coll, docs).await.unwrap();
    }

    #[tokio::test]
    async fn test_ten_percent_of_one_hundred_is_ten() {
        let store = MemoryStore::new();
        let s = scope();
        seed_capped(&store, &s, "log", 100, 50).await;
        let before = store.collection_stats(&s, "app", "log").await.unwrap();

        run_cleanup_pass(&store, &s, 10).await.unwrap();

        let after = store.collection_stats(&s, "app", "log").await.unwrap();
        assert_eq!(after.count, 90);
        assert!(after.size_bytes <= before.size_bytes);
        // FIFO: the oldest ten are gone.
        assert_eq!(store.count(&s, "app", "log", doc! {"_id": doc! {"$lt": 10i32}}).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_under_limit_collections_untouched() {
        let store = MemoryStore::new();
        let s = scope();
        seed_capped(&store, &s, "log", 40, 50).await;
        run_cleanup_pass(&store, &s, 10).await.unwrap();
        assert_eq!(
            store.collection_stats(&s, "app", "log").await.unwrap().count,
            40
        );
    }

    #[tokio::test]
    async fn test_uncapped_collections_ignored() {
        let store = MemoryStore::new();
        let s = scope();
        let docs: Vec<Document> = (0..100).map(|i| doc! {"_id": i}).collect();
        store.insert(&s, "app", "plain", docs).await.unwrap();
        run_cleanup_pass(&store, &s, 50).await.unwrap();
        assert_eq!(store.count(&s, "app", "plain", doc! {}).await.unwrap(), 100);
    }

    // Backend whose stats call reports a vanished namespace for one
    // collection, simulating a drop racing the cleanup pass.
    struct VanishingStats {
        inner: MemoryStore,
        vanished: String,
    }

    #[async_trait]
    impl Backend for VanishingStats {
        async fn list_databases(&self, scope: &Scope) -> StoreResult<Vec<String>> {
            self.inner.list_databases(scope).await
        }
        async fn list_collections(
            &self,
            scope: &Scope,
            db: &str,
        ) -> StoreResult<Vec<CollectionInfo>> {
            self.inner.list_collections(scope, db).await
        }
        async fn create_collection(
            &self,
            scope: &Scope,
            db: &str,
            coll: &str,
            options: CreateOptions,
        ) -> StoreResult<()> {
            self.inner.create_collection(scope, db, coll, options).await
        }
        async fn drop_collection(&self, scope: &Scope, db: &str, coll: &str) -> StoreResult<bool> {
            self.inner.drop_collection(scope, db, coll).await
        }
        async fn drop_database(&self, scope: &Scope, db: &str) -> StoreResult<bool> {
            self.inner.drop_database(scope, db).await
        }
        async fn insert(
            &self,
            scope: &Scope,
            db: &str,
            coll: &str,
            docs: Vec<Document>,
        ) -> StoreResult<u64> {
            self.inner.insert(scope, db, coll, docs).await
        }
        async fn find(
            &self,
            scope: &Scope,
            db: &str,
            coll: &str,
            filter: Document,
        ) -> StoreResult<DocStream> {
            self.inner.find(scope, db, coll, filter).await
        }
        async fn update(
            &self,
            scope: &Scope,
            db: &str,
            coll: &str,
            filter: Document,
            update: Document,
            multi: bool,
            upsert: bool,
        ) -> StoreResult<UpdateResult> {
            self.inner
                .update(scope, db, coll, filter, update, multi, upsert)
                .await
        }
        async fn delete(
            &self,
            scope: &Scope,
            db: &str,
            coll: &str,
            filter: Document,
            multi: bool,
        ) -> StoreResult<u64> {
            self.inner.delete(scope, db, coll, filter, multi).await
        }
        async fn count(
            &self,
            scope: &Scope,
            db: &str,
            coll: &str,
            filter: Document,
        ) -> StoreResult<i64> {
            self.inner.count(scope, db, coll, filter).await
        }
        async fn collection_stats(
            &self,
            scope: &Scope,
            db: &str,
            coll: &str,
        ) -> StoreResult<CollectionStats> {
            if coll == self.vanished {
                return Err(StoreError::NamespaceNotFound(format!("{db}.{coll}")));
            }
            self.inner.collection_stats(scope, db, coll).await
        }
        async fn delete_oldest(
            &self,
            scope: &Scope,
            db: &str,
            coll: &str,
            n: u64,
        ) -> StoreResult<u64> {
            self.inner.delete_oldest(scope, db, coll, n).await
        }
        async fn compact(&self, scope: &Scope, db: &str, coll: &str) -> StoreResult<()> {
            self.inner.compact(scope, db, coll).await
        }
    }

    #[tokio::test]
    async fn test_vanished_collection_does_not_stop_the_pass() {
        let store = VanishingStats {
            inner: MemoryStore::new(),
            vanished: "aaa_gone".to_string(),
        };
        let s = scope();
        seed_capped(&store.inner, &s, "aaa_gone", 100, 50).await;
        seed_capped(&store.inner, &s, "bbb_log", 100, 50).await;

        run_cleanup_pass(&store, &s, 10).await.unwrap();

        // The vanished one was skipped, the next one was still trimmed.
        assert_eq!(
            store
                .inner
                .collection_stats(&s, "app", "bbb_log")
                .await
                .unwrap()
                .count,
            90
        );
    }
}
