//! In-memory backend: an ordered catalog of databases and collections kept
//! under an async RwLock. Documents are held in insertion order, which doubles
//! as the FIFO order for capped-collection eviction.

use std::collections::HashSet;

use async_trait::async_trait;
use indexmap::IndexMap;
use tokio::sync::RwLock;

use crate::bson::encode_document;
use crate::conn::Scope;
use crate::cursor::{DocStream, stream_from_batch};
use crate::store::{
    Backend, CollectionInfo, CollectionStats, CreateOptions, StoreError, StoreResult,
    UpdateResult, ensure_id,
};
use crate::types::{Document, Value};

#[derive(Default)]
pub struct MemoryStore {
    catalog: RwLock<IndexMap<String, Database>>,
}

#[derive(Default)]
struct Database {
    collections: IndexMap<String, Collection>,
}

#[derive(Default)]
struct Collection {
    options: CreateOptions,
    docs: Vec<StoredDoc>,
    id_index: HashSet<Vec<u8>>,
}

struct StoredDoc {
    doc: Document,
    size: usize,
    id_key: Option<Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn check_cancelled(scope: &Scope) -> StoreResult<()> {
    if scope.is_cancelled() {
        return Err(StoreError::Cancelled);
    }
    Ok(())
}

fn ns(db: &str, coll: &str) -> String {
    format!("{db}.{coll}")
}

// The _id index keys on the canonical encoding of the value.
fn id_key(doc: &Document) -> Option<Vec<u8>> {
    let id = doc.get("_id")?;
    let mut wrapper = Document::new();
    wrapper.insert("_id", id.clone());
    encode_document(&wrapper).ok()
}

fn doc_size(doc: &Document) -> usize {
    encode_document(doc).map(|b| b.len()).unwrap_or(0)
}

impl Collection {
    fn store(&mut self, doc: Document) -> StoreResult<()> {
        let id_key = id_key(&doc);
        if let Some(key) = &id_key {
            if !self.id_index.insert(key.clone()) {
                return Err(StoreError::DuplicateKey);
            }
        }
        let size = doc_size(&doc);
        self.docs.push(StoredDoc { doc, size, id_key });
        Ok(())
    }

    fn remove_at(&mut self, index: usize) -> StoredDoc {
        let stored = self.docs.remove(index);
        if let Some(key) = &stored.id_key {
            self.id_index.remove(key);
        }
        stored
    }

    fn stats(&self) -> CollectionStats {
        CollectionStats {
            count: self.docs.len() as i64,
            size_bytes: self.docs.iter().map(|d| d.size as i64).sum(),
        }
    }
}

#[async_trait]
impl Backend for MemoryStore {
    async fn list_databases(&self, scope: &Scope) -> StoreResult<Vec<String>> {
        check_cancelled(scope)?;
        let catalog = self.catalog.read().await;
        let mut names: Vec<String> = catalog.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn list_collections(&self, scope: &Scope, db: &str) -> StoreResult<Vec<CollectionInfo>> {
        check_cancelled(scope)?;
        let catalog = self.catalog.read().await;
        let Some(database) = catalog.get(db) else {
            return Ok(Vec::new());
        };
        let mut infos: Vec<CollectionInfo> = database
            .collections
            .iter()
            .map(|(name, coll)| CollectionInfo {
                name: name.clone(),
                options: coll.options.clone(),
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(infos)
    }

    async fn create_collection(
        &self,
        scope: &Scope,
        db: &str,
        coll: &str,
        options: CreateOptions,
    ) -> StoreResult<()> {
        check_cancelled(scope)?;
        let mut catalog = self.catalog.write().await;
        let database = catalog.entry(db.to_string()).or_default();
        if database.collections.contains_key(coll) {
            return Err(StoreError::NamespaceExists(ns(db, coll)));
        }
        database.collections.insert(
            coll.to_string(),
            Collection {
                options,
                ..Collection::default()
            },
        );
        Ok(())
    }

    async fn drop_collection(&self, scope: &Scope, db: &str, coll: &str) -> StoreResult<bool> {
        check_cancelled(scope)?;
        let mut catalog = self.catalog.write().await;
        let Some(database) = catalog.get_mut(db) else {
            return Ok(false);
        };
        Ok(database.collections.shift_remove(coll).is_some())
    }

    async fn drop_database(&self, scope: &Scope, db: &str) -> StoreResult<bool> {
        check_cancelled(scope)?;
        let mut catalog = self.catalog.write().await;
        Ok(catalog.shift_remove(db).is_some())
    }

    async fn insert(
        &self,
        scope: &Scope,
        db: &str,
        coll: &str,
        docs: Vec<Document>,
    ) -> StoreResult<u64> {
        check_cancelled(scope)?;
        let mut catalog = self.catalog.write().await;
        let database = catalog.entry(db.to_string()).or_default();
        let collection = database.collections.entry(coll.to_string()).or_default();
        let mut inserted = 0u64;
        for doc in docs {
            collection.store(doc)?;
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn find(
        &self,
        scope: &Scope,
        db: &str,
        coll: &str,
        filter: Document,
    ) -> StoreResult<DocStream> {
        check_cancelled(scope)?;
        let catalog = self.catalog.read().await;
        let matched: Vec<Document> = catalog
            .get(db)
            .and_then(|database| database.collections.get(coll))
            .map(|collection| {
                collection
                    .docs
                    .iter()
                    .filter(|stored| matches(&stored.doc, &filter))
                    .map(|stored| stored.doc.clone())
                    .collect()
            })
            .unwrap_or_default();
        Ok(stream_from_batch(matched))
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
        check_cancelled(scope)?;
        let mut catalog = self.catalog.write().await;

        let missing = !catalog
            .get(db)
            .is_some_and(|database| database.collections.contains_key(coll));
        if missing {
            // Missing namespaces are not created by plain updates.
            if !upsert {
                return Ok(UpdateResult::default());
            }
            let doc = build_upsert_doc(&filter, &update)?;
            let upserted_id = doc.get("_id").cloned();
            let database = catalog.entry(db.to_string()).or_default();
            let collection = database.collections.entry(coll.to_string()).or_default();
            collection.store(doc)?;
            return Ok(UpdateResult {
                matched: 0,
                modified: 0,
                upserted_id,
            });
        }
        let Some(collection) = catalog
            .get_mut(db)
            .and_then(|database| database.collections.get_mut(coll))
        else {
            return Ok(UpdateResult::default());
        };

        let mut result = UpdateResult::default();
        for stored in collection.docs.iter_mut() {
            if !matches(&stored.doc, &filter) {
                continue;
            }
            result.matched += 1;
            if apply_update(&mut stored.doc, &update)? {
                result.modified += 1;
                stored.size = doc_size(&stored.doc);
            }
            if !multi {
                break;
            }
        }

        if result.matched == 0 && upsert {
            let doc = build_upsert_doc(&filter, &update)?;
            result.upserted_id = doc.get("_id").cloned();
            collection.store(doc)?;
        }
        Ok(result)
    }

    async fn delete(
        &self,
        scope: &Scope,
        db: &str,
        coll: &str,
        filter: Document,
        multi: bool,
    ) -> StoreResult<u64> {
        check_cancelled(scope)?;
        let mut catalog = self.catalog.write().await;
        let Some(collection) = catalog
            .get_mut(db)
            .and_then(|database| database.collections.get_mut(coll))
        else {
            return Ok(0);
        };

        let mut deleted = 0u64;
        let mut index = 0;
        while index < collection.docs.len() {
            if matches(&collection.docs[index].doc, &filter) {
                collection.remove_at(index);
                deleted += 1;
                if !multi {
                    break;
                }
            } else {
                index += 1;
            }
        }
        Ok(deleted)
    }

    async fn count(
        &self,
        scope: &Scope,
        db: &str,
        coll: &str,
        filter: Document,
    ) -> StoreResult<i64> {
        check_cancelled(scope)?;
        let catalog = self.catalog.read().await;
        Ok(catalog
            .get(db)
            .and_then(|database| database.collections.get(coll))
            .map(|collection| {
                collection
                    .docs
                    .iter()
                    .filter(|stored| matches(&stored.doc, &filter))
                    .count() as i64
            })
            .unwrap_or(0))
    }

    async fn collection_stats(
        &self,
        scope: &Scope,
        db: &str,
        coll: &str,
    ) -> StoreResult<CollectionStats> {
        check_cancelled(scope)?;
        let catalog = self.catalog.read().await;
        catalog
            .get(db)
            .and_then(|database| database.collections.get(coll))
            .map(Collection::stats)
            .ok_or_else(|| StoreError::NamespaceNotFound(ns(db, coll)))
    }

    async fn delete_oldest(
        &self,
        scope: &Scope,
        db: &str,
        coll: &str,
        n: u64,
    ) -> StoreResult<u64> {
        check_cancelled(scope)?;
        let mut catalog = self.catalog.write().await;
        let collection = catalog
            .get_mut(db)
            .and_then(|database| database.collections.get_mut(coll))
            .ok_or_else(|| StoreError::NamespaceNotFound(ns(db, coll)))?;
        let mut deleted = 0u64;
        while deleted < n && !collection.docs.is_empty() {
            collection.remove_at(0);
            deleted += 1;
        }
        Ok(deleted)
    }

    async fn compact(&self, scope: &Scope, db: &str, coll: &str) -> StoreResult<()> {
        check_cancelled(scope)?;
        let mut catalog = self.catalog.write().await;
        if let Some(collection) = catalog
            .get_mut(db)
            .and_then(|database| database.collections.get_mut(coll))
        {
            collection.docs.shrink_to_fit();
        }
        Ok(())
    }
}

/// Resolve a dotted path inside a document.
fn get_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut current = doc;
    let mut segments = path.split('.').peekable();
    while let Some(segment) = segments.next() {
        let value = current.get(segment)?;
        if segments.peek().is_none() {
            return Some(value);
        }
        current = value.as_document()?;
    }
    None
}

/// Top-level filter evaluation: every entry must hold. A document value with
/// operator keys is a predicate; anything else is an equality match.
fn matches(doc: &Document, filter: &Document) -> bool {
    filter.iter().all(|(path, expected)| {
        let actual = get_path(doc, path);
        match expected {
            Value::Document(pred) if is_operator_doc(pred) => eval_predicate(actual, pred),
            _ => actual == Some(expected),
        }
    })
}

fn is_operator_doc(doc: &Document) -> bool {
    doc.command_name().is_some_and(|k| k.starts_with('$'))
}

fn eval_predicate(actual: Option<&Value>, pred: &Document) -> bool {
    pred.iter().all(|(op, operand)| match op.as_str() {
        "$eq" => actual == Some(operand),
        "$ne" => actual != Some(operand),
        "$exists" => operand.as_bool().map(|want| want == actual.is_some()).unwrap_or(false),
        "$gt" => compare(actual, operand).is_some_and(|o| o.is_gt()),
        "$gte" => compare(actual, operand).is_some_and(|o| o.is_ge()),
        "$lt" => compare(actual, operand).is_some_and(|o| o.is_lt()),
        "$lte" => compare(actual, operand).is_some_and(|o| o.is_le()),
        "$in" => operand
            .as_array()
            .is_some_and(|candidates| candidates.iter().any(|c| actual == Some(c))),
        _ => false,
    })
}

fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Int32(v) => Some(*v as f64),
        Value::Int64(v) => Some(*v as f64),
        Value::Double(v) => Some(*v),
        _ => None,
    }
}

fn compare(actual: Option<&Value>, operand: &Value) -> Option<std::cmp::Ordering> {
    let actual = actual?;
    if let (Some(a), Some(b)) = (numeric(actual), numeric(operand)) {
        return a.partial_cmp(&b);
    }
    match (actual, operand) {
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::DateTime(a), Value::DateTime(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// Apply an update document: either a replacement or `$set`/`$unset`/`$inc`
/// operators. Returns whether anything changed.
fn apply_update(doc: &mut Document, update: &Document) -> StoreResult<bool> {
    let has_operators = update.keys().any(|k| k.starts_with('$'));
    if !has_operators {
        // Replacement keeps the _id.
        let mut replacement = Document::new();
        if let Some(id) = doc.get("_id") {
            replacement.insert("_id", id.clone());
        }
        for (k, v) in update.iter() {
            if k != "_id" {
                replacement.insert(k.clone(), v.clone());
            }
        }
        let changed = *doc != replacement;
        *doc = replacement;
        return Ok(changed);
    }

    let mut changed = false;
    for (op, operand) in update.iter() {
        let fields = operand.as_document().ok_or_else(|| {
            StoreError::Internal(format!("update operator {op} expects a document"))
        })?;
        match op.as_str() {
            "$set" => {
                for (path, value) in fields.iter() {
                    changed |= set_path(doc, path, value.clone());
                }
            }
            "$unset" => {
                for (path, _) in fields.iter() {
                    changed |= unset_path(doc, path);
                }
            }
            "$inc" => {
                for (path, delta) in fields.iter() {
                    let incremented = increment(get_path(doc, path), delta)?;
                    changed |= set_path(doc, path, incremented);
                }
            }
            other => {
                return Err(StoreError::Internal(format!(
                    "unsupported update operator {other}"
                )));
            }
        }
    }
    Ok(changed)
}

fn set_path(doc: &mut Document, path: &str, value: Value) -> bool {
    match path.split_once('.') {
        None => {
            if doc.get(path) == Some(&value) {
                return false;
            }
            doc.insert(path, value);
            true
        }
        Some((head, rest)) => {
            if !matches!(doc.get(head), Some(Value::Document(_))) {
                doc.insert(head, Value::Document(Document::new()));
            }
            let Some(Value::Document(inner)) = doc.get_mut(head) else {
                return false;
            };
            set_path(inner, rest, value)
        }
    }
}

fn unset_path(doc: &mut Document, path: &str) -> bool {
    match path.split_once('.') {
        None => doc.remove(path).is_some(),
        Some((head, rest)) => match doc.get_mut(head) {
            Some(Value::Document(inner)) => unset_path(inner, rest),
            _ => false,
        },
    }
}

fn increment(current: Option<&Value>, delta: &Value) -> StoreResult<Value> {
    let delta_num = numeric(delta)
        .ok_or_else(|| StoreError::Internal("$inc expects a numeric operand".into()))?;
    Ok(match current {
        None => delta.clone(),
        Some(Value::Int32(v)) if matches!(delta, Value::Int32(_)) => {
            match v.checked_add(delta.as_i32().unwrap_or(0)) {
                Some(sum) => Value::Int32(sum),
                None => Value::Int64(*v as i64 + delta_num as i64),
            }
        }
        Some(Value::Int32(v)) if matches!(delta, Value::Int64(_)) => {
            Value::Int64(*v as i64 + delta.as_i64().unwrap_or(0))
        }
        Some(Value::Int64(v)) if !matches!(delta, Value::Double(_)) => {
            Value::Int64(v + delta_num as i64)
        }
        Some(other) => {
            let base = numeric(other)
                .ok_or_else(|| StoreError::Internal("$inc target is not numeric".into()))?;
            Value::Double(base + delta_num)
        }
    })
}

/// Seed document for an upsert: equality fields from the filter, then the
/// update applied on top.
fn build_upsert_doc(filter: &Document, update: &Document) -> StoreResult<Document> {
    let mut doc = Document::new();
    for (path, value) in filter.iter() {
        let plain = !matches!(value, Value::Document(d) if is_operator_doc(d));
        if plain && !path.contains('.') {
            doc.insert(path.clone(), value.clone());
        }
    }
    apply_update(&mut doc, update)?;
    ensure_id(&mut doc);
    Ok(doc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;

    fn scope() -> Scope {
        Scope::background()
    }

    async fn drain(stream: DocStream) -> Vec<Document> {
        use futures::StreamExt;
        stream
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect()
    }

    #[tokio::test]
    async fn test_insert_find_round_trip() {
        let store = MemoryStore::new();
        let s = scope();
        store
            .insert(
                &s,
                "app",
                "users",
                vec![doc! {"_id": 1i32, "name": "ann"}, doc! {"_id": 2i32, "name": "bob"}],
            )
            .await
            .unwrap();

        let all = drain(store.find(&s, "app", "users", doc! {}).await.unwrap()).await;
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].get_str("name"), Some("ann"));

        let one = drain(
            store
                .find(&s, "app", "users", doc! {"_id": 2i32})
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].get_str("name"), Some("bob"));
    }

    #[tokio::test]
    async fn test_insert_creates_namespace_update_does_not() {
        let store = MemoryStore::new();
        let s = scope();

        let result = store
            .update(&s, "ghost", "none", doc! {}, doc! {"x": 1i32}, true, false)
            .await
            .unwrap();
        assert_eq!(result, UpdateResult::default());
        assert!(store.list_databases(&s).await.unwrap().is_empty());

        assert_eq!(
            store.delete(&s, "ghost", "none", doc! {}, true).await.unwrap(),
            0
        );
        assert!(store.list_databases(&s).await.unwrap().is_empty());

        store
            .insert(&s, "app", "users", vec![doc! {"_id": 1i32}])
            .await
            .unwrap();
        assert_eq!(store.list_databases(&s).await.unwrap(), ["app"]);
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let store = MemoryStore::new();
        let s = scope();
        store
            .insert(&s, "app", "users", vec![doc! {"_id": 1i32}])
            .await
            .unwrap();
        let err = store
            .insert(&s, "app", "users", vec![doc! {"_id": 1i32}])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKey));
    }

    #[tokio::test]
    async fn test_create_twice_is_namespace_exists() {
        let store = MemoryStore::new();
        let s = scope();
        store
            .create_collection(&s, "app", "users", CreateOptions::default())
            .await
            .unwrap();
        let err = store
            .create_collection(&s, "app", "users", CreateOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NamespaceExists(_)));
    }

    #[tokio::test]
    async fn test_drop_reports_absence() {
        let store = MemoryStore::new();
        let s = scope();
        assert!(!store.drop_collection(&s, "app", "nothing").await.unwrap());
        assert!(!store.drop_database(&s, "app").await.unwrap());

        store
            .insert(&s, "app", "users", vec![doc! {"_id": 1i32}])
            .await
            .unwrap();
        assert!(store.drop_collection(&s, "app", "users").await.unwrap());
        assert!(store.drop_database(&s, "app").await.unwrap());
    }

    #[tokio::test]
    async fn test_update_operators() {
        let store = MemoryStore::new();
        let s = scope();
        store
            .insert(&s, "app", "u", vec![doc! {"_id": 1i32, "n": 1i32, "tags": doc! {"a": 1i32}}])
            .await
            .unwrap();

        let result = store
            .update(
                &s,
                "app",
                "u",
                doc! {"_id": 1i32},
                doc! {"$set": doc! {"name": "x", "tags.b": 2i32}, "$inc": doc! {"n": 4i32}},
                false,
                false,
            )
            .await
            .unwrap();
        assert_eq!(result.matched, 1);
        assert_eq!(result.modified, 1);

        let docs = drain(store.find(&s, "app", "u", doc! {}).await.unwrap()).await;
        assert_eq!(docs[0].get_i32("n"), Some(5));
        assert_eq!(docs[0].get_str("name"), Some("x"));
        assert_eq!(
            docs[0].get_document("tags").unwrap().get_i32("b"),
            Some(2)
        );

        // No-op set reports matched but not modified.
        let result = store
            .update(
                &s,
                "app",
                "u",
                doc! {"_id": 1i32},
                doc! {"$set": doc! {"name": "x"}},
                false,
                false,
            )
            .await
            .unwrap();
        assert_eq!(result.matched, 1);
        assert_eq!(result.modified, 0);
    }

    #[tokio::test]
    async fn test_replacement_keeps_id() {
        let store = MemoryStore::new();
        let s = scope();
        store
            .insert(&s, "app", "u", vec![doc! {"_id": 7i32, "old": true}])
            .await
            .unwrap();
        store
            .update(&s, "app", "u", doc! {"_id": 7i32}, doc! {"fresh": true}, false, false)
            .await
            .unwrap();
        let docs = drain(store.find(&s, "app", "u", doc! {}).await.unwrap()).await;
        assert_eq!(docs[0].get_i32("_id"), Some(7));
        assert_eq!(docs[0].get_bool("fresh"), Some(true));
        assert!(docs[0].get("old").is_none());
    }

    #[tokio::test]
    async fn test_upsert_inserts_and_reports_id() {
        let store = MemoryStore::new();
        let s = scope();
        let result = store
            .update(
                &s,
                "app",
                "u",
                doc! {"k": "v"},
                doc! {"$set": doc! {"n": 1i32}},
                false,
                true,
            )
            .await
            .unwrap();
        assert_eq!(result.matched, 0);
        assert!(result.upserted_id.is_some());
        assert_eq!(store.count(&s, "app", "u", doc! {}).await.unwrap(), 1);
        assert_eq!(store.count(&s, "app", "u", doc! {"k": "v"}).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_comparison_predicates() {
        let store = MemoryStore::new();
        let s = scope();
        let docs: Vec<Document> = (0..10).map(|i| doc! {"_id": i, "v": i}).collect();
        store.insert(&s, "app", "nums", docs).await.unwrap();

        assert_eq!(
            store
                .count(&s, "app", "nums", doc! {"v": doc! {"$gte": 5i32}})
                .await
                .unwrap(),
            5
        );
        assert_eq!(
            store
                .count(&s, "app", "nums", doc! {"v": doc! {"$lt": 2.5}})
                .await
                .unwrap(),
            3
        );
        assert_eq!(
            store
                .count(
                    &s,
                    "app",
                    "nums",
                    doc! {"v": doc! {"$in": vec![Value::Int32(1), Value::Int32(3)]}}
                )
                .await
                .unwrap(),
            2
        );
        assert_eq!(
            store
                .count(&s, "app", "nums", doc! {"v": doc! {"$ne": 0i32}})
                .await
                .unwrap(),
            9
        );
    }

    #[tokio::test]
    async fn test_delete_single_and_multi() {
        let store = MemoryStore::new();
        let s = scope();
        let docs: Vec<Document> = (0..4).map(|i| doc! {"_id": i, "even": i % 2 == 0}).collect();
        store.insert(&s, "app", "d", docs).await.unwrap();

        assert_eq!(
            store
                .delete(&s, "app", "d", doc! {"even": true}, false)
                .await
                .unwrap(),
            1
        );
        assert_eq!(
            store
                .delete(&s, "app", "d", doc! {"even": true}, true)
                .await
                .unwrap(),
            1
        );
        assert_eq!(store.count(&s, "app", "d", doc! {}).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_stats_and_fifo_delete_oldest() {
        let store = MemoryStore::new();
        let s = scope();
        let docs: Vec<Document> = (0..100).map(|i| doc! {"_id": i}).collect();
        store.insert(&s, "app", "log", docs).await.unwrap();

        let stats = store.collection_stats(&s, "app", "log").await.unwrap();
        assert_eq!(stats.count, 100);
        assert!(stats.size_bytes > 0);

        assert_eq!(store.delete_oldest(&s, "app", "log", 10).await.unwrap(), 10);
        let remaining = drain(store.find(&s, "app", "log", doc! {}).await.unwrap()).await;
        assert_eq!(remaining.len(), 90);
        // The ten oldest went first.
        assert_eq!(remaining[0].get_i32("_id"), Some(10));

        let after = store.collection_stats(&s, "app", "log").await.unwrap();
        assert!(after.size_bytes < stats.size_bytes);

        assert!(matches!(
            store.collection_stats(&s, "app", "gone").await,
            Err(StoreError::NamespaceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_cancelled_scope_propagates() {
        let (tx, rx) = tokio::sync::watch::channel(false);
        let s = Scope::root(rx);
        tx.send(true).unwrap();
        let store = MemoryStore::new();
        assert!(matches!(
            store.list_databases(&s).await,
            Err(StoreError::Cancelled)
        ));
    }

}
