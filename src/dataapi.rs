//! HTTP Data API: `POST /action/<name>` with a JSON body naming the
//! database, the collection, and the action parameters. Values travel
//! through the relaxed JSON mapping; responses are plain JSON.

use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::post;
use futures::StreamExt;
use serde_json::json;

use crate::conn::{ConnInfo, Scope};
use crate::error::{CommandError, ErrorCode};
use crate::extjson::{relaxed_document_from_json, relaxed_to_json};
use crate::handler::Handler;
use crate::namespace::{validate_collection_name, validate_db_name};
use crate::store::ensure_id;
use crate::types::{Document, Value};

#[derive(Clone)]
struct ApiState {
    handler: Arc<Handler>,
}

pub fn router(handler: Arc<Handler>) -> Router {
    Router::new()
        .route("/action/:name", post(handle_action))
        .with_state(ApiState { handler })
}

async fn handle_action(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> (StatusCode, Json<serde_json::Value>) {
    match run_action(&state.handler, &name, &body).await {
        Ok(value) => (StatusCode::OK, Json(value)),
        Err(err) => {
            let status = if err.code == ErrorCode::CommandNotFound {
                StatusCode::NOT_FOUND
            } else {
                StatusCode::BAD_REQUEST
            };
            (
                status,
                Json(json!({"error": err.message, "code": err.code.code()})),
            )
        }
    }
}

fn str_field<'a>(body: &'a serde_json::Value, key: &str) -> Result<&'a str, CommandError> {
    body.get(key)
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| CommandError::bad_value(format!("missing {key}")))
}

fn doc_field(body: &serde_json::Value, key: &str) -> Result<Document, CommandError> {
    match body.get(key) {
        None => Ok(Document::new()),
        Some(value) => relaxed_document_from_json(value)
            .map_err(|e| CommandError::bad_value(format!("invalid {key}: {e}"))),
    }
}

fn required_doc_field(body: &serde_json::Value, key: &str) -> Result<Document, CommandError> {
    if body.get(key).is_none() {
        return Err(CommandError::bad_value(format!("missing {key}")));
    }
    doc_field(body, key)
}

fn map_store(e: crate::store::StoreError) -> CommandError {
    e.to_command_error()
}

async fn run_action(
    handler: &Arc<Handler>,
    name: &str,
    body: &serde_json::Value,
) -> Result<serde_json::Value, CommandError> {
    let database = str_field(body, "database")?;
    let collection = str_field(body, "collection")?;
    validate_db_name(database)?;
    validate_collection_name(collection)?;

    let scope = Scope::background()
        .with_conn(Arc::new(ConnInfo::internal()))
        .with_cursors(handler.cursors().clone());
    let backend = handler.backend();

    match name {
        "find" | "findOne" => {
            let filter = doc_field(body, "filter")?;
            let limit = if name == "findOne" {
                1
            } else {
                body.get("limit")
                    .and_then(serde_json::Value::as_u64)
                    .unwrap_or(0)
            };

            let mut stream = backend
                .find(&scope, database, collection, filter)
                .await
                .map_err(map_store)?;
            let mut documents = Vec::new();
            while let Some(result) = stream.next().await {
                let doc = result
                    .map_err(|_| CommandError::internal("cursor read failed"))?;
                documents.push(relaxed_to_json(&Value::Document(doc)));
                if limit > 0 && documents.len() as u64 >= limit {
                    break;
                }
            }

            if name == "findOne" {
                Ok(json!({"document": documents.into_iter().next()}))
            } else {
                Ok(json!({"documents": documents}))
            }
        }
        "insertOne" => {
            let mut doc = required_doc_field(body, "document")?;
            ensure_id(&mut doc);
            let n = backend
                .insert(&scope, database, collection, vec![doc])
                .await
                .map_err(map_store)?;
            Ok(json!({"n": n}))
        }
        "insertMany" => {
            let docs = body
                .get("documents")
                .and_then(serde_json::Value::as_array)
                .ok_or_else(|| CommandError::bad_value("missing documents array"))?;
            let mut prepared = Vec::with_capacity(docs.len());
            for value in docs {
                let mut doc = relaxed_document_from_json(value)
                    .map_err(|e| CommandError::bad_value(format!("invalid document: {e}")))?;
                ensure_id(&mut doc);
                prepared.push(doc);
            }
            let n = backend
                .insert(&scope, database, collection, prepared)
                .await
                .map_err(map_store)?;
            Ok(json!({"n": n}))
        }
        "updateOne" | "updateMany" => {
            let filter = doc_field(body, "filter")?;
            let update = required_doc_field(body, "update")?;
            let result = backend
                .update(
                    &scope,
                    database,
                    collection,
                    filter,
                    update,
                    name == "updateMany",
                    false,
                )
                .await
                .map_err(map_store)?;
            Ok(json!({
                "matchedCount": result.matched,
                "modifiedCount": result.modified,
            }))
        }
        "deleteOne" | "deleteMany" => {
            let filter = doc_field(body, "filter")?;
            let deleted = backend
                .delete(&scope, database, collection, filter, name == "deleteMany")
                .await
                .map_err(map_store)?;
            Ok(json!({"deletedCount": deleted}))
        }
        "aggregate" => Err(CommandError::unimplemented(
            "aggregate is not supported over the data api",
        )),
        other => Err(CommandError::not_found(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::HandlerConfig;
    use crate::store::memory::MemoryStore;

    fn handler() -> Arc<Handler> {
        Handler::new(HandlerConfig::default(), Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_insert_one_then_find() {
        let h = handler();
        let insert = json!({
            "database": "app",
            "collection": "items",
            "document": {"_id": 1, "foo": "bar"},
        });
        let reply = run_action(&h, "insertOne", &insert).await.unwrap();
        assert_eq!(reply, json!({"n": 1}));

        let find = json!({"database": "app", "collection": "items", "filter": {}});
        let reply = run_action(&h, "find", &find).await.unwrap();
        assert_eq!(reply, json!({"documents": [{"_id": 1, "foo": "bar"}]}));
    }

    #[tokio::test]
    async fn test_find_one_returns_null_when_empty() {
        let h = handler();
        let body = json!({"database": "app", "collection": "none", "filter": {}});
        let reply = run_action(&h, "findOne", &body).await.unwrap();
        assert_eq!(reply, json!({"document": null}));
    }

    #[tokio::test]
    async fn test_insert_many_and_delete_many() {
        let h = handler();
        let body = json!({
            "database": "app",
            "collection": "items",
            "documents": [{"_id": 1}, {"_id": 2}, {"_id": 3}],
        });
        let reply = run_action(&h, "insertMany", &body).await.unwrap();
        assert_eq!(reply, json!({"n": 3}));

        let body = json!({
            "database": "app",
            "collection": "items",
            "filter": {"_id": {"$gte": 2}},
        });
        let reply = run_action(&h, "deleteMany", &body).await.unwrap();
        assert_eq!(reply, json!({"deletedCount": 2}));
    }

    #[tokio::test]
    async fn test_update_one_counts() {
        let h = handler();
        let body = json!({
            "database": "app",
            "collection": "items",
            "document": {"_id": 1, "n": 0},
        });
        run_action(&h, "insertOne", &body).await.unwrap();

        let body = json!({
            "database": "app",
            "collection": "items",
            "filter": {"_id": 1},
            "update": {"$set": {"n": 5}},
        });
        let reply = run_action(&h, "updateOne", &body).await.unwrap();
        assert_eq!(reply, json!({"matchedCount": 1, "modifiedCount": 1}));
    }

    #[tokio::test]
    async fn test_missing_database_rejected() {
        let h = handler();
        let body = json!({"collection": "items"});
        let err = run_action(&h, "find", &body).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::BadValue);
    }

    #[tokio::test]
    async fn test_unknown_action_is_not_found() {
        let h = handler();
        let body = json!({"database": "app", "collection": "items"});
        let err = run_action(&h, "transmogrify", &body).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::CommandNotFound);
    }

    #[tokio::test]
    async fn test_aggregate_reports_unimplemented() {
        let h = handler();
        let body = json!({"database": "app", "collection": "items", "pipeline": []});
        let err = run_action(&h, "aggregate", &body).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::NotImplemented);
    }
}
