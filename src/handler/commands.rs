//! The wire commands. Each is a thin shell over the handler core and the
//! backend trait: parse the request document, route, shape the reply.

use futures::StreamExt;

use super::Handler;
use crate::conn::Scope;
use crate::doc;
use crate::error::{CommandError, Error, ErrorCode, Result};
use crate::namespace::{validate_collection_name, validate_db_name, validate_field_path};
use crate::protocol::MAX_MESSAGE_LEN;
use crate::scram::{
    ClientFirst, SCRAM_SHA_256, ScramConversation, StoredCredentials, parse_client_first,
    parse_plain,
};
use crate::store::{CreateOptions, StoreError, ensure_id};
use crate::types::{Binary, Document, MAX_DOCUMENT_LEN, Value};

const DEFAULT_BATCH_SIZE: i64 = 101;
const MAX_WRITE_BATCH_SIZE: i32 = 100_000;
const WIRE_VERSION: i32 = 17;
const SERVER_VERSION: &str = "7.0.0";

fn store_err(e: StoreError) -> Error {
    Error::Command(e.to_command_error())
}

fn db_of(req: &Document) -> Result<String> {
    match req.get("$db") {
        None => Ok("admin".to_string()),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Err(CommandError::type_mismatch(format!(
            "$db must be a string, got {}",
            other.type_name()
        ))
        .into()),
    }
}

/// The collection name carried as the command's own value.
fn collection_of<'a>(req: &'a Document, cmd: &str) -> Result<&'a str> {
    match req.get(cmd) {
        Some(Value::String(s)) => Ok(s),
        Some(other) => Err(CommandError::type_mismatch(format!(
            "{cmd} expects a collection name string, got {}",
            other.type_name()
        ))
        .into()),
        None => Err(CommandError::bad_value(format!("missing {cmd} value")).into()),
    }
}

fn validate_namespace(db: &str, coll: &str) -> Result<()> {
    validate_db_name(db)?;
    validate_collection_name(coll)?;
    Ok(())
}

fn optional_doc(req: &Document, key: &str) -> Result<Document> {
    match req.get(key) {
        None => Ok(Document::new()),
        Some(Value::Document(d)) => Ok(d.clone()),
        Some(other) => Err(CommandError::type_mismatch(format!(
            "{key} must be a document, got {}",
            other.type_name()
        ))
        .into()),
    }
}

fn binary_payload(req: &Document, key: &str) -> Result<Vec<u8>> {
    match req.get(key) {
        Some(Value::Binary(b)) => Ok(b.bytes.clone()),
        Some(other) => Err(CommandError::type_mismatch(format!(
            "{key} must be binary, got {}",
            other.type_name()
        ))
        .into()),
        None => Err(CommandError::bad_value(format!("missing {key}")).into()),
    }
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn handshake_body() -> Document {
    doc! {
        "maxBsonObjectSize": MAX_DOCUMENT_LEN as i32,
        "maxMessageSizeBytes": MAX_MESSAGE_LEN as i32,
        "maxWriteBatchSize": MAX_WRITE_BATCH_SIZE,
        "localTime": Value::DateTime(now_millis()),
        "logicalSessionTimeoutMinutes": 30i32,
        "minWireVersion": 0i32,
        "maxWireVersion": WIRE_VERSION,
        "readOnly": false,
    }
}

pub(super) async fn hello(_h: &Handler, _scope: &Scope, req: &Document) -> Result<Document> {
    let mut reply = handshake_body();
    reply.insert_front("isWritablePrimary", true);
    if req.contains_key("saslSupportedMechs") {
        reply.insert("saslSupportedMechs", vec![SCRAM_SHA_256, "PLAIN"]);
    }
    Ok(reply)
}

pub(super) async fn is_master(_h: &Handler, _scope: &Scope, _req: &Document) -> Result<Document> {
    let mut reply = handshake_body();
    reply.insert_front("ismaster", true);
    Ok(reply)
}

pub(super) async fn build_info(_h: &Handler, _scope: &Scope, _req: &Document) -> Result<Document> {
    Ok(doc! {
        "version": SERVER_VERSION,
        "gitVersion": "unknown",
        "versionArray": vec![7i32, 0i32, 0i32, 0i32],
        "bits": 64i32,
        "debug": false,
        "maxBsonObjectSize": MAX_DOCUMENT_LEN as i32,
        "stratumdb": doc! {"version": env!("CARGO_PKG_VERSION")},
    })
}

pub(super) async fn connection_status(
    _h: &Handler,
    scope: &Scope,
    _req: &Document,
) -> Result<Document> {
    let conn = scope.conn()?;
    let users: Vec<Value> = conn
        .auth_user()
        .into_iter()
        .map(|(user, db)| Value::Document(doc! {"user": user, "db": db}))
        .collect();
    Ok(doc! {
        "authInfo": doc! {
            "authenticatedUsers": users,
            "authenticatedUserRoles": Vec::<Value>::new(),
        },
    })
}

pub(super) async fn ping(_h: &Handler, _scope: &Scope, _req: &Document) -> Result<Document> {
    Ok(Document::new())
}

pub(super) async fn whats_my_uri(_h: &Handler, scope: &Scope, _req: &Document) -> Result<Document> {
    let conn = scope.conn()?;
    Ok(doc! {"you": conn.peer_addr.to_string()})
}

async fn lookup_credentials(
    h: &Handler,
    scope: &Scope,
    db: &str,
    user: &str,
) -> Result<Option<StoredCredentials>> {
    let filter = doc! {"_id": format!("{db}.{user}")};
    let mut stream = h
        .backend()
        .find(scope, "admin", "system.users", filter)
        .await
        .map_err(store_err)?;
    let Some(first) = stream.next().await.transpose()? else {
        return Ok(None);
    };
    Ok(first
        .get_document("credentials")
        .and_then(|c| c.get_document(SCRAM_SHA_256))
        .and_then(StoredCredentials::from_document))
}

pub(super) async fn sasl_start(h: &Handler, scope: &Scope, req: &Document) -> Result<Document> {
    let mechanism = req
        .get_str("mechanism")
        .ok_or_else(|| CommandError::bad_value("missing mechanism"))?;
    let payload = binary_payload(req, "payload")?;
    let db = db_of(req)?;
    let conn = scope.conn()?;

    match mechanism {
        "PLAIN" => {
            let (user, password) = parse_plain(&payload).map_err(|error| {
                tracing::debug!(%error, "PLAIN payload rejected");
                CommandError::auth_failed()
            })?;
            let stored = lookup_credentials(h, scope, &db, &user)
                .await?
                .ok_or_else(CommandError::auth_failed)?;
            if !stored.verify_password(&password) {
                return Err(CommandError::auth_failed().into());
            }
            conn.set_auth_user(user, db);
            Ok(doc! {
                "conversationId": 1i32,
                "done": true,
                "payload": Binary::generic(Vec::new()),
            })
        }
        SCRAM_SHA_256 => {
            let client_first: ClientFirst = parse_client_first(&payload).map_err(|error| {
                tracing::debug!(%error, "client-first rejected");
                CommandError::auth_failed()
            })?;
            let stored = lookup_credentials(h, scope, &db, &client_first.username).await?;
            // UnknownUser and the other conversation failures reach the wire
            // as a uniform authentication failure.
            let (conversation, server_first) = ScramConversation::start(client_first, stored)
                .map_err(|error| {
                    tracing::debug!(%error, "SCRAM start failed");
                    CommandError::auth_failed()
                })?;
            conn.set_scram(db, conversation);
            Ok(doc! {
                "conversationId": 1i32,
                "done": false,
                "payload": Binary::generic(server_first.into_bytes()),
            })
        }
        other => {
            Err(CommandError::bad_value(format!("unsupported mechanism {other}")).into())
        }
    }
}

pub(super) async fn sasl_continue(_h: &Handler, scope: &Scope, req: &Document) -> Result<Document> {
    let payload = binary_payload(req, "payload")?;
    let conn = scope.conn()?;

    let stepped = conn.with_scram(|slot| {
        let Some((db, conversation)) = slot else {
            return Err(CommandError::bad_value("no SASL conversation in progress"));
        };
        // The optional empty exchange after a finished conversation.
        if conversation.valid() && payload.is_empty() {
            return Ok(None);
        }
        match conversation.step(&payload) {
            Ok(server_final) => Ok(Some((
                db.to_string(),
                conversation.username().to_string(),
                server_final,
            ))),
            Err(error) => {
                tracing::debug!(%error, "SCRAM step failed");
                Err(CommandError::auth_failed())
            }
        }
    })?;

    match stepped {
        None => Ok(doc! {
            "conversationId": 1i32,
            "done": true,
            "payload": Binary::generic(Vec::new()),
        }),
        Some((db, user, server_final)) => {
            conn.set_auth_user(user, db);
            Ok(doc! {
                "conversationId": 1i32,
                "done": true,
                "payload": Binary::generic(server_final.into_bytes()),
            })
        }
    }
}

pub(super) async fn find(h: &Handler, scope: &Scope, req: &Document) -> Result<Document> {
    let db = db_of(req)?;
    let coll = collection_of(req, "find")?;
    validate_namespace(&db, coll)?;
    let filter = optional_doc(req, "filter")?;
    let limit = req.get_int("limit").unwrap_or(0).abs();
    let batch_size = req.get_int("batchSize").unwrap_or(DEFAULT_BATCH_SIZE).max(0);

    let mut stream = h
        .backend()
        .find(scope, &db, coll, filter)
        .await
        .map_err(store_err)?;
    if limit > 0 {
        stream = stream.take(limit as usize).boxed();
    }

    let mut first_batch = Vec::new();
    let mut exhausted = false;
    while (first_batch.len() as i64) < batch_size {
        match stream.next().await.transpose()? {
            Some(doc) => first_batch.push(Value::Document(doc)),
            None => {
                exhausted = true;
                break;
            }
        }
    }

    let cursor_id = if exhausted {
        0i64
    } else {
        scope.set_cursor(db.clone(), coll, stream)?.id as i64
    };

    Ok(doc! {
        "cursor": doc! {
            "firstBatch": first_batch,
            "id": cursor_id,
            "ns": format!("{db}.{coll}"),
        },
    })
}

pub(super) async fn get_more(h: &Handler, scope: &Scope, req: &Document) -> Result<Document> {
    let id = req
        .get_i64("getMore")
        .ok_or_else(|| CommandError::type_mismatch("getMore expects an int64 cursor id"))?;
    let coll = req
        .get_str("collection")
        .ok_or_else(|| CommandError::bad_value("missing collection"))?;
    let db = db_of(req)?;
    let batch_size = req.get_int("batchSize").unwrap_or(DEFAULT_BATCH_SIZE).max(1);

    let cursor = scope.cursor(id as u64).ok_or_else(|| {
        CommandError::new(ErrorCode::CursorNotFound, format!("cursor id {id} not found"))
    })?;
    if cursor.db != db || cursor.collection != coll {
        return Err(CommandError::bad_value(format!(
            "cursor {id} belongs to a different namespace"
        ))
        .into());
    }

    let mut next_batch = Vec::new();
    let mut exhausted = false;
    while (next_batch.len() as i64) < batch_size {
        match cursor.next().await.transpose()? {
            Some(doc) => next_batch.push(Value::Document(doc)),
            None => {
                exhausted = true;
                break;
            }
        }
    }

    let reply_id = if exhausted {
        h.cursors().close_and_remove(&cursor).await;
        0i64
    } else {
        id
    };

    Ok(doc! {
        "cursor": doc! {
            "nextBatch": next_batch,
            "id": reply_id,
            "ns": format!("{db}.{coll}"),
        },
    })
}

pub(super) async fn kill_cursors(h: &Handler, scope: &Scope, req: &Document) -> Result<Document> {
    let _coll = collection_of(req, "killCursors")?;
    let ids = req
        .get_array("cursors")
        .ok_or_else(|| CommandError::bad_value("cursors must be an array"))?;

    let mut killed = Vec::new();
    let mut not_found = Vec::new();
    for value in ids {
        let id = value
            .as_i64()
            .ok_or_else(|| CommandError::type_mismatch("cursor ids must be int64"))?;
        match scope.cursor(id as u64) {
            Some(entry) => {
                h.cursors().close_and_remove(&entry).await;
                killed.push(Value::Int64(id));
            }
            None => not_found.push(Value::Int64(id)),
        }
    }

    Ok(doc! {
        "cursorsKilled": killed,
        "cursorsNotFound": not_found,
        "cursorsAlive": Vec::<Value>::new(),
        "cursorsUnknown": Vec::<Value>::new(),
    })
}

pub(super) async fn insert(h: &Handler, scope: &Scope, req: &Document) -> Result<Document> {
    let db = db_of(req)?;
    let coll = collection_of(req, "insert")?;
    validate_namespace(&db, coll)?;
    let documents = req
        .get_array("documents")
        .ok_or_else(|| CommandError::bad_value("missing documents array"))?;
    let ordered = req.get_bool("ordered").unwrap_or(true);

    let mut n = 0i32;
    let mut write_errors = Vec::new();
    for (index, value) in documents.iter().enumerate() {
        let mut doc = value
            .as_document()
            .ok_or_else(|| CommandError::type_mismatch("documents entries must be documents"))?
            .clone();
        ensure_id(&mut doc);
        match h.backend().insert(scope, &db, coll, vec![doc]).await {
            Ok(inserted) => n += inserted as i32,
            Err(error) => {
                let mapped = error.to_command_error();
                write_errors.push(Value::Document(doc! {
                    "index": index as i32,
                    "code": mapped.code.code(),
                    "errmsg": mapped.message,
                }));
                if ordered {
                    break;
                }
            }
        }
    }

    let mut reply = doc! {"n": n};
    if !write_errors.is_empty() {
        reply.insert("writeErrors", write_errors);
    }
    Ok(reply)
}

pub(super) async fn update(h: &Handler, scope: &Scope, req: &Document) -> Result<Document> {
    let db = db_of(req)?;
    let coll = collection_of(req, "update")?;
    validate_namespace(&db, coll)?;
    let updates = req
        .get_array("updates")
        .ok_or_else(|| CommandError::bad_value("missing updates array"))?;

    let mut n = 0i64;
    let mut n_modified = 0i64;
    let mut upserted = Vec::new();
    for (index, value) in updates.iter().enumerate() {
        let entry = value
            .as_document()
            .ok_or_else(|| CommandError::type_mismatch("updates entries must be documents"))?;
        let filter = entry.get_document("q").cloned().unwrap_or_default();
        let update_doc = entry
            .get_document("u")
            .ok_or_else(|| CommandError::bad_value("update entry is missing u"))?
            .clone();
        validate_update_paths(&update_doc)?;
        let multi = entry.get_bool("multi").unwrap_or(false);
        let upsert = entry.get_bool("upsert").unwrap_or(false);

        let result = h
            .backend()
            .update(scope, &db, coll, filter, update_doc, multi, upsert)
            .await
            .map_err(store_err)?;
        n += result.matched;
        n_modified += result.modified;
        if let Some(id) = result.upserted_id {
            n += 1;
            upserted.push(Value::Document(doc! {"index": index as i32, "_id": id}));
        }
    }

    let mut reply = doc! {"n": n, "nModified": n_modified};
    if !upserted.is_empty() {
        reply.insert("upserted", upserted);
    }
    Ok(reply)
}

fn validate_update_paths(update: &Document) -> Result<()> {
    for (op, operand) in update.iter() {
        if !op.starts_with('$') {
            continue;
        }
        if let Some(fields) = operand.as_document() {
            for (path, _) in fields.iter() {
                validate_field_path(path)?;
            }
        }
    }
    Ok(())
}

pub(super) async fn delete(h: &Handler, scope: &Scope, req: &Document) -> Result<Document> {
    let db = db_of(req)?;
    let coll = collection_of(req, "delete")?;
    validate_namespace(&db, coll)?;
    let deletes = req
        .get_array("deletes")
        .ok_or_else(|| CommandError::bad_value("missing deletes array"))?;

    let mut n = 0i64;
    for value in deletes {
        let entry = value
            .as_document()
            .ok_or_else(|| CommandError::type_mismatch("deletes entries must be documents"))?;
        let filter = entry.get_document("q").cloned().unwrap_or_default();
        let limit = entry.get_int("limit").unwrap_or(0);
        let multi = limit == 0;
        n += h
            .backend()
            .delete(scope, &db, coll, filter, multi)
            .await
            .map_err(store_err)? as i64;
    }
    Ok(doc! {"n": n})
}

pub(super) async fn count(h: &Handler, scope: &Scope, req: &Document) -> Result<Document> {
    let db = db_of(req)?;
    let coll = collection_of(req, "count")?;
    validate_namespace(&db, coll)?;
    let query = optional_doc(req, "query")?;
    let n = h
        .backend()
        .count(scope, &db, coll, query)
        .await
        .map_err(store_err)?;
    Ok(doc! {"n": n as i32})
}

pub(super) async fn explain(_h: &Handler, _scope: &Scope, req: &Document) -> Result<Document> {
    let db = db_of(req)?;
    let inner = req
        .get_document("explain")
        .ok_or_else(|| CommandError::bad_value("explain expects a command document"))?;
    let coll = inner
        .command_name()
        .and_then(|name| inner.get_str(name))
        .unwrap_or_default();
    let filter = inner.get_document("filter").cloned().unwrap_or_default();

    Ok(doc! {
        "queryPlanner": doc! {
            "plannerVersion": 1i32,
            "namespace": format!("{db}.{coll}"),
            "parsedQuery": filter,
            "winningPlan": doc! {"stage": "COLLSCAN"},
        },
        "explainVersion": "1",
        "serverInfo": doc! {"version": SERVER_VERSION},
    })
}

pub(super) async fn create(h: &Handler, scope: &Scope, req: &Document) -> Result<Document> {
    let db = db_of(req)?;
    let coll = collection_of(req, "create")?;
    validate_namespace(&db, coll)?;

    let capped = req.get_bool("capped").unwrap_or(false);
    let max_size_bytes = req.get_int("size");
    let max_documents = req.get_int("max");
    if capped && max_size_bytes.is_none() {
        return Err(
            CommandError::bad_value("the 'size' field is required for capped collections").into(),
        );
    }

    h.backend()
        .create_collection(
            scope,
            &db,
            coll,
            CreateOptions {
                capped,
                max_size_bytes,
                max_documents,
            },
        )
        .await
        .map_err(store_err)?;
    Ok(Document::new())
}

pub(super) async fn drop_collection(h: &Handler, scope: &Scope, req: &Document) -> Result<Document> {
    let db = db_of(req)?;
    let coll = collection_of(req, "drop")?;

    // Cursors over the namespace die with it.
    for entry in h.cursors().all() {
        if entry.db == db && entry.collection == coll {
            h.cursors().close_and_remove(&entry).await;
        }
    }

    let dropped = h
        .backend()
        .drop_collection(scope, &db, coll)
        .await
        .map_err(store_err)?;
    if !dropped {
        return Err(CommandError::new(
            ErrorCode::NamespaceNotFound,
            format!("ns not found: {db}.{coll}"),
        )
        .into());
    }
    Ok(doc! {"ns": format!("{db}.{coll}"), "nIndexesWas": 1i32})
}

pub(super) async fn drop_database(h: &Handler, scope: &Scope, req: &Document) -> Result<Document> {
    let db = db_of(req)?;

    for entry in h.cursors().all() {
        if entry.db == db {
            h.cursors().close_and_remove(&entry).await;
        }
    }

    let dropped = h
        .backend()
        .drop_database(scope, &db)
        .await
        .map_err(store_err)?;
    if dropped {
        Ok(doc! {"dropped": db})
    } else {
        Ok(Document::new())
    }
}

pub(super) async fn list_collections(h: &Handler, scope: &Scope, req: &Document) -> Result<Document> {
    let db = db_of(req)?;
    let infos = h
        .backend()
        .list_collections(scope, &db)
        .await
        .map_err(store_err)?;

    let batch: Vec<Value> = infos
        .into_iter()
        .map(|info| {
            let mut options = Document::new();
            if info.options.capped {
                options.insert("capped", true);
                if let Some(size) = info.options.max_size_bytes {
                    options.insert("size", size);
                }
                if let Some(max) = info.options.max_documents {
                    options.insert("max", max);
                }
            }
            Value::Document(doc! {
                "name": info.name,
                "type": "collection",
                "options": options,
                "info": doc! {"readOnly": false},
            })
        })
        .collect();

    Ok(doc! {
        "cursor": doc! {
            "id": 0i64,
            "ns": format!("{db}.$cmd.listCollections"),
            "firstBatch": batch,
        },
    })
}

pub(super) async fn list_databases(h: &Handler, scope: &Scope, req: &Document) -> Result<Document> {
    let name_only = req.get_bool("nameOnly").unwrap_or(false);
    let names = h
        .backend()
        .list_databases(scope)
        .await
        .map_err(store_err)?;

    let mut databases = Vec::new();
    let mut total_size = 0i64;
    for name in names {
        if name_only {
            databases.push(Value::Document(doc! {"name": name}));
            continue;
        }
        let mut size = 0i64;
        for info in h
            .backend()
            .list_collections(scope, &name)
            .await
            .map_err(store_err)?
        {
            match h.backend().collection_stats(scope, &name, &info.name).await {
                Ok(stats) => size += stats.size_bytes,
                // Dropped while we were listing; skip it.
                Err(error) if error.is_namespace_gone() => continue,
                Err(error) => return Err(store_err(error)),
            }
        }
        total_size += size;
        databases.push(Value::Document(doc! {
            "name": name,
            "sizeOnDisk": size,
            "empty": size == 0,
        }));
    }

    let mut reply = doc! {"databases": databases};
    if !name_only {
        reply.insert("totalSize", total_size);
    }
    Ok(reply)
}

pub(super) async fn users_info(h: &Handler, scope: &Scope, req: &Document) -> Result<Document> {
    let db = db_of(req)?;
    let filter = match req.get("usersInfo") {
        Some(Value::String(user)) => doc! {"_id": format!("{db}.{user}")},
        Some(Value::Int32(_)) | Some(Value::Int64(_)) | Some(Value::Double(_)) => {
            doc! {"db": db.clone()}
        }
        Some(Value::Document(spec)) if spec.get_bool("forAllDBs") == Some(true) => Document::new(),
        Some(other) => {
            return Err(CommandError::type_mismatch(format!(
                "usersInfo expects a user name or 1, got {}",
                other.type_name()
            ))
            .into());
        }
        None => return Err(CommandError::bad_value("missing usersInfo value").into()),
    };

    let mut stream = h
        .backend()
        .find(scope, "admin", "system.users", filter)
        .await
        .map_err(store_err)?;
    let mut users = Vec::new();
    while let Some(stored) = stream.next().await.transpose()? {
        let mechanisms: Vec<Value> = stored
            .get_document("credentials")
            .map(|c| c.keys().map(|k| Value::String(k.clone())).collect())
            .unwrap_or_default();
        users.push(doc! {
            "_id": stored.get_str("_id").unwrap_or_default(),
            "user": stored.get_str("user").unwrap_or_default(),
            "db": stored.get_str("db").unwrap_or_default(),
            "roles": Vec::<Value>::new(),
            "mechanisms": mechanisms,
        });
    }

    // User ascending; ties break on db descending.
    users.sort_by(|a, b| {
        a.get_str("user")
            .cmp(&b.get_str("user"))
            .then_with(|| b.get_str("db").cmp(&a.get_str("db")))
    });

    let users: Vec<Value> = users.into_iter().map(Value::Document).collect();
    Ok(doc! {"users": users})
}

pub(super) async fn create_user(h: &Handler, scope: &Scope, req: &Document) -> Result<Document> {
    let user = collection_of(req, "createUser")?;
    let db = db_of(req)?;
    let pwd = req
        .get_str("pwd")
        .ok_or_else(|| CommandError::bad_value("missing pwd"))?;
    if user.is_empty() {
        return Err(CommandError::bad_value("user name must not be empty").into());
    }

    let credentials = StoredCredentials::generate(pwd);
    let user_doc = doc! {
        "_id": format!("{db}.{user}"),
        "user": user,
        "db": db,
        "credentials": doc! {SCRAM_SHA_256: credentials.to_document()},
    };
    h.backend()
        .insert(scope, "admin", "system.users", vec![user_doc])
        .await
        .map_err(store_err)?;
    Ok(Document::new())
}

pub(super) async fn drop_user(h: &Handler, scope: &Scope, req: &Document) -> Result<Document> {
    let user = collection_of(req, "dropUser")?;
    let db = db_of(req)?;
    let deleted = h
        .backend()
        .delete(
            scope,
            "admin",
            "system.users",
            doc! {"_id": format!("{db}.{user}")},
            false,
        )
        .await
        .map_err(store_err)?;
    if deleted == 0 {
        return Err(CommandError::bad_value(format!("User '{user}@{db}' not found")).into());
    }
    Ok(Document::new())
}

pub(super) async fn server_status(h: &Handler, _scope: &Scope, _req: &Document) -> Result<Document> {
    let uptime = h.uptime();
    let mut metrics = h.metrics().to_document();
    metrics.insert(
        "cursors",
        doc! {
            "open": h.cursors().live_count() as i64,
            "totalOpened": h.cursors().total_allocations() as i64,
        },
    );
    Ok(doc! {
        "version": SERVER_VERSION,
        "process": "stratumdb",
        "pid": std::process::id() as i64,
        "uptime": uptime.as_secs_f64(),
        "uptimeMillis": uptime.as_millis() as i64,
        "localTime": Value::DateTime(now_millis()),
        "metrics": metrics,
    })
}
