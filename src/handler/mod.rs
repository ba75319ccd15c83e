//! Command dispatch.
//!
//! The handler owns the command table, the cursor registry and the metrics
//! counters, and is shared by every connection task. Aside from those
//! counters it is stateless per request: all per-connection state rides on
//! the scope.

pub mod capped;
mod commands;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::conn::Scope;
use crate::cursor::CursorRegistry;
use crate::doc;
use crate::error::{CodecError, CommandError, Error, Result};
use crate::metrics::Metrics;
use crate::protocol::{
    MessageHeader, OpBody, OpMsg, OpQuery, OpReply, encode_op_msg_doc, encode_op_reply,
};
use crate::store::Backend;
use crate::types::Document;

/// Commands that do not consult the authentication gate.
const UNAUTHENTICATED: &[&str] = &[
    "hello",
    "isMaster",
    "ping",
    "buildInfo",
    "saslStart",
    "saslContinue",
];

#[derive(Debug, Clone)]
pub struct HandlerConfig {
    /// Enforce authentication for commands outside the allow-list.
    pub auth: bool,
    /// Capped-collection maintenance cadence; `None` disables the loop.
    pub capped_cleanup_interval: Option<Duration>,
    /// Share of documents removed per over-limit collection, clamped to
    /// [0, 100] on entry.
    pub capped_cleanup_percentage: u8,
    /// Accepted for configuration compatibility; the trait backend always
    /// evaluates its own filters.
    pub disable_pushdown: bool,
    pub enable_oplog: bool,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            auth: false,
            capped_cleanup_interval: None,
            capped_cleanup_percentage: 20,
            disable_pushdown: false,
            enable_oplog: false,
        }
    }
}

/// Outcome of handling one request.
#[derive(Debug)]
pub struct HandleResult {
    /// Encoded reply, or `None` when the request asked for no response.
    pub reply: Option<Vec<u8>>,
    /// Close the connection after writing the reply.
    pub close_conn: bool,
}

type CommandFuture<'a> = Pin<Box<dyn Future<Output = Result<Document>> + Send + 'a>>;
type CommandFn = for<'a> fn(&'a Handler, &'a Scope, &'a Document) -> CommandFuture<'a>;

pub struct Handler {
    backend: Arc<dyn Backend>,
    cursors: Arc<CursorRegistry>,
    metrics: Arc<Metrics>,
    config: HandlerConfig,
    commands: HashMap<&'static str, CommandFn>,
    next_request_id: AtomicI32,
    started_at: Instant,
    // Present only while the cleanup loop is running; `close` must not send
    // on a channel nobody reads.
    cleanup_stop: Mutex<Option<oneshot::Sender<()>>>,
    cleanup_task: Mutex<Option<JoinHandle<()>>>,
}

macro_rules! command_table {
    ($($name:literal => $func:ident),+ $(,)?) => {{
        let mut table: HashMap<&'static str, CommandFn> = HashMap::new();
        $(
            {
                fn shim<'a>(
                    handler: &'a Handler,
                    scope: &'a Scope,
                    req: &'a Document,
                ) -> CommandFuture<'a> {
                    Box::pin(commands::$func(handler, scope, req))
                }
                table.insert($name, shim as CommandFn);
            }
        )+
        table
    }};
}

impl Handler {
    pub fn new(config: HandlerConfig, backend: Arc<dyn Backend>) -> Arc<Self> {
        let mut config = config;
        if config.capped_cleanup_percentage > 100 {
            tracing::warn!(
                percentage = config.capped_cleanup_percentage,
                "capped_cleanup_percentage out of range, clamping to 100"
            );
            config.capped_cleanup_percentage = 100;
        }
        if config.disable_pushdown {
            tracing::warn!("disable_pushdown accepted; trait backends always evaluate filters");
        }
        if config.enable_oplog {
            tracing::warn!("enable_oplog accepted; oplog emulation is not implemented");
        }

        let commands = command_table! {
            "hello" => hello,
            "isMaster" => is_master,
            "buildInfo" => build_info,
            "connectionStatus" => connection_status,
            "ping" => ping,
            "whatsmyuri" => whats_my_uri,
            "saslStart" => sasl_start,
            "saslContinue" => sasl_continue,
            "find" => find,
            "getMore" => get_more,
            "killCursors" => kill_cursors,
            "insert" => insert,
            "update" => update,
            "delete" => delete,
            "count" => count,
            "explain" => explain,
            "create" => create,
            "drop" => drop_collection,
            "dropDatabase" => drop_database,
            "listCollections" => list_collections,
            "listDatabases" => list_databases,
            "usersInfo" => users_info,
            "createUser" => create_user,
            "dropUser" => drop_user,
            "serverStatus" => server_status,
        };

        let handler = Arc::new(Self {
            backend,
            cursors: Arc::new(CursorRegistry::new()),
            metrics: Arc::new(Metrics::new()),
            config,
            commands,
            next_request_id: AtomicI32::new(1),
            started_at: Instant::now(),
            cleanup_stop: Mutex::new(None),
            cleanup_task: Mutex::new(None),
        });

        if let Some(interval) = handler.config.capped_cleanup_interval {
            let (stop_tx, stop_rx) = oneshot::channel();
            let task = capped::spawn_cleanup_loop(
                handler.backend.clone(),
                handler.cursors.clone(),
                interval,
                handler.config.capped_cleanup_percentage,
                stop_rx,
            );
            *handler.cleanup_stop.lock().expect("handler poisoned") = Some(stop_tx);
            *handler.cleanup_task.lock().expect("handler poisoned") = Some(task);
        }

        handler
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn cursors(&self) -> &Arc<CursorRegistry> {
        &self.cursors
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn config(&self) -> &HandlerConfig {
        &self.config
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn next_request_id(&self) -> i32 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Handle one decoded message. `Err` is fatal to the connection; command
    /// failures come back as encoded `ok: 0` replies.
    pub async fn handle(
        &self,
        scope: &Scope,
        header: &MessageHeader,
        body: OpBody,
    ) -> Result<HandleResult> {
        self.metrics.record_request();
        match body {
            OpBody::Msg(msg) => self.handle_msg(scope, header, msg).await,
            OpBody::Query(query) => self.handle_query(scope, header, query).await,
            OpBody::Reply(_) => {
                Err(CodecError::malformed("unexpected OP_REPLY from client").into())
            }
        }
    }

    async fn handle_msg(
        &self,
        scope: &Scope,
        header: &MessageHeader,
        msg: OpMsg,
    ) -> Result<HandleResult> {
        // A request flagged moreToCome expects no reply at all.
        let suppress_reply = msg.more_to_come();
        let request = msg.into_command()?;

        let reply_doc = match self.dispatch(scope, &request).await {
            Ok(doc) => finalize_ok(doc),
            Err(Error::Command(err)) => {
                self.metrics.record_command_error();
                tracing::debug!(error = %err, "command failed");
                error_reply(&err)
            }
            Err(fatal) => return Err(fatal),
        };

        if suppress_reply {
            return Ok(HandleResult {
                reply: None,
                close_conn: false,
            });
        }
        let bytes = encode_op_msg_doc(&reply_doc, header.request_id, self.next_request_id())?;
        Ok(HandleResult {
            reply: Some(bytes),
            close_conn: false,
        })
    }

    /// OP_QUERY survives only for the legacy `$cmd` handshake.
    async fn handle_query(
        &self,
        scope: &Scope,
        header: &MessageHeader,
        query: OpQuery,
    ) -> Result<HandleResult> {
        let is_cmd = query.full_collection_name.ends_with(".$cmd");
        let name = query.query.command_name().unwrap_or_default();

        let reply_doc = if is_cmd && matches!(name, "hello" | "isMaster" | "ismaster") {
            match self.dispatch_legacy(scope, &query.query).await {
                Ok(doc) => finalize_ok(doc),
                Err(Error::Command(err)) => error_reply(&err),
                Err(fatal) => return Err(fatal),
            }
        } else {
            error_reply(&CommandError::unimplemented(
                "legacy opcode supports only the handshake commands",
            ))
        };

        let reply = OpReply {
            response_flags: 8, // AwaitCapable
            cursor_id: 0,
            starting_from: 0,
            documents: vec![reply_doc],
        };
        let bytes = encode_op_reply(&reply, header.request_id, self.next_request_id())?;
        Ok(HandleResult {
            reply: Some(bytes),
            close_conn: false,
        })
    }

    async fn dispatch(&self, scope: &Scope, request: &Document) -> Result<Document> {
        let name = request
            .command_name()
            .ok_or_else(|| CommandError::bad_value("empty command document"))?;
        self.metrics.record_command(name);

        let command = *self
            .commands
            .get(name)
            .ok_or_else(|| CommandError::not_found(name))?;

        if self.config.auth && !UNAUTHENTICATED.contains(&name) {
            let conn = scope.conn()?;
            if !conn.authenticated() {
                return Err(CommandError::unauthorized(format!(
                    "command {name} requires authentication"
                ))
                .into());
            }
        }

        command(self, scope, request).await
    }

    // Legacy OP_QUERY spells isMaster in lowercase; route it by hand.
    async fn dispatch_legacy(&self, scope: &Scope, request: &Document) -> Result<Document> {
        match request.command_name() {
            Some("hello") => commands::hello(self, scope, request).await,
            _ => commands::is_master(self, scope, request).await,
        }
    }

    /// Stop the maintenance loop (when it was spawned) and shut the cursor
    /// registry down.
    pub async fn close(&self) {
        let stop = self.cleanup_stop.lock().expect("handler poisoned").take();
        if let Some(stop) = stop {
            let _ = stop.send(());
        }
        let task = self.cleanup_task.lock().expect("handler poisoned").take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.cursors.close().await;
    }
}

fn finalize_ok(mut doc: Document) -> Document {
    if !doc.contains_key("ok") {
        doc.insert("ok", 1.0);
    }
    doc
}

fn error_reply(err: &CommandError) -> Document {
    doc! {
        "ok": 0.0,
        "errmsg": err.message.clone(),
        "code": err.code.code(),
        "codeName": err.code.code_name(),
    }
}
