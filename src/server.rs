//! TCP listener and per-connection read/dispatch/write loops.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;

use crate::config::{Config, ListenerMode};
use crate::conn::{ConnInfo, Scope};
use crate::dataapi;
use crate::error::Result;
use crate::handler::Handler;
use crate::protocol::{encode_request, read_message, write_message};
use crate::proxy::{ProxyClient, compare_replies, reply_document};
use crate::store::memory::MemoryStore;
use crate::tls::build_tls_acceptor;

/// Signals the accept loop and every connection scope to stop.
pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

impl ShutdownHandle {
    pub fn signal(&self) {
        let _ = self.tx.send(true);
    }
}

/// Run a server on the in-memory backend until interrupted.
pub async fn run(cfg: Config) -> Result<()> {
    let handler = Handler::new(cfg.handler_config(), Arc::new(MemoryStore::new()));
    let (addr, data_api_addr, shutdown, handle) = spawn_with_shutdown(cfg, handler).await?;
    tracing::info!(listen_addr = %addr, "stratumdb listening");
    if let Some(api_addr) = data_api_addr {
        tracing::info!(data_api_addr = %api_addr, "data api listening");
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    shutdown.signal();
    let _ = handle.await;
    Ok(())
}

/// Bind the listener(s) and drive them in the background. Returns the bound
/// wire address, the bound Data API address (when configured), a shutdown
/// handle, and the accept loop's join handle.
pub async fn spawn_with_shutdown(
    cfg: Config,
    handler: Arc<Handler>,
) -> Result<(SocketAddr, Option<SocketAddr>, ShutdownHandle, JoinHandle<()>)> {
    let listener = TcpListener::bind(&cfg.listen_addr).await?;
    let addr = listener.local_addr()?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let tls_acceptor = match (&cfg.tls_cert_file, &cfg.tls_key_file) {
        (Some(cert), Some(key)) => Some(build_tls_acceptor(cert, key, cfg.tls_ca_file.as_deref())?),
        _ => None,
    };

    let data_api_addr = match &cfg.data_api_addr {
        Some(api_addr) => {
            let api_listener = TcpListener::bind(api_addr).await?;
            let local = api_listener.local_addr()?;
            let router = dataapi::router(handler.clone());
            let mut rx = shutdown_rx.clone();
            tokio::spawn(async move {
                let shutdown = async move {
                    while !*rx.borrow() {
                        if rx.changed().await.is_err() {
                            break;
                        }
                    }
                };
                if let Err(error) = axum::serve(api_listener, router)
                    .with_graceful_shutdown(shutdown)
                    .await
                {
                    tracing::error!(%error, "data api server failed");
                }
            });
            Some(local)
        }
        None => None,
    };

    let handle = tokio::spawn(accept_loop(
        listener,
        handler,
        cfg,
        tls_acceptor,
        shutdown_rx,
    ));
    Ok((addr, data_api_addr, ShutdownHandle { tx: shutdown_tx }, handle))
}

async fn accept_loop(
    listener: TcpListener,
    handler: Arc<Handler>,
    cfg: Config,
    tls_acceptor: Option<tokio_rustls::TlsAcceptor>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut tasks = JoinSet::new();

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => {
                let (socket, peer_addr) = match accepted {
                    Ok(pair) => pair,
                    Err(error) => {
                        tracing::warn!(%error, "accept failed");
                        continue;
                    }
                };
                tracing::debug!(%peer_addr, "accepted connection");
                handler.metrics().record_connection();

                let handler = handler.clone();
                let cfg = cfg.clone();
                let tls_acceptor = tls_acceptor.clone();
                let shutdown_rx = shutdown_rx.clone();
                tasks.spawn(async move {
                    let conn = Arc::new(ConnInfo::new(peer_addr));
                    let scope = Scope::root(shutdown_rx)
                        .with_conn(conn.clone())
                        .with_cursors(handler.cursors().clone());

                    let result = match tls_acceptor {
                        Some(acceptor) => match acceptor.accept(socket).await {
                            Ok(tls_stream) => {
                                connection_loop(tls_stream, &handler, &scope, &cfg).await
                            }
                            Err(error) => {
                                tracing::debug!(%error, "TLS handshake failed");
                                Ok(())
                            }
                        },
                        None => connection_loop(socket, &handler, &scope, &cfg).await,
                    };
                    if let Err(error) = result {
                        tracing::debug!(error = %format!("{error:?}"), "connection closed with error");
                    }

                    // Every cursor this connection owned dies with it.
                    handler.cursors().close_owned(conn.id).await;
                });
            }
        }
    }

    // Stop accepting, then drain in-flight connections within the grace
    // period.
    let deadline = tokio::time::Instant::now() + cfg.shutdown_grace();
    loop {
        match tokio::time::timeout_at(deadline, tasks.join_next()).await {
            Ok(Some(_)) => continue,
            Ok(None) => break,
            Err(_) => {
                tracing::warn!("shutdown grace period expired, aborting connections");
                tasks.abort_all();
                break;
            }
        }
    }

    handler.close().await;
    tracing::debug!("listener stopped");
}

async fn connection_loop<S>(
    mut stream: S,
    handler: &Arc<Handler>,
    scope: &Scope,
    cfg: &Config,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let upstream = match cfg.mode {
        ListenerMode::Normal => None,
        ListenerMode::Proxy | ListenerMode::Diff => cfg
            .upstream_addr
            .as_ref()
            .map(|addr| ProxyClient::new(addr.clone(), cfg.upstream_timeout())),
    };

    loop {
        let message = tokio::select! {
            _ = scope.cancelled() => break,
            message = read_message(&mut stream) => message,
        };
        // Framing errors propagate and close the connection without a reply.
        let Some((header, body)) = message? else {
            break;
        };

        // Proxy mode: the upstream answers; the local handler never runs.
        if cfg.mode == ListenerMode::Proxy {
            if let Some(proxy) = &upstream {
                let request = encode_request(&body, header.request_id)?;
                let reply = proxy.forward_raw(&request).await?;
                write_message(&mut stream, &reply).await?;
                continue;
            }
        }

        // Diff mode forwards a copy; encode before the handler consumes the
        // body.
        let forward_copy = if cfg.mode == ListenerMode::Diff {
            Some(encode_request(&body, header.request_id)?)
        } else {
            None
        };

        let request_scope = scope.clone().with_deadline_in(cfg.request_timeout());
        let outcome = match timeout(
            cfg.request_timeout(),
            handler.handle(&request_scope, &header, body),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                tracing::warn!(request_id = header.request_id, "request deadline exceeded");
                break;
            }
        };

        if let (Some(request), Some(proxy)) = (forward_copy, &upstream) {
            diff_against_upstream(proxy, &request, outcome.reply.as_deref()).await;
        }

        if let Some(bytes) = &outcome.reply {
            tokio::select! {
                _ = scope.cancelled() => break,
                written = write_message(&mut stream, bytes) => written?,
            }
        }
        if outcome.close_conn {
            break;
        }
    }
    Ok(())
}

/// Best effort: upstream trouble in diff mode is logged, never surfaced.
async fn diff_against_upstream(proxy: &ProxyClient, request: &[u8], local_reply: Option<&[u8]>) {
    let upstream_reply = match proxy.forward_raw(request).await {
        Ok(reply) => reply,
        Err(error) => {
            tracing::debug!(%error, "upstream forward failed");
            return;
        }
    };
    let (Some(local), Ok(Some(theirs))) = (
        local_reply.and_then(|bytes| reply_document(bytes).ok().flatten()),
        reply_document(&upstream_reply),
    ) else {
        return;
    };
    let result = compare_replies(&local, &theirs);
    if result.matched {
        tracing::trace!("diff: replies match");
    } else {
        tracing::warn!(
            summary = %result.summary,
            details = %result.details.unwrap_or_default(),
            "diff: replies diverge"
        );
    }
}
