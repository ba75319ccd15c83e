//! Per-connection state and the request scope threaded through every handler
//! and backend call.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use uuid::Uuid;

use crate::cursor::{CursorEntry, CursorRegistry, DocStream};
use crate::error::{Error, Result};
use crate::scram::ScramConversation;

/// Identity of an authenticated user: (user, db).
pub type AuthUser = (String, String);

/// Metadata for one accepted connection. Created on accept, dropped on
/// disconnect, reachable from the scope of every handler call on that
/// connection.
pub struct ConnInfo {
    pub id: Uuid,
    pub peer_addr: SocketAddr,
    /// Internal maintenance tasks skip the authentication gate.
    pub bypass_auth: bool,
    auth: Mutex<AuthState>,
}

#[derive(Default)]
struct AuthState {
    user: Option<AuthUser>,
    // SCRAM conversation plus the database it authenticates against.
    scram: Option<(String, ScramConversation)>,
}

impl ConnInfo {
    pub fn new(peer_addr: SocketAddr) -> Self {
        Self {
            id: Uuid::new_v4(),
            peer_addr,
            bypass_auth: false,
            auth: Mutex::new(AuthState::default()),
        }
    }

    /// Connection info for internal tasks (capped cleanup, Data API).
    pub fn internal() -> Self {
        Self {
            id: Uuid::new_v4(),
            peer_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            bypass_auth: true,
            auth: Mutex::new(AuthState::default()),
        }
    }

    pub fn authenticated(&self) -> bool {
        self.bypass_auth || self.auth.lock().expect("conn state poisoned").user.is_some()
    }

    pub fn auth_user(&self) -> Option<AuthUser> {
        self.auth.lock().expect("conn state poisoned").user.clone()
    }

    pub fn set_auth_user(&self, user: String, db: String) {
        self.auth.lock().expect("conn state poisoned").user = Some((user, db));
    }

    /// Begin (or restart) a SCRAM conversation for `db`.
    pub fn set_scram(&self, db: String, conversation: ScramConversation) {
        self.auth.lock().expect("conn state poisoned").scram = Some((db, conversation));
    }

    /// Run `f` against the live SCRAM conversation, if any. The conversation
    /// stays attached afterwards so replays are observable.
    pub fn with_scram<R>(
        &self,
        f: impl FnOnce(Option<(&str, &mut ScramConversation)>) -> R,
    ) -> R {
        let mut state = self.auth.lock().expect("conn state poisoned");
        f(state.scram.as_mut().map(|(db, conv)| (db.as_str(), conv)))
    }
}

impl std::fmt::Debug for ConnInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnInfo")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("bypass_auth", &self.bypass_auth)
            .finish_non_exhaustive()
    }
}

/// Deadline + cancellation + request-scoped values, passed by value into
/// every handler and backend call. There is no thread-local fallback: a
/// scope either carries connection info or `conn()` fails loudly.
#[derive(Clone)]
pub struct Scope {
    cancel: watch::Receiver<bool>,
    // Keeps the channel open for detached scopes so the receiver never
    // observes a spurious close.
    _cancel_guard: Option<Arc<watch::Sender<bool>>>,
    deadline: Option<Instant>,
    conn: Option<Arc<ConnInfo>>,
    cursors: Option<Arc<CursorRegistry>>,
}

impl Scope {
    /// Root scope tied to a shutdown signal.
    pub fn root(cancel: watch::Receiver<bool>) -> Self {
        Self {
            cancel,
            _cancel_guard: None,
            deadline: None,
            conn: None,
            cursors: None,
        }
    }

    /// Detached scope with no cancellation source; used by tests and
    /// short-lived internal work.
    pub fn background() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            cancel: rx,
            _cancel_guard: Some(Arc::new(tx)),
            deadline: None,
            conn: None,
            cursors: None,
        }
    }

    pub fn with_conn(mut self, conn: Arc<ConnInfo>) -> Self {
        self.conn = Some(conn);
        self
    }

    pub fn with_cursors(mut self, cursors: Arc<CursorRegistry>) -> Self {
        self.cursors = Some(cursors);
        self
    }

    pub fn with_deadline_in(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    /// The connection info attached to this scope. A missing attachment is a
    /// programming error upstream; callers must never silently fall back.
    pub fn conn(&self) -> Result<&Arc<ConnInfo>> {
        self.conn.as_ref().ok_or(Error::MissingConnectionContext)
    }

    pub fn cursors(&self) -> Result<&Arc<CursorRegistry>> {
        self.cursors
            .as_ref()
            .ok_or(Error::MissingConnectionContext)
    }

    /// Register a cursor owned by this scope's connection.
    pub fn set_cursor(
        &self,
        db: impl Into<String>,
        collection: impl Into<String>,
        stream: DocStream,
    ) -> Result<Arc<CursorEntry>> {
        let owner = self.conn.as_ref().map(|c| c.id);
        self.cursors()?.register(db, collection, owner, stream)
    }

    pub fn cursor(&self, id: u64) -> Option<Arc<CursorEntry>> {
        self.cursors.as_ref().and_then(|r| r.get(id))
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Resolve when the scope is cancelled. Suspension points pair this with
    /// their own future inside `tokio::select!`.
    pub async fn cancelled(&self) {
        let mut rx = self.cancel.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                // Sender dropped without signalling; treat as cancelled.
                return;
            }
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time remaining before the deadline, `None` when unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn deadline_exceeded(&self) -> bool {
        matches!(self.remaining(), Some(d) if d.is_zero())
    }
}
