//! Per-socket connection state.
//!
//! A [`Connection`] is the handle everything outside the socket pumps holds:
//! the hub stores it, the router replies through it. It never touches the
//! socket itself; frames go into a bounded queue drained by the outbound pump.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use axum::extract::ws::Utf8Bytes;
use metrics::counter;
use parking_lot::Mutex;
use sozvon_core::{Identity, ServerEvent};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::metrics::WS_DROPPED_FRAMES_TOTAL;

/// A serialized outbound event. Cheap to clone across recipients.
pub type Frame = Utf8Bytes;

/// One authenticated socket.
pub struct Connection {
    id: String,
    identity: Identity,
    tx: Mutex<Option<mpsc::Sender<Frame>>>,
    token: CancellationToken,
    closed: AtomicBool,
    dropped: AtomicU64,
    connected_at: Instant,
}

impl Connection {
    /// Create a connection and the receiving end of its outbound queue.
    ///
    /// The connection's token is a child of `parent`, so cancelling the
    /// parent (process shutdown) tears the connection down too.
    pub fn new(
        identity: Identity,
        capacity: usize,
        parent: &CancellationToken,
    ) -> (Self, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let conn = Self {
            id: format!("conn_{}", uuid::Uuid::now_v7().simple()),
            identity,
            tx: Mutex::new(Some(tx)),
            token: parent.child_token(),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
            connected_at: Instant::now(),
        };
        (conn, rx)
    }

    /// Unique id of this connection instance.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Who is on the other end.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Token observed by every task serving this connection.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Enqueue a frame without waiting.
    ///
    /// Returns `false` if the frame was not queued. A full queue drops the
    /// frame, bumps [`Connection::drop_count`] and logs a warning.
    pub fn send(&self, frame: Frame) -> bool {
        let guard = self.tx.lock();
        let Some(tx) = guard.as_ref() else {
            return false;
        };
        match tx.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                counter!(WS_DROPPED_FRAMES_TOTAL).increment(1);
                warn!(
                    identity = %self.identity,
                    conn_id = %self.id,
                    dropped,
                    "outbound queue full, dropping frame"
                );
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Serialize and enqueue a single event.
    pub fn send_event(&self, event: &ServerEvent) -> bool {
        match event.to_json() {
            Ok(json) => self.send(Frame::from(json)),
            Err(e) => {
                warn!(event = event.name(), error = %e, "failed to serialize event");
                false
            }
        }
    }

    /// Tear the connection down.
    ///
    /// The first call cancels the token and releases the queue sender; the
    /// outbound pump then closes the socket. Later calls do nothing and
    /// return `false`.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.token.cancel();
        drop(self.tx.lock().take());
        true
    }

    /// Whether [`Connection::close`] has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Frames dropped because the queue was full.
    pub fn drop_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Time since the connection was created.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("identity", &self.identity)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
