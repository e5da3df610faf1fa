//! Client ↔ relay WebSocket tunnels.
//!
//! An [`EdgeSession`] owns one client socket and one upstream socket to the
//! relay. Three tasks share the tunnel token:
//!
//! - client → relay copy (also enforces the client read deadline)
//! - relay → client copy, into a bounded queue that drops on overflow
//! - client writer, which drains that queue and sends keepalive pings
//!
//! Whichever task ends first cancels the token and the others follow. Each
//! socket's sink is owned by exactly one task and closed once by it.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use metrics::{counter, gauge};
use parking_lot::Mutex;
use reqwest::Url;
use sozvon_core::Identity;
use sozvon_settings::{DuplicateSessionPolicy, SocketSettings};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_tungstenite::tungstenite::Message as UpstreamMessage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::errors::{GatewayError, Result};
use crate::metrics::{DIAL_FAILURES_TOTAL, DROPPED_FRAMES_TOTAL, TUNNELS_ACTIVE, TUNNELS_TOTAL};

/// One client's tunnel, as seen by the registry.
pub struct Tunnel {
    id: String,
    identity: Identity,
    token: CancellationToken,
    closed: AtomicBool,
    opened_at: Instant,
}

impl Tunnel {
    /// Create a tunnel whose token is a child of `parent`.
    pub fn new(identity: Identity, parent: &CancellationToken) -> Self {
        Self {
            id: format!("tun_{}", uuid::Uuid::now_v7().simple()),
            identity,
            token: parent.child_token(),
            closed: AtomicBool::new(false),
            opened_at: Instant::now(),
        }
    }

    /// Unique id of this tunnel.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Who the tunnel belongs to.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Token shared by the tunnel's tasks.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Tear the tunnel down. Only the first call returns `true`.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.token.cancel();
        true
    }

    /// Whether [`Tunnel::close`] has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Time since the tunnel was created.
    pub fn age(&self) -> Duration {
        self.opened_at.elapsed()
    }
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("id", &self.id)
            .field("identity", &self.identity)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Outcome of [`TunnelRegistry::register`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    /// First tunnel for the identity.
    Admitted,
    /// An older tunnel was closed to make room.
    Replaced,
    /// The identity already has a tunnel and the policy refuses another.
    Rejected,
}

/// Identity → live tunnel.
#[derive(Debug)]
pub struct TunnelRegistry {
    tunnels: Mutex<HashMap<Identity, Arc<Tunnel>>>,
    policy: DuplicateSessionPolicy,
}

impl TunnelRegistry {
    /// Create an empty registry with the given duplicate-session policy.
    pub fn new(policy: DuplicateSessionPolicy) -> Self {
        Self {
            tunnels: Mutex::new(HashMap::new()),
            policy,
        }
    }

    /// The duplicate-session policy.
    pub fn policy(&self) -> DuplicateSessionPolicy {
        self.policy
    }

    /// Add a tunnel, applying the duplicate-session policy.
    pub fn register(&self, tunnel: Arc<Tunnel>) -> Admission {
        let mut tunnels = self.tunnels.lock();
        let outcome = match tunnels.get(tunnel.identity()) {
            Some(existing) if !existing.is_closed() => {
                if self.policy == DuplicateSessionPolicy::RejectNew {
                    let _ = tunnel.close();
                    return Admission::Rejected;
                }
                info!(
                    identity = %tunnel.identity(),
                    old = existing.id(),
                    new = tunnel.id(),
                    "closing existing tunnel"
                );
                let _ = existing.close();
                Admission::Replaced
            }
            _ => Admission::Admitted,
        };
        let _ = tunnels.insert(tunnel.identity().clone(), tunnel);
        outcome
    }

    /// Remove a tunnel if it is still the current one for its identity.
    pub fn unregister(&self, tunnel: &Tunnel) -> bool {
        let mut tunnels = self.tunnels.lock();
        let current = tunnels
            .get(tunnel.identity())
            .is_some_and(|t| t.id() == tunnel.id());
        if current {
            let _ = tunnels.remove(tunnel.identity());
        }
        current
    }

    /// Close and remove `identity`'s tunnel. Returns whether one existed.
    pub fn disconnect(&self, identity: &Identity) -> bool {
        let removed = self.tunnels.lock().remove(identity);
        match removed {
            Some(tunnel) => {
                let _ = tunnel.close();
                info!(%identity, "tunnel evicted");
                true
            }
            None => false,
        }
    }

    /// The tunnel currently registered for `identity`.
    pub fn get(&self, identity: &Identity) -> Option<Arc<Tunnel>> {
        self.tunnels.lock().get(identity).cloned()
    }

    /// Whether `identity` has a live tunnel.
    pub fn contains(&self, identity: &Identity) -> bool {
        self.tunnels
            .lock()
            .get(identity)
            .is_some_and(|t| !t.is_closed())
    }

    /// Number of registered tunnels.
    pub fn count(&self) -> usize {
        self.tunnels.lock().len()
    }

    /// Close every tunnel.
    pub fn close_all(&self) {
        for (_, tunnel) in self.tunnels.lock().drain() {
            let _ = tunnel.close();
        }
    }
}

/// Everything an edge session needs besides its client socket.
#[derive(Clone, Debug)]
pub struct EdgeContext {
    /// Live tunnels.
    pub registry: Arc<TunnelRegistry>,
    /// Base WebSocket URL of the relay.
    pub relay_url: Url,
    /// Upstream handshake deadline.
    pub dial_timeout: Duration,
    /// Client-facing queue and socket timings.
    pub socket: SocketSettings,
    /// Process shutdown token.
    pub shutdown: CancellationToken,
}

/// The relay `/ws` URL carrying `token`.
pub fn upstream_url(relay_url: &Url, token: &str) -> Result<Url> {
    let mut url = relay_url.join("/ws").map_err(|e| GatewayError::InvalidUrl {
        what: "relay",
        url: relay_url.to_string(),
        reason: e.to_string(),
    })?;
    let _ = url.query_pairs_mut().clear().append_pair("token", token);
    Ok(url)
}

/// Parse and check the configured relay URL.
pub fn parse_relay_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw).map_err(|e| GatewayError::InvalidUrl {
        what: "relay",
        url: raw.to_owned(),
        reason: e.to_string(),
    })?;
    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(GatewayError::InvalidUrl {
            what: "relay",
            url: raw.to_owned(),
            reason: "scheme must be ws or wss".into(),
        });
    }
    Ok(url)
}

/// A client socket bridged to the relay.
pub struct EdgeSession {
    tunnel: Arc<Tunnel>,
    ctx: EdgeContext,
}

impl EdgeSession {
    /// Admit a tunnel for `identity`. `None` if the policy rejected it.
    pub fn admit(identity: Identity, ctx: EdgeContext) -> Option<Self> {
        let tunnel = Arc::new(Tunnel::new(identity, &ctx.shutdown));
        match ctx.registry.register(Arc::clone(&tunnel)) {
            Admission::Rejected => None,
            _ => Some(Self { tunnel, ctx }),
        }
    }

    /// The registry entry for this session.
    pub fn tunnel(&self) -> &Arc<Tunnel> {
        &self.tunnel
    }

    /// Dial the relay with `token` and relay frames until either side ends.
    #[instrument(skip_all, fields(identity = %self.tunnel.identity(), tunnel_id = self.tunnel.id()))]
    pub async fn run(self, client: WebSocket, token: String) {
        let upstream = match self.dial(&token).await {
            Ok(upstream) => upstream,
            Err(e) => {
                warn!(error = %e, "cannot reach relay, closing client");
                counter!(DIAL_FAILURES_TOTAL).increment(1);
                let mut client = client;
                let _ = tokio::time::timeout(
                    self.ctx.socket.write_wait(),
                    client.send(Message::Close(None)),
                )
                .await;
                let _ = self.tunnel.close();
                let _ = self.ctx.registry.unregister(&self.tunnel);
                return;
            }
        };

        counter!(TUNNELS_TOTAL).increment(1);
        gauge!(TUNNELS_ACTIVE).increment(1.0);
        info!("tunnel open");

        let (client_sink, client_stream) = client.split();
        let (upstream_sink, upstream_stream) = upstream.split();
        let (queue_tx, queue_rx) = mpsc::channel(self.ctx.socket.queue_capacity.max(1));
        let token = self.tunnel.token().clone();
        let socket = self.ctx.socket.clone();

        let to_relay = tokio::spawn(client_to_relay(
            client_stream,
            upstream_sink,
            token.clone(),
            socket.pong_wait(),
            socket.write_wait(),
        ));
        let to_client = tokio::spawn(relay_to_client(upstream_stream, queue_tx, token.clone()));
        client_writer(client_sink, queue_rx, token, socket).await;

        for (name, handle) in [("client_to_relay", to_relay), ("relay_to_client", to_client)] {
            if let Err(e) = handle.await {
                warn!(task = name, error = %e, "tunnel task panicked");
            }
        }

        let _ = self.tunnel.close();
        let _ = self.ctx.registry.unregister(&self.tunnel);
        gauge!(TUNNELS_ACTIVE).decrement(1.0);
        info!(age_secs = self.tunnel.age().as_secs(), "tunnel closed");
    }

    async fn dial(
        &self,
        token: &str,
    ) -> Result<
        tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    > {
        let url = upstream_url(&self.ctx.relay_url, token)?;
        let dial = tokio_tungstenite::connect_async(url.as_str());
        let (stream, _) = tokio::select! {
            () = self.tunnel.token().cancelled() => {
                return Err(GatewayError::Client("tunnel closed while dialing".into()));
            }
            dialed = tokio::time::timeout(self.ctx.dial_timeout, dial) => {
                dialed.map_err(|_| GatewayError::DialTimeout(self.ctx.dial_timeout))??
            }
        };
        debug!("relay dialed");
        Ok(stream)
    }
}

fn to_upstream(msg: Message) -> Option<UpstreamMessage> {
    match msg {
        Message::Text(text) => Some(UpstreamMessage::text(text.as_str())),
        Message::Binary(data) => Some(UpstreamMessage::Binary(data)),
        _ => None,
    }
}

fn to_client(msg: UpstreamMessage) -> Option<Message> {
    match msg {
        UpstreamMessage::Text(text) => Some(Message::Text(text.as_str().into())),
        UpstreamMessage::Binary(data) => Some(Message::Binary(data)),
        _ => None,
    }
}

async fn send_within<W, M>(sink: &mut W, msg: M, wait: Duration) -> std::result::Result<(), String>
where
    W: Sink<M> + Unpin,
    W::Error: std::fmt::Display,
{
    match tokio::time::timeout(wait, sink.send(msg)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err("write timed out".into()),
    }
}

/// Forward client data frames upstream under the client read deadline.
/// Owns the upstream sink and closes it on exit.
async fn client_to_relay<R, E, W>(
    mut client: R,
    mut upstream: W,
    token: CancellationToken,
    pong_wait: Duration,
    write_wait: Duration,
) where
    R: Stream<Item = std::result::Result<Message, E>> + Unpin,
    E: std::fmt::Display,
    W: Sink<UpstreamMessage> + Unpin,
    W::Error: std::fmt::Display,
{
    let mut deadline = tokio::time::Instant::now() + pong_wait;
    loop {
        let next = tokio::select! {
            () = token.cancelled() => break,
            () = tokio::time::sleep_until(deadline) => {
                info!("client read deadline exceeded");
                break;
            }
            next = client.next() => next,
        };
        match next {
            Some(Ok(Message::Pong(_))) => deadline = tokio::time::Instant::now() + pong_wait,
            Some(Ok(Message::Close(frame))) => {
                debug!(?frame, "client closed");
                break;
            }
            Some(Ok(msg)) => {
                let Some(frame) = to_upstream(msg) else { continue };
                if let Err(e) = send_within(&mut upstream, frame, write_wait).await {
                    warn!(error = %e, "relay write failed");
                    break;
                }
            }
            Some(Err(e)) => {
                warn!(error = %e, "client read error");
                break;
            }
            None => break,
        }
    }
    token.cancel();
    let _ = send_within(&mut upstream, UpstreamMessage::Close(None), write_wait).await;
    let _ = tokio::time::timeout(write_wait, upstream.close()).await;
}

/// Copy relay frames into the client queue without waiting.
async fn relay_to_client<R, E>(mut upstream: R, queue: mpsc::Sender<Message>, token: CancellationToken)
where
    R: Stream<Item = std::result::Result<UpstreamMessage, E>> + Unpin,
    E: std::fmt::Display,
{
    let mut dropped: u64 = 0;
    loop {
        let next = tokio::select! {
            () = token.cancelled() => break,
            next = upstream.next() => next,
        };
        match next {
            Some(Ok(UpstreamMessage::Close(frame))) => {
                debug!(?frame, "relay closed");
                break;
            }
            Some(Ok(msg)) => {
                let Some(frame) = to_client(msg) else { continue };
                match queue.try_send(frame) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        dropped += 1;
                        counter!(DROPPED_FRAMES_TOTAL).increment(1);
                        warn!(dropped, "client queue full, dropping frame");
                    }
                    Err(TrySendError::Closed(_)) => break,
                }
            }
            Some(Err(e)) => {
                warn!(error = %e, "relay read error");
                break;
            }
            None => break,
        }
    }
    token.cancel();
}

/// The only writer on the client socket: queued frames plus pings.
async fn client_writer<W>(
    mut client: W,
    mut queue: mpsc::Receiver<Message>,
    token: CancellationToken,
    socket: SocketSettings,
) where
    W: Sink<Message> + Unpin,
    W::Error: std::fmt::Display,
{
    let write_wait = socket.write_wait();
    let ping_period = socket.ping_period();
    let mut ticker =
        tokio::time::interval_at(tokio::time::Instant::now() + ping_period, ping_period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = token.cancelled() => break,
            frame = queue.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = send_within(&mut client, frame, write_wait).await {
                    warn!(error = %e, "client write failed");
                    break;
                }
            }
            _ = ticker.tick() => {
                if let Err(e) = send_within(&mut client, Message::Ping(Bytes::new()), write_wait).await {
                    warn!(error = %e, "client ping failed");
                    break;
                }
            }
        }
    }
    token.cancel();
    let _ = send_within(&mut client, Message::Close(None), write_wait).await;
    let _ = tokio::time::timeout(write_wait, client.close()).await;
}
