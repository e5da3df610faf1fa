//! Socket pumps for one connection, from upgrade through teardown.
//!
//! Each socket gets two tasks. The inbound pump reads frames under a read
//! deadline and hands them to the router. The outbound pump is the only
//! writer: it drains the connection queue and sends keepalive pings. Both
//! stop when the connection token is cancelled.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use futures::{Sink, SinkExt, Stream, StreamExt};
use metrics::{counter, gauge, histogram};
use sozvon_core::events::VALIDATION_ERROR;
use sozvon_core::{Identity, ServerEvent};
use sozvon_settings::SocketSettings;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::connection::{Connection, Frame};
use super::hub::RegisterOutcome;
use crate::metrics::{
    WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL, WS_CONNECTION_DURATION_SECONDS,
    WS_DISCONNECTIONS_TOTAL,
};
use crate::router::MessageRouter;

/// Everything a session needs besides its socket.
#[derive(Clone)]
pub struct SessionContext {
    /// Event router (also holds the hub).
    pub router: MessageRouter,
    /// Queue size and socket timings.
    pub socket: SocketSettings,
    /// Process shutdown token; connection tokens are its children.
    pub shutdown: CancellationToken,
}

/// Serve an upgraded socket for `identity` until it disconnects.
#[instrument(skip_all, fields(identity = %identity))]
pub async fn serve(socket: WebSocket, identity: Identity, ctx: SessionContext) {
    let (conn, rx) = Connection::new(identity, ctx.socket.queue_capacity, &ctx.shutdown);
    let conn = Arc::new(conn);
    let hub = ctx.router.hub().clone();

    match hub.register(Arc::clone(&conn)).await {
        RegisterOutcome::Rejected => {
            info!(conn_id = conn.id(), "session rejected");
            let mut socket = socket;
            let _ = tokio::time::timeout(ctx.socket.write_wait(), socket.send(Message::Close(None)))
                .await;
            return;
        }
        outcome => debug!(conn_id = conn.id(), ?outcome, "session registered"),
    }

    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);
    info!(conn_id = conn.id(), "client connected");

    let (sink, stream) = socket.split();
    let writer = tokio::spawn(outbound(sink, Arc::clone(&conn), rx, ctx.socket.clone()));
    inbound(stream, &conn, &ctx.router, ctx.socket.pong_wait()).await;

    let _ = conn.close();
    hub.unregister(Arc::clone(&conn)).await;
    if let Err(e) = writer.await {
        warn!(error = %e, "outbound pump panicked");
    }

    counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    histogram!(WS_CONNECTION_DURATION_SECONDS).record(conn.age().as_secs_f64());
    info!(
        conn_id = conn.id(),
        dropped = conn.drop_count(),
        "client disconnected"
    );
}

/// Read frames until the peer goes away, the deadline passes, or the
/// connection is closed. Always closes the connection before returning.
pub async fn inbound<R, E>(
    mut stream: R,
    conn: &Connection,
    router: &MessageRouter,
    pong_wait: Duration,
) where
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let mut deadline = Instant::now() + pong_wait;
    loop {
        let next = tokio::select! {
            () = conn.token().cancelled() => break,
            () = tokio::time::sleep_until(deadline) => {
                info!(conn_id = conn.id(), "read deadline exceeded");
                break;
            }
            next = stream.next() => next,
        };

        match next {
            Some(Ok(Message::Text(text))) => router.handle_frame(conn, text.as_str()).await,
            Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                Ok(text) => router.handle_frame(conn, text).await,
                Err(_) => {
                    debug!(len = data.len(), "non-UTF-8 binary frame");
                    let _ = conn.send_event(&ServerEvent::error(
                        VALIDATION_ERROR,
                        "binary frame is not valid UTF-8",
                    ));
                }
            },
            Some(Ok(Message::Pong(_))) => deadline = Instant::now() + pong_wait,
            // Pings are answered by the transport.
            Some(Ok(Message::Ping(_))) => {}
            Some(Ok(Message::Close(frame))) => {
                debug!(?frame, "client sent close frame");
                break;
            }
            Some(Err(e)) => {
                warn!(conn_id = conn.id(), error = %e, "read error");
                break;
            }
            None => {
                debug!("socket stream ended");
                break;
            }
        }
    }
    let _ = conn.close();
}

#[derive(Debug, thiserror::Error)]
enum WriteError {
    #[error("write timed out")]
    Timeout,
    #[error("{0}")]
    Sink(String),
}

async fn write<W>(sink: &mut W, msg: Message, wait: Duration) -> Result<(), WriteError>
where
    W: Sink<Message> + Unpin,
    W::Error: Display,
{
    match tokio::time::timeout(wait, sink.send(msg)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(WriteError::Sink(e.to_string())),
        Err(_) => Err(WriteError::Timeout),
    }
}

/// Drain the connection queue into the socket and send keepalive pings.
///
/// The only code that writes to the socket. On exit the connection is
/// closed, a close frame is attempted and the sink is closed once.
pub async fn outbound<W>(
    mut sink: W,
    conn: Arc<Connection>,
    mut rx: mpsc::Receiver<Frame>,
    socket: SocketSettings,
) where
    W: Sink<Message> + Unpin,
    W::Error: Display,
{
    let write_wait = socket.write_wait();
    let ping_period = socket.ping_period();
    let mut ticker = tokio::time::interval_at(Instant::now() + ping_period, ping_period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = conn.token().cancelled() => break,
            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = write(&mut sink, Message::Text(frame), write_wait).await {
                    warn!(conn_id = conn.id(), error = %e, "write failed");
                    break;
                }
            }
            _ = ticker.tick() => {
                if let Err(e) = write(&mut sink, Message::Ping(Bytes::new()), write_wait).await {
                    warn!(conn_id = conn.id(), error = %e, "ping failed");
                    break;
                }
            }
        }
    }

    let _ = conn.close();
    let _ = write(&mut sink, Message::Close(None), write_wait).await;
    let _ = tokio::time::timeout(write_wait, sink.close()).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc as fmpsc;
    use sozvon_settings::DuplicateSessionPolicy;
    use sozvon_store::SqliteChatStore;

    use crate::websocket::hub::Hub;

    fn settings() -> SocketSettings {
        SocketSettings {
            queue_capacity: 8,
            write_wait_ms: 1_000,
            pong_wait_ms: 10_000,
            max_message_size: 1024,
        }
    }

    fn conn() -> (Arc<Connection>, mpsc::Receiver<Frame>) {
        let (c, rx) = Connection::new(Identity::new("alice"), 8, &CancellationToken::new());
        (Arc::new(c), rx)
    }

    fn router() -> MessageRouter {
        let (hub, _) = Hub::spawn(DuplicateSessionPolicy::Takeover, 16);
        MessageRouter::new(Arc::new(SqliteChatStore::in_memory().unwrap()), hub)
    }

    #[tokio::test(start_paused = true)]
    async fn outbound_writes_queue_then_pings() {
        let (c, rx) = conn();
        let (sink, mut written) = fmpsc::unbounded::<Message>();
        assert!(c.send(Frame::from("one")));
        assert!(c.send(Frame::from("two")));

        let pump = tokio::spawn(outbound(sink, Arc::clone(&c), rx, settings()));

        assert_eq!(written.next().await, Some(Message::Text("one".into())));
        assert_eq!(written.next().await, Some(Message::Text("two".into())));
        // ping_period = 9s with pong_wait 10s.
        assert_eq!(written.next().await, Some(Message::Ping(Bytes::new())));

        let _ = c.close();
        pump.await.unwrap();
        assert_eq!(written.next().await, Some(Message::Close(None)));
        assert_eq!(written.next().await, None);
    }

    #[tokio::test]
    async fn outbound_failure_closes_connection() {
        let (c, rx) = conn();
        let (sink, written) = fmpsc::unbounded::<Message>();
        drop(written);
        assert!(c.send(Frame::from("lost")));
        outbound(sink, Arc::clone(&c), rx, settings()).await;
        assert!(c.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn inbound_deadline_closes_connection() {
        let (c, _rx) = conn();
        let (_tx, stream) = fmpsc::unbounded::<Result<Message, String>>();
        let started = Instant::now();
        inbound(stream, &c, &router(), Duration::from_secs(60)).await;
        assert!(c.is_closed());
        assert!(started.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn pong_extends_deadline() {
        let (c, _rx) = conn();
        let (tx, stream) = fmpsc::unbounded::<Result<Message, String>>();
        let router = router();
        let started = Instant::now();
        let feeder = tokio::spawn(async move {
            for _ in 0..3 {
                tokio::time::sleep(Duration::from_secs(40)).await;
                let _ = tx.unbounded_send(Ok(Message::Pong(Bytes::new())));
            }
            tx
        });
        inbound(stream, &c, &router, Duration::from_secs(60)).await;
        // Last pong at 120s, deadline at 180s.
        assert!(started.elapsed() >= Duration::from_secs(180));
        drop(feeder.await.unwrap());
    }

    #[tokio::test]
    async fn inbound_error_and_close_end_pump() {
        let router = router();

        let (c, _rx) = conn();
        let stream = futures::stream::iter(vec![Err::<Message, _>("reset".to_string())]);
        inbound(stream, &c, &router, Duration::from_secs(60)).await;
        assert!(c.is_closed());

        let (c, _rx) = conn();
        let stream = futures::stream::iter(vec![Ok::<_, String>(Message::Close(None))]);
        inbound(stream, &c, &router, Duration::from_secs(60)).await;
        assert!(c.is_closed());
    }

    #[tokio::test]
    async fn invalid_frames_answered_on_queue() {
        let router = router();
        let (c, mut rx) = conn();
        let stream = futures::stream::iter(vec![
            Ok::<_, String>(Message::Text("garbage".into())),
            Ok(Message::Binary(Bytes::from_static(&[0xff, 0xfe]))),
        ]);
        inbound(stream, &c, &router, Duration::from_secs(60)).await;

        for _ in 0..2 {
            let frame = rx.recv().await.unwrap();
            let v: serde_json::Value = serde_json::from_str(frame.as_str()).unwrap();
            assert_eq!(v["data"]["error"], "validation_error");
        }
    }
}
