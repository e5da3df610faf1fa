//! Identity → connection directory.
//!
//! Every operation is a [`HubCommand`] on one bounded queue, consumed by a
//! single dispatcher task that owns the map. Registration, unregistration
//! and fan-out are therefore totally ordered with respect to each other, and
//! the map needs no lock. The dispatcher only ever calls
//! [`Connection::send`], which never waits.

use std::collections::HashMap;
use std::sync::Arc;

use metrics::counter;
use sozvon_core::{Identity, ServerEvent};
use sozvon_settings::DuplicateSessionPolicy;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::connection::{Connection, Frame};
use crate::metrics::WS_TAKEOVERS_TOTAL;

/// Result of [`Hub::register`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegisterOutcome {
    /// No previous connection for the identity.
    Registered,
    /// A previous connection was closed and replaced.
    Replaced,
    /// The identity is already online and the policy refuses newcomers.
    /// The new connection has been closed.
    Rejected,
}

/// Commands processed by the dispatcher.
pub enum HubCommand {
    /// Add a connection, applying the duplicate-session policy.
    Register {
        /// The new connection.
        conn: Arc<Connection>,
        /// Outcome.
        reply: oneshot::Sender<RegisterOutcome>,
    },
    /// Remove a connection if it is still the current one for its identity.
    Unregister {
        /// The connection going away.
        conn: Arc<Connection>,
    },
    /// Enqueue a frame to one identity.
    SendTo {
        /// Recipient.
        identity: Identity,
        /// Serialized event.
        frame: Frame,
    },
    /// Enqueue a frame to several identities.
    SendToMany {
        /// Recipients.
        identities: Vec<Identity>,
        /// Serialized event.
        frame: Frame,
    },
    /// Whether an identity has a live connection.
    IsOnline {
        /// Identity to look up.
        identity: Identity,
        /// Answer.
        reply: oneshot::Sender<bool>,
    },
    /// Number of live connections.
    Count {
        /// Answer.
        reply: oneshot::Sender<usize>,
    },
    /// Close and remove an identity's connection.
    Disconnect {
        /// Identity to evict.
        identity: Identity,
        /// Whether a connection was found.
        reply: oneshot::Sender<bool>,
    },
    /// Close every connection and stop the dispatcher.
    Shutdown {
        /// Signalled once all connections are closed.
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable handle to the hub dispatcher.
#[derive(Clone, Debug)]
pub struct Hub {
    tx: mpsc::Sender<HubCommand>,
}

impl Hub {
    /// Start a dispatcher task and return a handle to it.
    pub fn spawn(policy: DuplicateSessionPolicy, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let dispatcher = Dispatcher {
            clients: HashMap::new(),
            policy,
        };
        let handle = tokio::spawn(dispatcher.run(rx));
        (Self { tx }, handle)
    }

    /// Register a connection.
    ///
    /// Under [`DuplicateSessionPolicy::Takeover`] an existing connection for
    /// the same identity is closed before the new one is stored. Under
    /// [`DuplicateSessionPolicy::RejectNew`] the new connection is closed
    /// instead. If the hub has stopped, the connection is closed and
    /// reported as rejected.
    pub async fn register(&self, conn: Arc<Connection>) -> RegisterOutcome {
        let (reply, rx) = oneshot::channel();
        let cmd = HubCommand::Register {
            conn: Arc::clone(&conn),
            reply,
        };
        if self.tx.send(cmd).await.is_err() {
            let _ = conn.close();
            return RegisterOutcome::Rejected;
        }
        rx.await.unwrap_or_else(|_| {
            let _ = conn.close();
            RegisterOutcome::Rejected
        })
    }

    /// Unregister a connection. A no-op if the identity now maps elsewhere.
    pub async fn unregister(&self, conn: Arc<Connection>) {
        let _ = self.tx.send(HubCommand::Unregister { conn }).await;
    }

    /// Deliver an event to one identity, if online.
    pub async fn send_to(&self, identity: &Identity, event: &ServerEvent) {
        let Some(frame) = serialize(event) else {
            return;
        };
        let _ = self
            .tx
            .send(HubCommand::SendTo {
                identity: identity.clone(),
                frame,
            })
            .await;
    }

    /// Deliver an event to each online identity in `identities`.
    ///
    /// The event is serialized once and the frame shared by all recipients.
    pub async fn send_to_many(&self, identities: &[Identity], event: &ServerEvent) {
        if identities.is_empty() {
            return;
        }
        let Some(frame) = serialize(event) else {
            return;
        };
        let _ = self
            .tx
            .send(HubCommand::SendToMany {
                identities: identities.to_vec(),
                frame,
            })
            .await;
    }

    /// Whether `identity` has a live connection.
    pub async fn is_online(&self, identity: &Identity) -> bool {
        let (reply, rx) = oneshot::channel();
        let cmd = HubCommand::IsOnline {
            identity: identity.clone(),
            reply,
        };
        if self.tx.send(cmd).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Number of live connections.
    pub async fn connection_count(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(HubCommand::Count { reply }).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Close and remove `identity`'s connection. Returns whether one existed.
    pub async fn disconnect(&self, identity: &Identity) -> bool {
        let (reply, rx) = oneshot::channel();
        let cmd = HubCommand::Disconnect {
            identity: identity.clone(),
            reply,
        };
        if self.tx.send(cmd).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Close every connection and stop the dispatcher.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(HubCommand::Shutdown { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

fn serialize(event: &ServerEvent) -> Option<Frame> {
    match event.to_json() {
        Ok(json) => Some(Frame::from(json)),
        Err(e) => {
            warn!(event = event.name(), error = %e, "failed to serialize event");
            None
        }
    }
}

struct Dispatcher {
    clients: HashMap<Identity, Arc<Connection>>,
    policy: DuplicateSessionPolicy,
}

impl Dispatcher {
    async fn run(mut self, mut rx: mpsc::Receiver<HubCommand>) {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                HubCommand::Register { conn, reply } => {
                    let _ = reply.send(self.register(conn));
                }
                HubCommand::Unregister { conn } => self.unregister(&conn),
                HubCommand::SendTo { identity, frame } => {
                    if let Some(conn) = self.clients.get(&identity) {
                        let _ = conn.send(frame);
                    }
                }
                HubCommand::SendToMany { identities, frame } => {
                    let mut delivered = 0usize;
                    for identity in &identities {
                        if let Some(conn) = self.clients.get(identity) {
                            if conn.send(frame.clone()) {
                                delivered += 1;
                            }
                        }
                    }
                    debug!(recipients = identities.len(), delivered, "fan-out");
                }
                HubCommand::IsOnline { identity, reply } => {
                    let _ = reply.send(self.clients.contains_key(&identity));
                }
                HubCommand::Count { reply } => {
                    let _ = reply.send(self.clients.len());
                }
                HubCommand::Disconnect { identity, reply } => {
                    let found = self.clients.remove(&identity).map(|conn| conn.close());
                    if found.is_some() {
                        info!(%identity, "connection evicted");
                    }
                    let _ = reply.send(found.is_some());
                }
                HubCommand::Shutdown { reply } => {
                    let count = self.clients.len();
                    for (_, conn) in self.clients.drain() {
                        let _ = conn.close();
                    }
                    info!(closed = count, "hub stopped");
                    let _ = reply.send(());
                    return;
                }
            }
        }
        // Every handle dropped: close what is left.
        for (_, conn) in self.clients.drain() {
            let _ = conn.close();
        }
    }

    fn register(&mut self, conn: Arc<Connection>) -> RegisterOutcome {
        let identity = conn.identity().clone();
        let outcome = match self.clients.get(&identity) {
            None => RegisterOutcome::Registered,
            Some(existing) if existing.is_closed() => RegisterOutcome::Registered,
            Some(_) if self.policy == DuplicateSessionPolicy::RejectNew => {
                info!(%identity, conn_id = conn.id(), "duplicate session rejected");
                let _ = conn.close();
                return RegisterOutcome::Rejected;
            }
            Some(existing) => {
                info!(
                    %identity,
                    old = existing.id(),
                    new = conn.id(),
                    "closing existing connection"
                );
                let _ = existing.close();
                counter!(WS_TAKEOVERS_TOTAL).increment(1);
                RegisterOutcome::Replaced
            }
        };
        let _ = self.clients.insert(identity.clone(), conn);
        info!(%identity, total = self.clients.len(), "client registered");
        outcome
    }

    fn unregister(&mut self, conn: &Connection) {
        let current = self
            .clients
            .get(conn.identity())
            .is_some_and(|c| c.id() == conn.id());
        if current {
            let _ = self.clients.remove(conn.identity());
            info!(
                identity = %conn.identity(),
                total = self.clients.len(),
                "client unregistered"
            );
        } else {
            debug!(
                identity = %conn.identity(),
                conn_id = conn.id(),
                "stale unregister ignored"
            );
        }
    }
}
