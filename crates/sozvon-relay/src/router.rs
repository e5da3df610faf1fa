//! Inbound event handling: validate, authorize, persist, fan out.

use std::collections::HashMap;
use std::sync::Arc;

use metrics::counter;
use parking_lot::Mutex;
use sozvon_core::events::{MessageNew, SendMessage, Typing};
use sozvon_core::{ClientEvent, Identity, ServerEvent};
use sozvon_store::{ChatStore, StoredMessage};
use tracing::{debug, info, instrument, warn};

use crate::errors::RouteError;
use crate::metrics::{MESSAGES_ROUTED_TOTAL, ROUTE_ERRORS_TOTAL};
use crate::websocket::connection::Connection;
use crate::websocket::hub::Hub;

/// Per-chat send locks. An entry lives only while someone holds or waits
/// on it.
type ChatLocks = Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>;

/// Routes decoded client events to the store and the hub.
#[derive(Clone)]
pub struct MessageRouter {
    store: Arc<dyn ChatStore>,
    hub: Hub,
    chat_locks: Arc<ChatLocks>,
}

impl MessageRouter {
    /// Create a router over a store and a hub handle.
    pub fn new(store: Arc<dyn ChatStore>, hub: Hub) -> Self {
        Self {
            store,
            hub,
            chat_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The hub this router fans out through.
    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    /// The backing store.
    pub fn store(&self) -> &Arc<dyn ChatStore> {
        &self.store
    }

    /// Handle one inbound text frame from `conn`.
    ///
    /// Failures are answered with an `error` event to `conn` only; the
    /// connection stays open.
    #[instrument(skip_all, fields(identity = %conn.identity(), conn_id = conn.id()))]
    pub async fn handle_frame(&self, conn: &Connection, text: &str) {
        let event = match ClientEvent::decode(text) {
            Ok(event) => event,
            Err(e) => {
                debug!(error = %e, "undecodable frame");
                reject(conn, &RouteError::from(e));
                return;
            }
        };

        match event {
            ClientEvent::MessageSend(msg) => {
                if let Err(e) = self.send_message(conn.identity(), msg).await {
                    reject(conn, &e);
                }
            }
            ClientEvent::TypingStart(req) => {
                self.typing(conn.identity(), &req.chat_id, true).await;
            }
            ClientEvent::TypingStop(req) => {
                self.typing(conn.identity(), &req.chat_id, false).await;
            }
        }
    }

    /// Persist a message and deliver it to every member of its chat.
    ///
    /// The first message of an inactive chat activates it, and every member
    /// gets `chat:created` before `message:new`. Activation failures are
    /// logged only: by then the message is stored and still gets delivered.
    pub async fn send_message(
        &self,
        sender: &Identity,
        msg: SendMessage,
    ) -> Result<StoredMessage, RouteError> {
        msg.validate()?;

        let members = self
            .store
            .members(&msg.chat_id)
            .await
            .map_err(RouteError::Members)?;
        if members.is_empty() {
            return Err(RouteError::ChatNotFound);
        }
        if !members.contains(sender) {
            return Err(RouteError::Forbidden);
        }

        // Save, activation and enqueue run under the chat's lock so that a
        // racing sender cannot get its message:new ahead of chat:created.
        let slot = ChatSlot::acquire(&self.chat_locks, &msg.chat_id);
        let _serial = slot.lock.lock().await;
        self.persist_and_fan_out(sender, &msg, &members).await
    }

    async fn persist_and_fan_out(
        &self,
        sender: &Identity,
        msg: &SendMessage,
        members: &[Identity],
    ) -> Result<StoredMessage, RouteError> {
        let saved = self
            .store
            .save_message(&msg.chat_id, sender, &msg.text)
            .await
            .map_err(RouteError::Save)?;

        match self.store.try_activate(&msg.chat_id).await {
            Ok(true) => {
                info!(chat_id = %msg.chat_id, "chat activated");
                self.hub
                    .send_to_many(members, &ServerEvent::chat_created(msg.chat_id.clone()))
                    .await;
            }
            Ok(false) => {}
            Err(e) => warn!(chat_id = %msg.chat_id, error = %e, "failed to activate chat"),
        }

        self.hub
            .send_to_many(members, &ServerEvent::MessageNew(message_new(&saved)))
            .await;
        counter!(MESSAGES_ROUTED_TOTAL).increment(1);
        debug!(
            chat_id = %saved.chat_id,
            message_id = %saved.id,
            recipients = members.len(),
            "message routed"
        );
        Ok(saved)
    }

    /// Relay a typing indicator to the other members of a chat.
    pub async fn typing(&self, sender: &Identity, chat_id: &str, started: bool) {
        if chat_id.is_empty() {
            debug!("typing event without chat id");
            return;
        }
        let members = match self.store.members(chat_id).await {
            Ok(members) if !members.is_empty() => members,
            Ok(_) => {
                debug!(chat_id, "typing event for unknown chat");
                return;
            }
            Err(e) => {
                debug!(chat_id, error = %e, "typing member lookup failed");
                return;
            }
        };

        let recipients: Vec<Identity> = members.into_iter().filter(|m| m != sender).collect();
        let payload = Typing {
            chat_id: chat_id.to_owned(),
            from: sender.to_string(),
        };
        let event = if started {
            ServerEvent::TypingStart(payload)
        } else {
            ServerEvent::TypingStop(payload)
        };
        self.hub.send_to_many(&recipients, &event).await;
    }
}

/// A claim on one chat's send lock; drops the map entry when the last
/// claimant leaves.
struct ChatSlot<'a> {
    locks: &'a ChatLocks,
    chat_id: &'a str,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl<'a> ChatSlot<'a> {
    fn acquire(locks: &'a ChatLocks, chat_id: &'a str) -> Self {
        let lock = Arc::clone(locks.lock().entry(chat_id.to_owned()).or_default());
        Self {
            locks,
            chat_id,
            lock,
        }
    }
}

impl Drop for ChatSlot<'_> {
    fn drop(&mut self) {
        let mut locks = self.locks.lock();
        // Only the map and this slot hold it.
        if Arc::strong_count(&self.lock) == 2 {
            let _ = locks.remove(self.chat_id);
        }
    }
}

fn message_new(saved: &StoredMessage) -> MessageNew {
    MessageNew {
        id: saved.id.clone(),
        chat_id: saved.chat_id.clone(),
        from: saved.sender.to_string(),
        text: saved.text.clone(),
        created_at: saved.created_at.clone(),
    }
}

fn reject(conn: &Connection, err: &RouteError) {
    let code = err.code();
    counter!(ROUTE_ERRORS_TOTAL, "code" => code).increment(1);
    let _ = conn.send_event(&ServerEvent::error(code, err.to_string()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use sozvon_settings::DuplicateSessionPolicy;
    use sozvon_store::{ChatSummary, Room, SqliteChatStore, StoreError};
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    use crate::websocket::connection::Frame;

    struct Harness {
        router: MessageRouter,
        store: Arc<SqliteChatStore>,
    }

    fn harness() -> Harness {
        let store = Arc::new(SqliteChatStore::in_memory().unwrap());
        let (hub, _) = Hub::spawn(DuplicateSessionPolicy::Takeover, 64);
        let dyn_store: Arc<dyn ChatStore> = store.clone();
        Harness {
            router: MessageRouter::new(dyn_store, hub),
            store,
        }
    }

    async fn online(hub: &Hub, login: &str) -> (Arc<Connection>, mpsc::Receiver<Frame>) {
        let (conn, rx) = Connection::new(Identity::new(login), 16, &CancellationToken::new());
        let conn = Arc::new(conn);
        let _ = hub.register(Arc::clone(&conn)).await;
        (conn, rx)
    }

    async fn next(rx: &mut mpsc::Receiver<Frame>) -> serde_json::Value {
        let frame = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        serde_json::from_str(frame.as_str()).unwrap()
    }

    async fn room(store: &SqliteChatStore, a: &str, b: &str) -> String {
        store
            .create_room(&[Identity::new(a), Identity::new(b)])
            .await
            .unwrap()
            .id
    }

    fn send(chat_id: &str, text: &str) -> SendMessage {
        SendMessage {
            chat_id: chat_id.into(),
            text: text.into(),
        }
    }

    #[tokio::test]
    async fn first_message_activates_then_delivers() {
        let h = harness();
        let chat = room(&h.store, "alice", "bob").await;
        let (_a, mut rx_a) = online(h.router.hub(), "alice").await;
        let (_b, mut rx_b) = online(h.router.hub(), "bob").await;

        let saved = h
            .router
            .send_message(&Identity::new("alice"), send(&chat, "hi"))
            .await
            .unwrap();

        for rx in [&mut rx_a, &mut rx_b] {
            let created = next(rx).await;
            assert_eq!(created["event"], "chat:created");
            assert_eq!(created["data"]["chatId"], chat.as_str());
            let msg = next(rx).await;
            assert_eq!(msg["event"], "message:new");
            assert_eq!(msg["data"]["id"], saved.id.as_str());
            assert_eq!(msg["data"]["from"], "alice");
            assert_eq!(msg["data"]["text"], "hi");
        }

        // Second message: no second activation.
        let _ = h
            .router
            .send_message(&Identity::new("bob"), send(&chat, "yo"))
            .await
            .unwrap();
        assert_eq!(next(&mut rx_a).await["event"], "message:new");
        assert_eq!(next(&mut rx_b).await["event"], "message:new");
    }

    #[tokio::test]
    async fn offline_member_still_persisted() {
        let h = harness();
        let chat = room(&h.store, "alice", "bob").await;
        let (_a, mut rx_a) = online(h.router.hub(), "alice").await;

        let _ = h
            .router
            .send_message(&Identity::new("alice"), send(&chat, "anyone?"))
            .await
            .unwrap();
        assert_eq!(next(&mut rx_a).await["event"], "chat:created");
        assert_eq!(next(&mut rx_a).await["event"], "message:new");

        let history = h.store.chat_messages(&chat, 50, 0).await.unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn validation_rejects_before_store() {
        let h = harness();
        let alice = Identity::new("alice");
        assert_matches!(
            h.router.send_message(&alice, send("", "x")).await,
            Err(RouteError::Validation(_))
        );
        assert_matches!(
            h.router.send_message(&alice, send("c1", "")).await,
            Err(RouteError::Validation(_))
        );
        let too_long = "a".repeat(sozvon_core::events::MAX_MESSAGE_LENGTH + 1);
        assert_matches!(
            h.router.send_message(&alice, send("c1", &too_long)).await,
            Err(RouteError::Validation(_))
        );
    }

    #[tokio::test]
    async fn boundary_length_accepted() {
        let h = harness();
        let chat = room(&h.store, "alice", "bob").await;
        let text = "a".repeat(sozvon_core::events::MAX_MESSAGE_LENGTH);
        assert!(h
            .router
            .send_message(&Identity::new("alice"), send(&chat, &text))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn unknown_chat_and_non_member() {
        let h = harness();
        let chat = room(&h.store, "alice", "bob").await;
        assert_matches!(
            h.router
                .send_message(&Identity::new("alice"), send("nope", "hi"))
                .await,
            Err(RouteError::ChatNotFound)
        );
        assert_matches!(
            h.router
                .send_message(&Identity::new("mallory"), send(&chat, "hi"))
                .await,
            Err(RouteError::Forbidden)
        );
        assert!(h.store.chat_messages(&chat, 50, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn handle_frame_replies_to_sender_only() {
        let h = harness();
        let chat = room(&h.store, "alice", "bob").await;
        let (a, mut rx_a) = online(h.router.hub(), "alice").await;
        let (_b, mut rx_b) = online(h.router.hub(), "bob").await;

        h.router.handle_frame(&a, "not json").await;
        let err = next(&mut rx_a).await;
        assert_eq!(err["event"], "error");
        assert_eq!(err["data"]["error"], "validation_error");

        let frame = format!(r#"{{"event":"message:send","data":{{"chatId":"{chat}","text":""}}}}"#);
        h.router.handle_frame(&a, &frame).await;
        let err = next(&mut rx_a).await;
        assert_eq!(err["data"]["error"], "validation_error");
        assert_eq!(err["data"]["message"], "message cannot be empty");

        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn typing_excludes_sender() {
        let h = harness();
        let chat = room(&h.store, "alice", "bob").await;
        let (a, mut rx_a) = online(h.router.hub(), "alice").await;
        let (_b, mut rx_b) = online(h.router.hub(), "bob").await;

        let frame = format!(r#"{{"event":"typing:start","data":{{"chatId":"{chat}"}}}}"#);
        h.router.handle_frame(&a, &frame).await;

        let ev = next(&mut rx_b).await;
        assert_eq!(ev["event"], "typing:start");
        assert_eq!(ev["data"]["from"], "alice");

        // Round-trip through the hub so anything addressed to alice would
        // already be queued.
        let _ = h.router.hub().connection_count().await;
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn typing_failures_are_silent() {
        let h = harness();
        let (a, mut rx_a) = online(h.router.hub(), "alice").await;
        h.router
            .handle_frame(&a, r#"{"event":"typing:stop","data":{"chatId":"missing"}}"#)
            .await;
        h.router
            .handle_frame(&a, r#"{"event":"typing:stop","data":{}}"#)
            .await;
        let _ = h.router.hub().connection_count().await;
        assert!(rx_a.try_recv().is_err());
    }

    /// Store double with switchable failures.
    struct FlakyStore {
        inner: SqliteChatStore,
        fail_members: bool,
        fail_save: bool,
        fail_activate: bool,
        /// Held after a successful activation, before returning.
        activate_delay: Option<std::time::Duration>,
    }

    #[async_trait]
    impl ChatStore for FlakyStore {
        async fn members(&self, chat_id: &str) -> sozvon_store::Result<Vec<Identity>> {
            if self.fail_members {
                return Err(StoreError::Internal("members".into()));
            }
            self.inner.members(chat_id).await
        }
        async fn save_message(
            &self,
            chat_id: &str,
            sender: &Identity,
            text: &str,
        ) -> sozvon_store::Result<StoredMessage> {
            if self.fail_save {
                return Err(StoreError::Internal("save".into()));
            }
            self.inner.save_message(chat_id, sender, text).await
        }
        async fn try_activate(&self, chat_id: &str) -> sozvon_store::Result<bool> {
            if self.fail_activate {
                return Err(StoreError::Internal("activate".into()));
            }
            let activated = self.inner.try_activate(chat_id).await?;
            if let (true, Some(delay)) = (activated, self.activate_delay) {
                tokio::time::sleep(delay).await;
            }
            Ok(activated)
        }
        async fn find_room(&self, a: &Identity, b: &Identity) -> sozvon_store::Result<Option<String>> {
            self.inner.find_room(a, b).await
        }
        async fn create_room(&self, members: &[Identity]) -> sozvon_store::Result<Room> {
            self.inner.create_room(members).await
        }
        async fn room(&self, chat_id: &str) -> sozvon_store::Result<Option<Room>> {
            self.inner.room(chat_id).await
        }
        async fn user_chats(&self, login: &Identity) -> sozvon_store::Result<Vec<ChatSummary>> {
            self.inner.user_chats(login).await
        }
        async fn chat_messages(
            &self,
            chat_id: &str,
            limit: u32,
            offset: u32,
        ) -> sozvon_store::Result<Vec<StoredMessage>> {
            self.inner.chat_messages(chat_id, limit, offset).await
        }
    }

    async fn flaky(
        fail_members: bool,
        fail_save: bool,
        fail_activate: bool,
    ) -> (MessageRouter, String) {
        let inner = SqliteChatStore::in_memory().unwrap();
        let chat = room(&inner, "alice", "bob").await;
        let store = FlakyStore {
            inner,
            fail_members,
            fail_save,
            fail_activate,
            activate_delay: None,
        };
        let (hub, _) = Hub::spawn(DuplicateSessionPolicy::Takeover, 64);
        (MessageRouter::new(Arc::new(store), hub), chat)
    }

    #[tokio::test]
    async fn member_lookup_failure_is_database_error() {
        let (router, chat) = flaky(true, false, false).await;
        let err = router
            .send_message(&Identity::new("alice"), send(&chat, "hi"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "database_error");
        assert_eq!(err.to_string(), "Failed to get chat members");
    }

    #[tokio::test]
    async fn save_failure_broadcasts_nothing() {
        let (router, chat) = flaky(false, true, false).await;
        let (_b, mut rx_b) = online(router.hub(), "bob").await;
        let err = router
            .send_message(&Identity::new("alice"), send(&chat, "hi"))
            .await
            .unwrap_err();
        assert_matches!(err, RouteError::Save(_));
        let _ = router.hub().connection_count().await;
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn activation_failure_still_delivers_message() {
        let (router, chat) = flaky(false, false, true).await;
        let (_b, mut rx_b) = online(router.hub(), "bob").await;
        let saved = router
            .send_message(&Identity::new("alice"), send(&chat, "hi"))
            .await
            .unwrap();
        let ev = next(&mut rx_b).await;
        assert_eq!(ev["event"], "message:new");
        assert_eq!(ev["data"]["id"], saved.id.as_str());
    }

    #[tokio::test]
    async fn racing_first_messages_keep_activation_first() {
        let inner = SqliteChatStore::in_memory().unwrap();
        let chat = room(&inner, "alice", "bob").await;
        let store = FlakyStore {
            inner,
            fail_members: false,
            fail_save: false,
            fail_activate: false,
            activate_delay: Some(std::time::Duration::from_millis(200)),
        };
        let (hub, _) = Hub::spawn(DuplicateSessionPolicy::Takeover, 64);
        let router = MessageRouter::new(Arc::new(store), hub);
        let (_a, _rx_a) = online(router.hub(), "alice").await;
        let (_b, mut rx_b) = online(router.hub(), "bob").await;

        let first = {
            let router = router.clone();
            let chat = chat.clone();
            tokio::spawn(async move {
                router
                    .send_message(&Identity::new("alice"), send(&chat, "one"))
                    .await
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let second = router
            .send_message(&Identity::new("bob"), send(&chat, "two"))
            .await;
        assert!(second.is_ok());
        assert!(first.await.unwrap().is_ok());

        let mut order = Vec::new();
        for _ in 0..3 {
            let ev = next(&mut rx_b).await;
            let text = ev["data"]["text"].as_str().unwrap_or_default();
            order.push(format!("{}:{text}", ev["event"].as_str().unwrap()));
        }
        assert_eq!(order, ["chat:created:", "message:new:one", "message:new:two"]);
        assert!(router.chat_locks.lock().is_empty());
    }

    #[tokio::test]
    async fn typing_only_needs_an_existing_chat() {
        let h = harness();
        let chat = room(&h.store, "alice", "bob").await;
        let (_a, mut rx_a) = online(h.router.hub(), "alice").await;
        let (_b, mut rx_b) = online(h.router.hub(), "bob").await;

        h.router.typing(&Identity::new("carol"), &chat, true).await;
        for rx in [&mut rx_a, &mut rx_b] {
            let ev = next(rx).await;
            assert_eq!(ev["event"], "typing:start");
            assert_eq!(ev["data"]["from"], "carol");
        }
    }
}
