//! Per-conversation state: turns, the in-progress flag and the last error.
//!
//! A session turns inbound frames into an ordered turn list, sends user
//! turns through a [`MessageSink`], and writes the list to a [`TurnStore`]
//! after every change.

mod assembler;
mod store;

pub use assembler::{apply_frame, normalize, seal_streaming_tail, FrameOutcome};
pub use store::{storage_key, FileTurnStore, MemoryTurnStore, StoreError, StoreResult, TurnStore};

use async_trait::async_trait;
use std::sync::{Arc, Mutex as StdMutex, Weak};
use tokio::sync::{watch, Mutex};

use crate::config::ServiceConfig;
use crate::connection::MessageSink;
use crate::document::{DocumentSource, PageRange};
use crate::error::{ChatError, ChatResult};
use crate::protocol::InboundEnvelope;
use crate::router::{FrameHandler, MessageRouter, Registration};
use crate::types::{observe_turn_id, ConversationId, Turn};

/// Sent ahead of extracted document text when interpreting pages
pub const ANALYSIS_PREAMBLE: &str = "\
Summarize the plot of the following passage: its setting, main events and the \
conflicts that drive them. Then analyse each major character in turn: \
background, core problems and goals, motives, the decisions they face and why \
they choose as they do, how those decisions play out, and their consequences \
for the other characters. Ground every point in the text. The passage follows:";

/// Surfaced when an inbound frame cannot be parsed
pub const INVALID_REPLY: &str = "received an invalid reply";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStatus {
    /// A response is being awaited or streamed
    pub in_progress: bool,
    /// Last user-visible error
    pub error: Option<String>,
}

pub struct ConversationSession {
    id: ConversationId,
    config: ServiceConfig,
    store: Arc<dyn TurnStore>,
    outbound: Arc<dyn MessageSink>,
    turns: Mutex<Vec<Turn>>,
    turns_tx: watch::Sender<Vec<Turn>>,
    status_tx: watch::Sender<SessionStatus>,
    registration: StdMutex<Option<Registration>>,
}

impl ConversationSession {
    /// Open a session, loading any stored history for `id` before returning
    pub async fn open(
        id: impl Into<ConversationId>,
        config: ServiceConfig,
        store: Arc<dyn TurnStore>,
        outbound: Arc<dyn MessageSink>,
    ) -> StoreResult<Arc<Self>> {
        let id = id.into();
        let mut turns = store.load(&id).await?;
        normalize(&mut turns);
        if let Some(max_id) = turns.iter().map(|t| t.id).max() {
            observe_turn_id(max_id);
        }
        tracing::info!("Opened conversation {} with {} stored turns", id, turns.len());

        let (turns_tx, _) = watch::channel(turns.clone());
        let (status_tx, _) = watch::channel(SessionStatus::default());

        Ok(Arc::new(Self {
            id,
            config,
            store,
            outbound,
            turns: Mutex::new(turns),
            turns_tx,
            status_tx,
            registration: StdMutex::new(None),
        }))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Snapshot of the turn list
    pub fn turns(&self) -> Vec<Turn> {
        self.turns_tx.borrow().clone()
    }

    /// Notified with the full list after every change
    pub fn subscribe(&self) -> watch::Receiver<Vec<Turn>> {
        self.turns_tx.subscribe()
    }

    pub fn status(&self) -> SessionStatus {
        self.status_tx.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.status_tx.subscribe()
    }

    pub fn is_loading(&self) -> bool {
        self.status_tx.borrow().in_progress
    }

    pub fn error(&self) -> Option<String> {
        self.status_tx.borrow().error.clone()
    }

    /// Register with `router` as the active receiver of inbound frames.
    /// The registration lives as long as the session.
    pub fn attach(self: &Arc<Self>, router: &MessageRouter) {
        let handler = Arc::new(SessionHandler(Arc::downgrade(self)));
        let registration = router.register_handler(self.id.clone(), handler);
        let mut slot = self.registration.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Some(registration);
    }

    /// Stop receiving frames
    pub fn detach(&self) {
        let registration = self
            .registration
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        drop(registration);
    }

    /// Send `text` as a new user turn. Blank input is ignored.
    pub async fn send(&self, text: &str) -> ChatResult<()> {
        let content = text.trim();
        if content.is_empty() {
            return Ok(());
        }
        self.send_turn(content, content).await
    }

    /// Ask for an interpretation of `range` of `document`. The turn list
    /// shows a short request while the full page text goes to the service.
    pub async fn interpret(
        &self,
        document: &dyn DocumentSource,
        range: PageRange,
        label: &str,
    ) -> ChatResult<()> {
        let extracted = match document.extract_text(range).await {
            Ok(text) => text,
            Err(e) => {
                tracing::error!("Failed to extract pages {}: {}", range, e);
                let error = ChatError::from(e);
                self.fail(&error);
                return Err(error);
            }
        };
        let display = format!("Interpret \"{} {}\"", label, range);
        let prompt = format!("{}\n{}", ANALYSIS_PREAMBLE, extracted);
        self.send_turn(&display, &prompt).await
    }

    async fn send_turn(&self, display: &str, prompt: &str) -> ChatResult<()> {
        let payload = match serde_json::to_string(&self.config.envelope(prompt)) {
            Ok(payload) => payload,
            Err(e) => {
                let error = ChatError::from(e);
                self.fail(&error);
                return Err(error);
            }
        };

        {
            let mut turns = self.turns.lock().await;
            if let Some(cut) = seal_streaming_tail(&mut turns) {
                tracing::warn!("Turn {} closed before its response finished", cut);
            }
            turns.push(Turn::user(display));
            // Set before releasing the list so a fast reply cannot be
            // overtaken by this flag
            self.status_tx.send_replace(SessionStatus {
                in_progress: true,
                error: None,
            });
            self.commit(&turns).await;
        }

        match self.outbound.send_message(payload).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let error = ChatError::from(e);
                self.fail(&error);
                Err(error)
            }
        }
    }

    /// Apply one raw inbound frame
    pub async fn handle_frame(&self, raw: &str) {
        let envelope: InboundEnvelope = match serde_json::from_str(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!("Dropping malformed frame for {}: {}", self.id, e);
                self.status_tx.send_replace(SessionStatus {
                    in_progress: false,
                    error: Some(INVALID_REPLY.to_string()),
                });
                return;
            }
        };

        let mut turns = self.turns.lock().await;
        match apply_frame(&mut turns, &envelope) {
            FrameOutcome::Rejected { code, message } => {
                tracing::error!("Server returned error {}: {}", code, message);
                self.fail(&ChatError::Protocol { code, message });
            }
            FrameOutcome::Applied { changed, terminal } => {
                if changed {
                    self.commit(&turns).await;
                }
                if terminal {
                    self.status_tx.send_modify(|status| status.in_progress = false);
                }
            }
            FrameOutcome::Ignored => {
                tracing::debug!("Ignoring frame without choices");
            }
        }
    }

    /// Surface a connection-level error
    pub fn handle_connection_error(&self, message: &str) {
        self.status_tx.send_replace(SessionStatus {
            in_progress: false,
            error: Some(message.to_string()),
        });
    }

    fn fail(&self, error: &ChatError) {
        self.status_tx.send_replace(SessionStatus {
            in_progress: false,
            error: Some(error.to_string()),
        });
    }

    /// Publish and persist the list. Storage failures are logged; the
    /// in-memory list stays authoritative.
    async fn commit(&self, turns: &[Turn]) {
        self.turns_tx.send_replace(turns.to_vec());
        if let Err(e) = self.store.save(&self.id, turns).await {
            tracing::error!("Failed to persist conversation {}: {}", self.id, e);
        }
    }
}

/// Router-side handle; weak so the router never keeps a session alive
struct SessionHandler(Weak<ConversationSession>);

#[async_trait]
impl FrameHandler for SessionHandler {
    async fn handle_frame(&self, frame: &str) {
        if let Some(session) = self.0.upgrade() {
            session.handle_frame(frame).await;
        }
    }

    async fn handle_connection_error(&self, message: &str) {
        if let Some(session) = self.0.upgrade() {
            session.handle_connection_error(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::TextDocument;
    use crate::error::ConnectionError;
    use crate::protocol::{FragmentRole, OutboundEnvelope};
    use crate::types::Role;

    /// Records payloads; refuses them while `connected` is false
    struct FakeSink {
        connected: bool,
        sent: Mutex<Vec<String>>,
    }

    impl FakeSink {
        fn new(connected: bool) -> Arc<Self> {
            Arc::new(Self {
                connected,
                sent: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl MessageSink for FakeSink {
        async fn send_message(&self, payload: String) -> Result<(), ConnectionError> {
            if !self.connected {
                return Err(ConnectionError::NotConnected);
            }
            self.sent.lock().await.push(payload);
            Ok(())
        }
    }

    async fn session_with(
        store: Arc<MemoryTurnStore>,
        sink: Arc<FakeSink>,
    ) -> Arc<ConversationSession> {
        ConversationSession::open("1", ServiceConfig::default(), store, sink)
            .await
            .unwrap()
    }

    fn assistant_frame(status: i64, content: &str) -> String {
        serde_json::json!({
            "header": {"code": 0, "message": "Success"},
            "payload": {"choices": {"status": status, "text": [
                {"role": "assistant", "content": content}
            ]}}
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_send_appends_user_turn_and_transmits() {
        let sink = FakeSink::new(true);
        let session = session_with(Arc::new(MemoryTurnStore::new()), sink.clone()).await;

        session.send("  Hi  ").await.unwrap();

        let turns = session.turns();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].role, Role::User);
        assert_eq!(turns[0].content, "Hi");
        assert!(turns[0].is_complete);
        assert!(session.is_loading());

        let sent = sink.sent.lock().await;
        assert_eq!(sent.len(), 1);
        let envelope: OutboundEnvelope = serde_json::from_str(&sent[0]).unwrap();
        assert_eq!(envelope.payload.message.text.len(), 1);
        assert_eq!(envelope.payload.message.text[0].role, FragmentRole::User);
        assert_eq!(envelope.payload.message.text[0].content, "Hi");
    }

    #[tokio::test]
    async fn test_blank_send_is_noop() {
        let sink = FakeSink::new(true);
        let store = Arc::new(MemoryTurnStore::new());
        let session = session_with(store.clone(), sink.clone()).await;

        session.send("").await.unwrap();
        session.send("   ").await.unwrap();

        assert!(session.turns().is_empty());
        assert!(!session.is_loading());
        assert!(sink.sent.lock().await.is_empty());
        assert!(store.raw("1").await.is_none());
    }

    #[tokio::test]
    async fn test_send_while_disconnected_surfaces_error() {
        let sink = FakeSink::new(false);
        let session = session_with(Arc::new(MemoryTurnStore::new()), sink.clone()).await;
        let mut status = session.subscribe_status();

        let result = session.send("Hi").await;
        assert!(matches!(
            result,
            Err(ChatError::Connection(ConnectionError::NotConnected))
        ));

        // The flag was raised and then cleared
        assert!(status.has_changed().unwrap());
        let final_status = status.borrow_and_update().clone();
        assert!(!final_status.in_progress);
        assert_eq!(
            final_status.error.as_deref(),
            Some("websocket is not connected")
        );

        let turns = session.turns();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].content, "Hi");
        assert!(sink.sent.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_streamed_reply_completes_and_clears_loading() {
        let session = session_with(Arc::new(MemoryTurnStore::new()), FakeSink::new(true)).await;
        session.send("Hi").await.unwrap();

        session.handle_frame(&assistant_frame(0, "Hel")).await;
        assert!(session.is_loading());
        assert!(session.turns()[1].is_streaming());

        session.handle_frame(&assistant_frame(2, "lo")).await;
        let turns = session.turns();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[1].content, "Hello");
        assert!(turns[1].is_complete);
        assert!(!session.is_loading());
    }

    #[tokio::test]
    async fn test_frame_with_system_entry_still_streams() {
        let session = session_with(Arc::new(MemoryTurnStore::new()), FakeSink::new(true)).await;
        session.send("Hi").await.unwrap();

        let frame = serde_json::json!({
            "header": {"code": 0, "message": "Success"},
            "payload": {"choices": {"status": 2, "text": [
                {"role": "system", "content": "context"},
                {"role": "assistant", "content": "Hello"}
            ]}}
        })
        .to_string();
        session.handle_frame(&frame).await;

        let turns = session.turns();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[1].content, "Hello");
        assert!(turns[1].is_complete);
        assert!(session.error().is_none());
    }

    #[tokio::test]
    async fn test_protocol_error_keeps_turns() {
        let session = session_with(Arc::new(MemoryTurnStore::new()), FakeSink::new(true)).await;
        session.send("Hi").await.unwrap();
        let before = session.turns();

        session
            .handle_frame(r#"{"header": {"code": 10013, "message": "audit failed"}}"#)
            .await;

        assert_eq!(session.turns(), before);
        assert!(!session.is_loading());
        assert!(session.error().unwrap().contains("audit failed"));
    }

    #[tokio::test]
    async fn test_malformed_frame_is_dropped() {
        let session = session_with(Arc::new(MemoryTurnStore::new()), FakeSink::new(true)).await;
        session.send("Hi").await.unwrap();
        session.handle_frame(&assistant_frame(0, "partial")).await;
        let before = session.turns();

        session.handle_frame("{not json").await;

        assert_eq!(session.turns(), before);
        assert_eq!(session.error().as_deref(), Some(INVALID_REPLY));
        assert!(!session.is_loading());
    }

    #[tokio::test]
    async fn test_history_persists_across_sessions() {
        let store = Arc::new(MemoryTurnStore::new());
        let first = session_with(store.clone(), FakeSink::new(true)).await;
        first.send("Hi").await.unwrap();
        first.handle_frame(&assistant_frame(2, "Hello")).await;
        let saved = first.turns();
        let raw = store.raw("1").await.unwrap();
        drop(first);

        let second = session_with(store.clone(), FakeSink::new(true)).await;
        assert_eq!(second.turns(), saved);
        assert_eq!(serde_json::to_string(&second.turns()).unwrap(), raw);

        // New turns sort after the restored ones
        second.send("Again").await.unwrap();
        let turns = second.turns();
        assert!(turns[2].id > turns[1].id);
    }

    #[tokio::test]
    async fn test_sending_during_stream_seals_previous_reply() {
        let session = session_with(Arc::new(MemoryTurnStore::new()), FakeSink::new(true)).await;
        session.send("Hi").await.unwrap();
        session.handle_frame(&assistant_frame(1, "Hel")).await;

        session.send("Wait").await.unwrap();
        let turns = session.turns();
        assert_eq!(turns.len(), 3);
        assert!(turns.iter().all(|t| t.is_complete));

        // Late fragments start a fresh turn instead of reopening the old one
        session.handle_frame(&assistant_frame(2, "lo")).await;
        let turns = session.turns();
        assert_eq!(turns.len(), 4);
        assert_eq!(turns[1].content, "Hel");
        assert_eq!(turns[3].content, "lo");
    }

    #[tokio::test]
    async fn test_interpret_sends_pages_with_short_display() {
        let sink = FakeSink::new(true);
        let session = session_with(Arc::new(MemoryTurnStore::new()), sink.clone()).await;
        let document = TextDocument::from_text("page one\u{0C}page two\u{0C}page three");

        session
            .interpret(&document, "01-02".parse().unwrap(), "Chapter 1")
            .await
            .unwrap();

        assert_eq!(session.turns()[0].content, "Interpret \"Chapter 1 01-02\"");
        let sent = sink.sent.lock().await;
        let envelope: OutboundEnvelope = serde_json::from_str(&sent[0]).unwrap();
        let content = &envelope.payload.message.text[0].content;
        assert!(content.starts_with(ANALYSIS_PREAMBLE));
        assert!(content.ends_with("page one\npage two"));
    }

    #[tokio::test]
    async fn test_attached_session_receives_routed_frames() {
        let router = MessageRouter::new();
        let session = session_with(Arc::new(MemoryTurnStore::new()), FakeSink::new(true)).await;
        session.attach(&router);
        assert_eq!(router.active().as_deref(), Some("1"));

        assert!(router.deliver(&assistant_frame(2, "routed")).await);
        assert_eq!(session.turns()[0].content, "routed");

        router.notify_error("server unreachable").await;
        assert_eq!(session.error().as_deref(), Some("server unreachable"));

        drop(session);
        assert!(router.active().is_none());
    }
}
