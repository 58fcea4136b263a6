//! Routes inbound frames from the single connection to whichever
//! conversation is currently active.
//!
//! Handlers are registered per conversation id. Registering makes that
//! conversation the active receiver; frames arriving while nothing is active
//! are dropped (no buffering, no replay). Other registrations stay in place
//! and can be re-activated with [`MessageRouter::activate`].

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockWriteGuard};

use crate::types::ConversationId;

/// Receiver of inbound frames
#[async_trait]
pub trait FrameHandler: Send + Sync {
    /// Called once per inbound frame, in transport order
    async fn handle_frame(&self, frame: &str);

    /// Called when the connection reports an error
    async fn handle_connection_error(&self, _message: &str) {}
}

struct Registered {
    token: u64,
    handler: Arc<dyn FrameHandler>,
}

#[derive(Default)]
struct RouterState {
    handlers: HashMap<ConversationId, Registered>,
    active: Option<ConversationId>,
    next_token: u64,
}

#[derive(Clone, Default)]
pub struct MessageRouter {
    state: Arc<RwLock<RouterState>>,
}

impl MessageRouter {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> RwLockWriteGuard<'_, RouterState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Register `handler` for `key` and make it the active receiver.
    ///
    /// A previous handler for the same key is replaced. Dropping the returned
    /// guard removes this registration.
    pub fn register_handler(
        &self,
        key: impl Into<ConversationId>,
        handler: Arc<dyn FrameHandler>,
    ) -> Registration {
        let key = key.into();
        let mut state = self.state();
        state.next_token += 1;
        let token = state.next_token;

        if let Some(previous) = state.active.as_ref().filter(|active| **active != key) {
            tracing::debug!("Conversation {} displaces active conversation {}", key, previous);
        }
        state
            .handlers
            .insert(key.clone(), Registered { token, handler });
        state.active = Some(key.clone());

        Registration {
            router: self.clone(),
            key,
            token,
        }
    }

    /// Point delivery at an already registered conversation
    pub fn activate(&self, key: &str) -> bool {
        let mut state = self.state();
        if state.handlers.contains_key(key) {
            state.active = Some(key.to_string());
            true
        } else {
            false
        }
    }

    pub fn active(&self) -> Option<ConversationId> {
        self.state().active.clone()
    }

    pub fn is_registered(&self, key: &str) -> bool {
        self.state().handlers.contains_key(key)
    }

    fn deregister(&self, key: &str, token: u64) {
        let mut state = self.state();
        // A newer registration for the same key is left alone
        if state.handlers.get(key).map(|r| r.token) != Some(token) {
            return;
        }
        state.handlers.remove(key);
        if state.active.as_deref() == Some(key) {
            state.active = None;
        }
        tracing::debug!("Conversation {} deregistered", key);
    }

    fn active_handler(&self) -> Option<Arc<dyn FrameHandler>> {
        let state = self.state();
        let active = state.active.as_ref()?;
        state.handlers.get(active).map(|r| r.handler.clone())
    }

    /// Hand `frame` to the active handler. Returns false if it was dropped.
    pub async fn deliver(&self, frame: &str) -> bool {
        match self.active_handler() {
            Some(handler) => {
                handler.handle_frame(frame).await;
                true
            }
            None => {
                tracing::debug!("No active conversation, dropping frame");
                false
            }
        }
    }

    /// Forward a connection error to the active handler
    pub async fn notify_error(&self, message: &str) -> bool {
        match self.active_handler() {
            Some(handler) => {
                handler.handle_connection_error(message).await;
                true
            }
            None => false,
        }
    }
}

/// Keeps a handler registered; dropping it deregisters
pub struct Registration {
    router: MessageRouter,
    key: ConversationId,
    token: u64,
}

impl Registration {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.router.deregister(&self.key, self.token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        frames: Mutex<Vec<String>>,
        errors: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl FrameHandler for Recorder {
        async fn handle_frame(&self, frame: &str) {
            self.frames.lock().await.push(frame.to_string());
        }

        async fn handle_connection_error(&self, message: &str) {
            self.errors.lock().await.push(message.to_string());
        }
    }

    #[tokio::test]
    async fn test_frames_dropped_without_handler() {
        let router = MessageRouter::new();
        assert!(!router.deliver("frame").await);
    }

    #[tokio::test]
    async fn test_delivery_in_order() {
        let router = MessageRouter::new();
        let recorder = Arc::new(Recorder::default());
        let _registration = router.register_handler("1", recorder.clone());

        for frame in ["a", "b", "c"] {
            assert!(router.deliver(frame).await);
        }
        assert_eq!(*recorder.frames.lock().await, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_last_registration_wins() {
        let router = MessageRouter::new();
        let first = Arc::new(Recorder::default());
        let second = Arc::new(Recorder::default());

        let _r1 = router.register_handler("1", first.clone());
        let _r2 = router.register_handler("2", second.clone());
        router.deliver("frame").await;

        assert!(first.frames.lock().await.is_empty());
        assert_eq!(second.frames.lock().await.len(), 1);

        // The displaced conversation is still registered and can take over again
        assert!(router.activate("1"));
        router.deliver("again").await;
        assert_eq!(*first.frames.lock().await, vec!["again"]);
    }

    #[tokio::test]
    async fn test_reregistering_same_key_replaces_handler() {
        let router = MessageRouter::new();
        let old = Arc::new(Recorder::default());
        let new = Arc::new(Recorder::default());

        let stale = router.register_handler("1", old.clone());
        let _fresh = router.register_handler("1", new.clone());

        // Dropping the stale guard must not remove the replacement
        drop(stale);
        assert!(router.is_registered("1"));

        router.deliver("frame").await;
        assert!(old.frames.lock().await.is_empty());
        assert_eq!(new.frames.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_drop_registration_deregisters() {
        let router = MessageRouter::new();
        let recorder = Arc::new(Recorder::default());
        let registration = router.register_handler("1", recorder.clone());
        assert_eq!(registration.key(), "1");
        drop(registration);

        assert!(router.active().is_none());
        assert!(!router.deliver("frame").await);
        assert!(!router.activate("1"));
    }

    #[tokio::test]
    async fn test_errors_go_to_active_handler() {
        let router = MessageRouter::new();
        let recorder = Arc::new(Recorder::default());
        let _registration = router.register_handler("1", recorder.clone());

        assert!(router.notify_error("boom").await);
        assert_eq!(*recorder.errors.lock().await, vec!["boom"]);
    }
}
