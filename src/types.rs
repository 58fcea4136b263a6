use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Opaque ID types
pub type ConversationId = String;
pub type TurnId = u64;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One message in a conversation.
///
/// Field names follow the stored layout (`isComplete`) so histories written by
/// earlier clients load unchanged.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Turn {
    pub id: TurnId,
    pub role: Role,
    pub content: String,
    #[serde(rename = "isComplete")]
    pub is_complete: bool,
}

impl Turn {
    /// User turns are complete as soon as they exist
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            id: next_turn_id(),
            role: Role::User,
            content: content.into(),
            is_complete: true,
        }
    }

    pub fn assistant(content: impl Into<String>, is_complete: bool) -> Self {
        Self {
            id: next_turn_id(),
            role: Role::Assistant,
            content: content.into(),
            is_complete,
        }
    }

    /// True for an assistant turn still receiving fragments
    pub fn is_streaming(&self) -> bool {
        self.role == Role::Assistant && !self.is_complete
    }
}

static LAST_TURN_ID: AtomicU64 = AtomicU64::new(0);

/// Allocate a turn id: wall-clock milliseconds, bumped past the last id
/// handed out so ids stay strictly increasing within the process.
pub fn next_turn_id() -> TurnId {
    let now = chrono::Utc::now().timestamp_millis().max(0) as u64;
    let mut last = LAST_TURN_ID.load(Ordering::Relaxed);
    loop {
        let candidate = now.max(last + 1);
        match LAST_TURN_ID.compare_exchange_weak(
            last,
            candidate,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => return candidate,
            Err(actual) => last = actual,
        }
    }
}

/// Make sure ids allocated from now on sort after `id` (used after loading
/// a stored history whose ids may be ahead of the local clock).
pub fn observe_turn_id(id: TurnId) {
    LAST_TURN_ID.fetch_max(id, Ordering::Relaxed);
}

/// Connection lifecycle as seen by observers of the connection manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed(String),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_turn_ids_strictly_increase() {
        let ids: Vec<TurnId> = (0..1000).map(|_| next_turn_id()).collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_observed_id_moves_generator_forward() {
        let far_future = next_turn_id() + 10_000_000;
        observe_turn_id(far_future);
        assert!(next_turn_id() > far_future);
    }

    #[test]
    fn test_turn_serialization_layout() {
        let turn = Turn {
            id: 7,
            role: Role::Assistant,
            content: "Hello".to_string(),
            is_complete: false,
        };
        let json = serde_json::to_value(&turn).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"id": 7, "role": "assistant", "content": "Hello", "isComplete": false})
        );
    }

    #[test]
    fn test_user_turn_is_complete() {
        let turn = Turn::user("Hi");
        assert!(turn.is_complete);
        assert!(!turn.is_streaming());
        assert!(Turn::assistant("", false).is_streaming());
    }
}
