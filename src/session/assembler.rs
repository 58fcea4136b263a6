//! Merges streamed response fragments into the turn list.

use crate::protocol::InboundEnvelope;
use crate::types::{Turn, TurnId};

/// What applying one inbound frame did to the turn list
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Non-zero header code; the list was not touched
    Rejected { code: i64, message: String },
    /// The frame was applied. `terminal` means the response is finished.
    Applied { changed: bool, terminal: bool },
    /// Successful frame without choices
    Ignored,
}

/// Apply one inbound frame to `turns`.
///
/// Assistant fragments extend the trailing incomplete assistant turn, or
/// start a new one when there is none. A terminal frame completes that turn.
/// Only the last turn can ever be left incomplete.
pub fn apply_frame(turns: &mut Vec<Turn>, envelope: &InboundEnvelope) -> FrameOutcome {
    if !envelope.is_success() {
        return FrameOutcome::Rejected {
            code: envelope.header.code,
            message: envelope.header.message.clone(),
        };
    }
    if envelope.choices().is_none() {
        return FrameOutcome::Ignored;
    }

    let terminal = envelope.is_terminal();
    let mut changed = false;

    for fragment in envelope.assistant_fragments() {
        if fragment.content.is_empty() {
            continue;
        }
        match turns.last_mut() {
            Some(last) if last.is_streaming() => last.content.push_str(&fragment.content),
            _ => turns.push(Turn::assistant(fragment.content.clone(), false)),
        }
        changed = true;
    }

    if terminal {
        if let Some(last) = turns.last_mut().filter(|t| t.is_streaming()) {
            last.is_complete = true;
            changed = true;
        }
    }

    FrameOutcome::Applied { changed, terminal }
}

/// Complete a trailing incomplete assistant turn so a new turn can follow it.
/// Returns the id of the turn that was cut short, if any.
pub fn seal_streaming_tail(turns: &mut [Turn]) -> Option<TurnId> {
    let last = turns.last_mut().filter(|t| t.is_streaming())?;
    last.is_complete = true;
    Some(last.id)
}

/// Restore the single-incomplete-tail invariant on a loaded history
pub fn normalize(turns: &mut [Turn]) {
    let len = turns.len();
    for turn in turns.iter_mut().take(len.saturating_sub(1)) {
        turn.is_complete = true;
    }
}
