use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tracing::debug;

use relay_core::types::{Message, Role};

/// Fixed per-message overhead in the token estimate.
pub const TOKEN_BASE_OVERHEAD: usize = 4;
const TOKEN_PADDING: usize = 3;
const TOKEN_DIVISOR: usize = 4;
/// Newest messages that survive any trim.
pub const MIN_RETAINED_MESSAGES: usize = 2;

/// Rough token cost of one message: `4 + (bytes + 3) / 4`.
pub fn estimate_message_tokens(message: &Message) -> usize {
    TOKEN_BASE_OVERHEAD + (message.content.len() + TOKEN_PADDING) / TOKEN_DIVISOR
}

pub fn estimate_tokens(messages: &[Message]) -> usize {
    messages.iter().map(estimate_message_tokens).sum()
}

fn trim_marker(removed: usize) -> Message {
    Message::system(format!(
        "[{removed} earlier messages trimmed to fit context window]"
    ))
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct HistoryStats {
    pub messages: usize,
    pub estimated_tokens: usize,
    pub user: usize,
    pub assistant: usize,
    pub system: usize,
}

/// Conversation log for one workflow. Readers always get copies.
#[derive(Debug, Default)]
pub struct History {
    messages: Mutex<Vec<Message>>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_messages(messages: Vec<Message>) -> Self {
        Self {
            messages: Mutex::new(messages),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Message>> {
        self.messages.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn append(&self, message: Message) {
        self.lock().push(message);
    }

    /// Independent copy of every message.
    pub fn snapshot(&self) -> Vec<Message> {
        self.lock().clone()
    }

    pub fn last(&self) -> Option<Message> {
        self.lock().last().cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Replace the whole conversation, e.g. with caller-supplied history.
    pub fn replace(&self, messages: Vec<Message>) {
        *self.lock() = messages;
    }

    pub fn estimate_tokens(&self) -> usize {
        estimate_tokens(&self.lock())
    }

    pub fn statistics(&self) -> HistoryStats {
        let messages = self.lock();
        let count = |role: Role| messages.iter().filter(|m| m.role == role).count();
        HistoryStats {
            messages: messages.len(),
            estimated_tokens: estimate_tokens(&messages),
            user: count(Role::User),
            assistant: count(Role::Assistant),
            system: count(Role::System),
        }
    }

    /// Shrink the history to roughly `max_window * (1 - trim_fraction)` tokens.
    ///
    /// The result is `[first, marker, newest...]` where at least
    /// [`MIN_RETAINED_MESSAGES`] of the newest messages are kept. Returns whether
    /// anything was removed.
    pub fn trim_if_needed(&self, max_window: usize, trim_fraction: f64) -> bool {
        let mut messages = self.lock();
        let n = messages.len();
        if n <= MIN_RETAINED_MESSAGES || max_window == 0 {
            return false;
        }

        let total = estimate_tokens(&messages);
        if total <= max_window {
            return false;
        }

        let fraction = trim_fraction.clamp(0.0, 0.99);
        let target = (max_window as f64 * (1.0 - fraction)) as usize;
        // Reserve room for the first message and a marker of the widest plausible size.
        let reserved = estimate_message_tokens(&messages[0]) + estimate_message_tokens(&trim_marker(n));
        let budget = target.saturating_sub(reserved);

        let mut kept = 0usize;
        let mut used = 0usize;
        for message in messages[1..].iter().rev() {
            let cost = estimate_message_tokens(message);
            if kept >= MIN_RETAINED_MESSAGES && used + cost > budget {
                break;
            }
            used += cost;
            kept += 1;
        }

        let tail_start = n - kept;
        if tail_start <= 1 {
            return false;
        }

        let removed = tail_start - 1;
        let mut trimmed = Vec::with_capacity(kept + 2);
        trimmed.push(messages[0].clone());
        trimmed.push(trim_marker(removed));
        trimmed.extend(messages.drain(tail_start..));
        *messages = trimmed;

        debug!(
            removed,
            before_tokens = total,
            after_tokens = estimate_tokens(&messages),
            "Trimmed conversation history"
        );
        true
    }
}
