//! Conversation memory and context-window trimming

use crate::core::constants::{prompt, role};
use crate::models::openai::ChatMessage;
use serde::Serialize;

/// Tokens added per message for role and framing
const MESSAGE_OVERHEAD_TOKENS: usize = 4;

/// Marker left where text was cut out of a message
const ELLIPSIS: char = '…';

/// Ordered message history of one session
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct History {
    messages: Vec<ChatMessage>,
}

impl History {
    /// History seeded with the system prompt and the assistant greeting
    pub fn seeded() -> Self {
        let mut history = Self::default();
        history.push(role::SYSTEM, prompt::SYSTEM);
        history.push(role::ASSISTANT, prompt::GREETING);
        history
    }

    /// Append a message; empty roles and empty contents are ignored
    pub fn push(&mut self, role: &str, content: &str) -> bool {
        if role.is_empty() || content.is_empty() {
            return false;
        }
        self.messages.push(ChatMessage::new(role, content));
        true
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }
}

/// Rough token count: a quarter of the characters plus framing overhead
pub fn estimate_tokens(message: &ChatMessage) -> usize {
    message.content.text().chars().count().div_ceil(4) + MESSAGE_OVERHEAD_TOKENS
}

/// Fit messages into `max_tokens`
///
/// System messages always stay. The newest other messages are kept while
/// they fit; when not even the newest one fits, its middle is cut out.
/// Kept messages retain their original order.
pub fn trim_messages(messages: &[ChatMessage], max_tokens: usize) -> Vec<ChatMessage> {
    let system_tokens: usize = messages
        .iter()
        .filter(|m| m.role == role::SYSTEM)
        .map(estimate_tokens)
        .sum();
    let mut remaining = max_tokens.saturating_sub(system_tokens);

    let mut keep = vec![false; messages.len()];
    for (i, message) in messages.iter().enumerate() {
        keep[i] = message.role == role::SYSTEM;
    }

    let mut kept_any = false;
    for (i, message) in messages.iter().enumerate().rev() {
        if message.role == role::SYSTEM {
            continue;
        }
        let tokens = estimate_tokens(message);
        if tokens > remaining {
            break;
        }
        remaining -= tokens;
        keep[i] = true;
        kept_any = true;
    }

    let newest = messages.iter().rposition(|m| m.role != role::SYSTEM);

    messages
        .iter()
        .enumerate()
        .filter_map(|(i, message)| {
            if keep[i] {
                Some(message.clone())
            } else if !kept_any && Some(i) == newest {
                let max_chars = remaining.saturating_sub(MESSAGE_OVERHEAD_TOKENS) * 4;
                Some(ChatMessage::new(
                    &message.role,
                    shorten_middle(&message.content.text(), max_chars),
                ))
            } else {
                None
            }
        })
        .collect()
}

/// Cut characters out of the middle so at most `max_chars` remain
fn shorten_middle(text: &str, max_chars: usize) -> String {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= max_chars {
        return text.to_string();
    }
    if max_chars <= 1 {
        return ELLIPSIS.to_string();
    }

    let keep = max_chars - 1;
    let head = keep.div_ceil(2);
    let tail = keep - head;

    let mut shortened: String = chars[..head].iter().collect();
    shortened.push(ELLIPSIS);
    shortened.extend(&chars[chars.len() - tail..]);
    shortened
}
