//! Token estimation.
//!
//! Uses a simple heuristic: ~4 characters per token. The budget exists to
//! prevent order-of-magnitude overruns, so tokenizer fidelity is not a goal.

use super::message::Message;

/// Characters per token estimate.
const CHARS_PER_TOKEN: usize = 4;

/// Fixed cost charged to every message for role and framing.
pub const MESSAGE_OVERHEAD: usize = 8;

/// Estimate token count for a string.
#[inline]
pub fn estimate_tokens(text: &str) -> usize {
    let chars = text.chars().count();
    (chars + CHARS_PER_TOKEN - 1) / CHARS_PER_TOKEN
}

/// Estimated cost of one message: content, serialized tool calls, overhead.
pub fn message_tokens(msg: &Message) -> usize {
    let calls = match msg.tool_calls.as_ref() {
        Some(calls) if !calls.is_empty() => {
            serde_json::to_string(calls).map(|s| estimate_tokens(&s)).unwrap_or(0)
        }
        _ => 0,
    };
    estimate_tokens(&msg.content) + calls + MESSAGE_OVERHEAD
}

/// Estimated cost of a message sequence.
pub fn messages_tokens<'a>(messages: impl IntoIterator<Item = &'a Message>) -> usize {
    messages.into_iter().map(message_tokens).sum()
}

/// Truncate text to at most `max_chars` characters, marking how much was cut.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        None => text.to_string(),
        Some((end, _)) => {
            let rest = text[end..].chars().count();
            format!("{}… [+{} chars]", &text[..end], rest)
        }
    }
}
