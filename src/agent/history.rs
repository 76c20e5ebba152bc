//! Conversation history with token-budgeted views.
//!
//! The full log is never mutated by trimming. Every read of [`ConversationHistory::messages`]
//! recomputes the view from scratch, so the same log can be replayed under a
//! different budget with [`ConversationHistory::trimmed_with`].

use std::borrow::Cow;
use std::collections::VecDeque;

use tracing::{debug, warn};

use crate::Result;

use super::message::{Message, Role, ToolResult};
use super::tokens::messages_tokens;

/// Ordered message log for one agent run.
#[derive(Debug, Clone)]
pub struct ConversationHistory {
    raw: Vec<Message>,
    token_budget: usize,
    min_recent_groups: usize,
}

impl ConversationHistory {
    /// Start a history with the system and initial user prompt.
    pub fn new(
        system_prompt: impl Into<String>,
        user_prompt: impl Into<String>,
        token_budget: usize,
        min_recent_groups: usize,
    ) -> Self {
        debug!(
            "History initialised (budget={} tokens, min_recent_groups={})",
            token_budget, min_recent_groups
        );
        Self {
            raw: vec![Message::system(system_prompt), Message::user(user_prompt)],
            token_budget,
            min_recent_groups,
        }
    }

    /// Restore a history from previously captured messages.
    pub fn from_messages(messages: Vec<Message>, token_budget: usize, min_recent_groups: usize) -> Self {
        Self {
            raw: messages,
            token_budget,
            min_recent_groups,
        }
    }

    /// Restore a history from a JSON snapshot produced by [`Self::to_json`].
    pub fn from_json(json: &str, token_budget: usize, min_recent_groups: usize) -> Result<Self> {
        let messages: Vec<Message> = serde_json::from_str(json)?;
        Ok(Self::from_messages(messages, token_budget, min_recent_groups))
    }

    /// Append the canonical form of an assistant turn.
    pub fn append_assistant(&mut self, message: Message) {
        debug_assert_eq!(message.role, Role::Assistant);
        self.raw.push(message);
    }

    /// Append one tool result as a tool-role message.
    pub fn append_tool_result(&mut self, result: &ToolResult) {
        self.raw.push(Message::tool_result(result));
    }

    /// The history trimmed to the configured budget.
    pub fn messages(&self) -> Cow<'_, [Message]> {
        trim(&self.raw, self.token_budget, self.min_recent_groups)
    }

    /// The history trimmed to an arbitrary budget, leaving the log untouched.
    pub fn trimmed_with(&self, token_budget: usize, min_recent_groups: usize) -> Cow<'_, [Message]> {
        trim(&self.raw, token_budget, min_recent_groups)
    }

    /// Full un-trimmed history.
    pub fn raw_messages(&self) -> &[Message] {
        &self.raw
    }

    pub fn depth(&self) -> usize {
        self.raw.len()
    }

    /// Estimated size of the full log.
    pub fn token_estimate(&self) -> usize {
        messages_tokens(&self.raw)
    }

    /// Serialise the full history as a JSON array of role-tagged records.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.raw)?)
    }
}

/// Group messages into exchange groups.
///
/// An assistant message with tool calls and all of the tool messages that
/// immediately follow it form one group. Every other message is its own group.
pub fn group_messages(messages: &[Message]) -> Vec<&[Message]> {
    let mut groups = Vec::new();
    let mut i = 0;

    while i < messages.len() {
        let start = i;
        i += 1;
        if messages[start].role == Role::Assistant && messages[start].has_tool_calls() {
            while i < messages.len() && messages[i].role == Role::Tool {
                i += 1;
            }
        }
        groups.push(&messages[start..i]);
    }

    groups
}

fn trim(messages: &[Message], token_budget: usize, min_recent_groups: usize) -> Cow<'_, [Message]> {
    let mut total = messages_tokens(messages);
    if total <= token_budget {
        return Cow::Borrowed(messages);
    }

    let (head, rest) = match messages.first() {
        Some(first) if first.role == Role::System => messages.split_at(1),
        _ => messages.split_at(0),
    };

    let mut groups: VecDeque<&[Message]> = group_messages(rest).into();
    let mut dropped_groups = 0;
    let mut dropped_tokens = 0;

    while groups.len() > min_recent_groups && total > token_budget {
        let Some(oldest) = groups.pop_front() else { break };
        let freed = messages_tokens(oldest);
        total -= freed;
        dropped_tokens += freed;
        dropped_groups += 1;
        debug!(
            "Evicted group of {} message(s) starting with {:?} (~{} tokens)",
            oldest.len(),
            oldest[0].role,
            freed
        );
    }

    if dropped_groups == 0 {
        return Cow::Borrowed(messages);
    }

    warn!(
        "Context trim: dropped {} group(s) (~{} tokens). Remaining groups: {}. Estimated total: {} tokens.",
        dropped_groups,
        dropped_tokens,
        groups.len(),
        total
    );

    let mut view = Vec::with_capacity(head.len() + groups.iter().map(|g| g.len()).sum::<usize>());
    view.extend_from_slice(head);
    for group in groups {
        view.extend_from_slice(group);
    }
    Cow::Owned(view)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::message::ToolCallRequest;
    use crate::agent::tokens::messages_tokens;

    fn exchange(history: &mut ConversationHistory, n: usize, payload: &str) {
        let calls: Vec<ToolCallRequest> = (0..2)
            .map(|k| ToolCallRequest::new(format!("c{n}_{k}"), "read_log", "{}"))
            .collect();
        history.append_assistant(Message::assistant_with_tools("", calls.clone()));
        for call in &calls {
            history.append_tool_result(&ToolResult::success(call, payload));
        }
    }

    fn assert_pairing(view: &[Message]) {
        let mut expected: Vec<String> = Vec::new();
        for msg in view {
            match msg.role {
                Role::Tool => {
                    let id = msg.tool_call_id.clone().unwrap();
                    assert!(expected.contains(&id), "orphaned tool result {id}");
                }
                Role::Assistant => {
                    expected = msg.calls().iter().map(|c| c.id.clone()).collect();
                }
                _ => expected.clear(),
            }
        }
    }

    #[test]
    fn test_within_budget_is_borrowed_unchanged() {
        let mut history = ConversationHistory::new("sys", "debug the FIFO", 10_000, 2);
        exchange(&mut history, 0, "ok");
        let view = history.messages();
        assert!(matches!(view, Cow::Borrowed(_)));
        assert_eq!(view.len(), history.depth());
    }

    #[test]
    fn test_grouping() {
        let mut history = ConversationHistory::new("sys", "user", 10_000, 2);
        exchange(&mut history, 0, "a");
        history.append_assistant(Message::assistant("narration"));
        exchange(&mut history, 1, "b");

        let groups = group_messages(&history.raw_messages()[1..]);
        let sizes: Vec<usize> = groups.iter().map(|g| g.len()).collect();
        assert_eq!(sizes, vec![1, 3, 1, 3]);
    }

    #[test]
    fn test_trim_keeps_system_and_pairs() {
        let big = "x".repeat(4_000);
        let mut history = ConversationHistory::new("system prompt", "user prompt", 2_000, 1);
        for n in 0..6 {
            exchange(&mut history, n, &big);
        }

        let view = history.messages();
        assert_eq!(view[0].role, Role::System);
        assert_eq!(view[0].content, "system prompt");
        assert_pairing(&view);
        assert!(view.len() < history.depth());
        // raw log untouched
        assert_eq!(history.depth(), 2 + 6 * 3);
        assert!(history.token_estimate() > messages_tokens(view.iter()));
        assert!(history.token_estimate() >= 6 * 2 * 1_000);
    }

    #[test]
    fn test_trim_is_fifo() {
        let big = "y".repeat(2_000);
        let mut history = ConversationHistory::new("sys", "user", 2_500, 1);
        for n in 0..5 {
            exchange(&mut history, n, &big);
        }

        let view = history.messages();
        let first_kept = view
            .iter()
            .find(|m| m.role == Role::Assistant)
            .map(|m| m.calls()[0].id.clone())
            .unwrap();
        // every surviving exchange is newer than every evicted one
        let kept: Vec<String> = view
            .iter()
            .filter(|m| m.role == Role::Assistant)
            .map(|m| m.calls()[0].id.clone())
            .collect();
        let expected_tail: Vec<String> = (5 - kept.len()..5).map(|n| format!("c{n}_0")).collect();
        assert_eq!(kept, expected_tail);
        assert_eq!(first_kept, expected_tail[0]);
        // the user prompt is the oldest group and goes first
        assert!(view.iter().all(|m| m.role != Role::User));
    }

    #[test]
    fn test_min_recent_groups_floor_binds() {
        let big = "z".repeat(40_000);
        let mut history = ConversationHistory::new("sys", "user", 100, 3);
        for n in 0..5 {
            exchange(&mut history, n, &big);
        }

        let view = history.messages();
        let groups = group_messages(&view[1..]);
        assert_eq!(groups.len(), 3);
        // budget legitimately unmet
        assert!(messages_tokens(view.iter()) > 100);
        assert_pairing(&view);
    }

    #[test]
    fn test_trimmed_with_replays_other_budget() {
        let big = "w".repeat(1_000);
        let mut history = ConversationHistory::new("sys", "user", 1_000_000, 1);
        for n in 0..4 {
            exchange(&mut history, n, &big);
        }

        assert_eq!(history.messages().len(), history.depth());
        let tight = history.trimmed_with(600, 1);
        assert!(tight.len() < history.depth());
        assert_pairing(&tight);
        assert_eq!(history.messages().len(), history.depth());
    }

    #[test]
    fn test_budget_met_when_floor_allows() {
        let big = "v".repeat(800);
        let mut history = ConversationHistory::new("sys", "user", 1_500, 1);
        for n in 0..8 {
            exchange(&mut history, n, &big);
        }
        let view = history.messages();
        assert!(messages_tokens(view.iter()) <= 1_500);
    }

    #[test]
    fn test_json_snapshot_round_trip() {
        let mut history = ConversationHistory::new("sys", "user", 10_000, 2);
        exchange(&mut history, 0, "log line");
        let json = history.to_json().unwrap();
        let restored = ConversationHistory::from_json(&json, 10_000, 2).unwrap();
        assert_eq!(restored.raw_messages(), history.raw_messages());
    }
}
