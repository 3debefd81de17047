//! Append-only per-connection dialogue store (C4).
//!
//! Owned exclusively by the connection orchestrator task — no internal
//! locking. Other tasks that need to affect the dialogue (the intent
//! router, the tool executor) send requests back to the orchestrator
//! over a channel rather than touching this type directly, per the
//! single-writer discipline called for in the design notes.

use crate::types::{Message, Role};

/// Optional speaker-diarization metadata attached to a transcript.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct VoiceprintContext {
    pub speaker: String,
    pub content: String,
}

/// Ordered sequence of dialogue messages with the system-message-at-index-0
/// invariant.
#[derive(Debug, Default, Clone)]
pub struct Dialogue {
    messages: Vec<Message>,
}

impl Dialogue {
    pub fn new() -> Self {
        Self { messages: Vec::new() }
    }

    /// Append a message. Callers are responsible for ordering (e.g. an
    /// assistant `tool_calls` message must be followed by one `tool`
    /// message per call before the next assistant content message).
    pub fn put(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// Replace the system message wholesale, inserting it at index 0 if
    /// none exists yet. Idempotent: calling this twice with the same text
    /// leaves the dialogue in the same state as calling it once (R2).
    pub fn update_system_message(&mut self, text: impl Into<String>) {
        let text = text.into();
        match self.messages.first_mut() {
            Some(first) if first.role == Role::System => {
                first.content = text;
            }
            _ => {
                self.messages.insert(0, Message::system(text));
            }
        }
    }

    /// The raw dialogue, as sent to the LLM driver with no augmentation.
    pub fn get_llm_dialogue(&self) -> Vec<Message> {
        self.messages.clone()
    }

    /// A memory-augmented view: the short-term summary (if any) is
    /// prepended as a system-side context block ahead of the most recent
    /// user turn; voiceprint metadata, if present, is folded into that
    /// block. This never mutates `self` (P6) — two calls with equal
    /// inputs on an unchanged dialogue return equal outputs.
    pub fn get_llm_dialogue_with_memory(
        &self,
        summary: Option<&str>,
        voiceprint: Option<&VoiceprintContext>,
    ) -> Vec<Message> {
        let mut out = self.messages.clone();

        let mut context_block = String::new();
        if let Some(summary) = summary {
            if !summary.is_empty() {
                context_block.push_str("Conversation memory so far:\n");
                context_block.push_str(summary);
            }
        }
        if let Some(vp) = voiceprint {
            if !context_block.is_empty() {
                context_block.push('\n');
            }
            context_block.push_str(&format!("Current speaker: {} — \"{}\"", vp.speaker, vp.content));
        }

        if context_block.is_empty() {
            return out;
        }

        // Insert right before the last user turn, after the system message
        // (if any), so the model sees it as immediate context rather than
        // as part of the static system prompt.
        let insert_at = out
            .iter()
            .rposition(|m| m.role == Role::User)
            .unwrap_or(out.len());
        out.insert(insert_at, Message::system(context_block));
        out
    }

    /// Purge all `tool` messages from the dialogue. Invoked on a
    /// `continue_chat` intent decision (§4.4/§4.10) to prevent orphaned
    /// tool turns from confusing the next LLM request.
    pub fn purge_tool_messages(&mut self) {
        self.messages.retain(|m| m.role != Role::Tool);
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn last_n(&self, n: usize) -> &[Message] {
        let start = self.messages.len().saturating_sub(n);
        &self.messages[start..]
    }

    /// Check the well-formedness invariant (P2): after any assistant
    /// message with tool_calls, the next messages are `tool` with
    /// matching ids until all calls are answered, then either another
    /// assistant turn or end-of-turn.
    pub fn is_well_formed(&self) -> bool {
        let mut i = 0;
        while i < self.messages.len() {
            let m = &self.messages[i];
            if m.role == Role::Assistant {
                if let Some(calls) = &m.tool_calls {
                    let ids: std::collections::HashSet<&str> =
                        calls.iter().map(|c| c.id.as_str()).collect();
                    let mut seen = std::collections::HashSet::new();
                    let mut j = i + 1;
                    while j < self.messages.len() && self.messages[j].role == Role::Tool {
                        if let Some(id) = &self.messages[j].tool_call_id {
                            seen.insert(id.as_str());
                        }
                        j += 1;
                    }
                    if seen != ids {
                        return false;
                    }
                    i = j;
                    continue;
                }
            }
            i += 1;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_message_stays_at_index_zero() {
        let mut d = Dialogue::new();
        d.put(Message::user("hi".into()));
        d.update_system_message("be helpful");
        assert_eq!(d.get_llm_dialogue()[0].role, Role::System);
    }

    #[test]
    fn update_system_message_is_idempotent() {
        let mut d = Dialogue::new();
        d.update_system_message("prompt a");
        d.update_system_message("prompt a");
        assert_eq!(d.len(), 1);
    }

    #[test]
    fn memory_view_does_not_mutate_dialogue() {
        let mut d = Dialogue::new();
        d.update_system_message("be helpful");
        d.put(Message::user("what's the weather".into()));
        let before = d.len();
        let a = d.get_llm_dialogue_with_memory(Some("user likes short answers"), None);
        let b = d.get_llm_dialogue_with_memory(Some("user likes short answers"), None);
        assert_eq!(d.len(), before);
        assert_eq!(a.len(), b.len());
        assert_eq!(a.last().unwrap().content, b.last().unwrap().content);
    }

    #[test]
    fn purge_tool_messages_removes_only_tool_role() {
        let mut d = Dialogue::new();
        d.put(Message::user("turn on the lamp".into()));
        d.put(Message::assistant_with_tool_calls(vec![crate::types::ToolCallRequest {
            id: "call_1".into(),
            name: "iot_lamp_set_on".into(),
            arguments: "{}".into(),
        }]));
        d.put(Message::tool_result("call_1", "ok"));
        d.put(Message::assistant("Done.".into()));
        d.purge_tool_messages();
        assert!(d.get_llm_dialogue().iter().all(|m| m.role != Role::Tool));
        assert_eq!(d.len(), 3);
    }

    #[test]
    fn well_formed_dialogue_passes_check() {
        let mut d = Dialogue::new();
        d.put(Message::user("hi".into()));
        d.put(Message::assistant_with_tool_calls(vec![crate::types::ToolCallRequest {
            id: "1".into(),
            name: "get_time".into(),
            arguments: "{}".into(),
        }]));
        d.put(Message::tool_result("1", "12:00"));
        d.put(Message::assistant("It's noon.".into()));
        assert!(d.is_well_formed());
    }
}
