//! Intent router (C10), grounded on `original_source`'s
//! `core/handle/intentHandler.py`.
//!
//! `nointent` and `function_call` modes bypass this router entirely (the
//! main LLM's native tool-call surface handles dispatch). `intent_llm`
//! mode makes a separate, cached LLM call that returns a strict
//! `{"function_call":{"name":...,"arguments":...}}` JSON object, then
//! the router itself handles three reserved names before handing
//! anything else to the tool registry.

use futures_util::StreamExt;
use serde::Deserialize;

use crate::cache::{CacheType, TypedCache};
use crate::config::{IntentConfig, IntentMode};
use crate::llm::{LlmDriver, LlmEvent};
use crate::types::{Message, ToolCallRequest};

#[derive(Debug, Clone, PartialEq)]
pub enum IntentOutcome {
    /// Proceed with the normal chat turn.
    Continue,
    /// `continue_chat`: purge tool messages and continue (§4.4).
    ContinueChat,
    /// `result_for_context`: answer purely from ambient context, no tool.
    ResultForContext { context_prompt: String },
    /// `handle_exit_intent`: speak goodbye, then close the connection.
    Exit,
    /// Any other function_call name: dispatch through the tool registry.
    Dispatch(ToolCallRequest),
}

#[derive(Debug, Deserialize)]
struct IntentLlmResponse {
    function_call: Option<IntentFunctionCall>,
}

#[derive(Debug, Deserialize)]
struct IntentFunctionCall {
    name: String,
    #[serde(default)]
    arguments: serde_json::Value,
}

fn intent_system_prompt(available_functions: &[String]) -> String {
    format!(
        "You are an intent classifier for a voice assistant. Given the \
         conversation and the user's latest message, decide whether a \
         function call is needed. Available functions: {}. If no function \
         applies, use \"continue_chat\". If the user's question can be \
         answered purely from the current date/time/location context \
         without any tool, use \"result_for_context\". If the user wants \
         to end the conversation, use \"handle_exit_intent\". Respond with \
         exactly one JSON object: {{\"function_call\":{{\"name\":<name>,\
         \"arguments\":<object>}}}}.",
        if available_functions.is_empty() { "(none)".to_string() } else { available_functions.join(", ") }
    )
}

fn build_context_prompt(original_text: &str) -> String {
    let now = chrono::Local::now();
    format!(
        "Current time: {}\nToday's date: {} ({})\n\nPlease answer the user's question based on the above information: {}",
        now.format("%H:%M:%S"),
        now.format("%Y-%m-%d"),
        now.format("%A"),
        original_text
    )
}

pub struct IntentRouter {
    config: IntentConfig,
    cache: TypedCache<String>,
}

impl IntentRouter {
    pub fn new(config: IntentConfig) -> Self {
        Self { config, cache: TypedCache::new(CacheType::IntentResult) }
    }

    pub fn mode(&self) -> IntentMode {
        self.config.mode
    }

    pub async fn route(
        &self,
        llm: &LlmDriver,
        device_id: &str,
        text: &str,
        dialogue: &[Message],
        available_functions: &[String],
    ) -> IntentOutcome {
        match self.config.mode {
            IntentMode::NoIntent | IntentMode::FunctionCall => IntentOutcome::Continue,
            IntentMode::IntentLlm => self.route_via_llm(llm, device_id, text, dialogue, available_functions).await,
        }
    }

    async fn route_via_llm(
        &self,
        llm: &LlmDriver,
        device_id: &str,
        text: &str,
        dialogue: &[Message],
        available_functions: &[String],
    ) -> IntentOutcome {
        let cache_key = format!("{device_id}:{text}");
        let raw = match self.cache.get(&cache_key) {
            Some(cached) => cached,
            None => match self.call_intent_llm(llm, text, dialogue, available_functions).await {
                Some(result) => {
                    self.cache.put(cache_key, result.clone());
                    result
                }
                None => return IntentOutcome::Continue,
            },
        };
        interpret(&raw, text)
    }

    async fn call_intent_llm(
        &self,
        llm: &LlmDriver,
        text: &str,
        dialogue: &[Message],
        available_functions: &[String],
    ) -> Option<String> {
        let mut messages = vec![Message::system(intent_system_prompt(available_functions))];
        messages.extend(dialogue.iter().cloned());
        messages.push(Message::user(text));

        let mut stream = llm.response(messages);
        let mut collected = String::new();
        while let Some(event) = stream.next().await {
            match event {
                LlmEvent::TextChunk(chunk) => collected.push_str(&chunk),
                LlmEvent::Error(_) => return None,
                _ => {}
            }
        }
        if collected.trim().is_empty() {
            None
        } else {
            Some(collected)
        }
    }
}

fn interpret(raw: &str, original_text: &str) -> IntentOutcome {
    let Ok(parsed) = serde_json::from_str::<IntentLlmResponse>(raw.trim()) else {
        return IntentOutcome::Continue;
    };
    let Some(call) = parsed.function_call else {
        return IntentOutcome::Continue;
    };
    match call.name.as_str() {
        "continue_chat" => IntentOutcome::ContinueChat,
        "result_for_context" => IntentOutcome::ResultForContext { context_prompt: build_context_prompt(original_text) },
        "handle_exit_intent" => IntentOutcome::Exit,
        _ => {
            let arguments =
                if call.arguments.is_null() { "{}".to_string() } else { call.arguments.to_string() };
            IntentOutcome::Dispatch(ToolCallRequest { id: uuid::Uuid::new_v4().to_string(), name: call.name, arguments })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn continue_chat_is_recognized() {
        let raw = r#"{"function_call":{"name":"continue_chat"}}"#;
        assert_eq!(interpret(raw, "hi"), IntentOutcome::ContinueChat);
    }

    #[test]
    fn result_for_context_builds_prompt_with_original_text() {
        let raw = r#"{"function_call":{"name":"result_for_context"}}"#;
        match interpret(raw, "what time is it") {
            IntentOutcome::ResultForContext { context_prompt } => {
                assert!(context_prompt.contains("what time is it"));
            }
            other => panic!("expected ResultForContext, got {other:?}"),
        }
    }

    #[test]
    fn exit_intent_is_recognized() {
        let raw = r#"{"function_call":{"name":"handle_exit_intent"}}"#;
        assert_eq!(interpret(raw, "bye"), IntentOutcome::Exit);
    }

    #[test]
    fn other_function_call_dispatches_with_arguments() {
        let raw = r#"{"function_call":{"name":"get_weather","arguments":{"city":"Paris"}}}"#;
        match interpret(raw, "weather?") {
            IntentOutcome::Dispatch(call) => {
                assert_eq!(call.name, "get_weather");
                assert!(call.arguments.contains("Paris"));
            }
            other => panic!("expected Dispatch, got {other:?}"),
        }
    }

    #[test]
    fn malformed_json_falls_back_to_continue() {
        assert_eq!(interpret("not json", "hi"), IntentOutcome::Continue);
    }

    #[test]
    fn no_function_call_field_falls_back_to_continue() {
        assert_eq!(interpret("{}", "hi"), IntentOutcome::Continue);
    }
}
