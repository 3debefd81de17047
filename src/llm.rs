//! LLM driver (C6): streams model output over SSE, elides `<think>` spans,
//! recovers tool calls whether the provider returns them natively or as
//! embedded `<tool_call>{json}</tool_call>` text, and fires one
//! emotion-classification side task per turn.
//!
//! Adapted from the teacher's `agent/llm.rs` OpenAI-compatible client,
//! trimmed to the single configured provider (no per-task model routing,
//! no vision/multimodal content — this gateway only ever sends text) and
//! extended with the streaming tool-call accumulator and chunk-processing
//! state machine the teacher's non-streaming `complete_with_tools` didn't
//! need.

use std::collections::HashMap;

use futures_util::StreamExt;
use reqwest_eventsource::{Event, EventSource};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::config::ProvidersConfig;
use crate::tools::ToolSchema;
use crate::types::{Message, Role, ToolCallRequest};

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("provider request failed: {0}")]
    Request(String),
    #[error("provider returned an error: {0}")]
    Provider(String),
}

/// One item of the lazy sequence `response_with_functions` produces.
#[derive(Debug, Clone)]
pub enum LlmEvent {
    TextChunk(String),
    ToolCalls(Vec<ToolCallRequest>),
    Emotion { emoji: String, label: &'static str },
    /// Provider error surfaced in-band so the orchestrator can speak a
    /// fallback instead of hanging on a dead stream.
    Error(String),
}

#[derive(Serialize)]
struct WireMessage {
    role: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Serialize)]
struct WireToolCall {
    id: String,
    r#type: &'static str,
    function: WireFunctionCall,
}

#[derive(Serialize)]
struct WireFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Serialize)]
struct WireFunctionDef {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Serialize)]
struct WireTool {
    r#type: &'static str,
    function: WireFunctionDef,
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<WireMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireTool>>,
}

fn to_wire(message: &Message) -> WireMessage {
    let role = match message.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    };
    let tool_calls = message.tool_calls.as_ref().map(|calls| {
        calls
            .iter()
            .map(|c| WireToolCall {
                id: c.id.clone(),
                r#type: "function",
                function: WireFunctionCall { name: c.name.clone(), arguments: c.arguments.clone() },
            })
            .collect()
    });
    WireMessage {
        role,
        content: if message.content.is_empty() && tool_calls.is_some() { None } else { Some(message.content.clone()) },
        tool_call_id: message.tool_call_id.clone(),
        tool_calls,
    }
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<StreamToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct StreamToolCallDelta {
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<StreamFunctionDelta>,
}

#[derive(Debug, Default, Deserialize)]
struct StreamFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

/// Elides `<think>...</think>` spans from a chunked text stream, buffering
/// across chunk boundaries so a tag split between two SSE events is still
/// caught.
#[derive(Debug, Default)]
struct ThinkTagFilter {
    inside_think: bool,
    pending: String,
}

impl ThinkTagFilter {
    fn feed(&mut self, chunk: &str) -> String {
        self.pending.push_str(chunk);
        let mut out = String::new();
        loop {
            if self.inside_think {
                match self.pending.find("</think>") {
                    Some(end) => {
                        self.pending.drain(..end + "</think>".len());
                        self.inside_think = false;
                    }
                    None => {
                        // Keep enough of the tail that a split "</think>" is
                        // still found once the rest arrives.
                        let keep = self.pending.len().min("</think>".len() - 1);
                        self.pending.drain(..self.pending.len() - keep);
                        break;
                    }
                }
            } else {
                match self.pending.find("<think>") {
                    Some(start) => {
                        out.push_str(&self.pending[..start]);
                        self.pending.drain(..start + "<think>".len());
                        self.inside_think = true;
                    }
                    None => {
                        let keep = self.pending.len().min("<think>".len() - 1);
                        let emit_len = self.pending.len() - keep;
                        out.push_str(&self.pending[..emit_len]);
                        self.pending.drain(..emit_len);
                        break;
                    }
                }
            }
        }
        out
    }
}

/// Accumulates an embedded `<tool_call>{json}</tool_call>` block when the
/// provider doesn't support native structured `tool_calls` deltas.
#[derive(Debug, Default)]
struct EmbeddedToolCallExtractor {
    active: bool,
    buffer: String,
}

const EMBEDDED_TOOL_CALL_OPEN: &str = "<tool_call>";
const EMBEDDED_TOOL_CALL_CLOSE: &str = "</tool_call>";

impl EmbeddedToolCallExtractor {
    /// Returns `Some(remaining_text)` to still treat as plain text when
    /// `text` clearly isn't part of an embedded tool call, otherwise
    /// accumulates and returns `None` (still buffering) or the call once a
    /// complete JSON object is recovered, via `take_call`.
    fn maybe_start(&mut self, text: &str) -> bool {
        if !self.active && text.trim_start().starts_with(EMBEDDED_TOOL_CALL_OPEN) {
            self.active = true;
            self.buffer.clear();
            self.buffer.push_str(text.trim_start().trim_start_matches(EMBEDDED_TOOL_CALL_OPEN));
            return true;
        }
        false
    }

    fn feed(&mut self, text: &str) {
        self.buffer.push_str(text);
    }

    fn try_take(&mut self) -> Option<ToolCallRequest> {
        let closed = self.buffer.find(EMBEDDED_TOOL_CALL_CLOSE);
        let json_str = match closed {
            Some(end) => self.buffer[..end].trim(),
            None => self.buffer.trim(),
        };
        let parsed: Result<EmbeddedCall, _> = serde_json::from_str(json_str);
        match parsed {
            Ok(call) => {
                self.active = false;
                let args = serde_json::to_string(&call.arguments).unwrap_or_default();
                self.buffer.clear();
                Some(ToolCallRequest { id: uuid::Uuid::new_v4().to_string(), name: call.name, arguments: args })
            }
            Err(_) => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct EmbeddedCall {
    name: String,
    #[serde(default)]
    arguments: serde_json::Value,
}

/// First-recognized-emoji-to-label map, grounded on `original_source`'s
/// `core/utils/textUtils.py` `EMOJI_MAP` / `get_emotion`.
fn emoji_emotion_map() -> &'static HashMap<&'static str, &'static str> {
    static MAP: std::sync::OnceLock<HashMap<&'static str, &'static str>> = std::sync::OnceLock::new();
    MAP.get_or_init(|| {
        HashMap::from([
            ("\u{1F602}", "laughing"),
            ("\u{1F62D}", "crying"),
            ("\u{1F620}", "angry"),
            ("\u{1F614}", "sad"),
            ("\u{1F60D}", "loving"),
            ("\u{1F632}", "surprised"),
            ("\u{1F631}", "shocked"),
            ("\u{1F914}", "thinking"),
            ("\u{1F60C}", "relaxed"),
            ("\u{1F634}", "sleepy"),
            ("\u{1F61C}", "silly"),
            ("\u{1F644}", "confused"),
            ("\u{1F636}", "neutral"),
            ("\u{1F642}", "happy"),
            ("\u{1F606}", "laughing"),
            ("\u{1F633}", "embarrassed"),
            ("\u{1F609}", "winking"),
            ("\u{1F60E}", "cool"),
            ("\u{1F924}", "delicious"),
            ("\u{1F618}", "kissy"),
            ("\u{1F60F}", "confident"),
        ])
    })
}

fn first_emotion(text: &str) -> Option<(String, &'static str)> {
    let map = emoji_emotion_map();
    for ch in text.chars() {
        let mut buf = [0u8; 4];
        let s = ch.encode_utf8(&mut buf);
        if let Some(label) = map.get(s) {
            return Some((s.to_string(), *label));
        }
    }
    None
}

/// Streams chat completions from the single configured provider and
/// applies the chunk-processing rules of §4.6.
pub struct LlmDriver {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl LlmDriver {
    pub fn new(providers: &ProvidersConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: providers.llm_base_url.clone(),
            api_key: providers.llm_api_key.clone().unwrap_or_default(),
            model: providers.llm_model.clone(),
        }
    }

    /// `response(session, dialogue)` — plain text stream, no tools.
    pub fn response(&self, dialogue: Vec<Message>) -> ReceiverStream<LlmEvent> {
        self.response_with_functions(dialogue, Vec::new())
    }

    /// `response_with_functions(session, dialogue, tools)`. Returns
    /// immediately with a lazy stream; the HTTP request and all chunk
    /// processing run on a spawned task so the caller can drop the stream
    /// (barge-in) without blocking on the provider.
    pub fn response_with_functions(&self, dialogue: Vec<Message>, tools: Vec<ToolSchema>) -> ReceiverStream<LlmEvent> {
        let (tx, rx) = mpsc::channel(32);
        let client = self.client.clone();
        let base_url = self.base_url.clone();
        let api_key = self.api_key.clone();
        let model = self.model.clone();

        tokio::spawn(async move {
            let request = ChatRequest {
                model,
                messages: dialogue.iter().map(to_wire).collect(),
                stream: true,
                tools: if tools.is_empty() {
                    None
                } else {
                    Some(
                        tools
                            .into_iter()
                            .map(|t| WireTool {
                                r#type: "function",
                                function: WireFunctionDef { name: t.name, description: t.description, parameters: t.parameters },
                            })
                            .collect(),
                    )
                },
            };

            let req = client
                .post(format!("{}/chat/completions", base_url))
                .bearer_auth(&api_key)
                .json(&request);

            let mut source = match EventSource::new(req) {
                Ok(s) => s,
                Err(e) => {
                    let _ = tx.send(LlmEvent::Error(format!("failed to open SSE stream: {e}"))).await;
                    return;
                }
            };

            let mut think_filter = ThinkTagFilter::default();
            let mut embedded = EmbeddedToolCallExtractor::default();
            let mut tool_accum: HashMap<usize, (Option<String>, String, String)> = HashMap::new();
            let mut emotion_sent = false;

            while let Some(event) = source.next().await {
                match event {
                    Ok(Event::Open) => continue,
                    Ok(Event::Message(message)) => {
                        if message.data == "[DONE]" {
                            break;
                        }
                        let chunk: StreamChunk = match serde_json::from_str(&message.data) {
                            Ok(c) => c,
                            Err(_) => continue,
                        };
                        let Some(choice) = chunk.choices.into_iter().next() else { continue };

                        if let Some(deltas) = choice.delta.tool_calls {
                            for delta in deltas {
                                let entry = tool_accum.entry(delta.index).or_insert((None, String::new(), String::new()));
                                if let Some(id) = delta.id {
                                    entry.0 = Some(id);
                                }
                                if let Some(function) = delta.function {
                                    if let Some(name) = function.name {
                                        entry.1.push_str(&name);
                                    }
                                    if let Some(arguments) = function.arguments {
                                        entry.2.push_str(&arguments);
                                    }
                                }
                            }
                        }

                        if let Some(content) = choice.delta.content {
                            if !content.is_empty() {
                                let clean = think_filter.feed(&content);
                                if !clean.is_empty() {
                                    if embedded.active || embedded.maybe_start(&clean) {
                                        embedded.feed(&clean);
                                        if let Some(call) = embedded.try_take() {
                                            let _ = tx.send(LlmEvent::ToolCalls(vec![call])).await;
                                        }
                                    } else {
                                        if !emotion_sent {
                                            emotion_sent = true;
                                            let (emoji, label) = first_emotion(&clean)
                                                .unwrap_or_else(|| ("🙂".to_string(), "happy"));
                                            let _ = tx.send(LlmEvent::Emotion { emoji, label }).await;
                                        }
                                        let _ = tx.send(LlmEvent::TextChunk(clean)).await;
                                    }
                                }
                            }
                        }

                        if choice.finish_reason.as_deref() == Some("tool_calls") && !tool_accum.is_empty() {
                            let mut calls: Vec<_> = tool_accum.drain().collect();
                            calls.sort_by_key(|(index, _)| *index);
                            let calls = calls
                                .into_iter()
                                .map(|(_, (id, name, arguments))| ToolCallRequest {
                                    id: id.unwrap_or_default(),
                                    name,
                                    arguments,
                                })
                                .collect();
                            let _ = tx.send(LlmEvent::ToolCalls(calls)).await;
                        }
                    }
                    Err(reqwest_eventsource::Error::StreamEnded) => break,
                    Err(e) => {
                        let _ = tx.send(LlmEvent::Error(format!("LLM stream error: {e}"))).await;
                        break;
                    }
                }
            }
            source.close();
        });

        ReceiverStream::new(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn think_tag_filter_elides_single_chunk() {
        let mut filter = ThinkTagFilter::default();
        let out = filter.feed("hello <think>secret reasoning</think> world");
        assert_eq!(out, "hello  world");
    }

    #[test]
    fn think_tag_filter_elides_across_chunk_boundary() {
        let mut filter = ThinkTagFilter::default();
        let mut out = String::new();
        out.push_str(&filter.feed("hello <thi"));
        out.push_str(&filter.feed("nk>secret </th"));
        out.push_str(&filter.feed("ink> world"));
        assert_eq!(out, "hello  world");
    }

    #[test]
    fn embedded_tool_call_recovers_across_chunks() {
        let mut extractor = EmbeddedToolCallExtractor::default();
        assert!(extractor.maybe_start("<tool_call>{\"name\":\"get_time\","));
        assert!(extractor.try_take().is_none());
        extractor.feed("\"arguments\":{}}</tool_call>");
        let call = extractor.try_take().unwrap();
        assert_eq!(call.name, "get_time");
    }

    #[test]
    fn first_emotion_finds_mapped_emoji() {
        let (emoji, label) = first_emotion("sounds great \u{1F642} thanks").unwrap();
        assert_eq!(emoji, "\u{1F642}");
        assert_eq!(label, "happy");
    }

    #[test]
    fn first_emotion_none_when_no_mapped_emoji_present() {
        assert!(first_emotion("just plain text").is_none());
    }
}
