//! Connection orchestrator (C8): the per-connection state machine that
//! wires the VAD gate, ASR session, LLM driver, TTS pipeline, tool
//! registry, intent router, and dialogue store behind one WebSocket.
//!
//! Grounded on the teacher's `server/realtime_voice.rs` single-writer
//! task / outbound-channel structure: one task drains an
//! `mpsc::Receiver<Outbound>` onto the socket while the connection's main
//! task reads frames and drives the pipeline. `server/device.rs`'s
//! `pending: HashMap<id, oneshot::Sender<_>>` correlation pattern grounds
//! the device-MCP request/response matching below.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::asr::Asr;
use crate::asr::LocalAsr;
use crate::cache::{CacheType, TypedCache};
use crate::codec::{DevicePacket, OpusCodec, ReorderBuffer, FRAME_DURATION_MS, SAMPLE_RATE_HZ};
use crate::config::Config;
use crate::dialogue::Dialogue;
use crate::intent::{IntentOutcome, IntentRouter};
use crate::llm::{LlmDriver, LlmEvent};
use crate::memory::{build_summary_input, MemoryStore};
use crate::server::device::DeviceMcpBridge;
use crate::tools::{ToolAction, ToolBackend, ToolError, ToolRegistry, ToolResult, ToolSchema};
use crate::tts::{SentenceType, TextSegmenter, TtsMessage, TtsPipeline};
use crate::types::{Message, ToolCallRequest};
use crate::voice::stt_local::LocalStt;
use crate::voice::tts_local::LocalTts;
use crate::voice::vad::{VadConfig, VoiceEdge, VoiceGate, DEFAULT_FRAME_SIZE};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("provider error: {0}")]
    Provider(String),
    #[error("transport error: {0}")]
    Transport(String),
}

const MAX_TOOL_DEPTH: u8 = 5;
const IDLE_POLL_INTERVAL_SECS: u64 = 10;
const PROVIDER_TIMEOUT_SECS: u64 = 10;

/// Outbound WebSocket payload: JSON control message or a raw Opus frame.
pub(crate) enum Outbound {
    Json(Value),
    Binary(Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Init,
    Idle,
    Listening,
    Thinking,
    Speaking,
    Closing,
}

/// Process-wide resources shared across connections, built once at
/// server start (§5 "Shared resources").
pub struct SharedProviders {
    pub config: Arc<Config>,
    pub memory: Arc<MemoryStore>,
    pub wakeup_cache: Arc<TypedCache<CachedWakeupResponse>>,
    pub local_stt: Arc<LocalStt>,
    /// Tools discovered from configured server-side MCP servers at
    /// startup (§4.5 C5), registered into every connection's registry.
    pub server_mcp_tools: Vec<(ToolSchema, Arc<dyn ToolBackend>)>,
}

#[derive(Debug, Clone)]
pub struct CachedWakeupResponse {
    pub opus_frames: Vec<Vec<u8>>,
    pub text: String,
    pub synthesized_at: std::time::Instant,
}

/// Identity and transport facts established during HANDSHAKE, passed in
/// by the server acceptor once the WebSocket upgrade completes.
pub struct ConnectionIdentity {
    pub device_id: String,
    pub client_id: String,
    pub real_ip: Option<String>,
    pub bearer_token: Option<String>,
    pub has_audio_header: bool,
}

fn normalize_wake_text(text: &str) -> String {
    text.trim()
        .trim_end_matches(['.', '!', '?', '\u{3002}', '\u{FF01}', '\u{FF1F}'])
        .to_lowercase()
}

fn matching_wake_word<'a>(words: &'a [String], text: &str) -> Option<&'a str> {
    let normalized = normalize_wake_text(text);
    words.iter().map(|w| w.as_str()).find(|w| normalize_wake_text(w) == normalized)
}

fn hello_message(session_id: &str) -> Value {
    json!({
        "type": "hello",
        "session_id": session_id,
        "audio_params": {
            "format": "opus",
            "sample_rate": SAMPLE_RATE_HZ,
            "channels": 1,
            "frame_duration": FRAME_DURATION_MS,
        }
    })
}

fn stt_message(session_id: &str, text: &str) -> Value {
    json!({"type": "stt", "text": text, "session_id": session_id})
}

fn llm_emotion_message(session_id: &str, emoji: &str, label: &str) -> Value {
    json!({"type": "llm", "text": emoji, "emotion": label, "session_id": session_id})
}

fn tts_state_message(session_id: &str, state: &str, text: Option<&str>) -> Value {
    let mut msg = json!({"type": "tts", "state": state, "session_id": session_id});
    if let Some(text) = text {
        msg["text"] = json!(text);
    }
    msg
}

fn server_action_message(status: &str, message: &str, content: Value) -> Value {
    json!({"type": "server", "status": status, "message": message, "content": content})
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientEvent {
    Hello {
        #[serde(default)]
        audio_params: Option<Value>,
        #[serde(default)]
        features: Option<Value>,
    },
    Listen {
        #[serde(default)]
        state: Option<String>,
        #[serde(default)]
        mode: Option<String>,
        #[serde(default)]
        text: Option<String>,
    },
    Abort {},
    Iot {
        #[serde(flatten)]
        body: Value,
    },
    Mcp {
        payload: Value,
    },
    Server {
        #[serde(flatten)]
        body: Value,
    },
}

/// Forwards IoT method invocations to the device as a fire-and-forget
/// `iot` command envelope; the xiaozhi wire protocol reports resulting
/// state changes asynchronously through the device's own `iot` updates
/// rather than a per-call response.
struct IotBackend {
    out_tx: mpsc::Sender<Outbound>,
}

#[async_trait::async_trait]
impl ToolBackend for IotBackend {
    async fn invoke(&self, name: &str, arguments: Value) -> Result<ToolResult, ToolError> {
        let (descriptor, method) = name.split_once('.').unwrap_or((name, name));
        let envelope = json!({
            "type": "iot",
            "commands": [{ "name": descriptor, "method": method, "parameters": arguments }],
        });
        self.out_tx
            .send(Outbound::Json(envelope))
            .await
            .map_err(|_| ToolError::Backend("device connection closed".to_string()))?;
        Ok(ToolResult::response("command sent to device".to_string()))
    }
}

/// Per-connection state. Owns the `Dialogue` (single writer) and every
/// provider instance; nothing here is shared with another connection.
struct Session {
    identity: ConnectionIdentity,
    session_id: String,
    shared: Arc<SharedProviders>,
    out_tx: mpsc::Sender<Outbound>,
    dialogue: Dialogue,
    registry: ToolRegistry,
    mcp_bridge: Arc<DeviceMcpBridge>,
    iot_backend: Arc<dyn ToolBackend>,
    intent: IntentRouter,
    llm: LlmDriver,
    tts: Arc<TtsPipeline>,
    asr: Box<dyn Asr>,
    vad: VoiceGate,
    opus: OpusCodec,
    reorder: ReorderBuffer,
    memory_summary: Option<String>,
    state: ConnState,
    client_abort: Arc<AtomicBool>,
    in_voice_turn: bool,
    just_woken_up: bool,
    last_activity: Instant,
    close_after_chat: bool,
    sentence_counter: u64,
}

impl Session {
    fn next_sentence_id(&mut self) -> String {
        self.sentence_counter += 1;
        format!("{}-{}", self.session_id, self.sentence_counter)
    }

    async fn send(&self, value: Value) {
        let _ = self.out_tx.send(Outbound::Json(value)).await;
    }

    async fn send_binary(&self, frame: Vec<u8>) {
        let _ = self.out_tx.send(Outbound::Binary(frame)).await;
    }

    /// Speak a complete piece of text as a FIRST/MIDDLE.../LAST run,
    /// grounded on `original_source`'s `speak_txt`. Appends the spoken
    /// text as an assistant dialogue turn unless `client_abort` fires
    /// mid-stream, in which case the partial text is dropped (§4.8).
    async fn speak_text(&mut self, text: &str) {
        if text.trim().is_empty() {
            return;
        }
        let sentence_id = self.next_sentence_id();
        self.state = ConnState::Speaking;
        self.send(tts_state_message(&self.session_id, "start", None)).await;

        let first = self.tts.process(TtsMessage::first(&sentence_id)).await;
        self.emit_audio(first).await;

        if self.client_abort.load(Ordering::SeqCst) {
            self.send(tts_state_message(&self.session_id, "stop", None)).await;
            return;
        }

        let middle = self.tts.process(TtsMessage::middle_text(&sentence_id, text)).await;
        self.emit_audio(middle).await;

        let last = self.tts.process(TtsMessage::last(&sentence_id)).await;
        self.emit_audio(last).await;

        self.send(tts_state_message(&self.session_id, "stop", None)).await;
        self.dialogue.put(Message::assistant(text));
        self.state = ConnState::Idle;
    }

    async fn emit_audio(&self, item: crate::tts::AudioQueueItem) {
        let state = match item.sentence_type {
            SentenceType::First => "sentence_start",
            SentenceType::Middle => "sentence_start",
            SentenceType::Last => "sentence_end",
        };
        if let Some(text) = &item.text {
            self.send(tts_state_message(&self.session_id, state, Some(text))).await;
        }
        for frame in item.opus_frames {
            if self.client_abort.load(Ordering::SeqCst) {
                break;
            }
            self.send_binary(frame).await;
        }
    }

    /// Serve a cached wake-word reply (FIRST+LAST only, no synthesis),
    /// grounded on `original_source`'s `helloHandle.wakeupWordsResponse`.
    async fn serve_cached_wakeup(&mut self, cached: &CachedWakeupResponse) {
        let sentence_id = self.next_sentence_id();
        self.state = ConnState::Speaking;
        self.send(tts_state_message(&self.session_id, "start", None)).await;
        self.send(tts_state_message(&self.session_id, "sentence_start", Some(&cached.text))).await;
        for frame in &cached.opus_frames {
            self.send_binary(frame.clone()).await;
        }
        self.send(tts_state_message(&self.session_id, "sentence_end", None)).await;
        self.send(tts_state_message(&self.session_id, "stop", None)).await;
        self.vad.suppress_for(Duration::from_millis(1000));
        self.just_woken_up = true;
        self.state = ConnState::Idle;
    }

    /// Entry point for a finalized user utterance (from ASR, a typed
    /// `listen.detect` message, or a recognized wake word).
    async fn handle_user_text(&mut self, transcript_text: &str) {
        if transcript_text.trim().is_empty() {
            return;
        }
        self.last_activity = Instant::now();
        self.close_after_chat = false;

        if self.shared.config.wakeup.enable_cache {
            if let Some(word) = matching_wake_word(&self.shared.config.wakeup.words, transcript_text) {
                let key = format!("{}:{}", self.identity.device_id, word);
                if let Some(cached) = self.shared.wakeup_cache.get(&key) {
                    let stale = cached.synthesized_at.elapsed()
                        > Duration::from_secs(self.shared.config.wakeup.refresh_time_secs);
                    self.serve_cached_wakeup(&cached).await;
                    if stale {
                        // Refresh is best-effort and must not block this turn.
                        tracing::debug!(device_id = %self.identity.device_id, "wake-word cache entry stale, will refresh on next synthesis");
                    }
                    return;
                }
            }
        }

        self.send(stt_message(&self.session_id, transcript_text)).await;
        self.dialogue.put(Message::user(transcript_text));

        let available: Vec<String> = self.registry.get_functions().into_iter().map(|s| s.name).collect();
        let outcome = self
            .intent
            .route(&self.llm, &self.identity.device_id, transcript_text, self.dialogue.get_llm_dialogue().as_slice(), &available)
            .await;

        match outcome {
            IntentOutcome::ContinueChat => {
                self.dialogue.purge_tool_messages();
                self.run_chat_turn().await;
            }
            IntentOutcome::ResultForContext { context_prompt } => {
                self.reply_from_context(&context_prompt, transcript_text).await;
            }
            IntentOutcome::Exit => {
                self.speak_text(&self.shared.config.idle.farewell_text.clone()).await;
                self.state = ConnState::Closing;
            }
            IntentOutcome::Dispatch(call) => {
                self.dispatch_tool_call(call, 0).await;
            }
            IntentOutcome::Continue => {
                self.run_chat_turn().await;
            }
        }

        self.maybe_save_memory().await;
    }

    /// `result_for_context`: answer purely from the synthesized context
    /// block, with no tool call and no change to the persisted dialogue
    /// beyond the user turn already appended.
    async fn reply_from_context(&mut self, context_prompt: &str, original_text: &str) {
        let mut dialogue = self.dialogue.get_llm_dialogue();
        if let Some(last) = dialogue.last_mut() {
            if last.content == original_text {
                last.content = context_prompt.to_string();
            }
        }
        let mut stream = self.llm.response(dialogue);
        let mut full = String::new();
        while let Some(event) = stream.next().await {
            if self.client_abort.load(Ordering::SeqCst) {
                break;
            }
            if let LlmEvent::TextChunk(chunk) = event {
                full.push_str(&chunk);
            }
        }
        self.speak_text(&full).await;
    }

    /// Run one full chat turn through the main LLM, streaming sentences
    /// to TTS as they complete and recursing into tool-call round trips
    /// (§4.8) up to `MAX_TOOL_DEPTH`.
    async fn run_chat_turn(&mut self) {
        self.state = ConnState::Thinking;
        self.client_abort.store(false, Ordering::SeqCst);
        let tools = self.registry.get_functions();
        let dialogue = self.dialogue.get_llm_dialogue_with_memory(self.memory_summary.as_deref(), None);
        self.stream_turn(dialogue, tools, 0).await;
    }

    async fn stream_turn(&mut self, dialogue: Vec<Message>, tools: Vec<crate::tools::ToolSchema>, depth: u8) {
        let mut stream = self.llm.response_with_functions(dialogue, tools);
        let mut segmenter = TextSegmenter::new();
        let mut emotion_sent = false;
        let mut tool_calls: Vec<ToolCallRequest> = Vec::new();
        let sentence_id = self.next_sentence_id();
        let mut opened = false;

        while let Some(event) = stream.next().await {
            if self.client_abort.load(Ordering::SeqCst) {
                break;
            }
            match event {
                LlmEvent::TextChunk(chunk) => {
                    if !opened {
                        self.state = ConnState::Speaking;
                        self.send(tts_state_message(&self.session_id, "start", None)).await;
                        let first = self.tts.process(TtsMessage::first(&sentence_id)).await;
                        self.emit_audio(first).await;
                        opened = true;
                    }
                    for sentence in segmenter.push(&chunk) {
                        let item = self.tts.process(TtsMessage::middle_text(&sentence_id, &sentence)).await;
                        self.emit_audio(item).await;
                    }
                }
                LlmEvent::Emotion { emoji, label } => {
                    if !emotion_sent {
                        emotion_sent = true;
                        self.send(llm_emotion_message(&self.session_id, &emoji, label)).await;
                    }
                }
                LlmEvent::ToolCalls(calls) => {
                    tool_calls = calls;
                }
                LlmEvent::Error(message) => {
                    tracing::warn!(%message, "LLM stream error");
                    let fallback = "Sorry, I ran into a problem answering that.";
                    if !opened {
                        self.send(tts_state_message(&self.session_id, "start", None)).await;
                        let first = self.tts.process(TtsMessage::first(&sentence_id)).await;
                        self.emit_audio(first).await;
                        opened = true;
                    }
                    let item = self.tts.process(TtsMessage::middle_text(&sentence_id, fallback)).await;
                    self.emit_audio(item).await;
                }
            }
        }

        if self.client_abort.load(Ordering::SeqCst) {
            self.send(tts_state_message(&self.session_id, "stop", None)).await;
            self.state = ConnState::Idle;
            return;
        }

        if !tool_calls.is_empty() && depth < MAX_TOOL_DEPTH {
            if opened {
                let last = self.tts.process(TtsMessage::last(&sentence_id)).await;
                self.emit_audio(last).await;
                self.send(tts_state_message(&self.session_id, "stop", None)).await;
            }
            self.dialogue.put(Message::assistant_with_tool_calls(tool_calls.clone()));
            for call in tool_calls {
                self.dispatch_tool_call(call, depth + 1).await;
            }
            return;
        }

        if let Some(remaining) = segmenter.flush() {
            let item = self.tts.process(TtsMessage::middle_text(&sentence_id, &remaining)).await;
            self.emit_audio(item).await;
        }
        if opened {
            let last = self.tts.process(TtsMessage::last(&sentence_id)).await;
            self.emit_audio(last).await;
            self.send(tts_state_message(&self.session_id, "stop", None)).await;
        }

        self.state = ConnState::Idle;
    }

    /// Tool-call round trip (§4.8): dispatch through the registry, then
    /// branch on the resulting action exactly as
    /// `original_source`'s `process_intent_result` does.
    async fn dispatch_tool_call(&mut self, call: ToolCallRequest, depth: u8) {
        let arguments: Value = serde_json::from_str(&call.arguments).unwrap_or(Value::Null);
        let result = self.registry.handle_llm_function_call(&call.name, arguments).await;

        match result.action {
            ToolAction::Response => {
                let text = result.response.unwrap_or_default();
                self.dialogue.put(Message::tool_result(call.id.clone(), text.clone()));
                self.speak_text(&text).await;
            }
            ToolAction::ReqLlm => {
                let text = result.result.unwrap_or_default();
                self.dialogue.put(Message::tool_result(call.id.clone(), text));
                if depth >= MAX_TOOL_DEPTH {
                    self.speak_text("I've reached the limit of steps I can take on this request.").await;
                    return;
                }
                let tools = self.registry.get_functions();
                let dialogue = self.dialogue.get_llm_dialogue_with_memory(self.memory_summary.as_deref(), None);
                self.stream_turn(dialogue, tools, depth).await;
            }
            ToolAction::NotFound => {
                self.dialogue.put(Message::tool_result(call.id.clone(), "tool not found"));
                self.speak_text("I don't have a way to do that yet.").await;
            }
            ToolAction::Error => {
                let text = result.response.unwrap_or_else(|| "that action failed".to_string());
                self.dialogue.put(Message::tool_result(call.id.clone(), text.clone()));
                self.speak_text(&format!("I hit a problem: {text}")).await;
            }
            ToolAction::None => {}
        }
    }

    async fn maybe_save_memory(&mut self) {
        let turns: Vec<(String, String)> = self
            .dialogue
            .last_n(6)
            .iter()
            .filter(|m| matches!(m.role, crate::types::Role::User | crate::types::Role::Assistant))
            .map(|m| (m.role.to_string(), m.content.clone()))
            .collect();
        if turns.is_empty() {
            return;
        }
        let input = build_summary_input(self.memory_summary.as_deref(), &turns);
        let _ = self.shared.memory.put(self.identity.device_id.clone(), input.clone()).await;
        self.memory_summary = Some(input);
    }

    /// Barge-in (§4.8): abort any in-flight speech, drain the queue by
    /// letting `client_abort` short-circuit `emit_audio`, and notify the
    /// device.
    async fn handle_abort(&mut self) {
        self.client_abort.store(true, Ordering::SeqCst);
        self.send(tts_state_message(&self.session_id, "stop", None)).await;
        self.state = ConnState::Idle;
    }

    fn idle_deadline(&self) -> Duration {
        Duration::from_secs(self.shared.config.idle.close_connection_no_voice_time_secs.max(0) as u64)
    }
}

/// Decode one inbound binary frame to PCM16, honoring the MQTT-gateway
/// 16-byte header when `has_audio_header` is set.
fn decode_inbound_frame(session: &mut Session, bytes: &[u8]) -> Vec<Vec<u8>> {
    if session.identity.has_audio_header {
        match DevicePacket::parse(bytes) {
            Ok(packet) => session.reorder.push(packet),
            Err(e) => {
                tracing::debug!(error = %e, "dropping malformed device audio packet");
                Vec::new()
            }
        }
    } else {
        vec![bytes.to_vec()]
    }
}

/// Drives one upgraded WebSocket end-to-end: AUTH has already been
/// checked by the caller (§4.8 HANDSHAKE→AUTH), this function owns
/// INIT through CLOSING.
pub async fn run_connection(socket: WebSocket, identity: ConnectionIdentity, shared: Arc<SharedProviders>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Outbound>(64);

    let writer = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            let sent = match message {
                Outbound::Json(value) => ws_tx.send(WsMessage::Text(value.to_string().into())).await,
                Outbound::Binary(bytes) => ws_tx.send(WsMessage::Binary(bytes.into())).await,
            };
            if sent.is_err() {
                break;
            }
        }
    });

    let session_id = uuid::Uuid::new_v4().to_string();
    let mut dialogue = Dialogue::new();
    dialogue.update_system_message(default_system_prompt());
    let memory_summary = shared.memory.get(&identity.device_id).await;

    let opus = match OpusCodec::new() {
        Ok(codec) => codec,
        Err(e) => {
            tracing::error!(error = %e, "failed to initialize opus codec for connection");
            drop(out_tx);
            let _ = writer.await;
            return;
        }
    };

    let tts_primary = Arc::new(crate::tts::LocalTtsSynthesizer::new(LocalTts::from_config(&shared.config.voice)));
    let tts = match TtsPipeline::new(tts_primary) {
        Ok(pipeline) => Arc::new(pipeline),
        Err(e) => {
            tracing::error!(error = %e, "failed to initialize TTS pipeline");
            drop(out_tx);
            let _ = writer.await;
            return;
        }
    };

    let mcp_bridge = DeviceMcpBridge::new(out_tx.clone());
    let iot_backend: Arc<dyn ToolBackend> = Arc::new(IotBackend { out_tx: out_tx.clone() });

    let mut session = Session {
        identity,
        session_id: session_id.clone(),
        shared: shared.clone(),
        out_tx,
        dialogue,
        registry: ToolRegistry::new(),
        mcp_bridge,
        iot_backend,
        intent: IntentRouter::new(shared.config.intent.clone()),
        llm: LlmDriver::new(&shared.config.providers),
        tts,
        asr: Box::new(LocalAsr::new(shared.local_stt.clone())),
        vad: VoiceGate::new(
            VadConfig { energy_threshold_db: shared.config.voice.energy_threshold_db, ..VadConfig::default() },
            shared.config.voice.voice_stop_silence_frames,
        ),
        opus,
        reorder: ReorderBuffer::new(),
        memory_summary,
        state: ConnState::Init,
        client_abort: Arc::new(AtomicBool::new(false)),
        in_voice_turn: false,
        just_woken_up: false,
        last_activity: Instant::now(),
        close_after_chat: false,
        sentence_counter: 0,
    };
    for (schema, backend) in shared.server_mcp_tools.iter() {
        session.registry.register_server_mcp_tool(schema.clone(), backend.clone());
    }
    session.registry.signal_init_complete();

    let mut idle_ticker = tokio::time::interval(Duration::from_secs(IDLE_POLL_INTERVAL_SECS));

    loop {
        tokio::select! {
            frame = ws_rx.next() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        handle_text_frame(&mut session, &text).await;
                    }
                    Some(Ok(WsMessage::Binary(bytes))) => {
                        handle_binary_frame(&mut session, &bytes).await;
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "websocket receive error");
                        break;
                    }
                }
            }
            _ = idle_ticker.tick() => {
                if check_idle_policy(&mut session).await {
                    break;
                }
            }
        }
        if session.state == ConnState::Closing {
            break;
        }
    }

    writer.abort();
    let _ = tokio::time::timeout(Duration::from_secs(3), writer).await;
}

fn default_system_prompt() -> &'static str {
    "You are a helpful voice assistant. Keep replies brief and conversational; you are being spoken aloud, not read."
}

async fn handle_text_frame(session: &mut Session, text: &str) {
    let event: Result<ClientEvent, _> = serde_json::from_str(text);
    match event {
        Ok(ClientEvent::Hello { .. }) => {
            session.send(hello_message(&session.session_id)).await;
            session.state = ConnState::Idle;
        }
        Ok(ClientEvent::Listen { state, text, .. }) => match state.as_deref() {
            Some("start") => {
                session.state = ConnState::Listening;
                let _ = session.asr.open_audio_channels().await;
                session.in_voice_turn = true;
            }
            Some("stop") => {
                if session.in_voice_turn {
                    finalize_asr_turn(session).await;
                }
            }
            Some("detect") => {
                if let Some(text) = text {
                    session.handle_user_text(&text).await;
                }
            }
            _ => {}
        },
        Ok(ClientEvent::Abort {}) => {
            session.handle_abort().await;
        }
        Ok(ClientEvent::Server { body }) => {
            if body.get("action").and_then(Value::as_str) == Some("restart") {
                session.send(server_action_message("success", "restarting", json!({"action": "restart"}))).await;
                session.state = ConnState::Closing;
            }
        }
        Ok(ClientEvent::Iot { body }) => {
            if let Some(descriptors) = body.get("descriptors").and_then(Value::as_array) {
                for raw in descriptors {
                    if let Ok(descriptor) = serde_json::from_value::<crate::tools::IotDescriptor>(raw.clone()) {
                        session.registry.register_iot_descriptor(descriptor, session.iot_backend.clone());
                    }
                }
            }
        }
        Ok(ClientEvent::Mcp { payload }) => {
            if let Some(id) = payload.get("id").and_then(Value::as_str) {
                let result = payload.get("result").or_else(|| payload.get("error")).cloned().unwrap_or(Value::Null);
                session.mcp_bridge.resolve(id, result).await;
            } else if payload.get("method").and_then(Value::as_str) == Some("tools/list") {
                if let Some(tools) = payload.get("result").and_then(|r| r.get("tools")).and_then(Value::as_array) {
                    for raw in tools {
                        let Some(name) = raw.get("name").and_then(Value::as_str) else { continue };
                        let schema = crate::tools::ToolSchema {
                            name: name.to_string(),
                            description: raw.get("description").and_then(Value::as_str).unwrap_or_default().to_string(),
                            parameters: raw.get("inputSchema").cloned().unwrap_or_else(|| json!({})),
                        };
                        session.registry.register_device_mcp_tool(schema, session.mcp_bridge.clone());
                    }
                }
            }
        }
        Err(e) => {
            tracing::debug!(error = %e, "unrecognized client message, ignoring");
        }
    }
}

async fn handle_binary_frame(session: &mut Session, bytes: &[u8]) {
    let payloads = decode_inbound_frame(session, bytes);
    for payload in payloads {
        let pcm = match session.opus.decode_frame(&payload) {
            Ok(pcm) => pcm,
            Err(e) => {
                tracing::debug!(error = %e, "dropping undecodable opus frame");
                continue;
            }
        };
        let floats: Vec<f32> = pcm.iter().map(|s| *s as f32 / i16::MAX as f32).collect();
        for chunk in floats.chunks(DEFAULT_FRAME_SIZE) {
            if chunk.len() < DEFAULT_FRAME_SIZE {
                break;
            }
            let edge = session.vad.push_frame(chunk).unwrap_or(VoiceEdge::None);
            match edge {
                VoiceEdge::VoiceStart => {
                    if session.state == ConnState::Speaking {
                        session.handle_abort().await;
                    }
                    if !session.in_voice_turn {
                        session.state = ConnState::Listening;
                        let _ = session.asr.open_audio_channels().await;
                        session.in_voice_turn = true;
                    }
                    session.just_woken_up = false;
                }
                VoiceEdge::VoiceStop => {
                    finalize_asr_turn(session).await;
                }
                VoiceEdge::None => {}
            }
        }
        let have_voice = session.vad.is_in_voice_turn();
        let _ = session.asr.receive_audio(&pcm, have_voice).await;
        session.last_activity = Instant::now();
    }
}

async fn finalize_asr_turn(session: &mut Session) {
    session.in_voice_turn = false;
    session.state = ConnState::Thinking;
    let outcome = tokio::time::timeout(Duration::from_secs(PROVIDER_TIMEOUT_SECS), session.asr.finalize()).await;
    match outcome {
        Ok(Ok(transcript)) => {
            session.handle_user_text(&transcript.text).await;
        }
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "ASR finalize failed");
            session.state = ConnState::Idle;
        }
        Err(_) => {
            tracing::warn!("ASR finalize timed out");
            session.state = ConnState::Idle;
        }
    }
    session.asr.reset();
}

/// Two-level idle policy (§4.8). Returns true if the connection should
/// close now.
async fn check_idle_policy(session: &mut Session) -> bool {
    let idle = session.last_activity.elapsed();
    let no_voice_time = session.idle_deadline();

    if !session.close_after_chat && idle > no_voice_time {
        if session.shared.config.idle.enable_farewell {
            let farewell = session.shared.config.idle.farewell_text.clone();
            session.speak_text(&farewell).await;
        }
        session.close_after_chat = true;
        session.last_activity = Instant::now();
        return false;
    }

    if session.close_after_chat && idle > Duration::from_secs(60) {
        return true;
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_trailing_punctuation_for_wake_word_match() {
        assert_eq!(normalize_wake_text("Hey Assistant!"), "hey assistant");
        assert_eq!(normalize_wake_text("hey assistant"), "hey assistant");
    }

    #[test]
    fn matches_configured_wake_word_regardless_of_punctuation() {
        let words = vec!["Hey Assistant".to_string(), "Wake Up".to_string()];
        assert_eq!(matching_wake_word(&words, "hey assistant?"), Some("Hey Assistant"));
        assert!(matching_wake_word(&words, "good morning").is_none());
    }

    #[test]
    fn hello_message_reports_fixed_audio_params() {
        let msg = hello_message("sess-1");
        assert_eq!(msg["type"], "hello");
        assert_eq!(msg["audio_params"]["sample_rate"], SAMPLE_RATE_HZ);
        assert_eq!(msg["audio_params"]["frame_duration"], FRAME_DURATION_MS);
    }

    #[test]
    fn tts_state_message_omits_text_when_absent() {
        let msg = tts_state_message("s", "start", None);
        assert!(msg.get("text").is_none());
        let msg = tts_state_message("s", "sentence_start", Some("hi"));
        assert_eq!(msg["text"], "hi");
    }

    #[test]
    fn server_action_message_carries_restart_content() {
        let msg = server_action_message("success", "restarting", json!({"action": "restart"}));
        assert_eq!(msg["content"]["action"], "restart");
    }
}
