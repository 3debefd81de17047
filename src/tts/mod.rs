//! TTS pipeline (C7): buffers LLM text into sentences, synthesizes each
//! to PCM, encodes to Opus, and frames the result with FIRST/MIDDLE/LAST
//! sentence markers for the audio-sender worker.
//!
//! Adapted from the teacher's `voice/tts_local.rs` (`LocalTts`, Kokorox
//! HTTP client), generalized behind a `Tts` trait so a provider-fatal
//! error can fall through to `DefaultTts` rather than wedging a
//! connection, per `original_source`'s `core/providers/tts/default`.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_stream::wrappers::ReceiverStream;

use crate::codec::{encode_pcm_to_opus_stream, CodecError, OpusCodec, SAMPLE_RATE_HZ};
use crate::voice::tts_local::LocalTts;

#[derive(Debug, Error)]
pub enum TtsError {
    #[error("synthesis failed: {0}")]
    Synthesis(String),
    #[error("provider unavailable")]
    ProviderUnavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SentenceType {
    First,
    Middle,
    Last,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    Text,
    File,
    Action,
}

/// Item on the text-in queue (TTSMessage).
#[derive(Debug, Clone)]
pub struct TtsMessage {
    pub sentence_id: String,
    pub sentence_type: SentenceType,
    pub content_type: ContentType,
    pub content_detail: Option<String>,
    pub content_file: Option<String>,
}

impl TtsMessage {
    pub fn first(sentence_id: impl Into<String>) -> Self {
        Self {
            sentence_id: sentence_id.into(),
            sentence_type: SentenceType::First,
            content_type: ContentType::Action,
            content_detail: None,
            content_file: None,
        }
    }

    pub fn middle_text(sentence_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            sentence_id: sentence_id.into(),
            sentence_type: SentenceType::Middle,
            content_type: ContentType::Text,
            content_detail: Some(text.into()),
            content_file: None,
        }
    }

    pub fn last(sentence_id: impl Into<String>) -> Self {
        Self {
            sentence_id: sentence_id.into(),
            sentence_type: SentenceType::Last,
            content_type: ContentType::Action,
            content_detail: None,
            content_file: None,
        }
    }
}

/// Item on the audio-out queue: `(SentenceType, opus_frames | [], text?)`.
#[derive(Debug, Clone)]
pub struct AudioQueueItem {
    pub sentence_type: SentenceType,
    pub opus_frames: Vec<Vec<u8>>,
    pub text: Option<String>,
}

/// One PCM16 mono chunk plus the sample rate it was synthesized at.
pub type TtsChunk = Result<(Vec<i16>, u32), TtsError>;

/// Synthesizer contract covering all three interface variants a TTS
/// provider may expose; all feed the same `AudioQueueItem` audio queue
/// once resampled and Opus-encoded by [`TtsPipeline`].
#[async_trait]
pub trait Tts: Send + Sync {
    /// NON_STREAM: whole utterance in, whole PCM buffer out.
    async fn synthesize_pcm(&self, text: &str) -> Result<(Vec<i16>, u32), TtsError>;

    /// SINGLE_STREAM: whole utterance in, PCM delivered incrementally as
    /// it's produced. Providers that only implement NON_STREAM get this
    /// for free: the whole utterance is synthesized up front and handed
    /// back as a single-chunk stream, so callers can always use the
    /// streaming path regardless of what the backing provider supports.
    async fn synthesize_stream(&self, text: &str) -> ReceiverStream<TtsChunk> {
        let (tx, rx) = tokio::sync::mpsc::channel(1);
        let _ = tx.send(self.synthesize_pcm(text).await).await;
        ReceiverStream::new(rx)
    }
}

/// DUAL_STREAM: a session-scoped interface where text is pushed
/// incrementally and audio is streamed back before the caller closes
/// the session. Distinct from [`Tts`] because it needs session state
/// (an open connection/handle) that a stateless NON_STREAM/SINGLE_STREAM
/// provider doesn't carry.
#[async_trait]
pub trait DualStreamTts: Send + Sync {
    async fn start_session(&self) -> Result<Box<dyn DualStreamSession>, TtsError>;
}

#[async_trait]
pub trait DualStreamSession: Send {
    /// Push the next span of text into the open session.
    async fn push_text(&mut self, text: &str) -> Result<(), TtsError>;
    /// Pull the next available audio chunk, if any is ready yet.
    async fn next_chunk(&mut self) -> Option<TtsChunk>;
    /// Signal no more text is coming; the session must flush any
    /// remaining buffered audio and close.
    async fn finish(&mut self) -> Result<(), TtsError>;
}

/// Adapts any NON_STREAM [`Tts`] provider to the DUAL_STREAM contract by
/// buffering pushed text and synthesizing the whole thing on `finish`.
/// Used where a DUAL_STREAM-capable provider isn't configured but the
/// orchestrator's call site only knows about the session-based contract.
pub struct BufferedDualStreamSession {
    tts: Arc<dyn Tts>,
    buffer: String,
    pending: Vec<TtsChunk>,
}

impl BufferedDualStreamSession {
    pub fn new(tts: Arc<dyn Tts>) -> Self {
        Self { tts, buffer: String::new(), pending: Vec::new() }
    }
}

#[async_trait]
impl DualStreamSession for BufferedDualStreamSession {
    async fn push_text(&mut self, text: &str) -> Result<(), TtsError> {
        self.buffer.push_str(text);
        Ok(())
    }

    async fn next_chunk(&mut self) -> Option<TtsChunk> {
        if self.pending.is_empty() {
            return None;
        }
        Some(self.pending.remove(0))
    }

    async fn finish(&mut self) -> Result<(), TtsError> {
        let text = std::mem::take(&mut self.buffer);
        if !text.trim().is_empty() {
            self.pending.push(self.tts.synthesize_pcm(&text).await);
        }
        Ok(())
    }
}

pub struct LocalTtsSynthesizer {
    inner: LocalTts,
}

impl LocalTtsSynthesizer {
    pub fn new(inner: LocalTts) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Tts for LocalTtsSynthesizer {
    async fn synthesize_pcm(&self, text: &str) -> Result<(Vec<i16>, u32), TtsError> {
        let bytes = self.inner.synthesize(text).await.map_err(|e| TtsError::Synthesis(e.to_string()))?;
        let samples: Vec<i16> = bytes
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        // Kokorox always returns 24kHz mono.
        Ok((samples, 24_000))
    }
}

/// Never fails: emits a fixed span of silence so a broken synthesizer
/// never wedges a connection.
pub struct DefaultTts;

#[async_trait]
impl Tts for DefaultTts {
    async fn synthesize_pcm(&self, _text: &str) -> Result<(Vec<i16>, u32), TtsError> {
        let silence = vec![0i16; (SAMPLE_RATE_HZ as usize / 2).max(1)];
        Ok((silence, SAMPLE_RATE_HZ))
    }
}

/// Naive linear resampler; good enough for speech-rate PCM where the
/// teacher's Kokorox bridge outputs 24kHz but the wire format is fixed
/// at 16kHz.
fn resample_linear(pcm: &[i16], from_hz: u32, to_hz: u32) -> Vec<i16> {
    if from_hz == to_hz || pcm.is_empty() {
        return pcm.to_vec();
    }
    let ratio = from_hz as f64 / to_hz as f64;
    let out_len = ((pcm.len() as f64) / ratio).round() as usize;
    let mut out = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let src_pos = i as f64 * ratio;
        let idx = src_pos.floor() as usize;
        let frac = src_pos - idx as f64;
        let a = pcm.get(idx).copied().unwrap_or(0) as f64;
        let b = pcm.get(idx + 1).copied().unwrap_or(a as i16) as f64;
        out.push((a + (b - a) * frac) as i16);
    }
    out
}

const FIRST_SENTENCE_EXTRA_PUNCTUATION: &[char] = &[',', '~', '\u{3001}', '\u{FF0C}'];
const TERMINAL_PUNCTUATION: &[char] = &['.', '!', '?', '\u{3002}', '\u{FF01}', '\u{FF1F}', '\n'];

/// Splits streamed LLM text into sentences, using an enlarged punctuation
/// set for the very first sentence of a turn to cut time-to-first-audio.
pub struct TextSegmenter {
    buffer: String,
    is_first_sentence: bool,
}

impl Default for TextSegmenter {
    fn default() -> Self {
        Self::new()
    }
}

impl TextSegmenter {
    pub fn new() -> Self {
        Self { buffer: String::new(), is_first_sentence: true }
    }

    /// Feed a chunk, returning zero or more complete sentences.
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        self.buffer.push_str(chunk);
        let mut sentences = Vec::new();
        loop {
            let boundary = if self.is_first_sentence {
                self.buffer
                    .find(|c| TERMINAL_PUNCTUATION.contains(&c) || FIRST_SENTENCE_EXTRA_PUNCTUATION.contains(&c))
            } else {
                self.buffer.find(|c| TERMINAL_PUNCTUATION.contains(&c))
            };
            match boundary {
                Some(idx) => {
                    let split_at = self.buffer[idx..].chars().next().map(|c| idx + c.len_utf8()).unwrap_or(idx + 1);
                    let sentence: String = self.buffer.drain(..split_at).collect();
                    let trimmed = sentence.trim().to_string();
                    if !trimmed.is_empty() {
                        sentences.push(trimmed);
                        self.is_first_sentence = false;
                    }
                }
                None => break,
            }
        }
        sentences
    }

    /// Flush whatever remains, to be synthesized on LAST.
    pub fn flush(&mut self) -> Option<String> {
        let remaining = std::mem::take(&mut self.buffer);
        let trimmed = remaining.trim().to_string();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed)
        }
    }
}

const MAX_SYNTHESIS_ATTEMPTS: usize = 5;

/// Per-connection synthesis worker: pulls `TtsMessage`s, synthesizes text
/// sentences, encodes to Opus, and produces `AudioQueueItem`s.
pub struct TtsPipeline {
    primary: Arc<dyn Tts>,
    fallback: Arc<DefaultTts>,
    codec: Mutex<OpusCodec>,
}

impl TtsPipeline {
    pub fn new(primary: Arc<dyn Tts>) -> Result<Self, CodecError> {
        Ok(Self { primary, fallback: Arc::new(DefaultTts), codec: Mutex::new(OpusCodec::new()?) })
    }

    /// Process one `TtsMessage`, producing the corresponding audio item.
    /// FIRST/LAST action markers pass through with no audio; TEXT middles
    /// are synthesized with up to `MAX_SYNTHESIS_ATTEMPTS` retries before
    /// falling back to silence with an error text marker.
    pub async fn process(&self, message: TtsMessage) -> AudioQueueItem {
        match message.content_type {
            ContentType::Action => AudioQueueItem { sentence_type: message.sentence_type, opus_frames: Vec::new(), text: None },
            ContentType::File => AudioQueueItem {
                sentence_type: message.sentence_type,
                opus_frames: Vec::new(),
                text: message.content_file,
            },
            ContentType::Text => {
                let text = message.content_detail.unwrap_or_default();
                self.synthesize_with_retry(message.sentence_type, &text).await
            }
        }
    }

    async fn synthesize_with_retry(&self, sentence_type: SentenceType, text: &str) -> AudioQueueItem {
        for attempt in 1..=MAX_SYNTHESIS_ATTEMPTS {
            match self.primary.synthesize_pcm(text).await {
                Ok((pcm, hz)) => return self.encode(sentence_type, text, pcm, hz).await,
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "TTS synthesis attempt failed");
                }
            }
        }
        match self.fallback.synthesize_pcm(text).await {
            Ok((pcm, hz)) => {
                let mut item = self.encode(sentence_type, text, pcm, hz).await;
                item.text = Some(format!("[tts error] {text}"));
                item
            }
            Err(_) => AudioQueueItem { sentence_type, opus_frames: Vec::new(), text: Some(format!("[tts error] {text}")) },
        }
    }

    /// SINGLE_STREAM variant of [`Self::synthesize_with_retry`]: pulls the
    /// primary provider's PCM stream and encodes each chunk as it
    /// arrives, so a streaming-capable provider can start producing
    /// audio before the whole sentence has been synthesized.
    pub async fn process_stream(&self, message: TtsMessage) -> Vec<AudioQueueItem> {
        if message.content_type != ContentType::Text {
            return vec![self.process(message).await];
        }
        let text = message.content_detail.unwrap_or_default();
        let mut chunks = self.primary.synthesize_stream(&text).await;
        let mut items = Vec::new();
        while let Some(chunk) = tokio_stream::StreamExt::next(&mut chunks).await {
            match chunk {
                Ok((pcm, hz)) => items.push(self.encode(message.sentence_type, &text, pcm, hz).await),
                Err(e) => {
                    tracing::warn!(error = %e, "streamed TTS chunk failed");
                    items.push(AudioQueueItem {
                        sentence_type: message.sentence_type,
                        opus_frames: Vec::new(),
                        text: Some(format!("[tts error] {text}")),
                    });
                }
            }
        }
        items
    }

    /// DUAL_STREAM variant: opens a session, pushes every text span
    /// incrementally, then finishes and drains whatever audio the
    /// session produced. Providers with no dedicated dual-stream
    /// transport get [`BufferedDualStreamSession`], which buffers the
    /// pushed text and synthesizes it in one shot on `finish`.
    pub async fn process_dual_stream(&self, sentence_type: SentenceType, texts: &[String]) -> Vec<AudioQueueItem> {
        let mut session = BufferedDualStreamSession::new(self.primary.clone());
        for text in texts {
            let _ = session.push_text(text).await;
        }
        let _ = session.finish().await;

        let mut items = Vec::new();
        while let Some(chunk) = session.next_chunk().await {
            match chunk {
                Ok((pcm, hz)) => items.push(self.encode(sentence_type, &texts.join(" "), pcm, hz).await),
                Err(e) => {
                    tracing::warn!(error = %e, "dual-stream TTS synthesis failed");
                    items.push(AudioQueueItem {
                        sentence_type,
                        opus_frames: Vec::new(),
                        text: Some(format!("[tts error] {}", texts.join(" "))),
                    });
                }
            }
        }
        items
    }

    async fn encode(&self, sentence_type: SentenceType, text: &str, pcm: Vec<i16>, source_hz: u32) -> AudioQueueItem {
        let resampled = resample_linear(&pcm, source_hz, SAMPLE_RATE_HZ);
        let mut frames = Vec::new();
        let mut codec = self.codec.lock().await;
        let result = encode_pcm_to_opus_stream(&mut codec, &resampled, |frame| {
            frames.push(frame);
            Ok(())
        });
        match result {
            Ok(()) => AudioQueueItem { sentence_type, opus_frames: frames, text: Some(text.to_string()) },
            Err(e) => {
                tracing::warn!(error = %e, "opus encode failed after synthesis");
                AudioQueueItem { sentence_type, opus_frames: Vec::new(), text: Some(format!("[tts error] {text}")) }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segmenter_splits_on_first_terminal_punctuation_with_enlarged_set() {
        let mut seg = TextSegmenter::new();
        let sentences = seg.push("Hi there, how are you? I am fine.");
        assert_eq!(sentences, vec!["Hi there,".to_string(), "how are you?".to_string()]);
        assert_eq!(seg.flush(), Some("I am fine.".to_string()));
    }

    #[test]
    fn segmenter_second_sentence_does_not_use_enlarged_set() {
        let mut seg = TextSegmenter::new();
        seg.push("First bit, ");
        let sentences = seg.push("second bit, still no boundary. Done.");
        // Only the first split uses the comma boundary; later commas are
        // plain text until a true terminal mark.
        assert!(sentences.iter().any(|s| s.ends_with("Done.")));
    }

    #[test]
    fn resample_linear_preserves_length_ratio() {
        let pcm = vec![0i16; 2400];
        let out = resample_linear(&pcm, 24_000, 16_000);
        assert_eq!(out.len(), 1600);
    }

    #[tokio::test]
    async fn default_tts_never_fails() {
        let tts = DefaultTts;
        let (pcm, hz) = tts.synthesize_pcm("anything").await.unwrap();
        assert!(!pcm.is_empty());
        assert_eq!(hz, SAMPLE_RATE_HZ);
    }

    #[tokio::test]
    async fn pipeline_falls_back_to_silence_on_repeated_failure() {
        struct AlwaysFails;
        #[async_trait]
        impl Tts for AlwaysFails {
            async fn synthesize_pcm(&self, _text: &str) -> Result<(Vec<i16>, u32), TtsError> {
                Err(TtsError::ProviderUnavailable)
            }
        }
        let pipeline = TtsPipeline::new(Arc::new(AlwaysFails)).unwrap();
        let item = pipeline.process(TtsMessage::middle_text("s1", "hello")).await;
        assert!(item.text.unwrap().starts_with("[tts error]"));
    }

    #[tokio::test]
    async fn action_markers_pass_through_without_synthesis() {
        let pipeline = TtsPipeline::new(Arc::new(DefaultTts)).unwrap();
        let item = pipeline.process(TtsMessage::first("s1")).await;
        assert!(item.opus_frames.is_empty());
        assert_eq!(item.sentence_type, SentenceType::First);
    }

    #[tokio::test]
    async fn default_synthesize_stream_yields_one_chunk_matching_synthesize_pcm() {
        let tts = DefaultTts;
        let expected = tts.synthesize_pcm("hello").await.unwrap();
        let mut stream = tts.synthesize_stream("hello").await;
        let first = tokio_stream::StreamExt::next(&mut stream).await.unwrap().unwrap();
        assert_eq!(first, expected);
        assert!(tokio_stream::StreamExt::next(&mut stream).await.is_none());
    }

    #[tokio::test]
    async fn process_stream_encodes_every_chunk_from_the_provider() {
        let pipeline = TtsPipeline::new(Arc::new(DefaultTts)).unwrap();
        let items = pipeline.process_stream(TtsMessage::middle_text("s1", "hello there")).await;
        assert_eq!(items.len(), 1);
        assert!(!items[0].opus_frames.is_empty());
    }

    #[tokio::test]
    async fn buffered_dual_stream_session_synthesizes_on_finish() {
        let mut session = BufferedDualStreamSession::new(Arc::new(DefaultTts));
        session.push_text("hello ").await.unwrap();
        session.push_text("world").await.unwrap();
        assert!(session.next_chunk().await.is_none());
        session.finish().await.unwrap();
        let (pcm, hz) = session.next_chunk().await.unwrap().unwrap();
        assert!(!pcm.is_empty());
        assert_eq!(hz, SAMPLE_RATE_HZ);
        assert!(session.next_chunk().await.is_none());
    }

    #[tokio::test]
    async fn process_dual_stream_produces_a_single_audio_item() {
        let pipeline = TtsPipeline::new(Arc::new(DefaultTts)).unwrap();
        let texts = vec!["hello".to_string(), "world".to_string()];
        let items = pipeline.process_dual_stream(SentenceType::Middle, &texts).await;
        assert_eq!(items.len(), 1);
        assert!(!items[0].opus_frames.is_empty());
    }
}
