//! ASR session (C3): local subprocess-bridged transcription and the
//! remote-streaming provider contract.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::voice::stt_local::LocalStt;

#[derive(Debug, Error)]
pub enum AsrError {
    #[error("transcription failed: {0}")]
    Transcribe(String),
    #[error("remote ASR stream error: {0}")]
    Stream(String),
}

/// Transcript payload. The raw string may itself be a JSON object
/// `{speaker, content}` carrying speaker-diarization metadata; callers
/// use [`Transcript::parse`] rather than assuming plain text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transcript {
    pub text: String,
    pub speaker: Option<String>,
}

impl Transcript {
    pub fn parse(raw: &str) -> Self {
        #[derive(Deserialize)]
        struct Diarized {
            speaker: String,
            content: String,
        }

        match serde_json::from_str::<Diarized>(raw) {
            Ok(d) => Transcript { text: d.content, speaker: Some(d.speaker) },
            Err(_) => Transcript { text: raw.to_string(), speaker: None },
        }
    }
}

/// Contract shared by local and remote-streaming ASR providers.
///
/// `open_audio_channels` starts a per-connection consumer; `receive_audio`
/// buffers frames as they arrive; `finalize` is called on `voice_stop` (or
/// a client `listen=stop`) and must emit exactly one transcript.
#[async_trait]
pub trait Asr: Send + Sync {
    async fn open_audio_channels(&mut self) -> Result<(), AsrError>;
    async fn receive_audio(&mut self, pcm_frame: &[i16], have_voice: bool) -> Result<(), AsrError>;
    async fn finalize(&mut self) -> Result<Transcript, AsrError>;
    fn reset(&mut self);
}

/// Local ASR: buffers PCM in memory and transcribes the whole utterance
/// via the faster-whisper subprocess bridge on `finalize`. Shared across
/// connections (wraps a cheaply-cloned client); per-connection state is
/// just the accumulation buffer.
pub struct LocalAsr {
    client: std::sync::Arc<LocalStt>,
    buffer: Vec<i16>,
}

impl LocalAsr {
    pub fn new(client: std::sync::Arc<LocalStt>) -> Self {
        Self { client, buffer: Vec::new() }
    }
}

#[async_trait]
impl Asr for LocalAsr {
    async fn open_audio_channels(&mut self) -> Result<(), AsrError> {
        self.buffer.clear();
        Ok(())
    }

    async fn receive_audio(&mut self, pcm_frame: &[i16], have_voice: bool) -> Result<(), AsrError> {
        if have_voice {
            self.buffer.extend_from_slice(pcm_frame);
        }
        Ok(())
    }

    async fn finalize(&mut self) -> Result<Transcript, AsrError> {
        let text = self
            .client
            .transcribe(&self.buffer)
            .await
            .map_err(|e| AsrError::Transcribe(e.to_string()))?;
        self.buffer.clear();
        Ok(Transcript { text, speaker: None })
    }

    fn reset(&mut self) {
        self.buffer.clear();
    }
}

/// Remote-streaming ASR: pushes Opus/PCM frames to a remote endpoint as
/// they arrive and receives transcript events over the same connection.
/// Instantiated per-connection. The actual wire protocol is
/// provider-specific; this holds the accumulated partial text so
/// `finalize` can return the best-known transcript even if the provider
/// never sends an explicit final event before `voice_stop`.
pub struct RemoteStreamingAsr {
    endpoint: String,
    client: reqwest::Client,
    partial: String,
}

impl RemoteStreamingAsr {
    pub fn new(endpoint: impl Into<String>, client: reqwest::Client) -> Self {
        Self { endpoint: endpoint.into(), client, partial: String::new() }
    }
}

#[async_trait]
impl Asr for RemoteStreamingAsr {
    async fn open_audio_channels(&mut self) -> Result<(), AsrError> {
        self.partial.clear();
        Ok(())
    }

    async fn receive_audio(&mut self, pcm_frame: &[i16], have_voice: bool) -> Result<(), AsrError> {
        if !have_voice {
            return Ok(());
        }
        let bytes: Vec<u8> = pcm_frame.iter().flat_map(|s| s.to_le_bytes()).collect();
        let resp = self
            .client
            .post(&self.endpoint)
            .body(bytes)
            .send()
            .await
            .map_err(|e| AsrError::Stream(e.to_string()))?;
        if let Ok(text) = resp.text().await {
            if !text.is_empty() {
                self.partial = text;
            }
        }
        Ok(())
    }

    async fn finalize(&mut self) -> Result<Transcript, AsrError> {
        let transcript = Transcript::parse(&self.partial);
        self.partial.clear();
        Ok(transcript)
    }

    fn reset(&mut self) {
        self.partial.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transcript_parses_plain_text() {
        let t = Transcript::parse("turn on the lamp");
        assert_eq!(t.text, "turn on the lamp");
        assert!(t.speaker.is_none());
    }

    #[test]
    fn transcript_parses_diarized_json() {
        let t = Transcript::parse(r#"{"speaker":"alice","content":"turn on the lamp"}"#);
        assert_eq!(t.text, "turn on the lamp");
        assert_eq!(t.speaker.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn local_asr_buffers_only_voiced_frames() {
        let client = std::sync::Arc::new(LocalStt::new("base", "faster-whisper-server.py"));
        let mut asr = LocalAsr::new(client);
        asr.open_audio_channels().await.unwrap();
        asr.receive_audio(&[1, 2, 3], true).await.unwrap();
        asr.receive_audio(&[9, 9, 9], false).await.unwrap();
        assert_eq!(asr.buffer, vec![1, 2, 3]);
    }
}
