//! Voice processing: VAD gate and local ASR/TTS providers.
//!
//! `vad` holds the energy-based detector plus the per-connection
//! `VoiceGate` edge API; `stt_local`/`tts_local` are the subprocess-backed
//! local providers, used when a connection's config selects the local
//! ASR/TTS role rather than a remote streaming provider.

pub mod stt_local;
pub mod tts_local;
pub mod vad;
