//! xiaozhi-gateway - per-device voice-assistant gateway
//!
//! A real-time, per-device gateway that sits between a speaker/embedded
//! client and a stack of ASR/LLM/TTS providers: WebSocket in, Opus audio
//! and JSON control frames out, VAD-gated turn-taking, a tool/MCP/IoT
//! dispatch surface, and JWT/whitelist device auth.
//!
//! # Example
//!
//! ```ignore
//! use xiaozhi_gateway::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load(None)?;
//!     xiaozhi_gateway::server::start(config).await
//! }
//! ```

pub mod asr;
pub mod cache;
pub mod cli;
pub mod codec;
pub mod config;
pub mod dialogue;
pub mod intent;
pub mod llm;
pub mod memory;
pub mod orchestrator;
pub mod server;
pub mod tools;
pub mod tts;
pub mod types;
pub mod voice;

pub use config::Config;
pub use orchestrator::{ConnectionIdentity, SharedProviders};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Get the library info
pub fn info() -> String {
    format!("{} v{} - voice-assistant gateway", NAME, VERSION)
}

/// Truncates a string to at most `max_chars` characters, appending an
/// ellipsis when it was cut, without splitting a multi-byte character.
pub fn truncate_safe(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let truncated: String = s.chars().take(max_chars).collect();
    format!("{truncated}...")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_safe_passes_through_short_strings() {
        assert_eq!(truncate_safe("hello", 10), "hello");
    }

    #[test]
    fn truncate_safe_cuts_on_char_boundaries() {
        let s = "\u{4f60}\u{597d}\u{4e16}\u{754c}"; // 4 CJK chars
        assert_eq!(truncate_safe(s, 2), "\u{4f60}\u{597d}...");
    }
}
