//! Configuration management
//!
//! Local bootstrap config for the gateway process: listen address, TLS
//! material, per-connection idle/wake-word policy, device auth, and the
//! ASR/LLM/TTS provider role maps. Distinct from (and not a replacement
//! for) any later remote per-device management API.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub voice: VoiceConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub idle: IdleConfig,
    #[serde(default)]
    pub wakeup: WakeupConfig,
    #[serde(default)]
    pub intent: IntentConfig,
    #[serde(default)]
    pub mcp: McpConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            auth: AuthConfig::default(),
            voice: VoiceConfig::default(),
            providers: ProvidersConfig::default(),
            idle: IdleConfig::default(),
            wakeup: WakeupConfig::default(),
            intent: IntentConfig::default(),
            mcp: McpConfig::default(),
        }
    }
}

/// Server-side MCP tool dispatch (§4.5 C5): tools spawned as stdio or
/// HTTP child clients from a settings file, rather than uploaded by the
/// device over the WebSocket.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpConfig {
    /// Path to a `.mcp_server_settings.json`-shaped file describing the
    /// servers to spawn. Unset means no server-side MCP tools are loaded.
    #[serde(default)]
    pub settings_path: Option<String>,
}

/// Listener and TLS settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Path to a PEM cert chain; when set alongside `tls_key_path`, the
    /// acceptor terminates TLS directly instead of serving plain ws://.
    #[serde(default)]
    pub tls_cert_path: Option<PathBuf>,
    #[serde(default)]
    pub tls_key_path: Option<PathBuf>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            tls_cert_path: None,
            tls_key_path: None,
        }
    }
}

/// JWT bearer-token auth plus the device-whitelist fallback (Open
/// Question #1 in DESIGN.md).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// JWT secret key (auto-generated on first run if unset).
    pub jwt_secret: Option<String>,
    #[serde(default = "default_token_expiry")]
    pub access_token_expiry_minutes: i64,
    /// Device ids allowed to connect without a bearer token.
    #[serde(default)]
    pub device_whitelist: Vec<String>,
    #[serde(default = "default_true")]
    pub require_auth: bool,
}

fn default_token_expiry() -> i64 {
    60
}

fn default_true() -> bool {
    true
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: None,
            access_token_expiry_minutes: default_token_expiry(),
            device_whitelist: Vec::new(),
            require_auth: true,
        }
    }
}

/// VAD thresholds and local ASR/TTS bridge settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceConfig {
    #[serde(default = "default_energy_threshold_db")]
    pub energy_threshold_db: f32,
    #[serde(default = "default_voice_stop_silence_frames")]
    pub voice_stop_silence_frames: usize,
    /// faster-whisper model size used by the local ASR bridge.
    #[serde(default = "default_whisper_model")]
    pub whisper_model: String,
    /// Path to the faster-whisper subprocess script invoked by the local ASR bridge.
    #[serde(default = "default_whisper_script_path")]
    pub whisper_script_path: String,
    /// Base URL of the local Kokoro-compatible TTS bridge.
    #[serde(default = "default_local_tts_url")]
    pub local_tts_url: String,
    #[serde(default = "default_local_tts_voice")]
    pub local_tts_voice: String,
}

fn default_energy_threshold_db() -> f32 {
    40.0
}

fn default_voice_stop_silence_frames() -> usize {
    40 // 400ms at 10ms frames
}

fn default_whisper_model() -> String {
    "base".to_string()
}

fn default_whisper_script_path() -> String {
    "faster-whisper-server.py".to_string()
}

fn default_local_tts_url() -> String {
    "http://127.0.0.1:8880".to_string()
}

fn default_local_tts_voice() -> String {
    "af_heart".to_string()
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            energy_threshold_db: default_energy_threshold_db(),
            voice_stop_silence_frames: default_voice_stop_silence_frames(),
            whisper_model: default_whisper_model(),
            whisper_script_path: default_whisper_script_path(),
            local_tts_url: default_local_tts_url(),
            local_tts_voice: default_local_tts_voice(),
        }
    }
}

/// Selects which provider implementation backs each role. `"local"`
/// selects the in-process/subprocess-bridged provider; any other value
/// is treated as a remote provider name resolved at connection init.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default = "default_local")]
    pub asr: String,
    #[serde(default = "default_local")]
    pub tts: String,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    #[serde(default)]
    pub llm_api_key: Option<String>,
    #[serde(default = "default_llm_base_url")]
    pub llm_base_url: String,
}

fn default_local() -> String {
    "local".to_string()
}

fn default_llm_model() -> String {
    "z-ai/glm-5".to_string()
}

fn default_llm_base_url() -> String {
    "https://openrouter.ai/api/v1".to_string()
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            asr: default_local(),
            tts: default_local(),
            llm_model: default_llm_model(),
            llm_api_key: None,
            llm_base_url: default_llm_base_url(),
        }
    }
}

/// Two-level idle-close policy (§4.8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdleConfig {
    #[serde(default = "default_no_voice_time")]
    pub close_connection_no_voice_time_secs: i64,
    #[serde(default = "default_true")]
    pub enable_farewell: bool,
    #[serde(default = "default_farewell_text")]
    pub farewell_text: String,
}

fn default_no_voice_time() -> i64 {
    120
}

fn default_farewell_text() -> String {
    "I haven't heard from you in a while, going to sleep now. Say the wake word to talk again.".to_string()
}

impl Default for IdleConfig {
    fn default() -> Self {
        Self {
            close_connection_no_voice_time_secs: default_no_voice_time(),
            enable_farewell: true,
            farewell_text: default_farewell_text(),
        }
    }
}

/// Cached wake-word response settings, grounded on `original_source`'s
/// `WAKEUP_CONFIG`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WakeupConfig {
    #[serde(default)]
    pub enable_cache: bool,
    #[serde(default)]
    pub words: Vec<String>,
    #[serde(default = "default_refresh_time_secs")]
    pub refresh_time_secs: u64,
}

fn default_refresh_time_secs() -> u64 {
    300
}

impl Default for WakeupConfig {
    fn default() -> Self {
        Self {
            enable_cache: false,
            words: Vec::new(),
            refresh_time_secs: default_refresh_time_secs(),
        }
    }
}

/// Intent-router mode selection (§4.10).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IntentMode {
    NoIntent,
    IntentLlm,
    FunctionCall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentConfig {
    #[serde(default = "default_intent_mode")]
    pub mode: IntentMode,
    #[serde(default = "default_intent_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
}

fn default_intent_mode() -> IntentMode {
    IntentMode::FunctionCall
}

fn default_intent_cache_ttl_secs() -> u64 {
    600
}

impl Default for IntentConfig {
    fn default() -> Self {
        Self {
            mode: default_intent_mode(),
            cache_ttl_secs: default_intent_cache_ttl_secs(),
        }
    }
}

impl Config {
    pub fn load(path_override: Option<&std::path::Path>) -> Result<Self> {
        let path = match path_override {
            Some(p) => p.to_path_buf(),
            None => config_path()?,
        };

        if path.exists() {
            let contents = std::fs::read_to_string(&path).context("Failed to read config file")?;
            let config: Config = toml::from_str(&contents).context("Failed to parse config file")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save(Some(&path))?;
            Ok(config)
        }
    }

    pub fn save(&self, path_override: Option<&std::path::Path>) -> Result<()> {
        let path = match path_override {
            Some(p) => p.to_path_buf(),
            None => config_path()?,
        };
        let parent = path.parent().context("Config path has no parent")?;
        std::fs::create_dir_all(parent).context("Failed to create config directory")?;

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(&path, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Generate and persist a JWT secret if not already configured.
    pub fn ensure_jwt_secret(&mut self) -> Result<String> {
        if let Some(secret) = &self.auth.jwt_secret {
            return Ok(secret.clone());
        }
        let secret = crate::server::auth::generate_jwt_secret();
        self.auth.jwt_secret = Some(secret.clone());
        self.save(None)?;
        Ok(secret)
    }
}

pub fn config_path() -> Result<PathBuf> {
    let base = directories::ProjectDirs::from("com", "xiaozhi", "gateway")
        .context("Failed to get project directories")?;
    Ok(base.config_dir().join("gateway.toml"))
}

pub fn data_dir() -> Result<PathBuf> {
    let base = directories::ProjectDirs::from("com", "xiaozhi", "gateway")
        .context("Failed to get project directories")?;
    Ok(base.data_dir().to_path_buf())
}

/// Path to the per-device YAML memory summary store (§6).
pub fn memory_path() -> Result<PathBuf> {
    Ok(data_dir()?.join(".memory.yaml"))
}

pub fn show_config(config: &Config) {
    println!("listen:        {}:{}", config.server.host, config.server.port);
    println!("tls:           {}", config.server.tls_cert_path.is_some());
    println!("auth required: {}", config.auth.require_auth);
    println!("device whitelist entries: {}", config.auth.device_whitelist.len());
    println!("asr provider:  {}", config.providers.asr);
    println!("tts provider:  {}", config.providers.tts);
    println!("llm model:     {}", config.providers.llm_model);
    println!(
        "idle close:    {}s (+60s hard close)",
        config.idle.close_connection_no_voice_time_secs
    );
    println!("intent mode:   {:?}", config.intent.mode);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_toml() {
        let config = Config::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.server.port, config.server.port);
        assert_eq!(parsed.idle.close_connection_no_voice_time_secs, 120);
    }

    #[test]
    fn load_writes_defaults_on_first_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.toml");
        assert!(!path.exists());
        let config = Config::load(Some(&path)).unwrap();
        assert!(path.exists());
        assert_eq!(config.server.port, default_port());
    }
}
