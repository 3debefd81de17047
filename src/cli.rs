//! CLI interface for the gateway process

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::config::Config;

#[derive(Parser)]
#[command(name = "xiaozhi-gateway")]
#[command(about = "Per-device voice-assistant gateway: VAD -> ASR -> LLM -> TTS over WebSocket", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to gateway.toml (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the WebSocket acceptor and serve device connections
    Serve,
    /// Inspect or edit the on-disk configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the resolved configuration
    Show,
    /// Set a single configuration key (dotted path, e.g. `server.port`)
    Set {
        key: String,
        value: String,
    },
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve => {
            let config = Config::load(cli.config.as_deref())?;
            crate::server::start(config).await
        }
        Commands::Config { command } => run_config_command(command, cli.config.as_deref()),
    }
}

fn run_config_command(command: ConfigCommands, path_override: Option<&std::path::Path>) -> Result<()> {
    match command {
        ConfigCommands::Show => {
            let config = Config::load(path_override)?;
            crate::config::show_config(&config);
            Ok(())
        }
        ConfigCommands::Set { key, value } => {
            let mut config = Config::load(path_override)?;
            set_config_value(&mut config, &key, &value)?;
            config.save(path_override)?;
            println!("set {key} = {value}");
            Ok(())
        }
    }
}

/// Applies a single dotted-path key/value override. Grounded on the
/// teacher's `cli.rs` config-editing subcommands, scoped to the fields
/// this gateway's `Config` actually has.
fn set_config_value(config: &mut Config, key: &str, value: &str) -> Result<()> {
    match key {
        "server.host" => config.server.host = value.to_string(),
        "server.port" => config.server.port = value.parse()?,
        "auth.require_auth" => config.auth.require_auth = value.parse()?,
        "auth.access_token_expiry_minutes" => config.auth.access_token_expiry_minutes = value.parse()?,
        "voice.energy_threshold_db" => config.voice.energy_threshold_db = value.parse()?,
        "voice.whisper_model" => config.voice.whisper_model = value.to_string(),
        "providers.asr" => config.providers.asr = value.to_string(),
        "providers.tts" => config.providers.tts = value.to_string(),
        "providers.llm_model" => config.providers.llm_model = value.to_string(),
        "providers.llm_base_url" => config.providers.llm_base_url = value.to_string(),
        "idle.close_connection_no_voice_time_secs" => {
            config.idle.close_connection_no_voice_time_secs = value.parse()?
        }
        "intent.mode" => {
            config.intent.mode = match value {
                "no_intent" => crate::config::IntentMode::NoIntent,
                "intent_llm" => crate::config::IntentMode::IntentLlm,
                "function_call" => crate::config::IntentMode::FunctionCall,
                other => anyhow::bail!("unknown intent mode: {other}"),
            }
        }
        other => anyhow::bail!("unknown config key: {other}"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_config_value_updates_known_keys() {
        let mut config = Config::default();
        set_config_value(&mut config, "server.port", "9000").unwrap();
        assert_eq!(config.server.port, 9000);
    }

    #[test]
    fn set_config_value_rejects_unknown_keys() {
        let mut config = Config::default();
        assert!(set_config_value(&mut config, "bogus.key", "x").is_err());
    }
}
