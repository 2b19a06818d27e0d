use crate::llm::{ModelSettings, Provider};
use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;

/// Primary credential variable, checked before [`FALLBACK_KEY_VAR`].
pub const API_KEY_VAR: &str = "GEMINI_API_KEY";
/// Generic credential variable.
pub const FALLBACK_KEY_VAR: &str = "API_KEY";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, env = "CONFIG_FILE")]
    pub config: Option<String>,

    /// Port to listen on
    #[arg(long, env = "PORT")]
    pub port: Option<u16>,

    /// Address to bind
    #[arg(long, env = "HOST")]
    pub host: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    pub log_json: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub model: ModelConfig,
    pub game: GameConfig,
    pub log: LogConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModelConfig {
    pub base_url: String,
    pub text_model: String,
    pub image_model: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GameConfig {
    /// Replies must be longer than this (in characters) to earn a scene image.
    pub scene_min_chars: usize,
    pub boot_delay_ms: u64,
    pub boot_jitter_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogConfig {
    pub json: bool,
}

impl AppConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        Self::load_from_args(std::env::args())
    }

    /// Priority: CLI flag > CLI env var > `PHANTOM_*` env > config file > defaults.
    pub fn load_from_args<I, T>(args: I) -> Result<Self, config::ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let cli =
            Cli::try_parse_from(args).map_err(|e| config::ConfigError::Message(e.to_string()))?;

        let mut builder = Config::builder()
            .set_default("server.port", 3000)?
            .set_default("server.host", "127.0.0.1")?
            .set_default("model.base_url", "https://generativelanguage.googleapis.com")?
            .set_default("model.text_model", "gemini-2.5-flash")?
            .set_default("model.image_model", "gemini-2.5-flash-image")?
            .set_default("model.temperature", 0.7)?
            .set_default("model.max_output_tokens", 500)?
            .set_default("game.scene_min_chars", 50)?
            .set_default("game.boot_delay_ms", 600)?
            .set_default("game.boot_jitter_ms", 300)?
            .set_default("log.json", false)?;

        builder = match &cli.config {
            Some(path) => builder.add_source(File::with_name(path)),
            None => builder.add_source(File::with_name("phantom").required(false)),
        };

        // E.g. PHANTOM_SERVER__PORT=8000
        builder = builder.add_source(
            Environment::with_prefix("PHANTOM")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        if let Some(port) = cli.port {
            builder = builder.set_override("server.port", port)?;
        }
        if let Some(host) = cli.host {
            builder = builder.set_override("server.host", host)?;
        }
        if cli.log_json {
            builder = builder.set_override("log.json", true)?;
        }

        builder.build()?.try_deserialize()
    }
}

/// Read the API credential from the environment.
///
/// Blank values count as absent.
pub fn load_api_key() -> Option<String> {
    [API_KEY_VAR, FALLBACK_KEY_VAR]
        .iter()
        .filter_map(|var| std::env::var(var).ok())
        .find(|v| !v.trim().is_empty())
}

/// Build model settings from config plus the environment credential.
pub fn load_model_settings(config: &AppConfig) -> ModelSettings {
    let model = &config.model;
    ModelSettings {
        provider: Provider::detect_from_url(&model.base_url),
        base_url: model.base_url.clone(),
        api_key: load_api_key(),
        text_model: model.text_model.clone(),
        image_model: model.image_model.clone(),
        temperature: model.temperature,
        max_output_tokens: model.max_output_tokens,
    }
}
