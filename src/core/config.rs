//! Application configuration management
//!
//! This module loads configuration from a TOML file, falling back to
//! environment variables (optionally populated from a `.env` file) for
//! provider API keys. All configuration is validated at startup.

use crate::core::constants::models;
use anyhow::{Context, Result, bail};
use clap::ValueEnum;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Default request timeout in seconds
const DEFAULT_REQUEST_TIMEOUT: u64 = 90;

/// Default maximum retries
const DEFAULT_MAX_RETRIES: u32 = 2;

/// Default server port
const DEFAULT_PORT: u16 = 8000;

/// Default request body limit in megabytes; attachments travel base64-encoded
const DEFAULT_MAX_UPLOAD_MB: usize = 20;

/// Sampling temperature used for chat completions
const DEFAULT_TEMPERATURE: f32 = 0.3;

/// Share of a model's context window that trimmed history may occupy
const DEFAULT_TRIM_RATIO: f32 = 0.75;

/// Number of nearest utterances considered by the semantic router
const DEFAULT_TOP_K: usize = 5;

const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";
const DEFAULT_OLLAMA_BASE_URL: &str = "http://localhost:11434/v1";

#[derive(Debug, Clone, Deserialize, Default)]
pub struct OpenAIConfig {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct GeminiConfig {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct OpenRouterConfig {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub site_url: Option<String>,
    #[serde(default)]
    pub app_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct OllamaConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Directory for generated speech; a temporary directory when unset
    #[serde(default)]
    pub audio_dir: Option<PathBuf>,
    /// Largest accepted request body, in megabytes
    #[serde(default = "default_max_upload_mb")]
    pub max_upload_mb: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            log_level: default_log_level(),
            audio_dir: None,
            max_upload_mb: default_max_upload_mb(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RequestConfig {
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_trim_ratio")]
    pub trim_ratio: f32,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            request_timeout: default_request_timeout(),
            max_retries: default_max_retries(),
            temperature: default_temperature(),
            trim_ratio: default_trim_ratio(),
        }
    }
}

/// Capability entry for a model missing from the built-in table
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct CatalogEntry {
    pub name: String,
    pub context_window: usize,
    #[serde(default)]
    pub supports_vision: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_chat_model")]
    pub default_chat_model: String,
    #[serde(default = "default_vision_model")]
    pub default_vision_model: String,
    #[serde(default = "default_image_gen_model")]
    pub default_image_gen_model: String,
    #[serde(default = "default_tts_model")]
    pub default_tts_model: String,
    #[serde(default = "default_tts_voice")]
    pub default_tts_voice: String,
    #[serde(default = "default_whisper_model")]
    pub default_whisper_model: String,
    #[serde(default = "default_chat_models")]
    pub chat_models: Vec<String>,
    #[serde(default = "default_vision_models")]
    pub vision_models: Vec<String>,
    #[serde(default = "default_tts_models")]
    pub tts_models: Vec<String>,
    #[serde(default = "default_tts_voices")]
    pub tts_voices: Vec<String>,
    /// User-facing alias to provider model id
    #[serde(default)]
    pub aliases: HashMap<String, String>,
    #[serde(default)]
    pub catalog: Vec<CatalogEntry>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            default_chat_model: default_chat_model(),
            default_vision_model: default_vision_model(),
            default_image_gen_model: default_image_gen_model(),
            default_tts_model: default_tts_model(),
            default_tts_voice: default_tts_voice(),
            default_whisper_model: default_whisper_model(),
            chat_models: default_chat_models(),
            vision_models: default_vision_models(),
            tts_models: default_tts_models(),
            tts_voices: default_tts_voices(),
            aliases: HashMap::new(),
            catalog: Vec::new(),
        }
    }
}

/// Which encoder turns utterances into vectors for the semantic router
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum EncoderKind {
    #[value(name = "openai")]
    OpenAI,
    Hashing,
}

impl EncoderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EncoderKind::OpenAI => "openai",
            EncoderKind::Hashing => "hashing",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouterConfig {
    #[serde(default = "default_layer_path")]
    pub layer_path: PathBuf,
    #[serde(default = "default_encoder")]
    pub encoder: EncoderKind,
    #[serde(default = "default_encoder_model")]
    pub encoder_model: String,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Overrides the encoder's default similarity threshold
    #[serde(default)]
    pub score_threshold: Option<f32>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            layer_path: default_layer_path(),
            encoder: default_encoder(),
            encoder_model: default_encoder_model(),
            top_k: default_top_k(),
            score_threshold: None,
        }
    }
}

/// Initial values of the per-session switches
#[derive(Debug, Clone, Deserialize)]
pub struct SettingsDefaults {
    #[serde(default = "default_true")]
    pub enable_tts_response: bool,
    #[serde(default = "default_true")]
    pub use_dynamic_conversation_routing: bool,
    #[serde(default = "default_true")]
    pub trim_messages: bool,
}

impl Default for SettingsDefaults {
    fn default() -> Self {
        Self {
            enable_tts_response: true,
            use_dynamic_conversation_routing: true,
            trim_messages: true,
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_upload_mb() -> usize {
    DEFAULT_MAX_UPLOAD_MB
}

fn default_request_timeout() -> u64 {
    DEFAULT_REQUEST_TIMEOUT
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_temperature() -> f32 {
    DEFAULT_TEMPERATURE
}

fn default_trim_ratio() -> f32 {
    DEFAULT_TRIM_RATIO
}

fn default_chat_model() -> String {
    models::DEFAULT_CHAT_MODEL.to_string()
}

fn default_vision_model() -> String {
    models::DEFAULT_VISION_MODEL.to_string()
}

fn default_image_gen_model() -> String {
    models::DEFAULT_IMAGE_GEN_MODEL.to_string()
}

fn default_tts_model() -> String {
    models::DEFAULT_TTS_MODEL.to_string()
}

fn default_tts_voice() -> String {
    models::DEFAULT_TTS_VOICE.to_string()
}

fn default_whisper_model() -> String {
    models::DEFAULT_WHISPER_MODEL.to_string()
}

fn default_chat_models() -> Vec<String> {
    [
        models::GPT_4O_MINI,
        models::GPT_4O,
        models::GEMINI_1_5_FLASH,
        models::GEMINI_1_5_PRO,
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_vision_models() -> Vec<String> {
    [
        models::GPT_4O,
        models::GPT_4O_MINI,
        models::GEMINI_1_5_PRO,
        models::GEMINI_1_5_FLASH,
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_tts_models() -> Vec<String> {
    vec![models::TTS_1.to_string(), models::TTS_1_HD.to_string()]
}

fn default_tts_voices() -> Vec<String> {
    models::TTS_VOICES.iter().map(|s| s.to_string()).collect()
}

fn default_layer_path() -> PathBuf {
    PathBuf::from("router/semantic_route_layers.json")
}

fn default_encoder() -> EncoderKind {
    EncoderKind::OpenAI
}

fn default_encoder_model() -> String {
    models::TEXT_EMBEDDING_3_SMALL.to_string()
}

fn default_top_k() -> usize {
    DEFAULT_TOP_K
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub openai: OpenAIConfig,
    #[serde(default)]
    pub gemini: GeminiConfig,
    #[serde(default)]
    pub openrouter: OpenRouterConfig,
    #[serde(default)]
    pub ollama: OllamaConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub request: RequestConfig,
    #[serde(default)]
    pub models: ModelConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub settings: SettingsDefaults,
}

/// Application configuration
///
/// All configuration values are loaded and validated at startup so the
/// service fails fast when misconfigured.
#[derive(Debug, Clone)]
pub struct Config {
    /// OpenAI API key (required: chat defaults, TTS, Whisper and DALL-E use it)
    pub openai_api_key: String,
    pub openai_base_url: String,

    /// Gemini API key; Gemini models are unavailable without it
    pub gemini_api_key: Option<String>,
    pub gemini_base_url: String,

    pub openrouter_api_key: Option<String>,
    pub openrouter_base_url: String,
    pub openrouter_site_url: Option<String>,
    pub openrouter_app_name: Option<String>,

    /// Ollama endpoint, present only when the local provider is enabled
    pub ollama_base_url: Option<String>,

    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub audio_dir: Option<PathBuf>,
    /// Request body limit in bytes
    pub max_body_bytes: usize,

    /// Request timeout in seconds
    pub request_timeout: u64,
    pub max_retries: u32,
    pub temperature: f32,
    pub trim_ratio: f32,

    pub models: ModelConfig,
    pub router: RouterConfig,
    pub settings: SettingsDefaults,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// A missing file is not an error: every value has a default and API
    /// keys can come from the environment.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = if path.exists() {
            fs::read_to_string(path).context("Failed to read configuration file")?
        } else {
            String::new()
        };

        Self::from_toml_str(&content, |key| std::env::var(key).ok())
    }

    /// Load configuration from `CONFIG_PATH` (default `config.toml`),
    /// after reading a `.env` file if present
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        let config_path =
            std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
        Self::from_file(config_path)
    }

    /// Parse and validate TOML content, resolving missing keys through `env`
    pub fn from_toml_str<F>(content: &str, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let config: TomlConfig =
            toml::from_str(content).context("Failed to parse TOML configuration")?;

        let non_empty = |value: Option<String>| value.filter(|v| !v.trim().is_empty());

        let openai_api_key = non_empty(config.openai.api_key)
            .or_else(|| non_empty(env("OPENAI_API_KEY")))
            .context("OpenAI API key missing: set [openai].api_key or OPENAI_API_KEY")?;

        let gemini_api_key =
            non_empty(config.gemini.api_key).or_else(|| non_empty(env("GEMINI_API_KEY")));
        let openrouter_api_key = non_empty(config.openrouter.api_key)
            .or_else(|| non_empty(env("OPENROUTER_API_KEY")));

        let ollama_base_url = config.ollama.enabled.then(|| {
            config
                .ollama
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_OLLAMA_BASE_URL.to_string())
        });

        let mut models = config.models;
        seed_or_check(&mut models.chat_models, &models.default_chat_model, "chat")?;
        seed_or_check(
            &mut models.vision_models,
            &models.default_vision_model,
            "vision",
        )?;
        seed_or_check(&mut models.tts_models, &models.default_tts_model, "tts")?;
        seed_or_check(&mut models.tts_voices, &models.default_tts_voice, "tts voice")?;

        if config.router.top_k == 0 {
            bail!("router.top_k must be at least 1");
        }
        if config
            .router
            .score_threshold
            .is_some_and(|t| !(0.0..=1.0).contains(&t))
        {
            bail!("router.score_threshold must be between 0 and 1");
        }
        if config.server.max_upload_mb == 0 {
            bail!("server.max_upload_mb must be at least 1");
        }
        if !(config.request.trim_ratio > 0.0 && config.request.trim_ratio <= 1.0) {
            bail!("request.trim_ratio must be in (0, 1]");
        }

        Ok(Config {
            openai_api_key,
            openai_base_url: config
                .openai
                .base_url
                .unwrap_or_else(|| DEFAULT_OPENAI_BASE_URL.to_string()),
            gemini_api_key,
            gemini_base_url: config
                .gemini
                .base_url
                .unwrap_or_else(|| DEFAULT_GEMINI_BASE_URL.to_string()),
            openrouter_api_key,
            openrouter_base_url: config
                .openrouter
                .base_url
                .unwrap_or_else(|| DEFAULT_OPENROUTER_BASE_URL.to_string()),
            openrouter_site_url: config.openrouter.site_url,
            openrouter_app_name: config.openrouter.app_name,
            ollama_base_url,
            host: config.server.host,
            port: config.server.port,
            log_level: config.server.log_level,
            audio_dir: config.server.audio_dir,
            max_body_bytes: config.server.max_upload_mb.saturating_mul(1024 * 1024),
            request_timeout: config.request.request_timeout,
            max_retries: config.request.max_retries,
            temperature: config.request.temperature,
            trim_ratio: config.request.trim_ratio,
            models,
            router: config.router,
            settings: config.settings,
        })
    }
}

/// An empty list gets the default; otherwise the default must be listed
fn seed_or_check(list: &mut Vec<String>, default: &str, kind: &str) -> Result<()> {
    if list.is_empty() {
        list.push(default.to_string());
        return Ok(());
    }
    if !list.iter().any(|m| m == default) {
        bail!("Default {} model '{}' is not in the {} model list", kind, default, kind);
    }
    Ok(())
}
