//! VT.ai multimodal chat router
//!
//! Serves chat sessions over HTTP: text conversations streamed from the
//! selected model, semantic routing to image generation or vision, file
//! attachments, transcription and spoken responses. The `train-router`
//! command prepares the semantic route layer offline.

mod api;
mod chat;
mod core;
mod models;
mod routing;

use crate::api::endpoints::{AppState, create_router};
use crate::chat::handler::ChatHandler;
use crate::chat::session::SessionStore;
use crate::chat::settings::ChatSettings;
use crate::core::config::{Config, EncoderKind, RouterConfig};
use crate::core::gateway::LlmGateway;
use crate::core::logging::init_logging;
use crate::routing::RouteLayer;
use crate::routing::encoder::{Encoder, HashingEncoder, build_encoder};
use crate::routing::trainer::{DEFAULT_MAX_ITER, TrainOptions, train};
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

/// VT.ai - multimodal chat router
#[derive(Parser, Debug)]
#[command(name = "vtai")]
#[command(version, long_about = None)]
#[command(after_help = ENV_HELP)]
struct Cli {
    /// Configuration file (default: $CONFIG_PATH or config.toml)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Command {
    /// Serve chat sessions over HTTP (the default)
    Serve,
    /// Encode route utterances and write a layer file with cached embeddings
    TrainRouter(TrainArgs),
}

#[derive(Args, Debug, PartialEq)]
struct TrainArgs {
    /// Route definitions: a layer file or a JSON array of routes
    #[arg(long, value_name = "PATH")]
    routes: PathBuf,

    /// Where to write the layer with cached embeddings
    #[arg(long, value_name = "PATH")]
    output: PathBuf,

    /// Labelled utterances used to fit route thresholds
    #[arg(long, value_name = "PATH")]
    dataset: Option<PathBuf>,

    /// Encoder to embed utterances with (default from config)
    #[arg(long, value_enum)]
    encoder: Option<EncoderKind>,

    /// Threshold search passes
    #[arg(long, value_name = "N", default_value_t = DEFAULT_MAX_ITER)]
    max_iter: usize,
}

const ENV_HELP: &str = "Environment variables (also read from .env):
  OPENAI_API_KEY      OpenAI API key (required)
  GEMINI_API_KEY      Google Gemini API key, enables gemini/ models
  OPENROUTER_API_KEY  OpenRouter API key, enables openrouter/ models
  CONFIG_PATH         Configuration file path
  RUST_LOG            Log filter, overrides [server].log_level";

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(cli.config.as_deref()).await,
        Command::TrainRouter(args) => train_router(cli.config.as_deref(), args).await,
    };

    if let Err(e) = result {
        error!("{:#}", e);
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => {
            dotenv::dotenv().ok();
            Config::from_file(path)
        }
        None => Config::from_env(),
    }
}

async fn serve(config_path: Option<&Path>) -> Result<()> {
    let config = Arc::new(load_config(config_path).context("Configuration Error")?);

    init_logging(&config.log_level);
    print_startup_banner(&config);

    let gateway = Arc::new(LlmGateway::from_config(&config).context("Failed to create providers")?);
    info!("Providers: {}", gateway.provider_names().join(", "));

    let encoder = build_encoder(
        config.router.encoder,
        gateway.clone(),
        &config.router.encoder_model,
    );
    let router = match RouteLayer::from_config(&config.router, encoder).await {
        Ok(layer) => {
            info!(
                "🧭 Route layer loaded from {} ({} routes)",
                config.router.layer_path.display(),
                layer.routes().len()
            );
            Some(Arc::new(layer))
        }
        Err(e) => {
            warn!(
                "Dynamic conversation routing disabled: cannot load {}: {}",
                config.router.layer_path.display(),
                e
            );
            None
        }
    };

    // A temporary directory lives until the server stops
    let (audio_dir, _temp_audio) = match &config.audio_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create audio directory {}", dir.display()))?;
            (dir.clone(), None)
        }
        None => {
            let temp = tempfile::tempdir().context("Failed to create temporary audio directory")?;
            (temp.path().to_path_buf(), Some(temp))
        }
    };
    info!("Audio files stored in {}", audio_dir.display());

    let sessions = Arc::new(SessionStore::new(ChatSettings::from_config(&config)));
    let handler = Arc::new(ChatHandler::new(
        gateway.clone(),
        sessions.clone(),
        router.clone(),
        &config,
        audio_dir,
    ));

    let app = create_router(AppState {
        config: config.clone(),
        gateway,
        sessions,
        handler,
        router,
    });

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    info!("Server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutting down");
            }
        })
        .await
        .context("Server error")
}

async fn train_router(config_path: Option<&Path>, args: TrainArgs) -> Result<()> {
    let config = load_config(config_path);
    init_logging(config.as_ref().map(|c| c.log_level.as_str()).unwrap_or("info"));

    let kind = args
        .encoder
        .or_else(|| config.as_ref().ok().map(|c| c.router.encoder))
        .unwrap_or(EncoderKind::OpenAI);

    let top_k = config
        .as_ref()
        .map(|c| c.router.top_k)
        .unwrap_or_else(|_| RouterConfig::default().top_k);

    let encoder: Arc<dyn Encoder> = match kind {
        EncoderKind::OpenAI => {
            let config = config.context("The OpenAI encoder needs a valid configuration")?;
            let gateway =
                Arc::new(LlmGateway::from_config(&config).context("Failed to create providers")?);
            build_encoder(kind, gateway, &config.router.encoder_model)
        }
        EncoderKind::Hashing => Arc::new(HashingEncoder::new()),
    };

    let options = TrainOptions {
        routes_path: args.routes,
        output_path: args.output,
        dataset_path: args.dataset,
        top_k,
        max_iter: args.max_iter,
    };

    match train(&options, encoder).await? {
        Some(report) => println!(
            "✅ Route layer written to {} (accuracy {:.1}% -> {:.1}%)",
            options.output_path.display(),
            report.accuracy_before * 100.0,
            report.accuracy_after * 100.0
        ),
        None => println!("✅ Route layer written to {}", options.output_path.display()),
    }
    Ok(())
}

/// Print startup banner with configuration
fn print_startup_banner(config: &Config) {
    println!("🚀 VT.ai v0.1.0");
    println!("✅ Configuration loaded successfully");
    println!("   OpenAI Base URL: {}", config.openai_base_url);
    println!(
        "   Gemini: {}",
        if config.gemini_api_key.is_some() {
            "Enabled"
        } else {
            "Disabled"
        }
    );
    println!(
        "   OpenRouter: {}",
        if config.openrouter_api_key.is_some() {
            "Enabled"
        } else {
            "Disabled"
        }
    );
    if let Some(ref url) = config.ollama_base_url {
        println!("   Ollama: {}", url);
    }
    println!("   Chat Model: {}", config.models.default_chat_model);
    println!("   Vision Model: {}", config.models.default_vision_model);
    println!("   Image Model: {}", config.models.default_image_gen_model);
    println!(
        "   TTS: {} ({})",
        config.models.default_tts_model, config.models.default_tts_voice
    );
    println!(
        "   Router: {} encoder, layer {}",
        config.router.encoder.as_str(),
        config.router.layer_path.display()
    );
    println!("   Request Timeout: {}s", config.request_timeout);
    println!("   Server: {}:{}", config.host, config.port);
    println!();
}
