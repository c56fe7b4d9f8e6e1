//! Command-line driver — one script in, one vertical MP4 out.
//!
//! # Usage
//!
//! ```sh
//! shortsmith --script story.json --output short.mp4
//! ```
//!
//! The script file is JSON:
//!
//! ```json
//! {
//!   "title": "Amazing Ocean Facts",
//!   "topic": "ocean science",
//!   "narration": "The ocean covers most of the planet...",
//!   "scenes": [
//!     {"description": "ocean waves at sunset"},
//!     {"description": "bioluminescent plankton in dark water"}
//!   ]
//! }
//! ```
//!
//! The chat-completion key is read from `SHORTSMITH_LLM_API_KEY` (falling
//! back to `GROQ_API_KEY`); without one, prompt enhancement and quality
//! evaluation degrade to their deterministic fallbacks.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::Mutex;

use shortsmith::backend::remote::RemoteBackend;
use shortsmith::backend::ImageBackend;
use shortsmith::config::Config;
use shortsmith::enhance::{LlmPromptEnhancer, PromptEnhancer, StaticEnhancer};
use shortsmith::llm::ChatClient;
use shortsmith::pipeline::{VideoPipeline, VideoScript};
use shortsmith::quality::{LlmQualityEvaluator, QualityEvaluator};
use shortsmith::resource::ResourceManager;
use shortsmith::router::BackendRouter;
use shortsmith::voice::PiperSynthesizer;

// ── CLI ──────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "shortsmith",
    about = "Generate a short vertical video from a scene script"
)]
struct Args {
    /// Path to the script JSON file.
    #[arg(long)]
    script: PathBuf,

    /// Output MP4 path.
    #[arg(long, default_value = "short.mp4")]
    output: PathBuf,

    /// Optional JSON config overlay.
    #[arg(long)]
    config: Option<PathBuf>,

    /// CUDA device ordinal used for resource accounting.
    #[arg(long, default_value_t = 0)]
    device: usize,
}

// ── Main ─────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    dotenvy::dotenv().ok();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::from_path(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => Config::default(),
    };
    if config.llm.api_key.is_empty() {
        if let Ok(key) = std::env::var("SHORTSMITH_LLM_API_KEY")
            .or_else(|_| std::env::var("GROQ_API_KEY"))
        {
            config.llm.api_key = key;
        }
    }
    config.validate().context("invalid configuration")?;

    let script_text = tokio::fs::read_to_string(&args.script)
        .await
        .with_context(|| format!("failed to read script {}", args.script.display()))?;
    let script: VideoScript =
        serde_json::from_str(&script_text).context("failed to parse script JSON")?;

    tracing::info!(
        title = %script.title,
        scenes = script.scenes.len(),
        narration_chars = script.narration.len(),
        "starting video generation"
    );

    // The binary drives the remote backend; the in-process path is a library
    // seam for callers that bring their own model pipeline.
    let remote_config = config
        .remote
        .clone()
        .context("config.remote is required: no remote inference service configured")?;
    let remote = RemoteBackend::new(
        &remote_config,
        Duration::from_secs(config.generation.probe_timeout_s),
    )?;
    let backends: Vec<Box<dyn ImageBackend>> = vec![Box::new(remote)];

    let device = shortsmith::preferred_device(args.device);
    tracing::info!(?device, "resource accounting device");
    let resources = Arc::new(Mutex::new(ResourceManager::new(device, &config.generation)));
    let router = BackendRouter::new(backends, resources, &config.generation)?;

    // Without an API key the run still works — enhancement and evaluation
    // fall back to their deterministic stand-ins.
    let (enhancer, evaluator): (Arc<dyn PromptEnhancer>, Arc<dyn QualityEvaluator>) =
        if config.llm.api_key.is_empty() {
            tracing::warn!("no LLM API key — prompt enhancement and quality gate disabled");
            (
                Arc::new(StaticEnhancer),
                Arc::new(LlmQualityEvaluator::disabled(&config.quality)),
            )
        } else {
            let chat = ChatClient::new(&config.llm)?;
            (
                Arc::new(LlmPromptEnhancer::new(chat.clone())),
                Arc::new(LlmQualityEvaluator::new(chat, &config.quality)),
            )
        };

    let voice = Arc::new(PiperSynthesizer::new(&config.voice)?);

    let mut pipeline = VideoPipeline::new(config, router, enhancer, evaluator, voice)?;
    let report = pipeline.run(&script, &args.output).await?;

    for outcome in &report.scenes {
        tracing::info!(
            scene = outcome.scene,
            backend = outcome.backend,
            score = outcome.score,
            attempts = outcome.attempts,
            "scene accepted"
        );
    }
    tracing::info!(
        output = %report.output.display(),
        duration_s = report.audio_duration_s,
        "video generation completed"
    );
    println!("{}", report.output.display());
    Ok(())
}
