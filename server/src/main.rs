use anyhow::{Context, Result};
use axum::Router;
use clap::Parser;
use serde_json::Value;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing_subscriber::{fmt, EnvFilter};
use triage_core::RetrievalConfig;
use triage_server::llm::{LlmConfig, DEFAULT_API_BASE, DEFAULT_MODEL};
use triage_server::{build_app, ServerConfig};

#[derive(Parser)]
struct Args {
    /// Directory holding the ticket, knowledge-base and record files
    #[arg(long, default_value = "./data")]
    data_dir: PathBuf,
    /// JSON file overriding retrieval settings (paths, row cap, index options)
    #[arg(long)]
    retrieval_config: Option<PathBuf>,
    /// Host to bind
    #[arg(long, default_value = "0.0.0.0")]
    host: String,
    /// Port to bind
    #[arg(long, default_value_t = 5000)]
    port: u16,
    /// Chat model used for classification
    #[arg(long, default_value = DEFAULT_MODEL)]
    model: String,
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    api_key: Option<String>,
    #[arg(long, env = "OPENAI_API_BASE", default_value = DEFAULT_API_BASE)]
    api_base: String,
    /// Seconds before a model call is abandoned
    #[arg(long, default_value_t = 30)]
    llm_timeout_secs: u64,
    #[arg(long, env = "ADMIN_TOKEN", hide_env_values = true)]
    admin_token: Option<String>,
    #[arg(long, env = "CORS_ALLOW_ORIGIN")]
    cors_allow_origin: Option<String>,
}

/// Defaults derived from `--data-dir`, with `--retrieval-config` merged on top.
fn retrieval_config(args: &Args) -> Result<RetrievalConfig> {
    let defaults = RetrievalConfig::from_data_dir(&args.data_dir);
    let Some(path) = &args.retrieval_config else { return Ok(defaults) };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let overrides: Value = serde_json::from_str(&raw)
        .with_context(|| format!("parsing {}", path.display()))?;
    let config = defaults
        .with_overrides(overrides)
        .with_context(|| format!("applying {}", path.display()))?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();
    let args = Args::parse();

    let mut config = ServerConfig::new(&args.data_dir);
    config.retrieval = retrieval_config(&args)?;
    config.llm = args.api_key.clone().map(|key| LlmConfig {
        api_base: args.api_base.clone(),
        model: args.model.clone(),
        timeout: Duration::from_secs(args.llm_timeout_secs),
        ..LlmConfig::new(key)
    });
    config.admin_token = args.admin_token.clone();
    config.cors_allow_origin = args.cors_allow_origin.clone();
    let app: Router = build_app(config)?;

    let addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "server listening");
    axum::serve(listener, app).await?;
    Ok(())
}
