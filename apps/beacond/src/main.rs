use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use beacon_client::{
    EventCategory, HeartbeatProducer, PipelineBuilder, PipelineConfig, RawEvent,
};
use clap::Parser;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "beacond")]
#[command(about = "beacon telemetry pipeline demo daemon")]
struct Cli {
    /// JSON pipeline config (camelCase keys, all optional).
    #[arg(long)]
    config: Option<PathBuf>,
    /// Overrides the config file's endpoint.
    #[arg(long)]
    endpoint: Option<String>,
    #[arg(long, default_value = ".beacon")]
    root: PathBuf,
    #[arg(long, default_value = "info")]
    log: String,
    /// Bearer token sent with every batch.
    #[arg(long)]
    token: Option<String>,
    #[arg(long)]
    user: Option<String>,
    /// Seconds between heartbeat events; 0 disables the heartbeat.
    #[arg(long, default_value_t = 10)]
    heartbeat_secs: u64,
    /// Demo page views to emit at startup.
    #[arg(long, default_value_t = 5)]
    events: u32,
    /// Stop after this many seconds; runs until ctrl-c when omitted.
    #[arg(long)]
    run_secs: Option<u64>,
}

async fn load_config(cli: &Cli) -> Result<PipelineConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let raw = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("failed to read config {}", path.display()))?;
            PipelineConfig::from_json(&raw)
                .with_context(|| format!("failed to load config {}", path.display()))?
        }
        None => PipelineConfig::default(),
    };
    if let Some(endpoint) = &cli.endpoint {
        config.endpoint = endpoint.clone();
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(cli.log.as_str())
        .compact()
        .init();

    let config = load_config(&cli).await?;
    info!(endpoint = %config.endpoint, root = %cli.root.display(), "starting beacond");

    let mut builder = PipelineBuilder::new(&cli.root).config(config);
    if cli.heartbeat_secs > 0 {
        builder = builder.producer(Arc::new(HeartbeatProducer::new(Duration::from_secs(
            cli.heartbeat_secs,
        ))));
    }
    let client = builder.build()?;
    client.set_auth_token(cli.token.clone());
    client.set_user(cli.user.clone());
    client.start().await?;

    client
        .log_event(
            RawEvent::new("APP_START")
                .with_category(EventCategory::System)
                .with_action("start")
                .with_field("pid", std::process::id()),
        )
        .await;
    for index in 0..cli.events {
        let kept = client
            .log_event(
                RawEvent::new("PAGE_VIEW")
                    .with_category(EventCategory::Interaction)
                    .with_action("view")
                    .with_field("page_url", format!("/demo/{index}")),
            )
            .await;
        if !kept {
            info!(index, "page view sampled out");
        }
    }

    match cli.run_secs {
        Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
        None => {
            if let Err(error) = tokio::signal::ctrl_c().await {
                warn!(%error, "failed to listen for ctrl-c");
            }
        }
    }

    let outcome = client.shutdown().await;
    let stats = serde_json::to_string(&client.stats()).unwrap_or_else(|_| "{}".to_owned());
    info!(?outcome, stats = %stats, "beacond stopped");
    Ok(())
}
