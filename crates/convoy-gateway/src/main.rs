use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};

use convoy_bus::StreamBus;
use convoy_kv::MemoryStore;
use convoy_pipeline::{
    AskTaskHandler, InstructionSet, Leaderboard, MemoryStorage, PipelineContext, RequestPipeline,
    StaticSecrets,
};
use convoy_skills::task_name;

mod adapter;
mod app;
mod http;
mod manifest;

#[derive(Parser, Debug)]
#[command(name = "convoy-gateway", about = "Convoy AI request gateway")]
struct Args {
    /// Path to convoy.toml (default: $CONVOY_CONFIG or ./convoy.toml).
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "convoy_gateway=info,convoy_pipeline=info,tower_http=debug".into()),
        )
        .init();

    let args = Args::parse();
    let mut config = convoy_core::config::ConvoyConfig::load(args.config.as_deref())
        .unwrap_or_else(|e| {
            warn!("config load failed ({e}), using defaults");
            convoy_core::config::ConvoyConfig::default()
        });

    // No manifest means no tools; try the internal API before giving the
    // model an empty tool list.
    if config.apps.is_empty() {
        if let Some(apps) = manifest::fetch_apps_manifest().await {
            config.apps = apps;
        } else {
            warn!("no app manifests configured or fetchable; skills unavailable");
        }
    }

    let bind = config.gateway.bind.clone();
    let port = config.gateway.port;

    let secrets = match std::env::var("CONVOY_MASTER_SECRET") {
        Ok(secret) => StaticSecrets::from_passphrase(&secret),
        Err(_) => {
            warn!("CONVOY_MASTER_SECRET not set, using an insecure development secret");
            StaticSecrets::from_passphrase("convoy-dev-secret")
        }
    };

    let leaderboard = match std::env::var("CONVOY_LEADERBOARD_FILE") {
        Ok(path) => match std::fs::read_to_string(&path) {
            Ok(raw) => match Leaderboard::from_json(&raw) {
                Ok(board) => {
                    info!(path, models = board.rankings.len(), "leaderboard loaded");
                    Some(board)
                }
                Err(e) => {
                    warn!(path, error = %e, "leaderboard file undecodable, auto-selection disabled");
                    None
                }
            },
            Err(e) => {
                warn!(path, error = %e, "leaderboard file unreadable, auto-selection disabled");
                None
            }
        },
        Err(_) => None,
    };

    let ctx = PipelineContext::new(
        Arc::new(config),
        Arc::new(InstructionSet::builtin()),
        Arc::new(MemoryStore::new()),
        Arc::new(StreamBus::new()),
        Arc::new(adapter::OpenAiCompatGateway::from_env()),
        Arc::new(MemoryStorage::new()),
        Arc::new(secrets),
        leaderboard,
    );

    // The pipeline itself handles ask tasks; everything else falls back to
    // the HTTP skill handler.
    let pipeline = Arc::new(RequestPipeline::new(Arc::clone(&ctx)));
    ctx.dispatcher.register_handler(
        &task_name("ai", "ask"),
        Arc::new(AskTaskHandler::new(Arc::clone(&pipeline))),
    );

    let state = Arc::new(app::AppState { ctx, pipeline });
    let router = app::build_router(Arc::clone(&state));

    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    info!("convoy gateway listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}
