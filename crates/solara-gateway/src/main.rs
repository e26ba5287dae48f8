use clap::Parser;
use solara_core::SolaraConfig;
use solara_identity::{IdentityStore, MemoryIdentityStore, SqliteIdentityStore};
use solara_pipeline::{Pipeline, PipelineConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

mod app;
mod http;
mod outbound;

/// How long shutdown waits for in-flight batches after the final flush.
const DRAIN_GRACE: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "solara-gateway")]
#[command(about = "Webhook ingress and reply pipeline for Solara", long_about = None)]
struct Cli {
    /// Config file (defaults to $SOLARA_CONFIG, then ~/.solara/solara.toml)
    #[arg(long, short, value_name = "PATH")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "solara_gateway=info,solara_pipeline=info,solara_buffer=info,solara_identity=info,tower_http=debug".into()
            }),
        )
        .init();

    let cli = Cli::parse();

    // config: --config > SOLARA_CONFIG env > ~/.solara/solara.toml
    let config_path = cli
        .config
        .map(|p| p.to_string_lossy().into_owned())
        .or_else(|| std::env::var("SOLARA_CONFIG").ok());
    let config = SolaraConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        SolaraConfig::default()
    });

    let store: Arc<dyn IdentityStore> = match config.database.path {
        Some(ref path) => {
            info!(path = %path, "opening identity database");
            Arc::new(SqliteIdentityStore::open(path)?)
        }
        None => {
            warn!("database.path not set, identities are kept in memory only");
            Arc::new(MemoryIdentityStore::new())
        }
    };

    let client = reqwest::Client::new();
    let dispatcher = outbound::build_dispatcher(&config, &client);
    let sink = outbound::build_sink(&config, &client);

    let pipeline = Pipeline::new(PipelineConfig::from(&config), store, dispatcher, sink);
    info!(
        buffering = config.buffer.enabled,
        timeout_ms = config.buffer.timeout_ms,
        max_messages = config.buffer.max_messages,
        "pipeline ready"
    );

    let addr: SocketAddr = format!("{}:{}", config.gateway.bind, config.gateway.port).parse()?;
    let state = Arc::new(app::AppState::new(config, pipeline.clone()));
    let router = app::build_router(state);

    info!("Solara gateway listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let flushed = pipeline.shutdown(DRAIN_GRACE).await;
    info!(flushed, "Solara gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received, draining buffers");
}
