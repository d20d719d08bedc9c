use anyhow::Context;
use clap::{Parser, Subcommand};
use diststats::upstream::{DashboardFetcher, MembershipAnalytics};
use diststats::web::{AppState, router};
use diststats::AppConfig;
use log::info;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "diststats")]
#[command(about = "District performance snapshot store and backfill service", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the admin HTTP server (default)
    Serve {
        /// Listen address, overrides DISTSTATS_BIND
        #[arg(long)]
        bind: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let mut config = AppConfig::from_env().context("loading configuration")?;
    if let Some(Commands::Serve { bind: Some(bind) }) = &cli.command {
        config.bind = bind.clone();
    }

    let storage = config.build_storage().context("building storage backend")?;
    let fetcher = Arc::new(
        DashboardFetcher::new(&config.dashboard_url).context("building dashboard fetcher")?,
    );
    let state = AppState::build(
        storage,
        fetcher,
        Arc::new(MembershipAnalytics),
        config.rate_limit,
    )
    .await
    .context("assembling service stack")?;

    let recovered = state
        .service
        .recover_on_startup()
        .await
        .context("recovering orphaned jobs")?;
    if !recovered.is_empty() {
        info!("recovered {} orphaned job(s): {:?}", recovered.len(), recovered);
    }

    let app = router(state);
    let listener = tokio::net::TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("binding {}", config.bind))?;
    info!("admin API listening on {}", config.bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;
    Ok(())
}
