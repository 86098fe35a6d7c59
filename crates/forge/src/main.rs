//! Forge - LoRA training job orchestration service.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use forge::server::{run_server, ServerState};
use forge::{
    ArtifactStore, Config, FileStore, FsArtifactStore, JobStore, MemoryStore, Orchestrator,
    Reconciler,
};
use forge_gpu::runpod::RunPod;
use forge_gpu::{GpuProvider, RetryingProvider};
use forge_payments::{PaymentGateway, StripeGateway, WebhookVerifier};

/// Forge - Train LoRA models on rented GPUs.
#[derive(Parser)]
#[command(name = "forge")]
#[command(about = "LoRA training job orchestration service")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long, global = true, env = "FORGE_JSON_LOGS")]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the HTTP API and run the reconciliation loop
    Serve,

    /// Run reconciliation without the HTTP API
    Reconcile {
        /// Run a single pass and print the report
        #[arg(long)]
        once: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("forge=debug,forge_gpu=debug,forge_payments=debug,info")
        } else {
            EnvFilter::new("info")
        }
    });
    tracing_subscriber::registry()
        .with(filter)
        .with(cli.json_logs.then(|| fmt::layer().json()))
        .with((!cli.json_logs).then(fmt::layer))
        .init();

    let config = Arc::new(Config::from_env().context("invalid configuration")?);
    let orchestrator = Arc::new(build_orchestrator(Arc::clone(&config)).await?);
    let reconciler = Reconciler::new(Arc::clone(&orchestrator));

    match cli.command {
        Commands::Serve => {
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let reconcile_rx = shutdown_rx.clone();
            let reconcile_task = tokio::spawn(async move { reconciler.run(reconcile_rx).await });

            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                info!("Shutdown requested");
                let _ = shutdown_tx.send(true);
            });

            let state = Arc::new(ServerState {
                orchestrator,
                config: Arc::clone(&config),
            });
            run_server(state, config.bind_addr, shutdown_rx).await?;
            reconcile_task.await.context("reconciler task panicked")?;
        }
        Commands::Reconcile { once: true } => {
            let report = reconciler.run_once(Utc::now()).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Reconcile { once: false } => {
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                let _ = shutdown_tx.send(true);
            });
            reconciler.run(shutdown_rx).await;
        }
    }

    Ok(())
}

async fn build_orchestrator(config: Arc<Config>) -> Result<Orchestrator> {
    let store: Arc<dyn JobStore> = match &config.state_path {
        Some(path) => Arc::new(
            FileStore::open(path)
                .await
                .with_context(|| format!("failed to open job store at {}", path.display()))?,
        ),
        None => {
            info!("FORGE_STATE_PATH not set, job state is kept in memory");
            Arc::new(MemoryStore::new())
        }
    };

    let runpod = &config.runpod;
    let mut client = RunPod::with_options(
        runpod.api_key.clone(),
        runpod.template_id.clone(),
        runpod
            .api_url
            .clone()
            .unwrap_or_else(|| forge_gpu::runpod::API_URL.to_string()),
        runpod.timeout_secs,
    )
    .context("failed to create GPU provider client")?;
    if runpod.community_cloud {
        client = client.community_cloud();
    }
    let provider: Arc<dyn GpuProvider> =
        Arc::new(RetryingProvider::new(client, config.retry.clone()));

    let stripe = &config.stripe;
    let verifier =
        WebhookVerifier::new(stripe.webhook_secret.clone()).with_tolerance(stripe.tolerance_secs);
    let gateway = match &stripe.api_url {
        Some(url) => StripeGateway::with_base_url(stripe.secret_key.clone(), verifier, url.clone()),
        None => StripeGateway::new(stripe.secret_key.clone(), verifier),
    }
    .context("failed to create payment gateway client")?;
    let gateway: Arc<dyn PaymentGateway> = Arc::new(gateway);

    let artifacts: Arc<dyn ArtifactStore> =
        Arc::new(FsArtifactStore::new(config.artifact_root.clone()));

    Ok(Orchestrator::new(store, provider, gateway, artifacts, config))
}
