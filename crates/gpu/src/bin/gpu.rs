//! GPU CLI - operator tool for training pods.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use forge_gpu::runpod::{RunPod, API_URL};
use forge_gpu::{GpuProvider, PodHandle, PodSpec, PodStatus, RetryPolicy, RetryingProvider};

/// GPU CLI - Inspect and manage training pods.
#[derive(Parser)]
#[command(name = "gpu")]
#[command(about = "Allocate, inspect and terminate GPU training pods")]
struct Cli {
    /// RunPod API key (or set `RUNPOD_API_KEY` env var).
    #[arg(long, env = "RUNPOD_API_KEY", hide_env_values = true)]
    api_key: String,

    /// Pod template containing the training image.
    #[arg(long, env = "RUNPOD_TEMPLATE_ID")]
    template_id: String,

    /// GraphQL endpoint.
    #[arg(long, env = "RUNPOD_API_URL", default_value = API_URL)]
    api_url: String,

    /// Per-call timeout in seconds.
    #[arg(long, env = "RUNPOD_TIMEOUT_SECS", default_value = "60")]
    timeout: u64,

    /// Attempts for transient failures (1 disables retries).
    #[arg(long, default_value = "5")]
    attempts: u32,

    /// Enable verbose logging.
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Allocate a pod, trying GPU types in order.
    Allocate {
        /// Pod name.
        #[arg(long)]
        name: String,

        /// GPU types, most preferred first (comma-separated).
        #[arg(long, value_delimiter = ',', default_value = "NVIDIA_L4,NVIDIA_A10G,NVIDIA_A100")]
        gpu: Vec<String>,

        /// Environment variables as KEY=VALUE (repeatable).
        #[arg(long, short = 'e')]
        env: Vec<String>,
    },

    /// Show the status of a pod.
    Status {
        /// Pod ID.
        #[arg(long)]
        id: String,
    },

    /// Terminate a pod.
    Terminate {
        /// Pod ID.
        #[arg(long)]
        id: String,

        /// Skip confirmation prompt.
        #[arg(long, short = 'y', default_value = "false")]
        yes: bool,
    },

    /// Find a live pod by name.
    Find {
        /// Pod name (training pods are named `forge-<job id>`).
        #[arg(long)]
        name: String,
    },

    /// Download a file from a pod.
    Download {
        /// Pod ID.
        #[arg(long)]
        id: String,

        /// Path on the pod.
        #[arg(long, default_value = "/workspace/output/lora.safetensors")]
        path: String,

        /// Local destination.
        #[arg(long, short = 'o')]
        out: std::path::PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let runpod = RunPod::with_options(&cli.api_key, &cli.template_id, &cli.api_url, cli.timeout)
        .context("Failed to create RunPod provider")?;
    let policy = RetryPolicy {
        max_attempts: cli.attempts.max(1),
        ..RetryPolicy::default()
    };
    let provider = RetryingProvider::new(runpod, policy);

    match cli.command {
        Commands::Allocate { name, gpu, env } => {
            let spec = parse_env(env)?
                .into_iter()
                .fold(PodSpec::new(&name), |spec, (k, v)| spec.with_env(k, v));

            let mut last_error = None;
            for gpu_type in &gpu {
                info!(name = %name, gpu_type = %gpu_type, "Allocating pod");
                match provider.allocate(gpu_type, &spec).await {
                    Ok(pod) => {
                        println!("\n✅ Pod allocated");
                        println!("   ID:   {}", pod.id);
                        println!("   GPU:  {}", pod.gpu_type);
                        println!("\n💡 Run `gpu status --id {}` to follow it", pod.id);
                        return Ok(());
                    }
                    Err(e) => {
                        println!("🔴 {gpu_type}: {e}");
                        last_error = Some(e);
                    }
                }
            }

            match last_error {
                Some(e) => return Err(e).context("All GPU types failed"),
                None => anyhow::bail!("No GPU types given"),
            }
        }

        Commands::Status { id } => {
            let status = provider.poll_status(&PodHandle::new(&id, "")).await?;
            let emoji = match status {
                PodStatus::Running => "🟢",
                PodStatus::Starting => "🟡",
                PodStatus::Completed => "✅",
                PodStatus::Errored => "🔴",
                PodStatus::Unknown => "⚪",
            };
            println!("\n{emoji} Pod {id}: {status}");
        }

        Commands::Terminate { id, yes } => {
            if !yes {
                println!("⚠️  Are you sure you want to terminate pod {}?", id);
                println!("   Any training in progress will be lost.");
                println!("   Use --yes to skip this prompt.");
                return Ok(());
            }

            info!(pod_id = %id, "Terminating pod");
            provider.terminate(&PodHandle::new(&id, "")).await?;
            println!("\n✅ Pod {} terminated", id);
        }

        Commands::Find { name } => match provider.find_by_name(&name).await? {
            Some(pod) => println!("\n🟢 {name}: {pod}"),
            None => println!("\n⚪ No live pod named {name}"),
        },

        Commands::Download { id, path, out } => {
            let bytes = provider
                .download_file(&PodHandle::new(&id, ""), &path)
                .await?;
            tokio::fs::write(&out, &bytes)
                .await
                .with_context(|| format!("Failed to write {}", out.display()))?;
            println!("\n✅ {} bytes written to {}", bytes.len(), out.display());
        }
    }

    Ok(())
}

fn parse_env(pairs: Vec<String>) -> Result<Vec<(String, String)>> {
    pairs
        .into_iter()
        .map(|pair| {
            let (key, value) = pair
                .split_once('=')
                .with_context(|| format!("Expected KEY=VALUE, got `{pair}`"))?;
            Ok((key.to_string(), value.to_string()))
        })
        .collect()
}
