//! gpufleet CLI
//!
//! Command-line interface for interacting with the gpufleet daemon.

mod commands;

use clap::{Parser, Subcommand};
use gpufleet_core::GpuSpec;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;
use uuid::Uuid;

/// gpufleet - multi-tenant GPU job scheduler
#[derive(Parser, Debug)]
#[command(name = "gpufleet")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Daemon API address
    #[arg(long, default_value = "http://localhost:9090", global = true)]
    api: String,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Register an organization
    Org {
        /// Organization ID
        id: String,

        /// Display name (defaults to the ID)
        #[arg(long)]
        name: Option<String>,
    },

    /// Submit a job
    Submit {
        /// Organization ID
        organization: String,

        /// Model name (e.g., phi-2)
        model: String,

        /// Priority, higher runs first
        #[arg(long)]
        priority: Option<i32>,

        /// Batch size
        #[arg(long)]
        batch_size: Option<u32>,

        /// Input prompt
        #[arg(long)]
        prompt: Option<String>,

        /// Highest hourly spot price this job may trigger
        #[arg(long)]
        max_price: Option<f64>,

        /// Model family override
        #[arg(long)]
        model_type: Option<String>,
    },

    /// List jobs
    Jobs {
        /// Only jobs of this organization
        #[arg(long)]
        org: Option<String>,

        /// Only jobs in this status (queued, running, completed, failed, cancelled)
        #[arg(long)]
        status: Option<String>,
    },

    /// Show a job
    Job {
        /// Job ID
        id: Uuid,
    },

    /// Cancel a queued or running job
    Cancel {
        /// Job ID
        id: Uuid,
    },

    /// Report a running job as finished
    Complete {
        /// Job ID
        id: Uuid,

        /// Mark the job failed with this error
        #[arg(long)]
        error: Option<String>,
    },

    /// List GPUs
    Gpus {
        /// Only GPUs of this organization
        #[arg(long)]
        org: Option<String>,

        /// Only GPUs in this status (available, in_use, provisioning, terminating, offline)
        #[arg(long)]
        status: Option<String>,
    },

    /// Register a dedicated GPU
    RegisterGpu {
        /// Organization ID
        organization: String,

        /// GPU name (e.g., A100)
        name: String,

        /// Total memory in MB
        #[arg(long)]
        memory: u64,

        /// Hourly cost
        #[arg(long, default_value_t = 0.0)]
        cost: f64,

        /// Capability as key=value; may be repeated
        #[arg(long = "capability")]
        capabilities: Vec<String>,

        /// Maximum concurrent jobs
        #[arg(long)]
        max_jobs: Option<u32>,
    },

    /// Show an organization's spend
    Cost {
        /// Organization ID
        organization: String,

        /// Window in hours back from now
        #[arg(long, default_value_t = 24)]
        hours: i64,
    },

    /// Show system status
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::WARN
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    let client = commands::ApiClient::new(&cli.api);

    match cli.command {
        Commands::Org { id, name } => {
            commands::org(&client, id, name).await?;
        }
        Commands::Submit {
            organization,
            model,
            priority,
            batch_size,
            prompt,
            max_price,
            model_type,
        } => {
            let opts = commands::SubmitOptions {
                priority,
                batch_size,
                prompt,
                max_price,
                model_type,
            };
            commands::submit(&client, organization, model, opts).await?;
        }
        Commands::Jobs { org, status } => {
            commands::jobs(&client, org, status).await?;
        }
        Commands::Job { id } => {
            commands::job(&client, id).await?;
        }
        Commands::Cancel { id } => {
            commands::cancel(&client, id).await?;
        }
        Commands::Complete { id, error } => {
            commands::complete(&client, id, error).await?;
        }
        Commands::Gpus { org, status } => {
            commands::gpus(&client, org, status).await?;
        }
        Commands::RegisterGpu {
            organization,
            name,
            memory,
            cost,
            capabilities,
            max_jobs,
        } => {
            let spec = GpuSpec {
                organization_id: organization,
                name,
                total_memory: memory,
                capabilities: commands::parse_capabilities(&capabilities)?,
                cost_per_hour: cost,
                max_jobs,
            };
            commands::register_gpu(&client, spec).await?;
        }
        Commands::Cost {
            organization,
            hours,
        } => {
            commands::cost(&client, organization, hours).await?;
        }
        Commands::Status => {
            commands::status(&client).await?;
        }
    }

    Ok(())
}
