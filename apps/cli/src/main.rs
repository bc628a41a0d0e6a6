//! mdbatch CLI - Command-line client for market data batch jobs
//!
//! Submits and lists batch jobs, and downloads their files with resume,
//! retries and checksum validation.

mod commands;
mod output;
mod progress;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use mdbatch_core::MdBatch;
use mdbatch_types::{Compression, Delivery, Encoding, JobState, Packaging, Settings, SplitDuration};
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// mdbatch - Market data batch job client
#[derive(Parser)]
#[command(name = "mdbatch")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// API key for the historical gateway
    #[arg(long, env = "MDBATCH_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Settings file (JSON)
    #[arg(long, env = "MDBATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Override the historical gateway URL
    #[arg(long)]
    gateway: Option<String>,

    /// Number of concurrent file transfers
    #[arg(long)]
    workers: Option<usize>,

    /// Output format
    #[arg(long, default_value = "human")]
    output: OutputFormat,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum OutputFormat {
    Human,
    Json,
    Table,
}

#[derive(Subcommand)]
enum Commands {
    /// Download the files of a batch job
    Download {
        /// Batch job ID
        job_id: String,

        /// Directory the `<job_id>/` folder is created in
        #[arg(short = 'o', long)]
        output_dir: Option<PathBuf>,

        /// Only download these files (repeatable)
        #[arg(short = 'f', long = "file")]
        files: Vec<String>,
    },

    /// List the files of a batch job
    Files {
        /// Batch job ID
        job_id: String,
    },

    /// List batch jobs
    Jobs {
        /// Only jobs in these states (comma separated)
        #[arg(long, value_delimiter = ',', default_value = "received,queued,processing,done")]
        states: Vec<JobState>,

        /// Only jobs received at or after this time (RFC 3339)
        #[arg(long)]
        since: Option<DateTime<Utc>>,
    },

    /// Submit a new batch job
    Submit(SubmitArgs),

    /// Show settings
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

#[derive(clap::Args)]
struct SubmitArgs {
    /// Dataset code, e.g. GLBX.MDP3
    #[arg(long)]
    dataset: String,

    /// Symbols (comma separated)
    #[arg(long, value_delimiter = ',', required = true)]
    symbols: Vec<String>,

    /// Data record schema, e.g. trades
    #[arg(long)]
    schema: String,

    /// Inclusive start of the request range
    #[arg(long)]
    start: String,

    /// Exclusive end of the request range
    #[arg(long)]
    end: Option<String>,

    #[arg(long, default_value = "dbn")]
    encoding: Encoding,

    #[arg(long, default_value = "zstd")]
    compression: Compression,

    #[arg(long, default_value = "day")]
    split_duration: SplitDuration,

    /// Maximum size in bytes of each file
    #[arg(long)]
    split_size: Option<u64>,

    /// Split files by raw symbol
    #[arg(long)]
    split_symbols: bool,

    #[arg(long)]
    packaging: Option<Packaging>,

    #[arg(long, default_value = "download")]
    delivery: Delivery,

    #[arg(long, default_value = "raw_symbol")]
    stype_in: String,

    #[arg(long, default_value = "instrument_id")]
    stype_out: String,

    /// Maximum number of records
    #[arg(long)]
    limit: Option<u64>,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show all settings
    Show,

    /// Print the settings file location
    Path,
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .init();
}

impl Cli {
    /// Settings from the file, then command-line overrides
    fn settings(&self) -> Result<Settings> {
        let mut settings = commands::load_settings(self.config.as_deref())?;
        if let Some(gateway) = &self.gateway {
            settings.gateway = gateway.clone();
        }
        if let Some(workers) = self.workers {
            settings.max_workers = workers;
        }
        debug!(
            "Using gateway {} with {} workers",
            settings.gateway, settings.max_workers
        );
        Ok(settings)
    }

    fn connect(&self) -> Result<MdBatch> {
        let api_key = self
            .api_key
            .clone()
            .ok_or_else(|| anyhow!("No API key given; pass --api-key or set MDBATCH_API_KEY"))?;
        Ok(MdBatch::new(api_key, self.settings()?)?)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match &cli.command {
        Commands::Download {
            job_id,
            output_dir,
            files,
        } => {
            let mdbatch = cli.connect()?;
            commands::download(&mdbatch, job_id, output_dir.clone(), files.clone(), cli.output)
                .await?
        }

        Commands::Files { job_id } => {
            commands::list_files(&cli.connect()?, job_id, cli.output).await?
        }

        Commands::Jobs { states, since } => {
            commands::list_jobs(&cli.connect()?, states, *since, cli.output).await?
        }

        Commands::Submit(args) => commands::submit_job(&cli.connect()?, args, cli.output).await?,

        Commands::Config { action } => commands::config_action(&cli, action.as_ref(), cli.output)?,

        Commands::Completions { shell } => {
            use clap::CommandFactory;
            clap_complete::generate(*shell, &mut Cli::command(), "mdbatch", &mut std::io::stdout());
        }
    }

    Ok(())
}
