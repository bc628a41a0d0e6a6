//! CLI command implementations

use crate::output::{format_bytes, format_time, print_json, truncate};
use crate::progress::BatchProgress;
use crate::{Cli, ConfigAction, OutputFormat, SubmitArgs};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use console::style;
use mdbatch_core::{DownloadRequest, MdBatch};
use mdbatch_types::{BatchJob, JobState, Settings, SubmitJobRequest, TransferWarning};
use std::path::{Path, PathBuf};

// ============================================================================
// Settings
// ============================================================================

/// Load settings from `path`, or from the default location if it exists
pub fn load_settings(path: Option<&Path>) -> Result<Settings> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => match Settings::default_path().filter(|p| p.exists()) {
            Some(path) => path,
            None => return Ok(Settings::default()),
        },
    };

    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read settings from {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("Invalid settings file {}", path.display()))
}

// ============================================================================
// Download Commands
// ============================================================================

pub async fn download(
    mdbatch: &MdBatch,
    job_id: &str,
    output_dir: Option<PathBuf>,
    files: Vec<String>,
    format: OutputFormat,
) -> Result<()> {
    let mut request = DownloadRequest::new(job_id);
    if let Some(dir) = output_dir {
        request = request.with_output_dir(dir);
    }
    if !files.is_empty() {
        request = request.with_files(files);
    }

    let progress = match format {
        OutputFormat::Json => None,
        OutputFormat::Human | OutputFormat::Table => Some(BatchProgress::new()),
    };
    let renderer = progress
        .clone()
        .map(|p| tokio::spawn(p.run(mdbatch.subscribe())));

    let result = mdbatch.download_async(request).await;

    if let Some(handle) = renderer {
        handle.abort();
    }
    if let Some(progress) = &progress {
        progress.clear().await;
    }
    let report = result?;

    match format {
        OutputFormat::Json => print_json(&report)?,
        OutputFormat::Table => {
            use tabled::{Table, Tabled};

            #[derive(Tabled)]
            struct FileRow {
                file: String,
                size: String,
                warnings: usize,
            }

            let rows: Vec<FileRow> = report
                .files
                .iter()
                .map(|path| {
                    let name = file_name(path);
                    FileRow {
                        size: std::fs::metadata(path)
                            .map(|m| format_bytes(m.len()))
                            .unwrap_or_else(|_| "?".to_string()),
                        warnings: report.warnings_for(&name).count(),
                        file: name,
                    }
                })
                .collect();

            println!("{}", Table::new(rows));
            print_warnings(&report.warnings);
        }
        OutputFormat::Human => {
            for path in &report.files {
                println!("{} {}", style("✓").green().bold(), path.display());
            }
            print_warnings(&report.warnings);
            println!();
            println!(
                "{} file(s) downloaded for job {}",
                style(report.files.len()).bold(),
                style(&report.job_id).cyan()
            );
        }
    }

    Ok(())
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn print_warnings(warnings: &[TransferWarning]) {
    for warning in warnings {
        // Retries already showed up in the log while they happened
        if matches!(warning, TransferWarning::RetryScheduled { .. }) {
            continue;
        }
        eprintln!("{} {}", style("!").yellow().bold(), style(warning).yellow());
    }
}

pub async fn list_files(mdbatch: &MdBatch, job_id: &str, format: OutputFormat) -> Result<()> {
    let manifest = mdbatch.list_files(job_id).await?;

    match format {
        OutputFormat::Json => print_json(&manifest.targets())?,
        OutputFormat::Table => {
            use tabled::{Table, Tabled};

            #[derive(Tabled)]
            struct TargetRow {
                filename: String,
                size: String,
                hash: String,
            }

            let rows: Vec<TargetRow> = manifest
                .targets()
                .iter()
                .map(|t| TargetRow {
                    filename: t.filename().to_string(),
                    size: format_bytes(t.expected_size()),
                    hash: truncate(t.content_hash(), 24),
                })
                .collect();

            println!("{}", Table::new(rows));
        }
        OutputFormat::Human => {
            for target in manifest.targets() {
                println!(
                    "{} {}",
                    style(target.filename()).bold(),
                    style(format_bytes(target.expected_size())).dim()
                );
            }
            println!();
            println!(
                "{} file(s), {} total",
                style(manifest.targets().len()).bold(),
                format_bytes(manifest.total_size())
            );
        }
    }

    Ok(())
}

// ============================================================================
// Job Commands
// ============================================================================

pub async fn list_jobs(
    mdbatch: &MdBatch,
    states: &[JobState],
    since: Option<DateTime<Utc>>,
    format: OutputFormat,
) -> Result<()> {
    let jobs = mdbatch.list_jobs(states, since).await?;

    match format {
        OutputFormat::Json => print_json(&jobs)?,
        OutputFormat::Table => {
            use tabled::{Table, Tabled};

            #[derive(Tabled)]
            struct JobRow {
                id: String,
                state: String,
                dataset: String,
                schema: String,
                size: String,
                received: String,
            }

            let rows: Vec<JobRow> = jobs
                .iter()
                .map(|j| JobRow {
                    id: j.id.clone(),
                    state: j.state.as_str().to_string(),
                    dataset: j.dataset.clone().unwrap_or_default(),
                    schema: j.schema.clone().unwrap_or_default(),
                    size: j.billed_size.map(format_bytes).unwrap_or_else(|| "?".to_string()),
                    received: format_time(j.ts_received),
                })
                .collect();

            println!("{}", Table::new(rows));
        }
        OutputFormat::Human => {
            if jobs.is_empty() {
                println!("{}", style("No batch jobs found").dim());
                return Ok(());
            }
            for job in &jobs {
                print_job_summary(job);
            }
            println!();
            println!("{} job(s) total", style(jobs.len()).bold());
        }
    }

    Ok(())
}

fn print_job_summary(job: &BatchJob) {
    let state_icon = match job.state {
        JobState::Done => style("✓").green(),
        JobState::Processing => style("↻").cyan(),
        JobState::Received | JobState::Queued => style("·").yellow(),
        JobState::Expired => style("○").dim(),
        JobState::Unknown => style("?").dim(),
    };

    println!(
        "{} {} [{}] {}",
        state_icon,
        style(&job.id).bold(),
        style(job.state.as_str()).dim(),
        style(format_time(job.ts_received)).dim()
    );
}

pub async fn submit_job(mdbatch: &MdBatch, args: &SubmitArgs, format: OutputFormat) -> Result<()> {
    let mut request = SubmitJobRequest::new(
        args.dataset.clone(),
        args.symbols.clone(),
        args.schema.clone(),
        args.start.clone(),
    );
    request.end = args.end.clone();
    request.encoding = args.encoding;
    request.compression = args.compression;
    request.split_duration = args.split_duration;
    request.split_size = args.split_size;
    request.split_symbols = args.split_symbols;
    request.packaging = args.packaging;
    request.delivery = args.delivery;
    request.stype_in = args.stype_in.clone();
    request.stype_out = args.stype_out.clone();
    request.limit = args.limit;

    let job = mdbatch.submit_job(&request).await?;

    match format {
        OutputFormat::Json => print_json(&job)?,
        OutputFormat::Human | OutputFormat::Table => {
            println!(
                "{} Submitted batch job: {}",
                style("✓").green().bold(),
                style(&job.id).cyan()
            );
            println!("  State: {}", job.state.as_str());
            if let Some(cost) = job.cost_usd {
                println!("  Cost: ${:.2}", cost);
            }
        }
    }

    Ok(())
}

// ============================================================================
// Config Commands
// ============================================================================

pub fn config_action(cli: &Cli, action: Option<&ConfigAction>, format: OutputFormat) -> Result<()> {
    match action {
        None | Some(ConfigAction::Show) => {
            let settings = cli.settings()?;
            match format {
                OutputFormat::Json => print_json(&settings)?,
                _ => {
                    println!("mdbatch configuration:");
                    println!("  gateway: {}", settings.gateway);
                    println!("  output_dir: {}", settings.output_dir().display());
                    println!("  max_workers: {}", settings.max_workers);
                    println!("  max_retries: {}", settings.max_retries);
                    println!("  default_retry_after_secs: {}", settings.default_retry_after_secs);
                    println!("  connect_timeout_secs: {}", settings.connect_timeout_secs);
                    println!("  user_agent: {}", settings.user_agent);
                    println!(
                        "  api_key: {}",
                        if cli.api_key.is_some() { "set" } else { "not set" }
                    );
                }
            }
        }
        Some(ConfigAction::Path) => {
            let path = cli
                .config
                .clone()
                .or_else(Settings::default_path)
                .ok_or_else(|| anyhow!("No configuration directory on this platform"))?;
            println!("{}", path.display());
        }
    }

    Ok(())
}
