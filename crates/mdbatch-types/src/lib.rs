//! Shared types for mdbatch
//!
//! This crate contains the data structures shared between the core
//! transfer engine and the CLI.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use url::Url;

// ============================================================================
// Transfer Types
// ============================================================================

/// One remote file named in a job manifest
///
/// Built once by the manifest resolver and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferTarget {
    filename: String,
    content_hash: String,
    download_url: Url,
    expected_size: u64,
}

impl TransferTarget {
    pub fn new(
        filename: impl Into<String>,
        content_hash: impl Into<String>,
        download_url: Url,
        expected_size: u64,
    ) -> Self {
        Self {
            filename: filename.into(),
            content_hash: content_hash.into(),
            download_url,
            expected_size,
        }
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Algorithm-tagged digest, e.g. `sha256:<hex>`
    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    pub fn download_url(&self) -> &Url {
        &self.download_url
    }

    pub fn expected_size(&self) -> u64 {
        self.expected_size
    }
}

/// Non-fatal notice raised while transferring a batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransferWarning {
    /// Local digest differs from the manifest; the file is kept
    ChecksumMismatch {
        filename: String,
        expected: String,
        actual: String,
    },
    /// The manifest hash uses an algorithm we cannot compute
    UnsupportedChecksum { filename: String, algorithm: String },
    /// The file could not be read back for hashing
    VerificationSkipped { filename: String, reason: String },
    /// A transient failure will be retried
    RetryScheduled {
        filename: String,
        attempt: u32,
        max_retries: u32,
        cause: String,
    },
}

impl TransferWarning {
    pub fn filename(&self) -> &str {
        match self {
            TransferWarning::ChecksumMismatch { filename, .. }
            | TransferWarning::UnsupportedChecksum { filename, .. }
            | TransferWarning::VerificationSkipped { filename, .. }
            | TransferWarning::RetryScheduled { filename, .. } => filename,
        }
    }
}

impl fmt::Display for TransferWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferWarning::ChecksumMismatch { filename, .. } => {
                write!(f, "Downloaded file failed checksum validation: {}", filename)
            }
            TransferWarning::UnsupportedChecksum { filename, algorithm } => write!(
                f,
                "Skipping {} checksum because {} is not supported",
                filename, algorithm
            ),
            TransferWarning::VerificationSkipped { filename, reason } => {
                write!(f, "Skipping {} checksum: {}", filename, reason)
            }
            TransferWarning::RetryScheduled {
                filename,
                attempt,
                max_retries,
                cause,
            } => write!(
                f,
                "Retrying download of {} ({}/{}) due to error: {}",
                filename, attempt, max_retries, cause
            ),
        }
    }
}

/// Result of a successful batch download
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadReport {
    pub job_id: String,
    /// Local paths in completion order
    pub files: Vec<PathBuf>,
    pub warnings: Vec<TransferWarning>,
}

impl DownloadReport {
    /// Warnings raised for a single file
    pub fn warnings_for<'a>(
        &'a self,
        filename: &'a str,
    ) -> impl Iterator<Item = &'a TransferWarning> + 'a {
        self.warnings.iter().filter(move |w| w.filename() == filename)
    }
}

// ============================================================================
// Event Types
// ============================================================================

/// Events emitted by the engine while a batch runs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum TransferEvent {
    FileStarted {
        filename: String,
        resume_from: u64,
        total: u64,
    },
    FileProgress {
        filename: String,
        downloaded: u64,
        total: u64,
    },
    RateLimited {
        filename: String,
        wait_secs: u64,
    },
    FileCompleted {
        filename: String,
        path: PathBuf,
    },
    Warning {
        warning: TransferWarning,
    },
}

// ============================================================================
// Job Types
// ============================================================================

/// Lifecycle state of a batch job on the service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Received,
    Queued,
    Processing,
    Done,
    Expired,
    /// A state this client does not know yet
    #[serde(other)]
    Unknown,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Received => "received",
            JobState::Queued => "queued",
            JobState::Processing => "processing",
            JobState::Done => "done",
            JobState::Expired => "expired",
            JobState::Unknown => "unknown",
        }
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "received" => Ok(JobState::Received),
            "queued" => Ok(JobState::Queued),
            "processing" => Ok(JobState::Processing),
            "done" => Ok(JobState::Done),
            "expired" => Ok(JobState::Expired),
            other => Err(format!("invalid job state '{}'", other)),
        }
    }
}

/// Batch job details as returned by `batch.list_jobs` and `batch.submit_job`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchJob {
    pub id: String,
    pub state: JobState,
    #[serde(default)]
    pub dataset: Option<String>,
    #[serde(default)]
    pub schema: Option<String>,
    #[serde(default)]
    pub symbols: serde_json::Value,
    #[serde(default)]
    pub ts_received: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ts_process_done: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ts_expiration: Option<DateTime<Utc>>,
    #[serde(default)]
    pub record_count: Option<u64>,
    #[serde(default)]
    pub billed_size: Option<u64>,
    #[serde(default)]
    pub cost_usd: Option<f64>,
    /// Fields this client does not model
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

macro_rules! wire_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $wire:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $wire)] $variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $wire),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.to_lowercase().as_str() {
                    $($wire => Ok($name::$variant),)+
                    other => Err(format!(
                        "invalid {} '{}', expected one of: {}",
                        stringify!($name),
                        other,
                        [$($wire),+].join(", ")
                    )),
                }
            }
        }
    };
}

wire_enum!(
    /// Data encoding of the batch files
    Encoding { Dbn => "dbn", Csv => "csv", Json => "json" }
);
wire_enum!(
    /// Compression applied to the batch files
    Compression { None => "none", Zstd => "zstd" }
);
wire_enum!(
    /// Maximum time span of one batch file
    SplitDuration { Day => "day", Week => "week", Month => "month", None => "none" }
);
wire_enum!(
    /// Archive format wrapping all files of a job
    Packaging { None => "none", Zip => "zip", Tar => "tar" }
);
wire_enum!(
    /// How the service delivers the finished files
    Delivery { Download => "download", S3 => "s3", Disk => "disk" }
);

/// Parameters of a `batch.submit_job` request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitJobRequest {
    pub dataset: String,
    pub symbols: Vec<String>,
    pub schema: String,
    pub start: String,
    pub end: Option<String>,
    pub encoding: Encoding,
    pub compression: Compression,
    pub split_duration: SplitDuration,
    pub split_size: Option<u64>,
    pub split_symbols: bool,
    pub packaging: Option<Packaging>,
    pub delivery: Delivery,
    pub stype_in: String,
    pub stype_out: String,
    pub limit: Option<u64>,
}

impl SubmitJobRequest {
    pub fn new(
        dataset: impl Into<String>,
        symbols: Vec<String>,
        schema: impl Into<String>,
        start: impl Into<String>,
    ) -> Self {
        Self {
            dataset: dataset.into(),
            symbols,
            schema: schema.into(),
            start: start.into(),
            end: None,
            encoding: Encoding::Dbn,
            compression: Compression::Zstd,
            split_duration: SplitDuration::Day,
            split_size: None,
            split_symbols: false,
            packaging: None,
            delivery: Delivery::Download,
            stype_in: "raw_symbol".to_string(),
            stype_out: "instrument_id".to_string(),
            limit: None,
        }
    }

    /// Form fields in the order the service documents them
    pub fn form_fields(&self) -> Vec<(&'static str, String)> {
        let mut fields = vec![
            ("dataset", self.dataset.clone()),
            ("start", self.start.clone()),
            ("symbols", self.symbols.join(",")),
            ("schema", self.schema.clone()),
            ("stype_in", self.stype_in.clone()),
            ("stype_out", self.stype_out.clone()),
            ("encoding", self.encoding.to_string()),
            ("compression", self.compression.to_string()),
            ("split_symbols", self.split_symbols.to_string()),
            ("split_duration", self.split_duration.to_string()),
            ("delivery", self.delivery.to_string()),
        ];
        if let Some(end) = &self.end {
            fields.push(("end", end.clone()));
        }
        if let Some(packaging) = self.packaging {
            fields.push(("packaging", packaging.to_string()));
        }
        if let Some(split_size) = self.split_size {
            fields.push(("split_size", split_size.to_string()));
        }
        if let Some(limit) = self.limit {
            fields.push(("limit", limit.to_string()));
        }
        fields
    }
}

// ============================================================================
// Settings Types
// ============================================================================

/// Client settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Base URL of the historical gateway
    pub gateway: String,
    /// Where `{job_id}/` directories are created when no output dir is given
    pub default_output_dir: Option<PathBuf>,
    /// Size of the shared transfer pool
    pub max_workers: usize,
    /// Immediate retries after the first failed attempt of a file
    pub max_retries: u32,
    /// Wait applied on HTTP 429 when `Retry-After` is missing or invalid
    pub default_retry_after_secs: u64,
    pub connect_timeout_secs: u64,
    /// Longest silence tolerated between two reads of a response body
    pub read_timeout_secs: u64,
    pub user_agent: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            gateway: "https://hist.databento.com".to_string(),
            default_output_dir: None,
            max_workers: 8,
            max_retries: 3,
            default_retry_after_secs: 1,
            connect_timeout_secs: 30,
            read_timeout_secs: 60,
            user_agent: format!("mdbatch/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl Settings {
    /// Output directory used when the caller passes none
    pub fn output_dir(&self) -> PathBuf {
        self.default_output_dir
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Default location of the settings file
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("mdbatch").join("settings.json"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_defaults_fill_missing_fields() {
        let settings: Settings = serde_json::from_str(r#"{"max_workers": 2}"#).unwrap();
        assert_eq!(settings.max_workers, 2);
        assert_eq!(settings.max_retries, 3);
        assert_eq!(settings.default_retry_after_secs, 1);
        assert_eq!(settings.read_timeout_secs, 60);
        assert_eq!(settings.gateway, "https://hist.databento.com");
    }

    #[test]
    fn test_wire_enum_parsing() {
        assert_eq!("ZSTD".parse::<Compression>().unwrap(), Compression::Zstd);
        assert_eq!(SplitDuration::Week.to_string(), "week");
        assert!("gzip".parse::<Compression>().is_err());
    }

    #[test]
    fn test_submit_request_optional_fields() {
        let mut request = SubmitJobRequest::new("GLBX.MDP3", vec!["ESM4".into()], "trades", "2024-05-01");
        assert!(!request.form_fields().iter().any(|(k, _)| *k == "limit"));

        request.limit = Some(10);
        request.packaging = Some(Packaging::Zip);
        let fields = request.form_fields();
        assert!(fields.contains(&("limit", "10".to_string())));
        assert!(fields.contains(&("packaging", "zip".to_string())));
    }

    #[test]
    fn test_batch_job_keeps_unknown_fields() {
        let job: BatchJob = serde_json::from_str(
            r#"{"id": "GLBX-20240501-ABC", "state": "done", "dataset": "GLBX.MDP3",
                "ts_received": "2024-05-01T12:00:00Z", "package_size": 1024}"#,
        )
        .unwrap();
        assert_eq!(job.state, JobState::Done);
        assert_eq!(job.extra.get("package_size"), Some(&serde_json::json!(1024)));
    }

    #[test]
    fn test_batch_job_tolerates_new_states() {
        let job: BatchJob =
            serde_json::from_str(r#"{"id": "GLBX-20240501-ABC", "state": "archived"}"#).unwrap();
        assert_eq!(job.state, JobState::Unknown);
        // Only known states are accepted as filters
        assert!("unknown".parse::<JobState>().is_err());
    }

    #[test]
    fn test_warning_display_names_file() {
        let warning = TransferWarning::UnsupportedChecksum {
            filename: "c.dbn.zst".into(),
            algorithm: "crc32".into(),
        };
        assert_eq!(
            warning.to_string(),
            "Skipping c.dbn.zst checksum because crc32 is not supported"
        );
    }
}
