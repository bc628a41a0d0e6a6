//! Manifest resolution - turns `batch.list_files` output into transfer targets

use crate::error::BatchError;
use crate::transport::ManifestSource;
use mdbatch_types::TransferTarget;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{error, info};
use url::Url;

/// Validated, filtered targets of one job
#[derive(Debug, Clone)]
pub struct JobManifest {
    job_id: String,
    targets: Vec<TransferTarget>,
}

impl JobManifest {
    /// Build a manifest from raw entries
    ///
    /// Every entry is validated, then entries outside `filter` are dropped.
    pub fn from_entries(
        job_id: &str,
        entries: &[Value],
        filter: Option<&HashSet<String>>,
    ) -> Result<Self, BatchError> {
        if entries.is_empty() {
            return Err(BatchError::manifest(format!(
                "No files found for batch job {}",
                job_id
            )));
        }

        let mut seen = HashSet::with_capacity(entries.len());
        let mut targets = Vec::with_capacity(entries.len());
        for entry in entries {
            let target = parse_entry(entry)?;
            if !seen.insert(target.filename().to_string()) {
                return Err(BatchError::manifest(format!(
                    "duplicate file '{}' in batch job manifest",
                    target.filename()
                )));
            }
            if filter.map_or(true, |f| f.contains(target.filename())) {
                targets.push(target);
            }
        }

        if targets.is_empty() {
            return Err(BatchError::manifest(format!(
                "None of the requested files belong to batch job {}",
                job_id
            )));
        }

        Ok(Self {
            job_id: job_id.to_string(),
            targets,
        })
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn targets(&self) -> &[TransferTarget] {
        &self.targets
    }

    pub fn into_targets(self) -> Vec<TransferTarget> {
        self.targets
    }

    /// Sum of the expected sizes
    pub fn total_size(&self) -> u64 {
        self.targets.iter().map(TransferTarget::expected_size).sum()
    }
}

/// Fetches and normalizes job manifests
pub struct ManifestResolver {
    source: Arc<dyn ManifestSource>,
}

impl ManifestResolver {
    pub fn new(source: Arc<dyn ManifestSource>) -> Self {
        Self { source }
    }

    pub async fn resolve(
        &self,
        job_id: &str,
        filter: Option<&HashSet<String>>,
    ) -> Result<JobManifest, BatchError> {
        let entries = self.source.list_files(job_id).await.map_err(|e| {
            error!("Failed to list files for batch job {}: {}", job_id, e);
            BatchError::Manifest {
                message: format!("could not list files for batch job {}", job_id),
                source: Some(e),
            }
        })?;

        let manifest = JobManifest::from_entries(job_id, &entries, filter)?;
        info!(
            "Batch job {}: {} of {} files selected ({} bytes)",
            job_id,
            manifest.targets().len(),
            entries.len(),
            manifest.total_size()
        );
        Ok(manifest)
    }
}

fn parse_entry(entry: &Value) -> Result<TransferTarget, BatchError> {
    let fields = entry
        .as_object()
        .ok_or_else(|| BatchError::manifest("Error parsing job manifest"))?;

    let filename = string_field(fields, "filename")?;
    let hash = string_field(fields, "hash")?;
    let size = size_field(fields)?;
    let urls = required(fields, "urls")?
        .as_object()
        .ok_or_else(|| BatchError::manifest("Error parsing job manifest"))?;

    validate_filename(&filename)?;

    let unavailable = || BatchError::DeliveryUnavailable {
        filename: filename.clone(),
    };
    let https_url = urls
        .get("https")
        .and_then(Value::as_str)
        .ok_or_else(unavailable)?;
    let download_url = Url::parse(https_url).map_err(|_| unavailable())?;
    if download_url.scheme() != "https" {
        return Err(unavailable());
    }

    Ok(TransferTarget::new(filename, hash, download_url, size))
}

fn required<'a>(fields: &'a Map<String, Value>, key: &str) -> Result<&'a Value, BatchError> {
    fields
        .get(key)
        .ok_or_else(|| BatchError::manifest(format!("Batch job manifest missing key '{}'", key)))
}

fn string_field(fields: &Map<String, Value>, key: &str) -> Result<String, BatchError> {
    match required(fields, key)? {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        _ => Err(BatchError::manifest(format!(
            "Batch job manifest has an invalid '{}'",
            key
        ))),
    }
}

fn size_field(fields: &Map<String, Value>) -> Result<u64, BatchError> {
    let value = required(fields, "size")?;
    value
        .as_u64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse::<u64>().ok()))
        .ok_or_else(|| BatchError::manifest("Batch job manifest has an invalid 'size'"))
}

/// Filenames become path components under the job directory
fn validate_filename(filename: &str) -> Result<(), BatchError> {
    let bad = filename.is_empty()
        || filename == "."
        || filename == ".."
        || filename.contains('/')
        || filename.contains('\\');
    if bad {
        return Err(BatchError::manifest(format!(
            "Batch job manifest has an unusable filename '{}'",
            filename
        )));
    }
    Ok(())
}
