//! HTTP client for the batch endpoints
//!
//! Thin wrapper around `reqwest`: basic auth with the API key, base URL
//! construction and translation of non-2xx responses into
//! [`TransportError::Status`].

use crate::error::{BatchError, TransportError};
use crate::transport::{ByteRange, FileResponse, HttpTransport, ManifestSource};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use futures::StreamExt;
use mdbatch_types::{BatchJob, JobState, Settings, SubmitJobRequest};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use std::time::Duration;
use tracing::debug;
use url::Url;

pub const API_VERSION: u32 = 0;

/// Longest error body kept in [`TransportError::Status`]
const MAX_ERROR_BODY: usize = 512;

/// Authenticated client for `/v0/batch.*`
#[derive(Clone)]
pub struct BatchClient {
    client: Client,
    key: String,
    base_url: String,
}

impl BatchClient {
    pub fn new(api_key: impl Into<String>, settings: &Settings) -> Result<Self, BatchError> {
        let key = api_key.into();
        if key.trim().is_empty() {
            return Err(BatchError::Config("API key must not be empty".to_string()));
        }

        let client = Client::builder()
            .user_agent(settings.user_agent.clone())
            .connect_timeout(Duration::from_secs(settings.connect_timeout_secs))
            .read_timeout(Duration::from_secs(settings.read_timeout_secs))
            .build()
            .map_err(|e| BatchError::Config(e.to_string()))?;

        let gateway = settings.gateway.trim_end_matches('/');
        Ok(Self {
            client,
            key,
            base_url: format!("{}/v{}/batch", gateway, API_VERSION),
        })
    }

    fn endpoint(&self, name: &str) -> String {
        format!("{}.{}", self.base_url, name)
    }

    fn authed(&self, request: RequestBuilder) -> RequestBuilder {
        request.basic_auth(&self.key, Some(""))
    }

    /// Request the details of all batch jobs of the account
    pub async fn list_jobs(
        &self,
        states: &[JobState],
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<BatchJob>, TransportError> {
        let mut params: Vec<(&str, String)> = Vec::new();
        if !states.is_empty() {
            let states: Vec<&str> = states.iter().map(JobState::as_str).collect();
            params.push(("states", states.join(",")));
        }
        if let Some(since) = since {
            params.push(("since", since.to_rfc3339_opts(SecondsFormat::Nanos, true)));
        }

        let request = self.authed(self.client.get(self.endpoint("list_jobs"))).query(&params);
        let response = check_http_error(request.send().await?).await?;
        Ok(response.json().await?)
    }

    /// Submit a new batch job
    pub async fn submit_job(&self, job: &SubmitJobRequest) -> Result<BatchJob, TransportError> {
        let request = self
            .authed(self.client.post(self.endpoint("submit_job")))
            .form(&job.form_fields());
        let response = check_http_error(request.send().await?).await?;
        Ok(response.json().await?)
    }
}

#[async_trait]
impl ManifestSource for BatchClient {
    async fn list_files(&self, job_id: &str) -> Result<Vec<serde_json::Value>, TransportError> {
        let request = self
            .authed(self.client.get(self.endpoint("list_files")))
            .query(&[("job_id", job_id)]);
        let response = check_http_error(request.send().await?).await?;
        Ok(response.json().await?)
    }
}

#[async_trait]
impl HttpTransport for BatchClient {
    async fn get(&self, url: &Url, range: Option<ByteRange>) -> Result<FileResponse, TransportError> {
        let mut request = self.authed(self.client.get(url.as_str()));
        if let Some(range) = range {
            debug!("Requesting range {} of {}", range, url);
            request = request.header(reqwest::header::RANGE, range.header_value());
        }

        let response = check_http_error(request.send().await?).await?;
        let partial = response.status() == StatusCode::PARTIAL_CONTENT;
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(TransportError::from))
            .boxed();

        Ok(FileResponse { partial, body })
    }
}

/// Turn a non-2xx response into [`TransportError::Status`]
async fn check_http_error(response: Response) -> Result<Response, TransportError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let headers = response.headers().clone();
    let mut message = response.text().await.unwrap_or_default();
    if message.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !message.is_char_boundary(cut) {
            cut -= 1;
        }
        message.truncate(cut);
    }
    if message.is_empty() {
        message = status.canonical_reason().unwrap_or("unknown status").to_string();
    }

    Err(TransportError::Status {
        status: status.as_u16(),
        headers,
        message,
    })
}
