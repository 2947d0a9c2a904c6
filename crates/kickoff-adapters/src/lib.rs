//! Schedule providers, the source catalog loader and the retrying HTTP fetcher behind them.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use kickoff_core::{CatalogEntry, Event};
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "kickoff-adapters";

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("reading catalog {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing catalog {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Load the static list of stream sources. Any problem here is fatal for the run.
pub fn load_catalog(path: impl AsRef<Path>) -> Result<Vec<CatalogEntry>, CatalogError> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).map_err(|source| CatalogError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&data).map_err(|source| CatalogError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("reading schedule {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing schedule from {origin}: {source}")]
    Parse {
        origin: String,
        #[source]
        source: serde_json::Error,
    },
}

#[async_trait]
pub trait ScheduleProvider: Send + Sync {
    /// Human-readable origin used in logs.
    fn origin(&self) -> String;

    /// Today's events in feed order.
    async fn fetch_events(&self) -> Result<Vec<Event>, ProviderError>;
}

/// Feed record. Field aliases cover the Portuguese keys used by the public football API.
#[derive(Debug, Clone, Deserialize)]
struct ScheduleRecord {
    #[serde(alias = "times")]
    teams: Vec<String>,
    #[serde(alias = "hora")]
    kickoff: String,
    #[serde(default, alias = "canais")]
    broadcasters: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ScheduleDocument {
    List(Vec<ScheduleRecord>),
    Wrapped {
        #[serde(alias = "jogos", alias = "games")]
        events: Vec<ScheduleRecord>,
    },
}

/// Decode a schedule document. Records without two team names are dropped with a warning.
pub fn parse_schedule(bytes: &[u8], origin: &str) -> Result<Vec<Event>, ProviderError> {
    let document: ScheduleDocument =
        serde_json::from_slice(bytes).map_err(|source| ProviderError::Parse {
            origin: origin.to_string(),
            source,
        })?;
    let records = match document {
        ScheduleDocument::List(records) => records,
        ScheduleDocument::Wrapped { events } => events,
    };

    let mut events = Vec::with_capacity(records.len());
    for record in records {
        let mut teams = record.teams.into_iter();
        match (teams.next(), teams.next()) {
            (Some(team_home), Some(team_away)) => events.push(Event {
                team_home,
                team_away,
                kickoff: record.kickoff,
                broadcasters: record.broadcasters,
            }),
            _ => warn!(origin, kickoff = %record.kickoff, "skipping schedule record without two teams"),
        }
    }
    Ok(events)
}

#[derive(Debug, Clone)]
pub struct FileScheduleProvider {
    path: PathBuf,
}

impl FileScheduleProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ScheduleProvider for FileScheduleProvider {
    fn origin(&self) -> String {
        self.path.display().to_string()
    }

    async fn fetch_events(&self) -> Result<Vec<Event>, ProviderError> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|source| ProviderError::Read {
                path: self.path.clone(),
                source,
            })?;
        parse_schedule(&bytes, &self.origin())
    }
}

#[derive(Debug)]
pub struct HttpScheduleProvider {
    http: HttpFetcher,
    url: String,
}

impl HttpScheduleProvider {
    pub fn new(http: HttpFetcher, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
        }
    }
}

#[async_trait]
impl ScheduleProvider for HttpScheduleProvider {
    fn origin(&self) -> String {
        self.url.clone()
    }

    async fn fetch_events(&self) -> Result<Vec<Event>, ProviderError> {
        let response = self.http.fetch_bytes(&self.url).await?;
        debug!(
            url = %response.url,
            attempts = response.attempts,
            bytes = response.body.len(),
            "schedule fetched"
        );
        parse_schedule(&response.body, &response.url)
    }
}

/// Upstream statuses worth another attempt: the feed is briefly down or throttling us.
pub fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

pub fn is_transient_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

/// How many times a schedule fetch is retried and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub first_delay: Duration,
    pub ceiling: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            first_delay: Duration::from_millis(500),
            ceiling: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            retries: 0,
            first_delay: Duration::ZERO,
            ceiling: Duration::ZERO,
        }
    }

    /// Wait before retry number `retry` (0-based): doubles each time, never above `ceiling`.
    pub fn delay_before(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        self.first_delay.saturating_mul(factor).min(self.ceiling)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub retry: RetryPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            retry: RetryPolicy::default(),
        }
    }
}

/// Body of a successful schedule download.
#[derive(Debug, Clone)]
pub struct ScheduleDownload {
    /// URL after redirects.
    pub url: String,
    pub attempts: u32,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("schedule request to {url} failed after {attempts} attempt(s): {source}")]
    Request {
        url: String,
        attempts: u32,
        #[source]
        source: reqwest::Error,
    },
    #[error("schedule endpoint {url} answered {status} after {attempts} attempt(s)")]
    Status {
        url: String,
        status: StatusCode,
        attempts: u32,
    },
}

impl FetchError {
    pub fn url(&self) -> &str {
        match self {
            FetchError::Request { url, .. } | FetchError::Status { url, .. } => url,
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            FetchError::Request { attempts, .. } | FetchError::Status { attempts, .. } => *attempts,
        }
    }
}

enum Attempt {
    Done(ScheduleDownload),
    Transient(String),
    Failed(FetchError),
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building schedule http client")?;
        Ok(Self {
            client,
            retry: config.retry,
        })
    }

    /// GET the schedule, retrying transient failures per the [`RetryPolicy`].
    pub async fn fetch_bytes(&self, url: &str) -> Result<ScheduleDownload, FetchError> {
        let span = info_span!("schedule_fetch", url);
        self.fetch_with_retries(url).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<ScheduleDownload, FetchError> {
        let mut retry = 0;
        loop {
            let attempts = retry + 1;
            let last_chance = retry >= self.retry.retries;
            match self.attempt(url, attempts, last_chance).await {
                Attempt::Done(download) => return Ok(download),
                Attempt::Failed(err) => return Err(err),
                Attempt::Transient(reason) => {
                    let delay = self.retry.delay_before(retry);
                    warn!(
                        attempts,
                        reason = %reason,
                        delay_ms = delay.as_millis() as u64,
                        "schedule fetch failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
            }
        }
    }

    async fn attempt(&self, url: &str, attempts: u32, last_chance: bool) -> Attempt {
        let response = match self.client.get(url).send().await {
            Ok(response) => response,
            Err(source) => {
                if !last_chance && is_transient_error(&source) {
                    return Attempt::Transient(source.to_string());
                }
                return Attempt::Failed(FetchError::Request {
                    url: url.to_string(),
                    attempts,
                    source,
                });
            }
        };

        let status = response.status();
        let final_url = response.url().to_string();
        if !status.is_success() {
            if !last_chance && is_transient_status(status) {
                return Attempt::Transient(format!("status {status}"));
            }
            return Attempt::Failed(FetchError::Status {
                url: final_url,
                status,
                attempts,
            });
        }

        match response.bytes().await {
            Ok(body) => Attempt::Done(ScheduleDownload {
                url: final_url,
                attempts,
                body: body.to_vec(),
            }),
            Err(source) => Attempt::Failed(FetchError::Request {
                url: final_url,
                attempts,
                source,
            }),
        }
    }
}
