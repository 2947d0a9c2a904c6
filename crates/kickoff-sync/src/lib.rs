//! Sync pass orchestration: configuration, schedule fetch, resolution and reconciliation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kickoff_adapters::{
    load_catalog, CatalogError, FileScheduleProvider, HttpClientConfig, HttpFetcher,
    HttpScheduleProvider, ScheduleProvider,
};
use kickoff_core::{CatalogEntry, ChannelEntry, DEFAULT_DELIVERY_SERVER_ID};
use kickoff_storage::{MySqlGateway, MySqlSettings, StorageError, StorageGateway};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

mod reconcile;
mod resolver;

pub use reconcile::{
    patch_members, plan_group_updates, GroupUpdate, ReconcileReport, ReconcileSettings,
    Reconciler, WritePlan,
};
pub use resolver::{display_name, quality_labels, ChannelResolver};

pub const CRATE_NAME: &str = "kickoff-sync";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("missing required setting {0}; set it in the environment or in .env")]
    Missing(&'static str),
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("reading {path}: {reason}")]
    EnvFile { path: PathBuf, reason: String },
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error("schedule provider setup failed: {0:#}")]
    ProviderSetup(anyhow::Error),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// What a run does with storage when the schedule could not be fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProviderFailurePolicy {
    /// Continue with no events: the destination category is emptied.
    ClearCategory,
    /// Skip the storage phase and leave the previous generation in place.
    KeepExisting,
}

impl FromStr for ProviderFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "clear" => Ok(Self::ClearCategory),
            "keep" => Ok(Self::KeepExisting),
            other => Err(format!("expected `clear` or `keep`, got `{other}`")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleSource {
    Url(String),
    File(PathBuf),
}

/// Name the daily feed variable had in existing `.env` files. Used when `DAILY_FEED_URL` is unset.
pub const LEGACY_DAILY_FEED_KEY: &str = "URL_JOGOS_DO_DIA";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    pub database: MySqlSettings,
    pub category_name: String,
    pub daily_feed_url: Option<String>,
    pub schedule: ScheduleSource,
    pub catalog_path: PathBuf,
    pub server_id: i64,
    pub provider_failure_policy: ProviderFailurePolicy,
    pub http_timeout_secs: u64,
    pub user_agent: String,
}

impl SyncConfig {
    /// Process environment, falling back to `./.env` for keys it does not set.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_with_file(Path::new(ENV_FILE))
    }

    pub fn from_env_with_file(path: &Path) -> Result<Self, ConfigError> {
        let file = read_env_file(path)?;
        Self::from_lookup(|key| std::env::var(key).ok().or_else(|| file.get(key).cloned()))
    }

    /// Build the configuration from any key/value source. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let required = |key: &'static str| get(key).ok_or(ConfigError::Missing(key));

        let database = MySqlSettings {
            host: required("DB_HOST")?,
            port: parse_or("DB_PORT", get("DB_PORT"), 3306)?,
            user: required("DB_USER")?,
            password: required("DB_PASSWORD")?,
            database: required("DB_NAME")?,
            max_connections: parse_or("DB_MAX_CONNECTIONS", get("DB_MAX_CONNECTIONS"), 10)?,
        };

        let schedule = match (get("SCHEDULE_URL"), get("SCHEDULE_FILE")) {
            (Some(url), _) => ScheduleSource::Url(url),
            (None, Some(path)) => ScheduleSource::File(PathBuf::from(path)),
            (None, None) => return Err(ConfigError::Missing("SCHEDULE_URL or SCHEDULE_FILE")),
        };

        Ok(Self {
            database,
            category_name: required("CATEGORY_NAME_DESTINATION")?,
            daily_feed_url: get("DAILY_FEED_URL").or_else(|| get(LEGACY_DAILY_FEED_KEY)),
            schedule,
            catalog_path: get("CATALOG_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./sources.json")),
            server_id: parse_or(
                "DELIVERY_SERVER_ID",
                get("DELIVERY_SERVER_ID"),
                DEFAULT_DELIVERY_SERVER_ID,
            )?,
            provider_failure_policy: parse_or(
                "PROVIDER_FAILURE_POLICY",
                get("PROVIDER_FAILURE_POLICY"),
                ProviderFailurePolicy::ClearCategory,
            )?,
            http_timeout_secs: parse_or("HTTP_TIMEOUT_SECS", get("HTTP_TIMEOUT_SECS"), 20)?,
            user_agent: get("HTTP_USER_AGENT").unwrap_or_else(|| "kickoff-sync/0.1".to_string()),
        })
    }

    pub fn reconcile_settings(&self) -> ReconcileSettings {
        ReconcileSettings {
            category_name: self.category_name.clone(),
            server_id: self.server_id,
        }
    }
}

pub const ENV_FILE: &str = ".env";

/// `KEY=value` pairs from a dotenv file. A missing file yields no entries.
pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>, ConfigError> {
    let invalid = |err: dotenvy::Error| ConfigError::EnvFile {
        path: path.to_path_buf(),
        reason: err.to_string(),
    };
    let entries = match dotenvy::from_path_iter(path) {
        Ok(entries) => entries,
        Err(err) if err.not_found() => return Ok(HashMap::new()),
        Err(err) => return Err(invalid(err)),
    };
    let entries = entries
        .collect::<Result<HashMap<_, _>, _>>()
        .map_err(invalid)?;
    debug!(path = %path.display(), keys = entries.len(), "read environment file");
    Ok(entries)
}

fn parse_or<T>(key: &'static str, value: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match value {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|err: T::Err| ConfigError::Invalid {
                key,
                reason: err.to_string(),
                value,
            }),
    }
}

pub fn build_schedule_provider(config: &SyncConfig) -> anyhow::Result<Box<dyn ScheduleProvider>> {
    let provider: Box<dyn ScheduleProvider> = match &config.schedule {
        ScheduleSource::Url(url) => {
            let http = HttpFetcher::new(HttpClientConfig {
                timeout: Duration::from_secs(config.http_timeout_secs),
                user_agent: Some(config.user_agent.clone()),
                ..Default::default()
            })?;
            Box::new(HttpScheduleProvider::new(http, url.clone()))
        }
        ScheduleSource::File(path) => Box::new(FileScheduleProvider::new(path.clone())),
    };
    Ok(provider)
}

/// Channels resolved for one run, before anything touches storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedBatch {
    pub events: usize,
    pub channels: Vec<ChannelEntry>,
    pub provider_failed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum RunOutcome {
    Reconciled(ReconcileReport),
    /// The schedule fetch failed under [`ProviderFailurePolicy::KeepExisting`].
    SkippedAfterProviderFailure,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub events: usize,
    pub channels: usize,
    pub outcome: RunOutcome,
}

pub struct SyncPipeline {
    config: SyncConfig,
    catalog: Option<Vec<CatalogEntry>>,
    provider: Box<dyn ScheduleProvider>,
    resolver: ChannelResolver,
    reconciler: Reconciler,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig, provider: Box<dyn ScheduleProvider>) -> Self {
        let reconciler = Reconciler::new(config.reconcile_settings());
        Self {
            config,
            catalog: None,
            provider,
            resolver: ChannelResolver::default(),
            reconciler,
        }
    }

    pub fn with_resolver(mut self, resolver: ChannelResolver) -> Self {
        self.resolver = resolver;
        self
    }

    /// Use an already loaded catalog instead of reading `catalog_path` on every run.
    pub fn with_catalog(mut self, catalog: Vec<CatalogEntry>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Load the catalog, fetch today's events and resolve them. Read-only.
    pub async fn resolve_channels(&self) -> Result<ResolvedBatch, SyncError> {
        let loaded;
        let catalog = match &self.catalog {
            Some(catalog) => catalog.as_slice(),
            None => {
                loaded = load_catalog(&self.config.catalog_path)?;
                info!(
                    entries = loaded.len(),
                    path = %self.config.catalog_path.display(),
                    "catalog loaded"
                );
                loaded.as_slice()
            }
        };

        let (events, provider_failed) = match self.provider.fetch_events().await {
            Ok(events) => (events, false),
            Err(err) => {
                warn!(
                    origin = %self.provider.origin(),
                    error = %err,
                    "schedule fetch failed; continuing with no events"
                );
                (Vec::new(), true)
            }
        };

        let channels =
            self.resolver
                .resolve(&events, catalog, self.config.daily_feed_url.as_deref());
        info!(
            events = events.len(),
            channels = channels.len(),
            "resolved channels"
        );

        Ok(ResolvedBatch {
            events: events.len(),
            channels,
            provider_failed,
        })
    }

    /// One full pass. The gateway is left open; see [`SyncPipeline::run_and_close`].
    pub async fn run_once(&self, gateway: &dyn StorageGateway) -> Result<SyncRunSummary, SyncError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id, category = %self.config.category_name);
        self.run_inner(run_id, gateway).instrument(span).await
    }

    /// [`SyncPipeline::run_once`], then close the gateway whatever the outcome.
    pub async fn run_and_close(
        &self,
        gateway: &dyn StorageGateway,
    ) -> Result<SyncRunSummary, SyncError> {
        let outcome = self.run_once(gateway).await;
        gateway.close().await;
        outcome
    }

    async fn run_inner(
        &self,
        run_id: Uuid,
        gateway: &dyn StorageGateway,
    ) -> Result<SyncRunSummary, SyncError> {
        let started_at = Utc::now();
        let batch = self.resolve_channels().await?;

        let outcome = if batch.provider_failed
            && self.config.provider_failure_policy == ProviderFailurePolicy::KeepExisting
        {
            warn!("leaving the destination category untouched after provider failure");
            RunOutcome::SkippedAfterProviderFailure
        } else {
            let report = self
                .reconciler
                .run(gateway, &batch.channels, started_at)
                .await?;
            RunOutcome::Reconciled(report)
        };

        Ok(SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            events: batch.events,
            channels: batch.channels.len(),
            outcome,
        })
    }
}

/// Production entry point: MySQL gateway plus the provider named by the configuration.
pub async fn run_sync_once(config: SyncConfig) -> Result<SyncRunSummary, SyncError> {
    let provider = build_schedule_provider(&config).map_err(SyncError::ProviderSetup)?;
    // Fail on a broken catalog before opening any connection.
    let catalog = load_catalog(&config.catalog_path)?;
    info!(
        entries = catalog.len(),
        path = %config.catalog_path.display(),
        "catalog loaded"
    );
    let gateway = MySqlGateway::connect(&config.database).await?;
    let pipeline = SyncPipeline::new(config, provider).with_catalog(catalog);
    pipeline.run_and_close(&gateway).await
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary, SyncError> {
    run_sync_once(SyncConfig::from_env()?).await
}

pub async fn preview_from_env() -> Result<ResolvedBatch, SyncError> {
    let config = SyncConfig::from_env()?;
    let provider = build_schedule_provider(&config).map_err(SyncError::ProviderSetup)?;
    SyncPipeline::new(config, provider).resolve_channels().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>();
        move |key: &str| map.get(key).cloned()
    }

    const MINIMAL: &[(&str, &str)] = &[
        ("DB_HOST", "db.local"),
        ("DB_USER", "panel"),
        ("DB_PASSWORD", "secret"),
        ("DB_NAME", "xtream"),
        ("CATEGORY_NAME_DESTINATION", "Jogos do Dia"),
        ("SCHEDULE_URL", "https://schedule.example/today.json"),
    ];

    #[test]
    fn minimal_environment_fills_defaults() {
        let config = SyncConfig::from_lookup(lookup(MINIMAL)).expect("config");
        assert_eq!(config.database.port, 3306);
        assert_eq!(config.database.max_connections, 10);
        assert_eq!(config.category_name, "Jogos do Dia");
        assert_eq!(config.daily_feed_url, None);
        assert_eq!(
            config.schedule,
            ScheduleSource::Url("https://schedule.example/today.json".to_string())
        );
        assert_eq!(config.catalog_path, PathBuf::from("./sources.json"));
        assert_eq!(config.server_id, 1);
        assert_eq!(
            config.provider_failure_policy,
            ProviderFailurePolicy::ClearCategory
        );
    }

    #[test]
    fn missing_database_settings_are_reported_by_name() {
        let pairs = MINIMAL
            .iter()
            .copied()
            .filter(|(k, _)| *k != "DB_PASSWORD")
            .collect::<Vec<_>>();
        assert_eq!(
            SyncConfig::from_lookup(lookup(&pairs)).unwrap_err(),
            ConfigError::Missing("DB_PASSWORD")
        );
    }

    #[test]
    fn a_schedule_source_is_required() {
        let pairs = MINIMAL
            .iter()
            .copied()
            .filter(|(k, _)| *k != "SCHEDULE_URL")
            .collect::<Vec<_>>();
        assert!(matches!(
            SyncConfig::from_lookup(lookup(&pairs)),
            Err(ConfigError::Missing(_))
        ));

        let mut with_file = pairs.clone();
        with_file.push(("SCHEDULE_FILE", "fixtures/schedule.json"));
        let config = SyncConfig::from_lookup(lookup(&with_file)).expect("config");
        assert_eq!(
            config.schedule,
            ScheduleSource::File(PathBuf::from("fixtures/schedule.json"))
        );
    }

    #[test]
    fn blank_daily_feed_disables_the_leading_entry() {
        let mut pairs = MINIMAL.to_vec();
        pairs.push(("DAILY_FEED_URL", "  "));
        let config = SyncConfig::from_lookup(lookup(&pairs)).expect("config");
        assert_eq!(config.daily_feed_url, None);
    }

    #[test]
    fn env_file_entries_skip_comments_and_unquote_values() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(
            file,
            "# panel credentials\nKICKOFF_TEST_DB_HOST=db.local\nKICKOFF_TEST_DB_NAME=\"xtream\""
        )
        .expect("write");

        let entries = read_env_file(file.path()).expect("env file");
        assert_eq!(
            entries.get("KICKOFF_TEST_DB_HOST").map(String::as_str),
            Some("db.local")
        );
        assert_eq!(
            entries.get("KICKOFF_TEST_DB_NAME").map(String::as_str),
            Some("xtream")
        );
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn legacy_env_file_builds_a_config() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(".env");
        std::fs::write(
            &path,
            "DB_HOST=db.local\nDB_USER=panel\nDB_PASSWORD=secret\nDB_NAME=xtream\n\
             CATEGORY_NAME_DESTINATION=\"Jogos do Dia\"\n\
             URL_JOGOS_DO_DIA=http://feed.local/hoje.m3u8\n\
             SCHEDULE_FILE=fixtures/schedule.json\n",
        )
        .expect("write");

        let config = SyncConfig::from_env_with_file(&path).expect("config");
        assert_eq!(config.category_name, "Jogos do Dia");
        assert_eq!(
            config.daily_feed_url.as_deref(),
            Some("http://feed.local/hoje.m3u8")
        );
    }

    #[test]
    fn missing_env_file_is_not_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let entries = read_env_file(&dir.path().join(".env")).expect("no file");
        assert!(entries.is_empty());
    }

    #[test]
    fn legacy_daily_feed_key_is_still_honoured() {
        let mut pairs = MINIMAL.to_vec();
        pairs.push(("URL_JOGOS_DO_DIA", "http://feed.local/hoje.m3u8"));
        let config = SyncConfig::from_lookup(lookup(&pairs)).expect("config");
        assert_eq!(
            config.daily_feed_url.as_deref(),
            Some("http://feed.local/hoje.m3u8")
        );

        pairs.push(("DAILY_FEED_URL", "http://feed.local/today.m3u8"));
        let config = SyncConfig::from_lookup(lookup(&pairs)).expect("config");
        assert_eq!(
            config.daily_feed_url.as_deref(),
            Some("http://feed.local/today.m3u8")
        );
    }

    #[test]
    fn invalid_numbers_and_policies_are_rejected() {
        let mut pairs = MINIMAL.to_vec();
        pairs.push(("DB_PORT", "not-a-port"));
        assert!(matches!(
            SyncConfig::from_lookup(lookup(&pairs)),
            Err(ConfigError::Invalid { key: "DB_PORT", .. })
        ));

        let mut pairs = MINIMAL.to_vec();
        pairs.push(("PROVIDER_FAILURE_POLICY", "sometimes"));
        assert!(matches!(
            SyncConfig::from_lookup(lookup(&pairs)),
            Err(ConfigError::Invalid {
                key: "PROVIDER_FAILURE_POLICY",
                ..
            })
        ));
    }

    #[test]
    fn failure_policy_parses_case_insensitively() {
        assert_eq!(
            "KEEP".parse::<ProviderFailurePolicy>(),
            Ok(ProviderFailurePolicy::KeepExisting)
        );
        assert_eq!(
            "clear".parse::<ProviderFailurePolicy>(),
            Ok(ProviderFailurePolicy::ClearCategory)
        );
    }
}
