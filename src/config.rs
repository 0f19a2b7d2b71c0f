//! Runtime configuration resolved from the environment (and `.env`).

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::Duration as ChronoDuration;

use crate::database_ops::rate_limit::RetryPolicy;
use crate::error::PipelineError;
use crate::models::Metric;
use crate::util::env::{db_url, env_flag, env_list, env_opt, env_parse};

pub const DEFAULT_EMBEDDED_DB_PATH: &str = "data/gaming_pipeline.sqlite";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbMode {
    Embedded,
    ClientServer,
}

impl FromStr for DbMode {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "embedded" | "sqlite" => Ok(Self::Embedded),
            "client-server" | "postgres" | "postgresql" => Ok(Self::ClientServer),
            other => Err(PipelineError::Config(format!("unknown DB_MODE '{other}'"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DbSettings {
    pub mode: DbMode,
    pub embedded_path: PathBuf,
    /// Resolved DSN; never logged.
    pub url: Option<String>,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Default)]
pub struct SourceSettings {
    pub steam_api_key: Option<String>,
    pub riot_api_key: Option<String>,
    pub opendota_api_key: Option<String>,
    pub riot_puuids: Vec<String>,
    pub steam_base_url: Option<String>,
    pub opendota_base_url: Option<String>,
    pub riot_base_url: Option<String>,
    pub mock_enabled: bool,
}

#[derive(Debug, Clone)]
pub struct RunSettings {
    pub limit_per_game: usize,
    pub detail_matches: usize,
    pub max_workers: usize,
    pub retry: RetryPolicy,
    /// Upper bound for one (game, source) extraction including retries.
    pub source_timeout: Duration,
    pub clock_skew: ChronoDuration,
    pub run_interval: Duration,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            limit_per_game: 10,
            detail_matches: 5,
            max_workers: 4,
            retry: RetryPolicy::default(),
            source_timeout: Duration::from_secs(120),
            clock_skew: ChronoDuration::seconds(300),
            run_interval: Duration::from_secs(15 * 60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ForecastSettings {
    pub horizon_days: u32,
    pub lookback_days: u32,
    pub min_window: usize,
    pub metrics: Vec<Metric>,
}

impl Default for ForecastSettings {
    fn default() -> Self {
        Self {
            horizon_days: 7,
            lookback_days: 30,
            min_window: 7,
            metrics: Metric::ALL.to_vec(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub db: DbSettings,
    pub sources: SourceSettings,
    pub run: RunSettings,
    pub forecast: ForecastSettings,
}

impl PipelineConfig {
    /// Missing API keys are fine; only client-server mode without a DSN fails.
    pub fn from_env() -> Result<Self, PipelineError> {
        Ok(Self {
            db: DbSettings::from_env()?,
            sources: SourceSettings::from_env(),
            run: RunSettings::from_env(),
            forecast: ForecastSettings::from_env()?,
        })
    }

    /// Embedded in-memory defaults, mock fallback on, no API keys.
    pub fn for_tests() -> Self {
        Self {
            db: DbSettings {
                mode: DbMode::Embedded,
                embedded_path: PathBuf::from(":memory:"),
                url: None,
                max_connections: 1,
            },
            sources: SourceSettings {
                mock_enabled: true,
                ..SourceSettings::default()
            },
            run: RunSettings::default(),
            forecast: ForecastSettings::default(),
        }
    }
}

impl DbSettings {
    pub fn from_env() -> Result<Self, PipelineError> {
        let url = db_url();
        let mode = match env_opt("DB_MODE") {
            Some(raw) => raw.parse()?,
            None if url.is_some() => DbMode::ClientServer,
            None => DbMode::Embedded,
        };
        if mode == DbMode::ClientServer && url.is_none() {
            return Err(PipelineError::Config(
                "DB_MODE=client-server requires DATABASE_URL, DB_URL or DB_HOST/DB_USERNAME".into(),
            ));
        }
        Ok(Self {
            mode,
            embedded_path: env_opt("EMBEDDED_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_EMBEDDED_DB_PATH)),
            url,
            max_connections: env_parse("DB_MAX_CONNS", 5u32).max(1),
        })
    }
}

impl SourceSettings {
    pub fn from_env() -> Self {
        Self {
            steam_api_key: env_opt("STEAM_API_KEY"),
            riot_api_key: env_opt("RIOT_API_KEY"),
            opendota_api_key: env_opt("OPENDOTA_API_KEY"),
            riot_puuids: env_list("RIOT_PUUIDS"),
            steam_base_url: env_opt("STEAM_API_BASE_URL"),
            opendota_base_url: env_opt("OPENDOTA_API_BASE_URL"),
            riot_base_url: env_opt("RIOT_API_BASE_URL"),
            mock_enabled: env_flag("MOCK_DATA_ENABLED", true),
        }
    }
}

impl RunSettings {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.limit_per_game = env_parse("LIMIT_PER_GAME", cfg.limit_per_game).max(1);
        cfg.detail_matches = env_parse("DETAIL_MATCHES", cfg.detail_matches);
        cfg.max_workers = env_parse("MAX_WORKERS", cfg.max_workers).max(1);
        cfg.retry.max_retries = env_parse("RETRY_MAX_ATTEMPTS", cfg.retry.max_retries);
        cfg.retry.base_delay = Duration::from_millis(env_parse("RETRY_BASE_MS", 1000u64));
        cfg.retry.max_delay = Duration::from_millis(env_parse("RETRY_MAX_DELAY_MS", 30_000u64));
        cfg.retry.budget = Duration::from_secs(env_parse("RETRY_BUDGET_SECS", 60u64));
        cfg.source_timeout = Duration::from_secs(env_parse("SOURCE_TIMEOUT_SECS", 120u64).max(1));
        cfg.clock_skew = ChronoDuration::seconds(env_parse("CLOCK_SKEW_SECS", 300i64).max(0));
        cfg.run_interval = interval_from_minutes(env_parse("RUN_INTERVAL_MINS", 15u64));
        cfg
    }
}

/// Scheduler interval from a minute count; at least one minute.
pub fn interval_from_minutes(minutes: u64) -> Duration {
    Duration::from_secs(minutes.max(1).saturating_mul(60))
}

impl ForecastSettings {
    pub fn from_env() -> Result<Self, PipelineError> {
        let mut cfg = Self::default();
        cfg.horizon_days = env_parse("FORECAST_HORIZON_DAYS", cfg.horizon_days).max(1);
        cfg.lookback_days = env_parse("FORECAST_LOOKBACK_DAYS", cfg.lookback_days).max(1);
        cfg.min_window = env_parse("FORECAST_MIN_WINDOW", cfg.min_window).max(2);
        let metrics = env_list("FORECAST_METRICS");
        if !metrics.is_empty() {
            cfg.metrics = metrics
                .iter()
                .map(|m| m.parse::<Metric>().map_err(PipelineError::Config))
                .collect::<Result<_, _>>()?;
        }
        Ok(cfg)
    }
}
