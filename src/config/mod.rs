use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level application configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub fetcher: FetcherConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub notifier: NotifierConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where the calendar lives and how its entries are labelled
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceConfig {
    /// DataTables JSON endpoint used by the primary strategy.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Human-facing page rendered by the fallback strategy.
    #[serde(default = "default_endpoint")]
    pub page_url: String,

    #[serde(default = "default_page_length")]
    pub page_length: u32,

    #[serde(default = "default_share_type")]
    pub default_share_type: String,

    #[serde(default = "default_currency")]
    pub currency: String,
}

/// Retrieval and retry configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FetcherConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    #[serde(default = "default_primary_attempts")]
    pub primary_attempts: u32,

    #[serde(default = "default_fallback_attempts")]
    pub fallback_attempts: u32,

    /// Backoff delay n (1-based) is `factor_ms * multiplier^n`.
    #[serde(default = "default_backoff_factor_ms")]
    pub backoff_factor_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: u64,

    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,

    #[serde(default = "default_true")]
    pub jitter: bool,

    #[serde(default = "default_true")]
    pub fallback_enabled: bool,

    #[serde(default = "default_browser_path")]
    pub browser_path: PathBuf,

    #[serde(default = "default_render_timeout_secs")]
    pub render_timeout_secs: u64,

    /// Virtual time Chromium grants page scripts before dumping the DOM.
    #[serde(default = "default_virtual_time_budget_ms")]
    pub virtual_time_budget_ms: u64,
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// Telegram delivery configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NotifierConfig {
    #[serde(default)]
    pub bot_token: Option<String>,

    #[serde(default)]
    pub chat_id: Option<String>,

    #[serde(default = "default_telegram_api")]
    pub api_base: String,

    #[serde(default = "default_notify_timeout_secs")]
    pub timeout_secs: u64,
}

/// Polling loop configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_interval_mins")]
    pub interval_mins: u64,

    /// A cycle still running after this long is abandoned.
    #[serde(default = "default_cycle_deadline_secs")]
    pub cycle_deadline_secs: u64,
}

/// Logging configuration. Console output is always on.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Also append plain-text log lines to this file.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

// ── Defaults ─────────────────────────────────────────────────────────────────

fn default_endpoint() -> String {
    "https://www.nepsealpha.com/investment-calandar/ipo".to_string()
}
fn default_page_length() -> u32 {
    100
}
fn default_share_type() -> String {
    "IPO".to_string()
}
fn default_currency() -> String {
    "NPR".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_user_agent() -> String {
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:135.0) Gecko/20100101 Firefox/135.0"
        .to_string()
}
fn default_primary_attempts() -> u32 {
    3
}
fn default_fallback_attempts() -> u32 {
    2
}
fn default_backoff_factor_ms() -> u64 {
    1000
}
fn default_backoff_multiplier() -> u64 {
    2
}
fn default_max_backoff_secs() -> u64 {
    60
}
fn default_browser_path() -> PathBuf {
    PathBuf::from("chromium")
}
fn default_render_timeout_secs() -> u64 {
    45
}
fn default_virtual_time_budget_ms() -> u64 {
    15_000
}
fn default_db_path() -> PathBuf {
    PathBuf::from("data/ipo_alert.duckdb")
}
fn default_telegram_api() -> String {
    "https://api.telegram.org".to_string()
}
fn default_notify_timeout_secs() -> u64 {
    10
}
fn default_interval_mins() -> u64 {
    120
}
fn default_cycle_deadline_secs() -> u64 {
    300
}
fn default_true() -> bool {
    true
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            page_url: default_endpoint(),
            page_length: default_page_length(),
            default_share_type: default_share_type(),
            currency: default_currency(),
        }
    }
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            user_agent: default_user_agent(),
            primary_attempts: default_primary_attempts(),
            fallback_attempts: default_fallback_attempts(),
            backoff_factor_ms: default_backoff_factor_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_backoff_secs: default_max_backoff_secs(),
            jitter: true,
            fallback_enabled: true,
            browser_path: default_browser_path(),
            render_timeout_secs: default_render_timeout_secs(),
            virtual_time_budget_ms: default_virtual_time_budget_ms(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            run_migrations: true,
        }
    }
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            bot_token: None,
            chat_id: None,
            api_base: default_telegram_api(),
            timeout_secs: default_notify_timeout_secs(),
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval_mins: default_interval_mins(),
            cycle_deadline_secs: default_cycle_deadline_secs(),
        }
    }
}

// ── Loader ───────────────────────────────────────────────────────────────────

impl AppConfig {
    /// Load configuration from file + environment overrides
    pub fn load() -> Result<Self> {
        dotenv::dotenv().ok();

        let cfg = config::Config::builder()
            .add_source(
                config::File::with_name("config/default")
                    .required(false)
                    .format(config::FileFormat::Toml),
            )
            .add_source(
                config::File::with_name("config/local")
                    .required(false)
                    .format(config::FileFormat::Toml),
            )
            .add_source(config::Environment::with_prefix("IPO_ALERT").separator("__"))
            .build()
            .context("Failed to read configuration")?;

        let mut app_cfg: AppConfig = cfg
            .try_deserialize()
            .context("Invalid configuration")?;

        // Plain variable names kept working for existing .env files.
        if app_cfg.notifier.bot_token.is_none() {
            app_cfg.notifier.bot_token = std::env::var("TELEGRAM_BOT_TOKEN").ok();
        }
        if app_cfg.notifier.chat_id.is_none() {
            app_cfg.notifier.chat_id = std::env::var("TELEGRAM_CHAT_ID").ok();
        }

        Ok(app_cfg)
    }
}
