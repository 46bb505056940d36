pub mod browser;
pub mod cleaner;
pub mod http_client;
pub mod parsers;

use crate::config::{AppConfig, FetcherConfig};
use crate::error::{FetchError, ParseError};
use crate::models::{
    AttemptOutcome, FetchAttempt, Fetched, ListingRecord, RawContent, StrategyKind,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::sleep;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tracing::{debug, info, warn};

use self::browser::BrowserStrategy;
use self::cleaner::raw_row_to_listing;
use self::http_client::HttpStrategy;
use self::parsers::parse_raw_rows;

// ── Strategy trait ────────────────────────────────────────────────────────────

/// One technique for retrieving the calendar.
#[async_trait]
pub trait RetrievalStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;
    async fn retrieve(&self) -> Result<RawContent, FetchError>;
}

// ── Block detection ───────────────────────────────────────────────────────────

// Interstitial markers only. Cloudflare also injects its `challenge-platform`
// detection script into pages that already passed, so that path is not one.
const CHALLENGE_SIGNATURES: &[&str] = &[
    "<title>just a moment...</title>",
    "cf-browser-verification",
    "cf_chl_opt",
    "attention required! | cloudflare",
    "enable javascript and cookies to continue",
];

/// Returns the signature that marks `body` as a bot-challenge interstitial.
/// Only the head of large bodies is scanned.
pub fn challenge_signature(body: &str) -> Option<&'static str> {
    let mut end = body.len().min(16 * 1024);
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    let head = body[..end].to_lowercase();
    CHALLENGE_SIGNATURES.iter().copied().find(|sig| head.contains(sig))
}

// ── Retry policy ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub factor_ms: u64,
    pub multiplier: u64,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn from_config(config: &FetcherConfig, max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            factor_ms: config.backoff_factor_ms,
            multiplier: config.backoff_multiplier.max(1),
            max_delay: Duration::from_secs(config.max_backoff_secs),
            jitter: config.jitter,
        }
    }

    /// One delay per retry: `factor * multiplier^n`, capped, optionally jittered.
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        let jittered = self.jitter;
        ExponentialBackoff::from_millis(self.multiplier)
            .factor(self.factor_ms)
            .max_delay(self.max_delay)
            .map(move |d| if jittered { jitter(d) } else { d })
            .take(self.max_attempts.saturating_sub(1) as usize)
    }
}

// ── Page fetcher ──────────────────────────────────────────────────────────────

pub struct PageFetcher {
    primary: Box<dyn RetrievalStrategy>,
    primary_policy: RetryPolicy,
    fallback: Option<(Box<dyn RetrievalStrategy>, RetryPolicy)>,
}

impl PageFetcher {
    pub fn new(primary: Box<dyn RetrievalStrategy>, primary_policy: RetryPolicy) -> Self {
        Self {
            primary,
            primary_policy,
            fallback: None,
        }
    }

    pub fn with_fallback(mut self, fallback: Box<dyn RetrievalStrategy>, policy: RetryPolicy) -> Self {
        self.fallback = Some((fallback, policy));
        self
    }

    /// HTTP primary + headless-browser fallback as configured.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let primary = HttpStrategy::new(&config.source, &config.fetcher)
            .context("Failed to build HTTP strategy")?;
        debug!("Primary endpoint: {}{}", primary.url().host_str().unwrap_or_default(), primary.url().path());
        let mut fetcher = Self::new(
            Box::new(primary),
            RetryPolicy::from_config(&config.fetcher, config.fetcher.primary_attempts),
        );

        if config.fetcher.fallback_enabled {
            fetcher = fetcher.with_fallback(
                Box::new(BrowserStrategy::new(&config.source, &config.fetcher)),
                RetryPolicy::from_config(&config.fetcher, config.fetcher.fallback_attempts),
            );
        }

        Ok(fetcher)
    }

    /// Primary until its budget is spent, then fallback; first success wins.
    pub async fn fetch(&self) -> Result<Fetched, FetchError> {
        let mut attempts = Vec::new();

        let mut last = match Self::run_strategy(&*self.primary, &self.primary_policy, &mut attempts).await {
            Ok(content) => return Ok(Self::fetched(content, StrategyKind::Primary, attempts)),
            Err(e) => e,
        };

        if let Some((fallback, policy)) = &self.fallback {
            warn!(
                "Primary strategy exhausted after {} attempts ({}); switching to fallback",
                self.primary_policy.max_attempts, last
            );
            last = match Self::run_strategy(&**fallback, policy, &mut attempts).await {
                Ok(content) => return Ok(Self::fetched(content, StrategyKind::Fallback, attempts)),
                Err(e) => e,
            };
        }

        Err(FetchError::ExhaustedRetries {
            attempts: attempts.len() as u32,
            last: last.to_string(),
        })
    }

    fn fetched(content: RawContent, strategy: StrategyKind, attempts: Vec<FetchAttempt>) -> Fetched {
        info!(
            "Fetched {} bytes of {} via {} strategy ({} attempts)",
            content.len(),
            content.shape(),
            strategy,
            attempts.len()
        );
        for a in &attempts {
            debug!("  {} attempt {}: {:?}", a.strategy, a.attempt_number, a.outcome);
        }
        Fetched { content, strategy, attempts }
    }

    async fn run_strategy(
        strategy: &dyn RetrievalStrategy,
        policy: &RetryPolicy,
        attempts: &mut Vec<FetchAttempt>,
    ) -> Result<RawContent, FetchError> {
        let kind = strategy.kind();
        let mut delays = policy.delays();
        let mut attempt_number = 0u32;

        loop {
            attempt_number += 1;
            debug!("{} strategy: attempt {}/{}", kind, attempt_number, policy.max_attempts);

            let err = match strategy.retrieve().await {
                Ok(content) => {
                    attempts.push(FetchAttempt {
                        strategy: kind,
                        attempt_number,
                        outcome: AttemptOutcome::Success { bytes: content.len() },
                    });
                    return Ok(content);
                }
                Err(e) => e,
            };

            attempts.push(FetchAttempt {
                strategy: kind,
                attempt_number,
                outcome: match &err {
                    FetchError::Blocked { .. } => AttemptOutcome::Blocked,
                    FetchError::Timeout { .. } => AttemptOutcome::Timeout,
                    _ => AttemptOutcome::NetworkError,
                },
            });

            match delays.next() {
                Some(delay) => {
                    warn!(
                        "{} strategy attempt {}/{} failed ({}: {}); retrying in {:?}",
                        kind,
                        attempt_number,
                        policy.max_attempts,
                        err.kind(),
                        err,
                        delay
                    );
                    sleep(delay).await;
                }
                None => {
                    warn!(
                        "{} strategy attempt {}/{} failed ({}: {}); giving up",
                        kind,
                        attempt_number,
                        policy.max_attempts,
                        err.kind(),
                        err
                    );
                    return Err(err);
                }
            }
        }
    }
}

// ── Listing parser ────────────────────────────────────────────────────────────

pub struct ListingParser {
    default_share_type: String,
}

impl ListingParser {
    pub fn new(default_share_type: impl Into<String>) -> Self {
        Self {
            default_share_type: default_share_type.into(),
        }
    }

    /// Structured listings in source order. Entries without a company are
    /// dropped; a content shape we don't recognise is an error.
    pub fn parse(&self, content: &RawContent) -> Result<Vec<ListingRecord>, ParseError> {
        let rows = parse_raw_rows(content)?;
        let total = rows.len();

        let listings: Vec<ListingRecord> = rows
            .into_iter()
            .filter_map(|row| raw_row_to_listing(row, &self.default_share_type))
            .collect();

        if listings.len() < total {
            warn!("Dropped {} of {} entries without a company name", total - listings.len(), total);
        }
        debug!("Parsed {} listings from {} content", listings.len(), content.shape());
        Ok(listings)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
