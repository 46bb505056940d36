//! Cycle orchestrator: ties fetcher → parser → store → notifier together.
//!
//! ## Cycle
//!
//! 1. Fetch the calendar (primary, then fallback)
//! 2. Parse listings
//! 3. Read every seen identifier in one query, diff
//! 4. For each new listing: send the alert, and only then mark it seen
//!
//! Steps 1-3 failing aborts the cycle before anything is sent. A failed alert
//! leaves its listing unmarked so the next cycle retries it.
//!
//! `watch()` runs a cycle immediately and then every `schedule.interval_mins`.
//! Cycles run back to back on one task, so two never overlap.

pub mod diff;

use crate::config::AppConfig;
use crate::error::CycleError;
use crate::models::{CycleStats, StrategyKind};
use crate::notify::{MessageFormatter, Notifier, TelegramNotifier};
use crate::scraper::{ListingParser, PageFetcher};
use crate::storage::{RecordStore, Repository};
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use std::time::Duration;
use tokio::time::{timeout, MissedTickBehavior};
use tracing::{error, info, warn};

use self::diff::{diff, Diff};

// ── Cycle ─────────────────────────────────────────────────────────────────────

pub struct Cycle<'a> {
    pub fetcher: &'a PageFetcher,
    pub parser: &'a ListingParser,
    pub store: &'a dyn RecordStore,
}

#[derive(Debug)]
pub struct Collected {
    pub strategy: StrategyKind,
    pub fetched: usize,
    pub diff: Diff,
}

impl Cycle<'_> {
    /// Fetch, parse and diff. No side effects.
    pub async fn collect(&self) -> Result<Collected, CycleError> {
        let fetched = self.fetcher.fetch().await?;
        let listings = self.parser.parse(&fetched.content)?;
        let total = listings.len();

        let seen = self.store.all_identifiers()?;
        let diff = diff(listings, &seen);
        info!(
            "{} listings via {} ({} fetch attempts): {} new, {} already seen ({} identifiers on record)",
            total,
            fetched.strategy,
            fetched.attempts.len(),
            diff.new.len(),
            diff.known.len(),
            seen.len()
        );

        Ok(Collected {
            strategy: fetched.strategy,
            fetched: total,
            diff,
        })
    }

    /// Full cycle: alert on every new listing, marking each seen once delivered.
    pub async fn run(
        &self,
        notifier: &dyn Notifier,
        formatter: &MessageFormatter,
    ) -> Result<CycleStats, CycleError> {
        let Collected { strategy, fetched, diff } = self.collect().await?;

        let mut stats = CycleStats {
            strategy: Some(strategy),
            fetched,
            known: diff.known.len(),
            new: diff.new.len(),
            ..Default::default()
        };

        for listing in &diff.new {
            let message = formatter.format(listing);

            if let Err(e) = notifier.send(&message).await {
                warn!("{}: alert not delivered, will retry next cycle: {}", listing.identifier, e);
                stats.notify_failures += 1;
                continue;
            }
            stats.notified += 1;
            info!("{}: alert sent", listing.identifier);

            // The alert is out; a failed insert only risks a repeat next cycle.
            if let Err(e) = self.store.insert(&listing.identifier, Utc::now().naive_utc()) {
                warn!("{}: alert sent but not recorded as seen: {}", listing.identifier, e);
                stats.persist_failures += 1;
            }
        }

        Ok(stats)
    }

    /// Record every current listing as seen without alerting.
    pub async fn prime(&self) -> Result<usize, CycleError> {
        let collected = self.collect().await?;
        let now = Utc::now().naive_utc();

        let mut inserted = 0;
        for listing in &collected.diff.new {
            if self.store.insert(&listing.identifier, now)? {
                inserted += 1;
            }
        }
        Ok(inserted)
    }
}

// ── Pipeline ──────────────────────────────────────────────────────────────────

pub struct Pipeline {
    config: AppConfig,
}

impl Pipeline {
    pub fn new(config: AppConfig) -> Self {
        Self { config }
    }

    fn open_repo(&self) -> Result<Repository> {
        let repo = Repository::open(&self.config.storage.db_path)
            .with_context(|| format!("Failed to open DuckDB at {:?}", self.config.storage.db_path))?;
        if self.config.storage.run_migrations {
            repo.run_migrations()?;
        }
        Ok(repo)
    }

    fn parser(&self) -> ListingParser {
        ListingParser::new(&self.config.source.default_share_type)
    }

    fn deadline(&self) -> Duration {
        Duration::from_secs(self.config.schedule.cycle_deadline_secs.max(1))
    }

    /// One full cycle against Telegram.
    pub async fn run(&self) -> Result<CycleStats> {
        let notifier = TelegramNotifier::from_config(&self.config.notifier)?;
        let fetcher = PageFetcher::from_config(&self.config)?;
        self.run_with(&fetcher, &notifier).await
    }

    /// One cycle with the given collaborators, bounded by the cycle deadline
    /// and logged to `cycle_runs`.
    pub async fn run_with(&self, fetcher: &PageFetcher, notifier: &dyn Notifier) -> Result<CycleStats> {
        let repo = self.open_repo()?;
        self.run_audited(&repo, fetcher, notifier).await
    }

    /// Audit-row failures are logged and never fail the cycle.
    async fn run_audited(
        &self,
        repo: &Repository,
        fetcher: &PageFetcher,
        notifier: &dyn Notifier,
    ) -> Result<CycleStats> {
        let parser = self.parser();
        let formatter = MessageFormatter::new(&self.config.source.currency);
        let run_id = repo
            .begin_cycle_run()
            .map_err(|e| warn!("Cycle audit row not started: {}", e))
            .ok();

        let cycle = Cycle {
            fetcher,
            parser: &parser,
            store: repo,
        };

        let outcome = match timeout(self.deadline(), cycle.run(notifier, &formatter)).await {
            Ok(Ok(stats)) => Ok(stats),
            Ok(Err(e)) => Err(anyhow!(e)),
            Err(_) => Err(anyhow!("cycle abandoned after {:?} deadline", self.deadline())),
        };

        if let Some(id) = run_id {
            let (stats, err) = match &outcome {
                Ok(stats) => (stats.clone(), None),
                Err(e) => (CycleStats::default(), Some(format!("{:#}", e))),
            };
            if let Err(e) = repo.finish_cycle_run(id, &stats, err.as_deref()) {
                warn!("Cycle audit row {} not finished: {}", id, e);
            }
        }

        let stats = outcome?;
        info!(
            "=== Cycle done via {}: {} fetched | {} new | {} alerted | {} failed alerts | {} unrecorded ===",
            stats.strategy.map(|s| s.to_string()).unwrap_or_default(),
            stats.fetched,
            stats.new,
            stats.notified,
            stats.notify_failures,
            stats.persist_failures,
        );
        Ok(stats)
    }

    /// What the next cycle would alert on. Sends nothing, records nothing.
    pub async fn preview(&self) -> Result<Diff> {
        let repo = self.open_repo()?;
        let fetcher = PageFetcher::from_config(&self.config)?;
        let parser = self.parser();
        let cycle = Cycle {
            fetcher: &fetcher,
            parser: &parser,
            store: &repo,
        };
        Ok(cycle.collect().await?.diff)
    }

    /// Mark everything currently listed as seen, for a first deployment that
    /// should not announce the existing backlog.
    pub async fn prime(&self) -> Result<usize> {
        let repo = self.open_repo()?;
        let fetcher = PageFetcher::from_config(&self.config)?;
        let parser = self.parser();
        let cycle = Cycle {
            fetcher: &fetcher,
            parser: &parser,
            store: &repo,
        };
        Ok(cycle.prime().await?)
    }

    /// Poll forever. A failing cycle is logged and the loop carries on;
    /// Ctrl-C stops the loop once the current cycle has finished.
    pub async fn watch(&self) -> Result<()> {
        let notifier = TelegramNotifier::from_config(&self.config.notifier)?;
        let fetcher = PageFetcher::from_config(&self.config)?;

        let period = Duration::from_secs(self.config.schedule.interval_mins.max(1) * 60);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);

        info!("Watching every {:?} (cycle deadline {:?})", period, self.deadline());

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested, leaving watch loop");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.run_with(&fetcher, &notifier).await {
                        error!("Cycle failed: {:#}. Next attempt in {:?}", e, period);
                    }
                }
            }
        }

        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{FetchError, NotifyError, StorageError};
    use crate::models::RawContent;
    use crate::scraper::tests::{instant_policy, ScriptedStrategy};
    use async_trait::async_trait;
    use chrono::NaiveDateTime;
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};

    const CALENDAR: &str = r#"{"data":[
        {"symbol":"ABC","company_name":"ABC","opening_date":"2024-01-01","closing_date":"2024-01-04","price":100},
        {"symbol":"XYZ","company_name":"XYZ","opening_date":"2024-02-01","closing_date":"2024-02-05","price":100}
    ]}"#;

    #[derive(Default)]
    struct FakeNotifier {
        sent: Mutex<Vec<String>>,
        fail_containing: Option<String>,
    }

    impl FakeNotifier {
        fn failing_for(needle: &str) -> Self {
            Self {
                fail_containing: Some(needle.to_string()),
                ..Default::default()
            }
        }

        fn sent(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Notifier for FakeNotifier {
        async fn send(&self, message: &str) -> Result<(), NotifyError> {
            if let Some(needle) = &self.fail_containing {
                if message.contains(needle.as_str()) {
                    return Err(NotifyError::DeliveryFailed("HTTP 500".into()));
                }
            }
            self.sent.lock().unwrap().push(message.to_string());
            Ok(())
        }
    }

    /// Store whose reads or writes can be made to fail.
    struct FlakyStore {
        inner: Repository,
        fail_reads: bool,
        fail_writes: bool,
    }

    impl RecordStore for FlakyStore {
        fn contains(&self, identifier: &str) -> Result<bool, StorageError> {
            self.inner.contains(identifier)
        }

        fn insert(&self, identifier: &str, first_seen_at: NaiveDateTime) -> Result<bool, StorageError> {
            if self.fail_writes {
                return Err(StorageError::Unavailable("disk full".into()));
            }
            self.inner.insert(identifier, first_seen_at)
        }

        fn all_identifiers(&self) -> Result<HashSet<String>, StorageError> {
            if self.fail_reads {
                return Err(StorageError::Unavailable("database locked".into()));
            }
            self.inner.all_identifiers()
        }
    }

    fn repo() -> Repository {
        let repo = Repository::open_in_memory().unwrap();
        repo.run_migrations().unwrap();
        repo
    }

    fn fetcher_returning(content: Result<RawContent, FetchError>) -> PageFetcher {
        let calls = Arc::new(Mutex::new(Vec::new()));
        PageFetcher::new(
            Box::new(ScriptedStrategy::new(StrategyKind::Primary, vec![content], calls)),
            instant_policy(1),
        )
    }

    fn calendar_fetcher() -> PageFetcher {
        fetcher_returning(Ok(RawContent::Json(CALENDAR.to_string())))
    }

    fn ts() -> NaiveDateTime {
        Utc::now().naive_utc()
    }

    #[tokio::test]
    async fn test_known_and_new_scenario() {
        let store = repo();
        store.insert("ABC-2024-01-01", ts()).unwrap();

        let fetcher = calendar_fetcher();
        let parser = ListingParser::new("IPO");
        let notifier = FakeNotifier::default();
        let cycle = Cycle { fetcher: &fetcher, parser: &parser, store: &store };

        let stats = cycle.run(&notifier, &MessageFormatter::new("NPR")).await.unwrap();

        assert_eq!(stats.new, 1);
        assert_eq!(stats.known, 1);
        assert_eq!(stats.notified, 1);
        let sent = notifier.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("*Company:* XYZ"));

        let all = store.all_identifiers().unwrap();
        assert!(all.contains("ABC-2024-01-01"));
        assert!(all.contains("XYZ-2024-02-01"));
    }

    #[tokio::test]
    async fn test_unchanged_source_alerts_once() {
        let store = repo();
        let fetcher = calendar_fetcher();
        let parser = ListingParser::new("IPO");
        let notifier = FakeNotifier::default();
        let formatter = MessageFormatter::new("NPR");
        let cycle = Cycle { fetcher: &fetcher, parser: &parser, store: &store };

        let first = cycle.run(&notifier, &formatter).await.unwrap();
        let second = cycle.run(&notifier, &formatter).await.unwrap();
        let third = cycle.run(&notifier, &formatter).await.unwrap();

        assert_eq!(first.notified, 2);
        assert_eq!(second.notified, 0);
        assert_eq!(third.known, 2);
        assert_eq!(notifier.sent().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_alert_is_retried_next_cycle() {
        let store = repo();
        let fetcher = calendar_fetcher();
        let parser = ListingParser::new("IPO");
        let formatter = MessageFormatter::new("NPR");
        let cycle = Cycle { fetcher: &fetcher, parser: &parser, store: &store };

        let flaky = FakeNotifier::failing_for("XYZ");
        let stats = cycle.run(&flaky, &formatter).await.unwrap();
        assert_eq!(stats.notified, 1);
        assert_eq!(stats.notify_failures, 1);
        assert!(store.contains("ABC-2024-01-01").unwrap());
        assert!(!store.contains("XYZ-2024-02-01").unwrap());

        let healthy = FakeNotifier::default();
        let collected = cycle.collect().await.unwrap();
        assert_eq!(collected.diff.new.len(), 1);
        assert_eq!(collected.diff.new[0].identifier, "XYZ-2024-02-01");

        let stats = cycle.run(&healthy, &formatter).await.unwrap();
        assert_eq!(stats.notified, 1);
        assert!(store.contains("XYZ-2024-02-01").unwrap());
    }

    #[tokio::test]
    async fn test_storage_read_failure_aborts_before_alerting() {
        let store = FlakyStore { inner: repo(), fail_reads: true, fail_writes: false };
        let fetcher = calendar_fetcher();
        let parser = ListingParser::new("IPO");
        let notifier = FakeNotifier::default();
        let cycle = Cycle { fetcher: &fetcher, parser: &parser, store: &store };

        let err = cycle.run(&notifier, &MessageFormatter::new("NPR")).await.unwrap_err();
        assert!(matches!(err, CycleError::Storage(_)));
        assert!(notifier.sent().is_empty());
    }

    #[tokio::test]
    async fn test_insert_failure_after_alert_is_not_fatal() {
        let store = FlakyStore { inner: repo(), fail_reads: false, fail_writes: true };
        let fetcher = calendar_fetcher();
        let parser = ListingParser::new("IPO");
        let notifier = FakeNotifier::default();
        let cycle = Cycle { fetcher: &fetcher, parser: &parser, store: &store };

        let stats = cycle.run(&notifier, &MessageFormatter::new("NPR")).await.unwrap();
        assert_eq!(stats.notified, 2);
        assert_eq!(stats.persist_failures, 2);
    }

    #[tokio::test]
    async fn test_fetch_failure_aborts_cycle() {
        let store = repo();
        let fetcher = fetcher_returning(Err(FetchError::blocked(StrategyKind::Primary, "HTTP 403")));
        let parser = ListingParser::new("IPO");
        let notifier = FakeNotifier::default();
        let cycle = Cycle { fetcher: &fetcher, parser: &parser, store: &store };

        let err = cycle.run(&notifier, &MessageFormatter::new("NPR")).await.unwrap_err();
        assert!(matches!(err, CycleError::Fetch(FetchError::ExhaustedRetries { .. })));
        assert!(notifier.sent().is_empty());
        assert_eq!(store.seen_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_schema_change_aborts_cycle() {
        let store = repo();
        let fetcher = fetcher_returning(Ok(RawContent::Json(r#"{"rows": []}"#.to_string())));
        let parser = ListingParser::new("IPO");
        let notifier = FakeNotifier::default();
        let cycle = Cycle { fetcher: &fetcher, parser: &parser, store: &store };

        let err = cycle.run(&notifier, &MessageFormatter::new("NPR")).await.unwrap_err();
        assert!(matches!(err, CycleError::Parse(_)));
        assert!(notifier.sent().is_empty());
    }

    #[tokio::test]
    async fn test_prime_then_run_sends_nothing() {
        let store = repo();
        let fetcher = calendar_fetcher();
        let parser = ListingParser::new("IPO");
        let notifier = FakeNotifier::default();
        let cycle = Cycle { fetcher: &fetcher, parser: &parser, store: &store };

        assert_eq!(cycle.prime().await.unwrap(), 2);
        assert_eq!(cycle.prime().await.unwrap(), 0);

        let stats = cycle.run(&notifier, &MessageFormatter::new("NPR")).await.unwrap();
        assert_eq!(stats.new, 0);
        assert!(notifier.sent().is_empty());
    }

    #[tokio::test]
    async fn test_audit_failure_does_not_fail_cycle() {
        let store = repo();
        store.conn().execute_batch("DROP TABLE cycle_runs").unwrap();
        let pipeline = Pipeline::new(AppConfig::default());
        let notifier = FakeNotifier::default();

        let stats = pipeline
            .run_audited(&store, &calendar_fetcher(), &notifier)
            .await
            .unwrap();
        assert_eq!(stats.notified, 2);
        assert!(store.contains("ABC-2024-01-01").unwrap());
    }

    #[test]
    fn test_run_with_records_cycle_and_respects_store_on_disk() {
        let dir = std::env::temp_dir().join(format!("ipo_alert_test_{}", std::process::id()));
        let mut config = AppConfig::default();
        config.storage.db_path = dir.join("alerts.duckdb");
        let pipeline = Pipeline::new(config);

        let fetcher = calendar_fetcher();
        let notifier = FakeNotifier::default();

        let stats = tokio_test::block_on(pipeline.run_with(&fetcher, &notifier)).unwrap();
        assert_eq!(stats.notified, 2);

        let again = tokio_test::block_on(pipeline.run_with(&fetcher, &notifier)).unwrap();
        assert_eq!(again.notified, 0);

        let repo = pipeline.open_repo().unwrap();
        let last = repo.last_cycle().unwrap().unwrap();
        assert_eq!(last.status, "success");
        assert_eq!(last.strategy.as_deref(), Some("primary"));
        drop(repo);

        std::fs::remove_dir_all(&dir).ok();
    }
}
