use crate::error::StorageError;
use crate::models::{CycleStats, SeenRecord};
use chrono::{NaiveDateTime, Utc};
use duckdb::{params, Connection};
use std::collections::HashSet;
use std::path::Path;
use tracing::info;

// ── Schema ────────────────────────────────────────────────────────────────────

const DDL: &str = r#"
CREATE TABLE IF NOT EXISTS seen_listings (
    identifier     VARCHAR   PRIMARY KEY,
    first_seen_at  TIMESTAMP NOT NULL
);

CREATE SEQUENCE IF NOT EXISTS cycle_run_ids START 1;

CREATE TABLE IF NOT EXISTS cycle_runs (
    id                INTEGER PRIMARY KEY DEFAULT nextval('cycle_run_ids'),
    started_at        TIMESTAMP NOT NULL,
    finished_at       TIMESTAMP,
    status            VARCHAR NOT NULL DEFAULT 'running',
    strategy          VARCHAR,
    listings_fetched  INTEGER DEFAULT 0,
    new_listings      INTEGER DEFAULT 0,
    alerts_sent       INTEGER DEFAULT 0,
    error_msg         VARCHAR
);

CREATE TABLE IF NOT EXISTS schema_version (
    version     INTEGER PRIMARY KEY,
    applied_at  TIMESTAMP NOT NULL
);
"#;

const INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_seen_first_seen ON seen_listings (first_seen_at);
"#;

// ── Record store ──────────────────────────────────────────────────────────────

/// Durable set of identifiers that have already been alerted on.
pub trait RecordStore {
    fn contains(&self, identifier: &str) -> Result<bool, StorageError>;

    /// Idempotent. Returns `true` if the identifier was not present before.
    fn insert(&self, identifier: &str, first_seen_at: NaiveDateTime) -> Result<bool, StorageError>;

    fn all_identifiers(&self) -> Result<HashSet<String>, StorageError>;
}

// ── Repository ────────────────────────────────────────────────────────────────

pub struct Repository {
    conn: Connection,
}

/// Summary row from `cycle_runs`.
#[derive(Debug, Clone)]
pub struct CycleRun {
    pub started_at: NaiveDateTime,
    pub status: String,
    pub strategy: Option<String>,
    pub new_listings: i64,
    pub alerts_sent: i64,
    pub error_msg: Option<String>,
}

impl Repository {
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        Ok(Self { conn: Connection::open_in_memory()? })
    }

    pub fn run_migrations(&self) -> Result<(), StorageError> {
        info!("Running migrations…");
        self.conn.execute_batch(DDL)?;
        self.conn.execute_batch(INDEXES)?;
        self.conn.execute(
            "INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (1, ?)",
            params![Utc::now().naive_utc()],
        )?;
        info!("Migrations done.");
        Ok(())
    }

    // ── Seen listings ─────────────────────────────────────────────────────────

    pub fn seen_records(&self) -> Result<Vec<SeenRecord>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT identifier, first_seen_at FROM seen_listings ORDER BY first_seen_at, identifier",
        )?;
        let rows = stmt.query_map([], |r| {
            Ok(SeenRecord {
                identifier: r.get(0)?,
                first_seen_at: r.get(1)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn seen_count(&self) -> Result<i64, StorageError> {
        let mut s = self.conn.prepare("SELECT COUNT(*) FROM seen_listings")?;
        Ok(s.query_row([], |r| r.get(0))?)
    }

    pub fn seen_range(&self) -> Result<(Option<NaiveDateTime>, Option<NaiveDateTime>), StorageError> {
        let mut s = self
            .conn
            .prepare("SELECT MIN(first_seen_at), MAX(first_seen_at) FROM seen_listings")?;
        Ok(s.query_row([], |r| Ok((r.get(0)?, r.get(1)?)))?)
    }

    // ── Cycle run log ─────────────────────────────────────────────────────────

    pub fn begin_cycle_run(&self) -> Result<i64, StorageError> {
        let id: i64 = self.conn.query_row(
            "INSERT INTO cycle_runs (started_at, status) VALUES (?, 'running') RETURNING id",
            params![Utc::now().naive_utc()],
            |r| r.get(0),
        )?;
        Ok(id)
    }

    pub fn finish_cycle_run(
        &self,
        run_id: i64,
        stats: &CycleStats,
        error: Option<&str>,
    ) -> Result<(), StorageError> {
        let updated = self.conn.execute(
            r#"UPDATE cycle_runs SET
               finished_at = ?, status = ?, strategy = ?,
               listings_fetched = ?, new_listings = ?, alerts_sent = ?, error_msg = ?
               WHERE id = ?"#,
            params![
                Utc::now().naive_utc(),
                if error.is_none() { "success" } else { "error" },
                stats.strategy.map(|s| s.to_string()),
                stats.fetched as i64,
                stats.new as i64,
                stats.notified as i64,
                error,
                run_id,
            ],
        )?;
        if updated == 0 {
            return Err(StorageError::Unavailable(format!("no cycle run with id {}", run_id)));
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn last_cycle(&self) -> Result<Option<CycleRun>, StorageError> {
        let mut stmt = self.conn.prepare(
            r#"SELECT started_at, status, strategy, new_listings, alerts_sent, error_msg
               FROM cycle_runs ORDER BY id DESC LIMIT 1"#,
        )?;
        let mut rows = stmt.query_map([], |r| {
            Ok(CycleRun {
                started_at: r.get(0)?,
                status: r.get(1)?,
                strategy: r.get(2)?,
                new_listings: r.get::<_, Option<i64>>(3)?.unwrap_or(0),
                alerts_sent: r.get::<_, Option<i64>>(4)?.unwrap_or(0),
                error_msg: r.get(5)?,
            })
        })?;
        Ok(rows.next().transpose()?)
    }
}

impl RecordStore for Repository {
    fn contains(&self, identifier: &str) -> Result<bool, StorageError> {
        let mut s = self
            .conn
            .prepare("SELECT COUNT(*) FROM seen_listings WHERE identifier = ?")?;
        let n: i64 = s.query_row(params![identifier], |r| r.get(0))?;
        Ok(n > 0)
    }

    fn insert(&self, identifier: &str, first_seen_at: NaiveDateTime) -> Result<bool, StorageError> {
        let n = self.conn.execute(
            r#"INSERT INTO seen_listings (identifier, first_seen_at)
               VALUES (?, ?)
               ON CONFLICT (identifier) DO NOTHING"#,
            params![identifier, first_seen_at],
        )?;
        Ok(n > 0)
    }

    fn all_identifiers(&self) -> Result<HashSet<String>, StorageError> {
        let mut stmt = self.conn.prepare("SELECT identifier FROM seen_listings")?;
        let ids = stmt
            .query_map([], |r| r.get::<_, String>(0))?
            .collect::<Result<HashSet<_>, _>>()?;
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StrategyKind;

    fn repo() -> Repository {
        let repo = Repository::open_in_memory().unwrap();
        repo.run_migrations().unwrap();
        repo
    }

    fn ts(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    #[test]
    fn test_insert_is_idempotent() {
        let repo = repo();
        assert!(repo.insert("ABC-2024-01-01", ts("2024-01-01 10:00:00")).unwrap());
        assert!(!repo.insert("ABC-2024-01-01", ts("2024-03-01 10:00:00")).unwrap());

        let seen = repo.seen_records().unwrap();
        assert_eq!(seen.len(), 1);
        // First observation wins.
        assert_eq!(seen[0].first_seen_at, ts("2024-01-01 10:00:00"));
    }

    #[test]
    fn test_membership() {
        let repo = repo();
        repo.insert("ABC-2024-01-01", ts("2024-01-01 10:00:00")).unwrap();
        repo.insert("XYZ-2024-02-01", ts("2024-02-01 10:00:00")).unwrap();

        assert!(repo.contains("ABC-2024-01-01").unwrap());
        assert!(!repo.contains("QRS-2024-01-01").unwrap());

        let all = repo.all_identifiers().unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.contains("XYZ-2024-02-01"));
        assert_eq!(repo.seen_count().unwrap(), 2);
        assert_eq!(
            repo.seen_range().unwrap(),
            (Some(ts("2024-01-01 10:00:00")), Some(ts("2024-02-01 10:00:00")))
        );
    }

    #[test]
    fn test_migrations_rerun_cleanly() {
        let repo = repo();
        repo.run_migrations().unwrap();
        assert_eq!(repo.seen_count().unwrap(), 0);
    }

    #[test]
    fn test_cycle_run_log() {
        let repo = repo();
        assert!(repo.last_cycle().unwrap().is_none());

        let id = repo.begin_cycle_run().unwrap();
        let stats = CycleStats {
            strategy: Some(StrategyKind::Fallback),
            fetched: 4,
            new: 1,
            notified: 1,
            ..Default::default()
        };
        repo.finish_cycle_run(id, &stats, None).unwrap();

        let last = repo.last_cycle().unwrap().unwrap();
        assert_eq!(last.status, "success");
        assert_eq!(last.strategy.as_deref(), Some("fallback"));
        assert_eq!(last.alerts_sent, 1);
        assert!(last.error_msg.is_none());
    }

    #[test]
    fn test_finishing_unknown_cycle_run_is_an_error() {
        let repo = repo();
        let err = repo.finish_cycle_run(42, &CycleStats::default(), None).unwrap_err();
        assert!(matches!(err, StorageError::Unavailable(ref m) if m.contains("42")));
    }
}
