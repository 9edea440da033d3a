//! SQLite persistence for the configuration snapshot and the local log.

use anyhow::{Context, Result};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};
use std::str::FromStr;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::warn;

use crate::state::{EventKind, LogEntry};

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Current,
    Backup,
}

impl Slot {
    fn as_str(self) -> &'static str {
        match self {
            Self::Current => "current",
            Self::Backup => "backup",
        }
    }
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/var/lib/hydro-feeder/feeder.db?mode=rwc"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal);

        // every connection to :memory: opens its own empty database
        let max_connections = if db_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Snapshots
    // ----------------------------

    pub async fn save_snapshot(&self, slot: Slot, body: &Value) -> Result<()> {
        let text = serde_json::to_string(body).context("serialising snapshot")?;
        let now = OffsetDateTime::now_utc().unix_timestamp();
        sqlx::query(
            r#"
            INSERT INTO snapshots (slot, body, saved_at) VALUES (?, ?, ?)
            ON CONFLICT(slot) DO UPDATE SET
              body=excluded.body,
              saved_at=excluded.saved_at
            "#,
        )
        .bind(slot.as_str())
        .bind(text)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("save_snapshot failed")?;
        Ok(())
    }

    /// Copy `current` over `backup`. No-op when nothing was saved yet.
    pub async fn backup_snapshot(&self) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO snapshots (slot, body, saved_at)
              SELECT 'backup', body, saved_at FROM snapshots WHERE slot = 'current'
            ON CONFLICT(slot) DO UPDATE SET
              body=excluded.body,
              saved_at=excluded.saved_at
            "#,
        )
        .execute(&self.pool)
        .await
        .context("backup_snapshot failed")?;
        Ok(())
    }

    async fn read_slot(&self, slot: Slot) -> Result<Option<Value>> {
        let row = sqlx::query("SELECT body FROM snapshots WHERE slot = ?")
            .bind(slot.as_str())
            .fetch_optional(&self.pool)
            .await
            .context("reading snapshot failed")?;
        let Some(row) = row else {
            return Ok(None);
        };
        let body: String = row.try_get("body")?;
        let value = serde_json::from_str(&body)
            .with_context(|| format!("snapshot '{}' is not valid JSON", slot.as_str()))?;
        Ok(Some(value))
    }

    /// The saved snapshot, falling back to the backup when the current slot
    /// is missing or unreadable.
    pub async fn load_snapshot(&self) -> Result<Option<Value>> {
        match self.read_slot(Slot::Current).await {
            Ok(Some(v)) => return Ok(Some(v)),
            Ok(None) => {}
            Err(e) => warn!(error = %format!("{e:#}"), "current snapshot unreadable, trying backup"),
        }
        self.read_slot(Slot::Backup).await
    }

    // ----------------------------
    // Local log
    // ----------------------------

    /// Replace the stored log with `entries` (oldest first).
    pub async fn flush_log(&self, entries: &[LogEntry]) -> Result<()> {
        let mut tx = self.pool.begin().await.context("flush_log: begin")?;
        sqlx::query("DELETE FROM log_entries")
            .execute(&mut *tx)
            .await
            .context("flush_log: clear")?;
        for e in entries {
            let time = e.time.format(&Rfc3339).context("formatting log time")?;
            let kind = serde_json::to_value(e.kind)?;
            sqlx::query("INSERT INTO log_entries (time, kind, message) VALUES (?, ?, ?)")
                .bind(time)
                .bind(kind.as_str().unwrap_or("operation"))
                .bind(&e.message)
                .execute(&mut *tx)
                .await
                .context("flush_log: insert")?;
        }
        tx.commit().await.context("flush_log: commit")?;
        Ok(())
    }

    /// Stored log, oldest first. Rows that no longer parse are skipped.
    pub async fn load_log(&self) -> Result<Vec<LogEntry>> {
        let rows = sqlx::query("SELECT time, kind, message FROM log_entries ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .context("load_log failed")?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let time: String = row.try_get("time")?;
            let kind: String = row.try_get("kind")?;
            let message: String = row.try_get("message")?;
            let (Ok(time), Ok(kind)) = (
                OffsetDateTime::parse(&time, &Rfc3339),
                serde_json::from_value::<EventKind>(Value::String(kind)),
            ) else {
                warn!(%time, "skipping unreadable log row");
                continue;
            };
            out.push(LogEntry { time, kind, message });
        }
        Ok(out)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use time::macros::datetime;

    async fn test_db() -> Db {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db
    }

    // -- Snapshots ----------------------------------------------------------

    #[tokio::test]
    async fn empty_database_has_no_snapshot() {
        let db = test_db().await;
        assert!(db.load_snapshot().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_then_load_current() {
        let db = test_db().await;
        db.save_snapshot(Slot::Current, &json!({"maxLogNum": 100}))
            .await
            .unwrap();
        db.save_snapshot(Slot::Current, &json!({"maxLogNum": 200}))
            .await
            .unwrap();
        let v = db.load_snapshot().await.unwrap().unwrap();
        assert_eq!(v["maxLogNum"], 200);
    }

    #[tokio::test]
    async fn backup_used_when_current_is_corrupt() {
        let db = test_db().await;
        db.save_snapshot(Slot::Current, &json!({"maxLogNum": 42}))
            .await
            .unwrap();
        db.backup_snapshot().await.unwrap();

        sqlx::query("UPDATE snapshots SET body = '{not json' WHERE slot = 'current'")
            .execute(&db.pool)
            .await
            .unwrap();

        let v = db.load_snapshot().await.unwrap().unwrap();
        assert_eq!(v["maxLogNum"], 42);
    }

    #[tokio::test]
    async fn backup_without_current_is_noop() {
        let db = test_db().await;
        db.backup_snapshot().await.unwrap();
        assert!(db.load_snapshot().await.unwrap().is_none());
    }

    // -- Log ----------------------------------------------------------------

    #[tokio::test]
    async fn log_flush_replaces_previous_rows() {
        let db = test_db().await;
        let first = vec![LogEntry {
            time: datetime!(2024-05-01 10:00 UTC),
            kind: EventKind::Operation,
            message: "automation on".into(),
        }];
        db.flush_log(&first).await.unwrap();

        let second = vec![
            LogEntry {
                time: datetime!(2024-05-01 11:00 UTC),
                kind: EventKind::Error,
                message: "sensor offline".into(),
            },
            LogEntry {
                time: datetime!(2024-05-01 12:00 UTC),
                kind: EventKind::Note,
                message: "changed filter".into(),
            },
        ];
        db.flush_log(&second).await.unwrap();

        assert_eq!(db.load_log().await.unwrap(), second);
    }
}
