use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::models::{Endpoint, LogStatus, WebhookLog};

const LOG_COLUMNS: &str = "id, endpoint_id, method, headers, body, raw_body, raw_query, ip_address, user_agent, status, created_at";

pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Opens (or creates) the store. `":memory:"` gives a private in-memory store.
    pub async fn connect(path: &str) -> Result<Self> {
        if path == ":memory:" {
            return Self::in_memory().await;
        }

        let db_path = Path::new(path);
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating directory for {path}"))?;
        }

        // Create connection options with concurrency-friendly settings
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePool::connect_with(options).await?;
        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    pub async fn in_memory() -> Result<Self> {
        // Every connection to :memory: is a separate database, so pin exactly one.
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS endpoints (
                id TEXT PRIMARY KEY,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // seq gives a per-insert total order independent of clock resolution
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS webhook_logs (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                endpoint_id TEXT NOT NULL,
                method TEXT NOT NULL,
                headers TEXT NOT NULL,
                body TEXT NOT NULL,
                raw_body BLOB NOT NULL,
                raw_query TEXT,
                ip_address TEXT NOT NULL,
                user_agent TEXT,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY (endpoint_id) REFERENCES endpoints (id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_webhook_logs_endpoint_seq ON webhook_logs (endpoint_id, seq)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_webhook_logs_created_at ON webhook_logs (created_at)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Idempotent: the first caller's timestamp wins.
    pub async fn upsert_endpoint(&self, id: &str, created_at: &str) -> Result<Endpoint> {
        sqlx::query("INSERT INTO endpoints (id, created_at) VALUES (?, ?) ON CONFLICT (id) DO NOTHING")
            .bind(id)
            .bind(created_at)
            .execute(&self.pool)
            .await?;

        let row = sqlx::query("SELECT id, created_at FROM endpoints WHERE id = ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await?;

        Ok(Endpoint {
            id: row.get("id"),
            created_at: row.get("created_at"),
        })
    }

    /// Appends one entry. With `max_entries`, the oldest entries of the same
    /// endpoint beyond the cap are evicted in the same transaction; the number
    /// evicted is returned.
    pub async fn append_log(&self, log: &WebhookLog, max_entries: Option<u32>) -> Result<u64> {
        let headers_json = serde_json::to_string(&log.headers)?;
        let body_json = serde_json::to_string(&log.body)?;

        let mut tx = self.pool.begin().await?;

        sqlx::query("INSERT INTO endpoints (id, created_at) VALUES (?, ?) ON CONFLICT (id) DO NOTHING")
            .bind(&log.endpoint_id)
            .bind(&log.created_at)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO webhook_logs
            (id, endpoint_id, method, headers, body, raw_body, raw_query, ip_address, user_agent, status, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&log.id)
        .bind(&log.endpoint_id)
        .bind(&log.method)
        .bind(headers_json)
        .bind(body_json)
        .bind(&log.raw_body)
        .bind(&log.raw_query)
        .bind(&log.ip_address)
        .bind(&log.user_agent)
        .bind(log.status.as_str())
        .bind(&log.created_at)
        .execute(&mut *tx)
        .await?;

        let mut evicted = 0;
        if let Some(cap) = max_entries {
            evicted = sqlx::query(
                r#"
                DELETE FROM webhook_logs
                WHERE endpoint_id = ?
                  AND seq NOT IN (
                    SELECT seq FROM webhook_logs WHERE endpoint_id = ? ORDER BY seq DESC LIMIT ?
                  )
                "#,
            )
            .bind(&log.endpoint_id)
            .bind(&log.endpoint_id)
            .bind(i64::from(cap))
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }

        tx.commit().await?;

        Ok(evicted)
    }

    /// Newest first.
    pub async fn list_logs(&self, endpoint_id: &str, limit: u32) -> Result<Vec<WebhookLog>> {
        let rows = sqlx::query(&format!(
            "SELECT {LOG_COLUMNS} FROM webhook_logs WHERE endpoint_id = ? ORDER BY seq DESC LIMIT ?"
        ))
        .bind(endpoint_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(decode_log).collect()
    }

    pub async fn get_log(&self, id: &str) -> Result<Option<WebhookLog>> {
        let row = sqlx::query(&format!("SELECT {LOG_COLUMNS} FROM webhook_logs WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(decode_log).transpose()
    }

    pub async fn count_logs(&self, endpoint_id: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM webhook_logs WHERE endpoint_id = ?")
            .bind(endpoint_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }

    /// Single statement, so concurrent readers see all or none of the endpoint's entries.
    pub async fn delete_logs(&self, endpoint_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM webhook_logs WHERE endpoint_id = ?")
            .bind(endpoint_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    /// `cutoff` must use the same RFC 3339 layout as `created_at`.
    pub async fn delete_logs_before(&self, cutoff: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM webhook_logs WHERE created_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

fn decode_log(row: &SqliteRow) -> Result<WebhookLog> {
    let headers = serde_json::from_str(row.get("headers"))?;
    let body = serde_json::from_str(row.get("body"))?;
    let status: String = row.get("status");
    let status = LogStatus::parse(&status)
        .with_context(|| format!("unknown log status '{status}'"))?;

    Ok(WebhookLog {
        id: row.get("id"),
        endpoint_id: row.get("endpoint_id"),
        method: row.get("method"),
        headers,
        body,
        raw_body: row.get("raw_body"),
        raw_query: row.get("raw_query"),
        ip_address: row.get("ip_address"),
        user_agent: row.get("user_agent"),
        status,
        created_at: row.get("created_at"),
    })
}
