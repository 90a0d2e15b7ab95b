//! SQLite-backed state store.
//!
//! Records are serialized whole into a `body` column next to the few
//! denormalized columns queries filter on. This keeps the schema stable
//! while the record types evolve.

use crate::{RouteDecisionRecord, StateError, StateStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use foreman_protocol::{
    Job, JobId, Request, RequestId, ResultId, StoredResult, WorkerDescriptor, WorkerId,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};
use std::path::Path;
use tracing::info;

pub struct SqliteStateStore {
    pool: Pool<Sqlite>,
}

impl SqliteStateStore {
    pub async fn open(path: &Path) -> Result<Self, StateError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.init().await?;
        info!(path = %path.display(), "sqlite state store ready");
        Ok(store)
    }

    async fn init(&self) -> Result<(), StateError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS fm_workers (
                id TEXT PRIMARY KEY,
                body TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS fm_requests (
                id TEXT PRIMARY KEY,
                owner TEXT NOT NULL,
                state TEXT NOT NULL,
                created_at TEXT NOT NULL,
                body TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS fm_jobs (
                id TEXT PRIMARY KEY,
                request_id TEXT NOT NULL,
                state TEXT NOT NULL,
                created_at TEXT NOT NULL,
                body TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_fm_jobs_request ON fm_jobs (request_id)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_fm_jobs_state ON fm_jobs (state)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS fm_results (
                owner TEXT NOT NULL,
                id TEXT NOT NULL,
                request_id TEXT NOT NULL,
                created_at TEXT NOT NULL,
                body TEXT NOT NULL,
                PRIMARY KEY (owner, id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_fm_results_owner_created ON fm_results (owner, created_at DESC)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS fm_route_decisions (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                request_id TEXT NOT NULL,
                worker_id TEXT NOT NULL,
                total_score REAL NOT NULL,
                breakdown TEXT NOT NULL,
                decided_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn parse_body<T: serde::de::DeserializeOwned>(body: String) -> Result<T, StateError> {
    serde_json::from_str(&body).map_err(StateError::from)
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn upsert_worker(&self, descriptor: &WorkerDescriptor) -> Result<(), StateError> {
        let body = serde_json::to_string(descriptor)?;
        sqlx::query(
            r#"
            INSERT INTO fm_workers (id, body) VALUES (?, ?)
            ON CONFLICT (id) DO UPDATE SET body = excluded.body
            "#,
        )
        .bind(descriptor.id.as_str())
        .bind(body)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove_worker(&self, id: &WorkerId) -> Result<(), StateError> {
        sqlx::query("DELETE FROM fm_workers WHERE id = ?")
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn load_workers(&self) -> Result<Vec<WorkerDescriptor>, StateError> {
        let rows = sqlx::query("SELECT body FROM fm_workers ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| parse_body(row.get::<String, _>("body")))
            .collect()
    }

    async fn upsert_request(&self, request: &Request) -> Result<(), StateError> {
        let body = serde_json::to_string(request)?;
        sqlx::query(
            r#"
            INSERT INTO fm_requests (id, owner, state, created_at, body)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                state = excluded.state,
                body = excluded.body
            "#,
        )
        .bind(request.id.as_str())
        .bind(&request.owner)
        .bind(request.state.as_str())
        .bind(request.created_at.to_rfc3339())
        .bind(body)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_request(&self, id: &RequestId) -> Result<Option<Request>, StateError> {
        let row = sqlx::query("SELECT body FROM fm_requests WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| parse_body(row.get::<String, _>("body")))
            .transpose()
    }

    async fn upsert_job(&self, job: &Job) -> Result<(), StateError> {
        let body = serde_json::to_string(job)?;
        sqlx::query(
            r#"
            INSERT INTO fm_jobs (id, request_id, state, created_at, body)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                state = excluded.state,
                body = excluded.body
            "#,
        )
        .bind(job.id.as_str())
        .bind(job.request_id.as_str())
        .bind(job.state.as_str())
        .bind(job.created_at.to_rfc3339())
        .bind(body)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_job(&self, id: &JobId) -> Result<Option<Job>, StateError> {
        let row = sqlx::query("SELECT body FROM fm_jobs WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| parse_body(row.get::<String, _>("body")))
            .transpose()
    }

    async fn jobs_for_request(&self, request_id: &RequestId) -> Result<Vec<Job>, StateError> {
        let rows = sqlx::query(
            "SELECT body FROM fm_jobs WHERE request_id = ? ORDER BY created_at ASC",
        )
        .bind(request_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| parse_body(row.get::<String, _>("body")))
            .collect()
    }

    async fn active_jobs(&self) -> Result<Vec<Job>, StateError> {
        let rows = sqlx::query(
            r#"
            SELECT body FROM fm_jobs
            WHERE state IN ('queued', 'running')
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| parse_body(row.get::<String, _>("body")))
            .collect()
    }

    async fn put_result(&self, result: &StoredResult) -> Result<(), StateError> {
        let body = serde_json::to_string(result)?;
        sqlx::query(
            r#"
            INSERT INTO fm_results (owner, id, request_id, created_at, body)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (owner, id) DO UPDATE SET body = excluded.body
            "#,
        )
        .bind(&result.owner)
        .bind(result.id.as_str())
        .bind(result.request_id.as_str())
        .bind(result.created_at.to_rfc3339())
        .bind(body)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_result(
        &self,
        owner: &str,
        id: &ResultId,
    ) -> Result<Option<StoredResult>, StateError> {
        let row = sqlx::query("SELECT body FROM fm_results WHERE owner = ? AND id = ?")
            .bind(owner)
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| parse_body(row.get::<String, _>("body")))
            .transpose()
    }

    async fn delete_result(&self, owner: &str, id: &ResultId) -> Result<bool, StateError> {
        let rows_affected = sqlx::query("DELETE FROM fm_results WHERE owner = ? AND id = ?")
            .bind(owner)
            .bind(id.as_str())
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(rows_affected > 0)
    }

    async fn list_results(
        &self,
        owner: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<StoredResult>, StateError> {
        let rows = sqlx::query(
            r#"
            SELECT body FROM fm_results
            WHERE owner = ?
            ORDER BY created_at DESC, id DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(owner)
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| parse_body(row.get::<String, _>("body")))
            .collect()
    }

    async fn expire_results(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<StoredResult>, StateError> {
        let cutoff = cutoff.to_rfc3339();
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query("SELECT body FROM fm_results WHERE created_at < ?")
            .bind(&cutoff)
            .fetch_all(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM fm_results WHERE created_at < ?")
            .bind(&cutoff)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        rows.into_iter()
            .map(|row| parse_body(row.get::<String, _>("body")))
            .collect()
    }

    async fn append_decision(&self, record: &RouteDecisionRecord) -> Result<(), StateError> {
        sqlx::query(
            r#"
            INSERT INTO fm_route_decisions
                (request_id, worker_id, total_score, breakdown, decided_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.request_id.as_str())
        .bind(record.worker_id.as_str())
        .bind(record.total_score)
        .bind(&record.breakdown_json)
        .bind(record.decided_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recent_decisions(
        &self,
        limit: usize,
    ) -> Result<Vec<RouteDecisionRecord>, StateError> {
        let rows = sqlx::query(
            r#"
            SELECT request_id, worker_id, total_score, breakdown, decided_at
            FROM fm_route_decisions
            ORDER BY seq DESC
            LIMIT ?
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let request_id = RequestId::parse(&row.get::<String, _>("request_id"))
                .map_err(|e| StateError::Backend(e.to_string()))?;
            let decided_at = DateTime::parse_from_rfc3339(&row.get::<String, _>("decided_at"))
                .map_err(|e| StateError::Backend(e.to_string()))?
                .with_timezone(&Utc);
            records.push(RouteDecisionRecord {
                request_id,
                worker_id: WorkerId::from(row.get::<String, _>("worker_id")),
                total_score: row.get::<f64, _>("total_score"),
                breakdown_json: row.get::<String, _>("breakdown"),
                decided_at,
            });
        }
        records.reverse();
        Ok(records)
    }
}
