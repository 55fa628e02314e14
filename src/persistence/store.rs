//! SQLite-based execution store
//!
//! Records are kept as JSON documents alongside the columns needed for
//! lookups. The pool holds a single connection, so every read-modify-write
//! runs inside a transaction that no other writer can interleave with.

use crate::core::{FailureInfo, NodeBookkeeping, NodeExecution, Plan, PlanExecution, Status};
use crate::persistence::ExecutionStore;
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use uuid::Uuid;

/// SQLite execution store
pub struct SqliteExecutionStore {
    pool: SqlitePool,
}

impl SqliteExecutionStore {
    /// Open (creating if needed) a store at `db_path`; `:memory:` is accepted
    pub async fn new(db_path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path))
            .context("Invalid database path")?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("Failed to connect to database")?;

        let store = Self { pool };
        store.init().await?;

        Ok(store)
    }

    /// Create store with default path
    pub async fn with_default_path() -> Result<Self> {
        let data_dir = dirs::data_local_dir().unwrap_or_else(|| std::path::PathBuf::from("."));
        let db_dir = data_dir.join("orchestrator");
        std::fs::create_dir_all(&db_dir)?;

        let db_path = db_dir.join("executions.db");
        let db_path = db_path
            .to_str()
            .context("Database path is not valid UTF-8")?
            .to_string();
        Self::new(&db_path).await
    }

    /// Initialize database schema
    async fn init(&self) -> Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS plans (
                id TEXT PRIMARY KEY,
                document TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS plan_executions (
                id TEXT PRIMARY KEY,
                plan_id TEXT NOT NULL,
                pipeline_id TEXT NOT NULL,
                account_id TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                document TEXT NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_plan_executions_pipeline ON plan_executions(pipeline_id, status)",
            r#"
            CREATE TABLE IF NOT EXISTS node_executions (
                id TEXT PRIMARY KEY,
                plan_execution_id TEXT NOT NULL,
                setup_id TEXT NOT NULL,
                status TEXT NOT NULL,
                ended INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                document TEXT NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_node_executions_plan ON node_executions(plan_execution_id)",
        ];

        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("Failed to initialize schema")?;
        }

        Ok(())
    }

    /// Convert DateTime<Utc> to NaiveDateTime for SQLite
    fn to_naive(dt: DateTime<Utc>) -> NaiveDateTime {
        dt.naive_utc()
    }

    fn encode<T: Serialize>(value: &T) -> Result<String> {
        serde_json::to_string(value).context("Failed to encode document")
    }

    fn decode<T: DeserializeOwned>(document: &str) -> Result<T> {
        serde_json::from_str(document).context("Failed to decode document")
    }

    async fn write_plan_execution(&self, execution: &PlanExecution) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO plan_executions
            (id, plan_id, pipeline_id, account_id, status, created_at, document)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(execution.id.to_string())
        .bind(&execution.plan_id)
        .bind(&execution.pipeline_id)
        .bind(&execution.account_id)
        .bind(execution.status.as_str())
        .bind(Self::to_naive(execution.created_at))
        .bind(Self::encode(execution)?)
        .execute(&self.pool)
        .await
        .context("Failed to save plan execution")?;
        Ok(())
    }

    /// Read-modify-write a plan execution inside one transaction
    async fn swap_plan_execution<F>(&self, id: Uuid, expected: Status, mutate: F) -> Result<bool>
    where
        F: FnOnce(&mut PlanExecution) + Send,
    {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT status, document FROM plan_executions WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            anyhow::bail!("Plan execution not found: {}", id);
        };
        if row.get::<String, _>("status") != expected.as_str() || expected.is_final() {
            return Ok(false);
        }

        let mut execution: PlanExecution = Self::decode(&row.get::<String, _>("document"))?;
        mutate(&mut execution);

        sqlx::query("UPDATE plan_executions SET status = ?1, document = ?2 WHERE id = ?3 AND status = ?4")
            .bind(execution.status.as_str())
            .bind(Self::encode(&execution)?)
            .bind(id.to_string())
            .bind(expected.as_str())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(true)
    }

    /// Read-modify-write a node execution inside one transaction.
    ///
    /// `expected` of `None` skips the status check (bookkeeping only).
    async fn swap_node_execution<F>(&self, id: Uuid, expected: Option<Status>, mutate: F) -> Result<bool>
    where
        F: FnOnce(&mut NodeExecution) + Send,
    {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT status, ended, document FROM node_executions WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            anyhow::bail!("Node execution not found: {}", id);
        };
        if let Some(expected) = expected {
            let ended = row.get::<i64, _>("ended") != 0;
            if ended || row.get::<String, _>("status") != expected.as_str() {
                return Ok(false);
            }
        }

        let mut node: NodeExecution = Self::decode(&row.get::<String, _>("document"))?;
        mutate(&mut node);

        sqlx::query("UPDATE node_executions SET status = ?1, ended = ?2, document = ?3 WHERE id = ?4")
            .bind(node.status.as_str())
            .bind(node.is_ended() as i64)
            .bind(Self::encode(&node)?)
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(true)
    }

    fn decode_rows<T: DeserializeOwned>(rows: &[sqlx::sqlite::SqliteRow]) -> Result<Vec<T>> {
        rows.iter()
            .map(|row| Self::decode(&row.get::<String, _>("document")))
            .collect()
    }
}

#[async_trait::async_trait]
impl ExecutionStore for SqliteExecutionStore {
    async fn save_plan(&self, plan: &Plan) -> Result<()> {
        sqlx::query("INSERT OR REPLACE INTO plans (id, document) VALUES (?1, ?2)")
            .bind(&plan.id)
            .bind(Self::encode(plan)?)
            .execute(&self.pool)
            .await
            .context("Failed to save plan")?;
        Ok(())
    }

    async fn get_plan(&self, plan_id: &str) -> Result<Option<Plan>> {
        let row = sqlx::query("SELECT document FROM plans WHERE id = ?1")
            .bind(plan_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load plan")?;
        row.map(|row| Self::decode(&row.get::<String, _>("document")))
            .transpose()
    }

    async fn save_plan_execution(&self, execution: &PlanExecution) -> Result<()> {
        self.write_plan_execution(execution).await
    }

    async fn get_plan_execution(&self, id: Uuid) -> Result<Option<PlanExecution>> {
        let row = sqlx::query("SELECT document FROM plan_executions WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load plan execution")?;
        row.map(|row| Self::decode(&row.get::<String, _>("document")))
            .transpose()
    }

    async fn update_plan_status(&self, id: Uuid, expected: Status, new: Status) -> Result<bool> {
        self.swap_plan_execution(id, expected, |execution| {
            execution.status = new;
            if new == Status::Running && execution.start_ts.is_none() {
                execution.start_ts = Some(Utc::now());
            }
        })
        .await
    }

    async fn end_plan_execution(
        &self,
        id: Uuid,
        expected: Status,
        status: Status,
        failure: Option<FailureInfo>,
    ) -> Result<bool> {
        if !status.is_final() {
            anyhow::bail!("Cannot end plan execution {} with non-final status {}", id, status);
        }
        self.swap_plan_execution(id, expected, |execution| {
            execution.status = status;
            execution.end_ts = Some(Utc::now());
            execution.failure = failure;
        })
        .await
    }

    async fn list_plan_executions(&self, pipeline_id: Option<&str>) -> Result<Vec<PlanExecution>> {
        let rows = match pipeline_id {
            Some(pipeline_id) => {
                sqlx::query(
                    "SELECT document FROM plan_executions WHERE pipeline_id = ?1 ORDER BY created_at DESC",
                )
                .bind(pipeline_id)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query("SELECT document FROM plan_executions ORDER BY created_at DESC")
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .context("Failed to list plan executions")?;
        Self::decode_rows(&rows)
    }

    async fn find_running_count(&self, scope_key: &str) -> Result<usize> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS running
            FROM plan_executions
            WHERE pipeline_id = ?1 AND status IN (?2, ?3)
            "#,
        )
        .bind(scope_key)
        .bind(Status::Running.as_str())
        .bind(Status::InterventionWaiting.as_str())
        .fetch_one(&self.pool)
        .await
        .context("Failed to count running executions")?;
        Ok(row.get::<i64, _>("running") as usize)
    }

    async fn list_queued(&self, scope_key: &str) -> Result<Vec<PlanExecution>> {
        let rows = sqlx::query(
            r#"
            SELECT document FROM plan_executions
            WHERE pipeline_id = ?1 AND status = ?2
            ORDER BY created_at ASC
            "#,
        )
        .bind(scope_key)
        .bind(Status::Queued.as_str())
        .fetch_all(&self.pool)
        .await
        .context("Failed to list queued executions")?;
        Self::decode_rows(&rows)
    }

    async fn save_node_execution(&self, node: &NodeExecution) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO node_executions
            (id, plan_execution_id, setup_id, status, ended, created_at, document)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(node.id.to_string())
        .bind(node.plan_execution_id.to_string())
        .bind(&node.setup_id)
        .bind(node.status.as_str())
        .bind(node.is_ended() as i64)
        .bind(Self::to_naive(node.created_at))
        .bind(Self::encode(node)?)
        .execute(&self.pool)
        .await
        .context("Failed to save node execution")?;
        Ok(())
    }

    async fn get_node_execution(&self, id: Uuid) -> Result<Option<NodeExecution>> {
        let row = sqlx::query("SELECT document FROM node_executions WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load node execution")?;
        row.map(|row| Self::decode(&row.get::<String, _>("document")))
            .transpose()
    }

    async fn update_node_status(&self, id: Uuid, expected: Status, new: Status) -> Result<bool> {
        self.swap_node_execution(id, Some(expected), |node| {
            node.status = new;
            if new == Status::Running && node.start_ts.is_none() {
                node.start_ts = Some(Utc::now());
            }
        })
        .await
    }

    async fn end_node_execution(&self, id: Uuid, expected: Status, status: Status) -> Result<bool> {
        if !status.is_final() {
            anyhow::bail!("Cannot end node execution {} with non-final status {}", id, status);
        }
        self.swap_node_execution(id, Some(expected), |node| {
            node.status = status;
            node.end_ts = Some(Utc::now());
        })
        .await
    }

    async fn append_bookkeeping(&self, id: Uuid, entry: NodeBookkeeping) -> Result<()> {
        self.swap_node_execution(id, None, |node| entry.apply(node))
            .await
            .map(|_| ())
    }

    async fn list_children(&self, plan_execution_id: Uuid) -> Result<Vec<NodeExecution>> {
        let rows = sqlx::query(
            "SELECT document FROM node_executions WHERE plan_execution_id = ?1 ORDER BY created_at ASC",
        )
        .bind(plan_execution_id.to_string())
        .fetch_all(&self.pool)
        .await
        .context("Failed to list node executions")?;
        Self::decode_rows(&rows)
    }
}
