use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqlitePoolOptions, FromRow, Pool, Sqlite};
use uuid::Uuid;

use crate::chaos::{ActionKind, Disruption};

pub type DbPool = Pool<Sqlite>;

#[derive(Clone)]
pub struct Database {
    pool: DbPool,
}

#[derive(FromRow)]
struct ActionRow {
    id: String,
    kind: String,
    state: String,
    created_at: String,
}

/// A started action as persisted for crash recovery
#[derive(Debug, Clone, PartialEq)]
pub struct StoredAction {
    pub id: Uuid,
    pub kind: ActionKind,
    pub disruption: Disruption,
    pub created_at: DateTime<Utc>,
}

fn decode<E>(e: E) -> sqlx::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    sqlx::Error::Decode(Box::new(e))
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self> {
        let in_memory = database_url.contains(":memory:");

        // Create database file if it doesn't exist
        let db_path = database_url.trim_start_matches("sqlite://");
        if !in_memory {
            if let Some(parent) = std::path::Path::new(db_path).parent() {
                std::fs::create_dir_all(parent)?;
            }
            if !std::path::Path::new(db_path).exists() {
                std::fs::File::create(db_path)?;
            }
        }

        // Every connection to an in-memory database opens a fresh one
        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 5 })
            .connect(database_url)
            .await?;

        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    // ==================== Actions ====================

    /// Record a started action, or refresh its state if already recorded
    pub async fn save_action(
        &self,
        id: Uuid,
        kind: ActionKind,
        disruption: &Disruption,
    ) -> Result<(), sqlx::Error> {
        let now = Utc::now().to_rfc3339();
        let state = serde_json::to_string(disruption).map_err(decode)?;
        sqlx::query(
            r#"
            INSERT INTO actions (id, kind, state, reverted, created_at, updated_at)
            VALUES (?, ?, ?, 0, ?, ?)
            ON CONFLICT(id) DO UPDATE SET state = excluded.state, updated_at = excluded.updated_at
            "#,
        )
        .bind(id.to_string())
        .bind(kind.to_string())
        .bind(&state)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Mark an action's mutation as undone
    pub async fn mark_reverted(&self, id: Uuid) -> Result<bool, sqlx::Error> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query("UPDATE actions SET reverted = 1, updated_at = ? WHERE id = ?")
            .bind(&now)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Actions whose mutation may still be in place, oldest first
    pub async fn unreverted_actions(&self) -> Result<Vec<StoredAction>, sqlx::Error> {
        let rows: Vec<ActionRow> = sqlx::query_as(
            "SELECT id, kind, state, created_at FROM actions WHERE reverted = 0 ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_action).collect()
    }

    /// Delete reverted actions last updated before `cutoff`
    pub async fn prune_reverted(&self, cutoff: DateTime<Utc>) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM actions WHERE reverted = 1 AND updated_at < ?")
            .bind(cutoff.to_rfc3339())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    fn row_to_action(row: ActionRow) -> Result<StoredAction, sqlx::Error> {
        Ok(StoredAction {
            id: row.id.parse::<Uuid>().map_err(decode)?,
            kind: row.kind.parse::<ActionKind>().map_err(decode)?,
            disruption: serde_json::from_str(&row.state).map_err(decode)?,
            created_at: row.created_at.parse::<DateTime<Utc>>().map_err(decode)?,
        })
    }
}
