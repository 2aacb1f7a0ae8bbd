use super::database::Database;
use crate::domain::command::CommandOutcome;
use crate::domain::strategy::StrategyDefinition;
use crate::infrastructure::control::ExecutorCredential;
use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::Row;
use std::collections::HashSet;

/// Journal rows kept after each trim.
const JOURNAL_CAP: i64 = 10_000;

/// Single-row store for the executor credential.
pub struct CredentialRepository {
    db: Database,
}

impl CredentialRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn load(&self) -> Result<Option<ExecutorCredential>> {
        let row = sqlx::query(
            "SELECT executor_id, api_key, secret_key FROM executor_credential WHERE id = 1",
        )
        .fetch_optional(&self.db.pool)
        .await
        .context("Failed to load executor credential")?;

        Ok(row.map(|row| ExecutorCredential {
            executor_id: row.get("executor_id"),
            api_key: row.get("api_key"),
            secret_key: row.get("secret_key"),
        }))
    }

    pub async fn save(&self, credential: &ExecutorCredential) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO executor_credential (id, executor_id, api_key, secret_key, created_at)
            VALUES (1, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                executor_id = excluded.executor_id,
                api_key = excluded.api_key,
                secret_key = excluded.secret_key
            "#,
        )
        .bind(&credential.executor_id)
        .bind(&credential.api_key)
        .bind(&credential.secret_key)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.db.pool)
        .await
        .context("Failed to save executor credential")?;
        Ok(())
    }
}

/// Last-known strategy set, used for cold start before the first
/// control-plane sync.
pub struct StrategyRepository {
    db: Database,
}

impl StrategyRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn upsert(&self, def: &StrategyDefinition) -> Result<()> {
        let definition_json =
            serde_json::to_string(def).context("Failed to encode strategy definition")?;
        sqlx::query(
            r#"
            INSERT INTO strategies (id, version, definition_json, status, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                version = excluded.version,
                definition_json = excluded.definition_json,
                status = excluded.status,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&def.id)
        .bind(def.version as i64)
        .bind(definition_json)
        .bind(format!("{:?}", def.status))
        .bind(Utc::now().timestamp_millis())
        .execute(&self.db.pool)
        .await
        .context("Failed to upsert strategy")?;
        Ok(())
    }

    pub async fn remove(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM strategies WHERE id = ?")
            .bind(id)
            .execute(&self.db.pool)
            .await
            .context("Failed to remove strategy")?;
        Ok(())
    }

    pub async fn load_all(&self) -> Result<Vec<StrategyDefinition>> {
        let rows = sqlx::query("SELECT definition_json FROM strategies")
            .fetch_all(&self.db.pool)
            .await
            .context("Failed to load strategies")?;

        let mut definitions = Vec::with_capacity(rows.len());
        for row in rows {
            let json: String = row.get("definition_json");
            match serde_json::from_str(&json) {
                Ok(def) => definitions.push(def),
                Err(e) => tracing::warn!("StrategyRepository: skipping corrupt row: {e}"),
            }
        }
        Ok(definitions)
    }

    /// Highest stored version; the snapshot's strategy-set marker.
    pub async fn max_version(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COALESCE(MAX(version), 0) AS v FROM strategies")
            .fetch_one(&self.db.pool)
            .await?;
        Ok(row.get("v"))
    }
}

/// Append-only command-outcome journal, capped at the last 10 000 entries.
/// The id column doubles as the restart-surviving dedup set.
pub struct CommandJournal {
    db: Database,
}

impl CommandJournal {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn record(&self, outcome: &CommandOutcome) -> Result<()> {
        let result_json = outcome
            .result
            .as_ref()
            .map(|v| v.to_string());
        sqlx::query(
            r#"
            INSERT INTO command_journal (id, kind, state, result_json, error, finished_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(&outcome.id)
        .bind(outcome.kind.to_string())
        .bind(outcome.state.to_string())
        .bind(result_json)
        .bind(&outcome.error)
        .bind(outcome.finished_at)
        .execute(&self.db.pool)
        .await
        .context("Failed to record command outcome")?;

        self.trim().await
    }

    async fn trim(&self) -> Result<()> {
        sqlx::query(
            r#"
            DELETE FROM command_journal WHERE id NOT IN (
                SELECT id FROM command_journal ORDER BY finished_at DESC LIMIT ?
            )
            "#,
        )
        .bind(JOURNAL_CAP)
        .execute(&self.db.pool)
        .await
        .context("Failed to trim command journal")?;
        Ok(())
    }

    pub async fn contains(&self, id: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM command_journal WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.db.pool)
            .await?;
        Ok(row.is_some())
    }

    /// All journaled ids, loaded once at startup for dedup continuity.
    pub async fn known_ids(&self) -> Result<HashSet<String>> {
        let rows = sqlx::query("SELECT id FROM command_journal")
            .fetch_all(&self.db.pool)
            .await
            .context("Failed to load journal ids")?;
        Ok(rows.into_iter().map(|row| row.get("id")).collect())
    }

    pub async fn len(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM command_journal")
            .fetch_one(&self.db.pool)
            .await?;
        Ok(row.get("n"))
    }
}

/// A periodic disaster-recovery snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredSnapshot {
    pub taken_at: i64,
    pub kill_switch_active: bool,
    pub open_command_ids: Vec<String>,
    pub strategy_set_version: i64,
}

pub struct SnapshotRepository {
    db: Database,
}

impl SnapshotRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn save(&self, snapshot: &StoredSnapshot) -> Result<()> {
        let ids_json = serde_json::to_string(&snapshot.open_command_ids)?;
        sqlx::query(
            r#"
            INSERT INTO snapshots (taken_at, kill_switch, open_command_ids_json, strategy_set_version)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(snapshot.taken_at)
        .bind(snapshot.kill_switch_active as i64)
        .bind(ids_json)
        .bind(snapshot.strategy_set_version)
        .execute(&self.db.pool)
        .await
        .context("Failed to save snapshot")?;

        // Keep a short tail of history.
        sqlx::query(
            "DELETE FROM snapshots WHERE id NOT IN (SELECT id FROM snapshots ORDER BY id DESC LIMIT 24)",
        )
        .execute(&self.db.pool)
        .await?;
        Ok(())
    }

    pub async fn load_latest(&self) -> Result<Option<StoredSnapshot>> {
        let row = sqlx::query(
            "SELECT taken_at, kill_switch, open_command_ids_json, strategy_set_version
             FROM snapshots ORDER BY id DESC LIMIT 1",
        )
        .fetch_optional(&self.db.pool)
        .await?;

        match row {
            None => Ok(None),
            Some(row) => {
                let ids_json: String = row.get("open_command_ids_json");
                let kill_switch: i64 = row.get("kill_switch");
                Ok(Some(StoredSnapshot {
                    taken_at: row.get("taken_at"),
                    kill_switch_active: kill_switch != 0,
                    open_command_ids: serde_json::from_str(&ids_json).unwrap_or_default(),
                    strategy_set_version: row.get("strategy_set_version"),
                }))
            }
        }
    }
}
