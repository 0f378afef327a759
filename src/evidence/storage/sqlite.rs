//! SQLite-backed evidence storage: WAL mode, configurable pool sizes, schema
//! created on open, indexed on the fields the query surface filters by.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use std::time::Duration;

use crate::error::LlmError;
use crate::model::{EvidenceRecord, PolicyAction};

use super::{EvidenceFilter, EvidenceStorage};

/// Tunables for the SQLite evidence backend.
#[derive(Debug, Clone)]
pub struct SqliteConfig {
    /// Filesystem path to the database file.
    pub path: String,
    /// Maximum open connections in the pool.
    pub max_open_conns: u32,
    /// Maximum idle connections kept in the pool.
    pub max_idle_conns: u32,
    /// Whether to enable WAL journal mode.
    pub wal_mode: bool,
    /// `busy_timeout` applied to every connection.
    pub busy_timeout: Duration,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: "evidence.db".to_owned(),
            max_open_conns: 8,
            max_idle_conns: 2,
            wal_mode: true,
            busy_timeout: Duration::from_secs(5),
        }
    }
}

/// SQLite (optionally WAL) evidence backend.
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (creating if absent) the database at `config.path` and run the
    /// schema migration.
    ///
    /// # Errors
    /// Returns [`LlmError::Storage`] if the connection or migration fails.
    pub async fn open(config: &SqliteConfig) -> Result<Self, LlmError> {
        let mut options = SqliteConnectOptions::from_str(&format!("sqlite://{}", config.path))
            .map_err(|e| LlmError::Storage(e.to_string()))?
            .create_if_missing(true)
            .busy_timeout(config.busy_timeout);

        if config.wal_mode {
            options = options.journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_open_conns)
            .min_connections(config.max_idle_conns)
            .connect_with(options)
            .await
            .map_err(|e| LlmError::Storage(e.to_string()))?;

        let storage = Self { pool };
        storage.migrate().await?;
        Ok(storage)
    }

    async fn migrate(&self) -> Result<(), LlmError> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS evidence_records (
                id TEXT PRIMARY KEY,
                request_timestamp TEXT NOT NULL,
                user_id TEXT NOT NULL,
                api_key_id TEXT NOT NULL,
                model TEXT NOT NULL,
                provider TEXT NOT NULL,
                policy_decision TEXT NOT NULL,
                block_reason TEXT,
                policy_version TEXT NOT NULL,
                prompt_tokens INTEGER NOT NULL,
                completion_tokens INTEGER NOT NULL,
                total_tokens INTEGER NOT NULL,
                actual_cost REAL NOT NULL,
                request_hash TEXT NOT NULL,
                response_hash TEXT NOT NULL,
                signature TEXT NOT NULL,
                signing_key_id TEXT NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| LlmError::Storage(e.to_string()))?;

        for (name, cols) in [
            ("idx_evidence_timestamp", "request_timestamp"),
            ("idx_evidence_user", "user_id"),
            ("idx_evidence_provider_model", "provider, model"),
            ("idx_evidence_policy_decision", "policy_decision"),
        ] {
            sqlx::query(&format!(
                "CREATE INDEX IF NOT EXISTS {name} ON evidence_records ({cols})"
            ))
            .execute(&self.pool)
            .await
            .map_err(|e| LlmError::Storage(e.to_string()))?;
        }

        Ok(())
    }
}

fn action_str(action: PolicyAction) -> &'static str {
    match action {
        PolicyAction::Allow => "allow",
        PolicyAction::Block => "block",
        PolicyAction::Transform => "transform",
        PolicyAction::Route => "route",
    }
}

fn parse_action(s: &str) -> PolicyAction {
    match s {
        "block" => PolicyAction::Block,
        "transform" => PolicyAction::Transform,
        "route" => PolicyAction::Route,
        _ => PolicyAction::Allow,
    }
}

fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> Result<EvidenceRecord, LlmError> {
    let ts: String = row.try_get("request_timestamp").map_err(|e| LlmError::Storage(e.to_string()))?;
    let request_timestamp = DateTime::parse_from_rfc3339(&ts)
        .map_err(|e| LlmError::Storage(e.to_string()))?
        .with_timezone(&Utc);

    let decision: String = row.try_get("policy_decision").map_err(|e| LlmError::Storage(e.to_string()))?;

    Ok(EvidenceRecord {
        id: row.try_get("id").map_err(|e| LlmError::Storage(e.to_string()))?,
        request_timestamp,
        user_id: row.try_get("user_id").map_err(|e| LlmError::Storage(e.to_string()))?,
        api_key_id: row.try_get("api_key_id").map_err(|e| LlmError::Storage(e.to_string()))?,
        model: row.try_get("model").map_err(|e| LlmError::Storage(e.to_string()))?,
        provider: row.try_get("provider").map_err(|e| LlmError::Storage(e.to_string()))?,
        policy_decision: parse_action(&decision),
        block_reason: row.try_get("block_reason").map_err(|e| LlmError::Storage(e.to_string()))?,
        policy_version: row.try_get("policy_version").map_err(|e| LlmError::Storage(e.to_string()))?,
        prompt_tokens: u64::try_from(row.try_get::<i64, _>("prompt_tokens").map_err(|e| LlmError::Storage(e.to_string()))?).unwrap_or(0),
        completion_tokens: u64::try_from(row.try_get::<i64, _>("completion_tokens").map_err(|e| LlmError::Storage(e.to_string()))?).unwrap_or(0),
        total_tokens: u64::try_from(row.try_get::<i64, _>("total_tokens").map_err(|e| LlmError::Storage(e.to_string()))?).unwrap_or(0),
        actual_cost: row.try_get("actual_cost").map_err(|e| LlmError::Storage(e.to_string()))?,
        request_hash: row.try_get("request_hash").map_err(|e| LlmError::Storage(e.to_string()))?,
        response_hash: row.try_get("response_hash").map_err(|e| LlmError::Storage(e.to_string()))?,
        signature: row.try_get("signature").map_err(|e| LlmError::Storage(e.to_string()))?,
        signing_key_id: row.try_get("signing_key_id").map_err(|e| LlmError::Storage(e.to_string()))?,
    })
}

#[async_trait]
impl EvidenceStorage for SqliteStorage {
    async fn store(&self, record: EvidenceRecord) -> Result<(), LlmError> {
        sqlx::query(
            r"
            INSERT INTO evidence_records (
                id, request_timestamp, user_id, api_key_id, model, provider,
                policy_decision, block_reason, policy_version, prompt_tokens,
                completion_tokens, total_tokens, actual_cost, request_hash,
                response_hash, signature, signing_key_id
            ) VALUES (?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?)
            ",
        )
        .bind(&record.id)
        .bind(record.request_timestamp.to_rfc3339())
        .bind(&record.user_id)
        .bind(&record.api_key_id)
        .bind(&record.model)
        .bind(&record.provider)
        .bind(action_str(record.policy_decision))
        .bind(&record.block_reason)
        .bind(&record.policy_version)
        .bind(i64::try_from(record.prompt_tokens).unwrap_or(i64::MAX))
        .bind(i64::try_from(record.completion_tokens).unwrap_or(i64::MAX))
        .bind(i64::try_from(record.total_tokens).unwrap_or(i64::MAX))
        .bind(record.actual_cost)
        .bind(&record.request_hash)
        .bind(&record.response_hash)
        .bind(&record.signature)
        .bind(&record.signing_key_id)
        .execute(&self.pool)
        .await
        .map_err(|e| LlmError::Storage(e.to_string()))?;

        Ok(())
    }

    async fn query(&self, filter: &EvidenceFilter) -> Result<Vec<EvidenceRecord>, LlmError> {
        // Filtering is applied in SQL for the indexed columns; the
        // remaining numeric range filters are applied after fetch for
        // simplicity, matching the in-memory backend's semantics exactly.
        let mut sql = "SELECT * FROM evidence_records WHERE 1=1".to_owned();
        if filter.start.is_some() {
            sql.push_str(" AND request_timestamp >= ?");
        }
        if filter.end.is_some() {
            sql.push_str(" AND request_timestamp <= ?");
        }
        if filter.user_id.is_some() {
            sql.push_str(" AND user_id = ?");
        }
        if filter.provider.is_some() {
            sql.push_str(" AND provider = ?");
        }
        if filter.model.is_some() {
            sql.push_str(" AND model = ?");
        }
        if filter.policy_decision.is_some() {
            sql.push_str(" AND policy_decision = ?");
        }
        sql.push_str(" ORDER BY request_timestamp DESC");

        let mut query = sqlx::query(&sql);
        if let Some(start) = filter.start {
            query = query.bind(start.to_rfc3339());
        }
        if let Some(end) = filter.end {
            query = query.bind(end.to_rfc3339());
        }
        if let Some(user_id) = &filter.user_id {
            query = query.bind(user_id.clone());
        }
        if let Some(provider) = &filter.provider {
            query = query.bind(provider.clone());
        }
        if let Some(model) = &filter.model {
            query = query.bind(model.clone());
        }
        if let Some(decision) = filter.policy_decision {
            query = query.bind(action_str(decision));
        }

        let rows = query.fetch_all(&self.pool).await.map_err(|e| LlmError::Storage(e.to_string()))?;
        let mut records: Vec<EvidenceRecord> = rows.iter().map(row_to_record).collect::<Result<_, _>>()?;

        records.retain(|r| {
            filter.api_key_id.as_deref().map_or(true, |v| r.api_key_id == v)
                && filter.policy_id.as_deref().map_or(true, |v| r.policy_version == v)
                && filter.min_cost.map_or(true, |v| r.actual_cost >= v)
                && filter.max_cost.map_or(true, |v| r.actual_cost <= v)
                && filter.min_tokens.map_or(true, |v| r.total_tokens >= v)
                && filter.max_tokens.map_or(true, |v| r.total_tokens <= v)
        });

        let offset = usize::try_from(filter.offset.unwrap_or(0)).unwrap_or(usize::MAX);
        let records = records.into_iter().skip(offset);
        Ok(match filter.limit {
            Some(limit) => records.take(usize::try_from(limit).unwrap_or(usize::MAX)).collect(),
            None => records.collect(),
        })
    }

    async fn query_by_id(&self, id: &str) -> Result<Option<EvidenceRecord>, LlmError> {
        let row = sqlx::query("SELECT * FROM evidence_records WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| LlmError::Storage(e.to_string()))?;

        row.as_ref().map(row_to_record).transpose()
    }

    async fn delete_older_than(&self, before: DateTime<Utc>) -> Result<u64, LlmError> {
        let result = sqlx::query("DELETE FROM evidence_records WHERE request_timestamp < ?")
            .bind(before.to_rfc3339())
            .execute(&self.pool)
            .await
            .map_err(|e| LlmError::Storage(e.to_string()))?;
        Ok(result.rows_affected())
    }

    async fn delete_to_cap(&self, cap: u64) -> Result<u64, LlmError> {
        let result = sqlx::query(
            r"
            DELETE FROM evidence_records WHERE id IN (
                SELECT id FROM evidence_records
                ORDER BY request_timestamp DESC
                LIMIT -1 OFFSET ?
            )
            ",
        )
        .bind(i64::try_from(cap).unwrap_or(i64::MAX))
        .execute(&self.pool)
        .await
        .map_err(|e| LlmError::Storage(e.to_string()))?;
        Ok(result.rows_affected())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
