//! Scheduled retention pruning for evidence records.
//!
//! Evaluates a cron-like cadence the same way the teacher's scheduled-task
//! evaluator does (`cron::Schedule::from_str(...).after(&after).take(1)`),
//! and on each due tick deletes records outside the retention window and/or
//! above the configured cap, optionally archiving first.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::error::LlmError;
use crate::evidence::storage::EvidenceStorage;

/// Tunables for the retention pruner, mirroring `evidence.retention.*`.
#[derive(Debug, Clone)]
pub struct RetentionConfig {
    /// Records older than this many days are deleted.
    pub days: u32,
    /// Cron expression evaluated on each scheduler tick.
    pub prune_schedule: String,
    /// Stream matching records to `archive_path` before deletion.
    pub archive_before_delete: bool,
    /// Archive destination when `archive_before_delete` is set.
    pub archive_path: Option<String>,
    /// Optional absolute cap on the number of records retained.
    pub max_records: Option<u64>,
}

/// Tracks the pruner's last-run time and exposes the next scheduled run.
pub struct RetentionPruner {
    config: RetentionConfig,
    storage: Arc<dyn EvidenceStorage>,
    last_run: Mutex<DateTime<Utc>>,
}

impl RetentionPruner {
    /// Construct a pruner that has never run.
    #[must_use]
    pub fn new(config: RetentionConfig, storage: Arc<dyn EvidenceStorage>) -> Self {
        Self {
            config,
            storage,
            last_run: Mutex::new(DateTime::<Utc>::UNIX_EPOCH),
        }
    }

    /// True if the configured schedule has a trigger between the last run
    /// and `now`.
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        let schedule = match cron::Schedule::from_str(&self.config.prune_schedule) {
            Ok(s) => s,
            Err(e) => {
                warn!(schedule = %self.config.prune_schedule, error = %e, "invalid retention cron expression");
                return false;
            }
        };

        let after = *self.last_run.lock();
        schedule.after(&after).take(1).any(|next| next <= now)
    }

    /// The next time the schedule will fire after the last run, if the
    /// expression is valid.
    #[must_use]
    pub fn next_run(&self) -> Option<DateTime<Utc>> {
        let schedule = cron::Schedule::from_str(&self.config.prune_schedule).ok()?;
        let after = *self.last_run.lock();
        schedule.after(&after).take(1).next()
    }

    /// Run one pruning pass unconditionally, updating the last-run marker.
    ///
    /// # Errors
    /// Returns an error if the storage backend's delete operations fail.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<u64, LlmError> {
        let cutoff = now - chrono::Duration::days(i64::from(self.config.days));

        if self.config.archive_before_delete {
            let filter = crate::evidence::storage::EvidenceFilter {
                end: Some(cutoff),
                ..Default::default()
            };
            let expiring = self.storage.query(&filter).await?;
            if let Some(path) = &self.config.archive_path {
                archive_records(path, &expiring)?;
            }
        }

        let mut deleted = self.storage.delete_older_than(cutoff).await?;

        if let Some(cap) = self.config.max_records {
            deleted += self.storage.delete_to_cap(cap).await?;
        }

        *self.last_run.lock() = now;
        info!(deleted, "retention pruner pass complete");
        Ok(deleted)
    }
}

fn archive_records(path: &str, records: &[crate::model::EvidenceRecord]) -> Result<(), LlmError> {
    use std::io::Write;

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| LlmError::Storage(e.to_string()))?;

    for record in records {
        let line = serde_json::to_string(record).map_err(|e| LlmError::Storage(e.to_string()))?;
        writeln!(file, "{line}").map_err(|e| LlmError::Storage(e.to_string()))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::storage::memory::InMemoryStorage;

    #[tokio::test]
    async fn run_once_deletes_records_older_than_window() {
        let storage = Arc::new(InMemoryStorage::new());
        let now = Utc::now();

        storage
            .store(sample_record("old", now - chrono::Duration::days(40)))
            .await
            .expect("should store");
        storage.store(sample_record("new", now)).await.expect("should store");

        let pruner = RetentionPruner::new(
            RetentionConfig {
                days: 30,
                prune_schedule: "0 0 * * * *".to_owned(),
                archive_before_delete: false,
                archive_path: None,
                max_records: None,
            },
            storage.clone(),
        );

        let deleted = pruner.run_once(now).await.expect("should prune");
        assert_eq!(deleted, 1);
        assert!(storage.query_by_id("old").await.expect("should query").is_none());
        assert!(storage.query_by_id("new").await.expect("should query").is_some());
    }

    fn sample_record(id: &str, ts: DateTime<Utc>) -> crate::model::EvidenceRecord {
        crate::model::EvidenceRecord {
            id: id.to_owned(),
            request_timestamp: ts,
            user_id: "u1".into(),
            api_key_id: "k1".into(),
            model: "gpt-4".into(),
            provider: "openai".into(),
            policy_decision: crate::model::PolicyAction::Allow,
            block_reason: None,
            policy_version: "v1".into(),
            prompt_tokens: 1,
            completion_tokens: 1,
            total_tokens: 2,
            actual_cost: 0.0,
            request_hash: "a".into(),
            response_hash: "b".into(),
            signature: "sig".into(),
            signing_key_id: "key-1".into(),
        }
    }
}
