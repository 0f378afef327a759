//! In-memory evidence storage: an append-only vector, scanned on query.
//!
//! Intended for tests and single-process deployments that don't need
//! durability across restarts.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::error::LlmError;
use crate::model::EvidenceRecord;

use super::{apply_filter_sorted, EvidenceFilter, EvidenceStorage};

/// Append-vector evidence backend guarded by a single read-write lock.
#[derive(Default)]
pub struct InMemoryStorage {
    records: RwLock<Vec<EvidenceRecord>>,
}

impl InMemoryStorage {
    /// Construct an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: RwLock::new(Vec::new()),
        }
    }
}

#[async_trait]
impl EvidenceStorage for InMemoryStorage {
    async fn store(&self, record: EvidenceRecord) -> Result<(), LlmError> {
        self.records.write().push(record);
        Ok(())
    }

    async fn query(&self, filter: &EvidenceFilter) -> Result<Vec<EvidenceRecord>, LlmError> {
        Ok(apply_filter_sorted(&self.records.read(), filter))
    }

    async fn query_by_id(&self, id: &str) -> Result<Option<EvidenceRecord>, LlmError> {
        Ok(self.records.read().iter().find(|r| r.id == id).cloned())
    }

    async fn delete_older_than(&self, before: DateTime<Utc>) -> Result<u64, LlmError> {
        let mut records = self.records.write();
        let before_len = records.len();
        records.retain(|r| r.request_timestamp >= before);
        Ok(u64::try_from(before_len - records.len()).unwrap_or(0))
    }

    async fn delete_to_cap(&self, cap: u64) -> Result<u64, LlmError> {
        let mut records = self.records.write();
        records.sort_by(|a, b| b.request_timestamp.cmp(&a.request_timestamp));
        let cap = usize::try_from(cap).unwrap_or(usize::MAX);
        if records.len() <= cap {
            return Ok(0);
        }
        let removed = records.len() - cap;
        records.truncate(cap);
        Ok(u64::try_from(removed).unwrap_or(0))
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PolicyAction;

    fn sample(id: &str, ts: DateTime<Utc>) -> EvidenceRecord {
        EvidenceRecord {
            id: id.to_owned(),
            request_timestamp: ts,
            user_id: "u1".into(),
            api_key_id: "k1".into(),
            model: "gpt-4".into(),
            provider: "openai".into(),
            policy_decision: PolicyAction::Allow,
            block_reason: None,
            policy_version: "v1".into(),
            prompt_tokens: 10,
            completion_tokens: 20,
            total_tokens: 30,
            actual_cost: 0.01,
            request_hash: "a".into(),
            response_hash: "b".into(),
            signature: "sig".into(),
            signing_key_id: "key-1".into(),
        }
    }

    #[tokio::test]
    async fn store_then_query_by_id_roundtrips() {
        let storage = InMemoryStorage::new();
        let record = sample("r1", Utc::now());
        storage.store(record.clone()).await.expect("should store");
        let found = storage.query_by_id("r1").await.expect("should query").expect("record should exist");
        assert_eq!(found.id, record.id);
        assert_eq!(found.total_tokens, record.prompt_tokens + record.completion_tokens);
    }

    #[tokio::test]
    async fn delete_older_than_removes_expired_only() {
        let storage = InMemoryStorage::new();
        storage
            .store(sample("old", Utc::now() - chrono::Duration::days(10)))
            .await
            .expect("should store");
        storage.store(sample("new", Utc::now())).await.expect("should store");

        let deleted = storage
            .delete_older_than(Utc::now() - chrono::Duration::days(1))
            .await
            .expect("should delete");
        assert_eq!(deleted, 1);
        assert!(storage.query_by_id("old").await.expect("should query").is_none());
        assert!(storage.query_by_id("new").await.expect("should query").is_some());
    }

    #[tokio::test]
    async fn delete_to_cap_keeps_newest() {
        let storage = InMemoryStorage::new();
        for i in 0..5 {
            storage
                .store(sample(&format!("r{i}"), Utc::now() - chrono::Duration::seconds(i)))
                .await
                .expect("should store");
        }
        let deleted = storage.delete_to_cap(2).await.expect("should delete");
        assert_eq!(deleted, 3);
        assert_eq!(
            storage.query(&EvidenceFilter::default()).await.expect("should query").len(),
            2
        );
    }
}
