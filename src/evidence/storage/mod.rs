//! Evidence storage interface and its two back-ends.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::LlmError;
use crate::model::{EvidenceRecord, PolicyAction};

/// Query filter over stored evidence records. Results are ordered by
/// request time descending.
#[derive(Debug, Clone, Default)]
pub struct EvidenceFilter {
    /// Inclusive start of the time range.
    pub start: Option<DateTime<Utc>>,
    /// Inclusive end of the time range.
    pub end: Option<DateTime<Utc>>,
    /// Filter by user id.
    pub user_id: Option<String>,
    /// Filter by API-key id.
    pub api_key_id: Option<String>,
    /// Filter by policy id (the policy version string).
    pub policy_id: Option<String>,
    /// Filter by policy decision action.
    pub policy_decision: Option<PolicyAction>,
    /// Filter by provider name.
    pub provider: Option<String>,
    /// Filter by model id.
    pub model: Option<String>,
    /// Minimum actual cost, inclusive.
    pub min_cost: Option<f64>,
    /// Maximum actual cost, inclusive.
    pub max_cost: Option<f64>,
    /// Minimum total tokens, inclusive.
    pub min_tokens: Option<u64>,
    /// Maximum total tokens, inclusive.
    pub max_tokens: Option<u64>,
    /// Maximum number of results.
    pub limit: Option<u64>,
    /// Number of matching results to skip.
    pub offset: Option<u64>,
}

impl EvidenceFilter {
    /// Parse the `"<RFC3339>/<RFC3339>"` time-range filter format used on
    /// the query surface.
    ///
    /// # Errors
    /// Returns [`LlmError::Validation`] if the string is not two RFC3339
    /// timestamps separated by a single `/`.
    pub fn parse_time_range(range: &str) -> Result<(DateTime<Utc>, DateTime<Utc>), LlmError> {
        let (start, end) = range.split_once('/').ok_or_else(|| LlmError::Validation {
            field: "time_range".to_owned(),
            message: "expected `<RFC3339>/<RFC3339>`".to_owned(),
        })?;

        let parse = |s: &str| {
            DateTime::parse_from_rfc3339(s)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| LlmError::Validation {
                    field: "time_range".to_owned(),
                    message: e.to_string(),
                })
        };

        Ok((parse(start)?, parse(end)?))
    }

    fn matches(&self, record: &EvidenceRecord) -> bool {
        if let Some(start) = self.start {
            if record.request_timestamp < start {
                return false;
            }
        }
        if let Some(end) = self.end {
            if record.request_timestamp > end {
                return false;
            }
        }
        if let Some(user_id) = &self.user_id {
            if &record.user_id != user_id {
                return false;
            }
        }
        if let Some(api_key_id) = &self.api_key_id {
            if &record.api_key_id != api_key_id {
                return false;
            }
        }
        if let Some(policy_id) = &self.policy_id {
            if &record.policy_version != policy_id {
                return false;
            }
        }
        if let Some(decision) = self.policy_decision {
            if record.policy_decision != decision {
                return false;
            }
        }
        if let Some(provider) = &self.provider {
            if &record.provider != provider {
                return false;
            }
        }
        if let Some(model) = &self.model {
            if &record.model != model {
                return false;
            }
        }
        if let Some(min) = self.min_cost {
            if record.actual_cost < min {
                return false;
            }
        }
        if let Some(max) = self.max_cost {
            if record.actual_cost > max {
                return false;
            }
        }
        if let Some(min) = self.min_tokens {
            if record.total_tokens < min {
                return false;
            }
        }
        if let Some(max) = self.max_tokens {
            if record.total_tokens > max {
                return false;
            }
        }
        true
    }
}

/// Durable storage for evidence records.
#[async_trait]
pub trait EvidenceStorage: Send + Sync {
    /// Persist `record`.
    async fn store(&self, record: EvidenceRecord) -> Result<(), LlmError>;

    /// Query records matching `filter`, newest first.
    async fn query(&self, filter: &EvidenceFilter) -> Result<Vec<EvidenceRecord>, LlmError>;

    /// Look up a single record by id.
    async fn query_by_id(&self, id: &str) -> Result<Option<EvidenceRecord>, LlmError>;

    /// Delete records strictly older than `before`. Returns the count deleted.
    async fn delete_older_than(&self, before: DateTime<Utc>) -> Result<u64, LlmError>;

    /// Delete the oldest records until at most `cap` remain. Returns the
    /// count deleted.
    async fn delete_to_cap(&self, cap: u64) -> Result<u64, LlmError>;

    /// Release any held resources. Idempotent.
    async fn close(&self);
}

/// Apply `filter` to an in-memory slice, sorting by request time descending
/// and applying offset/limit last. Shared by the in-memory backend and used
/// as a reference behavior for backend-specific query builders.
pub(crate) fn apply_filter_sorted(
    records: &[EvidenceRecord],
    filter: &EvidenceFilter,
) -> Vec<EvidenceRecord> {
    let mut matched: Vec<EvidenceRecord> = records.iter().filter(|r| filter.matches(r)).cloned().collect();
    matched.sort_by(|a, b| b.request_timestamp.cmp(&a.request_timestamp));

    let offset = usize::try_from(filter.offset.unwrap_or(0)).unwrap_or(usize::MAX);
    let matched = matched.into_iter().skip(offset);

    match filter.limit {
        Some(limit) => matched.take(usize::try_from(limit).unwrap_or(usize::MAX)).collect(),
        None => matched.collect(),
    }
}
