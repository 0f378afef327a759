//! Named map of provider adapters: add/remove/health aggregation.
//!
//! Grounded on the teacher's `ModelRouter` map-of-named-adapters pattern,
//! generalized to a plain reader-preferring collection (the policy-aware
//! selection logic itself lives in [`crate::routing`]).

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::model::ProviderHealth;
use crate::providers::LlmProvider;

/// Aggregate health counts across the whole provider set.
#[derive(Debug, Clone, Default)]
pub struct HealthSummary {
    /// Total providers registered.
    pub total: usize,
    /// Providers currently healthy.
    pub healthy: usize,
    /// Providers currently unhealthy.
    pub unhealthy: usize,
}

/// Thread-safe, reader-preferring collection of named provider adapters.
#[derive(Default)]
pub struct ProviderManager {
    providers: RwLock<HashMap<String, Arc<dyn LlmProvider>>>,
}

impl ProviderManager {
    /// Construct an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self {
            providers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a provider under `name`, closing and replacing any prior
    /// entry with the same name.
    pub async fn add(&self, name: &str, provider: Arc<dyn LlmProvider>) {
        let prior = self.providers.write().insert(name.to_owned(), provider);
        if let Some(prior) = prior {
            prior.close().await;
        }
    }

    /// Remove and close a provider by name.
    pub async fn remove(&self, name: &str) {
        let removed = self.providers.write().remove(name);
        if let Some(p) = removed {
            p.close().await;
        }
    }

    /// Look up a provider by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn LlmProvider>> {
        self.providers.read().get(name).cloned()
    }

    /// All registered provider names.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.providers.read().keys().cloned().collect()
    }

    /// Names of providers currently reporting healthy.
    #[must_use]
    pub fn healthy_names(&self) -> Vec<String> {
        self.providers
            .read()
            .iter()
            .filter(|(_, p)| p.health().healthy)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Names of providers currently reporting unhealthy.
    #[must_use]
    pub fn unhealthy_names(&self) -> Vec<String> {
        self.providers
            .read()
            .iter()
            .filter(|(_, p)| !p.health().healthy)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Per-provider health snapshots.
    #[must_use]
    pub fn all_health(&self) -> HashMap<String, ProviderHealth> {
        self.providers
            .read()
            .iter()
            .map(|(name, p)| (name.clone(), p.health()))
            .collect()
    }

    /// Aggregate health counts.
    #[must_use]
    pub fn health_summary(&self) -> HealthSummary {
        let providers = self.providers.read();
        let total = providers.len();
        let healthy = providers.values().filter(|p| p.health().healthy).count();
        HealthSummary {
            total,
            healthy,
            unhealthy: total - healthy,
        }
    }

    /// Close and remove every provider. Idempotent.
    pub async fn close_all(&self) {
        let providers: Vec<Arc<dyn LlmProvider>> =
            self.providers.write().drain().map(|(_, p)| p).collect();
        for p in providers {
            p.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use crate::model::{CompletionRequest, CompletionResponse};
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    struct StubProvider {
        name: String,
        healthy: bool,
    }

    #[async_trait]
    impl LlmProvider for StubProvider {
        fn name(&self) -> &str {
            &self.name
        }
        async fn send_completion(
            &self,
            _request: &CompletionRequest,
        ) -> Result<CompletionResponse, LlmError> {
            unimplemented!()
        }
        async fn stream_completion(
            &self,
            _request: &CompletionRequest,
        ) -> Result<mpsc::Receiver<crate::model::StreamChunk>, LlmError> {
            unimplemented!()
        }
        async fn health_check(&self) -> Result<(), LlmError> {
            Ok(())
        }
        fn health(&self) -> ProviderHealth {
            ProviderHealth {
                healthy: self.healthy,
                ..Default::default()
            }
        }
        fn supported_models(&self) -> Option<&[String]> {
            None
        }
        async fn close(&self) {}
    }

    #[tokio::test]
    async fn add_and_get_roundtrips() {
        let mgr = ProviderManager::new();
        mgr.add(
            "openai",
            Arc::new(StubProvider {
                name: "openai".into(),
                healthy: true,
            }),
        )
        .await;
        assert!(mgr.get("openai").is_some());
        assert_eq!(mgr.names(), vec!["openai".to_owned()]);
    }

    #[tokio::test]
    async fn health_summary_counts_healthy_and_unhealthy() {
        let mgr = ProviderManager::new();
        mgr.add(
            "a",
            Arc::new(StubProvider {
                name: "a".into(),
                healthy: true,
            }),
        )
        .await;
        mgr.add(
            "b",
            Arc::new(StubProvider {
                name: "b".into(),
                healthy: false,
            }),
        )
        .await;
        let summary = mgr.health_summary();
        assert_eq!(summary.total, 2);
        assert_eq!(summary.healthy, 1);
        assert_eq!(summary.unhealthy, 1);
    }
}
