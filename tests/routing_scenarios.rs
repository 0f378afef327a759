//! Concrete routing and sticky-cache scenarios.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use llmproxy::error::LlmError;
use llmproxy::model::{CompletionRequest, CompletionResponse, FinishReason, ProviderHealth, StreamChunk, UsageStats};
use llmproxy::providers::manager::ProviderManager;
use llmproxy::providers::LlmProvider;
use llmproxy::routing::sticky::{KeyType, StickyCache};
use llmproxy::routing::strategy::{HealthFilterStrategy, RoundRobinStrategy, RoutingStrategy};
use llmproxy::routing::{ModelCapabilityMap, RoutingEngine, RoutingRequest};
use parking_lot::Mutex;
use tokio::sync::mpsc;

struct StubProvider {
    name: String,
    healthy: Mutex<bool>,
}

impl StubProvider {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            healthy: Mutex::new(true),
        }
    }

    fn set_healthy(&self, healthy: bool) {
        *self.healthy.lock() = healthy;
    }
}

#[async_trait]
impl LlmProvider for StubProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send_completion(&self, _request: &CompletionRequest) -> Result<CompletionResponse, LlmError> {
        Ok(CompletionResponse {
            id: "stub".into(),
            model: "gpt-4".into(),
            content: "ok".into(),
            finish_reason: FinishReason::Stop,
            usage: UsageStats::new(1, 1),
            tool_calls: None,
            created_at: chrono::Utc::now(),
            metadata: HashMap::new(),
        })
    }

    async fn stream_completion(&self, _request: &CompletionRequest) -> Result<mpsc::Receiver<StreamChunk>, LlmError> {
        let (_tx, rx) = mpsc::channel(1);
        Ok(rx)
    }

    async fn health_check(&self) -> Result<(), LlmError> {
        Ok(())
    }

    fn health(&self) -> ProviderHealth {
        let mut health = ProviderHealth::default();
        health.healthy = *self.healthy.lock();
        health
    }

    fn supported_models(&self) -> Option<&[String]> {
        None
    }

    async fn close(&self) {}
}

fn routing_request(user: &str) -> RoutingRequest {
    RoutingRequest {
        request_id: "r1".into(),
        model: "gpt-4".into(),
        user: user.into(),
        api_key_id: "k1".into(),
        session_id: None,
        preferred_provider: None,
        policy_decision: None,
        metadata: HashMap::new(),
    }
}

#[tokio::test]
async fn round_robin_distributes_evenly_across_three_providers() {
    let manager = Arc::new(ProviderManager::new());
    for name in ["a", "b", "c"] {
        manager.add(name, Arc::new(StubProvider::new(name))).await;
    }

    let weights = HashMap::from([("a".to_owned(), 1), ("b".to_owned(), 1), ("c".to_owned(), 1)]);
    let strategy: Box<dyn RoutingStrategy> = Box::new(HealthFilterStrategy::new(
        Box::new(RoundRobinStrategy::new(weights)),
        manager.clone(),
        true,
    ));

    let engine = RoutingEngine::new(manager, ModelCapabilityMap::default(), strategy, None, None);

    let mut counts: HashMap<String, u32> = HashMap::new();
    for _ in 0..300 {
        let result = engine.route(&routing_request("u1")).await.expect("should route");
        *counts.entry(result.provider_name).or_insert(0) += 1;
    }

    assert_eq!(counts["a"], 100);
    assert_eq!(counts["b"], 100);
    assert_eq!(counts["c"], 100);
}

#[tokio::test]
async fn weighted_round_robin_matches_configured_ratio() {
    let manager = Arc::new(ProviderManager::new());
    for name in ["a", "b"] {
        manager.add(name, Arc::new(StubProvider::new(name))).await;
    }

    let weights = HashMap::from([("a".to_owned(), 2), ("b".to_owned(), 1)]);
    let strategy: Box<dyn RoutingStrategy> = Box::new(HealthFilterStrategy::new(
        Box::new(RoundRobinStrategy::new(weights)),
        manager.clone(),
        true,
    ));

    let engine = RoutingEngine::new(manager, ModelCapabilityMap::default(), strategy, None, None);

    let mut counts: HashMap<String, u32> = HashMap::new();
    for _ in 0..300 {
        let result = engine.route(&routing_request("u1")).await.expect("should route");
        *counts.entry(result.provider_name).or_insert(0) += 1;
    }

    assert_eq!(counts["a"], 200);
    assert_eq!(counts["b"], 100);
}

#[tokio::test]
async fn sticky_cache_falls_back_when_remembered_provider_turns_unhealthy() {
    let manager = Arc::new(ProviderManager::new());
    let openai = Arc::new(StubProvider::new("openai"));
    let fallback = Arc::new(StubProvider::new("fallback"));
    manager.add("openai", openai.clone()).await;
    manager.add("fallback", fallback.clone()).await;

    let weights = HashMap::from([("openai".to_owned(), 1), ("fallback".to_owned(), 1)]);
    let strategy: Box<dyn RoutingStrategy> = Box::new(HealthFilterStrategy::new(
        Box::new(RoundRobinStrategy::new(weights)),
        manager.clone(),
        true,
    ));
    let sticky = Arc::new(StickyCache::new(100, None, KeyType::User));

    let engine = RoutingEngine::new(manager, ModelCapabilityMap::default(), strategy, Some(sticky), None);

    let first = engine.route(&routing_request("u1")).await.expect("should route");
    let chosen = first.provider_name.clone();

    for _ in 0..9 {
        let result = engine.route(&routing_request("u1")).await.expect("should route");
        assert_eq!(result.provider_name, chosen);
    }

    if chosen == "openai" {
        openai.set_healthy(false);
    } else {
        fallback.set_healthy(false);
    }

    let eleventh = engine.route(&routing_request("u1")).await.expect("should route");
    assert_ne!(eleventh.provider_name, chosen);
}

#[test]
fn sticky_cache_never_exceeds_capacity() {
    let cache = StickyCache::new(3, None, KeyType::User);
    for i in 0..10 {
        cache.set(&format!("user-{i}"), format!("provider-{i}"));
    }
    assert!(cache.size() <= 3);
}

#[tokio::test]
async fn provider_health_trips_after_three_consecutive_failures() {
    let mut health = ProviderHealth::default();
    assert!(health.healthy);

    health.record_failure("boom");
    health.record_failure("boom");
    assert!(health.healthy);
    health.record_failure("boom");
    assert!(!health.healthy);

    health.record_success();
    assert!(health.healthy);
    assert_eq!(health.consecutive_failures, 0);
}
