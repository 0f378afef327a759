//! End-to-end pipeline and HTTP-edge scenarios: policy blocking short-circuits
//! before any provider call, evidence records roundtrip with a verifiable
//! signature, and the HTTP edge maps validation failures to 400s.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use llmproxy::error::LlmError;
use llmproxy::evidence::storage::memory::InMemoryStorage;
use llmproxy::evidence::storage::EvidenceStorage;
use llmproxy::evidence::{record, EvidenceSigner, RecorderConfig};
use llmproxy::handlers::{self, AppState};
use llmproxy::model::{
    CompletionRequest, CompletionResponse, EnrichedRequest, EvidenceRecord, Message, PolicyAction,
    PolicyDecision, ProviderHealth, Role, StreamChunk,
};
use llmproxy::pipeline::{CallerContext, Pipeline};
use llmproxy::providers::manager::ProviderManager;
use llmproxy::providers::LlmProvider;
use llmproxy::routing::policy::{AllowAllPolicy, FailSafeMode, PolicyEngine};
use llmproxy::routing::strategy::{RoundRobinStrategy, RoutingStrategy};
use llmproxy::routing::{ModelCapabilityMap, RoutingEngine};
use tokio::sync::mpsc;

struct NeverCalledProvider {
    called: Arc<AtomicBool>,
}

#[async_trait]
impl LlmProvider for NeverCalledProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn send_completion(&self, _request: &CompletionRequest) -> Result<CompletionResponse, LlmError> {
        self.called.store(true, Ordering::SeqCst);
        panic!("provider must never be called when policy blocks the request");
    }

    async fn stream_completion(&self, _request: &CompletionRequest) -> Result<mpsc::Receiver<StreamChunk>, LlmError> {
        self.called.store(true, Ordering::SeqCst);
        panic!("provider must never be called when policy blocks the request");
    }

    async fn health_check(&self) -> Result<(), LlmError> {
        Ok(())
    }

    fn health(&self) -> ProviderHealth {
        ProviderHealth::default()
    }

    fn supported_models(&self) -> Option<&[String]> {
        None
    }

    async fn close(&self) {}
}

struct BlockAllPolicy;

#[async_trait]
impl PolicyEngine for BlockAllPolicy {
    async fn evaluate(&self, _request: &EnrichedRequest) -> Result<PolicyDecision, LlmError> {
        Ok(PolicyDecision {
            action: PolicyAction::Block,
            block_reason: Some("denied by test policy".into()),
            routing_target: None,
            transforms: None,
            policy_version: "test-v1".into(),
            cost_estimate: 0.0,
        })
    }
}

fn sample_request() -> CompletionRequest {
    CompletionRequest {
        model: "gpt-4".into(),
        messages: vec![Message {
            role: Role::User,
            content: "hello".into(),
            name: None,
            tool_calls: None,
            tool_call_id: None,
        }],
        temperature: None,
        top_p: None,
        max_tokens: None,
        stop: None,
        presence_penalty: None,
        frequency_penalty: None,
        user: None,
        tools: None,
        tool_choice: None,
        stream: false,
        metadata: HashMap::new(),
    }
}

#[tokio::test]
async fn blocked_policy_short_circuits_before_any_provider_call() {
    let manager = Arc::new(ProviderManager::new());
    let called = Arc::new(AtomicBool::new(false));
    manager.add("openai", Arc::new(NeverCalledProvider { called: called.clone() })).await;

    let strategy: Box<dyn RoutingStrategy> = Box::new(RoundRobinStrategy::new(HashMap::new()));
    let routing = Arc::new(RoutingEngine::new(manager.clone(), ModelCapabilityMap::default(), strategy, None, None));

    let storage: Arc<dyn EvidenceStorage> = Arc::new(InMemoryStorage::new());
    let signer = Arc::new(EvidenceSigner::new("key-1", &[9u8; 32]));
    let recorder = Arc::new(llmproxy::evidence::EvidenceRecorder::start(
        RecorderConfig::default(),
        storage.clone(),
        signer,
    ));

    let pipeline = Pipeline::new(manager, routing, Arc::new(BlockAllPolicy), FailSafeMode::FailOpen, Some(recorder.clone()));

    let caller = CallerContext {
        user: "u1".into(),
        api_key_id: "k1".into(),
        session_id: None,
        preferred_provider: None,
    };

    let err = pipeline.handle_completion(sample_request(), caller).await.expect_err("policy should block");
    assert!(matches!(err, LlmError::Validation { field, .. } if field == "policy"));
    assert!(!called.load(Ordering::SeqCst));

    recorder.close(Duration::from_secs(1)).await;
    let records = storage.query(&Default::default()).await.expect("should query");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].policy_decision, PolicyAction::Block);
}

#[tokio::test]
async fn evidence_record_roundtrips_with_verifiable_signature() {
    let storage = InMemoryStorage::new();
    let signer = EvidenceSigner::new("key-1", &[11u8; 32]);

    let mut sample = EvidenceRecord {
        id: "r1".into(),
        request_timestamp: chrono::Utc::now(),
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
        request_hash: "req-hash".into(),
        response_hash: "resp-hash".into(),
        signature: String::new(),
        signing_key_id: signer.key_id().to_owned(),
    };
    sample.signature = signer.sign(&sample);

    storage.store(sample.clone()).await.expect("should store");
    let found = storage.query_by_id("r1").await.expect("should query").expect("record stored");

    assert_eq!(found.id, sample.id);
    assert_eq!(found.total_tokens, found.prompt_tokens + found.completion_tokens);
    assert!(record::verify(&found, &signer.verifying_key()));
}

#[tokio::test]
async fn http_edge_rejects_empty_messages_with_400() {
    let manager = Arc::new(ProviderManager::new());
    let strategy: Box<dyn RoutingStrategy> = Box::new(RoundRobinStrategy::new(HashMap::new()));
    let routing = Arc::new(RoutingEngine::new(manager.clone(), ModelCapabilityMap::default(), strategy, None, None));
    let pipeline = Arc::new(Pipeline::new(manager.clone(), routing.clone(), Arc::new(AllowAllPolicy), FailSafeMode::FailOpen, None));

    let state = AppState { pipeline, manager, routing };
    let app = handlers::router(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("should bind");
    let addr = listener.local_addr().expect("should have local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("server should run");
    });

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("http://{addr}/v1/chat/completions"))
        .json(&serde_json::json!({"model": "gpt-4", "messages": []}))
        .send()
        .await
        .expect("should send request");

    assert_eq!(resp.status(), 400);
    let body: serde_json::Value = resp.json().await.expect("should parse body");
    assert_eq!(body["error"]["type"], "invalid_request_error");
}

struct AlwaysUnhealthy;

#[async_trait]
impl LlmProvider for AlwaysUnhealthy {
    fn name(&self) -> &str {
        "openai"
    }
    async fn send_completion(&self, _request: &CompletionRequest) -> Result<CompletionResponse, LlmError> {
        unimplemented!()
    }
    async fn stream_completion(&self, _request: &CompletionRequest) -> Result<mpsc::Receiver<StreamChunk>, LlmError> {
        unimplemented!()
    }
    async fn health_check(&self) -> Result<(), LlmError> {
        Ok(())
    }
    fn health(&self) -> ProviderHealth {
        ProviderHealth {
            healthy: false,
            ..Default::default()
        }
    }
    fn supported_models(&self) -> Option<&[String]> {
        None
    }
    async fn close(&self) {}
}

#[tokio::test]
async fn http_edge_health_reports_unavailable_with_no_healthy_providers() {
    let manager = Arc::new(ProviderManager::new());
    manager.add("openai", Arc::new(AlwaysUnhealthy)).await;

    let strategy: Box<dyn RoutingStrategy> = Box::new(RoundRobinStrategy::new(HashMap::new()));
    let routing = Arc::new(RoutingEngine::new(manager.clone(), ModelCapabilityMap::default(), strategy, None, None));
    let pipeline = Arc::new(Pipeline::new(manager.clone(), routing.clone(), Arc::new(AllowAllPolicy), FailSafeMode::FailOpen, None));

    let state = AppState { pipeline, manager, routing };
    let app = handlers::router(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("should bind");
    let addr = listener.local_addr().expect("should have local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("server should run");
    });

    let client = reqwest::Client::new();
    let resp = client
        .get(format!("http://{addr}/health"))
        .send()
        .await
        .expect("should send request");
    assert_eq!(resp.status(), 503);
}
