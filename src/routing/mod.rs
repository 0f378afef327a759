//! Routing engine: strategy selection, stickiness, health filtering, and
//! policy-driven fallback chains.

pub mod policy;
pub mod sticky;
pub mod strategy;

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::LlmError;
use crate::model::{EnrichedRequest, PolicyDecision};
use crate::providers::manager::ProviderManager;
use crate::routing::strategy::RoutingStrategy;
use crate::routing::sticky::StickyCache;

/// Input to one routing decision.
#[derive(Debug, Clone)]
pub struct RoutingRequest {
    /// Correlation id of the originating request.
    pub request_id: String,
    /// Requested model id.
    pub model: String,
    /// Caller user id.
    pub user: String,
    /// Caller API-key id.
    pub api_key_id: String,
    /// Session id, if supplied.
    pub session_id: Option<String>,
    /// Manual provider override, if the caller specified one.
    pub preferred_provider: Option<String>,
    /// Decision from the policy-decision interface, if evaluated.
    pub policy_decision: Option<PolicyDecision>,
    /// Free-form metadata.
    pub metadata: HashMap<String, serde_json::Value>,
}

impl RoutingRequest {
    /// Build a routing request from an enriched pipeline request.
    #[must_use]
    pub fn from_enriched(
        enriched: &EnrichedRequest,
        policy_decision: Option<PolicyDecision>,
        preferred_provider: Option<String>,
    ) -> Self {
        Self {
            request_id: enriched.request_id.to_string(),
            model: enriched.request.model.clone(),
            user: enriched.user.clone(),
            api_key_id: enriched.api_key_id.clone(),
            session_id: enriched.session_id.clone(),
            preferred_provider,
            policy_decision,
            metadata: HashMap::new(),
        }
    }
}

/// Outcome of one routing decision.
#[derive(Debug, Clone)]
pub struct RoutingResult {
    /// Name of the chosen provider.
    pub provider_name: String,
    /// Strategy label that produced the choice (e.g. `"sticky"`, `"round_robin"`).
    pub strategy: String,
    /// Human-readable reason for the choice.
    pub reason: String,
    /// Health flag of the provider at the moment of choice.
    pub was_healthy: bool,
    /// Whether this choice came from a fallback chain.
    pub is_fallback: bool,
    /// Providers attempted before arriving at this choice.
    pub attempted_providers: Vec<String>,
    /// Free-form metadata.
    pub metadata: HashMap<String, serde_json::Value>,
}

/// A model-to-providers capability map. When a model has no entry, every
/// provider is considered capable of serving it.
#[derive(Debug, Clone, Default)]
pub struct ModelCapabilityMap {
    map: HashMap<String, Vec<String>>,
}

impl ModelCapabilityMap {
    /// Construct from an explicit mapping.
    #[must_use]
    pub fn new(map: HashMap<String, Vec<String>>) -> Self {
        Self { map }
    }

    /// Filter `candidates` to providers capable of serving `model`.
    #[must_use]
    pub fn filter(&self, model: &str, candidates: &[String]) -> Vec<String> {
        match self.map.get(model) {
            Some(capable) => candidates
                .iter()
                .filter(|c| capable.contains(c))
                .cloned()
                .collect(),
            None => candidates.to_vec(),
        }
    }
}

/// Atomic, snapshot-able statistics counters for the routing engine.
#[derive(Debug, Default)]
pub struct RoutingStats {
    /// Total routing decisions made.
    pub total_requests: std::sync::atomic::AtomicU64,
    /// Health-filtering applications that narrowed the candidate set.
    pub health_filtered: std::sync::atomic::AtomicU64,
    /// Decisions resolved by manual override.
    pub manual_override: std::sync::atomic::AtomicU64,
    /// Decisions resolved by policy override.
    pub policy_override: std::sync::atomic::AtomicU64,
    /// Routing errors encountered.
    pub errors: std::sync::atomic::AtomicU64,
}

/// Point-in-time snapshot of [`RoutingStats`].
#[derive(Debug, Clone, Default)]
pub struct RoutingStatsSnapshot {
    /// Total routing decisions made.
    pub total_requests: u64,
    /// Health-filtering applications that narrowed the candidate set.
    pub health_filtered: u64,
    /// Decisions resolved by manual override.
    pub manual_override: u64,
    /// Decisions resolved by policy override.
    pub policy_override: u64,
    /// Routing errors encountered.
    pub errors: u64,
}

impl RoutingStats {
    /// Take a torn-free snapshot of the current counters.
    #[must_use]
    pub fn snapshot(&self) -> RoutingStatsSnapshot {
        use std::sync::atomic::Ordering::Relaxed;
        RoutingStatsSnapshot {
            total_requests: self.total_requests.load(Relaxed),
            health_filtered: self.health_filtered.load(Relaxed),
            manual_override: self.manual_override.load(Relaxed),
            policy_override: self.policy_override.load(Relaxed),
            errors: self.errors.load(Relaxed),
        }
    }
}

/// Wires the provider manager, capability map, sticky cache, and a
/// configured strategy into the decision-precedence order from §4.5.
pub struct RoutingEngine {
    manager: Arc<ProviderManager>,
    capabilities: ModelCapabilityMap,
    strategy: Box<dyn RoutingStrategy>,
    sticky: Option<Arc<StickyCache>>,
    default_provider: Option<String>,
    stats: RoutingStats,
}

impl RoutingEngine {
    /// Construct a routing engine.
    #[must_use]
    pub fn new(
        manager: Arc<ProviderManager>,
        capabilities: ModelCapabilityMap,
        strategy: Box<dyn RoutingStrategy>,
        sticky: Option<Arc<StickyCache>>,
        default_provider: Option<String>,
    ) -> Self {
        Self {
            manager,
            capabilities,
            strategy,
            sticky,
            default_provider,
            stats: RoutingStats::default(),
        }
    }

    /// Stats snapshot for `/metrics`.
    #[must_use]
    pub fn stats(&self) -> RoutingStatsSnapshot {
        self.stats.snapshot()
    }

    fn filtered_candidates(&self, model: &str) -> Result<Vec<String>, LlmError> {
        use std::sync::atomic::Ordering::Relaxed;

        let all = self.manager.names();
        let capable = self.capabilities.filter(model, &all);
        if capable.is_empty() {
            self.stats.errors.fetch_add(1, Relaxed);
            return Err(LlmError::ModelNotSupported {
                model: model.to_owned(),
            });
        }

        let healthy_set: std::collections::HashSet<String> =
            self.manager.healthy_names().into_iter().collect();
        let healthy: Vec<String> = capable.iter().filter(|p| healthy_set.contains(*p)).cloned().collect();

        if healthy.len() != capable.len() {
            self.stats.health_filtered.fetch_add(1, Relaxed);
        }

        if healthy.is_empty() {
            self.stats.errors.fetch_add(1, Relaxed);
            return Err(LlmError::NoHealthyProviders);
        }

        Ok(healthy)
    }

    /// Decide which provider should serve `request`, per the precedence
    /// order: policy override, manual selection, configured strategy,
    /// configured default.
    pub async fn route(&self, request: &RoutingRequest) -> Result<RoutingResult, LlmError> {
        use std::sync::atomic::Ordering::Relaxed;
        self.stats.total_requests.fetch_add(1, Relaxed);

        let candidates = match self.filtered_candidates(&request.model) {
            Ok(c) => c,
            Err(e) => return self.try_default_or_err(e),
        };

        // 1. Policy override.
        if let Some(decision) = &request.policy_decision {
            if let Some(target) = &decision.routing_target {
                self.stats.policy_override.fetch_add(1, Relaxed);
                return self.resolve_fallback_chain(target, &candidates).await;
            }
        }

        // 2. Manual selection.
        if let Some(preferred) = &request.preferred_provider {
            self.stats.manual_override.fetch_add(1, Relaxed);
            if candidates.contains(preferred) {
                return Ok(RoutingResult {
                    provider_name: preferred.clone(),
                    strategy: "manual".to_owned(),
                    reason: "caller-specified preferred provider".to_owned(),
                    was_healthy: true,
                    is_fallback: false,
                    attempted_providers: vec![preferred.clone()],
                    metadata: HashMap::new(),
                });
            }
        }

        // 3. Configured strategy (includes sticky lookup if configured).
        if let Some(sticky) = &self.sticky {
            let key = sticky::derive_key(sticky.key_type(), &request.user, &request.api_key_id, request.session_id.as_deref());
            if let Some(entry) = sticky.get(&key) {
                if candidates.contains(&entry.provider) {
                    return Ok(RoutingResult {
                        provider_name: entry.provider,
                        strategy: "sticky".to_owned(),
                        reason: "sticky cache hit".to_owned(),
                        was_healthy: true,
                        is_fallback: false,
                        attempted_providers: vec![],
                        metadata: HashMap::new(),
                    });
                }
            }

            let choice = self.strategy.select(&candidates)?;
            sticky.set(&key, choice.clone());
            return Ok(RoutingResult {
                provider_name: choice,
                strategy: self.strategy.label().to_owned(),
                reason: "sticky cache miss, delegated to wrapped strategy".to_owned(),
                was_healthy: true,
                is_fallback: false,
                attempted_providers: vec![],
                metadata: HashMap::new(),
            });
        }

        match self.strategy.select(&candidates) {
            Ok(choice) => Ok(RoutingResult {
                provider_name: choice,
                strategy: self.strategy.label().to_owned(),
                reason: "configured strategy".to_owned(),
                was_healthy: true,
                is_fallback: false,
                attempted_providers: vec![],
                metadata: HashMap::new(),
            }),
            Err(e) => self.try_default_or_err(e),
        }
    }

    async fn resolve_fallback_chain(
        &self,
        target: &crate::model::RoutingTarget,
        candidates: &[String],
    ) -> Result<RoutingResult, LlmError> {
        let mut attempted = Vec::new();
        let mut chain = vec![target.provider.clone()];
        chain.extend(target.fallback.iter().cloned());

        for (idx, name) in chain.iter().enumerate() {
            attempted.push(name.clone());
            if candidates.contains(name) {
                return Ok(RoutingResult {
                    provider_name: name.clone(),
                    strategy: "policy_route".to_owned(),
                    reason: if idx == 0 {
                        "policy-specified route target".to_owned()
                    } else {
                        format!("fallback after {idx} unavailable candidate(s)")
                    },
                    was_healthy: true,
                    is_fallback: idx > 0,
                    attempted_providers: attempted,
                    metadata: HashMap::new(),
                });
            }
        }

        Err(LlmError::AllProvidersFailed {
            cause: format!("exhausted fallback chain: {attempted:?}"),
        })
    }

    fn try_default_or_err(&self, err: LlmError) -> Result<RoutingResult, LlmError> {
        if let Some(default) = &self.default_provider {
            if self.manager.get(default).is_some() {
                return Ok(RoutingResult {
                    provider_name: default.clone(),
                    strategy: "default".to_owned(),
                    reason: "fell through to configured default provider".to_owned(),
                    was_healthy: self
                        .manager
                        .get(default)
                        .map(|p| p.health().healthy)
                        .unwrap_or(false),
                    is_fallback: true,
                    attempted_providers: vec![default.clone()],
                    metadata: HashMap::new(),
                });
            }
        }
        Err(err)
    }
}
