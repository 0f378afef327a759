//! Routing strategies: weighted round-robin, manual-with-fallback, and the
//! health-filter decorator.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::LlmError;
use crate::providers::manager::ProviderManager;

/// Counter values are reset to 0 once they would exceed this ceiling,
/// per the round-robin cooperative-reset rule.
const COUNTER_RESET_CEILING: u64 = 1_000_000_000;

/// A pluggable provider-selection strategy operating over an already
/// model/health-filtered candidate list.
pub trait RoutingStrategy: Send + Sync {
    /// Short label identifying this strategy in routing results and stats.
    fn label(&self) -> &str;

    /// Choose one provider from `candidates`, which is never empty.
    fn select(&self, candidates: &[String]) -> Result<String, LlmError>;
}

/// Round-robin strategy, optionally weighted per provider.
pub struct RoundRobinStrategy {
    weights: HashMap<String, i32>,
    counter: AtomicU64,
}

impl RoundRobinStrategy {
    /// Construct with per-provider weights. Providers absent from `weights`
    /// default to weight 1.
    #[must_use]
    pub fn new(weights: HashMap<String, i32>) -> Self {
        Self {
            weights,
            counter: AtomicU64::new(0),
        }
    }

    fn expand(&self, candidates: &[String]) -> Vec<String> {
        let raw: Vec<(String, i32)> = candidates
            .iter()
            .map(|c| (c.clone(), *self.weights.get(c).unwrap_or(&1)))
            .collect();

        let any_positive = raw.iter().any(|(_, w)| *w > 0);

        let mut expanded = Vec::new();
        for (name, weight) in raw {
            let effective = if any_positive { weight.max(0) } else { 1 };
            for _ in 0..effective {
                expanded.push(name.clone());
            }
        }
        expanded
    }

    fn next_index(&self, len: usize) -> usize {
        loop {
            let current = self.counter.load(Ordering::Relaxed);
            let next = if current >= COUNTER_RESET_CEILING { 0 } else { current + 1 };
            if self
                .counter
                .compare_exchange(current, next, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return (current as usize) % len;
            }
        }
    }
}

impl RoutingStrategy for RoundRobinStrategy {
    fn label(&self) -> &str {
        "round_robin"
    }

    fn select(&self, candidates: &[String]) -> Result<String, LlmError> {
        let expanded = self.expand(candidates);
        if expanded.is_empty() {
            return Err(LlmError::NoHealthyProviders);
        }
        let idx = self.next_index(expanded.len());
        Ok(expanded[idx].clone())
    }
}

/// Returns the first provider in `candidates` that is present, else
/// delegates to a wrapped strategy, else fails.
pub struct ManualStrategy {
    preferred: Option<String>,
    wrapped: Option<Box<dyn RoutingStrategy>>,
    fallback_allowed: bool,
}

impl ManualStrategy {
    /// Construct a manual-selection strategy.
    #[must_use]
    pub fn new(
        preferred: Option<String>,
        wrapped: Option<Box<dyn RoutingStrategy>>,
        fallback_allowed: bool,
    ) -> Self {
        Self {
            preferred,
            wrapped,
            fallback_allowed,
        }
    }
}

impl RoutingStrategy for ManualStrategy {
    fn label(&self) -> &str {
        "manual"
    }

    fn select(&self, candidates: &[String]) -> Result<String, LlmError> {
        if let Some(preferred) = &self.preferred {
            if candidates.contains(preferred) {
                return Ok(preferred.clone());
            }
        }
        if self.fallback_allowed {
            if let Some(wrapped) = &self.wrapped {
                return wrapped.select(candidates);
            }
        }
        Err(LlmError::ProviderNotFound(
            self.preferred.clone().unwrap_or_default(),
        ))
    }
}

/// Wraps another strategy, narrowing the candidate list to currently
/// healthy providers before delegating.
pub struct HealthFilterStrategy {
    wrapped: Box<dyn RoutingStrategy>,
    manager: Arc<ProviderManager>,
    require_healthy: bool,
}

impl HealthFilterStrategy {
    /// Construct a health-filter decorator over `wrapped`.
    #[must_use]
    pub fn new(wrapped: Box<dyn RoutingStrategy>, manager: Arc<ProviderManager>, require_healthy: bool) -> Self {
        Self {
            wrapped,
            manager,
            require_healthy,
        }
    }
}

impl RoutingStrategy for HealthFilterStrategy {
    fn label(&self) -> &str {
        self.wrapped.label()
    }

    fn select(&self, candidates: &[String]) -> Result<String, LlmError> {
        let healthy: HashSet<String> = self.manager.healthy_names().into_iter().collect();
        let filtered: Vec<String> = candidates.iter().filter(|c| healthy.contains(*c)).cloned().collect();

        if filtered.is_empty() {
            if self.require_healthy {
                return Err(LlmError::NoHealthyProviders);
            }
            return self.wrapped.select(candidates);
        }

        self.wrapped.select(&filtered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_robin_distributes_evenly_without_weights() {
        let providers = vec!["a".to_owned(), "b".to_owned(), "c".to_owned()];
        let strat = RoundRobinStrategy::new(HashMap::new());
        let mut counts: HashMap<String, u32> = HashMap::new();
        for _ in 0..300 {
            let chosen = strat.select(&providers).expect("should select a provider");
            *counts.entry(chosen).or_default() += 1;
        }
        assert_eq!(counts["a"], 100);
        assert_eq!(counts["b"], 100);
        assert_eq!(counts["c"], 100);
    }

    #[test]
    fn round_robin_respects_weights() {
        let providers = vec!["a".to_owned(), "b".to_owned()];
        let mut weights = HashMap::new();
        weights.insert("a".to_owned(), 2);
        weights.insert("b".to_owned(), 1);
        let strat = RoundRobinStrategy::new(weights);
        let mut counts: HashMap<String, u32> = HashMap::new();
        for _ in 0..300 {
            let chosen = strat.select(&providers).expect("should select a provider");
            *counts.entry(chosen).or_default() += 1;
        }
        assert_eq!(counts["a"], 200);
        assert_eq!(counts["b"], 100);
    }

    #[test]
    fn manual_strategy_prefers_available_provider() {
        let strat = ManualStrategy::new(Some("b".to_owned()), None, false);
        let candidates = vec!["a".to_owned(), "b".to_owned()];
        assert_eq!(strat.select(&candidates).expect("should select a provider"), "b");
    }

    #[test]
    fn manual_strategy_errors_without_fallback() {
        let strat = ManualStrategy::new(Some("z".to_owned()), None, false);
        let candidates = vec!["a".to_owned(), "b".to_owned()];
        assert!(strat.select(&candidates).is_err());
    }

    #[test]
    fn manual_strategy_falls_back_when_allowed() {
        let wrapped = Box::new(RoundRobinStrategy::new(HashMap::new()));
        let strat = ManualStrategy::new(Some("z".to_owned()), Some(wrapped), true);
        let candidates = vec!["a".to_owned()];
        assert_eq!(strat.select(&candidates).expect("should select a provider"), "a");
    }
}
