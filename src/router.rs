//! `CapabilityRouter`: scores and selects agents for a capability,
//! with version constraints, a short-lived cache, and fallback routing.
//!
//! Grounded in the reference system's `EnhancedCapabilityRouter` —
//! same scoring weights, a configurable cache TTL (`RuntimeConfig::routing_cache_ttl`,
//! 60 seconds by default), and the same fail-open version grammar (see
//! [`crate::capability::version_compatible`]).
//! The cache is invalidated on every registry mutation this router
//! observes, via [`crate::registry::RegistryObserver`].

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{instrument, warn};

use crate::agent::{AgentHandle, AgentMessage, AgentStatus};
use crate::capability::{version_compatible, Capability, CapabilityKind};
use crate::config::RuntimeConfig;
use crate::error::{CoreError, CoreResult};
use crate::registry::{AgentRegistry, RegistryObserver};
use crate::types::{AgentId, Score};

/// A scored candidate for a capability.
#[derive(Debug, Clone)]
pub struct CapabilityMatch {
    /// The candidate agent.
    pub agent_id: AgentId,
    /// The specific capability that matched.
    pub capability: Capability,
    /// The computed score.
    pub score: Score,
    /// Whether the agent's version satisfied the requested requirement.
    pub version_compatible: bool,
}

/// Preferences that bias scoring toward or away from specific agents.
#[derive(Debug, Clone, Default)]
pub struct RoutingPreferences {
    /// Agents to prefer (+0.2 each).
    pub preferred_agents: Vec<AgentId>,
    /// Agents to avoid (−0.3 each).
    pub avoid_agents: Vec<AgentId>,
}

/// Rolling routing metrics, exposed via `get_metrics`.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct RoutingMetrics {
    /// Total `find_best_agent` calls.
    pub total_routes: u64,
    /// Calls that found at least one qualifying agent.
    pub successful_routes: u64,
    /// Calls that found none.
    pub failed_routes: u64,
    /// Rolling average selection time, in milliseconds.
    pub avg_selection_time_ms: f64,
    /// Number of times fallback routing was used.
    pub fallback_count: u64,
    /// Per-kind usage counts.
    pub capability_usage: HashMap<String, u64>,
}

impl RoutingMetrics {
    /// Fraction of routes that succeeded, or `0.0` if none were attempted.
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        if self.total_routes == 0 {
            0.0
        } else {
            self.successful_routes as f64 / self.total_routes as f64
        }
    }
}

struct CacheEntry {
    matches: Vec<CapabilityMatch>,
    inserted_at: Instant,
}

/// Coverage report from `get_capability_coverage`.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct CoverageReport {
    /// Agent count per registered capability kind.
    pub agents_per_kind: HashMap<String, usize>,
    /// Kinds covered by exactly one agent.
    pub single_point_failures: Vec<String>,
    /// Kinds with zero capable agents.
    pub uncovered: Vec<String>,
    /// Percentage of observed kinds that have at least one agent.
    pub coverage_percentage: f64,
}

/// Scores, caches, and selects agents for a capability.
pub struct CapabilityRouter {
    registry: Arc<AgentRegistry>,
    cache: RwLock<HashMap<String, CacheEntry>>,
    metrics: RwLock<RoutingMetrics>,
    known_kinds: RwLock<std::collections::HashSet<String>>,
    config: RuntimeConfig,
}

impl CapabilityRouter {
    /// Builds a router over `registry`, reading its cache TTL, default
    /// score floor, and metrics-collection toggle from `config`.
    #[must_use]
    pub fn new(registry: Arc<AgentRegistry>, config: RuntimeConfig) -> Self {
        Self {
            registry,
            cache: RwLock::new(HashMap::new()),
            metrics: RwLock::new(RoutingMetrics::default()),
            known_kinds: RwLock::new(std::collections::HashSet::new()),
            config,
        }
    }

    fn cache_key(kind: &CapabilityKind, version_req: Option<&str>) -> String {
        format!("{}:{}", kind.as_str(), version_req.unwrap_or(""))
    }

    /// Scores every registered agent capable of `kind` against
    /// `version_req` and `prefs`, using a `config.routing_cache_ttl` cache
    /// keyed by `(kind, version_req)`.
    #[instrument(skip(self, prefs))]
    pub async fn score_agents_for_capability(
        &self,
        kind: &CapabilityKind,
        version_req: Option<&str>,
        prefs: Option<&RoutingPreferences>,
    ) -> Vec<CapabilityMatch> {
        self.known_kinds.write().await.insert(kind.as_str().to_string());

        let key = Self::cache_key(kind, version_req);
        if prefs.is_none() {
            if let Some(entry) = self.cache.read().await.get(&key) {
                if entry.inserted_at.elapsed() < self.config.routing_cache_ttl {
                    return entry.matches.clone();
                }
            }
        }

        let candidates = self.registry.get_agents_by_capability(kind).await;
        let mut matches = Vec::with_capacity(candidates.len());
        for agent in candidates {
            let Ok(caps) = agent.capabilities().await else {
                continue;
            };
            let Some(cap) = caps.into_iter().find(|c| &c.kind == kind) else {
                continue;
            };
            let compatible = version_req
                .map(|req| version_compatible(cap.version.as_ref(), req))
                .unwrap_or(true);
            let score = score_match(agent.id(), &cap, version_req, compatible, agent.status().await, prefs);
            matches.push(CapabilityMatch {
                agent_id: agent.id().clone(),
                capability: cap,
                score,
                version_compatible: compatible,
            });
        }

        if prefs.is_none() {
            self.cache.write().await.insert(
                key,
                CacheEntry {
                    matches: matches.clone(),
                    inserted_at: Instant::now(),
                },
            );
        }

        matches
    }

    /// Finds the best agent for `kind`, filtering by `min_score` (default
    /// `config.default_min_score`) and breaking ties by registration recency.
    #[instrument(skip(self, prefs))]
    pub async fn find_best_agent(
        &self,
        kind: &CapabilityKind,
        version_req: Option<&str>,
        min_score: Option<f64>,
        prefs: Option<&RoutingPreferences>,
    ) -> Option<Arc<dyn AgentHandle>> {
        let started = Instant::now();
        let floor = min_score.unwrap_or(self.config.default_min_score);

        let mut matches = self.score_agents_for_capability(kind, version_req, prefs).await;
        matches.retain(|m| f64::from(m.score) >= floor);

        let agents = self.registry.get_agents_by_capability(kind).await;
        let index_of = |id: &AgentId| {
            agents
                .iter()
                .find(|a| a.id() == id)
                .and_then(|a| a.registration_index())
        };
        matches.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| index_of(&b.agent_id).cmp(&index_of(&a.agent_id)))
        });

        let winner = matches.first().and_then(|m| self.registry.get_agent(&m.agent_id));

        if self.config.metrics_enabled {
            let mut metrics = self.metrics.write().await;
            metrics.total_routes += 1;
            *metrics
                .capability_usage
                .entry(kind.as_str().to_string())
                .or_insert(0) += 1;
            if winner.is_some() {
                metrics.successful_routes += 1;
            } else {
                metrics.failed_routes += 1;
                warn!(capability = %kind, "no agent met the score threshold");
            }
            let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
            let n = metrics.total_routes as f64;
            metrics.avg_selection_time_ms =
                (metrics.avg_selection_time_ms * (n - 1.0) + elapsed_ms) / n;
        } else if winner.is_none() {
            warn!(capability = %kind, "no agent met the score threshold");
        }

        winner
    }

    /// Resolves a best agent per kind in `kinds`, excluding `sender_id`
    /// from consideration (so an agent never negotiates with itself).
    pub async fn negotiate_capabilities(
        &self,
        sender_id: &AgentId,
        kinds: &[CapabilityKind],
        version_reqs: Option<&HashMap<String, String>>,
    ) -> HashMap<String, Option<AgentId>> {
        let mut result = HashMap::new();
        let prefs = RoutingPreferences {
            preferred_agents: vec![],
            avoid_agents: vec![sender_id.clone()],
        };
        for kind in kinds {
            let req = version_reqs.and_then(|m| m.get(kind.as_str())).map(String::as_str);
            let agent = self.find_best_agent(kind, req, None, Some(&prefs)).await;
            result.insert(kind.as_str().to_string(), agent.map(|a| a.id().clone()));
        }
        result
    }

    /// Tries `primary_kind` first; on failure to find or successfully
    /// process via an agent, tries each of `fallback_kinds` in order,
    /// incrementing `fallback_count` on the first fallback attempted.
    ///
    /// # Errors
    /// Returns [`CoreError::RouteFailed`] if every kind (primary and
    /// fallbacks) is exhausted without a successful delivery.
    #[instrument(skip(self, message))]
    pub async fn route_with_fallback(
        &self,
        message: AgentMessage,
        primary_kind: &CapabilityKind,
        fallback_kinds: &[CapabilityKind],
    ) -> CoreResult<serde_json::Value> {
        if let Some(agent) = self.find_best_agent(primary_kind, None, None, None).await {
            if let Ok(value) = agent.process_message(message.clone()).await {
                return Ok(value);
            }
        }

        let mut incremented = false;
        for kind in fallback_kinds {
            let Some(agent) = self.find_best_agent(kind, None, None, None).await else {
                continue;
            };
            if !incremented {
                if self.config.metrics_enabled {
                    self.metrics.write().await.fallback_count += 1;
                }
                incremented = true;
            }
            if let Ok(value) = agent.process_message(message.clone()).await {
                return Ok(value);
            }
        }

        Err(CoreError::RouteFailed(format!(
            "no agent available for {primary_kind} or its fallbacks"
        )))
    }

    /// Reports, for every capability kind this router has observed,
    /// the agent count, single-point-of-failure kinds, and overall
    /// coverage percentage.
    pub async fn get_capability_coverage(&self) -> CoverageReport {
        let kinds: Vec<String> = self.known_kinds.read().await.iter().cloned().collect();
        let mut report = CoverageReport::default();
        let mut covered = 0usize;
        for kind in &kinds {
            let count = self
                .registry
                .get_agents_by_capability(&CapabilityKind::parse(kind))
                .await
                .len();
            report.agents_per_kind.insert(kind.clone(), count);
            match count {
                0 => report.uncovered.push(kind.clone()),
                1 => {
                    covered += 1;
                    report.single_point_failures.push(kind.clone());
                }
                _ => covered += 1,
            }
        }
        report.coverage_percentage = if kinds.is_empty() {
            0.0
        } else {
            (covered as f64 / kinds.len() as f64) * 100.0
        };
        report
    }

    /// Current rolling metrics snapshot.
    pub async fn get_metrics(&self) -> RoutingMetrics {
        self.metrics.read().await.clone()
    }

    /// Drops every cached scoring result.
    pub async fn clear_cache(&self) {
        self.cache.write().await.clear();
    }
}

fn score_match(
    agent_id: &AgentId,
    cap: &Capability,
    version_req: Option<&str>,
    version_ok: bool,
    status: AgentStatus,
    prefs: Option<&RoutingPreferences>,
) -> Score {
    let mut score: f64 = 0.5;

    if version_req.is_none() || version_ok {
        score += 0.3;
    }

    match prefs {
        Some(p) if p.preferred_agents.contains(agent_id) => score += 0.2,
        Some(p) if p.avoid_agents.contains(agent_id) => score -= 0.3,
        Some(_) => {}
        None => score += 0.1,
    }

    match status {
        AgentStatus::Idle => score += 0.1,
        AgentStatus::Error => score -= 0.2,
        _ => {}
    }

    let _ = cap;
    Score::try_new(score.clamp(0.0, 1.0)).unwrap_or_else(|_| Score::zero())
}

/// Implements the cache-invalidation half of [`RegistryObserver`]: any
/// registry mutation the router hears about clears its scoring cache,
/// matching the reference system's policy of never serving a stale
/// routing decision past a registration change.
#[async_trait]
impl RegistryObserver for CapabilityRouter {
    async fn on_agent_registered(&self, _agent_id: &AgentId) {
        self.clear_cache().await;
    }

    async fn on_agent_unregistered(&self, _agent_id: &AgentId) {
        self.clear_cache().await;
    }

    async fn on_capability_updated(&self, _agent_id: &AgentId, _capabilities: &[Capability]) {
        self.clear_cache().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{Agent, Echo};
    use crate::notifier::WorkflowNotifier;
    use crate::recovery::RecoveryStrategyEngine;

    fn agent_id(s: &str) -> AgentId {
        AgentId::try_new(s.to_string()).unwrap()
    }

    async fn registry_with(agents: Vec<(&str, &str)>) -> Arc<AgentRegistry> {
        let registry = Arc::new(AgentRegistry::new(
            WorkflowNotifier::start(),
            Arc::new(RecoveryStrategyEngine::new()),
            RuntimeConfig::test(),
        ));
        for (id, version) in agents {
            let agent = Arc::new(Agent::new(agent_id(id), "worker", Echo));
            registry
                .register_agent(
                    agent,
                    vec![Capability::at_version(
                        CapabilityKind::MessageProcessing,
                        crate::types::CapabilityVersion::try_new(version.to_string()).unwrap(),
                    )],
                )
                .await
                .unwrap();
        }
        registry
    }

    #[tokio::test]
    async fn selects_the_version_satisfying_candidate() {
        let registry = registry_with(vec![("v1", "1.0"), ("v2", "2.0")]).await;
        let router = CapabilityRouter::new(registry, RuntimeConfig::test());

        let winner = router
            .find_best_agent(&CapabilityKind::MessageProcessing, Some(">=2.0"), None, None)
            .await
            .unwrap();
        assert_eq!(winner.id(), &agent_id("v2"));
    }

    #[tokio::test]
    async fn tied_score_candidates_are_broken_by_registration_recency() {
        let registry = registry_with(vec![("v1", "1.0"), ("v2", "2.0")]).await;
        let router = CapabilityRouter::new(registry, RuntimeConfig::test());

        // Both "1.0" and "2.0" satisfy ">=1.0", so they score identically;
        // the more recently registered agent (v2) must win the tie.
        let winner = router
            .find_best_agent(&CapabilityKind::MessageProcessing, Some(">=1.0"), None, None)
            .await
            .unwrap();
        assert_eq!(winner.id(), &agent_id("v2"));
    }

    #[tokio::test]
    async fn fallback_routing_increments_fallback_count_once() {
        let registry = registry_with(vec![("worker", "1.0")]).await;
        let router = CapabilityRouter::new(registry, RuntimeConfig::test());

        let msg = AgentMessage::try_new(
            agent_id("caller"),
            agent_id("worker"),
            serde_json::json!({"q": 1}),
            "ask",
        )
        .unwrap();

        let result = router
            .route_with_fallback(msg, &CapabilityKind::Research, &[CapabilityKind::MessageProcessing])
            .await
            .unwrap();
        assert_eq!(result, serde_json::json!({"q": 1}));
        assert_eq!(router.get_metrics().await.fallback_count, 1);
    }
}
