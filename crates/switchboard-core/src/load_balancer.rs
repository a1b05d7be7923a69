//! Load Balancer
//!
//! Selects among healthy backends using a pluggable strategy, consuming
//! live metrics fed back by callers. Callers must bracket every
//! dispatched call with [`LoadBalancer::record_request_start`] and
//! [`LoadBalancer::record_request_end`] - the balancer has no other way
//! to learn outcomes.
//!
//! # Weighted candidate list
//!
//! Each backend contributes `max(1, round(weight x health_factor x 10))`
//! entries to a candidate list that is reshuffled on every rebuild, so
//! weighted round-robin is fair over time rather than just
//! proportionally sized. The list is regenerated whenever registration,
//! weight, or a health factor changes.

use crate::backend::{BackendStats, DisableReason};
use rand::seq::SliceRandom;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Selection strategy for the load balancer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Cyclic index into the shuffled weighted candidate list
    WeightedRoundRobin,
    /// Backend with the smallest in-flight request count
    LeastConnections,
    /// Backend with the smallest rolling average latency
    FastestResponse,
    /// Composite of speed, utilization and reliability, weight-scaled
    Adaptive,
}

/// Load balancer configuration.
#[derive(Debug, Clone)]
pub struct LoadBalancerConfig {
    /// Default selection strategy
    pub strategy: Strategy,
    /// How often health factors are recomputed and the list rebuilt
    pub maintenance_interval: Duration,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::WeightedRoundRobin,
            maintenance_interval: Duration::from_secs(30),
        }
    }
}

struct Slot {
    weight: f64,
    stats: BackendStats,
}

/// Per-backend view used in statistics snapshots.
#[derive(Debug, Clone, Serialize)]
pub struct BackendSnapshot {
    pub backend_id: String,
    pub weight: f64,
    pub health_factor: f64,
    pub active_requests: u64,
    pub total_requests: u64,
    pub total_errors: u64,
    pub avg_response_ms: f64,
    pub disabled: bool,
}

/// Serializable load balancer state for operators.
#[derive(Debug, Clone, Serialize)]
pub struct LoadBalancerSnapshot {
    pub strategy: String,
    pub candidate_entries: usize,
    pub backends: Vec<BackendSnapshot>,
}

/// Metric- and weight-aware backend selector.
///
/// Backends are tracked in registration order so strategies with score
/// ties deterministically prefer the first-seen backend.
pub struct LoadBalancer {
    slots: HashMap<String, Slot>,
    order: Vec<String>,
    weighted: Vec<String>,
    cursor: usize,
    strategy: Strategy,
}

impl LoadBalancer {
    /// Creates an empty load balancer with the given default strategy.
    pub fn new(strategy: Strategy) -> Self {
        Self {
            slots: HashMap::new(),
            order: Vec::new(),
            weighted: Vec::new(),
            cursor: 0,
            strategy,
        }
    }

    /// Registers a backend with a selection weight (1.0 is neutral).
    ///
    /// Duplicate registrations are ignored (no-op).
    pub fn register(&mut self, backend_id: impl Into<String>, weight: f64) {
        let backend_id = backend_id.into();
        if self.slots.contains_key(&backend_id) {
            return;
        }
        self.slots.insert(
            backend_id.clone(),
            Slot {
                weight,
                stats: BackendStats::new(),
            },
        );
        self.order.push(backend_id);
        self.rebuild_weighted();
    }

    /// Removes a backend entirely.
    pub fn unregister(&mut self, backend_id: &str) {
        if self.slots.remove(backend_id).is_some() {
            self.order.retain(|id| id != backend_id);
            self.rebuild_weighted();
        }
    }

    /// Updates a backend's weight.
    ///
    /// # Returns
    ///
    /// `false` when the backend is unknown.
    pub fn set_weight(&mut self, backend_id: &str, weight: f64) -> bool {
        match self.slots.get_mut(backend_id) {
            Some(slot) => {
                slot.weight = weight;
                self.rebuild_weighted();
                true
            }
            None => false,
        }
    }

    /// Manually excludes a backend from selection.
    ///
    /// Manual exclusion is never undone by health recovery; it requires
    /// an explicit [`enable`](Self::enable).
    pub fn disable(&mut self, backend_id: &str) -> bool {
        match self.slots.get_mut(backend_id) {
            Some(slot) => {
                slot.stats.disable_reason = Some(DisableReason::Manual);
                info!(backend_id, "backend manually disabled");
                true
            }
            None => false,
        }
    }

    /// Re-admits a manually excluded backend.
    pub fn enable(&mut self, backend_id: &str) -> bool {
        match self.slots.get_mut(backend_id) {
            Some(slot) => {
                slot.stats.disable_reason = None;
                info!(backend_id, "backend manually enabled");
                true
            }
            None => false,
        }
    }

    /// Number of registered backends (including disabled ones).
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Registered backend IDs in registration order.
    pub fn backend_ids(&self) -> Vec<String> {
        self.order.clone()
    }

    /// Current health factor for one backend.
    pub fn health_factor(&self, backend_id: &str) -> Option<f64> {
        self.slots.get(backend_id).map(|s| s.stats.health_factor)
    }

    /// Overrides one backend's health factor and rebuilds the list.
    ///
    /// Used by the health monitor to push probe-derived factors; the
    /// periodic maintenance pass recomputes factors from recorded
    /// outcomes.
    pub fn set_health_factor(&mut self, backend_id: &str, factor: f64) -> bool {
        match self.slots.get_mut(backend_id) {
            Some(slot) => {
                slot.stats.health_factor = factor.clamp(0.0, 1.0);
                self.rebuild_weighted();
                true
            }
            None => false,
        }
    }

    /// Records the start of a dispatched call. Must be paired with
    /// [`record_request_end`](Self::record_request_end).
    pub fn record_request_start(&mut self, backend_id: &str) {
        if let Some(slot) = self.slots.get_mut(backend_id) {
            slot.stats.record_start();
        }
    }

    /// Records the outcome of a dispatched call.
    ///
    /// # Arguments
    ///
    /// * `success` - Whether the call succeeded
    /// * `latency_ms` - Observed latency in milliseconds
    pub fn record_request_end(&mut self, backend_id: &str, success: bool, latency_ms: f64) {
        if let Some(slot) = self.slots.get_mut(backend_id) {
            slot.stats.record_end(success, latency_ms);
        }
    }

    /// Selects a backend using the configured default strategy.
    pub fn select(&mut self) -> Option<String> {
        self.select_with(self.strategy)
    }

    /// Selects a backend using an explicit strategy.
    ///
    /// # Returns
    ///
    /// `None` when no selectable backend exists (all disabled or at
    /// health factor zero).
    pub fn select_with(&mut self, strategy: Strategy) -> Option<String> {
        match strategy {
            Strategy::WeightedRoundRobin => self.select_round_robin(),
            Strategy::LeastConnections => {
                self.select_by_key(|stats, _| stats.active_requests as f64, false)
            }
            Strategy::FastestResponse => self.select_by_key(|stats, _| stats.avg_response_ms, false),
            Strategy::Adaptive => self.select_by_key(Self::adaptive_score, true),
        }
    }

    fn select_round_robin(&mut self) -> Option<String> {
        if self.weighted.is_empty() {
            return None;
        }
        for _ in 0..self.weighted.len() {
            let idx = self.cursor % self.weighted.len();
            self.cursor = self.cursor.wrapping_add(1);
            let candidate = &self.weighted[idx];
            if self
                .slots
                .get(candidate)
                .map(|s| s.stats.selectable())
                .unwrap_or(false)
            {
                return Some(candidate.clone());
            }
        }
        None
    }

    /// Picks the selectable backend minimizing (or maximizing) a key,
    /// ties broken by registration order.
    fn select_by_key(
        &self,
        key: impl Fn(&BackendStats, f64) -> f64,
        maximize: bool,
    ) -> Option<String> {
        let mut best: Option<(&str, f64)> = None;
        for backend_id in &self.order {
            let slot = &self.slots[backend_id];
            if !slot.stats.selectable() {
                continue;
            }
            let score = key(&slot.stats, slot.weight);
            let better = match best {
                None => true,
                Some((_, current)) => {
                    if maximize {
                        score > current
                    } else {
                        score < current
                    }
                }
            };
            if better {
                best = Some((backend_id, score));
            }
        }
        best.map(|(id, _)| id.to_string())
    }

    /// Composite adaptive score: weight x (0.4 speed + 0.4 utilization +
    /// 0.2 reliability), each component normalized into (0, 1].
    fn adaptive_score(stats: &BackendStats, weight: f64) -> f64 {
        let speed = 1.0 / (1.0 + stats.avg_response_ms / 1000.0);
        let utilization = 1.0 / (1.0 + stats.active_requests as f64);
        let reliability = 1.0 - stats.error_rate();
        weight * (0.4 * speed + 0.4 * utilization + 0.2 * reliability)
    }

    /// Recomputes every backend's health factor from its recorded
    /// outcomes and rebuilds the weighted list when anything changed.
    ///
    /// Backends with at most 10 recorded requests are skipped to avoid
    /// cold-start noise.
    pub fn run_maintenance(&mut self) {
        let mut changed = false;
        for slot in self.slots.values_mut() {
            changed |= slot.stats.recompute_health_factor();
        }
        if changed {
            debug!("health factors changed, rebuilding weighted list");
            self.rebuild_weighted();
        }
    }

    /// Regenerates and shuffles the weighted candidate list.
    ///
    /// Every registered backend contributes at least one entry; the
    /// floor keeps the formula total-ordering-free, while zero-factor
    /// backends are excluded at selection time.
    fn rebuild_weighted(&mut self) {
        self.weighted.clear();
        for backend_id in &self.order {
            let slot = &self.slots[backend_id];
            let entries = ((slot.weight * slot.stats.health_factor * 10.0).round() as usize).max(1);
            for _ in 0..entries {
                self.weighted.push(backend_id.clone());
            }
        }
        self.weighted.shuffle(&mut rand::thread_rng());
        self.cursor = 0;
    }

    /// Serializable snapshot of balancer state.
    pub fn snapshot(&self) -> LoadBalancerSnapshot {
        LoadBalancerSnapshot {
            strategy: format!("{:?}", self.strategy),
            candidate_entries: self.weighted.len(),
            backends: self
                .order
                .iter()
                .map(|id| {
                    let slot = &self.slots[id];
                    BackendSnapshot {
                        backend_id: id.clone(),
                        weight: slot.weight,
                        health_factor: slot.stats.health_factor,
                        active_requests: slot.stats.active_requests,
                        total_requests: slot.stats.total_requests,
                        total_errors: slot.stats.total_errors,
                        avg_response_ms: slot.stats.avg_response_ms,
                        disabled: slot.stats.disable_reason.is_some(),
                    }
                })
                .collect(),
        }
    }

    /// Spawns the periodic maintenance task.
    ///
    /// # Arguments
    ///
    /// * `lb` - Shared balancer to maintain
    /// * `interval` - Recomputation period (default 30s via config)
    pub fn spawn_maintenance(
        lb: Arc<RwLock<LoadBalancer>>,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately; skip it so the first
            // recomputation happens one full interval after startup.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let mut lb = lb.write().await;
                lb.run_maintenance();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn balancer_with(backends: &[(&str, f64)]) -> LoadBalancer {
        let mut lb = LoadBalancer::new(Strategy::WeightedRoundRobin);
        for (id, weight) in backends {
            lb.register(*id, *weight);
        }
        lb
    }

    #[test]
    fn test_empty_returns_none() {
        let mut lb = LoadBalancer::new(Strategy::WeightedRoundRobin);
        assert_eq!(lb.select(), None);
    }

    #[test]
    fn test_register_and_count() {
        let lb = balancer_with(&[("a", 1.0), ("b", 1.0)]);
        assert_eq!(lb.len(), 2);
        assert_eq!(lb.backend_ids(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_duplicate_register_ignored() {
        let mut lb = balancer_with(&[("a", 1.0)]);
        lb.register("a", 5.0);
        assert_eq!(lb.len(), 1);
        // Original weight kept
        assert_eq!(lb.snapshot().backends[0].weight, 1.0);
    }

    #[test]
    fn test_unregister() {
        let mut lb = balancer_with(&[("a", 1.0), ("b", 1.0)]);
        lb.unregister("a");
        assert_eq!(lb.len(), 1);
        for _ in 0..10 {
            assert_eq!(lb.select(), Some("b".to_string()));
        }
    }

    #[test]
    fn test_round_robin_fairness_equal_weights() {
        let mut lb = balancer_with(&[("a", 1.0), ("b", 1.0), ("c", 1.0)]);
        let mut counts: HashMap<String, usize> = HashMap::new();
        // 300 draws over a 30-entry list: exactly 100 each
        for _ in 0..300 {
            *counts.entry(lb.select().unwrap()).or_default() += 1;
        }
        assert_eq!(counts["a"], 100);
        assert_eq!(counts["b"], 100);
        assert_eq!(counts["c"], 100);
    }

    #[test]
    fn test_round_robin_respects_weight_ratio() {
        let mut lb = balancer_with(&[("heavy", 2.0), ("light", 1.0)]);
        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..300 {
            *counts.entry(lb.select().unwrap()).or_default() += 1;
        }
        // 20 entries vs 10 entries: exactly 2:1 over full cycles
        assert_eq!(counts["heavy"], 200);
        assert_eq!(counts["light"], 100);
    }

    #[test]
    fn test_zero_health_factor_excluded_from_selection() {
        let mut lb = balancer_with(&[("sick", 1.0), ("ok", 1.0)]);
        lb.set_health_factor("sick", 0.0);
        for _ in 0..20 {
            assert_eq!(lb.select(), Some("ok".to_string()));
        }
    }

    #[test]
    fn test_health_factor_shrinks_share_without_deregistering() {
        let mut lb = balancer_with(&[("weak", 1.0), ("strong", 1.0)]);
        lb.set_health_factor("weak", 0.1);
        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..110 {
            *counts.entry(lb.select().unwrap()).or_default() += 1;
        }
        // 1 entry vs 10 entries
        assert_eq!(counts["weak"], 10);
        assert_eq!(counts["strong"], 100);
        assert_eq!(lb.len(), 2);
    }

    #[test]
    fn test_manual_disable_and_enable() {
        let mut lb = balancer_with(&[("a", 1.0), ("b", 1.0)]);
        assert!(lb.disable("a"));
        for _ in 0..10 {
            assert_eq!(lb.select(), Some("b".to_string()));
        }
        assert!(lb.enable("a"));
        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..20 {
            *counts.entry(lb.select().unwrap()).or_default() += 1;
        }
        assert!(counts.contains_key("a"));
    }

    #[test]
    fn test_disable_unknown_backend() {
        let mut lb = balancer_with(&[("a", 1.0)]);
        assert!(!lb.disable("nope"));
        assert!(!lb.enable("nope"));
        assert!(!lb.set_weight("nope", 2.0));
        assert!(!lb.set_health_factor("nope", 0.5));
    }

    #[test]
    fn test_all_disabled_returns_none() {
        let mut lb = balancer_with(&[("a", 1.0), ("b", 1.0)]);
        lb.disable("a");
        lb.disable("b");
        assert_eq!(lb.select(), None);
    }

    #[test]
    fn test_least_connections() {
        let mut lb = balancer_with(&[("busy", 1.0), ("idle", 1.0)]);
        lb.record_request_start("busy");
        lb.record_request_start("busy");
        lb.record_request_start("idle");
        assert_eq!(
            lb.select_with(Strategy::LeastConnections),
            Some("idle".to_string())
        );
    }

    #[test]
    fn test_least_connections_tie_prefers_first_seen() {
        let mut lb = balancer_with(&[("first", 1.0), ("second", 1.0)]);
        assert_eq!(
            lb.select_with(Strategy::LeastConnections),
            Some("first".to_string())
        );
    }

    #[test]
    fn test_fastest_response() {
        let mut lb = balancer_with(&[("slow", 1.0), ("fast", 1.0)]);
        lb.record_request_start("slow");
        lb.record_request_end("slow", true, 800.0);
        lb.record_request_start("fast");
        lb.record_request_end("fast", true, 50.0);
        assert_eq!(
            lb.select_with(Strategy::FastestResponse),
            Some("fast".to_string())
        );
    }

    #[test]
    fn test_adaptive_prefers_reliable_fast_backend() {
        let mut lb = balancer_with(&[("flaky", 1.0), ("solid", 1.0)]);
        for _ in 0..20 {
            lb.record_request_start("flaky");
            lb.record_request_end("flaky", false, 400.0);
            lb.record_request_start("solid");
            lb.record_request_end("solid", true, 400.0);
        }
        assert_eq!(lb.select_with(Strategy::Adaptive), Some("solid".to_string()));
    }

    #[test]
    fn test_adaptive_weight_scales_score() {
        let mut lb = balancer_with(&[("light", 1.0), ("heavy", 3.0)]);
        // Identical stats; the heavier weight wins
        assert_eq!(lb.select_with(Strategy::Adaptive), Some("heavy".to_string()));
    }

    #[test]
    fn test_maintenance_downgrades_error_prone_backend() {
        let mut lb = balancer_with(&[("errors", 1.0), ("clean", 1.0)]);
        for _ in 0..20 {
            lb.record_request_start("errors");
            lb.record_request_end("errors", false, 100.0);
            lb.record_request_start("clean");
            lb.record_request_end("clean", true, 100.0);
        }
        lb.run_maintenance();
        assert_eq!(lb.health_factor("errors"), Some(0.1));
        assert_eq!(lb.health_factor("clean"), Some(1.0));

        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..110 {
            *counts.entry(lb.select().unwrap()).or_default() += 1;
        }
        assert_eq!(counts["errors"], 10);
        assert_eq!(counts["clean"], 100);
    }

    #[test]
    fn test_maintenance_skips_cold_backends() {
        let mut lb = balancer_with(&[("cold", 1.0)]);
        for _ in 0..5 {
            lb.record_request_start("cold");
            lb.record_request_end("cold", false, 100.0);
        }
        lb.run_maintenance();
        // Only 5 requests recorded, so the factor is untouched
        assert_eq!(lb.health_factor("cold"), Some(1.0));
    }

    #[test]
    fn test_snapshot() {
        let mut lb = balancer_with(&[("a", 2.0)]);
        lb.record_request_start("a");
        lb.record_request_end("a", true, 42.0);
        let snapshot = lb.snapshot();
        assert_eq!(snapshot.strategy, "WeightedRoundRobin");
        assert_eq!(snapshot.backends.len(), 1);
        assert_eq!(snapshot.backends[0].weight, 2.0);
        assert_eq!(snapshot.backends[0].total_requests, 1);
        assert_eq!(snapshot.backends[0].avg_response_ms, 42.0);
        assert_eq!(snapshot.candidate_entries, 20);
        // Snapshot serializes cleanly for operator export
        assert!(serde_json::to_string(&snapshot).is_ok());
    }

    #[tokio::test]
    async fn test_spawn_maintenance_recomputes() {
        let lb = Arc::new(RwLock::new(balancer_with(&[("a", 1.0)])));
        {
            let mut lb = lb.write().await;
            for _ in 0..20 {
                lb.record_request_start("a");
                lb.record_request_end("a", false, 100.0);
            }
        }
        let handle =
            LoadBalancer::spawn_maintenance(lb.clone(), Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(lb.read().await.health_factor("a"), Some(0.1));
        handle.abort();
    }
}
