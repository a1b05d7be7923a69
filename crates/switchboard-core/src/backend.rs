//! Backend registration and per-backend runtime state.
//!
//! One [`BackendStats`] record exists per registered backend. It is
//! mutated only through the load balancer's and health monitor's APIs;
//! no other subsystem reaches into it directly.

use crate::adapter::BackendAdapter;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

/// Sliding window size for observed response times.
pub const RESPONSE_WINDOW: usize = 20;

/// Minimum recorded requests before health factors are computed.
///
/// Below this, the factor stays at its prior value to avoid cold-start
/// noise dominating selection.
pub const HEALTH_FACTOR_MIN_SAMPLES: u64 = 10;

/// Shared registry mapping backend IDs to their adapters.
///
/// Owned by the manager façade; the batch coordinator, health monitor
/// and lifecycle manager hold clones.
pub type AdapterRegistry = Arc<RwLock<HashMap<String, Arc<dyn BackendAdapter>>>>;

/// A registered backend: caller-assigned identity, selection weight and
/// the adapter wrapping the underlying client object.
#[derive(Clone)]
pub struct BackendRegistration {
    /// Unique, caller-assigned identifier
    pub backend_id: String,
    /// Selection weight (default 1.0); influences selection probability
    pub weight: f64,
    /// Adapter over the underlying client/server object
    pub adapter: Arc<dyn BackendAdapter>,
}

impl BackendRegistration {
    pub fn new(backend_id: impl Into<String>, weight: f64, adapter: Arc<dyn BackendAdapter>) -> Self {
        Self {
            backend_id: backend_id.into(),
            weight,
            adapter,
        }
    }
}

/// Why a backend is excluded from selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisableReason {
    /// Manually disabled by an operator - never auto-re-enabled
    Manual,
}

/// Per-backend runtime state fed by request outcomes.
///
/// Tracks in-flight and cumulative counts, a bounded sliding window of
/// response times, and the derived health factor in `[0.0, 1.0]` that
/// down-weights unhealthy backends in selection.
#[derive(Debug, Clone)]
pub struct BackendStats {
    /// Requests currently in flight
    pub active_requests: u64,
    /// Cumulative dispatched requests
    pub total_requests: u64,
    /// Cumulative failed requests
    pub total_errors: u64,
    /// Rolling average over the response-time window, in milliseconds
    pub avg_response_ms: f64,
    /// Derived health factor in [0.0, 1.0]
    pub health_factor: f64,
    /// Operator exclusion, distinct from health-driven down-weighting
    pub disable_reason: Option<DisableReason>,
    /// When the stats were last touched
    pub last_updated: Instant,
    response_times: VecDeque<f64>,
}

impl BackendStats {
    pub fn new() -> Self {
        Self {
            active_requests: 0,
            total_requests: 0,
            total_errors: 0,
            avg_response_ms: 0.0,
            health_factor: 1.0,
            disable_reason: None,
            last_updated: Instant::now(),
            response_times: VecDeque::with_capacity(RESPONSE_WINDOW),
        }
    }

    /// Records the start of a dispatched request.
    pub fn record_start(&mut self) {
        self.active_requests += 1;
        self.total_requests += 1;
        self.last_updated = Instant::now();
    }

    /// Records the completion of a dispatched request.
    ///
    /// # Arguments
    ///
    /// * `success` - Whether the call succeeded
    /// * `latency_ms` - Observed wall-clock latency
    pub fn record_end(&mut self, success: bool, latency_ms: f64) {
        self.active_requests = self.active_requests.saturating_sub(1);
        if !success {
            self.total_errors += 1;
        }

        if self.response_times.len() == RESPONSE_WINDOW {
            self.response_times.pop_front();
        }
        self.response_times.push_back(latency_ms);
        self.avg_response_ms =
            self.response_times.iter().sum::<f64>() / self.response_times.len() as f64;
        self.last_updated = Instant::now();
    }

    /// Fraction of requests that failed, in [0.0, 1.0].
    pub fn error_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }
        self.total_errors as f64 / self.total_requests as f64
    }

    /// Recomputes the health factor from error rate and latency.
    ///
    /// Error rate above 50% drops the factor to 0.1, above 20% to 0.5,
    /// above 10% to 0.8; otherwise it is 1.0. The result is multiplied by
    /// a latency penalty: x0.5 above 5000ms average, x0.8 above 2000ms.
    /// Skipped (returns false) until the backend has accumulated more
    /// than [`HEALTH_FACTOR_MIN_SAMPLES`] requests.
    ///
    /// # Returns
    ///
    /// `true` when the factor changed.
    pub fn recompute_health_factor(&mut self) -> bool {
        if self.total_requests <= HEALTH_FACTOR_MIN_SAMPLES {
            return false;
        }

        let error_rate = self.error_rate();
        let base = if error_rate > 0.5 {
            0.1
        } else if error_rate > 0.2 {
            0.5
        } else if error_rate > 0.1 {
            0.8
        } else {
            1.0
        };

        let latency_penalty = if self.avg_response_ms > 5000.0 {
            0.5
        } else if self.avg_response_ms > 2000.0 {
            0.8
        } else {
            1.0
        };

        let factor = base * latency_penalty;
        let changed = (factor - self.health_factor).abs() > f64::EPSILON;
        self.health_factor = factor;
        changed
    }

    /// Returns whether the backend may receive traffic at all.
    ///
    /// A manually disabled backend or one with a zero health factor is
    /// excluded from selection without being deregistered.
    pub fn selectable(&self) -> bool {
        self.disable_reason.is_none() && self.health_factor > 0.0
    }
}

impl Default for BackendStats {
    fn default() -> Self {
        Self::new()
    }
}
