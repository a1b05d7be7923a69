//! Health Monitor
//!
//! Probes every registered backend concurrently and aggregates the
//! results into a single report. Connectivity failures are retried with
//! a delay before a backend is declared unhealthy; auth or protocol
//! compliance problems on an otherwise reachable backend only degrade
//! it.
//!
//! When wired to a load balancer, probe outcomes feed back into
//! selection: an unhealthy backend's health factor drops to zero
//! (excluding it from traffic) and recovers once a probe succeeds.

use crate::backend::AdapterRegistry;
use crate::events::now_ms;
use crate::load_balancer::LoadBalancer;
use futures::future::join_all;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use switchboard_common::auth::AuthAdapter;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Retained probe results per backend.
const HISTORY_CAP: usize = 50;

/// Health of one component or of the whole layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

impl HealthStatus {
    /// Ordering for aggregation; higher is worse.
    fn severity(self) -> u8 {
        match self {
            HealthStatus::Healthy => 0,
            HealthStatus::Unknown => 1,
            HealthStatus::Degraded => 2,
            HealthStatus::Unhealthy => 3,
        }
    }
}

/// Worst status across components. An `Unknown` component degrades the
/// aggregate rather than passing through as unknown.
pub fn aggregate(statuses: impl IntoIterator<Item = HealthStatus>) -> HealthStatus {
    let worst = statuses
        .into_iter()
        .max_by_key(|s| s.severity())
        .unwrap_or(HealthStatus::Unknown);
    match worst {
        HealthStatus::Unknown => HealthStatus::Degraded,
        other => other,
    }
}

/// Outcome of one probe against one component.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckResult {
    pub component: String,
    pub status: HealthStatus,
    pub metrics: Map<String, Value>,
    pub error: Option<String>,
    pub timestamp_ms: u64,
}

/// One full sweep across all components.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub overall: HealthStatus,
    pub components: HashMap<String, HealthCheckResult>,
    pub timestamp_ms: u64,
}

/// Health monitor configuration.
#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    /// Per-probe timeout
    pub check_timeout: Duration,
    /// Connectivity retries before declaring a backend unhealthy
    pub max_retries: u32,
    /// Delay between connectivity retries
    pub retry_delay: Duration,
    /// Period of the background sweep task
    pub check_interval: Duration,
    /// Backend IDs never probed; they report `Unknown` instead
    pub excluded: Vec<String>,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            check_timeout: Duration::from_secs(2),
            max_retries: 2,
            retry_delay: Duration::from_millis(500),
            check_interval: Duration::from_secs(30),
            excluded: Vec::new(),
        }
    }
}

struct HealthInner {
    config: HealthCheckConfig,
    registry: AdapterRegistry,
    auth: Option<Arc<dyn AuthAdapter>>,
    balancer: Option<Arc<RwLock<LoadBalancer>>>,
    history: RwLock<HashMap<String, Vec<HealthCheckResult>>>,
    started: Instant,
}

/// Probes backends and aggregates layer health. Cheap to clone.
#[derive(Clone)]
pub struct HealthMonitor {
    inner: Arc<HealthInner>,
}

impl HealthMonitor {
    /// # Arguments
    ///
    /// * `registry` - Shared backend adapter registry
    /// * `auth` - Optional auth adapter; enables auth/compliance checks
    /// * `balancer` - Optional balancer to feed probe outcomes into
    pub fn new(
        config: HealthCheckConfig,
        registry: AdapterRegistry,
        auth: Option<Arc<dyn AuthAdapter>>,
        balancer: Option<Arc<RwLock<LoadBalancer>>>,
    ) -> Self {
        Self {
            inner: Arc::new(HealthInner {
                config,
                registry,
                auth,
                balancer,
                history: RwLock::new(HashMap::new()),
                started: Instant::now(),
            }),
        }
    }

    /// Probes one backend, retrying connectivity failures.
    ///
    /// Unreachable after all retries is `Unhealthy`; reachable but
    /// failing auth or protocol compliance is `Degraded`; a missing
    /// registry entry is `Unknown`.
    pub async fn check_backend(&self, backend_id: &str) -> HealthCheckResult {
        let adapter = self.inner.registry.read().await.get(backend_id).cloned();
        let Some(adapter) = adapter else {
            let result = HealthCheckResult {
                component: backend_id.to_string(),
                status: HealthStatus::Unknown,
                metrics: Map::new(),
                error: Some("backend not registered".to_string()),
                timestamp_ms: now_ms(),
            };
            self.record(result.clone()).await;
            return result;
        };

        let mut attempt = 0u32;
        let available = loop {
            let probe =
                tokio::time::timeout(self.inner.config.check_timeout, adapter.is_available())
                    .await;
            match probe {
                Ok(true) => break true,
                Ok(false) | Err(_) => {
                    if attempt >= self.inner.config.max_retries {
                        break false;
                    }
                    attempt += 1;
                    debug!(backend_id, attempt, "availability probe failed, retrying");
                    tokio::time::sleep(self.inner.config.retry_delay).await;
                }
            }
        };

        let flags = adapter.capabilities();
        let mut metrics = Map::new();
        metrics.insert("available".to_string(), json!(available));
        metrics.insert("retries".to_string(), json!(attempt));
        metrics.insert(
            "capability_count".to_string(),
            json!(adapter.capability_names().len()),
        );
        // Named operations count as tools; prompt/resource exposure is
        // flag-only on the adapter surface.
        metrics.insert(
            "tool_count".to_string(),
            json!(if flags.tools {
                adapter.capability_names().len()
            } else {
                0
            }),
        );
        metrics.insert("prompt_count".to_string(), json!(u64::from(flags.prompts)));
        metrics.insert(
            "resource_count".to_string(),
            json!(u64::from(flags.resources)),
        );

        let result = if !available {
            warn!(backend_id, attempt, "backend unreachable");
            HealthCheckResult {
                component: backend_id.to_string(),
                status: HealthStatus::Unhealthy,
                metrics,
                error: Some(format!("unreachable after {attempt} retries")),
                timestamp_ms: now_ms(),
            }
        } else {
            let mut status = HealthStatus::Healthy;
            let mut error = None;
            if adapter.capabilities().auth {
                if let Some(auth) = &self.inner.auth {
                    if !auth.has_valid_auth(backend_id).await {
                        status = HealthStatus::Degraded;
                        error = Some("no valid authentication".to_string());
                    } else if !auth.check_protocol_compliance(&adapter.status()).await {
                        status = HealthStatus::Degraded;
                        error = Some("protocol compliance check failed".to_string());
                    }
                }
            }
            HealthCheckResult {
                component: backend_id.to_string(),
                status,
                metrics,
                error,
                timestamp_ms: now_ms(),
            }
        };

        self.feed_balancer(backend_id, result.status).await;
        self.record(result.clone()).await;
        result
    }

    /// Probes every registered backend concurrently and aggregates,
    /// including the synthetic `system` component.
    pub async fn check_all(&self) -> HealthReport {
        self.perform_health_check(None, true).await
    }

    /// Probes backends concurrently and aggregates the results.
    ///
    /// Excluded backends are never contacted: they short-circuit to an
    /// `Unknown` component entry, which the aggregation treats as
    /// degraded. The exclusion applies whether the backend came from a
    /// registry sweep or was named explicitly.
    ///
    /// # Arguments
    ///
    /// * `backend_ids` - Subset to probe; `None` means every registered
    ///   backend
    /// * `include_system_metrics` - Adds a `system` pseudo-component
    ///   with layer-level counters; it is always healthy, so an empty
    ///   registry reports healthy-but-idle rather than unknown
    pub async fn perform_health_check(
        &self,
        backend_ids: Option<&[String]>,
        include_system_metrics: bool,
    ) -> HealthReport {
        let targets: Vec<String> = match backend_ids {
            Some(ids) => ids.to_vec(),
            None => self.inner.registry.read().await.keys().cloned().collect(),
        };

        let (excluded, probed): (Vec<String>, Vec<String>) = targets
            .into_iter()
            .partition(|id| self.inner.config.excluded.contains(id));

        let checks = probed.iter().map(|id| self.check_backend(id));
        let results = join_all(checks).await;

        let mut components: HashMap<String, HealthCheckResult> = results
            .into_iter()
            .map(|r| (r.component.clone(), r))
            .collect();

        for id in &excluded {
            components.insert(
                id.clone(),
                HealthCheckResult {
                    component: id.clone(),
                    status: HealthStatus::Unknown,
                    metrics: Map::new(),
                    error: Some("excluded from health checks".to_string()),
                    timestamp_ms: now_ms(),
                },
            );
        }

        if include_system_metrics {
            let healthy = components
                .values()
                .filter(|r| r.status == HealthStatus::Healthy)
                .count();
            let mut system_metrics = Map::new();
            system_metrics.insert(
                "backend_count".to_string(),
                json!(probed.len() + excluded.len()),
            );
            system_metrics.insert("healthy_count".to_string(), json!(healthy));
            system_metrics.insert("excluded_count".to_string(), json!(excluded.len()));
            system_metrics.insert(
                "uptime_seconds".to_string(),
                json!(self.inner.started.elapsed().as_secs()),
            );
            components.insert(
                "system".to_string(),
                HealthCheckResult {
                    component: "system".to_string(),
                    status: HealthStatus::Healthy,
                    metrics: system_metrics,
                    error: None,
                    timestamp_ms: now_ms(),
                },
            );
        }

        let overall = aggregate(components.values().map(|r| r.status));
        HealthReport {
            overall,
            components,
            timestamp_ms: now_ms(),
        }
    }

    /// Recent probe results for one backend, oldest first.
    pub async fn history(&self, backend_id: &str) -> Vec<HealthCheckResult> {
        self.inner
            .history
            .read()
            .await
            .get(backend_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Pushes a probe outcome into the balancer's health factor.
    async fn feed_balancer(&self, backend_id: &str, status: HealthStatus) {
        let Some(balancer) = &self.inner.balancer else {
            return;
        };
        let mut balancer = balancer.write().await;
        match status {
            HealthStatus::Unhealthy => {
                balancer.set_health_factor(backend_id, 0.0);
            }
            HealthStatus::Healthy => {
                // Only undo a probe-driven exclusion; metric-derived
                // factors are left for maintenance to manage.
                if balancer.health_factor(backend_id) == Some(0.0) {
                    balancer.set_health_factor(backend_id, 1.0);
                }
            }
            _ => {}
        }
    }

    async fn record(&self, result: HealthCheckResult) {
        let mut history = self.inner.history.write().await;
        let entries = history.entry(result.component.clone()).or_default();
        if entries.len() == HISTORY_CAP {
            entries.remove(0);
        }
        entries.push(result);
    }

    /// Spawns the periodic sweep task.
    pub fn spawn_periodic(monitor: HealthMonitor) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.inner.config.check_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let report = monitor.check_all().await;
                debug!(overall = ?report.overall, components = report.components.len(), "health sweep complete");
            }
        })
    }
}
