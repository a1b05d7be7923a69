//! Switchboard Manager
//!
//! Thin façade wiring the routing engine, load balancer, batch
//! coordinator, health monitor, capability manager and lifecycle manager
//! over one shared adapter registry. Callers register backends here and
//! execute capabilities through it; the manager brackets every dispatch
//! with the load balancer's metrics so selection stays informed.

use crate::backend::{AdapterRegistry, BackendRegistration};
use crate::batch::{BatchConfig, BatchCoordinator, BatchStats};
use crate::capability::CapabilityManager;
use crate::events::{CapabilityEvent, LifecycleEvent};
use crate::health::{HealthCheckConfig, HealthMonitor, HealthReport};
use crate::lifecycle::{LifecycleConfig, LifecycleManager, LifecycleState};
use crate::load_balancer::{LoadBalancer, LoadBalancerConfig, LoadBalancerSnapshot};
use crate::router::{RouteProfile, Router};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use switchboard_common::auth::AuthAdapter;
use switchboard_common::protocol::{JsonRpcResponse, Result, SwitchboardError};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info};

/// Top-level configuration, one section per subsystem.
#[derive(Debug, Clone, Default)]
pub struct ManagerConfig {
    pub load_balancer: LoadBalancerConfig,
    pub batch: BatchConfig,
    pub health: HealthCheckConfig,
    pub lifecycle: LifecycleConfig,
}

/// Aggregated operator-facing statistics.
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStats {
    pub load_balancer: LoadBalancerSnapshot,
    pub batch: BatchStats,
    pub lifecycle: HashMap<String, LifecycleState>,
}

/// Orchestration façade over all subsystems.
///
/// Owns the background maintenance tasks; dropping the manager aborts
/// nothing, call [`shutdown`](Self::shutdown) for a clean stop.
pub struct Manager {
    registry: AdapterRegistry,
    balancer: Arc<RwLock<LoadBalancer>>,
    router: Arc<RwLock<Router>>,
    batch: BatchCoordinator,
    health: HealthMonitor,
    capabilities: CapabilityManager,
    lifecycle: LifecycleManager,
    maintenance_handle: tokio::task::JoinHandle<()>,
    health_handle: tokio::task::JoinHandle<()>,
}

impl Manager {
    /// Builds the full subsystem graph and spawns the background tasks.
    ///
    /// # Arguments
    ///
    /// * `config` - Per-subsystem configuration
    /// * `auth` - Optional auth adapter shared by batching, health and
    ///   lifecycle
    pub fn new(config: ManagerConfig, auth: Option<Arc<dyn AuthAdapter>>) -> Self {
        let registry: AdapterRegistry = Arc::new(RwLock::new(HashMap::new()));
        let balancer = Arc::new(RwLock::new(LoadBalancer::new(config.load_balancer.strategy)));
        let router = Arc::new(RwLock::new(Router::new()));

        let batch = BatchCoordinator::new(config.batch, registry.clone(), auth.clone());
        let health = HealthMonitor::new(
            config.health,
            registry.clone(),
            auth.clone(),
            Some(balancer.clone()),
        );
        let capabilities = CapabilityManager::new(registry.clone());
        let lifecycle = LifecycleManager::new(config.lifecycle, registry.clone(), auth);

        let maintenance_handle = LoadBalancer::spawn_maintenance(
            balancer.clone(),
            config.load_balancer.maintenance_interval,
        );
        let health_handle = HealthMonitor::spawn_periodic(health.clone());

        Self {
            registry,
            balancer,
            router,
            batch,
            health,
            capabilities,
            lifecycle,
            maintenance_handle,
            health_handle,
        }
    }

    /// Registers a backend with every subsystem.
    ///
    /// # Errors
    ///
    /// [`SwitchboardError::Validation`] when the backend ID is already
    /// taken.
    pub async fn register_backend(
        &self,
        registration: BackendRegistration,
        profile: RouteProfile,
    ) -> Result<()> {
        let backend_id = registration.backend_id.clone();
        {
            let mut registry = self.registry.write().await;
            if registry.contains_key(&backend_id) {
                return Err(SwitchboardError::Validation(format!(
                    "backend already registered: {backend_id}"
                )));
            }
            registry.insert(backend_id.clone(), registration.adapter);
        }

        self.balancer
            .write()
            .await
            .register(&backend_id, registration.weight);
        self.router.write().await.register(&backend_id, profile);
        self.capabilities.register_backend(&backend_id).await?;
        self.lifecycle.track(&backend_id, false).await;
        info!(backend_id, weight = registration.weight, "backend registered");
        Ok(())
    }

    /// Removes a backend from every subsystem.
    ///
    /// Pending batched requests are drained (resolved with errors)
    /// before anything is torn down, so no caller is left hanging.
    pub async fn unregister_backend(&self, backend_id: &str) -> Result<()> {
        if !self.registry.read().await.contains_key(backend_id) {
            return Err(SwitchboardError::BackendNotFound(backend_id.to_string()));
        }

        self.batch.abort_backend(backend_id).await;
        // Best-effort stop; an already stopped backend is a no-op
        let _ = self.lifecycle.stop(backend_id).await;
        self.lifecycle.untrack(backend_id).await;
        self.capabilities.unregister_backend(backend_id).await;
        self.router.write().await.unregister(backend_id);
        self.balancer.write().await.unregister(backend_id);
        self.registry.write().await.remove(backend_id);
        info!(backend_id, "backend unregistered");
        Ok(())
    }

    /// Executes a capability on an explicit backend, recording metrics.
    ///
    /// Dispatches immediately through the batch coordinator's auth gate
    /// rather than queueing; use [`batch`](Self::batch) directly for
    /// work that should accumulate into batches.
    pub async fn execute_on(
        &self,
        backend_id: &str,
        capability: &str,
        params: Value,
    ) -> Result<JsonRpcResponse> {
        self.balancer.write().await.record_request_start(backend_id);
        let started = Instant::now();
        let outcome = self.batch.submit(backend_id, capability, params, true).await;
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        let success = matches!(&outcome, Ok(response) if response.error.is_none());
        self.balancer
            .write()
            .await
            .record_request_end(backend_id, success, latency_ms);
        outcome
    }

    /// Executes a capability on the balancer's pick.
    ///
    /// # Errors
    ///
    /// [`SwitchboardError::BackendUnavailable`] when no selectable
    /// backend exists.
    pub async fn execute(&self, capability: &str, params: Value) -> Result<JsonRpcResponse> {
        let backend_id = self
            .balancer
            .write()
            .await
            .select()
            .ok_or_else(|| SwitchboardError::BackendUnavailable("no selectable backend".to_string()))?;
        self.execute_on(&backend_id, capability, params).await
    }

    /// Routes a free-text query to a backend, falling back to the
    /// balancer when no profile scores, then executes.
    pub async fn execute_routed(
        &self,
        query: &str,
        capability: &str,
        params: Value,
    ) -> Result<JsonRpcResponse> {
        let routed = self.router.read().await.route_by_keywords(query);
        match routed {
            Some(backend_id) => {
                debug!(backend_id, query, "query routed by profile");
                self.execute_on(&backend_id, capability, params).await
            }
            None => self.execute(capability, params).await,
        }
    }

    /// Routes a free-text query without executing anything.
    pub async fn route_query(&self, query: &str) -> Option<String> {
        self.router.read().await.route_by_keywords(query)
    }

    /// Routes by structured properties without executing anything.
    pub async fn route_by_properties(&self, properties: &HashMap<String, String>) -> Option<String> {
        self.router.read().await.route_by_properties(properties)
    }

    /// Executes with fallback over an ordered candidate list: the
    /// preferred backend first (when given), then the balancer's pick,
    /// then every remaining backend in registration order.
    ///
    /// Without `try_all`, the first candidate's outcome is returned
    /// as-is, error responses included. With `try_all`, transport
    /// failures and error responses both advance to the next candidate.
    ///
    /// # Errors
    ///
    /// [`SwitchboardError::AllBackendsFailed`] when `try_all` exhausts
    /// every candidate; [`SwitchboardError::BackendUnavailable`] when
    /// there are no candidates at all.
    pub async fn execute_with_fallback(
        &self,
        capability: &str,
        params: Value,
        preferred: Option<&str>,
        try_all: bool,
    ) -> Result<JsonRpcResponse> {
        let mut candidates: Vec<String> = Vec::new();
        if let Some(preferred) = preferred {
            candidates.push(preferred.to_string());
        }
        if let Some(selected) = self.balancer.write().await.select() {
            if !candidates.contains(&selected) {
                candidates.push(selected);
            }
        }
        for backend_id in self.balancer.read().await.backend_ids() {
            if !candidates.contains(&backend_id) {
                candidates.push(backend_id);
            }
        }
        if candidates.is_empty() {
            return Err(SwitchboardError::BackendUnavailable(
                "no registered backends".to_string(),
            ));
        }

        for backend_id in candidates {
            match self.execute_on(&backend_id, capability, params.clone()).await {
                Ok(response) => {
                    if try_all && response.error.is_some() {
                        debug!(backend_id, "candidate returned error, trying next");
                        continue;
                    }
                    return Ok(response);
                }
                Err(e) => {
                    if try_all {
                        debug!(backend_id, error = %e, "candidate failed, trying next");
                        continue;
                    }
                    return Err(e);
                }
            }
        }
        Err(SwitchboardError::AllBackendsFailed)
    }

    /// Forces a full health sweep now.
    pub async fn health_report(&self) -> HealthReport {
        self.health.check_all().await
    }

    /// Manually excludes a backend from selection.
    pub async fn disable_backend(&self, backend_id: &str) -> bool {
        self.balancer.write().await.disable(backend_id)
    }

    /// Re-admits a manually excluded backend.
    pub async fn enable_backend(&self, backend_id: &str) -> bool {
        self.balancer.write().await.enable(backend_id)
    }

    /// Subscribes to lifecycle transition events.
    pub fn subscribe_lifecycle(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.lifecycle.subscribe()
    }

    /// Subscribes to capability change events.
    pub fn subscribe_capabilities(&self) -> broadcast::Receiver<CapabilityEvent> {
        self.capabilities.subscribe()
    }

    /// Aggregated statistics across subsystems.
    pub async fn stats(&self) -> ManagerStats {
        ManagerStats {
            load_balancer: self.balancer.read().await.snapshot(),
            batch: self.batch.stats().await,
            lifecycle: self.lifecycle.states().await,
        }
    }

    /// Direct access to the lifecycle manager.
    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    /// Direct access to the capability manager.
    pub fn capabilities(&self) -> &CapabilityManager {
        &self.capabilities
    }

    /// Direct access to the health monitor.
    pub fn health(&self) -> &HealthMonitor {
        &self.health
    }

    /// Direct access to the batch coordinator.
    pub fn batch(&self) -> &BatchCoordinator {
        &self.batch
    }

    /// Flushes pending batches, stops every backend and aborts the
    /// background tasks.
    pub async fn shutdown(&self) {
        info!("shutting down");
        self.batch.flush_all().await;
        let backend_ids: Vec<String> = self.registry.read().await.keys().cloned().collect();
        for backend_id in backend_ids {
            let _ = self.lifecycle.stop(&backend_id).await;
        }
        self.maintenance_handle.abort();
        self.health_handle.abort();
    }
}
