//! Batch Coordinator
//!
//! Accumulates requests per backend and flushes them together, either
//! when the batch fills or when the flush timer fires, whichever comes
//! first. Every queued request carries a one-shot completion channel, so
//! a request is resolved exactly once no matter which path flushes it.
//!
//! Backends that expose a native batch capability receive the whole
//! JSON-RPC envelope in one call; all other backends are executed
//! request-by-request, sequentially when order preservation is on and
//! concurrently otherwise.
//!
//! An authentication failure resolves the whole batch with auth errors;
//! it is never silently retried.

use crate::backend::AdapterRegistry;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use switchboard_common::auth::AuthAdapter;
use switchboard_common::protocol::{
    JsonRpcError, JsonRpcRequest, JsonRpcResponse, Result, SwitchboardError,
};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};

/// Batch coordinator configuration.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// When off, every request flushes immediately as a batch of one
    pub enabled: bool,
    /// Queue length that triggers an immediate flush
    pub max_batch_size: usize,
    /// How long a partial batch waits before flushing anyway
    pub batch_timeout: Duration,
    /// Execute non-native batches sequentially, in enqueue order
    pub preserve_order: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_batch_size: 10,
            batch_timeout: Duration::from_millis(100),
            preserve_order: true,
        }
    }
}

/// Batching throughput counters.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct BatchStats {
    /// Requests submitted overall
    pub total_requests: u64,
    /// Requests that travelled in a batch of more than one
    pub batched_requests: u64,
    /// Flushes performed
    pub total_batches: u64,
    /// Mean wall-clock flush duration in milliseconds
    pub avg_batch_ms: f64,
    /// Share of requests that benefited from batching, in [0.0, 1.0]
    pub efficiency: f64,
}

#[derive(Default)]
struct StatsInner {
    total_requests: u64,
    batched_requests: u64,
    total_batches: u64,
    total_flush_ms: f64,
}

struct PendingRequest {
    request: JsonRpcRequest,
    tx: oneshot::Sender<JsonRpcResponse>,
}

struct PendingBatch {
    requests: Vec<PendingRequest>,
    /// Ties the flush timer to this batch instance; a timer whose
    /// generation no longer matches finds nothing to flush.
    generation: u64,
}

struct BatchInner {
    config: BatchConfig,
    registry: AdapterRegistry,
    auth: Option<Arc<dyn AuthAdapter>>,
    pending: Mutex<HashMap<String, PendingBatch>>,
    stats: Mutex<StatsInner>,
    next_request_id: AtomicU64,
    next_generation: AtomicU64,
}

/// Per-backend request batcher. Cheap to clone; clones share queues.
#[derive(Clone)]
pub struct BatchCoordinator {
    inner: Arc<BatchInner>,
}

impl BatchCoordinator {
    /// # Arguments
    ///
    /// * `registry` - Shared backend adapter registry
    /// * `auth` - Optional auth adapter gating every flush
    pub fn new(
        config: BatchConfig,
        registry: AdapterRegistry,
        auth: Option<Arc<dyn AuthAdapter>>,
    ) -> Self {
        Self {
            inner: Arc::new(BatchInner {
                config,
                registry,
                auth,
                pending: Mutex::new(HashMap::new()),
                stats: Mutex::new(StatsInner::default()),
                next_request_id: AtomicU64::new(1),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    /// Submits one capability call and waits for its response.
    ///
    /// The request joins the backend's pending batch unless batching is
    /// disabled or `force_immediate` is set, in which case it flushes on
    /// its own right away.
    ///
    /// # Errors
    ///
    /// [`SwitchboardError::BatchAborted`] when the batch was drained
    /// before dispatch (backend unregistered or coordinator shut down).
    pub async fn submit(
        &self,
        backend_id: &str,
        method: &str,
        params: Value,
        force_immediate: bool,
    ) -> Result<JsonRpcResponse> {
        let id = self.inner.next_request_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest::new(json!(id), method, params);
        let rx = self.enqueue(backend_id, request, force_immediate).await;
        rx.await
            .map_err(|_| SwitchboardError::BatchAborted(backend_id.to_string()))
    }

    async fn enqueue(
        &self,
        backend_id: &str,
        request: JsonRpcRequest,
        force_immediate: bool,
    ) -> oneshot::Receiver<JsonRpcResponse> {
        let (tx, rx) = oneshot::channel();
        let pending = PendingRequest { request, tx };
        self.inner.stats.lock().await.total_requests += 1;

        if !self.inner.config.enabled || force_immediate {
            self.flush_requests(backend_id, vec![pending]).await;
            return rx;
        }

        let to_flush = {
            let mut queues = self.inner.pending.lock().await;
            let batch = queues.entry(backend_id.to_string()).or_insert_with(|| {
                let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
                self.spawn_flush_timer(backend_id.to_string(), generation);
                PendingBatch {
                    requests: Vec::new(),
                    generation,
                }
            });
            batch.requests.push(pending);
            if batch.requests.len() >= self.inner.config.max_batch_size {
                queues.remove(backend_id).map(|b| b.requests)
            } else {
                None
            }
        };

        if let Some(requests) = to_flush {
            debug!(backend_id, "batch full, flushing");
            self.flush_requests(backend_id, requests).await;
        }
        rx
    }

    fn spawn_flush_timer(&self, backend_id: String, generation: u64) {
        let coordinator = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(coordinator.inner.config.batch_timeout).await;
            let requests = {
                let mut queues = coordinator.inner.pending.lock().await;
                let same_batch = queues
                    .get(&backend_id)
                    .map(|b| b.generation == generation)
                    .unwrap_or(false);
                // When the generation moved on, a size-triggered flush
                // already consumed this batch.
                if same_batch {
                    queues.remove(&backend_id).map(|b| b.requests)
                } else {
                    None
                }
            };
            if let Some(requests) = requests {
                debug!(backend_id, count = requests.len(), "batch timeout, flushing");
                coordinator.flush_requests(&backend_id, requests).await;
            }
        });
    }

    /// Flushes the backend's pending batch now, regardless of size.
    pub async fn flush_backend(&self, backend_id: &str) {
        let requests = {
            let mut queues = self.inner.pending.lock().await;
            queues.remove(backend_id).map(|b| b.requests)
        };
        if let Some(requests) = requests {
            self.flush_requests(backend_id, requests).await;
        }
    }

    /// Flushes every pending batch.
    pub async fn flush_all(&self) {
        let drained: Vec<(String, Vec<PendingRequest>)> = {
            let mut queues = self.inner.pending.lock().await;
            queues.drain().map(|(id, b)| (id, b.requests)).collect()
        };
        for (backend_id, requests) in drained {
            self.flush_requests(&backend_id, requests).await;
        }
    }

    /// Drains a backend's pending batch without dispatching, resolving
    /// every queued request with an execution error.
    pub async fn abort_backend(&self, backend_id: &str) {
        let requests = {
            let mut queues = self.inner.pending.lock().await;
            queues.remove(backend_id).map(|b| b.requests)
        };
        if let Some(requests) = requests {
            warn!(backend_id, count = requests.len(), "aborting pending batch");
            let message = SwitchboardError::BatchAborted(backend_id.to_string()).to_string();
            for pending in requests {
                let response = JsonRpcResponse::error(
                    pending.request.id.clone(),
                    JsonRpcError::execution_error(&message),
                );
                let _ = pending.tx.send(response);
            }
        }
    }

    /// Current throughput counters.
    pub async fn stats(&self) -> BatchStats {
        let stats = self.inner.stats.lock().await;
        BatchStats {
            total_requests: stats.total_requests,
            batched_requests: stats.batched_requests,
            total_batches: stats.total_batches,
            avg_batch_ms: if stats.total_batches == 0 {
                0.0
            } else {
                stats.total_flush_ms / stats.total_batches as f64
            },
            efficiency: if stats.total_requests == 0 {
                0.0
            } else {
                stats.batched_requests as f64 / stats.total_requests as f64
            },
        }
    }

    /// Dispatches one drained batch and resolves every completion.
    async fn flush_requests(&self, backend_id: &str, requests: Vec<PendingRequest>) {
        if requests.is_empty() {
            return;
        }
        let started = Instant::now();
        let batched = requests.len() > 1;

        let adapter = self.inner.registry.read().await.get(backend_id).cloned();
        let Some(adapter) = adapter else {
            Self::resolve_all_with(
                requests,
                JsonRpcError::internal_error("backend not registered"),
            );
            self.finish_flush(started, 0).await;
            return;
        };

        // Auth gate: a rejection fails the whole batch.
        if adapter.capabilities().auth {
            if let Some(auth) = &self.inner.auth {
                let authenticated = auth.has_valid_auth(backend_id).await || {
                    let outcome = auth.authenticate(backend_id, &adapter.status()).await;
                    outcome.is_authenticated
                };
                if !authenticated {
                    warn!(backend_id, "batch rejected: authentication failed");
                    Self::resolve_all_with(
                        requests,
                        JsonRpcError::auth_error("backend authentication failed"),
                    );
                    self.finish_flush(started, 0).await;
                    return;
                }
            }
        }

        let batched_count = if batched { requests.len() as u64 } else { 0 };

        if adapter.capabilities().native_batch && batched {
            let envelope: Vec<JsonRpcRequest> =
                requests.iter().map(|p| p.request.clone()).collect();
            match adapter.execute_batch(envelope).await {
                Ok(responses) => {
                    let mut by_id: HashMap<String, JsonRpcResponse> = responses
                        .into_iter()
                        .map(|r| (r.id.to_string(), r))
                        .collect();
                    for pending in requests {
                        let key = pending.request.id.to_string();
                        let response = by_id.remove(&key).unwrap_or_else(|| {
                            JsonRpcResponse::error(
                                pending.request.id.clone(),
                                JsonRpcError::internal_error("no response for request id"),
                            )
                        });
                        let _ = pending.tx.send(response);
                    }
                }
                Err(e) => {
                    warn!(backend_id, error = %e, "native batch execution failed");
                    Self::resolve_all_with(
                        requests,
                        JsonRpcError::execution_error(&e.to_string()),
                    );
                }
            }
        } else if self.inner.config.preserve_order {
            for pending in requests {
                let response = Self::execute_one(adapter.as_ref(), &pending.request).await;
                let _ = pending.tx.send(response);
            }
        } else {
            let calls = requests.into_iter().map(|pending| {
                let adapter = adapter.clone();
                async move {
                    let response = Self::execute_one(adapter.as_ref(), &pending.request).await;
                    let _ = pending.tx.send(response);
                }
            });
            futures::future::join_all(calls).await;
        }

        self.finish_flush(started, batched_count).await;
    }

    async fn execute_one(
        adapter: &dyn crate::adapter::BackendAdapter,
        request: &JsonRpcRequest,
    ) -> JsonRpcResponse {
        match adapter.execute(&request.method, request.params.clone()).await {
            Ok(result) => JsonRpcResponse::success(request.id.clone(), result),
            Err(SwitchboardError::Auth(msg)) => {
                JsonRpcResponse::error(request.id.clone(), JsonRpcError::auth_error(&msg))
            }
            Err(e) => JsonRpcResponse::error(
                request.id.clone(),
                JsonRpcError::execution_error(&e.to_string()),
            ),
        }
    }

    fn resolve_all_with(requests: Vec<PendingRequest>, error: JsonRpcError) {
        for pending in requests {
            let response = JsonRpcResponse::error(pending.request.id.clone(), error.clone());
            let _ = pending.tx.send(response);
        }
    }

    async fn finish_flush(&self, started: Instant, batched_count: u64) {
        let mut stats = self.inner.stats.lock().await;
        stats.total_batches += 1;
        stats.batched_requests += batched_count;
        stats.total_flush_ms += started.elapsed().as_secs_f64() * 1000.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{BackendAdapter, BackendCapabilities};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;
    use switchboard_common::auth::AuthOutcome;
    use tokio::sync::RwLock;

    /// Echoes params back; counts single and batch dispatches.
    struct EchoAdapter {
        native_batch: bool,
        auth_flag: bool,
        singles: AtomicU32,
        batches: AtomicU32,
    }

    impl EchoAdapter {
        fn new() -> Self {
            Self {
                native_batch: false,
                auth_flag: false,
                singles: AtomicU32::new(0),
                batches: AtomicU32::new(0),
            }
        }

        fn native() -> Self {
            Self {
                native_batch: true,
                ..Self::new()
            }
        }

        fn with_auth() -> Self {
            Self {
                auth_flag: true,
                ..Self::new()
            }
        }
    }

    #[async_trait]
    impl BackendAdapter for EchoAdapter {
        fn capabilities(&self) -> BackendCapabilities {
            BackendCapabilities {
                tools: true,
                native_batch: self.native_batch,
                auth: self.auth_flag,
                ..Default::default()
            }
        }

        fn capability_names(&self) -> Vec<String> {
            vec!["echo".to_string()]
        }

        async fn execute(&self, capability: &str, params: Value) -> Result<Value> {
            self.singles.fetch_add(1, Ordering::SeqCst);
            if capability == "fail" {
                return Err(SwitchboardError::Execution("backend threw".to_string()));
            }
            Ok(params)
        }

        async fn execute_batch(
            &self,
            requests: Vec<JsonRpcRequest>,
        ) -> Result<Vec<JsonRpcResponse>> {
            self.batches.fetch_add(1, Ordering::SeqCst);
            Ok(requests
                .into_iter()
                .map(|r| JsonRpcResponse::success(r.id, r.params))
                .collect())
        }

        async fn is_available(&self) -> bool {
            true
        }

        async fn connect(&self) -> Result<bool> {
            Ok(true)
        }

        async fn disconnect(&self) -> Result<bool> {
            Ok(true)
        }
    }

    struct DenyAuth;

    #[async_trait]
    impl AuthAdapter for DenyAuth {
        async fn authenticate(&self, _backend_id: &str, _handle: &Value) -> AuthOutcome {
            AuthOutcome::rejected("key mismatch")
        }

        async fn has_valid_auth(&self, _backend_id: &str) -> bool {
            false
        }

        async fn check_protocol_compliance(&self, _handle: &Value) -> bool {
            true
        }
    }

    async fn coordinator_with(
        config: BatchConfig,
        adapter: Arc<EchoAdapter>,
        auth: Option<Arc<dyn AuthAdapter>>,
    ) -> BatchCoordinator {
        let registry: AdapterRegistry = Arc::new(RwLock::new(HashMap::new()));
        registry.write().await.insert("svc".to_string(), adapter);
        BatchCoordinator::new(config, registry, auth)
    }

    fn fast_config() -> BatchConfig {
        BatchConfig {
            batch_timeout: Duration::from_millis(20),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_single_request_flushes_on_timeout() {
        let adapter = Arc::new(EchoAdapter::new());
        let coordinator = coordinator_with(fast_config(), adapter, None).await;
        let response = coordinator
            .submit("svc", "echo", json!({"n": 1}), false)
            .await
            .unwrap();
        assert_eq!(response.result, Some(json!({"n": 1})));
    }

    #[tokio::test]
    async fn test_force_immediate_skips_queue() {
        let adapter = Arc::new(EchoAdapter::new());
        let coordinator = coordinator_with(
            BatchConfig {
                batch_timeout: Duration::from_secs(60),
                ..Default::default()
            },
            adapter,
            None,
        )
        .await;
        // Would wait a minute if it queued
        let response = tokio::time::timeout(
            Duration::from_millis(500),
            coordinator.submit("svc", "echo", json!(1), true),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(response.result, Some(json!(1)));
    }

    #[tokio::test]
    async fn test_disabled_batching_flushes_immediately() {
        let adapter = Arc::new(EchoAdapter::new());
        let coordinator = coordinator_with(
            BatchConfig {
                enabled: false,
                batch_timeout: Duration::from_secs(60),
                ..Default::default()
            },
            adapter,
            None,
        )
        .await;
        let response = tokio::time::timeout(
            Duration::from_millis(500),
            coordinator.submit("svc", "echo", json!(1), false),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(response.error.is_none());
    }

    #[tokio::test]
    async fn test_full_batch_flushes_without_timer() {
        let adapter = Arc::new(EchoAdapter::new());
        let coordinator = coordinator_with(
            BatchConfig {
                max_batch_size: 3,
                batch_timeout: Duration::from_secs(60),
                ..Default::default()
            },
            adapter.clone(),
            None,
        )
        .await;

        let mut handles = Vec::new();
        for i in 0..3 {
            let c = coordinator.clone();
            handles.push(tokio::spawn(async move {
                c.submit("svc", "echo", json!(i), false).await
            }));
        }
        for handle in handles {
            let response = tokio::time::timeout(Duration::from_millis(500), handle)
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            assert!(response.error.is_none());
        }
        let stats = coordinator.stats().await;
        assert_eq!(stats.total_batches, 1);
        assert_eq!(stats.batched_requests, 3);
    }

    #[tokio::test]
    async fn test_overflow_spills_into_second_batch() {
        let adapter = Arc::new(EchoAdapter::new());
        let coordinator = coordinator_with(
            BatchConfig {
                max_batch_size: 10,
                batch_timeout: Duration::from_millis(30),
                ..Default::default()
            },
            adapter,
            None,
        )
        .await;

        let mut handles = Vec::new();
        for i in 0..12 {
            let c = coordinator.clone();
            handles.push(tokio::spawn(async move {
                c.submit("svc", "echo", json!(i), false).await
            }));
            // Keep enqueue order deterministic
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        for handle in handles {
            assert!(handle.await.unwrap().unwrap().error.is_none());
        }
        // One size-triggered flush of 10, one timer flush of 2
        let stats = coordinator.stats().await;
        assert_eq!(stats.total_batches, 2);
        assert_eq!(stats.total_requests, 12);
        assert_eq!(stats.batched_requests, 12);
    }

    #[tokio::test]
    async fn test_native_batch_receives_whole_envelope() {
        let adapter = Arc::new(EchoAdapter::native());
        let coordinator = coordinator_with(
            BatchConfig {
                max_batch_size: 2,
                batch_timeout: Duration::from_secs(60),
                ..Default::default()
            },
            adapter.clone(),
            None,
        )
        .await;

        let c1 = coordinator.clone();
        let h1 = tokio::spawn(async move { c1.submit("svc", "echo", json!("a"), false).await });
        let c2 = coordinator.clone();
        let h2 = tokio::spawn(async move { c2.submit("svc", "echo", json!("b"), false).await });

        let r1 = h1.await.unwrap().unwrap();
        let r2 = h2.await.unwrap().unwrap();
        let mut results = vec![r1.result.unwrap(), r2.result.unwrap()];
        results.sort_by_key(|v| v.as_str().unwrap().to_string());
        assert_eq!(results, vec![json!("a"), json!("b")]);

        assert_eq!(adapter.batches.load(Ordering::SeqCst), 1);
        assert_eq!(adapter.singles.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_request_gets_execution_error() {
        let adapter = Arc::new(EchoAdapter::new());
        let coordinator = coordinator_with(fast_config(), adapter, None).await;
        let response = coordinator
            .submit("svc", "fail", json!(null), false)
            .await
            .unwrap();
        let error = response.error.unwrap();
        assert_eq!(error.code, switchboard_common::protocol::jsonrpc::EXECUTION_ERROR);
        assert!(error.message.contains("backend threw"));
    }

    #[tokio::test]
    async fn test_auth_rejection_fails_whole_batch() {
        let adapter = Arc::new(EchoAdapter::with_auth());
        let coordinator =
            coordinator_with(fast_config(), adapter.clone(), Some(Arc::new(DenyAuth))).await;
        let response = coordinator
            .submit("svc", "echo", json!(1), false)
            .await
            .unwrap();
        assert!(response.error.unwrap().is_auth_error());
        // The backend was never invoked
        assert_eq!(adapter.singles.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unknown_backend_resolves_with_internal_error() {
        let adapter = Arc::new(EchoAdapter::new());
        let coordinator = coordinator_with(fast_config(), adapter, None).await;
        let response = coordinator
            .submit("ghost", "echo", json!(1), false)
            .await
            .unwrap();
        assert_eq!(
            response.error.unwrap().code,
            switchboard_common::protocol::jsonrpc::INTERNAL_ERROR
        );
    }

    #[tokio::test]
    async fn test_abort_resolves_pending_with_error() {
        let adapter = Arc::new(EchoAdapter::new());
        let coordinator = coordinator_with(
            BatchConfig {
                batch_timeout: Duration::from_secs(60),
                ..Default::default()
            },
            adapter,
            None,
        )
        .await;
        let c = coordinator.clone();
        let handle = tokio::spawn(async move { c.submit("svc", "echo", json!(1), false).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        coordinator.abort_backend("svc").await;
        let response = handle.await.unwrap().unwrap();
        let error = response.error.unwrap();
        assert!(error.message.contains("aborted"));
    }

    #[tokio::test]
    async fn test_flush_backend_short_circuits_timer() {
        let adapter = Arc::new(EchoAdapter::new());
        let coordinator = coordinator_with(
            BatchConfig {
                batch_timeout: Duration::from_secs(60),
                ..Default::default()
            },
            adapter,
            None,
        )
        .await;
        let c = coordinator.clone();
        let handle = tokio::spawn(async move { c.submit("svc", "echo", json!(1), false).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        coordinator.flush_backend("svc").await;
        let response = tokio::time::timeout(Duration::from_millis(500), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(response.error.is_none());
    }

    #[tokio::test]
    async fn test_stats_efficiency() {
        let adapter = Arc::new(EchoAdapter::new());
        let coordinator = coordinator_with(
            BatchConfig {
                max_batch_size: 2,
                batch_timeout: Duration::from_millis(20),
                ..Default::default()
            },
            adapter,
            None,
        )
        .await;

        // Two queued together (batched) plus one forced single
        let c1 = coordinator.clone();
        let h1 = tokio::spawn(async move { c1.submit("svc", "echo", json!(1), false).await });
        let c2 = coordinator.clone();
        let h2 = tokio::spawn(async move { c2.submit("svc", "echo", json!(2), false).await });
        h1.await.unwrap().unwrap();
        h2.await.unwrap().unwrap();
        coordinator.submit("svc", "echo", json!(3), true).await.unwrap();

        let stats = coordinator.stats().await;
        assert_eq!(stats.total_requests, 3);
        assert_eq!(stats.batched_requests, 2);
        assert_eq!(stats.total_batches, 2);
        assert!((stats.efficiency - 2.0 / 3.0).abs() < 1e-9);
    }
}
