//! Backend Adapter Abstraction
//!
//! Trait definitions for backend service instances. This abstraction lets
//! the rest of the layer work with heterogeneous backends (tool, prompt
//! and resource providers with different native call signatures) without
//! changing core logic.
//!
//! # Design Philosophy
//!
//! Backends are *not* probed reflectively at call time. Each adapter
//! declares a [`BackendCapabilities`] flags struct once, at registration,
//! and every other subsystem branches on those flags. Adapters own the
//! mapping between this layer's generic request shape and their backend's
//! native signatures, including normalizing heterogeneous return shapes
//! into a uniform result map.

use async_trait::async_trait;
use serde_json::{Map, Value};
use switchboard_common::protocol::{JsonRpcRequest, JsonRpcResponse, Result, SwitchboardError};

/// Protocol features a backend exposes, decided once at registration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackendCapabilities {
    /// Backend serves tool listing/invocation
    pub tools: bool,
    /// Backend serves prompt listing/rendering
    pub prompts: bool,
    /// Backend serves resource listing/reads
    pub resources: bool,
    /// Backend accepts a whole batch envelope in one native call
    pub native_batch: bool,
    /// Backend answers lightweight health probes
    pub health: bool,
    /// Backend participates in authentication
    pub auth: bool,
    /// Backend can stream responses
    pub streaming: bool,
}

impl BackendCapabilities {
    /// Returns whether the backend exposes any capability at all.
    pub fn any(&self) -> bool {
        self.tools
            || self.prompts
            || self.resources
            || self.native_batch
            || self.health
            || self.auth
            || self.streaming
    }
}

/// Uniform interface over one backend service instance.
///
/// Implementations wrap a concrete client/server object and translate
/// between the generic `(capability, params)` shape and the backend's
/// native call signatures. All other components are isolated from those
/// signatures by this trait.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    /// Capability flags for this backend, decided at integration time.
    fn capabilities(&self) -> BackendCapabilities;

    /// Names of the individual capabilities this backend can execute.
    fn capability_names(&self) -> Vec<String>;

    /// Executes one named capability with the given parameters.
    ///
    /// # Arguments
    ///
    /// * `capability` - Capability name from [`capability_names`](Self::capability_names)
    /// * `params` - Parameter values in the layer's generic shape
    ///
    /// # Returns
    ///
    /// The backend's raw result value; callers that need a uniform map
    /// pass it through [`normalize_result`].
    async fn execute(&self, capability: &str, params: Value) -> Result<Value>;

    /// Executes a whole batch envelope in one native call.
    ///
    /// Only meaningful when [`capabilities`](Self::capabilities) reports
    /// `native_batch`. The default implementation rejects the call so
    /// non-batch backends never need to think about it.
    async fn execute_batch(&self, requests: Vec<JsonRpcRequest>) -> Result<Vec<JsonRpcResponse>> {
        let _ = requests;
        Err(SwitchboardError::Execution(
            "native batch execution not supported".to_string(),
        ))
    }

    /// Lightweight availability probe.
    async fn is_available(&self) -> bool;

    /// Establishes the backend connection.
    async fn connect(&self) -> Result<bool>;

    /// Tears the backend connection down.
    async fn disconnect(&self) -> Result<bool>;

    /// Backend-reported status/metadata map (opaque to this layer).
    fn status(&self) -> Value {
        Value::Object(Map::new())
    }
}

/// Normalizes a heterogeneous backend result into a uniform map.
///
/// Objects pass through unchanged; `null` becomes an empty map; any other
/// value is wrapped under a `"value"` key. This is deliberately
/// best-effort: normalization never fails, so a backend returning an
/// unexpected shape degrades to a wrapped value instead of propagating a
/// parse error.
pub fn normalize_result(raw: Value) -> Map<String, Value> {
    match raw {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            map
        }
    }
}
