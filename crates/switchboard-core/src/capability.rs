//! Capability Manager
//!
//! Tracks which protocol features each backend exposes, supports
//! enabling/disabling them at runtime, and validates configuration
//! updates before committing them. Every change is published on a
//! broadcast channel and kept in a bounded update history.
//!
//! Capability records are synthesized from the adapter's declared flags
//! at registration; backends are never probed reflectively afterwards.

use crate::backend::AdapterRegistry;
use crate::events::{now_ms, CapabilityEvent, CapabilityEventKind, EVENT_CHANNEL_CAPACITY};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use switchboard_common::protocol::{Result, SwitchboardError};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info};

/// Protocol versions this layer can negotiate, newest last.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2024-11-05", "2025-03-26", "2025-06-18"];

/// Batch size bounds accepted in `batch_processing` configuration.
const MAX_BATCH_SIZE_LIMIT: u64 = 100;

/// Retained capability update events per backend before the oldest are
/// evicted.
const UPDATE_HISTORY_CAP: usize = 100;

/// Category of a backend capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityType {
    Tools,
    Prompts,
    Resources,
    Authentication,
    HealthCheck,
    BatchProcessing,
    ResponseStreaming,
    ProtocolVersioning,
}

impl fmt::Display for CapabilityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CapabilityType::Tools => "tools",
            CapabilityType::Prompts => "prompts",
            CapabilityType::Resources => "resources",
            CapabilityType::Authentication => "authentication",
            CapabilityType::HealthCheck => "health_check",
            CapabilityType::BatchProcessing => "batch_processing",
            CapabilityType::ResponseStreaming => "response_streaming",
            CapabilityType::ProtocolVersioning => "protocol_versioning",
        };
        write!(f, "{name}")
    }
}

/// One tracked capability on one backend.
#[derive(Debug, Clone, Serialize)]
pub struct CapabilityRecord {
    pub capability_type: CapabilityType,
    pub name: String,
    /// Negotiated protocol version, where the capability carries one
    pub version: Option<String>,
    pub enabled: bool,
    pub configuration: Map<String, Value>,
    pub last_updated_ms: u64,
}

impl CapabilityRecord {
    fn new(capability_type: CapabilityType, configuration: Map<String, Value>) -> Self {
        let version = configuration
            .get("version")
            .and_then(Value::as_str)
            .map(String::from);
        Self {
            capability_type,
            name: capability_type.to_string(),
            version,
            enabled: true,
            configuration,
            last_updated_ms: now_ms(),
        }
    }
}

/// Outcome of a bulk configuration update.
///
/// Items are validated independently: valid ones commit even when
/// siblings in the same call are rejected.
#[derive(Debug, Clone, Serialize)]
pub struct UpdateReport {
    pub applied: Vec<String>,
    pub rejected: Vec<RejectedUpdate>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RejectedUpdate {
    pub capability: String,
    pub reason: String,
}

struct CapabilityInner {
    registry: AdapterRegistry,
    records: RwLock<HashMap<String, HashMap<String, CapabilityRecord>>>,
    history: RwLock<HashMap<String, Vec<CapabilityEvent>>>,
    events: broadcast::Sender<CapabilityEvent>,
}

/// Tracks and mutates backend capability state. Cheap to clone.
#[derive(Clone)]
pub struct CapabilityManager {
    inner: Arc<CapabilityInner>,
}

impl CapabilityManager {
    pub fn new(registry: AdapterRegistry) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(CapabilityInner {
                registry,
                records: RwLock::new(HashMap::new()),
                history: RwLock::new(HashMap::new()),
                events,
            }),
        }
    }

    /// Returns whether this layer can negotiate the given version.
    pub fn is_protocol_version_supported(version: &str) -> bool {
        SUPPORTED_PROTOCOL_VERSIONS.contains(&version)
    }

    /// Synthesizes capability records from the backend's declared flags
    /// and emits a `discovered` event per record.
    ///
    /// # Errors
    ///
    /// [`SwitchboardError::BackendNotFound`] when the backend is not in
    /// the adapter registry.
    pub async fn register_backend(&self, backend_id: &str) -> Result<()> {
        let adapter = self
            .inner
            .registry
            .read()
            .await
            .get(backend_id)
            .cloned()
            .ok_or_else(|| SwitchboardError::BackendNotFound(backend_id.to_string()))?;

        let flags = adapter.capabilities();
        let mut records = HashMap::new();
        let mut synthesized = Vec::new();

        if flags.tools {
            synthesized.push(CapabilityRecord::new(CapabilityType::Tools, Map::new()));
        }
        if flags.prompts {
            synthesized.push(CapabilityRecord::new(CapabilityType::Prompts, Map::new()));
        }
        if flags.resources {
            synthesized.push(CapabilityRecord::new(CapabilityType::Resources, Map::new()));
        }
        if flags.auth {
            synthesized.push(CapabilityRecord::new(
                CapabilityType::Authentication,
                Map::new(),
            ));
        }
        if flags.health {
            synthesized.push(CapabilityRecord::new(CapabilityType::HealthCheck, Map::new()));
        }
        if flags.native_batch {
            let mut config = Map::new();
            config.insert("max_batch_size".to_string(), json!(10));
            synthesized.push(CapabilityRecord::new(CapabilityType::BatchProcessing, config));
        }
        if flags.streaming {
            synthesized.push(CapabilityRecord::new(
                CapabilityType::ResponseStreaming,
                Map::new(),
            ));
        }
        // Every backend negotiates a protocol version; default to newest.
        let mut config = Map::new();
        config.insert(
            "version".to_string(),
            json!(SUPPORTED_PROTOCOL_VERSIONS[SUPPORTED_PROTOCOL_VERSIONS.len() - 1]),
        );
        synthesized.push(CapabilityRecord::new(
            CapabilityType::ProtocolVersioning,
            config,
        ));

        for record in synthesized {
            records.insert(record.name.clone(), record);
        }
        let names: Vec<String> = records.keys().cloned().collect();
        self.inner
            .records
            .write()
            .await
            .insert(backend_id.to_string(), records);

        for name in names {
            self.emit(backend_id, &name, CapabilityEventKind::Discovered)
                .await;
        }
        info!(backend_id, "backend capabilities registered");
        Ok(())
    }

    /// Drops all capability records for a backend, emitting `removed`
    /// events.
    pub async fn unregister_backend(&self, backend_id: &str) {
        let removed = self.inner.records.write().await.remove(backend_id);
        if let Some(records) = removed {
            for name in records.keys() {
                self.emit(backend_id, name, CapabilityEventKind::Removed).await;
            }
        }
    }

    /// All capability records for one backend.
    pub async fn capabilities(&self, backend_id: &str) -> Option<Vec<CapabilityRecord>> {
        self.inner
            .records
            .read()
            .await
            .get(backend_id)
            .map(|records| records.values().cloned().collect())
    }

    /// Backend IDs exposing the named capability, enabled, sorted.
    pub async fn backends_with(&self, capability: &str) -> Vec<String> {
        let records = self.inner.records.read().await;
        let mut ids: Vec<String> = records
            .iter()
            .filter(|(_, caps)| caps.get(capability).map(|r| r.enabled).unwrap_or(false))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Enables a capability.
    pub async fn enable(&self, backend_id: &str, capability: &str) -> Result<()> {
        self.set_enabled(backend_id, capability, true).await
    }

    /// Disables a capability without removing its record.
    pub async fn disable(&self, backend_id: &str, capability: &str) -> Result<()> {
        self.set_enabled(backend_id, capability, false).await
    }

    async fn set_enabled(&self, backend_id: &str, capability: &str, enabled: bool) -> Result<()> {
        {
            let mut records = self.inner.records.write().await;
            let record = records
                .get_mut(backend_id)
                .ok_or_else(|| SwitchboardError::BackendNotFound(backend_id.to_string()))?
                .get_mut(capability)
                .ok_or_else(|| {
                    SwitchboardError::Validation(format!("unknown capability: {capability}"))
                })?;
            record.enabled = enabled;
            record.last_updated_ms = now_ms();
        }
        let kind = if enabled {
            CapabilityEventKind::Enabled
        } else {
            CapabilityEventKind::Disabled
        };
        self.emit(backend_id, capability, kind).await;
        Ok(())
    }

    /// Applies configuration updates, one capability at a time.
    ///
    /// Each item is validated independently and committed on its own:
    /// a rejected item never rolls back its siblings. The report lists
    /// what was applied and what was rejected with the reason.
    ///
    /// # Errors
    ///
    /// [`SwitchboardError::BackendNotFound`] when the backend has no
    /// capability records at all; individual validation failures are
    /// reported, not returned as errors.
    pub async fn update_capabilities(
        &self,
        backend_id: &str,
        updates: HashMap<String, Map<String, Value>>,
    ) -> Result<UpdateReport> {
        let mut report = UpdateReport {
            applied: Vec::new(),
            rejected: Vec::new(),
        };

        {
            let mut records = self.inner.records.write().await;
            let backend = records
                .get_mut(backend_id)
                .ok_or_else(|| SwitchboardError::BackendNotFound(backend_id.to_string()))?;

            for (capability, configuration) in updates {
                let Some(record) = backend.get_mut(&capability) else {
                    report.rejected.push(RejectedUpdate {
                        capability,
                        reason: "unknown capability".to_string(),
                    });
                    continue;
                };
                if let Err(reason) = validate_configuration(record.capability_type, &configuration)
                {
                    report.rejected.push(RejectedUpdate { capability, reason });
                    continue;
                }
                if let Some(version) = configuration.get("version").and_then(Value::as_str) {
                    record.version = Some(version.to_string());
                }
                record.configuration = configuration;
                record.last_updated_ms = now_ms();
                report.applied.push(capability);
            }
        }

        for capability in &report.applied {
            self.emit(backend_id, capability, CapabilityEventKind::Updated)
                .await;
        }
        if !report.rejected.is_empty() {
            debug!(
                backend_id,
                rejected = report.rejected.len(),
                "capability updates partially rejected"
            );
        }
        Ok(report)
    }

    /// Subscribes to capability change events.
    pub fn subscribe(&self) -> broadcast::Receiver<CapabilityEvent> {
        self.inner.events.subscribe()
    }

    /// Recent capability events across all backends, oldest first.
    ///
    /// History is retained per backend, so one chatty backend cannot
    /// evict another backend's audit trail.
    pub async fn history(&self) -> Vec<CapabilityEvent> {
        let history = self.inner.history.read().await;
        let mut all: Vec<CapabilityEvent> = history.values().flatten().cloned().collect();
        all.sort_by_key(|e| e.timestamp_ms);
        all
    }

    /// Recent capability events for one backend, oldest first.
    pub async fn history_for(&self, backend_id: &str) -> Vec<CapabilityEvent> {
        self.inner
            .history
            .read()
            .await
            .get(backend_id)
            .cloned()
            .unwrap_or_default()
    }

    async fn emit(&self, backend_id: &str, capability: &str, kind: CapabilityEventKind) {
        let event = CapabilityEvent::new(backend_id, capability, kind);
        {
            let mut history = self.inner.history.write().await;
            let entries = history.entry(backend_id.to_string()).or_default();
            if entries.len() == UPDATE_HISTORY_CAP {
                entries.remove(0);
            }
            entries.push(event.clone());
        }
        let _ = self.inner.events.send(event);
    }
}

/// Validates one capability's new configuration.
///
/// A `version` field on any capability must name a supported protocol
/// version; the record's negotiated version is overwritten on commit,
/// so an unvetted value would poison later negotiation.
fn validate_configuration(
    capability_type: CapabilityType,
    configuration: &Map<String, Value>,
) -> std::result::Result<(), String> {
    match configuration.get("version") {
        Some(Value::String(version)) => {
            if !CapabilityManager::is_protocol_version_supported(version) {
                return Err(format!("unsupported protocol version: {version}"));
            }
        }
        Some(_) => return Err("version must be a string".to_string()),
        None => {}
    }
    match capability_type {
        CapabilityType::ProtocolVersioning => {
            if !configuration.contains_key("version") {
                return Err("missing version field".to_string());
            }
            Ok(())
        }
        CapabilityType::BatchProcessing => {
            let size = configuration
                .get("max_batch_size")
                .and_then(Value::as_u64)
                .ok_or_else(|| "missing max_batch_size field".to_string())?;
            if size == 0 || size > MAX_BATCH_SIZE_LIMIT {
                return Err(format!(
                    "max_batch_size must be between 1 and {MAX_BATCH_SIZE_LIMIT}, got {size}"
                ));
            }
            Ok(())
        }
        _ => Ok(()),
    }
}
