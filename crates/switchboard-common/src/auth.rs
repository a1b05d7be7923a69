//! Authentication Collaborator Interface
//!
//! Switchboard treats authentication as a pluggable collaborator reached
//! through a narrow interface: it never issues tokens itself. An
//! [`AuthAdapter`] is configured per deployment and consulted by the
//! batch coordinator (before any batch executes), the health monitor
//! (auth-validity probe) and the lifecycle manager (startup sequence).
//!
//! # Security Model
//!
//! - Auth failures are always surfaced with the dedicated `-32001`
//!   protocol code and never silently retried by this layer
//! - The bundled [`SharedKeyAuth`] validates per-backend shared secrets
//!   using constant-time comparison to prevent timing attacks
//!
//! # Example
//!
//! ```
//! use switchboard_common::auth::SharedKeyAuth;
//!
//! let mut auth = SharedKeyAuth::new();
//! auth.register_key("svc-a", "secret-key-12345");
//! ```

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;

/// Result of an authentication attempt against one backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthOutcome {
    /// Whether the backend is now authenticated
    pub is_authenticated: bool,
    /// Failure description when `is_authenticated` is false
    pub error: Option<String>,
}

impl AuthOutcome {
    /// Creates a successful outcome.
    pub fn authenticated() -> Self {
        Self {
            is_authenticated: true,
            error: None,
        }
    }

    /// Creates a failed outcome with a reason.
    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            is_authenticated: false,
            error: Some(error.into()),
        }
    }
}

/// Pluggable authentication collaborator.
///
/// Implementations own credential storage and refresh; Switchboard only
/// asks three questions. The `handle` argument is the opaque status map
/// the backend adapter exposes, so implementations can inspect
/// backend-reported metadata without this layer knowing its shape.
#[async_trait]
pub trait AuthAdapter: Send + Sync {
    /// Authenticates (or refreshes authentication for) one backend.
    ///
    /// # Arguments
    ///
    /// * `backend_id` - The backend to authenticate
    /// * `handle` - Opaque backend status map for implementations that
    ///   need backend-reported metadata
    async fn authenticate(&self, backend_id: &str, handle: &Value) -> AuthOutcome;

    /// Returns whether the backend currently holds valid authentication.
    async fn has_valid_auth(&self, backend_id: &str) -> bool;

    /// Checks that the backend speaks a protocol revision this
    /// deployment accepts.
    async fn check_protocol_compliance(&self, handle: &Value) -> bool;
}

/// Shared-secret authentication adapter.
///
/// Holds one API key per backend and treats a backend as authenticated
/// when a key is registered for it. Keys are compared in constant time.
/// Backends without a registered key are rejected.
///
/// Protocol compliance passes when the backend's status map either omits
/// a `protocol_version` field or reports one of the accepted versions.
#[derive(Default)]
pub struct SharedKeyAuth {
    keys: HashMap<String, String>,
    accepted_versions: Vec<String>,
}

impl SharedKeyAuth {
    /// Creates an adapter with no registered keys.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the shared secret for one backend.
    pub fn register_key(&mut self, backend_id: impl Into<String>, key: impl Into<String>) {
        self.keys.insert(backend_id.into(), key.into());
    }

    /// Restricts protocol compliance to the given versions.
    ///
    /// With an empty list (the default) any reported version passes.
    pub fn with_accepted_versions(mut self, versions: Vec<String>) -> Self {
        self.accepted_versions = versions;
        self
    }

    /// Validates a presented key for a backend in constant time.
    pub fn validate_key(&self, backend_id: &str, presented: &str) -> bool {
        match self.keys.get(backend_id) {
            Some(expected) => constant_time_eq(expected, presented),
            None => false,
        }
    }
}

#[async_trait]
impl AuthAdapter for SharedKeyAuth {
    async fn authenticate(&self, backend_id: &str, _handle: &Value) -> AuthOutcome {
        if self.keys.contains_key(backend_id) {
            AuthOutcome::authenticated()
        } else {
            AuthOutcome::rejected(format!("no credentials registered for {backend_id}"))
        }
    }

    async fn has_valid_auth(&self, backend_id: &str) -> bool {
        self.keys.contains_key(backend_id)
    }

    async fn check_protocol_compliance(&self, handle: &Value) -> bool {
        match handle.get("protocol_version").and_then(Value::as_str) {
            Some(version) => {
                self.accepted_versions.is_empty()
                    || self.accepted_versions.iter().any(|v| v == version)
            }
            None => true,
        }
    }
}

/// Performs constant-time string comparison to prevent timing attacks.
///
/// Always iterates through both strings in full regardless of where the
/// first difference occurs.
fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (byte_a, byte_b) in a.bytes().zip(b.bytes()) {
        result |= byte_a ^ byte_b;
    }

    result == 0
}
