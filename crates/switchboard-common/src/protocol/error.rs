use thiserror::Error;

/// Error taxonomy for Switchboard operations.
///
/// Each variant corresponds to one of the expected failure modes of the
/// orchestration layer. A routing miss is deliberately *not* an error:
/// the routing engine returns `None` and the caller falls back to the
/// load balancer.
#[derive(Error, Debug)]
pub enum SwitchboardError {
    /// A backend call failed while executing a capability.
    #[error("Execution error: {0}")]
    Execution(String),

    /// Authentication failed or expired. Never silently retried.
    #[error("Authentication error: {0}")]
    Auth(String),

    /// An operation exceeded its deadline.
    #[error("Request timeout after {0}ms")]
    Timeout(u64),

    /// Resource pool acquisition timed out waiting for a free instance.
    #[error("Pool acquisition timeout after {0}ms")]
    PoolTimeout(u64),

    /// A capability update (or similar request) failed validation and
    /// was rejected without being applied.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A lifecycle command was not legal for the backend's current state.
    /// The backend is left in its prior state.
    #[error("Invalid lifecycle transition: cannot {command} while {state}")]
    InvalidTransition {
        /// The requested command (start, stop, pause, resume)
        command: String,
        /// The state the backend was in when the command arrived
        state: String,
    },

    /// No backend is registered under the given ID.
    #[error("Backend not found: {0}")]
    BackendNotFound(String),

    /// The selected backend is registered but not currently reachable.
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// A pending batch request was aborted before execution, typically
    /// because its backend was unregistered.
    #[error("Batch aborted: {0}")]
    BatchAborted(String),

    /// No backend could serve the request after exhausting candidates.
    #[error("All backends failed")]
    AllBackendsFailed,

    /// The request itself was malformed.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SwitchboardError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SwitchboardError::Execution("boom".to_string());
        assert_eq!(err.to_string(), "Execution error: boom");

        let err = SwitchboardError::Timeout(2500);
        assert_eq!(err.to_string(), "Request timeout after 2500ms");

        let err = SwitchboardError::PoolTimeout(30000);
        assert_eq!(err.to_string(), "Pool acquisition timeout after 30000ms");
    }

    #[test]
    fn test_invalid_transition_display() {
        let err = SwitchboardError::InvalidTransition {
            command: "resume".to_string(),
            state: "running".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid lifecycle transition: cannot resume while running"
        );
    }

    #[test]
    fn test_from_serde_json() {
        let parse_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let err: SwitchboardError = parse_err.into();
        assert!(matches!(err, SwitchboardError::JsonSerialization(_)));
    }
}
