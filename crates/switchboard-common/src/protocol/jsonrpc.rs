//! JSON-RPC 2.0 Envelope Types
//!
//! Switchboard has no wire format of its own beyond the protocol-level
//! batch envelope it assembles when talking to backends that expose a
//! native batch-execute capability.
//!
//! # Envelope Format
//!
//! - Request: `{"jsonrpc": "2.0", "id": ..., "method": "...", "params": ...}`
//! - Success: `{"jsonrpc": "2.0", "id": ..., "result": ...}`
//! - Failure: `{"jsonrpc": "2.0", "id": ..., "error": {"code": ..., "message": "...", "data": ...}}`
//!
//! # Error Codes
//!
//! Standard JSON-RPC 2.0 codes plus the two application codes this layer
//! emits:
//! - `-32700`: Parse error
//! - `-32600`: Invalid request
//! - `-32601`: Method not found
//! - `-32602`: Invalid params
//! - `-32603`: Internal error
//! - `-32000`: Generic execution failure
//! - `-32001`: Authentication failure

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-RPC 2.0 request envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// JSON-RPC version (must be "2.0")
    pub jsonrpc: String,
    /// Request identifier (number, string, or null)
    pub id: Value,
    /// Name of the method to invoke
    pub method: String,
    /// Parameter values (array or object)
    pub params: Value,
}

impl JsonRpcRequest {
    /// Creates a new request envelope with the "2.0" version tag.
    ///
    /// # Arguments
    ///
    /// * `id` - Request identifier (must be unique within a batch)
    /// * `method` - Method name to invoke
    /// * `params` - Parameter values
    pub fn new(id: Value, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            method: method.into(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    /// JSON-RPC version (must be "2.0")
    pub jsonrpc: String,
    /// Result value on success (None if error is present)
    pub result: Option<Value>,
    /// Error object on failure (None if result is present)
    pub error: Option<JsonRpcError>,
    /// Request identifier (must match the request id)
    pub id: Value,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcError {
    /// Error code (standard codes are negative integers)
    pub code: i32,
    /// Short description of the error
    pub message: String,
    /// Additional data (optional)
    pub data: Option<Value>,
}

// Standard JSON-RPC 2.0 error codes
/// Invalid JSON was received by the server
pub const PARSE_ERROR: i32 = -32700;
/// The JSON sent is not a valid Request object
pub const INVALID_REQUEST: i32 = -32600;
/// The method does not exist / is not available
pub const METHOD_NOT_FOUND: i32 = -32601;
/// Invalid method parameter(s)
pub const INVALID_PARAMS: i32 = -32602;
/// Internal JSON-RPC error
pub const INTERNAL_ERROR: i32 = -32603;
/// A backend capability call failed during execution
pub const EXECUTION_ERROR: i32 = -32000;
/// Authentication was missing, invalid, or expired
pub const AUTH_ERROR: i32 = -32001;

impl JsonRpcError {
    /// Create a parse error (-32700)
    pub fn parse_error() -> Self {
        Self {
            code: PARSE_ERROR,
            message: "Parse error".into(),
            data: None,
        }
    }

    /// Create an invalid request error (-32600)
    pub fn invalid_request() -> Self {
        Self {
            code: INVALID_REQUEST,
            message: "Invalid Request".into(),
            data: None,
        }
    }

    /// Create a method not found error (-32601)
    pub fn method_not_found() -> Self {
        Self {
            code: METHOD_NOT_FOUND,
            message: "Method not found".into(),
            data: None,
        }
    }

    /// Create an invalid params error (-32602)
    pub fn invalid_params(msg: &str) -> Self {
        Self {
            code: INVALID_PARAMS,
            message: msg.into(),
            data: None,
        }
    }

    /// Create an internal error (-32603)
    pub fn internal_error(msg: &str) -> Self {
        Self {
            code: INTERNAL_ERROR,
            message: msg.into(),
            data: None,
        }
    }

    /// Create a generic execution failure (-32000)
    ///
    /// Used when a backend capability call throws during batch or
    /// single-call execution.
    pub fn execution_error(msg: &str) -> Self {
        Self {
            code: EXECUTION_ERROR,
            message: msg.into(),
            data: None,
        }
    }

    /// Create an authentication failure (-32001)
    ///
    /// Used when the auth adapter rejects a backend before a batch is
    /// dispatched. Always surfaced, never silently retried.
    pub fn auth_error(msg: &str) -> Self {
        Self {
            code: AUTH_ERROR,
            message: msg.into(),
            data: None,
        }
    }

    /// Returns whether this error denotes an authentication failure.
    pub fn is_auth_error(&self) -> bool {
        self.code == AUTH_ERROR
    }
}

impl JsonRpcResponse {
    /// Create a success response
    ///
    /// # Arguments
    ///
    /// * `id` - Request identifier (must match the request id)
    /// * `result` - Result value
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            result: Some(result),
            error: None,
            id,
        }
    }

    /// Create an error response
    ///
    /// # Arguments
    ///
    /// * `id` - Request identifier (must match the request id)
    /// * `error` - Error object
    pub fn error(id: Value, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            result: None,
            error: Some(error),
            id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_serialization() {
        let req = JsonRpcRequest::new(json!("batch-1"), "tools/call", json!({"name": "echo"}));
        let serialized = serde_json::to_string(&req).unwrap();
        assert!(serialized.contains("\"jsonrpc\":\"2.0\""));
        assert!(serialized.contains("\"method\":\"tools/call\""));
        assert!(serialized.contains("\"id\":\"batch-1\""));
    }

    #[test]
    fn test_response_success() {
        let res = JsonRpcResponse::success(json!(1), json!({"value": 42}));
        assert_eq!(res.result, Some(json!({"value": 42})));
        assert_eq!(res.error, None);
        assert_eq!(res.jsonrpc, "2.0");
    }

    #[test]
    fn test_response_error() {
        let res = JsonRpcResponse::error(json!(1), JsonRpcError::execution_error("backend threw"));
        assert_eq!(res.result, None);
        assert_eq!(res.error.unwrap().code, EXECUTION_ERROR);
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(JsonRpcError::parse_error().code, -32700);
        assert_eq!(JsonRpcError::invalid_request().code, -32600);
        assert_eq!(JsonRpcError::method_not_found().code, -32601);
        assert_eq!(JsonRpcError::invalid_params("p").code, -32602);
        assert_eq!(JsonRpcError::internal_error("i").code, -32603);
        assert_eq!(JsonRpcError::execution_error("e").code, -32000);
        assert_eq!(JsonRpcError::auth_error("a").code, -32001);
    }

    #[test]
    fn test_is_auth_error() {
        assert!(JsonRpcError::auth_error("expired").is_auth_error());
        assert!(!JsonRpcError::execution_error("boom").is_auth_error());
    }

    #[test]
    fn test_request_deserialization() {
        let json = r#"{"jsonrpc":"2.0","id":"r1","method":"prompts/get","params":{"name":"greet"}}"#;
        let req: JsonRpcRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.method, "prompts/get");
        assert_eq!(req.id, json!("r1"));
        assert_eq!(req.params, json!({"name": "greet"}));
    }

    #[test]
    fn test_response_with_error_deserialization() {
        let json = r#"{"jsonrpc":"2.0","result":null,"error":{"code":-32001,"message":"auth expired","data":null},"id":"r1"}"#;
        let res: JsonRpcResponse = serde_json::from_str(json).unwrap();
        assert!(res.error.as_ref().unwrap().is_auth_error());
        assert_eq!(res.result, None);
    }
}
