//! Switchboard Common Types
//!
//! This crate provides the shared protocol definitions and collaborator
//! interfaces for Switchboard, an orchestration and resilience layer that
//! sits between callers and a set of interchangeable backend service
//! instances.
//!
//! # Overview
//!
//! Switchboard routes logical operations to healthy backends, batches
//! protocol-level calls, and tracks per-backend health and lifecycle
//! state. This crate contains the pieces every component depends on:
//!
//! - **Protocol Layer**: JSON-RPC 2.0 envelope types and the error
//!   taxonomy shared by all subsystems
//! - **Auth Layer**: the pluggable authentication collaborator interface
//!
//! # Components
//!
//! - [`protocol`] - Envelope types, error codes, and [`SwitchboardError`]
//! - [`auth`] - The [`auth::AuthAdapter`] collaborator trait
//!
//! # Example
//!
//! ```
//! use switchboard_common::protocol::{JsonRpcRequest, JsonRpcResponse};
//! use serde_json::json;
//!
//! let request = JsonRpcRequest::new(json!("req-1"), "tools/call", json!({"name": "echo"}));
//! let response = JsonRpcResponse::success(json!("req-1"), json!({"ok": true}));
//! assert!(response.error.is_none());
//! ```

pub mod auth;
pub mod protocol;

pub use protocol::*;
