pub mod error;
pub mod jsonrpc;

pub use error::{Result, SwitchboardError};
pub use jsonrpc::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};
