//! Newline-delimited JSON framing for the single bidirectional vsock RPC
//! channel the agent speaks.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Serialize)]
pub struct Request {
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct Response {
    pub id: u64,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RpcError>,
}

/// The distinguished error code the guest reports back; mirrors
/// [`crate::error::ErrorCode`] so the client can map it directly.
#[derive(Debug, Deserialize, Clone)]
pub struct RpcError {
    pub code: String,
    pub message: String,
}
