//! MCP capability negotiation during the `initialize` handshake.
//!
//! The server advertises everything it supports; `negotiate` intersects that
//! with what the client actually asked for, so the server never claims a
//! capability the client didn't request.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The capability set `flyd` can offer as an MCP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capabilities {
    pub tools: bool,
    pub resources: bool,
    pub prompts: bool,
    pub progress: bool,
    pub cancellation: bool,
}

impl Capabilities {
    /// Everything this build actually supports.
    pub fn supported() -> Self {
        Self {
            tools: true,
            resources: true,
            prompts: true,
            progress: true,
            cancellation: true,
        }
    }

    pub fn to_value(&self) -> Value {
        let mut cap = serde_json::Map::new();
        if self.tools {
            cap.insert("tools".into(), serde_json::json!({ "listChanged": false }));
        }
        if self.resources {
            cap.insert("resources".into(), serde_json::json!({}));
        }
        if self.prompts {
            cap.insert("prompts".into(), serde_json::json!({}));
        }
        if self.progress {
            cap.insert("progress".into(), serde_json::json!({}));
        }
        if self.cancellation {
            cap.insert("cancellation".into(), serde_json::json!({}));
        }
        Value::Object(cap)
    }
}

/// Intersect `server`'s supported capabilities with what the client
/// requested in its `initialize` params.
pub fn negotiate(server: &Capabilities, client_caps: &Value) -> Value {
    let wants = |key: &str| client_caps.get(key).is_some();
    Capabilities {
        tools: server.tools && wants("tools"),
        resources: server.resources && wants("resources"),
        prompts: server.prompts && wants("prompts"),
        progress: server.progress && wants("progress"),
        cancellation: server.cancellation && wants("cancellation"),
    }
    .to_value()
}
