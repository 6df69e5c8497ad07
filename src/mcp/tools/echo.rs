//! `fly.echo` — the trivial round-trip tool used to smoke-test a client's
//! transport plumbing before it trusts the server for anything real.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use crate::errors::FlyError;
use crate::mcp::registry::{CancelToken, ProgressSink, ToolDef, ToolHandler};
use crate::AppContext;

struct EchoHandler;

#[async_trait]
impl ToolHandler for EchoHandler {
    async fn call(
        &self,
        _ctx: &Arc<AppContext>,
        arguments: Value,
        _cancel: CancelToken,
        _progress: ProgressSink,
    ) -> Result<Value, FlyError> {
        let message = arguments
            .get("message")
            .and_then(|v| v.as_str())
            .ok_or_else(|| FlyError::invalid_params("missing required field 'message'"))?;
        Ok(serde_json::json!({ "message": message }))
    }
}

pub fn tool_def() -> ToolDef {
    ToolDef {
        name: "fly.echo",
        description: "Echo a message back. Used to verify the transport is working.",
        input_schema: serde_json::json!({
            "type": "object",
            "required": ["message"],
            "properties": { "message": { "type": "string" } },
            "additionalProperties": false
        }),
        output_schema: serde_json::json!({
            "type": "object",
            "required": ["message"],
            "properties": { "message": { "type": "string" } }
        }),
        read_only: true,
        writes_to_disk: false,
        requires_confirmation: false,
        idempotent: true,
        timeout: Some(std::time::Duration::from_secs(5)),
        max_concurrency: None,
        handler: super::handler(EchoHandler),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::DependencyHealthClient;
    use crate::templates::registry::TemplateRegistry;

    #[tokio::test]
    async fn echoes_the_message_back() {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(crate::FlydConfig::load(dir.path().to_path_buf()).unwrap());
        let ctx = Arc::new(AppContext {
            templates: Arc::new(TemplateRegistry::new_for_tests(config.clone())),
            health: Arc::new(DependencyHealthClient::new_for_tests(config.clone())),
            logs: Arc::new(crate::mcp::resources::LogRegistry::new(config.log_ring_cap_bytes)),
            config,
            started_at: std::time::Instant::now(),
        });

        let result = EchoHandler
            .call(&ctx, serde_json::json!({"message": "hi"}), CancelToken::new(), test_progress())
            .await
            .unwrap();
        assert_eq!(result, serde_json::json!({"message": "hi"}));
    }

    #[tokio::test]
    async fn missing_message_is_invalid_params() {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(crate::FlydConfig::load(dir.path().to_path_buf()).unwrap());
        let ctx = Arc::new(AppContext {
            templates: Arc::new(TemplateRegistry::new_for_tests(config.clone())),
            health: Arc::new(DependencyHealthClient::new_for_tests(config.clone())),
            logs: Arc::new(crate::mcp::resources::LogRegistry::new(config.log_ring_cap_bytes)),
            config,
            started_at: std::time::Instant::now(),
        });

        let result = EchoHandler
            .call(&ctx, serde_json::json!({}), CancelToken::new(), test_progress())
            .await;
        assert!(matches!(result, Err(FlyError::InvalidParams { .. })));
    }

    fn test_progress() -> ProgressSink {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        ProgressSink::new(crate::mcp::transport::OutputSink::from_channel(tx), "test".to_string())
    }
}
