//! The JSON-RPC method dispatcher: admission control, concurrency limits,
//! timeouts, cancellation, and routing to the tool/resource/prompt registry.

use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, trace, warn};

use crate::errors::FlyError;
use crate::AppContext;

use super::capabilities;
use super::registry::{CancelToken, ProgressSink, Registry};
use super::transport::{Notification, OutputSink, Request, Response, RpcError};

const DEFAULT_TOOL_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(300);

/// Per-tool concurrency gates, built once from the registry's `max_concurrency`
/// annotations.
struct ToolSemaphores {
    by_name: std::collections::HashMap<&'static str, Arc<tokio::sync::Semaphore>>,
}

impl ToolSemaphores {
    fn build(registry: &Registry) -> Self {
        let mut by_name = std::collections::HashMap::new();
        for tool in registry.tools() {
            if let Some(limit) = tool.max_concurrency {
                by_name.insert(tool.name, Arc::new(tokio::sync::Semaphore::new(limit)));
            }
        }
        Self { by_name }
    }

    fn get(&self, name: &str) -> Option<Arc<tokio::sync::Semaphore>> {
        self.by_name.get(name).cloned()
    }
}

pub struct Dispatcher {
    ctx: Arc<AppContext>,
    registry: Arc<Registry>,
    global_permits: Arc<tokio::sync::Semaphore>,
    tool_semaphores: ToolSemaphores,
    in_flight: DashMap<String, CancelToken>,
    server_capabilities: capabilities::Capabilities,
}

impl Dispatcher {
    pub fn new(ctx: Arc<AppContext>, registry: Arc<Registry>) -> Self {
        let tool_semaphores = ToolSemaphores::build(&registry);
        let global_permits = Arc::new(tokio::sync::Semaphore::new(ctx.config.global_concurrency));
        Self {
            ctx,
            registry,
            global_permits,
            tool_semaphores,
            in_flight: DashMap::new(),
            server_capabilities: capabilities::Capabilities::supported(),
        }
    }

    /// Handle one parsed request/notification. Responses and notifications
    /// are pushed to `output`; this never writes to stdout directly.
    pub async fn handle(&self, request: Request, output: OutputSink) {
        let id = request.id.clone();
        let is_notification = request.is_notification();
        trace!(method = %request.method, id = ?id, "dispatching request");

        if request.method == "$/cancelRequest" {
            self.handle_cancel(request.params);
            return;
        }

        if request.jsonrpc.as_deref().is_some_and(|v| v != "2.0") {
            if !is_notification {
                output.send_response(Response::err(
                    id.unwrap_or(Value::Null),
                    RpcError::new(crate::errors::CODE_INVALID_REQUEST, "jsonrpc must be \"2.0\""),
                ));
            }
            return;
        }

        let request_id_key = id.as_ref().map(|v| v.to_string());

        let result = self.route(&request, &output, request_id_key.as_deref()).await;

        if let Some(key) = &request_id_key {
            self.in_flight.remove(key);
        }

        if is_notification {
            return;
        }
        let id = id.unwrap_or(Value::Null);
        match result {
            Ok(value) => output.send_response(Response::ok(id, value)),
            Err(err) => output.send_response(Response::err(id, RpcError::from_fly_error(&err))),
        }
    }

    fn handle_cancel(&self, params: Option<Value>) {
        let Some(params) = params else { return };
        let Some(id) = params.get("id") else { return };
        let key = id.to_string();
        if let Some(token) = self.in_flight.get(&key) {
            token.cancel();
        }
        // Unknown ids are silently ignored per the cancellation contract.
    }

    async fn route(
        &self,
        request: &Request,
        output: &OutputSink,
        request_id_key: Option<&str>,
    ) -> Result<Value, FlyError> {
        match request.method.as_str() {
            "initialize" => self.handle_initialize(request.params.clone()),
            "initialized" => Ok(Value::Null),
            "ping" => Ok(serde_json::json!({})),
            "tools/list" => Ok(self.handle_tools_list()),
            "tools/call" => self.handle_tools_call(request, output, request_id_key).await,
            "resources/list" => self.handle_resources_list(request.params.clone()).await,
            "resources/read" => self.handle_resources_read(request.params.clone()).await,
            "prompts/list" => Ok(self.handle_prompts_list()),
            "prompts/get" => self.handle_prompts_get(request.params.clone()).await,
            other => Err(FlyError::MethodNotFound(other.to_string())),
        }
    }

    fn handle_initialize(&self, params: Option<Value>) -> Result<Value, FlyError> {
        let client_capabilities = params
            .as_ref()
            .and_then(|p| p.get("capabilities"))
            .cloned()
            .unwrap_or(Value::Null);
        let negotiated = capabilities::negotiate(&self.server_capabilities, &client_capabilities);
        Ok(serde_json::json!({
            "serverName": "flyd",
            "version": env!("CARGO_PKG_VERSION"),
            "capabilities": negotiated,
        }))
    }

    fn handle_tools_list(&self) -> Value {
        let tools: Vec<Value> = self.registry.tools().iter().map(|t| t.public_metadata()).collect();
        serde_json::json!({ "tools": tools })
    }

    fn handle_prompts_list(&self) -> Value {
        let prompts: Vec<Value> = self
            .registry
            .prompts()
            .iter()
            .map(|p| {
                serde_json::json!({
                    "id": p.id(),
                    "title": p.title(),
                    "description": p.description(),
                    "variables": p.variables().iter().map(|v| serde_json::json!({
                        "name": v.name,
                        "required": v.required,
                        "description": v.description,
                    })).collect::<Vec<_>>(),
                })
            })
            .collect();
        serde_json::json!({ "prompts": prompts })
    }

    async fn handle_prompts_get(&self, params: Option<Value>) -> Result<Value, FlyError> {
        let params = params.unwrap_or(Value::Null);
        let id = params
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| FlyError::invalid_params("missing required field 'id'"))?;
        let arguments = params.get("arguments").cloned().unwrap_or(Value::Null);

        let prompt = self
            .registry
            .find_prompt(id)
            .ok_or_else(|| FlyError::NotFound(format!("prompt '{id}' not found")))?;

        let supplied: std::collections::HashSet<&str> = arguments
            .as_object()
            .map(|m| m.keys().map(|k| k.as_str()).collect())
            .unwrap_or_default();
        let missing: Vec<&str> = prompt
            .variables()
            .iter()
            .filter(|v| v.required && !supplied.contains(v.name))
            .map(|v| v.name)
            .collect();
        if !missing.is_empty() {
            return Err(FlyError::invalid_params_with(
                format!("missing required prompt variables for '{id}'"),
                serde_json::json!({ "variablesNeeded": missing }),
            ));
        }

        prompt.render(&arguments).await
    }

    async fn handle_resources_list(&self, params: Option<Value>) -> Result<Value, FlyError> {
        let params = params.unwrap_or(Value::Null);
        let uri = params.get("uri").and_then(|v| v.as_str()).unwrap_or("");
        let strategy = self
            .registry
            .find_resource(uri)
            .ok_or_else(|| FlyError::NotFound(format!("no resource strategy for uri '{uri}'")))?;
        strategy.list(&self.ctx, params).await
    }

    async fn handle_resources_read(&self, params: Option<Value>) -> Result<Value, FlyError> {
        let params = params.unwrap_or(Value::Null);
        let uri = params
            .get("uri")
            .and_then(|v| v.as_str())
            .ok_or_else(|| FlyError::invalid_params("missing required field 'uri'"))?;
        let strategy = self
            .registry
            .find_resource(uri)
            .ok_or_else(|| FlyError::NotFound(format!("no resource strategy for uri '{uri}'")))?;
        strategy.read(&self.ctx, uri, params.clone()).await
    }

    async fn handle_tools_call(
        &self,
        request: &Request,
        output: &OutputSink,
        request_id_key: Option<&str>,
    ) -> Result<Value, FlyError> {
        let params = request.params.clone().unwrap_or(Value::Null);
        let tool_name = params
            .get("name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| FlyError::invalid_params("missing required field 'name'"))?;
        let arguments = params.get("arguments").cloned().unwrap_or(serde_json::json!({}));
        let progress_token = params
            .get("progressToken")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| request_id_key.unwrap_or("unknown").to_string());

        let tool = self
            .registry
            .find_tool(tool_name)
            .ok_or_else(|| FlyError::invalid_params(format!("unknown tool: {tool_name}")))?;

        let input_errors = super::schema::validate(&tool.input_schema, &arguments);
        if !input_errors.is_empty() {
            return Err(FlyError::invalid_params_with(
                format!("invalid arguments for tool '{tool_name}'"),
                serde_json::json!({ "errors": input_errors }),
            ));
        }

        // Admission: global permit first, then the per-tool permit, both
        // bounded by the admission timeout so a saturated server fails fast
        // instead of queuing forever. A saturated pool is reported as
        // `invalid_request{reason:"busy"}`, distinct from the per-tool
        // execution timeout below.
        let admission_timeout = self.ctx.config.admission_timeout;
        let busy = || {
            FlyError::invalid_request_with(
                format!("server busy: no permit available within {admission_timeout:?}"),
                serde_json::json!({ "reason": "busy" }),
            )
        };
        let _global_permit = tokio::time::timeout(admission_timeout, self.global_permits.acquire())
            .await
            .map_err(|_| busy())?
            .map_err(|_| FlyError::Internal("global semaphore closed".into()))?;

        let _tool_permit = if let Some(sem) = self.tool_semaphores.get(tool_name) {
            Some(
                tokio::time::timeout(admission_timeout, sem.acquire_owned())
                    .await
                    .map_err(|_| busy())?
                    .map_err(|_| FlyError::Internal("tool semaphore closed".into()))?,
            )
        } else {
            None
        };

        let cancel = CancelToken::new();
        if let Some(key) = request_id_key {
            self.in_flight.insert(key.to_string(), cancel.clone());
        }

        let progress = ProgressSink::new(output.clone(), progress_token);
        let timeout = tool.timeout.unwrap_or(DEFAULT_TOOL_TIMEOUT);
        let handler = tool.handler.clone();
        let ctx = self.ctx.clone();
        let cancel_for_call = cancel.clone();

        // Run the handler on its own task so a panic inside it unwinds that
        // task, not the dispatcher's — `JoinError::into_panic` turns it back
        // into a value instead of taking the whole server down.
        let call_task = tokio::spawn(async move { handler.call(&ctx, arguments, cancel_for_call, progress).await });

        let outcome = tokio::select! {
            result = tokio::time::timeout(timeout, call_task) => result,
            _ = cancel.cancelled() => {
                info!(tool = tool_name, "tool invocation cancelled");
                return Err(FlyError::Canceled);
            }
        };

        let result = match outcome {
            Ok(Ok(call_result)) => call_result,
            Ok(Err(join_err)) if join_err.is_panic() => {
                let message = panic_message(join_err.into_panic());
                warn!(tool = tool_name, %message, "tool handler panicked");
                Err(FlyError::Internal(format!("tool '{tool_name}' panicked: {message}")))
            }
            Ok(Err(_cancelled)) => Err(FlyError::Canceled),
            Err(_) => Err(FlyError::Timeout(timeout)),
        };

        let value = result?;
        let output_errors = super::schema::validate(&tool.output_schema, &value);
        if !output_errors.is_empty() {
            warn!(tool = tool_name, ?output_errors, "tool produced output failing its own schema");
            return Err(FlyError::Internal(format!(
                "tool '{tool_name}' returned a value that does not match its declared output schema"
            )));
        }

        Ok(value)
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::DependencyHealthClient;
    use crate::templates::registry::TemplateRegistry;
    use async_trait::async_trait;

    async fn build_ctx() -> Arc<AppContext> {
        let dir = tempfile::tempdir().unwrap();
        let config = crate::FlydConfig::load(dir.path().to_path_buf()).unwrap();
        let config = Arc::new(config);
        Arc::new(AppContext {
            templates: Arc::new(TemplateRegistry::new_for_tests(config.clone())),
            health: Arc::new(DependencyHealthClient::new_for_tests(config.clone())),
            logs: Arc::new(crate::mcp::resources::LogRegistry::new(config.log_ring_cap_bytes)),
            config,
            started_at: std::time::Instant::now(),
        })
    }

    struct EchoTool;

    #[async_trait]
    impl super::super::registry::ToolHandler for EchoTool {
        async fn call(
            &self,
            _ctx: &Arc<AppContext>,
            arguments: Value,
            _cancel: CancelToken,
            _progress: ProgressSink,
        ) -> Result<Value, FlyError> {
            Ok(arguments)
        }
    }

    struct PanicTool;

    #[async_trait]
    impl super::super::registry::ToolHandler for PanicTool {
        async fn call(
            &self,
            _ctx: &Arc<AppContext>,
            _arguments: Value,
            _cancel: CancelToken,
            _progress: ProgressSink,
        ) -> Result<Value, FlyError> {
            panic!("boom");
        }
    }

    fn tool(name: &'static str, handler: Arc<dyn super::super::registry::ToolHandler>) -> super::super::registry::ToolDef {
        super::super::registry::ToolDef {
            name,
            description: "test tool",
            input_schema: serde_json::json!({"type": "object"}),
            output_schema: serde_json::json!({}),
            read_only: true,
            writes_to_disk: false,
            requires_confirmation: false,
            idempotent: true,
            timeout: Some(std::time::Duration::from_secs(2)),
            max_concurrency: None,
            handler,
        }
    }

    fn mpsc_output() -> (OutputSink, tokio::sync::mpsc::UnboundedReceiver<super::super::transport::OutgoingMessage>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (OutputSink::from_channel(tx), rx)
    }

    #[tokio::test]
    async fn unknown_method_maps_to_method_not_found() {
        let ctx = build_ctx().await;
        let registry = Arc::new(Registry::new(vec![], vec![], vec![]));
        let dispatcher = Dispatcher::new(ctx, registry);
        let (output, _rx) = mpsc_output();
        let request = Request { jsonrpc: Some("2.0".into()), id: Some(Value::from(1)), method: "bogus".into(), params: None };
        let result = dispatcher.route(&request, &output, Some("1")).await;
        assert!(matches!(result, Err(FlyError::MethodNotFound(_))));
    }

    #[tokio::test]
    async fn tools_call_routes_to_handler() {
        let ctx = build_ctx().await;
        let registry = Arc::new(Registry::new(vec![tool("fly.echo", Arc::new(EchoTool))], vec![], vec![]));
        let dispatcher = Dispatcher::new(ctx, registry);
        let (output, _rx) = mpsc_output();
        let request = Request {
            jsonrpc: Some("2.0".into()),
            id: Some(Value::from(1)),
            method: "tools/call".into(),
            params: Some(serde_json::json!({"name": "fly.echo", "arguments": {"hello": "world"}})),
        };
        let result = dispatcher.route(&request, &output, Some("1")).await.unwrap();
        assert_eq!(result, serde_json::json!({"hello": "world"}));
    }

    #[tokio::test]
    async fn panicking_handler_becomes_internal_error_not_a_crash() {
        let ctx = build_ctx().await;
        let registry = Arc::new(Registry::new(vec![tool("fly.panic", Arc::new(PanicTool))], vec![], vec![]));
        let dispatcher = Dispatcher::new(ctx, registry);
        let (output, _rx) = mpsc_output();
        let request = Request {
            jsonrpc: Some("2.0".into()),
            id: Some(Value::from(1)),
            method: "tools/call".into(),
            params: Some(serde_json::json!({"name": "fly.panic", "arguments": {}})),
        };
        let result = dispatcher.route(&request, &output, Some("1")).await;
        assert!(matches!(result, Err(FlyError::Internal(_))));
    }

    #[tokio::test]
    async fn cancel_request_marks_in_flight_token_cancelled() {
        let ctx = build_ctx().await;
        let registry = Arc::new(Registry::new(vec![], vec![], vec![]));
        let dispatcher = Dispatcher::new(ctx, registry);
        let token = CancelToken::new();
        dispatcher.in_flight.insert("1".to_string(), token.clone());
        dispatcher.handle_cancel(Some(serde_json::json!({"id": 1})));
        assert!(token.is_cancelled());
    }

    struct SlowTool;

    #[async_trait]
    impl super::super::registry::ToolHandler for SlowTool {
        async fn call(
            &self,
            _ctx: &Arc<AppContext>,
            _arguments: Value,
            _cancel: CancelToken,
            _progress: ProgressSink,
        ) -> Result<Value, FlyError> {
            tokio::time::sleep(std::time::Duration::from_secs(10)).await;
            Ok(Value::Null)
        }
    }

    #[tokio::test]
    async fn saturated_global_pool_fails_admission_as_busy_not_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = crate::FlydConfig::load(dir.path().to_path_buf()).unwrap();
        config.global_concurrency = 1;
        config.admission_timeout = std::time::Duration::from_millis(50);
        let config = Arc::new(config);
        let ctx = Arc::new(AppContext {
            templates: Arc::new(TemplateRegistry::new_for_tests(config.clone())),
            health: Arc::new(DependencyHealthClient::new_for_tests(config.clone())),
            logs: Arc::new(crate::mcp::resources::LogRegistry::new(config.log_ring_cap_bytes)),
            config,
            started_at: std::time::Instant::now(),
        });
        let registry = Arc::new(Registry::new(vec![tool("fly.slow", Arc::new(SlowTool))], vec![], vec![]));
        let dispatcher = Arc::new(Dispatcher::new(ctx, registry));

        let (output, _rx) = mpsc_output();
        let first_call = {
            let dispatcher = dispatcher.clone();
            let output = output.clone();
            tokio::spawn(async move {
                let request = Request {
                    jsonrpc: Some("2.0".into()),
                    id: Some(Value::from(1)),
                    method: "tools/call".into(),
                    params: Some(serde_json::json!({"name": "fly.slow", "arguments": {}})),
                };
                dispatcher.route(&request, &output, Some("1")).await
            })
        };

        // Give the first call time to acquire the lone global permit before
        // the second one tries and finds the pool saturated.
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let request = Request {
            jsonrpc: Some("2.0".into()),
            id: Some(Value::from(2)),
            method: "tools/call".into(),
            params: Some(serde_json::json!({"name": "fly.slow", "arguments": {}})),
        };
        let result = dispatcher.route(&request, &output, Some("2")).await;
        match result {
            Err(FlyError::InvalidRequest { data, .. }) => {
                assert_eq!(data.unwrap()["reason"], "busy");
            }
            other => panic!("expected invalid_request{{reason:busy}}, got {other:?}"),
        }

        first_call.abort();
    }

    #[tokio::test]
    async fn unknown_cancel_id_is_ignored() {
        let ctx = build_ctx().await;
        let registry = Arc::new(Registry::new(vec![], vec![], vec![]));
        let dispatcher = Dispatcher::new(ctx, registry);
        dispatcher.handle_cancel(Some(serde_json::json!({"id": 999})));
    }
}
