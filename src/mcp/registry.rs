//! Strategy tables for tools, resources, and prompts.
//!
//! `tools/list`, `resources/list`, and `prompts/list` are served straight out
//! of these frozen, registry-build-time tables; `tools/call`, `resources/read`,
//! and `prompts/get` look a name or URI prefix up in them.

use crate::errors::FlyError;
use crate::AppContext;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use super::transport::OutputSink;

/// Cooperative cancellation handed to every tool handler.
#[derive(Clone)]
pub struct CancelToken {
    cancelled: Arc<std::sync::atomic::AtomicBool>,
    notify: Arc<tokio::sync::Notify>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            notify: Arc::new(tokio::sync::Notify::new()),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, std::sync::atomic::Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Resolves once `cancel()` has been called; cheap to poll in a `select!`.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.notify.notified().await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Forwards `$/progress` notifications for one in-flight request.
#[derive(Clone)]
pub struct ProgressSink {
    output: OutputSink,
    progress_token: String,
}

impl ProgressSink {
    pub fn new(output: OutputSink, progress_token: String) -> Self {
        Self { output, progress_token }
    }

    pub fn report(&self, progress: u64, total: Option<u64>) {
        self.output.send_notification(super::transport::Notification::progress(
            &self.progress_token,
            progress,
            total,
        ));
    }
}

#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(
        &self,
        ctx: &Arc<AppContext>,
        arguments: Value,
        cancel: CancelToken,
        progress: ProgressSink,
    ) -> Result<Value, FlyError>;
}

/// Immutable tool metadata plus its handler.
pub struct ToolDef {
    pub name: &'static str,
    pub description: &'static str,
    pub input_schema: Value,
    pub output_schema: Value,
    pub read_only: bool,
    pub writes_to_disk: bool,
    pub requires_confirmation: bool,
    pub idempotent: bool,
    pub timeout: Option<std::time::Duration>,
    pub max_concurrency: Option<usize>,
    pub handler: Arc<dyn ToolHandler>,
}

impl ToolDef {
    /// The public metadata returned by `tools/list` (no handler, no
    /// concurrency/timeout internals).
    pub fn public_metadata(&self) -> Value {
        serde_json::json!({
            "name": self.name,
            "description": self.description,
            "inputSchema": self.input_schema,
            "outputSchema": self.output_schema,
            "readOnly": self.read_only,
            "writesToDisk": self.writes_to_disk,
            "requiresConfirmation": self.requires_confirmation,
            "idempotent": self.idempotent,
        })
    }
}

#[async_trait]
pub trait ResourceStrategy: Send + Sync {
    fn uri_prefix(&self) -> &str;
    fn description(&self) -> &str;
    fn read_only(&self) -> bool {
        true
    }
    async fn list(&self, ctx: &Arc<AppContext>, params: Value) -> Result<Value, FlyError>;
    async fn read(&self, ctx: &Arc<AppContext>, uri: &str, params: Value) -> Result<Value, FlyError>;
}

pub struct PromptVariable {
    pub name: &'static str,
    pub required: bool,
    pub description: &'static str,
}

#[async_trait]
pub trait PromptStrategy: Send + Sync {
    fn id(&self) -> &str;
    fn title(&self) -> &str;
    fn description(&self) -> &str;
    fn variables(&self) -> &[PromptVariable];
    async fn render(&self, arguments: &Value) -> Result<Value, FlyError>;
}

/// The frozen tool/resource/prompt tables, built once at startup.
pub struct Registry {
    tools: Vec<ToolDef>,
    resources: Vec<Box<dyn ResourceStrategy>>,
    prompts: Vec<Box<dyn PromptStrategy>>,
}

impl Registry {
    pub fn new(
        tools: Vec<ToolDef>,
        resources: Vec<Box<dyn ResourceStrategy>>,
        prompts: Vec<Box<dyn PromptStrategy>>,
    ) -> Self {
        Self { tools, resources, prompts }
    }

    pub fn tools(&self) -> &[ToolDef] {
        &self.tools
    }

    pub fn find_tool(&self, name: &str) -> Option<&ToolDef> {
        self.tools.iter().find(|t| t.name == name)
    }

    /// Resource dispatch picks the strategy whose `uri_prefix` is the
    /// longest match for `uri`.
    pub fn find_resource(&self, uri: &str) -> Option<&dyn ResourceStrategy> {
        self.resources
            .iter()
            .filter(|r| uri.starts_with(r.uri_prefix()))
            .max_by_key(|r| r.uri_prefix().len())
            .map(|r| r.as_ref())
    }

    pub fn resources(&self) -> &[Box<dyn ResourceStrategy>] {
        &self.resources
    }

    pub fn find_prompt(&self, id: &str) -> Option<&dyn PromptStrategy> {
        self.prompts.iter().find(|p| p.id() == id).map(|p| p.as_ref())
    }

    pub fn prompts(&self) -> &[Box<dyn PromptStrategy>] {
        &self.prompts
    }
}
