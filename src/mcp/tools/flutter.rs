//! `flutter.doctor`, `flutter.create`, `flutter.run`, `flutter.build` — tools
//! that shell out to the `flutter` binary, streaming its output into log
//! rings instead of blocking the reactor on it.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::warn;

use crate::errors::FlyError;
use crate::mcp::registry::{CancelToken, ProgressSink, ToolDef, ToolHandler};
use crate::mcp::resources::LogStream;
use crate::AppContext;

/// Wait this long for a terminated subprocess to exit on its own before
/// sending a harder kill signal.
const GRACEFUL_SHUTDOWN_WINDOW: std::time::Duration = std::time::Duration::from_secs(2);

#[cfg(unix)]
async fn terminate(child: &mut tokio::process::Child, pid_str: &str) {
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
    }
    if tokio::time::timeout(GRACEFUL_SHUTDOWN_WINDOW, child.wait()).await.is_err() {
        warn!(pid = pid_str, "flutter process ignored SIGTERM, sending SIGKILL");
        let _ = child.kill().await;
        let _ = child.wait().await;
    }
}

#[cfg(not(unix))]
async fn terminate(child: &mut tokio::process::Child, _pid_str: &str) {
    let _ = child.kill().await;
    let _ = child.wait().await;
}

/// Spawn `flutter <args>` in the workspace root, attach stdout to the `Run`
/// ring and stderr to the `Build` ring (both keyed by pid), and respect
/// cooperative cancellation by terminating the child.
async fn run_flutter(
    ctx: &Arc<AppContext>,
    args: &[&str],
    cancel: CancelToken,
    progress: ProgressSink,
) -> Result<Value, FlyError> {
    let mut command = Command::new("flutter");
    command
        .args(args)
        .current_dir(&ctx.config.workspace_root)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = command
        .spawn()
        .map_err(|e| FlyError::Internal(format!("failed to spawn flutter {args:?}: {e}")))?;

    let pid = child.id().map(|p| p.to_string()).unwrap_or_else(|| "unknown".to_string());
    let stdout = child.stdout.take().expect("stdout is piped");
    let stderr = child.stderr.take().expect("stderr is piped");

    let logs = ctx.logs.clone();
    let stdout_pid = pid.clone();
    let stdout_progress = progress.clone();
    let stdout_task = tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        let mut count: u64 = 0;
        while let Ok(Some(line)) = lines.next_line().await {
            logs.append(LogStream::Run, &stdout_pid, format!("{line}\n").as_bytes());
            count += 1;
            stdout_progress.report(count, None);
        }
    });

    let logs = ctx.logs.clone();
    let stderr_pid = pid.clone();
    let stderr_task = tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            logs.append(LogStream::Build, &stderr_pid, format!("{line}\n").as_bytes());
        }
    });

    let outcome: Result<Option<std::process::ExitStatus>, FlyError> = tokio::select! {
        status = child.wait() => status
            .map(Some)
            .map_err(|e| FlyError::Internal(format!("flutter process error: {e}"))),
        _ = cancel.cancelled() => {
            terminate(&mut child, &pid).await;
            Ok(None)
        }
    };

    let _ = stdout_task.await;
    let _ = stderr_task.await;

    match outcome? {
        Some(status) => Ok(serde_json::json!({
            "pid": pid,
            "exitCode": status.code(),
            "success": status.success(),
        })),
        None => Err(FlyError::Canceled),
    }
}

struct DoctorHandler;

#[async_trait]
impl ToolHandler for DoctorHandler {
    async fn call(
        &self,
        ctx: &Arc<AppContext>,
        _arguments: Value,
        cancel: CancelToken,
        progress: ProgressSink,
    ) -> Result<Value, FlyError> {
        run_flutter(ctx, &["doctor", "-v"], cancel, progress).await
    }
}

pub fn doctor_tool_def() -> ToolDef {
    ToolDef {
        name: "flutter.doctor",
        description: "Run `flutter doctor -v` and return its exit status; full output streams to logs://build/<pid>.",
        input_schema: serde_json::json!({ "type": "object", "additionalProperties": false }),
        output_schema: serde_json::json!({
            "type": "object",
            "required": ["pid", "success"],
            "properties": { "pid": { "type": "string" }, "exitCode": {}, "success": { "type": "boolean" } }
        }),
        read_only: true,
        writes_to_disk: false,
        requires_confirmation: false,
        idempotent: true,
        timeout: Some(std::time::Duration::from_secs(120)),
        max_concurrency: None,
        handler: super::handler(DoctorHandler),
    }
}

struct CreateHandler;

#[async_trait]
impl ToolHandler for CreateHandler {
    async fn call(
        &self,
        ctx: &Arc<AppContext>,
        arguments: Value,
        cancel: CancelToken,
        progress: ProgressSink,
    ) -> Result<Value, FlyError> {
        let name = arguments
            .get("name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| FlyError::invalid_params("missing required field 'name'"))?;
        run_flutter(ctx, &["create", name], cancel, progress).await
    }
}

pub fn create_tool_def() -> ToolDef {
    ToolDef {
        name: "flutter.create",
        description: "Run `flutter create <name>` in the workspace root.",
        input_schema: serde_json::json!({
            "type": "object",
            "required": ["name"],
            "properties": { "name": { "type": "string" } },
            "additionalProperties": false
        }),
        output_schema: serde_json::json!({
            "type": "object",
            "required": ["pid", "success"],
            "properties": { "pid": { "type": "string" }, "exitCode": {}, "success": { "type": "boolean" } }
        }),
        read_only: false,
        writes_to_disk: true,
        requires_confirmation: true,
        idempotent: false,
        timeout: Some(std::time::Duration::from_secs(180)),
        max_concurrency: None,
        handler: super::handler(CreateHandler),
    }
}

struct RunHandler;

#[async_trait]
impl ToolHandler for RunHandler {
    async fn call(
        &self,
        ctx: &Arc<AppContext>,
        arguments: Value,
        cancel: CancelToken,
        progress: ProgressSink,
    ) -> Result<Value, FlyError> {
        match arguments.get("device").and_then(|v| v.as_str()) {
            Some(device) => run_flutter(ctx, &["run", "-d", device], cancel, progress).await,
            None => run_flutter(ctx, &["run"], cancel, progress).await,
        }
    }
}

pub fn run_tool_def() -> ToolDef {
    ToolDef {
        name: "flutter.run",
        description: "Run `flutter run` against the workspace, optionally targeting a device id.",
        input_schema: serde_json::json!({
            "type": "object",
            "properties": { "device": { "type": "string" } },
            "additionalProperties": false
        }),
        output_schema: serde_json::json!({
            "type": "object",
            "required": ["pid", "success"],
            "properties": { "pid": { "type": "string" }, "exitCode": {}, "success": { "type": "boolean" } }
        }),
        read_only: false,
        writes_to_disk: false,
        requires_confirmation: true,
        idempotent: false,
        timeout: Some(std::time::Duration::from_secs(600)),
        max_concurrency: Some(2),
        handler: super::handler(RunHandler),
    }
}

struct BuildHandler;

#[async_trait]
impl ToolHandler for BuildHandler {
    async fn call(
        &self,
        ctx: &Arc<AppContext>,
        arguments: Value,
        cancel: CancelToken,
        progress: ProgressSink,
    ) -> Result<Value, FlyError> {
        let target = arguments
            .get("target")
            .and_then(|v| v.as_str())
            .ok_or_else(|| FlyError::invalid_params("missing required field 'target'"))?;
        run_flutter(ctx, &["build", target], cancel, progress).await
    }
}

pub fn build_tool_def() -> ToolDef {
    ToolDef {
        name: "flutter.build",
        description: "Run `flutter build <target>` (e.g. apk, ios, web) in the workspace root.",
        input_schema: serde_json::json!({
            "type": "object",
            "required": ["target"],
            "properties": { "target": { "type": "string" } },
            "additionalProperties": false
        }),
        output_schema: serde_json::json!({
            "type": "object",
            "required": ["pid", "success"],
            "properties": { "pid": { "type": "string" }, "exitCode": {}, "success": { "type": "boolean" } }
        }),
        read_only: false,
        writes_to_disk: true,
        requires_confirmation: true,
        idempotent: false,
        timeout: Some(std::time::Duration::from_secs(900)),
        max_concurrency: None,
        handler: super::handler(BuildHandler),
    }
}
