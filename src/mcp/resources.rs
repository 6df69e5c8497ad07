//! `workspace://`, `logs://run/<pid>`, `logs://build/<pid>`, and `manifest://`
//! resource strategies.
//!
//! The workspace and manifest providers are thin wrappers around
//! [`crate::sandbox`]; the log provider owns its own bounded ring buffers,
//! shared between the `flutter.*` tool handlers that write to them and the
//! `logs://` reads that drain them.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use crate::errors::FlyError;
use crate::sandbox;
use crate::AppContext;

use super::registry::ResourceStrategy;

/// Clamp a byte buffer to the `{start, length}` slice requested in `params`,
/// rejecting an unsliced oversized read with `too_large`.
fn slice_content(bytes: &[u8], params: &Value, max_bytes: usize) -> Result<Value, FlyError> {
    let start = params.get("start").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
    let requested_length = params.get("length").and_then(|v| v.as_u64()).map(|v| v as usize);
    let sliced = params.get("start").is_some() || params.get("length").is_some();

    if !sliced && bytes.len() > max_bytes {
        return Err(FlyError::TooLarge { actual: bytes.len(), limit: max_bytes });
    }

    if start >= bytes.len() {
        return Ok(serde_json::json!({ "content": "", "encoding": "utf-8", "start": start, "length": 0 }));
    }

    let available = bytes.len() - start;
    let length = requested_length.unwrap_or(available).min(available);
    let content = String::from_utf8_lossy(&bytes[start..start + length]).into_owned();
    Ok(serde_json::json!({ "content": content, "encoding": "utf-8", "start": start, "length": length }))
}

/// Sandboxed read access to files under the workspace root.
pub struct WorkspaceResource;

#[async_trait]
impl ResourceStrategy for WorkspaceResource {
    fn uri_prefix(&self) -> &str {
        "workspace://"
    }

    fn description(&self) -> &str {
        "Files under the sandboxed workspace root."
    }

    async fn list(&self, ctx: &Arc<AppContext>, params: Value) -> Result<Value, FlyError> {
        let uri = params.get("uri").and_then(|v| v.as_str()).unwrap_or("workspace://");
        let relative = uri.strip_prefix("workspace://").unwrap_or("");
        let path = sandbox::resolve(&ctx.config.workspace_root, relative)?;

        let read_dir = std::fs::read_dir(&path)
            .map_err(|e| FlyError::NotFound(format!("cannot list '{relative}': {e}")))?;

        let mut items = Vec::new();
        for entry in read_dir.flatten() {
            let metadata = entry
                .metadata()
                .map_err(|e| FlyError::Internal(format!("cannot stat directory entry: {e}")))?;
            let modified = metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs());
            items.push(serde_json::json!({
                "name": entry.file_name().to_string_lossy(),
                "kind": if metadata.is_dir() { "dir" } else { "file" },
                "size": if metadata.is_dir() { Value::Null } else { Value::from(metadata.len()) },
                "modified": modified,
            }));
        }
        let total = items.len();
        Ok(serde_json::json!({ "items": items, "total": total, "page": 1, "pageSize": total }))
    }

    async fn read(&self, ctx: &Arc<AppContext>, uri: &str, params: Value) -> Result<Value, FlyError> {
        let relative = uri.strip_prefix("workspace://").unwrap_or("");
        let path = sandbox::resolve(&ctx.config.workspace_root, relative)?;
        let bytes = std::fs::read(&path)
            .map_err(|e| FlyError::NotFound(format!("cannot read '{relative}': {e}")))?;
        slice_content(&bytes, &params, ctx.config.max_resource_bytes)
    }
}

/// `manifest://` is an alias for `pubspec.yaml` at the workspace root, read
/// through the same sandbox rules as `workspace://`.
pub struct ManifestResource;

#[async_trait]
impl ResourceStrategy for ManifestResource {
    fn uri_prefix(&self) -> &str {
        "manifest://"
    }

    fn description(&self) -> &str {
        "The project's pubspec.yaml manifest."
    }

    async fn list(&self, ctx: &Arc<AppContext>, _params: Value) -> Result<Value, FlyError> {
        let path = sandbox::resolve(&ctx.config.workspace_root, "pubspec.yaml")?;
        let exists = path.is_file();
        Ok(serde_json::json!({
            "items": if exists { vec![serde_json::json!({"name": "pubspec.yaml", "kind": "file"})] } else { vec![] },
            "total": if exists { 1 } else { 0 },
            "page": 1,
            "pageSize": 1,
        }))
    }

    async fn read(&self, ctx: &Arc<AppContext>, _uri: &str, params: Value) -> Result<Value, FlyError> {
        let path = sandbox::resolve(&ctx.config.workspace_root, "pubspec.yaml")?;
        let bytes = std::fs::read(&path)
            .map_err(|e| FlyError::NotFound(format!("cannot read pubspec.yaml: {e}")))?;
        slice_content(&bytes, &params, ctx.config.max_resource_bytes)
    }
}

/// Which stream a log chunk belongs to — `flutter run` output vs. a build's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogStream {
    Run,
    Build,
}

/// A bounded byte ring for one process's output on one stream. Oldest bytes
/// are evicted first, regardless of the chunk boundaries they arrived in, so
/// a read always returns an exact suffix of the full concatenated output.
pub struct LogRing {
    bytes: Mutex<VecDeque<u8>>,
    cap_bytes: usize,
}

impl LogRing {
    pub fn new(cap_bytes: usize) -> Self {
        Self { bytes: Mutex::new(VecDeque::new()), cap_bytes }
    }

    pub fn append(&self, chunk: &[u8]) {
        let mut buf = self.bytes.lock().unwrap();
        buf.extend(chunk.iter().copied());
        while buf.len() > self.cap_bytes {
            buf.pop_front();
        }
    }

    pub fn total_bytes(&self) -> usize {
        self.bytes.lock().unwrap().len()
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.lock().unwrap().iter().copied().collect()
    }
}

/// Owns every `LogRing` for the process lifetime, keyed by stream and
/// process id. Shared between the `flutter.*` tool handlers (writers) and the
/// `logs://` resource strategies (readers) via `AppContext`.
pub struct LogRegistry {
    cap_bytes: usize,
    run: DashMap<String, Arc<LogRing>>,
    build: DashMap<String, Arc<LogRing>>,
}

impl LogRegistry {
    pub fn new(cap_bytes: usize) -> Self {
        Self { cap_bytes, run: DashMap::new(), build: DashMap::new() }
    }

    fn map(&self, stream: LogStream) -> &DashMap<String, Arc<LogRing>> {
        match stream {
            LogStream::Run => &self.run,
            LogStream::Build => &self.build,
        }
    }

    pub fn ring(&self, stream: LogStream, pid: &str) -> Arc<LogRing> {
        self.map(stream)
            .entry(pid.to_string())
            .or_insert_with(|| Arc::new(LogRing::new(self.cap_bytes)))
            .clone()
    }

    pub fn append(&self, stream: LogStream, pid: &str, chunk: &[u8]) {
        self.ring(stream, pid).append(chunk);
    }

    fn list(&self, stream: LogStream) -> Vec<Value> {
        self.map(stream)
            .iter()
            .map(|entry| serde_json::json!({ "processId": entry.key(), "bytes": entry.value().total_bytes() }))
            .collect()
    }
}

struct LogsResource {
    stream: LogStream,
    prefix: &'static str,
    description: &'static str,
}

#[async_trait]
impl ResourceStrategy for LogsResource {
    fn uri_prefix(&self) -> &str {
        self.prefix
    }

    fn description(&self) -> &str {
        self.description
    }

    async fn list(&self, ctx: &Arc<AppContext>, _params: Value) -> Result<Value, FlyError> {
        let items = ctx.logs.list(self.stream);
        let total = items.len();
        Ok(serde_json::json!({ "items": items, "total": total, "page": 1, "pageSize": total }))
    }

    async fn read(&self, ctx: &Arc<AppContext>, uri: &str, params: Value) -> Result<Value, FlyError> {
        let pid = uri
            .strip_prefix(self.prefix)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| FlyError::invalid_params(format!("missing process id in uri '{uri}'")))?;
        let ring = ctx.logs.ring(self.stream, pid);
        let bytes = ring.snapshot();
        slice_content(&bytes, &params, ctx.config.max_resource_bytes)
    }
}

/// Build the resource strategy table for one app context.
pub fn catalogue(_ctx: &Arc<AppContext>) -> Vec<Box<dyn ResourceStrategy>> {
    vec![
        Box::new(WorkspaceResource),
        Box::new(ManifestResource),
        Box::new(LogsResource {
            stream: LogStream::Run,
            prefix: "logs://run/",
            description: "Captured stdout/stderr of `flutter run` invocations.",
        }),
        Box::new(LogsResource {
            stream: LogStream::Build,
            prefix: "logs://build/",
            description: "Captured stdout/stderr of `flutter build` invocations.",
        }),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx_with(workspace_root: std::path::PathBuf) -> Arc<AppContext> {
        let mut config = crate::FlydConfig::load(workspace_root.clone()).unwrap();
        config.workspace_root = workspace_root;
        let config = Arc::new(config);
        Arc::new(AppContext {
            templates: Arc::new(crate::templates::registry::TemplateRegistry::new_for_tests(config.clone())),
            health: Arc::new(crate::health::DependencyHealthClient::new_for_tests(config.clone())),
            logs: Arc::new(LogRegistry::new(config.log_ring_cap_bytes)),
            config,
            started_at: std::time::Instant::now(),
        })
    }

    #[tokio::test]
    async fn workspace_read_returns_file_contents() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        let ctx = ctx_with(dir.path().to_path_buf());

        let result = WorkspaceResource
            .read(&ctx, "workspace://a.txt", serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(result["content"], "hello");
    }

    #[tokio::test]
    async fn workspace_read_rejects_escape() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx_with(dir.path().to_path_buf());
        let result = WorkspaceResource
            .read(&ctx, "workspace://../../../etc/passwd", serde_json::json!({}))
            .await;
        assert!(matches!(result, Err(FlyError::PermissionDenied(_))));
    }

    #[tokio::test]
    async fn oversized_unsliced_read_is_too_large() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("big.txt"), vec![b'x'; 100]).unwrap();
        let mut config = crate::FlydConfig::load(dir.path().to_path_buf()).unwrap();
        config.workspace_root = dir.path().to_path_buf();
        config.max_resource_bytes = 10;
        let config = Arc::new(config);
        let ctx = Arc::new(AppContext {
            templates: Arc::new(crate::templates::registry::TemplateRegistry::new_for_tests(config.clone())),
            health: Arc::new(crate::health::DependencyHealthClient::new_for_tests(config.clone())),
            logs: Arc::new(LogRegistry::new(config.log_ring_cap_bytes)),
            config,
            started_at: std::time::Instant::now(),
        });

        let result = WorkspaceResource.read(&ctx, "workspace://big.txt", serde_json::json!({})).await;
        assert!(matches!(result, Err(FlyError::TooLarge { .. })));
    }

    #[tokio::test]
    async fn manifest_reads_pubspec_yaml() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("pubspec.yaml"), "name: demo\n").unwrap();
        let ctx = ctx_with(dir.path().to_path_buf());
        let result = ManifestResource.read(&ctx, "manifest://", serde_json::json!({})).await.unwrap();
        assert_eq!(result["content"], "name: demo\n");
    }

    #[test]
    fn log_ring_byte_cap_keeps_exact_tail() {
        let ring = LogRing::new(1024);
        let chunk = vec![b'a'; 500];
        for _ in 0..5 {
            ring.append(&chunk);
        }
        let snapshot = ring.snapshot();
        assert_eq!(snapshot.len(), 1024);
        let full: Vec<u8> = std::iter::repeat(b'a').take(2500).collect();
        assert_eq!(snapshot, full[full.len() - 1024..]);
    }

    #[tokio::test]
    async fn logs_resource_lists_known_process_ids() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx_with(dir.path().to_path_buf());
        ctx.logs.append(LogStream::Run, "123", b"hello\n");

        let resource = LogsResource { stream: LogStream::Run, prefix: "logs://run/", description: "x" };
        let listed = resource.list(&ctx, serde_json::json!({})).await.unwrap();
        assert_eq!(listed["total"], 1);
    }

    #[tokio::test]
    async fn logs_resource_read_returns_ring_contents() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx_with(dir.path().to_path_buf());
        ctx.logs.append(LogStream::Build, "42", b"building...\n");

        let resource = LogsResource { stream: LogStream::Build, prefix: "logs://build/", description: "x" };
        let result = resource.read(&ctx, "logs://build/42", serde_json::json!({})).await.unwrap();
        assert_eq!(result["content"], "building...\n");
    }
}
