//! `fly.template.list` and `fly.template.apply` — the template registry's
//! surface as MCP tools.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use crate::errors::FlyError;
use crate::mcp::registry::{CancelToken, ProgressSink, ToolDef, ToolHandler};
use crate::templates::registry::AcquireOptions;
use crate::AppContext;

struct ListHandler;

#[async_trait]
impl ToolHandler for ListHandler {
    async fn call(
        &self,
        ctx: &Arc<AppContext>,
        arguments: Value,
        _cancel: CancelToken,
        _progress: ProgressSink,
    ) -> Result<Value, FlyError> {
        let name = arguments
            .get("name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| FlyError::invalid_params("missing required field 'name'"))?;

        let versions = match arguments.get("range").and_then(|v| v.as_str()) {
            Some(range) => ctx.templates.versions_in_range(name, range)?,
            None => ctx.templates.discover_versions(name)?,
        };

        Ok(serde_json::json!({
            "versions": versions.iter().map(|v| v.to_string()).collect::<Vec<_>>(),
        }))
    }
}

pub fn list_tool_def() -> ToolDef {
    ToolDef {
        name: "fly.template.list",
        description: "List a template's discovered versions, newest first, optionally filtered by a semver range.",
        input_schema: serde_json::json!({
            "type": "object",
            "required": ["name"],
            "properties": {
                "name": { "type": "string" },
                "range": { "type": "string" }
            },
            "additionalProperties": false
        }),
        output_schema: serde_json::json!({
            "type": "object",
            "required": ["versions"],
            "properties": { "versions": { "type": "array" } }
        }),
        read_only: true,
        writes_to_disk: false,
        requires_confirmation: false,
        idempotent: true,
        timeout: Some(std::time::Duration::from_secs(10)),
        max_concurrency: None,
        handler: super::handler(ListHandler),
    }
}

struct ApplyHandler;

#[async_trait]
impl ToolHandler for ApplyHandler {
    async fn call(
        &self,
        ctx: &Arc<AppContext>,
        arguments: Value,
        _cancel: CancelToken,
        _progress: ProgressSink,
    ) -> Result<Value, FlyError> {
        let name = arguments
            .get("name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| FlyError::invalid_params("missing required field 'name'"))?;
        let version = match arguments.get("version").and_then(|v| v.as_str()) {
            Some(v) => Some(
                semver::Version::parse(v)
                    .map_err(|e| FlyError::invalid_params(format!("invalid version '{v}': {e}")))?,
            ),
            None => None,
        };
        let target_dir = arguments.get("targetDir").and_then(|v| v.as_str()).unwrap_or(".");

        let acquired = ctx
            .templates
            .acquire(name, AcquireOptions { version, force_refresh: false })
            .await?;

        let compatibility = ctx.templates.check_compatibility(&acquired.template);
        if !compatibility.ok {
            return Err(FlyError::TemplateIncompatible(compatibility.errors.join("; ")));
        }

        // Applying a template's content (rendering project files from it) is
        // out of scope here; what's recorded is the fact of application, so
        // a client can verify idempotence across repeated calls.
        let marker_name = format!(".fly_applied_{}.json", acquired.template.cache_key().replace(['@', '.'], "_"));
        let marker_relative = format!("{target_dir}/{marker_name}");
        let marker_path = crate::sandbox::resolve(&ctx.config.workspace_root, &marker_relative)?;
        if let Some(parent) = marker_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| FlyError::Internal(format!("cannot create '{target_dir}': {e}")))?;
        }
        let marker = serde_json::json!({
            "template": acquired.template.cache_key(),
            "stale": acquired.stale,
        });
        let contents = serde_json::to_vec_pretty(&marker)
            .map_err(|e| FlyError::Internal(format!("cannot serialize apply marker: {e}")))?;
        std::fs::write(&marker_path, contents)
            .map_err(|e| FlyError::Internal(format!("cannot write apply marker: {e}")))?;

        Ok(serde_json::json!({
            "template": acquired.template,
            "stale": acquired.stale,
            "compatibility": compatibility,
            "appliedTo": target_dir,
        }))
    }
}

pub fn apply_tool_def() -> ToolDef {
    ToolDef {
        name: "fly.template.apply",
        description: "Acquire a template (network or cache), gate it against the current toolchain, and record its application to a workspace target.",
        input_schema: serde_json::json!({
            "type": "object",
            "required": ["name"],
            "properties": {
                "name": { "type": "string" },
                "version": { "type": "string" },
                "targetDir": { "type": "string" }
            },
            "additionalProperties": false
        }),
        output_schema: serde_json::json!({
            "type": "object",
            "required": ["template", "stale", "compatibility", "appliedTo"],
            "properties": {
                "template": { "type": "object" },
                "stale": { "type": "boolean" },
                "compatibility": { "type": "object" },
                "appliedTo": { "type": "string" }
            }
        }),
        read_only: false,
        writes_to_disk: true,
        requires_confirmation: true,
        idempotent: true,
        timeout: Some(std::time::Duration::from_secs(60)),
        max_concurrency: None,
        handler: super::handler(ApplyHandler),
    }
}
