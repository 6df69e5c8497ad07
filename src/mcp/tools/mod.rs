//! The `fly.*` / `flutter.*` tool catalogue.
//!
//! Each tool is a fixed `ToolDef` — metadata plus a handler — assembled once
//! in [`catalogue`] and served unchanged for the life of the process.

pub mod echo;
pub mod flutter;
pub mod template_tools;

use std::sync::Arc;

use super::registry::ToolDef;

pub fn catalogue() -> Vec<ToolDef> {
    vec![
        echo::tool_def(),
        template_tools::list_tool_def(),
        template_tools::apply_tool_def(),
        flutter::doctor_tool_def(),
        flutter::create_tool_def(),
        flutter::run_tool_def(),
        flutter::build_tool_def(),
    ]
}

/// Shared helper: wrap a handler value in the `Arc<dyn ToolHandler>` the
/// registry expects.
pub(super) fn handler(h: impl super::registry::ToolHandler + 'static) -> Arc<dyn super::registry::ToolHandler> {
    Arc::new(h)
}
