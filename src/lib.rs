//! `flyd` — the Fly MCP Host.
//!
//! This crate implements the two subsystems that matter: a JSON-RPC 2.0
//! server speaking the Model Context Protocol over stdio (`mcp`), and the
//! semver-aware template registry and cache it leans on (`templates`), plus
//! the pub.dev dependency-health lookups templates are judged by (`health`).
//!
//! Everything a real `fly` CLI would also ship — argument parsing, human/JSON
//! output formatting, the scaffolding menu — lives outside this crate and
//! talks to it only through the interfaces in `mcp` and `templates`.

pub mod config;
pub mod errors;
pub mod health;
pub mod logging;
pub mod mcp;
pub mod retry;
pub mod sandbox;
pub mod templates;

pub use config::FlydConfig;
pub use errors::FlyError;

use std::sync::Arc;

use templates::registry::TemplateRegistry;

/// Shared application state handed to every MCP handler.
///
/// Constructed once at startup by the `flyd` binary and cloned (cheaply —
/// everything inside is an `Arc`) into each in-flight request.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<FlydConfig>,
    pub templates: Arc<TemplateRegistry>,
    pub health: Arc<health::DependencyHealthClient>,
    pub logs: Arc<mcp::resources::LogRegistry>,
    pub started_at: std::time::Instant,
}
