use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use flyd::health::DependencyHealthClient;
use flyd::mcp::resources::LogRegistry;
use flyd::templates::registry::{HttpTemplateSource, TemplateRegistry};
use flyd::{AppContext, FlydConfig};

#[derive(Parser)]
#[command(name = "flyd", about = "Fly MCP Host — JSON-RPC/stdio server for the Fly Flutter CLI", version)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Workspace root the server sandboxes file access to.
    ///
    /// Defaults to `FLY_OUTPUT_DIR`, then `$PWD`, then the current directory.
    #[arg(long)]
    workspace: Option<std::path::PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the MCP protocol over stdio (the default when no subcommand is given).
    Serve,
    /// Print the resolved configuration as JSON and exit, without serving.
    ///
    /// Useful for checking which `flyd.toml` and env overrides are in effect
    /// before wiring up a client.
    PrintConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let _logging_guard = flyd::logging::init();

    let workspace_root = args
        .workspace
        .unwrap_or_else(FlydConfig::resolve_workspace_root);
    let config = Arc::new(
        FlydConfig::load(workspace_root).context("failed to load flyd configuration")?,
    );

    match args.command {
        Some(Command::PrintConfig) => {
            println!("{}", serde_json::to_string_pretty(&to_json(&config))?);
            Ok(())
        }
        None | Some(Command::Serve) => serve(config).await,
    }
}

async fn serve(config: Arc<FlydConfig>) -> Result<()> {
    tracing::info!(
        workspace = %config.workspace_root.display(),
        offline = config.offline,
        "starting flyd"
    );

    let source = Arc::new(HttpTemplateSource::new(config.template_registry_url.clone()));
    let ctx = Arc::new(AppContext {
        templates: Arc::new(TemplateRegistry::new(config.clone(), source)),
        health: Arc::new(DependencyHealthClient::new(&config)),
        logs: Arc::new(LogRegistry::new(config.log_ring_cap_bytes)),
        config,
        started_at: std::time::Instant::now(),
    });

    flyd::mcp::serve(ctx, tokio::io::stdin(), tokio::io::stdout()).await
}

fn to_json(config: &FlydConfig) -> serde_json::Value {
    serde_json::json!({
        "workspaceRoot": config.workspace_root,
        "templatesRoot": config.templates_root,
        "cacheRoot": config.cache_root,
        "maxMessageBytes": config.max_message_bytes,
        "globalConcurrency": config.global_concurrency,
        "toolTimeoutSecs": config.tool_timeout.as_secs(),
        "admissionTimeoutSecs": config.admission_timeout.as_secs(),
        "templateRegistryUrl": config.template_registry_url,
        "pubDevBaseUrl": config.pub_dev_base_url,
        "cliVersion": config.cli_version.to_string(),
        "flutterVersion": config.flutter_version.to_string(),
        "dartVersion": config.dart_version.to_string(),
        "offline": config.offline,
    })
}
