//! Model Context Protocol (MCP) server — JSON-RPC 2.0 over stdio.
//!
//! ## Protocol version
//! MCP 2024-11-05.
//!
//! ## Submodules
//!
//! | Module | Role |
//! |--------|------|
//! | `transport` | wire types, newline-delimited stdio framing, the single writer task |
//! | `dispatch` | admission control, concurrency, timeouts, cancellation, routing |
//! | `registry` | tool/resource/prompt strategy tables, `CancelToken`, `ProgressSink` |
//! | `schema` | JSON-Schema subset validator |
//! | `capabilities` | `initialize` capability negotiation |
//! | `tools` | `fly.*` / `flutter.*` tool implementations |
//! | `resources` | `workspace://`, `logs://`, `manifest://` resource strategies |
//! | `prompts` | prompt strategy catalogue |

pub mod capabilities;
pub mod dispatch;
pub mod prompts;
pub mod registry;
pub mod resources;
pub mod schema;
pub mod tools;
pub mod transport;

pub use dispatch::Dispatcher;
pub use registry::Registry;

use std::sync::Arc;

use crate::AppContext;

/// Build the frozen tool/resource/prompt registry for a given app context.
pub fn build_registry(ctx: &Arc<AppContext>) -> Registry {
    Registry::new(
        tools::catalogue(),
        resources::catalogue(ctx),
        prompts::catalogue(),
    )
}

/// Run the MCP server to completion over the given stdio handles. Exits
/// cleanly on EOF from `stdin` after draining in-flight handlers.
pub async fn serve(
    ctx: Arc<AppContext>,
    stdin: tokio::io::Stdin,
    stdout: tokio::io::Stdout,
) -> anyhow::Result<()> {
    use tokio::io::BufReader;
    use transport::{read_frame, spawn_writer, Frame, Response};

    let registry = Arc::new(build_registry(&ctx));
    let dispatcher = Arc::new(Dispatcher::new(ctx.clone(), registry));
    let (output, writer_handle) = spawn_writer(stdout);

    let mut reader = BufReader::new(stdin);
    let max_message_bytes = ctx.config.max_message_bytes;

    let mut in_flight = tokio::task::JoinSet::new();

    loop {
        match read_frame(&mut reader, max_message_bytes).await {
            Ok(Some(Frame::Request(request))) => {
                let dispatcher = dispatcher.clone();
                let output = output.clone();
                in_flight.spawn(async move {
                    dispatcher.handle(request, output).await;
                });
            }
            Ok(Some(Frame::ParseError(detail))) => {
                if detail.is_empty() {
                    continue; // blank line
                }
                tracing::warn!(error = %detail, "failed to parse incoming JSON-RPC line");
                output.send_response(Response::err(
                    serde_json::Value::Null,
                    transport::RpcError::new(crate::errors::CODE_PARSE_ERROR, "parse error"),
                ));
            }
            Ok(Some(Frame::TooLarge(size))) => {
                tracing::warn!(size, "incoming line exceeds max_message_bytes");
                output.send_response(Response::err(
                    serde_json::Value::Null,
                    transport::RpcError::new(crate::errors::CODE_TOO_LARGE, "message too large")
                        .with_data(serde_json::json!({ "actual": size })),
                ));
            }
            Ok(None) => break, // clean EOF — begin cooperative shutdown
            Err(e) => {
                tracing::error!(error = %e, "stdin read error — shutting down");
                break;
            }
        }
    }

    // Cooperative shutdown: give in-flight handlers a grace period, then
    // stop waiting on the stragglers (their permits/timeouts still bound
    // how long they run).
    let grace = std::time::Duration::from_secs(5);
    let _ = tokio::time::timeout(grace, async {
        while in_flight.join_next().await.is_some() {}
    })
    .await;

    drop(output);
    let _ = writer_handle.await;
    Ok(())
}
