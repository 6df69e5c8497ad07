//! JSON-RPC 2.0 wire types and stdio framing.
//!
//! Each message is a single JSON object followed by `\n`. A single writer
//! task owns stdout; handlers send responses and notifications down an
//! mpsc channel instead of writing directly, so output is never interleaved.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

/// An incoming JSON-RPC request or notification.
///
/// `id: None` means the envelope has no `id` field at all (a notification);
/// `id: Some(Value::Null)` preserves a client that actually sent `"id": null`.
#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    #[serde(default)]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
}

impl Request {
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// An outgoing JSON-RPC response.
#[derive(Debug, Clone, Serialize)]
pub struct Response {
    pub jsonrpc: &'static str,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl Response {
    pub fn ok(id: Value, result: Value) -> Self {
        Self { jsonrpc: "2.0", id, result: Some(result), error: None }
    }

    pub fn err(id: Value, error: RpcError) -> Self {
        Self { jsonrpc: "2.0", id, result: None, error: Some(error) }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), data: None }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn from_fly_error(err: &crate::FlyError) -> Self {
        let mut e = Self::new(err.code(), err.to_string());
        if let Some(data) = err.data() {
            e = e.with_data(data);
        }
        e
    }
}

/// An outgoing notification (no `id`, no reply expected).
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub jsonrpc: &'static str,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Notification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self { jsonrpc: "2.0", method: method.into(), params }
    }

    pub fn progress(token: &str, progress: u64, total: Option<u64>) -> Self {
        Self::new(
            "$/progress",
            Some(serde_json::json!({
                "progressToken": token,
                "progress": progress,
                "total": total,
            })),
        )
    }
}

/// Anything the writer task can put on the wire.
#[derive(Debug, Clone)]
pub enum OutgoingMessage {
    Response(Response),
    Notification(Notification),
}

impl OutgoingMessage {
    fn to_line(&self) -> String {
        let value = match self {
            OutgoingMessage::Response(r) => serde_json::to_string(r),
            OutgoingMessage::Notification(n) => serde_json::to_string(n),
        };
        value.unwrap_or_else(|e| {
            format!(r#"{{"jsonrpc":"2.0","id":null,"error":{{"code":-32603,"message":"serialize failure: {e}"}}}}"#)
        })
    }
}

/// Handle used by handlers/the dispatcher to push output without touching
/// stdout directly.
#[derive(Clone)]
pub struct OutputSink {
    tx: mpsc::UnboundedSender<OutgoingMessage>,
}

impl OutputSink {
    /// Build an `OutputSink` over a channel the caller owns directly —
    /// used by tests that want to inspect what a dispatcher sends without
    /// going through a real stdout writer task.
    pub fn from_channel(tx: mpsc::UnboundedSender<OutgoingMessage>) -> Self {
        Self { tx }
    }

    pub fn send_response(&self, response: Response) {
        let _ = self.tx.send(OutgoingMessage::Response(response));
    }

    pub fn send_notification(&self, notification: Notification) {
        let _ = self.tx.send(OutgoingMessage::Notification(notification));
    }
}

/// Spawns the single writer task and returns a handle to feed it.
///
/// The writer task owns `stdout` exclusively for the lifetime of the
/// process; it exits when every `OutputSink` clone has been dropped.
pub fn spawn_writer<W>(mut stdout: W) -> (OutputSink, tokio::task::JoinHandle<()>)
where
    W: AsyncWriteExt + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<OutgoingMessage>();
    let handle = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let mut line = msg.to_line();
            line.push('\n');
            if stdout.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            if stdout.flush().await.is_err() {
                break;
            }
        }
    });
    (OutputSink { tx }, handle)
}

/// One line read from the input stream: either a parsed request, or a parse
/// failure paired with the raw line (so the caller can emit `{id:null,
/// error:{code:-32700}}`).
pub enum Frame {
    Request(Request),
    ParseError(String),
    TooLarge(usize),
}

/// Reads newline-delimited JSON-RPC frames from `reader`, enforcing
/// `max_message_bytes` per line. Returns `Ok(None)` on clean EOF.
pub async fn read_frame<R>(
    reader: &mut BufReader<R>,
    max_message_bytes: usize,
) -> std::io::Result<Option<Frame>>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line = String::new();
    let bytes_read = reader.read_line(&mut line).await?;
    if bytes_read == 0 {
        return Ok(None);
    }

    let trimmed = line.trim_end_matches(['\n', '\r']);
    if trimmed.is_empty() {
        // Blank lines are not framable messages; caller loops again.
        return Ok(Some(Frame::ParseError(String::new())));
    }

    if trimmed.len() > max_message_bytes {
        return Ok(Some(Frame::TooLarge(trimmed.len())));
    }

    match serde_json::from_str::<Request>(trimmed) {
        Ok(req) => Ok(Some(Frame::Request(req))),
        Err(e) => Ok(Some(Frame::ParseError(e.to_string()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notification_has_no_id_field() {
        let json = serde_json::to_string(&Notification::new("$/progress", None)).unwrap();
        assert!(!json.contains("\"id\""));
    }

    #[test]
    fn response_omits_absent_error_and_result() {
        let ok = Response::ok(Value::from(1), serde_json::json!({"a": 1}));
        let s = serde_json::to_string(&ok).unwrap();
        assert!(!s.contains("\"error\""));

        let err = Response::err(Value::from(1), RpcError::new(-32601, "nope"));
        let s = serde_json::to_string(&err).unwrap();
        assert!(!s.contains("\"result\""));
    }

    #[tokio::test]
    async fn read_frame_parses_request_line() {
        let input = b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"ping\"}\n".to_vec();
        let mut reader = BufReader::new(std::io::Cursor::new(input));
        let frame = read_frame(&mut reader, 1024).await.unwrap().unwrap();
        match frame {
            Frame::Request(r) => assert_eq!(r.method, "ping"),
            _ => panic!("expected Request frame"),
        }
    }

    #[tokio::test]
    async fn read_frame_reports_parse_error_on_garbage() {
        let input = b"not json\n".to_vec();
        let mut reader = BufReader::new(std::io::Cursor::new(input));
        let frame = read_frame(&mut reader, 1024).await.unwrap().unwrap();
        assert!(matches!(frame, Frame::ParseError(_)));
    }

    #[tokio::test]
    async fn read_frame_rejects_oversized_line() {
        let input = format!("{}\n", "x".repeat(100)).into_bytes();
        let mut reader = BufReader::new(std::io::Cursor::new(input));
        let frame = read_frame(&mut reader, 10).await.unwrap().unwrap();
        assert!(matches!(frame, Frame::TooLarge(_)));
    }

    #[tokio::test]
    async fn read_frame_returns_none_on_eof() {
        let mut reader = BufReader::new(std::io::Cursor::new(Vec::new()));
        let frame = read_frame(&mut reader, 1024).await.unwrap();
        assert!(frame.is_none());
    }

    #[tokio::test]
    async fn notification_has_no_id_sent_over_writer() {
        let (written_tx, mut written_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (sink, handle) = spawn_writer(TestWriter(written_tx));
        sink.send_notification(Notification::progress("tok", 1, Some(10)));
        drop(sink);
        handle.await.unwrap();

        let mut text = String::new();
        while let Ok(chunk) = written_rx.try_recv() {
            text.push_str(&String::from_utf8(chunk).unwrap());
        }
        assert!(text.contains("\"progressToken\":\"tok\""));
    }

    // A minimal AsyncWrite sink that forwards written bytes to a channel,
    // so the test can assert on them after the writer task finishes.
    struct TestWriter(mpsc::UnboundedSender<Vec<u8>>);

    impl tokio::io::AsyncWrite for TestWriter {
        fn poll_write(
            mut self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            buf: &[u8],
        ) -> std::task::Poll<std::io::Result<usize>> {
            let _ = self.0.send(buf.to_vec());
            std::task::Poll::Ready(Ok(buf.len()))
        }
        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }
        fn poll_shutdown(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }
    }
}
