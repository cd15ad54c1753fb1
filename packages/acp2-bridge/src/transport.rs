use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use acp2_error::{BridgeError, Result};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStderr, ChildStdin, ChildStdout};
use tokio::sync::{broadcast, oneshot, Mutex};
use tracing::{debug, error, info, warn};

const NOTIFICATION_CAPACITY: usize = 512;

type Pending = Arc<Mutex<HashMap<i64, oneshot::Sender<Value>>>>;

/// Framed JSON-RPC 2.0 duplex over one child's stdio. One JSON object per
/// newline-terminated line. Requests correlate by a monotonically increasing
/// integer id; everything else fans out to subscribers in arrival order.
#[derive(Debug)]
pub struct Transport {
    label: String,
    stdin: Arc<Mutex<Option<ChildStdin>>>,
    pending: Pending,
    notifications: broadcast::Sender<Value>,
    next_id: AtomicI64,
    closed: Arc<AtomicBool>,
}

impl Transport {
    pub fn new(label: String, stdin: ChildStdin, stdout: ChildStdout, stderr: ChildStderr) -> Self {
        let (notifications, _rx) = broadcast::channel(NOTIFICATION_CAPACITY);
        let transport = Self {
            label,
            stdin: Arc::new(Mutex::new(Some(stdin))),
            pending: Arc::new(Mutex::new(HashMap::new())),
            notifications,
            next_id: AtomicI64::new(0),
            closed: Arc::new(AtomicBool::new(false)),
        };
        transport.spawn_reader(stdout);
        transport.spawn_stderr_drain(stderr);
        transport
    }

    /// Send a request and wait for the matching response. The agent's error
    /// payload, if any, surfaces with its JSON-RPC code and message intact.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BridgeError::TransportClosed);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let payload = json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params});
        if let Err(err) = self.write(&payload).await {
            self.pending.lock().await.remove(&id);
            return Err(err);
        }
        debug!(agent = %self.label, method, id, "request sent");

        // The reader may have shut down between the closed check and the
        // insert; its pending sweep can miss this entry, so re-check.
        if self.closed.load(Ordering::SeqCst) {
            self.pending.lock().await.remove(&id);
            return Err(BridgeError::TransportClosed);
        }

        let response = rx.await.map_err(|_| BridgeError::TransportClosed)?;
        if let Some(error) = response.get("error") {
            let code = error.get("code").and_then(Value::as_i64).unwrap_or(0);
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown agent error")
                .to_string();
            return Err(BridgeError::AgentError { code, message });
        }
        Ok(response.get("result").cloned().unwrap_or(Value::Null))
    }

    /// Fire-and-forget notification (no id, no response).
    pub async fn notify(&self, method: &str, params: Value) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BridgeError::TransportClosed);
        }
        let payload = json!({"jsonrpc": "2.0", "method": method, "params": params});
        self.write(&payload).await
    }

    /// Subscribe to server-initiated messages (anything without a pending
    /// request id), delivered in arrival order.
    pub fn subscribe(&self) -> broadcast::Receiver<Value> {
        self.notifications.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close stdin; the reader drains stdout to EOF and fails outstanding
    /// requests with `transport-closed`.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(mut stdin) = self.stdin.lock().await.take() {
            let _ = stdin.shutdown().await;
        }
        self.pending.lock().await.clear();
    }

    async fn write(&self, payload: &Value) -> Result<()> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or(BridgeError::TransportClosed)?;
        let bytes =
            serde_json::to_vec(payload).map_err(|err| BridgeError::internal(err.to_string()))?;
        let write = async {
            stdin.write_all(&bytes).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await
        };
        write.await.map_err(|err| {
            warn!(agent = %self.label, error = %err, "stdin write failed");
            BridgeError::TransportClosed
        })
    }

    fn spawn_reader(&self, stdout: ChildStdout) {
        let label = self.label.clone();
        let pending = self.pending.clone();
        let notifications = self.notifications.clone();
        let closed = self.closed.clone();

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                let line = match lines.next_line().await {
                    Ok(Some(line)) => line,
                    Ok(None) => {
                        info!(agent = %label, "agent stdout reached EOF");
                        break;
                    }
                    Err(err) => {
                        warn!(agent = %label, error = %err, "agent stdout read error");
                        break;
                    }
                };
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }

                let payload: Value = match serde_json::from_str(trimmed) {
                    Ok(payload) => payload,
                    Err(err) => {
                        error!(
                            agent = %label,
                            error = %err,
                            raw = %truncate(trimmed, 200),
                            "framing error: line is not JSON, closing transport"
                        );
                        break;
                    }
                };
                if payload.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
                    error!(
                        agent = %label,
                        raw = %truncate(trimmed, 200),
                        "framing error: missing jsonrpc 2.0 envelope, closing transport"
                    );
                    break;
                }

                let is_response = payload.get("method").is_none();
                if is_response {
                    if let Some(id) = payload.get("id").and_then(Value::as_i64) {
                        if let Some(tx) = pending.lock().await.remove(&id) {
                            let _ = tx.send(payload);
                            continue;
                        }
                        warn!(agent = %label, id, "response without a pending request");
                    }
                }

                // Everything that did not complete a pending request fans
                // out to subscribers in arrival order.
                let _ = notifications.send(payload);
            }

            closed.store(true, Ordering::SeqCst);
            // Outstanding requests fail with TransportClosed when their
            // oneshot senders drop here.
            pending.lock().await.clear();
        });
    }

    fn spawn_stderr_drain(&self, stderr: ChildStderr) {
        let label = self.label.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(agent = %label, "agent stderr: {line}");
            }
        });
    }
}

fn truncate(raw: &str, max: usize) -> String {
    if raw.len() > max {
        let mut end = max;
        while !raw.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &raw[..end])
    } else {
        raw.to_string()
    }
}
