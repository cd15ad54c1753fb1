use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use acp2_error::{BridgeError, Result};
use serde_json::{json, Value};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::events::{block_text, parse_session_update, text_block, Message, UpdateEvent};
use crate::registry::{AgentRegistry, AgentSpec};
use crate::transport::Transport;

/// Environment variable the resolved api key is exported under.
const API_KEY_ENV: &str = "OPENAI_API_KEY";

/// Outcome of a completed `session/prompt` exchange.
#[derive(Debug)]
pub struct PromptOutcome {
    pub message: Message,
    pub stop_reason: Option<String>,
    pub cancelled: bool,
}

/// Running aggregation state for one in-flight prompt.
#[derive(Debug, Default)]
struct PromptBuffer {
    text: String,
    extra_blocks: Vec<Value>,
    cancelled: bool,
}

impl PromptBuffer {
    /// The final aggregated agent message: the concatenated chunk text
    /// first, then any non-text blocks in arrival order.
    fn into_message(self) -> Message {
        let mut content = vec![text_block(self.text)];
        content.extend(self.extra_blocks);
        Message::agent(content)
    }
}

/// One live agent subprocess plus its transport. At most one prompt may be
/// in flight; the handshake has already run by the time `spawn` returns.
#[derive(Debug)]
pub struct AgentProcess {
    agent_name: String,
    transport: Transport,
    child: Mutex<Child>,
    prompt_gate: Mutex<()>,
    terminated: AtomicBool,
    auth_methods: Vec<String>,
    capabilities: Value,
    grace: Duration,
}

impl AgentProcess {
    /// Spawn the agent and run the `initialize`/`authenticate` handshake.
    pub async fn spawn(spec: &AgentSpec, grace: Duration) -> Result<Arc<Self>> {
        let api_key = AgentRegistry::resolve_api_key(spec);

        let mut command = Command::new(&spec.command[0]);
        command
            .args(&spec.command[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(key) = &api_key {
            command.env(API_KEY_ENV, key);
        }

        info!(agent = %spec.name, command = ?spec.command, "spawning agent process");
        let mut child = command.spawn().map_err(|err| BridgeError::SpawnFailed {
            command: spec.command.join(" "),
            source: err,
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BridgeError::internal("agent stdin pipe unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BridgeError::internal("agent stdout pipe unavailable"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| BridgeError::internal("agent stderr pipe unavailable"))?;
        let transport = Transport::new(spec.name.clone(), stdin, stdout, stderr);

        let mut process = Self {
            agent_name: spec.name.clone(),
            transport,
            child: Mutex::new(child),
            prompt_gate: Mutex::new(()),
            terminated: AtomicBool::new(false),
            auth_methods: Vec::new(),
            capabilities: Value::Null,
            grace,
        };

        if let Err(err) = process.handshake().await {
            process.terminate().await;
            return Err(err);
        }
        Ok(Arc::new(process))
    }

    async fn handshake(&mut self) -> Result<()> {
        let result = self
            .transport
            .request(
                "initialize",
                json!({
                    "protocolVersion": 1,
                    "clientCapabilities": {
                        "fs": {"readTextFile": true, "writeTextFile": true},
                        "terminal": true,
                    },
                }),
            )
            .await?;

        self.auth_methods = result
            .get("authMethods")
            .and_then(Value::as_array)
            .map(|methods| {
                methods
                    .iter()
                    .filter_map(|method| {
                        method
                            .get("id")
                            .and_then(Value::as_str)
                            .or_else(|| method.as_str())
                            .map(str::to_string)
                    })
                    .collect()
            })
            .unwrap_or_default();
        self.capabilities = result
            .get("agentCapabilities")
            .cloned()
            .unwrap_or(Value::Null);

        if !self.auth_methods.is_empty() {
            let method_id = self
                .auth_methods
                .iter()
                .find(|id| id.as_str() == "apikey")
                .or_else(|| self.auth_methods.first())
                .cloned()
                .expect("non-empty auth methods");
            debug!(agent = %self.agent_name, method = %method_id, "authenticating");
            self.transport
                .request("authenticate", json!({"methodId": method_id}))
                .await
                .map_err(|err| BridgeError::Auth {
                    message: format!("agent rejected authentication: {err}"),
                })?;
        }
        Ok(())
    }

    pub fn agent_name(&self) -> &str {
        &self.agent_name
    }

    pub fn capabilities(&self) -> &Value {
        &self.capabilities
    }

    pub fn is_alive(&self) -> bool {
        !self.terminated.load(Ordering::SeqCst) && !self.transport.is_closed()
    }

    /// Open a fresh south session.
    pub async fn open_new(&self, cwd: &Path) -> Result<String> {
        let result = self
            .transport
            .request(
                "session/new",
                json!({"cwd": cwd.to_string_lossy(), "mcpServers": []}),
            )
            .await?;
        result
            .get("sessionId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| BridgeError::internal("session/new response missing sessionId"))
    }

    /// Ask the agent to reload an existing south session. `Ok(false)` means
    /// the agent does not support or cannot find the session and the caller
    /// should fall back to `open_new`.
    pub async fn resume(&self, south_session_id: &str) -> Result<bool> {
        match self
            .transport
            .request("session/load", json!({"sessionId": south_session_id}))
            .await
        {
            Ok(_) => Ok(true),
            Err(BridgeError::AgentError { code: -32601, .. }) => Ok(false),
            Err(BridgeError::AgentError { message, .. })
                if message.to_ascii_lowercase().contains("not found") =>
            {
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    /// Send `session/prompt` and re-emit the agent's `session/update`
    /// notifications for this session as [`UpdateEvent`]s on `events`.
    /// Chunk texts aggregate, in agent order, into the final message.
    pub async fn prompt(
        &self,
        south_session_id: &str,
        blocks: &[Value],
        events: mpsc::Sender<UpdateEvent>,
    ) -> Result<PromptOutcome> {
        let _guard = self.prompt_gate.try_lock().map_err(|_| BridgeError::Busy)?;

        // Subscribe before the request goes out so no notification is lost.
        let mut notifications = self.transport.subscribe();
        let request = self.transport.request(
            "session/prompt",
            json!({"sessionId": south_session_id, "prompt": blocks}),
        );
        tokio::pin!(request);

        let mut buffer = PromptBuffer::default();

        let response = loop {
            tokio::select! {
                response = &mut request => break response,
                notification = notifications.recv() => {
                    if let Ok(payload) = notification {
                        self.collect(payload, south_session_id, &mut buffer, &events).await;
                    }
                }
            }
        };
        // The reader delivers notifications before the response that follows
        // them; anything still queued on the channel belongs to this prompt.
        while let Ok(payload) = notifications.try_recv() {
            self.collect(payload, south_session_id, &mut buffer, &events).await;
        }

        match response {
            Ok(result) => {
                let stop_reason = result
                    .get("stopReason")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                if stop_reason.as_deref() == Some("cancelled") {
                    buffer.cancelled = true;
                }
                let cancelled = buffer.cancelled;
                Ok(PromptOutcome {
                    message: buffer.into_message(),
                    stop_reason,
                    cancelled,
                })
            }
            // An agent that acknowledges cancellation by failing the request
            // (the 499 convention) still yields a cancelled outcome.
            Err(BridgeError::AgentError { code: 499, .. }) if buffer.cancelled => {
                Ok(PromptOutcome {
                    message: buffer.into_message(),
                    stop_reason: Some("cancelled".to_string()),
                    cancelled: true,
                })
            }
            Err(BridgeError::TransportClosed) => {
                let exit_code = self.try_exit_code().await;
                warn!(agent = %self.agent_name, ?exit_code, "agent exited during prompt");
                Err(BridgeError::AgentExited { exit_code })
            }
            Err(err) => Err(err),
        }
    }

    /// Fold one south notification into the prompt buffer, re-emitting it as
    /// an [`UpdateEvent`] when it belongs to this session.
    async fn collect(
        &self,
        payload: Value,
        south_session_id: &str,
        buffer: &mut PromptBuffer,
        events: &mpsc::Sender<UpdateEvent>,
    ) {
        let method = payload.get("method").and_then(Value::as_str);
        let params = payload.get("params").cloned().unwrap_or(Value::Null);
        let for_this_session = params
            .get("sessionId")
            .and_then(Value::as_str)
            .map_or(true, |sid| sid == south_session_id);
        if !for_this_session {
            return;
        }
        match method {
            Some("session/update") => {
                let Some(update) = params.get("update") else {
                    return;
                };
                if update.get("sessionUpdate").and_then(Value::as_str) == Some("session/cancelled")
                {
                    buffer.cancelled = true;
                    return;
                }
                let event = parse_session_update(update);
                if let UpdateEvent::AgentMessageChunk { text } = &event {
                    buffer.text.push_str(text);
                    // Non-text chunk payloads (images and friends) are kept
                    // for the final message.
                    if let Some(content) = update.get("content") {
                        if block_text(content).is_none() && content.is_object() {
                            buffer.extra_blocks.push(content.clone());
                        }
                    }
                }
                if events.send(event).await.is_err() {
                    debug!(agent = %self.agent_name, "event receiver dropped");
                }
            }
            Some("session/cancelled") => {
                buffer.cancelled = true;
            }
            _ => {}
        }
    }

    /// Best-effort cancellation notification for the in-flight prompt.
    pub async fn cancel(&self, south_session_id: &str) -> Result<()> {
        self.transport
            .notify("session/cancel", json!({"sessionId": south_session_id}))
            .await
    }

    /// Close stdin, wait for the child up to the grace period, then kill.
    /// Idempotent.
    pub async fn terminate(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(agent = %self.agent_name, "terminating agent process");
        self.transport.close().await;

        let mut child = self.child.lock().await;
        match tokio::time::timeout(self.grace, child.wait()).await {
            Ok(Ok(status)) => {
                info!(agent = %self.agent_name, ?status, "agent process exited");
            }
            Ok(Err(err)) => {
                warn!(agent = %self.agent_name, error = %err, "error waiting for agent process");
            }
            Err(_) => {
                warn!(agent = %self.agent_name, "grace period elapsed, killing agent process");
                if let Err(err) = child.kill().await {
                    warn!(agent = %self.agent_name, error = %err, "failed to kill agent process");
                }
            }
        }
    }

    async fn try_exit_code(&self) -> Option<i32> {
        let mut child = self.child.lock().await;
        match child.try_wait() {
            Ok(Some(status)) => status.code(),
            _ => None,
        }
    }
}
