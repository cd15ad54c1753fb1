use std::collections::HashMap;
use std::sync::Arc;

use acp2_error::{BridgeError, ErrorDetail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::events::{Message, Role, UpdateEvent};
use crate::process::{AgentProcess, PromptOutcome};
use crate::registry::AgentRegistry;
use crate::session::SessionManager;
use crate::store::SessionStore;

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Sync,
    Stream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    Created,
    InProgress,
    Completed,
    Cancelled,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

/// One north-initiated run; maps to exactly one south `session/prompt`.
#[derive(Debug, Clone, Serialize)]
pub struct Run {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub agent: String,
    pub mode: RunMode,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunRequest {
    pub agent: String,
    #[serde(default)]
    pub session_id: Option<String>,
    pub mode: RunMode,
    pub input: Message,
}

struct RunState {
    run: Run,
    cancel: CancellationToken,
}

enum Outcome {
    Completed(PromptOutcome),
    Cancelled,
    Failed(BridgeError),
}

/// Orchestrates runs: registers them, executes the translation state machine
/// on a worker task, publishes UpdateEvents, persists the transcript, and
/// exposes cancellation.
pub struct RunManager {
    registry: Arc<AgentRegistry>,
    store: Arc<SessionStore>,
    sessions: Arc<SessionManager>,
    runs: std::sync::RwLock<HashMap<String, RunState>>,
}

impl RunManager {
    pub fn new(
        registry: Arc<AgentRegistry>,
        store: Arc<SessionStore>,
        sessions: Arc<SessionManager>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            store,
            sessions,
            runs: std::sync::RwLock::new(HashMap::new()),
        })
    }

    /// Register a run and start its worker. Returns the run id plus the
    /// event stream; the terminal event closes the channel.
    pub fn start(
        self: &Arc<Self>,
        request: RunRequest,
    ) -> Result<(String, mpsc::Receiver<UpdateEvent>)> {
        // Fail fast on requests no worker could serve.
        self.registry.get(&request.agent)?;
        if request.input.content.is_empty() {
            return Err(BridgeError::Config {
                message: "input content may not be empty".to_string(),
            });
        }

        let run_id = Uuid::new_v4().to_string();
        let run = Run {
            id: run_id.clone(),
            session_id: request.session_id.clone(),
            agent: request.agent.clone(),
            mode: request.mode,
            status: RunStatus::Created,
            output: None,
            stop_reason: None,
            error: None,
            created_at: Utc::now(),
            finished_at: None,
        };
        let cancel = CancellationToken::new();
        self.runs.write().expect("run table lock poisoned").insert(
            run_id.clone(),
            RunState {
                run,
                cancel: cancel.clone(),
            },
        );

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let manager = self.clone();
        let worker_id = run_id.clone();
        tokio::spawn(async move {
            manager.execute(worker_id, request, cancel, tx).await;
        });

        Ok((run_id, rx))
    }

    pub fn get(&self, run_id: &str) -> Option<Run> {
        self.runs
            .read()
            .expect("run table lock poisoned")
            .get(run_id)
            .map(|state| state.run.clone())
    }

    /// Request cancellation. Legal only while the run is in progress.
    pub fn cancel(&self, run_id: &str) -> Result<Run> {
        let runs = self.runs.read().expect("run table lock poisoned");
        let state = runs
            .get(run_id)
            .ok_or_else(|| BridgeError::not_found(format!("run '{run_id}'")))?;
        if state.run.status != RunStatus::InProgress {
            return Err(BridgeError::conflict(format!(
                "run '{run_id}' is not in progress"
            )));
        }
        state.cancel.cancel();
        info!(run_id, "cancellation requested");
        Ok(state.run.clone())
    }

    async fn execute(
        self: Arc<Self>,
        run_id: String,
        request: RunRequest,
        cancel: CancellationToken,
        tx: mpsc::Sender<UpdateEvent>,
    ) {
        self.set_status(&run_id, RunStatus::InProgress);

        let outcome = match &request.session_id {
            Some(session_id) => {
                self.drive_persistent(&run_id, session_id, &request, &cancel, &tx)
                    .await
            }
            None => self.drive_ephemeral(&run_id, &request, &cancel, &tx).await,
        };

        let terminal = match outcome {
            Outcome::Completed(prompt) => {
                let event = UpdateEvent::Completed {
                    message: prompt.message.clone(),
                    stop_reason: prompt.stop_reason.clone(),
                };
                self.finish(&run_id, RunStatus::Completed, |run| {
                    run.output = Some(prompt.message);
                    run.stop_reason = prompt.stop_reason;
                });
                event
            }
            Outcome::Cancelled => {
                self.finish(&run_id, RunStatus::Cancelled, |_| {});
                UpdateEvent::Cancelled
            }
            Outcome::Failed(err) => {
                warn!(run_id, error = %err, kind = err.kind().as_str(), "run failed");
                let detail = ErrorDetail::new(err.kind(), err.to_string());
                self.finish(&run_id, RunStatus::Failed, |run| {
                    run.error = Some(detail.clone());
                });
                UpdateEvent::Failed(detail)
            }
        };
        let _ = tx.send(terminal).await;
        // Dropping tx closes the stream after the terminal event.
    }

    async fn drive_persistent(
        &self,
        run_id: &str,
        session_id: &str,
        request: &RunRequest,
        cancel: &CancellationToken,
        tx: &mpsc::Sender<UpdateEvent>,
    ) -> Outcome {
        // Serialise with other runs on this session before touching state.
        let _gate = self.sessions.begin_run(session_id).await;

        match self.prepare_session(session_id, &request.agent) {
            Ok(()) => {}
            Err(err) => return Outcome::Failed(err),
        }

        let (process, south_sid) = match self.sessions.acquire(session_id, &request.agent).await {
            Ok(bound) => bound,
            Err(err) => return Outcome::Failed(err),
        };

        let south_blocks = json!(request.input.content);
        if let Err(err) = self.store.append_message(
            session_id,
            Role::User,
            &request.input.content,
            Some(&south_blocks),
        ) {
            return Outcome::Failed(err);
        }

        let outcome = self
            .prompt_with_cancel(run_id, &process, &south_sid, request, cancel, tx)
            .await;

        if let Outcome::Completed(prompt) = &outcome {
            if let Err(err) =
                self.store
                    .append_message(session_id, Role::Agent, &prompt.message.content, None)
            {
                self.sessions.release(session_id);
                return Outcome::Failed(err);
            }
        }
        self.sessions.release(session_id);
        outcome
    }

    async fn drive_ephemeral(
        &self,
        run_id: &str,
        request: &RunRequest,
        cancel: &CancellationToken,
        tx: &mpsc::Sender<UpdateEvent>,
    ) -> Outcome {
        let (process, south_sid) = match self.sessions.ephemeral(&request.agent).await {
            Ok(bound) => bound,
            Err(err) => return Outcome::Failed(err),
        };
        let outcome = self
            .prompt_with_cancel(run_id, &process, &south_sid, request, cancel, tx)
            .await;
        process.terminate().await;
        outcome
    }

    /// Ensure the session row exists and can accept a run.
    fn prepare_session(&self, session_id: &str, agent: &str) -> Result<()> {
        match self.store.get_session(session_id)? {
            None => {
                self.store.create_session(session_id, agent)?;
                Ok(())
            }
            Some(row) if row.status == crate::store::SessionStatus::Terminated => Err(
                BridgeError::conflict(format!("session '{session_id}' is terminated")),
            ),
            Some(row) if row.agent_name != agent => Err(BridgeError::conflict(format!(
                "session '{session_id}' belongs to agent '{}'",
                row.agent_name
            ))),
            Some(_) => Ok(()),
        }
    }

    /// Drive the prompt while listening for a cancel request. `session/cancel`
    /// is sent at most once; the worker always waits for the prompt response
    /// before giving the process slot back.
    async fn prompt_with_cancel(
        &self,
        run_id: &str,
        process: &Arc<AgentProcess>,
        south_sid: &str,
        request: &RunRequest,
        cancel: &CancellationToken,
        tx: &mpsc::Sender<UpdateEvent>,
    ) -> Outcome {
        let blocks: Vec<Value> = request.input.content.clone();
        let prompt = process.prompt(south_sid, &blocks, tx.clone());
        tokio::pin!(prompt);

        let mut cancel_sent = false;
        let result = loop {
            tokio::select! {
                result = &mut prompt => break result,
                _ = cancel.cancelled(), if !cancel_sent => {
                    cancel_sent = true;
                    info!(run_id, "forwarding session/cancel to agent");
                    if let Err(err) = process.cancel(south_sid).await {
                        warn!(run_id, error = %err, "failed to send session/cancel");
                    }
                }
            }
        };

        match result {
            Ok(outcome) if outcome.cancelled => Outcome::Cancelled,
            Ok(outcome) => Outcome::Completed(outcome),
            Err(err) if cancel_sent && matches!(err, BridgeError::AgentError { code: 499, .. }) => {
                Outcome::Cancelled
            }
            Err(err) => Outcome::Failed(err),
        }
    }

    fn set_status(&self, run_id: &str, status: RunStatus) {
        if let Some(state) = self
            .runs
            .write()
            .expect("run table lock poisoned")
            .get_mut(run_id)
        {
            state.run.status = status;
        }
    }

    fn finish(&self, run_id: &str, status: RunStatus, apply: impl FnOnce(&mut Run)) {
        if let Some(state) = self
            .runs
            .write()
            .expect("run table lock poisoned")
            .get_mut(run_id)
        {
            state.run.status = status;
            state.run.finished_at = Some(Utc::now());
            apply(&mut state.run);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_status_serializes_with_spec_spelling() {
        assert_eq!(
            serde_json::to_value(RunStatus::InProgress).unwrap(),
            json!("in-progress")
        );
        assert_eq!(
            serde_json::to_value(RunStatus::Completed).unwrap(),
            json!("completed")
        );
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(!RunStatus::InProgress.is_terminal());
    }

    #[test]
    fn run_request_decodes_minimal_payload() {
        let request: RunRequest = serde_json::from_value(json!({
            "agent": "dummy",
            "mode": "sync",
            "input": {"role": "user", "content": [{"type": "text", "text": "hi"}]}
        }))
        .unwrap();
        assert_eq!(request.agent, "dummy");
        assert_eq!(request.mode, RunMode::Sync);
        assert!(request.session_id.is_none());
    }

    #[test]
    fn terminal_run_has_exactly_one_of_result_and_error() {
        let mut run = Run {
            id: "r".to_string(),
            session_id: None,
            agent: "a".to_string(),
            mode: RunMode::Sync,
            status: RunStatus::Completed,
            output: Some(Message::agent(vec![crate::events::text_block("ok")])),
            stop_reason: None,
            error: None,
            created_at: Utc::now(),
            finished_at: Some(Utc::now()),
        };
        assert!(run.output.is_some() ^ run.error.is_some());
        run.status = RunStatus::Failed;
        run.output = None;
        run.error = Some(ErrorDetail::new(acp2_error::ErrorKind::AgentExited, "boom"));
        assert!(run.output.is_some() ^ run.error.is_some());
    }
}
