use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use acp2_error::{BridgeError, Result};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::process::AgentProcess;
use crate::registry::AgentRegistry;
use crate::store::{SessionPatch, SessionStatus, SessionStore};

struct Binding {
    process: Option<Arc<AgentProcess>>,
}

struct SessionEntry {
    /// Held only across spawn/handshake/rebind.
    binding: Mutex<Binding>,
    /// Serialises whole runs on one session; held for a run's duration.
    run_gate: Arc<Mutex<()>>,
    last_used: std::sync::Mutex<Instant>,
}

impl SessionEntry {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            binding: Mutex::new(Binding { process: None }),
            run_gate: Arc::new(Mutex::new(())),
            last_used: std::sync::Mutex::new(Instant::now()),
        })
    }

    fn touch(&self) {
        *self.last_used.lock().expect("last_used mutex poisoned") = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_used
            .lock()
            .expect("last_used mutex poisoned")
            .elapsed()
    }
}

/// Caches live agent processes per session, enforces at-most-one child per
/// session, and drives the south-session binding protocol.
pub struct SessionManager {
    registry: Arc<AgentRegistry>,
    store: Arc<SessionStore>,
    entries: std::sync::Mutex<HashMap<String, Arc<SessionEntry>>>,
    workdir: PathBuf,
    grace: Duration,
    idle_timeout: Duration,
}

impl SessionManager {
    pub fn new(
        registry: Arc<AgentRegistry>,
        store: Arc<SessionStore>,
        workdir: PathBuf,
        grace: Duration,
        idle_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            store,
            entries: std::sync::Mutex::new(HashMap::new()),
            workdir,
            grace,
            idle_timeout,
        })
    }

    fn entry(&self, session_id: &str) -> Arc<SessionEntry> {
        self.entries
            .lock()
            .expect("entries mutex poisoned")
            .entry(session_id.to_string())
            .or_insert_with(SessionEntry::new)
            .clone()
    }

    /// Take the session's run gate. Runs on one session queue behind one
    /// another; different sessions proceed in parallel.
    pub async fn begin_run(&self, session_id: &str) -> OwnedMutexGuard<()> {
        let gate = self.entry(session_id).run_gate.clone();
        gate.lock_owned().await
    }

    /// True when a run currently holds the session's gate.
    pub fn is_running(&self, session_id: &str) -> bool {
        let entry = {
            let entries = self.entries.lock().expect("entries mutex poisoned");
            entries.get(session_id).cloned()
        };
        match entry {
            Some(entry) => entry.run_gate.try_lock().is_err(),
            None => false,
        }
    }

    /// Produce a bound agent process for the session: reuse the cached live
    /// child or spawn a fresh one and re-establish the south session
    /// (resume if the agent supports it, otherwise a new south session whose
    /// id replaces the persisted one — the north transcript is unaffected).
    pub async fn acquire(
        &self,
        session_id: &str,
        agent_name: &str,
    ) -> Result<(Arc<AgentProcess>, String)> {
        let entry = self.entry(session_id);
        let mut binding = entry.binding.lock().await;
        entry.touch();

        let row = self
            .store
            .get_session(session_id)?
            .ok_or_else(|| BridgeError::not_found(format!("session '{session_id}'")))?;

        if let Some(process) = binding.process.as_ref().filter(|p| p.is_alive()) {
            if let Some(sid) = row.south_session_id.clone() {
                return Ok((process.clone(), sid));
            }
            // A live process without a bound south session should not
            // happen; fall through and rebind on a fresh child.
            warn!(session_id, "live process with no south session id, respawning");
        }
        if let Some(stale) = binding.process.take() {
            stale.terminate().await;
        }

        let spec = self.registry.get(agent_name)?;
        let process = AgentProcess::spawn(&spec, self.grace).await?;

        let mut resumed = None;
        if let Some(previous) = row.south_session_id.as_deref() {
            if process.resume(previous).await? {
                debug!(session_id, south_session_id = previous, "resumed south session");
                resumed = Some(previous.to_string());
            }
        }
        let south_sid = match resumed {
            Some(sid) => sid,
            None => {
                let fresh = process.open_new(&self.workdir).await?;
                if row.south_session_id.is_some() {
                    info!(
                        session_id,
                        south_session_id = %fresh,
                        "agent could not reload previous session, opened a new one"
                    );
                }
                self.store.update_session(
                    session_id,
                    SessionPatch {
                        south_session_id: Some(fresh.clone()),
                        ..Default::default()
                    },
                )?;
                fresh
            }
        };

        self.store.update_session(
            session_id,
            SessionPatch {
                status: Some(SessionStatus::Active),
                last_active_at: Some(chrono::Utc::now()),
                ..Default::default()
            },
        )?;

        binding.process = Some(process.clone());
        Ok((process, south_sid))
    }

    /// Mark the session as recently used; the process stays cached for the
    /// next run until the sweeper reaps it.
    pub fn release(&self, session_id: &str) {
        if let Some(entry) = self
            .entries
            .lock()
            .expect("entries mutex poisoned")
            .get(session_id)
        {
            entry.touch();
        }
    }

    /// Terminate the session's child (if any) and mark the row terminated.
    pub async fn terminate(&self, session_id: &str) -> Result<()> {
        let entry = self.entry(session_id);
        let mut binding = entry.binding.lock().await;
        if let Some(process) = binding.process.take() {
            process.terminate().await;
        }
        self.store.update_session(
            session_id,
            SessionPatch {
                status: Some(SessionStatus::Terminated),
                ..Default::default()
            },
        )?;
        Ok(())
    }

    /// Drop any live child for the session without touching the store row.
    /// Used when deleting a session.
    pub async fn evict(&self, session_id: &str) {
        let entry = {
            let mut entries = self.entries.lock().expect("entries mutex poisoned");
            entries.remove(session_id)
        };
        if let Some(entry) = entry {
            let mut binding = entry.binding.lock().await;
            if let Some(process) = binding.process.take() {
                process.terminate().await;
            }
        }
    }

    /// One-shot process with no persistent session row. The caller owns the
    /// process and must terminate it when the run ends.
    pub async fn ephemeral(&self, agent_name: &str) -> Result<(Arc<AgentProcess>, String)> {
        let spec = self.registry.get(agent_name)?;
        let process = AgentProcess::spawn(&spec, self.grace).await?;
        let south_sid = match process.open_new(&self.workdir).await {
            Ok(sid) => sid,
            Err(err) => {
                process.terminate().await;
                return Err(err);
            }
        };
        Ok((process, south_sid))
    }

    /// Background sweeper: terminates children whose session has been idle
    /// beyond the threshold. Never touches a session with a run in flight.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = self.clone();
        let tick = (self.idle_timeout / 2).clamp(Duration::from_secs(1), Duration::from_secs(60));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                manager.sweep_idle().await;
            }
        })
    }

    async fn sweep_idle(&self) {
        let candidates: Vec<(String, Arc<SessionEntry>)> = {
            let entries = self.entries.lock().expect("entries mutex poisoned");
            entries
                .iter()
                .map(|(id, entry)| (id.clone(), entry.clone()))
                .collect()
        };

        for (session_id, entry) in candidates {
            if entry.idle_for() < self.idle_timeout {
                continue;
            }
            // A held run gate means a run is in flight; reaping is forbidden.
            let Ok(_gate) = entry.run_gate.try_lock() else {
                continue;
            };
            let mut binding = entry.binding.lock().await;
            let Some(process) = binding.process.take() else {
                continue;
            };
            info!(session_id = %session_id, "reaping idle agent process");
            process.terminate().await;
            if let Err(err) = self.store.update_session(
                &session_id,
                SessionPatch {
                    status: Some(SessionStatus::Idle),
                    ..Default::default()
                },
            ) {
                warn!(session_id = %session_id, error = %err, "failed to mark session idle");
            }
        }
    }

    /// Terminate every cached process; used on server shutdown.
    pub async fn shutdown(&self) {
        let entries: Vec<Arc<SessionEntry>> = {
            let map = self.entries.lock().expect("entries mutex poisoned");
            map.values().cloned().collect()
        };
        for entry in entries {
            let mut binding = entry.binding.lock().await;
            if let Some(process) = binding.process.take() {
                process.terminate().await;
            }
        }
    }
}
