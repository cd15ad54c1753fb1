//! Scriptable stdio agent used by the end-to-end tests. Speaks just enough
//! of the south protocol: initialize, authenticate, session/new,
//! session/load, session/prompt, session/cancel.

use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::Parser;
use serde_json::{json, Value};

#[derive(Debug, Parser)]
#[command(name = "dummy-agent")]
struct Cli {
    /// Fixed reply text, sent as a single chunk.
    #[arg(long)]
    reply: Option<String>,

    /// Comma-separated chunk texts, sent as individual chunks.
    #[arg(long)]
    chunks: Option<String>,

    /// Reply with the concatenation of every user text seen so far.
    #[arg(long)]
    echo_context: bool,

    /// Delay before replying, in milliseconds.
    #[arg(long, default_value_t = 0)]
    sleep_ms: u64,

    /// Apply the delay to the first prompt only.
    #[arg(long)]
    sleep_once: bool,

    /// Acknowledge session/load instead of returning method-not-found.
    #[arg(long)]
    supports_load: bool,

    /// Advertise apikey authentication and require OPENAI_API_KEY.
    #[arg(long)]
    require_auth: bool,

    /// Crash on prompt while this marker file exists; the file is removed
    /// first so the next spawn survives.
    #[arg(long)]
    crash_flag: Option<std::path::PathBuf>,
}

#[derive(Clone)]
struct Out(Arc<Mutex<std::io::Stdout>>);

impl Out {
    fn send(&self, payload: &Value) {
        let mut stdout = self.0.lock().expect("stdout lock");
        let line = serde_json::to_string(payload).expect("serialize payload");
        writeln!(stdout, "{line}").expect("write stdout");
        stdout.flush().expect("flush stdout");
    }
}

struct Agent {
    cli: Cli,
    out: Out,
    cancel: Arc<AtomicBool>,
    current_request: Arc<Mutex<Option<Value>>>,
    session_counter: AtomicU64,
    contexts: Arc<Mutex<HashMap<String, String>>>,
    slept: AtomicBool,
}

fn main() {
    let cli = Cli::parse();
    let agent = Agent {
        cli,
        out: Out(Arc::new(Mutex::new(std::io::stdout()))),
        cancel: Arc::new(AtomicBool::new(false)),
        current_request: Arc::new(Mutex::new(None)),
        session_counter: AtomicU64::new(0),
        contexts: Arc::new(Mutex::new(HashMap::new())),
        slept: AtomicBool::new(false),
    };

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let Ok(message) = serde_json::from_str::<Value>(trimmed) else {
            continue;
        };
        match message.get("method").and_then(Value::as_str) {
            Some("initialize") => agent.handle_initialize(&message),
            Some("authenticate") => agent.handle_authenticate(&message),
            Some("session/new") => agent.handle_session_new(&message),
            Some("session/load") => agent.handle_session_load(&message),
            Some("session/prompt") => agent.handle_prompt(&message),
            Some("session/cancel") => agent.handle_cancel(&message),
            _ => {}
        }
    }
}

impl Agent {
    fn handle_initialize(&self, message: &Value) {
        let auth_methods = if self.cli.require_auth {
            json!([{"id": "apikey"}])
        } else {
            json!([])
        };
        self.out.send(&json!({
            "jsonrpc": "2.0",
            "id": message["id"],
            "result": {
                "protocolVersion": 1,
                "authMethods": auth_methods,
                "agentCapabilities": {"loadSession": self.cli.supports_load},
            }
        }));
    }

    fn handle_authenticate(&self, message: &Value) {
        if self.cli.require_auth && std::env::var("OPENAI_API_KEY").is_err() {
            self.out.send(&json!({
                "jsonrpc": "2.0",
                "id": message["id"],
                "error": {"code": -32000, "message": "missing api key"}
            }));
            return;
        }
        self.out.send(&json!({
            "jsonrpc": "2.0",
            "id": message["id"],
            "result": {}
        }));
    }

    fn handle_session_new(&self, message: &Value) {
        let n = self.session_counter.fetch_add(1, Ordering::SeqCst) + 1;
        self.out.send(&json!({
            "jsonrpc": "2.0",
            "id": message["id"],
            "result": {"sessionId": format!("dummy-session-{n}")}
        }));
    }

    fn handle_session_load(&self, message: &Value) {
        if self.cli.supports_load {
            self.out.send(&json!({
                "jsonrpc": "2.0",
                "id": message["id"],
                "result": {}
            }));
        } else {
            self.out.send(&json!({
                "jsonrpc": "2.0",
                "id": message["id"],
                "error": {"code": -32601, "message": "method not found"}
            }));
        }
    }

    fn handle_prompt(&self, message: &Value) {
        if let Some(flag) = &self.cli.crash_flag {
            if flag.exists() {
                let _ = std::fs::remove_file(flag);
                std::process::exit(1);
            }
        }
        self.cancel.store(false, Ordering::SeqCst);
        *self.current_request.lock().expect("request lock") = Some(message["id"].clone());

        let params = message.get("params").cloned().unwrap_or(Value::Null);
        let session_id = params
            .get("sessionId")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        let prompt_text = params
            .get("prompt")
            .and_then(Value::as_array)
            .map(|blocks| {
                blocks
                    .iter()
                    .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
                    .filter_map(|b| b.get("text").and_then(Value::as_str))
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        let reply_chunks: Vec<String> = if let Some(chunks) = &self.cli.chunks {
            chunks.split(',').map(str::to_string).collect()
        } else if let Some(reply) = &self.cli.reply {
            vec![reply.clone()]
        } else if self.cli.echo_context {
            let mut contexts = self.contexts.lock().expect("context lock");
            let context = contexts.entry(session_id.clone()).or_default();
            if !context.is_empty() {
                context.push('\n');
            }
            context.push_str(&prompt_text);
            vec![context.clone()]
        } else {
            vec![prompt_text.clone()]
        };

        let sleep_ms = if self.cli.sleep_ms > 0
            && (!self.cli.sleep_once || !self.slept.swap(true, Ordering::SeqCst))
        {
            self.cli.sleep_ms
        } else {
            0
        };

        let out = self.out.clone();
        let cancel = self.cancel.clone();
        let current = self.current_request.clone();
        let request_id = message["id"].clone();

        std::thread::spawn(move || {
            let mut waited = 0u64;
            while waited < sleep_ms {
                if cancel.load(Ordering::SeqCst) {
                    return;
                }
                std::thread::sleep(Duration::from_millis(50));
                waited += 50;
            }

            for chunk in &reply_chunks {
                if cancel.load(Ordering::SeqCst) {
                    return;
                }
                out.send(&json!({
                    "jsonrpc": "2.0",
                    "method": "session/update",
                    "params": {
                        "sessionId": session_id,
                        "update": {
                            "sessionUpdate": "agent_message_chunk",
                            "content": {"type": "text", "text": chunk}
                        }
                    }
                }));
                std::thread::sleep(Duration::from_millis(10));
            }

            let mut guard = current.lock().expect("request lock");
            if guard.as_ref() == Some(&request_id) {
                *guard = None;
                out.send(&json!({
                    "jsonrpc": "2.0",
                    "id": request_id,
                    "result": {"stopReason": "end_turn"}
                }));
            }
        });
    }

    fn handle_cancel(&self, message: &Value) {
        self.cancel.store(true, Ordering::SeqCst);
        let session_id = message
            .get("params")
            .and_then(|p| p.get("sessionId"))
            .cloned()
            .unwrap_or(Value::Null);
        self.out.send(&json!({
            "jsonrpc": "2.0",
            "method": "session/cancelled",
            "params": {"sessionId": session_id}
        }));
        let mut guard = self.current_request.lock().expect("request lock");
        if let Some(request_id) = guard.take() {
            self.out.send(&json!({
                "jsonrpc": "2.0",
                "id": request_id,
                "error": {"code": 499, "message": "cancelled"}
            }));
        }
    }
}
