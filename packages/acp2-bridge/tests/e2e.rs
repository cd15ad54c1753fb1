use std::io;
use std::net::TcpListener;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use futures::StreamExt;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use tempfile::TempDir;

const TOKEN: &str = "test-token";

struct ServerHandle {
    child: Child,
    base_url: String,
    #[allow(dead_code)]
    tmp: TempDir,
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn dummy_agent_command(extra_args: &[&str]) -> Vec<String> {
    let mut command = vec![env!("CARGO_BIN_EXE_dummy-agent").to_string()];
    command.extend(extra_args.iter().map(|arg| arg.to_string()));
    command
}

fn spawn_server(agents: Value) -> io::Result<ServerHandle> {
    spawn_server_with_env(agents, &[])
}

fn spawn_server_with_env(agents: Value, env: &[(&str, &str)]) -> io::Result<ServerHandle> {
    let tmp = TempDir::new()?;
    let config_path = tmp.path().join("agents.json");
    std::fs::write(&config_path, json!({ "agents": agents }).to_string())?;

    let port = pick_port()?;
    let base_url = format!("http://127.0.0.1:{port}");

    let mut command = Command::new(env!("CARGO_BIN_EXE_acp2-bridge"));
    command
        .env("ACP2_AUTH_TOKEN", TOKEN)
        .env("ACP2_BIND_ADDR", "127.0.0.1")
        .env("ACP2_BIND_PORT", port.to_string())
        .env("ACP2_AGENTS_CONFIG", &config_path)
        .env("ACP2_DB_PATH", tmp.path().join("acp2.db"))
        .env("ACP2_WORKDIR", tmp.path())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped());
    for (key, value) in env {
        command.env(key, value);
    }
    let child = command.spawn()?;

    Ok(ServerHandle {
        child,
        base_url,
        tmp,
    })
}

fn pick_port() -> io::Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

fn client() -> Client {
    Client::new()
}

fn authed(request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
    request.header("authorization", format!("Bearer {TOKEN}"))
}

async fn wait_for_ping(base_url: &str) -> io::Result<()> {
    let client = client();
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if Instant::now() > deadline {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "server did not become healthy",
            ));
        }
        if let Ok(response) = authed(client.get(format!("{base_url}/ping"))).send().await {
            if response.status() == StatusCode::OK {
                return Ok(());
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn run_sync(base_url: &str, agent: &str, session_id: Option<&str>, text: &str) -> Value {
    let mut body = json!({
        "agent": agent,
        "mode": "sync",
        "input": {"role": "user", "content": [{"type": "text", "text": text}]}
    });
    if let Some(sid) = session_id {
        body["session_id"] = json!(sid);
    }
    let response = authed(client().post(format!("{base_url}/runs")))
        .json(&body)
        .send()
        .await
        .expect("post run");
    assert_eq!(response.status(), StatusCode::OK, "sync run should succeed");
    response.json().await.expect("run body")
}

fn output_text(run_body: &Value) -> String {
    run_body["output"]["content"]
        .as_array()
        .expect("output content")
        .iter()
        .filter(|block| block["type"] == "text")
        .filter_map(|block| block["text"].as_str())
        .collect()
}

struct SseReader {
    stream: futures::stream::BoxStream<'static, Result<bytes::Bytes, reqwest::Error>>,
    buffer: Vec<u8>,
}

struct SseFrame {
    event: String,
    data: Value,
}

impl SseReader {
    fn new(response: reqwest::Response) -> Self {
        Self {
            stream: response.bytes_stream().boxed(),
            buffer: Vec::new(),
        }
    }

    async fn next_frame(&mut self, timeout: Duration) -> io::Result<SseFrame> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(frame) = self.try_parse_frame()? {
                return Ok(frame);
            }
            if Instant::now() >= deadline {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "timed out waiting for sse frame",
                ));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            let chunk = tokio::time::timeout(remaining, self.stream.next())
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "timed out reading sse"))?;
            match chunk {
                Some(Ok(bytes)) => self.buffer.extend_from_slice(&bytes),
                Some(Err(err)) => {
                    return Err(io::Error::other(format!("sse stream error: {err}")))
                }
                None => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "sse stream ended",
                    ))
                }
            }
        }
    }

    fn try_parse_frame(&mut self) -> io::Result<Option<SseFrame>> {
        let Some(idx) = self
            .buffer
            .windows(2)
            .position(|window| window == b"\n\n")
        else {
            return Ok(None);
        };

        let block = self.buffer.drain(..idx + 2).collect::<Vec<_>>();
        let text = String::from_utf8_lossy(&block);

        let mut event = String::new();
        let mut data = String::new();
        for line in text.lines() {
            if let Some(rest) = line.strip_prefix("event: ") {
                event = rest.to_string();
            } else if let Some(rest) = line.strip_prefix("data: ") {
                data.push_str(rest);
            }
        }
        if data.is_empty() {
            // Keep-alive comment frame; try the next block.
            return self.try_parse_frame();
        }
        let data: Value = serde_json::from_str(&data).map_err(|err| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid sse json payload: {err}"),
            )
        })?;
        Ok(Some(SseFrame { event, data }))
    }
}

#[tokio::test]
async fn ping_enforces_bearer_token() {
    let server = spawn_server(json!([
        {"name": "dummy", "description": "test", "command": dummy_agent_command(&[])}
    ]))
    .expect("spawn server");
    wait_for_ping(&server.base_url).await.expect("healthy");

    let ok = authed(client().get(format!("{}/ping", server.base_url)))
        .send()
        .await
        .expect("ping");
    assert_eq!(ok.status(), StatusCode::OK);
    let body: Value = ok.json().await.expect("ping body");
    assert_eq!(body, json!({"status": "ok"}));

    let missing = client()
        .get(format!("{}/ping", server.base_url))
        .send()
        .await
        .expect("unauthenticated ping");
    assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);
    let body: Value = missing.json().await.expect("error body");
    assert_eq!(
        body,
        json!({"error": {"kind": "auth-error", "message": "missing credentials"}})
    );

    let wrong = client()
        .get(format!("{}/ping", server.base_url))
        .header("authorization", "Bearer nope")
        .send()
        .await
        .expect("wrong token ping");
    assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);
    let body: Value = wrong.json().await.expect("error body");
    assert_eq!(body["error"]["kind"], "auth-error");
}

#[tokio::test]
async fn agents_listing_and_manifest() {
    let server = spawn_server(json!([
        {"name": "dummy", "description": "canned replies", "command": dummy_agent_command(&["--reply", "hello"])}
    ]))
    .expect("spawn server");
    wait_for_ping(&server.base_url).await.expect("healthy");

    let listing: Value = authed(client().get(format!("{}/agents", server.base_url)))
        .send()
        .await
        .expect("agents")
        .json()
        .await
        .expect("agents body");
    assert_eq!(listing["agents"][0]["name"], "dummy");
    assert_eq!(listing["agents"][0]["description"], "canned replies");

    let manifest: Value = authed(client().get(format!("{}/agents/dummy", server.base_url)))
        .send()
        .await
        .expect("manifest")
        .json()
        .await
        .expect("manifest body");
    assert_eq!(manifest["name"], "dummy");
    assert_eq!(manifest["capabilities"]["supports_cancellation"], true);

    let missing = authed(client().get(format!("{}/agents/ghost", server.base_url)))
        .send()
        .await
        .expect("missing manifest");
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    let body: Value = missing.json().await.expect("error body");
    assert_eq!(body["error"]["kind"], "agent-not-found");
}

#[tokio::test]
async fn stateless_sync_run_leaves_no_session_row() {
    let server = spawn_server(json!([
        {"name": "dummy", "description": "", "command": dummy_agent_command(&["--reply", "hello"])}
    ]))
    .expect("spawn server");
    wait_for_ping(&server.base_url).await.expect("healthy");

    let run = run_sync(&server.base_url, "dummy", None, "hi").await;
    assert_eq!(run["status"], "completed");
    assert_eq!(
        run["output"]["content"],
        json!([{"type": "text", "text": "hello"}])
    );

    let sessions: Value = authed(client().get(format!("{}/sessions", server.base_url)))
        .send()
        .await
        .expect("sessions")
        .json()
        .await
        .expect("sessions body");
    assert_eq!(sessions["sessions"], json!([]));
}

#[tokio::test]
async fn stateful_runs_share_one_transcript() {
    let server = spawn_server(json!([
        {"name": "echo", "description": "", "command": dummy_agent_command(&["--echo-context"])}
    ]))
    .expect("spawn server");
    wait_for_ping(&server.base_url).await.expect("healthy");

    let first = run_sync(
        &server.base_url,
        "echo",
        Some("s1"),
        "Remember: name is Alice",
    )
    .await;
    assert_eq!(first["status"], "completed");

    let second = run_sync(&server.base_url, "echo", Some("s1"), "What is my name?").await;
    assert_eq!(second["status"], "completed");
    assert!(
        output_text(&second).contains("Alice"),
        "second reply should echo the remembered context"
    );

    let detail: Value = authed(client().get(format!("{}/sessions/s1", server.base_url)))
        .send()
        .await
        .expect("session detail")
        .json()
        .await
        .expect("session body");
    let messages = detail["messages"].as_array().expect("messages");
    assert_eq!(messages.len(), 4);
    let roles: Vec<&str> = messages
        .iter()
        .map(|m| m["role"].as_str().unwrap())
        .collect();
    assert_eq!(roles, vec!["user", "agent", "user", "agent"]);
    let sequences: Vec<i64> = messages
        .iter()
        .map(|m| m["sequence"].as_i64().unwrap())
        .collect();
    assert_eq!(sequences, vec![1, 2, 3, 4]);
    assert_eq!(
        messages[0]["content"][0]["text"],
        "Remember: name is Alice"
    );
    assert_eq!(detail["session"]["message_count"], 4);
    assert_eq!(detail["session"]["agent_name"], "echo");
}

#[tokio::test]
async fn streaming_chunks_arrive_in_order_and_aggregate() {
    let server = spawn_server(json!([
        {"name": "chunky", "description": "", "command": dummy_agent_command(&["--chunks", "he,llo, world"])}
    ]))
    .expect("spawn server");
    wait_for_ping(&server.base_url).await.expect("healthy");

    let response = authed(client().post(format!("{}/runs", server.base_url)))
        .json(&json!({
            "agent": "chunky",
            "mode": "stream",
            "input": {"role": "user", "content": [{"type": "text", "text": "go"}]}
        }))
        .send()
        .await
        .expect("stream run");
    assert_eq!(response.status(), StatusCode::OK);
    let run_id = response
        .headers()
        .get("x-acp2-run-id")
        .and_then(|value| value.to_str().ok())
        .expect("run id header")
        .to_string();
    assert!(!run_id.is_empty());

    let mut sse = SseReader::new(response);
    let mut chunks = Vec::new();
    let completed = loop {
        let frame = sse
            .next_frame(Duration::from_secs(5))
            .await
            .expect("sse frame");
        match frame.event.as_str() {
            "update" => {
                assert_eq!(frame.data["type"], "agent_message_chunk");
                chunks.push(frame.data["text"].as_str().unwrap().to_string());
            }
            "completed" => break frame.data,
            other => panic!("unexpected frame '{other}'"),
        }
    };

    assert_eq!(chunks, vec!["he", "llo", " world"]);
    assert_eq!(completed["run_id"], run_id);
    assert_eq!(completed["status"], "completed");
    assert_eq!(
        completed["output"]["content"][0],
        json!({"type": "text", "text": "hello world"})
    );
}

#[tokio::test]
async fn cancellation_terminates_the_run_and_frees_the_session() {
    let server = spawn_server(json!([
        {"name": "sleepy", "description": "", "command": dummy_agent_command(&["--sleep-ms", "10000", "--sleep-once"])}
    ]))
    .expect("spawn server");
    wait_for_ping(&server.base_url).await.expect("healthy");

    let response = authed(client().post(format!("{}/runs", server.base_url)))
        .json(&json!({
            "agent": "sleepy",
            "session_id": "c1",
            "mode": "stream",
            "input": {"role": "user", "content": [{"type": "text", "text": "slow"}]}
        }))
        .send()
        .await
        .expect("stream run");
    assert_eq!(response.status(), StatusCode::OK);
    let run_id = response
        .headers()
        .get("x-acp2-run-id")
        .and_then(|value| value.to_str().ok())
        .expect("run id header")
        .to_string();

    tokio::time::sleep(Duration::from_millis(200)).await;
    let cancel_started = Instant::now();
    let cancel = authed(client().post(format!(
        "{}/runs/{run_id}/cancel",
        server.base_url
    )))
    .send()
    .await
    .expect("cancel");
    assert_eq!(cancel.status(), StatusCode::OK);

    let mut sse = SseReader::new(response);
    let frame = loop {
        let frame = sse
            .next_frame(Duration::from_secs(5))
            .await
            .expect("terminal frame");
        if frame.event != "update" {
            break frame;
        }
    };
    assert_eq!(frame.event, "cancelled");
    assert_eq!(frame.data["status"], "cancelled");
    assert!(
        cancel_started.elapsed() < Duration::from_secs(1),
        "cancellation should settle quickly"
    );

    // The session must accept a fresh run afterwards; the sleep applied only
    // to the first prompt.
    let next = run_sync(&server.base_url, "sleepy", Some("c1"), "again").await;
    assert_eq!(next["status"], "completed");
    assert_eq!(output_text(&next), "again");
}

#[tokio::test]
async fn cancel_after_terminal_state_is_a_conflict() {
    let server = spawn_server(json!([
        {"name": "dummy", "description": "", "command": dummy_agent_command(&["--reply", "hello"])}
    ]))
    .expect("spawn server");
    wait_for_ping(&server.base_url).await.expect("healthy");

    let run = run_sync(&server.base_url, "dummy", Some("t1"), "hi").await;
    let run_id = run["run_id"].as_str().expect("run id");

    let conflict = authed(client().post(format!(
        "{}/runs/{run_id}/cancel",
        server.base_url
    )))
    .send()
    .await
    .expect("cancel");
    assert_eq!(conflict.status(), StatusCode::CONFLICT);
    let body: Value = conflict.json().await.expect("conflict body");
    assert_eq!(body["error"]["kind"], "conflict");

    let missing = authed(client().post(format!(
        "{}/runs/not-a-run/cancel",
        server.base_url
    )))
    .send()
    .await
    .expect("cancel missing");
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn session_lifecycle_endpoints() {
    let server = spawn_server(json!([
        {"name": "dummy", "description": "", "command": dummy_agent_command(&["--reply", "ok"])}
    ]))
    .expect("spawn server");
    wait_for_ping(&server.base_url).await.expect("healthy");

    let missing = authed(client().get(format!("{}/sessions/nope", server.base_url)))
        .send()
        .await
        .expect("missing session");
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    let body: Value = missing.json().await.expect("error body");
    assert_eq!(body["error"]["kind"], "not-found");

    run_sync(&server.base_url, "dummy", Some("d1"), "hi").await;

    let listing: Value = authed(client().get(format!("{}/sessions", server.base_url)))
        .send()
        .await
        .expect("sessions")
        .json()
        .await
        .expect("sessions body");
    assert_eq!(listing["sessions"][0]["id"], "d1");
    assert_eq!(listing["sessions"][0]["status"], "active");

    let deleted = authed(client().delete(format!("{}/sessions/d1", server.base_url)))
        .send()
        .await
        .expect("delete");
    assert_eq!(deleted.status(), StatusCode::NO_CONTENT);

    let gone = authed(client().get(format!("{}/sessions/d1", server.base_url)))
        .send()
        .await
        .expect("get after delete");
    assert_eq!(gone.status(), StatusCode::NOT_FOUND);

    let again = authed(client().delete(format!("{}/sessions/d1", server.base_url)))
        .send()
        .await
        .expect("second delete");
    assert_eq!(again.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn unknown_agent_is_rejected_up_front() {
    let server = spawn_server(json!([
        {"name": "dummy", "description": "", "command": dummy_agent_command(&[])}
    ]))
    .expect("spawn server");
    wait_for_ping(&server.base_url).await.expect("healthy");

    let response = authed(client().post(format!("{}/runs", server.base_url)))
        .json(&json!({
            "agent": "ghost",
            "mode": "sync",
            "input": {"role": "user", "content": [{"type": "text", "text": "hi"}]}
        }))
        .send()
        .await
        .expect("run");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body: Value = response.json().await.expect("error body");
    assert_eq!(body["error"]["kind"], "agent-not-found");
}

#[tokio::test]
async fn crashed_agent_fails_the_run_and_the_session_recovers() {
    let tmp = TempDir::new().expect("tmp");
    let crash_flag = tmp.path().join("crash-once");
    std::fs::write(&crash_flag, b"1").expect("write crash flag");

    let server = spawn_server(json!([
        {
            "name": "flaky",
            "description": "",
            "command": dummy_agent_command(&["--crash-flag", crash_flag.to_str().unwrap()])
        }
    ]))
    .expect("spawn server");
    wait_for_ping(&server.base_url).await.expect("healthy");

    let response = authed(client().post(format!("{}/runs", server.base_url)))
        .json(&json!({
            "agent": "flaky",
            "session_id": "f1",
            "mode": "sync",
            "input": {"role": "user", "content": [{"type": "text", "text": "boom"}]}
        }))
        .send()
        .await
        .expect("run");
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body: Value = response.json().await.expect("error body");
    assert_eq!(body["error"]["kind"], "agent-exited");

    // The crash consumed the marker file, so the respawned child survives.
    let next = run_sync(&server.base_url, "flaky", Some("f1"), "hello again").await;
    assert_eq!(next["status"], "completed");
    assert_eq!(output_text(&next), "hello again");
}

#[tokio::test]
async fn idle_processes_are_reaped_and_rebinding_opens_a_new_south_session() {
    let server = spawn_server_with_env(
        json!([
            {"name": "echo", "description": "", "command": dummy_agent_command(&["--echo-context"])}
        ]),
        &[("ACP2_IDLE_TIMEOUT_SECS", "1")],
    )
    .expect("spawn server");
    wait_for_ping(&server.base_url).await.expect("healthy");

    run_sync(&server.base_url, "echo", Some("r1"), "first").await;

    // Wait for the sweeper to reap the idle child.
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let detail: Value = authed(client().get(format!("{}/sessions/r1", server.base_url)))
            .send()
            .await
            .expect("session detail")
            .json()
            .await
            .expect("session body");
        if detail["session"]["status"] == "idle" {
            break;
        }
        assert!(
            Instant::now() < deadline,
            "sweeper never reaped the idle process"
        );
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    // The next run respawns a child; the dummy agent rejects session/load,
    // so the bridge falls back to session/new. The transcript is unaffected.
    let next = run_sync(&server.base_url, "echo", Some("r1"), "second").await;
    assert_eq!(next["status"], "completed");

    let detail: Value = authed(client().get(format!("{}/sessions/r1", server.base_url)))
        .send()
        .await
        .expect("session detail")
        .json()
        .await
        .expect("session body");
    assert_eq!(detail["messages"].as_array().unwrap().len(), 4);
    assert_eq!(detail["session"]["status"], "active");
}

#[tokio::test]
async fn concurrent_runs_on_one_session_serialise_without_losing_messages() {
    let server = spawn_server(json!([
        {"name": "slowish", "description": "", "command": dummy_agent_command(&["--sleep-ms", "300"])}
    ]))
    .expect("spawn server");
    wait_for_ping(&server.base_url).await.expect("healthy");

    let (first, second) = tokio::join!(
        run_sync(&server.base_url, "slowish", Some("q1"), "one"),
        run_sync(&server.base_url, "slowish", Some("q1"), "two"),
    );
    assert_eq!(first["status"], "completed");
    assert_eq!(second["status"], "completed");

    let detail: Value = authed(client().get(format!("{}/sessions/q1", server.base_url)))
        .send()
        .await
        .expect("session detail")
        .json()
        .await
        .expect("session body");
    let messages = detail["messages"].as_array().expect("messages");
    assert_eq!(messages.len(), 4, "no transcript entry may be skipped");
    let roles: Vec<&str> = messages
        .iter()
        .map(|m| m["role"].as_str().unwrap())
        .collect();
    assert_eq!(roles, vec!["user", "agent", "user", "agent"]);
}

#[tokio::test]
async fn stream_and_sync_runs_agree_on_the_final_message() {
    let server = spawn_server(json!([
        {"name": "chunky", "description": "", "command": dummy_agent_command(&["--chunks", "a,b,c"])}
    ]))
    .expect("spawn server");
    wait_for_ping(&server.base_url).await.expect("healthy");

    let sync_run = run_sync(&server.base_url, "chunky", None, "go").await;
    let sync_text = output_text(&sync_run);

    let response = authed(client().post(format!("{}/runs", server.base_url)))
        .json(&json!({
            "agent": "chunky",
            "mode": "stream",
            "input": {"role": "user", "content": [{"type": "text", "text": "go"}]}
        }))
        .send()
        .await
        .expect("stream run");
    let mut sse = SseReader::new(response);
    let mut streamed = String::new();
    let final_text = loop {
        let frame = sse
            .next_frame(Duration::from_secs(5))
            .await
            .expect("sse frame");
        match frame.event.as_str() {
            "update" => streamed.push_str(frame.data["text"].as_str().unwrap()),
            "completed" => {
                break frame.data["output"]["content"][0]["text"]
                    .as_str()
                    .unwrap()
                    .to_string()
            }
            other => panic!("unexpected frame '{other}'"),
        }
    };

    assert_eq!(streamed, final_text);
    assert_eq!(sync_text, final_text);
}
