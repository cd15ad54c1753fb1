use std::path::PathBuf;
use std::time::Duration;

/// Runtime settings sourced from `ACP2_*` environment variables, optionally
/// overridden by CLI flags in `main`.
#[derive(Debug, Clone)]
pub struct Settings {
    pub bind_addr: String,
    pub bind_port: u16,
    /// Bearer token north clients must present; `None` disables the check.
    pub auth_token: Option<String>,
    pub db_path: PathBuf,
    pub agents_config: PathBuf,
    /// Working directory handed to the agent in `session/new`.
    pub workdir: PathBuf,
    /// Idle threshold after which the sweeper terminates a session's process.
    pub idle_timeout: Duration,
    /// Grace period between closing stdin and killing a child on terminate.
    pub terminate_grace: Duration,
}

impl Settings {
    pub fn from_env() -> Self {
        Self {
            bind_addr: env_string("ACP2_BIND_ADDR", "0.0.0.0"),
            bind_port: env_parse("ACP2_BIND_PORT", 8001),
            auth_token: std::env::var("ACP2_AUTH_TOKEN")
                .ok()
                .filter(|token| !token.is_empty()),
            db_path: PathBuf::from(env_string("ACP2_DB_PATH", "./acp2.db")),
            agents_config: PathBuf::from(env_string("ACP2_AGENTS_CONFIG", "config/agents.json")),
            workdir: std::env::var("ACP2_WORKDIR").map_or_else(
                |_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
                PathBuf::from,
            ),
            idle_timeout: Duration::from_secs(env_parse("ACP2_IDLE_TIMEOUT_SECS", 1800)),
            terminate_grace: Duration::from_secs(env_parse("ACP2_TERMINATE_GRACE_SECS", 5)),
        }
    }
}

/// Default tracing filter derived from `ACP2_LOG_LEVEL` (DEBUG, INFO, WARN,
/// ERROR; default INFO). `RUST_LOG` takes precedence in `main`.
pub fn log_filter() -> String {
    match std::env::var("ACP2_LOG_LEVEL")
        .unwrap_or_default()
        .to_ascii_uppercase()
        .as_str()
    {
        "DEBUG" => "debug",
        "WARN" => "warn",
        "ERROR" => "error",
        _ => "info",
    }
    .to_string()
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}
