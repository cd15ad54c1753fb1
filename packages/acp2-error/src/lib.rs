use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    ConfigError,
    AgentNotFound,
    AuthError,
    SpawnFailed,
    TransportClosed,
    AgentExited,
    AgentError,
    Busy,
    Conflict,
    NotFound,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConfigError => "config-error",
            Self::AgentNotFound => "agent-not-found",
            Self::AuthError => "auth-error",
            Self::SpawnFailed => "spawn-failed",
            Self::TransportClosed => "transport-closed",
            Self::AgentExited => "agent-exited",
            Self::AgentError => "agent-error",
            Self::Busy => "busy",
            Self::Conflict => "conflict",
            Self::NotFound => "not-found",
            Self::Internal => "internal",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "config-error" => Some(Self::ConfigError),
            "agent-not-found" => Some(Self::AgentNotFound),
            "auth-error" => Some(Self::AuthError),
            "spawn-failed" => Some(Self::SpawnFailed),
            "transport-closed" => Some(Self::TransportClosed),
            "agent-exited" => Some(Self::AgentExited),
            "agent-error" => Some(Self::AgentError),
            "busy" => Some(Self::Busy),
            "conflict" => Some(Self::Conflict),
            "not-found" => Some(Self::NotFound),
            "internal" => Some(Self::Internal),
            _ => None,
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::ConfigError => 400,
            Self::AgentNotFound => 404,
            Self::AuthError => 401,
            Self::SpawnFailed => 502,
            Self::TransportClosed => 502,
            Self::AgentExited => 502,
            Self::AgentError => 502,
            Self::Busy => 409,
            Self::Conflict => 409,
            Self::NotFound => 404,
            Self::Internal => 500,
        }
    }
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("invalid configuration: {message}")]
    Config { message: String },
    #[error("agent '{agent}' is not registered")]
    AgentNotFound { agent: String },
    #[error("{message}")]
    Auth { message: String },
    #[error("failed to spawn agent process `{command}`: {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("agent stdio channel closed with a request outstanding")]
    TransportClosed,
    #[error("agent process exited during a prompt")]
    AgentExited { exit_code: Option<i32> },
    #[error("agent returned an error: {message} (code {code})")]
    AgentError { code: i64, message: String },
    #[error("a prompt is already in flight on this agent process")]
    Busy,
    #[error("{message}")]
    Conflict { message: String },
    #[error("{what} not found")]
    NotFound { what: String },
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl BridgeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config { .. } => ErrorKind::ConfigError,
            Self::AgentNotFound { .. } => ErrorKind::AgentNotFound,
            Self::Auth { .. } => ErrorKind::AuthError,
            Self::SpawnFailed { .. } => ErrorKind::SpawnFailed,
            Self::TransportClosed => ErrorKind::TransportClosed,
            Self::AgentExited { .. } => ErrorKind::AgentExited,
            Self::AgentError { .. } => ErrorKind::AgentError,
            Self::Busy => ErrorKind::Busy,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            error: ErrorDetail {
                kind: self.kind().as_str().to_string(),
                message: self.to_string(),
            },
        }
    }
}

/// Wire shape of every error returned over HTTP: `{"error": {"kind", "message"}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub kind: String,
    pub message: String,
}

impl ErrorDetail {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind: kind.as_str().to_string(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_strings_are_stable() {
        assert_eq!(ErrorKind::ConfigError.as_str(), "config-error");
        assert_eq!(ErrorKind::AgentNotFound.as_str(), "agent-not-found");
        assert_eq!(ErrorKind::AuthError.as_str(), "auth-error");
        assert_eq!(ErrorKind::SpawnFailed.as_str(), "spawn-failed");
        assert_eq!(ErrorKind::TransportClosed.as_str(), "transport-closed");
        assert_eq!(ErrorKind::AgentExited.as_str(), "agent-exited");
        assert_eq!(ErrorKind::AgentError.as_str(), "agent-error");
        assert_eq!(ErrorKind::Busy.as_str(), "busy");
        assert_eq!(ErrorKind::Conflict.as_str(), "conflict");
        assert_eq!(ErrorKind::NotFound.as_str(), "not-found");
        assert_eq!(ErrorKind::Internal.as_str(), "internal");
    }

    #[test]
    fn status_codes_follow_taxonomy() {
        assert_eq!(ErrorKind::AuthError.status_code(), 401);
        assert_eq!(ErrorKind::AgentNotFound.status_code(), 404);
        assert_eq!(ErrorKind::NotFound.status_code(), 404);
        assert_eq!(ErrorKind::Conflict.status_code(), 409);
        assert_eq!(ErrorKind::Busy.status_code(), 409);
        assert_eq!(ErrorKind::AgentExited.status_code(), 502);
        assert_eq!(ErrorKind::Internal.status_code(), 500);
    }

    #[test]
    fn body_serializes_to_wire_shape() {
        let err = BridgeError::AgentNotFound {
            agent: "dummy".to_string(),
        };
        let body = serde_json::to_value(err.to_body()).unwrap();
        assert_eq!(body["error"]["kind"], "agent-not-found");
        assert_eq!(body["error"]["message"], "agent 'dummy' is not registered");
    }

    #[test]
    fn agent_error_preserves_code_and_message() {
        let err = BridgeError::AgentError {
            code: -32602,
            message: "invalid params".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::AgentError);
        assert!(err.to_string().contains("invalid params"));
        assert!(err.to_string().contains("-32602"));
    }
}
