use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use acp2_error::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// One agent entry from the configuration document. Immutable after load.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub command: Vec<String>,
    /// Optional credential; may hold a single `${VAR}` placeholder resolved
    /// against the host environment at lookup time.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ConfigDocument {
    agents: Vec<AgentSpec>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentSummary {
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentManifest {
    pub name: String,
    pub description: String,
    pub version: String,
    pub capabilities: serde_json::Value,
}

/// Read-only catalog of configured agents, loaded once at startup.
#[derive(Debug)]
pub struct AgentRegistry {
    agents: Vec<Arc<AgentSpec>>,
    by_name: HashMap<String, usize>,
}

impl AgentRegistry {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|err| BridgeError::Config {
            message: format!("cannot read agents config {}: {err}", path.display()),
        })?;
        let document: ConfigDocument =
            serde_json::from_str(&raw).map_err(|err| BridgeError::Config {
                message: format!("invalid agents config {}: {err}", path.display()),
            })?;
        Self::from_specs(document.agents)
    }

    pub fn from_specs(specs: Vec<AgentSpec>) -> Result<Self> {
        let mut agents = Vec::with_capacity(specs.len());
        let mut by_name = HashMap::new();
        for spec in specs {
            if spec.name.is_empty() {
                return Err(BridgeError::Config {
                    message: "agent entry has an empty name".to_string(),
                });
            }
            if spec.command.is_empty() {
                return Err(BridgeError::Config {
                    message: format!("agent '{}' has an empty command", spec.name),
                });
            }
            if by_name.contains_key(&spec.name) {
                return Err(BridgeError::Config {
                    message: format!("duplicate agent name '{}'", spec.name),
                });
            }
            by_name.insert(spec.name.clone(), agents.len());
            agents.push(Arc::new(spec));
        }
        Ok(Self { agents, by_name })
    }

    pub fn get(&self, name: &str) -> Result<Arc<AgentSpec>> {
        self.by_name
            .get(name)
            .map(|&idx| self.agents[idx].clone())
            .ok_or_else(|| BridgeError::AgentNotFound {
                agent: name.to_string(),
            })
    }

    /// All specs in insertion order.
    pub fn list(&self) -> impl Iterator<Item = &Arc<AgentSpec>> {
        self.agents.iter()
    }

    pub fn summaries(&self) -> Vec<AgentSummary> {
        self.agents
            .iter()
            .map(|spec| AgentSummary {
                name: spec.name.clone(),
                description: spec.description.clone(),
            })
            .collect()
    }

    pub fn manifest(&self, name: &str) -> Result<AgentManifest> {
        let spec = self.get(name)?;
        Ok(AgentManifest {
            name: spec.name.clone(),
            description: spec.description.clone(),
            version: spec.version.clone().unwrap_or_else(|| "0.1.0".to_string()),
            capabilities: json!({
                "modes": ["sync", "stream"],
                "supports_streaming": true,
                "supports_cancellation": true,
            }),
        })
    }

    /// Resolve the spec's api key against the host environment. `${VAR}`
    /// resolves at call time; an unresolved variable yields an empty string,
    /// and an empty result means the agent launches without the credential.
    pub fn resolve_api_key(spec: &AgentSpec) -> Option<String> {
        let raw = spec.api_key.as_deref()?;
        let resolved = resolve_placeholder(raw);
        if resolved.is_empty() {
            None
        } else {
            Some(resolved)
        }
    }
}

fn resolve_placeholder(raw: &str) -> String {
    let Some(start) = raw.find("${") else {
        return raw.to_string();
    };
    let Some(end) = raw[start..].find('}') else {
        return raw.to_string();
    };
    let var = &raw[start + 2..start + end];
    let value = std::env::var(var).unwrap_or_default();
    format!("{}{}{}", &raw[..start], value, &raw[start + end + 1..])
}
