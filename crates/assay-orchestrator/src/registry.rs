use assay_core::{AssayError, AssayResult, ComplexityClass};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// A worker capability the orchestrator can route scenarios to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentDefinition {
    /// Canonical capability key, e.g. `security-scan`.
    pub key: String,
    pub display_name: String,
    /// Alternative names accepted in capability tags.
    #[serde(default)]
    pub route_aliases: Vec<String>,
    /// Work queue the dispatch envelope is placed on.
    pub queue_name: String,
    pub complexity_class: ComplexityClass,
    /// Prefix for the liveness key, e.g. `agents:security` → `agents:security:heartbeat`.
    pub health_prefix: String,
}

impl AgentDefinition {
    /// Key under which the worker's heartbeat is recorded.
    pub fn heartbeat_key(&self) -> String {
        format!("{}:heartbeat", self.health_prefix)
    }
}

#[derive(Debug, Deserialize)]
struct AgentsFile {
    agents: Vec<AgentDefinition>,
}

/// Immutable lookup table of worker capabilities.
///
/// Keys and aliases are matched case-insensitively. Definitions keep their
/// declaration order, which also decides the complexity fallback.
#[derive(Debug, Clone)]
pub struct CapabilityRegistry {
    agents: Vec<AgentDefinition>,
    index: HashMap<String, usize>,
}

fn normalize(name: &str) -> String {
    name.trim().to_lowercase()
}

impl CapabilityRegistry {
    /// Build a registry, rejecting duplicate keys and colliding aliases.
    pub fn new(agents: Vec<AgentDefinition>) -> AssayResult<Self> {
        if agents.is_empty() {
            return Err(AssayError::Config("registry has no agents".into()));
        }

        let mut index = HashMap::new();
        for (i, agent) in agents.iter().enumerate() {
            let key = normalize(&agent.key);
            if key.is_empty() {
                return Err(AssayError::Config(format!("agent #{i} has an empty key")));
            }
            if index.insert(key.clone(), i).is_some() {
                return Err(AssayError::Config(format!(
                    "duplicate capability key '{key}'"
                )));
            }
        }
        for (i, agent) in agents.iter().enumerate() {
            for alias in &agent.route_aliases {
                let alias = normalize(alias);
                match index.get(&alias) {
                    Some(owner) if *owner == i => {}
                    Some(owner) => {
                        return Err(AssayError::Config(format!(
                            "alias '{alias}' of '{}' collides with '{}'",
                            agent.key, agents[*owner].key
                        )));
                    }
                    None => {
                        index.insert(alias, i);
                    }
                }
            }
        }

        Ok(Self { agents, index })
    }

    /// Registry populated with [`default_agents`].
    pub fn with_defaults() -> AssayResult<Self> {
        Self::new(default_agents())
    }

    /// Parse an `[[agents]]` TOML document.
    pub fn from_toml_str(content: &str) -> AssayResult<Self> {
        let file: AgentsFile =
            toml::from_str(content).map_err(|e| AssayError::Config(e.to_string()))?;
        Self::new(file.agents)
    }

    /// Load an `[[agents]]` TOML file.
    pub fn load(path: impl AsRef<Path>) -> AssayResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    /// Resolve a canonical key or alias.
    pub fn resolve(&self, key: &str) -> AssayResult<&AgentDefinition> {
        self.index
            .get(&normalize(key))
            .map(|i| &self.agents[*i])
            .ok_or_else(|| AssayError::NotFound(format!("capability '{}'", key.trim())))
    }

    /// First registered agent of the given complexity class.
    pub fn resolve_for_complexity(&self, class: ComplexityClass) -> AssayResult<&AgentDefinition> {
        self.agents
            .iter()
            .find(|a| a.complexity_class == class)
            .ok_or_else(|| AssayError::NotFound(format!("no capability for {class} complexity")))
    }

    /// Every definition, in declaration order.
    pub fn list_all(&self) -> &[AgentDefinition] {
        &self.agents
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

/// The built-in QA worker capabilities.
pub fn default_agents() -> Vec<AgentDefinition> {
    vec![
        regression_agent(),
        test_design_agent(),
        security_agent(),
        performance_agent(),
        requirements_agent(),
        risk_agent(),
    ]
}

fn agent(
    key: &str,
    display_name: &str,
    aliases: &[&str],
    queue: &str,
    complexity_class: ComplexityClass,
) -> AgentDefinition {
    AgentDefinition {
        key: key.to_string(),
        display_name: display_name.to_string(),
        route_aliases: aliases.iter().map(|a| a.to_string()).collect(),
        queue_name: format!("assay.{queue}"),
        complexity_class,
        health_prefix: format!("agents:{queue}"),
    }
}

fn regression_agent() -> AgentDefinition {
    agent(
        "regression-run",
        "Regression Runner",
        &["regression", "regression-test", "smoke"],
        "regression",
        ComplexityClass::Low,
    )
}

fn test_design_agent() -> AgentDefinition {
    agent(
        "test-design",
        "Test Designer",
        &["test-generation", "test-cases", "functional"],
        "test_design",
        ComplexityClass::Medium,
    )
}

fn security_agent() -> AgentDefinition {
    agent(
        "security-scan",
        "Security Scanner",
        &["security", "sast", "vulnerability-scan"],
        "security",
        ComplexityClass::High,
    )
}

fn performance_agent() -> AgentDefinition {
    agent(
        "performance-profile",
        "Performance Profiler",
        &["performance", "perf", "load-test"],
        "performance",
        ComplexityClass::High,
    )
}

fn requirements_agent() -> AgentDefinition {
    agent(
        "requirements-analysis",
        "Requirements Analyst",
        &["requirements", "acceptance-criteria"],
        "requirements",
        ComplexityClass::Low,
    )
}

fn risk_agent() -> AgentDefinition {
    agent(
        "risk-assessment",
        "Risk Assessor",
        &["risk", "impact-analysis"],
        "risk",
        ComplexityClass::Medium,
    )
}
