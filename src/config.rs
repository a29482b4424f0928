//! Orchestrator Configuration
//!
//! Read once from a YAML file at startup and shared immutably afterwards:
//! - Platform endpoint and credentials
//! - Enabled agents and how many instances of each run per round
//! - Retry budget, per-round timeouts and challenge concurrency
//! - Voting policy and submission backoff
//! - Sandbox resources

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

/// Complete orchestrator configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub platform: PlatformConfig,
    /// Agent definitions in declaration order
    pub agents: IndexMap<String, AgentConfig>,
    pub execution: ExecutionConfig,
    pub voting: VotingConfig,
    pub submission: SubmissionConfig,
    pub docker: DockerConfig,
    pub hints: HintConfig,
    pub files: FileConfig,
    pub storage: StorageConfig,
}

impl Config {
    /// Load and validate a YAML config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        let mut config: Config = serde_yaml::from_str(raw)?;
        config.platform.url = resolve_env(&config.platform.url);
        config.platform.token = resolve_env(&config.platform.token);
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.enabled_agents().is_empty() {
            return Err(ConfigError::Invalid("no enabled agents".to_string()));
        }
        if self.execution.max_rounds == 0 {
            return Err(ConfigError::Invalid("execution.max_rounds must be > 0".into()));
        }
        if self.execution.max_concurrent_challenges == 0 {
            return Err(ConfigError::Invalid(
                "execution.max_concurrent_challenges must be > 0".into(),
            ));
        }
        if self.execution.agent_timeout_initial_secs > self.execution.agent_timeout_max_secs {
            return Err(ConfigError::Invalid(
                "execution.agent_timeout_initial_secs exceeds agent_timeout_max_secs".into(),
            ));
        }
        if self.submission.max_attempts == 0 {
            return Err(ConfigError::Invalid("submission.max_attempts must be > 0".into()));
        }
        if let Some(pattern) = &self.voting.answer_pattern {
            regex::Regex::new(pattern)
                .map_err(|e| ConfigError::Invalid(format!("voting.answer_pattern: {}", e)))?;
        }
        parse_memory_limit(&self.docker.memory_limit)?;
        Ok(())
    }

    /// Expand agents into runnable instances.
    ///
    /// `instances: 1` keeps the bare name; `instances: n > 1` yields
    /// `name#1 .. name#n`; `instances: 0` disables the agent.
    pub fn enabled_agents(&self) -> Vec<AgentSpec> {
        let mut specs = Vec::new();
        for (name, agent) in &self.agents {
            let env: Vec<(String, String)> = agent
                .env
                .iter()
                .map(|(k, v)| (k.clone(), resolve_env(v)))
                .collect();
            let kind = agent.kind.clone().unwrap_or_else(|| name.clone());
            match agent.instances {
                0 => {}
                1 => specs.push(AgentSpec {
                    name: name.clone(),
                    kind,
                    image: agent.image.clone(),
                    env,
                }),
                n => {
                    for i in 1..=n {
                        specs.push(AgentSpec {
                            name: format!("{}#{}", name, i),
                            kind: kind.clone(),
                            image: agent.image.clone(),
                            env: env.clone(),
                        });
                    }
                }
            }
        }
        specs
    }
}

/// Replace a `${VAR}` value with the environment variable's contents
pub fn resolve_env(value: &str) -> String {
    match value.strip_prefix("${").and_then(|v| v.strip_suffix('}')) {
        Some(var) => std::env::var(var).unwrap_or_default(),
        None => value.to_string(),
    }
}

/// Scoring platform (CTFd) connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    pub url: String,
    pub token: String,
    pub request_timeout_secs: u64,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            url: "${CTFD_URL}".to_string(),
            token: "${CTFD_TOKEN}".to_string(),
            request_timeout_secs: 15,
        }
    }
}

/// One configured agent tool
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Runner type passed to the sandbox entrypoint (defaults to the agent name)
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub instances: u32,
    /// Extra environment; `${VAR}` values resolve from the host
    pub env: IndexMap<String, String>,
    /// Image override for this agent
    pub image: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            kind: None,
            instances: 1,
            env: IndexMap::new(),
            image: None,
        }
    }
}

/// A runnable agent instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentSpec {
    pub name: String,
    pub kind: String,
    pub image: Option<String>,
    pub env: Vec<(String, String)>,
}

impl AgentSpec {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            kind: name.split('#').next().unwrap_or(&name).to_string(),
            name,
            image: None,
            env: Vec::new(),
        }
    }
}

/// Retry budget and timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub max_rounds: u32,
    /// Wall-clock budget per challenge across all rounds
    pub max_elapsed_secs: Option<u64>,
    pub agent_timeout_initial_secs: u64,
    pub agent_timeout_increment_secs: u64,
    pub agent_timeout_max_secs: u64,
    /// Extra time past the agent timeout before the round is force-closed
    pub round_grace_secs: u64,
    /// Challenges allowed in a running round at once
    pub max_concurrent_challenges: usize,
    /// Consecutive rounds without any candidate before giving up
    pub max_no_answer_rounds: u32,
    /// Times agents may converge again on a rejected answer before giving up
    pub max_duplicate_answers: u32,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_rounds: 5,
            max_elapsed_secs: None,
            agent_timeout_initial_secs: 300,
            agent_timeout_increment_secs: 120,
            agent_timeout_max_secs: 900,
            round_grace_secs: 60,
            max_concurrent_challenges: 2,
            max_no_answer_rounds: 3,
            max_duplicate_answers: 2,
        }
    }
}

impl ExecutionConfig {
    /// Agent timeout for a 1-based round: grows linearly, capped at the max
    pub fn agent_timeout(&self, round: u32) -> Duration {
        let extra = self
            .agent_timeout_increment_secs
            .saturating_mul(u64::from(round.saturating_sub(1)));
        let secs = self
            .agent_timeout_initial_secs
            .saturating_add(extra)
            .min(self.agent_timeout_max_secs);
        Duration::from_secs(secs)
    }

    /// Hard deadline for the whole round
    pub fn round_deadline(&self, round: u32) -> Duration {
        self.agent_timeout(round) + Duration::from_secs(self.round_grace_secs)
    }

    pub fn max_elapsed(&self) -> Option<Duration> {
        self.max_elapsed_secs.map(Duration::from_secs)
    }
}

/// What to do when a round has no strict majority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NoConsensusPolicy {
    /// Submit the tie-break answer
    #[default]
    SubmitFallback,
    /// Don't spend a submission; mark the tied answers rejected
    SkipSubmission,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct VotingConfig {
    /// Agents whose answer breaks ties, highest priority first
    pub priority_agents: Vec<String>,
    pub no_consensus: NoConsensusPolicy,
    /// Regex every candidate must match to count as a vote
    pub answer_pattern: Option<String>,
}

/// Backoff for submission and fetch retries
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SubmissionConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for SubmissionConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff_ms: 500,
            max_backoff_ms: 8_000,
        }
    }
}

impl SubmissionConfig {
    /// Delay before retry number `retry` (1-based), doubling each time
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u64 << retry.saturating_sub(1).min(16);
        Duration::from_millis(
            self.initial_backoff_ms
                .saturating_mul(factor)
                .min(self.max_backoff_ms),
        )
    }
}

/// Docker sandbox configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    /// Base image every agent runs in
    pub image: String,
    /// Directory holding the base image Dockerfile
    pub build_context: PathBuf,
    pub dockerfile: String,
    /// Memory limit (e.g., "4g")
    pub memory_limit: String,
    /// CPU limit (e.g., 2.0 = 2 CPUs)
    pub cpu_limit: f64,
    /// Network mode (none, bridge, host)
    pub network_mode: String,
    /// Command run in the container; empty uses the image entrypoint
    pub command: Vec<String>,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            image: "ctf-agent-base:latest".to_string(),
            build_context: PathBuf::from("agents/base"),
            dockerfile: "Dockerfile.base".to_string(),
            memory_limit: "4g".to_string(),
            cpu_limit: 2.0,
            // Agents call hosted LLM APIs
            network_mode: "bridge".to_string(),
            command: vec!["/bin/bash".to_string(), "/entrypoint.sh".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct HintConfig {
    pub allow_cost_hints: bool,
    pub max_cost: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub max_size_mb: u64,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self { max_size_mb: 100 }
    }
}

impl FileConfig {
    pub fn max_size_bytes(&self) -> u64 {
        self.max_size_mb.saturating_mul(1024 * 1024)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub challenges_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            challenges_dir: PathBuf::from("challenges"),
        }
    }
}

/// Parse memory limit string (e.g., "2g", "512m") to bytes
pub fn parse_memory_limit(limit: &str) -> Result<i64, ConfigError> {
    let limit = limit.trim().to_lowercase();
    let invalid = || ConfigError::Invalid(format!("invalid memory limit: {}", limit));

    let (num, mult) = if let Some(num) = limit.strip_suffix('g') {
        (num, 1024 * 1024 * 1024)
    } else if let Some(num) = limit.strip_suffix('m') {
        (num, 1024 * 1024)
    } else if let Some(num) = limit.strip_suffix('k') {
        (num, 1024)
    } else {
        (limit.as_str(), 1)
    };

    let n: i64 = num.parse().map_err(|_| invalid())?;
    n.checked_mul(mult).ok_or_else(invalid)
}
