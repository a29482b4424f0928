//! Error types for the orchestration engine

use thiserror::Error;

/// Failures talking to the scoring platform
#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("Challenge not found: {0}")]
    NotFound(String),

    /// Network or API failure worth retrying
    #[error("Transient platform error: {0}")]
    Transient(String),

    /// Bad credentials, malformed challenge id and the like. Retrying won't help.
    #[error("Permanent platform error: {0}")]
    Permanent(String),
}

impl PlatformError {
    pub fn is_transient(&self) -> bool {
        matches!(self, PlatformError::Transient(_))
    }
}

impl From<reqwest::Error> for PlatformError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return classify_status(status.as_u16(), err.to_string());
        }
        if err.is_decode() {
            return PlatformError::Permanent(err.to_string());
        }
        PlatformError::Transient(err.to_string())
    }
}

/// Map an HTTP status to the platform error taxonomy
pub fn classify_status(status: u16, message: String) -> PlatformError {
    match status {
        404 => PlatformError::NotFound(message),
        401 | 403 | 400 | 422 => PlatformError::Permanent(message),
        _ => PlatformError::Transient(message),
    }
}

/// Failures bringing up a sandbox
#[derive(Error, Debug)]
pub enum SandboxError {
    /// Container engine unreachable, image missing, create/start rejected
    #[error("Sandbox provisioning failed: {0}")]
    Provisioning(String),

    #[error("Sandbox I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<bollard::errors::Error> for SandboxError {
    fn from(err: bollard::errors::Error) -> Self {
        SandboxError::Provisioning(err.to_string())
    }
}

/// Failures reading or writing challenge lifecycle state
#[derive(Error, Debug)]
pub enum StateError {
    #[error("State I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("State serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid status transition for challenge {id}: {from} -> {to}")]
    InvalidTransition { id: String, from: String, to: String },
}

/// Configuration problems detected at startup
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}
