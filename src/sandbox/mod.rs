//! Agent sandboxes
//!
//! An `AgentRunner` executes one agent against one prepared workspace and
//! reports how it ended. The Docker implementation lives in [`docker`];
//! tests substitute scripted runners.

pub mod docker;

use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::challenge::{AttemptStatus, ChallengeId};
use crate::config::AgentSpec;

pub use docker::{build_base_image, DockerSandbox};

/// Everything a runner needs for one attempt
#[derive(Debug, Clone)]
pub struct SandboxRequest {
    pub challenge_id: ChallengeId,
    pub round: u32,
    pub agent: AgentSpec,
    /// Host directory holding `challenge/ scratch/ shared/ output/`
    pub workspace: PathBuf,
    /// Where the agent's stdout/stderr go
    pub log_path: PathBuf,
    pub timeout: Duration,
}

/// How an attempt ended, as seen by the runner
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptOutcome {
    pub status: AttemptStatus,
    pub answer: Option<String>,
    pub error: Option<String>,
}

impl AttemptOutcome {
    pub fn succeeded(answer: Option<String>) -> Self {
        Self {
            status: AttemptStatus::Succeeded,
            answer,
            error: None,
        }
    }

    pub fn timed_out(reason: impl Into<String>) -> Self {
        Self {
            status: AttemptStatus::TimedOut,
            answer: None,
            error: Some(reason.into()),
        }
    }

    pub fn crashed(error: impl Into<String>) -> Self {
        Self {
            status: AttemptStatus::Crashed,
            answer: None,
            error: Some(error.into()),
        }
    }

    /// Classify a finished process.
    ///
    /// An answer written before a normal exit counts even if the exit code
    /// is non-zero; without one a non-zero exit is a crash.
    pub fn from_exit(exit_code: i64, answer: Option<String>) -> Self {
        match (exit_code, answer) {
            (_, Some(answer)) => Self::succeeded(Some(answer)),
            (0, None) => Self::succeeded(None),
            (code, None) => Self::crashed(format!("agent exited with code {}", code)),
        }
    }
}

#[async_trait]
pub trait AgentRunner: Send + Sync {
    /// Run the attempt to completion, timeout, or cancellation.
    ///
    /// Must release every resource it created before returning, and must
    /// return promptly once `cancel` fires.
    async fn run(&self, request: SandboxRequest, cancel: CancellationToken) -> AttemptOutcome;
}
