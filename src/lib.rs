//! CTF Swarm
//!
//! Runs several AI agents against a CTF challenge in parallel sandboxes,
//! takes a majority vote over their answers, submits the winner to the
//! scoring platform and repeats with the rejected answers fed back until the
//! challenge is solved or the retry budget runs out.
//!
//! ## Module Structure
//!
//! - `config`: YAML configuration, read once at startup
//! - `challenge`: challenge, attempt and round records
//! - `platform/`: scoring platform gateway (CTFd) and hint policy
//! - `sandbox/`: agent runners (Docker)
//! - `workspace`: per-attempt mount directories
//! - `coordinator`: parallel attempts within one round
//! - `voting`: answer normalization and majority vote
//! - `feedback`: round loop with rejected-answer feedback
//! - `state`: durable per-challenge lifecycle state
//! - `orchestrator`: challenge selection, preparation and fan-out

/// Challenge, attempt and round records
pub mod challenge;

/// Orchestrator configuration
pub mod config;

/// Error types
pub mod error;

/// Scoring platform gateway
pub mod platform;

/// Agent sandboxes
pub mod sandbox;

pub mod workspace;

/// Parallel attempts within a round
pub mod coordinator;

/// Majority vote over candidate answers
pub mod voting;

/// Retry/feedback loop
pub mod feedback;

/// Durable challenge state
pub mod state;

pub mod prompt;

/// Challenge selection and fan-out
pub mod orchestrator;

pub use challenge::{
    Attempt, AttemptStatus, ChallengeData, ChallengeId, ChallengeState, ChallengeStatus,
    RejectedAnswer, RejectedAnswerSet, RoundOutcome, RoundSummary,
};
pub use config::{AgentSpec, Config, NoConsensusPolicy};
pub use coordinator::{AttemptCoordinator, RoundPlan};
pub use error::{ConfigError, PlatformError, SandboxError, StateError};
pub use feedback::ChallengeSolver;
pub use orchestrator::{ChallengeOutcome, Orchestrator, RunReport};
pub use platform::{CtfdClient, PlatformGateway, Verdict};
pub use sandbox::{AgentRunner, AttemptOutcome, DockerSandbox, SandboxRequest};
pub use state::{ChallengeLayout, ChallengeStore, FileChallengeStore};
pub use voting::{Decision, VotingEngine};
