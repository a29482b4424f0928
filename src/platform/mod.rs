//! Scoring platform gateway
//!
//! The orchestrator only needs to fetch challenge content and submit answers.
//! `CtfdClient` talks to a CTFd instance; tests plug in scripted gateways.

pub mod ctfd;
pub mod hints;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use tracing::warn;

use crate::challenge::{ChallengeData, ChallengeId};
use crate::config::SubmissionConfig;
use crate::error::PlatformError;

pub use ctfd::CtfdClient;
pub use hints::HintPolicy;

/// Platform judgment on a submitted answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "message")]
pub enum Verdict {
    Correct,
    Incorrect,
    AlreadySolved,
    /// Platform accepted the request but could not judge it (rate limit, paused)
    Error(String),
}

impl Verdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Verdict::Correct | Verdict::AlreadySolved)
    }
}

/// Entry in the platform's challenge listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeSummary {
    pub id: ChallengeId,
    pub name: String,
    pub category: Option<String>,
    pub solved: bool,
}

#[async_trait]
pub trait PlatformGateway: Send + Sync {
    /// All challenges visible to the team
    async fn list_challenges(&self) -> Result<Vec<ChallengeSummary>, PlatformError>;

    async fn fetch_challenge(&self, id: ChallengeId) -> Result<ChallengeData, PlatformError>;

    /// Reveal a hint's content, unlocking it if `unlock` is set
    async fn hint_content(&self, hint_id: u64, unlock: bool)
        -> Result<Option<String>, PlatformError>;

    async fn download_file(&self, url: &str) -> Result<Vec<u8>, PlatformError>;

    async fn submit_answer(&self, id: ChallengeId, answer: &str)
        -> Result<Verdict, PlatformError>;
}

/// Run `op` until it succeeds, fails permanently, or the retry budget runs out
pub async fn retry_transient<T, F, Fut>(
    policy: &SubmissionConfig,
    what: &str,
    mut op: F,
) -> Result<T, PlatformError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, PlatformError>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                let delay = policy.backoff(attempt);
                warn!(
                    "{} failed (attempt {}/{}): {}; retrying in {:?}",
                    what, attempt, policy.max_attempts, e, delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}
