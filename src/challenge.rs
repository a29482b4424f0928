//! Challenge, attempt and round records
//!
//! These are the types the orchestration core passes around and persists.
//! A challenge moves `pending -> running -> {solved | exhausted | error}`,
//! bouncing between `running` and `pending` across restarts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use crate::error::StateError;
use crate::platform::Verdict;
use crate::voting::{normalize_answer, Decision, TallyEntry};

/// Platform-assigned challenge identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChallengeId(pub u64);

impl fmt::Display for ChallengeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ChallengeId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(ChallengeId)
    }
}

/// Lifecycle status of a challenge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeStatus {
    #[default]
    Pending,
    Running,
    Solved,
    Exhausted,
    /// Permanent platform failure (bad credentials, unknown id)
    Error,
}

impl ChallengeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ChallengeStatus::Solved | ChallengeStatus::Exhausted | ChallengeStatus::Error
        )
    }

    /// Allowed lifecycle edges. Terminal states never move, except that an
    /// operator may explicitly re-queue an exhausted challenge.
    pub fn can_transition_to(&self, to: ChallengeStatus) -> bool {
        use ChallengeStatus::*;
        match (self, to) {
            (Pending, Running) | (Pending, Exhausted) | (Pending, Error) => true,
            (Running, _) => true,
            (Exhausted, Pending) => true,
            (a, b) => *a == b && !a.is_terminal(),
        }
    }
}

impl fmt::Display for ChallengeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChallengeStatus::Pending => "pending",
            ChallengeStatus::Running => "running",
            ChallengeStatus::Solved => "solved",
            ChallengeStatus::Exhausted => "exhausted",
            ChallengeStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Durable per-challenge lifecycle record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeState {
    pub id: ChallengeId,
    #[serde(default)]
    pub name: Option<String>,
    pub status: ChallengeStatus,
    /// Number of rounds started so far (the round in flight, if running)
    pub round: u32,
    /// Round count at which the current retry budget started
    #[serde(default)]
    pub budget_start: u32,
    pub accepted_answer: Option<String>,
    /// Consecutive rounds in which no agent produced a usable candidate
    #[serde(default)]
    pub no_answer_streak: u32,
    /// How often agents converged again on an already rejected answer
    #[serde(default)]
    pub repeat_counts: BTreeMap<String, u32>,
    /// Why the challenge ended in `exhausted` or `error`
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ChallengeState {
    pub fn new(id: ChallengeId) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: None,
            status: ChallengeStatus::Pending,
            round: 0,
            budget_start: 0,
            accepted_answer: None,
            no_answer_streak: 0,
            repeat_counts: BTreeMap::new(),
            reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `to`, rejecting edges the lifecycle does not allow
    pub fn transition(&mut self, to: ChallengeStatus) -> Result<(), StateError> {
        if !self.status.can_transition_to(to) {
            return Err(StateError::InvalidTransition {
                id: self.id.to_string(),
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        self.status = to;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Rounds played since the retry budget was last granted
    pub fn rounds_in_budget(&self) -> u32 {
        self.round.saturating_sub(self.budget_start)
    }

    /// Put an exhausted challenge back in the queue with a fresh budget.
    /// Round numbering and the rejected history carry on.
    pub fn requeue(&mut self) -> Result<(), StateError> {
        self.transition(ChallengeStatus::Pending)?;
        self.budget_start = self.round;
        self.no_answer_streak = 0;
        self.repeat_counts.clear();
        self.reason = None;
        Ok(())
    }
}

/// Challenge content fetched from the platform
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeData {
    pub id: ChallengeId,
    pub name: String,
    pub category: Option<String>,
    pub text: String,
    /// Hint metadata; content is resolved separately under the hint cost policy
    pub hints: Vec<HintRef>,
    /// Download locations of distributable files
    pub files: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HintRef {
    pub id: u64,
    pub cost: u64,
    /// Present when the platform already revealed it
    pub content: Option<String>,
}

/// Status of one distributable file after download
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileMetadata {
    pub filename: String,
    pub url: String,
    pub size: u64,
    pub status: String,
}

/// Terminal and in-flight states of an attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Running,
    Succeeded,
    TimedOut,
    Crashed,
}

impl AttemptStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, AttemptStatus::Running)
    }
}

impl fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AttemptStatus::Running => "running",
            AttemptStatus::Succeeded => "succeeded",
            AttemptStatus::TimedOut => "timed_out",
            AttemptStatus::Crashed => "crashed",
        };
        f.write_str(s)
    }
}

/// One agent's execution against one challenge within one round
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attempt {
    pub challenge_id: ChallengeId,
    pub round: u32,
    pub agent: String,
    pub status: AttemptStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Only present if the agent wrote one before its deadline
    pub answer: Option<String>,
    pub log_path: PathBuf,
    pub error: Option<String>,
}

impl Attempt {
    /// Candidate answer if this attempt may vote
    pub fn vote(&self) -> Option<&str> {
        if self.status != AttemptStatus::Succeeded {
            return None;
        }
        self.answer
            .as_deref()
            .map(str::trim)
            .filter(|a| !a.is_empty())
    }

    pub fn duration_secs(&self) -> f64 {
        self.ended_at
            .map(|end| (end - self.started_at).num_milliseconds() as f64 / 1000.0)
            .unwrap_or(0.0)
    }
}

/// An answer the platform judged wrong
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RejectedAnswer {
    pub answer: String,
    pub round: u32,
    pub agents: Vec<String>,
    /// Rejected without contacting the platform (no-consensus skip policy)
    #[serde(default)]
    pub unverified: bool,
    pub rejected_at: DateTime<Utc>,
}

/// Append-only history of wrong answers and failed-approach notes
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RejectedAnswerSet {
    entries: Vec<RejectedAnswer>,
    notes: Vec<String>,
}

impl RejectedAnswerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, answer: &str) -> bool {
        let needle = normalize_answer(answer);
        self.entries
            .iter()
            .any(|e| normalize_answer(&e.answer) == needle)
    }

    /// Returns false if an equivalent answer was already present
    pub fn insert(&mut self, entry: RejectedAnswer) -> bool {
        if self.contains(&entry.answer) {
            return false;
        }
        self.entries.push(entry);
        true
    }

    pub fn add_note(&mut self, note: impl Into<String>) {
        self.notes.push(note.into());
    }

    pub fn entries(&self) -> &[RejectedAnswer] {
        &self.entries
    }

    pub fn notes(&self) -> &[String] {
        &self.notes
    }

    pub fn answers(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.answer.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True if every answer of `other` is also in `self`
    pub fn is_superset_of(&self, other: &RejectedAnswerSet) -> bool {
        other.answers().all(|a| self.contains(a))
    }
}

/// What happened when the decided answer went to the platform
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionRecord {
    pub answer: String,
    /// Final verdict, absent if every try failed
    pub verdict: Option<Verdict>,
    pub tries: u32,
    /// Transport failures and `error` verdicts seen along the way
    pub errors: Vec<String>,
}

/// How a round ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum RoundOutcome {
    Solved,
    Rejected,
    /// Decided answer was already rejected in an earlier round
    Repeated,
    NoAnswer,
    /// Submission never got a verdict
    SubmissionFailed,
    PlatformError(String),
    Aborted,
}

/// Machine-readable record of one closed round
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundSummary {
    pub challenge_id: ChallengeId,
    pub round: u32,
    pub agent_timeout_secs: u64,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub attempts: Vec<Attempt>,
    pub tally: Vec<TallyEntry>,
    pub decision: Decision,
    pub submission: Option<SubmissionRecord>,
    pub outcome: RoundOutcome,
}
