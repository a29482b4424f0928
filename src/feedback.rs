//! Retry/feedback loop
//!
//! Drives one challenge through rounds until it is solved, the budget runs
//! out, or the platform fails permanently:
//!
//! ```text
//! pending -> running: round k
//!     run agents -> vote -> submit
//!     correct / already_solved      -> solved
//!     incorrect / no answer         -> rejected set grows, round k+1
//!     budget spent or heuristics    -> exhausted
//!     permanent platform failure    -> error
//! ```
//!
//! The rejected answer set is only written here, after the round's attempts
//! have all terminated, so round k+1 sees every answer rejected in rounds <= k.

use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::challenge::{
    ChallengeId, ChallengeState, ChallengeStatus, RejectedAnswer, RejectedAnswerSet,
    RoundOutcome, RoundSummary, SubmissionRecord,
};
use crate::config::{AgentSpec, Config, NoConsensusPolicy};
use crate::coordinator::{AttemptCoordinator, RoundPlan};
use crate::error::{ConfigError, PlatformError, StateError};
use crate::platform::{PlatformGateway, Verdict};
use crate::state::ChallengeStore;
use crate::voting::{normalize_answer, Decision, VoteTally, VotingEngine};

pub struct ChallengeSolver {
    config: Arc<Config>,
    gateway: Arc<dyn PlatformGateway>,
    store: Arc<dyn ChallengeStore>,
    coordinator: Arc<AttemptCoordinator>,
    voting: VotingEngine,
    agents: Vec<AgentSpec>,
}

/// Answer picked for submission, with the agents that proposed it
struct Choice {
    answer: String,
    agents: Vec<String>,
}

impl ChallengeSolver {
    pub fn new(
        config: Arc<Config>,
        gateway: Arc<dyn PlatformGateway>,
        store: Arc<dyn ChallengeStore>,
        coordinator: Arc<AttemptCoordinator>,
    ) -> Result<Self, ConfigError> {
        let voting = VotingEngine::from_config(&config.voting)?;
        let agents = config.enabled_agents();
        Ok(Self {
            config,
            gateway,
            store,
            coordinator,
            voting,
            agents,
        })
    }

    /// Run rounds until the challenge reaches a terminal status or `cancel`
    /// fires. Returns the last persisted state.
    #[instrument(skip(self, cancel), fields(challenge = %id))]
    pub async fn solve(
        &self,
        id: ChallengeId,
        cancel: &CancellationToken,
    ) -> Result<ChallengeState, StateError> {
        let started = Instant::now();
        let mut state = self.store.load(id)?;
        if state.status.is_terminal() {
            debug!("Challenge {} already {}", id, state.status);
            return Ok(state);
        }

        loop {
            if cancel.is_cancelled() {
                return self.pause(id);
            }

            let exec = &self.config.execution;
            if state.rounds_in_budget() >= exec.max_rounds {
                return self.finish_exhausted(
                    id,
                    format!("{} rounds used", state.rounds_in_budget()),
                );
            }
            if let Some(limit) = exec.max_elapsed() {
                if started.elapsed() >= limit {
                    return self.finish_exhausted(
                        id,
                        format!("time budget of {}s spent", limit.as_secs()),
                    );
                }
            }

            state = self.store.update(id, &mut |s| {
                s.transition(ChallengeStatus::Running)?;
                s.round += 1;
                s.reason = None;
                Ok(())
            })?;

            let outcome = self.play_round(id, state.round, cancel).await?;
            state = self.store.load(id)?;
            match outcome {
                RoundOutcome::Aborted => return self.pause(id),
                _ if state.status.is_terminal() => return Ok(state),
                _ => {}
            }
        }
    }

    /// Leave the challenge resumable
    fn pause(&self, id: ChallengeId) -> Result<ChallengeState, StateError> {
        let state = self.store.load(id)?;
        if state.status == ChallengeStatus::Running {
            info!("Challenge {} paused after round {}", id, state.round);
            return self.store.transition(id, ChallengeStatus::Pending);
        }
        Ok(state)
    }

    fn finish_exhausted(
        &self,
        id: ChallengeId,
        reason: String,
    ) -> Result<ChallengeState, StateError> {
        warn!("Challenge {} exhausted: {}", id, reason);
        self.store.update(id, &mut |s| {
            s.transition(ChallengeStatus::Exhausted)?;
            s.reason = Some(reason.clone());
            Ok(())
        })
    }

    async fn play_round(
        &self,
        id: ChallengeId,
        round: u32,
        cancel: &CancellationToken,
    ) -> Result<RoundOutcome, StateError> {
        let layout = self.store.layout(id);
        let rejected = self.store.rejected(id)?;
        layout.ensure()?;
        layout.write_shared_context(&rejected)?;
        layout.rotate_logs(round.saturating_sub(1))?;

        let exec = &self.config.execution;
        let plan = RoundPlan {
            challenge_id: id,
            round,
            agents: self.agents.clone(),
            agent_timeout: exec.agent_timeout(round),
            deadline: exec.round_deadline(round),
        };

        let started_at = Utc::now();
        let attempts = self.coordinator.run_round(&plan, &layout, cancel).await;
        for attempt in &attempts {
            if let Some(answer) = &attempt.answer {
                if let Err(e) = layout.save_agent_answer(&attempt.agent, answer) {
                    warn!("Failed to save answer of {}: {}", attempt.agent, e);
                }
            }
        }

        let (tally, decision) = self.voting.vote(&attempts, &rejected);
        let mut summary = RoundSummary {
            challenge_id: id,
            round,
            agent_timeout_secs: plan.agent_timeout.as_secs(),
            started_at,
            ended_at: Utc::now(),
            attempts,
            tally: tally.entries().to_vec(),
            decision: decision.clone(),
            submission: None,
            outcome: RoundOutcome::Aborted,
        };

        if cancel.is_cancelled() {
            self.store.save_round(&summary)?;
            return Ok(RoundOutcome::Aborted);
        }

        let choice = self.choose(id, round, &tally, &decision)?;
        let outcome = match &choice {
            None if tally.is_empty() => RoundOutcome::NoAnswer,
            // Tied answers were recorded as rejected without a submission
            None => RoundOutcome::Rejected,
            Some(choice) if rejected.contains(&choice.answer) => {
                info!(
                    "Challenge {} round {}: '{}' was already rejected, not resubmitting",
                    id, round, choice.answer
                );
                RoundOutcome::Repeated
            }
            Some(choice) => {
                let (record, fatal) = self.submit_with_backoff(id, &choice.answer).await;
                let outcome = match (&record.verdict, fatal) {
                    (_, Some(e)) => RoundOutcome::PlatformError(e.to_string()),
                    (Some(v), None) if v.is_accepted() => RoundOutcome::Solved,
                    (Some(Verdict::Incorrect), None) => {
                        self.record_rejection(id, round, choice, false, &rejected)?;
                        RoundOutcome::Rejected
                    }
                    _ => RoundOutcome::SubmissionFailed,
                };
                summary.submission = Some(record);
                outcome
            }
        };

        summary.outcome = outcome.clone();
        summary.ended_at = Utc::now();
        self.apply(id, round, &summary, choice.as_ref())?;
        Ok(outcome)
    }

    /// Turn the vote into something to submit, following the no-consensus policy
    fn choose(
        &self,
        id: ChallengeId,
        round: u32,
        tally: &VoteTally,
        decision: &Decision,
    ) -> Result<Option<Choice>, StateError> {
        match decision {
            Decision::Consensus { answer, agents } => Ok(Some(Choice {
                answer: answer.clone(),
                agents: agents.clone(),
            })),
            Decision::NoConsensus { fallback: None, .. } => Ok(None),
            Decision::NoConsensus {
                fallback: Some(fallback),
                tied,
            } => match self.config.voting.no_consensus {
                NoConsensusPolicy::SubmitFallback => Ok(Some(Choice {
                    answer: fallback.answer.clone(),
                    agents: supporters(tally, &fallback.answer),
                })),
                NoConsensusPolicy::SkipSubmission => {
                    let rejected = self.store.rejected(id)?;
                    for answer in tied {
                        let choice = Choice {
                            answer: answer.clone(),
                            agents: supporters(tally, answer),
                        };
                        self.record_rejection(id, round, &choice, true, &rejected)?;
                    }
                    Ok(None)
                }
            },
        }
    }

    fn record_rejection(
        &self,
        id: ChallengeId,
        round: u32,
        choice: &Choice,
        unverified: bool,
        known: &RejectedAnswerSet,
    ) -> Result<(), StateError> {
        if known.contains(&choice.answer) {
            return Ok(());
        }
        let added = self.store.append_rejected(
            id,
            RejectedAnswer {
                answer: choice.answer.clone(),
                round,
                agents: choice.agents.clone(),
                unverified,
                rejected_at: Utc::now(),
            },
        )?;
        if added {
            let how = if unverified {
                "tied without consensus"
            } else {
                "rejected by the platform"
            };
            self.store.append_note(
                id,
                &format!(
                    "[round {}] {} proposed '{}': {}",
                    round,
                    choice.agents.join(", "),
                    choice.answer,
                    how
                ),
            )?;
        }
        Ok(())
    }

    /// Submit with bounded exponential backoff.
    ///
    /// Transport failures and `error` verdicts are retried; the second value
    /// is set when the platform failed permanently.
    async fn submit_with_backoff(
        &self,
        id: ChallengeId,
        answer: &str,
    ) -> (SubmissionRecord, Option<PlatformError>) {
        let policy = &self.config.submission;
        let mut record = SubmissionRecord {
            answer: answer.to_string(),
            verdict: None,
            tries: 0,
            errors: Vec::new(),
        };

        for attempt in 1..=policy.max_attempts {
            record.tries = attempt;
            info!("Submitting '{}' for challenge {} (try {})", answer, id, attempt);
            match self.gateway.submit_answer(id, answer).await {
                Ok(Verdict::Error(msg)) => {
                    warn!("Platform could not judge submission: {}", msg);
                    record.errors.push(msg);
                }
                Ok(verdict) => {
                    record.verdict = Some(verdict);
                    return (record, None);
                }
                Err(e) if e.is_transient() => {
                    warn!("Submission failed: {}", e);
                    record.errors.push(e.to_string());
                }
                Err(e) => {
                    warn!("Submission failed permanently: {}", e);
                    record.errors.push(e.to_string());
                    return (record, Some(e));
                }
            }
            if attempt < policy.max_attempts {
                tokio::time::sleep(policy.backoff(attempt)).await;
            }
        }

        warn!(
            "Giving up on submission for challenge {} after {} tries",
            id, record.tries
        );
        (record, None)
    }

    /// Persist the round summary, then move the lifecycle forward
    fn apply(
        &self,
        id: ChallengeId,
        round: u32,
        summary: &RoundSummary,
        choice: Option<&Choice>,
    ) -> Result<(), StateError> {
        self.store.save_round(summary)?;

        let exec = &self.config.execution;
        let outcome = &summary.outcome;
        let candidates = summary.tally.len();

        self.store.update(id, &mut |s| {
            if candidates == 0 {
                s.no_answer_streak += 1;
            } else {
                s.no_answer_streak = 0;
            }

            match outcome {
                RoundOutcome::Solved => {
                    if let Some(choice) = choice {
                        s.accepted_answer = Some(choice.answer.clone());
                    }
                    s.transition(ChallengeStatus::Solved)?;
                    return Ok(());
                }
                RoundOutcome::PlatformError(msg) => {
                    s.reason = Some(msg.clone());
                    return s.transition(ChallengeStatus::Error);
                }
                RoundOutcome::Rejected | RoundOutcome::Repeated => {
                    if let Some(choice) = choice {
                        let count = s
                            .repeat_counts
                            .entry(normalize_answer(&choice.answer))
                            .or_insert(0);
                        *count += 1;
                        if exec.max_duplicate_answers > 0 && *count >= exec.max_duplicate_answers {
                            s.reason = Some(format!(
                                "agents converged {} times on rejected answer '{}'",
                                count, choice.answer
                            ));
                            return s.transition(ChallengeStatus::Exhausted);
                        }
                    }
                }
                _ => {}
            }

            if exec.max_no_answer_rounds > 0 && s.no_answer_streak >= exec.max_no_answer_rounds {
                s.reason = Some(format!(
                    "no candidate answer in {} consecutive rounds",
                    s.no_answer_streak
                ));
                return s.transition(ChallengeStatus::Exhausted);
            }
            Ok(())
        })?;

        match outcome {
            RoundOutcome::Solved => info!("Challenge {} solved in round {}", id, round),
            other => info!("Challenge {} round {} closed: {:?}", id, round, other),
        }
        Ok(())
    }
}

/// Agents whose vote went to `answer`
fn supporters(tally: &VoteTally, answer: &str) -> Vec<String> {
    let wanted = normalize_answer(answer);
    tally
        .entries()
        .iter()
        .find(|e| e.normalized == wanted)
        .map(|e| e.agents.iter().cloned().collect())
        .unwrap_or_default()
}
