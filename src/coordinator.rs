//! Attempt coordinator
//!
//! Fans one round out to every enabled agent in parallel and collects the
//! attempts once each one is terminal. Admission is bounded globally: a
//! challenge holds an admission permit for the duration of its round.

use chrono::Utc;
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::challenge::{Attempt, AttemptStatus, ChallengeId};
use crate::config::AgentSpec;
use crate::sandbox::{AgentRunner, AttemptOutcome, SandboxRequest};
use crate::state::ChallengeLayout;
use crate::workspace::Workspace;

/// How long cancelled sandboxes get to tear down before their tasks are aborted
const DEFAULT_TEARDOWN_GRACE: Duration = Duration::from_secs(30);

const DEADLINE_REASON: &str = "round deadline";
const ABORT_REASON: &str = "aborted";

/// One round's worth of work for the coordinator
#[derive(Debug, Clone)]
pub struct RoundPlan {
    pub challenge_id: ChallengeId,
    pub round: u32,
    pub agents: Vec<AgentSpec>,
    pub agent_timeout: Duration,
    /// Hard deadline after which every unfinished attempt is cancelled
    pub deadline: Duration,
}

pub struct AttemptCoordinator {
    runner: Arc<dyn AgentRunner>,
    admission: Arc<Semaphore>,
    teardown_grace: Duration,
}

impl AttemptCoordinator {
    pub fn new(runner: Arc<dyn AgentRunner>, max_concurrent_challenges: usize) -> Self {
        Self {
            runner,
            admission: Arc::new(Semaphore::new(max_concurrent_challenges.max(1))),
            teardown_grace: DEFAULT_TEARDOWN_GRACE,
        }
    }

    pub fn with_teardown_grace(mut self, grace: Duration) -> Self {
        self.teardown_grace = grace;
        self
    }

    /// Run every agent of the plan and return one terminal attempt per agent,
    /// in plan order.
    ///
    /// Attempts still running at the deadline, or when `cancel` fires, are
    /// cancelled and recorded as `timed_out`.
    #[instrument(skip_all, fields(challenge = %plan.challenge_id, round = plan.round))]
    pub async fn run_round(
        &self,
        plan: &RoundPlan,
        layout: &ChallengeLayout,
        cancel: &CancellationToken,
    ) -> Vec<Attempt> {
        let _permit = tokio::select! {
            permit = self.admission.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return unfinished(plan, layout, ABORT_REASON, HashMap::new()),
            },
            _ = cancel.cancelled() => {
                return unfinished(plan, layout, ABORT_REASON, HashMap::new());
            }
        };
        info!(
            "Round {} of challenge {}: {} agents, timeout {}s",
            plan.round,
            plan.challenge_id,
            plan.agents.len(),
            plan.agent_timeout.as_secs()
        );

        let round_cancel = cancel.child_token();
        let mut tasks = JoinSet::new();
        for agent in &plan.agents {
            tasks.spawn(run_attempt(
                self.runner.clone(),
                layout.clone(),
                plan.challenge_id,
                plan.round,
                agent.clone(),
                plan.agent_timeout,
                round_cancel.clone(),
            ));
        }

        let mut finished = HashMap::new();
        let reason = tokio::select! {
            _ = drain(&mut tasks, &mut finished, None) => None,
            _ = tokio::time::sleep(plan.deadline) => Some(DEADLINE_REASON),
            _ = cancel.cancelled() => Some(ABORT_REASON),
        };

        if let Some(reason) = reason {
            warn!(
                "Challenge {} round {}: {}, cancelling {} running attempts",
                plan.challenge_id,
                plan.round,
                reason,
                tasks.len()
            );
            round_cancel.cancel();
            let torn_down = tokio::time::timeout(
                self.teardown_grace,
                drain(&mut tasks, &mut finished, Some(reason)),
            )
            .await;
            if torn_down.is_err() {
                warn!("{} attempts ignored cancellation, aborting", tasks.len());
                tasks.abort_all();
                while tasks.join_next().await.is_some() {}
            }
            return unfinished(plan, layout, reason, finished);
        }

        unfinished(plan, layout, ABORT_REASON, finished)
    }
}

/// Collect finished attempts until the set is empty.
///
/// Attempts that come back `timed_out` after the round was cut short carry
/// `reason` as their error.
async fn drain(
    tasks: &mut JoinSet<Attempt>,
    finished: &mut HashMap<String, Attempt>,
    reason: Option<&str>,
) {
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(mut attempt) => {
                if let Some(reason) = reason {
                    if attempt.status == AttemptStatus::TimedOut {
                        attempt.error = Some(reason.to_string());
                    }
                }
                debug!("Attempt {} finished: {}", attempt.agent, attempt.status);
                finished.insert(attempt.agent.clone(), attempt);
            }
            Err(e) => warn!("Attempt task failed to join: {}", e),
        }
    }
}

/// Plan-ordered snapshot; agents without a result are recorded as timed out
fn unfinished(
    plan: &RoundPlan,
    layout: &ChallengeLayout,
    reason: &str,
    mut finished: HashMap<String, Attempt>,
) -> Vec<Attempt> {
    let now = Utc::now();
    plan.agents
        .iter()
        .map(|agent| {
            finished.remove(&agent.name).unwrap_or_else(|| Attempt {
                challenge_id: plan.challenge_id,
                round: plan.round,
                agent: agent.name.clone(),
                status: AttemptStatus::TimedOut,
                started_at: now,
                ended_at: Some(now),
                answer: None,
                log_path: log_path(layout, &agent.name),
                error: Some(reason.to_string()),
            })
        })
        .collect()
}

fn log_path(layout: &ChallengeLayout, agent: &str) -> std::path::PathBuf {
    layout.latest_logs().join(format!("{}.log", agent))
}

async fn run_attempt(
    runner: Arc<dyn AgentRunner>,
    layout: ChallengeLayout,
    challenge_id: ChallengeId,
    round: u32,
    agent: AgentSpec,
    timeout: Duration,
    cancel: CancellationToken,
) -> Attempt {
    let started_at = Utc::now();
    let log_path = log_path(&layout, &agent.name);

    let prep_layout = layout.clone();
    let prep_agent = agent.name.clone();
    let prepared =
        tokio::task::spawn_blocking(move || Workspace::prepare(&prep_layout, &prep_agent)).await;

    let outcome = match prepared {
        Ok(Ok(workspace)) => {
            let request = SandboxRequest {
                challenge_id,
                round,
                agent: agent.clone(),
                workspace: workspace.path().to_path_buf(),
                log_path: log_path.clone(),
                timeout,
            };
            let outcome = AssertUnwindSafe(runner.run(request, cancel))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| AttemptOutcome::crashed("agent runner panicked"));
            tokio::task::spawn_blocking(move || drop(workspace));
            outcome
        }
        Ok(Err(e)) => AttemptOutcome::crashed(format!("workspace preparation failed: {}", e)),
        Err(e) => AttemptOutcome::crashed(format!("workspace preparation failed: {}", e)),
    };

    let answer = match outcome.status {
        AttemptStatus::Succeeded => outcome.answer,
        _ => None,
    };
    Attempt {
        challenge_id,
        round,
        agent: agent.name,
        status: outcome.status,
        started_at,
        ended_at: Some(Utc::now()),
        answer,
        log_path,
        error: outcome.error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tempfile::TempDir;

    enum Behavior {
        Answer(&'static str, u64),
        /// Waits for cancellation, then reports it
        Hang,
        /// Never returns, even when cancelled
        Stuck,
        Panic,
    }

    struct SetOnDrop(Arc<AtomicBool>);

    impl Drop for SetOnDrop {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    struct ScriptedRunner {
        behaviors: HashMap<String, Behavior>,
        running: AtomicUsize,
        peak: AtomicUsize,
        released: Arc<AtomicBool>,
    }

    impl ScriptedRunner {
        fn new(behaviors: Vec<(&str, Behavior)>) -> Arc<Self> {
            Arc::new(Self {
                behaviors: behaviors
                    .into_iter()
                    .map(|(n, b)| (n.to_string(), b))
                    .collect(),
                running: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                released: Arc::new(AtomicBool::new(false)),
            })
        }
    }

    #[async_trait]
    impl AgentRunner for ScriptedRunner {
        async fn run(&self, request: SandboxRequest, cancel: CancellationToken) -> AttemptOutcome {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let outcome = match &self.behaviors[&request.agent.name] {
                Behavior::Answer(answer, delay_ms) => {
                    tokio::time::sleep(Duration::from_millis(*delay_ms)).await;
                    AttemptOutcome::succeeded(Some(answer.to_string()))
                }
                Behavior::Hang => {
                    cancel.cancelled().await;
                    AttemptOutcome::timed_out("cancelled")
                }
                Behavior::Stuck => {
                    let _guard = SetOnDrop(self.released.clone());
                    futures::future::pending::<()>().await;
                    unreachable!()
                }
                Behavior::Panic => panic!("runner blew up"),
            };
            self.running.fetch_sub(1, Ordering::SeqCst);
            outcome
        }
    }

    fn plan(agents: &[&str], deadline_ms: u64) -> RoundPlan {
        RoundPlan {
            challenge_id: ChallengeId(1),
            round: 1,
            agents: agents.iter().map(|a| AgentSpec::new(*a)).collect(),
            agent_timeout: Duration::from_millis(deadline_ms),
            deadline: Duration::from_millis(deadline_ms),
        }
    }

    fn layout() -> (TempDir, ChallengeLayout) {
        let dir = TempDir::new().unwrap();
        let layout = ChallengeLayout::new(dir.path(), ChallengeId(1));
        layout.ensure().unwrap();
        (dir, layout)
    }

    #[tokio::test]
    async fn test_round_collects_all_agents_in_plan_order() {
        let (_dir, layout) = layout();
        let runner = ScriptedRunner::new(vec![
            ("a", Behavior::Answer("flag{1}", 30)),
            ("b", Behavior::Answer("flag{2}", 1)),
            ("c", Behavior::Answer("flag{1}", 10)),
        ]);
        let coord = AttemptCoordinator::new(runner.clone(), 2);

        let attempts = coord
            .run_round(&plan(&["a", "b", "c"], 5_000), &layout, &CancellationToken::new())
            .await;

        let names: Vec<_> = attempts.iter().map(|a| a.agent.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert!(attempts.iter().all(|a| a.status == AttemptStatus::Succeeded));
        assert_eq!(attempts[1].answer.as_deref(), Some("flag{2}"));
        assert_eq!(runner.peak.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_deadline_cancels_hanging_attempts() {
        let (_dir, layout) = layout();
        let runner = ScriptedRunner::new(vec![
            ("fast", Behavior::Answer("flag{x}", 1)),
            ("slow", Behavior::Hang),
        ]);
        let coord = AttemptCoordinator::new(runner, 1);

        let attempts = coord
            .run_round(&plan(&["fast", "slow"], 100), &layout, &CancellationToken::new())
            .await;

        assert_eq!(attempts[0].status, AttemptStatus::Succeeded);
        assert_eq!(attempts[1].status, AttemptStatus::TimedOut);
        assert_eq!(attempts[1].answer, None);
        assert_eq!(attempts[1].error.as_deref(), Some("round deadline"));
    }

    #[tokio::test]
    async fn test_stuck_attempt_is_aborted_after_grace() {
        let (_dir, layout) = layout();
        let runner = ScriptedRunner::new(vec![("stuck", Behavior::Stuck)]);
        let coord = AttemptCoordinator::new(runner.clone(), 1)
            .with_teardown_grace(Duration::from_millis(50));

        let attempts = coord
            .run_round(&plan(&["stuck"], 50), &layout, &CancellationToken::new())
            .await;

        assert_eq!(attempts[0].status, AttemptStatus::TimedOut);
        assert!(runner.released.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_panicking_runner_is_crashed() {
        let (_dir, layout) = layout();
        let runner = ScriptedRunner::new(vec![
            ("boom", Behavior::Panic),
            ("ok", Behavior::Answer("flag{ok}", 1)),
        ]);
        let coord = AttemptCoordinator::new(runner, 1);

        let attempts = coord
            .run_round(&plan(&["boom", "ok"], 5_000), &layout, &CancellationToken::new())
            .await;

        assert_eq!(attempts[0].status, AttemptStatus::Crashed);
        assert_eq!(attempts[1].status, AttemptStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_external_abort() {
        let (_dir, layout) = layout();
        let runner = ScriptedRunner::new(vec![("a", Behavior::Hang), ("b", Behavior::Hang)]);
        let coord = AttemptCoordinator::new(runner, 1);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let attempts = coord
            .run_round(&plan(&["a", "b"], 60_000), &layout, &cancel)
            .await;

        assert!(attempts
            .iter()
            .all(|a| a.status == AttemptStatus::TimedOut && a.error.as_deref() == Some("aborted")));
    }

    #[tokio::test]
    async fn test_admission_bounds_concurrent_rounds() {
        let (_dir, layout) = layout();
        let runner = ScriptedRunner::new(vec![("solo", Behavior::Answer("flag{s}", 50))]);
        let coord = Arc::new(AttemptCoordinator::new(runner.clone(), 1));

        let rounds = (0..3).map(|_| {
            let coord = coord.clone();
            let layout = layout.clone();
            async move {
                coord
                    .run_round(&plan(&["solo"], 5_000), &layout, &CancellationToken::new())
                    .await
            }
        });
        let results = futures::future::join_all(rounds).await;

        assert!(results.iter().all(|r| r[0].status == AttemptStatus::Succeeded));
        assert_eq!(runner.peak.load(Ordering::SeqCst), 1);
    }
}
