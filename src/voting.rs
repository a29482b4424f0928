//! Answer collection and majority voting
//!
//! Each round's terminal attempts are reduced to a single decision:
//! 1. attempts without a usable candidate abstain
//! 2. candidates are grouped by normalized form, one vote per distinct agent
//! 3. a group with strictly more votes than every other group wins
//! 4. otherwise the round has no consensus and a deterministic fallback is
//!    picked from the priority agent list, or the smallest tied answer

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::{debug, info};

use crate::challenge::{Attempt, RejectedAnswerSet};
use crate::config::VotingConfig;
use crate::error::ConfigError;

/// Strings agents copy from their instructions instead of finding a real answer
static PLACEHOLDERS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "flag{...}",
        "ctf{...}",
        "flag{flag}",
        "flag{example_flag_123}",
        "your_flag_here",
        "discovered_flag",
        "<flag>",
        "none",
        "n/a",
    ]
    .into_iter()
    .collect()
});

/// Whitespace and casing neutral comparison key
pub fn normalize_answer(answer: &str) -> String {
    answer
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Agent instances are named `base#n`; priority lists may use either form
fn base_name(agent: &str) -> &str {
    agent.split('#').next().unwrap_or(agent)
}

/// One group of equivalent answers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TallyEntry {
    pub normalized: String,
    /// Representative spelling submitted to the platform
    pub answer: String,
    pub agents: BTreeSet<String>,
}

impl TallyEntry {
    pub fn votes(&self) -> usize {
        self.agents.len()
    }
}

/// Votes per normalized answer, ranked by vote count then answer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteTally {
    entries: Vec<TallyEntry>,
}

impl VoteTally {
    pub fn entries(&self) -> &[TallyEntry] {
        &self.entries
    }

    pub fn total_votes(&self) -> usize {
        self.entries.iter().map(TallyEntry::votes).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Groups sharing the highest vote count
    pub fn leaders(&self) -> &[TallyEntry] {
        let Some(top) = self.entries.first().map(TallyEntry::votes) else {
            return &[];
        };
        let n = self.entries.iter().take_while(|e| e.votes() == top).count();
        &self.entries[..n]
    }

    pub fn into_entries(self) -> Vec<TallyEntry> {
        self.entries
    }
}

/// Tie-break answer used when no group wins outright
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fallback {
    pub answer: String,
    /// Priority agent that proposed it, if the priority list decided
    pub agent: Option<String>,
}

/// Result of voting on one round
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Decision {
    Consensus {
        answer: String,
        agents: Vec<String>,
    },
    NoConsensus {
        /// Leading answers sharing the top vote count
        tied: Vec<String>,
        fallback: Option<Fallback>,
    },
}

impl Decision {
    pub fn is_consensus(&self) -> bool {
        matches!(self, Decision::Consensus { .. })
    }
}

/// Rejects candidates that cannot be real answers
#[derive(Debug, Clone, Default)]
pub struct AnswerFilter {
    pattern: Option<Regex>,
}

impl AnswerFilter {
    pub fn new(pattern: Option<&str>) -> Result<Self, ConfigError> {
        let pattern = pattern
            .map(Regex::new)
            .transpose()
            .map_err(|e| ConfigError::Invalid(format!("answer_pattern: {}", e)))?;
        Ok(Self { pattern })
    }

    pub fn accepts(&self, answer: &str) -> bool {
        let answer = answer.trim();
        if answer.is_empty() || PLACEHOLDERS.contains(answer.to_lowercase().as_str()) {
            return false;
        }
        self.pattern.as_ref().map_or(true, |re| re.is_match(answer))
    }
}

/// Deterministic majority vote over a round's attempts
#[derive(Debug, Clone, Default)]
pub struct VotingEngine {
    priority_agents: Vec<String>,
    filter: AnswerFilter,
}

impl VotingEngine {
    pub fn new(priority_agents: Vec<String>, filter: AnswerFilter) -> Self {
        Self {
            priority_agents,
            filter,
        }
    }

    pub fn from_config(config: &VotingConfig) -> Result<Self, ConfigError> {
        Ok(Self::new(
            config.priority_agents.clone(),
            AnswerFilter::new(config.answer_pattern.as_deref())?,
        ))
    }

    /// Candidate per agent after dropping abstentions and filtered answers.
    /// An agent appearing twice keeps its first usable answer.
    fn candidates<'a>(&self, attempts: &'a [Attempt]) -> BTreeMap<&'a str, &'a str> {
        let mut by_agent = BTreeMap::new();
        for attempt in attempts {
            let Some(answer) = attempt.vote() else {
                continue;
            };
            if !self.filter.accepts(answer) {
                debug!("Discarding candidate from {}: {:?}", attempt.agent, answer);
                continue;
            }
            by_agent.entry(attempt.agent.as_str()).or_insert(answer);
        }
        by_agent
    }

    pub fn tally(&self, attempts: &[Attempt]) -> VoteTally {
        // normalized -> (agents, spelling -> count)
        let mut groups: BTreeMap<String, (BTreeSet<String>, BTreeMap<&str, usize>)> =
            BTreeMap::new();

        for (agent, answer) in self.candidates(attempts) {
            let (agents, spellings) = groups.entry(normalize_answer(answer)).or_default();
            agents.insert(agent.to_string());
            *spellings.entry(answer).or_default() += 1;
        }

        let mut entries: Vec<TallyEntry> = groups
            .into_iter()
            .map(|(normalized, (agents, spellings))| {
                // Most common spelling, smallest on ties (BTreeMap iterates sorted)
                let answer = spellings
                    .iter()
                    .fold(None::<(&str, usize)>, |best, (s, c)| match best {
                        Some((_, bc)) if bc >= *c => best,
                        _ => Some((*s, *c)),
                    })
                    .map(|(s, _)| s.to_string())
                    .unwrap_or_else(|| normalized.clone());
                TallyEntry {
                    normalized,
                    answer,
                    agents,
                }
            })
            .collect();

        entries.sort_by(|a, b| {
            b.votes()
                .cmp(&a.votes())
                .then_with(|| a.normalized.cmp(&b.normalized))
        });

        VoteTally { entries }
    }

    /// Decide on a tally. A strict winner is returned even if it was
    /// rejected before; tie-breaks prefer answers not yet in `rejected`.
    pub fn decide(&self, tally: &VoteTally, rejected: &RejectedAnswerSet) -> Decision {
        let leaders = tally.leaders();

        if let [winner] = leaders {
            info!(
                "Consensus on '{}' ({}/{} votes)",
                winner.answer,
                winner.votes(),
                tally.total_votes()
            );
            return Decision::Consensus {
                answer: winner.answer.clone(),
                agents: winner.agents.iter().cloned().collect(),
            };
        }

        let untried = |e: &&TallyEntry| !rejected.contains(&e.answer);
        let tied: Vec<String> = leaders.iter().map(|e| e.answer.clone()).collect();
        let fallback = self
            .priority_fallback(tally, rejected)
            .or_else(|| {
                // Entries are ranked by votes, then normalized form
                leaders
                    .iter()
                    .find(untried)
                    .or_else(|| tally.entries().iter().find(untried))
                    .or_else(|| leaders.first())
                    .map(|e| Fallback {
                        answer: e.answer.clone(),
                        agent: None,
                    })
            });

        info!(
            "No consensus ({} tied groups), fallback: {:?}",
            tied.len(),
            fallback.as_ref().map(|f| &f.answer)
        );

        Decision::NoConsensus { tied, fallback }
    }

    /// First priority agent that produced an answer not rejected yet
    fn priority_fallback(
        &self,
        tally: &VoteTally,
        rejected: &RejectedAnswerSet,
    ) -> Option<Fallback> {
        for wanted in &self.priority_agents {
            let hit = tally
                .entries()
                .iter()
                .filter(|entry| !rejected.contains(&entry.answer))
                .find_map(|entry| {
                    entry
                        .agents
                        .iter()
                        .find(|agent| *agent == wanted || base_name(agent) == wanted.as_str())
                        .map(|agent| (entry, agent))
                });
            if let Some((entry, agent)) = hit {
                return Some(Fallback {
                    answer: entry.answer.clone(),
                    agent: Some(agent.clone()),
                });
            }
        }
        None
    }

    /// Tally and decide in one step
    pub fn vote(
        &self,
        attempts: &[Attempt],
        rejected: &RejectedAnswerSet,
    ) -> (VoteTally, Decision) {
        let tally = self.tally(attempts);
        let decision = self.decide(&tally, rejected);
        (tally, decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::challenge::{AttemptStatus, ChallengeId, RejectedAnswer};
    use chrono::Utc;
    use std::path::PathBuf;

    fn attempt(agent: &str, status: AttemptStatus, answer: Option<&str>) -> Attempt {
        Attempt {
            challenge_id: ChallengeId(1),
            round: 1,
            agent: agent.to_string(),
            status,
            started_at: Utc::now(),
            ended_at: Some(Utc::now()),
            answer: answer.map(String::from),
            log_path: PathBuf::from(format!("/tmp/{}.log", agent)),
            error: None,
        }
    }

    fn ok(agent: &str, answer: &str) -> Attempt {
        attempt(agent, AttemptStatus::Succeeded, Some(answer))
    }

    #[test]
    fn test_majority_wins() {
        let engine = VotingEngine::default();
        let attempts = vec![ok("claude", "A"), ok("codex", "A"), ok("gemini", "B")];
        let (tally, decision) = engine.vote(&attempts, &RejectedAnswerSet::new());

        assert_eq!(tally.total_votes(), 3);
        assert_eq!(
            decision,
            Decision::Consensus {
                answer: "A".to_string(),
                agents: vec!["claude".to_string(), "codex".to_string()],
            }
        );
    }

    #[test]
    fn test_three_way_split_uses_priority_agent() {
        let engine = VotingEngine::new(
            vec!["copilot".to_string(), "gemini".to_string()],
            AnswerFilter::default(),
        );
        let attempts = vec![ok("claude", "A"), ok("codex", "B"), ok("gemini", "C")];
        let decision = engine.vote(&attempts, &RejectedAnswerSet::new()).1;

        match decision {
            Decision::NoConsensus { tied, fallback } => {
                assert_eq!(tied, vec!["A", "B", "C"]);
                let fallback = fallback.unwrap();
                assert_eq!(fallback.answer, "C");
                assert_eq!(fallback.agent.as_deref(), Some("gemini"));
            }
            other => panic!("expected no consensus, got {:?}", other),
        }
    }

    #[test]
    fn test_tie_without_priority_falls_back_to_smallest() {
        let engine = VotingEngine::new(vec!["absent".to_string()], AnswerFilter::default());
        let attempts = vec![
            ok("a1", "flag{zz}"),
            ok("a2", "flag{zz}"),
            ok("a3", "flag{bb}"),
            ok("a4", "flag{bb}"),
        ];
        match engine.vote(&attempts, &RejectedAnswerSet::new()).1 {
            Decision::NoConsensus { fallback, .. } => {
                assert_eq!(
                    fallback,
                    Some(Fallback {
                        answer: "flag{bb}".to_string(),
                        agent: None
                    })
                );
            }
            other => panic!("expected no consensus, got {:?}", other),
        }
    }

    #[test]
    fn test_timed_out_attempt_does_not_vote() {
        let engine = VotingEngine::default();
        let attempts = vec![
            attempt("claude", AttemptStatus::TimedOut, Some("Y")),
            ok("codex", "X"),
            ok("gemini", "X"),
        ];
        let (tally, decision) = engine.vote(&attempts, &RejectedAnswerSet::new());
        assert_eq!(tally.total_votes(), 2);
        assert!(matches!(decision, Decision::Consensus { ref answer, .. } if answer == "X"));
    }

    #[test]
    fn test_no_answers_is_no_consensus() {
        let engine = VotingEngine::default();
        let attempts = vec![
            attempt("claude", AttemptStatus::Crashed, None),
            attempt("codex", AttemptStatus::Succeeded, Some("  ")),
        ];
        let (tally, decision) = engine.vote(&attempts, &RejectedAnswerSet::new());
        assert!(tally.is_empty());
        assert_eq!(
            decision,
            Decision::NoConsensus {
                tied: vec![],
                fallback: None
            }
        );
    }

    #[test]
    fn test_normalization_groups_spellings() {
        let engine = VotingEngine::default();
        let attempts = vec![
            ok("a", "flag{Hello World}"),
            ok("b", " flag{hello   world} "),
            ok("c", "flag{Hello World}"),
            ok("d", "flag{other}"),
        ];
        let tally = engine.tally(&attempts);
        let top = &tally.entries()[0];
        assert_eq!(top.votes(), 3);
        assert_eq!(top.answer, "flag{Hello World}");
    }

    #[test]
    fn test_agent_votes_once() {
        let engine = VotingEngine::default();
        let attempts = vec![ok("claude", "A"), ok("claude", "A"), ok("codex", "B")];
        let tally = engine.tally(&attempts);
        assert_eq!(tally.total_votes(), 2);
        assert!(!engine.decide(&tally, &RejectedAnswerSet::new()).is_consensus());
    }

    #[test]
    fn test_votes_bounded_by_answering_attempts() {
        let engine = VotingEngine::default();
        let attempts = vec![
            ok("a", "x"),
            ok("b", "X"),
            attempt("c", AttemptStatus::Crashed, None),
            ok("d", "y"),
            attempt("e", AttemptStatus::TimedOut, None),
        ];
        let answering = attempts.iter().filter(|a| a.vote().is_some()).count();
        assert!(engine.tally(&attempts).total_votes() <= answering);
    }

    #[test]
    fn test_decision_is_deterministic() {
        let engine = VotingEngine::new(vec!["z".to_string()], AnswerFilter::default());
        let mut attempts = vec![ok("a", "p"), ok("b", "q"), ok("c", "r"), ok("z", "q")];
        let first = engine.vote(&attempts, &RejectedAnswerSet::new());
        attempts.reverse();
        for _ in 0..10 {
            assert_eq!(engine.vote(&attempts, &RejectedAnswerSet::new()), first);
        }
    }

    #[test]
    fn test_priority_matches_instance_names() {
        let engine = VotingEngine::new(vec!["codex".to_string()], AnswerFilter::default());
        let attempts = vec![ok("claude#1", "A"), ok("codex#2", "B")];
        match engine.vote(&attempts, &RejectedAnswerSet::new()).1 {
            Decision::NoConsensus { fallback, .. } => {
                let fallback = fallback.unwrap();
                assert_eq!(fallback.answer, "B");
                assert_eq!(fallback.agent.as_deref(), Some("codex#2"));
            }
            other => panic!("expected no consensus, got {:?}", other),
        }
    }

    #[test]
    fn test_filter_drops_placeholders_and_pattern_mismatch() {
        let filter = AnswerFilter::new(Some(r"^[A-Za-z0-9_]+\{.+\}$")).unwrap();
        assert!(filter.accepts("ctf{real}"));
        assert!(!filter.accepts("FLAG{...}"));
        assert!(!filter.accepts("just some text"));

        let engine = VotingEngine::new(vec![], filter);
        let attempts = vec![ok("a", "flag{...}"), ok("b", "flag{real}")];
        let (tally, decision) = engine.vote(&attempts, &RejectedAnswerSet::new());
        assert_eq!(tally.total_votes(), 1);
        assert!(decision.is_consensus());
    }

    fn rejected(answers: &[&str]) -> RejectedAnswerSet {
        let mut set = RejectedAnswerSet::new();
        for answer in answers {
            set.insert(RejectedAnswer {
                answer: answer.to_string(),
                round: 1,
                agents: vec![],
                unverified: false,
                rejected_at: Utc::now(),
            });
        }
        set
    }

    #[test]
    fn test_fallback_skips_rejected_answers() {
        let engine = VotingEngine::new(vec!["gemini".to_string()], AnswerFilter::default());
        let attempts = vec![ok("claude", "A"), ok("codex", "B"), ok("gemini", "C")];

        match engine.vote(&attempts, &rejected(&["c", "A"])).1 {
            Decision::NoConsensus { tied, fallback } => {
                assert_eq!(tied, vec!["A", "B", "C"]);
                assert_eq!(
                    fallback,
                    Some(Fallback {
                        answer: "B".to_string(),
                        agent: None
                    })
                );
            }
            other => panic!("expected no consensus, got {:?}", other),
        }

        // Everything tried already: still decide, the caller sees a repeat
        match engine.vote(&attempts, &rejected(&["A", "B", "C"])).1 {
            Decision::NoConsensus { fallback, .. } => {
                assert_eq!(fallback.unwrap().answer, "A");
            }
            other => panic!("expected no consensus, got {:?}", other),
        }
    }

    #[test]
    fn test_priority_agent_skips_to_next_untried_answer() {
        let engine = VotingEngine::new(
            vec!["gemini".to_string(), "codex".to_string()],
            AnswerFilter::default(),
        );
        let attempts = vec![ok("claude", "A"), ok("codex", "B"), ok("gemini", "C")];
        match engine.vote(&attempts, &rejected(&["C"])).1 {
            Decision::NoConsensus { fallback, .. } => {
                let fallback = fallback.unwrap();
                assert_eq!(fallback.answer, "B");
                assert_eq!(fallback.agent.as_deref(), Some("codex"));
            }
            other => panic!("expected no consensus, got {:?}", other),
        }
    }

    #[test]
    fn test_consensus_kept_even_if_rejected() {
        let engine = VotingEngine::default();
        let attempts = vec![ok("claude", "A"), ok("codex", "A"), ok("gemini", "B")];
        let decision = engine.vote(&attempts, &rejected(&["A"])).1;
        assert!(matches!(decision, Decision::Consensus { ref answer, .. } if answer == "A"));
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        assert!(AnswerFilter::new(Some("([unclosed")).is_err());
    }
}
