//! Durable challenge lifecycle state
//!
//! The directory tree under `challenges_dir` doubles as the database:
//!
//! ```text
//! <challenges_dir>/<id>/
//!   state.json              status, round, accepted answer
//!   problem.txt prompt.txt hints.txt files.json files/
//!   shared/                 rejected_answers.txt, approaches.txt (mounted read-only)
//!   rejected/history.jsonl  one RejectedAnswer per line
//!   rejected/notes.txt      failed-approach notes
//!   rounds/round-N.json     round summaries
//!   answers/<agent>.txt     latest candidate per agent
//!   logs/latest/ logs/history/round-N/
//!   accepted_answer.txt
//! ```
//!
//! All mutation of one challenge goes through a per-id lock so two writers
//! never interleave on the same record.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::challenge::{
    ChallengeId, ChallengeState, ChallengeStatus, RejectedAnswer, RejectedAnswerSet, RoundSummary,
};
use crate::error::StateError;

pub const REJECTED_ANSWERS_FILE: &str = "rejected_answers.txt";
pub const APPROACHES_FILE: &str = "approaches.txt";

/// Paths of one challenge's artifact tree
#[derive(Debug, Clone)]
pub struct ChallengeLayout {
    root: PathBuf,
}

impl ChallengeLayout {
    pub fn new(challenges_dir: &Path, id: ChallengeId) -> Self {
        Self {
            root: challenges_dir.join(id.to_string()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state_file(&self) -> PathBuf {
        self.root.join("state.json")
    }

    pub fn problem_file(&self) -> PathBuf {
        self.root.join("problem.txt")
    }

    pub fn prompt_file(&self) -> PathBuf {
        self.root.join("prompt.txt")
    }

    pub fn hints_file(&self) -> PathBuf {
        self.root.join("hints.txt")
    }

    pub fn files_metadata(&self) -> PathBuf {
        self.root.join("files.json")
    }

    pub fn files_dir(&self) -> PathBuf {
        self.root.join("files")
    }

    pub fn shared_dir(&self) -> PathBuf {
        self.root.join("shared")
    }

    pub fn rejected_history(&self) -> PathBuf {
        self.root.join("rejected").join("history.jsonl")
    }

    pub fn rejected_notes(&self) -> PathBuf {
        self.root.join("rejected").join("notes.txt")
    }

    pub fn round_file(&self, round: u32) -> PathBuf {
        self.root.join("rounds").join(format!("round-{}.json", round))
    }

    pub fn answer_file(&self, agent: &str) -> PathBuf {
        self.root.join("answers").join(format!("{}.txt", agent))
    }

    pub fn latest_logs(&self) -> PathBuf {
        self.root.join("logs").join("latest")
    }

    pub fn history_logs(&self, round: u32) -> PathBuf {
        self.root
            .join("logs")
            .join("history")
            .join(format!("round-{}", round))
    }

    pub fn accepted_answer_file(&self) -> PathBuf {
        self.root.join("accepted_answer.txt")
    }

    /// Create the directory skeleton
    pub fn ensure(&self) -> std::io::Result<()> {
        for sub in ["files", "shared", "rejected", "rounds", "answers", "logs/latest"] {
            fs::create_dir_all(self.root.join(sub))?;
        }
        for name in [REJECTED_ANSWERS_FILE, APPROACHES_FILE] {
            let path = self.shared_dir().join(name);
            if !path.exists() {
                fs::write(path, "")?;
            }
        }
        Ok(())
    }

    /// Rewrite the read-only context agents see under `/shared`
    pub fn write_shared_context(&self, rejected: &RejectedAnswerSet) -> std::io::Result<()> {
        fs::create_dir_all(self.shared_dir())?;
        let mut answers = String::new();
        for answer in rejected.answers() {
            answers.push_str(answer);
            answers.push('\n');
        }
        write_atomic(&self.shared_dir().join(REJECTED_ANSWERS_FILE), answers.as_bytes())?;

        let mut notes = String::new();
        for note in rejected.notes() {
            notes.push_str(note);
            notes.push('\n');
        }
        write_atomic(&self.shared_dir().join(APPROACHES_FILE), notes.as_bytes())
    }

    /// Move the previous round's logs out of `logs/latest`
    pub fn rotate_logs(&self, previous_round: u32) -> std::io::Result<()> {
        let latest = self.latest_logs();
        let has_logs = fs::read_dir(&latest)
            .map(|mut entries| entries.next().is_some())
            .unwrap_or(false);
        if has_logs && previous_round > 0 {
            let target = self.history_logs(previous_round);
            if target.exists() {
                fs::remove_dir_all(&target)?;
            }
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::rename(&latest, &target)?;
            debug!("Rotated logs to {}", target.display());
        }
        fs::create_dir_all(&latest)
    }

    pub fn save_agent_answer(&self, agent: &str, answer: &str) -> std::io::Result<()> {
        let path = self.answer_file(agent);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, answer)
    }
}

/// Write via a temp file and rename so readers never see a torn file
pub fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut f = fs::File::create(&tmp)?;
        f.write_all(contents)?;
        f.sync_all()?;
    }
    fs::rename(&tmp, path)
}

/// Key-value view of challenge lifecycle state
pub trait ChallengeStore: Send + Sync {
    /// Artifact paths for one challenge
    fn layout(&self, id: ChallengeId) -> ChallengeLayout;

    /// Current state, or a fresh pending record if none was persisted yet
    fn load(&self, id: ChallengeId) -> Result<ChallengeState, StateError>;

    /// Atomic read-modify-write of one challenge's state
    fn update(
        &self,
        id: ChallengeId,
        f: &mut dyn FnMut(&mut ChallengeState) -> Result<(), StateError>,
    ) -> Result<ChallengeState, StateError>;

    fn rejected(&self, id: ChallengeId) -> Result<RejectedAnswerSet, StateError>;

    /// Append to the rejected set; false if an equivalent answer was present
    fn append_rejected(&self, id: ChallengeId, entry: RejectedAnswer) -> Result<bool, StateError>;

    fn append_note(&self, id: ChallengeId, note: &str) -> Result<(), StateError>;

    fn save_round(&self, summary: &RoundSummary) -> Result<(), StateError>;

    fn list(&self) -> Result<Vec<ChallengeState>, StateError>;

    fn transition(
        &self,
        id: ChallengeId,
        to: ChallengeStatus,
    ) -> Result<ChallengeState, StateError> {
        self.update(id, &mut |state| state.transition(to))
    }
}

/// Challenge store backed by the per-challenge directory tree
pub struct FileChallengeStore {
    root: PathBuf,
    locks: DashMap<ChallengeId, Arc<Mutex<()>>>,
}

impl FileChallengeStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StateError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        info!("Challenge store at {}", root.display());
        Ok(Self {
            root,
            locks: DashMap::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn lock(&self, id: ChallengeId) -> Arc<Mutex<()>> {
        self.locks.entry(id).or_default().clone()
    }

    fn read_state(&self, id: ChallengeId) -> Result<ChallengeState, StateError> {
        let path = self.layout(id).state_file();
        match fs::read_to_string(&path) {
            Ok(raw) => Ok(serde_json::from_str(&raw)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ChallengeState::new(id)),
            Err(e) => Err(e.into()),
        }
    }

    fn write_state(&self, state: &ChallengeState) -> Result<(), StateError> {
        let layout = self.layout(state.id);
        fs::create_dir_all(layout.root())?;
        let json = serde_json::to_vec_pretty(state)?;
        write_atomic(&layout.state_file(), &json)?;
        if let Some(answer) = &state.accepted_answer {
            write_atomic(&layout.accepted_answer_file(), answer.as_bytes())?;
        }
        Ok(())
    }

    fn read_rejected(&self, id: ChallengeId) -> Result<RejectedAnswerSet, StateError> {
        let layout = self.layout(id);
        let mut set = RejectedAnswerSet::new();

        match fs::read_to_string(layout.rejected_history()) {
            Ok(raw) => {
                for (n, line) in raw.lines().enumerate() {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<RejectedAnswer>(line) {
                        Ok(entry) => {
                            set.insert(entry);
                        }
                        // A torn trailing line from a crash mid-append
                        Err(e) => warn!(
                            "Skipping corrupt rejected entry {} for {}: {}",
                            n + 1,
                            id,
                            e
                        ),
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        match fs::read_to_string(layout.rejected_notes()) {
            Ok(raw) => raw
                .lines()
                .filter(|l| !l.trim().is_empty())
                .for_each(|l| set.add_note(l)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        Ok(set)
    }
}

fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut f = OpenOptions::new().create(true).append(true).open(path)?;
    f.write_all(format!("{}\n", line).as_bytes())?;
    f.sync_data()
}

impl ChallengeStore for FileChallengeStore {
    fn layout(&self, id: ChallengeId) -> ChallengeLayout {
        ChallengeLayout::new(&self.root, id)
    }

    fn load(&self, id: ChallengeId) -> Result<ChallengeState, StateError> {
        let lock = self.lock(id);
        let _guard = lock.lock();
        self.read_state(id)
    }

    fn update(
        &self,
        id: ChallengeId,
        f: &mut dyn FnMut(&mut ChallengeState) -> Result<(), StateError>,
    ) -> Result<ChallengeState, StateError> {
        let lock = self.lock(id);
        let _guard = lock.lock();
        let mut state = self.read_state(id)?;
        f(&mut state)?;
        state.updated_at = chrono::Utc::now();
        self.write_state(&state)?;
        Ok(state)
    }

    fn rejected(&self, id: ChallengeId) -> Result<RejectedAnswerSet, StateError> {
        let lock = self.lock(id);
        let _guard = lock.lock();
        self.read_rejected(id)
    }

    fn append_rejected(&self, id: ChallengeId, entry: RejectedAnswer) -> Result<bool, StateError> {
        let lock = self.lock(id);
        let _guard = lock.lock();
        let existing = self.read_rejected(id)?;
        if existing.contains(&entry.answer) {
            return Ok(false);
        }
        let line = serde_json::to_string(&entry)?;
        append_line(&self.layout(id).rejected_history(), &line)?;
        info!("Challenge {}: recorded rejected answer '{}'", id, entry.answer);
        Ok(true)
    }

    fn append_note(&self, id: ChallengeId, note: &str) -> Result<(), StateError> {
        let lock = self.lock(id);
        let _guard = lock.lock();
        let note = note.replace('\n', " ");
        append_line(&self.layout(id).rejected_notes(), &note)?;
        Ok(())
    }

    fn save_round(&self, summary: &RoundSummary) -> Result<(), StateError> {
        let lock = self.lock(summary.challenge_id);
        let _guard = lock.lock();
        let path = self.layout(summary.challenge_id).round_file(summary.round);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        write_atomic(&path, &serde_json::to_vec_pretty(summary)?)?;
        Ok(())
    }

    fn list(&self) -> Result<Vec<ChallengeState>, StateError> {
        let mut states = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let Some(id) = entry
                .file_name()
                .to_str()
                .and_then(|n| n.parse::<ChallengeId>().ok())
            else {
                continue;
            };
            if self.layout(id).state_file().exists() {
                states.push(self.load(id)?);
            }
        }
        states.sort_by_key(|s| s.id);
        Ok(states)
    }
}
