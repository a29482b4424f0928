//! Top-level orchestration
//!
//! Resolves which challenges to work on, prepares their artifact trees
//! (problem text, hints, files, prompt) and runs a [`ChallengeSolver`] for
//! each of them concurrently. The coordinator's admission semaphore bounds
//! how many of them have a round in flight.

use anyhow::{Context, Result};
use futures::future::join_all;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fs;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::challenge::{ChallengeData, ChallengeId, ChallengeState, ChallengeStatus, FileMetadata};
use crate::config::Config;
use crate::coordinator::AttemptCoordinator;
use crate::error::PlatformError;
use crate::feedback::ChallengeSolver;
use crate::platform::ctfd::file_name_from_url;
use crate::platform::{retry_transient, HintPolicy, PlatformGateway};
use crate::prompt::{PromptBuilder, DOWNLOADED};
use crate::sandbox::AgentRunner;
use crate::state::{write_atomic, ChallengeLayout, ChallengeStore};

/// Final status of every challenge touched by one run
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub results: Vec<ChallengeOutcome>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChallengeOutcome {
    pub id: ChallengeId,
    pub status: ChallengeStatus,
    pub round: u32,
    pub accepted_answer: Option<String>,
    /// Failure that kept the challenge from running, or why it ended
    pub detail: Option<String>,
}

impl ChallengeOutcome {
    fn from_state(state: &ChallengeState) -> Self {
        Self {
            id: state.id,
            status: state.status,
            round: state.round,
            accepted_answer: state.accepted_answer.clone(),
            detail: state.reason.clone(),
        }
    }
}

impl RunReport {
    pub fn count(&self, status: ChallengeStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }
}

pub struct Orchestrator {
    config: Arc<Config>,
    gateway: Arc<dyn PlatformGateway>,
    store: Arc<dyn ChallengeStore>,
    solver: ChallengeSolver,
    hints: HintPolicy,
}

impl Orchestrator {
    pub fn new(
        config: Arc<Config>,
        gateway: Arc<dyn PlatformGateway>,
        store: Arc<dyn ChallengeStore>,
        runner: Arc<dyn AgentRunner>,
    ) -> Result<Self> {
        let coordinator = Arc::new(AttemptCoordinator::new(
            runner,
            config.execution.max_concurrent_challenges,
        ));
        Self::with_coordinator(config, gateway, store, coordinator)
    }

    pub fn with_coordinator(
        config: Arc<Config>,
        gateway: Arc<dyn PlatformGateway>,
        store: Arc<dyn ChallengeStore>,
        coordinator: Arc<AttemptCoordinator>,
    ) -> Result<Self> {
        let solver = ChallengeSolver::new(
            config.clone(),
            gateway.clone(),
            store.clone(),
            coordinator,
        )?;
        let hints = HintPolicy::new(&config.hints);
        Ok(Self {
            config,
            gateway,
            store,
            solver,
            hints,
        })
    }

    /// Work on every challenge the platform lists that is not solved or
    /// terminal locally, except those in `skip`
    pub async fn run_pending(
        &self,
        skip: &[ChallengeId],
        cancel: &CancellationToken,
    ) -> Result<RunReport> {
        let listed = retry_transient(&self.config.submission, "list challenges", || {
            self.gateway.list_challenges()
        })
        .await
        .context("Failed to list challenges")?;

        let skip: BTreeSet<ChallengeId> = skip.iter().copied().collect();
        let mut ids = Vec::new();
        for summary in listed {
            if skip.contains(&summary.id) {
                info!("Skipping challenge {} ({})", summary.id, summary.name);
                continue;
            }
            if summary.solved {
                info!("Challenge {} already solved on the platform", summary.id);
                continue;
            }
            let state = self.store.load(summary.id)?;
            if state.status.is_terminal() {
                info!("Challenge {} is {}, not retrying", summary.id, state.status);
                continue;
            }
            ids.push(summary.id);
        }

        info!("{} challenges to run", ids.len());
        Ok(self.run_all(&ids, cancel).await)
    }

    /// Work on the named challenges. Naming an exhausted challenge re-queues it
    /// with a fresh round budget; round numbering and rejected answers carry on.
    pub async fn run_challenges(
        &self,
        ids: &[ChallengeId],
        cancel: &CancellationToken,
    ) -> Result<RunReport> {
        let mut unique = Vec::new();
        for id in ids {
            if unique.contains(id) {
                continue;
            }
            let state = self.store.load(*id)?;
            if state.status == ChallengeStatus::Exhausted {
                info!("Re-queueing exhausted challenge {}", id);
                self.store.update(*id, &mut |s| s.requeue())?;
            }
            unique.push(*id);
        }
        Ok(self.run_all(&unique, cancel).await)
    }

    async fn run_all(&self, ids: &[ChallengeId], cancel: &CancellationToken) -> RunReport {
        let results = join_all(ids.iter().map(|id| self.run_one(*id, cancel))).await;
        RunReport { results }
    }

    #[instrument(skip(self, cancel))]
    async fn run_one(&self, id: ChallengeId, cancel: &CancellationToken) -> ChallengeOutcome {
        let failed = |detail: String| {
            let mut outcome = self
                .store
                .load(id)
                .map(|s| ChallengeOutcome::from_state(&s))
                .unwrap_or(ChallengeOutcome {
                    id,
                    status: ChallengeStatus::Pending,
                    round: 0,
                    accepted_answer: None,
                    detail: None,
                });
            outcome.detail = Some(detail);
            outcome
        };

        match self.store.load(id) {
            Ok(state) if state.status.is_terminal() => {
                return ChallengeOutcome::from_state(&state);
            }
            Ok(_) => {}
            Err(e) => return failed(e.to_string()),
        }

        if let Err(e) = self.prepare(id).await {
            error!("Failed to prepare challenge {}: {:#}", id, e);
            if let Some(platform) = e.downcast_ref::<PlatformError>() {
                if !platform.is_transient() {
                    let reason = platform.to_string();
                    let marked = self.store.update(id, &mut |s| {
                        s.reason = Some(reason.clone());
                        s.transition(ChallengeStatus::Error)
                    });
                    if let Err(e) = marked {
                        warn!("Could not mark challenge {} as error: {}", id, e);
                    }
                }
            }
            return failed(format!("{:#}", e));
        }

        match self.solver.solve(id, cancel).await {
            Ok(state) => ChallengeOutcome::from_state(&state),
            Err(e) => {
                error!("Challenge {} failed: {}", id, e);
                failed(e.to_string())
            }
        }
    }

    /// Fetch content and render the prompt, unless a previous run already did
    async fn prepare(&self, id: ChallengeId) -> Result<()> {
        let layout = self.store.layout(id);
        if layout.prompt_file().is_file() {
            return Ok(());
        }
        layout
            .ensure()
            .with_context(|| format!("Failed to create {}", layout.root().display()))?;

        let data = retry_transient(&self.config.submission, "fetch challenge", || {
            self.gateway.fetch_challenge(id)
        })
        .await?;
        info!("Preparing challenge {}: {}", id, data.name);

        fs::write(layout.problem_file(), &data.text).context("Failed to write problem")?;

        let collected = self.hints.collect(self.gateway.as_ref(), &data.hints).await;
        let hints = HintPolicy::format(&collected);
        if let Some(hints) = &hints {
            fs::write(layout.hints_file(), hints).context("Failed to write hints")?;
        }

        let files = self.download_files(&data, &layout).await?;
        fs::write(layout.files_metadata(), serde_json::to_vec_pretty(&files)?)
            .context("Failed to write files metadata")?;

        let name = data.name.clone();
        self.store.update(id, &mut |s| {
            s.name = Some(name.clone());
            Ok(())
        })?;

        // Written last: its presence marks preparation as complete
        let prompt = PromptBuilder::new().files(&files).hints(hints).build(&data);
        write_atomic(&layout.prompt_file(), prompt.as_bytes()).context("Failed to write prompt")?;
        Ok(())
    }

    async fn download_files(
        &self,
        data: &ChallengeData,
        layout: &ChallengeLayout,
    ) -> Result<Vec<FileMetadata>> {
        let limit = self.config.files.max_size_bytes();
        let mut metadata = Vec::new();

        for url in &data.files {
            let filename = file_name_from_url(url);
            let fetched = retry_transient(&self.config.submission, "download file", || {
                self.gateway.download_file(url)
            })
            .await;

            let (size, status) = match fetched {
                Ok(bytes) if bytes.len() as u64 > limit => {
                    warn!(
                        "File {} is too large ({} bytes), skipping",
                        filename,
                        bytes.len()
                    );
                    (bytes.len() as u64, "too_large".to_string())
                }
                Ok(bytes) => {
                    fs::write(layout.files_dir().join(&filename), &bytes)
                        .with_context(|| format!("Failed to save {}", filename))?;
                    info!("Downloaded {} ({} bytes)", filename, bytes.len());
                    (bytes.len() as u64, DOWNLOADED.to_string())
                }
                Err(e) => {
                    warn!("Failed to download {}: {}", filename, e);
                    (0, format!("failed: {}", e))
                }
            };
            metadata.push(FileMetadata {
                filename,
                url: url.clone(),
                size,
                status,
            });
        }
        Ok(metadata)
    }
}
