//! Docker sandbox for running agents in isolated containers

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::{BuildImageOptions, CreateImageOptions};
use bollard::models::{HostConfig, Mount, MountTypeEnum};
use bollard::Docker;
use flate2::write::GzEncoder;
use flate2::Compression;
use futures::StreamExt;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{AgentRunner, AttemptOutcome, SandboxRequest};
use crate::config::{parse_memory_limit, DockerConfig};
use crate::error::SandboxError;
use crate::workspace::read_answer_in;

/// Seconds docker waits after SIGTERM before killing
const STOP_GRACE_SECS: i64 = 5;
/// How long to wait for the log pump to drain after the container stops
const LOG_DRAIN: Duration = Duration::from_secs(5);

/// Runs each attempt in a fresh container with the workspace bind-mounted
pub struct DockerSandbox {
    docker: Docker,
    config: DockerConfig,
    memory: i64,
    nano_cpus: i64,
}

impl DockerSandbox {
    /// Connect to the local Docker daemon
    pub async fn connect(config: &DockerConfig) -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults()?;
        docker
            .ping()
            .await
            .map_err(|e| SandboxError::Provisioning(format!("Failed to ping Docker: {}", e)))?;
        info!("Connected to Docker daemon");

        let memory = parse_memory_limit(&config.memory_limit)
            .map_err(|e| SandboxError::Provisioning(e.to_string()))?;
        Ok(Self {
            docker,
            config: config.clone(),
            memory,
            nano_cpus: (config.cpu_limit * 1_000_000_000.0) as i64,
        })
    }

    /// Pull an image if not present
    pub async fn ensure_image(&self, image: &str) -> Result<(), SandboxError> {
        if self.docker.inspect_image(image).await.is_ok() {
            debug!("Image {} already exists", image);
            return Ok(());
        }
        info!("Pulling image: {}", image);

        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            let info = result.map_err(|e| {
                SandboxError::Provisioning(format!("Failed to pull image {}: {}", image, e))
            })?;
            if let Some(status) = info.status {
                debug!("Pull status: {}", status);
            }
        }
        info!("Image {} pulled successfully", image);
        Ok(())
    }

    async fn launch(&self, request: &SandboxRequest) -> Result<ContainerGuard, SandboxError> {
        let spec = container_spec(&self.config, request, self.memory, self.nano_cpus);
        if let Some(image) = spec.image.as_deref() {
            self.ensure_image(image).await?;
        }

        let name = container_name(request);
        let response = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    platform: None,
                }),
                spec,
            )
            .await?;
        let guard = ContainerGuard {
            docker: self.docker.clone(),
            id: response.id,
            name,
            released: false,
        };

        self.docker
            .start_container(&guard.id, None::<StartContainerOptions<String>>)
            .await?;
        info!("Started container {} for {}", guard.name, request.agent.name);
        Ok(guard)
    }
}

enum Ending {
    Exited(Result<i64, DockerError>),
    TimedOut,
    Cancelled,
}

#[async_trait]
impl AgentRunner for DockerSandbox {
    async fn run(&self, request: SandboxRequest, cancel: CancellationToken) -> AttemptOutcome {
        if cancel.is_cancelled() {
            return AttemptOutcome::timed_out("cancelled before start");
        }

        let log = match open_log(&request.log_path).await {
            Ok(log) => log,
            Err(e) => {
                error!("Cannot create log {}: {}", request.log_path.display(), e);
                return AttemptOutcome::crashed(format!("log file: {}", e));
            }
        };

        let guard = match self.launch(&request).await {
            Ok(guard) => guard,
            Err(e) => {
                error!("Failed to launch {}: {}", request.agent.name, e);
                note_failure(log, &e).await;
                return AttemptOutcome::crashed(e.to_string());
            }
        };

        let mut pump = tokio::spawn(pump_logs(
            self.docker.clone(),
            guard.id.clone(),
            log,
            request.log_path.clone(),
        ));

        let ending = tokio::select! {
            code = wait_exit(&self.docker, &guard.id) => Ending::Exited(code),
            _ = tokio::time::sleep(request.timeout) => Ending::TimedOut,
            _ = cancel.cancelled() => Ending::Cancelled,
        };

        // The log stream of an exited container closes by itself and must
        // drain before removal
        if matches!(ending, Ending::Exited(_)) {
            drain_logs(&mut pump, &request.agent.name).await;
            guard.release().await;
        } else {
            guard.release().await;
            drain_logs(&mut pump, &request.agent.name).await;
        }

        match ending {
            Ending::Exited(Ok(code)) => {
                let outcome = AttemptOutcome::from_exit(code, read_answer_in(&request.workspace));
                info!(
                    "Agent {} exited with code {} ({})",
                    request.agent.name, code, outcome.status
                );
                outcome
            }
            Ending::Exited(Err(e)) => AttemptOutcome::crashed(format!("wait failed: {}", e)),
            Ending::TimedOut => {
                warn!(
                    "Agent {} timed out after {}s",
                    request.agent.name,
                    request.timeout.as_secs()
                );
                AttemptOutcome::timed_out(format!(
                    "agent timeout after {}s",
                    request.timeout.as_secs()
                ))
            }
            Ending::Cancelled => AttemptOutcome::timed_out("cancelled"),
        }
    }
}

/// Container exit code. Bollard reports non-zero exits as an error variant.
async fn wait_exit(docker: &Docker, id: &str) -> Result<i64, DockerError> {
    let options = WaitContainerOptions {
        condition: "not-running",
    };
    let mut stream = docker.wait_container(id, Some(options));
    match stream.next().await {
        Some(Ok(response)) => Ok(response.status_code),
        Some(Err(DockerError::DockerContainerWaitError { code, .. })) => Ok(code),
        Some(Err(e)) => Err(e),
        None => Ok(0),
    }
}

/// Create the attempt's log file, so every attempt leaves one behind
async fn open_log(path: &Path) -> std::io::Result<tokio::fs::File> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::File::create(path).await
}

async fn note_failure(mut log: tokio::fs::File, err: &SandboxError) {
    let line = format!("[ctf-swarm] sandbox failed to start: {}\n", err);
    if let Err(e) = log.write_all(line.as_bytes()).await {
        warn!("Failed writing launch failure to log: {}", e);
    }
    let _ = log.flush().await;
}

/// Wait for the log pump to finish, giving up after `LOG_DRAIN`
async fn drain_logs(pump: &mut tokio::task::JoinHandle<()>, agent: &str) {
    if tokio::time::timeout(LOG_DRAIN, &mut *pump).await.is_err() {
        warn!("Log stream for {} did not close", agent);
        pump.abort();
    }
}

/// Follow container output into the attempt's log file
async fn pump_logs(docker: Docker, id: String, mut file: tokio::fs::File, path: PathBuf) {
    let options = LogsOptions::<String> {
        follow: true,
        stdout: true,
        stderr: true,
        timestamps: false,
        ..Default::default()
    };
    let mut stream = docker.logs(&id, Some(options));
    while let Some(result) = stream.next().await {
        let chunk = match result {
            Ok(LogOutput::StdOut { message })
            | Ok(LogOutput::StdErr { message })
            | Ok(LogOutput::Console { message }) => message,
            Ok(_) => continue,
            Err(e) => {
                debug!("Log stream for {} ended: {}", id, e);
                break;
            }
        };
        if let Err(e) = file.write_all(&chunk).await {
            warn!("Failed writing {}: {}", path.display(), e);
            break;
        }
    }
    let _ = file.flush().await;
}

/// Owns a created container until it is stopped and removed.
///
/// `release` does the cleanup inline. If the guard is dropped without it
/// (task aborted mid-attempt) removal is spawned onto the current runtime.
struct ContainerGuard {
    docker: Docker,
    id: String,
    name: String,
    released: bool,
}

impl ContainerGuard {
    async fn release(mut self) {
        if let Err(e) = self
            .docker
            .stop_container(&self.id, Some(StopContainerOptions { t: STOP_GRACE_SECS }))
            .await
        {
            debug!("Stop {}: {}", self.name, e);
        }
        remove_container(&self.docker, &self.id, &self.name).await;
        self.released = true;
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let docker = self.docker.clone();
                let id = std::mem::take(&mut self.id);
                let name = std::mem::take(&mut self.name);
                handle.spawn(async move { remove_container(&docker, &id, &name).await });
            }
            Err(_) => warn!("Container {} leaked: no runtime for cleanup", self.name),
        }
    }
}

async fn remove_container(docker: &Docker, id: &str, name: &str) {
    let options = RemoveContainerOptions {
        force: true,
        ..Default::default()
    };
    match docker.remove_container(id, Some(options)).await {
        Ok(()) => debug!("Removed container: {}", name),
        Err(e) => warn!("Failed to remove container {}: {}", name, e),
    }
}

/// Docker only allows `[a-zA-Z0-9][a-zA-Z0-9_.-]` in container names
fn container_name(request: &SandboxRequest) -> String {
    let agent: String = request
        .agent
        .name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "ctf-swarm-{}-r{}-{}-{}",
        request.challenge_id,
        request.round,
        agent,
        &suffix[..8]
    )
}

fn bind(source: &Path, target: &str, read_only: bool) -> Mount {
    Mount {
        target: Some(target.to_string()),
        source: Some(source.to_string_lossy().to_string()),
        typ: Some(MountTypeEnum::BIND),
        read_only: Some(read_only),
        ..Default::default()
    }
}

/// Container definition for one attempt
fn container_spec(
    config: &DockerConfig,
    request: &SandboxRequest,
    memory: i64,
    nano_cpus: i64,
) -> Config<String> {
    let ws = &request.workspace;
    let mounts = vec![
        bind(&ws.join("challenge"), "/challenge", true),
        bind(&ws.join("scratch"), "/scratch", false),
        bind(&ws.join("shared"), "/shared", true),
        bind(&ws.join("output"), "/output", false),
    ];

    let mut env = vec![
        format!("AGENT_NAME={}", request.agent.name),
        format!("AGENT_TYPE={}", request.agent.kind),
        format!("AGENT_TIMEOUT={}", request.timeout.as_secs()),
        format!("CHALLENGE_ID={}", request.challenge_id),
        format!("ROUND={}", request.round),
        "TERM=xterm-256color".to_string(),
    ];
    env.extend(request.agent.env.iter().map(|(k, v)| format!("{}={}", k, v)));

    let mut labels = HashMap::new();
    labels.insert("ctf-swarm.challenge".to_string(), request.challenge_id.to_string());
    labels.insert("ctf-swarm.agent".to_string(), request.agent.name.clone());

    Config {
        image: Some(
            request
                .agent
                .image
                .clone()
                .unwrap_or_else(|| config.image.clone()),
        ),
        hostname: Some("agent".to_string()),
        cmd: (!config.command.is_empty()).then(|| config.command.clone()),
        working_dir: Some("/scratch".to_string()),
        env: Some(env),
        labels: Some(labels),
        host_config: Some(HostConfig {
            memory: Some(memory),
            nano_cpus: Some(nano_cpus),
            network_mode: Some(config.network_mode.clone()),
            mounts: Some(mounts),
            auto_remove: Some(false),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Gzipped tar of the build context directory
fn create_build_context(context_dir: &Path) -> std::io::Result<Vec<u8>> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.append_dir_all(".", context_dir)?;
    builder.into_inner()?.finish()
}

/// Build the shared agent image from `docker.build_context`
pub async fn build_base_image(config: &DockerConfig) -> Result<String, SandboxError> {
    let context = &config.build_context;
    if !context.join(&config.dockerfile).is_file() {
        return Err(SandboxError::Provisioning(format!(
            "Dockerfile not found: {}",
            context.join(&config.dockerfile).display()
        )));
    }

    let docker = Docker::connect_with_local_defaults()?;
    info!("Building image {} from {}", config.image, context.display());
    let tar_data = create_build_context(context)?;

    let options = BuildImageOptions {
        t: config.image.clone(),
        dockerfile: config.dockerfile.clone(),
        rm: true,
        forcerm: true,
        ..Default::default()
    };
    let mut stream = docker.build_image(options, None, Some(tar_data.into()));
    while let Some(result) = stream.next().await {
        let info = result?;
        if let Some(line) = info.stream {
            let line = line.trim();
            if !line.is_empty() {
                debug!("{}", line);
            }
        }
        if let Some(err) = info.error {
            error!("Build error: {}", err);
            return Err(SandboxError::Provisioning(format!("Docker build failed: {}", err)));
        }
    }

    info!("Image {} built successfully", config.image);
    Ok(config.image.clone())
}
