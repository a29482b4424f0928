//! CTF Swarm CLI
//!
//! Usage:
//!   ctf-swarm run [--skip 3,7]        # every unsolved challenge
//!   ctf-swarm solve 12 15             # specific challenges
//!   ctf-swarm build-image             # rebuild the agent base image
//!   ctf-swarm status                  # persisted challenge states

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use comfy_table::{presets::UTF8_FULL, Cell, Color, ContentArrangement, Table};
use ctf_swarm::sandbox::build_base_image;
use ctf_swarm::{
    ChallengeId, ChallengeState, ChallengeStatus, ChallengeStore, Config, CtfdClient,
    DockerSandbox, FileChallengeStore, Orchestrator, RunReport,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "ctf-swarm")]
#[command(about = "Solve CTF challenges with a swarm of AI agents")]
#[command(version)]
struct Args {
    /// Config file
    #[arg(
        short,
        long,
        default_value = "config/ctf-swarm.yaml",
        env = "CTF_SWARM_CONFIG",
        global = true
    )]
    config: PathBuf,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run every challenge that is not solved yet
    Run {
        /// Challenge ids to leave out
        #[arg(long, value_delimiter = ',')]
        skip: Vec<ChallengeId>,
    },

    /// Run specific challenges (re-queues exhausted ones)
    Solve {
        #[arg(required = true)]
        ids: Vec<ChallengeId>,
    },

    /// Build the agent base image
    BuildImage,

    /// Show persisted challenge states
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default = if args.verbose {
        "debug"
    } else {
        "ctf_swarm=debug,info"
    };
    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    for directive in default.split(',') {
        filter = filter.add_directive(directive.parse()?);
    }
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Arc::new(
        Config::load(&args.config)
            .with_context(|| format!("Failed to load {}", args.config.display()))?,
    );
    let store = Arc::new(FileChallengeStore::new(&config.storage.challenges_dir)?);

    match args.command {
        Commands::Status => {
            display_states(&store.list()?);
            Ok(())
        }
        Commands::BuildImage => {
            let image = build_base_image(&config.docker)
                .await
                .context("Failed to build base image")?;
            println!("{} {}", "Built".green(), image);
            Ok(())
        }
        Commands::Run { skip } => {
            let (orchestrator, cancel) = setup(config, store).await?;
            let report = orchestrator.run_pending(&skip, &cancel).await?;
            display_report(&report);
            Ok(())
        }
        Commands::Solve { ids } => {
            let (orchestrator, cancel) = setup(config, store).await?;
            let report = orchestrator.run_challenges(&ids, &cancel).await?;
            display_report(&report);
            Ok(())
        }
    }
}

async fn setup(
    config: Arc<Config>,
    store: Arc<FileChallengeStore>,
) -> Result<(Orchestrator, CancellationToken)> {
    let gateway = Arc::new(
        CtfdClient::from_config(&config.platform).context("Failed to create platform client")?,
    );
    let sandbox = Arc::new(
        DockerSandbox::connect(&config.docker)
            .await
            .context("Docker is not available")?,
    );
    info!(
        "Platform {}, {} agent instances",
        gateway.base_url(),
        config.enabled_agents().len()
    );

    let orchestrator = Orchestrator::new(config, gateway, store, sandbox)?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping running rounds");
            on_signal.cancel();
        }
    });

    Ok((orchestrator, cancel))
}

fn status_color(status: ChallengeStatus) -> Color {
    match status {
        ChallengeStatus::Pending => Color::Yellow,
        ChallengeStatus::Running => Color::Cyan,
        ChallengeStatus::Solved => Color::Green,
        ChallengeStatus::Exhausted => Color::Magenta,
        ChallengeStatus::Error => Color::Red,
    }
}

fn display_states(states: &[ChallengeState]) {
    if states.is_empty() {
        println!("{}", "No challenges recorded yet.".yellow());
        return;
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Id").fg(Color::Cyan),
            Cell::new("Name").fg(Color::Cyan),
            Cell::new("Status").fg(Color::Cyan),
            Cell::new("Round").fg(Color::Cyan),
            Cell::new("Answer / Reason").fg(Color::Cyan),
            Cell::new("Updated").fg(Color::Cyan),
        ]);

    for s in states {
        let detail = s
            .accepted_answer
            .as_deref()
            .or(s.reason.as_deref())
            .unwrap_or("-");
        table.add_row(vec![
            Cell::new(s.id),
            Cell::new(s.name.as_deref().unwrap_or("-")).fg(Color::White),
            Cell::new(s.status).fg(status_color(s.status)),
            Cell::new(s.round),
            Cell::new(detail),
            Cell::new(s.updated_at.format("%Y-%m-%d %H:%M:%S")),
        ]);
    }

    println!("{table}");
}

fn display_report(report: &RunReport) {
    if report.results.is_empty() {
        println!("{}", "Nothing to run.".yellow());
        return;
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Id").fg(Color::Cyan),
            Cell::new("Status").fg(Color::Cyan),
            Cell::new("Rounds").fg(Color::Cyan),
            Cell::new("Answer / Detail").fg(Color::Cyan),
        ]);

    for r in &report.results {
        let detail = r
            .accepted_answer
            .as_deref()
            .or(r.detail.as_deref())
            .unwrap_or("-");
        table.add_row(vec![
            Cell::new(r.id),
            Cell::new(r.status).fg(status_color(r.status)),
            Cell::new(r.round),
            Cell::new(detail),
        ]);
    }
    println!("{table}");

    println!(
        "{} solved, {} exhausted, {} error, {} pending",
        report.count(ChallengeStatus::Solved).to_string().green(),
        report.count(ChallengeStatus::Exhausted).to_string().magenta(),
        report.count(ChallengeStatus::Error).to_string().red(),
        report.count(ChallengeStatus::Pending).to_string().yellow(),
    );
}
