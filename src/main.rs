//! CLI Entry Point for pipettor-plus
//!
//! Provides a command-line interface for:
//! - Planning a stored workflow against a deck (dry run on the simulator)
//! - Running a workflow on the simulator and writing the result report
//! - Listing labware a workflow references that the deck does not have
//! - Printing the effective configuration
//!
//! # Usage
//!
//! ```bash
//! pipettor-plus plan --deck deck.json --workflow exchange.json
//! pipettor-plus run --deck deck.json --workflow exchange.json --remap plate_old=plate_1 --report result.json
//! pipettor-plus remap --deck deck.json --workflow exchange.json
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use pipettor_plus::engine::remap;
use pipettor_plus::hardware::SimulatedPipettor;
use pipettor_plus::labware::{Deck, LabwareId};
use pipettor_plus::{logging, Engine, PipettorConfig, RunPolicy, Workflow};

#[derive(Parser)]
#[command(name = "pipettor-plus")]
#[command(about = "Plan and run pipettor workflows", long_about = None)]
struct Cli {
    /// Configuration file (defaults to config/pipettor.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the steps every operation expands to
    Plan {
        /// Deck JSON file
        #[arg(long)]
        deck: PathBuf,
        /// Workflow JSON file
        #[arg(long)]
        workflow: PathBuf,
    },

    /// Run a workflow on the simulator
    Run {
        #[arg(long)]
        deck: PathBuf,
        #[arg(long)]
        workflow: PathBuf,
        /// Skip operations with unresolved labware instead of refusing the workflow
        #[arg(long)]
        allow_partial: bool,
        /// Index of the first operation to run
        #[arg(long, default_value_t = 0)]
        start_from: usize,
        /// Substitute a labware id, as OLD=NEW (repeatable)
        #[arg(long = "remap", value_parser = parse_mapping)]
        remap: Vec<(LabwareId, LabwareId)>,
        /// Write the JSON result here
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// List referenced labware missing from the deck, with candidates
    Remap {
        #[arg(long)]
        deck: PathBuf,
        #[arg(long)]
        workflow: PathBuf,
    },

    /// Print the effective configuration as TOML
    Config,
}

fn parse_mapping(raw: &str) -> Result<(LabwareId, LabwareId), String> {
    match raw.split_once('=') {
        Some((old, new)) if !old.is_empty() && !new.is_empty() => {
            Ok((LabwareId::new(old), LabwareId::new(new)))
        }
        _ => Err(format!("expected OLD=NEW, got '{raw}'")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => PipettorConfig::load_from(path),
        None => PipettorConfig::load(),
    }
    .context("Failed to load configuration")?;
    config
        .validate()
        .map_err(|e| anyhow!("Invalid configuration: {e}"))?;
    logging::init_from_config(&config).map_err(|e| anyhow!(e))?;

    match cli.command {
        Commands::Plan { deck, workflow } => plan(&config, &deck, &workflow).await,
        Commands::Run {
            deck,
            workflow,
            allow_partial,
            start_from,
            remap,
            report,
        } => {
            let policy = RunPolicy {
                allow_partial,
                start_from,
            };
            run(&config, &deck, &workflow, remap.into_iter().collect(), policy, report.as_deref())
                .await
        }
        Commands::Remap { deck, workflow } => show_remap(&deck, &workflow),
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config).context("Failed to render configuration")?);
            Ok(())
        }
    }
}

fn load_inputs(deck: &Path, workflow: &Path) -> Result<(Deck, Workflow)> {
    let deck = Deck::load_json(deck).with_context(|| format!("Failed to load deck {}", deck.display()))?;
    let workflow = Workflow::load_json(workflow)
        .with_context(|| format!("Failed to load workflow {}", workflow.display()))?;
    Ok((deck, workflow))
}

async fn simulated_engine(config: &PipettorConfig, deck: Deck) -> Result<Engine> {
    let device = Arc::new(SimulatedPipettor::new(config.channel_count(), config.tip_capacity()));
    Engine::connect(device, deck, config)
        .await
        .context("Failed to connect to the simulator")
}

async fn plan(config: &PipettorConfig, deck: &Path, workflow: &Path) -> Result<()> {
    let (deck, workflow) = load_inputs(deck, workflow)?;
    let report = remap::analyze(&workflow, &deck);
    if !report.is_complete() {
        bail!(
            "Workflow references labware not on the deck: {}",
            join(report.unresolved_ids().iter().map(LabwareId::as_str))
        );
    }

    // Each plan depends on the state the previous operations leave behind.
    let engine = simulated_engine(config, deck).await?;
    println!("Workflow '{}' ({} operations)", workflow.name, workflow.len());
    for (index, entry) in workflow.operations.iter().enumerate() {
        println!();
        println!("[{}] {}", index + 1, entry.description);
        let plan = engine
            .plan(&entry.operation)
            .with_context(|| format!("Operation {} cannot be planned", index + 1))?;
        print!("{plan}");
        engine
            .submit(&entry.operation)
            .await
            .with_context(|| format!("Operation {} failed on the simulator", index + 1))?;
    }
    engine.disconnect();
    Ok(())
}

async fn run(
    config: &PipettorConfig,
    deck: &Path,
    workflow: &Path,
    mapping: BTreeMap<LabwareId, LabwareId>,
    policy: RunPolicy,
    report_path: Option<&Path>,
) -> Result<()> {
    let (deck, mut workflow) = load_inputs(deck, workflow)?;
    if !mapping.is_empty() {
        workflow = remap::apply(&workflow, &deck, &mapping).context("Remap rejected")?;
    }

    let engine = simulated_engine(config, deck).await?;
    let result = {
        let run = engine.run_workflow(&workflow, policy);
        tokio::pin!(run);
        tokio::select! {
            result = &mut run => result,
            _ = tokio::signal::ctrl_c() => {
                engine.abort();
                run.await
            }
        }
    }
    .context("Workflow refused")?;
    engine.disconnect();

    if let Some(path) = report_path {
        std::fs::write(path, serde_json::to_string_pretty(&result)?)
            .with_context(|| format!("Failed to write report {}", path.display()))?;
    }

    println!(
        "Workflow '{}': {:?}, {}/{} operations ({:.0}%)",
        workflow.name,
        result.status,
        result.operations_completed,
        result.total_operations,
        result.progress_percent()
    );
    if !result.skipped.is_empty() {
        println!("  skipped: {}", join(result.skipped.iter().map(|i| (i + 1).to_string())));
    }
    match (result.failed_operation_index, &result.error_message) {
        (Some(index), Some(message)) => bail!("Operation {} failed: {message}", index + 1),
        _ => Ok(()),
    }
}

fn show_remap(deck: &Path, workflow: &Path) -> Result<()> {
    let (deck, workflow) = load_inputs(deck, workflow)?;
    let report = remap::analyze(&workflow, &deck);
    if report.is_complete() {
        println!("Every referenced labware is on deck '{}'", deck.id);
        return Ok(());
    }
    for (labware_type, missing) in &report.missing {
        println!("{labware_type}:");
        for item in missing {
            println!(
                "  {} (operations {}) -> candidates: {}",
                item.id,
                join(item.operations.iter().map(|i| (i + 1).to_string())),
                join(item.candidates.iter().map(LabwareId::as_str))
            );
        }
    }
    for conflict in &report.conflicts {
        println!(
            "  {} is a {} on this deck, workflow expects {} -> candidates: {}",
            conflict.id,
            conflict.found,
            conflict.expected,
            join(conflict.candidates.iter().map(LabwareId::as_str))
        );
    }
    Ok(())
}

fn join<I, S>(items: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let parts: Vec<String> = items.into_iter().map(|s| s.as_ref().to_string()).collect();
    if parts.is_empty() {
        "none".to_string()
    } else {
        parts.join(", ")
    }
}
