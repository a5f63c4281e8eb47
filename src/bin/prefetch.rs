//! Populates the local FHIR snapshot used as the offline fallback.
//!
//! Reads a benchmark task list (JSON array of `{id, instruction}`
//! objects), classifies each instruction, runs the derived patient query
//! against a live FHIR server, and writes the collected bundles keyed by
//! task id. Instructions that do not classify as a patient search are
//! skipped.

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use medrec_agent::classifier::{classify, TaskDescriptor};
use medrec_agent::fhir::{prefetch_query, search_fhir, FetchOutcome};

#[derive(Parser)]
#[command(about = "Pre-fetch patient search bundles into the local snapshot")]
struct Cli {
    /// Task list file: a JSON array of {id, instruction} objects
    #[arg(long)]
    tasks: PathBuf,

    /// Base URL of the FHIR server to query
    #[arg(long, default_value = "http://localhost:8080/fhir")]
    fhir_url: String,

    /// Where to write the snapshot
    #[arg(long, default_value = "med_data/prefetched-fhir-task1.json")]
    output: PathBuf,
}

#[derive(Debug, Deserialize)]
struct TaskEntry {
    id: String,
    instruction: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let raw = fs::read_to_string(&cli.tasks)
        .with_context(|| format!("Failed to read task list {}", cli.tasks.display()))?;
    let tasks: Vec<TaskEntry> =
        serde_json::from_str(&raw).context("Task list is not a JSON array of {id, instruction}")?;

    let mut snapshot = BTreeMap::new();
    for task in &tasks {
        let descriptor = match classify(&task.instruction) {
            Some(descriptor @ TaskDescriptor::SearchPatient { .. }) => descriptor,
            _ => {
                warn!(id = %task.id, "Skipping: instruction is not a patient search.");
                continue;
            }
        };

        let (resource_type, params) = prefetch_query(&descriptor);
        match search_fhir(Some(&cli.fhir_url), resource_type, &params).await {
            FetchOutcome::Fetched(bundle) => {
                info!(id = %task.id, "Fetched.");
                snapshot.insert(task.id.clone(), bundle);
            }
            FetchOutcome::Failed(reason) => {
                warn!(id = %task.id, %reason, "Fetch failed; task left out of snapshot.");
            }
        }
    }

    if let Some(parent) = cli.output.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let body =
        serde_json::to_string_pretty(&snapshot).context("Failed to serialize snapshot")?;
    fs::write(&cli.output, body)
        .with_context(|| format!("Failed to write {}", cli.output.display()))?;

    info!(output = %cli.output.display(), "Snapshot written.");
    Ok(())
}
