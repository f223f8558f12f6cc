use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::{Path, PathBuf};

use tickwork::tasks::TaskState;
use tickwork::telemetry::init_telemetry;
use tickwork::trace::{parse_trace, replay, TraceRecord};

#[derive(Parser)]
#[command(name = "tickwork")]
#[command(about = "Resumable task-workflow engine tooling")]
#[command(long_about = "Tickwork advances board tasks through workflow definitions one bounded tick \
                       at a time. This binary offers operator tooling around the trace log and configuration.")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a trace log and replay it to the state it describes
    Replay {
        /// JSON array or JSON-lines file of trace records
        file: PathBuf,
        /// Fail unless every run replays to this task state
        #[arg(long, help = "Expected task state: queued, running, feedback, done, blocked, failed")]
        expect: Option<TaskState>,
    },
    /// Print the effective configuration as TOML
    Config,
}

fn main() -> Result<()> {
    // --help and usage errors must not depend on a readable config
    let cli = Cli::parse();

    let config = tickwork::config()?;
    // the CLI stays usable when a subscriber is already installed
    let _ = init_telemetry(&config.observability);

    match cli.command {
        Commands::Replay { file, expect } => replay_command(&file, expect),
        Commands::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

fn replay_command(file: &Path, expect: Option<TaskState>) -> Result<()> {
    let traces = read_traces(file)?;
    if traces.is_empty() {
        println!("No traces in {}", file.display());
        return Ok(());
    }

    for (run_id, run_traces) in group_by_run(traces) {
        let outcome = replay(&run_traces).with_context(|| format!("run {run_id} failed to replay"))?;
        println!("{run_id}: {outcome} ({} traces)", run_traces.len());

        if let Some(expected) = expect {
            if !outcome.matches(expected) {
                anyhow::bail!("run {run_id} replays to {outcome}, expected {expected}");
            }
        }
    }
    Ok(())
}

fn read_traces(file: &Path) -> Result<Vec<TraceRecord>> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;

    let raw: Vec<Value> = if text.trim_start().starts_with('[') {
        serde_json::from_str(&text).context("trace file is not a JSON array")?
    } else {
        text.lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(n, line)| {
                serde_json::from_str(line).with_context(|| format!("line {} is not valid JSON", n + 1))
            })
            .collect::<Result<_>>()?
    };

    raw.iter()
        .map(|value| parse_trace(value).map_err(anyhow::Error::from))
        .collect()
}

/// Split by run id, keeping the order in which runs first appear.
fn group_by_run(traces: Vec<TraceRecord>) -> Vec<(String, Vec<TraceRecord>)> {
    let mut groups: Vec<(String, Vec<TraceRecord>)> = Vec::new();
    for trace in traces {
        match groups.iter_mut().find(|(run_id, _)| *run_id == trace.run_id) {
            Some((_, group)) => group.push(trace),
            None => groups.push((trace.run_id.clone(), vec![trace])),
        }
    }
    groups
}
