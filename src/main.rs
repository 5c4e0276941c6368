use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use conductor::{
    config, demo_stage_set, init_config, init_telemetry, shutdown_telemetry, DemoOptions, RegistrySettings,
    ShutdownCoordinator, ShutdownOutcome, WorkflowRegistry, WorkflowSnapshot, MAX_DEMO_TASKS,
};

#[derive(Parser)]
#[command(name = "conductor")]
#[command(about = "Staged workflow orchestration: intake, planning, implementation, review")]
#[command(long_about = "Conductor drives a request through intake, planning, implementation and \
                       review stages, enforcing retry limits, deadlines and a concurrency ceiling. \
                       Try 'conductor run \"build a calculator\"' to watch a workflow end to end.")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one workflow on the built-in demo stages and print its progress
    Run {
        /// The request to orchestrate
        request: String,
        /// Number of tasks the planner produces
        #[arg(long, default_value = "3", value_parser = clap::value_parser!(u64).range(1..=MAX_DEMO_TASKS as u64))]
        tasks: u64,
        /// Revisions the implementer needs for every task
        #[arg(long, default_value = "0")]
        revisions: u32,
        /// Clarification rounds intake asks for before planning
        #[arg(long, default_value = "1")]
        clarification_rounds: u32,
        /// Attribute the workflow to this user
        #[arg(long)]
        user: Option<String>,
    },
    /// Show the effective configuration
    Config {
        /// Write the configuration to this file instead of printing it
        #[arg(long)]
        write: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = config()?;
    init_telemetry(&config.observability)?;
    init_config()?;

    let result = match cli.command {
        Commands::Run {
            request,
            tasks,
            revisions,
            clarification_rounds,
            user,
        } => {
            let options = DemoOptions {
                clarification_rounds,
                tasks: usize::try_from(tasks)?,
                revisions_per_task: revisions,
            };
            tokio::runtime::Runtime::new()?
                .block_on(async { run_command(request, user, options).await })
        }
        Commands::Config { write } => config_command(write),
    };

    shutdown_telemetry();
    result
}

async fn run_command(request: String, user: Option<String>, options: DemoOptions) -> Result<()> {
    let config = config()?;
    let registry = Arc::new(WorkflowRegistry::new(
        demo_stage_set(&options),
        RegistrySettings::from(&config.orchestrator),
    ));

    let id = match user {
        Some(user) => registry.start_for_user(request.clone(), user).await?,
        None => registry.start(request.clone()).await?,
    };
    println!("🚀 Started workflow {id}");
    println!("   Request: {request}");
    println!();

    let mut feed = registry.subscribe(id).await?;
    let interrupted = tokio::select! {
        _ = follow(&mut feed) => false,
        _ = tokio::signal::ctrl_c() => true,
    };

    if interrupted {
        println!();
        println!("🛑 Interrupted - shutting down");
    }

    let coordinator =
        ShutdownCoordinator::new(Arc::clone(&registry), config.orchestrator.shutdown_grace());
    let outcome = coordinator.shutdown_all_services().await;

    let snapshot = registry.status(id).await?;
    println!();
    println!("📋 Final snapshot:");
    println!("{}", serde_json::to_string_pretty(&snapshot)?);

    println!();
    println!("📊 Stage statistics:");
    for stats in registry.stage_stats() {
        println!(
            "  {:<12} runs={:<3} ok={:<3} errors={:<3} units={:<6} avg={:.1}ms",
            stats.stage.as_str(),
            stats.total_executions,
            stats.success_count,
            stats.error_count,
            stats.total_resource_units,
            stats.average_execution_ms
        );
    }

    if let ShutdownOutcome::Forced { aborted } = outcome {
        println!();
        println!("⚠️  {} workflow(s) aborted at shutdown", aborted.len());
    }

    match snapshot.failure {
        None => {
            println!();
            println!("✅ Workflow {} ({} resource units)", snapshot.status, snapshot.total_resource_units);
            Ok(())
        }
        Some(code) => Err(anyhow::anyhow!(
            "workflow {id} ended {} ({code})",
            snapshot.status
        )),
    }
}

/// Print a line whenever the stage or status changes, until terminal.
async fn follow(feed: &mut tokio::sync::watch::Receiver<WorkflowSnapshot>) {
    let mut last = None;
    loop {
        let snapshot = feed.borrow_and_update().clone();
        let position = (snapshot.status, snapshot.current_stage, snapshot.stage_invocations);
        if last != Some(position) {
            let stage = snapshot
                .current_stage
                .map(|stage| stage.to_string())
                .unwrap_or_else(|| "-".to_string());
            println!(
                "  ⏳ [{:>3}] {:<12} {:<10} units={}",
                snapshot.stage_invocations, stage, snapshot.status, snapshot.total_resource_units
            );
            last = Some(position);
        }

        if snapshot.is_terminal() || feed.changed().await.is_err() {
            return;
        }
    }
}

fn config_command(write: Option<PathBuf>) -> Result<()> {
    let config = config()?;
    match write {
        Some(path) => {
            config.save_to_file(&path)?;
            println!("✅ Configuration written to {}", path.display());
        }
        None => print!("{}", toml::to_string_pretty(config)?),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_count_outside_demo_range_is_rejected() {
        for tasks in ["0", "65", "18446744073709551615"] {
            let parsed = Cli::try_parse_from(["conductor", "run", "x", "--tasks", tasks]);
            assert!(parsed.is_err(), "--tasks {tasks} was accepted");
        }
    }

    #[test]
    fn test_task_count_within_range_parses() {
        let cli = Cli::try_parse_from(["conductor", "run", "x", "--tasks", "64"]).unwrap();
        assert!(matches!(cli.command, Commands::Run { tasks: 64, .. }));
    }
}
