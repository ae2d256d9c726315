//! Undercity CLI entry point.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::Path;
use std::process::ExitCode;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use undercity::cli::{Cli, Commands, TaskArgs, TaskCommands};
use undercity::domain::errors::EngineError;
use undercity::domain::models::{EngineConfig, Task};
use undercity::infrastructure::agent::CliAgentClient;
use undercity::infrastructure::config::ConfigLoader;
use undercity::infrastructure::logging::Logger;
use undercity::infrastructure::lockfile::GrindLock;
use undercity::services::governor::RateLimitGovernor;
use undercity::services::grind::GrindSession;
use undercity::services::task_store::TaskStore;

/// Minimum free space required to start a grind session.
const MIN_FREE_BYTES: u64 = 1 << 30;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            match e.downcast_ref::<EngineError>() {
                Some(EngineError::LockHeld { .. }) => ExitCode::from(2),
                Some(EngineError::DiskSpace { .. }) => ExitCode::from(3),
                _ => ExitCode::FAILURE,
            }
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = match &cli.config {
        Some(path) => ConfigLoader::load_from_file(path)?,
        None => ConfigLoader::load()?,
    };

    match cli.command {
        Commands::Grind(args) => {
            args.apply(&mut config);
            ConfigLoader::validate(&config)?;
            grind(config).await
        }
        Commands::Task(args) => task_command(&config, args).await,
        Commands::Status => status(&config).await,
    }
}

async fn grind(config: EngineConfig) -> Result<()> {
    let _logger = Logger::init(&config.logging, &config.state_dir)
        .context("Failed to initialise logging")?;

    check_disk_space(&config.repo_path)?;

    // Exclusive engine instance per repository.
    let lock = GrindLock::acquire(&config.state_dir)?;

    let agent = Arc::new(CliAgentClient::new(config.agent.clone()));
    let session = GrindSession::bootstrap(config, agent)
        .await
        .context("Failed to bootstrap engine")?;

    // Ctrl-C raises the cooperative drain flag; a second one aborts.
    let drain = session.drain_flag();
    tokio::spawn(async move {
        let mut count = 0u32;
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            count += 1;
            if count == 1 {
                eprintln!("drain requested; finishing in-flight work (^C again to abort)");
                drain.store(true, Ordering::SeqCst);
            } else {
                std::process::exit(1);
            }
        }
    });

    let summary = session.run().await?;
    println!("{}", summary.render_table());

    lock.release();
    Ok(())
}

async fn task_command(config: &EngineConfig, args: TaskArgs) -> Result<()> {
    let store = TaskStore::load(config.state_dir.join("tasks.json"))?;
    match args.command {
        TaskCommands::Add {
            id,
            objective,
            priority,
            depends_on,
            tag,
        } => {
            let mut task = Task::new(id, objective).with_priority(priority);
            for dep in depends_on {
                task = task.with_dependency(dep);
            }
            for t in tag {
                task = task.with_tag(t);
            }
            let id = task.id.clone();
            store.add(task).await?;
            println!("added {id}");
        }
        TaskCommands::List => {
            for task in store.list().await {
                println!(
                    "{:<12} {:<12} p{:<5} {}",
                    task.id,
                    task.status.as_str(),
                    task.priority,
                    task.objective
                );
            }
        }
    }
    Ok(())
}

async fn status(config: &EngineConfig) -> Result<()> {
    let governor = RateLimitGovernor::new(config.governor.clone())
        .with_snapshot(config.state_dir.join("governor.json"));
    let summary = governor.usage_summary().await;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn check_disk_space(repo: &Path) -> Result<()> {
    let stat = nix::sys::statvfs::statvfs(repo)
        .map_err(|e| EngineError::State(format!("statvfs failed: {e}")))?;
    let available = stat.blocks_available() as u64 * stat.fragment_size() as u64;
    if available < MIN_FREE_BYTES {
        return Err(EngineError::DiskSpace {
            available_bytes: available,
            required_bytes: MIN_FREE_BYTES,
        }
        .into());
    }
    Ok(())
}
