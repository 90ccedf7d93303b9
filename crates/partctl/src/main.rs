mod cli;
mod plan;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use partition_manager::load_chip_config;
use partition_manager::PartitionManager;
use partition_manager::Services;
use partition_manager::SnapshotStore;
use serde::Serialize;

use crate::cli::ApplyArgs;
use crate::cli::Cli;
use crate::cli::Commands;
use crate::cli::RestoreArgs;
use crate::plan::PartitionPlan;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();
    let _guard = match &cli.log_file {
        Some(path) => Some(utils::logging::init_with_file(path)?),
        None => {
            utils::logging::init();
            None
        }
    };

    let chip = load_chip_config(&cli.chip)?;
    tracing::info!(chip = %chip.name, "loaded chip table");
    let mut manager = PartitionManager::new(chip, cli.device_uuid, Services::in_memory())
        .context("failed to enable partitioning")?;

    match cli.command {
        Commands::Profiles => print_json(&manager.describe_partitions()),
        Commands::Apply(args) => run_apply(&mut manager, args),
        Commands::Restore(args) => run_restore(&mut manager, args),
    }
}

fn run_apply(manager: &mut PartitionManager, args: ApplyArgs) -> Result<()> {
    let plan = PartitionPlan::load(&args.plan)?;
    let created = plan.apply(manager)?;
    tracing::info!(count = created.len(), "partition plan applied");

    if let Some(path) = args.save {
        SnapshotStore::new(&path)
            .save(&manager.save_topology())
            .map_err(|report| anyhow::anyhow!("{report:?}"))
            .with_context(|| format!("failed to save topology to {}", path.display()))?;
    }
    print_json(&manager.describe_all_gpu_instances())
}

fn run_restore(manager: &mut PartitionManager, args: RestoreArgs) -> Result<()> {
    let snapshot = SnapshotStore::new(&args.topology)
        .load()
        .map_err(|report| anyhow::anyhow!("{report:?}"))
        .with_context(|| format!("failed to load topology from {}", args.topology.display()))?;
    let restored = manager
        .restore_topology(&snapshot)
        .context("failed to restore topology")?;
    tracing::info!(count = restored.len(), "topology restored");
    print_json(&manager.describe_all_gpu_instances())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("failed to serialize output")?;
    println!("{json}");
    Ok(())
}
