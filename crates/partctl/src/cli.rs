use std::path::PathBuf;

use clap::Parser;
use clap::Subcommand;
use uuid::Uuid;

#[derive(Parser)]
#[command(about, long_about, version)]
pub struct Cli {
    #[arg(
        long,
        env = "PARTCTL_CHIP",
        value_hint = clap::ValueHint::FilePath,
        help = "Chip table describing profiles and device resources, e.g. demos/chip.yaml"
    )]
    pub chip: PathBuf,

    #[arg(
        long,
        env = "PARTCTL_DEVICE_UUID",
        default_value_t = Uuid::nil(),
        help = "UUID of the physical device, used as the namespace of instance UUIDs"
    )]
    pub device_uuid: Uuid,

    #[arg(
        long,
        env = "PARTCTL_LOG_FILE",
        value_hint = clap::ValueHint::FilePath,
        help = "Also write logs to a daily rolling file at this path"
    )]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Print the partition profiles of the chip as JSON
    Profiles,
    /// Create the GPU and compute instances of a plan
    Apply(ApplyArgs),
    /// Recreate a saved topology on a fresh device
    Restore(RestoreArgs),
}

#[derive(Parser)]
pub struct ApplyArgs {
    #[arg(
        long,
        value_hint = clap::ValueHint::FilePath,
        help = "Partition plan in YAML, e.g. demos/plan.yaml"
    )]
    pub plan: PathBuf,

    #[arg(
        long,
        value_hint = clap::ValueHint::FilePath,
        help = "Save the resulting topology as JSON to this path"
    )]
    pub save: Option<PathBuf>,
}

#[derive(Parser)]
pub struct RestoreArgs {
    #[arg(
        long,
        value_hint = clap::ValueHint::FilePath,
        help = "Topology JSON written by `apply --save`"
    )]
    pub topology: PathBuf,
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_apply() {
        let cli = Cli::try_parse_from([
            "partctl",
            "--chip",
            "chip.yaml",
            "apply",
            "--plan",
            "plan.yaml",
            "--save",
            "topology.json",
        ])
        .unwrap();
        assert_eq!(cli.chip, PathBuf::from("chip.yaml"));
        assert_eq!(cli.device_uuid, Uuid::nil());
        match cli.command {
            Commands::Apply(args) => {
                assert_eq!(args.plan, PathBuf::from("plan.yaml"));
                assert_eq!(args.save, Some(PathBuf::from("topology.json")));
            }
            _ => panic!("expected apply"),
        }
    }
}
