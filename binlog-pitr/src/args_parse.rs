use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "binlog-pitr")]
#[command(about = "Continuous binlog capture to object storage and point-in-time recovery")]
#[command(version)]
pub(crate) struct Cli {
    #[command(subcommand)]
    pub(crate) command: Commands,
}

#[derive(Debug, Subcommand)]
pub(crate) enum Commands {
    #[command(about = "Collect binlogs into object storage, one segment per cycle")]
    Collect(CollectArgs),

    #[command(about = "Replay collected binlogs into a database up to a recovery target")]
    Recover(RecoverArgs),
}

#[derive(Debug, Args)]
pub(crate) struct CollectArgs {
    /// Path to the YAML config file; without one, settings come from `PITR_*` variables
    #[arg(long, env = "PITR_CONFIG")]
    pub(crate) config_file: Option<String>,

    /// Prometheus exporter http address, overrides `prom_exporter`
    #[arg(long)]
    pub(crate) prom_exporter: Option<String>,

    /// Run a single collection cycle and exit
    #[arg(long)]
    pub(crate) once: bool,
}

#[derive(Debug, Args)]
pub(crate) struct RecoverArgs {
    /// Path to the YAML config file; without one, settings come from `PITR_*` variables
    #[arg(long, env = "PITR_CONFIG")]
    pub(crate) config_file: Option<String>,

    /// Recover every transaction committed at or before this RFC 3339 time
    #[arg(long, env = "PITR_TARGET_TIME", conflicts_with = "target_position")]
    pub(crate) target_time: Option<String>,

    /// Recover up to this binlog position, `<file_seq>:<offset>`
    #[arg(long, env = "PITR_TARGET_POSITION")]
    pub(crate) target_position: Option<String>,

    /// Position the target database is already consistent up to
    #[arg(long, env = "PITR_BASE_POSITION")]
    pub(crate) base_position: Option<String>,

    /// Replay everything captured when the target lies beyond the newest segment
    #[arg(long)]
    pub(crate) allow_partial_target: bool,

    /// Print the recovery plan without applying anything
    #[arg(long)]
    pub(crate) dry_run: bool,
}
