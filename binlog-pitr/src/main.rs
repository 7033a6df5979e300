mod args_parse;
mod binlog_source;
mod mysql_applier;
mod process_metrics;
mod service_configuration;

#[cfg(test)]
mod binlog_source_test;

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use crate::{
    args_parse::{Cli, CollectArgs, Commands, RecoverArgs},
    binlog_source::BinlogDirSource,
    mysql_applier::MysqlbinlogApplier,
    process_metrics::init_metrics,
    service_configuration::{
        load_configuration, load_configuration_from_env, parse_position, parse_target,
        ServiceConfiguration,
    },
};

use anyhow::{anyhow, Context, Result};
use binlog_pitr_core::StorageBackend;
use binlog_pitr_storage::{
    Collector, ObjectStore, Recoverer, RecovererConfig, RecoveryPlan, SegmentManifest,
};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("shutdown signal received, stopping");
            cancel.cancel();
        });
    }

    match cli.command {
        Commands::Collect(args) => run_collector(args, cancel).await,
        Commands::Recover(args) => run_recoverer(args, cancel).await,
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

fn open_manifest(config: &ServiceConfiguration) -> Result<SegmentManifest> {
    let store = ObjectStore::with_retries(config.backend.clone(), config.storage_retries)
        .context("failed to initialize object storage")?;
    info!(
        provider = store.provider(),
        stream = %config.stream_id,
        "object storage ready"
    );
    let backend: Arc<dyn StorageBackend> = Arc::new(store);
    Ok(SegmentManifest::new(backend, &config.stream_id)?)
}

fn load_service_configuration(config_file: Option<&str>) -> Result<ServiceConfiguration> {
    match config_file {
        Some(path) => load_configuration(Path::new(path)),
        None => {
            info!("no config file given, reading PITR_* environment variables");
            load_configuration_from_env()
        }
    }
}

async fn run_collector(args: CollectArgs, cancel: CancellationToken) -> Result<()> {
    let mut config = load_service_configuration(args.config_file.as_deref())?;

    // If `prom_exporter` is provided via command-line args, override the value from the config file
    if let Some(addr) = args.prom_exporter.as_deref() {
        let addr: SocketAddr = addr
            .parse()
            .context(format!("Failed to parse into Socket address: {}", addr))?;
        config.prom_exporter = Some(addr);
    }
    let settings = config
        .collector
        .take()
        .ok_or_else(|| anyhow!("the `collector` section is required to collect"))?;

    init_metrics(config.prom_exporter, &config.stream_id)?;
    let manifest = open_manifest(&config)?;
    let source = BinlogDirSource::new(
        settings.binlog_dir.clone(),
        settings.binlog_basename.clone(),
        settings.poll_interval,
    );
    info!(
        binlog_dir = %settings.binlog_dir.display(),
        cycle_secs = settings.collector.cycle_length.as_secs(),
        "starting collector"
    );
    let collector = Collector::new(settings.collector, manifest, Arc::new(source));

    if args.once {
        let report = collector.run_cycle(&cancel).await?;
        println!(
            "{} {:?}: ({}, {}] {} events, {} bytes",
            report.key, report.outcome, report.start, report.end, report.events, report.payload_bytes
        );
        return Ok(());
    }

    collector.run(cancel).await?;
    info!("collector stopped");
    Ok(())
}

async fn run_recoverer(args: RecoverArgs, cancel: CancellationToken) -> Result<()> {
    let mut config = load_service_configuration(args.config_file.as_deref())?;
    let settings = config
        .recoverer
        .take()
        .ok_or_else(|| anyhow!("the `recoverer` section is required to recover"))?;

    // Targets given on the command line replace the configured one
    let target = match parse_target(args.target_time.as_deref(), args.target_position.as_deref())? {
        Some(target) => target,
        None => settings
            .target
            .ok_or_else(|| anyhow!("a recovery target is required: --target-time or --target-position"))?,
    };
    let base = match args.base_position.as_deref() {
        Some(p) => parse_position("base_position", p)?,
        None => settings.base,
    };

    init_metrics(config.prom_exporter, &config.stream_id)?;
    let manifest = open_manifest(&config)?;
    let recoverer = Recoverer::new(
        RecovererConfig {
            base,
            target,
            allow_partial_target: args.allow_partial_target || settings.allow_partial_target,
            read_retry: settings.read_retry,
        },
        manifest,
    );

    if args.dry_run {
        let plan = recoverer.plan().await?;
        print_plan(&plan);
        return Ok(());
    }

    info!(%base, %target, "starting recovery");
    let sink = MysqlbinlogApplier::new(settings.mysql, base);
    let report = recoverer.run(sink, &cancel).await?;
    println!(
        "recovered through {} (cutoff {}{}): {} segments, {} events applied, {} skipped, {} discarded",
        report.apply.applied_through,
        report.cutoff,
        if report.partial { ", partial" } else { "" },
        report.apply.segments_applied,
        report.apply.events_applied,
        report.apply.events_skipped,
        report.apply.events_discarded
    );
    Ok(())
}

fn print_plan(plan: &RecoveryPlan) {
    println!("base:   {}", plan.base);
    println!("target: {}", plan.target);
    println!(
        "cutoff: {}{}",
        plan.cutoff,
        if plan.partial { " (partial, target not captured yet)" } else { "" }
    );
    for entry in &plan.segments {
        let h = &entry.header;
        println!(
            "  {}  ({}, {}]  {} events  {} .. {}",
            entry.key,
            h.start,
            h.end,
            h.event_count,
            h.captured_from.to_rfc3339(),
            h.captured_to.to_rfc3339()
        );
    }
    for issue in &plan.issues {
        println!(
            "  superseded {} by {} at {}",
            issue.superseded_key, issue.winner_key, issue.start
        );
    }
}
