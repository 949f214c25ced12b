//! Subcommand implementations
//!
//! Settings are layered: defaults, then the TOML file, then `DEVICE_ID` /
//! `INGEST_URL`, then explicit flags.

use anyhow::{Context, Result};
use clap::ArgMatches;
use serde::Serialize;
use std::path::{Path, PathBuf};
use uptrack_core::{
    run_simulation, DeviceConfig, Outbox, OutboxOptions, OutboxStats, OverflowPolicy,
    UpdateRecord,
};
use uptrack_ingest::IngestConfig;

pub(crate) fn device_config(args: &ArgMatches) -> Result<DeviceConfig> {
    let mut config = match args.get_one::<PathBuf>("config") {
        Some(path) => DeviceConfig::load(path)?,
        None => DeviceConfig::new(),
    }
    .with_env_overrides();

    if let Some(url) = args.get_one::<String>("url") {
        config.endpoint.clone_from(url);
    }
    if let Some(device) = args.get_one::<String>("device") {
        config.device_id.clone_from(device);
    }
    set(&mut config.sessions, args.get_one::<u32>("sessions"));
    set(&mut config.min_session_minutes, args.get_one::<u32>("min-session-min"));
    set(&mut config.max_session_minutes, args.get_one::<u32>("max-session-min"));
    set(&mut config.tick_interval_ms, args.get_one::<u64>("tick-ms"));
    set(&mut config.tick_seconds, args.get_one::<u64>("tick-seconds"));
    set(&mut config.emit_every_ticks, args.get_one::<u32>("update-every"));
    set(&mut config.offline_probability, args.get_one::<f64>("offline-prob"));
    set(&mut config.server_error_probability, args.get_one::<f64>("server-err-prob"));
    set(&mut config.batch_size, args.get_one::<usize>("batch"));
    set(&mut config.flush_interval_ms, args.get_one::<u64>("flush-every-ms"));
    set(&mut config.jitter_ms, args.get_one::<u64>("jitter-ms"));
    set(&mut config.request_timeout_ms, args.get_one::<u64>("timeout-ms"));
    if let Some(seed) = args.get_one::<u64>("seed") {
        config.seed = Some(*seed);
    }
    if let Some(path) = args.get_one::<PathBuf>("outbox") {
        config.outbox_path = Some(path.clone());
    }
    if let Some(capacity) = args.get_one::<usize>("outbox-capacity") {
        config.outbox_capacity = Some(*capacity);
    }
    if let Some(policy) = args.get_one::<String>("overflow") {
        config.overflow_policy = parse_overflow(policy)?;
    }
    if let Some(path) = args.get_one::<PathBuf>("checkpoint") {
        config.checkpoint_path = Some(path.clone());
    }
    if args.get_flag("verbose") {
        config.verbose = true;
    }
    if args.get_flag("quiet") {
        config.verbose = false;
    }
    Ok(config)
}

fn set<T: Copy>(field: &mut T, value: Option<&T>) {
    if let Some(value) = value {
        *field = *value;
    }
}

fn parse_overflow(raw: &str) -> Result<OverflowPolicy> {
    match raw {
        "reject" => Ok(OverflowPolicy::Reject),
        "evict-oldest" => Ok(OverflowPolicy::EvictOldest),
        other => anyhow::bail!("unknown overflow policy {other:?} (reject | evict-oldest)"),
    }
}

pub(crate) async fn simulate(config: DeviceConfig) -> Result<()> {
    let report = run_simulation(config)
        .await
        .context("simulation failed")?;

    println!("{}", report.summary());
    Ok(())
}

pub(crate) fn ingest_config(args: &ArgMatches) -> Result<IngestConfig> {
    let mut config = match args.get_one::<PathBuf>("config") {
        Some(path) => IngestConfig::load(path)?,
        None => IngestConfig::new(),
    };
    if let Some(listen) = args.get_one::<String>("listen") {
        config.listen.clone_from(listen);
    }
    if let Some(path) = args.get_one::<PathBuf>("journal") {
        config.journal_path = Some(path.clone());
    }
    if let Some(devices) = args.get_many::<String>("register") {
        config.devices.extend(devices.cloned());
    }
    Ok(config)
}

pub(crate) async fn serve(config: IngestConfig) -> Result<()> {
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("cannot listen for ctrl-c: {e}");
        }
    };
    uptrack_ingest::serve(&config, shutdown)
        .await
        .context("ingest server failed")
}

#[derive(Debug, Serialize)]
struct OutboxView {
    stats: OutboxStats,
    pending: Vec<UpdateRecord>,
}

pub(crate) fn inspect_outbox(path: &Path, json: bool) -> Result<()> {
    anyhow::ensure!(path.exists(), "no outbox journal at {}", path.display());
    let outbox = Outbox::open(path, OutboxOptions::new())
        .with_context(|| format!("cannot open outbox {}", path.display()))?;
    let view = OutboxView {
        stats: outbox.stats(),
        pending: outbox.pending(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&view)?);
        return Ok(());
    }

    println!("Outbox {}", path.display());
    println!("  pending:   {}", view.stats.pending);
    println!("  enqueued:  {}", view.stats.enqueued);
    println!("  delivered: {}", view.stats.delivered);
    println!("  evicted:   {}", view.stats.evicted);
    println!("  rejected:  {}", view.stats.rejected);
    for record in &view.pending {
        println!("  - {} {}", record.device_identifier, record.label());
    }
    Ok(())
}
