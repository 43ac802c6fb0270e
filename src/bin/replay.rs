//! Replay recorded gateway payloads (one JSON object per line) through the
//! ingest path and print the resulting books.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use flash_feed::{EventBus, Ingest, PipelineConfig, PipelineError, RawPayload};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const PROGRESS_LOG_INTERVAL: usize = 100_000;

#[derive(Parser, Debug)]
#[command(name = "replay", about = "Replay a JSONL capture through the normalizer and LOB engine")]
struct Cli {
    /// Pipeline configuration (JSON)
    #[arg(long)]
    config: PathBuf,
    /// Captured payloads, one JSON object per line
    input: PathBuf,
    /// Skip the snapshot ring even if one is configured
    #[arg(long)]
    no_export: bool,
    /// Print every emitted stats event
    #[arg(long)]
    verbose: bool,
}

fn now_ns() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut config = PipelineConfig::from_path(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if cli.no_export {
        config.snapshot_ring = None;
    }
    let bus = EventBus::new(&config.bus)?;
    let mut ingest = Ingest::from_config(&config, bus)?;

    let reader = BufReader::new(File::open(&cli.input).with_context(|| format!("opening {}", cli.input.display()))?);
    let mut lines = 0usize;
    let mut emitted = 0usize;
    let mut unparsable = 0usize;
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        lines += 1;
        let payload: RawPayload = match serde_json::from_str(&line) {
            Ok(p) => p,
            Err(e) => {
                unparsable += 1;
                warn!(line = lines, error = %e, "skipping unparsable line");
                continue;
            }
        };
        match ingest.on_payload(&payload, now_ns()) {
            Ok(Some(stats)) => {
                emitted += 1;
                if cli.verbose {
                    println!("{stats:?}");
                }
            }
            Ok(None) | Err(PipelineError::Normalize(_)) | Err(PipelineError::StaleSequence { .. }) => {}
            Err(e) => warn!(line = lines, error = %e, "ingest error"),
        }
        if lines % PROGRESS_LOG_INTERVAL == 0 {
            info!(lines, emitted, "progress");
        }
    }

    let normalizer = ingest.normalizer().stats();
    let engine = ingest.engine().counters();
    println!("\n=== Replay Summary ===");
    println!("Lines:            {lines}");
    println!("Unparsable:       {unparsable}");
    println!("Ticks:            {}", normalizer.ticks);
    println!("Book updates:     {}", normalizer.book_updates);
    println!("Malformed:        {}", normalizer.malformed);
    println!("Stale:            {}", normalizer.stale);
    println!("Clamped ts:       {}", normalizer.clamped_ts);
    println!("Stats emitted:    {emitted} (suppressed {})", engine.suppressed);
    println!("Snapshots out:    {}", ingest.counters().snapshots_exported);
    println!("State hash:       {:#018x}", ingest.engine().state_hash());

    println!("\n=== Books ===");
    for spec in ingest.normalizer().registry().iter() {
        let Some(stats) = ingest.engine().stats(spec.id) else {
            println!("{:<10} no data", spec.symbol);
            continue;
        };
        let fmt_level = |level: Option<flash_feed::Level>| match level {
            Some(l) => format!("{} x {}", spec.codec.ticks_to_price(l.price), spec.codec.lots_to_size(l.size)),
            None => "-".to_string(),
        };
        println!(
            "{:<10} bid {:>18}  ask {:>18}  mid {:>10}  imb {:>6}{}",
            spec.symbol,
            fmt_level(stats.best_bid),
            fmt_level(stats.best_ask),
            stats
                .mid_x2
                .map_or_else(|| "-".to_string(), |m| spec.codec.mid_x2_to_price(m).to_string()),
            stats.imbalance.map_or_else(|| "-".to_string(), |i| format!("{i:.3}")),
            if stats.stale { "  STALE" } else { "" },
        );
    }
    Ok(())
}
