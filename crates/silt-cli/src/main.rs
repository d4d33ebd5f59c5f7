//! Silt — command-line bufferbloat test.
//!
//! Runs one measurement session against a cooperative origin and prints
//! either a human summary or the full report as JSON.

use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use silt_engine::{Direction, EngineConfig, PhaseKind, Session};

/// Measure bufferbloat: how much latency your connection gains under load.
#[derive(Parser, Debug)]
#[command(name = "silt", version, about)]
struct Cli {
    /// Origin base URL exposing /ping, /download and /upload.
    #[arg(long, default_value = "http://localhost:8080")]
    origin: String,

    /// Baseline (unloaded) interval in seconds.
    #[arg(long, default_value_t = 5)]
    baseline_secs: u64,

    /// Each load interval in seconds.
    #[arg(long, default_value_t = 5)]
    load_secs: u64,

    /// Minimum warmup duration in seconds.
    #[arg(long, default_value_t = 15)]
    warmup_secs: u64,

    /// Print the full report as JSON instead of a summary.
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    let mut cfg = EngineConfig::new(&cli.origin);
    cfg.schedule.baseline = Duration::from_secs(cli.baseline_secs);
    cfg.schedule.load = Duration::from_secs(cli.load_secs);
    cfg.schedule.warmup_min = Duration::from_secs(cli.warmup_secs);
    cfg.schedule.warmup_max = cfg.schedule.warmup_max.max(cfg.schedule.warmup_min * 2);

    let (session, handle) = Session::new(cfg)?;

    // First ctrl-c cancels cleanly and still prints the partial report.
    tokio::spawn({
        let handle = handle.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\ninterrupted, draining streams...");
                handle.shutdown();
            }
        }
    });

    eprintln!("measuring against {} ...", cli.origin);
    let report = session.run().await?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!();
    println!("baseline latency     {:>8.1} ms", report.baseline_latency_ms);
    if let Some(p) = report.optimal_download {
        println!("download parameters  {:>8}", p.to_string());
    }
    if let Some(p) = report.optimal_upload {
        println!("upload parameters    {:>8}", p.to_string());
    }
    println!();
    println!("{:<16}{:>12}{:>12}{:>14}", "phase", "down Mbps", "up Mbps", "bloat ms");
    for phase in [
        PhaseKind::Download,
        PhaseKind::Upload,
        PhaseKind::Bidirectional,
    ] {
        let down = report.mean_throughput_mbps(Direction::Download, phase);
        let up = report.mean_throughput_mbps(Direction::Upload, phase);
        let delta = report.latency_delta_ms(phase);
        println!(
            "{:<16}{:>12}{:>12}{:>14}",
            phase.to_string(),
            down.map_or_else(|| "-".into(), |v| format!("{v:.1}")),
            up.map_or_else(|| "-".into(), |v| format!("{v:.1}")),
            delta.map_or_else(|| "-".into(), |v| format!("{v:+.1}")),
        );
    }
    if report.interrupted {
        println!("\n(session interrupted; results are partial)");
    }

    Ok(())
}
