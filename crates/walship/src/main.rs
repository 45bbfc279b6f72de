#![warn(missing_docs)]

//! walship-sim: drives a shipper against an in-process simulated peer cluster
//! that randomly fails deliveries, then prints the shipping metrics.

use anyhow::Result;
use async_trait::async_trait;
use clap::Parser;
use rand::Rng;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use walship::delivery::SinkDelivery;
use walship::error::RemoteErrorKind;
use walship::metrics::SourceMetrics;
use walship::sink_manager::{SinkManager, StaticEndpoints};
use walship::{
    InterClusterShipper, Liveness, PeerStateFlag, ReplicateBatch, ShipError, ShipperConfig,
    SinkHandle, WalEntry,
};

#[derive(Parser)]
#[command(name = "walship-sim")]
#[command(about = "Ship synthetic WAL batches to a simulated peer cluster", long_about = None)]
struct Cli {
    /// Shipper config file (.toml or .json).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Region servers in the simulated peer cluster.
    #[arg(long, default_value = "20")]
    servers: usize,

    /// Batches to ship.
    #[arg(short, long, default_value = "10")]
    batches: usize,

    /// Entries per batch.
    #[arg(short, long, default_value = "250")]
    entries: usize,

    /// Probability that a single delivery fails.
    #[arg(long, default_value = "0.1")]
    failure_rate: f64,

    /// Simulated delivery latency in milliseconds.
    #[arg(long, default_value = "5")]
    latency_ms: u64,
}

/// Peer cluster stand-in that fails a fraction of deliveries.
struct SimulatedPeer {
    failure_rate: f64,
    latency: Duration,
}

#[async_trait]
impl SinkDelivery for SimulatedPeer {
    async fn deliver(&self, sink: &SinkHandle, _entries: &[WalEntry]) -> walship::Result<()> {
        tokio::time::sleep(self.latency).await;

        let (fail, kind) = {
            let mut rng = rand::thread_rng();
            (rng.gen_bool(self.failure_rate), rng.gen_range(0..4u8))
        };
        if !fail {
            return Ok(());
        }
        Err(match kind {
            0 => ShipError::SocketTimeout {
                sink: sink.addr.clone(),
                timeout_ms: self.latency.as_millis() as u64,
            },
            1 => ShipError::ConnectionRefused {
                sink: sink.addr.clone(),
            },
            2 => ShipError::Remote {
                kind: RemoteErrorKind::Other,
                msg: "region is busy".to_string(),
            },
            _ => ShipError::Transport {
                msg: "connection reset by peer".to_string(),
            },
        })
    }
}

fn synthetic_batch(batch_no: usize, entries: usize) -> ReplicateBatch {
    let now_ms = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    let base = (batch_no * entries) as u64;
    let entries = (0..entries as u64)
        .map(|i| {
            WalEntry::new(
                base + i,
                format!("region-{}", i % 37),
                now_ms,
                format!("row-{}", base + i),
            )
        })
        .collect();
    ReplicateBatch::new("sim-wal-group", entries)
}

/// Defaults for runs without `--config`: short sleeps so a timeout backs off
/// for one second instead of five minutes.
fn sim_config() -> ShipperConfig {
    ShipperConfig {
        sleep_for_retries_ms: 100,
        socket_timeout_multiplier: Some(10),
        ..Default::default()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    if !(0.0..=1.0).contains(&cli.failure_rate) {
        anyhow::bail!("--failure-rate must be between 0 and 1");
    }

    let config = match &cli.config {
        Some(path) => ShipperConfig::from_file(path)?,
        None => sim_config(),
    };
    tracing::info!(?config, servers = cli.servers, "walship-sim starting");

    let servers = (0..cli.servers)
        .map(|i| format!("rs{}.sim:16020", i))
        .collect();
    let sinks = Arc::new(SinkManager::new(
        config.sink_manager_config(),
        Arc::new(StaticEndpoints::new(servers)),
    ));
    let metrics = Arc::new(SourceMetrics::new());
    let shipper = Arc::new(InterClusterShipper::new(
        config,
        sinks,
        Arc::new(SimulatedPeer {
            failure_rate: cli.failure_rate,
            latency: Duration::from_millis(cli.latency_ms),
        }),
        metrics.clone(),
        Arc::new(PeerStateFlag::new(true)),
        Liveness::new(),
    )?);

    {
        let shipper = Arc::clone(&shipper);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupted, stopping shipper");
                shipper.stop();
            }
        });
    }

    for batch_no in 0..cli.batches {
        let batch = synthetic_batch(batch_no, cli.entries);
        let report = shipper.replicate_with_report(&batch).await;
        tracing::info!(
            batch = batch_no,
            rounds = report.rounds,
            delivered = report.delivered_entries,
            phase = ?report.phase,
            "batch finished"
        );
        if !report.succeeded() {
            break;
        }
    }

    shipper.stop();
    print!("{}", metrics.format_prometheus());
    Ok(())
}
