// Example agent: polls host load and uptime and ships interval summaries

use anyhow::{Context, Result};
use clap::Parser;
use flushline::agent::Agent;
use flushline::collector::{CollectorConfigBuilder, HostSampleProvider, SampleRequest};
use flushline::config::{ConfigBuilder, ENV_PREFIX};
use flushline::metric::MetricIdentity;
use flushline::recorder::SampleSink;
use flushline::retry::RetryBuilder;
use flushline::util::logging;
use log::{info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Command line arguments for the example agent
#[derive(Parser, Debug)]
#[command(name = "agent", about = "Flushline example agent")]
struct Args {
    /// Path to a configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Collector host, overriding configuration
    #[arg(long)]
    host: Option<String>,

    /// Collector port, overriding configuration
    #[arg(long)]
    port: Option<u16>,

    /// Disable multicast discovery
    #[arg(long)]
    no_discovery: bool,

    /// Seconds between host polls
    #[arg(short, long, default_value = "5")]
    interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut builder = ConfigBuilder::new();
    if let Some(path) = &args.config {
        builder = builder.add_file(path);
    }
    builder = builder.add_env(ENV_PREFIX);
    if let Some(host) = &args.host {
        builder = builder.set("host", host.as_str());
    }
    if let Some(port) = args.port {
        builder = builder.set("port", port.to_string());
    }
    if args.no_discovery {
        builder = builder.set("discovery.enabled", "false");
    }

    let config = builder.build().context("Failed to load configuration")?;
    logging::init(&config.log_level);

    let mut agent: Agent = Agent::new(config)?;

    let retry = RetryBuilder::new().max_attempts(3).build();
    if let Err(e) = agent.connect(retry).await {
        warn!("Collector not reachable yet, will keep trying: {}", e);
    }
    agent.start()?;

    let provider = Arc::new(HostSampleProvider::new());
    let mut poller = agent.collector(
        CollectorConfigBuilder::new("host")
            .interval(Duration::from_secs(args.interval))
            .build(),
    );
    for request in [
        SampleRequest::Uptime,
        SampleRequest::LoadAverage1,
        SampleRequest::LoadAverage5,
        SampleRequest::LoadAverage15,
    ] {
        poller.provide(provider.clone(), request);
    }
    agent.spawn_collector(poller);

    // Heartbeat through the recorder, the same path application code would use
    let recorder = agent.recorder();
    let heartbeat = MetricIdentity::new("agent", "heartbeat");
    let mut ticker = tokio::time::interval(Duration::from_secs(1));

    info!("Agent running, press Ctrl-C to stop");
    loop {
        tokio::select! {
            _ = ticker.tick() => recorder.submit(&heartbeat, 1.0),
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    let report = agent.shutdown().await?;
    info!(
        "Delivered {} snapshots ({} lost)",
        report.delivered, report.undelivered
    );
    Ok(())
}
