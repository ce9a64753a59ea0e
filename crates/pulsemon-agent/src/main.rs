mod client;
mod config;
mod poller;
mod reporter;
#[cfg(test)]
mod testing;

use anyhow::Result;
use client::ReportClient;
use config::AgentConfig;
use poller::{Poller, Samples};
use reporter::Reporter;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing_subscriber::EnvFilter;

#[allow(clippy::print_stderr)]
fn print_usage() {
    eprintln!("Usage:");
    eprintln!("  pulsemon-agent [config.toml]    Start the agent");
    eprintln!();
    eprintln!("Environment overrides: ADDRESS, POLL_INTERVAL, REPORT_INTERVAL, KEY");
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("pulsemon=info".parse()?))
        .init();

    let args: Vec<String> = std::env::args().collect();
    match args.get(1).map(|s| s.as_str()) {
        Some("--help" | "-h") => {
            print_usage();
            Ok(())
        }
        path => run_agent(AgentConfig::resolve(path)?).await,
    }
}

async fn run_agent(config: AgentConfig) -> Result<()> {
    let samples = Arc::new(Mutex::new(Samples::new()));
    let mut poller = Poller::new(pulsemon_collector::default_collectors());
    let reporter = Arc::new(Reporter::new(
        ReportClient::new(&config)?,
        samples.clone(),
        config.batch_size,
    ));

    let mut poll_tick = interval(config.poll_interval());
    let mut report_tick = interval(config.report_interval());
    report_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    report_tick.tick().await;
    let mut in_flight: Option<JoinHandle<()>> = None;

    tracing::info!(
        server = %config.base_url(),
        poll_interval_secs = config.poll_interval_secs,
        report_interval_secs = config.report_interval_secs,
        batch_size = config.batch_size,
        signing = config.hash_key.is_some(),
        "Agent started"
    );

    loop {
        tokio::select! {
            _ = poll_tick.tick() => {
                let readings = poller.poll();
                samples.lock().await.record(readings);
            }
            _ = report_tick.tick() => {
                if in_flight.as_ref().is_some_and(|h| !h.is_finished()) {
                    tracing::warn!("Previous report still running, skipping this one");
                    continue;
                }
                let reporter = reporter.clone();
                in_flight = Some(tokio::spawn(async move {
                    reporter.report_once().await;
                }));
            }
            _ = signal::ctrl_c() => {
                tracing::info!("Shutting down gracefully");
                break;
            }
        }
    }

    if let Some(handle) = in_flight {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "Report task failed");
        }
    }
    tracing::info!("Agent stopped");
    Ok(())
}
