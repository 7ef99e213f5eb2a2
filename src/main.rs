mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Command};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{info, warn};
use uuid::Uuid;

use lingua_relay::api::SubmitRequest;
use lingua_relay::config::RelayConfig;
use lingua_relay::engine::JobEngine;
use lingua_relay::poller::{HttpStatusClient, StatusPoller};
use lingua_relay::scheduler::RetryScheduler;
use lingua_relay::store::InMemoryJobStore;
use lingua_relay::translator::SimulatedTranslator;
use lingua_relay::{telemetry, ui};

const LANGUAGE_PAIRS: &[(&str, &str)] = &[
    ("en", "es"),
    ("en", "fr"),
    ("pt", "en"),
    ("de", "it"),
    ("ja", "en"),
];

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => RelayConfig::load_from(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => RelayConfig::load()?,
    };
    telemetry::init_tracing(&config.logging, cli.verbose)?;

    match cli.command {
        Command::Demo {
            jobs,
            error_rate,
            cancel_one,
            metrics,
        } => run_demo(config, jobs, error_rate, cancel_one, metrics).await,
        Command::Watch { job_id, url } => run_watch(&config, job_id, &url).await,
    }
}

async fn run_demo(
    mut config: RelayConfig,
    jobs: usize,
    error_rate: Option<f64>,
    cancel_one: bool,
    show_metrics: bool,
) -> Result<()> {
    if let Some(rate) = error_rate {
        config.worker.error_rate = rate;
        config.validate()?;
    }

    let engine = JobEngine::builder(InMemoryJobStore::new())
        .with_config(&config)
        .translator(SimulatedTranslator::from_config(&config.worker))
        .build()?;
    engine.recover().await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler =
        RetryScheduler::new(engine.clone(), config.dlq.scan_interval()).spawn(shutdown_rx);

    let board = ui::ProgressBoard::new();
    let mut followers = JoinSet::new();
    let mut ids = Vec::with_capacity(jobs);

    for (n, (source, target)) in LANGUAGE_PAIRS.iter().cycle().take(jobs).enumerate() {
        let request = SubmitRequest::new(*source, *target)
            .with_metadata("demo_index", serde_json::json!(n));
        let response = engine.submit(request).await?;
        let job_id = response.job_id;
        ids.push(job_id);

        let mut subscription = engine.subscribe(job_id).await?;
        let progress = board.track(job_id, &format!("{source}→{target}"));
        followers.spawn(async move {
            let mut last = None;
            while let Some(event) = subscription.events.recv().await {
                if event.is_terminal() {
                    progress.finish(&event);
                } else {
                    progress.update(&event);
                }
                last = Some(event);
            }
            if last.as_ref().is_none_or(|e| !e.is_terminal()) {
                progress.abandon("stream closed without a final status");
            }
        });
    }

    if cancel_one {
        if let Some(&job_id) = ids.first() {
            match engine.cancel(job_id).await {
                Ok(_) => board.println(format!("cancelled {job_id}")),
                Err(err) => warn!(%job_id, %err, "cancel rejected"),
            }
        }
    }

    while let Some(joined) = followers.join_next().await {
        joined.context("event follower panicked")?;
    }

    let _ = shutdown_tx.send(true);
    scheduler.await.context("retry scheduler panicked")?;

    let mut snapshots = Vec::with_capacity(ids.len());
    for job_id in ids {
        snapshots.push(engine.get_status(job_id).await?);
    }
    ui::print_summary(&snapshots, engine.metrics());

    if show_metrics {
        println!();
        print!("{}", engine.metrics().render()?);
    }
    info!(jobs = snapshots.len(), "demo finished");
    Ok(())
}

async fn run_watch(config: &RelayConfig, job_id: Uuid, url: &str) -> Result<()> {
    let client = HttpStatusClient::new(url)?;
    let poller = StatusPoller::new(client, config.polling.poll_config());

    let spinner = ui::watch_spinner(job_id);
    let outcome = poller.wait_for_completion(job_id).await;
    spinner.finish_and_clear();

    let snapshot = outcome.with_context(|| format!("watching job {job_id} at {url}"))?;
    ui::print_snapshot(&snapshot);
    Ok(())
}
