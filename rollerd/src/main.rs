//! AutoRoll daemon.
//!
//! Continuously proposes, monitors, and lands dependency-version rolls
//! from a child repository into a parent repository via a code-review
//! system. The daemon owns the decision loop and persistence; the repo
//! inspector and review services are external collaborators.

#![forbid(unsafe_code)]

mod controller;
mod counter;
mod events;
mod http_api;
mod manual;
mod metrics;
mod mode;
mod reconciler;
mod roll_scenario_tests;
mod state;
mod store;
mod throttle;

use anyhow::{Context, Result};
use clap::Parser;
use roller_common::{RestRepoInspector, RollerConfig, build_review_client};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use controller::Controller;
use events::EventBus;
use manual::ManualRollQueue;
use mode::ModeSource;
use reconciler::ExpectationsStore;
use state::RollStateMachine;
use store::RollRecordStore;
use throttle::Throttler;

#[derive(Parser)]
#[command(name = "rollerd")]
#[command(author, version, about = "AutoRoll daemon - dependency roll control loop")]
struct Cli {
    /// Path to the roller configuration (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Working directory override (counters, state, recent rolls)
    #[arg(short, long)]
    workdir: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration before logging so the configured level applies.
    let config = match &cli.config {
        Some(path) => RollerConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => RollerConfig::default(),
    };

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new(config.general.log_level.clone())
    };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    info!(roller = %config.general.roller_name, "starting AutoRoll daemon");

    let workdir = match &cli.workdir {
        Some(dir) => dir.clone(),
        None => config.general.resolve_workdir()?,
    };
    tokio::fs::create_dir_all(&workdir)
        .await
        .with_context(|| format!("creating working directory {}", workdir.display()))?;
    info!(workdir = %workdir.display(), "working directory ready");

    // Capability objects.
    let review = build_review_client(&config.review)?;
    let repo = Arc::new(RestRepoInspector::new(
        &config.repo,
        config.roll.max_roll_frequency,
    )?);
    info!(
        review = %config.review.base_url,
        repo = %config.repo.base_url,
        variant = %config.review.variant,
        "external services configured"
    );

    // Persistent state.
    let throttle = Throttler::load_or_create(
        &workdir,
        &config.safety_throttle,
        config.roll.max_roll_frequency,
    )
    .await?;
    let store = RollRecordStore::load_or_create(&workdir, config.roll.recent_rolls).await?;

    let events = EventBus::default();
    let expectations = ExpectationsStore::new();
    let manual = ManualRollQueue::new();
    let mode = ModeSource::file(workdir.join("mode"));

    let machine = RollStateMachine::load_or_create(
        &workdir,
        throttle,
        Arc::clone(&review),
        repo.clone() as Arc<dyn roller_common::RepoInspector>,
        store.clone(),
        events.clone(),
    )
    .await?;

    let controller = Controller::new(
        config.general.roller_name.clone(),
        machine,
        repo,
        review,
        store,
        manual,
        mode,
        expectations.clone(),
        events,
    );

    // Observability endpoints.
    if config.http.port > 0 {
        let http_state = http_api::HttpState {
            controller: Arc::clone(&controller),
            expectations,
            version: env!("CARGO_PKG_VERSION"),
            started_at: Instant::now(),
        };
        let _server = http_api::start_server(config.http.port, http_state).await;
    } else {
        info!("HTTP server disabled");
    }

    // Graceful shutdown on ctrl-c.
    {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!("failed to listen for shutdown signal: {err}");
                return;
            }
            info!("shutdown requested");
            controller.shutdown();
        });
    }

    controller
        .start(config.roll.tick_interval, config.roll.repo_tick_interval)
        .await?;
    info!("AutoRoll daemon stopped");
    Ok(())
}
