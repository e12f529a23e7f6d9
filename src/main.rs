//! # Echo operator
//!
//! Entry point for the `echo-operator` binary.
//!
//! ## Startup sequence
//!
//! 1. **Configuration** - TOML file (optional) plus command-line overrides
//! 2. **Cluster** - change bus, resource store and the configured job backend
//! 3. **Garbage collector** - deletes jobs whose Echo was deleted
//! 4. **Controller** - trigger binding and worker pool
//! 5. **Seeding** - Echo resources given with `--echo`
//!
//! ## Shutdown
//!
//! Ctrl+C, or every seeded Echo reaching a terminal phase when
//! `--exit-when-settled` is set. Final statuses and controller counters are
//! printed as JSON.

#![forbid(unsafe_code)]
#![forbid(clippy::unwrap_used)]
#![forbid(clippy::panic)]
#![deny(clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use echo_cluster::{
    ChangeBus, EchoSpec, InMemoryJobBackend, InMemoryResourceStore, JobBackend,
    LocalProcessJobBackend, ObjectKey, OwnerGarbageCollector, ResourceStore,
};
use echo_operator::cli::{Cli, Commands, EchoArg};
use echo_operator::config::{BackendKind, OperatorConfig};
use echo_reconciler::{Controller, Reconciler};

/// How often settled-ness of the seeded resources is checked.
const SETTLE_CHECK_INTERVAL: Duration = Duration::from_millis(200);

/// Time allowed for the controller to wind down after a stop.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Config { config } => {
            let config = OperatorConfig::load(config.as_deref())
                .context("Failed to load configuration")?;
            print!("{}", config.to_toml()?);
            Ok(())
        }
        Commands::Run {
            config,
            workers,
            backend,
            namespace,
            echo,
            exit_when_settled,
        } => {
            init_tracing();

            let mut operator_config = OperatorConfig::load(config.as_deref())
                .context("Failed to load configuration")?;
            if let Some(workers) = workers {
                operator_config.controller.workers = workers;
            }
            if let Some(kind) = backend {
                operator_config.backend.kind = kind;
            }
            operator_config
                .validate()
                .context("Invalid configuration after command-line overrides")?;

            run(&operator_config, &namespace, &echo, exit_when_settled).await
        }
    }
}

async fn run(
    config: &OperatorConfig,
    namespace: &str,
    seeds: &[EchoArg],
    exit_when_settled: bool,
) -> Result<()> {
    info!("Echo operator starting...");

    let bus = Arc::new(ChangeBus::default());
    let store = Arc::new(InMemoryResourceStore::with_bus(Arc::clone(&bus)));
    let backend: Arc<dyn JobBackend> = match config.backend.kind {
        BackendKind::LocalProcess => {
            Arc::new(LocalProcessJobBackend::new(Some(Arc::clone(&bus))))
        }
        BackendKind::InMemory => {
            warn!("In-memory backend selected; jobs will stay Running");
            Arc::new(InMemoryJobBackend::with_bus(Arc::clone(&bus)))
        }
    };
    info!(backend = ?config.backend.kind, "Cluster initialized");

    let (gc_stop_tx, gc_stop_rx) = watch::channel(false);
    let controller_config = config.controller_config();
    let gc = OwnerGarbageCollector::new(
        Arc::clone(&bus),
        Arc::clone(&store) as Arc<dyn ResourceStore>,
        Arc::clone(&backend),
    )
    .with_retry_backoff(controller_config.backoff.base, controller_config.backoff.max)
    .spawn(gc_stop_rx);

    let reconciler = Reconciler::new(
        Arc::clone(&store) as Arc<dyn ResourceStore>,
        backend,
        config.reconciler_config(),
    );
    let controller = Arc::new(
        Controller::new(Arc::new(reconciler), controller_config)
            .context("Failed to create controller")?,
    );
    let runner = {
        let controller = Arc::clone(&controller);
        let bus = Arc::clone(&bus);
        tokio::spawn(async move { controller.run(&bus).await })
    };

    let keys = seed(&store, namespace, seeds).await?;
    info!(seeded = keys.len(), "Echo operator running. Press Ctrl+C to stop.");

    if exit_when_settled && !keys.is_empty() {
        tokio::select! {
            () = wait_until_settled(store.as_ref(), &keys) => info!("All seeded resources settled"),
            () = wait_for_shutdown() => {}
        }
    } else {
        if exit_when_settled {
            warn!("Nothing was seeded; waiting for Ctrl+C");
        }
        wait_for_shutdown().await;
    }

    info!("Cleaning up...");
    controller.stop();
    match tokio::time::timeout(SHUTDOWN_GRACE, runner).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => error!(error = %e, "Controller exited with an error"),
        Ok(Err(e)) => error!(error = %e, "Controller task ended abnormally"),
        Err(_) => warn!("Controller did not stop within {:?}", SHUTDOWN_GRACE),
    }
    let _ = gc_stop_tx.send(true);
    if let Err(e) = gc.await {
        error!(error = %e, "Garbage collector task ended abnormally");
    }

    print_report(store.as_ref(), &controller).await?;
    info!("Echo operator stopped");
    Ok(())
}

/// Create every resource given on the command line.
async fn seed(
    store: &InMemoryResourceStore,
    namespace: &str,
    seeds: &[EchoArg],
) -> Result<Vec<ObjectKey>> {
    let mut keys = Vec::with_capacity(seeds.len());
    for arg in seeds {
        let spec = EchoSpec::new(arg.message.clone())
            .with_context(|| format!("Invalid message for Echo '{}'", arg.name))?;
        let echo = store
            .create(namespace, arg.name.clone(), spec)
            .await
            .with_context(|| format!("Failed to create Echo '{namespace}/{}'", arg.name))?;
        keys.push(echo.key());
    }
    Ok(keys)
}

/// Resolve once every key is terminal or gone.
async fn wait_until_settled(store: &dyn ResourceStore, keys: &[ObjectKey]) {
    let mut tick = tokio::time::interval(SETTLE_CHECK_INTERVAL);
    loop {
        tick.tick().await;
        let mut settled = true;
        for key in keys {
            match store.get(key).await {
                Ok(echo) if echo.phase().is_some_and(|phase| phase.is_terminal()) => {}
                Err(e) if e.is_not_found() => {}
                _ => {
                    settled = false;
                    break;
                }
            }
        }
        if settled {
            return;
        }
    }
}

async fn print_report(store: &dyn ResourceStore, controller: &Controller) -> Result<()> {
    let now = Utc::now();
    let echoes: Vec<_> = store
        .list()
        .await
        .context("Failed to list Echo resources")?
        .iter()
        .map(|echo| echo.summary(now))
        .collect();
    let report = serde_json::json!({
        "echoes": echoes,
        "stats": controller.stats(),
    });
    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("Failed to render report")?
    );
    Ok(())
}

/// Initialize tracing subscriber.
fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Wait for shutdown signal.
async fn wait_for_shutdown() {
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received shutdown signal");
        }
        Err(e) => {
            error!("Failed to listen for shutdown signal: {}", e);
        }
    }
}
