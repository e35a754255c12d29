//! silt daemon
//!
//! Startup order: configuration, target table metadata, loader connection
//! pool, pipelines, watchdog. Shutdown raises the process-wide stop flag
//! on SIGINT/SIGTERM and drains the workers with a timeout.

mod cli;

use clap::Parser;
use cli::Cli;
use silt::config::{Dialect, SourceConfig};
use silt::source::ReplaySource;
use silt::{Config, Context, Pipeline, Scheduler, SiltError, Watchdog};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_file(&cli.config)?;
    print_banner(&config);

    let cxt = Context::init(config).await?;
    let pipelines = build_pipelines(&cxt)?;

    let mut scheduler = Scheduler::new(cxt.stop.clone());
    for pipeline in pipelines {
        pipeline.spawn(&cxt, scheduler.workers_mut());
    }
    let tuning = &cxt.config.pipeline;
    let watchdog = Watchdog::new(
        cxt.registry.clone(),
        cxt.stop.clone(),
        Duration::from_secs(tuning.watchdog_interval_secs),
        Duration::from_secs(tuning.stall_timeout_secs),
    );
    scheduler.workers_mut().spawn(watchdog.run());
    info!(
        pipelines = cxt.registry.total(),
        connections = cxt.pool.live(),
        "silt started"
    );

    let stop = cxt.stop.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("shutdown signal received, draining");
        stop.raise();
    });

    let mut draining = tokio::spawn(scheduler.join());
    let outcome = tokio::select! {
        joined = &mut draining => joined,
        _ = cxt.stop.notified() => {
            match tokio::time::timeout(DRAIN_TIMEOUT, &mut draining).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!("drain timed out after {DRAIN_TIMEOUT:?}, forcing exit");
                    draining.abort();
                    Ok(Ok(()))
                }
            }
        }
    };

    for (name, snapshot) in cxt.registry.snapshots() {
        info!(
            pipeline = %name,
            polled = snapshot.records_polled,
            transformed = snapshot.rows_transformed,
            skipped = snapshot.records_skipped,
            loaded = snapshot.rows_loaded,
            retries = snapshot.load_retries,
            "pipeline totals"
        );
    }
    cxt.pool.close();

    match outcome {
        Ok(Ok(())) => {
            info!("silt exit");
            Ok(())
        }
        Ok(Err(e)) => {
            error!("silt stopped abnormally: {e}");
            Err(e.into())
        }
        Err(e) => {
            error!("scheduler terminated abnormally: {e}");
            Err(e.into())
        }
    }
}

/// One pipeline per source table for topic-per-table sources, one per
/// partition for partitioned sources.
fn build_pipelines(cxt: &Arc<Context>) -> Result<Vec<Pipeline>, SiltError> {
    let mut pipelines = Vec::new();
    for (name, source_config) in &cxt.config.sources {
        match source_config.dialect {
            Dialect::Debezium => {
                for source_table in source_config.table_map.keys() {
                    let topic = silt::pipeline::debezium_topic(&source_config.topic, source_table)?;
                    let source = make_source(name, source_config, &topic)?;
                    pipelines.push(Pipeline::debezium(
                        cxt,
                        name,
                        source_config,
                        source_table,
                        source,
                    )?);
                }
            }
            Dialect::Maxwell => {
                for partition in 0..source_config.partitions {
                    let source = make_source(name, source_config, &source_config.topic)?;
                    pipelines.push(Pipeline::maxwell(
                        cxt,
                        name,
                        source_config,
                        partition,
                        source,
                    )?);
                }
            }
        }
    }
    Ok(pipelines)
}

/// The broker consumer client is linked in by the integrator; this build
/// only carries the file-replay source.
fn make_source(
    name: &str,
    config: &SourceConfig,
    topic: &str,
) -> Result<Box<dyn silt::Source>, SiltError> {
    match &config.replay {
        Some(path) => Ok(Box::new(ReplaySource::from_file(path, topic, 500)?)),
        None => Err(SiltError::config(format!(
            "source {name}: no replay file configured and no broker client is linked into this build"
        ))),
    }
}

/// Wait for Ctrl+C or SIGTERM.
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C"),
        _ = terminate => info!("received SIGTERM"),
    }
}

fn print_banner(config: &Config) {
    eprintln!(
        r#"
     _ _ _
 ___(_) | |_
/ __| | | __|
\__ \ | | |_
|___/_|_|\__|

Incremental CDC replication into analytic databases

  Target:    {}:{}/{}
  Sources:   {}
"#,
        config.target.host,
        config.target.port,
        config.target.database,
        config.sources.len(),
    );
}
