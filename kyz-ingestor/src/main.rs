use std::{path::PathBuf, process};

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use kyz_ingestor::{
    config::AppConfig,
    error::{ConfigError, EXIT_CONFIG_ERROR, EXIT_FAILURE},
    metrics_server, observability, probe,
    sinks::{IntervalWriter, PgConnector, WriterSettings},
    sources::IngestSession,
    transform::LocalZone,
    IngestPipeline,
};
use tokio::{
    signal::unix::{signal, SignalKind},
    sync::watch,
};

#[derive(Parser)]
#[command(name = "kyz-ingestor")]
#[command(about = "Persist KYZ interval readings published over MQTT into PostgreSQL")]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to $KYZ_CONFIG, then kyz-ingestor.toml)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Check broker and store connectivity, then exit
    #[arg(long)]
    test_conn: bool,

    /// Directory for the daily-rolling log file
    #[arg(long, value_name = "DIR", env = "KYZ_LOG_DIR", default_value = "logs")]
    log_dir: PathBuf,
}

fn main() {
    let cli = Cli::parse();
    let log_guard = observability::init_tracing(Some(&cli.log_dir));

    let code = start(cli);

    // process::exit skips destructors; flush the log file first.
    drop(log_guard);
    process::exit(code);
}

fn start(cli: Cli) -> i32 {
    let cfg = match AppConfig::load(cli.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!(error = %e, "configuration error");
            return EXIT_CONFIG_ERROR;
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("kyz-ingestor")
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!(error = %e, "failed to start async runtime");
            return EXIT_FAILURE;
        }
    };

    let code = runtime.block_on(async {
        if cli.test_conn {
            return probe::run_connectivity_check(&cfg).await;
        }

        match run(cfg).await {
            Ok(()) => 0,
            Err(e) if e.downcast_ref::<ConfigError>().is_some() => {
                tracing::error!(error = %e, "configuration error");
                EXIT_CONFIG_ERROR
            }
            Err(e) => {
                tracing::error!(error = %format!("{e:#}"), "fatal error");
                EXIT_FAILURE
            }
        }
    });

    drop(runtime);
    code
}

async fn run(cfg: AppConfig) -> Result<()> {
    if let Some(metrics_cfg) = &cfg.metrics {
        metrics_server::init(&metrics_cfg.bind_addr)?;
    }

    let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;

    let zone = LocalZone::from_config(&cfg.interval)?;
    let connector = PgConnector::from_config(&cfg.store)?;
    let settings = WriterSettings::from_config(&cfg.store);

    // The writer retries forever; only a signal gets us out before it connects.
    let writer = tokio::select! {
        writer = IntervalWriter::connect(connector, settings) => writer,
        _ = sigint.recv() => {
            tracing::info!("SIGINT received before store connection; exiting");
            return Ok(());
        }
        _ = sigterm.recv() => {
            tracing::info!("SIGTERM received before store connection; exiting");
            return Ok(());
        }
    };

    let pipeline = IngestPipeline::new(cfg.interval.clone(), zone, writer);
    let session = IngestSession::new(&cfg.mqtt, pipeline);

    let (stop_tx, stop_rx) = watch::channel(false);
    let mut handle = tokio::spawn(session.run(stop_rx));

    tokio::select! {
        _ = sigint.recv() => tracing::info!("SIGINT received, shutting down"),
        _ = sigterm.recv() => tracing::info!("SIGTERM received, shutting down"),
        res = &mut handle => {
            return res.map_err(|e| anyhow!("broker session task failed: {e}"));
        }
    }

    stop_tx.send_replace(true);
    handle.await.context("broker session task failed")?;
    tracing::info!("shutdown complete");
    Ok(())
}
