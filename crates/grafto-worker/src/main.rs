//! # Grafto Queue Worker
//!
//! Runs the job worker against the configured PostgreSQL queue until it
//! receives Ctrl+C or SIGTERM.

use anyhow::Context;
use grafto_config::{AppConfig, ConfigLoader, MailProvider, MetricsConfig};
use grafto_core::init_tracing;
use grafto_jobs::{
    create_pool, register_metrics, run_migrations, EmailExecutor, ExecutorRegistry, LogMailer,
    Mailer, PgJobStorage, PgReportSource, PostmarkMailer, Queue, WeeklyReportExecutor, Worker,
    WorkerOptions,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

const PURGE_INTERVAL: Duration = Duration::from_secs(3600);

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("Worker error: {:#}", e);
        eprintln!("grafto-worker: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let config = ConfigLoader::from_default_location()
        .context("failed to load configuration")?
        .into_inner();

    init_tracing(&config.logging).context("failed to initialise tracing")?;

    info!("Starting Grafto queue worker...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("Environment: {}", config.app.environment);

    install_metrics(&config.metrics)?;

    let pool = create_pool(&config.database)
        .await
        .context("failed to connect to database")?;
    if config.database.run_migrations {
        run_migrations(&pool).await.context("failed to run migrations")?;
    }

    let queue = Queue::new(Arc::new(PgJobStorage::new(pool.clone())), &config.jobs.queue);
    let mailer = build_mailer(&config)?;

    let mut registry = ExecutorRegistry::new();
    registry.register(Arc::new(
        EmailExecutor::new(mailer.clone(), config.mail.default_from.clone())
            .with_default_subject(config.mail.default_subject.clone()),
    ))?;

    let report = &config.jobs.scheduler.weekly_report;
    if config.jobs.scheduler.enabled && report.enabled {
        let executor = WeeklyReportExecutor::from_config(
            report,
            mailer.clone(),
            Arc::new(PgReportSource::new(pool.clone())),
        )
        .context("invalid weekly report schedule")?;
        info!(cron = %executor.schedule(), "Weekly report enabled");
        registry.register_repeatable(Arc::new(executor))?;
    }

    let purge = tokio::spawn(purge_completed(
        queue.clone(),
        config.jobs.queue.retention(),
    ));

    let mut worker = Worker::new(queue, registry, WorkerOptions::from_config(&config.jobs));
    let result = worker.run(shutdown_signal()).await;

    purge.abort();
    pool.close().await;
    info!("Database connection pool closed");

    result.context("worker stopped")
}

fn build_mailer(config: &AppConfig) -> anyhow::Result<Arc<dyn Mailer>> {
    let mailer: Arc<dyn Mailer> = match config.mail.provider {
        MailProvider::Postmark => {
            info!(base_url = %config.mail.postmark_base_url, "Using Postmark mailer");
            Arc::new(PostmarkMailer::from_config(&config.mail)?)
        }
        MailProvider::Log => {
            warn!("Using log mailer, emails will not be delivered");
            Arc::new(LogMailer::new())
        }
    };
    Ok(mailer)
}

fn install_metrics(config: &MetricsConfig) -> anyhow::Result<()> {
    if !config.enabled {
        return Ok(());
    }

    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .with_context(|| format!("invalid metrics listen address '{}'", config.listen_addr))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("failed to install Prometheus exporter")?;
    register_metrics();

    info!(%addr, "Prometheus exporter listening");
    Ok(())
}

/// Deletes old completed jobs once an hour.
async fn purge_completed(queue: Queue, retention: Duration) {
    let mut interval = tokio::time::interval(PURGE_INTERVAL);
    loop {
        interval.tick().await;
        if let Err(e) = queue.purge_completed(retention).await {
            warn!(error = %e, "Failed to purge completed jobs");
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            info!("Received terminate signal, initiating graceful shutdown...");
        }
    }
}
