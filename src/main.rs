use std::future::IntoFuture;
use std::sync::Arc;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use assist_orchestrator::api;
use assist_orchestrator::config::OrchestratorConfig;
use assist_orchestrator::orchestrator::{Orchestrator, WebhookChannel};
use assist_orchestrator::store::{Database, LibSqlBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = OrchestratorConfig::from_env().context("Invalid orchestrator configuration")?;

    // Flushes the file writer on drop, so it lives until main returns.
    let _log_guard = init_tracing(&config);

    eprintln!("Assist Orchestrator v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   API: http://{}/api", config.http_addr);
    eprintln!("   Events: ws://{}/ws/events", config.http_addr);

    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .context("Failed to open database")?,
    );

    let channel = WebhookChannel::new().context("Failed to build webhook client")?;
    let http_addr = config.http_addr.clone();
    let orchestrator = Arc::new(Orchestrator::new(config, db, Arc::new(channel)));
    let mut tasks = orchestrator.start();

    let listener = tokio::net::TcpListener::bind(&http_addr)
        .await
        .with_context(|| format!("Failed to bind {http_addr}"))?;
    tracing::info!(addr = %http_addr, "HTTP server started");

    let app = api::routes(Arc::clone(&orchestrator));
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .into_future();

    let outcome = tokio::select! {
        served = server => served.context("HTTP server failed"),
        escalated = &mut tasks.supervisor => match escalated {
            Ok(Err(e)) => Err(e).context("Heartbeat supervision gave up"),
            Ok(Ok(())) => Ok(()),
            Err(e) => Err(e).context("Heartbeat watchdog crashed"),
        },
    };

    tasks.abort();
    tracing::info!("Orchestrator stopped");
    outcome
}

fn init_tracing(config: &OrchestratorConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    match &config.log_dir {
        Some(dir) => {
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "orchestrator.log"));
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(stderr).init();
            None
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}
