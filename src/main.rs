use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

use ai_orchestrator::activity::ActivitySignal;
use ai_orchestrator::api::internal_routes;
use ai_orchestrator::collaborators::http::{HttpExecutionBackend, HttpQualifier};
use ai_orchestrator::config::{OrchestratorConfig, ServiceConfig};
use ai_orchestrator::engine::{EngineDeps, TaskOrchestrationEngine};
use ai_orchestrator::store::{LibSqlTaskStore, TaskStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let service = ServiceConfig::from_env().context("invalid service configuration")?;

    // ── Logging ──────────────────────────────────────────────────────────
    let (file_layer, _log_guard) = match &service.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "orchestrator.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        None => (None, None),
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_target(false))
        .with(file_layer)
        .init();

    let config = OrchestratorConfig::from_env().context("invalid orchestrator configuration")?;

    eprintln!("AI Orchestrator v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Backend: {}", service.backend_url);
    eprintln!("   Database: {}", service.db_path.display());
    eprintln!("   Internal API: http://0.0.0.0:{}", service.listen_port);
    eprintln!(
        "   Idle review: {}",
        if config.idle_review.enabled { "enabled" } else { "disabled" }
    );

    // ── Database ─────────────────────────────────────────────────────────
    let store: Arc<dyn TaskStore> = Arc::new(
        LibSqlTaskStore::new_local(&service.db_path)
            .await
            .with_context(|| format!("failed to open database at {}", service.db_path.display()))?,
    );

    // ── Collaborators ────────────────────────────────────────────────────
    let qualifier = Arc::new(
        HttpQualifier::new(&service.backend_url, service.backend_token.clone())
            .context("failed to build qualifier client")?,
    );
    let backend = Arc::new(
        HttpExecutionBackend::new(&service.backend_url, service.backend_token.clone())
            .context("failed to build execution backend client")?,
    );

    // ── Engine ───────────────────────────────────────────────────────────
    let activity = Arc::new(ActivitySignal::new());
    let deps = EngineDeps::new(store, qualifier, backend).with_activity(activity);
    let engine = Arc::new(TaskOrchestrationEngine::new(config, deps));
    let handles = engine
        .start()
        .await
        .context("startup recovery failed")?;

    // ── Internal API ─────────────────────────────────────────────────────
    let app = internal_routes(Arc::clone(&engine));
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", service.listen_port))
        .await
        .with_context(|| format!("failed to bind port {}", service.listen_port))?;
    tracing::info!(port = service.listen_port, "Internal API started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown requested");
        })
        .await
        .context("internal API server failed")?;

    // In-flight tasks are picked up by recovery on the next start.
    handles.abort();
    Ok(())
}
