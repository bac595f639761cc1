use std::sync::Arc;

use anyhow::Context;
use demohub_agent::{
    api,
    config::DemoConfig,
    object_store::LocalObjectStore,
    orchestrator::{Collaborators, DemoOrchestrator},
    port_inspect::SystemPortInspector,
    runtime::PythonVenvRuntime,
    tenants::TenantStore,
};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

fn init_tracing(cfg: &DemoConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stdout = tracing_subscriber::fmt::layer();

    let Some(dir) = &cfg.log_dir else {
        tracing_subscriber::registry()
            .with(filter)
            .with(stdout)
            .init();
        return Ok(None);
    };

    std::fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "demohub-agent.log"));
    tracing_subscriber::registry()
        .with(filter)
        .with(stdout)
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer),
        )
        .init();
    Ok(Some(guard))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = DemoConfig::from_env().context("load configuration")?;
    let _log_guard = init_tracing(&cfg)?;

    let tenants = Arc::new(match &cfg.tenants_file {
        Some(path) => TenantStore::open(path.clone()).await?,
        None => TenantStore::in_memory(),
    });
    let parts = Collaborators {
        store: Arc::new(LocalObjectStore::new(cfg.object_store_root.clone())),
        runtime: Arc::new(PythonVenvRuntime::new(
            cfg.python.clone(),
            cfg.baseline_package.clone(),
        )),
        inspector: Arc::new(SystemPortInspector),
        manifests: tenants.clone(),
        metadata: tenants,
    };

    let addr = cfg.http_addr;
    tracing::info!(
        data_root = %cfg.data_root.display(),
        ports = %cfg.port_range,
        "demohub-agent starting"
    );
    let orch = Arc::new(DemoOrchestrator::new(Arc::new(cfg), parts));

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    tracing::info!(%addr, "demohub-agent HTTP listening");

    axum::serve(listener, api::router(orch.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    let report = orch.stop_all().await;
    tracing::info!(
        demos_stopped = report.demos_stopped,
        ports_freed = report.ports_freed,
        "demohub-agent shut down"
    );
    Ok(())
}
