use std::net::SocketAddr;

use anyhow::Context;
use harbor_launcher::{
    Launcher, api,
    config::{self, LauncherConfig},
    paths::AppPaths,
};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

fn init_tracing(paths: &AppPaths) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let logs_dir = paths.logs_dir();
    if let Err(e) = std::fs::create_dir_all(&logs_dir) {
        tracing_subscriber::registry()
            .with(filter)
            .with(stderr)
            .init();
        tracing::warn!(dir = %logs_dir.display(), error = %e, "file logging disabled");
        return None;
    }

    let appender = tracing_appender::rolling::daily(&logs_dir, "launcher.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let file = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false);
    tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .with(file)
        .init();
    Some(guard)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "ctrl-c handler unavailable");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let paths = AppPaths::from_env();
    let _log_guard = init_tracing(&paths);
    paths
        .ensure_dirs()
        .with_context(|| format!("prepare data root {}", paths.root().display()))?;

    let cfg = LauncherConfig::load(&paths.config_file()).await;
    tracing::info!(
        root = %paths.root().display(),
        port = cfg.port,
        serve_on_local_network = cfg.serve_on_local_network,
        auto_update = cfg.auto_update,
        "harbor launcher starting"
    );
    let launcher = Launcher::new(paths, cfg);

    let addr: SocketAddr = ([127, 0, 0, 1], config::api_port()).into();
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind control API on {addr}"))?;
    tracing::info!(%addr, "control API listening");

    let autostart = tokio::spawn({
        let launcher = launcher.clone();
        async move {
            match launcher.autostart().await {
                Ok(Some(outcome)) => {
                    tracing::info!(url = %outcome.url, pid = outcome.pid, "server started")
                }
                Ok(None) => {}
                Err(e) => tracing::error!(error = %config::format_error_chain(&e), "autostart failed"),
            }
        }
    });

    axum::serve(listener, api::router(launcher.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("control API")?;

    autostart.abort();
    launcher.shutdown().await;
    tracing::info!("harbor launcher stopped");
    Ok(())
}
