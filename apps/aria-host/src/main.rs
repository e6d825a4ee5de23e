use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::{error, info, warn};

use aria_host::{
    app::build_router,
    cli::{Cli, Commands},
    config::Config,
    http_bridge::spawn_staleness_sweep,
    registry::Broker,
    workspace::{bind_port, resolve_secret, spawn_heartbeat, WorkspaceLock, WorkspacePaths},
};

#[tokio::main]
async fn main() {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt::init();

    let Cli {
        command,
        port,
        workspace,
    } = Cli::parse();

    if let Some(Commands::Tail {
        url,
        secret,
        workspace,
        levels,
        capabilities,
        llm_filter,
    }) = command
    {
        if let Err(err) = aria_host::cli::run_tail(
            url,
            secret,
            workspace,
            levels,
            capabilities,
            llm_filter,
        )
        .await
        {
            error!("tail client error: {err:#}");
            std::process::exit(1);
        }
        return;
    }

    if let Err(err) = serve(port, workspace).await {
        error!("{err:#}");
        std::process::exit(1);
    }
}

async fn serve(port: Option<u16>, workspace: Option<std::path::PathBuf>) -> Result<()> {
    let mut config = Config::from_env();
    if let Some(port) = port {
        config.port = port;
    }
    if let Some(workspace) = workspace {
        config.workspace_root = workspace;
    }

    let paths = WorkspacePaths::new(&config.workspace_root);
    let lock = Arc::new(WorkspaceLock::acquire(paths.clone())?);

    let (listener, port) = bind_port(config.port).await?;
    let secret = resolve_secret(&paths);
    lock.publish(port, &secret)?;

    let heartbeat = spawn_heartbeat(lock.clone());
    let broker = Arc::new(Broker::new(secret));
    let sweep = spawn_staleness_sweep(broker.clone());

    let metrics = install_metrics_recorder();
    let app = build_router(broker, Some(metrics));

    info!(port, workspace = %paths.root().display(), "Aria Bridge host listening");
    println!("Aria Bridge host listening on ws://127.0.0.1:{port}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(lock.clone()))
        .await?;

    heartbeat.abort();
    sweep.abort();
    Ok(())
}

/// Resolves when SIGINT or SIGTERM arrives. The lock is released right away
/// and a watchdog guarantees the process is gone within five seconds even
/// if open sessions stall the graceful drain.
async fn shutdown_signal(lock: Arc<WorkspaceLock>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown requested");
    lock.release();
    tokio::spawn(async {
        tokio::time::sleep(Duration::from_secs(5)).await;
        warn!("graceful shutdown timed out, forcing exit");
        std::process::exit(1);
    });
}

fn install_metrics_recorder() -> PrometheusHandle {
    PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}
