use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use redline::ui::{self, UiConfig};
use redline::{acceptor, config, logging, Cli};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init_logging(&cli.log);
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let stack = Arc::new(config::build_stack(&cli).context("building the handler pipeline")?);

    let listener = acceptor::bind_listener(
        cli.listen_ip.into(),
        cli.listen_port,
        cli.max_connections as i32,
    )
    .with_context(|| format!("binding {}:{}", cli.listen_ip, cli.listen_port))?;
    tracing::info!(ip = %cli.listen_ip, port = cli.listen_port, "listening");

    let (display_tx, display_rx) = mpsc::channel(256);
    let ui_thread = ui::spawn(UiConfig::from_cli(&cli), display_rx);

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let server_addr = SocketAddr::from((cli.server_ip, cli.server_port));
    let result = acceptor::serve(
        listener,
        stack,
        server_addr,
        cli.max_connections,
        display_tx,
        shutdown,
    )
    .await;

    ui::restore_terminal();
    let _ = ui_thread.join();
    result
}

/// SIGINT and SIGTERM repair the terminal, then end the process outright.
/// Workers may be mid-edit or mid-handshake; a prompt exit beats leaving
/// the operator a half-dead terminal in raw mode.
fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm() => {}
        }
        tracing::info!("signal received, shutting down");
        ui::restore_terminal();
        shutdown.cancel();
        std::process::exit(0);
    });
}

#[cfg(unix)]
async fn sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut stream) => {
            stream.recv().await;
        }
        Err(_) => std::future::pending::<()>().await,
    }
}

#[cfg(not(unix))]
async fn sigterm() {
    std::future::pending::<()>().await
}
