// ChatBlue Linux: LAN discovery, TCP transport and a line-based shell over stdin/stdout.

mod config;
mod discovery;
mod shell;
mod transport;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chatblue_link::Supervisor;
use tracing::info;
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("chatblue-linux {}", VERSION);
            return Ok(());
        }
    }

    // stdout carries the event stream; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cfg = config::load()?;
    let rt = tokio::runtime::Runtime::new().context("building tokio runtime")?;
    let result = rt.block_on(async {
        let transport = Arc::new(transport::LanTransport::new(&cfg));
        let sup = Supervisor::new(transport, cfg.link_config());
        tokio::spawn(shell::print_events(sup.subscribe()));
        info!(
            version = VERSION,
            service = %cfg.service_identity(),
            transport_port = cfg.transport_port,
            discovery_port = cfg.discovery_port,
            "chatblue ready"
        );

        let result = tokio::select! {
            r = shell::run(sup.clone()) => r,
            r = shutdown_signal() => r,
        };
        sup.shutdown();
        info!("shutting down");
        result
    });
    // A pending stdin read would otherwise hold the runtime open.
    rt.shutdown_timeout(Duration::from_millis(500));
    result
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
