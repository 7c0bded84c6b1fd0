use clap::{Parser, Subcommand};
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;

use gangway::config::{ProxyConfig, proxy_dir_from_env};
use gangway::watcher::Watcher;

#[derive(Parser)]
#[command(name = "gangway", version, about = "Command proxy for containerized agent workbenches")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch the shared proxy directory and run CMD for container clients.
    Proxy {
        /// Bound host command; also names the client script placed in the
        /// proxy directory.
        cmd: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    // Load .env file if present (silently ignored if missing)
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    match cli.command {
        Commands::Proxy { cmd } => {
            let dir = proxy_dir_from_env();
            let config = ProxyConfig::from_env();
            tracing::info!(command = %cmd, "gangway starting");

            let watcher = Watcher::new(dir, cmd, config)?;
            let shutdown = CancellationToken::new();

            let token = shutdown.clone();
            tokio::spawn(async move {
                let mut term = match signal(SignalKind::terminate()) {
                    Ok(s) => s,
                    Err(e) => {
                        tracing::error!("cannot install SIGTERM handler: {e}");
                        return;
                    }
                };
                let mut int = match signal(SignalKind::interrupt()) {
                    Ok(s) => s,
                    Err(e) => {
                        tracing::error!("cannot install SIGINT handler: {e}");
                        return;
                    }
                };
                tokio::select! {
                    _ = term.recv() => {}
                    _ = int.recv() => {}
                }
                tracing::info!("signal received, shutting down");
                token.cancel();
            });

            watcher.run(shutdown).await?;
        }
    }

    tracing::info!("gangway stopped");
    Ok(())
}
