// src/main.rs

use anyhow::Context;
use clap::Parser;
use openrouter_proxy::cli::{run_key_command, Cli, Commands};
use openrouter_proxy::config::load_config;
use openrouter_proxy::storage::JsonFileStore;
use openrouter_proxy::{bind_with_fallback, serve};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

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
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!(signal = "Ctrl+C", "Received signal. Initiating graceful shutdown...") },
        () = terminate => { info!(signal = "Terminate", "Received signal. Initiating graceful shutdown...") },
    }
}

fn init_tracing(json_logs: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(env_filter);
    if json_logs {
        registry
            .with(fmt::layer().json().with_current_span(true).with_span_list(true))
            .init();
    } else {
        registry.with(fmt::layer().pretty()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let mut config = load_config(&cli.config).map_err(|e| {
        error!(config.path = %cli.config.display(), error = %e, "Failed to load or validate configuration. Exiting.");
        e
    })?;
    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Keys { action } => {
            let store = JsonFileStore::new(&config.keys.store_path);
            run_key_command(&store, action)
                .await
                .with_context(|| format!("key command failed for {}", store.path().display()))
        }
        Commands::Serve => {
            info!("Starting OpenRouter proxy...");
            let listener = bind_with_fallback(
                &config.server.host,
                config.server.port,
                config.server.port_fallback_range,
            )
            .await
            .map_err(|e| {
                warn!(error = %e, "Failed to bind server socket. Exiting.");
                e
            })?;
            serve(config, listener, shutdown_signal())
                .await
                .context("server exited with an error")
        }
    }
}
