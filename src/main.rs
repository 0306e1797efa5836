use devrunner::backend::BackendBuild;
use devrunner::config::Config;
use devrunner::devserver::DevServer;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

const DEFAULT_CONFIG_FILE: &str = "devrunner.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("devrunner=debug".parse().expect("valid log directive")),
        )
        .init();

    let config = load_config().map_err(|e| {
        error!(error = %e, "Failed to load configuration");
        e
    })?;

    print_startup_banner(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut backend_handle = BackendBuild::start(&config, shutdown_rx.clone())?;
    let mut server_handle = DevServer::start(&config, shutdown_rx.clone())?;
    let mut backend_done = false;

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    let outcome: anyhow::Result<()> = loop {
        tokio::select! {
            _ = &mut shutdown => break Ok(()),
            result = &mut backend_handle, if !backend_done => {
                backend_done = true;
                match result {
                    Ok(Ok(())) => info!("Backend watch stopped"),
                    Ok(Err(e)) => {
                        error!(error = %e, "Backend build ended the session");
                        break Err(e.into());
                    }
                    Err(e) => {
                        // Keep serving the frontend; the backend loop is gone
                        error!(error = %e, "Backend build task failed");
                    }
                }
            }
            result = &mut server_handle => {
                match result {
                    Ok(Ok(())) => break Ok(()),
                    Ok(Err(e)) => {
                        error!(error = %e, "Dev server error");
                        break Err(e);
                    }
                    Err(e) => {
                        error!(error = %e, "Dev server task failed");
                        break Err(e.into());
                    }
                }
            }
        }
    };

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    // The backend loop stops its child process before returning
    if !backend_done {
        let _ = tokio::time::timeout(Duration::from_secs(10), backend_handle).await;
    }

    info!("Shutdown complete");
    outcome
}

fn load_config() -> anyhow::Result<Config> {
    match std::env::args().nth(1).map(PathBuf::from) {
        Some(path) => {
            let config = Config::load(&path)?;
            info!(path = %path.display(), "Configuration loaded");
            Ok(config)
        }
        None if PathBuf::from(DEFAULT_CONFIG_FILE).exists() => {
            let config = Config::load(DEFAULT_CONFIG_FILE)?;
            info!(path = DEFAULT_CONFIG_FILE, "Configuration loaded");
            Ok(config)
        }
        None => {
            info!("No configuration file, using defaults");
            Ok(Config::default())
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                info!("Received SIGINT (Ctrl+C), shutting down...");
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, shutting down...");
    }
}

fn print_startup_banner(config: &Config) {
    info!(
        name = env!("CARGO_PKG_NAME"),
        version = env!("CARGO_PKG_VERSION"),
        "Starting dev runner"
    );
    info!(
        client = %config.server.client_origin(),
        api = %config.server.api_origin(),
        bind = %config.server.bind,
        strict = config.server.strict,
        "Server configuration"
    );
    info!(
        command = %config.runtime.command,
        args = ?config.runtime.args,
        artifact = %config.backend.backend_development().artifact_path().display(),
        grace_period_secs = config.runtime.shutdown_grace_period_secs,
        "Backend runtime"
    );
    info!(
        backend = %config.backend.command,
        frontend = %config.frontend.command,
        state_dir = %config.server.state_dir,
        debounce_ms = config.server.watch_debounce_ms,
        "Bundler settings"
    );
}
