use std::future::IntoFuture;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use restproc_gateway::config::Config;
use restproc_gateway::http;

const ENV_CONFIG_PATH: &str = "PG_API_CONFIG";

const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() {
    let config_path = std::env::var(ENV_CONFIG_PATH)
        .ok()
        .filter(|p| !p.trim().is_empty())
        .or_else(|| std::env::args().nth(1))
        .unwrap_or_default();

    println!(
        "PostgreSQL web API service ver. {}",
        env!("CARGO_PKG_VERSION")
    );
    println!("Config path is {}", config_path);

    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("STARTUP_ERROR {}", err);
            std::process::exit(1);
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_filter()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let shutdown = CancellationToken::new();
    let port = config.http.port;

    let (app, state) = match http::build(config, shutdown.clone()).await {
        Ok(built) => built,
        Err(err) => {
            eprintln!("STARTUP_ERROR {}", err);
            std::process::exit(1);
        }
    };

    let listener = match tokio::net::TcpListener::bind(("0.0.0.0", port)).await {
        Ok(listener) => listener,
        Err(err) => {
            eprintln!("STARTUP_ERROR ERR_BIND_FAILED {}", err);
            std::process::exit(1);
        }
    };
    state.health.set_alive(true);

    tracing::info!(port = port, "restproc listening");

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("shutdown signal received");
        signal_token.cancel();
    });

    let graceful = shutdown.clone();
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async move { graceful.cancelled().await })
        .into_future();
    let mut server = std::pin::pin!(server);

    tokio::select! {
        result = &mut server => {
            if let Err(err) = result {
                eprintln!("STARTUP_ERROR ERR_SERVER_FAILED {}", err);
                std::process::exit(1);
            }
        }
        _ = shutdown.cancelled() => {
            state.health.set_ready(false);
            state.health.set_alive(false);
            match tokio::time::timeout(DRAIN_TIMEOUT, &mut server).await {
                Ok(Ok(())) => tracing::info!("server shutdown ok"),
                Ok(Err(err)) => tracing::error!(error = %err, "server shutdown failed"),
                Err(_) => tracing::warn!("server drain timed out"),
            }
        }
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = signal(SignalKind::terminate()).ok();
        let mut sigquit = signal(SignalKind::quit()).ok();
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = async {
                match sigterm.as_mut() {
                    Some(s) => { s.recv().await; }
                    None => std::future::pending::<()>().await,
                }
            } => {}
            _ = async {
                match sigquit.as_mut() {
                    Some(s) => { s.recv().await; }
                    None => std::future::pending::<()>().await,
                }
            } => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
