use clap::Parser;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::sleep;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use vncmux::events::RelayEvents;
use vncmux::{
    build_router, BackendLink, ConnectionRegistry, SessionConfig, TracingEvents,
    DEFAULT_HTTP_PORT, DEFAULT_MAX_CONNECTIONS, DEFAULT_VNC_PORT,
};

#[derive(Parser, Debug)]
#[command(name = "vncmuxd", author, version)]
struct Options {
    /// Address the HTTP/WebSocket server binds to
    #[arg(long, default_value = "0.0.0.0")]
    bind: String,
    /// Port for the HTTP/WebSocket server
    #[arg(long, default_value_t = DEFAULT_HTTP_PORT, env = "VNCMUX_PORT")]
    port: u16,
    /// Host of the VNC server to relay
    #[arg(long, default_value = "127.0.0.1", env = "VNCMUX_VNC_HOST")]
    vnc_host: String,
    /// Port of the VNC server to relay
    #[arg(long, default_value_t = DEFAULT_VNC_PORT, env = "VNCMUX_VNC_PORT")]
    vnc_port: u16,
    /// Password for VNC authentication, if the backend requires it
    #[arg(long, env = "VNCMUX_VNC_PASSWORD")]
    vnc_password: Option<String>,
    /// Maximum number of concurrent viewer connections
    #[arg(long, default_value_t = DEFAULT_MAX_CONNECTIONS, env = "VNCMUX_MAX_CONNECTIONS")]
    max_connections: usize,
    /// API key registered at startup
    #[arg(long, env = "VNCMUX_API_KEY")]
    api_key: Option<String>,
    /// Directory used for logs
    #[arg(long, default_value = "/var/log/vncmux", env = "VNCMUX_LOG_DIR")]
    log_dir: PathBuf,
    /// Seconds a viewer may take to finish the RFB handshake
    #[arg(long, default_value_t = 10)]
    handshake_timeout_secs: u64,
    /// Close viewers that exceed the handshake timeout instead of only
    /// logging
    #[arg(long)]
    enforce_handshake_timeout: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let options = Options::parse();
    let _guard = init_tracing(&options.log_dir);

    run_server(options).await;

    Ok(())
}

fn init_tracing(log_dir: &PathBuf) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let stdout_layer = tracing_subscriber::fmt::layer().with_target(false);

    if let Err(e) = std::fs::create_dir_all(log_dir) {
        eprintln!(
            "Failed to create log directory {:?}: {}. Logging to file disabled.",
            log_dir, e
        );
        tracing_subscriber::registry()
            .with(filter)
            .with(stdout_layer)
            .init();
        return None;
    }

    let file_appender = tracing_appender::rolling::daily(log_dir, "vncmuxd.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_target(false)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    Some(guard)
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {error}");
    }
    tracing::info!("shutdown signal received");
}

async fn run_server(options: Options) {
    let bind_ip = parse_bind_ip(&options.bind);
    let events: Arc<dyn RelayEvents> = Arc::new(TracingEvents);

    let registry = ConnectionRegistry::new(options.max_connections, events.clone());
    if let Some(api_key) = options.api_key.as_deref() {
        registry.register_key(api_key).await;
        tracing::info!("registered startup API key");
    }

    let backend = BackendLink::connect(
        &options.vnc_host,
        options.vnc_port,
        options.vnc_password.clone(),
        registry.clone(),
        events,
    )
    .await;
    {
        let status = backend.status().await;
        if status.connected {
            tracing::info!(host = %status.host, port = status.port, "connected to VNC backend");
        } else {
            tracing::error!(
                host = %status.host,
                port = status.port,
                error = ?status.error,
                "VNC backend unavailable; viewers cannot authenticate until the relay is restarted"
            );
        }
    }

    let app = build_router(
        backend,
        registry,
        SessionConfig {
            handshake_timeout: Duration::from_secs(options.handshake_timeout_secs),
            enforce_handshake_timeout: options.enforce_handshake_timeout,
        },
    );

    let addr = SocketAddr::new(bind_ip, options.port);
    let retry_delay = Duration::from_secs(5);

    loop {
        match TcpListener::bind(addr).await {
            Ok(listener) => {
                tracing::info!("vncmuxd listening on http://{}", addr);

                match axum::serve(listener, app.clone())
                    .with_graceful_shutdown(shutdown_signal())
                    .await
                {
                    Ok(()) => {
                        tracing::info!("server shut down gracefully");
                        break;
                    }
                    Err(error) => {
                        tracing::error!(?error, "server error; restarting");
                    }
                }
            }
            Err(error) => {
                tracing::error!(?error, %addr, "failed to bind listener");
            }
        }

        tracing::info!(
            "retrying server startup in {} seconds",
            retry_delay.as_secs()
        );
        sleep(retry_delay).await;
    }
}

fn parse_bind_ip(bind: &str) -> IpAddr {
    match bind.parse() {
        Ok(ip) => ip,
        Err(error) => {
            tracing::error!(
                ?error,
                %bind,
                "invalid bind address; defaulting to 0.0.0.0"
            );
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        }
    }
}
