use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use weft_core::device::ChannelDevice;
use weft_core::{Config, Manager};
use weft_daemon::api;
use weft_daemon::state::AppState;
use weft_daemon::tls;

#[derive(Parser, Debug)]
#[command(name = "weftd")]
#[command(about = "Weft mesh VPN daemon", long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(long, env = "WEFTD_CONFIG")]
    config: Option<PathBuf>,

    /// Bind address for the control API
    #[arg(long, default_value = "0.0.0.0:4800")]
    bind: String,

    /// TLS certificate (PEM); plain HTTP when omitted
    #[arg(long, requires = "tls_key")]
    tls_cert: Option<PathBuf>,

    /// TLS private key (PEM)
    #[arg(long, requires = "tls_cert")]
    tls_key: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Print an annotated example configuration and exit
    #[arg(long)]
    example_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.example_config {
        print!("{}", Config::example_toml());
        return Ok(());
    }

    // Initialize logging
    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting weftd");

    let config_path = args
        .config
        .context("--config is required (see --example-config)")?;
    let config = Config::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    let queue_depth = config.transport.queue_depth;

    // The privileged tunnel process attaches to the other side of this
    // device; until it does, reads block and writes queue.
    let device = Arc::new(ChannelDevice::new(queue_depth));
    let manager = Manager::new(config, device)?;
    manager.start();

    let app = api::create_router(AppState::new(manager.clone()));
    let addr: SocketAddr = args.bind.parse().context("parsing bind address")?;

    match (args.tls_cert, args.tls_key) {
        (Some(cert), Some(key)) => {
            let tls_config = tls::load_server_config(&cert, &key)?;
            info!("Listening on https://{}", addr);
            axum_server::bind_rustls(
                addr,
                axum_server::tls_rustls::RustlsConfig::from_config(Arc::new(tls_config)),
            )
            .serve(app.into_make_service())
            .await?;
        }
        _ => {
            info!("Listening on http://{}", addr);
            let listener = tokio::net::TcpListener::bind(addr).await?;
            axum::serve(listener, app).await?;
        }
    }

    manager.shutdown();
    Ok(())
}
