//! multihttp demo server.
//!
//! Serves HTTPS and HTTP on the same port. With `cert.pem` and `key.pem`
//! in the working directory (or `--cert`/`--key`), TLS clients are
//! served over TLS 1.3 with HTTP/2; everyone else gets plaintext.
//!
//! ```text
//! multihttp hello                      # "Hello world!" on 127.0.0.1:8080
//! multihttp --addr 0.0.0.0:8443 files --dir ./public
//! multihttp --config multihttp.toml hello
//! ```

use std::path::PathBuf;

use axum::extract::Extension;
use axum::http::{Method, Uri};
use axum::Router;
use clap::{Parser, Subcommand};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use multihttp::config::{self, validation::validate_config, LogFormat, ServerConfig};
use multihttp::lifecycle::shutdown_signal;
use multihttp::observability::{logging, metrics};
use multihttp::{ConnectionInfo, MultiplexingServer};

const DEFAULT_CERT: &str = "cert.pem";
const DEFAULT_KEY: &str = "key.pem";

#[derive(Parser)]
#[command(name = "multihttp", version)]
#[command(about = "Serve TLS and plaintext HTTP on a single port", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address (host:port)
    #[arg(short, long)]
    addr: Option<String>,

    /// PEM certificate chain
    #[arg(long)]
    cert: Option<String>,

    /// PEM private key
    #[arg(long)]
    key: Option<String>,

    /// Expose Prometheus metrics on this address
    #[arg(long)]
    metrics_address: Option<String>,

    /// Emit JSON logs
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Answer every request with "Hello world!"
    Hello,
    /// Serve files from a directory
    Files {
        #[arg(short, long, default_value = ".")]
        dir: PathBuf,
    },
}

fn build_config(cli: &Cli) -> Result<ServerConfig, Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => config::load_config(path)?,
        None => ServerConfig::default().with_tls(DEFAULT_CERT, DEFAULT_KEY),
    };

    if let Some(addr) = &cli.addr {
        config.bind_address = addr.clone();
    }
    if let Some(cert) = &cli.cert {
        config.tls.cert_path = cert.clone();
    }
    if let Some(key) = &cli.key {
        config.tls.key_path = key.clone();
    }
    if let Some(addr) = &cli.metrics_address {
        config.observability.metrics_enabled = true;
        config.observability.metrics_address = addr.clone();
    }
    if cli.json_logs {
        config.observability.log_format = LogFormat::Json;
    }

    validate_config(&config).map_err(config::ConfigError::Validation)?;
    Ok(config)
}

async fn hello(Extension(conn): Extension<ConnectionInfo>, method: Method, uri: Uri) -> &'static str {
    tracing::info!(
        connection_id = %conn.id,
        method = %method,
        path = %uri.path(),
        transport = conn.transport(),
        "hello"
    );
    "Hello world!\n"
}

fn app(command: Option<Commands>) -> Router {
    let router = match command.unwrap_or(Commands::Hello) {
        Commands::Hello => Router::new().fallback(hello),
        Commands::Files { dir } => {
            tracing::info!(dir = %dir.display(), "serving files");
            Router::new().fallback_service(ServeDir::new(dir))
        }
    };
    router.layer(TraceLayer::new_for_http())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match build_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("multihttp: invalid configuration: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = logging::init(config.observability.log_format) {
        eprintln!("multihttp: failed to initialize logging: {e}");
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        bind_address = %config.bind_address,
        cert_path = %config.tls.cert_path,
        key_path = %config.tls.key_path,
        http2 = config.http2,
        "multihttp starting"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => {
                if let Err(e) = metrics::init_metrics(addr) {
                    tracing::error!(error = %e, "failed to start metrics endpoint");
                }
            }
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let server = MultiplexingServer::new(config);
    if let Err(e) = server
        .listen_and_serve_with_shutdown(app(cli.command), shutdown_signal())
        .await
    {
        tracing::error!(error = %e, "server stopped");
        eprintln!("multihttp: {e}");
        std::process::exit(1);
    }

    tracing::info!("Shutdown complete");
}
