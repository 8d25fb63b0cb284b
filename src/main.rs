//! Calc Relay - Main entry point
//!
//! # Commands
//!
//! - `server`: run the backend calculation server
//! - `proxy`: run the caching failover proxy in front of a server
//! - `client`: send one request and print the response

use anyhow::Context;
use calc_relay::connection::{Connection, RetryPolicy};
use calc_relay::protocol::{Operator, Request};
use calc_relay::{Dispatcher, ForwardingEngine, ForwardingOptions, RelayConfig, RelayServer};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Calc Relay - calculation server and caching failover proxy
#[derive(Parser)]
#[command(name = "calc-relay")]
#[command(version)]
#[command(about = "JSON-over-TCP calculation server and caching failover proxy")]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the backend calculation server
    Server {
        /// Listen address
        #[arg(long)]
        listen: Option<String>,
        /// Server cache capacity
        #[arg(long)]
        cache_capacity: Option<usize>,
    },
    /// Run the caching proxy
    Proxy {
        /// Listen address for clients
        #[arg(long)]
        listen: Option<String>,
        /// Backend server address
        #[arg(long)]
        backend: Option<String>,
        /// Proxy cache capacity
        #[arg(long)]
        cache_capacity: Option<usize>,
        /// Per-forward timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// Answer from the proxy cache before forwarding
        #[arg(long)]
        cache_first: bool,
    },
    /// Send a single request and print the response as JSON
    Client {
        /// Address of the proxy or server
        #[arg(long, default_value = "127.0.0.1:5554")]
        address: String,
        /// Correlation id for the request
        #[arg(long, default_value = "1")]
        id: String,
        /// Ask every hop to bypass its cache
        #[arg(long)]
        no_cache: bool,
        /// Response deadline in milliseconds
        #[arg(long, default_value_t = 5000)]
        timeout_ms: u64,
        #[command(subcommand)]
        request: ClientRequest,
    },
}

#[derive(Subcommand)]
enum ClientRequest {
    /// Arithmetic request, e.g. `calc add 2 3`
    Calc {
        operator: String,
        #[arg(allow_negative_numbers = true)]
        operands: Vec<f64>,
    },
    /// Text prompt request
    Text { prompt: String },
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("calc_relay=info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let mut config = RelayConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Server {
            listen,
            cache_capacity,
        } => {
            if let Some(listen) = listen {
                config.server.listen_address = listen;
            }
            if let Some(capacity) = cache_capacity {
                config.server.cache_capacity = capacity;
            }
            config.server.validate()?;
            run_server(config).await
        }
        Commands::Proxy {
            listen,
            backend,
            cache_capacity,
            timeout_ms,
            cache_first,
        } => {
            if let Some(listen) = listen {
                config.proxy.listen_address = listen;
            }
            if let Some(backend) = backend {
                config.proxy.backend_address = backend;
            }
            if let Some(capacity) = cache_capacity {
                config.proxy.cache_capacity = capacity;
            }
            if let Some(timeout_ms) = timeout_ms {
                config.proxy.forward_timeout_ms = timeout_ms;
            }
            config.proxy.cache_first |= cache_first;
            run_proxy(config).await
        }
        Commands::Client {
            address,
            id,
            no_cache,
            timeout_ms,
            request,
        } => {
            let request = match request {
                ClientRequest::Calc { operator, operands } => {
                    let operator: Operator = operator.parse()?;
                    Request::calc(id, operator, operands)
                }
                ClientRequest::Text { prompt } => Request::text(id, prompt),
            };
            let request = if no_cache { request.without_cache() } else { request };
            run_client(&address, request, Duration::from_millis(timeout_ms)).await
        }
    }
}

async fn run_server(config: RelayConfig) -> anyhow::Result<()> {
    info!("Starting Calc Relay server v{}", env!("CARGO_PKG_VERSION"));
    let dispatcher = Arc::new(Dispatcher::new(config.server.capacity()?));
    let mut server = RelayServer::new(
        dispatcher,
        config.server.listen_address.clone(),
        config.server.max_frame_bytes,
    );
    server.start().await?;

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal, draining connections");
    server.drain_and_shutdown(Duration::from_secs(5)).await?;
    Ok(())
}

async fn run_proxy(config: RelayConfig) -> anyhow::Result<()> {
    info!("Starting Calc Relay proxy v{}", env!("CARGO_PKG_VERSION"));
    let options = ForwardingOptions::from_config(&config.proxy)?;
    let engine = Arc::new(ForwardingEngine::new(options));

    let policy = RetryPolicy {
        max_attempts: config.proxy.connect_retries,
        ..RetryPolicy::default()
    };
    let health = engine.connect_backend(policy).await;
    info!(
        backend = %engine.backend_address(),
        health = %health,
        cache_first = config.proxy.cache_first,
        "proxy backend initialized"
    );

    let mut server = RelayServer::new(
        engine,
        config.proxy.listen_address.clone(),
        config.proxy.max_frame_bytes,
    );
    server.start().await?;

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal, draining connections");
    server.drain_and_shutdown(Duration::from_secs(5)).await?;
    Ok(())
}

async fn run_client(address: &str, request: Request, timeout: Duration) -> anyhow::Result<()> {
    let connection = Connection::connect(address, calc_relay::protocol::codec::DEFAULT_MAX_FRAME_BYTES)
        .await
        .with_context(|| format!("could not reach {}", address))?;
    let response = connection.request(request.to_wire(), timeout).await?;
    println!("{}", serde_json::to_string(&response)?);
    connection.close();
    Ok(())
}
