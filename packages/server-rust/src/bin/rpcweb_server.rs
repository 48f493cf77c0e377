//! rpcweb server binary.
//!
//! Serves two demo services: `Echo` on `/echo`, and `Echo` plus `Calc`
//! multiplexed on `/mux`.
//!
//! Run with:
//!   RUST_LOG=debug cargo run -p rpcweb-server -- --port 9090 --files ./public

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use rpcweb_core::{
    Fields, HandlerError, MultiplexedProcessor, ProtocolKind, ServiceDefinition, TransportKind,
    Value,
};
use rpcweb_server::network::{StaticFilesConfig, TlsConfig};
use rpcweb_server::{NetworkConfig, NetworkModule, ServiceOptions, ServiceRegistry};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum WireProtocol {
    Binary,
    Json,
}

impl From<WireProtocol> for ProtocolKind {
    fn from(protocol: WireProtocol) -> Self {
        match protocol {
            WireProtocol::Binary => Self::Binary,
            WireProtocol::Json => Self::Json,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum WireTransport {
    Buffered,
    Framed,
}

impl From<WireTransport> for TransportKind {
    fn from(transport: WireTransport) -> Self {
        match transport {
            WireTransport::Buffered => Self::Buffered,
            WireTransport::Framed => Self::Framed,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "rpcweb-server")]
#[command(version)]
#[command(about = "HTTP and socket front end for multiplexed RPC services")]
struct Args {
    #[arg(long, env = "RPCWEB_HOST", default_value = "0.0.0.0")]
    host: String,

    #[arg(short, long, env = "RPCWEB_PORT", default_value_t = 9090)]
    port: u16,

    /// Directory served to GET requests
    #[arg(long, env = "RPCWEB_FILES")]
    files: Option<PathBuf>,

    /// Extra header for static responses, as `name=value`
    #[arg(long = "header", value_parser = parse_header)]
    headers: Vec<(String, String)>,

    /// Allowed CORS origins, comma separated; `*` allows any
    #[arg(long, env = "RPCWEB_CORS", value_delimiter = ',')]
    cors: Vec<String>,

    #[arg(long, env = "RPCWEB_TLS_CERT", requires = "tls_key")]
    tls_cert: Option<PathBuf>,

    #[arg(long, env = "RPCWEB_TLS_KEY", requires = "tls_cert")]
    tls_key: Option<PathBuf>,

    #[arg(long, value_enum, env = "RPCWEB_PROTOCOL", default_value = "binary")]
    protocol: WireProtocol,

    #[arg(long, value_enum, env = "RPCWEB_TRANSPORT", default_value = "buffered")]
    transport: WireTransport,

    /// Emit logs as JSON lines
    #[arg(long, env = "RPCWEB_JSON_LOGS")]
    json_logs: bool,
}

fn parse_header(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
        .filter(|(name, _)| !name.is_empty())
        .ok_or_else(|| format!("expected name=value, got {raw:?}"))
}

impl Args {
    fn network_config(&self) -> NetworkConfig {
        let tls = match (&self.tls_cert, &self.tls_key) {
            (Some(cert_path), Some(key_path)) => Some(TlsConfig {
                cert_path: cert_path.clone(),
                key_path: key_path.clone(),
            }),
            _ => None,
        };
        let static_files = self.files.as_ref().map(|root| StaticFilesConfig {
            root: root.clone(),
            headers: self.headers.clone(),
        });

        NetworkConfig {
            host: self.host.clone(),
            port: self.port,
            tls,
            cors_origins: self.cors.clone(),
            static_files,
            ..NetworkConfig::default()
        }
    }
}

fn echo(method: &str, args: Fields) -> Result<Option<Value>, HandlerError> {
    match method {
        "log" => {
            info!(message = ?args.get(&1), "echo log");
            Ok(None)
        }
        _ => Ok(Some(args.get(&1).cloned().unwrap_or_else(|| Value::from("")))),
    }
}

fn calc(_: &str, args: Fields) -> Result<Option<Value>, HandlerError> {
    let operand = |id: i16| args.get(&id).and_then(Value::as_i32).unwrap_or_default();
    Ok(Some(Value::I32(operand(1).wrapping_add(operand(2)))))
}

fn demo_services(args: &Args) -> anyhow::Result<ServiceRegistry> {
    let echo_definition = Arc::new(ServiceDefinition::new("Echo").two_way("echo").one_way("log"));
    let calc_definition = Arc::new(ServiceDefinition::new("Calc").two_way("add"));

    let mux = MultiplexedProcessor::new()
        .with_service("Echo", Arc::new(echo_definition.bind(Arc::new(echo))))
        .with_service("Calc", Arc::new(calc_definition.bind(Arc::new(calc))));

    let echo_options = ServiceOptions::instance(echo_definition.bind(Arc::new(echo)));
    let registry = ServiceRegistry::from_options([
        ("/echo", echo_options),
        ("/mux", ServiceOptions::multiplexed(mux)),
    ]
    .map(|(route, options)| {
        (
            route,
            options
                .with_protocol(args.protocol.into())
                .with_transport(args.transport.into()),
        )
    }))?;
    Ok(registry)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for ctrl-c: {e}");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "rpcweb_server=info,rpcweb_core=info,tower_http=info".into());
    let registry = tracing_subscriber::registry().with(filter);
    if args.json_logs {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    info!("Starting rpcweb server v{}", env!("CARGO_PKG_VERSION"));

    let services = demo_services(&args)?;
    let mut module = NetworkModule::new(args.network_config(), services)?;
    let port = module.start().await?;
    info!(port, "Server listening");

    module.serve(shutdown_signal()).await
}
