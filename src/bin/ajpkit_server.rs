use std::{error::Error, fmt::Write as _, sync::Arc, time::Duration};

use ajpkit::{
    Connector, ConnectorConfig, Exchange, ListenAddress, ProtocolKind, ServiceError,
    config::{DEFAULT_LISTEN, DEFAULT_MAX_POOLED, DEFAULT_MAX_THREADS},
    http11::DEFAULT_MAX_HEADER_SIZE,
    protocol::constants::DEFAULT_PACKET_SIZE,
};
use clap::Parser;
use log::info;

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Listen for new connections at `host:port` or `unix:/path/to.sock`
    #[arg(short, long, default_value = DEFAULT_LISTEN)]
    listen: ListenAddress,
    /// Protocol spoken on accepted connections (ajp13 or http11)
    #[arg(short, long, default_value = "ajp13")]
    protocol: ProtocolKind,
    /// Worker threads
    #[arg(long, default_value_t = DEFAULT_MAX_THREADS)]
    threads: usize,
    /// Pooled request/response pairs and buffers
    #[arg(long, default_value_t = DEFAULT_MAX_POOLED)]
    pool_size: usize,
    /// Largest AJP packet in bytes
    #[arg(long, default_value_t = DEFAULT_PACKET_SIZE)]
    packet_size: usize,
    /// Largest HTTP/1.1 request head in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_HEADER_SIZE)]
    max_header_size: usize,
    /// Close connections idle for this many seconds
    #[arg(long)]
    read_timeout: Option<u64>,
    /// Secret every forward request must carry
    #[arg(long)]
    secret: Option<String>,
    /// Ignore the remote user and auth type asserted by the front end
    #[arg(long)]
    no_trust_auth: bool,
    /// Server header for HTTP/1.1 responses
    #[arg(long)]
    server_header: Option<String>,
}

impl From<Cli> for ConnectorConfig {
    fn from(cli: Cli) -> Self {
        ConnectorConfig {
            listen: cli.listen,
            protocol: cli.protocol,
            max_threads: cli.threads,
            max_pooled_exchanges: cli.pool_size,
            max_pooled_buffers: cli.pool_size,
            packet_size: cli.packet_size,
            max_header_size: cli.max_header_size,
            read_timeout: cli.read_timeout.map(Duration::from_secs),
            required_secret: cli.secret,
            trust_front_end_auth: !cli.no_trust_auth,
            server_header: cli.server_header,
        }
    }
}

/// Describes the request back to the client and echoes its body.
fn describe(exchange: &mut Exchange<'_>) -> Result<(), ServiceError> {
    let mut body = Vec::new();
    exchange.read_to_end(&mut body)?;

    let request = exchange.request();
    let mut text = String::new();
    writeln!(
        text,
        "{} {} {}",
        request.method(),
        request.decoded_uri(),
        request.protocol()
    )?;
    if !request.query_string().is_empty() {
        writeln!(text, "query: {}", request.query_string())?;
    }
    writeln!(text, "remote: {}", request.remote_addr())?;
    for (name, value) in request.headers().iter() {
        writeln!(text, "{name}: {value}")?;
    }
    let mut out = text.into_bytes();
    out.extend_from_slice(&body);

    exchange.add_header("Content-Type", "text/plain; charset=utf-8")?;
    exchange.add_header("Content-Length", out.len().to_string())?;
    exchange.write(&out)?;
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let connector = Connector::bind(cli.into(), Arc::new(describe))?;

    let handle = connector.shutdown_handle();
    ctrlc::set_handler(move || {
        info!("interrupted");
        handle.shutdown();
    })?;

    connector.listen()?;
    Ok(())
}
