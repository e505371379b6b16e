use std::{
    error::Error,
    io::{self, Write},
};

use ajpkit::{
    AjpClient, ListenAddress,
    protocol::{ForwardRequest, PacketCodec, Transport, constants::DEFAULT_PACKET_SIZE},
};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Connector address, `host:port` or `unix:/path/to.sock`
    #[arg(short, long, default_value = ajpkit::config::DEFAULT_LISTEN)]
    connect: ListenAddress,
    /// Largest AJP packet in bytes
    #[arg(long, default_value_t = DEFAULT_PACKET_SIZE)]
    packet_size: usize,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check that the connector answers CPing
    Ping,
    /// Forward a GET request and print the response
    Get {
        /// Request URI, optionally with a query string
        uri: String,
        /// Host header value
        #[arg(long, default_value = "localhost")]
        host: String,
        /// Extra `Name: value` headers
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,
        /// Secret expected by the connector
        #[arg(long)]
        secret: Option<String>,
    },
    /// Ask the connector to stop
    Shutdown,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let codec = PacketCodec::new(cli.packet_size);
    match &cli.connect {
        ListenAddress::Tcp(addr) => run(AjpClient::connect(addr, codec)?, cli.command),
        ListenAddress::Unix(path) => run(AjpClient::connect_unix(path, codec)?, cli.command),
    }
}

fn run<T: Transport>(mut client: AjpClient<T>, command: Command) -> Result<(), Box<dyn Error>> {
    match command {
        Command::Ping => {
            client.ping()?;
            println!("pong");
        }
        Command::Get {
            uri,
            host,
            headers,
            secret,
        } => {
            let mut request = ForwardRequest::new("GET", &uri, &host);
            for header in headers {
                let (name, value) = header
                    .split_once(':')
                    .ok_or_else(|| format!("header {header:?} is not `Name: value`"))?;
                request
                    .headers
                    .push((name.trim().to_owned(), value.trim().to_owned()));
            }
            if let Some(secret) = secret {
                request
                    .attributes
                    .push(ajpkit::protocol::Attribute::Secret(secret));
            }

            let response = client.forward(&request, &[])?;
            let message = response.message.as_deref().unwrap_or_default();
            println!("{} {message}", response.status);
            for (name, value) in &response.headers {
                println!("{name}: {value}");
            }
            println!();
            let mut stdout = io::stdout().lock();
            stdout.write_all(&response.body)?;
            stdout.flush()?;
        }
        Command::Shutdown => {
            client.shutdown()?;
            println!("shutdown sent");
        }
    }
    client.close()?;
    Ok(())
}
