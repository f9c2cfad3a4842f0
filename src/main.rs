//! PeerLink - Connection-oriented transport over peer-to-peer messaging
//!
//! Demo binary: an echo server and a chatty client over UDP, plus an
//! in-process loopback run.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use peerlink::config::{self, Config};
use peerlink::messaging::{LoopbackNetwork, UdpMessagingService};
use peerlink::protocol;
use peerlink::{ClientId, PeerAddress, Reliability, Transport, TransportEvent};

/// PeerLink - Connection-oriented transport over P2P messaging
#[derive(Parser)]
#[command(name = "peerlink")]
#[command(author = "PeerLink Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Client/server sessions over peer-to-peer messaging", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an echo server
    Server {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Run a client that sends a message every tick
    Client {
        /// Server address to connect to
        #[arg(short, long)]
        server: Option<String>,

        /// Server port, used when the address has none
        #[arg(short, long, default_value_t = protocol::DEFAULT_PORT)]
        port: u16,
    },

    /// Run a server and a client in one process
    Loopback {
        /// Number of messages the client sends
        #[arg(short, long, default_value_t = 5)]
        rounds: u32,
    },

    /// Show current configuration
    Config {
        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Output path for generated config
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show protocol information
    Info,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default().unwrap_or_default()
    };

    // Initialize logging
    let filter = if cli.verbose || config.general.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Server { port } => {
            run_server(config, port).await?;
        }
        Commands::Client { server, port } => {
            run_client(config, server, port).await?;
        }
        Commands::Loopback { rounds } => {
            run_loopback(config, rounds)?;
        }
        Commands::Config { generate, output } => {
            if generate {
                let sample = config::generate_sample_config()?;
                if let Some(path) = output {
                    std::fs::write(&path, &sample)?;
                    println!("Configuration written to: {}", path.display());
                } else {
                    println!("{}", sample);
                }
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
        Commands::Info => {
            print_info(&config);
        }
    }

    Ok(())
}

/// Run the echo server
async fn run_server(config: Config, port: Option<u16>) -> anyhow::Result<()> {
    let bind = config.network.bind_addr(port.unwrap_or(config.network.port));
    let service = UdpMessagingService::bind(bind, config.network.max_packet_size).await?;
    let local = service.local_addr();

    let transport = Transport::new(config.transport.clone());
    transport.initialize(Arc::new(service))?;
    transport.start_server()?;

    println!("\n========================================");
    println!("  PeerLink Server Running");
    println!("========================================");
    println!("  Host: {}", config.general.name);
    println!("  Address: {}", local);
    println!("  Socket: {}", transport.socket_name());
    println!("========================================");
    println!("\nWaiting for clients to connect...");
    println!("Press Ctrl+C to stop.\n");

    let mut tick = tokio::time::interval(config.network.tick_interval());

    // Main event loop
    loop {
        tokio::select! {
            _ = tick.tick() => {
                loop {
                    match transport.poll_event() {
                        TransportEvent::Nothing => break,
                        TransportEvent::Connect(client_id) => {
                            println!("+ Client {} connected", client_id);
                        }
                        TransportEvent::Disconnect(client_id) => {
                            println!("- Client {} disconnected", client_id);
                        }
                        TransportEvent::Data { client_id, payload } => {
                            tracing::debug!("{} bytes from client {}", payload.len(), client_id);
                            let tier = Reliability::ReliableOrdered;
                            if let Err(e) = transport.send(client_id, &payload, tier) {
                                tracing::warn!("Echo to client {} failed: {}", client_id, e);
                            }
                        }
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nShutting down...");
                break;
            }
        }
    }

    transport.shutdown();
    tracing::info!("Server stopped");

    Ok(())
}

/// Run a client that sends a numbered message every tick
async fn run_client(config: Config, server_addr: Option<String>, port: u16) -> anyhow::Result<()> {
    let target = match server_addr {
        Some(addr) => {
            let addr: SocketAddr = if addr.contains(':') {
                addr.parse()?
            } else {
                format!("{}:{}", addr, port).parse()?
            };
            Some(PeerAddress::from(addr))
        }
        None => config.transport.target_address.clone(),
    };
    let Some(target) = target else {
        anyhow::bail!("Please specify --server address or set transport.target_address");
    };

    let bind = config.network.bind_addr(0);
    let service = UdpMessagingService::bind(bind, config.network.max_packet_size).await?;
    let transport = Transport::new(config.transport.clone());
    transport.initialize(Arc::new(service))?;
    transport.set_target_address(target.clone());

    println!("Connecting to {}...", target);
    transport.start_client()?;

    let mut tick = tokio::time::interval(config.network.tick_interval());
    let mut connected = false;
    let mut sequence = 0u64;

    // Main event loop
    'run: loop {
        tokio::select! {
            _ = tick.tick() => {
                loop {
                    match transport.poll_event() {
                        TransportEvent::Nothing => break,
                        TransportEvent::Connect(_) => {
                            connected = true;
                            println!("Connected to {} as {}", target, config.general.name);
                        }
                        TransportEvent::Disconnect(_) => {
                            println!("Disconnected from {}", target);
                            break 'run;
                        }
                        TransportEvent::Data { payload, .. } => {
                            println!("< {}", String::from_utf8_lossy(&payload));
                        }
                    }
                }

                if connected {
                    sequence += 1;
                    let message = format!("{} #{}", config.general.name, sequence);
                    let sent = transport.send(
                        ClientId::SERVER,
                        message.as_bytes(),
                        Reliability::UnreliableUnordered,
                    );
                    if let Err(e) = sent {
                        tracing::warn!("Send failed: {}", e);
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nDisconnecting...");
                if let Err(e) = transport.disconnect_local_client() {
                    tracing::debug!("Disconnect: {}", e);
                }
                break;
            }
        }
    }

    transport.shutdown();
    tracing::info!("Client stopped");

    Ok(())
}

/// Run a server and client over the in-process backend
fn run_loopback(config: Config, rounds: u32) -> anyhow::Result<()> {
    let network = LoopbackNetwork::new(config.network.max_packet_size);
    let server_address: PeerAddress = "loopback-server".parse()?;

    let server = Transport::new(config.transport.clone());
    server.initialize(network.endpoint(server_address.clone())?)?;
    server.start_server()?;

    let client = Transport::new(config.transport.clone().with_target(server_address));
    client.initialize(network.endpoint("loopback-client".parse()?)?)?;
    client.start_client()?;

    for round in 1..=rounds {
        let message = format!("ping {}", round);
        client.send(ClientId::SERVER, message.as_bytes(), Reliability::ReliableOrdered)?;

        for event in drain(&server) {
            println!("server: {:?}", event);
            if let TransportEvent::Data { client_id, payload } = event {
                server.send(client_id, &payload, Reliability::ReliableOrdered)?;
            }
        }
        for event in drain(&client) {
            println!("client: {:?}", event);
        }
    }

    client.disconnect_local_client()?;
    for event in drain(&server) {
        println!("server: {:?}", event);
    }

    client.shutdown();
    server.shutdown();
    Ok(())
}

fn drain(transport: &Transport) -> Vec<TransportEvent> {
    std::iter::from_fn(|| Some(transport.poll_event()).filter(|e| !e.is_nothing())).collect()
}

/// Print protocol information
fn print_info(config: &Config) {
    println!("PeerLink Information");
    println!("====================\n");

    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!("Protocol version: {}", protocol::PROTOCOL_VERSION);
    println!("Default port: {}", protocol::DEFAULT_PORT);
    println!("Socket name: {}", config.transport.socket_name);
    println!("Channel: {}", config.transport.channel);
    println!("Max packet size: {} bytes", config.network.max_packet_size);
}
