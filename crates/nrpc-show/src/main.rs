//! nrpc-show - demo server and client for nrpc sockets.
//!
//! `serve` binds a HelloService server and reports its clients; `connect`
//! calls HelloService.Hello at a fixed rate. With `--transport inproc` the
//! server runs a client of its own in the same process.

mod demo;

use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use demo::{HelloReply, HelloRequest, HELLO_SERVICE, STATUS_SERVICE};
use nrpc_core::{AppInfo, RoutingSocket, ServiceClient};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "nrpc-show")]
#[command(about = "Demo server and client for nrpc sockets")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Bind a server
    Serve(CommonArgs),
    /// Connect to a server and call it periodically
    Connect(CommonArgs),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum Transport {
    Tcp,
    Inproc,
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// Host to bind or connect to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Forward port; the reverse channel uses port + 10000
    #[arg(short, long, default_value = "9000")]
    port: u16,

    /// Transport to use
    #[arg(long, value_enum, default_value = "tcp")]
    transport: Transport,

    /// Calls (or reports) per second
    #[arg(long, default_value = "1.0")]
    rate: f64,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

impl CommonArgs {
    fn address(&self) -> String {
        match self.transport {
            Transport::Tcp => format!("tcp://{}:{}", self.host, self.port),
            Transport::Inproc => format!("inproc://nrpc-show-{}", self.port),
        }
    }

    fn interval(&self) -> Duration {
        if self.rate > 0.0 {
            Duration::from_secs_f64(1.0 / self.rate)
        } else {
            Duration::from_secs(1)
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let args = match &cli.command {
        Command::Serve(args) | Command::Connect(args) => args,
    };

    // Set up logging
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    match &cli.command {
        Command::Serve(args) => serve(args),
        Command::Connect(args) => {
            if args.transport == Transport::Inproc {
                bail!(
                    "the inproc transport only reaches servers in the same process; \
                     use `serve --transport inproc`"
                );
            }
            connect(args)
        }
    }
}

/// Stop `socket` on Ctrl-C.
fn install_ctrlc(socket: &RoutingSocket) -> Result<()> {
    let shutdown = socket.shutdown_token();
    ctrlc::set_handler(move || {
        info!("Shutdown signal received");
        shutdown.shutdown();
    })?;
    Ok(())
}

fn serve(args: &CommonArgs) -> Result<()> {
    let address = args.address();
    let server = RoutingSocket::new(demo::server_options(), demo::registry())?;
    server.bind(&address)?;
    install_ctrlc(&server)?;
    info!("Serving {} on {}", HELLO_SERVICE, address);

    let local_client = if args.transport == Transport::Inproc {
        let client = Arc::new(RoutingSocket::new(demo::client_options(), demo::registry())?);
        client.connect(&address, true, true)?;
        Some(client)
    } else {
        None
    };

    let shutdown = server.shutdown_token();
    let mut known: Vec<u64> = Vec::new();
    while shutdown.is_alive() {
        if server.get_client_change(args.interval(), &known)? {
            known = server.get_client_ids()?;
            info!("Connected clients: {:?}", known);
        }

        for &client_id in &known {
            match server.client_call(client_id, "RoutingMessage.GetAppInfo", &json!({})) {
                Ok(doc) => {
                    let info: AppInfo = serde_json::from_value(doc)?;
                    let uptime = server
                        .client_call(client_id, &format!("{}.Uptime", STATUS_SERVICE), &json!({}))
                        .unwrap_or_default();
                    info!(
                        "Client {} ({}) up {}s",
                        info.client_id, info.this_socket, uptime["seconds"]
                    );
                }
                Err(e) => warn!("Client {} did not answer: {}", client_id, e),
            }
        }

        if let Some(client) = &local_client {
            call_hello(client, "inproc")?;
        }
    }

    if let Some(client) = local_client {
        client.close();
    }
    server.close();
    Ok(())
}

fn connect(args: &CommonArgs) -> Result<()> {
    let address = args.address();
    let socket = Arc::new(RoutingSocket::new(demo::client_options(), demo::registry())?);
    install_ctrlc(&socket)?;
    socket.connect(&address, true, true)?;
    info!("Connected to {} as client {}", address, socket.client_id());

    let shutdown = socket.shutdown_token();
    while shutdown.is_alive() && socket.is_running() {
        if let Err(e) = call_hello(&socket, "nrpc-show") {
            if !socket.is_running() {
                break;
            }
            return Err(e);
        }
        shutdown.sleep(args.interval(), Duration::from_millis(50));
    }

    if !socket.is_running() {
        warn!("Connection to {} closed", address);
    }
    socket.close();
    Ok(())
}

fn call_hello(socket: &Arc<RoutingSocket>, name: &str) -> Result<()> {
    let hello = ServiceClient::new(socket.clone(), HELLO_SERVICE)?;
    let count = socket.call_count() as i32;
    let reply: HelloReply = hello.call(
        "Hello",
        &HelloRequest {
            name: name.to_string(),
            count,
        },
    )?;
    info!("{} (call {})", reply.greeting, reply.count);
    Ok(())
}
