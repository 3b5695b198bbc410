//! echo-pair: TCP echo server and correlating echo client
//!
//! - `echo-pair serve` runs the echo server
//! - `echo-pair send` sends messages concurrently and prints the replies
//!
//! Configuration via CLI arguments or TOML file.

use echo_pair::config::{ClientConfig, Command, Config, ServerConfig};
use echo_pair::{EchoClient, Server};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match config.command {
        Command::Serve(server) => run_server(server),
        Command::Send { client, messages } => run_client(client, messages),
    }
}

/// Run the echo server until Ctrl-C.
fn run_server(config: ServerConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    info!(
        listen = %config.listen,
        max_connections = config.max_connections,
        "Starting echo server"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("echo-server")
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let server = Server::bind(config).await?;
        server
            .run_until(async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!(error = %e, "Failed to listen for Ctrl-C");
                }
            })
            .await?;
        Ok::<_, Box<dyn std::error::Error + Send + Sync>>(())
    })
}

/// Send every message, then wait for all replies.
fn run_client(
    config: ClientConfig,
    messages: Vec<String>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let thread = std::thread::current();
    let thread_name = thread.name().unwrap_or("main");
    let client = EchoClient::new(config)?;

    let mut replies = Vec::with_capacity(messages.len());
    for message in &messages {
        replies.push(client.send(&format!("{thread_name}: {message}"))?);
    }

    let mut left = replies.len();
    let mut failed = 0usize;
    for reply in replies {
        let id = reply.id();
        left -= 1;
        match reply.wait() {
            Ok(answer) => println!("Got answer: {answer}. Left {left}"),
            Err(e) => {
                failed += 1;
                error!(id = %id, error = %e, "Request failed");
            }
        }
    }

    client.close()?;
    println!("Finish");

    if failed > 0 {
        return Err(format!("{failed} request(s) failed").into());
    }
    Ok(())
}
