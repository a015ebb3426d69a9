use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::process::ExitCode;

mod send;
mod serve;

use courier_http::ForwardTarget;
use courier_mesh::Channel;

#[derive(Parser, Debug)]
#[command(name = "courier", version)]
#[command(about = "Courier - message routing between agents over HTTP and pub/sub")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the HTTP to pub/sub bridge
    Serve(ServeArgs),
    /// Send one envelope to an agent endpoint
    Send(SendArgs),
}

/// Flags override the matching `COURIER_*` environment variables
#[derive(clap::Args, Debug)]
pub struct ServeArgs {
    /// Listen address
    #[arg(long)]
    pub bind: Option<SocketAddr>,
    /// Pub/sub channel
    #[arg(long, value_parser = parse_channel)]
    pub channel: Option<Channel>,
    /// Redis URL; the in-memory bus is used when unset
    #[arg(long)]
    pub redis_url: Option<String>,
    /// Handler timeout of the forwarding receiver, in milliseconds
    #[arg(long)]
    pub handler_timeout_ms: Option<u64>,
    /// Forward envelopes for an agent over HTTP (AGENT=URL, repeatable)
    #[arg(long = "forward", value_name = "AGENT=URL")]
    pub forward: Vec<ForwardTarget>,
    /// Disable CORS headers
    #[arg(long)]
    pub no_cors: bool,
}

#[derive(clap::Args, Debug)]
pub struct SendArgs {
    /// Endpoint to POST the envelope to
    #[arg(long)]
    pub url: url::Url,
    /// Sending agent
    #[arg(long = "from")]
    pub source: String,
    /// Recipient agent, or ALL
    #[arg(long)]
    pub to: String,
    /// Message body
    #[arg(long)]
    pub content: String,
    /// Message type (HELO, ACK, CHAT, SYSTEM, SENSOR, ERROR, INFO)
    #[arg(long = "type", default_value = "CHAT")]
    pub message_type: String,
    /// Request timeout in seconds
    #[arg(long, default_value_t = 30)]
    pub timeout_secs: u64,
}

fn parse_channel(s: &str) -> Result<Channel, String> {
    Channel::parse(s).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize JSON logging once.
    let env_filter = tracing_subscriber::EnvFilter::from_default_env();
    let env_filter = match "info".parse() {
        Ok(directive) => env_filter.add_directive(directive),
        Err(_) => env_filter,
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .json()
        .try_init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Serve(args) => serve::run(args).await,
        Commands::Send(args) => send::run(args).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "Command failed");
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Failures surfaced by CLI commands
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error(transparent)]
    Config(#[from] courier_http::ConfigError),

    #[error(transparent)]
    Server(#[from] courier_http::ServerError),

    #[error("invalid envelope: {0}")]
    Envelope(#[from] courier_mesh::ValidationError),

    #[error(transparent)]
    Transport(#[from] courier_mesh::TransportError),
}
