//! Main entry point for the rtcsig command-line tool
//!
//! Runs an in-process P2P session between two demo peers, or applies the
//! codec preference rewrite to an SDP blob.

mod commands;

use clap::{Parser, Subcommand};
use rtcsig_infra_common::{log_welcome, setup_logging, LoggingConfig};

#[derive(Parser, Debug)]
#[command(name = "rtcsig")]
#[command(about = "WebRTC signaling demos", version)]
struct Cli {
    /// Log level: trace, debug, info, warn or error
    #[arg(long, global = true, default_value = "info", env = "RTCSIG_LOG_LEVEL")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect two in-process peers, publish a stream and exchange a message
    P2pDemo(commands::p2p_demo::P2PDemoArgs),
    /// Reorder codecs in an SDP read from a file or stdin
    Rewrite(commands::rewrite::RewriteArgs),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut logging = LoggingConfig::new(cli.log_level.clone(), "rtcsig");
    if cli.json_logs {
        logging = logging.with_json();
    }
    if let Err(e) = setup_logging(&logging) {
        eprintln!("Error: {}", e);
        std::process::exit(2);
    }
    log_welcome("rtcsig", env!("CARGO_PKG_VERSION"));

    let result = match cli.command {
        Command::P2pDemo(args) => commands::p2p_demo::run(args).await,
        Command::Rewrite(args) => commands::rewrite::run(args),
    };
    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
