mod server;

use anyhow::Result;
use clap::{Parser, Subcommand};
use livecast_core::{logging, Config, JwtVerifier};
use std::time::Duration;
use tracing::info;

use server::LivecastServer;

#[derive(Parser, Debug)]
#[command(name = "livecast")]
#[command(about = "Livecast SFU signaling server", long_about = None)]
struct Args {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(long, short, global = true, env = "LIVECAST_CONFIG")]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the server (default)
    Serve,
    /// Print a development token signed with the configured secret
    Token {
        /// Token subject; must match a live's owner to broadcast into it
        #[arg(long)]
        subject: String,
        /// Session id used as the seat token; derived from the token when absent
        #[arg(long)]
        session: Option<String>,
        /// Lifetime in seconds
        #[arg(long)]
        ttl: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load and validate configuration (fail fast on misconfigurations)
    let config = Config::load(args.config.as_deref())?;
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            // 2. Initialize logging
            logging::init_logging(&config.logging)?;
            info!("Livecast server starting...");
            info!("HTTP address: {}", config.http_address());

            // 3. Wire services and serve until shutdown
            LivecastServer::new(config).start().await
        }
        Command::Token {
            subject,
            session,
            ttl,
        } => {
            let verifier = JwtVerifier::from_config(&config.auth);
            let token = verifier.issue(&subject, session.as_deref(), ttl.map(Duration::from_secs))?;
            println!("{token}");
            Ok(())
        }
    }
}
