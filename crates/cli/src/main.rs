//! Aggregate request logging demo.
//!
//! # Usage
//!
//! ```bash
//! # Log each request as it completes
//! aggregate-log-demo serve
//!
//! # Aggregate each request's logs into one JSON line, with a banner
//! aggregate-log-demo serve --aggregate --banner
//!
//! # Listen elsewhere and keep only info and above in the aggregated line
//! aggregate-log-demo serve --addr 0.0.0.0:8080 --aggregate --level info
//! ```
//!
//! # Commands
//!
//! - `serve` - Run the demo HTTP server

#![cfg_attr(not(test), forbid(unsafe_code))]

use std::net::SocketAddr;

use clap::{Parser, Subcommand};
use tracing_subscriber::{filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

#[derive(Parser)]
#[command(name = "aggregate-log-demo")]
#[command(author, version, about = "Aggregate request logging demo")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the demo HTTP server
    Serve {
        /// Address to listen on
        #[arg(long, default_value = "127.0.0.1:29090")]
        addr: SocketAddr,

        /// Aggregate each request's logs into one JSON line
        #[arg(long)]
        aggregate: bool,

        /// Add a banner to each request's output
        #[arg(long)]
        banner: bool,

        /// Minimum level kept in the aggregated line (`trace`, `debug`, `info`, `warn`, `error`, `off`)
        #[arg(long)]
        level: Option<LevelFilter>,

        /// Banner text replacing the default one
        #[arg(long)]
        custom_banner: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    // Initialize tracing
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "aggregate_log_demo=info,aggregate_log_axum=info".into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().json().flatten_event(true))
        .init();

    let cli = Cli::parse();

    let result: Result<(), Box<dyn std::error::Error>> = run(cli).await;

    if let Err(e) = result {
        tracing::error!("Command failed: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Commands::Serve {
            addr,
            aggregate,
            banner,
            level,
            custom_banner,
        } => {
            commands::serve::run(commands::serve::ServeOptions {
                addr,
                aggregate,
                banner,
                level,
                custom_banner,
            })
            .await?;
        }
    }
    Ok(())
}
