use anyhow::Result;
use clap::Parser;
use std::fs;

mod config;
mod element;
mod link;
mod pattern_server;
mod protocol;

use config::Config;
use pattern_server::PatternServer;

#[derive(Parser)]
#[command(name = "tactile_server")]
#[command(about = "Tactile array pattern server\n\nReceives pattern data over TCP and drives FPGA tactile transducer boards over serial.", long_about = None)]
struct Cli {
    /// Path to configuration file (JSON)
    config: String,

    /// Enable debug output (statistics)
    #[arg(long)]
    debug: bool,

    /// Enable detailed debug (hex dumps every frame)
    #[arg(long)]
    ddebug: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config_data = fs::read_to_string(&cli.config)?;
    let config: Config = serde_json::from_str(&config_data)?;

    // ddebug implies debug
    let debug = cli.debug || cli.ddebug;

    // Create server
    let mut server = PatternServer::new(config, debug, cli.ddebug)?;

    // Set up Ctrl-C handler with graceful shutdown
    let running = server.get_running_flag();
    let debug_for_handler = debug;
    let result = ctrlc::set_handler(move || {
        if debug_for_handler {
            println!("\nShutting down...");
        }
        running.store(false, std::sync::atomic::Ordering::Relaxed);
    });

    if let Err(e) = result {
        eprintln!("Warning: Could not set Ctrl-C handler: {}", e);
    }

    // Run server (blocks until shutdown)
    server.run()?;

    // Graceful shutdown - silence the boards
    server.shutdown();

    Ok(())
}
