//! Despacho CLI — self-hosted function dispatch with container sandboxes.

use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "despacho",
    version,
    about = "Self-hosted function dispatch — declarative functions, container sandboxes, audited runs"
)]
struct Cli {
    #[command(subcommand)]
    command: despacho::cli::Commands,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("despacho=info")),
        )
        .init();

    let cli = Cli::parse();
    if let Err(e) = despacho::cli::dispatch(cli.command) {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}
