mod cli;
mod commands;
mod output;

use anyhow::Result;
use clap::Parser;

use cli::{Cli, Commands};
use herald_server::config::loader::load_config;
use herald_server::{HeraldApp, apply_logging_level, init_tracing};
use output::print_error;

#[tokio::main]
async fn main() {
    // .env is optional
    if let Err(e) = dotenvy::dotenv() {
        let missing = matches!(
            e,
            dotenvy::Error::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::NotFound
        );
        if !missing {
            eprintln!("Warning: Failed to load .env file: {e}");
        }
    }

    init_tracing();

    if let Err(e) = run().await {
        print_error(&format!("{e:#}"));
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(cli.config.as_deref()).map_err(anyhow::Error::msg)?;
    apply_logging_level(&config.logging.level);
    herald_server::metrics::init_metrics();

    let app = HeraldApp::build(config).await?;

    match &cli.command {
        Commands::Report(args) => commands::report(&app, args).await?,
        Commands::Refresh(args) => commands::refresh(&app, args).await?,
        Commands::Cached => commands::cached(&app).await?,
        Commands::Purge(args) => commands::purge(&app, args).await?,
        Commands::Endpoints => commands::endpoints(&app)?,
        Commands::Describe(args) => commands::describe(&app, args).await?,
        Commands::Daemon(args) => commands::daemon(&app, args).await?,
    }
    Ok(())
}
