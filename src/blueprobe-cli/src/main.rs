mod assembler;
mod cli;
mod commands;
mod config;
mod dispatch;

use anyhow::Result;
use clap::Parser;
use config::Config;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cli::*;

fn init_logging(verbose: u8) {
    let default_filter = match verbose {
        0 => "blueprobe=info,blueprobe_cli=info",
        1 => "blueprobe=debug,blueprobe_cli=debug",
        _ => "blueprobe=trace,blueprobe_cli=trace",
    };

    // stdout carries command output; logs go to stderr
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Commands::Configure(args) = cli.command {
        return commands::configure::handle(args);
    }

    let config = Config::load()?;
    let mut session = commands::connect(&config, &cli.target)?;
    let result = dispatch::dispatch(&mut session, &config, cli.command);
    session.close();
    result
}
